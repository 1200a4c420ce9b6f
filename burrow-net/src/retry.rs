//! Dial-and-replay recovery for the first segment of a TCP connection.
//!
//! A [`Retrier`] behaves like a plain `TcpStream` once it is established.
//! While the connection is fresh (nothing received yet), upstream bytes are
//! buffered verbatim; if the fresh connection dies early — a write error,
//! a FIN, a reset, or silence past the deadline — the same address is
//! dialed once more and the buffer is replayed in two segments, splitting
//! the TLS ClientHello so its SNI does not survive contiguously. Middleboxes
//! that killed the first attempt on the server name usually miss the second.
//!
//! The two halves produced by `tokio::io::split` serialize their polls, so
//! the state machine runs single-writer; wakers parked on the pre-retry
//! connection are re-woken explicitly on every transition.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Sleep;
use tracing::debug;

use crate::clienthello::{extract_sni, split_point};
use crate::dialer::Dialer;

/// How long a fresh connection may stay silent before it is retried.
const RETRY_TIMEOUT: Duration = Duration::from_millis(1200);

/// Statistics about a connection that went through the retrying dialer,
/// reported to the flow listener when the socket closes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetryStats {
    /// SNI of the buffered ClientHello, empty if none was found.
    pub sni: String,
    /// Bytes sent before the retry was triggered.
    pub bytes: i32,
    /// Number of writes before the retry was triggered.
    pub chunks: i16,
    /// Length of the first replayed segment. Zero means no retry occurred.
    pub split: i16,
    /// The fresh-connection deadline in milliseconds.
    pub timeout_ms: i32,
}

enum Phase {
    /// Connected, nothing received yet. Retry is still possible.
    Fresh,
    /// Re-dialing and replaying the buffered bytes.
    Dialing(BoxFuture<'static, io::Result<(TcpStream, usize)>>),
    /// Past the point of no return; behaves like a plain stream.
    Established,
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Fresh => f.write_str("Phase::Fresh"),
            Phase::Dialing(_) => f.write_str("Phase::Dialing(..)"),
            Phase::Established => f.write_str("Phase::Established"),
        }
    }
}

#[derive(Debug)]
pub struct Retrier {
    addr: SocketAddr,
    dialer: Dialer,
    conn: TcpStream,
    phase: Phase,
    hello: Vec<u8>,
    chunks: i16,
    write_closed: bool,
    read_closed: bool,
    deadline: Pin<Box<Sleep>>,
    stats: Option<Arc<Mutex<RetryStats>>>,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

/// Connect to `addr` and wrap the stream in a [`Retrier`].
///
/// `stats`, when provided, is filled in as the connection progresses and can
/// be read after the flow closes.
pub async fn dial_with_split_retry(
    dialer: &Dialer,
    addr: SocketAddr,
    stats: Option<Arc<Mutex<RetryStats>>>,
) -> io::Result<Retrier> {
    let conn = dialer.dial(addr).await?;
    if let Some(stats) = &stats {
        stats.lock().timeout_ms = RETRY_TIMEOUT.as_millis() as i32;
    }
    Ok(Retrier {
        addr,
        dialer: dialer.clone(),
        conn,
        phase: Phase::Fresh,
        hello: Vec::new(),
        chunks: 0,
        write_closed: false,
        read_closed: false,
        deadline: Box::pin(tokio::time::sleep(RETRY_TIMEOUT)),
        stats,
        read_waker: None,
        write_waker: None,
    })
}

impl Retrier {
    /// Stop surfacing reads. While fresh this also disarms the retry timer,
    /// since nothing will drive it.
    pub fn close_read(&mut self) {
        self.read_closed = true;
    }

    fn wake_peers(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }

    fn establish(&mut self) {
        self.phase = Phase::Established;
        self.hello = Vec::new();
        self.wake_peers();
    }

    /// Enter the Dialing phase: reconnect and replay the buffer, split.
    fn begin_retry(&mut self) {
        let hello = std::mem::take(&mut self.hello);
        if let Some(stats) = &self.stats {
            let mut stats = stats.lock();
            stats.sni = extract_sni(&hello).unwrap_or_default();
            stats.bytes = hello.len() as i32;
            stats.chunks = self.chunks;
        }
        debug!(addr = %self.addr, bytes = hello.len(), "retrying with split replay");
        let dialer = self.dialer.clone();
        let addr = self.addr;
        self.phase = Phase::Dialing(Box::pin(async move {
            let mut conn = dialer.dial(addr).await?;
            let point = split_point(&hello).min(hello.len());
            let (head, tail) = hello.split_at(point);
            if !head.is_empty() {
                conn.write_all(head).await?;
            }
            if !tail.is_empty() {
                conn.write_all(tail).await?;
            }
            Ok((conn, head.len()))
        }));
        self.wake_peers();
    }

    fn finish_retry(&mut self, conn: TcpStream, split: usize) {
        self.conn = conn;
        if let Some(stats) = &self.stats {
            stats.lock().split = split as i16;
        }
        self.establish();
    }
}

impl AsyncRead for Retrier {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.read_closed {
            return Poll::Ready(Ok(()));
        }
        loop {
            match &mut this.phase {
                Phase::Established => return Pin::new(&mut this.conn).poll_read(cx, buf),
                Phase::Fresh => {
                    let before = buf.filled().len();
                    match Pin::new(&mut this.conn).poll_read(cx, buf) {
                        Poll::Ready(Ok(())) if buf.filled().len() > before => {
                            // First downstream byte: past the point of no return.
                            this.establish();
                            return Poll::Ready(Ok(()));
                        }
                        Poll::Ready(result) => {
                            // EOF or error before any downstream byte.
                            if this.write_closed {
                                // A half-closed fresh flow cannot be replayed.
                                this.establish();
                                return Poll::Ready(result);
                            }
                            this.begin_retry();
                        }
                        Poll::Pending => match this.deadline.as_mut().poll(cx) {
                            Poll::Ready(()) if !this.write_closed => this.begin_retry(),
                            _ => {
                                this.read_waker = Some(cx.waker().clone());
                                return Poll::Pending;
                            }
                        },
                    }
                }
                Phase::Dialing(fut) => match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok((conn, split))) => this.finish_retry(conn, split),
                    Poll::Ready(Err(e)) => {
                        this.establish();
                        return Poll::Ready(Err(e));
                    }
                    Poll::Pending => {
                        this.read_waker = Some(cx.waker().clone());
                        return Poll::Pending;
                    }
                },
            }
        }
    }
}

impl AsyncWrite for Retrier {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        loop {
            match &mut this.phase {
                Phase::Established => return Pin::new(&mut this.conn).poll_write(cx, buf),
                Phase::Fresh => match Pin::new(&mut this.conn).poll_write(cx, buf) {
                    Poll::Ready(Ok(n)) => {
                        this.hello.extend_from_slice(&buf[..n]);
                        this.chunks = this.chunks.saturating_add(1);
                        return Poll::Ready(Ok(n));
                    }
                    Poll::Ready(Err(e)) => {
                        if this.write_closed {
                            this.establish();
                            return Poll::Ready(Err(e));
                        }
                        debug!(error = %e, "write failed on fresh connection");
                        this.begin_retry();
                    }
                    Poll::Pending => {
                        this.write_waker = Some(cx.waker().clone());
                        return Poll::Pending;
                    }
                },
                Phase::Dialing(fut) => match fut.as_mut().poll(cx) {
                    // The replay already carried the buffered bytes; the
                    // pending `buf` was not among them, so fall through to
                    // Established and write it on the new connection.
                    Poll::Ready(Ok((conn, split))) => this.finish_retry(conn, split),
                    Poll::Ready(Err(e)) => {
                        this.establish();
                        return Poll::Ready(Err(e));
                    }
                    Poll::Pending => {
                        this.write_waker = Some(cx.waker().clone());
                        return Poll::Pending;
                    }
                },
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match &this.phase {
            Phase::Dialing(_) => Poll::Ready(Ok(())),
            _ => Pin::new(&mut this.conn).poll_flush(cx),
        }
    }

    /// Half-close the write side. Sends FIN and inhibits any further retry:
    /// a replay could not reproduce the half-close ordering.
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            match &mut this.phase {
                Phase::Dialing(fut) => match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok((conn, split))) => this.finish_retry(conn, split),
                    Poll::Ready(Err(e)) => {
                        this.establish();
                        return Poll::Ready(Err(e));
                    }
                    Poll::Pending => {
                        this.write_waker = Some(cx.waker().clone());
                        return Poll::Pending;
                    }
                },
                _ => {
                    this.write_closed = true;
                    return Pin::new(&mut this.conn).poll_shutdown(cx);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clienthello::tests::build_client_hello;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    struct Setup {
        listener: TcpListener,
        client: Retrier,
        server: TcpStream,
        stats: Arc<Mutex<RetryStats>>,
        server_received: Vec<u8>,
    }

    async fn make_setup() -> Setup {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(Mutex::new(RetryStats::default()));
        let dialer = Dialer::new();
        let dial = dial_with_split_retry(&dialer, addr, Some(stats.clone()));
        let (client, accepted) = tokio::join!(dial, listener.accept());
        Setup {
            listener,
            client: client.unwrap(),
            server: accepted.unwrap().0,
            stats,
            server_received: Vec::new(),
        }
    }

    fn pattern_buffer() -> Vec<u8> {
        (0..=255u8).collect()
    }

    impl Setup {
        async fn send_up(&mut self) {
            let buffer = pattern_buffer();
            self.client.write_all(&buffer).await.unwrap();
            let mut read = vec![0u8; buffer.len()];
            self.server.read_exact(&mut read).await.unwrap();
            assert_eq!(read, buffer);
            self.server_received.extend_from_slice(&read);
        }

        async fn send_down(&mut self) {
            let buffer = pattern_buffer();
            self.server.write_all(&buffer).await.unwrap();
            let mut read = vec![0u8; buffer.len()];
            self.client.read_exact(&mut read).await.unwrap();
            assert_eq!(read, buffer);
        }

        /// Accept the second connection, check the replay, and echo it back.
        async fn confirm_retry(&mut self) {
            let expected = self.server_received.clone();
            let echo = async {
                let (mut conn, _) = self.listener.accept().await.unwrap();
                let mut replay = vec![0u8; expected.len()];
                conn.read_exact(&mut replay).await.unwrap();
                assert_eq!(replay, expected, "replay was corrupted");
                conn.write_all(&replay).await.unwrap();
                conn
            };
            let read_back = async {
                let mut buf = vec![0u8; expected.len()];
                self.client.read_exact(&mut buf).await.unwrap();
                buf
            };
            let (conn, read) = tokio::join!(echo, read_back);
            assert_eq!(read, expected, "echo mismatch after retry");
            self.server = conn;
        }
    }

    #[tokio::test]
    async fn normal_connection_does_not_retry() {
        let mut s = make_setup().await;
        s.send_up().await;
        s.send_down().await;
        s.client.shutdown().await.unwrap();
        assert_eq!(s.stats.lock().split, 0);
        assert_eq!(s.stats.lock().timeout_ms, 1200);
    }

    #[tokio::test]
    async fn fin_triggers_retry() {
        let mut s = make_setup().await;
        s.send_up().await;
        drop(std::mem::replace(&mut s.server, loop_back_placeholder().await));
        s.confirm_retry().await;
        s.send_down().await;
        let stats = s.stats.lock().clone();
        assert!(stats.split > 0);
        assert_eq!(stats.bytes, 256);
        assert_eq!(stats.chunks, 1);
    }

    #[tokio::test]
    async fn timeout_triggers_retry() {
        let mut s = make_setup().await;
        s.send_up().await;
        // The server stays silent; the client should give up on the fresh
        // connection after about 1.2 seconds and replay.
        s.confirm_retry().await;
        s.send_down().await;
        assert!(s.stats.lock().split > 0);
    }

    #[tokio::test]
    async fn two_writes_before_retry_are_replayed() {
        let mut s = make_setup().await;
        s.send_up().await;
        s.send_up().await;
        drop(std::mem::replace(&mut s.server, loop_back_placeholder().await));
        s.confirm_retry().await;
        let stats = s.stats.lock().clone();
        assert_eq!(stats.bytes, 512);
        assert_eq!(stats.chunks, 2);
    }

    // A throwaway stream so mem::replace has something to put in the slot.
    async fn loop_back_placeholder() -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (a, _b) = tokio::join!(TcpStream::connect(addr), listener.accept());
        a.unwrap()
    }

    #[tokio::test]
    async fn downstream_data_disarms_retry() {
        let mut s = make_setup().await;
        s.send_up().await;
        s.send_down().await;
        // FIN after downstream bytes must surface as EOF, not a retry.
        drop(std::mem::replace(&mut s.server, loop_back_placeholder().await));
        let mut buf = [0u8; 16];
        let n = s.client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(s.stats.lock().split, 0);
    }

    #[tokio::test]
    async fn close_write_inhibits_retry() {
        let mut s = make_setup().await;
        s.send_up().await;
        s.client.shutdown().await.unwrap();
        // Server sees the data and the FIN, then closes without replying.
        let mut rest = Vec::new();
        s.server.read_to_end(&mut rest).await.unwrap();
        drop(std::mem::replace(&mut s.server, loop_back_placeholder().await));
        let mut buf = [0u8; 16];
        let n = s.client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "half-closed fresh flow must not be replayed");
        assert_eq!(s.stats.lock().split, 0);
        // No second connection may arrive.
        let second = tokio::time::timeout(Duration::from_millis(100), s.listener.accept()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn reset_replays_client_hello_split() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(Mutex::new(RetryStats::default()));
        let dialer = Dialer::new();
        let dial = dial_with_split_retry(&dialer, addr, Some(stats.clone()));
        let (client, accepted) = tokio::join!(dial, listener.accept());
        let mut client = client.unwrap();

        let hello = build_client_hello("blocked.example", 200);
        client.write_all(&hello).await.unwrap();
        let mut conn = accepted.unwrap().0;
        let mut seen = vec![0u8; hello.len()];
        conn.read_exact(&mut seen).await.unwrap();
        drop(conn); // FIN before any response

        let echo = async {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut replay = vec![0u8; hello.len()];
            conn.read_exact(&mut replay).await.unwrap();
            assert_eq!(replay, hello);
            conn.write_all(b"ok").await.unwrap();
            conn
        };
        let read_back = async {
            let mut buf = [0u8; 2];
            client.read_exact(&mut buf).await.unwrap();
        };
        let (_conn, ()) = tokio::join!(echo, read_back);

        let stats = stats.lock().clone();
        assert!(stats.split > 0);
        assert_eq!(stats.bytes, 200);
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.sni, "blocked.example");
        assert_eq!(stats.timeout_ms, 1200);
    }

    #[tokio::test]
    async fn works_through_split_halves() {
        let mut s = make_setup().await;
        let buffer = pattern_buffer();
        let (mut rd, mut wr) = tokio::io::split(std::mem::replace(
            &mut s.client,
            dial_placeholder().await,
        ));
        wr.write_all(&buffer).await.unwrap();
        let mut read = vec![0u8; buffer.len()];
        s.server.read_exact(&mut read).await.unwrap();
        s.server.write_all(&read).await.unwrap();
        let mut echoed = vec![0u8; buffer.len()];
        rd.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, buffer);
        wr.shutdown().await.unwrap();
    }

    async fn dial_placeholder() -> Retrier {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = Dialer::new();
        let (r, _a) = tokio::join!(
            dial_with_split_retry(&dialer, addr, None),
            listener.accept()
        );
        r.unwrap()
    }
}
