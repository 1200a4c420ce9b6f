//! Per-flow TCP handling.
//!
//! Flows to the fake DNS address are handed to the DNS-over-TCP acceptor and
//! served over DoH. HTTPS flows are dialed through the splitting wrappers;
//! everything else is forwarded as-is. Each flow runs as two relay tasks
//! (upload and download) that coordinate only through half-close, and emits
//! exactly one summary when both directions finish.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use burrow_doh::AtomicTransport;
use burrow_net::dialer::Dialer;
use burrow_net::retry::{dial_with_split_retry, RetryStats};
use burrow_net::split::dial_with_split;

use crate::error::{Error, Result};
use crate::netstack::{DuplexStream, TcpConnHandler};
use crate::sni::SniReporter;

/// Usage summary for each TCP socket, reported when it closes.
#[derive(Clone, Debug, Default)]
pub struct TcpSocketSummary {
    /// Total bytes downloaded.
    pub download_bytes: i64,
    /// Total bytes uploaded.
    pub upload_bytes: i64,
    /// Duration in seconds.
    pub duration_s: i32,
    /// The server port. All values except 80, 443 and 0 are set to -1.
    pub server_port: i16,
    /// TCP handshake latency (ms).
    pub synack_ms: i32,
    /// Non-nil if retry was possible. `retry.split` is non-zero if a retry
    /// occurred.
    pub retry: Option<RetryStats>,
}

/// Notified when a TCP socket closes.
pub trait TcpListener: Send + Sync {
    fn on_tcp_socket_closed(&self, summary: &TcpSocketSummary);
}

// How much of the client's opening segment to accumulate before the first
// write, so the splitter sees the whole ClientHello.
const FIRST_CHUNK_BASE: usize = 1024;
const FIRST_CHUNK_JITTER: usize = 512;
const FIRST_CHUNK_GRACE: Duration = Duration::from_millis(20);

pub struct TcpHandler {
    fakedns: SocketAddr,
    dialer: Dialer,
    dns: Arc<AtomicTransport>,
    always_split_https: AtomicBool,
    listener: Arc<dyn TcpListener>,
    sni_reporter: SniReporter,
}

impl TcpHandler {
    /// A forwarder with Intra-style behavior: connections to `fakedns` are
    /// redirected to DoH, everything else is dialed with `dialer`.
    /// `listener` receives a summary for every socket when it closes.
    pub fn new(
        fakedns: SocketAddr,
        dialer: Dialer,
        dns: Arc<AtomicTransport>,
        listener: Arc<dyn TcpListener>,
    ) -> Self {
        Self {
            fakedns,
            dialer,
            dns,
            always_split_https: AtomicBool::new(false),
            listener,
            sni_reporter: SniReporter::new(),
        }
    }

    /// When set, every HTTPS connection is split pre-emptively instead of
    /// waiting for evidence of interference.
    pub fn set_always_split_https(&self, on: bool) {
        self.always_split_https.store(on, Ordering::Relaxed);
    }

    pub fn enable_sni_reporter(
        &self,
        file: std::fs::File,
        suffix: &str,
        country: &str,
    ) -> Result<()> {
        self.sni_reporter.configure(file, suffix, country)
    }
}

fn filtered_port(addr: SocketAddr) -> i16 {
    match addr.port() {
        80 => 80,
        443 => 443,
        0 => 0,
        _ => -1,
    }
}

#[async_trait]
impl TcpConnHandler for TcpHandler {
    async fn handle(&self, conn: Box<dyn DuplexStream>, target: SocketAddr) -> Result<()> {
        // DNS override.
        if target == self.fakedns {
            let dns = self
                .dns
                .load()
                .ok_or_else(|| Error::config("no DNS transport configured"))?;
            tokio::spawn(burrow_doh::accept(dns, conn));
            return Ok(());
        }

        let mut summary = TcpSocketSummary {
            server_port: filtered_port(target),
            ..Default::default()
        };
        let start = Instant::now();
        let mut retry_stats = None;
        let mut wrapped = false;
        let outbound: Box<dyn DuplexStream> = if summary.server_port == 443 {
            wrapped = true;
            if self.always_split_https.load(Ordering::Relaxed) {
                Box::new(dial_with_split(&self.dialer, target).await?)
            } else {
                let stats = Arc::new(Mutex::new(RetryStats::default()));
                retry_stats = Some(Arc::clone(&stats));
                Box::new(dial_with_split_retry(&self.dialer, target, Some(stats)).await?)
            }
        } else {
            Box::new(self.dialer.dial(target).await?)
        };
        summary.synack_ms = start.elapsed().as_millis() as i32;
        debug!(%target, "new proxy connection");

        let listener = Arc::clone(&self.listener);
        let reporter = self.sni_reporter.clone();
        tokio::spawn(forward(
            conn,
            outbound,
            summary,
            retry_stats,
            wrapped,
            listener,
            reporter,
        ));
        Ok(())
    }
}

/// Relay both directions and emit the summary once both are done.
async fn forward(
    conn: Box<dyn DuplexStream>,
    outbound: Box<dyn DuplexStream>,
    mut summary: TcpSocketSummary,
    retry_stats: Option<Arc<Mutex<RetryStats>>>,
    wrapped: bool,
    listener: Arc<dyn TcpListener>,
    reporter: SniReporter,
) {
    let start = Instant::now();
    let (mut local_rd, mut local_wr) = tokio::io::split(conn);
    let (mut remote_rd, mut remote_wr) = tokio::io::split(outbound);

    let (upload_tx, upload_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let sent = upload(&mut local_rd, &mut remote_wr, wrapped).await;
        let _ = remote_wr.shutdown().await;
        let _ = upload_tx.send(sent);
    });

    let download = match tokio::io::copy(&mut remote_rd, &mut local_wr).await {
        Ok(n) => n,
        Err(_) => 0,
    };
    let _ = local_wr.shutdown().await;

    summary.download_bytes = download as i64;
    summary.upload_bytes = upload_rx.await.unwrap_or(0) as i64;
    summary.duration_s = start.elapsed().as_secs() as i32;
    summary.retry = retry_stats.map(|stats| stats.lock().clone());
    listener.on_tcp_socket_closed(&summary);
    if summary.retry.is_some() {
        reporter.report(&summary);
    }
}

/// Copy upstream. For wrapped (split/retry) outbounds the opening segment is
/// accumulated first so the split point can land inside the ClientHello.
async fn upload<R, W>(rd: &mut R, wr: &mut W, buffer_first: bool) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut sent = 0u64;
    if buffer_first {
        match read_first_chunk(rd).await {
            Ok(Some(chunk)) => {
                if wr.write_all(&chunk).await.is_err() {
                    return sent;
                }
                sent += chunk.len() as u64;
            }
            Ok(None) | Err(_) => return 0,
        }
    }
    if let Ok(n) = tokio::io::copy(rd, wr).await {
        sent += n;
    }
    sent
}

/// Read the client's first segment: one blocking read, then whatever more
/// arrives within a short grace period, up to a jittered cap.
async fn read_first_chunk<R>(rd: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let cap = FIRST_CHUNK_BASE + rand::rng().random_range(0..FIRST_CHUNK_JITTER);
    let mut buf = vec![0u8; cap];
    let mut filled = rd.read(&mut buf).await?;
    if filled == 0 {
        return Ok(None);
    }
    let deadline = tokio::time::Instant::now() + FIRST_CHUNK_GRACE;
    while filled < cap {
        match tokio::time::timeout_at(deadline, rd.read(&mut buf[filled..])).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(Some(buf))
}
