//! Always-on splitting of the first upstream segment.
//!
//! Unlike the [`Retrier`](crate::retry::Retrier), a [`Splitter`] does not
//! wait for evidence of interference: the opening write is always broken in
//! two. Used for HTTPS flows when the embedder pre-emptively splits every
//! connection.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::clienthello::split_point;
use crate::dialer::Dialer;

/// Duplex wrapper that splits the first write into two send calls.
///
/// The first `poll_write` only submits the opening segment; the caller's
/// `write_all` loop issues the remainder as a separate write, so the two
/// halves leave in distinct calls in order. Subsequent writes pass through
/// unmodified. Any write error surfaces to the caller; there is no retry.
pub struct Splitter<S> {
    inner: S,
    used: bool,
}

/// Connect to `addr` and wrap the stream in a [`Splitter`].
pub async fn dial_with_split(dialer: &Dialer, addr: SocketAddr) -> io::Result<Splitter<TcpStream>> {
    Ok(Splitter::new(dialer.dial(addr).await?))
}

impl<S> Splitter<S> {
    pub fn new(inner: S) -> Self {
        Self { inner, used: false }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Splitter<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Splitter<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.used {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }
        let point = split_point(buf).min(buf.len());
        match Pin::new(&mut this.inner).poll_write(cx, &buf[..point]) {
            Poll::Ready(Ok(n)) => {
                this.used = true;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
