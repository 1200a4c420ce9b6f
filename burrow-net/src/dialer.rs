use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::trace;

/// Establishes outbound TCP connections for the handlers and the DoH client.
#[derive(Clone, Debug, Default)]
pub struct Dialer {
    /// Maximum time to wait for the TCP handshake. `None` leaves it to the OS.
    pub connect_timeout: Option<Duration>,
}

impl Dialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            connect_timeout: Some(timeout),
        }
    }

    /// Connect to `addr`, honouring the configured handshake timeout.
    pub async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        trace!(%addr, "dialing");
        let stream = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::TimedOut, format!("connect to {addr} timed out"))
                })??,
            None => TcpStream::connect(addr).await?,
        };
        stream.set_nodelay(true).ok();
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dial_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = Dialer::new();
        let stream = dialer.dial(addr).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = Dialer::with_timeout(Duration::from_secs(1));
        assert!(dialer.dial(addr).await.is_err());
    }
}
