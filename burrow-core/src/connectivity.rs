//! Connectivity probing.
//!
//! Classifies whether a proxy (or the direct network) can carry traffic:
//! a TCP HEAD request checks reachability and credentials, and a UDP DNS
//! probe checks datagram forwarding. The results collapse into the small
//! integer codes the platform layers surface to users.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;
use url::Url;

use crate::netstack::DuplexStream;

const UDP_MAX_ATTEMPTS: usize = 5;
const UDP_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);
const TCP_TIMEOUT: Duration = Duration::from_secs(10);
const BUFFER_LEN: usize = 512;

const TEST_URL: &str = "http://example.com";
const TEST_RESOLVER: &str = "1.1.1.1:53";

/// Probe outcome, as surfaced to the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CheckStatus {
    Ok = 0,
    Unexpected = 1,
    AuthenticationFailure = 3,
    UdpConnectivity = 4,
    Unreachable = 5,
}

impl CheckStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[derive(Error, Debug)]
pub enum ProbeError {
    /// The proxy could not be reached at all.
    #[error("proxy unreachable: {0}")]
    Reachability(#[source] io::Error),

    /// The proxy was reached but the exchange failed, which for an
    /// encrypted proxy means bad credentials.
    #[error("authentication failed: {0}")]
    Authentication(#[source] io::Error),

    /// The network or proxy does not forward UDP.
    #[error("UDP forwarding unsupported")]
    UdpUnsupported,
}

/// Dials streams through the proxy under test (or directly).
#[async_trait]
pub trait StreamDialer: Send + Sync {
    async fn dial_stream(&self, addr: &str) -> io::Result<Box<dyn DuplexStream>>;
}

/// One unconnected datagram socket through the proxy under test.
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// Opens packet sockets through the proxy under test.
#[async_trait]
pub trait PacketListener: Send + Sync {
    async fn listen_packet(&self) -> io::Result<Box<dyn PacketConn>>;
}

/// A literal A-record query for `com`, enough to elicit any answer.
fn dns_probe_query() -> Vec<u8> {
    vec![
        0, 0, // query ID
        1, 0, // flags, recursion desired
        0, 1, // QDCOUNT
        0, 0, // ANCOUNT
        0, 0, // NSCOUNT
        0, 0, // ARCOUNT
        3, b'c', b'o', b'm', 0, // QNAME
        0, 1, // QTYPE = A
        0, 1, // QCLASS = IN
    ]
}

/// Determine whether UDP datagrams reach `resolver` and come back.
pub async fn check_udp<L>(listener: &L, resolver: SocketAddr) -> Result<(), ProbeError>
where
    L: PacketListener + ?Sized,
{
    check_udp_with(listener, resolver, UDP_MAX_ATTEMPTS, UDP_ATTEMPT_TIMEOUT).await
}

async fn check_udp_with<L>(
    listener: &L,
    resolver: SocketAddr,
    attempts: usize,
    per_attempt: Duration,
) -> Result<(), ProbeError>
where
    L: PacketListener + ?Sized,
{
    let conn = listener
        .listen_packet()
        .await
        .map_err(|_| ProbeError::UdpUnsupported)?;
    let query = dns_probe_query();
    let mut buf = [0u8; BUFFER_LEN];
    for attempt in 0..attempts {
        if conn.send_to(&query, resolver).await.is_err() {
            continue;
        }
        match tokio::time::timeout(per_attempt, conn.recv_from(&mut buf)).await {
            Ok(Ok((n, src))) if n > 0 && src == resolver => return Ok(()),
            other => debug!(attempt, ?other, "UDP probe attempt failed"),
        }
    }
    Err(ProbeError::UdpUnsupported)
}

/// Reach `url` with a HEAD request. Dial failures mean the proxy is
/// unreachable; failures after the dial mean the exchange itself broke.
pub async fn check_tcp_http<D>(dialer: &D, url: &str) -> Result<(), ProbeError>
where
    D: StreamDialer + ?Sized,
{
    let parsed = Url::parse(url).map_err(|e| {
        ProbeError::Reachability(io::Error::new(io::ErrorKind::InvalidInput, e))
    })?;
    let host = parsed.host_str().ok_or_else(|| {
        ProbeError::Reachability(io::Error::new(io::ErrorKind::InvalidInput, "URL has no host"))
    })?;
    let port = parsed.port().unwrap_or(80);
    let addr = format!("{host}:{port}");

    let mut conn = match tokio::time::timeout(TCP_TIMEOUT, dialer.dial_stream(&addr)).await {
        Err(_) => {
            return Err(ProbeError::Reachability(io::Error::new(
                io::ErrorKind::TimedOut,
                "dial timed out",
            )))
        }
        Ok(Err(e)) => return Err(ProbeError::Reachability(e)),
        Ok(Ok(conn)) => conn,
    };

    let exchange = async {
        let request = format!("HEAD / HTTP/1.1\r\nHost: {host}\r\n\r\n");
        conn.write_all(request.as_bytes()).await?;
        let mut buf = [0u8; BUFFER_LEN];
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before any response byte",
            ));
        }
        Ok(())
    };
    match tokio::time::timeout(TCP_TIMEOUT, exchange).await {
        Err(_) => Err(ProbeError::Authentication(io::Error::new(
            io::ErrorKind::TimedOut,
            "no response",
        ))),
        Ok(Err(e)) => Err(ProbeError::Authentication(e)),
        Ok(Ok(())) => Ok(()),
    }
}

fn classify(
    tcp: Result<(), ProbeError>,
    udp: Result<(), ProbeError>,
) -> (CheckStatus, Option<ProbeError>) {
    match (tcp, udp) {
        (Ok(()), Ok(())) => (CheckStatus::Ok, None),
        (Ok(()), Err(_)) => (CheckStatus::UdpConnectivity, None),
        (Err(ProbeError::Authentication(_)), _) => (CheckStatus::AuthenticationFailure, None),
        (Err(ProbeError::Reachability(_)), _) => (CheckStatus::Unreachable, None),
        (Err(e), _) => (CheckStatus::Unexpected, Some(e)),
    }
}

/// Run both probes in parallel and classify the combination.
pub async fn check<C>(client: &C) -> (CheckStatus, Option<ProbeError>)
where
    C: StreamDialer + PacketListener + ?Sized,
{
    let resolver: SocketAddr = match TEST_RESOLVER.parse() {
        Ok(addr) => addr,
        Err(_) => {
            return (CheckStatus::Unexpected, None);
        }
    };
    let (tcp, udp) = tokio::join!(check_tcp_http(client, TEST_URL), check_udp(client, resolver));
    classify(tcp, udp)
}

/// Probes the direct network with plain OS sockets.
pub struct SystemClient;

#[async_trait]
impl StreamDialer for SystemClient {
    async fn dial_stream(&self, addr: &str) -> io::Result<Box<dyn DuplexStream>> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }
}

struct SystemPacketConn(tokio::net::UdpSocket);

#[async_trait]
impl PacketConn for SystemPacketConn {
    async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.0.send_to(data, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.0.recv_from(buf).await
    }
}

#[async_trait]
impl PacketListener for SystemClient {
    async fn listen_packet(&self) -> io::Result<Box<dyn PacketConn>> {
        Ok(Box::new(SystemPacketConn(
            tokio::net::UdpSocket::bind(("0.0.0.0", 0)).await?,
        )))
    }
}
