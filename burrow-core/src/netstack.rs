//! Contract with the userspace TCP/IP stack.
//!
//! The stack itself is an external dependency: it reassembles TUN packets
//! into flows and calls back into the registered handlers. Everything the
//! data plane needs from it fits in the traits below.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// A duplex byte stream: an inbound flow from the stack, an outbound socket,
/// or one of the splitting wrappers around it.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> DuplexStream for T {}

/// Handles each TCP flow the stack observes.
#[async_trait]
pub trait TcpConnHandler: Send + Sync {
    /// Called once per flow. An error tells the stack to reset the flow;
    /// after `Ok` the flow's fate is reported through summaries.
    async fn handle(&self, conn: Box<dyn DuplexStream>, target: SocketAddr) -> Result<()>;
}

/// The inbound side of a UDP flow: a pseudo-socket owned by the stack.
#[async_trait]
pub trait UdpConn: Send + Sync {
    /// Inject a datagram toward the device, with `src` as its source.
    async fn write_from(&self, data: &[u8], src: SocketAddr) -> io::Result<usize>;

    /// Tear down the stack side of the flow.
    fn close(&self);
}

/// Handles each UDP flow the stack observes.
#[async_trait]
pub trait UdpConnHandler: Send + Sync {
    /// Called when the stack first sees a 5-tuple.
    async fn connect(&self, conn: Arc<dyn UdpConn>, target: SocketAddr) -> Result<()>;

    /// Called for every outbound datagram on a connected flow.
    async fn receive_to(
        &self,
        conn: &Arc<dyn UdpConn>,
        data: &[u8],
        dest: SocketAddr,
    ) -> Result<()>;

    /// Tear the flow down and emit its summary.
    async fn close(&self, conn: &Arc<dyn UdpConn>);
}

/// The userspace stack as seen by the tunnel.
pub trait Stack: Send + Sync {
    fn register_tcp_handler(&self, handler: Arc<dyn TcpConnHandler>);
    fn register_udp_handler(&self, handler: Arc<dyn UdpConnHandler>);

    /// Feed one IP packet read from the TUN device into the stack.
    fn write(&self, packet: &[u8]) -> io::Result<usize>;

    /// Close the stack; in-flight flows error out toward the handlers.
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Writes synthesized IP packets back to the TUN device.
pub trait TunWriter: Send + Sync {
    fn write(&self, packet: &[u8]) -> io::Result<usize>;
    fn close(&self) -> io::Result<()>;
}

/// Binds ephemeral outbound UDP sockets. The embedder usually wraps this to
/// protect sockets from being routed back into the VPN.
#[async_trait]
pub trait PacketBinder: Send + Sync {
    async fn bind(&self) -> io::Result<tokio::net::UdpSocket>;
}

/// Plain OS binding with no protection.
pub struct SystemBinder;

#[async_trait]
impl PacketBinder for SystemBinder {
    async fn bind(&self) -> io::Result<tokio::net::UdpSocket> {
        tokio::net::UdpSocket::bind(("0.0.0.0", 0)).await
    }
}
