//! Burrow core - userspace VPN data plane
//!
//! Terminates the TCP and UDP flows a userspace network stack extracts from
//! a TUN device, redirects DNS onto DNS-over-HTTPS, splits TLS ClientHellos
//! on HTTPS flows (with one dial-and-replay retry on interference), and
//! forwards everything else directly. The stack itself, the proxy dialers
//! and the platform entry points are external; this crate is the plumbing
//! between them.

pub mod config;
pub mod connectivity;
pub mod error;
pub mod logging;
pub mod netstack;
pub mod sni;
pub mod tcp;
pub mod tun;
pub mod tunnel;
pub mod udp;

pub use config::{LogLevel, TunnelConfig};
pub use connectivity::{check, check_tcp_http, check_udp, CheckStatus, ProbeError};
pub use error::{Error, Result};
pub use netstack::{
    DuplexStream, PacketBinder, Stack, SystemBinder, TcpConnHandler, TunWriter, UdpConn,
    UdpConnHandler,
};
pub use sni::SniReporter;
pub use tcp::{TcpHandler, TcpListener, TcpSocketSummary};
pub use tun::{pump_input, VPN_MTU};
pub use tunnel::{new_doh_transport, Tunnel, TunnelListener};
pub use udp::{UdpHandler, UdpListener, UdpSocketSummary};

#[cfg(unix)]
pub use tun::make_tun_file;
