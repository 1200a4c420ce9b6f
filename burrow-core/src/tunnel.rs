//! The tunnel facade.
//!
//! Wires one TCP handler and one UDP handler into the userspace stack,
//! owns the atomic DoH slot they read per-transaction, and exposes the
//! runtime controls: swapping the DNS transport, toggling pre-emptive
//! HTTPS splitting, enabling the SNI reporter and disconnecting.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use burrow_doh::{AtomicTransport, DohListener, DohTransport, Transport};
use burrow_net::dialer::Dialer;

use crate::config::TunnelConfig;
use crate::error::{Error, Result};
use crate::netstack::{PacketBinder, Stack, TcpConnHandler, TunWriter};
use crate::tcp::{TcpHandler, TcpListener, TcpSocketSummary};
use crate::udp::{UdpHandler, UdpListener, UdpSocketSummary};

/// Receives usage statistics when a UDP or TCP socket is closed, or a DNS
/// query completes.
pub trait TunnelListener: TcpListener + UdpListener + DohListener {}

impl<T: TcpListener + UdpListener + DohListener> TunnelListener for T {}

// Per-concern adapters so the handlers stay decoupled from the combined
// listener trait.
struct TcpEvents(Arc<dyn TunnelListener>);

impl TcpListener for TcpEvents {
    fn on_tcp_socket_closed(&self, summary: &TcpSocketSummary) {
        self.0.on_tcp_socket_closed(summary);
    }
}

struct UdpEvents(Arc<dyn TunnelListener>);

impl UdpListener for UdpEvents {
    fn on_udp_socket_closed(&self, summary: &UdpSocketSummary) {
        self.0.on_udp_socket_closed(summary);
    }
}

struct DohEvents(Arc<dyn TunnelListener>);

impl DohListener for DohEvents {
    fn on_transaction(&self, summary: &burrow_doh::Summary) {
        self.0.on_transaction(summary);
    }
}

/// A connected Burrow session.
pub struct Tunnel {
    stack: Arc<dyn Stack>,
    tun: Arc<dyn TunWriter>,
    tcp: Arc<TcpHandler>,
    dns: Arc<AtomicTransport>,
    connected: AtomicBool,
}

impl Tunnel {
    /// Create a session: handlers are built from `config` and registered
    /// with `stack`; `tun` is the downstream device writer, closed on
    /// [`disconnect`](Self::disconnect).
    pub fn new(
        config: TunnelConfig,
        stack: Arc<dyn Stack>,
        tun: Arc<dyn TunWriter>,
        binder: Arc<dyn PacketBinder>,
        listener: Arc<dyn TunnelListener>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let dns = Arc::new(AtomicTransport::new());
        let dialer = Dialer {
            connect_timeout: config.connect_timeout,
        };

        let tcp = Arc::new(TcpHandler::new(
            config.fake_dns,
            dialer,
            Arc::clone(&dns),
            Arc::new(TcpEvents(Arc::clone(&listener))),
        ));
        tcp.set_always_split_https(config.always_split_https);
        let udp = UdpHandler::new(
            config.fake_dns,
            config.udp_timeout,
            binder,
            Arc::clone(&dns),
            Arc::new(UdpEvents(Arc::clone(&listener))),
        );

        stack.register_tcp_handler(Arc::clone(&tcp) as Arc<dyn TcpConnHandler>);
        stack.register_udp_handler(Arc::new(udp));
        info!(fake_dns = %config.fake_dns, "tunnel connected");

        Ok(Arc::new(Self {
            stack,
            tun,
            tcp,
            dns,
            connected: AtomicBool::new(true),
        }))
    }

    /// Replace the DNS transport. Handlers pick it up on their next
    /// transaction; in-flight queries finish on the old one.
    pub fn set_dns(&self, transport: Arc<dyn Transport>) {
        self.dns.store(transport);
    }

    /// The currently active DNS transport.
    pub fn dns(&self) -> Option<Arc<dyn Transport>> {
        self.dns.load()
    }

    /// When true, every HTTPS connection is split pre-emptively.
    pub fn set_always_split_https(&self, on: bool) {
        self.tcp.set_always_split_https(on);
    }

    /// Enable reporting of SNIs whose connections failed even after retry.
    /// `path` stores the aggregator state, `suffix` is the authoritative
    /// reporting domain and `country` a two-letter ISO code.
    pub fn enable_sni_reporter(&self, path: &Path, suffix: &str, country: &str) -> Result<()> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(path)?;
        self.tcp
            .enable_sni_reporter(file, suffix, &country.to_lowercase())
    }

    /// Feed one IP packet from the TUN device into the stack.
    pub fn write(&self, packet: &[u8]) -> Result<usize> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(Error::network("tunnel is disconnected"));
        }
        self.stack.write(packet).map_err(Error::from)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Tear the session down: the stack closes first, erroring out all
    /// in-flight flows, then the TUN writer.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            info!("disconnecting tunnel");
            self.stack.close();
            if let Err(e) = self.tun.close() {
                warn!(error = %e, "failed to close TUN writer");
            }
        }
    }
}

/// Build a DoH transport whose per-query summaries flow to `listener`.
/// `bootstrap` is a comma-separated list of fallback addresses for the
/// server, used when the hostname lookup fails or returns broken addresses.
pub async fn new_doh_transport(
    url: &str,
    bootstrap: &str,
    listener: Option<Arc<dyn TunnelListener>>,
) -> Result<Arc<dyn Transport>> {
    let addrs: Vec<String> = bootstrap
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let doh_listener = listener.map(|l| Arc::new(DohEvents(l)) as Arc<dyn DohListener>);
    let transport = DohTransport::new(url, &addrs, doh_listener).await?;
    Ok(Arc::new(transport))
}
