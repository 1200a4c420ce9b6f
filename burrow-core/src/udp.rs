//! Per-flow UDP handling.
//!
//! Datagrams are routed directly to their destination through a NAT-style
//! tracker map, except datagrams addressed to the fake DNS: those become
//! DoH queries and their responses are written back with the fake DNS as
//! the source address. Trackers expire when their deadline passes with no
//! traffic.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use burrow_doh::{AtomicTransport, Transport};

use crate::error::{Error, Result};
use crate::netstack::{PacketBinder, UdpConn, UdpConnHandler};

const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Describes a UDP association, reported when it is discarded.
#[derive(Clone, Debug, Default)]
pub struct UdpSocketSummary {
    /// Amount uploaded (bytes). DoH queries are not charged.
    pub upload_bytes: i64,
    /// Amount downloaded (bytes).
    pub download_bytes: i64,
    /// How long the association was open (seconds).
    pub duration_s: i32,
}

/// Notified when a UDP association is discarded.
pub trait UdpListener: Send + Sync {
    fn on_udp_socket_closed(&self, summary: &UdpSocketSummary);
}

struct Tracker {
    socket: UdpSocket,
    start: Instant,
    upload: AtomicI64,
    download: AtomicI64,
    deadline: Mutex<tokio::time::Instant>,
    cancel: CancellationToken,
}

impl Tracker {
    fn refresh_deadline(&self, timeout: Duration) {
        *self.deadline.lock() = tokio::time::Instant::now() + timeout;
    }
}

struct UdpHandlerInner {
    fakedns: SocketAddr,
    timeout: Duration,
    binder: Arc<dyn PacketBinder>,
    dns: Arc<AtomicTransport>,
    listener: Arc<dyn UdpListener>,
    trackers: DashMap<usize, Arc<Tracker>>,
}

/// UDP forwarder with Intra-style DNS redirection. Cheap to clone; clones
/// share the tracker map.
#[derive(Clone)]
pub struct UdpHandler {
    inner: Arc<UdpHandlerInner>,
}

impl UdpHandler {
    /// `timeout` controls the effective NAT mapping lifetime, `binder` binds
    /// new external ports, and `listener` receives a summary for each
    /// association when it expires.
    pub fn new(
        fakedns: SocketAddr,
        timeout: Duration,
        binder: Arc<dyn PacketBinder>,
        dns: Arc<AtomicTransport>,
        listener: Arc<dyn UdpListener>,
    ) -> Self {
        Self {
            inner: Arc::new(UdpHandlerInner {
                fakedns,
                timeout,
                binder,
                dns,
                listener,
                trackers: DashMap::new(),
            }),
        }
    }

    /// Number of live associations.
    pub fn active_flows(&self) -> usize {
        self.inner.trackers.len()
    }

    fn key(conn: &Arc<dyn UdpConn>) -> usize {
        Arc::as_ptr(conn) as *const () as usize
    }

    async fn close_conn(inner: &Arc<UdpHandlerInner>, conn: &Arc<dyn UdpConn>) {
        conn.close();
        if let Some((_, tracker)) = inner.trackers.remove(&Self::key(conn)) {
            tracker.cancel.cancel();
            let summary = UdpSocketSummary {
                upload_bytes: tracker.upload.load(Ordering::Relaxed),
                download_bytes: tracker.download.load(Ordering::Relaxed),
                duration_s: tracker.start.elapsed().as_secs() as i32,
            };
            inner.listener.on_udp_socket_closed(&summary);
        }
    }

    /// Serve one DNS query over DoH and write the answer back as if it came
    /// from the fake DNS server.
    async fn do_doh(
        self,
        dns: Option<Arc<dyn Transport>>,
        tracker: Arc<Tracker>,
        conn: Arc<dyn UdpConn>,
        query: Vec<u8>,
    ) {
        match dns {
            None => warn!("no DNS transport configured, dropping query"),
            Some(dns) => {
                let result = tokio::select! {
                    _ = tracker.cancel.cancelled() => return,
                    result = dns.query(&query) => result,
                };
                match result {
                    Ok(response) => {
                        if let Err(e) = conn.write_from(&response, self.inner.fakedns).await {
                            warn!(error = %e, "failed to write DNS response to TUN");
                        }
                    }
                    Err(e) => warn!(error = %e, "DoH query failed"),
                }
            }
        }
        if tracker.upload.load(Ordering::Relaxed) == 0
            && tracker.download.load(Ordering::Relaxed) == 0
        {
            // The association was only used for this DNS query, so it is
            // unlikely to be used again.
            Self::close_conn(&self.inner, &conn).await;
        }
    }
}

/// Pump datagrams from the external socket back into the stack until the
/// deadline or an error ends the association.
async fn fetch_input(inner: Arc<UdpHandlerInner>, conn: Arc<dyn UdpConn>, tracker: Arc<Tracker>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let deadline = *tracker.deadline.lock();
        let received = tokio::select! {
            _ = tracker.cancel.cancelled() => break,
            received = tokio::time::timeout_at(deadline, tracker.socket.recv_from(&mut buf)) => received,
        };
        match received {
            Err(_) => {
                // Deadline elapsed; re-arm when it was refreshed while we
                // slept.
                if *tracker.deadline.lock() > tokio::time::Instant::now() {
                    continue;
                }
                break;
            }
            Ok(Err(_)) => break,
            Ok(Ok((n, src))) => {
                tracker.refresh_deadline(inner.timeout);
                tracker.download.fetch_add(n as i64, Ordering::Relaxed);
                if conn.write_from(&buf[..n], src).await.is_err() {
                    warn!("failed to write UDP data to TUN");
                    break;
                }
            }
        }
    }
    UdpHandler::close_conn(&inner, &conn).await;
}

#[async_trait]
impl UdpConnHandler for UdpHandler {
    async fn connect(&self, conn: Arc<dyn UdpConn>, target: SocketAddr) -> Result<()> {
        let socket = self.inner.binder.bind().await.map_err(|e| {
            warn!(error = %e, "failed to bind UDP address");
            Error::Io(e)
        })?;
        let tracker = Arc::new(Tracker {
            socket,
            start: Instant::now(),
            upload: AtomicI64::new(0),
            download: AtomicI64::new(0),
            deadline: Mutex::new(tokio::time::Instant::now() + self.inner.timeout),
            cancel: CancellationToken::new(),
        });
        self.inner
            .trackers
            .insert(Self::key(&conn), Arc::clone(&tracker));
        tokio::spawn(fetch_input(Arc::clone(&self.inner), conn, tracker));
        debug!(%target, "new proxy association");
        Ok(())
    }

    async fn receive_to(
        &self,
        conn: &Arc<dyn UdpConn>,
        data: &[u8],
        dest: SocketAddr,
    ) -> Result<()> {
        let tracker = self
            .inner
            .trackers
            .get(&Self::key(conn))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::network(format!("association to {dest} does not exist")))?;

        tracker.refresh_deadline(self.inner.timeout);

        if dest == self.inner.fakedns {
            // Queries are answered out of band; their bytes are not charged
            // to the usage counters.
            let query = data.to_vec();
            let dns = self.inner.dns.load();
            let handler = self.clone();
            let conn = Arc::clone(conn);
            tokio::spawn(handler.do_doh(dns, tracker, conn, query));
            return Ok(());
        }

        tracker.upload.fetch_add(data.len() as i64, Ordering::Relaxed);
        tracker.socket.send_to(data, dest).await.map_err(|e| {
            warn!(error = %e, "failed to forward UDP payload");
            Error::network("failed to write UDP data")
        })?;
        Ok(())
    }

    async fn close(&self, conn: &Arc<dyn UdpConn>) {
        Self::close_conn(&self.inner, conn).await;
    }
}
