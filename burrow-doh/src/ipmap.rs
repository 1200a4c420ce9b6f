//! Host name to address-set map with a sticky "confirmed" address.
//!
//! Each name owns an [`IpSet`]: the addresses known for that name, in
//! insertion order, plus at most one address that most recently carried a
//! successful transaction. Dialers try the confirmed address first and
//! disconfirm it when it stops working. Sets are additive; addresses are
//! never removed.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

/// Memoised map from host name to its [`IpSet`].
#[derive(Default)]
pub struct IpMap {
    entries: Mutex<HashMap<String, Arc<IpSet>>>,
}

impl IpMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// The set for `name`, created on first use.
    ///
    /// A name that parses as an IP literal yields a one-element set with
    /// that address pre-confirmed. Anything else gets a best-effort system
    /// resolution; failure leaves the set empty for the caller to seed.
    pub async fn get(&self, name: &str) -> Arc<IpSet> {
        if let Some(set) = self.entries.lock().get(name) {
            return Arc::clone(set);
        }
        let set = Arc::new(IpSet::new());
        if let Ok(ip) = name.parse::<IpAddr>() {
            set.confirm(ip);
        } else {
            for ip in resolve(name).await {
                set.add_addr(ip);
            }
        }
        let mut entries = self.entries.lock();
        Arc::clone(entries.entry(name.to_string()).or_insert(set))
    }
}

#[derive(Default)]
struct IpSetInner {
    ips: Vec<IpAddr>,
    confirmed: Option<IpAddr>,
}

/// The addresses known for one name. All methods are safe to call
/// concurrently; `confirmed` is read and written under the same lock as the
/// address list, so readers never observe a torn value.
#[derive(Default)]
pub struct IpSet {
    inner: Mutex<IpSetInner>,
}

impl IpSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union the addresses behind `name` into the set. `name` may be an IP
    /// literal or a host name; resolution failures are ignored.
    pub async fn add(&self, name: &str) {
        if let Ok(ip) = name.parse::<IpAddr>() {
            self.add_addr(ip);
            return;
        }
        for ip in resolve(name).await {
            self.add_addr(ip);
        }
    }

    /// Add a single address. Duplicates are ignored.
    pub fn add_addr(&self, ip: IpAddr) {
        let mut inner = self.inner.lock();
        if !inner.ips.contains(&ip) {
            inner.ips.push(ip);
        }
    }

    /// Mark `ip` as known-good, adding it if new.
    pub fn confirm(&self, ip: IpAddr) {
        let mut inner = self.inner.lock();
        if !inner.ips.contains(&ip) {
            inner.ips.push(ip);
        }
        if inner.confirmed != Some(ip) {
            debug!(%ip, "confirmed address");
            inner.confirmed = Some(ip);
        }
    }

    /// Clear the confirmed address, but only if it is still `ip`.
    /// The address stays in the set.
    pub fn disconfirm(&self, ip: IpAddr) {
        let mut inner = self.inner.lock();
        if inner.confirmed == Some(ip) {
            debug!(%ip, "disconfirmed address");
            inner.confirmed = None;
        }
    }

    pub fn confirmed(&self) -> Option<IpAddr> {
        self.inner.lock().confirmed
    }

    /// All known addresses, in insertion order.
    pub fn all(&self) -> Vec<IpAddr> {
        self.inner.lock().ips.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().ips.is_empty()
    }
}

async fn resolve(name: &str) -> Vec<IpAddr> {
    match tokio::net::lookup_host((name, 0u16)).await {
        Ok(addrs) => addrs.map(|a| a.ip()).collect(),
        Err(e) => {
            trace!(name, error = %e, "system resolution failed");
            Vec::new()
        }
    }
}
