//! Burrow DoH - DNS-over-HTTPS transport for the Burrow data plane
//!
//! Features:
//! - POST-only RFC 8484 client, HTTP/2 preferred with HTTP/1.1 fallback
//! - Multi-IP dialing with a sticky confirmed address per server
//! - EDNS(0) padding to 128-byte blocks (RFC 7830 / RFC 8467)
//! - DNS-over-TCP stub acceptor bridging framed queries onto a transport
//! - Atomic transport slot for runtime server changes

pub mod accept;
pub mod atomic;
pub mod error;
pub mod ipmap;
pub mod padding;
pub mod transport;

#[cfg(test)]
mod tests;

pub use accept::accept;
pub use atomic::AtomicTransport;
pub use error::{DohError, QueryStatus, Result};
pub use ipmap::{IpMap, IpSet};
pub use padding::add_edns_padding;
pub use transport::{DohListener, DohTransport, Summary, Transport};
