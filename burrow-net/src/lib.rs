//! Wire-level plumbing for the Burrow data plane.
//!
//! This crate contains the pieces that sit directly on top of a TCP socket:
//! a dialer with an optional connect timeout, TLS ClientHello inspection,
//! the [`Splitter`] that breaks the first upstream segment in two, and the
//! [`Retrier`] that re-dials and replays the opening bytes when a fresh
//! connection dies early.

pub mod clienthello;
pub mod dialer;
pub mod retry;
pub mod split;

pub use clienthello::{extract_sni, is_client_hello};
pub use dialer::Dialer;
pub use retry::{dial_with_split_retry, Retrier, RetryStats};
pub use split::{dial_with_split, Splitter};
