//! Lock-free cell holding the active DoH transport.
//!
//! The tunnel may swap the transport at any moment while handlers are
//! serving flows. Handlers load the cell once per transaction and keep the
//! loaded handle for the transaction's lifetime, so a swap never tears an
//! in-flight query.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::transport::Transport;

/// Single-word atomic slot for an `Arc<dyn Transport>`.
#[derive(Default)]
pub struct AtomicTransport {
    cell: ArcSwapOption<Arc<dyn Transport>>,
}

impl AtomicTransport {
    pub fn new() -> Self {
        Self {
            cell: ArcSwapOption::new(None),
        }
    }

    /// Replace the active transport.
    pub fn store(&self, transport: Arc<dyn Transport>) {
        self.cell.store(Some(Arc::new(transport)));
    }

    /// The currently active transport, if one has been set.
    pub fn load(&self) -> Option<Arc<dyn Transport>> {
        self.cell.load_full().map(|t| (*t).clone())
    }
}
