//! Cooperative cancellation.
//!
//! Cancellation applies to a whole session. Workers check the flag before
//! starting each page, never in the middle of a recognition call, so a
//! cancelled document stops at its next page boundary.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// A session's cancel flag. Clones share the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Returns `true` if this call set it, and `false` if it was
    /// already set.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    /// Has cancellation been requested?
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
