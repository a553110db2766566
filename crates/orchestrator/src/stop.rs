//! Cooperative stop request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One-way stop flag shared between the step loop and an asynchronous
/// requester (e.g. a Ctrl-C handler).
///
/// The flag only ever goes from unset to set. Nothing else of the
/// coordinator is reachable through it, so handing a clone to a signal
/// context exposes no other state. The loop observes it at safe points only:
/// an in-flight command always runs to completion.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    /// Create an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a graceful stop. Idempotent.
    pub fn request(&self) {
        if !self.0.swap(true, Ordering::AcqRel) {
            tracing::info!("Stop requested");
        }
    }

    /// Whether a stop has been requested.
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
