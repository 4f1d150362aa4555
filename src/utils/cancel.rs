//! Cooperative cancellation token

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag checked between layers of a net run.
///
/// Clones observe the same flag, so a training loop can hand one clone to a
/// watchdog thread and another to the layer.
#[derive(Debug, Clone, Default)]
pub struct CancelEvent {
    flag: Arc<AtomicBool>,
}

impl CancelEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
