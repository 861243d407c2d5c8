use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{HalError, HalResult};

/// Cooperative cancellation token threaded into every blocking operation.
///
/// Cloning shares the underlying flag, so the CLI can hand one clone to a
/// signal handler and another to the engine.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Returns `HalError::Cancelled` once the token has fired.
    pub fn err_if_cancelled(&self) -> HalResult<()> {
        if self.is_cancelled() {
            return Err(HalError::Cancelled);
        }
        Ok(())
    }
}
