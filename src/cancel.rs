//! Cooperative cancellation.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag checked before each optional stage.
///
/// Clones observe the same flag. A stage that already started runs to
/// completion; cancellation only prevents the next one from starting.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// A token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Error::Cancelled)` naming `stage` if cancelled.
    pub fn check(&self, stage: &str) -> Result<()> {
        if self.is_cancelled() {
            log::info!("Cancellation requested, not starting {}", stage);
            Err(Error::Cancelled(stage.to_string()))
        } else {
            Ok(())
        }
    }
}
