use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::RegistryError;

/// Cooperative cancellation signal shared between a caller and a running
/// operation. Checked at lock waits and between download chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self, what: &str) -> Result<(), RegistryError> {
        if self.is_cancelled() {
            return Err(RegistryError::Cancelled(what.to_string()));
        }
        Ok(())
    }
}
