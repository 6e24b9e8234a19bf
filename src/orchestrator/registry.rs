//! Node-local index of running generation drivers.
//!
//! Maps a stream id to the [`CancellationToken`] of the driver relaying it.
//! Lets a stop request that lands on the driver's own node take effect
//! without waiting for the next store checkpoint. Admission never reads it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

/// Shared map of stream id to driver cancellation token.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl DriverRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver and return its token.
    #[must_use]
    pub fn register(&self, stream_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock().insert(stream_id.to_owned(), token.clone());
        token
    }

    /// Signal the local driver of `stream_id`, if any. Returns whether one was found.
    pub fn cancel(&self, stream_id: &str) -> bool {
        match self.lock().get(stream_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget a finished driver.
    pub fn remove(&self, stream_id: &str) {
        self.lock().remove(stream_id);
    }

    /// Number of drivers running on this node.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no driver runs on this node.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.drivers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
