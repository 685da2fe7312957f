//! Round-robin assignment.

use crate::strategy::AssignmentStrategy;
use forge_core::{EndpointDescriptor, ForgeError, ForgeResult};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Deterministic, order-preserving rotation over the configured providers.
pub struct RoundRobin {
    providers: Vec<String>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    /// Create a rotation over `providers`.
    ///
    /// # Errors
    /// Returns a configuration error for an empty provider list.
    pub fn new(providers: Vec<String>) -> ForgeResult<Self> {
        if providers.is_empty() {
            return Err(ForgeError::configuration(
                "round-robin strategy needs at least one provider",
            ));
        }
        Ok(Self {
            providers,
            cursor: AtomicUsize::new(0),
        })
    }
}

impl AssignmentStrategy for RoundRobin {
    fn assign(&self, _endpoint: &EndpointDescriptor) -> ForgeResult<String> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.providers.len();
        Ok(self.providers[index].clone())
    }

    fn reset(&self) {
        self.cursor.store(0, Ordering::Relaxed);
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
