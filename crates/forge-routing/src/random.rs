//! Uniform random assignment.

use crate::strategy::AssignmentStrategy;
use forge_core::{EndpointDescriptor, ForgeError, ForgeResult};
use rand::seq::SliceRandom;

/// Stateless uniform choice over the configured providers.
pub struct Random {
    providers: Vec<String>,
}

impl Random {
    /// Create a random chooser over `providers`.
    ///
    /// # Errors
    /// Returns a configuration error for an empty provider list.
    pub fn new(providers: Vec<String>) -> ForgeResult<Self> {
        if providers.is_empty() {
            return Err(ForgeError::configuration(
                "random strategy needs at least one provider",
            ));
        }
        Ok(Self { providers })
    }
}

impl AssignmentStrategy for Random {
    fn assign(&self, _endpoint: &EndpointDescriptor) -> ForgeResult<String> {
        self.providers
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| ForgeError::internal("provider list unexpectedly empty"))
    }

    fn name(&self) -> &'static str {
        "random"
    }
}
