//! Aggregate time budgets.
//!
//! A [`Deadline`] bounds a whole multi-step operation (for example one
//! endpoint's retries across an entire fallback chain), as opposed to the
//! per-attempt timeouts each adapter already applies.

use forge_core::{ForgeError, ForgeResult};
use std::future::Future;
use std::time::{Duration, Instant};

/// A running time budget.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Option<Duration>,
}

impl Deadline {
    /// Start a budget; `None` means unbounded.
    #[must_use]
    pub fn start(budget: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    /// A deadline that never expires.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::start(None)
    }

    /// Time left in the budget; `None` when unbounded.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.budget
            .map(|budget| budget.saturating_sub(self.started.elapsed()))
    }

    /// Whether the budget is spent.
    #[must_use]
    pub fn expired(&self) -> bool {
        self.remaining().is_some_and(|left| left.is_zero())
    }

    /// Run a future within the remaining budget.
    ///
    /// # Errors
    /// Returns [`ForgeError::Timeout`] carrying the original budget when the
    /// future does not complete in time (or the budget was already spent).
    pub async fn bound<T, F>(&self, future: F) -> ForgeResult<T>
    where
        F: Future<Output = ForgeResult<T>>,
    {
        match self.remaining() {
            None => future.await,
            Some(left) => {
                let budget = self.budget.unwrap_or_default();
                if left.is_zero() {
                    return Err(ForgeError::timeout(budget));
                }
                match tokio::time::timeout(left, future).await {
                    Ok(result) => result,
                    Err(_) => Err(ForgeError::timeout(budget)),
                }
            }
        }
    }
}
