//! # Forge Resilience
//!
//! Resilience patterns for the LLM test-data forge:
//! - One composable retry policy shared by the HTTP, generation, and
//!   provider layers
//! - Concurrency throttle with request-start pacing
//! - Aggregate time budgets

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod retry;
pub mod throttle;
pub mod timeout;

// Re-export main types
pub use retry::{Backoff, RetryConfig, RetryPolicy, RetryPolicyBuilder};
pub use throttle::{Throttle, ThrottleConfig, ThrottlePermit};
pub use timeout::Deadline;
