//! # Forge Engine
//!
//! The top-level façade of the LLM test-data forge.
//!
//! The engine assigns a provider to every endpoint in a batch, groups
//! endpoints by provider, runs each group under its own concurrency budget,
//! drives the fallback chain for each endpoint, and aggregates results and
//! token usage into a batch report.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod engine;
pub mod fallback;

// Re-export main types
pub use engine::{
    BatchReport, EndpointJob, EndpointOutcome, GenerationEngine, GenerationEngineBuilder,
};
pub use fallback::{FallbackConfig, FallbackHandler, FallbackOutcome};
