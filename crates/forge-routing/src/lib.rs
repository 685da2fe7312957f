//! # Forge Routing
//!
//! Provider assignment for the LLM test-data forge.
//!
//! This crate decides which provider handles which endpoint:
//! - Round-robin rotation over the configured providers
//! - Uniform random selection
//! - Complexity-based tiering (simple/medium/complex endpoints to
//!   cheap/balanced/capable backends)
//! - Manual `path:provider` mappings with glob patterns

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod complexity;
pub mod manual;
pub mod random;
pub mod round_robin;
pub mod strategy;

// Re-export main types
pub use complexity::{complexity_score, ComplexityBased, ComplexityTier, TierProviders};
pub use manual::ManualMapping;
pub use random::Random;
pub use round_robin::RoundRobin;
pub use strategy::{build_strategy, AssignmentStrategy, StrategyConfig, StrategyKind};
