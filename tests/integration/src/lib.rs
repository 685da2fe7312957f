//! Integration tests for the LLM test-data forge.
//!
//! These tests exercise the crates together against wiremock-simulated
//! backends: HTTP retry sequences, fallback chains, streaming accumulation,
//! throttled batch runs, and usage aggregation.

pub mod helpers;

#[cfg(test)]
mod engine_tests;
#[cfg(test)]
mod fallback_tests;
#[cfg(test)]
mod provider_tests;
