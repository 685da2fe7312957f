//! # Forge Providers
//!
//! Backend adapters for the LLM test-data forge.
//!
//! This crate provides one adapter per backend family plus the registry that
//! owns their lifecycles:
//! - OpenAI-compatible chat completions (OpenAI, DeepSeek, Qwen, ...)
//! - Ollama-style local generation
//!
//! Each adapter normalizes its backend's wire format, performs its own
//! HTTP-layer retry/backoff, and hands raw content upward for recovery.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod registry;

#[cfg(feature = "openai")]
pub mod openai;

#[cfg(feature = "ollama")]
pub mod ollama;

// Re-export main types
pub use registry::{ProviderFactory, ProviderRegistry};

#[cfg(feature = "openai")]
pub use openai::OpenAiProvider;

#[cfg(feature = "ollama")]
pub use ollama::OllamaProvider;
