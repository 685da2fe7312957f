//! Token usage accounting.
//!
//! [`TokenUsage`] records one call's consumption; [`TokenStatistics`] is the
//! running aggregate across a batch. Statistics are only ever mutated through
//! `add_usage`/`record_failure` by the task that owns an operation's result,
//! then merged into the shared aggregate in one operation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Rough character-per-token ratio used when a backend reports no usage.
const CHARS_PER_TOKEN: usize = 4;

/// Token consumption of one generation call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u64,
    /// Tokens generated.
    pub completion_tokens: u64,
    /// Total tokens; derived from the components when the backend omits it.
    pub total_tokens: u64,
    /// Model that consumed the tokens.
    #[serde(default)]
    pub model: String,
    /// Endpoint the call generated data for.
    #[serde(default)]
    pub endpoint_id: String,
    /// HTTP-layer retries spent on this specific call.
    #[serde(default)]
    pub retries: u32,
}

impl TokenUsage {
    /// Create a usage record from backend-reported counts.
    #[must_use]
    pub fn new(prompt_tokens: u64, completion_tokens: u64, total_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
            model: String::new(),
            endpoint_id: String::new(),
            retries: 0,
        }
        .normalized()
    }

    /// Estimate usage from character counts (last resort for streaming
    /// backends that never report usage). Roughly four characters per token.
    #[must_use]
    pub fn estimate(prompt_chars: usize, completion_chars: usize) -> Self {
        let prompt = (prompt_chars / CHARS_PER_TOKEN) as u64;
        let completion = (completion_chars / CHARS_PER_TOKEN) as u64;
        Self::new(prompt, completion, 0)
    }

    /// Set the source model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the originating endpoint id.
    #[must_use]
    pub fn with_endpoint_id(mut self, endpoint_id: impl Into<String>) -> Self {
        self.endpoint_id = endpoint_id.into();
        self
    }

    /// Set the retry count for this call.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Enforce the total-tokens invariant.
    ///
    /// When the backend omitted the total (zero) but reported a component,
    /// the total is derived as their sum; an explicitly supplied total is
    /// never below either component.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        let derived = self.prompt_tokens + self.completion_tokens;
        if self.total_tokens == 0 && derived > 0 {
            self.total_tokens = derived;
        }
        self.total_tokens = self
            .total_tokens
            .max(self.prompt_tokens)
            .max(self.completion_tokens);
        self
    }
}

/// Running aggregate of token usage across many calls.
///
/// Counters only ever increase.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenStatistics {
    /// Sum of prompt tokens over successful calls.
    pub total_prompt_tokens: u64,
    /// Sum of completion tokens over successful calls.
    pub total_completion_tokens: u64,
    /// Sum of total tokens over successful calls.
    pub total_tokens: u64,
    /// Calls that produced a usable result.
    pub successful_calls: u64,
    /// Calls that failed after exhausting their options.
    pub failed_calls: u64,
    /// Retries recorded per endpoint id.
    retries_by_endpoint: HashMap<String, u32>,
}

impl TokenStatistics {
    /// Create an empty aggregate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one successful call's usage into the aggregate.
    pub fn add_usage(&mut self, usage: &TokenUsage) {
        self.total_prompt_tokens += usage.prompt_tokens;
        self.total_completion_tokens += usage.completion_tokens;
        self.total_tokens += usage.total_tokens;
        self.successful_calls += 1;
        if !usage.endpoint_id.is_empty() {
            *self
                .retries_by_endpoint
                .entry(usage.endpoint_id.clone())
                .or_insert(0) += usage.retries;
        }
    }

    /// Record a failed call (and any retries it burned).
    pub fn record_failure(&mut self, endpoint_id: &str, retries: u32) {
        self.failed_calls += 1;
        if !endpoint_id.is_empty() {
            *self
                .retries_by_endpoint
                .entry(endpoint_id.to_string())
                .or_insert(0) += retries;
        }
    }

    /// Merge another aggregate into this one.
    pub fn merge(&mut self, other: &Self) {
        self.total_prompt_tokens += other.total_prompt_tokens;
        self.total_completion_tokens += other.total_completion_tokens;
        self.total_tokens += other.total_tokens;
        self.successful_calls += other.successful_calls;
        self.failed_calls += other.failed_calls;
        for (endpoint, retries) in &other.retries_by_endpoint {
            *self
                .retries_by_endpoint
                .entry(endpoint.clone())
                .or_insert(0) += retries;
        }
    }

    /// Total retries across every endpoint.
    #[must_use]
    pub fn total_retries(&self) -> u32 {
        self.retries_by_endpoint.values().sum()
    }

    /// Number of endpoints that needed at least one retry.
    #[must_use]
    pub fn endpoints_with_retries(&self) -> usize {
        self.retries_by_endpoint.values().filter(|&&r| r > 0).count()
    }

    /// The highest retry count any single endpoint needed.
    #[must_use]
    pub fn max_retries_for_one_endpoint(&self) -> u32 {
        self.retries_by_endpoint.values().copied().max().unwrap_or(0)
    }

    /// Retries recorded for one endpoint.
    #[must_use]
    pub fn retries_for(&self, endpoint_id: &str) -> u32 {
        self.retries_by_endpoint.get(endpoint_id).copied().unwrap_or(0)
    }
}
