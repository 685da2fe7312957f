//! Generation response type.

use crate::usage::TokenUsage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata key: the backend's finish reason ("stop", "length", ...).
pub const META_FINISH_REASON: &str = "finish_reason";
/// Metadata key: HTTP-layer retries that preceded this response.
pub const META_RETRY_COUNT: &str = "retry_count";
/// Metadata key: the backend's request id, when it reports one.
pub const META_REQUEST_ID: &str = "request_id";
/// Metadata key: the primary provider a fallback result replaced.
pub const META_FALLBACK_FROM: &str = "fallback_from";
/// Metadata key: comma-separated providers tried before this result.
pub const META_PROVIDERS_TRIED: &str = "providers_tried";

/// Raw output of one successful generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    /// Raw content returned by the backend (after adapter-level unwrapping).
    pub content: String,

    /// Name of the provider that produced the response.
    pub provider: String,

    /// Model that produced the response.
    pub model: String,

    /// Token accounting, when the backend reported or the adapter estimated it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,

    /// Free-form metadata (finish reason, retry count, request id, ...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl GenerationResponse {
    /// Create a response with empty metadata.
    #[must_use]
    pub fn new(
        content: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            provider: provider.into(),
            model: model.into(),
            usage: None,
            metadata: HashMap::new(),
        }
    }

    /// Attach token usage.
    #[must_use]
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Insert one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Finish reason reported by the backend, if any.
    #[must_use]
    pub fn finish_reason(&self) -> Option<&str> {
        self.metadata.get(META_FINISH_REASON).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_round_trip() {
        let response = GenerationResponse::new("[]", "openai", "gpt-4o-mini")
            .with_metadata(META_FINISH_REASON, "stop")
            .with_metadata(META_RETRY_COUNT, "2");

        assert_eq!(response.finish_reason(), Some("stop"));
        assert_eq!(response.metadata.get(META_RETRY_COUNT).map(String::as_str), Some("2"));
    }

    #[test]
    fn test_finish_reason_absent() {
        let response = GenerationResponse::new("[]", "ollama", "llama3.2");
        assert_eq!(response.finish_reason(), None);
    }
}
