//! Generation request type.
//!
//! A [`GenerationRequest`] is the only input shape the orchestration core
//! accepts: prompt text plus generation parameters. Prompt construction is
//! the job of collaborating code.

use crate::error::{ForgeError, ForgeResult};
use serde::{Deserialize, Serialize};

/// One generation request handed to a provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Identifier of the endpoint this request generates data for.
    ///
    /// Flows into [`crate::TokenUsage`] for per-endpoint accounting.
    #[serde(default)]
    pub endpoint_id: String,

    /// The prompt text.
    pub prompt: String,

    /// Optional system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// Sampling temperature override (0.0 - 2.0); provider default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate; provider default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Top-p (nucleus sampling) override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl GenerationRequest {
    /// Create a request with just a prompt.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            endpoint_id: String::new(),
            prompt: prompt.into(),
            system: None,
            temperature: None,
            max_tokens: None,
            top_p: None,
        }
    }

    /// Set the endpoint id used for usage accounting.
    #[must_use]
    pub fn with_endpoint_id(mut self, id: impl Into<String>) -> Self {
        self.endpoint_id = id.into();
        self
    }

    /// Set the system prompt.
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Override the sampling temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Override the generation token cap.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Override top-p.
    #[must_use]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Validate the request before it is handed to an adapter.
    ///
    /// # Errors
    /// Returns a configuration error for an empty prompt or out-of-range
    /// sampling parameters.
    pub fn validate(&self) -> ForgeResult<()> {
        if self.prompt.trim().is_empty() {
            return Err(ForgeError::configuration("prompt cannot be empty"));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ForgeError::configuration(format!(
                    "temperature must be between 0.0 and 2.0, got {t}"
                )));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(ForgeError::configuration(format!(
                    "top_p must be between 0.0 and 1.0, got {p}"
                )));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(ForgeError::configuration("max_tokens must be at least 1"));
        }
        Ok(())
    }
}
