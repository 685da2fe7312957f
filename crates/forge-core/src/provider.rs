//! Provider abstraction.
//!
//! One [`Provider`] implementation exists per backend; everything above the
//! adapters dispatches through the trait object. Configuration arrives from
//! collaborating config/CLI code as a [`ProviderConfig`] record.

use crate::error::{ForgeError, ForgeResult};
use crate::recovery;
use crate::request::GenerationRequest;
use crate::response::GenerationResponse;
use crate::tracking::{RetryLayer, RetryTracker};
use crate::usage::TokenUsage;
use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const fn default_timeout() -> Duration {
    Duration::from_secs(120)
}

const fn default_max_retries() -> u32 {
    3
}

/// Configuration record for one provider instance.
///
/// Immutable after construction; sourced externally and handed in whole.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Provider instance name ("openai", "qwen", "ollama", ...).
    pub name: String,

    /// Model identifier to request.
    pub model: String,

    /// Credential; absent for local backends.
    #[serde(default)]
    pub api_key: Option<SecretString>,

    /// Base URL; empty selects the adapter's default for this backend.
    #[serde(default)]
    pub base_url: String,

    /// Per-request timeout.
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,

    /// HTTP-layer retry budget.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Default sampling temperature; adapters may be overridden per request.
    #[serde(default)]
    pub temperature: Option<f32>,

    /// Whether to use the backend's streaming mode.
    #[serde(default)]
    pub stream: bool,

    /// Concurrent request cap; `None` selects the adapter's default.
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// Request-start pacing in requests per second; `None` disables pacing.
    #[serde(default)]
    pub rate_limit: Option<f64>,

    /// Arbitrary backend-specific fields.
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ProviderConfig {
    /// Create a configuration with defaults for everything but name and model.
    #[must_use]
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            api_key: None,
            base_url: String::new(),
            timeout: default_timeout(),
            max_retries: default_max_retries(),
            temperature: None,
            stream: false,
            max_concurrency: None,
            rate_limit: None,
            extra: HashMap::new(),
        }
    }

    /// Set the credential.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::new(api_key.into()));
        self
    }

    /// Set the base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the HTTP retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the default temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Enable or disable streaming.
    #[must_use]
    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Cap concurrent requests to this provider.
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    /// Pace request starts (requests per second).
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: f64) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// Attach a backend-specific extra field.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Validate the record.
    ///
    /// # Errors
    /// Returns a configuration error for an empty name/model or out-of-range
    /// tuning values.
    pub fn validate(&self) -> ForgeResult<()> {
        if self.name.trim().is_empty() {
            return Err(ForgeError::configuration("provider name cannot be empty"));
        }
        if self.model.trim().is_empty() {
            return Err(ForgeError::configuration(format!(
                "provider '{}' has no model configured",
                self.name
            )));
        }
        if self.timeout.is_zero() {
            return Err(ForgeError::configuration(format!(
                "provider '{}' timeout must be non-zero",
                self.name
            )));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ForgeError::configuration(format!(
                    "provider '{}' temperature must be between 0.0 and 2.0, got {t}",
                    self.name
                )));
            }
        }
        if self.max_concurrency == Some(0) {
            return Err(ForgeError::configuration(format!(
                "provider '{}' max_concurrency must be at least 1",
                self.name
            )));
        }
        if let Some(rate) = self.rate_limit {
            if rate <= 0.0 {
                return Err(ForgeError::configuration(format!(
                    "provider '{}' rate_limit must be positive, got {rate}",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// One text-generation backend reachable over HTTP.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider instance name.
    fn name(&self) -> &str;

    /// Model this instance requests.
    fn model(&self) -> &str;

    /// How many requests this provider tolerates in flight.
    fn max_concurrency(&self) -> usize;

    /// Validate the configuration this instance was built from.
    fn validate_config(&self) -> ForgeResult<()>;

    /// Perform one generation call, returning the raw response.
    ///
    /// Implementations do their own HTTP-layer retry/backoff and record
    /// attempts into `tracker` under [`RetryLayer::Http`].
    async fn generate(
        &self,
        request: &GenerationRequest,
        tracker: &RetryTracker,
    ) -> ForgeResult<GenerationResponse>;

    /// Generate and recover structured test-data records for one endpoint.
    ///
    /// The default implementation runs [`Self::generate`], rejects empty
    /// content, recovers records via [`recovery::extract_records`], and fixes
    /// up the usage record with the endpoint id and HTTP retry count.
    async fn generate_artifacts(
        &self,
        request: &GenerationRequest,
        tracker: &RetryTracker,
    ) -> ForgeResult<(Vec<serde_json::Value>, TokenUsage)> {
        request.validate()?;
        let attempt = tracker.begin(RetryLayer::Generation, "generate artifacts", None);

        let outcome = async {
            let response = self.generate(request, tracker).await?;
            if response.content.trim().is_empty() {
                return Err(ForgeError::empty_response(self.name()));
            }
            let records = recovery::extract_records(&response.content)?;
            let mut usage = response
                .usage
                .clone()
                .unwrap_or_else(|| {
                    TokenUsage::estimate(
                        request.prompt.len()
                            + request.system.as_deref().map_or(0, str::len),
                        response.content.len(),
                    )
                })
                .normalized()
                .with_endpoint_id(&request.endpoint_id)
                .with_retries(tracker.retries(RetryLayer::Http));
            if usage.model.is_empty() {
                usage.model = self.model().to_string();
            }
            Ok((records, usage))
        }
        .await;

        tracker.finish(attempt, outcome.is_ok());
        outcome
    }

    /// Cheap liveness probe against the backend.
    async fn health_check(&self) -> bool;

    /// Release backend resources. Called once, via the registry's teardown.
    async fn close(&self) {}
}
