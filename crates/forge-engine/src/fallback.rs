//! Provider fallback handling.
//!
//! Retries the *generation operation* (not just the HTTP call) across an
//! ordered provider chain until one succeeds or all are exhausted. Rate
//! limits get a short fixed delay before the next provider; every other
//! failure advances immediately after logging. Authentication and quota
//! errors are never retried against the same provider (the adapter's retry
//! policy already refuses them) but do not stop the chain from advancing.

use forge_core::{
    ForgeError, ForgeResult, GenerationRequest, ProviderConfig, RetryLayer, RetryTracker,
    TokenUsage,
};
use forge_providers::ProviderRegistry;
use forge_resilience::Deadline;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Fallback behavior knobs.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Providers tried after the primary, in order.
    pub chain: Vec<String>,
    /// Fixed delay before advancing past a rate-limited provider.
    pub rate_limit_delay: Duration,
    /// Optional total time budget for one endpoint's whole operation.
    pub budget: Option<Duration>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            chain: Vec::new(),
            rate_limit_delay: Duration::from_secs(5),
            budget: None,
        }
    }
}

/// Successful result of a fallback operation.
#[derive(Debug)]
pub struct FallbackOutcome {
    /// Recovered test-data records.
    pub artifacts: Vec<Value>,
    /// Usage of the call that succeeded.
    pub usage: TokenUsage,
    /// Provider that produced the result.
    pub provider: String,
    /// The primary provider, when the result came from a fallback.
    pub fallback_from: Option<String>,
    /// Every provider tried, in order, including the successful one.
    pub providers_tried: Vec<String>,
}

/// Drives one endpoint's generation across a provider chain.
pub struct FallbackHandler {
    registry: Arc<ProviderRegistry>,
    configs: HashMap<String, ProviderConfig>,
    config: FallbackConfig,
}

impl FallbackHandler {
    /// Create a handler over a registry and the configured providers.
    #[must_use]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        configs: HashMap<String, ProviderConfig>,
        config: FallbackConfig,
    ) -> Self {
        Self {
            registry,
            configs,
            config,
        }
    }

    /// The ordered provider list for a primary: primary first, then the
    /// chain with the primary de-duplicated.
    fn provider_order(&self, primary: &str) -> Vec<String> {
        let mut order = vec![primary.to_string()];
        for name in &self.config.chain {
            if !order.contains(name) {
                order.push(name.clone());
            }
        }
        order
    }

    /// Generate artifacts for one endpoint, falling back across providers.
    ///
    /// # Errors
    /// Returns [`ForgeError::Timeout`] when the aggregate budget runs out and
    /// [`ForgeError::AllProvidersFailed`] when the chain is exhausted.
    pub async fn generate_with_fallback(
        &self,
        request: &GenerationRequest,
        primary: &str,
        tracker: &RetryTracker,
    ) -> ForgeResult<FallbackOutcome> {
        let deadline = Deadline::start(self.config.budget);
        let order = self.provider_order(primary);

        let mut tried: Vec<String> = Vec::new();
        let mut last_error: Option<ForgeError> = None;

        for name in &order {
            if deadline.expired() {
                return Err(ForgeError::timeout(self.config.budget.unwrap_or_default()));
            }

            let Some(provider_config) = self.configs.get(name) else {
                warn!(provider = %name, "skipping unconfigured provider in fallback chain");
                continue;
            };

            let provider = match self.registry.ensure(name, provider_config) {
                Ok(provider) => provider,
                Err(error) => {
                    warn!(provider = %name, error = %error, "provider unavailable");
                    tried.push(name.clone());
                    last_error = Some(error);
                    continue;
                }
            };

            tried.push(name.clone());
            let attempt = tracker.begin(RetryLayer::Provider, format!("provider '{name}'"), None);

            match deadline
                .bound(provider.generate_artifacts(request, tracker))
                .await
            {
                Ok((artifacts, usage)) => {
                    tracker.finish(attempt, true);
                    let fallback_from = (name != primary).then(|| primary.to_string());
                    if let Some(from) = &fallback_from {
                        info!(
                            endpoint = %request.endpoint_id,
                            provider = %name,
                            fallback_from = %from,
                            "generation succeeded on fallback provider"
                        );
                    }
                    return Ok(FallbackOutcome {
                        artifacts,
                        usage,
                        provider: name.clone(),
                        fallback_from,
                        providers_tried: tried,
                    });
                }
                Err(error) => {
                    tracker.finish(attempt, false);

                    if matches!(error, ForgeError::Timeout { .. }) && deadline.expired() {
                        // Aggregate budget spent; abandon regardless of
                        // remaining fallback options.
                        return Err(error);
                    }
                    if let ForgeError::RateLimit { .. } = &error {
                        let delay = error
                            .retry_after()
                            .map_or(self.config.rate_limit_delay, |hint| {
                                hint.min(self.config.rate_limit_delay)
                            });
                        warn!(
                            provider = %name,
                            delay_ms = delay.as_millis(),
                            "provider rate limited; pausing before next provider"
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!(
                            endpoint = %request.endpoint_id,
                            provider = %name,
                            error = %error,
                            "provider failed; advancing to next in chain"
                        );
                    }
                    last_error = Some(error);
                }
            }
        }

        Err(ForgeError::AllProvidersFailed {
            providers: tried,
            last_error: Box::new(last_error.unwrap_or_else(|| {
                ForgeError::configuration("no provider in the fallback chain is configured")
            })),
            retry: Some(tracker.report()),
        })
    }
}
