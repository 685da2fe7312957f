//! Ollama-style local generation adapter.
//!
//! Talks to an Ollama server's `/api/generate` endpoint. Unlike the hosted
//! backends this one needs no credential, streams NDJSON lines rather than
//! SSE frames, and reports usage through `eval_count`/`prompt_eval_count`.
//! Local single-GPU servers serialize generations anyway, so the default
//! concurrency is one.

use async_trait::async_trait;
use forge_core::response::{META_FINISH_REASON, META_RETRY_COUNT};
use forge_core::{
    ForgeError, ForgeResult, GenerationRequest, GenerationResponse, ProgressSender, Provider,
    ProviderConfig, RetryLayer, RetryTracker, TokenUsage,
};
use forge_resilience::{Backoff, RetryConfig, RetryPolicy};
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default Ollama API base URL.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Local servers serialize generations; default to one in flight.
const DEFAULT_CONCURRENCY: usize = 1;

/// Added delay per attempt for transient server errors.
const SERVER_ERROR_INCREMENT: Duration = Duration::from_millis(500);

/// Ollama provider implementation.
pub struct OllamaProvider {
    config: ProviderConfig,
    client: Client,
    base_url: String,
    retry: RetryPolicy,
    progress: Option<ProgressSender>,
}

impl OllamaProvider {
    /// Create a provider from its configuration.
    ///
    /// # Errors
    /// Returns an error when the HTTP client cannot be created.
    pub fn new(config: ProviderConfig) -> ForgeResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ForgeError::internal(format!("failed to create HTTP client: {e}")))?;

        let base_url = if config.base_url.trim().is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            config.base_url.trim_end_matches('/').to_string()
        };
        let retry = RetryPolicy::new(RetryConfig {
            max_retries: config.max_retries,
            backoff: Backoff::Linear {
                increment: SERVER_ERROR_INCREMENT,
            },
            ..Default::default()
        });

        Ok(Self {
            config,
            client,
            base_url,
            retry,
            progress: None,
        })
    }

    /// Attach a progress sender owned by the caller.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Generation endpoint URL.
    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    /// Model listing endpoint URL, used for health checks.
    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url)
    }

    /// Build the wire request body.
    fn build_body(&self, request: &GenerationRequest, stream: bool) -> OllamaRequest {
        OllamaRequest {
            model: self.config.model.clone(),
            prompt: request.prompt.clone(),
            system: request.system.clone(),
            stream,
            options: OllamaOptions {
                temperature: request.temperature.or(self.config.temperature),
                top_p: request.top_p,
                num_predict: request.max_tokens,
            },
        }
    }

    fn map_transport_error(&self, error: &reqwest::Error) -> ForgeError {
        if error.is_timeout() {
            ForgeError::timeout(self.config.timeout)
        } else if error.is_connect() {
            ForgeError::provider(
                &self.config.name,
                format!("cannot reach Ollama at {}: {error}", self.base_url),
                None,
                true,
            )
        } else {
            ForgeError::provider(
                &self.config.name,
                format!("request failed: {error}"),
                None,
                true,
            )
        }
    }

    fn map_http_error(&self, status: u16, body: &str) -> ForgeError {
        let detail = serde_json::from_str::<OllamaError>(body)
            .map(|e| e.error)
            .unwrap_or_else(|_| {
                let mut text = body.trim().to_string();
                text.truncate(200);
                text
            });
        match status {
            404 => ForgeError::provider(
                &self.config.name,
                format!("model '{}' not found: {detail}", self.config.model),
                Some(status),
                false,
            ),
            429 => ForgeError::rate_limit(&self.config.name, None),
            500..=599 => ForgeError::provider(&self.config.name, detail, Some(status), true),
            _ => ForgeError::provider(&self.config.name, detail, Some(status), false),
        }
    }

    /// One non-streaming attempt.
    async fn attempt_generate(&self, body: &OllamaRequest) -> ForgeResult<OllamaOutcome> {
        let response = self
            .client
            .post(self.generate_url())
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.map_http_error(status.as_u16(), &text));
        }

        let parsed: OllamaResponse = response.json().await.map_err(|e| {
            ForgeError::invalid_format(format!("malformed Ollama response: {e}"), None)
        })?;

        if parsed.response.trim().is_empty() {
            return Err(ForgeError::empty_response(&self.config.name));
        }
        Ok(OllamaOutcome {
            content: parsed.response,
            prompt_tokens: parsed.prompt_eval_count,
            completion_tokens: parsed.eval_count,
            done_reason: parsed.done_reason,
        })
    }

    /// One streaming attempt: accumulate NDJSON lines until `done`.
    async fn attempt_stream(
        &self,
        body: &OllamaRequest,
        request: &GenerationRequest,
    ) -> ForgeResult<OllamaOutcome> {
        let response = self
            .client
            .post(self.generate_url())
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.map_http_error(status.as_u16(), &text));
        }

        let mut content = String::new();
        let mut prompt_tokens = 0u64;
        let mut completion_tokens = 0u64;
        let mut done_reason: Option<String> = None;
        let mut buffer = String::new();
        let expected_chars = request.max_tokens.map_or(4_000, |t| t as usize * 4);

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes =
                chunk.map_err(|e| ForgeError::streaming(format!("stream read failed: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<OllamaResponse>(line) {
                    Ok(frame) => {
                        content.push_str(&frame.response);
                        if let Some(progress) = &self.progress {
                            let fraction = content.len() as f32 / expected_chars as f32;
                            progress.update(&request.endpoint_id, fraction.min(0.9));
                        }
                        if frame.done {
                            prompt_tokens = frame.prompt_eval_count;
                            completion_tokens = frame.eval_count;
                            done_reason = frame.done_reason;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, line = %line, "failed to parse stream line");
                    }
                }
            }
        }

        if content.trim().is_empty() {
            return Err(ForgeError::empty_response(&self.config.name));
        }
        Ok(OllamaOutcome {
            content,
            prompt_tokens,
            completion_tokens,
            done_reason,
        })
    }

    fn finish_response(
        &self,
        outcome: OllamaOutcome,
        request: &GenerationRequest,
        tracker: &RetryTracker,
    ) -> GenerationResponse {
        let usage = if outcome.prompt_tokens == 0 && outcome.completion_tokens == 0 {
            TokenUsage::estimate(
                request.prompt.len() + request.system.as_deref().map_or(0, str::len),
                outcome.content.len(),
            )
        } else {
            TokenUsage::new(outcome.prompt_tokens, outcome.completion_tokens, 0)
        };
        let usage = usage
            .with_model(&self.config.model)
            .with_endpoint_id(&request.endpoint_id)
            .with_retries(tracker.retries(RetryLayer::Http));

        let mut response =
            GenerationResponse::new(outcome.content, &self.config.name, &self.config.model)
                .with_usage(usage)
                .with_metadata(
                    META_RETRY_COUNT,
                    tracker.retries(RetryLayer::Http).to_string(),
                );
        if let Some(reason) = outcome.done_reason {
            response = response.with_metadata(META_FINISH_REASON, reason);
        }
        response
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn max_concurrency(&self) -> usize {
        self.config.max_concurrency.unwrap_or(DEFAULT_CONCURRENCY)
    }

    fn validate_config(&self) -> ForgeResult<()> {
        self.config.validate()?;
        url::Url::parse(&self.base_url).map_err(|e| {
            ForgeError::configuration(format!(
                "provider '{}' has an invalid base URL '{}': {e}",
                self.config.name, self.base_url
            ))
        })?;
        Ok(())
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        tracker: &RetryTracker,
    ) -> ForgeResult<GenerationResponse> {
        debug!(
            provider = %self.config.name,
            model = %self.config.model,
            endpoint = %request.endpoint_id,
            stream = self.config.stream,
            "sending generation request"
        );

        let outcome = if self.config.stream {
            let body = self.build_body(request, true);
            self.retry
                .execute_tracked(RetryLayer::Http, tracker, |_| {
                    self.attempt_stream(&body, request)
                })
                .await?
        } else {
            let body = self.build_body(request, false);
            let _simulation = self
                .progress
                .as_ref()
                .map(|p| p.simulate(&request.endpoint_id, self.config.timeout));
            self.retry
                .execute_tracked(RetryLayer::Http, tracker, |_| self.attempt_generate(&body))
                .await?
        };

        Ok(self.finish_response(outcome, request, tracker))
    }

    async fn health_check(&self) -> bool {
        let response = self
            .client
            .get(self.tags_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(
                    provider = %self.config.name,
                    status = %resp.status(),
                    "health check failed"
                );
                false
            }
            Err(e) => {
                error!(provider = %self.config.name, error = %e, "health check error");
                false
            }
        }
    }

    async fn close(&self) {
        debug!(provider = %self.config.name, "provider closed");
    }
}

/// Result of one successful attempt (either path).
struct OllamaOutcome {
    content: String,
    prompt_tokens: u64,
    completion_tokens: u64,
    done_reason: Option<String>,
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

/// Both the single non-streaming body and each NDJSON stream frame.
#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    eval_count: u64,
    #[serde(default)]
    prompt_eval_count: u64,
}

#[derive(Debug, Deserialize)]
struct OllamaError {
    error: String,
}

// ============================================================================
// Tests
// ============================================================================
