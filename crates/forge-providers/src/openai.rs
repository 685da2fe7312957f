//! OpenAI-compatible chat-completions adapter.
//!
//! Serves the OpenAI API and the compatible backends that copy its wire
//! format (DeepSeek, Qwen via the DashScope compatible mode, and any other
//! `/chat/completions` endpoint). Known backends get a default base URL by
//! provider name; anything else supplies one in its configuration.
//!
//! Transport policy: HTTP 429 honors the `retry-after` hint when present and
//! otherwise backs off exponentially; HTTP 5xx retries with linear backoff;
//! every other non-2xx status raises a typed error immediately.

use async_trait::async_trait;
use forge_core::response::{META_FINISH_REASON, META_REQUEST_ID, META_RETRY_COUNT};
use forge_core::{
    ForgeError, ForgeResult, GenerationRequest, GenerationResponse, ProgressSender, Provider,
    ProviderConfig, RetryLayer, RetryTracker, TokenUsage,
};
use forge_resilience::{Backoff, RetryConfig, RetryPolicy};
use futures_util::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Default OpenAI API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Default DeepSeek base URL (OpenAI-compatible).
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";

/// Default Qwen base URL (DashScope OpenAI-compatible mode).
pub const QWEN_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

/// Default concurrent-request cap for this family.
const DEFAULT_CONCURRENCY: usize = 3;

/// Base wait for a 429 without a `retry-after` header.
const RATE_LIMIT_BASE_WAIT: Duration = Duration::from_secs(1);

/// Growth factor for computed rate-limit waits.
const RATE_LIMIT_MULTIPLIER: f64 = 2.0;

/// Ceiling for computed rate-limit waits.
const RATE_LIMIT_MAX_WAIT: Duration = Duration::from_secs(60);

/// Added delay per attempt for 5xx-style transient errors.
const SERVER_ERROR_INCREMENT: Duration = Duration::from_millis(750);

/// OpenAI-compatible provider implementation.
pub struct OpenAiProvider {
    config: ProviderConfig,
    client: Client,
    base_url: String,
    retry: RetryPolicy,
    progress: Option<ProgressSender>,
}

impl OpenAiProvider {
    /// Create a provider from its configuration.
    ///
    /// # Errors
    /// Returns an error when the HTTP client cannot be created.
    pub fn new(config: ProviderConfig) -> ForgeResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(100)
            .build()
            .map_err(|e| ForgeError::internal(format!("failed to create HTTP client: {e}")))?;

        let base_url = resolve_base_url(&config);
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

    /// Chat completions endpoint URL.
    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Model listing endpoint URL, used for health checks.
    fn models_url(&self) -> String {
        format!("{}/models", self.base_url)
    }

    fn api_key(&self) -> &str {
        self.config
            .api_key
            .as_ref()
            .map_or("", |key| key.expose_secret())
    }

    /// Build the wire request body.
    fn build_body(&self, request: &GenerationRequest, stream: bool) -> ChatCompletionRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(WireMessage {
                role: "system",
                content: system.clone(),
            });
        }
        messages.push(WireMessage {
            role: "user",
            content: request.prompt.clone(),
        });

        ChatCompletionRequest {
            model: self.config.model.clone(),
            messages,
            temperature: request.temperature.or(self.config.temperature),
            top_p: request.top_p,
            max_tokens: request.max_tokens,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    /// Map a non-2xx status to a typed error.
    ///
    /// `attempt` feeds the computed rate-limit wait when the backend sends
    /// no `retry-after` hint.
    fn map_http_error(
        &self,
        status: u16,
        retry_after: Option<Duration>,
        body: &str,
        attempt: u32,
    ) -> ForgeError {
        let detail = serde_json::from_str::<ErrorEnvelope>(body)
            .map(|envelope| envelope.error.message)
            .unwrap_or_else(|_| {
                let mut text = body.trim().to_string();
                text.truncate(200);
                text
            });

        match status {
            401 | 403 => ForgeError::auth_failed(&self.config.name, detail),
            402 => ForgeError::quota_exceeded(&self.config.name, detail),
            429 if is_quota_error(body) => {
                ForgeError::quota_exceeded(&self.config.name, detail)
            }
            429 => {
                let wait = retry_after.unwrap_or_else(|| rate_limit_wait(attempt));
                ForgeError::rate_limit(&self.config.name, Some(wait))
            }
            500..=599 => ForgeError::provider(&self.config.name, detail, Some(status), true),
            _ => ForgeError::provider(&self.config.name, detail, Some(status), false),
        }
    }

    fn map_transport_error(&self, error: &reqwest::Error) -> ForgeError {
        if error.is_timeout() {
            ForgeError::timeout(self.config.timeout)
        } else {
            ForgeError::provider(
                &self.config.name,
                format!("request failed: {error}"),
                None,
                true,
            )
        }
    }

    /// One non-streaming HTTP attempt.
    async fn attempt_completion(
        &self,
        body: &ChatCompletionRequest,
        attempt: u32,
    ) -> ForgeResult<CompletionOutcome> {
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(self.api_key())
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(self.map_http_error(status.as_u16(), retry_after, &text, attempt));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| {
                ForgeError::invalid_format(format!("malformed completion response: {e}"), None)
            })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ForgeError::empty_response(&self.config.name))?;
        let content = choice
            .message
            .content
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| ForgeError::empty_response(&self.config.name))?;

        Ok(CompletionOutcome {
            content,
            usage: parsed.usage,
            finish_reason: choice.finish_reason,
            request_id: parsed.id,
        })
    }

    /// One streaming attempt: accumulate deltas until `[DONE]`.
    async fn attempt_stream(
        &self,
        body: &ChatCompletionRequest,
        request: &GenerationRequest,
    ) -> ForgeResult<CompletionOutcome> {
        let builder = self
            .client
            .post(self.completions_url())
            .bearer_auth(self.api_key())
            .json(body);

        let mut source = EventSource::new(builder)
            .map_err(|e| ForgeError::streaming(format!("failed to open event stream: {e}")))?;

        let mut content = String::new();
        let mut usage: Option<WireUsage> = None;
        let mut finish_reason: Option<String> = None;
        let mut request_id: Option<String> = None;
        // Rough completion horizon for fractional progress reporting.
        let expected_chars = request.max_tokens.map_or(4_000, |t| t as usize * 4);

        while let Some(event) = source.next().await {
            match event {
                Ok(Event::Open) => trace!(provider = %self.config.name, "stream opened"),
                Ok(Event::Message(message)) => {
                    let data = message.data.trim();
                    if data == "[DONE]" {
                        break;
                    }
                    match serde_json::from_str::<ChatChunk>(data) {
                        Ok(chunk) => {
                            if request_id.is_none() {
                                request_id = chunk.id;
                            }
                            if let Some(chunk_usage) = chunk.usage {
                                usage = Some(chunk_usage);
                            }
                            if let Some(choice) = chunk.choices.into_iter().next() {
                                if let Some(delta) = choice.delta.content {
                                    content.push_str(&delta);
                                    if let Some(progress) = &self.progress {
                                        let fraction =
                                            content.len() as f32 / expected_chars as f32;
                                        progress.update(&request.endpoint_id, fraction.min(0.9));
                                    }
                                }
                                if choice.finish_reason.is_some() {
                                    finish_reason = choice.finish_reason;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, data = %data, "failed to parse stream chunk");
                        }
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                    source.close();
                    let retry_after = parse_retry_after(response.headers());
                    let text = response.text().await.unwrap_or_default();
                    return Err(self.map_http_error(status.as_u16(), retry_after, &text, 0));
                }
                Err(e) => {
                    source.close();
                    return Err(ForgeError::streaming(format!("stream error: {e}")));
                }
            }
        }
        source.close();

        if content.trim().is_empty() {
            return Err(ForgeError::empty_response(&self.config.name));
        }
        Ok(CompletionOutcome {
            content,
            usage,
            finish_reason,
            request_id,
        })
    }

    /// Assemble the response, estimating usage when the backend reported none.
    fn finish_response(
        &self,
        outcome: CompletionOutcome,
        request: &GenerationRequest,
        tracker: &RetryTracker,
    ) -> GenerationResponse {
        let content = strip_code_fence(&outcome.content);
        let usage = outcome.usage.map_or_else(
            || {
                // Streaming backends that never report usage get the
                // characters-per-token estimate.
                TokenUsage::estimate(
                    request.prompt.len() + request.system.as_deref().map_or(0, str::len),
                    content.len(),
                )
            },
            |wire| TokenUsage::new(wire.prompt_tokens, wire.completion_tokens, wire.total_tokens),
        );
        let usage = usage
            .with_model(&self.config.model)
            .with_endpoint_id(&request.endpoint_id)
            .with_retries(tracker.retries(RetryLayer::Http));

        let mut response = GenerationResponse::new(content, &self.config.name, &self.config.model)
            .with_usage(usage)
            .with_metadata(
                META_RETRY_COUNT,
                tracker.retries(RetryLayer::Http).to_string(),
            );
        if let Some(reason) = outcome.finish_reason {
            response = response.with_metadata(META_FINISH_REASON, reason);
        }
        if let Some(id) = outcome.request_id {
            response = response.with_metadata(META_REQUEST_ID, id);
        }
        response
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
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
        if self.api_key().is_empty() {
            return Err(ForgeError::configuration(format!(
                "provider '{}' requires an api_key",
                self.config.name
            )));
        }
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
            // Simulated fractional progress while the synchronous call is in
            // flight; stops when the guard drops.
            let _simulation = self
                .progress
                .as_ref()
                .map(|p| p.simulate(&request.endpoint_id, self.config.timeout));
            self.retry
                .execute_tracked(RetryLayer::Http, tracker, |attempt| {
                    self.attempt_completion(&body, attempt)
                })
                .await?
        };

        Ok(self.finish_response(outcome, request, tracker))
    }

    async fn health_check(&self) -> bool {
        let response = self
            .client
            .get(self.models_url())
            .bearer_auth(self.api_key())
            .timeout(Duration::from_secs(10))
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

/// Pick the base URL: explicit config wins, then the name's known default.
fn resolve_base_url(config: &ProviderConfig) -> String {
    if !config.base_url.trim().is_empty() {
        return config.base_url.trim_end_matches('/').to_string();
    }
    match config.name.as_str() {
        "deepseek" => DEEPSEEK_BASE_URL.to_string(),
        "qwen" => QWEN_BASE_URL.to_string(),
        _ => DEFAULT_BASE_URL.to_string(),
    }
}

/// Computed wait for a 429 without a `retry-after` header.
fn rate_limit_wait(attempt: u32) -> Duration {
    let wait = RATE_LIMIT_BASE_WAIT.as_secs_f64() * RATE_LIMIT_MULTIPLIER.powi(attempt as i32);
    Duration::from_secs_f64(wait.min(RATE_LIMIT_MAX_WAIT.as_secs_f64()))
}

/// Parse a numeric `retry-after` header.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Some backends report exhausted quota as a 429 with a dedicated code.
fn is_quota_error(body: &str) -> bool {
    serde_json::from_str::<ErrorEnvelope>(body).is_ok_and(|envelope| {
        envelope
            .error
            .code
            .as_ref()
            .and_then(serde_json::Value::as_str)
            .is_some_and(|code| code.contains("insufficient_quota"))
    })
}

/// Strip a surrounding markdown code fence this family likes to add.
fn strip_code_fence(content: &str) -> String {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.strip_suffix("```").unwrap_or(body).trim().to_string()
}

/// Result of one successful HTTP attempt (either path).
struct CompletionOutcome {
    content: String,
    usage: Option<WireUsage>,
    finish_reason: Option<String>,
    request_id: Option<String>,
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    id: Option<String>,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: WireError,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

// ============================================================================
// Tests
// ============================================================================
