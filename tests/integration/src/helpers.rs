//! Shared fixtures for the integration tests.

use forge_core::{Provider, ProviderConfig};
use forge_providers::{OpenAiProvider, ProviderRegistry};
use once_cell::sync::Lazy;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::MockServer;

/// Initialize test logging once for the whole binary.
pub fn init_tracing() {
    static INIT: Lazy<()> = Lazy::new(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
    Lazy::force(&INIT);
}

/// An OpenAI-shaped success body with the given content and usage.
pub fn completion_body(content: &str, prompt_tokens: u64, completion_tokens: u64) -> serde_json::Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "model": "test-model",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens
        }
    })
}

/// SSE frames for a streamed completion: deltas, a usage frame, `[DONE]`.
pub fn sse_body(deltas: &[&str], prompt_tokens: u64, completion_tokens: u64) -> String {
    let mut body = String::new();
    for delta in deltas {
        let frame = json!({
            "id": "chatcmpl-test",
            "choices": [{"index": 0, "delta": {"content": delta}, "finish_reason": null}]
        });
        body.push_str(&format!("data: {frame}\n\n"));
    }
    let terminal = json!({
        "id": "chatcmpl-test",
        "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens
        }
    });
    body.push_str(&format!("data: {terminal}\n\ndata: [DONE]\n\n"));
    body
}

/// Provider configuration pointed at a mock server.
pub fn openai_config(name: &str, server: &MockServer) -> ProviderConfig {
    ProviderConfig::new(name, "test-model")
        .with_api_key("test-key")
        .with_base_url(format!("{}/v1", server.uri()))
        .with_timeout(Duration::from_secs(5))
        .with_max_retries(3)
}

/// A registry whose named entries all build OpenAI-compatible adapters.
///
/// Test provider names ("p1", "up", ...) are not built-in, so each gets an
/// explicit factory registration.
pub fn openai_registry(names: &[&str]) -> Arc<ProviderRegistry> {
    let registry = Arc::new(ProviderRegistry::new());
    for name in names {
        registry.register(*name, |config| {
            Ok(Arc::new(OpenAiProvider::new(config)?) as Arc<dyn Provider>)
        });
    }
    registry
}
