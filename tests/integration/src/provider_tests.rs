//! Provider adapter tests against wiremock backends.

use crate::helpers::*;
use forge_core::{
    ForgeError, GenerationRequest, Provider, ProviderConfig, RetryLayer, RetryTracker,
};
use forge_providers::{OllamaProvider, OpenAiProvider};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request() -> GenerationRequest {
    GenerationRequest::new("generate three test cases").with_endpoint_id("GET /users")
}

/// Two 429s followed by a 200 succeed within a budget of two retries.
#[tokio::test]
async fn test_rate_limited_twice_then_succeeds() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "0")
                .set_body_json(json!({"error": {"message": "slow down"}})),
        )
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(completion_body(r#"[{"id": 1}]"#, 12, 7)),
        )
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(openai_config("openai", &server)).expect("build");
    let tracker = RetryTracker::new();

    let response = provider.generate(&request(), &tracker).await.expect("generate");

    assert_eq!(response.content, r#"[{"id": 1}]"#);
    assert_eq!(tracker.attempt_count(RetryLayer::Http), 3);
    assert_eq!(tracker.retries(RetryLayer::Http), 2);
    let usage = response.usage.as_ref().expect("usage");
    assert_eq!(usage.prompt_tokens, 12);
    assert_eq!(usage.retries, 2);
}

/// Persistent 429s beyond the budget surface as a rate-limit error.
#[tokio::test]
async fn test_persistent_rate_limit_exhausts_budget() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "0")
                .set_body_json(json!({"error": {"message": "slow down"}})),
        )
        .expect(2) // initial attempt + one retry
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(
        openai_config("openai", &server).with_max_retries(1),
    )
    .expect("build");
    let tracker = RetryTracker::new();

    let error = provider
        .generate(&request(), &tracker)
        .await
        .expect_err("must fail");
    assert!(matches!(error, ForgeError::RateLimit { .. }));
}

/// Authentication failures are surfaced immediately, never retried.
#[tokio::test]
async fn test_auth_failure_not_retried() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({"error": {"message": "bad key"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(openai_config("openai", &server)).expect("build");
    let tracker = RetryTracker::new();

    let error = provider
        .generate(&request(), &tracker)
        .await
        .expect_err("must fail");
    assert!(matches!(error, ForgeError::AuthFailed { .. }));
    assert_eq!(tracker.attempt_count(RetryLayer::Http), 1);
}

/// Server errors retry until the backend recovers.
#[tokio::test]
async fn test_server_error_retried() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(completion_body(r#"[{"id": 1}]"#, 5, 5)),
        )
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(openai_config("openai", &server)).expect("build");
    let tracker = RetryTracker::new();

    let response = provider.generate(&request(), &tracker).await.expect("generate");
    assert_eq!(tracker.retries(RetryLayer::Http), 1);
    assert_eq!(response.content, r#"[{"id": 1}]"#);
}

/// Streaming accumulates deltas and reads usage from the terminal frame.
#[tokio::test]
async fn test_streaming_accumulates_deltas() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(
                    sse_body(&[r#"[{"id""#, r#": 1}]"#], 9, 4),
                    "text/event-stream",
                ),
        )
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(
        openai_config("openai", &server).with_streaming(true),
    )
    .expect("build");
    let tracker = RetryTracker::new();

    let response = provider.generate(&request(), &tracker).await.expect("generate");
    assert_eq!(response.content, r#"[{"id": 1}]"#);
    let usage = response.usage.as_ref().expect("usage");
    assert_eq!(usage.prompt_tokens, 9);
    assert_eq!(usage.completion_tokens, 4);
    assert_eq!(response.finish_reason(), Some("stop"));
}

/// Fenced and wrapped output still yields recovered records.
#[tokio::test]
async fn test_generate_artifacts_recovers_fenced_output() {
    init_tracing();
    let server = MockServer::start().await;

    let fenced = "```json\n{\"data\": [{\"id\": 1}, {\"id\": 2}]}\n```";
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(fenced, 10, 20)))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(openai_config("openai", &server)).expect("build");
    let tracker = RetryTracker::new();

    let (records, usage) = provider
        .generate_artifacts(&request(), &tracker)
        .await
        .expect("artifacts");

    assert_eq!(records.len(), 2);
    assert_eq!(usage.endpoint_id, "GET /users");
    assert_eq!(usage.total_tokens, 30);
}

/// Unusable output fails as an invalid-format error carrying an excerpt.
#[tokio::test]
async fn test_generate_artifacts_rejects_prose() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(
            "I am sorry, I cannot generate test data today.",
            5,
            9,
        )))
        .mount(&server)
        .await;

    let provider = OpenAiProvider::new(openai_config("openai", &server)).expect("build");
    let tracker = RetryTracker::new();

    let error = provider
        .generate_artifacts(&request(), &tracker)
        .await
        .expect_err("must fail");
    match error {
        ForgeError::InvalidFormat { excerpt, .. } => {
            assert!(excerpt.expect("excerpt").contains("I am sorry"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

/// Ollama's non-streaming wire shape maps into the unified response.
#[tokio::test]
async fn test_ollama_generate() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"model": "llama3.2", "stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": r#"[{"id": 1}]"#,
            "done": true,
            "done_reason": "stop",
            "eval_count": 14,
            "prompt_eval_count": 6
        })))
        .mount(&server)
        .await;

    let provider = OllamaProvider::new(
        ProviderConfig::new("ollama", "llama3.2")
            .with_base_url(server.uri())
            .with_timeout(Duration::from_secs(5)),
    )
    .expect("build");
    let tracker = RetryTracker::new();

    let response = provider.generate(&request(), &tracker).await.expect("generate");
    assert_eq!(response.content, r#"[{"id": 1}]"#);
    let usage = response.usage.as_ref().expect("usage");
    assert_eq!(usage.prompt_tokens, 6);
    assert_eq!(usage.completion_tokens, 14);
    assert_eq!(usage.total_tokens, 20);
    assert_eq!(response.finish_reason(), Some("stop"));
}

/// Ollama streaming accumulates NDJSON frames until `done`.
#[tokio::test]
async fn test_ollama_streaming() {
    init_tracing();
    let server = MockServer::start().await;

    let ndjson = concat!(
        "{\"response\": \"[{\\\"id\\\"\", \"done\": false}\n",
        "{\"response\": \": 1}]\", \"done\": false}\n",
        "{\"response\": \"\", \"done\": true, \"eval_count\": 8, \"prompt_eval_count\": 3}\n",
    );
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(ndjson, "application/x-ndjson"),
        )
        .mount(&server)
        .await;

    let provider = OllamaProvider::new(
        ProviderConfig::new("ollama", "llama3.2")
            .with_base_url(server.uri())
            .with_streaming(true)
            .with_timeout(Duration::from_secs(5)),
    )
    .expect("build");
    let tracker = RetryTracker::new();

    let response = provider.generate(&request(), &tracker).await.expect("generate");
    assert_eq!(response.content, r#"[{"id": 1}]"#);
    let usage = response.usage.as_ref().expect("usage");
    assert_eq!(usage.completion_tokens, 8);
}

/// Health checks probe the model-listing endpoints.
#[tokio::test]
async fn test_health_checks() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .mount(&server)
        .await;

    let healthy = OpenAiProvider::new(openai_config("openai", &server)).expect("build");
    assert!(healthy.health_check().await);

    let unreachable = OpenAiProvider::new(
        ProviderConfig::new("openai", "m")
            .with_api_key("k")
            .with_base_url("http://127.0.0.1:1/v1")
            .with_timeout(Duration::from_secs(1)),
    )
    .expect("build");
    assert!(!unreachable.health_check().await);
}
