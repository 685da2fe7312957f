//! Fallback chain tests across two simulated backends.

use crate::helpers::*;
use forge_core::{ForgeError, GenerationRequest, RetryTracker};
use forge_engine::{FallbackConfig, FallbackHandler};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn failing_server(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(status)
                .set_body_json(json!({"error": {"message": "backend down"}})),
        )
        .mount(&server)
        .await;
    server
}

async fn succeeding_server(content: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(content, 8, 8)))
        .mount(&server)
        .await;
    server
}

fn handler(configs: HashMap<String, forge_core::ProviderConfig>, chain: Vec<String>) -> FallbackHandler {
    let names: Vec<&str> = configs.keys().map(String::as_str).collect();
    FallbackHandler::new(
        openai_registry(&names),
        configs,
        FallbackConfig {
            chain,
            rate_limit_delay: Duration::from_millis(10),
            budget: None,
        },
    )
}

/// A failing primary falls through to a healthy fallback, annotated.
#[tokio::test]
async fn test_failing_primary_falls_back() {
    init_tracing();
    let p1 = failing_server(400).await; // non-retryable, advances fast
    let p2 = succeeding_server(r#"[{"id": 1, "name": "case"}]"#).await;

    let mut configs = HashMap::new();
    configs.insert("p1".to_string(), openai_config("p1", &p1).with_max_retries(0));
    configs.insert("p2".to_string(), openai_config("p2", &p2));
    let handler = handler(configs, vec!["p2".to_string()]);

    let tracker = RetryTracker::new();
    let request = GenerationRequest::new("generate").with_endpoint_id("GET /orders");

    let outcome = handler
        .generate_with_fallback(&request, "p1", &tracker)
        .await
        .expect("fallback success");

    assert_eq!(outcome.provider, "p2");
    assert_eq!(outcome.fallback_from.as_deref(), Some("p1"));
    assert_eq!(outcome.providers_tried, vec!["p1", "p2"]);
    assert_eq!(outcome.artifacts.len(), 1);
    assert_eq!(outcome.usage.endpoint_id, "GET /orders");
}

/// When every provider fails, one aggregate error names them all.
#[tokio::test]
async fn test_exhausted_chain_aggregates() {
    init_tracing();
    let p1 = failing_server(400).await;
    let p2 = failing_server(400).await;

    let mut configs = HashMap::new();
    configs.insert("p1".to_string(), openai_config("p1", &p1).with_max_retries(0));
    configs.insert("p2".to_string(), openai_config("p2", &p2).with_max_retries(0));
    let handler = handler(configs, vec!["p2".to_string()]);

    let tracker = RetryTracker::new();
    let request = GenerationRequest::new("generate").with_endpoint_id("GET /orders");

    let error = handler
        .generate_with_fallback(&request, "p1", &tracker)
        .await
        .expect_err("must fail");

    match error {
        ForgeError::AllProvidersFailed {
            providers,
            last_error,
            retry,
        } => {
            assert_eq!(providers, vec!["p1", "p2"]);
            assert!(last_error.to_string().contains("backend down"));
            let report = retry.expect("retry report");
            assert!(report.total_attempts >= 2);
        }
        other => panic!("unexpected error: {other}"),
    }
}

/// A rate-limited primary pauses briefly and then tries the next provider.
#[tokio::test]
async fn test_rate_limited_primary_advances() {
    init_tracing();
    let p1 = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "0")
                .set_body_json(json!({"error": {"message": "slow down"}})),
        )
        .mount(&p1)
        .await;
    let p2 = succeeding_server(r#"[{"id": 2}]"#).await;

    let mut configs = HashMap::new();
    configs.insert("p1".to_string(), openai_config("p1", &p1).with_max_retries(0));
    configs.insert("p2".to_string(), openai_config("p2", &p2));
    let handler = handler(configs, vec!["p2".to_string()]);

    let tracker = RetryTracker::new();
    let request = GenerationRequest::new("generate").with_endpoint_id("GET /orders");

    let outcome = handler
        .generate_with_fallback(&request, "p1", &tracker)
        .await
        .expect("fallback success");
    assert_eq!(outcome.provider, "p2");
}

/// An auth failure is terminal for its provider but not for the chain.
#[tokio::test]
async fn test_auth_failure_advances_to_next_provider() {
    init_tracing();
    let p1 = failing_server(401).await;
    let p2 = succeeding_server(r#"[{"id": 3}]"#).await;

    let mut configs = HashMap::new();
    // Even with retries budgeted, an auth failure must not burn them.
    configs.insert("p1".to_string(), openai_config("p1", &p1).with_max_retries(3));
    configs.insert("p2".to_string(), openai_config("p2", &p2));
    let handler = handler(configs, vec!["p2".to_string()]);

    let tracker = RetryTracker::new();
    let request = GenerationRequest::new("generate").with_endpoint_id("GET /orders");

    let outcome = handler
        .generate_with_fallback(&request, "p1", &tracker)
        .await
        .expect("fallback success");

    assert_eq!(outcome.provider, "p2");
    // One HTTP attempt for p1 (no retries on auth), one for p2.
    assert_eq!(tracker.attempt_count(forge_core::RetryLayer::Http), 2);
}
