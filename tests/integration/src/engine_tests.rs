//! End-to-end engine tests: batch runs, throttling, aggregation.

use crate::helpers::*;
use forge_core::{EndpointDescriptor, ForgeError, GenerationRequest, HttpMethod};
use forge_engine::{EndpointJob, GenerationEngine};
use forge_routing::ManualMapping;
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn job(path: &str) -> EndpointJob {
    EndpointJob::new(
        EndpointDescriptor::new(HttpMethod::Get, path),
        GenerationRequest::new("generate test data"),
    )
}

/// Records request arrival times and holds each response open for `delay`.
struct RecordingResponder {
    arrivals: Arc<Mutex<Vec<Instant>>>,
    body: serde_json::Value,
    delay: Duration,
}

impl Respond for RecordingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.arrivals
            .lock()
            .expect("arrival log poisoned")
            .push(Instant::now());
        ResponseTemplate::new(200)
            .set_body_json(self.body.clone())
            .set_delay(self.delay)
    }
}

/// Peak overlap given each request stays in flight for `delay` after arrival.
fn peak_overlap(arrivals: &[Instant], delay: Duration) -> usize {
    arrivals
        .iter()
        .map(|a| {
            arrivals
                .iter()
                .filter(|b| **b >= *a && **b < *a + delay)
                .count()
        })
        .max()
        .unwrap_or(0)
}

/// Five simultaneous endpoints against a cap of two never exceed two in flight.
#[tokio::test]
async fn test_group_concurrency_capped() {
    init_tracing();
    let server = MockServer::start().await;
    let arrivals = Arc::new(Mutex::new(Vec::new()));
    let delay = Duration::from_millis(150);

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(RecordingResponder {
            arrivals: Arc::clone(&arrivals),
            body: completion_body(r#"[{"id": 1}]"#, 5, 5),
            delay,
        })
        .mount(&server)
        .await;

    let engine = GenerationEngine::builder()
        .provider(openai_config("openai", &server).with_max_concurrency(2))
        .registry(openai_registry(&["openai"]))
        .build()
        .expect("build engine");

    let report = engine
        .run(vec![job("/a"), job("/b"), job("/c"), job("/d"), job("/e")])
        .await;

    assert_eq!(report.successes(), 5);
    let arrivals = arrivals.lock().expect("arrival log poisoned");
    assert_eq!(arrivals.len(), 5);
    assert_eq!(peak_overlap(&arrivals, delay), 2);
}

/// Round robin spreads a batch across both providers' servers.
#[tokio::test]
async fn test_batch_spreads_across_providers() {
    init_tracing();
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(completion_body(r#"[{"id": 1}]"#, 10, 2)),
        )
        .expect(2)
        .mount(&server_a)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(completion_body(r#"[{"id": 2}]"#, 10, 3)),
        )
        .expect(2)
        .mount(&server_b)
        .await;

    let engine = GenerationEngine::builder()
        .provider(openai_config("pa", &server_a))
        .provider(openai_config("pb", &server_b))
        .registry(openai_registry(&["pa", "pb"]))
        .build()
        .expect("build engine");

    let report = engine
        .run(vec![job("/1"), job("/2"), job("/3"), job("/4")])
        .await;

    assert_eq!(report.successes(), 4);
    assert_eq!(report.stats.successful_calls, 4);
    assert_eq!(report.stats.total_prompt_tokens, 40);
    assert_eq!(report.stats.total_completion_tokens, 10);
}

/// A manual mapping strategy routes by path and the engine honors it.
#[tokio::test]
async fn test_manual_mapping_strategy_end_to_end() {
    init_tracing();
    let users_server = MockServer::start().await;
    let default_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(completion_body(r#"[{"id": 1}]"#, 1, 1)),
        )
        .expect(1)
        .mount(&users_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(completion_body(r#"[{"id": 2}]"#, 1, 1)),
        )
        .expect(1)
        .mount(&default_server)
        .await;

    let mapping = ManualMapping::parse(
        &["/users/*:users-backend".to_string()],
        Some("default-backend".to_string()),
    )
    .expect("parse mapping");

    let engine = GenerationEngine::builder()
        .provider(openai_config("users-backend", &users_server))
        .provider(openai_config("default-backend", &default_server))
        .strategy(Box::new(mapping))
        .registry(openai_registry(&["users-backend", "default-backend"]))
        .build()
        .expect("build engine");

    let report = engine.run(vec![job("/users/42"), job("/orders")]).await;

    assert_eq!(report.successes(), 2);
    assert_eq!(report.outcomes[0].provider.as_deref(), Some("users-backend"));
    assert_eq!(
        report.outcomes[1].provider.as_deref(),
        Some("default-backend")
    );
}

/// A dead primary with a healthy fallback still completes the batch, and the
/// failure accounting distinguishes the two.
#[tokio::test]
async fn test_engine_fallback_and_failure_accounting() {
    init_tracing();
    let dead = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&dead)
        .await;
    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(completion_body(r#"[{"id": 1}]"#, 2, 2)),
        )
        .mount(&healthy)
        .await;

    let engine = GenerationEngine::builder()
        .provider(openai_config("dead", &dead).with_max_retries(1))
        .provider(openai_config("healthy", &healthy))
        .strategy(Box::new(
            forge_routing::RoundRobin::new(vec!["dead".to_string()]).expect("strategy"),
        ))
        .registry(openai_registry(&["dead", "healthy"]))
        .fallback_chain(vec!["healthy".to_string()])
        .build()
        .expect("build engine");

    let report = engine.run(vec![job("/resilient")]).await;

    let outcome = &report.outcomes[0];
    assert!(outcome.is_success());
    assert_eq!(outcome.fallback_from.as_deref(), Some("dead"));
    assert_eq!(outcome.providers_tried, vec!["dead", "healthy"]);
    // HTTP retries against the dead primary show up in the retry report.
    assert!(outcome.retry.total_attempts >= 3);
}

/// Without a fallback chain, a dead provider fails its endpoints with the
/// aggregate error and the stats count the failures.
#[tokio::test]
async fn test_engine_surfaces_aggregate_failure() {
    init_tracing();
    let dead = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&dead)
        .await;

    let engine = GenerationEngine::builder()
        .provider(openai_config("dead", &dead).with_max_retries(0))
        .registry(openai_registry(&["dead"]))
        .build()
        .expect("build engine");

    let report = engine.run(vec![job("/doomed")]).await;

    assert_eq!(report.failures(), 1);
    assert_eq!(report.stats.failed_calls, 1);
    match &report.outcomes[0].result {
        Err(ForgeError::AllProvidersFailed { providers, .. }) => {
            assert_eq!(providers, &vec!["dead".to_string()]);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}
