//! Batch orchestration.
//!
//! The engine assigns a provider to each endpoint (manual override first,
//! then the configured strategy), groups endpoints by provider, and runs the
//! groups fully in parallel — each under its own throttle, so one provider's
//! backpressure never stalls another's. Every endpoint operation owns a
//! retry tracker and merges its usage into the shared statistics exactly
//! once.

use crate::fallback::{FallbackConfig, FallbackHandler};
use forge_core::{
    EndpointDescriptor, ForgeError, ForgeResult, GenerationRequest, ProviderConfig, RetryLayer,
    RetryReport, RetryTracker, TokenStatistics,
};
use forge_providers::ProviderRegistry;
use forge_resilience::{Throttle, ThrottleConfig};
use forge_routing::{AssignmentStrategy, RoundRobin};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Fallback worker cap when neither the config nor the adapter can say.
const FALLBACK_WORKERS: usize = 2;

/// One unit of work for the engine.
#[derive(Debug, Clone)]
pub struct EndpointJob {
    /// The endpoint to generate test data for.
    pub endpoint: EndpointDescriptor,
    /// The prepared generation request (prompt built by collaborating code).
    pub request: GenerationRequest,
    /// Explicit provider choice; wins over the assignment strategy.
    pub provider_override: Option<String>,
}

impl EndpointJob {
    /// Create a job with no override.
    #[must_use]
    pub fn new(endpoint: EndpointDescriptor, request: GenerationRequest) -> Self {
        Self {
            endpoint,
            request,
            provider_override: None,
        }
    }

    /// Pin the job to a provider.
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider_override = Some(provider.into());
        self
    }
}

/// Result of one endpoint's operation.
#[derive(Debug)]
pub struct EndpointOutcome {
    /// Endpoint the outcome belongs to.
    pub endpoint_id: String,
    /// Provider that produced the result, when one succeeded.
    pub provider: Option<String>,
    /// The primary provider, when the result came from a fallback.
    pub fallback_from: Option<String>,
    /// Providers tried, in order.
    pub providers_tried: Vec<String>,
    /// Recovered records, or the error that ended the operation.
    pub result: Result<Vec<Value>, ForgeError>,
    /// Retry statistics for the whole operation.
    pub retry: RetryReport,
}

impl EndpointOutcome {
    /// Whether the operation produced records.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Aggregated result of one batch run.
#[derive(Debug)]
pub struct BatchReport {
    /// Per-endpoint outcomes, in submission order.
    pub outcomes: Vec<EndpointOutcome>,
    /// Token usage and retry statistics across the batch.
    pub stats: TokenStatistics,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

impl BatchReport {
    /// Number of endpoints that produced records.
    #[must_use]
    pub fn successes(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    /// Number of endpoints that failed.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.outcomes.len() - self.successes()
    }
}

/// Builder for [`GenerationEngine`].
pub struct GenerationEngineBuilder {
    providers: Vec<ProviderConfig>,
    strategy: Option<Box<dyn AssignmentStrategy>>,
    registry: Option<Arc<ProviderRegistry>>,
    fallback_chain: Vec<String>,
    rate_limit_delay: Duration,
    endpoint_budget: Option<Duration>,
}

impl GenerationEngineBuilder {
    fn new() -> Self {
        Self {
            providers: Vec::new(),
            strategy: None,
            registry: None,
            fallback_chain: Vec::new(),
            rate_limit_delay: Duration::from_secs(5),
            endpoint_budget: None,
        }
    }

    /// Add a provider configuration.
    #[must_use]
    pub fn provider(mut self, config: ProviderConfig) -> Self {
        self.providers.push(config);
        self
    }

    /// Set the assignment strategy (round robin over the configured
    /// providers when unset).
    #[must_use]
    pub fn strategy(mut self, strategy: Box<dyn AssignmentStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Use a custom registry (the built-in backend families when unset).
    #[must_use]
    pub fn registry(mut self, registry: Arc<ProviderRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the fallback chain tried after each endpoint's primary provider.
    #[must_use]
    pub fn fallback_chain(mut self, chain: Vec<String>) -> Self {
        self.fallback_chain = chain;
        self
    }

    /// Delay before advancing past a rate-limited provider.
    #[must_use]
    pub fn rate_limit_delay(mut self, delay: Duration) -> Self {
        self.rate_limit_delay = delay;
        self
    }

    /// Total time budget for one endpoint's operation across all providers.
    #[must_use]
    pub fn endpoint_budget(mut self, budget: Duration) -> Self {
        self.endpoint_budget = Some(budget);
        self
    }

    /// Build the engine.
    ///
    /// # Errors
    /// Returns a configuration error when no provider is configured or a
    /// configuration fails validation.
    pub fn build(self) -> ForgeResult<GenerationEngine> {
        if self.providers.is_empty() {
            return Err(ForgeError::configuration(
                "the engine needs at least one provider",
            ));
        }

        let mut configs = HashMap::new();
        let mut names = Vec::new();
        for config in self.providers {
            config.validate()?;
            if configs.insert(config.name.clone(), config.clone()).is_some() {
                return Err(ForgeError::configuration(format!(
                    "provider '{}' is configured twice",
                    config.name
                )));
            }
            names.push(config.name);
        }

        let strategy: Box<dyn AssignmentStrategy> = match self.strategy {
            Some(strategy) => strategy,
            None => Box::new(RoundRobin::new(names)?),
        };
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ProviderRegistry::with_builtins()));

        let fallback = FallbackHandler::new(
            Arc::clone(&registry),
            configs.clone(),
            FallbackConfig {
                chain: self.fallback_chain,
                rate_limit_delay: self.rate_limit_delay,
                budget: self.endpoint_budget,
            },
        );

        Ok(GenerationEngine {
            registry,
            configs,
            strategy,
            fallback,
            stats: Arc::new(Mutex::new(TokenStatistics::new())),
        })
    }
}

/// Multi-provider generation engine.
pub struct GenerationEngine {
    registry: Arc<ProviderRegistry>,
    configs: HashMap<String, ProviderConfig>,
    strategy: Box<dyn AssignmentStrategy>,
    fallback: FallbackHandler,
    stats: Arc<Mutex<TokenStatistics>>,
}

struct Assigned {
    index: usize,
    endpoint_id: String,
    request: GenerationRequest,
}

impl GenerationEngine {
    /// Start building an engine.
    #[must_use]
    pub fn builder() -> GenerationEngineBuilder {
        GenerationEngineBuilder::new()
    }

    /// Snapshot of the accumulated statistics.
    #[must_use]
    pub fn stats(&self) -> TokenStatistics {
        self.stats.lock().clone()
    }

    /// The registry this engine owns.
    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Release every provider's resources.
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }

    /// Worker cap for one provider's group.
    fn workers_for(&self, name: &str, config: &ProviderConfig) -> usize {
        if let Some(workers) = config.max_concurrency {
            return workers;
        }
        // The adapter knows its family's default.
        self.registry
            .ensure(name, config)
            .map_or(FALLBACK_WORKERS, |provider| provider.max_concurrency())
    }

    /// Run a batch of endpoint jobs to completion.
    pub async fn run(&self, jobs: Vec<EndpointJob>) -> BatchReport {
        let started = Instant::now();
        let total = jobs.len();
        let mut outcomes: Vec<Option<EndpointOutcome>> = Vec::new();
        outcomes.resize_with(total, || None);

        // Assignment: manual override wins, then the strategy.
        let mut groups: HashMap<String, Vec<Assigned>> = HashMap::new();
        for (index, job) in jobs.into_iter().enumerate() {
            let assigned = match &job.provider_override {
                Some(name) => Ok(name.clone()),
                None => self.strategy.assign(&job.endpoint),
            };

            match assigned {
                Ok(name) if self.configs.contains_key(&name) => {
                    let mut request = job.request;
                    if request.endpoint_id.is_empty() {
                        request.endpoint_id = job.endpoint.id.clone();
                    }
                    debug!(endpoint = %job.endpoint.id, provider = %name, "assigned");
                    groups.entry(name).or_default().push(Assigned {
                        index,
                        endpoint_id: job.endpoint.id,
                        request,
                    });
                }
                Ok(name) => {
                    outcomes[index] = Some(EndpointOutcome {
                        endpoint_id: job.endpoint.id,
                        provider: None,
                        fallback_from: None,
                        providers_tried: Vec::new(),
                        result: Err(ForgeError::ProviderNotFound {
                            name,
                            registered: self.configs.keys().cloned().collect(),
                        }),
                        retry: RetryTracker::new().report(),
                    });
                }
                Err(error) => {
                    outcomes[index] = Some(EndpointOutcome {
                        endpoint_id: job.endpoint.id,
                        provider: None,
                        fallback_from: None,
                        providers_tried: Vec::new(),
                        result: Err(error),
                        retry: RetryTracker::new().report(),
                    });
                }
            }
        }

        // Each provider group runs in parallel under its own throttle.
        let group_futures = groups.into_iter().map(|(name, assigned)| {
            let config = &self.configs[&name];
            let workers = self.workers_for(&name, config);
            let throttle = Throttle::new(ThrottleConfig {
                max_workers: workers,
                rate_limit: config.rate_limit,
            });
            info!(
                provider = %name,
                endpoints = assigned.len(),
                workers = workers,
                "starting provider group"
            );

            async move {
                let throttle = &throttle;
                let name = &name;
                let tasks = assigned.into_iter().map(|work| async move {
                    let permit = throttle.acquire().await;
                    let tracker = RetryTracker::new();
                    let outcome = match permit {
                        Ok(_permit) => {
                            self.run_one(&work.request, name, &work.endpoint_id, &tracker)
                                .await
                        }
                        Err(error) => {
                            self.stats.lock().record_failure(&work.endpoint_id, 0);
                            EndpointOutcome {
                                endpoint_id: work.endpoint_id.clone(),
                                provider: None,
                                fallback_from: None,
                                providers_tried: Vec::new(),
                                result: Err(error),
                                retry: tracker.report(),
                            }
                        }
                    };
                    (work.index, outcome)
                });
                futures::future::join_all(tasks).await
            }
        });

        for group in futures::future::join_all(group_futures).await {
            for (index, outcome) in group {
                outcomes[index] = Some(outcome);
            }
        }

        let outcomes: Vec<EndpointOutcome> = outcomes
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| EndpointOutcome {
                    endpoint_id: format!("job {index}"),
                    provider: None,
                    fallback_from: None,
                    providers_tried: Vec::new(),
                    result: Err(ForgeError::internal("job produced no outcome")),
                    retry: RetryTracker::new().report(),
                })
            })
            .collect();

        let stats = self.stats.lock().clone();
        let report = BatchReport {
            outcomes,
            stats,
            elapsed: started.elapsed(),
        };
        info!(
            total = total,
            successes = report.successes(),
            failures = report.failures(),
            elapsed_ms = report.elapsed.as_millis(),
            "batch finished"
        );
        report
    }

    /// Drive one endpoint through the fallback handler and record its usage.
    async fn run_one(
        &self,
        request: &GenerationRequest,
        primary: &str,
        endpoint_id: &str,
        tracker: &RetryTracker,
    ) -> EndpointOutcome {
        match self
            .fallback
            .generate_with_fallback(request, primary, tracker)
            .await
        {
            Ok(outcome) => {
                // The one atomic merge into the shared aggregate.
                self.stats.lock().add_usage(&outcome.usage);
                EndpointOutcome {
                    endpoint_id: endpoint_id.to_string(),
                    provider: Some(outcome.provider),
                    fallback_from: outcome.fallback_from,
                    providers_tried: outcome.providers_tried,
                    result: Ok(outcome.artifacts),
                    retry: tracker.report(),
                }
            }
            Err(error) => {
                warn!(endpoint = %endpoint_id, error = %error, "endpoint failed");
                self.stats
                    .lock()
                    .record_failure(endpoint_id, tracker.retries(RetryLayer::Http));
                EndpointOutcome {
                    endpoint_id: endpoint_id.to_string(),
                    provider: None,
                    fallback_from: None,
                    providers_tried: Vec::new(),
                    result: Err(error),
                    retry: tracker.report(),
                }
            }
        }
    }
}
