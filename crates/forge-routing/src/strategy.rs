//! The assignment strategy trait and its config-driven factory.

use crate::complexity::{ComplexityBased, TierProviders};
use crate::manual::ManualMapping;
use crate::random::Random;
use crate::round_robin::RoundRobin;
use forge_core::{EndpointDescriptor, ForgeError, ForgeResult};
use serde::Deserialize;

/// Policy that maps an endpoint to a provider name for one request.
pub trait AssignmentStrategy: Send + Sync {
    /// Pick the provider for `endpoint`.
    ///
    /// # Errors
    /// Returns a configuration error when no provider can be chosen.
    fn assign(&self, endpoint: &EndpointDescriptor) -> ForgeResult<String>;

    /// Reset internal state (a no-op for stateless strategies).
    fn reset(&self) {}

    /// Stable strategy name for logs.
    fn name(&self) -> &'static str;
}

/// Which strategy variant to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Rotate through providers in order.
    RoundRobin,
    /// Pick uniformly at random.
    Random,
    /// Pick by endpoint complexity tier.
    Complexity,
    /// Follow explicit `path:provider` rules.
    Manual,
}

/// Deserializable strategy configuration handed in by collaborating code.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    /// Variant to build.
    pub kind: StrategyKind,
    /// Providers available to the strategy, in configuration order.
    pub providers: Vec<String>,
    /// Tier mapping for [`StrategyKind::Complexity`].
    #[serde(default)]
    pub tiers: Option<TierProviders>,
    /// `path:provider` rules for [`StrategyKind::Manual`].
    #[serde(default)]
    pub rules: Vec<String>,
    /// Default provider for [`StrategyKind::Manual`].
    #[serde(default)]
    pub default_provider: Option<String>,
}

impl StrategyConfig {
    /// Configuration for a round-robin strategy.
    #[must_use]
    pub fn round_robin(providers: Vec<String>) -> Self {
        Self {
            kind: StrategyKind::RoundRobin,
            providers,
            tiers: None,
            rules: Vec::new(),
            default_provider: None,
        }
    }
}

/// Build a strategy from its configuration.
///
/// # Errors
/// Returns a configuration error when the configuration is incomplete for
/// the requested variant (no providers, unparseable rules, ...).
pub fn build_strategy(config: &StrategyConfig) -> ForgeResult<Box<dyn AssignmentStrategy>> {
    match config.kind {
        StrategyKind::RoundRobin => Ok(Box::new(RoundRobin::new(config.providers.clone())?)),
        StrategyKind::Random => Ok(Box::new(Random::new(config.providers.clone())?)),
        StrategyKind::Complexity => {
            let tiers = config.tiers.clone().ok_or_else(|| {
                ForgeError::configuration("complexity strategy requires a tier mapping")
            })?;
            Ok(Box::new(ComplexityBased::new(config.providers.clone(), tiers)?))
        }
        StrategyKind::Manual => Ok(Box::new(ManualMapping::parse(
            &config.rules,
            config.default_provider.clone(),
        )?)),
    }
}
