//! Complexity-based assignment.
//!
//! Scores an endpoint from its method and shape richness, then routes each
//! complexity band to a preferred provider tier: simple endpoints to a
//! cheap/local backend, medium to a balanced one, complex to the most
//! capable one.

use crate::strategy::AssignmentStrategy;
use forge_core::{EndpointDescriptor, ForgeError, ForgeResult, HttpMethod};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// Nesting deeper than this contributes nothing further to the score.
const MAX_DEPTH_SCORE: u32 = 5;

/// Complexity band of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplexityTier {
    /// Score <= 5.
    Simple,
    /// Score <= 10.
    Medium,
    /// Everything above.
    Complex,
}

impl ComplexityTier {
    /// Band for a computed score.
    #[must_use]
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=5 => Self::Simple,
            6..=10 => Self::Medium,
            _ => Self::Complex,
        }
    }
}

/// Preferred provider per complexity band.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TierProviders {
    /// Backend for simple endpoints (cheap/local).
    #[serde(default)]
    pub simple: Option<String>,
    /// Backend for medium endpoints (balanced).
    #[serde(default)]
    pub medium: Option<String>,
    /// Backend for complex endpoints (highest capability).
    #[serde(default)]
    pub complex: Option<String>,
}

impl TierProviders {
    /// Set the simple-tier backend.
    #[must_use]
    pub fn with_simple(mut self, provider: impl Into<String>) -> Self {
        self.simple = Some(provider.into());
        self
    }

    /// Set the medium-tier backend.
    #[must_use]
    pub fn with_medium(mut self, provider: impl Into<String>) -> Self {
        self.medium = Some(provider.into());
        self
    }

    /// Set the complex-tier backend.
    #[must_use]
    pub fn with_complex(mut self, provider: impl Into<String>) -> Self {
        self.complex = Some(provider.into());
        self
    }

    fn for_tier(&self, tier: ComplexityTier) -> Option<&str> {
        match tier {
            ComplexityTier::Simple => self.simple.as_deref(),
            ComplexityTier::Medium => self.medium.as_deref(),
            ComplexityTier::Complex => self.complex.as_deref(),
        }
    }
}

/// Compute the integer complexity score for an endpoint.
///
/// Write methods score higher than reads; declared parameters, body and
/// response schemas, and their nesting depth all add to the score.
#[must_use]
pub fn complexity_score(endpoint: &EndpointDescriptor) -> u32 {
    let mut score = match endpoint.method {
        HttpMethod::Get | HttpMethod::Head | HttpMethod::Options => 1,
        HttpMethod::Delete => 2,
        HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch => 3,
    };

    score += endpoint.parameters.len() as u32;
    score += endpoint
        .parameters
        .iter()
        .filter(|p| p.required)
        .count() as u32;

    if let Some(body) = &endpoint.request_body {
        score += 2 + nesting_depth(body);
    }
    if let Some(schema) = &endpoint.response_schema {
        score += 1 + nesting_depth(schema);
    }
    score
}

/// Depth of nested objects/arrays in a schema value, capped.
fn nesting_depth(value: &Value) -> u32 {
    fn depth(value: &Value) -> u32 {
        match value {
            Value::Object(map) => 1 + map.values().map(depth).max().unwrap_or(0),
            Value::Array(items) => 1 + items.iter().map(depth).max().unwrap_or(0),
            _ => 0,
        }
    }
    depth(value).min(MAX_DEPTH_SCORE)
}

/// Assigns endpoints to providers by complexity band.
pub struct ComplexityBased {
    providers: Vec<String>,
    tiers: TierProviders,
}

impl ComplexityBased {
    /// Create a complexity-based strategy.
    ///
    /// `providers` is the full configured list; a tier without a backend (or
    /// pointing at an unconfigured one) falls back to the first entry.
    ///
    /// # Errors
    /// Returns a configuration error for an empty provider list.
    pub fn new(providers: Vec<String>, tiers: TierProviders) -> ForgeResult<Self> {
        if providers.is_empty() {
            return Err(ForgeError::configuration(
                "complexity strategy needs at least one provider",
            ));
        }
        Ok(Self { providers, tiers })
    }
}

impl AssignmentStrategy for ComplexityBased {
    fn assign(&self, endpoint: &EndpointDescriptor) -> ForgeResult<String> {
        let score = complexity_score(endpoint);
        let tier = ComplexityTier::from_score(score);

        let preferred = self
            .tiers
            .for_tier(tier)
            .filter(|name| self.providers.iter().any(|p| p == name));
        let chosen = preferred.unwrap_or_else(|| self.providers[0].as_str());

        debug!(
            endpoint = %endpoint.id,
            score = score,
            tier = ?tier,
            provider = %chosen,
            "assigned by complexity"
        );
        Ok(chosen.to_string())
    }

    fn name(&self) -> &'static str {
        "complexity"
    }
}
