//! Manual `path:provider` mappings.
//!
//! Rules are parsed once at construction and never mutated by lookups.
//! Lookup order: exact path match, then glob patterns in registration order,
//! then a `METHOD path` composite key, then the configured default.

use crate::strategy::AssignmentStrategy;
use forge_core::{EndpointDescriptor, ForgeError, ForgeResult};
use regex::Regex;
use std::collections::HashMap;
use tracing::debug;

/// One compiled glob rule.
struct PatternRule {
    source: String,
    regex: Regex,
    provider: String,
}

/// Explicit endpoint-to-provider mapping.
pub struct ManualMapping {
    exact: HashMap<String, String>,
    patterns: Vec<PatternRule>,
    composite: HashMap<String, String>,
    default_provider: Option<String>,
}

impl ManualMapping {
    /// Parse a rule list.
    ///
    /// Each rule is `key:provider` where the key is an exact path
    /// (`/products`), a glob pattern (`/users/*`, `?` matches one
    /// character), or a `METHOD path` composite (`GET /admin`).
    ///
    /// # Errors
    /// Returns a configuration error for a rule without a provider or an
    /// unparseable pattern.
    pub fn parse(rules: &[String], default_provider: Option<String>) -> ForgeResult<Self> {
        let mut exact = HashMap::new();
        let mut patterns = Vec::new();
        let mut composite = HashMap::new();

        for rule in rules {
            let Some((key, provider)) = rule.rsplit_once(':') else {
                return Err(ForgeError::configuration(format!(
                    "manual mapping rule '{rule}' is missing ':provider'"
                )));
            };
            let key = key.trim();
            let provider = provider.trim();
            if key.is_empty() || provider.is_empty() {
                return Err(ForgeError::configuration(format!(
                    "manual mapping rule '{rule}' has an empty key or provider"
                )));
            }

            if key.contains('*') || key.contains('?') {
                patterns.push(PatternRule {
                    source: key.to_string(),
                    regex: compile_glob(key)?,
                    provider: provider.to_string(),
                });
            } else if key.contains(' ') {
                composite.insert(key.to_string(), provider.to_string());
            } else {
                exact.insert(key.to_string(), provider.to_string());
            }
        }

        Ok(Self {
            exact,
            patterns,
            composite,
            default_provider,
        })
    }

    /// Look up the provider for an endpoint without going through the trait.
    ///
    /// # Errors
    /// Returns a configuration error when nothing matches and no default is
    /// configured.
    pub fn lookup(&self, endpoint: &EndpointDescriptor) -> ForgeResult<String> {
        if let Some(provider) = self.exact.get(&endpoint.path) {
            return Ok(provider.clone());
        }

        for rule in &self.patterns {
            if rule.regex.is_match(&endpoint.path) {
                debug!(
                    endpoint = %endpoint.id,
                    pattern = %rule.source,
                    provider = %rule.provider,
                    "matched glob rule"
                );
                return Ok(rule.provider.clone());
            }
        }

        let key = format!("{} {}", endpoint.method, endpoint.path);
        if let Some(provider) = self.composite.get(&key) {
            return Ok(provider.clone());
        }

        self.default_provider.clone().ok_or_else(|| {
            ForgeError::configuration(format!(
                "no manual mapping matches endpoint '{}' and no default provider is set",
                endpoint.id
            ))
        })
    }
}

impl AssignmentStrategy for ManualMapping {
    fn assign(&self, endpoint: &EndpointDescriptor) -> ForgeResult<String> {
        self.lookup(endpoint)
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

/// Compile a `*`/`?` glob into an anchored regex.
fn compile_glob(glob: &str) -> ForgeResult<Regex> {
    let escaped = regex::escape(glob).replace(r"\*", ".*").replace(r"\?", ".");
    Regex::new(&format!("^{escaped}$")).map_err(|error| {
        ForgeError::configuration(format!("invalid glob pattern '{glob}': {error}"))
    })
}
