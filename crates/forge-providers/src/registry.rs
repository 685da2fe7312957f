//! Provider registry.
//!
//! An explicit service container, not a process-global singleton: the engine
//! owns one registry and passes it by reference to whatever needs provider
//! lookup. The instance cache is the only shared mutable structure in the
//! forge; inserts go through the map's entry API so at most one adapter
//! instance is ever constructed per name, even under concurrent first use.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use forge_core::{ForgeError, ForgeResult, Provider, ProviderConfig};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Constructor for one backend family.
pub type ProviderFactory =
    Arc<dyn Fn(ProviderConfig) -> ForgeResult<Arc<dyn Provider>> + Send + Sync>;

/// Cache of instantiated provider adapters, keyed by provider name.
pub struct ProviderRegistry {
    factories: RwLock<HashMap<String, ProviderFactory>>,
    instances: DashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Create an empty registry with no registered backends.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            instances: DashMap::new(),
        }
    }

    /// Create a registry with the built-in backend families registered.
    ///
    /// The OpenAI-compatible adapter serves the `openai`, `deepseek`, and
    /// `qwen` names; `ollama` gets the local-generation adapter. Additional
    /// names can be registered on top.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();

        #[cfg(feature = "openai")]
        {
            for name in ["openai", "deepseek", "qwen"] {
                registry.register(name, |config| {
                    Ok(Arc::new(crate::openai::OpenAiProvider::new(config)?) as Arc<dyn Provider>)
                });
            }
        }

        #[cfg(feature = "ollama")]
        {
            registry.register("ollama", |config| {
                Ok(Arc::new(crate::ollama::OllamaProvider::new(config)?) as Arc<dyn Provider>)
            });
        }

        registry
    }

    /// Register a factory for a provider name, replacing any previous one.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(ProviderConfig) -> ForgeResult<Arc<dyn Provider>> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(provider = %name, "registered provider factory");
        self.factories.write().insert(name, Arc::new(factory));
    }

    /// Names the registry can construct or has already constructed.
    #[must_use]
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        for entry in &self.instances {
            if !names.contains(entry.key()) {
                names.push(entry.key().clone());
            }
        }
        names.sort();
        names
    }

    /// Whether a name has a factory or live instance.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.instances.contains_key(name) || self.factories.read().contains_key(name)
    }

    /// Return the cached adapter for `name`, constructing it on first use.
    ///
    /// The configuration is validated before construction and the adapter's
    /// own validation runs before it is cached; a failure on either path
    /// leaves the cache untouched.
    ///
    /// # Errors
    /// Returns [`ForgeError::ProviderNotFound`] for an unregistered name and
    /// a configuration error when validation or construction fails.
    pub fn ensure(&self, name: &str, config: &ProviderConfig) -> ForgeResult<Arc<dyn Provider>> {
        if let Some(instance) = self.instances.get(name) {
            return Ok(Arc::clone(instance.value()));
        }

        let factory = { self.factories.read().get(name).cloned() };
        let Some(factory) = factory else {
            return Err(ForgeError::ProviderNotFound {
                name: name.to_string(),
                registered: self.registered_names(),
            });
        };

        config.validate()?;

        // The entry holds the shard lock, serializing first-use construction.
        match self.instances.entry(name.to_string()) {
            Entry::Occupied(existing) => Ok(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                let instance = factory(config.clone())?;
                instance.validate_config()?;
                info!(provider = %name, model = %instance.model(), "provider instantiated");
                slot.insert(Arc::clone(&instance));
                Ok(instance)
            }
        }
    }

    /// Return an already-constructed adapter.
    ///
    /// # Errors
    /// Returns [`ForgeError::ProviderNotFound`] when no instance exists yet.
    pub fn get(&self, name: &str) -> ForgeResult<Arc<dyn Provider>> {
        self.instances
            .get(name)
            .map(|instance| Arc::clone(instance.value()))
            .ok_or_else(|| ForgeError::ProviderNotFound {
                name: name.to_string(),
                registered: self.registered_names(),
            })
    }

    /// Release every cached adapter's resources and clear the cache.
    ///
    /// The only supported teardown path for the registry's shared state.
    pub async fn close_all(&self) {
        let instances: Vec<Arc<dyn Provider>> = self
            .instances
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.instances.clear();
        for instance in instances {
            debug!(provider = %instance.name(), "closing provider");
            instance.close().await;
        }
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
