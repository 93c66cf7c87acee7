//! Backend registry for building storage tiers from configuration.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::KvBackend;
use jobtrack_common::{Error, Result};

/// Factory function type for creating backends.
pub type BackendFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn KvBackend>> + Send + Sync>;

/// Registry for storage backend factories.
///
/// Allows dynamic registration and resolution of backends by name and
/// configuration.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Create a registry with the built-in backends.
    ///
    /// - `memory`: options `name` (string), `quota_bytes` (integer)
    /// - `file`: options `root` (path, required)
    /// - `sqlite`: options `path` (path, required; `:memory:` allowed)
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.factories.insert(
            "memory".to_string(),
            Box::new(|config: &Value| -> Result<Arc<dyn KvBackend>> {
                let name = config
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("memory");
                let mut backend = crate::memory::MemoryBackend::named(name);
                if let Some(quota) = config.get("quota_bytes").and_then(|v| v.as_u64()) {
                    backend = backend.with_quota(quota as usize);
                }
                Ok(Arc::new(backend))
            }),
        );

        registry.factories.insert(
            "file".to_string(),
            Box::new(|config: &Value| -> Result<Arc<dyn KvBackend>> {
                let root = required_str(config, "file", "root")?;
                Ok(Arc::new(crate::local::FileBackend::new(root)?))
            }),
        );

        registry.factories.insert(
            "sqlite".to_string(),
            Box::new(|config: &Value| -> Result<Arc<dyn KvBackend>> {
                let path = required_str(config, "sqlite", "path")?;
                Ok(Arc::new(crate::sqlite::SqliteBackend::open(path)?))
            }),
        );

        registry
    }

    /// Register a backend factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: BackendFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::InvalidInput(format!(
                "Backend '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a backend by name and configuration.
    ///
    /// # Errors
    /// - Backend not registered
    /// - Configuration invalid
    pub fn resolve(&self, name: &str, config: &Value) -> Result<Arc<dyn KvBackend>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Backend '{}' is not registered", name)))?;
        factory(config)
    }

    /// Get list of registered backend names.
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a backend is registered.
    pub fn has_backend(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn required_str<'a>(config: &'a Value, backend: &str, field: &str) -> Result<&'a str> {
    config.get(field).and_then(|v| v.as_str()).ok_or_else(|| {
        Error::Config(format!("{} backend requires '{}' option", backend, field))
    })
}
