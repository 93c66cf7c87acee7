//! Sync configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::prober::EndpointCandidate;
use crate::retry::{BackoffPolicy, RetryConfig};
use jobtrack_common::{Error, Result};
use jobtrack_storage::{BackendRegistry, KvBackend, StoreChain};

/// One storage tier: a registered backend name plus its options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    pub backend: String,
    #[serde(default)]
    pub options: Value,
}

impl TierConfig {
    pub fn new(backend: impl Into<String>, options: Value) -> Self {
        Self {
            backend: backend.into(),
            options,
        }
    }
}

/// Configuration for one sync context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Remote endpoints; lower priority is probed first.
    pub endpoints: Vec<EndpointCandidate>,
    /// Local storage tiers, highest priority first.
    pub tiers: Vec<TierConfig>,
    /// Periodic reconciliation interval.
    pub reconcile_interval_ms: u64,
    /// Background re-probe interval.
    pub probe_interval_ms: u64,
    /// Last-write marker polling interval.
    pub poll_fallback_ms: u64,
    /// Quiet period before a change notification triggers a pass.
    pub change_debounce_ms: u64,
    /// Per-candidate health check timeout.
    pub probe_timeout_ms: u64,
    /// Per-submission attempt timeout.
    pub attempt_timeout_ms: u64,
    /// Attempts per submission, including the first.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub retry_delay_ms: u64,
    pub backoff: BackoffPolicy,
    /// Consecutive failed attempts that force a re-probe.
    pub failure_threshold: u32,
    /// Age after which a record left in `Syncing` is retried.
    pub stale_syncing_after_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            tiers: vec![TierConfig::new("memory", Value::Null)],
            reconcile_interval_ms: 30_000,
            probe_interval_ms: 300_000,
            poll_fallback_ms: 3_000,
            change_debounce_ms: 500,
            probe_timeout_ms: 2_000,
            attempt_timeout_ms: 10_000,
            max_attempts: 3,
            retry_delay_ms: 1_000,
            backoff: BackoffPolicy::Fixed,
            failure_threshold: 3,
            stale_syncing_after_ms: 300_000,
        }
    }
}

impl SyncConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        let config: SyncConfig = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Invalid configuration {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON, creating parent directories.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(Error::Config("At least one storage tier is required".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        if self.failure_threshold == 0 {
            return Err(Error::Config("failure_threshold must be at least 1".to_string()));
        }

        let intervals = [
            ("reconcile_interval_ms", self.reconcile_interval_ms),
            ("probe_interval_ms", self.probe_interval_ms),
            ("poll_fallback_ms", self.poll_fallback_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("attempt_timeout_ms", self.attempt_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }

        if let BackoffPolicy::Exponential { multiplier, .. } = self.backoff {
            if multiplier.is_nan() || multiplier < 1.0 {
                return Err(Error::Config(
                    "backoff multiplier must be at least 1.0".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Resolve the configured tiers through `registry` into a store chain.
    pub fn build_chain(&self, registry: &BackendRegistry) -> Result<StoreChain> {
        let backends = self
            .tiers
            .iter()
            .map(|tier| registry.resolve(&tier.backend, &tier.options))
            .collect::<Result<Vec<Arc<dyn KvBackend>>>>()?;
        StoreChain::new(backends)
    }

    /// Retry policy for submissions.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_attempts)
            .with_delay(self.retry_delay())
            .with_attempt_timeout(self.attempt_timeout())
            .with_backoff(self.backoff)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn poll_fallback(&self) -> Duration {
        Duration::from_millis(self.poll_fallback_ms)
    }

    pub fn change_debounce(&self) -> Duration {
        Duration::from_millis(self.change_debounce_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn stale_syncing_after(&self) -> Duration {
        Duration::from_millis(self.stale_syncing_after_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();

        assert_eq!(config.reconcile_interval(), Duration::from_secs(30));
        assert_eq!(config.probe_interval(), Duration::from_secs(300));
        assert_eq!(config.poll_fallback(), Duration::from_secs(3));
        assert_eq!(config.probe_timeout(), Duration::from_secs(2));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff, BackoffPolicy::Fixed);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: SyncConfig = serde_json::from_value(json!({
            "endpoints": [{"address": "http://localhost:3000", "priority": 0}],
            "max_attempts": 5
        }))
        .unwrap();

        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retry_delay_ms, 1_000);
        assert_eq!(config.tiers[0].backend, "memory");
    }

    #[test]
    fn test_backoff_from_json() {
        let config: SyncConfig = serde_json::from_value(json!({
            "backoff": {"kind": "exponential", "multiplier": 2.0, "max_delay_ms": 8000, "jitter": false}
        }))
        .unwrap();

        let retry = config.retry_config();
        assert_eq!(retry.delay_for_retry(2), Duration::from_secs(4));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SyncConfig::default();
        config.tiers.clear();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = SyncConfig::default();
        config.poll_fallback_ms = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = SyncConfig::default();
        config.backoff = BackoffPolicy::Exponential {
            multiplier: 0.5,
            max_delay_ms: 1_000,
            jitter: false,
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("sync.json");

        let mut config = SyncConfig::default();
        config.tiers = vec![TierConfig::new(
            "file",
            json!({"root": dir.path().join("data")}),
        )];
        config.save(&path).await.unwrap();

        let loaded = SyncConfig::load(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_build_chain_unknown_backend() {
        let mut config = SyncConfig::default();
        config.tiers = vec![TierConfig::new("floppy", Value::Null)];

        assert!(config.build_chain(&BackendRegistry::with_defaults()).is_err());
    }

    #[tokio::test]
    async fn test_build_chain_in_order() {
        let dir = TempDir::new().unwrap();
        let mut config = SyncConfig::default();
        config.tiers = vec![
            TierConfig::new("memory", Value::Null),
            TierConfig::new("sqlite", json!({"path": dir.path().join("kv.db")})),
        ];

        let chain = config.build_chain(&BackendRegistry::with_defaults()).unwrap();
        let names: Vec<String> = chain
            .backends()
            .iter()
            .map(|b| b.name().to_string())
            .collect();
        assert_eq!(names.len(), 2);
        assert_eq!(names[1], "sqlite");
    }
}
