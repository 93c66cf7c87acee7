//! In-memory key-value backend.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tokio::sync::broadcast;

use crate::backend::{ChangeEvent, KvBackend};
use jobtrack_common::{Error, Result};

/// Capacity of the change broadcast; slow subscribers observe `Lagged`.
const EVENT_CAPACITY: usize = 256;

/// In-memory key-value backend.
///
/// Useful for testing and for contexts sharing one process: every context
/// holding the same `Arc<MemoryBackend>` sees the same data and receives
/// native change events for each write. All data is lost on drop.
pub struct MemoryBackend {
    name: String,
    entries: RwLock<BTreeMap<String, String>>,
    events: broadcast::Sender<ChangeEvent>,
    available: AtomicBool,
    fail_writes: AtomicBool,
    quota_bytes: Option<usize>,
}

impl MemoryBackend {
    /// Create a new empty memory backend.
    pub fn new() -> Self {
        Self::named("memory")
    }

    /// Create a new empty memory backend with a custom name.
    pub fn named(name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            name: name.into(),
            entries: RwLock::new(BTreeMap::new()),
            events,
            available: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            quota_bytes: None,
        }
    }

    /// Limit the total size of stored keys and values.
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }

    /// Simulate the backend disappearing or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make every subsequent write fail while reads keep working.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Storage(format!("{} backend unavailable", self.name)))
        }
    }

    fn lock_error(&self) -> Error {
        Error::Storage(format!("{} backend lock poisoned", self.name))
    }

    fn publish(&self, key: &str, old_value: Option<String>, new_value: Option<String>) {
        // No subscribers is fine.
        let _ = self.events.send(ChangeEvent {
            key: key.to_string(),
            old_value,
            new_value,
        });
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        let entries = self.entries.read().map_err(|_| self.lock_error())?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.ensure_available()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!("{} backend rejected write", self.name)));
        }

        let old = {
            let mut entries = self.entries.write().map_err(|_| self.lock_error())?;

            if let Some(quota) = self.quota_bytes {
                let current: usize = entries
                    .iter()
                    .filter(|(k, _)| k.as_str() != key)
                    .map(|(k, v)| k.len() + v.len())
                    .sum();
                if current + key.len() + value.len() > quota {
                    return Err(Error::Storage(format!(
                        "{} backend quota of {} bytes exceeded",
                        self.name, quota
                    )));
                }
            }

            entries.insert(key.to_string(), value.clone())
        };

        self.publish(key, old, Some(value));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.ensure_available()?;
        let old = {
            let mut entries = self.entries.write().map_err(|_| self.lock_error())?;
            entries.remove(key)
        };

        if old.is_some() {
            self.publish(key, old, None);
        }
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.ensure_available()?;
        let entries = self.entries.read().map_err(|_| self.lock_error())?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        Some(self.events.subscribe())
    }
}
