//! Key-value backend trait definition.

use async_trait::async_trait;
use tokio::sync::broadcast;

use jobtrack_common::Result;

/// A native change notification published by a backend.
///
/// Fired for every write or removal, whichever context made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Key that changed.
    pub key: String,
    /// Value before the change, if any.
    pub old_value: Option<String>,
    /// Value after the change (`None` for removals).
    pub new_value: Option<String>,
}

/// Key-value backend trait for local persistence tiers.
///
/// Values are serialized strings. Implementations must provide
/// last-write-wins semantics per key; atomicity of a single key's write is
/// the backend's responsibility.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Get the backend name (e.g., "memory", "file", "sqlite").
    fn name(&self) -> &str;

    /// Whether the backend can currently serve reads and writes.
    ///
    /// Must be cheap; used by the chain before every operation.
    async fn is_available(&self) -> bool;

    /// Read a value.
    ///
    /// # Postconditions
    /// - Returns `None` if the key is absent
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    ///
    /// # Errors
    /// - Backend unavailable
    /// - Quota exceeded
    /// - I/O errors
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Remove a value. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// List keys starting with `prefix`, sorted.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Subscribe to native change events.
    ///
    /// Returns `None` when the backend cannot deliver them; callers then
    /// rely on polling the chain's last-write marker.
    fn subscribe(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        None
    }
}
