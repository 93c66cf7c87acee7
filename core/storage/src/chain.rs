//! Ordered chain of local backends with write-through fallback.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::backend::{ChangeEvent, KvBackend};
use jobtrack_common::{Error, Record, RecordId, RecordKind, Result, SyncStatus};

/// Prefix of every record key.
pub const RECORD_PREFIX: &str = "record/";

/// Key of the denormalized last-write marker.
pub const LAST_WRITE_KEY: &str = "meta/last_write";

/// Key holding a record: `record/<resource>/<id>`.
pub fn record_key(kind: RecordKind, id: &RecordId) -> String {
    format!("{}{}/{}", RECORD_PREFIX, kind.resource(), id)
}

/// Key scope covering every record of a kind, e.g. `record/applications/`.
pub fn kind_scope(kind: RecordKind) -> String {
    format!("{}{}/", RECORD_PREFIX, kind.resource())
}

/// Marker bumped on every successful write to a tier.
///
/// Contexts without native change events poll it and compare with the
/// value they saw last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastWrite {
    pub at: DateTime<Utc>,
    /// Identifier of the chain (execution context) that wrote.
    pub writer: String,
    /// Key that was written.
    pub key: String,
    /// Unique per write, so two writes in the same millisecond differ.
    pub nonce: String,
}

/// Where a record landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Position of the tier in the chain (0 = highest priority).
    pub tier_index: usize,
    /// Name of the backend that accepted the write.
    pub tier: String,
}

struct Tier {
    backend: Arc<dyn KvBackend>,
    /// Set when the tier rejected the last write routed to it.
    degraded: AtomicBool,
}

/// Ordered list of persistent local backends.
///
/// Writes go to the highest-priority tier that accepts them. Reads are
/// served from the authoritative tier (the highest-priority tier that is
/// available and has not rejected its most recent write), plus any record
/// that only exists on another available tier because it fell through while
/// a higher tier was degraded. Records are not replicated between tiers.
/// When one record has copies on several tiers the most advanced copy wins,
/// see [`supersedes`].
pub struct StoreChain {
    tiers: Vec<Tier>,
    writer_id: String,
}

impl StoreChain {
    /// Create a chain from backends in priority order.
    ///
    /// # Errors
    /// - Returns error if no backend is given
    pub fn new(backends: Vec<Arc<dyn KvBackend>>) -> Result<Self> {
        if backends.is_empty() {
            return Err(Error::Config(
                "Store chain needs at least one backend".to_string(),
            ));
        }

        let tiers = backends
            .into_iter()
            .map(|backend| Tier {
                backend,
                degraded: AtomicBool::new(false),
            })
            .collect();

        Ok(Self {
            tiers,
            writer_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// Identifier stamped into the last-write marker by this chain.
    pub fn writer_id(&self) -> &str {
        &self.writer_id
    }

    /// Backends in priority order.
    pub fn backends(&self) -> Vec<Arc<dyn KvBackend>> {
        self.tiers.iter().map(|t| t.backend.clone()).collect()
    }

    /// Subscribe to native change events of every tier that offers them.
    pub fn subscribe(&self) -> Vec<broadcast::Receiver<ChangeEvent>> {
        self.tiers
            .iter()
            .filter_map(|t| t.backend.subscribe())
            .collect()
    }

    /// Persist a record on the first tier that accepts it.
    ///
    /// # Errors
    /// - `PersistenceExhausted` if every tier is absent or rejects the write
    pub async fn write_through(&self, record: &Record) -> Result<WriteReceipt> {
        let key = record_key(record.kind, &record.id);
        let value = serde_json::to_string(record).map_err(|e| {
            Error::PersistenceExhausted(format!("record {} is not serializable: {}", record.id, e))
        })?;

        let mut failures = Vec::new();

        for (index, tier) in self.tiers.iter().enumerate() {
            let name = tier.backend.name();

            if !tier.backend.is_available().await {
                debug!("Tier {} unavailable, skipping write of {}", name, key);
                failures.push(format!("{}: unavailable", name));
                continue;
            }

            match tier.backend.set(&key, value.clone()).await {
                Ok(()) => {
                    if tier.degraded.swap(false, Ordering::SeqCst) {
                        debug!("Tier {} accepted writes again", name);
                    }
                    self.touch(tier, &key).await;
                    if index > 0 {
                        warn!("Record {} written to fallback tier {}", record.id, name);
                    }
                    return Ok(WriteReceipt {
                        tier_index: index,
                        tier: name.to_string(),
                    });
                }
                Err(e) => {
                    warn!("Tier {} rejected write of {}: {}", name, key, e);
                    Self::mark_degraded(tier, &e);
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }

        error!("All {} tiers failed to persist {}", self.tiers.len(), key);
        Err(Error::PersistenceExhausted(failures.join("; ")))
    }

    /// Read every stored record, oldest first.
    ///
    /// Each record appears once. Entries that fail to deserialize are
    /// skipped with a warning.
    pub async fn read_all(&self) -> Result<Vec<Record>> {
        let mut merged: HashMap<String, Record> = HashMap::new();

        for (position, tier) in self.read_order().await?.into_iter().enumerate() {
            let keys = match tier.backend.list_keys(RECORD_PREFIX).await {
                Ok(keys) => keys,
                Err(e) if position > 0 => {
                    warn!("Skipping tier {} during read: {}", tier.backend.name(), e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            for key in keys {
                // Removed between listing and reading.
                let Some(value) = tier.backend.get(&key).await? else {
                    continue;
                };
                let record = match serde_json::from_str::<Record>(&value) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Skipping unreadable entry {}: {}", key, e);
                        continue;
                    }
                };
                let newer = merged
                    .get(&key)
                    .map_or(true, |current| supersedes(&record, current));
                if newer {
                    merged.insert(key, record);
                }
            }
        }

        let mut records: Vec<Record> = merged.into_values().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    /// Fetch a single record, wherever it lives.
    pub async fn get(&self, kind: RecordKind, id: &RecordId) -> Result<Option<Record>> {
        Ok(self
            .locate(&record_key(kind, id))
            .await?
            .map(|(_, record)| record))
    }

    /// Find a record by id regardless of kind.
    pub async fn find(&self, id: &RecordId) -> Result<Option<Record>> {
        for kind in RecordKind::ALL {
            if let Some(record) = self.get(kind, id).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Update the sync status of a stored record.
    ///
    /// Idempotent: an absent record (e.g. deleted concurrently) is a no-op
    /// and returns `Ok(false)`, as does a record already `Synced`.
    pub async fn update_status(
        &self,
        kind: RecordKind,
        id: &RecordId,
        status: SyncStatus,
        at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<bool> {
        let key = record_key(kind, id);

        let Some((tier, mut record)) = self.locate(&key).await? else {
            debug!("Status update for absent record {}, ignoring", key);
            return Ok(false);
        };

        if !record.apply_status(status, at, error) {
            return Ok(false);
        }

        let value = serde_json::to_string(&record)?;
        match tier.backend.set(&key, value).await {
            Ok(()) => {
                self.touch(tier, &key).await;
                Ok(true)
            }
            Err(e) => {
                warn!(
                    "Tier {} rejected status update of {}: {}",
                    tier.backend.name(),
                    key,
                    e
                );
                Self::mark_degraded(tier, &e);
                let receipt = self.write_through(&record).await?;

                // Drop the outdated copy so it cannot resurface.
                let moved = !std::ptr::eq(&self.tiers[receipt.tier_index], tier);
                if moved {
                    if let Err(e) = tier.backend.remove(&key).await {
                        debug!("Stale copy of {} left on {}: {}", key, tier.backend.name(), e);
                    }
                }
                Ok(true)
            }
        }
    }

    /// Remove a record from every available tier.
    ///
    /// Returns whether the record existed anywhere.
    pub async fn remove(&self, kind: RecordKind, id: &RecordId) -> Result<bool> {
        let key = record_key(kind, id);
        let mut found = false;

        for tier in &self.tiers {
            if !tier.backend.is_available().await {
                continue;
            }
            if tier.backend.get(&key).await?.is_some() {
                tier.backend.remove(&key).await?;
                self.touch(tier, &key).await;
                found = true;
            }
        }

        Ok(found)
    }

    /// Current last-write marker of the authoritative tier.
    pub async fn last_write(&self) -> Result<Option<LastWrite>> {
        let tier = self.authoritative().await?;
        match tier.backend.get(LAST_WRITE_KEY).await? {
            Some(value) => Ok(serde_json::from_str(&value).ok()),
            None => Ok(None),
        }
    }

    /// Name of the tier reads are currently served from.
    pub async fn authoritative_tier(&self) -> Option<String> {
        self.authoritative()
            .await
            .ok()
            .map(|t| t.backend.name().to_string())
    }

    async fn authoritative(&self) -> Result<&Tier> {
        let mut fallback = None;

        for tier in &self.tiers {
            if !tier.backend.is_available().await {
                continue;
            }
            if !tier.degraded.load(Ordering::SeqCst) {
                return Ok(tier);
            }
            fallback.get_or_insert(tier);
        }

        fallback.ok_or_else(|| Error::Storage("No local storage tier is available".to_string()))
    }

    /// Available tiers, authoritative first, then the rest in priority order.
    async fn read_order(&self) -> Result<Vec<&Tier>> {
        let primary = self.authoritative().await?;
        let mut order = vec![primary];

        for tier in &self.tiers {
            if std::ptr::eq(tier, primary) || !tier.backend.is_available().await {
                continue;
            }
            order.push(tier);
        }

        Ok(order)
    }

    /// Find the tier holding the most advanced copy of `key`.
    async fn locate(&self, key: &str) -> Result<Option<(&Tier, Record)>> {
        let mut best: Option<(&Tier, Record)> = None;

        for (position, tier) in self.read_order().await?.into_iter().enumerate() {
            let record = match Self::read_record(tier, key).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) if position > 0 => {
                    warn!("Skipping tier {} while reading {}: {}", tier.backend.name(), key, e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let newer = best
                .as_ref()
                .map_or(true, |(_, current)| supersedes(&record, current));
            if newer {
                best = Some((tier, record));
            }
        }

        Ok(best)
    }

    /// Degrade a tier that failed a write, unless the failure is about the
    /// key itself rather than the tier.
    fn mark_degraded(tier: &Tier, error: &Error) {
        if matches!(error, Error::InvalidInput(_)) {
            return;
        }
        tier.degraded.store(true, Ordering::SeqCst);
    }

    async fn read_record(tier: &Tier, key: &str) -> Result<Option<Record>> {
        match tier.backend.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    async fn touch(&self, tier: &Tier, key: &str) {
        let marker = LastWrite {
            at: Utc::now(),
            writer: self.writer_id.clone(),
            key: key.to_string(),
            nonce: uuid::Uuid::new_v4().to_string(),
        };

        let value = match serde_json::to_string(&marker) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to encode last-write marker: {}", e);
                return;
            }
        };

        if let Err(e) = tier.backend.set(LAST_WRITE_KEY, value).await {
            warn!(
                "Failed to update last-write marker on {}: {}",
                tier.backend.name(),
                e
            );
        }
    }
}

/// Whether `candidate` is a newer copy of the same record than `current`.
///
/// `Synced` is terminal and always wins; otherwise the copy with the later
/// sync attempt wins. Ties keep `current`.
fn supersedes(candidate: &Record, current: &Record) -> bool {
    let rank = |r: &Record| (r.sync_status == SyncStatus::Synced, r.last_sync_attempt_at);
    rank(candidate) > rank(current)
}
