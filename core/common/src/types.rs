//! Record data model shared by the storage chain and the sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Locally generated identifier for a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create a RecordId from a caller-supplied string.
    ///
    /// # Errors
    /// - Returns error if id is empty, contains a key separator, or is a
    ///   relative path component (`.` or `..`)
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "RecordId cannot be empty".to_string(),
            ));
        }
        if id.contains('/') {
            return Err(crate::Error::InvalidInput(
                "RecordId cannot contain '/'".to_string(),
            ));
        }
        if id == "." || id == ".." {
            return Err(crate::Error::InvalidInput(format!(
                "RecordId cannot be '{}'",
                id
            )));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of domain entity a record carries.
///
/// The kind selects the remote resource path and the local key scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Application,
    Contact,
}

impl RecordKind {
    /// All known kinds.
    pub const ALL: [RecordKind; 2] = [RecordKind::Application, RecordKind::Contact];

    /// Plural resource name, used for `/api/<resource>` and local keys.
    pub fn resource(&self) -> &'static str {
        match self {
            RecordKind::Application => "applications",
            RecordKind::Contact => "contacts",
        }
    }

    /// Resolve a kind from its resource name.
    pub fn from_resource(resource: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.resource() == resource)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.resource())
    }
}

impl FromStr for RecordKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "application" | "applications" => Ok(RecordKind::Application),
            "contact" | "contacts" => Ok(RecordKind::Contact),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown record kind '{}'",
                other
            ))),
        }
    }
}

/// Remote sync status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Stored locally, never submitted.
    Unsynced,
    /// A submission is in flight.
    Syncing,
    /// Acknowledged by a remote endpoint. Terminal.
    Synced,
    /// The last submission series failed; retried on reconciliation.
    Failed,
}

impl SyncStatus {
    /// Whether the record still needs delivery.
    pub fn is_pending(&self) -> bool {
        matches!(self, SyncStatus::Unsynced | SyncStatus::Failed)
    }

    /// Whether no further transitions can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Synced)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Unsynced => "Unsynced",
            SyncStatus::Syncing => "Syncing",
            SyncStatus::Synced => "Synced",
            SyncStatus::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// A single tracked domain entity.
///
/// The payload is opaque to the engine; only the sync bookkeeping fields
/// are interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub kind: RecordKind,
    pub payload: serde_json::Value,
    pub sync_status: SyncStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_sync_attempt_at: Option<DateTime<Utc>>,
    /// Number of submission series that ended in failure.
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Record {
    /// Create a new unsynced record with a generated id.
    pub fn new(kind: RecordKind, payload: serde_json::Value) -> Self {
        Self::with_id(RecordId::generate(), kind, payload)
    }

    /// Create a new unsynced record with a caller-assigned id.
    pub fn with_id(id: RecordId, kind: RecordKind, payload: serde_json::Value) -> Self {
        Self {
            id,
            kind,
            payload,
            sync_status: SyncStatus::Unsynced,
            created_at: Utc::now(),
            last_sync_attempt_at: None,
            failure_count: 0,
            last_error: None,
        }
    }

    /// Mark as syncing, stamping the attempt time.
    pub fn mark_syncing(&mut self, at: DateTime<Utc>) {
        self.sync_status = SyncStatus::Syncing;
        self.last_sync_attempt_at = Some(at);
    }

    /// Mark as synced successfully.
    pub fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.sync_status = SyncStatus::Synced;
        self.last_sync_attempt_at = Some(at);
        self.last_error = None;
    }

    /// Mark as failed.
    pub fn mark_failed(&mut self, at: DateTime<Utc>, error: impl Into<String>) {
        self.sync_status = SyncStatus::Failed;
        self.last_sync_attempt_at = Some(at);
        self.failure_count += 1;
        self.last_error = Some(error.into());
    }

    /// Apply a status transition as the sync engine reports it.
    ///
    /// `Synced` records are never moved out of `Synced`; returns whether the
    /// record changed.
    pub fn apply_status(
        &mut self,
        status: SyncStatus,
        at: DateTime<Utc>,
        error: Option<&str>,
    ) -> bool {
        if self.sync_status.is_terminal() {
            return false;
        }
        match status {
            SyncStatus::Syncing => self.mark_syncing(at),
            SyncStatus::Synced => self.mark_synced(at),
            SyncStatus::Failed => self.mark_failed(at, error.unwrap_or("submission failed")),
            SyncStatus::Unsynced => self.sync_status = SyncStatus::Unsynced,
        }
        true
    }

    /// Whether a `Syncing` status is older than `stale_after`.
    ///
    /// A context that crashed mid-submit leaves its record in `Syncing`;
    /// once stale it becomes eligible for reconciliation again.
    pub fn is_stale_syncing(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        if self.sync_status != SyncStatus::Syncing {
            return false;
        }
        match self.last_sync_attempt_at {
            Some(at) => now - at >= stale_after,
            None => true,
        }
    }
}
