//! Pending queue: the records still owed to a remote endpoint.

use chrono::{DateTime, Utc};
use serde::Serialize;

use jobtrack_common::{Record, RecordId, SyncStatus};

/// Records awaiting submission, oldest first.
///
/// Derived from a full read of the authoritative tier on every pass and
/// never cached between passes.
#[derive(Debug, Clone, Default)]
pub struct PendingQueue {
    records: Vec<Record>,
}

impl PendingQueue {
    /// Select `Unsynced` and `Failed` records, plus `Syncing` records
    /// older than `stale_after`.
    pub fn from_records(
        records: impl IntoIterator<Item = Record>,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Self {
        let mut records: Vec<Record> = records
            .into_iter()
            .filter(|r| r.sync_status.is_pending() || r.is_stale_syncing(now, stale_after))
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    /// Keep only records matching `keep`.
    pub fn retain(&mut self, keep: impl FnMut(&Record) -> bool) {
        self.records.retain(keep);
    }

    /// Ids in submission order.
    pub fn ids(&self) -> Vec<RecordId> {
        self.records.iter().map(|r| r.id.clone()).collect()
    }
}

impl IntoIterator for PendingQueue {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// Number of records per sync status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub unsynced: usize,
    pub syncing: usize,
    pub synced: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> Self {
        let mut counts = Self::default();
        for record in records {
            match record.sync_status {
                SyncStatus::Unsynced => counts.unsynced += 1,
                SyncStatus::Syncing => counts.syncing += 1,
                SyncStatus::Synced => counts.synced += 1,
                SyncStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.unsynced + self.syncing + self.synced + self.failed
    }

    /// Records not yet delivered.
    pub fn pending(&self) -> usize {
        self.unsynced + self.failed
    }
}
