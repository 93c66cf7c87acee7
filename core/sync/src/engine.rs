//! Core sync engine that moves records from local storage to a remote
//! endpoint.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::pending::{PendingQueue, StatusCounts};
use crate::prober::{ConnectivityProber, ConnectivityState};
use crate::retry::RetryExecutor;
use crate::transport::RemoteTransport;
use jobtrack_common::{Error, Record, RecordId, RecordKind, Result, SyncStatus};
use jobtrack_storage::StoreChain;

/// Why a submission did not reach the remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Already being submitted by this context.
    InFlight,
    /// Marked `Syncing` by another context.
    AlreadySyncing,
    AlreadySynced,
    /// Removed from local storage.
    Missing,
    /// No endpoint is reachable.
    Offline,
}

/// Result of a single submission.
#[derive(Debug)]
pub enum SubmitOutcome {
    Synced { attempts: u32 },
    /// Every attempt failed; the record is now `Failed`.
    Failed { attempts: u32, error: Error },
    Skipped(SkipReason),
}

impl SubmitOutcome {
    pub fn is_synced(&self) -> bool {
        matches!(self, SubmitOutcome::Synced { .. })
    }
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Records in the pending queue when the pass started.
    pub pending: usize,
    pub synced: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Left for a later pass because connectivity was lost.
    pub deferred: usize,
    pub duration: Duration,
}

/// Removes a record id from the in-flight set when dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<RecordId>>,
    id: RecordId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut set = match self.set.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        set.remove(&self.id);
    }
}

/// Sync engine for one execution context.
///
/// Owns record lifecycle transitions. Durability belongs to the store chain
/// and connectivity to the prober; the engine only reads the prober's state
/// and reports remote outcomes back to it.
pub struct SyncEngine {
    chain: Arc<StoreChain>,
    prober: Arc<ConnectivityProber>,
    transport: Arc<dyn RemoteTransport>,
    retry: RetryExecutor,
    stale_syncing_after: chrono::Duration,
    /// Records this context is submitting right now.
    in_flight: Mutex<HashSet<RecordId>>,
    /// Serializes reconciliation passes.
    reconcile_lock: tokio::sync::Mutex<()>,
}

impl SyncEngine {
    /// Create a new sync engine.
    pub fn new(
        chain: Arc<StoreChain>,
        prober: Arc<ConnectivityProber>,
        transport: Arc<dyn RemoteTransport>,
        config: &SyncConfig,
    ) -> Self {
        let stale_syncing_after = chrono::Duration::from_std(config.stale_syncing_after())
            .unwrap_or_else(|_| chrono::Duration::days(365));

        Self {
            chain,
            prober,
            transport,
            retry: RetryExecutor::new(config.retry_config()),
            stale_syncing_after,
            in_flight: Mutex::new(HashSet::new()),
            reconcile_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Get the store chain.
    pub fn chain(&self) -> &Arc<StoreChain> {
        &self.chain
    }

    /// Get the connectivity prober.
    pub fn prober(&self) -> &Arc<ConnectivityProber> {
        &self.prober
    }

    /// Persist a new record and, when online, submit it right away.
    ///
    /// The returned record carries the status it ended in: `Synced` or
    /// `Failed` if a submission ran, `Unsynced` otherwise.
    ///
    /// # Errors
    /// - `PersistenceExhausted` if no local tier accepted the record; remote
    ///   failures are never returned
    pub async fn add_record(&self, kind: RecordKind, payload: serde_json::Value) -> Result<Record> {
        self.store_and_submit(Record::new(kind, payload)).await
    }

    /// Like [`add_record`](Self::add_record) with a caller-assigned id.
    ///
    /// Adding an id that is already stored returns the stored record
    /// unchanged, so callers may retry an add safely.
    pub async fn add_record_with_id(
        &self,
        id: RecordId,
        kind: RecordKind,
        payload: serde_json::Value,
    ) -> Result<Record> {
        if let Ok(Some(existing)) = self.chain.get(kind, &id).await {
            debug!("Record {} already stored, not re-adding", id);
            return Ok(existing);
        }
        self.store_and_submit(Record::with_id(id, kind, payload)).await
    }

    async fn store_and_submit(&self, record: Record) -> Result<Record> {
        let receipt = self.chain.write_through(&record).await?;
        debug!("Stored {} {} on tier {}", record.kind, record.id, receipt.tier);

        if !self.prober.current_endpoint().is_online() {
            debug!("Offline, {} queued for reconciliation", record.id);
            return Ok(record);
        }

        match self.submit(&record).await {
            Ok(outcome) => debug!("Immediate submission of {}: {:?}", record.id, outcome),
            Err(e) => warn!("Immediate submission of {} not attempted: {}", record.id, e),
        }

        match self.chain.get(record.kind, &record.id).await {
            Ok(Some(stored)) => Ok(stored),
            _ => Ok(record),
        }
    }

    /// Submit one record to the current endpoint with bounded retries.
    ///
    /// Remote failures are reported in the outcome and persisted as
    /// `Failed`; the returned error is only for local storage failures.
    pub async fn submit(&self, record: &Record) -> Result<SubmitOutcome> {
        let Some(_guard) = self.claim(&record.id) else {
            debug!("{} already in flight, skipping", record.id);
            return Ok(SubmitOutcome::Skipped(SkipReason::InFlight));
        };

        let ConnectivityState::Online(endpoint) = self.prober.current_endpoint() else {
            return Ok(SubmitOutcome::Skipped(SkipReason::Offline));
        };

        // The caller's copy may be stale; another context may have moved it.
        let Some(current) = self.chain.get(record.kind, &record.id).await? else {
            return Ok(SubmitOutcome::Skipped(SkipReason::Missing));
        };
        let now = Utc::now();
        match current.sync_status {
            SyncStatus::Synced => return Ok(SubmitOutcome::Skipped(SkipReason::AlreadySynced)),
            SyncStatus::Syncing if !current.is_stale_syncing(now, self.stale_syncing_after) => {
                debug!("{} is being synced elsewhere, skipping", current.id);
                return Ok(SubmitOutcome::Skipped(SkipReason::AlreadySyncing));
            }
            _ => {}
        }

        self.chain
            .update_status(current.kind, &current.id, SyncStatus::Syncing, now, None)
            .await?;

        let address = endpoint.address;
        let outcome = self
            .retry
            .execute(|| self.transport.submit(&address, &current))
            .await;

        match outcome.result {
            Ok(()) => {
                self.prober.record_success();
                self.chain
                    .update_status(current.kind, &current.id, SyncStatus::Synced, Utc::now(), None)
                    .await?;
                info!(
                    "Synced {} {} to {} ({} attempt(s))",
                    current.kind, current.id, address, outcome.attempts
                );
                Ok(SubmitOutcome::Synced {
                    attempts: outcome.attempts,
                })
            }
            Err(error) => {
                let message = error.to_string();
                self.chain
                    .update_status(
                        current.kind,
                        &current.id,
                        SyncStatus::Failed,
                        Utc::now(),
                        Some(&message),
                    )
                    .await?;
                warn!(
                    "Submission of {} failed after {} attempt(s): {}",
                    current.id, outcome.attempts, message
                );

                if self.prober.record_failures(outcome.attempts) {
                    debug!("Failure threshold reached, re-probing");
                    self.prober.probe().await;
                }

                Ok(SubmitOutcome::Failed {
                    attempts: outcome.attempts,
                    error,
                })
            }
        }
    }

    /// Submit every pending record, oldest first.
    ///
    /// Passes are serialized; a pass stops early if connectivity is lost.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.reconcile_matching(true).await
    }

    /// Submit only records that were never attempted.
    ///
    /// Used for change-triggered passes; `Failed` records wait for the
    /// periodic pass so contexts do not keep retrying each other's failures.
    pub async fn reconcile_unsynced(&self) -> Result<ReconcileReport> {
        self.reconcile_matching(false).await
    }

    async fn reconcile_matching(&self, include_failed: bool) -> Result<ReconcileReport> {
        let _pass = self.reconcile_lock.lock().await;
        let started = Instant::now();

        let mut state = self.prober.current_endpoint();
        if state == ConnectivityState::Unknown {
            state = self.prober.probe().await;
        }

        let mut queue = self.pending().await?;
        if !include_failed {
            queue.retain(|r| r.sync_status != SyncStatus::Failed);
        }
        let mut report = ReconcileReport {
            pending: queue.len(),
            ..Default::default()
        };

        if queue.is_empty() {
            report.duration = started.elapsed();
            return Ok(report);
        }

        if !state.is_online() {
            debug!("Offline, deferring {} pending record(s)", queue.len());
            report.deferred = queue.len();
            report.duration = started.elapsed();
            return Ok(report);
        }

        info!("Reconciling {} pending record(s)", queue.len());
        let total = queue.len();
        for (index, record) in queue.into_iter().enumerate() {
            if !self.prober.current_endpoint().is_online() {
                report.deferred += total - index;
                warn!("Connectivity lost, deferring {} record(s)", total - index);
                break;
            }

            match self.submit(&record).await {
                Ok(SubmitOutcome::Synced { .. }) => report.synced += 1,
                Ok(SubmitOutcome::Failed { .. }) => report.failed += 1,
                Ok(SubmitOutcome::Skipped(SkipReason::Offline)) => report.deferred += 1,
                Ok(SubmitOutcome::Skipped(_)) => report.skipped += 1,
                Err(e) => {
                    warn!("Could not reconcile {}: {}", record.id, e);
                    report.skipped += 1;
                }
            }
        }

        report.duration = started.elapsed();
        info!(
            "Reconcile finished: {} synced, {} failed, {} skipped, {} deferred in {:?}",
            report.synced, report.failed, report.skipped, report.deferred, report.duration
        );
        Ok(report)
    }

    /// All stored records, oldest first.
    pub async fn records(&self) -> Result<Vec<Record>> {
        self.chain.read_all().await
    }

    /// Look up one record by id.
    pub async fn record(&self, id: &RecordId) -> Result<Option<Record>> {
        self.chain.find(id).await
    }

    /// Current pending queue.
    pub async fn pending(&self) -> Result<PendingQueue> {
        let records = self.chain.read_all().await?;
        Ok(PendingQueue::from_records(
            records,
            Utc::now(),
            self.stale_syncing_after,
        ))
    }

    /// Delete a record locally. Returns whether it existed.
    pub async fn remove_record(&self, id: &RecordId) -> Result<bool> {
        let Some(record) = self.chain.find(id).await? else {
            return Ok(false);
        };
        self.chain.remove(record.kind, id).await
    }

    /// Count stored records by status.
    pub async fn status_counts(&self) -> Result<StatusCounts> {
        let records = self.chain.read_all().await?;
        Ok(StatusCounts::from_records(&records))
    }

    fn claim(&self, id: &RecordId) -> Option<InFlightGuard<'_>> {
        let mut set = match self.in_flight.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !set.insert(id.clone()) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.in_flight,
            id: id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prober::EndpointCandidate;
    use crate::stub::{StubResponse, StubTransport};
    use jobtrack_storage::{KvBackend, MemoryBackend};
    use serde_json::json;
    use url::Url;

    struct Harness {
        engine: SyncEngine,
        stub: Arc<StubTransport>,
        backend: Arc<MemoryBackend>,
        endpoint: Url,
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            retry_delay_ms: 1,
            attempt_timeout_ms: 1_000,
            ..SyncConfig::default()
        }
    }

    async fn harness(online: bool) -> Harness {
        harness_with(online, test_config()).await
    }

    async fn harness_with(online: bool, config: SyncConfig) -> Harness {
        let backend = Arc::new(MemoryBackend::new());
        let chain = Arc::new(StoreChain::new(vec![backend.clone() as Arc<dyn KvBackend>]).unwrap());
        let stub = Arc::new(StubTransport::new());
        let endpoint = Url::parse("http://api.test").unwrap();
        stub.set_healthy(&endpoint, online);

        let prober = Arc::new(ConnectivityProber::new(
            vec![EndpointCandidate::new(endpoint.clone(), 0)],
            stub.clone(),
            config.probe_timeout(),
            config.failure_threshold,
        ));
        prober.probe().await;

        let engine = SyncEngine::new(chain, prober, stub.clone(), &config);
        Harness {
            engine,
            stub,
            backend,
            endpoint,
        }
    }

    #[tokio::test]
    async fn test_add_offline_stays_unsynced() {
        let h = harness(false).await;

        let record = h
            .engine
            .add_record(RecordKind::Application, json!({"company": "Acme"}))
            .await
            .unwrap();

        assert_eq!(record.sync_status, SyncStatus::Unsynced);
        assert_eq!(h.stub.submit_calls(), 0);
        assert_eq!(h.engine.records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_add_online_syncs_immediately() {
        let h = harness(true).await;

        let record = h
            .engine
            .add_record(RecordKind::Contact, json!({"name": "Jo"}))
            .await
            .unwrap();

        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert!(record.last_sync_attempt_at.is_some());
        assert_eq!(h.stub.submissions_for(&record.id), 1);
        assert_eq!(h.stub.submissions()[0].endpoint, h.endpoint);
    }

    #[tokio::test]
    async fn test_add_online_failure_is_not_an_error() {
        let h = harness(true).await;
        h.stub.set_default_submit(StubResponse::Reject(500));

        let record = h
            .engine
            .add_record(RecordKind::Application, json!({}))
            .await
            .unwrap();

        assert_eq!(record.sync_status, SyncStatus::Failed);
        assert_eq!(record.failure_count, 1);
        assert!(record.last_error.as_deref().unwrap_or("").contains("500"));
        assert_eq!(h.stub.submissions_for(&record.id), 3);
    }

    #[tokio::test]
    async fn test_add_persistence_exhausted() {
        let h = harness(true).await;
        h.backend.set_fail_writes(true);

        let result = h.engine.add_record(RecordKind::Application, json!({})).await;

        assert!(matches!(result, Err(Error::PersistenceExhausted(_))));
        assert_eq!(h.stub.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_add_with_existing_id_is_idempotent() {
        let h = harness(false).await;
        let id = RecordId::new("job-1").unwrap();

        let first = h
            .engine
            .add_record_with_id(id.clone(), RecordKind::Application, json!({"v": 1}))
            .await
            .unwrap();
        let second = h
            .engine
            .add_record_with_id(id, RecordKind::Application, json!({"v": 2}))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(h.engine.records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_skips_synced_and_syncing() {
        let h = harness(true).await;
        let synced = h
            .engine
            .add_record(RecordKind::Application, json!({}))
            .await
            .unwrap();

        let outcome = h.engine.submit(&synced).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Skipped(SkipReason::AlreadySynced)));

        // Another context marked this one Syncing a moment ago.
        let record = Record::new(RecordKind::Contact, json!({}));
        h.engine.chain().write_through(&record).await.unwrap();
        h.engine
            .chain()
            .update_status(record.kind, &record.id, SyncStatus::Syncing, Utc::now(), None)
            .await
            .unwrap();

        let outcome = h.engine.submit(&record).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Skipped(SkipReason::AlreadySyncing)));
        assert_eq!(h.stub.submissions_for(&record.id), 0);
    }

    #[tokio::test]
    async fn test_submit_missing_record() {
        let h = harness(true).await;
        let ghost = Record::new(RecordKind::Application, json!({}));

        let outcome = h.engine.submit(&ghost).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Skipped(SkipReason::Missing)));
    }

    #[tokio::test]
    async fn test_concurrent_submit_posts_once() {
        let h = harness(true).await;
        let record = Record::new(RecordKind::Application, json!({}));
        h.engine.chain().write_through(&record).await.unwrap();
        h.stub.set_submit_delay(Duration::from_millis(50));

        let (a, b) = tokio::join!(h.engine.submit(&record), h.engine.submit(&record));
        let outcomes = [a.unwrap(), b.unwrap()];

        assert_eq!(outcomes.iter().filter(|o| o.is_synced()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, SubmitOutcome::Skipped(SkipReason::InFlight))));
        assert_eq!(h.stub.submissions_for(&record.id), 1);
    }

    #[tokio::test]
    async fn test_reconcile_offline_defers() {
        let h = harness(false).await;
        h.engine.add_record(RecordKind::Application, json!({})).await.unwrap();
        h.engine.add_record(RecordKind::Contact, json!({})).await.unwrap();

        let report = h.engine.reconcile().await.unwrap();

        assert_eq!(report.pending, 2);
        assert_eq!(report.deferred, 2);
        assert_eq!(h.stub.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_syncs_then_is_idle() {
        let h = harness(false).await;
        h.engine.add_record(RecordKind::Application, json!({})).await.unwrap();
        h.engine.add_record(RecordKind::Contact, json!({})).await.unwrap();

        h.stub.set_healthy(&h.endpoint, true);
        h.engine.prober().probe().await;

        let report = h.engine.reconcile().await.unwrap();
        assert_eq!(report.synced, 2);

        let again = h.engine.reconcile().await.unwrap();
        assert_eq!(again.pending, 0);
        assert_eq!(h.stub.submit_calls(), 2);
        assert_eq!(h.engine.status_counts().await.unwrap().synced, 2);
    }

    #[tokio::test]
    async fn test_reconcile_retries_failed() {
        let h = harness(true).await;
        h.stub.script_submissions([
            StubResponse::Reject(503),
            StubResponse::Reject(503),
            StubResponse::Reject(503),
        ]);
        let record = h
            .engine
            .add_record(RecordKind::Application, json!({}))
            .await
            .unwrap();
        assert_eq!(record.sync_status, SyncStatus::Failed);

        // Three failures crossed the threshold and forced a re-probe; the
        // endpoint is still healthy.
        assert!(h.engine.prober().current_endpoint().is_online());

        let report = h.engine.reconcile().await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(h.stub.submissions_for(&record.id), 4);
    }

    #[tokio::test]
    async fn test_failures_trigger_reprobe() {
        let h = harness(true).await;
        h.stub.set_default_submit(StubResponse::Unreachable);
        h.stub.set_healthy(&h.endpoint, false);

        h.engine.add_record(RecordKind::Application, json!({})).await.unwrap();

        assert_eq!(
            h.engine.prober().current_endpoint(),
            ConnectivityState::Offline
        );
    }

    #[tokio::test]
    async fn test_stale_syncing_is_reclaimed() {
        let config = SyncConfig {
            stale_syncing_after_ms: 0,
            ..test_config()
        };
        let h = harness_with(true, config).await;

        let record = Record::new(RecordKind::Application, json!({}));
        h.engine.chain().write_through(&record).await.unwrap();
        h.engine
            .chain()
            .update_status(record.kind, &record.id, SyncStatus::Syncing, Utc::now(), None)
            .await
            .unwrap();

        let report = h.engine.reconcile().await.unwrap();
        assert_eq!(report.synced, 1);
    }

    #[tokio::test]
    async fn test_reconcile_unsynced_leaves_failed() {
        let h = harness(true).await;
        h.stub.script_submissions([
            StubResponse::Reject(500),
            StubResponse::Reject(500),
            StubResponse::Reject(500),
        ]);
        let failed = h
            .engine
            .add_record(RecordKind::Application, json!({}))
            .await
            .unwrap();
        let fresh = Record::new(RecordKind::Contact, json!({}));
        h.engine.chain().write_through(&fresh).await.unwrap();

        let report = h.engine.reconcile_unsynced().await.unwrap();

        assert_eq!(report.synced, 1);
        assert_eq!(h.stub.submissions_for(&fresh.id), 1);
        assert_eq!(h.stub.submissions_for(&failed.id), 3);
    }

    #[tokio::test]
    async fn test_remove_record() {
        let h = harness(false).await;
        let record = h
            .engine
            .add_record(RecordKind::Contact, json!({}))
            .await
            .unwrap();

        assert!(h.engine.remove_record(&record.id).await.unwrap());
        assert!(!h.engine.remove_record(&record.id).await.unwrap());
        assert!(h.engine.record(&record.id).await.unwrap().is_none());
    }
}
