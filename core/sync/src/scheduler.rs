//! Background scheduling of reconciliation and re-probing.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::SyncConfig;
use crate::engine::{ReconcileReport, SyncEngine};
use crate::prober::ConnectivityState;
use jobtrack_common::{Error, Result};

/// Timing of the scheduler's background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub reconcile_interval: Duration,
    pub probe_interval: Duration,
    /// Change notifications arriving within this window share one pass.
    pub change_debounce: Duration,
}

impl From<&SyncConfig> for SchedulerSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            reconcile_interval: config.reconcile_interval(),
            probe_interval: config.probe_interval(),
            change_debounce: config.change_debounce(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// Requests handled by the scheduler task.
#[derive(Debug)]
pub enum SchedulerRequest {
    /// Run a full reconciliation pass now.
    Reconcile(oneshot::Sender<Result<ReconcileReport>>),
    /// Re-probe connectivity now.
    Probe(oneshot::Sender<ConnectivityState>),
    /// Local data changed; reconcile new records soon.
    Changed,
}

/// Front end for requesting work from the scheduler task.
#[derive(Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<SchedulerRequest>,
    shutdown: CancellationToken,
}

impl SyncScheduler {
    /// Create a scheduler and the handle that runs it.
    pub fn new(settings: SchedulerSettings) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let shutdown = CancellationToken::new();

        let scheduler = Self {
            request_tx,
            shutdown: shutdown.clone(),
        };

        let handle = SyncSchedulerHandle {
            settings,
            request_rx,
            shutdown,
        };

        (scheduler, handle)
    }

    /// Run a reconciliation pass and wait for its report.
    pub async fn request_reconcile(&self) -> Result<ReconcileReport> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(SchedulerRequest::Reconcile(response_tx)).await?;
        response_rx
            .await
            .map_err(|_| Error::Shutdown("Scheduler dropped the reconcile request".to_string()))?
    }

    /// Re-probe connectivity and wait for the new state.
    pub async fn request_probe(&self) -> Result<ConnectivityState> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(SchedulerRequest::Probe(response_tx)).await?;
        response_rx
            .await
            .map_err(|_| Error::Shutdown("Scheduler dropped the probe request".to_string()))
    }

    /// Queue a change-triggered pass without waiting.
    ///
    /// Dropped if the queue is full; a pass is already due then.
    pub fn notify_change(&self) {
        if let Err(e) = self.request_tx.try_send(SchedulerRequest::Changed) {
            debug!("Change notification not queued: {}", e);
        }
    }

    /// Stop the scheduler task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn send(&self, request: SchedulerRequest) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::Shutdown("Scheduler not running".to_string()));
        }
        self.request_tx
            .send(request)
            .await
            .map_err(|_| Error::Shutdown("Scheduler not running".to_string()))
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    settings: SchedulerSettings,
    request_rx: mpsc::Receiver<SchedulerRequest>,
    shutdown: CancellationToken,
}

impl SyncSchedulerHandle {
    /// Run the scheduler until shut down.
    ///
    /// This should be spawned in a tokio task.
    pub async fn run(mut self, engine: Arc<SyncEngine>) {
        let start = Instant::now();
        let mut reconcile_tick = interval_at(
            start + self.settings.reconcile_interval,
            self.settings.reconcile_interval,
        );
        reconcile_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut probe_tick = interval_at(
            start + self.settings.probe_interval,
            self.settings.probe_interval,
        );
        probe_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut change_due: Option<Instant> = None;

        info!("Sync scheduler started");

        loop {
            let due = change_due;
            let change_timer = async move {
                match due {
                    Some(at) => sleep_until(at).await,
                    None => pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                request = self.request_rx.recv() => match request {
                    Some(SchedulerRequest::Reconcile(response_tx)) => {
                        debug!("Processing reconcile request");
                        let result = engine.reconcile().await;
                        change_due = None;
                        let _ = response_tx.send(result);
                    }
                    Some(SchedulerRequest::Probe(response_tx)) => {
                        let state = Self::probe(&engine).await;
                        let _ = response_tx.send(state);
                    }
                    Some(SchedulerRequest::Changed) => {
                        change_due.get_or_insert_with(|| Instant::now() + self.settings.change_debounce);
                    }
                    None => break,
                },

                _ = reconcile_tick.tick() => {
                    debug!("Triggering periodic reconcile");
                    Self::log_pass("Periodic", engine.reconcile().await);
                    change_due = None;
                }

                _ = probe_tick.tick() => {
                    Self::probe(&engine).await;
                }

                _ = change_timer => {
                    change_due = None;
                    debug!("Triggering change reconcile");
                    Self::log_pass("Change", engine.reconcile_unsynced().await);
                }
            }
        }

        info!("Sync scheduler shutting down");
    }

    /// Re-probe; reconcile right away when connectivity came back.
    async fn probe(engine: &SyncEngine) -> ConnectivityState {
        let before = engine.prober().current_endpoint();
        let after = engine.prober().probe().await;

        if !before.is_online() && after.is_online() {
            Self::log_pass("Reconnect", engine.reconcile().await);
        }
        after
    }

    fn log_pass(trigger: &str, result: Result<ReconcileReport>) {
        match result {
            Ok(report) if report.pending > 0 => {
                info!(
                    "{} reconcile completed: {} synced, {} failed, {} deferred",
                    trigger, report.synced, report.failed, report.deferred
                );
            }
            Ok(_) => {}
            Err(e) => {
                error!("{} reconcile failed: {}", trigger, e);
            }
        }
    }
}
