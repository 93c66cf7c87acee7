//! Wiring of one execution context: engine, scheduler and notifier.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::engine::SyncEngine;
use crate::notifier::{CrossContextNotifier, Subscription};
use crate::prober::ConnectivityProber;
use crate::scheduler::{SchedulerSettings, SyncScheduler};
use crate::transport::RemoteTransport;
use jobtrack_common::Result;
use jobtrack_storage::{BackendRegistry, StoreChain, RECORD_PREFIX};

/// Build an engine from configuration, resolving tiers through the default
/// backend registry.
pub fn build_engine(
    config: &SyncConfig,
    transport: Arc<dyn RemoteTransport>,
) -> Result<Arc<SyncEngine>> {
    config.validate()?;
    let chain = Arc::new(config.build_chain(&BackendRegistry::with_defaults())?);
    Ok(engine_over(chain, config, transport))
}

/// Build an engine over an existing chain, e.g. one shared with another
/// context in the same process.
pub fn engine_over(
    chain: Arc<StoreChain>,
    config: &SyncConfig,
    transport: Arc<dyn RemoteTransport>,
) -> Arc<SyncEngine> {
    let prober = Arc::new(ConnectivityProber::new(
        config.endpoints.clone(),
        transport.clone(),
        config.probe_timeout(),
        config.failure_threshold,
    ));
    Arc::new(SyncEngine::new(chain, prober, transport, config))
}

/// A running sync context.
///
/// Probes at startup, reconciles on a timer and whenever another context
/// writes to the shared storage. `shutdown()` stops every background task.
pub struct SyncContext {
    engine: Arc<SyncEngine>,
    scheduler: SyncScheduler,
    notifier: CrossContextNotifier,
    subscription: Subscription,
    scheduler_task: JoinHandle<()>,
}

impl SyncContext {
    /// Start background work for `engine`.
    pub async fn start(engine: Arc<SyncEngine>, config: &SyncConfig) -> Self {
        let state = engine.prober().probe().await;
        info!("Sync context starting ({})", state);

        let (scheduler, handle) = SyncScheduler::new(SchedulerSettings::from(config));
        let scheduler_task = tokio::spawn(handle.run(engine.clone()));

        let notifier = CrossContextNotifier::new(engine.chain().clone(), config.poll_fallback());
        let trigger = scheduler.clone();
        let subscription = notifier
            .on_foreign_change(RECORD_PREFIX, move |notice| {
                debug!("Foreign change on {} ({:?})", notice.key, notice.source);
                trigger.notify_change();
            })
            .await;

        // Records left over from an earlier run.
        if state.is_online() {
            scheduler.notify_change();
        }

        Self {
            engine,
            scheduler,
            notifier,
            subscription,
            scheduler_task,
        }
    }

    /// Build an engine from `config` and start it.
    pub async fn open(config: &SyncConfig, transport: Arc<dyn RemoteTransport>) -> Result<Self> {
        let engine = build_engine(config, transport)?;
        Ok(Self::start(engine, config).await)
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    /// Stop the scheduler, listeners and poll loop, and wait for them.
    pub async fn shutdown(self) {
        self.subscription.close().await;
        self.notifier.shutdown();
        self.scheduler.shutdown();
        let _ = self.scheduler_task.await;
        info!("Sync context stopped");
    }
}
