//! Change notification across execution contexts sharing local storage.
//!
//! Two sources feed a subscription:
//! - native change events from tiers that publish them
//! - a poll of the chain's last-write marker, for tiers that cannot
//!
//! Native events refresh the cached marker, so the poll does not report the
//! same write twice. Callbacks may still see a change more than once and
//! must be idempotent.

use futures::future::join_all;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use jobtrack_storage::{ChangeEvent, LastWrite, StoreChain, LAST_WRITE_KEY};

/// Where a change notice came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    Native,
    Poll,
}

/// A change reported to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    /// Key that changed, or the subscription scope when unknown.
    pub key: String,
    pub source: ChangeSource,
}

type Callback = Arc<dyn Fn(ChangeNotice) + Send + Sync>;

/// Which markers a subscription reports.
#[derive(Clone)]
struct Filter {
    scope: String,
    /// Writer id whose writes are not reported.
    ignore_writer: Option<String>,
}

impl Filter {
    fn is_own(&self, marker: &LastWrite) -> bool {
        self.ignore_writer.as_deref() == Some(marker.writer.as_str())
    }

    fn admits(&self, marker: &LastWrite) -> bool {
        marker.key.starts_with(&self.scope) && !self.is_own(marker)
    }
}

/// Marker seen last by a subscription.
type Cache = Arc<Mutex<Option<LastWrite>>>;

fn replace_cached(cache: &Cache, next: Option<LastWrite>) -> bool {
    let mut cached = match cache.lock() {
        Ok(cached) => cached,
        Err(poisoned) => poisoned.into_inner(),
    };
    if *cached == next {
        return false;
    }
    *cached = next;
    true
}

/// Handle to an active subscription. Dropping it stops its tasks.
pub struct Subscription {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    /// Stop the subscription and wait for its tasks to finish.
    pub async fn close(mut self) {
        self.token.cancel();
        join_all(self.tasks.drain(..)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Reports writes to a store chain made by this or another context.
pub struct CrossContextNotifier {
    chain: Arc<StoreChain>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl CrossContextNotifier {
    /// Create a notifier polling the last-write marker every `poll_interval`.
    pub fn new(chain: Arc<StoreChain>, poll_interval: Duration) -> Self {
        Self {
            chain,
            poll_interval,
            shutdown: CancellationToken::new(),
        }
    }

    /// Call `callback` whenever a key starting with `scope` changes.
    ///
    /// An empty scope matches everything; polled changes are reported
    /// whenever the marker diverges, whatever key it names.
    pub async fn on_change<F>(&self, scope: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(ChangeNotice) + Send + Sync + 'static,
    {
        let filter = Filter {
            scope: scope.into(),
            ignore_writer: None,
        };
        self.subscribe(filter, Arc::new(callback)).await
    }

    /// Like [`on_change`](Self::on_change), ignoring writes made through
    /// this notifier's own chain.
    pub async fn on_foreign_change<F>(&self, scope: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(ChangeNotice) + Send + Sync + 'static,
    {
        let filter = Filter {
            scope: scope.into(),
            ignore_writer: Some(self.chain.writer_id().to_string()),
        };
        self.subscribe(filter, Arc::new(callback)).await
    }

    /// Stop every subscription created by this notifier.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn subscribe(&self, filter: Filter, callback: Callback) -> Subscription {
        let token = self.shutdown.child_token();

        // Baseline so the first poll does not report pre-existing data.
        let baseline = self.chain.last_write().await.unwrap_or_else(|e| {
            debug!("No last-write baseline: {}", e);
            None
        });
        let cache: Cache = Arc::new(Mutex::new(baseline));

        let mut tasks = Vec::new();
        for receiver in self.chain.subscribe() {
            tasks.push(tokio::spawn(listen(
                receiver,
                filter.clone(),
                cache.clone(),
                callback.clone(),
                token.clone(),
            )));
        }
        tasks.push(tokio::spawn(poll(
            self.chain.clone(),
            self.poll_interval,
            filter,
            cache,
            callback,
            token.clone(),
        )));

        Subscription { token, tasks }
    }
}

impl Drop for CrossContextNotifier {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn listen(
    mut receiver: Receiver<ChangeEvent>,
    filter: Filter,
    cache: Cache,
    callback: Callback,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = receiver.recv() => event,
        };

        match event {
            Ok(event) => {
                if event.key != LAST_WRITE_KEY {
                    continue;
                }
                let Some(marker) = event
                    .new_value
                    .as_deref()
                    .and_then(|v| serde_json::from_str::<LastWrite>(v).ok())
                else {
                    continue;
                };

                replace_cached(&cache, Some(marker.clone()));
                if filter.admits(&marker) {
                    trace!("Native change on {}", marker.key);
                    callback(ChangeNotice {
                        key: marker.key,
                        source: ChangeSource::Native,
                    });
                }
            }
            Err(RecvError::Lagged(missed)) => {
                warn!("Change listener lagged, {} event(s) missed", missed);
                callback(ChangeNotice {
                    key: filter.scope.clone(),
                    source: ChangeSource::Native,
                });
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn poll(
    chain: Arc<StoreChain>,
    period: Duration,
    filter: Filter,
    cache: Cache,
    callback: Callback,
    token: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let current = match chain.last_write().await {
            Ok(current) => current,
            Err(e) => {
                debug!("Last-write poll failed: {}", e);
                continue;
            }
        };

        if !replace_cached(&cache, current.clone()) {
            continue;
        }

        // Only the latest write is visible, and writes in between may have
        // matched the scope, so any foreign change fires regardless of scope.
        let notice = match current {
            Some(marker) if filter.is_own(&marker) => continue,
            Some(marker) => ChangeNotice {
                key: marker.key,
                source: ChangeSource::Poll,
            },
            None => ChangeNotice {
                key: filter.scope.clone(),
                source: ChangeSource::Poll,
            },
        };
        trace!("Polled change on {}", notice.key);
        callback(notice);
    }
}
