//! Connectivity probing over a prioritized list of endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use crate::transport::RemoteTransport;
use jobtrack_common::Error;

/// A remote endpoint the prober may select.
///
/// Lower `priority` values are tried first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointCandidate {
    pub address: Url,
    #[serde(default)]
    pub priority: u32,
}

impl EndpointCandidate {
    pub fn new(address: Url, priority: u32) -> Self {
        Self { address, priority }
    }
}

/// Whether a remote endpoint is usable, and which one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Not probed yet.
    Unknown,
    /// The endpoint answered its last health check.
    Online(EndpointCandidate),
    /// No candidate answered.
    Offline,
}

impl ConnectivityState {
    /// Check if an endpoint is usable.
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectivityState::Online(_))
    }

    /// The selected endpoint, if online.
    pub fn endpoint(&self) -> Option<&EndpointCandidate> {
        match self {
            ConnectivityState::Online(endpoint) => Some(endpoint),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Unknown => f.write_str("unknown"),
            ConnectivityState::Online(endpoint) => write!(f, "online ({})", endpoint.address),
            ConnectivityState::Offline => f.write_str("offline"),
        }
    }
}

/// Determines the reachable endpoint and caches the answer.
///
/// The cached state is read without I/O; it changes only through `probe()`.
/// The sync engine reports remote failures back so a flapping link is
/// re-probed quickly.
pub struct ConnectivityProber {
    candidates: Vec<EndpointCandidate>,
    transport: Arc<dyn RemoteTransport>,
    probe_timeout: Duration,
    failure_threshold: u32,
    state: RwLock<ConnectivityState>,
    consecutive_failures: AtomicU32,
    /// Completed probes; lets a waiting caller reuse a probe that finished
    /// while it queued.
    generation: AtomicU64,
    probe_lock: Mutex<()>,
}

impl ConnectivityProber {
    /// Create a prober over `candidates`, sorted by priority.
    pub fn new(
        mut candidates: Vec<EndpointCandidate>,
        transport: Arc<dyn RemoteTransport>,
        probe_timeout: Duration,
        failure_threshold: u32,
    ) -> Self {
        // Stable sort keeps configuration order among equal priorities.
        candidates.sort_by_key(|c| c.priority);

        Self {
            candidates,
            transport,
            probe_timeout,
            failure_threshold: failure_threshold.max(1),
            state: RwLock::new(ConnectivityState::Unknown),
            consecutive_failures: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            probe_lock: Mutex::new(()),
        }
    }

    /// Candidates in the order they are probed.
    pub fn candidates(&self) -> &[EndpointCandidate] {
        &self.candidates
    }

    /// Cached connectivity state. Never performs I/O.
    pub fn current_endpoint(&self) -> ConnectivityState {
        match self.state.read() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Health-check candidates in priority order and cache the first that
    /// answers, or `Offline` if none does.
    ///
    /// Concurrent callers share one probe.
    pub async fn probe(&self) -> ConnectivityState {
        let seen = self.generation.load(Ordering::SeqCst);
        let _guard = self.probe_lock.lock().await;
        if self.generation.load(Ordering::SeqCst) != seen {
            return self.current_endpoint();
        }

        let mut next = ConnectivityState::Offline;
        for candidate in &self.candidates {
            match timeout(self.probe_timeout, self.transport.health(&candidate.address)).await {
                Ok(Ok(())) => {
                    next = ConnectivityState::Online(candidate.clone());
                    break;
                }
                Ok(Err(e)) => {
                    debug!("Endpoint {} failed health check: {}", candidate.address, e);
                }
                Err(_) => {
                    let e = Error::ProbeTimeout(format!(
                        "{} did not answer within {:?}",
                        candidate.address, self.probe_timeout
                    ));
                    debug!("{}", e);
                }
            }
        }

        if next.is_online() {
            self.consecutive_failures.store(0, Ordering::SeqCst);
        }
        self.set_state(next.clone());
        self.generation.fetch_add(1, Ordering::SeqCst);
        next
    }

    /// Report a successful remote call.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Report `count` failed remote attempts.
    ///
    /// Returns `true` when the consecutive-failure threshold was reached;
    /// the caller should then `probe()`.
    pub fn record_failures(&self, count: u32) -> bool {
        if count == 0 {
            return false;
        }
        let total = self.consecutive_failures.fetch_add(count, Ordering::SeqCst) + count;
        if total >= self.failure_threshold {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    fn set_state(&self, next: ConnectivityState) {
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *state != next {
            match &next {
                ConnectivityState::Online(endpoint) => {
                    info!("Connectivity: online via {}", endpoint.address)
                }
                ConnectivityState::Offline => warn!("Connectivity: offline"),
                ConnectivityState::Unknown => {}
            }
        }
        *state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::{StubResponse, StubTransport};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn prober(stub: Arc<StubTransport>, candidates: Vec<EndpointCandidate>) -> ConnectivityProber {
        ConnectivityProber::new(candidates, stub, Duration::from_secs(2), 3)
    }

    #[tokio::test]
    async fn test_starts_unknown() {
        let stub = Arc::new(StubTransport::new());
        let prober = prober(stub.clone(), vec![]);

        assert_eq!(prober.current_endpoint(), ConnectivityState::Unknown);
        assert_eq!(stub.health_calls(), 0);
    }

    #[tokio::test]
    async fn test_no_candidates_is_offline() {
        let stub = Arc::new(StubTransport::new());
        let prober = prober(stub, vec![]);

        assert_eq!(prober.probe().await, ConnectivityState::Offline);
    }

    #[tokio::test]
    async fn test_first_healthy_by_priority_wins() {
        let stub = Arc::new(StubTransport::new());
        let primary = EndpointCandidate::new(url("http://primary.test"), 0);
        let backup = EndpointCandidate::new(url("http://backup.test"), 1);
        stub.set_healthy(&primary.address, true);
        stub.set_healthy(&backup.address, true);

        // Configuration order is irrelevant.
        let prober = prober(stub, vec![backup.clone(), primary.clone()]);
        assert_eq!(prober.probe().await, ConnectivityState::Online(primary));
    }

    #[tokio::test]
    async fn test_falls_back_to_lower_priority() {
        let stub = Arc::new(StubTransport::new());
        let primary = EndpointCandidate::new(url("http://primary.test"), 0);
        let backup = EndpointCandidate::new(url("http://backup.test"), 1);
        stub.set_health(&primary.address, StubResponse::Reject(503));
        stub.set_healthy(&backup.address, true);

        let prober = prober(stub.clone(), vec![primary, backup.clone()]);
        assert_eq!(prober.probe().await, ConnectivityState::Online(backup));
        assert_eq!(stub.health_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_candidate_times_out() {
        let stub = Arc::new(StubTransport::new());
        let slow = EndpointCandidate::new(url("http://slow.test"), 0);
        stub.set_health(&slow.address, StubResponse::Hang);

        let prober = prober(stub, vec![slow]);
        assert_eq!(prober.probe().await, ConnectivityState::Offline);
    }

    #[tokio::test]
    async fn test_recovers_after_reprobe() {
        let stub = Arc::new(StubTransport::new());
        let endpoint = EndpointCandidate::new(url("http://api.test"), 0);

        let prober = prober(stub.clone(), vec![endpoint.clone()]);
        assert_eq!(prober.probe().await, ConnectivityState::Offline);

        stub.set_healthy(&endpoint.address, true);
        // Cached until the next probe.
        assert_eq!(prober.current_endpoint(), ConnectivityState::Offline);
        assert!(prober.probe().await.is_online());
    }

    #[tokio::test]
    async fn test_failure_threshold() {
        let stub = Arc::new(StubTransport::new());
        let prober = prober(stub, vec![]);

        assert!(!prober.record_failures(1));
        assert!(!prober.record_failures(1));
        assert!(prober.record_failures(1));
        // Counter resets once the threshold fires.
        assert!(!prober.record_failures(1));

        prober.record_success();
        assert!(!prober.record_failures(2));
        assert!(prober.record_failures(1));
    }
}
