//! Scripted in-memory transport.
//!
//! Useful for testing and offline development: health and submission
//! responses are configured per endpoint/script, and every call is counted.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

use crate::transport::RemoteTransport;
use jobtrack_common::{Error, Record, RecordId, Result};

/// How the stub answers a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubResponse {
    /// 2xx with a JSON body.
    Accept,
    /// Non-2xx with the given status.
    Reject(u16),
    /// Transport failure.
    Unreachable,
    /// Never answers; only a caller timeout ends the call.
    Hang,
}

/// One recorded submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub endpoint: Url,
    pub record_id: RecordId,
    pub payload: serde_json::Value,
}

/// Scripted transport that records every call.
pub struct StubTransport {
    health: Mutex<HashMap<String, StubResponse>>,
    script: Mutex<VecDeque<StubResponse>>,
    default_submit: Mutex<StubResponse>,
    submit_delay: Mutex<Duration>,
    health_calls: AtomicU32,
    submissions: Mutex<Vec<Submission>>,
}

impl StubTransport {
    /// Create a stub where every endpoint is unreachable and every
    /// submission is accepted.
    pub fn new() -> Self {
        Self {
            health: Mutex::new(HashMap::new()),
            script: Mutex::new(VecDeque::new()),
            default_submit: Mutex::new(StubResponse::Accept),
            submit_delay: Mutex::new(Duration::ZERO),
            health_calls: AtomicU32::new(0),
            submissions: Mutex::new(Vec::new()),
        }
    }

    /// Set how the health check of `endpoint` answers.
    pub fn set_health(&self, endpoint: &Url, response: StubResponse) {
        if let Ok(mut health) = self.health.lock() {
            health.insert(endpoint.as_str().to_string(), response);
        }
    }

    /// Make `endpoint` answer its health check (or stop answering).
    pub fn set_healthy(&self, endpoint: &Url, healthy: bool) {
        let response = if healthy {
            StubResponse::Accept
        } else {
            StubResponse::Unreachable
        };
        self.set_health(endpoint, response);
    }

    /// Queue responses for the next submissions, in order.
    pub fn script_submissions(&self, responses: impl IntoIterator<Item = StubResponse>) {
        if let Ok(mut script) = self.script.lock() {
            script.extend(responses);
        }
    }

    /// Response used once the script is exhausted.
    pub fn set_default_submit(&self, response: StubResponse) {
        if let Ok(mut default) = self.default_submit.lock() {
            *default = response;
        }
    }

    /// Delay every submission, to widen overlap windows.
    pub fn set_submit_delay(&self, delay: Duration) {
        if let Ok(mut current) = self.submit_delay.lock() {
            *current = delay;
        }
    }

    /// Number of health checks performed.
    pub fn health_calls(&self) -> u32 {
        self.health_calls.load(Ordering::SeqCst)
    }

    /// Number of submission attempts, successful or not.
    pub fn submit_calls(&self) -> usize {
        self.submissions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Submission attempts for one record.
    pub fn submissions_for(&self, id: &RecordId) -> usize {
        self.submissions
            .lock()
            .map(|s| s.iter().filter(|sub| &sub.record_id == id).count())
            .unwrap_or(0)
    }

    /// All recorded submission attempts.
    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn next_submit_response(&self) -> StubResponse {
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        scripted.unwrap_or_else(|| {
            self.default_submit
                .lock()
                .map(|d| *d)
                .unwrap_or(StubResponse::Accept)
        })
    }

    async fn answer(response: StubResponse) -> Result<()> {
        match response {
            StubResponse::Accept => Ok(()),
            StubResponse::Reject(status) => Err(Error::RemoteRejected {
                status,
                message: "stub rejection".to_string(),
            }),
            StubResponse::Unreachable => {
                Err(Error::RemoteUnreachable("stub endpoint unreachable".to_string()))
            }
            StubResponse::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

impl Default for StubTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteTransport for StubTransport {
    fn name(&self) -> &str {
        "stub"
    }

    async fn health(&self, endpoint: &Url) -> Result<()> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        let response = self
            .health
            .lock()
            .ok()
            .and_then(|h| h.get(endpoint.as_str()).copied())
            .unwrap_or(StubResponse::Unreachable);
        Self::answer(response).await
    }

    async fn submit(&self, endpoint: &Url, record: &Record) -> Result<()> {
        if let Ok(mut submissions) = self.submissions.lock() {
            submissions.push(Submission {
                endpoint: endpoint.clone(),
                record_id: record.id.clone(),
                payload: record.payload.clone(),
            });
        }

        let delay = self
            .submit_delay
            .lock()
            .map(|d| *d)
            .unwrap_or(Duration::ZERO);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let response = self.next_submit_response();
        Self::answer(response).await
    }
}
