//! jobtrack sync engine
//!
//! Moves locally stored records to a remote endpoint, including:
//! - Connectivity probing over prioritized endpoints
//! - Bounded retries with a per-attempt timeout
//! - Pending queue reconciliation, on a timer and on change
//! - Change notification across contexts sharing local storage

pub mod config;
pub mod context;
pub mod engine;
pub mod notifier;
pub mod pending;
pub mod prober;
pub mod retry;
pub mod scheduler;
pub mod stub;
pub mod transport;

// Re-export main types
pub use config::{SyncConfig, TierConfig};
pub use context::{build_engine, engine_over, SyncContext};
pub use engine::{ReconcileReport, SkipReason, SubmitOutcome, SyncEngine};
pub use notifier::{ChangeNotice, ChangeSource, CrossContextNotifier, Subscription};
pub use pending::{PendingQueue, StatusCounts};
pub use prober::{ConnectivityProber, ConnectivityState, EndpointCandidate};
pub use retry::{BackoffPolicy, RetryConfig, RetryExecutor, RetryOutcome};
pub use scheduler::{SchedulerRequest, SchedulerSettings, SyncScheduler, SyncSchedulerHandle};
pub use stub::{StubResponse, StubTransport, Submission};
pub use transport::{api_url, HttpTransport, RemoteTransport};
