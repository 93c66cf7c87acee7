//! Common error types for jobtrack.

use thiserror::Error;

/// Top-level error type for jobtrack operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Every local storage tier rejected a write.
    ///
    /// This is the only failure `add_record` surfaces to its caller: the
    /// record could not be durably recorded anywhere.
    #[error("Persistence exhausted: {0}")]
    PersistenceExhausted(String),

    /// A single storage tier failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The remote endpoint could not be reached (transport failure or timeout).
    #[error("Remote unreachable: {0}")]
    RemoteUnreachable(String),

    /// The remote endpoint answered with a non-success response.
    #[error("Remote rejected request with status {status}: {message}")]
    RemoteRejected { status: u16, message: String },

    /// A health probe did not answer within its deadline.
    #[error("Probe timed out: {0}")]
    ProbeTimeout(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A background task is no longer running.
    #[error("Shut down: {0}")]
    Shutdown(String),
}

impl Error {
    /// Whether a failed remote call may succeed if attempted again.
    ///
    /// Non-2xx responses and transport failures are treated alike.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RemoteUnreachable(_)
                | Error::RemoteRejected { .. }
                | Error::ProbeTimeout(_)
                | Error::Io(_)
        )
    }

    /// Whether the error is fatal to the calling operation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::PersistenceExhausted(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
