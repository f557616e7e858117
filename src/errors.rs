//! Dependency Watch and Dedup Error Hierarchy
//!
//! Defines error types for the watch pipeline and the cross-instance
//! deduplication protocol, categorized by the component that raises them.
//!
//! Per-dependency and per-template errors are contained and retried by the
//! component that owns them. Only configuration errors are expected to reach
//! process startup.

use config::ConfigError;
use tokio::task::JoinError;

use crate::DependencyId;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Infrastructure-level failures (backend client, serialization, tasks)
    #[error(transparent)]
    System(#[from] SystemError),

    /// Invalid configuration, discovered at startup
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Dependency watch failures
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// Leader election and shared data failures
    #[error(transparent)]
    Dedup(#[from] DedupError),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    /// Coordination service capability failures
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    //Serialization
    #[error("Serialization error")]
    Serialization(#[from] SerializationError),

    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),

    /// Retry policy exhaustion
    #[error("Task failed after {attempts} attempts")]
    RetryTaskFailed { attempts: usize },

    /// Single attempt exceeded its time budget
    #[error("Task timed out")]
    RetryTimeout,
}

/// Errors returned by a [`crate::CoordinationClient`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Endpoint unavailable (network partition, backend down)
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Request did not complete in time
    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Lease expired or was never created
    #[error("Lease {0} not found")]
    LeaseNotFound(u64),

    /// Backend returned an application level error
    #[error("Backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum WatchError {
    /// A single fetch failed; the view retries with backoff
    #[error("Fetch for {dependency} failed: {source}")]
    Fetch {
        dependency: DependencyId,
        #[source]
        source: ClientError,
    },

    /// Backend returned an index lower than the one already observed
    #[error("Index for {dependency} went backwards (last: {last}, received: {received})")]
    IndexRegressed {
        dependency: DependencyId,
        last: u64,
        received: u64,
    },

    /// Consecutive failures reached the configured retry limit
    #[error("Gave up on {dependency} after {attempts} attempts")]
    RetriesExhausted {
        dependency: DependencyId,
        attempts: usize,
    },

    /// Operation on a watcher that has been stopped
    #[error("Watcher stopped")]
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    /// Lease renewal failed for longer than the lease window
    #[error("Backend unavailable for template {template}: {reason}")]
    BackendUnavailable { template: String, reason: String },

    /// Compare-and-swap conflict while writing a dedup key
    #[error("Write to {key} rejected (expected revision {expected:?})")]
    StaleWriteRejected { key: String, expected: Option<u64> },

    /// Shared data could not be decoded or was tagged with an older term
    #[error("Malformed shared data at {key}: {reason}")]
    MalformedSharedData { key: String, reason: String },

    /// The election record no longer names this instance
    #[error("Leadership lost for template {template} (term {term})")]
    LeadershipLost { template: String, term: u64 },
}

// Serialization is classified separately (shared data and election records)
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("Json serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

// ============== Conversion Implementations ============== //
impl From<ClientError> for Error {
    fn from(e: ClientError) -> Self {
        Error::System(SystemError::Client(e))
    }
}

impl From<SerializationError> for Error {
    fn from(e: SerializationError) -> Self {
        Error::System(SystemError::Serialization(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        SerializationError::Json(e).into()
    }
}

impl From<JoinError> for Error {
    fn from(err: JoinError) -> Self {
        Error::System(SystemError::TaskFailed(err))
    }
}

impl Error {
    /// Whether the failure is worth retrying locally.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::System(SystemError::Client(e)) => e.is_transient(),
            Error::System(SystemError::RetryTimeout) => true,
            Error::Watch(WatchError::Fetch { .. }) => true,
            Error::Watch(WatchError::IndexRegressed { .. }) => true,
            Error::Dedup(DedupError::BackendUnavailable { .. }) => true,
            _ => false,
        }
    }
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Unavailable(_) | ClientError::Timeout(_))
    }
}
