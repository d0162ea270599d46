//! Error types for the sync layer.

use memex_storage::StorageError;
use memex_types::{Cid, ConflictId};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A subscription to this registry CID already exists.
    #[error("already subscribed to registry {0}")]
    DuplicateSubscription(Cid),

    /// The content store call failed.
    #[error("content store unavailable: {0}")]
    StoreUnavailable(String),

    /// No network connectivity.
    #[error("offline")]
    Offline,

    /// The network is up but the content gateway did not answer the probe.
    #[error("gateway unreachable")]
    GatewayUnreachable,

    /// A CID, subscription or conflict was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The conflict needs a manual decision.
    #[error("conflict {0} requires manual resolution")]
    ConflictUnresolved(ConflictId),

    /// Writing local state failed.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Fetched bytes are not a registry document.
    #[error("invalid registry: {0}")]
    InvalidRegistry(String),

    /// A network call did not finish in time. The outcome is unknown and
    /// retrying is safe.
    #[error("operation timed out")]
    Timeout,
}

impl SyncError {
    /// Returns true for connectivity-class failures that the offline-aware
    /// wrappers convert into a queued result.
    pub fn is_deferrable(&self) -> bool {
        matches!(
            self,
            SyncError::StoreUnavailable(_)
                | SyncError::Offline
                | SyncError::GatewayUnreachable
                | SyncError::Timeout
        )
    }

    /// Returns true if retrying the same operation later could succeed.
    pub fn is_retryable(&self) -> bool {
        self.is_deferrable()
    }

    /// Short reason string used in queue reports.
    pub fn reason(&self) -> String {
        match self {
            SyncError::Offline => "offline".to_string(),
            SyncError::GatewayUnreachable => "gateway unreachable".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        SyncError::PersistenceFailure(err.to_string())
    }
}
