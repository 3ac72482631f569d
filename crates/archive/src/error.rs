//! Error taxonomy for the archive engine

use crate::models::SyncRunId;

/// Errors produced by the archive engine
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Remote mail API failure (auth, rate limit, network, malformed response)
    #[error("Provider error: {message}")]
    Provider { kind: ProviderFailure, message: String },

    /// Repository or blob-store write/read failure
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Thread, message, attachment or sync run absent for the given id
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    /// Blob backend could not be reached at read time
    #[error("Storage unavailable: {message}")]
    StorageUnavailable { message: String },

    /// A sync run is already in flight for this owner
    #[error("Sync already running for {owner} (run {run_id})")]
    SyncInProgress { owner: String, run_id: SyncRunId },

    /// The sync run was cancelled through its cancel token
    #[error("Sync run cancelled")]
    Cancelled,

    /// The sync run exceeded its job deadline
    #[error("Sync run exceeded its deadline of {secs}s")]
    DeadlineExceeded { secs: u64 },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

/// Classification of provider failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFailure {
    /// Expired or invalid credentials (HTTP 401/403, token lookup failure)
    Auth,
    /// HTTP 429
    RateLimited,
    /// Transport failure or non-success status
    Network,
    /// Response body could not be decoded
    Malformed,
}

/// Convenience alias for `Result<T, ArchiveError>`
pub type Result<T> = std::result::Result<T, ArchiveError>;

impl ArchiveError {
    pub fn provider(kind: ProviderFailure, message: impl Into<String>) -> Self {
        Self::Provider {
            kind,
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Text safe to expose across the interface boundary
    ///
    /// Only "not found" and the sync-in-progress rejection are distinguished;
    /// every other failure collapses to a generic message.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not found",
            Self::SyncInProgress { .. } => "sync already running",
            _ => "internal error",
        }
    }
}

impl From<rusqlite::Error> for ArchiveError {
    fn from(e: rusqlite::Error) -> Self {
        Self::storage(format!("database: {}", e))
    }
}

impl From<rusqlite_migration::Error> for ArchiveError {
    fn from(e: rusqlite_migration::Error) -> Self {
        Self::storage(format!("database migration: {}", e))
    }
}

impl From<serde_json::Error> for ArchiveError {
    fn from(e: serde_json::Error) -> Self {
        Self::storage(format!("serialization: {}", e))
    }
}

impl<T> From<std::sync::PoisonError<T>> for ArchiveError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::storage("lock poisoned")
    }
}
