//! Error types for shareplane

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Request Errors ===
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Share {0} is mounted and cannot be removed")]
    ResourceInUse(String),

    // === Placement Errors ===
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("No default container for pool {pool} on backend {backend}")]
    DefaultContainerMissing { backend: String, pool: String },

    #[error("Container {container} is full ({max} shares)")]
    CapacityExceeded { container: String, max: usize },

    #[error("Invalid placement: {0}")]
    InvalidPlacement(String),

    // === Coordination Errors ===
    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[cfg(feature = "sled-backend")]
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    // === Array Errors ===
    #[error("Backend communication error: {0}")]
    BackendCommunication(String),

    #[error("Rollback step {step} failed: {reason}")]
    RollbackStepFailed { step: String, reason: String },

    // === Mount Errors ===
    #[error("Mount state not found: {0}")]
    MountStateNotFound(String),

    #[error("Mount failed: {0}")]
    MountFailed(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::BackendCommunication(_) | Error::LockTimeout(_)
        )
    }

    /// Errors that make the planner try a new container instead of failing.
    pub fn triggers_new_container(&self) -> bool {
        matches!(
            self,
            Error::ContainerNotFound(_)
                | Error::DefaultContainerMissing { .. }
                | Error::CapacityExceeded { .. }
        )
    }
}
