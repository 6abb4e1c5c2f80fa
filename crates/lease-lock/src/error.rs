//! Lease lock errors

use thiserror::Error;

/// Errors that can occur when reading or writing the lock record
#[derive(Debug, Error)]
pub enum LeaseLockError {
    /// Kubernetes API error other than not-found / conflict
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The lock resource does not exist
    #[error("Lease not found: {0}")]
    NotFound(String),

    /// Optimistic update rejected because the stored object changed
    #[error("Lease update conflict: {0}")]
    Conflict(String),

    /// `update` was called before the lock object was created or read
    #[error("Lease lock not initialized, call get or create first: {0}")]
    NotInitialized(String),

    /// JSON conversion between the record and the Lease spec failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LeaseLockError {
    /// Returns true when the lock resource is absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Returns true when an optimistic update lost the race.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }
}
