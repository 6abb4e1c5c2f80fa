//! LeaseLock trait for mocking
//!
//! This trait abstracts the lock resource so the leader elector can be tested
//! against an in-memory implementation. `KubeLeaseLock` implements it against
//! the Kubernetes API.

use crate::error::LeaseLockError;
use crate::record::LeaderElectionRecord;
use std::fmt;

/// Operations on a single distributed-lock record.
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
/// `Display` renders the lock as `namespace/name`.
#[async_trait::async_trait]
pub trait LeaseLockTrait: fmt::Display + Send + Sync {
    /// Identity this process claims the lock with
    fn identity(&self) -> &str;

    /// Reads the current record, failing with `NotFound` when the lock is absent
    async fn get(&self) -> Result<LeaderElectionRecord, LeaseLockError>;

    /// Creates the lock resource carrying `record`
    async fn create(&self, record: &LeaderElectionRecord) -> Result<(), LeaseLockError>;

    /// Optimistically replaces the record on the object last read or created
    async fn update(&self, record: &LeaderElectionRecord) -> Result<(), LeaseLockError>;

    /// Publishes `message` as an advisory event. Never fails; errors are logged and dropped.
    async fn record_event(&self, message: &str);
}
