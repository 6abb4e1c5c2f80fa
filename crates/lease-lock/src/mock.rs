//! Mock LeaseLock for unit testing
//!
//! An in-memory lock store with resource versions, so optimistic-update
//! conflicts between several candidates behave like the API server.
//! Several `MockLeaseLock` handles can share one store through
//! [`MockLeaseLock::candidate`].

use crate::error::LeaseLockError;
use crate::lock_trait::LeaseLockTrait;
use crate::record::LeaderElectionRecord;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Default)]
struct Stored {
    record: Option<LeaderElectionRecord>,
    version: u64,
}

/// Mock lease lock for testing
#[derive(Clone)]
pub struct MockLeaseLock {
    namespace: String,
    name: String,
    identity: String,
    store: Arc<Mutex<Stored>>,
    /// Version observed by the last successful get/create/update of this handle
    observed_version: Arc<Mutex<Option<u64>>>,
    fail_gets: Arc<AtomicBool>,
    fail_creates: Arc<AtomicBool>,
    fail_updates: Arc<AtomicBool>,
    gets: Arc<AtomicUsize>,
    creates: Arc<AtomicUsize>,
    updates: Arc<AtomicUsize>,
    events: Arc<Mutex<Vec<String>>>,
}

impl MockLeaseLock {
    /// Create a mock lock with an empty store
    pub fn new(namespace: &str, name: &str, identity: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            identity: identity.to_string(),
            store: Arc::new(Mutex::new(Stored::default())),
            observed_version: Arc::new(Mutex::new(None)),
            fail_gets: Arc::new(AtomicBool::new(false)),
            fail_creates: Arc::new(AtomicBool::new(false)),
            fail_updates: Arc::new(AtomicBool::new(false)),
            gets: Arc::new(AtomicUsize::new(0)),
            creates: Arc::new(AtomicUsize::new(0)),
            updates: Arc::new(AtomicUsize::new(0)),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Another candidate competing for the same stored lock
    pub fn candidate(&self, identity: &str) -> Self {
        let mut other = Self::new(&self.namespace, &self.name, identity);
        other.store = self.store.clone();
        other
    }

    /// Seed the store with an existing record (for test setup)
    pub fn seed(&self, record: LeaderElectionRecord) {
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        store.record = Some(record);
        store.version += 1;
    }

    /// Current stored record, if any
    pub fn stored(&self) -> Option<LeaderElectionRecord> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner).record.clone()
    }

    /// Make every subsequent `get` fail with an API error
    pub fn set_fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `create` fail with an API error
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `update` fail with a conflict
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Messages passed to `record_event`, in order
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn injected(&self) -> LeaseLockError {
        LeaseLockError::Kube(kube::Error::Service(
            std::io::Error::other("injected failure").into(),
        ))
    }
}

impl fmt::Display for MockLeaseLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[async_trait::async_trait]
impl LeaseLockTrait for MockLeaseLock {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn get(&self) -> Result<LeaderElectionRecord, LeaseLockError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(self.injected());
        }
        let store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        match &store.record {
            Some(record) => {
                *self.observed_version.lock().unwrap_or_else(PoisonError::into_inner) = Some(store.version);
                Ok(record.clone())
            }
            None => Err(LeaseLockError::NotFound(self.to_string())),
        }
    }

    async fn create(&self, record: &LeaderElectionRecord) -> Result<(), LeaseLockError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(self.injected());
        }
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        if store.record.is_some() {
            return Err(LeaseLockError::Conflict(format!("{self} already exists")));
        }
        store.record = Some(record.clone());
        store.version += 1;
        *self.observed_version.lock().unwrap_or_else(PoisonError::into_inner) = Some(store.version);
        Ok(())
    }

    async fn update(&self, record: &LeaderElectionRecord) -> Result<(), LeaseLockError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let Some(observed) = *self.observed_version.lock().unwrap_or_else(PoisonError::into_inner) else {
            return Err(LeaseLockError::NotInitialized(self.to_string()));
        };
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(LeaseLockError::Conflict(self.to_string()));
        }
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        if store.version != observed {
            return Err(LeaseLockError::Conflict(self.to_string()));
        }
        store.record = Some(record.clone());
        store.version += 1;
        *self.observed_version.lock().unwrap_or_else(PoisonError::into_inner) = Some(store.version);
        Ok(())
    }

    async fn record_event(&self, message: &str) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_update_requires_prior_read() {
        let lock = MockLeaseLock::new("default", "leader", "a");
        let record = LeaderElectionRecord::new("a", 15, Utc::now());
        let err = lock.update(&record).await.unwrap_err();
        assert!(matches!(err, LeaseLockError::NotInitialized(_)));
    }

    #[tokio::test]
    async fn test_get_absent_is_not_found() {
        let lock = MockLeaseLock::new("default", "leader", "a");
        assert!(lock.get().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let a = MockLeaseLock::new("default", "leader", "a");
        let b = a.candidate("b");
        a.create(&LeaderElectionRecord::new("a", 15, Utc::now())).await.unwrap();
        b.get().await.unwrap();

        // a renews, so b's read is stale
        a.update(&LeaderElectionRecord::new("a", 15, Utc::now())).await.unwrap();
        let err = b.update(&LeaderElectionRecord::new("b", 15, Utc::now())).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(a.stored().unwrap().holder_identity, "a");
    }

    #[tokio::test]
    async fn test_create_twice_rejected() {
        let a = MockLeaseLock::new("default", "leader", "a");
        let b = a.candidate("b");
        a.create(&LeaderElectionRecord::new("a", 15, Utc::now())).await.unwrap();
        assert!(b.create(&LeaderElectionRecord::new("b", 15, Utc::now())).await.is_err());
        assert_eq!(format!("{b}"), "default/leader");
    }
}
