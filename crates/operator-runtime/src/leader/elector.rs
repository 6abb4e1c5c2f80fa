use super::{LeaderCallbacks, LeaderElectionConfig};
use crate::context::Context;
use crate::error::LeaderElectionError;
use chrono::Utc;
use lease_lock::{LeaderElectionRecord, LeaseLockTrait};
use rand::Rng;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Upper bound of the random jitter added to `retry_period` while acquiring
const MAX_JITTER: f64 = 0.2;

#[derive(Debug, Default)]
struct Observed {
    record: Option<LeaderElectionRecord>,
    /// Local time at which `record` was last seen to change
    at: Option<Instant>,
}

/// Runs the acquire/renew protocol for one candidate identity.
///
/// Validity of a lease is judged from when this process last observed the
/// record change, not from the timestamps written in it, so clock skew
/// between candidates does not matter.
pub struct LeaderElector {
    lock: Arc<dyn LeaseLockTrait>,
    config: LeaderElectionConfig,
    callbacks: Arc<dyn LeaderCallbacks>,
    observed: Mutex<Observed>,
}

impl LeaderElector {
    /// Validates `config` and builds an elector for `lock.identity()`.
    pub fn new(
        lock: Arc<dyn LeaseLockTrait>,
        config: LeaderElectionConfig,
        callbacks: Arc<dyn LeaderCallbacks>,
    ) -> Result<Self, LeaderElectionError> {
        config.validate()?;
        if lock.identity().is_empty() {
            return Err(LeaderElectionError::InvalidConfig(
                "lock identity must not be empty".to_string(),
            ));
        }
        Ok(Self {
            lock,
            config,
            callbacks,
            observed: Mutex::new(Observed::default()),
        })
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        self.lock.identity()
    }

    /// True when the last observed record names this identity as holder.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.observed()
            .record
            .as_ref()
            .is_some_and(|r| r.holder_identity == self.identity())
    }

    /// True while `t` falls inside the observed lease.
    #[must_use]
    pub fn is_lease_valid(&self, t: Instant) -> bool {
        let observed = self.observed();
        match (&observed.record, observed.at) {
            (Some(record), Some(at)) => {
                let duration = Duration::from_secs(u64::try_from(record.lease_duration_seconds).unwrap_or(0));
                t < at + duration
            }
            _ => false,
        }
    }

    /// The last record read from or written to the lock.
    #[must_use]
    pub fn observed_record(&self) -> Option<LeaderElectionRecord> {
        self.observed().record.clone()
    }

    /// Campaigns for the lease and holds it until `ctx` is cancelled or a
    /// renewal misses `renew_deadline`.
    ///
    /// Returns without invoking any callback when cancelled before the lease
    /// was acquired.
    pub async fn run(&self, ctx: Context) {
        info!(identity = %self.identity(), lock = %self.lock, "Starting leader election");
        if !self.acquire(&ctx).await {
            info!(identity = %self.identity(), "Leader election cancelled before acquiring");
            return;
        }

        self.lock
            .record_event(&format!("{} became leader", self.identity()))
            .await;
        let callbacks = self.callbacks.clone();
        let started_ctx = ctx.clone();
        tokio::spawn(async move { callbacks.on_started_leading(started_ctx).await });

        self.renew(&ctx).await;

        if ctx.is_cancelled() && self.config.release_on_cancel {
            self.release().await;
        }

        let callbacks = self.callbacks.clone();
        tokio::spawn(async move { callbacks.on_stopped_leading().await });
        self.lock
            .record_event(&format!("{} stopped leading", self.identity()))
            .await;
        info!(identity = %self.identity(), "Stopped leading");
    }

    /// One attempt to acquire the lease, or renew it when already held.
    ///
    /// Lock failures are logged and reported as `false`.
    pub async fn try_acquire_or_renew(&self, now: Instant) -> bool {
        let identity = self.identity().to_string();
        let lease_seconds = self.config.lease_duration_seconds();

        if self.is_leader() && self.is_lease_valid(now) {
            if let Some(mut record) = self.observed_record() {
                record.renew_time = Utc::now();
                record.lease_duration_seconds = lease_seconds;
                match self.lock.update(&record).await {
                    Ok(()) => {
                        self.set_observed(record, now);
                        return true;
                    }
                    Err(e) => debug!(identity = %identity, error = %e, "Fast-path renewal failed, re-reading lease"),
                }
            }
        }

        let current = match self.lock.get().await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                let record = LeaderElectionRecord::new(&identity, lease_seconds, Utc::now());
                return match self.lock.create(&record).await {
                    Ok(()) => {
                        info!(identity = %identity, lock = %self.lock, "Created lease");
                        self.set_observed(record, now);
                        true
                    }
                    Err(e) => {
                        warn!(identity = %identity, error = %e, "Failed to create lease");
                        false
                    }
                };
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "Failed to read lease");
                return false;
            }
        };

        if self.observed_record().as_ref() != Some(&current) {
            self.set_observed(current.clone(), now);
        }
        if self.is_lease_valid(now) && current.has_holder() && current.holder_identity != identity {
            debug!(identity = %identity, holder = %current.holder_identity, "Lease is held by another candidate");
            return false;
        }

        let mut record = LeaderElectionRecord::new(&identity, lease_seconds, Utc::now());
        record.strategy = current.strategy.clone();
        record.preferred_holder = current.preferred_holder.clone();
        if current.holder_identity == identity {
            record.acquire_time = current.acquire_time;
            record.leader_transitions = current.leader_transitions;
        } else {
            record.leader_transitions = current.leader_transitions + 1;
        }

        match self.lock.update(&record).await {
            Ok(()) => {
                self.set_observed(record, now);
                true
            }
            Err(e) => {
                debug!(identity = %identity, error = %e, "Failed to update lease");
                false
            }
        }
    }

    async fn acquire(&self, ctx: &Context) -> bool {
        let mut reported: Option<String> = None;
        loop {
            if ctx.is_cancelled() {
                return false;
            }
            let acquired = self.try_acquire_or_renew(Instant::now()).await;
            self.report_new_leader(&mut reported);
            if acquired {
                info!(identity = %self.identity(), lock = %self.lock, "Acquired lease");
                return true;
            }
            if ctx.run_until_cancelled(tokio::time::sleep(self.jittered_retry())).await.is_err() {
                return false;
            }
        }
    }

    async fn renew(&self, ctx: &Context) {
        let period = self.config.retry_period;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = ctx.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let deadline = Instant::now() + self.config.renew_deadline;
            match ctx.run_until_cancelled(self.renew_until(deadline)).await {
                Ok(true) => debug!(identity = %self.identity(), "Renewed lease"),
                Ok(false) => {
                    warn!(identity = %self.identity(), "Failed to renew lease before the deadline");
                    return;
                }
                Err(_) => return,
            }
        }
    }

    async fn renew_until(&self, deadline: Instant) -> bool {
        loop {
            match tokio::time::timeout_at(deadline, self.try_acquire_or_renew(Instant::now())).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(_) => return false,
            }
            tokio::time::sleep(self.config.retry_period).await;
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    /// Clears the holder so another candidate can take over before expiry.
    async fn release(&self) {
        if !self.is_leader() {
            return;
        }
        let Some(mut record) = self.observed_record() else {
            return;
        };
        let now = Utc::now();
        record.holder_identity = String::new();
        record.lease_duration_seconds = 1;
        record.acquire_time = now;
        record.renew_time = now;
        match self.lock.update(&record).await {
            Ok(()) => {
                info!(identity = %self.identity(), lock = %self.lock, "Released lease");
                self.set_observed(record, Instant::now());
            }
            Err(e) => warn!(identity = %self.identity(), error = %e, "Failed to release lease"),
        }
    }

    fn report_new_leader(&self, reported: &mut Option<String>) {
        let Some(holder) = self
            .observed_record()
            .map(|r| r.holder_identity)
            .filter(|h| !h.is_empty())
        else {
            return;
        };
        if reported.as_deref() == Some(holder.as_str()) {
            return;
        }
        info!(identity = %self.identity(), leader = %holder, "New leader observed");
        *reported = Some(holder.clone());
        let callbacks = self.callbacks.clone();
        tokio::spawn(async move { callbacks.on_new_leader(holder).await });
    }

    fn jittered_retry(&self) -> Duration {
        let jitter = rand::rng().random_range(0.0..=MAX_JITTER);
        self.config.retry_period.mul_f64(1.0 + jitter)
    }

    fn observed(&self) -> MutexGuard<'_, Observed> {
        self.observed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_observed(&self, record: LeaderElectionRecord, at: Instant) {
        let mut observed = self.observed();
        observed.record = Some(record);
        observed.at = Some(at);
    }
}

impl fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderElector")
            .field("identity", &self.identity())
            .field("lock", &self.lock.to_string())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lease_lock::MockLeaseLock;

    struct Noop;

    #[async_trait]
    impl LeaderCallbacks for Noop {
        async fn on_started_leading(&self, _ctx: Context) {}
        async fn on_stopped_leading(&self) {}
    }

    fn elector(lock: &MockLeaseLock) -> LeaderElector {
        LeaderElector::new(Arc::new(lock.clone()), LeaderElectionConfig::default(), Arc::new(Noop)).unwrap()
    }

    #[tokio::test]
    async fn test_creates_missing_lease() {
        let lock = MockLeaseLock::new("default", "leader", "a");
        let e = elector(&lock);

        assert!(!e.is_leader());
        assert!(e.try_acquire_or_renew(Instant::now()).await);
        assert!(e.is_leader());
        assert_eq!(lock.create_calls(), 1);
        let stored = lock.stored().unwrap();
        assert_eq!(stored.holder_identity, "a");
        assert_eq!(stored.lease_duration_seconds, 15);
        assert_eq!(stored.leader_transitions, 0);
    }

    #[tokio::test]
    async fn test_fast_path_renewal_preserves_acquire_time() {
        let lock = MockLeaseLock::new("default", "leader", "a");
        let e = elector(&lock);
        assert!(e.try_acquire_or_renew(Instant::now()).await);
        let first = lock.stored().unwrap();

        assert!(e.try_acquire_or_renew(Instant::now()).await);
        let second = lock.stored().unwrap();
        assert_eq!(lock.get_calls(), 1, "fast path must not re-read");
        assert_eq!(second.acquire_time, first.acquire_time);
        assert_eq!(second.leader_transitions, 0);
        assert!(second.renew_time >= first.renew_time);
    }

    #[tokio::test]
    async fn test_respects_valid_lease_of_other_holder() {
        let a = MockLeaseLock::new("default", "leader", "a");
        let b = a.candidate("b");
        let ea = elector(&a);
        let eb = elector(&b);

        assert!(ea.try_acquire_or_renew(Instant::now()).await);
        assert!(!eb.try_acquire_or_renew(Instant::now()).await);
        assert!(!eb.is_leader());
        assert_eq!(eb.observed_record().unwrap().holder_identity, "a");
        assert_eq!(b.update_calls(), 0);
    }

    #[tokio::test]
    async fn test_takes_over_expired_lease() {
        let a = MockLeaseLock::new("default", "leader", "a");
        let b = a.candidate("b");
        let ea = elector(&a);
        let eb = elector(&b);

        assert!(ea.try_acquire_or_renew(Instant::now()).await);
        let start = Instant::now();
        assert!(!eb.try_acquire_or_renew(start).await);

        // Same record seen again after it would have expired
        assert!(eb.try_acquire_or_renew(start + Duration::from_secs(16)).await);
        assert!(eb.is_leader());
        let stored = a.stored().unwrap();
        assert_eq!(stored.holder_identity, "b");
        assert_eq!(stored.leader_transitions, 1);
    }

    #[tokio::test]
    async fn test_read_failure_is_not_fatal() {
        let lock = MockLeaseLock::new("default", "leader", "a");
        lock.set_fail_gets(true);
        let e = elector(&lock);
        assert!(!e.try_acquire_or_renew(Instant::now()).await);

        lock.set_fail_gets(false);
        assert!(e.try_acquire_or_renew(Instant::now()).await);
    }

    #[tokio::test]
    async fn test_lease_validity_uses_observation_time() {
        let lock = MockLeaseLock::new("default", "leader", "a");
        let e = elector(&lock);
        let now = Instant::now();
        assert!(!e.is_lease_valid(now));

        assert!(e.try_acquire_or_renew(now).await);
        assert!(e.is_lease_valid(now + Duration::from_secs(14)));
        assert!(!e.is_lease_valid(now + Duration::from_secs(15)));
    }

    #[tokio::test]
    async fn test_fractional_lease_outlives_renew_deadline() {
        let config = LeaderElectionConfig {
            lease_duration: Duration::from_millis(10_500),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
            release_on_cancel: false,
        };
        let a = MockLeaseLock::new("default", "leader", "a");
        let b = a.candidate("b");
        let ea = LeaderElector::new(Arc::new(a.clone()), config.clone(), Arc::new(Noop)).unwrap();
        let eb = LeaderElector::new(Arc::new(b.clone()), config.clone(), Arc::new(Noop)).unwrap();

        assert!(ea.try_acquire_or_renew(Instant::now()).await);
        assert_eq!(a.stored().unwrap().lease_duration_seconds, 11);

        let seen = Instant::now();
        assert!(!eb.try_acquire_or_renew(seen).await);
        // The leader may still be renewing right up to its deadline
        assert!(eb.is_lease_valid(seen + config.renew_deadline));
        assert!(!eb.try_acquire_or_renew(seen + config.renew_deadline).await);
        assert_eq!(a.stored().unwrap().holder_identity, "a");
    }

    #[test]
    fn test_empty_identity_rejected() {
        let lock = MockLeaseLock::new("default", "leader", "");
        let err = LeaderElector::new(Arc::new(lock), LeaderElectionConfig::default(), Arc::new(Noop)).unwrap_err();
        assert!(matches!(err, LeaderElectionError::InvalidConfig(_)));
    }
}
