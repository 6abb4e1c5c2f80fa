//! Lease-based leader election
//!
//! Exactly one of several competing processes holds the lease at a time. The
//! [`LeaderElector`] runs the acquire/renew state machine against a
//! [`LeaseLockTrait`](lease_lock::LeaseLockTrait) and reports transitions
//! through [`LeaderCallbacks`].

mod elector;

pub use elector::LeaderElector;

use crate::context::Context;
use crate::error::LeaderElectionError;
use async_trait::async_trait;
use rand::Rng;
use rand::distr::Alphanumeric;
use std::time::Duration;

/// `renew_deadline` must exceed `retry_period` by this factor
pub const JITTER_FACTOR: f64 = 1.2;

/// Timing of the acquire/renew loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    /// How long a claim stays valid after it was last observed
    pub lease_duration: Duration,
    /// How long the leader keeps retrying a renewal before giving up
    pub renew_deadline: Duration,
    /// Interval between attempts
    pub retry_period: Duration,
    /// Clear the holder identity when stopping because of cancellation
    pub release_on_cancel: bool,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
            release_on_cancel: false,
        }
    }
}

impl LeaderElectionConfig {
    /// Rejects timings that cannot converge.
    pub fn validate(&self) -> Result<(), LeaderElectionError> {
        if self.lease_duration.is_zero() || self.renew_deadline.is_zero() || self.retry_period.is_zero() {
            return Err(LeaderElectionError::InvalidConfig(
                "lease_duration, renew_deadline and retry_period must be positive".to_string(),
            ));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(LeaderElectionError::InvalidConfig(format!(
                "lease_duration ({:?}) must be greater than renew_deadline ({:?})",
                self.lease_duration, self.renew_deadline
            )));
        }
        if self.renew_deadline <= self.retry_period.mul_f64(JITTER_FACTOR) {
            return Err(LeaderElectionError::InvalidConfig(format!(
                "renew_deadline ({:?}) must be greater than {JITTER_FACTOR} * retry_period ({:?})",
                self.renew_deadline, self.retry_period
            )));
        }
        Ok(())
    }

    /// `lease_duration` in whole seconds as written to the lease record.
    ///
    /// Rounds up so the persisted lease never ends before `renew_deadline`.
    #[must_use]
    pub fn lease_duration_seconds(&self) -> i32 {
        let seconds = self.lease_duration.as_millis().div_ceil(1000).max(1);
        i32::try_from(seconds).unwrap_or(i32::MAX)
    }
}

/// Hooks invoked by the elector. Each runs on its own task and never blocks
/// the election loops.
#[async_trait]
pub trait LeaderCallbacks: Send + Sync + 'static {
    /// This instance acquired the lease. `ctx` is the context the elector runs under.
    async fn on_started_leading(&self, ctx: Context);

    /// This instance stopped leading, through cancellation or a failed renewal.
    async fn on_stopped_leading(&self);

    /// A different holder was observed while acquiring.
    async fn on_new_leader(&self, identity: String) {
        let _ = identity;
    }
}

/// Builds a candidate identity: the hostname plus a random suffix.
#[must_use]
pub fn default_identity() -> String {
    let hostname = gethostname::gethostname()
        .into_string()
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{hostname}_{suffix}")
}
