//! Leader election record
//!
//! The record is persisted as the `spec` of a `coordination.k8s.io/v1` Lease.
//! Field names follow the Lease wire shape so the record converts to and from
//! `LeaseSpec` through plain JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content of the distributed lock.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaderElectionRecord {
    /// Identity of the current holder; empty when released
    pub holder_identity: String,
    /// How long the holder's claim is valid after the last renewal
    pub lease_duration_seconds: i32,
    /// When the current holder acquired the lease
    #[serde(with = "micro_time")]
    pub acquire_time: DateTime<Utc>,
    /// When the current holder last renewed the lease
    #[serde(with = "micro_time")]
    pub renew_time: DateTime<Utc>,
    /// Number of holder changes; serialized as `leaseTransitions`
    #[serde(rename = "leaseTransitions")]
    pub leader_transitions: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_holder: Option<String>,
}

impl LeaderElectionRecord {
    /// Builds a fresh record for `identity`, acquired and renewed at `now`.
    #[must_use]
    pub fn new(identity: impl Into<String>, lease_duration_seconds: i32, now: DateTime<Utc>) -> Self {
        Self {
            holder_identity: identity.into(),
            lease_duration_seconds,
            acquire_time: now,
            renew_time: now,
            leader_transitions: 0,
            strategy: None,
            preferred_holder: None,
        }
    }

    /// Returns true if some holder is recorded.
    #[must_use]
    pub fn has_holder(&self) -> bool {
        !self.holder_identity.is_empty()
    }
}

/// Lease timestamps are `MicroTime`: RFC 3339 with microsecond precision.
mod micro_time {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Absent or null timestamps decode to the epoch
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(DateTime::<Utc>::default()),
            Some(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(serde::de::Error::custom),
        }
    }
}
