//! Runtime configuration from environment variables
//!
//! | Variable | Default |
//! |---|---|
//! | `WATCH_NAMESPACE` | all namespaces |
//! | `LEADER_ELECT` | `false` |
//! | `LEASE_NAME` | `<operator>-leader` |
//! | `LEASE_NAMESPACE` | `default` |
//! | `LEASE_DURATION_SECONDS` | `15` |
//! | `RENEW_DEADLINE_SECONDS` | `10` |
//! | `RETRY_PERIOD_SECONDS` | `2` |
//! | `LEADER_ELECTION_ID` | hostname + random suffix |
//! | `RELEASE_ON_CANCEL` | `false` |
//! | `WEBHOOK_ENABLED` | `true` |
//! | `WEBHOOK_BIND_ADDRESS` | `0.0.0.0:8443` |
//! | `MAX_CONCURRENT_RECONCILES` | unbounded |
//! | `ERROR_BACKOFF_MIN_MS` / `ERROR_BACKOFF_MAX_MS` | unset: immediate requeue |

use crate::backoff::BackoffConfig;
use crate::controller::ControllerConfig;
use crate::error::ConfigError;
use crate::leader::{LeaderElectionConfig, default_identity};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_WEBHOOK_BIND_ADDRESS: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8443);

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Namespace to watch; `None` watches all namespaces
    pub watch_namespace: Option<String>,
    pub leader_elect: bool,
    pub lease_name: String,
    pub lease_namespace: String,
    /// Candidate identity written into the lease
    pub identity: String,
    pub leader_election: LeaderElectionConfig,
    pub webhook_enabled: bool,
    pub webhook_bind_address: SocketAddr,
    pub controller: ControllerConfig,
}

impl RuntimeConfig {
    /// Reads the process environment. `operator_name` names the default lease.
    pub fn from_env(operator_name: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(operator_name, |key| std::env::var(key).ok())
    }

    /// Like [`RuntimeConfig::from_env`] with a custom variable source.
    pub fn from_lookup(operator_name: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let leader_election = LeaderElectionConfig {
            lease_duration: Duration::from_secs(parse(&get, "LEASE_DURATION_SECONDS")?.unwrap_or(15)),
            renew_deadline: Duration::from_secs(parse(&get, "RENEW_DEADLINE_SECONDS")?.unwrap_or(10)),
            retry_period: Duration::from_secs(parse(&get, "RETRY_PERIOD_SECONDS")?.unwrap_or(2)),
            release_on_cancel: parse_bool(&get, "RELEASE_ON_CANCEL")?.unwrap_or(false),
        };

        let min_ms: Option<u64> = parse(&get, "ERROR_BACKOFF_MIN_MS")?;
        let max_ms: Option<u64> = parse(&get, "ERROR_BACKOFF_MAX_MS")?;
        let error_backoff = match (min_ms, max_ms) {
            (None, None) => None,
            (min, max) => {
                let defaults = BackoffConfig::default();
                let min = min.map_or(defaults.min, Duration::from_millis);
                let max = max.map_or(defaults.max, Duration::from_millis);
                if min.is_zero() || max < min {
                    return Err(ConfigError::Invalid {
                        key: "ERROR_BACKOFF_MAX_MS".to_string(),
                        value: format!("min={}ms max={}ms", min.as_millis(), max.as_millis()),
                    });
                }
                Some(BackoffConfig { min, max })
            }
        };

        let max_concurrent_reconciles: Option<usize> = parse(&get, "MAX_CONCURRENT_RECONCILES")?;
        if max_concurrent_reconciles == Some(0) {
            return Err(ConfigError::Invalid {
                key: "MAX_CONCURRENT_RECONCILES".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(Self {
            watch_namespace: get("WATCH_NAMESPACE"),
            leader_elect: parse_bool(&get, "LEADER_ELECT")?.unwrap_or(false),
            lease_name: get("LEASE_NAME").unwrap_or_else(|| format!("{operator_name}-leader")),
            lease_namespace: get("LEASE_NAMESPACE").unwrap_or_else(|| "default".to_string()),
            identity: get("LEADER_ELECTION_ID").unwrap_or_else(default_identity),
            leader_election,
            webhook_enabled: parse_bool(&get, "WEBHOOK_ENABLED")?.unwrap_or(true),
            webhook_bind_address: parse(&get, "WEBHOOK_BIND_ADDRESS")?.unwrap_or(DEFAULT_WEBHOOK_BIND_ADDRESS),
            controller: ControllerConfig {
                max_concurrent_reconciles,
                error_backoff,
            },
        })
    }
}

fn parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError> {
    get(key)
        .map(|value| {
            value.parse().map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value,
            })
        })
        .transpose()
}

fn parse_bool(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>, ConfigError> {
    get(key)
        .map(|value| match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key: key.to_string(),
                value,
            }),
        })
        .transpose()
}
