//! Reconciler contract.
//!
//! A [`Reconciler`] receives a [`Request`] naming the object that changed and
//! answers with an [`Action`]. Errors are retried unless they carry a
//! [`TerminalError`] somewhere in their chain.

use crate::context::Context;
use kube::Resource;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Context key holding the per-reconcile identifier.
pub const RECONCILE_ID_KEY: &str = "reconcileID";

/// Identifies the object to reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Request {
    pub name: String,
    /// `None` for cluster-scoped objects
    pub namespace: Option<String>,
}

impl Request {
    pub fn new(name: impl Into<String>, namespace: Option<String>) -> Self {
        Self {
            name: name.into(),
            namespace,
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(name, Some(namespace.into()))
    }

    /// Builds a request from an object's metadata; `None` when it has no name.
    pub fn from_object<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        let name = meta.name.clone()?;
        Some(Self::new(name, meta.namespace.clone()))
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Outcome of a successful reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Done until the next watch event
    #[default]
    NoRequeue,
    /// Put the request back on the queue right away
    RequeueNow,
    /// Put the request back on the queue after the delay
    RequeueAfter(Duration),
}

impl Action {
    #[must_use]
    pub fn requeue_after(delay: Duration) -> Self {
        Self::RequeueAfter(delay)
    }
}

impl From<()> for Action {
    fn from((): ()) -> Self {
        Self::NoRequeue
    }
}

/// `true` asks for an immediate requeue.
impl From<bool> for Action {
    fn from(requeue: bool) -> Self {
        if requeue { Self::RequeueNow } else { Self::NoRequeue }
    }
}

impl From<Duration> for Action {
    fn from(delay: Duration) -> Self {
        Self::RequeueAfter(delay)
    }
}

/// Marks an error as not worth retrying; the request is dropped.
#[derive(Debug, Error)]
#[error("terminal error: {source}")]
pub struct TerminalError {
    #[source]
    source: anyhow::Error,
}

impl TerminalError {
    pub fn new(cause: impl Into<anyhow::Error>) -> Self {
        Self {
            source: cause.into(),
        }
    }

    /// The wrapped cause.
    #[must_use]
    pub fn cause(&self) -> &anyhow::Error {
        &self.source
    }
}

/// Wraps `cause` as a terminal `anyhow::Error`.
pub fn terminal(cause: impl Into<anyhow::Error>) -> anyhow::Error {
    TerminalError::new(cause).into()
}

/// Returns true if `err` or anything in its chain is a [`TerminalError`].
#[must_use]
pub fn is_terminal(err: &anyhow::Error) -> bool {
    err.is::<TerminalError>() || err.chain().any(|cause| cause.is::<TerminalError>())
}

/// User reconciliation logic.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Brings the object named by `request` toward its desired state.
    ///
    /// `ctx` is a per-reconcile child context carrying [`RECONCILE_ID_KEY`].
    async fn reconcile(&self, ctx: Context, request: Request) -> anyhow::Result<Action>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context as _;

    #[test]
    fn test_request_display() {
        assert_eq!(Request::namespaced("default", "cm").to_string(), "default/cm");
        assert_eq!(Request::new("node-1", None).to_string(), "node-1");
    }

    #[test]
    fn test_action_conversions() {
        assert_eq!(Action::from(()), Action::NoRequeue);
        assert_eq!(Action::from(true), Action::RequeueNow);
        assert_eq!(Action::from(false), Action::NoRequeue);
        assert_eq!(
            Action::from(Duration::from_secs(3)),
            Action::RequeueAfter(Duration::from_secs(3))
        );
        assert_eq!(Action::default(), Action::NoRequeue);
    }

    #[test]
    fn test_terminal_detection() {
        let err = terminal(anyhow::anyhow!("invalid spec"));
        assert!(is_terminal(&err));
        assert!(err.to_string().contains("invalid spec"));

        let plain = anyhow::anyhow!("api timeout");
        assert!(!is_terminal(&plain));
    }

    #[test]
    fn test_terminal_detection_through_context() {
        let err: anyhow::Result<()> = Err(terminal(anyhow::anyhow!("bad")));
        let wrapped = err.context("reconciling default/cm").unwrap_err();
        assert!(is_terminal(&wrapped));
    }

    #[test]
    fn test_request_from_object() {
        use k8s_openapi::api::core::v1::ConfigMap;
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".to_string()),
                namespace: Some("apps".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(Request::from_object(&cm), Some(Request::namespaced("apps", "settings")));
        assert_eq!(Request::from_object(&ConfigMap::default()), None);
    }
}
