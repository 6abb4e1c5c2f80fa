//! Hierarchical cancellation context.
//!
//! A [`Context`] is a node in a tree. Cancelling a node cancels every
//! descendant; cancelling a child never touches its parent or siblings.
//! Propagation rides on [`CancellationToken::child_token`], so a cancelled
//! ancestor reaches live descendants without the `Context` tree keeping a
//! registry of children. Each node keeps an explicit parent reference, used to
//! resolve the cancellation reason and the inherited values.
//!
//! Cancellation is cooperative: long-running work observes it through
//! [`Context::cancelled`] or [`Context::run_until_cancelled`].

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Effective key/value view of a context.
pub type Values = BTreeMap<String, Value>;

/// Error produced when a context is cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("context cancelled: {reason}")]
pub struct Cancelled {
    /// Reason given to the first `cancel` that settled the signal
    pub reason: String,
}

struct Inner {
    token: CancellationToken,
    reason: OnceLock<String>,
    parent: Option<Context>,
    /// Snapshot of the parent's effective values taken at fork time
    inherited: Arc<Values>,
    own: RwLock<Values>,
    merged: RwLock<Option<Arc<Values>>>,
}

/// Cancellation and value propagation token.
///
/// Cheap to clone; clones share the same node. Construct only through
/// [`Context::root`] or [`Context::fork`].
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// Creates a root context with its own cancellation signal.
    #[must_use]
    pub fn root() -> Self {
        Self::from_parts(CancellationToken::new(), None, Arc::new(Values::new()))
    }

    /// Forks a child that is cancelled when either it or any ancestor is.
    ///
    /// The child starts with a copy of this context's effective values; later
    /// inserts on either side stay local.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self::from_parts(self.inner.token.child_token(), Some(self.clone()), self.values())
    }

    /// Forks a child carrying an extra value.
    #[must_use]
    pub fn fork_with(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let child = self.fork();
        child.insert(key, value);
        child
    }

    fn from_parts(token: CancellationToken, parent: Option<Context>, inherited: Arc<Values>) -> Self {
        Self {
            inner: Arc::new(Inner {
                token,
                reason: OnceLock::new(),
                parent,
                inherited,
                own: RwLock::new(Values::new()),
                merged: RwLock::new(None),
            }),
        }
    }

    /// Settles this context's signal with `reason`.
    ///
    /// Returns false when the context was already cancelled, by itself or an
    /// ancestor; the first reason is kept.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        if self.inner.token.is_cancelled() {
            return false;
        }
        if self.inner.reason.set(reason.into()).is_err() {
            return false;
        }
        self.inner.token.cancel();
        true
    }

    /// Returns true once this context or any ancestor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Reason of the cancellation that reached this context, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        if !self.is_cancelled() {
            return None;
        }
        let mut node = Some(self);
        while let Some(ctx) = node {
            if let Some(reason) = ctx.inner.reason.get() {
                return Some(reason.clone());
            }
            node = ctx.inner.parent.as_ref();
        }
        Some(String::new())
    }

    /// Resolves once cancelled; never resolves otherwise.
    pub async fn done(&self) -> Cancelled {
        self.inner.token.cancelled().await;
        Cancelled {
            reason: self.reason().unwrap_or_default(),
        }
    }

    /// Resolves once cancelled, without the reason.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// Races `fut` against cancellation.
    pub async fn run_until_cancelled<F>(&self, fut: F) -> Result<F::Output, Cancelled>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            cancelled = self.done() => Err(cancelled),
            output = fut => Ok(output),
        }
    }

    /// Sets a value visible to this context and contexts forked from it later.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner
            .own
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
        *self.inner.merged.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Looks up a single value.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<Value> {
        self.values().get(key).cloned()
    }

    /// Effective values: own entries override inherited ones.
    ///
    /// Computed on first access and cached until the next `insert`.
    #[must_use]
    pub fn values(&self) -> Arc<Values> {
        if let Some(cached) = self.inner.merged.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            return cached.clone();
        }
        let own = self.inner.own.read().unwrap_or_else(PoisonError::into_inner);
        let merged = if own.is_empty() {
            self.inner.inherited.clone()
        } else {
            let mut values = (*self.inner.inherited).clone();
            values.extend(own.iter().map(|(k, v)| (k.clone(), v.clone())));
            Arc::new(values)
        };
        drop(own);
        *self.inner.merged.write().unwrap_or_else(PoisonError::into_inner) = Some(merged.clone());
        merged
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .field("values", &self.values())
            .finish()
    }
}
