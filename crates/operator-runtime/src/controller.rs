//! Reconciliation loop.
//!
//! A [`Controller`] owns a [`WorkQueue`] and a [`Reconciler`]. Once started it
//! drains the queue, runs one reconciliation per dequeued request and applies
//! the requeue policy to the outcome:
//!
//! - `Ok(Action::NoRequeue)`: done
//! - `Ok(Action::RequeueNow)`: enqueued again immediately
//! - `Ok(Action::RequeueAfter(d))`: enqueued again after `d`
//! - `Err` carrying a [`TerminalError`](crate::TerminalError): dropped
//! - any other `Err` or a panic: enqueued again, immediately or after a
//!   per-request Fibonacci backoff when [`ControllerConfig::error_backoff`] is set
//!
//! Reconciliations of different requests run concurrently. There is no
//! single-flight guarantee per key: two queued requests for the same object
//! may be reconciled at the same time.

use crate::backoff::{BackoffConfig, FibonacciBackoff};
use crate::context::Context;
use crate::error::ControllerError;
use crate::queue::WorkQueue;
use crate::reconciler::{Action, RECONCILE_ID_KEY, Reconciler, Request, is_terminal};
use crate::source::Source;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Tuning for a controller's reconcile loop.
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    /// Upper bound on in-flight reconciliations; unbounded when `None`
    pub max_concurrent_reconciles: Option<usize>,
    /// Per-request backoff for failed reconciliations; immediate requeue when `None`
    pub error_backoff: Option<BackoffConfig>,
}

enum State {
    NotStarted { pending: Vec<Box<dyn Source>> },
    Started { ctx: Context },
}

struct Inner {
    name: String,
    reconciler: Arc<dyn Reconciler>,
    queue: WorkQueue<Request>,
    config: ControllerConfig,
    state: Mutex<State>,
    backoffs: Mutex<HashMap<Request, FibonacciBackoff>>,
}

/// Drives a [`Reconciler`] from a queue of [`Request`]s. Clones share state.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    /// Creates a controller named `name` (used in logs) around `reconciler`.
    pub fn new(name: impl Into<String>, reconciler: impl Reconciler) -> Self {
        Self::with_config(name, reconciler, ControllerConfig::default())
    }

    pub fn with_config(name: impl Into<String>, reconciler: impl Reconciler, config: ControllerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                reconciler: Arc::new(reconciler),
                queue: WorkQueue::new(),
                config,
                state: Mutex::new(State::NotStarted { pending: Vec::new() }),
                backoffs: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The controller's queue; enqueueing here triggers reconciliation.
    #[must_use]
    pub fn queue(&self) -> WorkQueue<Request> {
        self.inner.queue.clone()
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        matches!(*self.inner.lock_state(), State::Started { .. })
    }

    /// Registers a source. Buffered until [`Controller::start`], started
    /// right away afterwards.
    pub fn watch(&self, source: impl Source) {
        let mut state = self.inner.lock_state();
        match &mut *state {
            State::NotStarted { pending } => pending.push(Box::new(source)),
            State::Started { ctx } => {
                source.start(ctx.clone(), self.inner.queue.clone());
            }
        }
    }

    /// Starts the reconcile loop and every buffered source under `ctx`.
    ///
    /// One-shot: a second call fails with [`ControllerError::AlreadyStarted`].
    /// The returned task finishes once `ctx` is cancelled and in-flight
    /// reconciliations have completed.
    pub fn start(&self, ctx: Context) -> Result<JoinHandle<()>, ControllerError> {
        let pending = {
            let mut state = self.inner.lock_state();
            let State::NotStarted { pending } = &mut *state else {
                return Err(ControllerError::AlreadyStarted(self.inner.name.clone()));
            };
            let pending = std::mem::take(pending);
            *state = State::Started { ctx: ctx.clone() };
            pending
        };

        info!(controller = %self.inner.name, sources = pending.len(), "Starting controller");
        for source in pending {
            source.start(ctx.clone(), self.inner.queue.clone());
        }
        Ok(tokio::spawn(self.inner.clone().run(ctx)))
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.inner.name)
            .field("queue", &self.inner.queue)
            .field("config", &self.inner.config)
            .field("started", &self.is_started())
            .finish()
    }
}

type Outcome = Result<anyhow::Result<Action>, Box<dyn Any + Send>>;

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>, ctx: Context) {
        let limiter = self
            .config
            .max_concurrent_reconciles
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                () = ctx.cancelled() => break,
                () = self.queue.notified() => {}
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => continue,
            }

            // One wake may cover several enqueues
            while !ctx.is_cancelled() {
                let Some(request) = self.queue.dequeue() else {
                    break;
                };
                let permit = match &limiter {
                    Some(limiter) => match ctx.run_until_cancelled(limiter.clone().acquire_owned()).await {
                        Ok(Ok(permit)) => Some(permit),
                        _ => {
                            self.queue.enqueue(request);
                            break;
                        }
                    },
                    None => None,
                };
                let inner = self.clone();
                let ctx = ctx.clone();
                in_flight.spawn(async move {
                    inner.reconcile_one(&ctx, request).await;
                    drop(permit);
                });
            }
        }

        info!(
            controller = %self.name,
            in_flight = in_flight.len(),
            "Controller stopping, waiting for in-flight reconciliations"
        );
        while in_flight.join_next().await.is_some() {}
        info!(controller = %self.name, "Controller stopped");
    }

    async fn reconcile_one(self: &Arc<Self>, ctx: &Context, request: Request) {
        let reconcile_id = Uuid::new_v4().to_string();
        let child = ctx.fork_with(RECONCILE_ID_KEY, reconcile_id.clone());
        let span = info_span!(
            "reconcile",
            controller = %self.name,
            request = %request,
            reconcile_id = %reconcile_id
        );

        let outcome: Outcome = AssertUnwindSafe(async {
            debug!("Reconciling");
            self.reconciler.reconcile(child, request.clone()).await
        })
        .catch_unwind()
        .instrument(span.clone())
        .await;

        span.in_scope(|| self.handle_outcome(ctx, request, outcome));
    }

    fn handle_outcome(&self, ctx: &Context, request: Request, outcome: Outcome) {
        match outcome {
            Ok(Ok(action)) => {
                self.reset_backoff(&request);
                match action {
                    Action::NoRequeue => debug!("Reconciled"),
                    Action::RequeueNow => {
                        debug!("Reconciled, requeueing now");
                        self.queue.enqueue(request);
                    }
                    Action::RequeueAfter(delay) => {
                        debug!(delay_ms = delay.as_millis(), "Reconciled, requeueing after delay");
                        self.requeue_after(ctx, request, delay);
                    }
                }
            }
            Ok(Err(err)) if is_terminal(&err) => {
                warn!(error = %format!("{err:#}"), "Terminal reconcile error, dropping request");
                self.reset_backoff(&request);
            }
            Ok(Err(err)) => {
                error!(error = %format!("{err:#}"), "Reconcile failed, requeueing");
                self.requeue_on_error(ctx, request);
            }
            Err(_) => {
                error!("Reconciler panicked, requeueing");
                self.requeue_on_error(ctx, request);
            }
        }
    }

    fn requeue_on_error(&self, ctx: &Context, request: Request) {
        let Some(config) = self.config.error_backoff else {
            self.queue.enqueue(request);
            return;
        };
        let delay = self
            .backoffs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(request.clone())
            .or_insert_with(|| FibonacciBackoff::new(config))
            .next_backoff();
        debug!(delay_ms = delay.as_millis(), "Backing off before retry");
        self.requeue_after(ctx, request, delay);
    }

    fn reset_backoff(&self, request: &Request) {
        if self.config.error_backoff.is_some() {
            self.backoffs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(request);
        }
    }

    /// Re-enqueues after `delay` unless the controller's context is cancelled first.
    fn requeue_after(&self, ctx: &Context, request: Request, delay: Duration) {
        if delay.is_zero() {
            self.queue.enqueue(request);
            return;
        }
        let queue = self.queue.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if ctx.run_until_cancelled(tokio::time::sleep(delay)).await.is_ok() {
                queue.enqueue(request);
            }
        });
    }
}
