//! Operator Runtime
//!
//! Building blocks for Kubernetes operators: a work queue feeding a
//! reconciliation loop, hierarchical cancellation, Lease-based leader
//! election and an admission webhook server, composed by a [`Manager`].
//!
//! # Example
//!
//! ```no_run
//! use operator_runtime::{Action, Context, Controller, KindSource, Manager, Reconciler, Request};
//! use k8s_openapi::api::core::v1::ConfigMap;
//! use kube::runtime::watcher;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Reconciler for Echo {
//!     async fn reconcile(&self, _ctx: Context, request: Request) -> anyhow::Result<Action> {
//!         println!("reconciling {request}");
//!         Ok(Action::NoRequeue)
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let client = kube::Client::try_default().await?;
//! let controller = Controller::new("echo", Echo);
//! controller.watch(KindSource::new(kube::Api::<ConfigMap>::all(client), watcher::Config::default()));
//!
//! let mut manager = Manager::new();
//! manager.add(controller);
//! manager.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Cooperative cancellation**: [`Context`] trees; cancelling a node
//!   cancels every descendant
//! - **Requeue policy**: [`Action`] and [`TerminalError`] decide whether a
//!   request is retried
//! - **Leader election**: [`LeaderElector`] over any
//!   [`LeaseLockTrait`](lease_lock::LeaseLockTrait)
//! - **Admission**: [`WebhookServer`] answers `AdmissionReview`s

pub mod backoff;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod leader;
pub mod manager;
pub mod queue;
pub mod reconciler;
pub mod source;
pub mod webhook;

pub use backoff::{BackoffConfig, FibonacciBackoff};
pub use config::RuntimeConfig;
pub use context::{Cancelled, Context};
pub use controller::{Controller, ControllerConfig};
pub use error::{ConfigError, ControllerError, LeaderElectionError, ManagerError, WebhookError};
pub use leader::{LeaderCallbacks, LeaderElectionConfig, LeaderElector, default_identity};
pub use manager::Manager;
pub use queue::WorkQueue;
pub use reconciler::{Action, RECONCILE_ID_KEY, Reconciler, Request, TerminalError, is_terminal, terminal};
pub use source::{ChannelSource, KindSource, Source};
pub use webhook::{AdmissionHook, AdmissionRequest, AdmissionResponse, AdmissionReview, WebhookServer};
