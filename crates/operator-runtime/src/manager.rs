//! Composition root
//!
//! The [`Manager`] owns the root [`Context`]. Every controller, the webhook
//! server and the leader elector run under a fork of it, so cancelling the
//! root (ctrl-c, [`Manager::shutdown`], or lost leadership) stops them all.

use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::controller::Controller;
use crate::error::ManagerError;
use crate::leader::{LeaderCallbacks, LeaderElectionConfig, LeaderElector};
use crate::webhook::WebhookServer;
use async_trait::async_trait;
use lease_lock::{KubeLeaseLock, LeaseLockTrait};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

type Handles = Arc<Mutex<Vec<JoinHandle<()>>>>;

struct LeaderElection {
    lock: Arc<dyn LeaseLockTrait>,
    config: LeaderElectionConfig,
}

pub struct Manager {
    ctx: Context,
    controllers: Vec<Controller>,
    webhook: Option<WebhookServer>,
    leader_election: Option<LeaderElection>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ctx: Context::root(),
            controllers: Vec::new(),
            webhook: None,
            leader_election: None,
        }
    }

    /// Builds a manager from `config`: a webhook server when enabled and a
    /// Lease-backed elector when `leader_elect` is set.
    #[must_use]
    pub fn from_config(client: kube::Client, config: &RuntimeConfig, component: &str) -> Self {
        let mut manager = Self::new();
        if config.webhook_enabled {
            manager = manager.with_webhook(WebhookServer::new(config.webhook_bind_address));
        }
        if config.leader_elect {
            let lock = KubeLeaseLock::new(
                client,
                config.lease_namespace.as_str(),
                config.lease_name.as_str(),
                config.identity.as_str(),
                component,
            );
            manager = manager.with_leader_election(Arc::new(lock), config.leader_election.clone());
        }
        manager
    }

    #[must_use]
    pub fn with_webhook(mut self, server: WebhookServer) -> Self {
        self.webhook = Some(server);
        self
    }

    /// Gates controller start on holding the lease behind `lock`.
    #[must_use]
    pub fn with_leader_election(mut self, lock: Arc<dyn LeaseLockTrait>, config: LeaderElectionConfig) -> Self {
        self.leader_election = Some(LeaderElection { lock, config });
        self
    }

    pub fn add(&mut self, controller: Controller) {
        self.controllers.push(controller);
    }

    /// The root context. Cancelling it shuts the manager down.
    #[must_use]
    pub fn context(&self) -> Context {
        self.ctx.clone()
    }

    #[must_use]
    pub fn webhook(&self) -> Option<&WebhookServer> {
        self.webhook.as_ref()
    }

    pub fn shutdown(&self, reason: &str) {
        self.ctx.cancel(reason);
    }

    /// Runs until the root context is cancelled, then waits for controllers
    /// to drain and the webhook server to stop.
    pub async fn run(self) -> Result<(), ManagerError> {
        let root = self.ctx.clone();
        spawn_signal_handler(root.clone());

        let webhook = match &self.webhook {
            Some(server) => Some(server.start(root.fork()).await?),
            None => None,
        };

        let handles: Handles = Arc::new(Mutex::new(Vec::new()));
        match self.leader_election {
            None => {
                start_controllers(&self.controllers, &root, &handles);
                root.cancelled().await;
            }
            Some(LeaderElection { lock, config }) => {
                let callbacks = ManagerCallbacks {
                    controllers: self.controllers.clone(),
                    handles: handles.clone(),
                    root: root.clone(),
                };
                let elector = LeaderElector::new(lock, config, Arc::new(callbacks))?;
                elector.run(root.fork()).await;
                if !root.is_cancelled() {
                    warn!(identity = %elector.identity(), "Leadership lost, shutting down");
                    root.cancel("leadership lost");
                }
            }
        }

        info!(reason = ?root.reason(), "Manager shutting down");
        let handles: Vec<_> = std::mem::take(&mut *handles.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            handle.await?;
        }
        if let Some(task) = webhook {
            task.await??;
        }
        info!("Manager stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("ctx", &self.ctx)
            .field("controllers", &self.controllers)
            .field("webhook", &self.webhook)
            .field("leader_election", &self.leader_election.is_some())
            .finish()
    }
}

fn start_controllers(controllers: &[Controller], ctx: &Context, handles: &Handles) {
    let mut handles = handles.lock().unwrap_or_else(PoisonError::into_inner);
    for controller in controllers {
        match controller.start(ctx.fork()) {
            Ok(handle) => handles.push(handle),
            Err(e) => error!(controller = %controller.name(), error = %e, "Failed to start controller"),
        }
    }
}

fn spawn_signal_handler(root: Context) {
    tokio::spawn(async move {
        tokio::select! {
            () = root.cancelled() => {}
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => {
                    info!("Received interrupt, shutting down");
                    root.cancel("interrupted");
                }
                Err(e) => warn!(error = %e, "Failed to listen for interrupt"),
            },
        }
    });
}

struct ManagerCallbacks {
    controllers: Vec<Controller>,
    handles: Handles,
    root: Context,
}

#[async_trait]
impl LeaderCallbacks for ManagerCallbacks {
    async fn on_started_leading(&self, ctx: Context) {
        info!(controllers = self.controllers.len(), "Started leading, starting controllers");
        start_controllers(&self.controllers, &ctx, &self.handles);
    }

    async fn on_stopped_leading(&self) {
        self.root.cancel("leadership lost");
    }

    async fn on_new_leader(&self, identity: String) {
        info!(leader = %identity, "Observed leader");
    }
}
