//! Error types for the operator runtime

use thiserror::Error;

/// Errors returned by [`Controller`](crate::Controller)
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("controller {0} already started")]
    AlreadyStarted(String),
}

/// Errors returned while configuring or running leader election
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    #[error("invalid leader election config: {0}")]
    InvalidConfig(String),
}

/// Errors returned by the admission [`WebhookServer`](crate::WebhookServer)
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("a hook is already registered for path {0}")]
    DuplicatePath(String),

    #[error("webhook path must start with '/': {0}")]
    InvalidPath(String),

    #[error("webhook server already started")]
    AlreadyStarted,

    #[error("failed to bind webhook server to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("webhook server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Errors reading [`RuntimeConfig`](crate::RuntimeConfig) from the environment
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

/// Errors returned by [`Manager`](crate::Manager)
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    LeaderElection(#[from] LeaderElectionError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
