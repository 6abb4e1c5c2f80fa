//! Operator error types.

use operator_runtime::{ConfigError, ManagerError, WebhookError};
use thiserror::Error;

/// Errors that can occur in the ConfigMap Operator.
#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Kubernetes client error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    /// A managed ConfigMap lacks keys listed in its required-keys annotation
    #[error("ConfigMap {name} is missing required keys: {}", keys.join(", "))]
    MissingKeys { name: String, keys: Vec<String> },
}
