//! ConfigMap Operator
//!
//! Watches ConfigMaps labelled `configmap-operator.microscaler.io/managed=true`,
//! records a digest of their data and guards them with admission webhooks:
//! - Validating: managed ConfigMaps must carry every key listed in their
//!   `required-keys` annotation
//! - Mutating: managed ConfigMaps get `app.kubernetes.io/managed-by`
//!
//! With `LEADER_ELECT=true` only the replica holding the Lease reconciles.

mod admission;
mod error;
mod policy;
mod reconciler;

use crate::error::OperatorError;
use crate::policy::{MANAGED_LABEL, OPERATOR_NAME};
use crate::reconciler::ConfigMapReconciler;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use kube_runtime::watcher;
use operator_runtime::{Controller, KindSource, Manager, RuntimeConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), OperatorError> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| OperatorError::Configuration("failed to install rustls crypto provider".to_string()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Starting ConfigMap Operator");

    let config = RuntimeConfig::from_env(OPERATOR_NAME)?;
    info!("Configuration:");
    info!("  Namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Leader election: {}", config.leader_elect);
    if config.leader_elect {
        info!("  Lease: {}/{}", config.lease_namespace, config.lease_name);
        info!("  Identity: {}", config.identity);
    }
    if config.webhook_enabled {
        info!("  Webhook address: {}", config.webhook_bind_address);
    }

    let client = Client::try_default().await?;
    let api: Api<ConfigMap> = match &config.watch_namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };

    let controller = Controller::with_config(
        "configmap",
        ConfigMapReconciler::new(client.clone()),
        config.controller.clone(),
    );
    let selector = format!("{MANAGED_LABEL}=true");
    controller.watch(KindSource::new(api, watcher::Config::default().labels(&selector)));

    let mut manager = Manager::from_config(client, &config, OPERATOR_NAME);
    if let Some(server) = manager.webhook() {
        server.register(admission::VALIDATE_PATH, admission::validate)?;
        server.register(admission::MUTATE_PATH, admission::mutate)?;
    }
    manager.add(controller);
    manager.run().await?;

    info!("ConfigMap Operator stopped");
    Ok(())
}
