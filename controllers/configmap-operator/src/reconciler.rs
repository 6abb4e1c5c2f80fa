//! Reconciliation of managed ConfigMaps.
//!
//! A managed ConfigMap gets its data digest recorded in an annotation and the
//! `app.kubernetes.io/managed-by` label. A ConfigMap missing required keys is
//! a terminal error: retrying cannot fix it until the object itself changes,
//! which produces a new request anyway.

use crate::error::OperatorError;
use crate::policy::{DIGEST_ANNOTATION, MANAGED_BY_LABEL, OPERATOR_NAME, data_digest, is_managed, missing_required_keys};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use operator_runtime::{Action, Context, Reconciler, Request, terminal};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

/// Periodic resync to catch drift the watch missed
pub const RESYNC_PERIOD: Duration = Duration::from_secs(300);

pub struct ConfigMapReconciler {
    client: Client,
}

impl ConfigMapReconciler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// What a reconcile must change on a ConfigMap, if anything.
#[derive(Debug, PartialEq)]
pub(crate) enum Plan {
    Ignore,
    Invalid(Vec<String>),
    UpToDate,
    Stamp(serde_json::Value),
}

pub(crate) fn plan(cm: &ConfigMap) -> Plan {
    if !is_managed(cm) {
        return Plan::Ignore;
    }
    let missing = missing_required_keys(cm);
    if !missing.is_empty() {
        return Plan::Invalid(missing);
    }
    let digest = data_digest(cm);
    let stamped = cm.annotations().get(DIGEST_ANNOTATION) == Some(&digest);
    let labelled = cm.labels().get(MANAGED_BY_LABEL).is_some_and(|v| v == OPERATOR_NAME);
    if stamped && labelled {
        return Plan::UpToDate;
    }
    Plan::Stamp(json!({
        "metadata": {
            "annotations": { DIGEST_ANNOTATION: digest },
            "labels": { MANAGED_BY_LABEL: OPERATOR_NAME }
        }
    }))
}

#[async_trait]
impl Reconciler for ConfigMapReconciler {
    async fn reconcile(&self, ctx: Context, request: Request) -> anyhow::Result<Action> {
        let Some(namespace) = request.namespace.as_deref() else {
            return Err(terminal(OperatorError::Configuration(format!(
                "ConfigMap request without namespace: {request}"
            ))));
        };
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);

        let Some(cm) = ctx.run_until_cancelled(api.get_opt(&request.name)).await?? else {
            debug!("ConfigMap is gone");
            return Ok(Action::NoRequeue);
        };

        match plan(&cm) {
            Plan::Ignore => Ok(Action::NoRequeue),
            Plan::Invalid(keys) => Err(terminal(OperatorError::MissingKeys {
                name: request.to_string(),
                keys,
            })),
            Plan::UpToDate => Ok(Action::RequeueAfter(RESYNC_PERIOD)),
            Plan::Stamp(patch) => {
                let params = PatchParams::default();
                ctx.run_until_cancelled(api.patch(&request.name, &params, &Patch::Merge(&patch)))
                    .await??;
                info!(configmap = %request, "Stamped ConfigMap data digest");
                Ok(Action::RequeueAfter(RESYNC_PERIOD))
            }
        }
    }
}
