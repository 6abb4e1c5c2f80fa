//! Admission hooks for managed ConfigMaps.
//!
//! - `/validate-configmap` rejects managed ConfigMaps missing required keys
//! - `/mutate-configmap` adds the `app.kubernetes.io/managed-by` label

use crate::policy::{MANAGED_BY_LABEL, OPERATOR_NAME, is_managed, missing_required_keys};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use operator_runtime::webhook::{AdmissionRequest, AdmissionResponse, Operation};
use operator_runtime::Context;
use serde_json::{Value, json};
use tracing::debug;

pub const VALIDATE_PATH: &str = "/validate-configmap";
pub const MUTATE_PATH: &str = "/mutate-configmap";

/// The ConfigMap under admission; `None` for deletes.
fn object(request: &AdmissionRequest) -> anyhow::Result<Option<ConfigMap>> {
    if request.operation == Some(Operation::Delete) {
        return Ok(None);
    }
    request
        .object
        .clone()
        .map(serde_json::from_value)
        .transpose()
        .map_err(Into::into)
}

pub async fn validate(_ctx: Context, request: AdmissionRequest) -> anyhow::Result<AdmissionResponse> {
    let cm = match object(&request) {
        Ok(Some(cm)) => cm,
        Ok(None) => return Ok(AdmissionResponse::allowed()),
        Err(e) => return Ok(AdmissionResponse::errored(400, e)),
    };
    if !is_managed(&cm) {
        return Ok(AdmissionResponse::allowed());
    }
    let missing = missing_required_keys(&cm);
    if missing.is_empty() {
        Ok(AdmissionResponse::allowed())
    } else {
        debug!(configmap = %cm.name_any(), missing = ?missing, "Denying ConfigMap");
        Ok(AdmissionResponse::denied(format!("missing required keys: {}", missing.join(", "))))
    }
}

pub async fn mutate(_ctx: Context, request: AdmissionRequest) -> anyhow::Result<AdmissionResponse> {
    let cm = match object(&request) {
        Ok(Some(cm)) => cm,
        Ok(None) => return Ok(AdmissionResponse::allowed()),
        Err(e) => return Ok(AdmissionResponse::errored(400, e)),
    };
    Ok(AdmissionResponse::allowed().with_patches(label_patches(&cm)))
}

fn label_patches(cm: &ConfigMap) -> Vec<Value> {
    if !is_managed(cm) || cm.labels().get(MANAGED_BY_LABEL).is_some_and(|v| v == OPERATOR_NAME) {
        return Vec::new();
    }
    // JSON Pointer escapes '/' as '~1'
    let path = format!("/metadata/labels/{}", MANAGED_BY_LABEL.replace('~', "~0").replace('/', "~1"));
    vec![json!({"op": "add", "path": path, "value": OPERATOR_NAME})]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{MANAGED_LABEL, REQUIRED_KEYS_ANNOTATION};

    fn request(operation: Operation, object: Value) -> AdmissionRequest {
        AdmissionRequest {
            uid: "uid-1".to_string(),
            operation: Some(operation),
            object: Some(object),
            ..AdmissionRequest::default()
        }
    }

    fn managed(data: Value) -> Value {
        json!({
            "metadata": {
                "name": "settings",
                "labels": {MANAGED_LABEL: "true"},
                "annotations": {REQUIRED_KEYS_ANNOTATION: "url"}
            },
            "data": data
        })
    }

    #[tokio::test]
    async fn test_validate_denies_missing_keys() {
        let response = validate(Context::root(), request(Operation::Create, managed(json!({}))))
            .await
            .unwrap();
        assert!(!response.allowed);
        let status = response.status.unwrap();
        assert_eq!(status.code, Some(403));
        assert_eq!(status.message.as_deref(), Some("missing required keys: url"));
    }

    #[tokio::test]
    async fn test_validate_allows_complete_and_unmanaged() {
        let ok = validate(Context::root(), request(Operation::Update, managed(json!({"url": "x"}))))
            .await
            .unwrap();
        assert!(ok.allowed);

        let unmanaged = validate(Context::root(), request(Operation::Create, json!({"metadata": {"name": "a"}})))
            .await
            .unwrap();
        assert!(unmanaged.allowed);
    }

    #[tokio::test]
    async fn test_validate_allows_delete() {
        let mut req = request(Operation::Delete, Value::Null);
        req.object = None;
        assert!(validate(Context::root(), req).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_validate_rejects_undecodable_object() {
        let response = validate(Context::root(), request(Operation::Create, json!({"data": 5})))
            .await
            .unwrap();
        assert!(!response.allowed);
        assert_eq!(response.status.unwrap().code, Some(400));
    }

    #[tokio::test]
    async fn test_mutate_adds_managed_by_label() {
        let response = mutate(Context::root(), request(Operation::Create, managed(json!({"url": "x"}))))
            .await
            .unwrap();
        assert!(response.allowed);
        assert_eq!(
            response.patches,
            vec![json!({
                "op": "add",
                "path": "/metadata/labels/app.kubernetes.io~1managed-by",
                "value": "configmap-operator"
            })]
        );
    }

    #[tokio::test]
    async fn test_mutate_leaves_unmanaged_alone() {
        let response = mutate(Context::root(), request(Operation::Create, json!({"metadata": {"name": "a"}})))
            .await
            .unwrap();
        assert!(response.allowed);
        assert!(response.patches.is_empty());
    }
}
