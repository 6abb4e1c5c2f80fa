//! Rules for managed ConfigMaps, shared by the reconciler and the admission hooks.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use serde_json::json;
use uuid::Uuid;

pub const OPERATOR_NAME: &str = "configmap-operator";
/// Opt-in label; only ConfigMaps with `<label>=true` are managed
pub const MANAGED_LABEL: &str = "configmap-operator.microscaler.io/managed";
/// Comma-separated keys that must be present in `data` or `binaryData`
pub const REQUIRED_KEYS_ANNOTATION: &str = "configmap-operator.microscaler.io/required-keys";
pub const DIGEST_ANNOTATION: &str = "configmap-operator.microscaler.io/data-digest";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

pub fn is_managed(cm: &ConfigMap) -> bool {
    cm.labels().get(MANAGED_LABEL).is_some_and(|v| v == "true")
}

/// Keys named by the required-keys annotation that the ConfigMap lacks, in
/// annotation order.
pub fn missing_required_keys(cm: &ConfigMap) -> Vec<String> {
    let Some(required) = cm.annotations().get(REQUIRED_KEYS_ANNOTATION) else {
        return Vec::new();
    };
    required
        .split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .filter(|key| {
            let in_data = cm.data.as_ref().is_some_and(|d| d.contains_key(*key));
            let in_binary = cm.binary_data.as_ref().is_some_and(|d| d.contains_key(*key));
            !in_data && !in_binary
        })
        .map(str::to_string)
        .collect()
}

/// Stable digest of `data` and `binaryData`.
pub fn data_digest(cm: &ConfigMap) -> String {
    // BTreeMaps serialize in key order
    let canonical = json!({"data": cm.data, "binaryData": cm.binary_data}).to_string();
    Uuid::new_v5(&Uuid::NAMESPACE_OID, canonical.as_bytes()).to_string()
}
