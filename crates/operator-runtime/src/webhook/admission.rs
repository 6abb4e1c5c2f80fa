//! `admission.k8s.io/v1` AdmissionReview wire types
//!
//! Hooks receive an [`AdmissionRequest`] and return an [`AdmissionResponse`];
//! the server completes the response against the request before encoding it
//! (see [`AdmissionResponse::complete`]).

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

pub const API_VERSION: &str = "admission.k8s.io/v1";
pub const KIND: &str = "AdmissionReview";
pub const PATCH_TYPE_JSON_PATCH: &str = "JSONPatch";

/// The envelope exchanged with the API server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdmissionReview {
    pub api_version: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

impl Default for AdmissionReview {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            request: None,
            response: None,
        }
    }
}

impl From<AdmissionResponse> for AdmissionReview {
    fn from(response: AdmissionResponse) -> Self {
        Self {
            response: Some(response),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Connect => "CONNECT",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

/// The object under admission and who is asking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdmissionRequest {
    pub uid: String,
    pub kind: GroupVersionKind,
    pub resource: GroupVersionResource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_kind: Option<GroupVersionKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_resource: Option<GroupVersionResource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub user_info: Value,
    /// New object; absent for DELETE
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    /// Existing object; present for UPDATE and DELETE
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_object: Option<Value>,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A hook's verdict.
///
/// `patches` holds JSON Patch operations for mutating hooks. They are folded
/// into `patch`/`patch_type` by [`AdmissionResponse::complete`] and never
/// serialized directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionStatus>,
    /// Base64 of the JSON array of patch operations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub audit_annotations: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub patches: Vec<Value>,
}

impl AdmissionResponse {
    /// Admits the object with status 200.
    #[must_use]
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            status: Some(AdmissionStatus {
                code: Some(200),
                ..AdmissionStatus::default()
            }),
            ..Self::default()
        }
    }

    /// Rejects the object with status 403. An empty message is omitted.
    #[must_use]
    pub fn denied(message: impl Into<String>) -> Self {
        Self {
            allowed: false,
            status: Some(AdmissionStatus {
                code: Some(403),
                reason: Some("Forbidden".to_string()),
                message: non_empty(message.into()),
            }),
            ..Self::default()
        }
    }

    /// Rejects the object with an arbitrary status code carrying `err`'s
    /// message. An empty message is omitted.
    #[must_use]
    pub fn errored(code: u16, err: impl fmt::Display) -> Self {
        Self {
            allowed: false,
            status: Some(AdmissionStatus {
                code: Some(code),
                reason: None,
                message: non_empty(err.to_string()),
            }),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.status.get_or_insert_with(AdmissionStatus::default).message = non_empty(message.into());
        self
    }

    /// Appends JSON Patch operations, e.g. `{"op": "add", "path": "/x", "value": 1}`.
    #[must_use]
    pub fn with_patches(mut self, patches: impl IntoIterator<Item = Value>) -> Self {
        self.patches.extend(patches);
        self
    }

    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    #[must_use]
    pub fn with_audit_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.audit_annotations.insert(key.into(), value.into());
        self
    }

    /// Finalizes the response for `request`: copies its uid, defaults the
    /// status code to 200 and folds `patches` into a base64 JSON Patch.
    #[must_use]
    pub fn complete(mut self, request: &AdmissionRequest) -> Self {
        self.uid.clone_from(&request.uid);
        let status = self.status.get_or_insert_with(AdmissionStatus::default);
        if status.code.is_none() {
            status.code = Some(200);
        }
        if !self.patches.is_empty() {
            let patches = Value::Array(std::mem::take(&mut self.patches));
            self.patch = Some(STANDARD.encode(patches.to_string()));
            self.patch_type = Some(PATCH_TYPE_JSON_PATCH.to_string());
        }
        self
    }

    #[must_use]
    pub fn into_review(self) -> AdmissionReview {
        self.into()
    }
}

impl From<bool> for AdmissionResponse {
    fn from(allowed: bool) -> Self {
        if allowed { Self::allowed() } else { Self::denied("") }
    }
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}
