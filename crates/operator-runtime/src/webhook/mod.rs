//! Admission webhook server
//!
//! Routes `AdmissionReview` POSTs by exact path to registered
//! [`AdmissionHook`]s. Protocol failures are answered inside the review with
//! HTTP 200; only unknown paths get a real HTTP error (404).

pub mod admission;
mod server;

pub use admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, AdmissionStatus, Operation};
pub use server::{AdmissionHook, MAX_BODY_BYTES, REQUEST_TIMEOUT, ServerState, WebhookServer};
