//! Kubernetes-backed lease lock.
//!
//! Stores the [`LeaderElectionRecord`] in the spec of a namespaced
//! `coordination.k8s.io/v1` Lease. Updates replace the exact object that was
//! last read, so the API server's `resourceVersion` check rejects stale writes.

use crate::error::LeaseLockError;
use crate::record::LeaderElectionRecord;
use crate::lock_trait::LeaseLockTrait;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client, Resource};
use std::fmt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Event published by [`KubeLeaseLock::record_event`]. The note is `message`
/// as given; callers already name the holder.
fn leader_election_event(message: &str) -> Event {
    Event {
        type_: EventType::Normal,
        reason: "LeaderElection".to_string(),
        note: Some(message.to_string()),
        action: "LeaderElection".to_string(),
        secondary: None,
    }
}

/// Lease lock backed by the Kubernetes API.
pub struct KubeLeaseLock {
    api: Api<Lease>,
    namespace: String,
    name: String,
    identity: String,
    recorder: Recorder,
    /// Last Lease object seen through `get` or `create`
    lease: RwLock<Option<Lease>>,
}

impl KubeLeaseLock {
    /// Creates a lock on Lease `namespace/name` claimed as `identity`.
    ///
    /// `component` is the reporting controller name on recorded events.
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        name: impl Into<String>,
        identity: impl Into<String>,
        component: impl Into<String>,
    ) -> Self {
        let namespace = namespace.into();
        let identity = identity.into();
        let reporter = Reporter {
            controller: component.into(),
            instance: Some(identity.clone()),
        };
        Self {
            api: Api::namespaced(client.clone(), &namespace),
            namespace,
            name: name.into(),
            identity,
            recorder: Recorder::new(client, reporter),
            lease: RwLock::new(None),
        }
    }

    fn spec_from_record(record: &LeaderElectionRecord) -> Result<LeaseSpec, LeaseLockError> {
        Ok(serde_json::from_value(serde_json::to_value(record)?)?)
    }

    fn record_from_spec(spec: Option<&LeaseSpec>) -> Result<LeaderElectionRecord, LeaseLockError> {
        match spec {
            Some(spec) => Ok(serde_json::from_value(serde_json::to_value(spec)?)?),
            None => Ok(LeaderElectionRecord::default()),
        }
    }

    fn map_api_error(&self, err: kube::Error) -> LeaseLockError {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => LeaseLockError::NotFound(self.to_string()),
            kube::Error::Api(resp) if resp.code == 409 => LeaseLockError::Conflict(self.to_string()),
            _ => LeaseLockError::Kube(err),
        }
    }
}

impl fmt::Display for KubeLeaseLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[async_trait::async_trait]
impl LeaseLockTrait for KubeLeaseLock {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn get(&self) -> Result<LeaderElectionRecord, LeaseLockError> {
        let lease = self.api.get(&self.name).await.map_err(|e| self.map_api_error(e))?;
        let record = Self::record_from_spec(lease.spec.as_ref())?;
        *self.lease.write().await = Some(lease);
        Ok(record)
    }

    async fn create(&self, record: &LeaderElectionRecord) -> Result<(), LeaseLockError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(Self::spec_from_record(record)?),
        };
        // Rejections (already exists included) pass through unchanged
        let created = self.api.create(&PostParams::default(), &lease).await?;
        debug!(lock = %self, holder = %record.holder_identity, "Created lease");
        *self.lease.write().await = Some(created);
        Ok(())
    }

    async fn update(&self, record: &LeaderElectionRecord) -> Result<(), LeaseLockError> {
        let mut guard = self.lease.write().await;
        let Some(current) = guard.as_ref() else {
            return Err(LeaseLockError::NotInitialized(self.to_string()));
        };
        let mut next = current.clone();
        next.spec = Some(Self::spec_from_record(record)?);
        let replaced = self
            .api
            .replace(&self.name, &PostParams::default(), &next)
            .await
            .map_err(|e| self.map_api_error(e))?;
        *guard = Some(replaced);
        Ok(())
    }

    async fn record_event(&self, message: &str) {
        let Some(lease) = self.lease.read().await.clone() else {
            debug!(lock = %self, "Skipping event, lease not yet observed");
            return;
        };
        let event = leader_election_event(message);
        if let Err(e) = self.recorder.publish(&event, &lease.object_ref(&())).await {
            warn!(lock = %self, error = %e, "Failed to record leader election event");
        }
    }
}
