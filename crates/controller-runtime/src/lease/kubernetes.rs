//! Lease storage on `coordination.k8s.io/v1` Lease objects.
//!
//! Uses `resourceVersion` for compare-and-swap semantics. If the lease changes
//! between read and write, the API server rejects the write with 409 Conflict,
//! which is reported as [`LeaseError::Conflict`].

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::debug;

use super::{LeaseError, LeaseRecord, LeaseStore, VersionedLease};

/// Lease store backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeLeaseStore {
    api: Api<Lease>,
    namespace: String,
}

impl std::fmt::Debug for KubeLeaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeLeaseStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeLeaseStore {
    /// Create a store for leases in `namespace`
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    fn lease(
        &self,
        name: &str,
        record: &LeaseRecord,
        version: Option<&str>,
    ) -> Result<Lease, LeaseError> {
        Ok(Lease {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                resource_version: version.map(str::to_string),
                ..Default::default()
            },
            spec: Some(spec_from_record(record)?),
        })
    }
}

/// Convert through the shared JSON representation so timestamp types stay in sync.
fn spec_from_record(record: &LeaseRecord) -> Result<LeaseSpec, LeaseError> {
    Ok(serde_json::from_value(serde_json::to_value(record)?)?)
}

fn versioned(lease: Lease) -> Result<VersionedLease, LeaseError> {
    let version = lease
        .metadata
        .resource_version
        .ok_or_else(|| LeaseError::Storage("lease missing resourceVersion".to_string()))?;
    let record = match lease.spec {
        Some(spec) => serde_json::from_value(serde_json::to_value(spec)?)?,
        None => LeaseRecord::default(),
    };
    Ok(VersionedLease { record, version })
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self, name: &str) -> Result<Option<VersionedLease>, LeaseError> {
        match self.api.get_opt(name).await? {
            Some(lease) => versioned(lease).map(Some),
            None => Ok(None),
        }
    }

    async fn create(&self, name: &str, record: LeaseRecord) -> Result<VersionedLease, LeaseError> {
        let lease = self.lease(name, &record, None)?;
        match self.api.create(&PostParams::default(), &lease).await {
            Ok(created) => versioned(created),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(lease = name, "Lease creation conflict");
                Err(LeaseError::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(
        &self,
        name: &str,
        record: LeaseRecord,
        version: &str,
    ) -> Result<VersionedLease, LeaseError> {
        let lease = self.lease(name, &record, Some(version))?;
        match self.api.replace(name, &PostParams::default(), &lease).await {
            Ok(updated) => versioned(updated),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(lease = name, "Lease update conflict");
                Err(LeaseError::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }
}
