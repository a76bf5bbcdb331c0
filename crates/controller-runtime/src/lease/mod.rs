//! Lease records and their storage.
//!
//! The lease is the only resource shared across replicas. Every mutation goes
//! through [`LeaseStore::create`] or [`LeaseStore::update`], which fail with
//! [`LeaseError::Conflict`] when another writer got there first. Correctness of
//! leader election rests on this compare-and-swap, not on local clocks.
//!
//! - `kubernetes.rs` - `coordination.k8s.io/v1` Lease objects, CAS on `resourceVersion`
//! - `memory.rs` - in-process store for tests (`test-util` feature)

mod kubernetes;
#[cfg(any(test, feature = "test-util"))]
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::kubernetes::KubeLeaseStore;
#[cfg(any(test, feature = "test-util"))]
pub use self::memory::InMemoryLeaseStore;

/// Lease storage errors
#[derive(Debug, Error)]
pub enum LeaseError {
    /// The lease changed since it was read, or already exists on create
    #[error("lease was modified concurrently")]
    Conflict,

    /// The store could not serve the request
    #[error("lease storage error: {0}")]
    Storage(String),

    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Lease payload could not be converted
    #[error("lease serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persisted lease state.
///
/// Field names and formats match the `spec` of a `coordination.k8s.io/v1` Lease.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    /// Identity of the current holder; `None` when released
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_identity: Option<String>,

    /// How long the holder may go without renewing
    #[serde(default)]
    pub lease_duration_seconds: i32,

    /// When the current holder acquired the lease
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_time: Option<DateTime<Utc>>,

    /// When the current holder last renewed the lease
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_time: Option<DateTime<Utc>>,

    /// Number of holder changes
    #[serde(default)]
    pub lease_transitions: i32,
}

impl LeaseRecord {
    /// Holder identity, treating an empty string as no holder
    #[must_use]
    pub fn holder(&self) -> Option<&str> {
        self.holder_identity.as_deref().filter(|h| !h.is_empty())
    }

    /// Instant after which the lease may be taken over
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.renew_time
            .map(|renewed| {
                renewed + chrono::Duration::seconds(i64::from(self.lease_duration_seconds))
            })
    }

    /// Whether someone validly holds the lease at `now`
    #[must_use]
    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        match (self.holder(), self.expires_at()) {
            (Some(_), Some(expires)) => now < expires,
            _ => false,
        }
    }

    /// Whether `identity` holds the lease
    #[must_use]
    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder() == Some(identity)
    }
}

/// A lease record together with the opaque version used for compare-and-swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedLease {
    /// Stored record
    pub record: LeaseRecord,
    /// Version token; pass it back to [`LeaseStore::update`]
    pub version: String,
}

/// Storage for named lease records with compare-and-swap updates.
///
/// All methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Read a lease; `Ok(None)` when it does not exist
    async fn get(&self, name: &str) -> Result<Option<VersionedLease>, LeaseError>;

    /// Create a lease; [`LeaseError::Conflict`] if it already exists
    async fn create(&self, name: &str, record: LeaseRecord) -> Result<VersionedLease, LeaseError>;

    /// Replace a lease if its version still equals `version`;
    /// [`LeaseError::Conflict`] otherwise
    async fn update(
        &self,
        name: &str,
        record: LeaseRecord,
        version: &str,
    ) -> Result<VersionedLease, LeaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_expiry() {
        let renewed = Utc::now();
        let record = LeaseRecord {
            holder_identity: Some("a".to_string()),
            lease_duration_seconds: 15,
            acquire_time: Some(renewed),
            renew_time: Some(renewed),
            lease_transitions: 0,
        };

        assert!(record.is_held_at(renewed + chrono::Duration::seconds(14)));
        assert!(!record.is_held_at(renewed + chrono::Duration::seconds(15)));
        assert!(record.is_held_by("a"));
        assert!(!record.is_held_by("b"));
    }

    #[test]
    fn test_released_record_is_not_held() {
        let record = LeaseRecord {
            holder_identity: Some(String::new()),
            lease_duration_seconds: 15,
            renew_time: Some(Utc::now()),
            ..Default::default()
        };
        assert_eq!(record.holder(), None);
        assert!(!record.is_held_at(Utc::now()));
    }

    #[test]
    fn test_record_wire_format() {
        let value = json!({
            "holderIdentity": "replica-a",
            "leaseDurationSeconds": 15,
            "acquireTime": "2024-05-01T10:00:00.000000Z",
            "renewTime": "2024-05-01T10:00:10.000000Z",
            "leaseTransitions": 2
        });
        let record: LeaseRecord = serde_json::from_value(value).unwrap();

        assert_eq!(record.holder(), Some("replica-a"));
        assert_eq!(record.lease_transitions, 2);
        assert_eq!(
            record.expires_at().unwrap().to_rfc3339(),
            "2024-05-01T10:00:25+00:00"
        );

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["leaseDurationSeconds"], 15);
        assert_eq!(back["holderIdentity"], "replica-a");
    }
}
