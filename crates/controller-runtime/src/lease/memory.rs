//! In-process lease store.
//!
//! Every successful write bumps a counter that serves as the version token,
//! so compare-and-swap behaves like `resourceVersion` on the API server.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{LeaseError, LeaseRecord, LeaseStore, VersionedLease};

/// Lease store kept in memory; clones share the same leases
#[derive(Debug, Clone, Default)]
pub struct InMemoryLeaseStore {
    inner: Arc<Mutex<Leases>>,
}

#[derive(Debug, Default)]
struct Leases {
    next_version: u64,
    entries: HashMap<String, (LeaseRecord, u64)>,
}

impl InMemoryLeaseStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn leases(&self) -> MutexGuard<'_, Leases> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or overwrite a lease without a version check (test setup helper)
    pub fn put(&self, name: &str, record: LeaseRecord) -> VersionedLease {
        let mut leases = self.leases();
        leases.next_version += 1;
        let version = leases.next_version;
        leases
            .entries
            .insert(name.to_string(), (record.clone(), version));
        VersionedLease {
            record,
            version: version.to_string(),
        }
    }

    /// Current record of a lease, if any
    #[must_use]
    pub fn record(&self, name: &str) -> Option<LeaseRecord> {
        self.leases()
            .entries
            .get(name)
            .map(|(record, _)| record.clone())
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn get(&self, name: &str) -> Result<Option<VersionedLease>, LeaseError> {
        Ok(self
            .leases()
            .entries
            .get(name)
            .map(|(record, version)| VersionedLease {
                record: record.clone(),
                version: version.to_string(),
            }))
    }

    async fn create(&self, name: &str, record: LeaseRecord) -> Result<VersionedLease, LeaseError> {
        let mut guard = self.leases();
        let leases = &mut *guard;
        let version = leases.next_version + 1;
        match leases.entries.entry(name.to_string()) {
            Entry::Occupied(_) => Err(LeaseError::Conflict),
            Entry::Vacant(slot) => {
                slot.insert((record.clone(), version));
                leases.next_version = version;
                Ok(VersionedLease {
                    record,
                    version: version.to_string(),
                })
            }
        }
    }

    async fn update(
        &self,
        name: &str,
        record: LeaseRecord,
        version: &str,
    ) -> Result<VersionedLease, LeaseError> {
        let mut leases = self.leases();
        let current = match leases.entries.get(name) {
            Some((_, current)) => *current,
            None => return Err(LeaseError::Conflict),
        };
        if current.to_string() != version {
            return Err(LeaseError::Conflict);
        }
        leases.next_version += 1;
        let next = leases.next_version;
        leases
            .entries
            .insert(name.to_string(), (record.clone(), next));
        Ok(VersionedLease {
            record,
            version: next.to_string(),
        })
    }
}
