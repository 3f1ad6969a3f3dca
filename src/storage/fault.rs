//! Fault-injecting decorator for any [`DataStore`].
//!
//! Each call first pops the next queued outcome: a queued error is returned
//! without touching the wrapped store, a queued pass (or an empty queue)
//! delegates normally.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::domain::{
    AttestedNode, AttestedNodeEvent, AttestedNodeMask, Bundle, BundleMask, CaJournal, DeleteMode,
    EntryId, EventOp, FederationRelationship, FederationRelationshipMask, JoinToken, PublicKey,
    RegistrationEntry, RegistrationEntryEvent, RegistrationEntryMask, Selector, SpiffeId,
    TrustDomain,
};
use crate::errors::{Result, TrustplaneError};
use crate::storage::request::{
    AttestedNodeFilter, DataConsistency, ListAttestedNodesRequest, ListAttestedNodesResponse,
    ListBundlesRequest, ListBundlesResponse, ListEventsRequest, ListEventsResponse,
    ListFederationRelationshipsRequest, ListFederationRelationshipsResponse,
    ListNodeSelectorsRequest, ListRegistrationEntriesRequest, ListRegistrationEntriesResponse,
    RegistrationEntryFilter,
};
use crate::storage::{for_each_datastore_op, DataStore, EntityKind, Operation, Verb};

pub struct FaultInjectingDataStore<D> {
    inner: D,
    outcomes: Mutex<VecDeque<Option<TrustplaneError>>>,
}

impl<D: DataStore> FaultInjectingDataStore<D> {
    pub fn new(inner: D) -> Self {
        Self { inner, outcomes: Mutex::new(VecDeque::new()) }
    }

    /// Replace the queue: the next call fails with `error`
    pub fn set_next_error(&self, error: TrustplaneError) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.clear();
            outcomes.push_back(Some(error));
        }
    }

    /// Queue `error` after the outcomes already queued
    pub fn append_next_error(&self, error: TrustplaneError) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.push_back(Some(error));
        }
    }

    /// Queue one call that delegates normally
    pub fn append_pass(&self) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.push_back(None);
        }
    }

    pub fn pending(&self) -> usize {
        self.outcomes.lock().map(|outcomes| outcomes.len()).unwrap_or(0)
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn next_outcome(&self, operation: Operation) -> Result<()> {
        let next = self.outcomes.lock()?.pop_front().flatten();
        match next {
            Some(error) => {
                debug!(operation = %operation, error = %error, "Injecting datastore error");
                Err(error)
            }
            None => Ok(()),
        }
    }
}

impl<D> fmt::Debug for FaultInjectingDataStore<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultInjectingDataStore").finish_non_exhaustive()
    }
}

macro_rules! fault_injecting_datastore {
    ($( ($kind:ident, $verb:ident) fn $name:ident($($arg:ident: $ty:ty),*) -> $out:ty; )*) => {
        #[async_trait]
        impl<D: DataStore> DataStore for FaultInjectingDataStore<D> {
            $(
                async fn $name(&self, $($arg: $ty),*) -> Result<$out> {
                    self.next_outcome(Operation::new(EntityKind::$kind, Verb::$verb))?;
                    self.inner.$name($($arg),*).await
                }
            )*
        }
    };
}

for_each_datastore_op!(fault_injecting_datastore);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDataStore;

    fn td() -> TrustDomain {
        TrustDomain::new("example.org").unwrap()
    }

    #[tokio::test]
    async fn test_injected_error_skips_inner_store() {
        let store = FaultInjectingDataStore::new(MemoryDataStore::new());
        store.set_next_error(TrustplaneError::internal("boom"));

        let err = store.create_bundle(Bundle::new(td())).await.unwrap_err();
        assert_eq!(err.code(), "internal");
        assert!(store.inner().fetch_bundle(&td()).await.unwrap().is_none());

        store.create_bundle(Bundle::new(td())).await.unwrap();
        assert!(store.fetch_bundle(&td()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_queued_outcomes_apply_in_order() {
        let store = FaultInjectingDataStore::new(MemoryDataStore::new());
        store.append_pass();
        store.append_next_error(TrustplaneError::not_found("bundle", "example.org"));
        assert_eq!(store.pending(), 2);

        assert_eq!(store.count_bundles().await.unwrap(), 0);
        assert!(store.count_bundles().await.unwrap_err().is_not_found());
        assert_eq!(store.count_bundles().await.unwrap(), 0);
        assert_eq!(store.pending(), 0);
    }

    #[tokio::test]
    async fn test_set_next_error_replaces_queue() {
        let store = FaultInjectingDataStore::new(MemoryDataStore::new());
        store.append_next_error(TrustplaneError::internal("first"));
        store.append_next_error(TrustplaneError::internal("second"));
        store.set_next_error(TrustplaneError::canceled("list_bundles"));
        assert_eq!(store.pending(), 1);
        assert_eq!(store.count_bundles().await.unwrap_err().code(), "canceled");
    }
}
