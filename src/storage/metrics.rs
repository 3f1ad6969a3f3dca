//! Call-counting decorator for any [`DataStore`].
//!
//! Every operation starts a [`CallCounter`] before delegating. The counter
//! records on drop, so the call is counted on every exit path, including a
//! caller dropping the future mid-flight (recorded as `canceled`). Arguments,
//! results and errors pass through untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::domain::{
    AttestedNode, AttestedNodeEvent, AttestedNodeMask, Bundle, BundleMask, CaJournal, DeleteMode,
    EntryId, EventOp, FederationRelationship, FederationRelationshipMask, JoinToken, PublicKey,
    RegistrationEntry, RegistrationEntryEvent, RegistrationEntryMask, Selector, SpiffeId,
    TrustDomain,
};
use crate::errors::Result;
use crate::observability::metrics::{CallMetrics, CallRecord, STATUS_CANCELED, STATUS_OK};
use crate::storage::request::{
    AttestedNodeFilter, DataConsistency, ListAttestedNodesRequest, ListAttestedNodesResponse,
    ListBundlesRequest, ListBundlesResponse, ListEventsRequest, ListEventsResponse,
    ListFederationRelationshipsRequest, ListFederationRelationshipsResponse,
    ListNodeSelectorsRequest, ListRegistrationEntriesRequest, ListRegistrationEntriesResponse,
    RegistrationEntryFilter,
};
use crate::storage::{for_each_datastore_op, DataStore, EntityKind, Operation, Verb};

/// Scoped timer for one storage call
pub struct CallCounter<'a> {
    metrics: &'a dyn CallMetrics,
    operation: Operation,
    trust_domain: Option<&'a TrustDomain>,
    started: Instant,
    status: Option<&'static str>,
}

impl<'a> CallCounter<'a> {
    pub fn start(metrics: &'a dyn CallMetrics, operation: Operation) -> Self {
        Self { metrics, operation, trust_domain: None, started: Instant::now(), status: None }
    }

    pub fn with_trust_domain(mut self, trust_domain: Option<&'a TrustDomain>) -> Self {
        self.trust_domain = trust_domain;
        self
    }

    /// Set the final status from the call's result. Recording happens on drop.
    pub fn done<T>(mut self, result: &Result<T>) {
        self.status = Some(match result {
            Ok(_) => STATUS_OK,
            Err(err) => err.code(),
        });
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for CallCounter<'_> {
    fn drop(&mut self) {
        self.metrics.record_call(CallRecord {
            operation: self.operation,
            status: self.status.unwrap_or(STATUS_CANCELED),
            elapsed: self.started.elapsed(),
            trust_domain: self.trust_domain.map(|td| td.to_string()),
        });
    }
}

/// Wraps a [`DataStore`] and reports every call to a [`CallMetrics`] sink
pub struct MetricsDataStore<D> {
    inner: D,
    metrics: Arc<dyn CallMetrics>,
    trust_domain: Option<TrustDomain>,
}

impl<D: DataStore> MetricsDataStore<D> {
    pub fn new(inner: D, metrics: Arc<dyn CallMetrics>) -> Self {
        Self { inner, metrics, trust_domain: None }
    }

    /// Label every call with the trust domain this store serves
    pub fn with_trust_domain(mut self, trust_domain: TrustDomain) -> Self {
        self.trust_domain = Some(trust_domain);
        self
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }
}

impl<D> fmt::Debug for MetricsDataStore<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsDataStore").field("trust_domain", &self.trust_domain).finish()
    }
}

macro_rules! metered_datastore {
    ($( ($kind:ident, $verb:ident) fn $name:ident($($arg:ident: $ty:ty),*) -> $out:ty; )*) => {
        #[async_trait]
        impl<D: DataStore> DataStore for MetricsDataStore<D> {
            $(
                async fn $name(&self, $($arg: $ty),*) -> Result<$out> {
                    let counter = CallCounter::start(
                        self.metrics.as_ref(),
                        Operation::new(EntityKind::$kind, Verb::$verb),
                    )
                    .with_trust_domain(self.trust_domain.as_ref());
                    let result = self.inner.$name($($arg),*).await;
                    counter.done(&result);
                    result
                }
            )*
        }
    };
}

for_each_datastore_op!(metered_datastore);
