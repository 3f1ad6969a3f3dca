//! # Storage and Persistence
//!
//! The storage capability contract ([`DataStore`]) and its implementations.
//!
//! A backend is responsible for making each entity mutation and its event-log
//! append one atomic unit. Decorators wrap any backend and satisfy the same
//! trait; the usual composition, outermost first, is
//!
//! ```text
//! MetricsDataStore -> FaultInjectingDataStore (tests only) -> MemoryDataStore
//! ```
//!
//! so that injected faults are observed by the metrics layer exactly like
//! backend failures.

pub mod fault;
pub mod memory;
pub mod metrics;
pub mod operation;
pub mod request;
pub mod validation;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use crate::domain::{
    AttestedNode, AttestedNodeEvent, AttestedNodeMask, Bundle, BundleMask, CaJournal, DeleteMode,
    EntryId, EventOp, FederationRelationship, FederationRelationshipMask, JoinToken, PublicKey,
    RegistrationEntry, RegistrationEntryEvent, RegistrationEntryMask, Selector, SpiffeId,
    TrustDomain,
};
use crate::errors::Result;

pub use fault::FaultInjectingDataStore;
pub use memory::MemoryDataStore;
pub use metrics::MetricsDataStore;
pub use operation::{EntityKind, Operation, Verb};
pub use request::{
    AttestedNodeFilter, BySelectors, DataConsistency, ListAttestedNodesRequest,
    ListAttestedNodesResponse, ListBundlesRequest, ListBundlesResponse, ListEventsRequest,
    ListEventsResponse, ListFederationRelationshipsRequest, ListFederationRelationshipsResponse,
    ListNodeSelectorsRequest, ListRegistrationEntriesRequest, ListRegistrationEntriesResponse,
    Pagination, RegistrationEntryFilter,
};

/// Logical storage contract of the trust store.
///
/// Fetches return `Ok(None)` for a missing key. Updates and deletes of a
/// missing key fail with `NotFound`. Every create, update and delete of an
/// attested node or registration entry appends exactly one event in the same
/// atomic unit as the mutation.
#[async_trait]
pub trait DataStore: Send + Sync {
    // Bundles

    /// Create the bundle of a trust domain. Fails if one already exists.
    async fn create_bundle(&self, bundle: Bundle) -> Result<Bundle>;
    async fn fetch_bundle(&self, trust_domain: &TrustDomain) -> Result<Option<Bundle>>;
    async fn update_bundle(&self, bundle: Bundle, mask: BundleMask) -> Result<Bundle>;
    /// Create or fully replace the bundle of a trust domain
    async fn set_bundle(&self, bundle: Bundle) -> Result<Bundle>;
    /// Create the bundle or merge new anchors and keys into the existing one
    async fn append_bundle(&self, bundle: Bundle) -> Result<Bundle>;
    async fn delete_bundle(&self, trust_domain: &TrustDomain, mode: DeleteMode) -> Result<()>;
    async fn list_bundles(&self, request: ListBundlesRequest) -> Result<ListBundlesResponse>;
    async fn count_bundles(&self) -> Result<usize>;
    /// Remove expired anchors and keys. Returns true when the bundle changed.
    async fn prune_bundle(
        &self,
        trust_domain: &TrustDomain,
        expires_before: DateTime<Utc>,
    ) -> Result<bool>;

    // Attested nodes

    async fn create_attested_node(&self, node: AttestedNode) -> Result<AttestedNode>;
    async fn fetch_attested_node(&self, spiffe_id: &SpiffeId) -> Result<Option<AttestedNode>>;
    async fn update_attested_node(
        &self,
        node: AttestedNode,
        mask: AttestedNodeMask,
    ) -> Result<AttestedNode>;
    async fn delete_attested_node(&self, spiffe_id: &SpiffeId) -> Result<AttestedNode>;
    async fn list_attested_nodes(
        &self,
        request: ListAttestedNodesRequest,
    ) -> Result<ListAttestedNodesResponse>;
    async fn count_attested_nodes(&self, filter: AttestedNodeFilter) -> Result<usize>;
    /// Delete nodes whose certificate expired before `expired_before`. Nodes
    /// that cannot re-attest are only removed when `include_non_reattestable`
    /// is set. Banned nodes are never pruned.
    async fn prune_attested_expired_nodes(
        &self,
        expired_before: DateTime<Utc>,
        include_non_reattestable: bool,
    ) -> Result<usize>;

    // Node selectors

    /// Replace the whole selector set of a node
    async fn set_node_selectors(&self, spiffe_id: &SpiffeId, selectors: Vec<Selector>)
        -> Result<()>;
    async fn get_node_selectors(
        &self,
        spiffe_id: &SpiffeId,
        consistency: DataConsistency,
    ) -> Result<Vec<Selector>>;
    async fn list_node_selectors(
        &self,
        request: ListNodeSelectorsRequest,
    ) -> Result<HashMap<SpiffeId, Vec<Selector>>>;

    // Attested node events

    async fn list_attested_node_events(
        &self,
        request: ListEventsRequest,
    ) -> Result<ListEventsResponse<AttestedNodeEvent>>;
    /// Delete events created at least `older_than` ago. Never rewinds the ID counter.
    async fn prune_attested_node_events(&self, older_than: Duration) -> Result<usize>;
    async fn fetch_attested_node_event(&self, event_id: u64) -> Result<Option<AttestedNodeEvent>>;
    async fn create_attested_node_event(
        &self,
        spiffe_id: SpiffeId,
        op: EventOp,
    ) -> Result<AttestedNodeEvent>;
    async fn delete_attested_node_event(&self, event_id: u64) -> Result<()>;

    // Registration entries

    async fn create_registration_entry(
        &self,
        entry: RegistrationEntry,
    ) -> Result<RegistrationEntry>;
    /// Create the entry, or return the existing entry with the same
    /// (parent ID, SPIFFE ID, selectors) key. The flag reports pre-existence.
    async fn create_or_return_registration_entry(
        &self,
        entry: RegistrationEntry,
    ) -> Result<(RegistrationEntry, bool)>;
    async fn fetch_registration_entry(&self, id: &EntryId) -> Result<Option<RegistrationEntry>>;
    /// Fetch several entries at once. Missing IDs are omitted from the map.
    async fn fetch_registration_entries(
        &self,
        ids: &[EntryId],
    ) -> Result<HashMap<EntryId, RegistrationEntry>>;
    async fn update_registration_entry(
        &self,
        entry: RegistrationEntry,
        mask: RegistrationEntryMask,
    ) -> Result<RegistrationEntry>;
    async fn delete_registration_entry(&self, id: &EntryId) -> Result<RegistrationEntry>;
    async fn list_registration_entries(
        &self,
        request: ListRegistrationEntriesRequest,
    ) -> Result<ListRegistrationEntriesResponse>;
    async fn count_registration_entries(&self, filter: RegistrationEntryFilter) -> Result<usize>;
    async fn prune_registration_entries(&self, expires_before: DateTime<Utc>) -> Result<usize>;

    // Registration entry events

    async fn list_registration_entry_events(
        &self,
        request: ListEventsRequest,
    ) -> Result<ListEventsResponse<RegistrationEntryEvent>>;
    async fn prune_registration_entry_events(&self, older_than: Duration) -> Result<usize>;
    async fn fetch_registration_entry_event(
        &self,
        event_id: u64,
    ) -> Result<Option<RegistrationEntryEvent>>;
    async fn create_registration_entry_event(
        &self,
        entry_id: EntryId,
        op: EventOp,
    ) -> Result<RegistrationEntryEvent>;
    async fn delete_registration_entry_event(&self, event_id: u64) -> Result<()>;

    // Join tokens

    async fn create_join_token(&self, token: JoinToken) -> Result<JoinToken>;
    async fn fetch_join_token(&self, token: &str) -> Result<Option<JoinToken>>;
    async fn delete_join_token(&self, token: &str) -> Result<()>;
    async fn prune_join_tokens(&self, expires_before: DateTime<Utc>) -> Result<usize>;

    // Federation relationships

    async fn create_federation_relationship(
        &self,
        relationship: FederationRelationship,
    ) -> Result<FederationRelationship>;
    async fn fetch_federation_relationship(
        &self,
        trust_domain: &TrustDomain,
    ) -> Result<Option<FederationRelationship>>;
    async fn update_federation_relationship(
        &self,
        relationship: FederationRelationship,
        mask: FederationRelationshipMask,
    ) -> Result<FederationRelationship>;
    async fn delete_federation_relationship(&self, trust_domain: &TrustDomain) -> Result<()>;
    async fn list_federation_relationships(
        &self,
        request: ListFederationRelationshipsRequest,
    ) -> Result<ListFederationRelationshipsResponse>;

    // CA journals

    /// Replace the journal of its trust domain, assigning an ID on first write
    async fn set_ca_journal(&self, journal: CaJournal) -> Result<CaJournal>;
    async fn fetch_ca_journal(&self, active_x509_authority_id: &str)
        -> Result<Option<CaJournal>>;
    async fn list_ca_journals(&self) -> Result<Vec<CaJournal>>;
    /// Delete journals in which every authority expired before the threshold.
    /// A journal with any authority still valid is left whole.
    async fn prune_ca_journals(&self, all_cas_expire_before: DateTime<Utc>) -> Result<usize>;

    // Authorities

    async fn taint_x509_ca(&self, trust_domain: &TrustDomain, authority_id: &str) -> Result<()>;
    async fn revoke_x509_ca(&self, trust_domain: &TrustDomain, authority_id: &str) -> Result<()>;
    async fn taint_jwt_key(&self, trust_domain: &TrustDomain, key_id: &str) -> Result<PublicKey>;
    async fn revoke_jwt_key(&self, trust_domain: &TrustDomain, key_id: &str)
        -> Result<PublicKey>;
}

/// Invoke `$callback!` with the full operation table of [`DataStore`].
///
/// Each row is `(EntityKind, Verb) fn name(arg: Type, ...) -> Output;` where
/// the method returns `Result<Output>`. Forwarding decorators generate their
/// `impl DataStore` from this table, so a new trait method that is missing
/// here fails to compile in every decorator.
macro_rules! for_each_datastore_op {
    ($callback:ident) => {
        $callback! {
            (Bundle, Create) fn create_bundle(bundle: Bundle) -> Bundle;
            (Bundle, Fetch) fn fetch_bundle(trust_domain: &TrustDomain) -> Option<Bundle>;
            (Bundle, Update) fn update_bundle(bundle: Bundle, mask: BundleMask) -> Bundle;
            (Bundle, Set) fn set_bundle(bundle: Bundle) -> Bundle;
            (Bundle, Append) fn append_bundle(bundle: Bundle) -> Bundle;
            (Bundle, Delete) fn delete_bundle(trust_domain: &TrustDomain, mode: DeleteMode) -> ();
            (Bundle, List) fn list_bundles(request: ListBundlesRequest) -> ListBundlesResponse;
            (Bundle, Count) fn count_bundles() -> usize;
            (Bundle, Prune) fn prune_bundle(
                trust_domain: &TrustDomain,
                expires_before: DateTime<Utc>
            ) -> bool;

            (AttestedNode, Create) fn create_attested_node(node: AttestedNode) -> AttestedNode;
            (AttestedNode, Fetch) fn fetch_attested_node(
                spiffe_id: &SpiffeId
            ) -> Option<AttestedNode>;
            (AttestedNode, Update) fn update_attested_node(
                node: AttestedNode,
                mask: AttestedNodeMask
            ) -> AttestedNode;
            (AttestedNode, Delete) fn delete_attested_node(spiffe_id: &SpiffeId) -> AttestedNode;
            (AttestedNode, List) fn list_attested_nodes(
                request: ListAttestedNodesRequest
            ) -> ListAttestedNodesResponse;
            (AttestedNode, Count) fn count_attested_nodes(filter: AttestedNodeFilter) -> usize;
            (AttestedNode, Prune) fn prune_attested_expired_nodes(
                expired_before: DateTime<Utc>,
                include_non_reattestable: bool
            ) -> usize;

            (NodeSelectors, Set) fn set_node_selectors(
                spiffe_id: &SpiffeId,
                selectors: Vec<Selector>
            ) -> ();
            (NodeSelectors, Fetch) fn get_node_selectors(
                spiffe_id: &SpiffeId,
                consistency: DataConsistency
            ) -> Vec<Selector>;
            (NodeSelectors, List) fn list_node_selectors(
                request: ListNodeSelectorsRequest
            ) -> HashMap<SpiffeId, Vec<Selector>>;

            (AttestedNodeEvent, List) fn list_attested_node_events(
                request: ListEventsRequest
            ) -> ListEventsResponse<AttestedNodeEvent>;
            (AttestedNodeEvent, Prune) fn prune_attested_node_events(
                older_than: Duration
            ) -> usize;
            (AttestedNodeEvent, Fetch) fn fetch_attested_node_event(
                event_id: u64
            ) -> Option<AttestedNodeEvent>;
            (AttestedNodeEvent, Create) fn create_attested_node_event(
                spiffe_id: SpiffeId,
                op: EventOp
            ) -> AttestedNodeEvent;
            (AttestedNodeEvent, Delete) fn delete_attested_node_event(event_id: u64) -> ();

            (RegistrationEntry, Create) fn create_registration_entry(
                entry: RegistrationEntry
            ) -> RegistrationEntry;
            (RegistrationEntry, CreateOrReturn) fn create_or_return_registration_entry(
                entry: RegistrationEntry
            ) -> (RegistrationEntry, bool);
            (RegistrationEntry, Fetch) fn fetch_registration_entry(
                id: &EntryId
            ) -> Option<RegistrationEntry>;
            (RegistrationEntry, FetchMany) fn fetch_registration_entries(
                ids: &[EntryId]
            ) -> HashMap<EntryId, RegistrationEntry>;
            (RegistrationEntry, Update) fn update_registration_entry(
                entry: RegistrationEntry,
                mask: RegistrationEntryMask
            ) -> RegistrationEntry;
            (RegistrationEntry, Delete) fn delete_registration_entry(
                id: &EntryId
            ) -> RegistrationEntry;
            (RegistrationEntry, List) fn list_registration_entries(
                request: ListRegistrationEntriesRequest
            ) -> ListRegistrationEntriesResponse;
            (RegistrationEntry, Count) fn count_registration_entries(
                filter: RegistrationEntryFilter
            ) -> usize;
            (RegistrationEntry, Prune) fn prune_registration_entries(
                expires_before: DateTime<Utc>
            ) -> usize;

            (RegistrationEntryEvent, List) fn list_registration_entry_events(
                request: ListEventsRequest
            ) -> ListEventsResponse<RegistrationEntryEvent>;
            (RegistrationEntryEvent, Prune) fn prune_registration_entry_events(
                older_than: Duration
            ) -> usize;
            (RegistrationEntryEvent, Fetch) fn fetch_registration_entry_event(
                event_id: u64
            ) -> Option<RegistrationEntryEvent>;
            (RegistrationEntryEvent, Create) fn create_registration_entry_event(
                entry_id: EntryId,
                op: EventOp
            ) -> RegistrationEntryEvent;
            (RegistrationEntryEvent, Delete) fn delete_registration_entry_event(
                event_id: u64
            ) -> ();

            (JoinToken, Create) fn create_join_token(token: JoinToken) -> JoinToken;
            (JoinToken, Fetch) fn fetch_join_token(token: &str) -> Option<JoinToken>;
            (JoinToken, Delete) fn delete_join_token(token: &str) -> ();
            (JoinToken, Prune) fn prune_join_tokens(expires_before: DateTime<Utc>) -> usize;

            (FederationRelationship, Create) fn create_federation_relationship(
                relationship: FederationRelationship
            ) -> FederationRelationship;
            (FederationRelationship, Fetch) fn fetch_federation_relationship(
                trust_domain: &TrustDomain
            ) -> Option<FederationRelationship>;
            (FederationRelationship, Update) fn update_federation_relationship(
                relationship: FederationRelationship,
                mask: FederationRelationshipMask
            ) -> FederationRelationship;
            (FederationRelationship, Delete) fn delete_federation_relationship(
                trust_domain: &TrustDomain
            ) -> ();
            (FederationRelationship, List) fn list_federation_relationships(
                request: ListFederationRelationshipsRequest
            ) -> ListFederationRelationshipsResponse;

            (CaJournal, Set) fn set_ca_journal(journal: CaJournal) -> CaJournal;
            (CaJournal, Fetch) fn fetch_ca_journal(
                active_x509_authority_id: &str
            ) -> Option<CaJournal>;
            (CaJournal, List) fn list_ca_journals() -> Vec<CaJournal>;
            (CaJournal, Prune) fn prune_ca_journals(
                all_cas_expire_before: DateTime<Utc>
            ) -> usize;

            (X509Authority, Taint) fn taint_x509_ca(
                trust_domain: &TrustDomain,
                authority_id: &str
            ) -> ();
            (X509Authority, Revoke) fn revoke_x509_ca(
                trust_domain: &TrustDomain,
                authority_id: &str
            ) -> ();
            (JwtAuthority, Taint) fn taint_jwt_key(
                trust_domain: &TrustDomain,
                key_id: &str
            ) -> PublicKey;
            (JwtAuthority, Revoke) fn revoke_jwt_key(
                trust_domain: &TrustDomain,
                key_id: &str
            ) -> PublicKey;
        }
    };
}

pub(crate) use for_each_datastore_op;
