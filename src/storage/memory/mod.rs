//! In-memory storage backend
//!
//! All tables live behind one `RwLock`, so every mutation together with the
//! event it appends is a single atomic unit and writers are serialized.
//! Strong and stale-tolerant reads are served from the same state. Data is
//! lost on restart.

mod bundles;
mod entries;
mod events;
mod federation;
mod journals;
mod nodes;
mod tokens;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::instrument;

use crate::domain::{
    AttestedNode, AttestedNodeEvent, AttestedNodeMask, AuthorityKind, Bundle, BundleMask,
    CaJournal, DeleteMode, EntryId, EntryKey, EventOp, FederationRelationship,
    FederationRelationshipMask, JoinToken, PublicKey, RegistrationEntry, RegistrationEntryEvent,
    RegistrationEntryMask, Selector, SpiffeId, TrustDomain,
};
use crate::errors::{Result, TrustplaneError};
use crate::storage::request::{
    AttestedNodeFilter, DataConsistency, ListAttestedNodesRequest, ListAttestedNodesResponse,
    ListBundlesRequest, ListBundlesResponse, ListEventsRequest, ListEventsResponse,
    ListFederationRelationshipsRequest, ListFederationRelationshipsResponse,
    ListNodeSelectorsRequest, ListRegistrationEntriesRequest, ListRegistrationEntriesResponse,
    Pagination, RegistrationEntryFilter,
};
use crate::storage::DataStore;
use crate::utils::{Clock, SystemClock};

use events::EventTable;
use journals::AuthorityChange;

pub(super) struct State {
    clock: Arc<dyn Clock>,
    bundles: BTreeMap<String, Bundle>,
    /// Stored without selectors; see `node_selectors`
    nodes: BTreeMap<String, AttestedNode>,
    node_selectors: HashMap<SpiffeId, Vec<Selector>>,
    node_events: EventTable<AttestedNodeEvent>,
    entries: BTreeMap<String, RegistrationEntry>,
    entry_keys: HashMap<EntryKey, EntryId>,
    entry_events: EventTable<RegistrationEntryEvent>,
    join_tokens: BTreeMap<String, JoinToken>,
    federations: BTreeMap<String, FederationRelationship>,
    journals: BTreeMap<u64, CaJournal>,
    next_journal_id: u64,
}

impl State {
    fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            bundles: BTreeMap::new(),
            nodes: BTreeMap::new(),
            node_selectors: HashMap::new(),
            node_events: EventTable::new("attested_node_event"),
            entries: BTreeMap::new(),
            entry_keys: HashMap::new(),
            entry_events: EventTable::new("registration_entry_event"),
            join_tokens: BTreeMap::new(),
            federations: BTreeMap::new(),
            journals: BTreeMap::new(),
            next_journal_id: 0,
        }
    }
}

/// Return one page of key-ordered items. `next_token` is set only when more
/// items follow the page.
pub(super) fn paginate<'a, T>(
    items: impl Iterator<Item = (&'a String, T)>,
    pagination: Option<&Pagination>,
) -> Result<(Vec<T>, Option<String>)> {
    let Some(pagination) = pagination else {
        return Ok((items.map(|(_, item)| item).collect(), None));
    };
    if pagination.page_size == 0 {
        return Err(TrustplaneError::invalid_field(
            "page size must be greater than zero",
            "page_size",
        ));
    }

    let mut page = Vec::new();
    let mut last_key: Option<String> = None;
    let after_token = items.filter(|(key, _)| {
        pagination.token.as_deref().map_or(true, |token| key.as_str() > token)
    });
    for (key, item) in after_token {
        if page.len() == pagination.page_size {
            return Ok((page, last_key));
        }
        last_key = Some(key.clone());
        page.push(item);
    }
    Ok((page, None))
}

/// In-memory implementation of [`DataStore`]
pub struct MemoryDataStore {
    state: RwLock<State>,
}

impl MemoryDataStore {
    /// Create a new in-memory store using the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store whose timestamps and pruning cutoffs come from `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { state: RwLock::new(State::new(clock)) }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        Ok(self.state.read()?)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        Ok(self.state.write()?)
    }
}

impl Default for MemoryDataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryDataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDataStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    // =========================================================================
    // Bundles
    // =========================================================================

    #[instrument(skip(self, bundle), fields(trust_domain = %bundle.trust_domain))]
    async fn create_bundle(&self, bundle: Bundle) -> Result<Bundle> {
        self.write()?.create_bundle(bundle)
    }

    async fn fetch_bundle(&self, trust_domain: &TrustDomain) -> Result<Option<Bundle>> {
        Ok(self.read()?.fetch_bundle(trust_domain))
    }

    #[instrument(skip(self, bundle), fields(trust_domain = %bundle.trust_domain))]
    async fn update_bundle(&self, bundle: Bundle, mask: BundleMask) -> Result<Bundle> {
        self.write()?.update_bundle(bundle, mask)
    }

    #[instrument(skip(self, bundle), fields(trust_domain = %bundle.trust_domain))]
    async fn set_bundle(&self, bundle: Bundle) -> Result<Bundle> {
        self.write()?.set_bundle(bundle)
    }

    #[instrument(skip(self, bundle), fields(trust_domain = %bundle.trust_domain))]
    async fn append_bundle(&self, bundle: Bundle) -> Result<Bundle> {
        self.write()?.append_bundle(bundle)
    }

    #[instrument(skip(self), fields(trust_domain = %trust_domain))]
    async fn delete_bundle(&self, trust_domain: &TrustDomain, mode: DeleteMode) -> Result<()> {
        self.write()?.delete_bundle(trust_domain, mode)
    }

    async fn list_bundles(&self, request: ListBundlesRequest) -> Result<ListBundlesResponse> {
        self.read()?.list_bundles(&request)
    }

    async fn count_bundles(&self) -> Result<usize> {
        Ok(self.read()?.count_bundles())
    }

    #[instrument(skip(self), fields(trust_domain = %trust_domain))]
    async fn prune_bundle(
        &self,
        trust_domain: &TrustDomain,
        expires_before: DateTime<Utc>,
    ) -> Result<bool> {
        self.write()?.prune_bundle(trust_domain, expires_before)
    }

    // =========================================================================
    // Attested nodes
    // =========================================================================

    #[instrument(skip(self, node), fields(node_id = %node.spiffe_id))]
    async fn create_attested_node(&self, node: AttestedNode) -> Result<AttestedNode> {
        self.write()?.create_attested_node(node)
    }

    async fn fetch_attested_node(&self, spiffe_id: &SpiffeId) -> Result<Option<AttestedNode>> {
        Ok(self.read()?.fetch_attested_node(spiffe_id))
    }

    #[instrument(skip(self, node), fields(node_id = %node.spiffe_id))]
    async fn update_attested_node(
        &self,
        node: AttestedNode,
        mask: AttestedNodeMask,
    ) -> Result<AttestedNode> {
        self.write()?.update_attested_node(node, mask)
    }

    #[instrument(skip(self), fields(node_id = %spiffe_id))]
    async fn delete_attested_node(&self, spiffe_id: &SpiffeId) -> Result<AttestedNode> {
        self.write()?.delete_attested_node(spiffe_id)
    }

    async fn list_attested_nodes(
        &self,
        request: ListAttestedNodesRequest,
    ) -> Result<ListAttestedNodesResponse> {
        self.read()?.list_attested_nodes(&request)
    }

    async fn count_attested_nodes(&self, filter: AttestedNodeFilter) -> Result<usize> {
        Ok(self.read()?.count_attested_nodes(&filter))
    }

    #[instrument(skip(self))]
    async fn prune_attested_expired_nodes(
        &self,
        expired_before: DateTime<Utc>,
        include_non_reattestable: bool,
    ) -> Result<usize> {
        self.write()?.prune_attested_expired_nodes(expired_before, include_non_reattestable)
    }

    #[instrument(skip(self, selectors), fields(node_id = %spiffe_id, count = selectors.len()))]
    async fn set_node_selectors(
        &self,
        spiffe_id: &SpiffeId,
        selectors: Vec<Selector>,
    ) -> Result<()> {
        self.write()?.set_node_selectors(spiffe_id, selectors)
    }

    async fn get_node_selectors(
        &self,
        spiffe_id: &SpiffeId,
        _consistency: DataConsistency,
    ) -> Result<Vec<Selector>> {
        Ok(self.read()?.get_node_selectors(spiffe_id))
    }

    async fn list_node_selectors(
        &self,
        request: ListNodeSelectorsRequest,
    ) -> Result<HashMap<SpiffeId, Vec<Selector>>> {
        Ok(self.read()?.list_node_selectors(&request))
    }

    // =========================================================================
    // Attested node events
    // =========================================================================

    async fn list_attested_node_events(
        &self,
        request: ListEventsRequest,
    ) -> Result<ListEventsResponse<AttestedNodeEvent>> {
        self.read()?.node_events.list(&request)
    }

    #[instrument(skip(self))]
    async fn prune_attested_node_events(&self, older_than: Duration) -> Result<usize> {
        self.write()?.prune_node_events(older_than)
    }

    async fn fetch_attested_node_event(&self, event_id: u64) -> Result<Option<AttestedNodeEvent>> {
        Ok(self.read()?.node_events.fetch(event_id))
    }

    async fn create_attested_node_event(
        &self,
        spiffe_id: SpiffeId,
        op: EventOp,
    ) -> Result<AttestedNodeEvent> {
        Ok(self.write()?.record_node_event(&spiffe_id, op))
    }

    async fn delete_attested_node_event(&self, event_id: u64) -> Result<()> {
        self.write()?.node_events.delete(event_id)
    }

    // =========================================================================
    // Registration entries
    // =========================================================================

    #[instrument(skip(self, entry), fields(entry_id = %entry.id, spiffe_id = %entry.spiffe_id))]
    async fn create_registration_entry(
        &self,
        entry: RegistrationEntry,
    ) -> Result<RegistrationEntry> {
        self.write()?.create_registration_entry(entry)
    }

    #[instrument(skip(self, entry), fields(spiffe_id = %entry.spiffe_id))]
    async fn create_or_return_registration_entry(
        &self,
        entry: RegistrationEntry,
    ) -> Result<(RegistrationEntry, bool)> {
        self.write()?.create_or_return_registration_entry(entry)
    }

    async fn fetch_registration_entry(&self, id: &EntryId) -> Result<Option<RegistrationEntry>> {
        Ok(self.read()?.fetch_registration_entry(id))
    }

    async fn fetch_registration_entries(
        &self,
        ids: &[EntryId],
    ) -> Result<HashMap<EntryId, RegistrationEntry>> {
        Ok(self.read()?.fetch_registration_entries(ids))
    }

    #[instrument(skip(self, entry), fields(entry_id = %entry.id))]
    async fn update_registration_entry(
        &self,
        entry: RegistrationEntry,
        mask: RegistrationEntryMask,
    ) -> Result<RegistrationEntry> {
        self.write()?.update_registration_entry(entry, mask)
    }

    #[instrument(skip(self), fields(entry_id = %id))]
    async fn delete_registration_entry(&self, id: &EntryId) -> Result<RegistrationEntry> {
        self.write()?.delete_registration_entry(id)
    }

    async fn list_registration_entries(
        &self,
        request: ListRegistrationEntriesRequest,
    ) -> Result<ListRegistrationEntriesResponse> {
        self.read()?.list_registration_entries(&request)
    }

    async fn count_registration_entries(&self, filter: RegistrationEntryFilter) -> Result<usize> {
        Ok(self.read()?.count_registration_entries(&filter))
    }

    #[instrument(skip(self))]
    async fn prune_registration_entries(&self, expires_before: DateTime<Utc>) -> Result<usize> {
        Ok(self.write()?.prune_registration_entries(expires_before))
    }

    // =========================================================================
    // Registration entry events
    // =========================================================================

    async fn list_registration_entry_events(
        &self,
        request: ListEventsRequest,
    ) -> Result<ListEventsResponse<RegistrationEntryEvent>> {
        self.read()?.entry_events.list(&request)
    }

    #[instrument(skip(self))]
    async fn prune_registration_entry_events(&self, older_than: Duration) -> Result<usize> {
        self.write()?.prune_entry_events(older_than)
    }

    async fn fetch_registration_entry_event(
        &self,
        event_id: u64,
    ) -> Result<Option<RegistrationEntryEvent>> {
        Ok(self.read()?.entry_events.fetch(event_id))
    }

    async fn create_registration_entry_event(
        &self,
        entry_id: EntryId,
        op: EventOp,
    ) -> Result<RegistrationEntryEvent> {
        Ok(self.write()?.record_entry_event(&entry_id, op))
    }

    async fn delete_registration_entry_event(&self, event_id: u64) -> Result<()> {
        self.write()?.entry_events.delete(event_id)
    }

    // =========================================================================
    // Join tokens
    // =========================================================================

    async fn create_join_token(&self, token: JoinToken) -> Result<JoinToken> {
        self.write()?.create_join_token(token)
    }

    async fn fetch_join_token(&self, token: &str) -> Result<Option<JoinToken>> {
        Ok(self.read()?.fetch_join_token(token))
    }

    async fn delete_join_token(&self, token: &str) -> Result<()> {
        self.write()?.delete_join_token(token)
    }

    #[instrument(skip(self))]
    async fn prune_join_tokens(&self, expires_before: DateTime<Utc>) -> Result<usize> {
        Ok(self.write()?.prune_join_tokens(expires_before))
    }

    // =========================================================================
    // Federation relationships
    // =========================================================================

    #[instrument(skip(self, relationship), fields(trust_domain = %relationship.trust_domain))]
    async fn create_federation_relationship(
        &self,
        relationship: FederationRelationship,
    ) -> Result<FederationRelationship> {
        self.write()?.create_federation_relationship(relationship)
    }

    async fn fetch_federation_relationship(
        &self,
        trust_domain: &TrustDomain,
    ) -> Result<Option<FederationRelationship>> {
        Ok(self.read()?.fetch_federation_relationship(trust_domain))
    }

    #[instrument(skip(self, relationship), fields(trust_domain = %relationship.trust_domain))]
    async fn update_federation_relationship(
        &self,
        relationship: FederationRelationship,
        mask: FederationRelationshipMask,
    ) -> Result<FederationRelationship> {
        self.write()?.update_federation_relationship(relationship, mask)
    }

    #[instrument(skip(self), fields(trust_domain = %trust_domain))]
    async fn delete_federation_relationship(&self, trust_domain: &TrustDomain) -> Result<()> {
        self.write()?.delete_federation_relationship(trust_domain)
    }

    async fn list_federation_relationships(
        &self,
        request: ListFederationRelationshipsRequest,
    ) -> Result<ListFederationRelationshipsResponse> {
        self.read()?.list_federation_relationships(&request)
    }

    // =========================================================================
    // CA journals and authorities
    // =========================================================================

    #[instrument(skip(self, journal), fields(trust_domain = %journal.trust_domain))]
    async fn set_ca_journal(&self, journal: CaJournal) -> Result<CaJournal> {
        self.write()?.set_ca_journal(journal)
    }

    async fn fetch_ca_journal(
        &self,
        active_x509_authority_id: &str,
    ) -> Result<Option<CaJournal>> {
        Ok(self.read()?.fetch_ca_journal(active_x509_authority_id))
    }

    async fn list_ca_journals(&self) -> Result<Vec<CaJournal>> {
        Ok(self.read()?.list_ca_journals())
    }

    #[instrument(skip(self))]
    async fn prune_ca_journals(&self, all_cas_expire_before: DateTime<Utc>) -> Result<usize> {
        Ok(self.write()?.prune_ca_journals(all_cas_expire_before))
    }

    #[instrument(skip(self), fields(trust_domain = %trust_domain))]
    async fn taint_x509_ca(&self, trust_domain: &TrustDomain, authority_id: &str) -> Result<()> {
        self.write()?
            .change_authority(
                trust_domain,
                AuthorityKind::X509,
                authority_id,
                AuthorityChange::Taint,
            )
            .map(|_| ())
    }

    #[instrument(skip(self), fields(trust_domain = %trust_domain))]
    async fn revoke_x509_ca(&self, trust_domain: &TrustDomain, authority_id: &str) -> Result<()> {
        self.write()?
            .change_authority(
                trust_domain,
                AuthorityKind::X509,
                authority_id,
                AuthorityChange::Revoke,
            )
            .map(|_| ())
    }

    #[instrument(skip(self), fields(trust_domain = %trust_domain))]
    async fn taint_jwt_key(&self, trust_domain: &TrustDomain, key_id: &str) -> Result<PublicKey> {
        self.write()?
            .change_authority(trust_domain, AuthorityKind::Jwt, key_id, AuthorityChange::Taint)?
            .ok_or_else(|| TrustplaneError::internal(format!("no key material for '{}'", key_id)))
    }

    #[instrument(skip(self), fields(trust_domain = %trust_domain))]
    async fn revoke_jwt_key(&self, trust_domain: &TrustDomain, key_id: &str) -> Result<PublicKey> {
        self.write()?
            .change_authority(trust_domain, AuthorityKind::Jwt, key_id, AuthorityChange::Revoke)?
            .ok_or_else(|| TrustplaneError::internal(format!("no key material for '{}'", key_id)))
    }
}
