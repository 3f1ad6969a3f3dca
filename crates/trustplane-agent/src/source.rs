//! Where the agent reads authorized entries and change events from.
//!
//! [`EntrySource`] is the agent's view of the server. [`StoreEntrySource`]
//! answers it in-process from any [`DataStore`].

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tracing::{debug, instrument};

use trustplane::domain::{
    AttestedNodeEvent, Bundle, EntryId, RegistrationEntry, RegistrationEntryEvent, SpiffeId,
    StoreEvent, TrustDomain,
};
use trustplane::services::AuthorizedEntryResolver;
use trustplane::storage::{DataStore, ListEventsRequest, ListEventsResponse};
use trustplane::{Result, TrustplaneError};

/// Identity the server presented when the agent connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub spiffe_id: SpiffeId,
    /// Authority that signed the server's certificate
    pub authority_id: String,
}

impl ServerIdentity {
    pub fn new(spiffe_id: SpiffeId, authority_id: impl Into<String>) -> Self {
        Self { spiffe_id, authority_id: authority_id.into() }
    }

    /// Whether the identity is the trust domain's server, signed by an
    /// authority in `bundle`
    pub fn is_trusted_by(&self, trust_domain: &TrustDomain, bundle: &Bundle) -> bool {
        self.spiffe_id == trust_domain.server_id()
            && bundle.root_cas.iter().any(|ca| ca.authority_id == self.authority_id)
    }
}

/// Events after a cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch<E> {
    pub events: Vec<E>,
    pub latest_event_id: u64,
    /// An event after the cursor was pruned; the batch is incomplete
    pub too_old: bool,
}

impl<E: StoreEvent> From<ListEventsResponse<E>> for EventBatch<E> {
    fn from(response: ListEventsResponse<E>) -> Self {
        Self {
            events: response.events,
            latest_event_id: response.latest_event_id,
            too_old: response.cursor_too_old,
        }
    }
}

/// Latest issued event IDs, one per kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatestEventIds {
    pub entry_event_id: u64,
    pub node_event_id: u64,
}

#[async_trait]
pub trait EntrySource: Send + Sync {
    async fn server_identity(&self) -> Result<ServerIdentity>;

    async fn bundle(&self, trust_domain: &TrustDomain) -> Result<Option<Bundle>>;

    /// Every entry `agent_id` is authorized for
    async fn authorized_entries(&self, agent_id: &SpiffeId) -> Result<Vec<RegistrationEntry>>;

    async fn latest_event_ids(&self) -> Result<LatestEventIds>;

    async fn entry_events_since(&self, cursor: u64) -> Result<EventBatch<RegistrationEntryEvent>>;

    async fn node_events_since(&self, cursor: u64) -> Result<EventBatch<AttestedNodeEvent>>;

    /// The entries among `ids` that `agent_id` is authorized for, plus their
    /// descendants
    async fn authorized_entries_for_ids(
        &self,
        agent_id: &SpiffeId,
        ids: &[EntryId],
    ) -> Result<Vec<RegistrationEntry>>;
}

/// In-process source reading straight from a [`DataStore`]
pub struct StoreEntrySource {
    store: Arc<dyn DataStore>,
    resolver: AuthorizedEntryResolver,
    trust_domain: TrustDomain,
    presented: RwLock<Option<ServerIdentity>>,
}

impl StoreEntrySource {
    pub fn new(store: Arc<dyn DataStore>, trust_domain: TrustDomain) -> Self {
        let resolver = AuthorizedEntryResolver::new(store.clone());
        Self { store, resolver, trust_domain, presented: RwLock::new(None) }
    }

    /// Present `identity` instead of the one derived from the bundle, as a
    /// server with a new or forged certificate would
    pub fn present_identity(&self, identity: Option<ServerIdentity>) -> Result<()> {
        *self.presented.write()? = identity;
        Ok(())
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }
}

#[async_trait]
impl EntrySource for StoreEntrySource {
    /// Unless overridden, the server is signed by the first untainted root CA
    /// of its own bundle.
    async fn server_identity(&self) -> Result<ServerIdentity> {
        if let Some(identity) = self.presented.read()?.clone() {
            return Ok(identity);
        }
        let bundle = self.store.fetch_bundle(&self.trust_domain).await?.ok_or_else(|| {
            TrustplaneError::not_found("bundle", self.trust_domain.as_str())
        })?;
        let authority = bundle
            .root_cas
            .iter()
            .find(|ca| !ca.tainted)
            .ok_or_else(|| TrustplaneError::internal("server bundle has no usable root CA"))?;
        Ok(ServerIdentity::new(self.trust_domain.server_id(), authority.authority_id.clone()))
    }

    async fn bundle(&self, trust_domain: &TrustDomain) -> Result<Option<Bundle>> {
        self.store.fetch_bundle(trust_domain).await
    }

    async fn authorized_entries(&self, agent_id: &SpiffeId) -> Result<Vec<RegistrationEntry>> {
        self.resolver.authorized_entries(agent_id).await
    }

    #[instrument(skip(self))]
    async fn latest_event_ids(&self) -> Result<LatestEventIds> {
        // no event ID can exceed u64::MAX, so this only reads the counters
        let probe = ListEventsRequest::since(u64::MAX);
        let entries = self.store.list_registration_entry_events(probe).await?;
        let nodes = self.store.list_attested_node_events(probe).await?;
        let latest = LatestEventIds {
            entry_event_id: entries.latest_event_id,
            node_event_id: nodes.latest_event_id,
        };
        debug!(?latest, "Read latest event IDs");
        Ok(latest)
    }

    async fn entry_events_since(&self, cursor: u64) -> Result<EventBatch<RegistrationEntryEvent>> {
        let response =
            self.store.list_registration_entry_events(ListEventsRequest::since(cursor)).await?;
        Ok(response.into())
    }

    async fn node_events_since(&self, cursor: u64) -> Result<EventBatch<AttestedNodeEvent>> {
        let response =
            self.store.list_attested_node_events(ListEventsRequest::since(cursor)).await?;
        Ok(response.into())
    }

    async fn authorized_entries_for_ids(
        &self,
        agent_id: &SpiffeId,
        ids: &[EntryId],
    ) -> Result<Vec<RegistrationEntry>> {
        self.resolver.authorized_entries_for_ids(agent_id, ids).await
    }
}
