//! Resolution of the registration entries an agent is authorized for.
//!
//! An agent is authorized for
//!
//! - entries parented directly to the agent's SPIFFE ID,
//! - node-alias entries (parented to the trust domain's server ID) whose
//!   selectors are a subset of the agent's node selectors,
//! - and, transitively, every entry parented to one of the above.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::domain::{selector, EntryId, MatchBehavior, RegistrationEntry, Selector, SpiffeId};
use crate::errors::Result;
use crate::storage::{
    BySelectors, DataConsistency, DataStore, ListRegistrationEntriesRequest,
    RegistrationEntryFilter,
};

/// Computes authorized entries from any [`DataStore`]
#[derive(Clone)]
pub struct AuthorizedEntryResolver {
    store: Arc<dyn DataStore>,
}

impl AuthorizedEntryResolver {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    /// Every entry authorized for `agent_id`, ordered by entry ID
    #[instrument(skip(self), fields(agent_id = %agent_id))]
    pub async fn authorized_entries(&self, agent_id: &SpiffeId) -> Result<Vec<RegistrationEntry>> {
        let node_selectors = self.node_selectors(agent_id).await?;

        let mut found: HashMap<EntryId, RegistrationEntry> = HashMap::new();
        let mut parents: VecDeque<SpiffeId> = VecDeque::from([agent_id.clone()]);
        for alias in self.matching_aliases(agent_id, &node_selectors).await? {
            parents.push_back(alias.spiffe_id.clone());
            found.insert(alias.id.clone(), alias);
        }

        self.collect_descendants(parents, &mut found).await?;
        debug!(count = found.len(), "Resolved authorized entries");
        Ok(sorted(found))
    }

    /// The entries among `ids` that are authorized for `agent_id`, together
    /// with all of their descendants.
    ///
    /// Missing IDs are skipped. The descendants make this usable for
    /// incremental updates: a changed entry can newly authorize a subtree.
    #[instrument(skip(self, ids), fields(agent_id = %agent_id, requested = ids.len()))]
    pub async fn authorized_entries_for_ids(
        &self,
        agent_id: &SpiffeId,
        ids: &[EntryId],
    ) -> Result<Vec<RegistrationEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let node_selectors = self.node_selectors(agent_id).await?;
        let candidates = self.store.fetch_registration_entries(ids).await?;

        let mut found: HashMap<EntryId, RegistrationEntry> = HashMap::new();
        for entry in candidates.into_values() {
            if self.is_authorized(agent_id, &node_selectors, &entry).await? {
                found.insert(entry.id.clone(), entry);
            }
        }

        let parents = found.values().map(|e| e.spiffe_id.clone()).collect();
        self.collect_descendants(parents, &mut found).await?;
        Ok(sorted(found))
    }

    async fn node_selectors(&self, agent_id: &SpiffeId) -> Result<Vec<Selector>> {
        self.store.get_node_selectors(agent_id, DataConsistency::AllowStale).await
    }

    async fn matching_aliases(
        &self,
        agent_id: &SpiffeId,
        node_selectors: &[Selector],
    ) -> Result<Vec<RegistrationEntry>> {
        if node_selectors.is_empty() {
            return Ok(Vec::new());
        }
        let filter = RegistrationEntryFilter {
            by_parent_id: Some(agent_id.trust_domain().server_id()),
            by_selectors: Some(BySelectors::new(node_selectors.to_vec(), MatchBehavior::Subset)),
            ..Default::default()
        };
        let response = self
            .store
            .list_registration_entries(ListRegistrationEntriesRequest::with_filter(filter))
            .await?;
        Ok(response.entries)
    }

    /// Breadth-first walk down the parent relation. Each SPIFFE ID is expanded
    /// once, so parent cycles terminate.
    async fn collect_descendants(
        &self,
        mut parents: VecDeque<SpiffeId>,
        found: &mut HashMap<EntryId, RegistrationEntry>,
    ) -> Result<()> {
        let mut expanded: HashSet<SpiffeId> = HashSet::new();
        while let Some(parent) = parents.pop_front() {
            if !expanded.insert(parent.clone()) {
                continue;
            }
            let filter = RegistrationEntryFilter::by_parent(parent);
            let request = ListRegistrationEntriesRequest::with_filter(filter);
            for child in self.store.list_registration_entries(request).await?.entries {
                if !found.contains_key(&child.id) {
                    parents.push_back(child.spiffe_id.clone());
                    found.insert(child.id.clone(), child);
                }
            }
        }
        Ok(())
    }

    /// Walk up from `entry` until the chain reaches the agent or a matching
    /// node alias.
    async fn is_authorized(
        &self,
        agent_id: &SpiffeId,
        node_selectors: &[Selector],
        entry: &RegistrationEntry,
    ) -> Result<bool> {
        let server_id = agent_id.trust_domain().server_id();
        let mut frontier = vec![entry.clone()];
        let mut visited: HashSet<EntryId> = HashSet::new();

        while let Some(current) = frontier.pop() {
            if !visited.insert(current.id.clone()) {
                continue;
            }
            if &current.parent_id == agent_id {
                return Ok(true);
            }
            if current.parent_id == server_id {
                if selector::is_subset(&current.selectors, node_selectors) {
                    return Ok(true);
                }
                continue;
            }
            let filter = RegistrationEntryFilter::by_spiffe_id(current.parent_id.clone());
            let parents = self
                .store
                .list_registration_entries(ListRegistrationEntriesRequest::with_filter(filter))
                .await?;
            frontier.extend(parents.entries);
        }
        Ok(false)
    }
}

fn sorted(found: HashMap<EntryId, RegistrationEntry>) -> Vec<RegistrationEntry> {
    let mut entries: Vec<RegistrationEntry> = found.into_values().collect();
    entries.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
    entries
}
