use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::domain::{selector, AttestedNode, AttestedNodeMask, EventOp, Selector, SpiffeId};
use crate::errors::{Result, TrustplaneError};
use crate::storage::request::{
    AttestedNodeFilter, ListAttestedNodesRequest, ListAttestedNodesResponse,
    ListNodeSelectorsRequest,
};
use crate::storage::validation::validate_record;

use super::{paginate, State};

const RESOURCE: &str = "attested_node";

impl State {
    fn selectors_of(&self, spiffe_id: &SpiffeId) -> Vec<Selector> {
        self.node_selectors.get(spiffe_id).cloned().unwrap_or_default()
    }

    fn with_selectors(&self, mut node: AttestedNode) -> AttestedNode {
        node.selectors = self.selectors_of(&node.spiffe_id);
        node
    }

    pub(super) fn create_attested_node(&mut self, node: AttestedNode) -> Result<AttestedNode> {
        validate_record(&node)?;
        let key = node.spiffe_id.to_string();
        if self.nodes.contains_key(&key) {
            return Err(TrustplaneError::already_exists(RESOURCE, key));
        }

        if !node.selectors.is_empty() {
            self.node_selectors
                .insert(node.spiffe_id.clone(), selector::normalize(node.selectors.clone()));
        }
        let stored = AttestedNode { selectors: Vec::new(), ..node };
        self.nodes.insert(key, stored.clone());
        self.record_node_event(&stored.spiffe_id, EventOp::Created);
        Ok(self.with_selectors(stored))
    }

    pub(super) fn fetch_attested_node(&self, spiffe_id: &SpiffeId) -> Option<AttestedNode> {
        self.nodes.get(&spiffe_id.to_string()).cloned().map(|node| self.with_selectors(node))
    }

    pub(super) fn update_attested_node(
        &mut self,
        node: AttestedNode,
        mask: AttestedNodeMask,
    ) -> Result<AttestedNode> {
        let key = node.spiffe_id.to_string();
        let current = self
            .nodes
            .get_mut(&key)
            .ok_or_else(|| TrustplaneError::not_found(RESOURCE, key.clone()))?;
        mask.apply(current, node);
        let updated = current.clone();
        self.record_node_event(&updated.spiffe_id, EventOp::Updated);
        Ok(self.with_selectors(updated))
    }

    pub(super) fn delete_attested_node(&mut self, spiffe_id: &SpiffeId) -> Result<AttestedNode> {
        self.remove_node(spiffe_id)
    }

    fn remove_node(&mut self, spiffe_id: &SpiffeId) -> Result<AttestedNode> {
        let mut node = self
            .nodes
            .remove(&spiffe_id.to_string())
            .ok_or_else(|| TrustplaneError::not_found(RESOURCE, spiffe_id.to_string()))?;
        node.selectors = self.node_selectors.remove(spiffe_id).unwrap_or_default();
        self.record_node_event(spiffe_id, EventOp::Deleted);
        Ok(node)
    }

    pub(super) fn list_attested_nodes(
        &self,
        request: &ListAttestedNodesRequest,
    ) -> Result<ListAttestedNodesResponse> {
        let matching = self.nodes.iter().filter_map(|(key, node)| {
            let selectors = self.selectors_of(&node.spiffe_id);
            if !request.filter.matches(node, &selectors) {
                return None;
            }
            let selectors = if request.fetch_selectors { selectors } else { Vec::new() };
            Some((key, AttestedNode { selectors, ..node.clone() }))
        });
        let (nodes, next_token) = paginate(matching, request.pagination.as_ref())?;
        Ok(ListAttestedNodesResponse { nodes, next_token })
    }

    pub(super) fn count_attested_nodes(&self, filter: &AttestedNodeFilter) -> usize {
        self.nodes
            .values()
            .filter(|node| filter.matches(node, &self.selectors_of(&node.spiffe_id)))
            .count()
    }

    /// Banned nodes are kept so the ban survives expiry.
    pub(super) fn prune_attested_expired_nodes(
        &mut self,
        expired_before: DateTime<Utc>,
        include_non_reattestable: bool,
    ) -> Result<usize> {
        let expired: Vec<SpiffeId> = self
            .nodes
            .values()
            .filter(|node| node.cert_not_after < expired_before)
            .filter(|node| !node.is_banned())
            .filter(|node| node.can_reattest || include_non_reattestable)
            .map(|node| node.spiffe_id.clone())
            .collect();
        for spiffe_id in &expired {
            self.remove_node(spiffe_id)?;
            debug!(node_id = %spiffe_id, "Pruned expired attested node");
        }
        Ok(expired.len())
    }

    pub(super) fn set_node_selectors(
        &mut self,
        spiffe_id: &SpiffeId,
        selectors: Vec<Selector>,
    ) -> Result<()> {
        selectors.iter().try_for_each(Selector::validate)?;
        if selectors.is_empty() {
            self.node_selectors.remove(spiffe_id);
        } else {
            self.node_selectors.insert(spiffe_id.clone(), selector::normalize(selectors));
        }
        self.record_node_event(spiffe_id, EventOp::Updated);
        Ok(())
    }

    pub(super) fn get_node_selectors(&self, spiffe_id: &SpiffeId) -> Vec<Selector> {
        self.selectors_of(spiffe_id)
    }

    pub(super) fn list_node_selectors(
        &self,
        request: &ListNodeSelectorsRequest,
    ) -> HashMap<SpiffeId, Vec<Selector>> {
        self.node_selectors
            .iter()
            .filter(|(spiffe_id, _)| match request.valid_at {
                Some(valid_at) => self
                    .nodes
                    .get(&spiffe_id.to_string())
                    .is_some_and(|node| node.cert_not_after >= valid_at),
                None => true,
            })
            .map(|(spiffe_id, selectors)| (spiffe_id.clone(), selectors.clone()))
            .collect()
    }
}
