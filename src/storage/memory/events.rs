//! Append-only event tables with a monotonic ID counter.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::ops::Bound;

use crate::domain::{
    AttestedNodeEvent, EntryId, EventOp, RegistrationEntryEvent, SpiffeId, StoreEvent,
};
use crate::errors::{Result, TrustplaneError};
use crate::storage::request::{ListEventsRequest, ListEventsResponse};

use super::State;

#[derive(Debug)]
pub(super) struct EventTable<E> {
    resource_type: &'static str,
    events: BTreeMap<u64, E>,
    /// Highest ID ever issued. Only ever increases.
    last_issued: u64,
    /// Highest ID removed by pruning
    last_pruned: u64,
}

impl<E: StoreEvent> EventTable<E> {
    pub(super) fn new(resource_type: &'static str) -> Self {
        Self { resource_type, events: BTreeMap::new(), last_issued: 0, last_pruned: 0 }
    }

    pub(super) fn append(&mut self, build: impl FnOnce(u64) -> E) -> E {
        self.last_issued += 1;
        let event = build(self.last_issued);
        self.events.insert(self.last_issued, event.clone());
        event
    }

    pub(super) fn list(&self, request: &ListEventsRequest) -> Result<ListEventsResponse<E>> {
        if request.limit == Some(0) {
            return Err(TrustplaneError::invalid_field("limit must be greater than zero", "limit"));
        }
        let upper = match request.less_than_event_id {
            Some(less_than) => Bound::Excluded(less_than),
            None => Bound::Unbounded,
        };
        let lower = Bound::Excluded(request.greater_than_event_id);
        let empty_range =
            request.less_than_event_id.is_some_and(|lt| lt <= request.greater_than_event_id);
        let events: Vec<E> = if empty_range {
            Vec::new()
        } else {
            self.events
                .range((lower, upper))
                .map(|(_, e)| e.clone())
                .take(request.limit.unwrap_or(usize::MAX))
                .collect()
        };

        Ok(ListEventsResponse {
            events,
            latest_event_id: self.last_issued,
            cursor_too_old: request.greater_than_event_id < self.last_pruned,
        })
    }

    /// Remove events created at or before `cutoff`
    pub(super) fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let expired: Vec<u64> = self
            .events
            .iter()
            .filter(|(_, e)| e.created_at() <= cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.events.remove(id);
        }
        if let Some(max) = expired.iter().max() {
            self.last_pruned = self.last_pruned.max(*max);
        }
        expired.len()
    }

    pub(super) fn fetch(&self, event_id: u64) -> Option<E> {
        self.events.get(&event_id).cloned()
    }

    pub(super) fn delete(&mut self, event_id: u64) -> Result<()> {
        self.events
            .remove(&event_id)
            .map(|_| ())
            .ok_or_else(|| TrustplaneError::not_found(self.resource_type, event_id.to_string()))
    }
}

impl State {
    pub(super) fn record_node_event(
        &mut self,
        spiffe_id: &SpiffeId,
        op: EventOp,
    ) -> AttestedNodeEvent {
        let created_at = self.clock.now();
        self.node_events.append(|event_id| AttestedNodeEvent {
            event_id,
            spiffe_id: spiffe_id.clone(),
            op,
            created_at,
        })
    }

    pub(super) fn record_entry_event(
        &mut self,
        entry_id: &EntryId,
        op: EventOp,
    ) -> RegistrationEntryEvent {
        let created_at = self.clock.now();
        self.entry_events.append(|event_id| RegistrationEntryEvent {
            event_id,
            entry_id: entry_id.clone(),
            op,
            created_at,
        })
    }

    pub(super) fn prune_node_events(&mut self, older_than: std::time::Duration) -> Result<usize> {
        let cutoff = self.cutoff(older_than)?;
        Ok(self.node_events.prune(cutoff))
    }

    pub(super) fn prune_entry_events(&mut self, older_than: std::time::Duration) -> Result<usize> {
        let cutoff = self.cutoff(older_than)?;
        Ok(self.entry_events.prune(cutoff))
    }

    fn cutoff(&self, older_than: std::time::Duration) -> Result<DateTime<Utc>> {
        let age = chrono::Duration::from_std(older_than).map_err(|_| {
            TrustplaneError::invalid_field("event age is out of range", "older_than")
        })?;
        Ok(self.clock.now() - age)
    }
}
