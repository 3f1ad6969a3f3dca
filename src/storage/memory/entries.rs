use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::domain::{
    selector, EntryId, EventOp, RegistrationEntry, RegistrationEntryMask, TrustDomain,
};
use crate::errors::{Result, TrustplaneError};
use crate::storage::request::{
    ListRegistrationEntriesRequest, ListRegistrationEntriesResponse, RegistrationEntryFilter,
};
use crate::storage::validation::validate_record;

use super::{paginate, State};

const RESOURCE: &str = "registration_entry";

impl State {
    fn check_federated_bundles(&self, federates_with: &[TrustDomain]) -> Result<()> {
        for td in federates_with {
            if !self.bundles.contains_key(td.as_str()) {
                return Err(TrustplaneError::invalid_field(
                    format!("no bundle for federated trust domain '{}'", td),
                    "federates_with",
                ));
            }
        }
        Ok(())
    }

    fn existing_by_key(&self, entry: &RegistrationEntry) -> Option<&RegistrationEntry> {
        self.entry_keys.get(&entry.key()).and_then(|id| self.entries.get(id.as_str()))
    }

    pub(super) fn create_registration_entry(
        &mut self,
        mut entry: RegistrationEntry,
    ) -> Result<RegistrationEntry> {
        validate_record(&entry)?;
        self.check_federated_bundles(&entry.federates_with)?;
        if self.entries.contains_key(entry.id.as_str()) {
            return Err(TrustplaneError::already_exists(RESOURCE, entry.id.as_str()));
        }
        if let Some(existing) = self.existing_by_key(&entry) {
            return Err(TrustplaneError::already_exists(RESOURCE, existing.id.as_str()));
        }

        entry.selectors = selector::normalize(entry.selectors);
        entry.revision_number = 0;
        entry.created_at = self.clock.now();
        self.entry_keys.insert(entry.key(), entry.id.clone());
        self.entries.insert(entry.id.to_string(), entry.clone());
        self.record_entry_event(&entry.id, EventOp::Created);
        info!(
            entry_id = %entry.id,
            spiffe_id = %entry.spiffe_id,
            parent_id = %entry.parent_id,
            "Created registration entry"
        );
        Ok(entry)
    }

    pub(super) fn create_or_return_registration_entry(
        &mut self,
        entry: RegistrationEntry,
    ) -> Result<(RegistrationEntry, bool)> {
        validate_record(&entry)?;
        if let Some(existing) = self.existing_by_key(&entry) {
            return Ok((existing.clone(), true));
        }
        let created = self.create_registration_entry(entry)?;
        Ok((created, false))
    }

    pub(super) fn fetch_registration_entry(&self, id: &EntryId) -> Option<RegistrationEntry> {
        self.entries.get(id.as_str()).cloned()
    }

    pub(super) fn fetch_registration_entries(
        &self,
        ids: &[EntryId],
    ) -> HashMap<EntryId, RegistrationEntry> {
        ids.iter()
            .filter_map(|id| self.entries.get(id.as_str()).map(|e| (id.clone(), e.clone())))
            .collect()
    }

    pub(super) fn update_registration_entry(
        &mut self,
        entry: RegistrationEntry,
        mask: RegistrationEntryMask,
    ) -> Result<RegistrationEntry> {
        let current = self
            .entries
            .get(entry.id.as_str())
            .ok_or_else(|| TrustplaneError::not_found(RESOURCE, entry.id.as_str()))?;

        let mut updated = current.clone();
        mask.apply(&mut updated, entry);
        updated.selectors = selector::normalize(updated.selectors);
        validate_record(&updated)?;
        self.check_federated_bundles(&updated.federates_with)?;

        let old_key = current.key();
        let new_key = updated.key();
        if new_key != old_key {
            if let Some(other) = self.entry_keys.get(&new_key) {
                return Err(TrustplaneError::already_exists(RESOURCE, other.as_str()));
            }
        }

        updated.revision_number += 1;
        self.entry_keys.remove(&old_key);
        self.entry_keys.insert(new_key, updated.id.clone());
        self.entries.insert(updated.id.to_string(), updated.clone());
        self.record_entry_event(&updated.id, EventOp::Updated);
        debug!(
            entry_id = %updated.id,
            revision = updated.revision_number,
            "Updated registration entry"
        );
        Ok(updated)
    }

    /// Remove an entry, its key index and record the deletion event
    pub(super) fn remove_entry(&mut self, id: &EntryId) -> Option<RegistrationEntry> {
        let entry = self.entries.remove(id.as_str())?;
        self.entry_keys.remove(&entry.key());
        self.record_entry_event(id, EventOp::Deleted);
        Some(entry)
    }

    pub(super) fn delete_registration_entry(&mut self, id: &EntryId) -> Result<RegistrationEntry> {
        self.remove_entry(id).ok_or_else(|| TrustplaneError::not_found(RESOURCE, id.as_str()))
    }

    pub(super) fn list_registration_entries(
        &self,
        request: &ListRegistrationEntriesRequest,
    ) -> Result<ListRegistrationEntriesResponse> {
        let matching = self
            .entries
            .iter()
            .filter(|(_, e)| request.filter.matches(e))
            .map(|(key, e)| (key, e.clone()));
        let (entries, next_token) = paginate(matching, request.pagination.as_ref())?;
        Ok(ListRegistrationEntriesResponse { entries, next_token })
    }

    pub(super) fn count_registration_entries(&self, filter: &RegistrationEntryFilter) -> usize {
        self.entries.values().filter(|e| filter.matches(e)).count()
    }

    pub(super) fn prune_registration_entries(&mut self, expires_before: DateTime<Utc>) -> usize {
        let expired: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.is_expired(expires_before))
            .map(|e| e.id.clone())
            .collect();
        for id in &expired {
            self.remove_entry(id);
            debug!(entry_id = %id, "Pruned expired registration entry");
        }
        expired.len()
    }
}
