//! Local cache of authorized registration entries.
//!
//! Readers take an `Arc` of the current [`CacheSnapshot`] and keep using it
//! while the synchronizer builds the next one; [`EntryCache::replace`] swaps
//! the whole snapshot in one step.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use trustplane::domain::{selector, EntryId, RegistrationEntry, Selector, SpiffeId};

use crate::error::Result;

/// Immutable view of the authorized entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSnapshot {
    by_id: BTreeMap<EntryId, RegistrationEntry>,
    by_spiffe_id: HashMap<SpiffeId, Vec<EntryId>>,
}

impl CacheSnapshot {
    pub fn from_entries(entries: impl IntoIterator<Item = RegistrationEntry>) -> Self {
        let mut snapshot = Self::default();
        for entry in entries {
            let ids = snapshot.by_spiffe_id.entry(entry.spiffe_id.clone()).or_default();
            ids.push(entry.id.clone());
            snapshot.by_id.insert(entry.id.clone(), entry);
        }
        for ids in snapshot.by_spiffe_id.values_mut() {
            ids.sort();
            ids.dedup();
        }
        snapshot
    }

    pub fn get(&self, id: &EntryId) -> Option<&RegistrationEntry> {
        self.by_id.get(id)
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Entries issuing `spiffe_id`
    pub fn by_spiffe_id(&self, spiffe_id: &SpiffeId) -> Vec<&RegistrationEntry> {
        self.by_spiffe_id
            .get(spiffe_id)
            .map(|ids| ids.iter().filter_map(|id| self.by_id.get(id)).collect())
            .unwrap_or_default()
    }

    /// Entries whose selectors are all present in `workload_selectors`
    pub fn matching(&self, workload_selectors: &[Selector]) -> Vec<&RegistrationEntry> {
        self.by_id
            .values()
            .filter(|entry| selector::is_subset(&entry.selectors, workload_selectors))
            .collect()
    }

    /// IDs of cached entries below `parent` in the parent relation
    pub fn descendants_of(&self, parent: &SpiffeId) -> HashSet<EntryId> {
        let mut found = HashSet::new();
        let mut expanded = HashSet::new();
        let mut pending = vec![parent.clone()];
        while let Some(current) = pending.pop() {
            if !expanded.insert(current.clone()) {
                continue;
            }
            for entry in self.by_id.values().filter(|e| e.parent_id == current) {
                if found.insert(entry.id.clone()) {
                    pending.push(entry.spiffe_id.clone());
                }
            }
        }
        found
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegistrationEntry> {
        self.by_id.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &EntryId> {
        self.by_id.keys()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Shared handle to the current snapshot
#[derive(Debug, Default)]
pub struct EntryCache {
    current: RwLock<Arc<CacheSnapshot>>,
}

impl EntryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Result<Arc<CacheSnapshot>> {
        Ok(self.current.read()?.clone())
    }

    /// Swap in `next`, returning the snapshot it replaced
    pub fn replace(&self, next: CacheSnapshot) -> Result<Arc<CacheSnapshot>> {
        let mut current = self.current.write()?;
        Ok(std::mem::replace(&mut *current, Arc::new(next)))
    }
}
