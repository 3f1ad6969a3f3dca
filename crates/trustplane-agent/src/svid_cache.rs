//! LRU cache of issued credentials keyed by registration entry.
//!
//! The size limit is soft: entries pinned by an in-progress workload session
//! are never evicted, so the cache can temporarily hold more than
//! `max_size` entries. Pins are released by dropping the [`SvidPin`].

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use trustplane::domain::{EntryId, SpiffeId};

use crate::error::Result;

/// Credential issued for one registration entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Svid {
    pub spiffe_id: SpiffeId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Svid {
    pub fn new(spiffe_id: SpiffeId, issued_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self { spiffe_id, issued_at, expires_at }
    }

    /// Rotate once the remaining lifetime is at most half the lifetime, or
    /// at most `availability_target` when that is shorter than the lifetime.
    pub fn needs_rotation(
        &self,
        now: DateTime<Utc>,
        availability_target: Option<Duration>,
    ) -> bool {
        let lifetime = self.expires_at - self.issued_at;
        let half = lifetime / 2;
        let threshold = availability_target
            .and_then(|target| chrono::Duration::from_std(target).ok())
            .filter(|target| *target < lifetime)
            .map_or(half, |target| target.max(half));
        self.expires_at - now <= threshold
    }
}

#[derive(Debug)]
struct Slot<V> {
    value: V,
    last_used: u64,
    pins: usize,
    /// Removed while pinned; dropped when the last pin goes
    stale: bool,
}

#[derive(Debug)]
struct Slots<V> {
    entries: HashMap<EntryId, Slot<V>>,
    clock: u64,
}

impl<V> Slots<V> {
    fn touch(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Evict least-recently-used unpinned entries until the live entries fit
    /// within `max_size`, never evicting `keep`. Stale slots only wait for
    /// their pins and do not count.
    fn evict(&mut self, max_size: usize, keep: Option<&EntryId>) -> Vec<EntryId> {
        let mut evicted = Vec::new();
        let mut live = self.entries.values().filter(|slot| !slot.stale).count();
        while live > max_size {
            let victim = self
                .entries
                .iter()
                .filter(|(id, slot)| slot.pins == 0 && Some(*id) != keep)
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(id, _)| id.clone());
            match victim {
                Some(id) => {
                    self.entries.remove(&id);
                    evicted.push(id);
                    live -= 1;
                }
                None => break,
            }
        }
        evicted
    }
}

#[derive(Debug)]
pub struct SvidCache<V> {
    name: &'static str,
    max_size: usize,
    slots: Mutex<Slots<V>>,
}

impl<V: Clone> SvidCache<V> {
    pub fn new(name: &'static str, max_size: usize) -> Self {
        Self {
            name,
            max_size,
            slots: Mutex::new(Slots { entries: HashMap::new(), clock: 0 }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Cached value for `id`, marking it as recently used
    pub fn get(&self, id: &EntryId) -> Result<Option<V>> {
        let mut slots = self.slots.lock()?;
        let now = slots.touch();
        Ok(slots.entries.get_mut(id).filter(|slot| !slot.stale).map(|slot| {
            slot.last_used = now;
            slot.value.clone()
        }))
    }

    /// Insert or replace the value for `id`. Returns the IDs evicted to make
    /// room.
    pub fn insert(&self, id: EntryId, value: V) -> Result<Vec<EntryId>> {
        let mut slots = self.slots.lock()?;
        let now = slots.touch();
        let pins = slots.entries.get(&id).map_or(0, |slot| slot.pins);
        slots.entries.insert(id.clone(), Slot { value, last_used: now, pins, stale: false });

        let evicted = slots.evict(self.max_size, Some(&id));
        if !evicted.is_empty() {
            metrics::counter!("agent_svid_cache_evictions_total", "cache" => self.name)
                .increment(evicted.len() as u64);
            debug!(cache = self.name, count = evicted.len(), "Evicted cached credentials");
        }
        Ok(evicted)
    }

    /// Pin `id` for the lifetime of the returned guard
    pub fn pin(self: &Arc<Self>, id: &EntryId) -> Result<Option<SvidPin<V>>> {
        let mut slots = self.slots.lock()?;
        let now = slots.touch();
        let Some(slot) = slots.entries.get_mut(id).filter(|slot| !slot.stale) else {
            return Ok(None);
        };
        slot.pins += 1;
        slot.last_used = now;
        let value = slot.value.clone();
        Ok(Some(SvidPin { cache: Arc::clone(self), id: id.clone(), value }))
    }

    /// Remove `id`. A pinned entry stays until its last pin is dropped.
    pub fn remove(&self, id: &EntryId) -> Result<bool> {
        let mut slots = self.slots.lock()?;
        Ok(Self::remove_slot(&mut slots, id))
    }

    /// Remove every entry whose ID fails `keep`. Returns how many entries
    /// were removed or marked for removal.
    pub fn retain_ids<F>(&self, mut keep: F) -> Result<usize>
    where
        F: FnMut(&EntryId) -> bool,
    {
        let mut slots = self.slots.lock()?;
        let doomed: Vec<EntryId> = slots
            .entries
            .iter()
            .filter(|(id, slot)| !slot.stale && !keep(id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            Self::remove_slot(&mut slots, id);
        }
        Ok(doomed.len())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.slots.lock()?.entries.values().filter(|slot| !slot.stale).count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn remove_slot(slots: &mut Slots<V>, id: &EntryId) -> bool {
        let pinned = match slots.entries.get(id) {
            Some(slot) => slot.pins > 0,
            None => return false,
        };
        if !pinned {
            return slots.entries.remove(id).is_some();
        }
        if let Some(slot) = slots.entries.get_mut(id) {
            slot.stale = true;
        }
        true
    }

    fn unpin(&self, id: &EntryId) {
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        let drop_slot = match slots.entries.get_mut(id) {
            Some(slot) => {
                slot.pins = slot.pins.saturating_sub(1);
                slot.pins == 0 && slot.stale
            }
            None => false,
        };
        if drop_slot {
            slots.entries.remove(id);
        }
        slots.evict(self.max_size, None);
    }
}

/// Keeps one cache entry from being evicted while a workload session uses it
#[derive(Debug)]
pub struct SvidPin<V: Clone> {
    cache: Arc<SvidCache<V>>,
    id: EntryId,
    value: V,
}

impl<V: Clone> SvidPin<V> {
    pub fn id(&self) -> &EntryId {
        &self.id
    }

    pub fn value(&self) -> &V {
        &self.value
    }
}

impl<V: Clone> Drop for SvidPin<V> {
    fn drop(&mut self) {
        self.cache.unpin(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry_id(n: u32) -> EntryId {
        EntryId::from_string(format!("entry-{}", n))
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = SvidCache::new("x509", 2);
        cache.insert(entry_id(1), "one").unwrap();
        cache.insert(entry_id(2), "two").unwrap();
        assert_eq!(cache.get(&entry_id(1)).unwrap(), Some("one"));

        let evicted = cache.insert(entry_id(3), "three").unwrap();
        assert_eq!(evicted, vec![entry_id(2)]);
        assert_eq!(cache.len().unwrap(), 2);
        assert_eq!(cache.get(&entry_id(2)).unwrap(), None);
    }

    #[test]
    fn test_pinned_entries_survive_until_released() {
        let cache = Arc::new(SvidCache::new("jwt", 1));
        cache.insert(entry_id(1), 1).unwrap();
        let pin = cache.pin(&entry_id(1)).unwrap().unwrap();
        assert_eq!(*pin.value(), 1);

        let evicted = cache.insert(entry_id(2), 2).unwrap();
        assert!(evicted.is_empty());
        assert_eq!(cache.len().unwrap(), 2);

        drop(pin);
        assert_eq!(cache.len().unwrap(), 1);
        assert_eq!(cache.get(&entry_id(1)).unwrap(), None);
        assert_eq!(cache.get(&entry_id(2)).unwrap(), Some(2));
    }

    #[test]
    fn test_removal_of_pinned_entry_is_deferred() {
        let cache = Arc::new(SvidCache::new("x509", 10));
        cache.insert(entry_id(1), "one").unwrap();
        cache.insert(entry_id(2), "two").unwrap();
        let pin = cache.pin(&entry_id(1)).unwrap().unwrap();

        let removed = cache.retain_ids(|id| id == &entry_id(2)).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.get(&entry_id(1)).unwrap(), None);
        assert_eq!(*pin.value(), "one");

        drop(pin);
        assert_eq!(cache.len().unwrap(), 1);
        assert!(cache.pin(&entry_id(1)).unwrap().is_none());
    }

    #[test]
    fn test_stale_pinned_entries_leave_room_for_live_ones() {
        let cache = Arc::new(SvidCache::new("x509", 2));
        cache.insert(entry_id(1), "one").unwrap();
        let pin = cache.pin(&entry_id(1)).unwrap().unwrap();
        assert!(cache.remove(&entry_id(1)).unwrap());

        assert!(cache.insert(entry_id(2), "two").unwrap().is_empty());
        assert!(cache.insert(entry_id(3), "three").unwrap().is_empty());
        assert_eq!(cache.len().unwrap(), 2);
        assert_eq!(cache.get(&entry_id(2)).unwrap(), Some("two"));

        // the limit still applies to live entries
        let evicted = cache.insert(entry_id(4), "four").unwrap();
        assert_eq!(evicted, vec![entry_id(3)]);

        drop(pin);
        assert_eq!(cache.len().unwrap(), 2);
        assert!(cache.pin(&entry_id(1)).unwrap().is_none());
    }

    #[test]
    fn test_rotation_threshold() {
        let issued = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let id = SpiffeId::parse("spiffe://example.org/web").unwrap();
        let svid = Svid::new(id, issued, issued + chrono::Duration::hours(48));

        // half-life rule without a target
        assert!(!svid.needs_rotation(issued + chrono::Duration::hours(23), None));
        assert!(svid.needs_rotation(issued + chrono::Duration::hours(24), None));

        // a target longer than half the lifetime rotates earlier
        let target = Some(Duration::from_secs(30 * 3600));
        assert!(!svid.needs_rotation(issued + chrono::Duration::hours(17), target));
        assert!(svid.needs_rotation(issued + chrono::Duration::hours(18), target));

        // a target at or beyond the lifetime is ignored
        let target = Some(Duration::from_secs(72 * 3600));
        assert!(!svid.needs_rotation(issued + chrono::Duration::hours(23), target));
    }
}
