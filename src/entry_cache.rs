//! Entry registry and first-construction handshake.
//!
//! One image plane hash maps to one shared cache entry. The first accessor
//! of a hash claims its construction (`MustCompute`); everyone else either
//! finds the published entry (`Cached`) or waits out the construction
//! (`ComputationPending`). The claim is released when the constructing
//! locker publishes or drops, so a crashed construction never wedges the
//! hash.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::ipc::SegmentStorage;
use crate::tile_state::TilesState;

/// Shared per-entry state in non-persistent mode: the per-level tile
/// matrices behind one reader/writer lock.
#[derive(Debug, Default)]
pub struct InMemoryEntryState {
    pub levels: RwLock<Vec<TilesState>>,
}

/// Shared per-entry state in persistent mode: the property-map segment the
/// levels are mirrored through.
#[derive(Debug)]
pub struct PersistentEntryState {
    pub segment: RwLock<SegmentStorage>,
}

impl PersistentEntryState {
    pub fn new(segment: SegmentStorage) -> Self {
        Self { segment: RwLock::new(segment) }
    }
}

/// The published payload of one entry hash.
#[derive(Clone)]
pub enum SharedCacheEntry {
    InMemory(Arc<InMemoryEntryState>),
    Persistent(Arc<PersistentEntryState>),
}

/// Outcome of looking up a hash in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// The entry is published; read it.
    Cached,
    /// The caller holds the construction claim and must build and publish.
    MustCompute,
    /// Someone else is constructing; wait and retry.
    ComputationPending,
}

/// Bounded registry of published entries plus the set of hashes currently
/// under construction.
pub struct EntryCache {
    entries: moka::sync::Cache<u64, SharedCacheEntry>,
    pending: Mutex<HashSet<u64>>,
}

impl EntryCache {
    pub fn new(max_entries: u64) -> Arc<Self> {
        Arc::new(Self {
            entries: moka::sync::Cache::builder().max_capacity(max_entries).build(),
            pending: Mutex::new(HashSet::new()),
        })
    }

    /// Resolve `hash`, claiming construction if nobody has it yet.
    pub fn get(self: &Arc<Self>, hash: u64) -> EntryLocker {
        let (status, entry, claimed) = self.resolve(hash);
        EntryLocker { cache: Arc::clone(self), hash, status, entry, claimed }
    }

    /// Drop a published entry (write-only renders clear stale content).
    pub fn remove(&self, hash: u64) {
        self.entries.invalidate(&hash);
    }

    pub fn len(&self) -> usize {
        self.entries.run_pending_tasks();
        self.entries.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pool-friendly sleep primitive used by the polling waits.
    pub fn sleep_ms(ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    fn resolve(&self, hash: u64) -> (EntryStatus, Option<SharedCacheEntry>, bool) {
        if let Some(entry) = self.entries.get(&hash) {
            return (EntryStatus::Cached, Some(entry), false);
        }
        if self.pending.lock().insert(hash) {
            (EntryStatus::MustCompute, None, true)
        } else {
            (EntryStatus::ComputationPending, None, false)
        }
    }
}

/// Handle on one hash resolution. Holding a `MustCompute` locker blocks
/// other accessors of the same hash until `insert_in_cache` or drop.
pub struct EntryLocker {
    cache: Arc<EntryCache>,
    hash: u64,
    status: EntryStatus,
    entry: Option<SharedCacheEntry>,
    claimed: bool,
}

impl EntryLocker {
    pub fn status(&self) -> EntryStatus {
        self.status
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// The published entry, present iff status is `Cached`.
    pub fn cached_entry(&self) -> Option<&SharedCacheEntry> {
        self.entry.as_ref()
    }

    /// Short bounded wait, then re-resolution. Callers loop while the
    /// status stays `ComputationPending`.
    pub fn wait_for_pending_entry(&mut self) -> EntryStatus {
        const WAIT_MS: u64 = 10;
        if self.status == EntryStatus::ComputationPending {
            EntryCache::sleep_ms(WAIT_MS);
            let (status, entry, claimed) = self.cache.resolve(self.hash);
            self.status = status;
            self.entry = entry;
            self.claimed = claimed;
        }
        self.status
    }

    /// Publish a freshly built entry and release the construction claim.
    pub fn insert_in_cache(&mut self, entry: SharedCacheEntry) {
        debug_assert_eq!(self.status, EntryStatus::MustCompute);
        self.cache.entries.insert(self.hash, entry.clone());
        if self.claimed {
            self.cache.pending.lock().remove(&self.hash);
            self.claimed = false;
        }
        self.status = EntryStatus::Cached;
        self.entry = Some(entry);
    }
}

impl Drop for EntryLocker {
    fn drop(&mut self) {
        // An abandoned construction claim must not wedge the hash.
        if self.claimed {
            self.cache.pending.lock().remove(&self.hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_memory_entry() -> SharedCacheEntry {
        SharedCacheEntry::InMemory(Arc::new(InMemoryEntryState::default()))
    }

    #[test]
    fn test_first_access_must_compute() {
        let cache = EntryCache::new(32);
        let locker = cache.get(1);
        assert_eq!(locker.status(), EntryStatus::MustCompute);
        assert!(locker.cached_entry().is_none());
    }

    #[test]
    fn test_insert_then_cached() {
        let cache = EntryCache::new(32);
        let mut locker = cache.get(1);
        locker.insert_in_cache(in_memory_entry());
        assert_eq!(locker.status(), EntryStatus::Cached);

        let second = cache.get(1);
        assert_eq!(second.status(), EntryStatus::Cached);
        assert!(second.cached_entry().is_some());
    }

    #[test]
    fn test_concurrent_access_sees_pending() {
        let cache = EntryCache::new(32);
        let _constructor = cache.get(1);
        let other = cache.get(1);
        assert_eq!(other.status(), EntryStatus::ComputationPending);
    }

    #[test]
    fn test_dropped_claim_is_released() {
        let cache = EntryCache::new(32);
        {
            let locker = cache.get(1);
            assert_eq!(locker.status(), EntryStatus::MustCompute);
        }
        // The constructor vanished without publishing; the next accessor
        // takes over.
        let locker = cache.get(1);
        assert_eq!(locker.status(), EntryStatus::MustCompute);
    }

    #[test]
    fn test_wait_for_pending_entry_picks_up_publication() {
        let cache = EntryCache::new(32);
        let mut constructor = cache.get(1);
        let mut waiter = cache.get(1);
        assert_eq!(waiter.status(), EntryStatus::ComputationPending);

        constructor.insert_in_cache(in_memory_entry());
        let mut status = waiter.status();
        while status == EntryStatus::ComputationPending {
            status = waiter.wait_for_pending_entry();
        }
        assert_eq!(status, EntryStatus::Cached);
    }

    #[test]
    fn test_remove_forces_recompute() {
        let cache = EntryCache::new(32);
        let mut locker = cache.get(1);
        locker.insert_in_cache(in_memory_entry());
        drop(locker);

        cache.remove(1);
        let locker = cache.get(1);
        assert_eq!(locker.status(), EntryStatus::MustCompute);
    }
}
