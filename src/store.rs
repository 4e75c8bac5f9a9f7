//! The global tile store consumed by cache entries.
//!
//! The store owns the actual pixel bytes of every cached tile, keyed by an
//! opaque `TileInternalIndex`. Cache entries only allocate, fetch, and
//! release slots; the file layout behind the indices is the store's
//! business. `MemoryTileStore` is the in-process implementation used in
//! non-persistent mode and by tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::error::{CacheError, CacheResult};
use crate::storage::{AlignedBuf, BitDepth};
use crate::tile_state::{TileHash, TileInternalIndex};

/// Byte budget of one tile slot, constant across depths: a float tile is
/// 64x64, a short tile 128x64, a byte tile 128x128.
pub const TILE_SLOT_BYTES: usize = 16 * 1024;

/// Pixel dimensions of a tile for the given depth.
pub fn tile_size_for_depth(depth: BitDepth) -> (i32, i32) {
    match depth {
        BitDepth::Byte => (128, 128),
        BitDepth::Short => (128, 64),
        BitDepth::Float => (64, 64),
    }
}

/// Combine a value into a running 64-bit hash. Stable across processes and
/// runs; never replace with a seeded std hasher.
fn hash_combine(h: u64, v: u64) -> u64 {
    h ^ v
        .wrapping_add(0x9e3779b97f4a7c15)
        .wrapping_add(h << 6)
        .wrapping_add(h >> 2)
}

/// Identity of one (tile, channel) slot within an entry, used by the store
/// to key fresh allocations.
pub fn tile_hash(tx: i32, ty: i32, level: u32, channel: usize, entry_hash: u64) -> TileHash {
    let mut h = entry_hash;
    h = hash_combine(h, tx as u32 as u64);
    h = hash_combine(h, ty as u32 as u64);
    h = hash_combine(h, level as u64);
    h = hash_combine(h, channel as u64);
    TileHash(h)
}

/// Stable digest of a sequence of 64-bit words.
pub fn digest_words(words: &[u64]) -> u64 {
    let mut h = 0xcbf29ce484222325;
    for &w in words {
        h = hash_combine(h, w);
    }
    h
}

/// Shared handle on one tile's pixel bytes. The bytes stay valid for as
/// long as any handle exists, but the slot may be reused by the store once
/// released; holders must not outlive their `TileLock`.
#[derive(Debug, Clone)]
pub struct TileBuffer(Arc<RwLock<AlignedBuf>>);

impl TileBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self(Arc::new(RwLock::new(AlignedBuf::zeroed(len))))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, AlignedBuf> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, AlignedBuf> {
        self.0.write()
    }
}

type UnlockFn = Box<dyn FnOnce(bool) + Send>;

/// RAII result of `TileStore::retrieve_and_lock`.
///
/// Holds the requested tiles pinned for the duration of the transfer.
/// Dropping the lock releases the pin; if `invalidate` was called first,
/// the freshly allocated slots are returned to the store instead of kept.
pub struct TileLock {
    existing: Vec<TileBuffer>,
    allocated: Vec<(TileInternalIndex, TileBuffer)>,
    invalidated: bool,
    on_unlock: Option<UnlockFn>,
}

impl TileLock {
    pub fn new(
        existing: Vec<TileBuffer>,
        allocated: Vec<(TileInternalIndex, TileBuffer)>,
        on_unlock: Option<UnlockFn>,
    ) -> Self {
        Self { existing, allocated, invalidated: false, on_unlock }
    }

    /// Buffers of the pre-existing tiles, in request order.
    pub fn existing(&self) -> &[TileBuffer] {
        &self.existing
    }

    /// Freshly allocated slots, in request order.
    pub fn allocated(&self) -> &[(TileInternalIndex, TileBuffer)] {
        &self.allocated
    }

    /// Mark the work abandoned: fresh allocations are released on drop.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }
}

impl Drop for TileLock {
    fn drop(&mut self) {
        if let Some(f) = self.on_unlock.take() {
            f(self.invalidated);
        }
    }
}

/// Interface of the global tile store.
pub trait TileStore: Send + Sync {
    /// Tile dimensions for the given depth; fixed for the process lifetime.
    fn tile_size(&self, depth: BitDepth) -> (i32, i32);

    /// Pin `existing` tiles and allocate one fresh slot per entry of
    /// `to_allocate`. Buffers are handed back in request order.
    fn retrieve_and_lock(
        &self,
        entry_hash: u64,
        existing: &[TileInternalIndex],
        to_allocate: &[TileHash],
    ) -> CacheResult<TileLock>;

    /// Return slots to the store. Sentinel indices are ignored.
    fn release_tiles(&self, indices: &[TileInternalIndex]);

    fn has_entry_for_hash(&self, hash: u64) -> bool;

    /// Whether cache contents survive the process (and are shared between
    /// processes).
    fn is_persistent(&self) -> bool;

    fn current_process_uuid(&self) -> Uuid;

    /// Liveness of the process identified by `uuid`; dead owners'
    /// pending tiles are reclaimed.
    fn is_uuid_alive(&self, uuid: Uuid) -> bool;
}

/// Allocation counters of a `MemoryTileStore`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub allocated: u64,
    pub released: u64,
    pub resident: usize,
}

struct MemoryStoreInner {
    tiles: Mutex<HashMap<u64, TileBuffer>>,
    known_entries: Mutex<HashSet<u64>>,
    live_uuids: Mutex<HashSet<Uuid>>,
    next_index: AtomicU64,
    allocated: AtomicU64,
    released: AtomicU64,
}

/// In-process tile store: a slab of tile slots with monotonic index
/// allocation. The persistence flag and the liveness table are
/// configurable so the cross-process protocol can be exercised in a single
/// process.
pub struct MemoryTileStore {
    inner: Arc<MemoryStoreInner>,
    process_uuid: Uuid,
    persistent: bool,
}

impl MemoryTileStore {
    pub fn new(persistent: bool) -> Self {
        Self {
            inner: Arc::new(MemoryStoreInner {
                tiles: Mutex::new(HashMap::new()),
                known_entries: Mutex::new(HashSet::new()),
                live_uuids: Mutex::new(HashSet::new()),
                next_index: AtomicU64::new(1),
                allocated: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
            process_uuid: Uuid::new_v4(),
            persistent,
        }
    }

    /// Register another session as alive, as a process registry would.
    pub fn register_uuid(&self, uuid: Uuid) {
        self.inner.live_uuids.lock().insert(uuid);
    }

    /// Drop a session from the liveness table, simulating its death.
    pub fn retire_uuid(&self, uuid: Uuid) {
        self.inner.live_uuids.lock().remove(&uuid);
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            released: self.inner.released.load(Ordering::Relaxed),
            resident: self.inner.tiles.lock().len(),
        }
    }
}

impl TileStore for MemoryTileStore {
    fn tile_size(&self, depth: BitDepth) -> (i32, i32) {
        tile_size_for_depth(depth)
    }

    fn retrieve_and_lock(
        &self,
        entry_hash: u64,
        existing: &[TileInternalIndex],
        to_allocate: &[TileHash],
    ) -> CacheResult<TileLock> {
        self.inner.known_entries.lock().insert(entry_hash);

        let mut tiles = self.inner.tiles.lock();

        let mut fetched = Vec::with_capacity(existing.len());
        for index in existing {
            let buffer = tiles
                .get(&index.0)
                .ok_or_else(|| CacheError::failed(format!("unknown tile index {}", index.0)))?;
            fetched.push(buffer.clone());
        }

        let mut allocated = Vec::with_capacity(to_allocate.len());
        for _hash in to_allocate {
            let index = TileInternalIndex(self.inner.next_index.fetch_add(1, Ordering::Relaxed));
            let buffer = TileBuffer::zeroed(TILE_SLOT_BYTES);
            tiles.insert(index.0, buffer.clone());
            allocated.push((index, buffer));
        }
        self.inner
            .allocated
            .fetch_add(to_allocate.len() as u64, Ordering::Relaxed);

        let fresh_indices: Vec<TileInternalIndex> = allocated.iter().map(|(i, _)| *i).collect();
        let inner = Arc::clone(&self.inner);
        let on_unlock: UnlockFn = Box::new(move |invalidated| {
            if invalidated {
                let mut tiles = inner.tiles.lock();
                for index in &fresh_indices {
                    if tiles.remove(&index.0).is_some() {
                        inner.released.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        });

        Ok(TileLock::new(fetched, allocated, Some(on_unlock)))
    }

    fn release_tiles(&self, indices: &[TileInternalIndex]) {
        let mut tiles = self.inner.tiles.lock();
        for index in indices {
            if !index.is_valid() {
                continue;
            }
            if tiles.remove(&index.0).is_some() {
                self.inner.released.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn has_entry_for_hash(&self, hash: u64) -> bool {
        self.inner.known_entries.lock().contains(&hash)
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn current_process_uuid(&self) -> Uuid {
        self.process_uuid
    }

    fn is_uuid_alive(&self, uuid: Uuid) -> bool {
        uuid == self.process_uuid || self.inner.live_uuids.lock().contains(&uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_hash_is_stable_and_discriminating() {
        let a = tile_hash(0, 64, 1, 0, 0xdead);
        let b = tile_hash(0, 64, 1, 0, 0xdead);
        assert_eq!(a, b);
        assert_ne!(a, tile_hash(64, 64, 1, 0, 0xdead));
        assert_ne!(a, tile_hash(0, 64, 0, 0, 0xdead));
        assert_ne!(a, tile_hash(0, 64, 1, 1, 0xdead));
        assert_ne!(a, tile_hash(0, 64, 1, 0, 0xbeef));
    }

    #[test]
    fn test_tile_sizes_share_one_byte_budget() {
        for depth in [BitDepth::Byte, BitDepth::Short, BitDepth::Float] {
            let (w, h) = tile_size_for_depth(depth);
            assert_eq!(w as usize * h as usize * depth.size_of(), TILE_SLOT_BYTES);
        }
    }

    #[test]
    fn test_allocate_then_fetch() {
        let store = MemoryTileStore::new(false);
        let hash = tile_hash(0, 0, 0, 0, 1);

        let index = {
            let lock = store.retrieve_and_lock(1, &[], &[hash]).unwrap();
            assert_eq!(lock.allocated().len(), 1);
            let (index, buffer) = &lock.allocated()[0];
            buffer.write().as_bytes_mut()[0] = 7;
            *index
        };

        let lock = store.retrieve_and_lock(1, &[index], &[]).unwrap();
        assert_eq!(lock.existing().len(), 1);
        assert_eq!(lock.existing()[0].read().as_bytes()[0], 7);
    }

    #[test]
    fn test_unknown_index_fails() {
        let store = MemoryTileStore::new(false);
        let bogus = TileInternalIndex(99);
        assert!(matches!(
            store.retrieve_and_lock(1, &[bogus], &[]),
            Err(CacheError::Failed(_))
        ));
    }

    #[test]
    fn test_invalidate_releases_fresh_allocations() {
        let store = MemoryTileStore::new(false);
        let hash = tile_hash(0, 0, 0, 0, 1);

        let index = {
            let mut lock = store.retrieve_and_lock(1, &[], &[hash]).unwrap();
            let index = lock.allocated()[0].0;
            lock.invalidate();
            index
        };

        assert!(store.retrieve_and_lock(1, &[index], &[]).is_err());
        assert_eq!(store.stats().resident, 0);
    }

    #[test]
    fn test_release_ignores_sentinel() {
        let store = MemoryTileStore::new(false);
        let lock = store
            .retrieve_and_lock(1, &[], &[tile_hash(0, 0, 0, 0, 1)])
            .unwrap();
        let index = lock.allocated()[0].0;
        drop(lock);

        store.release_tiles(&[TileInternalIndex::INVALID, index]);
        assert_eq!(store.stats().resident, 0);
        assert_eq!(store.stats().released, 1);
    }

    #[test]
    fn test_uuid_liveness() {
        let store = MemoryTileStore::new(true);
        assert!(store.is_uuid_alive(store.current_process_uuid()));

        let other = Uuid::new_v4();
        assert!(!store.is_uuid_alive(other));
        store.register_uuid(other);
        assert!(store.is_uuid_alive(other));
        store.retire_uuid(other);
        assert!(!store.is_uuid_alive(other));
    }

    #[test]
    fn test_has_entry_for_hash() {
        let store = MemoryTileStore::new(false);
        assert!(!store.has_entry_for_hash(42));
        store.retrieve_and_lock(42, &[], &[]).unwrap();
        assert!(store.has_entry_for_hash(42));
    }
}
