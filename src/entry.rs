//! The per-image cache entry.
//!
//! One `ImageCacheEntry` ties one render of one image plane to the global
//! tile store: it fetches already-cached tiles into the local buffers,
//! claims unrendered tiles so no other worker duplicates them, copies
//! finished pixels back out, reconstructs coarse mipmap levels from finer
//! ones, and keeps the shared per-level state maps coherent across
//! threads and (in persistent mode) processes.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::effect::RenderEffect;
use crate::entry_cache::{
    EntryCache, EntryStatus, InMemoryEntryState, PersistentEntryState, SharedCacheEntry,
};
use crate::error::{CacheError, CacheResult};
use crate::ipc::{IpcPropertyMap, IpcValueType, SegmentStorage};
use crate::pyramid::{
    gather_tile_indices, lookup_tile, LookupOutcome, LookupParams, LookupScratch, TileCacheIndex,
};
use crate::rect::RectI;
use crate::storage::{BitDepth, ImageBufferLayout, PixelBuffer};
use crate::store::{digest_words, tile_hash, TileLock, TileStore};
use crate::tile_state::{
    TileCoord, TileCoordSet, TileHash, TileStateHeader, TileStatus, TilesState,
};
use crate::transfer::{run_copy_tasks, run_downscale_tasks, DownscaleTask, TileTask};

/// How a render interacts with the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAccessMode {
    /// No cache interaction: a local state map only synchronizes threads
    /// sharing this entry.
    None,
    /// Read cached tiles and publish freshly rendered ones.
    ReadWrite,
    /// Drop any cached content first, then behave like `ReadWrite`.
    WriteOnly,
}

/// Identity of one cached image plane.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageCacheKey {
    pub node_hash: u64,
    pub layer_id: String,
    pub proxy_scale: (f64, f64),
    pub plugin_id: String,
}

impl ImageCacheKey {
    /// Stable 64-bit digest shared by all processes rendering this plane.
    pub fn digest(&self) -> u64 {
        let mut words = vec![
            self.node_hash,
            self.proxy_scale.0.to_bits(),
            self.proxy_scale.1.to_bits(),
        ];
        for text in [&self.layer_id, &self.plugin_id] {
            words.push(text.len() as u64);
            for chunk in text.as_bytes().chunks(8) {
                let mut w = [0u8; 8];
                w[..chunk.len()].copy_from_slice(chunk);
                words.push(u64::from_le_bytes(w));
            }
        }
        digest_words(&words)
    }
}

/// Snapshot returned by the status operations.
#[derive(Debug, Clone)]
pub struct TilesRenderState {
    /// Copy of the target-level local state map.
    pub status: TileStateHeader,
    /// At least one tile in the roi is claimed by this entry and still
    /// owed a render.
    pub has_unrendered_tiles: bool,
    /// At least one tile in the roi is being produced by another worker.
    pub has_pending_tiles: bool,
}

/// Outcome of one state-map read/update pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateMapUpdate {
    UpToDate,
    MustWrite,
    NeedWriteLock,
}

/// Where the shared per-level states live for this entry.
enum CacheBinding {
    /// Cached modes before the first fetch bound the entry.
    Unbound,
    /// `CacheAccessMode::None`: a private synchronization object.
    Local(Arc<InMemoryEntryState>),
    /// Non-persistent cache: the registry-shared state.
    InMemory(Arc<InMemoryEntryState>),
    /// Persistent cache: the segment slot plus the deserialized levels.
    Persistent {
        slot: Arc<PersistentEntryState>,
        levels: Vec<TilesState>,
    },
}

fn grid_origin(v: i32, step: i32) -> i32 {
    v.div_euclid(step) * step
}

fn demote_bad_alloc(e: CacheError) -> CacheError {
    if e == CacheError::BadAlloc {
        CacheError::failed("shared segment exhausted")
    } else {
        e
    }
}

struct EntryCore {
    store: Arc<dyn TileStore>,
    registry: Arc<EntryCache>,
    effect: Arc<dyn RenderEffect>,
    key_digest: u64,
    roi: RectI,
    per_level_rod: Vec<RectI>,
    draft: bool,
    target_level: usize,
    depth: BitDepth,
    n_comps: usize,
    layout: ImageBufferLayout,
    buffers: [Option<PixelBuffer>; 4],
    tile_size: (i32, i32),
    local_state: TileStateHeader,
    /// Per level, the tiles this entry flipped to `Pending` and owes a
    /// rendered-or-aborted transition.
    marked: Vec<TileCoordSet>,
    has_pending: bool,
    tiles_to_fetch: Vec<TileCacheIndex>,
    tiles_to_downscale: Vec<TileCacheIndex>,
    policy: CacheAccessMode,
    /// The current pass must not claim any tile.
    read_only_pass: bool,
    binding: CacheBinding,
}

impl EntryCore {
    fn snapshot(&self) -> TilesRenderState {
        TilesRenderState {
            status: self.local_state.clone(),
            has_unrendered_tiles: self
                .marked
                .get(self.target_level)
                .is_some_and(|s| !s.is_empty()),
            has_pending_tiles: self.has_pending,
        }
    }

    fn ensure_local_buffers(&self) {
        let per_buffer = self.layout.comps_per_buffer(self.n_comps);
        let len = self.roi.area() as usize * per_buffer * self.depth.size_of();
        for i in 0..self.layout.buffer_count(self.n_comps) {
            if let Some(buffer) = &self.buffers[i] {
                buffer.ensure_allocated(len);
            }
        }
    }

    /// Run `f` with mutable access to the shared per-level states: under
    /// the entry write lock in the in-memory cases, on the deserialized
    /// local copy in the persistent case.
    fn with_levels<R>(&mut self, f: impl FnOnce(&mut EntryCore, &mut Vec<TilesState>) -> R) -> R {
        match &self.binding {
            CacheBinding::Unbound => {
                debug_assert!(false, "entry used before fetch_and_update_status");
                let mut empty = Vec::new();
                f(self, &mut empty)
            }
            CacheBinding::Local(shared) | CacheBinding::InMemory(shared) => {
                let shared = Arc::clone(shared);
                let mut levels = shared.levels.write();
                f(self, &mut levels)
            }
            CacheBinding::Persistent { .. } => {
                let mut levels = match &mut self.binding {
                    CacheBinding::Persistent { levels, .. } => std::mem::take(levels),
                    _ => unreachable!(),
                };
                let r = f(self, &mut levels);
                if let CacheBinding::Persistent { levels: slot, .. } = &mut self.binding {
                    *slot = levels;
                }
                r
            }
        }
    }

    /// Read the cached states and bring the local map up to date,
    /// claiming unrendered work unless this is a read-only pass.
    fn read_and_update_state_map(
        &mut self,
        levels: &mut Vec<TilesState>,
        has_exclusive_lock: bool,
        expect_all_not_rendered: bool,
    ) -> CacheResult<StateMapUpdate> {
        // A read-only pass never takes the mutating branches.
        let has_exclusive = has_exclusive_lock && !self.read_only_pass;
        let (tsx, tsy) = self.tile_size;

        if levels.len() < self.target_level + 1 {
            if !has_exclusive {
                return Ok(StateMapUpdate::NeedWriteLock);
            }
            levels.resize_with(self.target_level + 1, TilesState::default);
        }

        let mut modified = false;
        for i in 0..=self.target_level {
            let rounded = self.per_level_rod[i].rounded_to_tile_size(tsx, tsy);
            let expected = ((rounded.width() / tsx) * (rounded.height() / tsy)) as usize;
            if levels[i].is_initialized() && levels[i].tiles.len() != expected {
                // Another worker may have crashed while building the map.
                return Err(CacheError::failed(format!(
                    "level {i} state has {} tiles, expected {expected}",
                    levels[i].tiles.len()
                )));
            }
            if !levels[i].is_initialized() {
                if !has_exclusive {
                    return Ok(StateMapUpdate::NeedWriteLock);
                }
                levels[i] = TilesState::with_bounds(tsx, tsy, self.per_level_rod[i]);
                debug!(level = i, "initialized level tile state");
                modified = true;
            }
        }

        while self.marked.len() < self.target_level + 1 {
            self.marked.push(TileCoordSet::new());
        }

        // Work on copies: a pass that bails out with NeedWriteLock must
        // not leave half-applied local state behind.
        let mut tmp_marked = self.marked.clone();
        let mut tmp_local = self.local_state.clone();
        let mut tmp_fetch = Vec::new();
        let mut tmp_downscale = Vec::new();
        let mut tmp_pending = false;

        let params = LookupParams {
            has_exclusive_lock: has_exclusive,
            target_level: self.target_level,
            draft: self.draft,
            n_comps: self.n_comps,
            tile_size_x: tsx,
            tile_size_y: tsy,
            store: &*self.store,
            expect_all_not_rendered,
        };

        let roi_rounded = self.roi.rounded_to_tile_size(tsx, tsy);
        let mut ty = roi_rounded.y1;
        while ty < roi_rounded.y2 {
            let mut tx = roi_rounded.x1;
            while tx < roi_rounded.x2 {
                let up_to_date = tmp_local.tile_at(tx, ty).is_some_and(|t| {
                    t.status == TileStatus::RenderedHighestQuality
                        || (t.status == TileStatus::RenderedLowQuality && self.draft)
                });
                if !up_to_date {
                    let mut scratch = LookupScratch {
                        cache_levels: levels.as_mut_slice(),
                        local_state: &mut tmp_local,
                        marked: &mut tmp_marked,
                        tiles_to_fetch: &mut tmp_fetch,
                        tiles_to_downscale: &mut tmp_downscale,
                        has_pending: &mut tmp_pending,
                    };
                    match lookup_tile(&params, &mut scratch, TileCoord::new(tx, ty))? {
                        LookupOutcome::NeedWriteLock => return Ok(StateMapUpdate::NeedWriteLock),
                        LookupOutcome::Updated => modified = true,
                        LookupOutcome::UpToDate => {}
                    }
                }
                tx += tsx;
            }
            ty += tsy;
        }

        self.marked = tmp_marked;
        self.local_state = tmp_local;
        self.tiles_to_fetch = tmp_fetch;
        self.tiles_to_downscale = tmp_downscale;
        self.has_pending = tmp_pending;

        Ok(if modified {
            StateMapUpdate::MustWrite
        } else {
            StateMapUpdate::UpToDate
        })
    }

    /// Fetch scheduled cached tiles into the local buffers, running any
    /// downscale reconstructions first.
    fn fetch_and_copy_cached_tiles(&mut self, levels: &mut Vec<TilesState>) -> CacheResult<()> {
        let entry_hash = self.key_digest;
        let (tsx, tsy) = self.tile_size;

        let mut indices_to_fetch = Vec::new();
        let mut to_allocate: Vec<TileHash> = Vec::new();
        for node in &self.tiles_to_fetch {
            gather_tile_indices(
                node,
                self.target_level,
                self.n_comps,
                entry_hash,
                &mut indices_to_fetch,
                &mut to_allocate,
            );
        }
        // Plain fetches never allocate.
        debug_assert!(to_allocate.is_empty());
        for node in &self.tiles_to_downscale {
            gather_tile_indices(
                node,
                self.target_level,
                self.n_comps,
                entry_hash,
                &mut indices_to_fetch,
                &mut to_allocate,
            );
        }
        if indices_to_fetch.is_empty() && to_allocate.is_empty() {
            return Ok(());
        }

        self.ensure_local_buffers();
        let lock = self
            .store
            .retrieve_and_lock(entry_hash, &indices_to_fetch, &to_allocate)?;

        let mut tiles_to_copy: Vec<Arc<TileTask>> = Vec::new();
        let mut per_level_down: Vec<Vec<Arc<DownscaleTask>>> =
            vec![Vec::new(); self.target_level + 1];
        {
            let mut existing_i = 0usize;
            let mut allocated_i = 0usize;
            for node in &self.tiles_to_fetch {
                build_task_pyramid(
                    node,
                    self.target_level,
                    self.target_level,
                    levels,
                    tsx,
                    tsy,
                    self.n_comps,
                    &lock,
                    &mut existing_i,
                    &mut allocated_i,
                    &mut tiles_to_copy,
                    &mut per_level_down,
                );
            }
            debug_assert_eq!(allocated_i, 0);
            for node in &self.tiles_to_downscale {
                build_task_pyramid(
                    node,
                    self.target_level,
                    self.target_level,
                    levels,
                    tsx,
                    tsy,
                    self.n_comps,
                    &lock,
                    &mut existing_i,
                    &mut allocated_i,
                    &mut tiles_to_copy,
                    &mut per_level_down,
                );
            }
        }

        // Downscale fine-to-coarse so each level's sources are ready
        // before the level that averages them runs.
        let mut updated: Vec<TileCoordSet> = vec![TileCoordSet::new(); self.target_level + 1];
        let mut state_map_updated = false;
        for level in 0..=self.target_level {
            if per_level_down[level].is_empty() {
                continue;
            }
            run_downscale_tasks(&per_level_down[level], self.depth, self.tile_size);
            state_map_updated = true;

            for task in &per_level_down[level] {
                let bounds = task.target.bounds;
                let tx = grid_origin(bounds.x1, tsx);
                let ty = grid_origin(bounds.y1, tsy);
                let status = if self.draft || task.low_quality {
                    TileStatus::RenderedLowQuality
                } else {
                    TileStatus::RenderedHighestQuality
                };

                {
                    let cache_tile = levels[level]
                        .tile_at_mut(tsx, tsy, tx, ty)
                        .ok_or_else(|| CacheError::failed("downscaled tile outside state map"))?;
                    cache_tile.channels_storage[task.target.channel] = task.target.index;
                    if task.target.channel == 0 {
                        debug_assert!(
                            level != self.target_level || cache_tile.status == TileStatus::Pending
                        );
                        cache_tile.status = status;
                    }
                }
                if level == self.target_level {
                    if let Some(local) = self.local_state.tile_at_mut(tx, ty) {
                        local.channels_storage[task.target.channel] = task.target.index;
                        if task.target.channel == 0 {
                            debug_assert_eq!(local.status, TileStatus::NotRendered);
                            local.status = status;
                        }
                    }
                }
                if task.target.channel == 0 {
                    let coord = TileCoord::new(tx, ty);
                    let removed = self.marked[level].remove(&coord);
                    debug_assert!(removed);
                    updated[level].insert(coord);
                    trace!(tx, ty, level, "tile reconstructed by downscale");
                }
            }
            // Intermediate levels are fully resolved by their tasks.
            debug_assert!(level == self.target_level || self.marked[level].is_empty());
        }

        // The freshly reconstructed target tiles join the copy-out list.
        tiles_to_copy.extend(per_level_down[self.target_level].iter().map(|t| t.target.clone()));

        let copy_result = run_copy_tasks(
            false,
            &tiles_to_copy,
            &self.buffers,
            self.layout,
            self.n_comps,
            self.roi,
            self.depth,
            self.tile_size,
            &*self.effect,
        );
        drop(lock);
        self.tiles_to_fetch.clear();
        self.tiles_to_downscale.clear();

        // Even an aborted copy keeps the reconstructions: they are real
        // rendered tiles and must be visible to other workers.
        if state_map_updated
            && self.policy != CacheAccessMode::None
            && matches!(self.binding, CacheBinding::Persistent { .. })
        {
            self.publish_persistent_with(levels, Some(&updated))?;
        }

        copy_result
    }

    /// Mirror the given level states into the persistent segment, merging
    /// under its write lock. Rebuilds the registry entry if it was
    /// evicted.
    fn publish_persistent_with(
        &mut self,
        levels: &[TilesState],
        owned: Option<&[TileCoordSet]>,
    ) -> CacheResult<()> {
        if !matches!(self.binding, CacheBinding::Persistent { .. }) {
            return Ok(());
        }
        let (tsx, tsy) = self.tile_size;
        let mut locker = self.registry.get(self.key_digest);
        let mut status = locker.status();
        while status == EntryStatus::ComputationPending {
            status = locker.wait_for_pending_entry();
        }
        let new_slot = match status {
            EntryStatus::Cached => {
                let Some(SharedCacheEntry::Persistent(slot)) = locker.cached_entry().cloned()
                else {
                    return Err(CacheError::failed("cached entry is not a persistent entry"));
                };
                {
                    let mut segment = slot.segment.write();
                    write_level_states_to_map(false, levels, &mut segment, owned, tsx, tsy)
                        .map_err(demote_bad_alloc)?;
                }
                slot
            }
            EntryStatus::MustCompute => {
                // The entry was evicted; rebuild it from our state.
                let mut segment = SegmentStorage::default();
                write_level_states_to_map(true, levels, &mut segment, owned, tsx, tsy)
                    .map_err(demote_bad_alloc)?;
                let slot = Arc::new(PersistentEntryState::new(segment));
                locker.insert_in_cache(SharedCacheEntry::Persistent(Arc::clone(&slot)));
                slot
            }
            EntryStatus::ComputationPending => unreachable!(),
        };
        drop(locker);
        if let CacheBinding::Persistent { slot, .. } = &mut self.binding {
            *slot = new_slot;
        }
        Ok(())
    }

    fn fetch_and_update_locked(&mut self, read_only: bool) -> CacheResult<()> {
        self.read_only_pass = read_only;
        let (tsx, tsy) = self.tile_size;

        if self.policy == CacheAccessMode::None {
            let CacheBinding::Local(shared) = &self.binding else {
                return Err(CacheError::failed("uncached entry lost its local state"));
            };
            let shared = Arc::clone(shared);
            let mut levels = shared.levels.write();
            let outcome = self.read_and_update_state_map(&mut levels, true, false)?;
            debug_assert!(outcome != StateMapUpdate::NeedWriteLock || read_only);
            return Ok(());
        }

        let registry = Arc::clone(&self.registry);
        let mut locker = registry.get(self.key_digest);
        let mut status = locker.status();
        while status == EntryStatus::ComputationPending {
            status = locker.wait_for_pending_entry();
        }

        if self.policy == CacheAccessMode::WriteOnly && status == EntryStatus::Cached {
            // Start from a clean image: drop the stale entry and reset the
            // local map, then carry on as a read/write render.
            registry.remove(self.key_digest);
            drop(locker);
            locker = registry.get(self.key_digest);
            status = locker.status();
            while status == EntryStatus::ComputationPending {
                status = locker.wait_for_pending_entry();
            }
            let bounds = self.local_state.state.bounds;
            self.local_state.init(tsx, tsy, bounds);
            self.marked.clear();
            self.tiles_to_fetch.clear();
            self.tiles_to_downscale.clear();
            self.policy = CacheAccessMode::ReadWrite;
        }

        match (status, self.store.is_persistent()) {
            (EntryStatus::Cached, false) => {
                let Some(SharedCacheEntry::InMemory(shared)) = locker.cached_entry().cloned()
                else {
                    return Err(CacheError::failed("cached entry is not an in-memory entry"));
                };
                self.binding = CacheBinding::InMemory(Arc::clone(&shared));

                // First pass on a snapshot under the read lock; claiming
                // retries under the write lock.
                let need_write_lock = {
                    let mut snapshot = shared.levels.read().clone();
                    match self.read_and_update_state_map(&mut snapshot, false, false)? {
                        StateMapUpdate::UpToDate => false,
                        StateMapUpdate::MustWrite => {
                            debug_assert!(false, "state written under a read lock");
                            false
                        }
                        StateMapUpdate::NeedWriteLock => !read_only,
                    }
                };
                if need_write_lock {
                    let mut levels = shared.levels.write();
                    let outcome = self.read_and_update_state_map(&mut levels, true, false)?;
                    debug_assert_ne!(outcome, StateMapUpdate::NeedWriteLock);
                }
            }
            (EntryStatus::MustCompute, false) => {
                let shared = Arc::new(InMemoryEntryState::default());
                self.binding = CacheBinding::InMemory(Arc::clone(&shared));
                {
                    let mut levels = shared.levels.write();
                    let outcome = self.read_and_update_state_map(&mut levels, true, true)?;
                    debug_assert!(outcome == StateMapUpdate::MustWrite || read_only);
                }
                if !read_only {
                    locker.insert_in_cache(SharedCacheEntry::InMemory(shared));
                }
            }
            (EntryStatus::Cached, true) => {
                let Some(SharedCacheEntry::Persistent(slot)) = locker.cached_entry().cloned()
                else {
                    return Err(CacheError::failed("cached entry is not a persistent entry"));
                };
                let outcome = {
                    let mut levels = {
                        let segment = slot.segment.read();
                        read_level_states_from_map(tsx, tsy, segment.map())?
                    };
                    let outcome = self.read_and_update_state_map(&mut levels, false, false)?;
                    debug_assert_ne!(outcome, StateMapUpdate::MustWrite);
                    self.binding = CacheBinding::Persistent { slot: Arc::clone(&slot), levels };
                    outcome
                };
                // A read-only pass that would need the write lock is up to
                // date from the reader's point of view.
                if outcome == StateMapUpdate::NeedWriteLock && !read_only {
                    let mut segment = slot.segment.write();
                    let mut levels = read_level_states_from_map(tsx, tsy, segment.map())?;
                    let outcome = self.read_and_update_state_map(&mut levels, true, false)?;
                    if outcome == StateMapUpdate::MustWrite {
                        let owned = self.marked.clone();
                        write_level_states_to_map(
                            true,
                            &levels,
                            &mut segment,
                            Some(&owned),
                            tsx,
                            tsy,
                        )
                        .map_err(demote_bad_alloc)?;
                    }
                    drop(segment);
                    self.binding = CacheBinding::Persistent { slot, levels };
                }
            }
            (EntryStatus::MustCompute, true) => {
                // Sole initializer: default-construct every level and
                // publish the initial segment.
                let mut levels = Vec::new();
                let outcome = self.read_and_update_state_map(&mut levels, true, true)?;
                debug_assert!(outcome == StateMapUpdate::MustWrite || read_only);
                if !read_only {
                    let mut segment = SegmentStorage::default();
                    let owned = self.marked.clone();
                    write_level_states_to_map(true, &levels, &mut segment, Some(&owned), tsx, tsy)
                        .map_err(demote_bad_alloc)?;
                    let slot = Arc::new(PersistentEntryState::new(segment));
                    locker.insert_in_cache(SharedCacheEntry::Persistent(Arc::clone(&slot)));
                    self.binding = CacheBinding::Persistent { slot, levels };
                } else {
                    let slot = Arc::new(PersistentEntryState::new(SegmentStorage::default()));
                    self.binding = CacheBinding::Persistent { slot, levels };
                }
            }
            (EntryStatus::ComputationPending, _) => unreachable!(),
        }
        drop(locker);

        if !read_only && (!self.tiles_to_fetch.is_empty() || !self.tiles_to_downscale.is_empty()) {
            return self.with_levels(|core, levels| core.fetch_and_copy_cached_tiles(levels));
        }
        Ok(())
    }

    fn mark_rendered_locked(&mut self) -> CacheResult<()> {
        debug_assert!(!matches!(self.binding, CacheBinding::Unbound));
        if self.marked.is_empty() || matches!(self.binding, CacheBinding::Unbound) {
            return Ok(());
        }
        let (tsx, tsy) = self.tile_size;

        self.with_levels(|core, levels| -> CacheResult<()> {
            let target = core.target_level;
            if levels.len() <= target || !levels[target].is_initialized() {
                return Err(CacheError::failed("target level state missing"));
            }
            debug_assert!(core.local_state.state.is_initialized());

            let mut modified = false;
            // (bounds, channel) of every tile whose pixels go to the store.
            let mut to_copy: Vec<(RectI, usize)> = Vec::new();

            for coord in core.marked[target].clone() {
                let status = if core.draft {
                    TileStatus::RenderedLowQuality
                } else {
                    TileStatus::RenderedHighestQuality
                };
                {
                    let cache_tile = levels[target]
                        .tile_at_mut(tsx, tsy, coord.tx, coord.ty)
                        .ok_or_else(|| CacheError::failed("marked tile outside state map"))?;
                    debug_assert_eq!(cache_tile.status, TileStatus::Pending);
                    cache_tile.status = status;
                }
                modified = true;
                trace!(tx = coord.tx, ty = coord.ty, level = target, "tile rendered");

                if let Some(local) = core.local_state.tile_at_mut(coord.tx, coord.ty) {
                    debug_assert_eq!(local.status, TileStatus::NotRendered);
                    if local.status == TileStatus::NotRendered {
                        local.status = status;
                        if core.policy != CacheAccessMode::None {
                            for c in 0..core.n_comps {
                                to_copy.push((local.bounds, c));
                            }
                        }
                    }
                }
            }

            let tiles_to_update = core.marked.clone();
            core.marked.clear();

            #[cfg(debug_assertions)]
            {
                // Every tile of the roi is now either rendered or pending
                // on another worker.
                let roi_rounded = core.roi.rounded_to_tile_size(tsx, tsy);
                let mut ty = roi_rounded.y1;
                while ty < roi_rounded.y2 {
                    let mut tx = roi_rounded.x1;
                    while tx < roi_rounded.x2 {
                        if let Some(t) = core.local_state.tile_at(tx, ty) {
                            debug_assert_ne!(t.status, TileStatus::NotRendered);
                        }
                        tx += tsx;
                    }
                    ty += tsy;
                }
            }

            if !modified || core.policy == CacheAccessMode::None {
                return Ok(());
            }

            // Push the local pixels into freshly allocated store tiles.
            core.ensure_local_buffers();
            let entry_hash = core.key_digest;
            let hashes: Vec<TileHash> = to_copy
                .iter()
                .map(|(bounds, c)| {
                    tile_hash(
                        grid_origin(bounds.x1, tsx),
                        grid_origin(bounds.y1, tsy),
                        target as u32,
                        *c,
                        entry_hash,
                    )
                })
                .collect();
            let lock = core.store.retrieve_and_lock(entry_hash, &[], &hashes)?;
            debug_assert_eq!(lock.allocated().len(), to_copy.len());

            let mut tasks: Vec<Arc<TileTask>> = Vec::with_capacity(to_copy.len());
            for (i, (bounds, channel)) in to_copy.iter().enumerate() {
                let (index, buffer) = lock.allocated()[i].clone();
                let tx = grid_origin(bounds.x1, tsx);
                let ty = grid_origin(bounds.y1, tsy);
                if let Some(cache_tile) = levels[target].tile_at_mut(tsx, tsy, tx, ty) {
                    cache_tile.channels_storage[*channel] = index;
                }
                if let Some(local) = core.local_state.tile_at_mut(tx, ty) {
                    local.channels_storage[*channel] = index;
                }
                tasks.push(Arc::new(TileTask {
                    buffer,
                    index,
                    bounds: *bounds,
                    channel: *channel,
                }));
            }

            // Tiles are already rendered; the copy-in never aborts.
            run_copy_tasks(
                true,
                &tasks,
                &core.buffers,
                core.layout,
                core.n_comps,
                core.roi,
                core.depth,
                core.tile_size,
                &*core.effect,
            )?;
            drop(lock);

            core.publish_persistent_with(levels, Some(&tiles_to_update))
        })
    }

    /// Flip our still-pending claims back to unrendered. Returns true if
    /// any cached tile changed; `marked` is kept for the publication and
    /// cleared by the caller.
    fn mark_aborted_in_levels(&mut self, levels: &mut [TilesState]) -> bool {
        if self.marked.is_empty() {
            return false;
        }
        let (tsx, tsy) = self.tile_size;
        let mut modified = false;
        for level in 0..self.marked.len() {
            if level >= levels.len() || !levels[level].is_initialized() {
                continue;
            }
            for coord in self.marked[level].clone() {
                if let Some(tile) = levels[level].tile_at_mut(tsx, tsy, coord.tx, coord.ty) {
                    debug_assert!(
                        level != self.target_level
                            || tile.status == TileStatus::Pending
                            || tile.status == TileStatus::NotRendered
                    );
                    tile.status = TileStatus::NotRendered;
                    modified = true;
                    trace!(tx = coord.tx, ty = coord.ty, level, "tile claim aborted");
                }
                if level == self.target_level {
                    if let Some(local) = self.local_state.tile_at(coord.tx, coord.ty) {
                        debug_assert_eq!(local.status, TileStatus::NotRendered);
                    }
                }
            }
        }
        if !modified {
            self.marked.clear();
        }
        modified
    }

    fn mark_aborted_locked(&mut self) -> CacheResult<()> {
        if matches!(self.binding, CacheBinding::Unbound) {
            return Ok(());
        }
        self.with_levels(|core, levels| -> CacheResult<()> {
            let modified = core.mark_aborted_in_levels(levels);
            if modified && core.policy != CacheAccessMode::None {
                let owned = core.marked.clone();
                core.publish_persistent_with(levels, Some(&owned))?;
            }
            Ok(())
        })?;
        self.marked.clear();
        Ok(())
    }

    fn mark_region_unrendered_locked(&mut self, roi: RectI) -> CacheResult<()> {
        debug_assert!(!matches!(self.binding, CacheBinding::Unbound));
        if roi.is_null() || matches!(self.binding, CacheBinding::Unbound) {
            return Ok(());
        }
        let clipped = roi.intersection(&self.local_state.state.bounds);
        if clipped.is_null() {
            return Ok(());
        }
        let (tsx, tsy) = self.tile_size;
        let target = self.target_level;

        self.with_levels(|core, levels| -> CacheResult<()> {
            let rod0_roi = clipped.upscaled_pow2(target as u32);
            let mut released = Vec::new();
            let mut modified = false;

            for level in 0..levels.len() {
                if !levels[level].is_initialized() {
                    continue;
                }
                let level_roi = rod0_roi.downscaled_pow2(level as u32);
                let rounded = level_roi.rounded_to_tile_size(tsx, tsy);
                let mut ty = rounded.y1;
                while ty < rounded.y2 {
                    let mut tx = rounded.x1;
                    while tx < rounded.x2 {
                        if level == target {
                            if let Some(local) = core.local_state.tile_at_mut(tx, ty) {
                                local.status = TileStatus::NotRendered;
                            }
                        }
                        if let Some(tile) = levels[level].tile_at_mut(tsx, tsy, tx, ty) {
                            if tile.status != TileStatus::NotRendered {
                                tile.status = TileStatus::NotRendered;
                                modified = true;
                                trace!(tx, ty, level, "tile invalidated");
                                for c in 0..core.n_comps {
                                    released.push(tile.channels_storage[c]);
                                }
                            }
                        }
                        tx += tsx;
                    }
                    ty += tsy;
                }
            }

            if !released.is_empty() && core.policy != CacheAccessMode::None {
                core.store.release_tiles(&released);
            }
            if modified && core.policy != CacheAccessMode::None {
                // Update everything we touched, owned or not.
                core.publish_persistent_with(levels, None)?;
            }
            Ok(())
        })
    }

    fn ensure_roi_locked(
        &mut self,
        roi: RectI,
        storage: [Option<PixelBuffer>; 4],
        per_level_rod: Vec<RectI>,
    ) -> CacheResult<()> {
        debug_assert!(!matches!(self.binding, CacheBinding::Unbound));
        let (tsx, tsy) = self.tile_size;

        self.buffers = storage;
        self.roi = self.roi.union(&roi);
        assert!(per_level_rod.len() >= self.target_level + 1);
        assert!(per_level_rod[self.target_level].contains(&self.local_state.state.bounds));
        self.per_level_rod = per_level_rod;

        let target_rod = self.per_level_rod[self.target_level];
        self.local_state.state.grow_to(tsx, tsy, target_rod);
        debug_assert!(self.local_state.state.bounds.contains(&self.roi));

        // In persistent mode the grown map must be re-published, and we
        // must not push our pending claims under the new bounds: abort
        // them first and re-publish what we owned.
        let must_update = self.policy != CacheAccessMode::None
            && matches!(self.binding, CacheBinding::Persistent { .. });

        let published = self.with_levels(|core, levels| -> CacheResult<bool> {
            let mut did_abort = false;
            if must_update {
                did_abort = core.mark_aborted_in_levels(levels);
            }
            let n = core.per_level_rod.len().min(levels.len());
            for i in 0..n {
                let rod = core.per_level_rod[i];
                levels[i].grow_to(tsx, tsy, rod);
            }
            if must_update && did_abort {
                let owned = core.marked.clone();
                core.publish_persistent_with(levels, Some(&owned))?;
            }
            Ok(must_update && did_abort)
        })?;

        if published {
            self.marked.clear();
        }
        Ok(())
    }
}

/// Build the transfer tasks for one lookup node, consuming the store's
/// result arrays in the order `gather_tile_indices` produced them.
#[allow(clippy::too_many_arguments)]
fn build_task_pyramid(
    node: &TileCacheIndex,
    level: usize,
    target_level: usize,
    levels: &[TilesState],
    tsx: i32,
    tsy: i32,
    n_comps: usize,
    lock: &TileLock,
    existing_i: &mut usize,
    allocated_i: &mut usize,
    tiles_to_copy: &mut Vec<Arc<TileTask>>,
    per_level_down: &mut [Vec<Arc<DownscaleTask>>],
) -> Vec<Arc<TileTask>> {
    let rod = levels[level].bounds;
    let bounds = RectI {
        x1: node.tx.max(rod.x1),
        y1: node.ty.max(rod.y1),
        x2: (node.tx + tsx).min(rod.x2),
        y2: (node.ty + tsy).min(rod.y2),
    };
    debug_assert!(!bounds.is_null());

    if let Some(children) = &node.upscale {
        let targets: Vec<Arc<TileTask>> = (0..n_comps)
            .map(|c| {
                let (index, buffer) = lock.allocated()[*allocated_i].clone();
                *allocated_i += 1;
                Arc::new(TileTask { buffer, index, bounds, channel: c })
            })
            .collect();

        let mut src: Vec<[Option<Arc<TileTask>>; 4]> = vec![[None, None, None, None]; n_comps];
        let mut n_invalid = 0;
        for (i, child) in children.iter().enumerate() {
            match child {
                Some(child) if child.tx != -1 => {
                    let child_tasks = build_task_pyramid(
                        child,
                        level - 1,
                        target_level,
                        levels,
                        tsx,
                        tsy,
                        n_comps,
                        lock,
                        existing_i,
                        allocated_i,
                        tiles_to_copy,
                        per_level_down,
                    );
                    for (c, task) in child_tasks.iter().enumerate() {
                        src[c][i] = Some(Arc::clone(task));
                    }
                }
                _ => n_invalid += 1,
            }
        }
        debug_assert!(n_invalid == 0 || n_invalid == 2 || n_invalid == 3);

        for (c, src_tiles) in src.into_iter().enumerate() {
            per_level_down[level].push(Arc::new(DownscaleTask {
                target: Arc::clone(&targets[c]),
                src: src_tiles,
                low_quality: node.low_quality,
            }));
        }
        targets
    } else {
        (0..n_comps)
            .map(|c| {
                let buffer = lock.existing()[*existing_i].clone();
                *existing_i += 1;
                let task = Arc::new(TileTask {
                    buffer,
                    index: node.per_channel[c],
                    bounds,
                    channel: c,
                });
                if level == target_level {
                    tiles_to_copy.push(Arc::clone(&task));
                }
                task
            })
            .collect()
    }
}

fn status_prop_name(level: usize) -> String {
    format!("Status{level}")
}

fn indices_prop_name(level: usize) -> String {
    format!("TileIndices{level}")
}

fn uuid_prop_name(level: usize) -> String {
    format!("UUID{level}")
}

fn bounds_prop_name(level: usize) -> String {
    format!("Bounds{level}")
}

/// Mirror level states into the segment property map.
///
/// `copy_pending` is only true for the initializer (or a forced rebuild):
/// a regular merge never publishes a `Pending` status, never downgrades a
/// `RenderedHighestQuality` tile, and only downgrades `RenderedLowQuality`
/// to a higher quality. With `owned` set, only the listed tiles are
/// touched.
fn write_level_states_to_map(
    copy_pending: bool,
    levels: &[TilesState],
    segment: &mut SegmentStorage,
    owned: Option<&[TileCoordSet]>,
    tsx: i32,
    tsy: i32,
) -> CacheResult<()> {
    {
        let prop = segment.map_mut().get_or_create("NumLevels", IpcValueType::I32)?;
        if prop.is_empty() {
            prop.resize(1);
        }
        let current = prop.get_i32(0).unwrap_or(0);
        if current < levels.len() as i32 {
            prop.set_i32(0, levels.len() as i32);
        }
    }

    for (m, state) in levels.iter().enumerate() {
        let status_name = status_prop_name(m);
        let indices_name = indices_prop_name(m);
        let uuid_name = uuid_prop_name(m);
        let bounds_name = bounds_prop_name(m);
        let n_tiles = state.tiles.len();

        let dims_match = {
            let map = segment.map();
            map.get(&status_name).is_some_and(|p| p.len() == n_tiles)
                && map.get(&indices_name).is_some_and(|p| p.len() == n_tiles * 4)
                && map.get(&uuid_name).is_some_and(|p| p.len() == n_tiles * 2)
                && map.get(&bounds_name).is_some_and(|p| p.len() == 4)
        };

        if !dims_match {
            // First publication of this level (or its geometry changed):
            // write everything, pending claims included.
            let map = segment.map_mut();
            {
                let p = map.get_or_create(&bounds_name, IpcValueType::I32)?;
                p.resize(4);
                p.set_i32(0, state.bounds.x1);
                p.set_i32(1, state.bounds.y1);
                p.set_i32(2, state.bounds.x2);
                p.set_i32(3, state.bounds.y2);
            }
            {
                let p = map.get_or_create(&status_name, IpcValueType::I32)?;
                p.resize(n_tiles);
                for (i, tile) in state.tiles.iter().enumerate() {
                    p.set_i32(i, tile.status.to_i32());
                }
            }
            {
                let p = map.get_or_create(&uuid_name, IpcValueType::U64)?;
                p.resize(n_tiles * 2);
                for (i, tile) in state.tiles.iter().enumerate() {
                    let (hi, lo) = tile.uuid.as_u64_pair();
                    p.set_u64(i * 2, hi);
                    p.set_u64(i * 2 + 1, lo);
                }
            }
            {
                let p = map.get_or_create(&indices_name, IpcValueType::U64)?;
                p.resize(n_tiles * 4);
                for (i, tile) in state.tiles.iter().enumerate() {
                    for c in 0..4 {
                        p.set_u64(i * 4 + c, tile.channels_storage[c].0);
                    }
                }
            }
        } else {
            let tiles_per_row = (state.bounds_rounded.width() / tsx).max(1) as usize;
            let mut to_write = Vec::new();
            {
                let map = segment.map();
                let status_prop = map
                    .get(&status_name)
                    .ok_or_else(|| CacheError::failed("status property vanished"))?;
                for (i, tile) in state.tiles.iter().enumerate() {
                    let cache_status = status_prop
                        .get_i32(i)
                        .and_then(TileStatus::from_i32)
                        .ok_or_else(|| CacheError::failed("corrupted status property"))?;

                    // Never downgrade what another worker already published.
                    if !copy_pending
                        && (cache_status == TileStatus::RenderedHighestQuality
                            || (cache_status == TileStatus::RenderedLowQuality
                                && tile.status != TileStatus::RenderedHighestQuality))
                    {
                        continue;
                    }
                    if let Some(owned_sets) = owned {
                        if m >= owned_sets.len() {
                            continue;
                        }
                        let col = (i % tiles_per_row) as i32;
                        let row = (i / tiles_per_row) as i32;
                        let coord = TileCoord::new(
                            state.bounds_rounded.x1 + col * tsx,
                            state.bounds_rounded.y1 + row * tsy,
                        );
                        if !owned_sets[m].contains(&coord) {
                            continue;
                        }
                    }
                    // A merge never publishes our in-flight claims.
                    if copy_pending || tile.status != TileStatus::Pending {
                        to_write.push(i);
                    }
                }
            }

            let map = segment.map_mut();
            {
                let p = map.get_or_create(&uuid_name, IpcValueType::U64)?;
                for &i in &to_write {
                    let (hi, lo) = state.tiles[i].uuid.as_u64_pair();
                    p.set_u64(i * 2, hi);
                    p.set_u64(i * 2 + 1, lo);
                }
            }
            {
                let p = map.get_or_create(&status_name, IpcValueType::I32)?;
                for &i in &to_write {
                    p.set_i32(i, state.tiles[i].status.to_i32());
                }
            }
            {
                let p = map.get_or_create(&indices_name, IpcValueType::U64)?;
                for &i in &to_write {
                    for c in 0..4 {
                        p.set_u64(i * 4 + c, state.tiles[i].channels_storage[c].0);
                    }
                }
            }
        }

        if segment.commit_budget().is_err() {
            // Free the in-flight properties so the segment stays usable.
            let map = segment.map_mut();
            map.remove(&status_name);
            map.remove(&indices_name);
            map.remove(&uuid_name);
            map.remove(&bounds_name);
            return Err(CacheError::BadAlloc);
        }
    }
    Ok(())
}

/// Rebuild the level states from the segment property map.
fn read_level_states_from_map(
    tsx: i32,
    tsy: i32,
    map: &IpcPropertyMap,
) -> CacheResult<Vec<TilesState>> {
    let num_levels = map
        .get("NumLevels")
        .and_then(|p| p.get_i32(0))
        .ok_or_else(|| CacheError::failed("segment is missing NumLevels"))?;
    if num_levels < 0 {
        return Err(CacheError::failed("negative NumLevels"));
    }

    let mut levels = Vec::with_capacity(num_levels as usize);
    for m in 0..num_levels as usize {
        let status_prop = map
            .get(&status_prop_name(m))
            .ok_or_else(|| CacheError::failed(format!("missing Status{m}")))?;
        let indices_prop = map
            .get(&indices_prop_name(m))
            .ok_or_else(|| CacheError::failed(format!("missing TileIndices{m}")))?;
        let uuid_prop = map
            .get(&uuid_prop_name(m))
            .ok_or_else(|| CacheError::failed(format!("missing UUID{m}")))?;
        let bounds_prop = map
            .get(&bounds_prop_name(m))
            .ok_or_else(|| CacheError::failed(format!("missing Bounds{m}")))?;

        let n_tiles = status_prop.len();
        if bounds_prop.len() != 4
            || uuid_prop.len() != n_tiles * 2
            || indices_prop.len() != n_tiles * 4
        {
            return Err(CacheError::failed(format!("level {m} properties are inconsistent")));
        }

        let bounds = RectI {
            x1: bounds_prop.get_i32(0).ok_or_else(|| CacheError::failed("bad bounds"))?,
            y1: bounds_prop.get_i32(1).ok_or_else(|| CacheError::failed("bad bounds"))?,
            x2: bounds_prop.get_i32(2).ok_or_else(|| CacheError::failed("bad bounds"))?,
            y2: bounds_prop.get_i32(3).ok_or_else(|| CacheError::failed("bad bounds"))?,
        };

        let mut state = TilesState {
            bounds,
            bounds_rounded: bounds.rounded_to_tile_size(tsx, tsy),
            tiles: Vec::new(),
        };
        if n_tiles != state.expected_tile_count(tsx, tsy) {
            return Err(CacheError::failed(format!(
                "level {m} has {n_tiles} tiles for bounds {bounds:?}"
            )));
        }
        state.tiles.resize_with(n_tiles, Default::default);

        let mut tx = state.bounds_rounded.x1;
        let mut ty = state.bounds_rounded.y1;
        for i in 0..n_tiles {
            let tile = &mut state.tiles[i];
            tile.status = status_prop
                .get_i32(i)
                .and_then(TileStatus::from_i32)
                .ok_or_else(|| CacheError::failed("corrupted tile status"))?;

            let hi = uuid_prop.get_u64(i * 2).unwrap_or(0);
            let lo = uuid_prop.get_u64(i * 2 + 1).unwrap_or(0);
            tile.uuid = Uuid::from_u64_pair(hi, lo);

            for c in 0..4 {
                tile.channels_storage[c] = crate::tile_state::TileInternalIndex(
                    indices_prop.get_u64(i * 4 + c).unwrap_or(u64::MAX),
                );
            }

            tile.bounds = RectI {
                x1: tx.max(bounds.x1),
                y1: ty.max(bounds.y1),
                x2: (tx + tsx).min(bounds.x2),
                y2: (ty + tsy).min(bounds.y2),
            };
            tx += tsx;
            if tx >= state.bounds_rounded.x2 {
                tx = state.bounds_rounded.x1;
                ty += tsy;
            }
        }
        levels.push(state);
    }
    Ok(levels)
}

/// Interface between one render of one image and the tile cache.
///
/// All operations are callable from any thread; one mutex serializes the
/// entry's local state, and the shared per-level states are guarded by
/// the entry lock (non-persistent) or the segment lock (persistent).
/// Dropping the entry aborts any tiles it still has claimed.
pub struct ImageCacheEntry {
    key: ImageCacheKey,
    core: Mutex<EntryCore>,
}

impl ImageCacheEntry {
    /// `per_level_rod` holds the pixel region of definition for every
    /// level up to `mipmap_level`; `roi` must sit inside the target
    /// level's RoD and be tile-aligned except where it meets the RoD
    /// border.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TileStore>,
        registry: Arc<EntryCache>,
        key: ImageCacheKey,
        per_level_rod: Vec<RectI>,
        roi: RectI,
        mipmap_level: usize,
        is_draft: bool,
        depth: BitDepth,
        n_comps: usize,
        storage: [Option<PixelBuffer>; 4],
        layout: ImageBufferLayout,
        effect: Arc<dyn RenderEffect>,
        cache_policy: CacheAccessMode,
    ) -> Self {
        assert!(n_comps >= 1 && n_comps <= 4);
        assert!(per_level_rod.len() >= mipmap_level + 1);
        let rod = per_level_rod[mipmap_level];
        assert!(rod.contains(&roi));

        let (tsx, tsy) = store.tile_size(depth);
        // Partial tiles are only allowed against the RoD border; anywhere
        // else a misaligned window could get a tile half-rendered.
        assert!(roi.x1 % tsx == 0 || roi.x1 == rod.x1);
        assert!(roi.y1 % tsy == 0 || roi.y1 == rod.y1);
        assert!(roi.x2 % tsx == 0 || roi.x2 == rod.x2);
        assert!(roi.y2 % tsy == 0 || roi.y2 == rod.y2);

        let local_state = TileStateHeader::new(tsx, tsy, TilesState::with_bounds(tsx, tsy, rod));
        let binding = if cache_policy == CacheAccessMode::None {
            CacheBinding::Local(Arc::new(InMemoryEntryState::default()))
        } else {
            CacheBinding::Unbound
        };

        let key_digest = key.digest();
        Self {
            key,
            core: Mutex::new(EntryCore {
                store,
                registry,
                effect,
                key_digest,
                roi,
                per_level_rod,
                draft: is_draft,
                target_level: mipmap_level,
                depth,
                n_comps,
                layout,
                buffers: storage,
                tile_size: (tsx, tsy),
                local_state,
                marked: Vec::new(),
                has_pending: false,
                tiles_to_fetch: Vec::new(),
                tiles_to_downscale: Vec::new(),
                policy: cache_policy,
                read_only_pass: false,
                binding,
            }),
        }
    }

    pub fn cache_key(&self) -> &ImageCacheKey {
        &self.key
    }

    /// Fetch the latest cached view, schedule newly cached tiles for
    /// copy-in, and claim unrendered tiles unless `read_only`.
    pub fn fetch_and_update_status(&self, read_only: bool) -> CacheResult<TilesRenderState> {
        self.core.lock().fetch_and_update_locked(read_only)?;
        Ok(self.get_status())
    }

    /// The last status this entry computed, without touching the cache.
    pub fn get_status(&self) -> TilesRenderState {
        self.core.lock().snapshot()
    }

    /// Transfer the rendered local pixels of every tile this entry
    /// claimed into the store and publish them as rendered. Do not call
    /// on an aborted render.
    pub fn mark_rendered(&self) -> CacheResult<()> {
        self.core.lock().mark_rendered_locked()
    }

    /// Return every tile this entry still has claimed to `NotRendered`.
    /// Also runs on drop; without it an abandoned claim would stall other
    /// workers until the liveness check reclaims it.
    pub fn mark_aborted(&self) -> CacheResult<()> {
        self.core.lock().mark_aborted_locked()
    }

    /// Invalidate every cached tile intersecting `roi`, at every level,
    /// releasing their storage.
    pub fn mark_region_unrendered(&self, roi: RectI) -> CacheResult<()> {
        self.core.lock().mark_region_unrendered_locked(roi)
    }

    /// Enlarge the tracked window and the per-level state maps. The
    /// caller provides the grown storage and the new per-level RoDs.
    pub fn ensure_roi(
        &self,
        roi: RectI,
        storage: [Option<PixelBuffer>; 4],
        per_level_rod: Vec<RectI>,
    ) -> CacheResult<()> {
        self.core.lock().ensure_roi_locked(roi, storage, per_level_rod)
    }

    /// Poll the cache until no tile of the roi is pending on another
    /// worker, some tile becomes ours to render, or the render aborts.
    ///
    /// Returns true iff everything is rendered. On false the caller
    /// should re-check with `fetch_and_update_status`: a tile another
    /// worker abandoned may now be ours.
    pub fn wait_for_pending(&self) -> bool {
        let effect = {
            let core = self.core.lock();
            if !core.has_pending {
                return true;
            }
            Arc::clone(&core.effect)
        };

        // Polling with backoff instead of a cross-process condition
        // variable; the segment locks must not be held while sleeping.
        let mut wait_ms: u64 = 40;
        let mut waited_ms: u64 = 0;
        let mut warned = false;
        loop {
            let state = match self.fetch_and_update_status(false) {
                Ok(state) => state,
                Err(_) => return true,
            };
            if !state.has_pending_tiles
                || state.has_unrendered_tiles
                || effect.is_render_aborted()
            {
                return !state.has_pending_tiles && !state.has_unrendered_tiles;
            }
            EntryCache::sleep_ms(wait_ms);
            waited_ms += wait_ms;
            wait_ms = (wait_ms as f64 * 1.2) as u64;
            if !warned && waited_ms > 5000 {
                warn!(
                    effect = effect.script_name(),
                    waited_ms, "still waiting for pending tiles"
                );
                warned = true;
            }
        }
    }
}

impl Drop for ImageCacheEntry {
    fn drop(&mut self) {
        // Leave no claim behind.
        let _ = self.core.lock().mark_aborted_locked();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::RenderFlag;
    use crate::store::MemoryTileStore;
    use crate::test_utils::{fill_rect_f32, make_entry, read_f32, test_key, CacheRig};
    use crate::tile_state::TileInternalIndex;

    // Float tiles are 64x64 in the store.
    const T: i32 = 64;

    fn rect(x1: i32, y1: i32, x2: i32, y2: i32) -> RectI {
        RectI::new(x1, y1, x2, y2)
    }

    #[test]
    fn test_key_digest_stable_and_sensitive() {
        let a = test_key(7).digest();
        assert_eq!(a, test_key(7).digest());
        assert_ne!(a, test_key(8).digest());

        let mut other_layer = test_key(7);
        other_layer.layer_id = "Depth.Z".to_owned();
        assert_ne!(a, other_layer.digest());

        let mut other_scale = test_key(7);
        other_scale.proxy_scale = (0.5, 0.5);
        assert_ne!(a, other_scale.digest());
    }

    #[test]
    fn test_single_render_single_tile() {
        let rig = CacheRig::new(false);
        let effect = Arc::new(RenderFlag::new("Writer1"));
        let rod = rect(0, 0, T, T);

        let (writer, buffer) = make_entry(
            &rig.store, &rig.registry, &effect, 1, rod, 0, rod, false,
            CacheAccessMode::ReadWrite,
        );
        let state = writer.fetch_and_update_status(false).unwrap();
        assert!(state.has_unrendered_tiles);
        assert!(!state.has_pending_tiles);

        fill_rect_f32(&buffer, rod, rod, 7.0);
        writer.mark_rendered().unwrap();
        let state = writer.get_status();
        assert_eq!(
            state.status.tile_at(0, 0).unwrap().status,
            TileStatus::RenderedHighestQuality
        );
        assert!(!state.has_unrendered_tiles);

        let (reader, reader_buffer) = make_entry(
            &rig.store, &rig.registry, &effect, 1, rod, 0, rod, false,
            CacheAccessMode::ReadWrite,
        );
        let state = reader.fetch_and_update_status(false).unwrap();
        assert!(!state.has_unrendered_tiles);
        assert!(!state.has_pending_tiles);
        assert_eq!(read_f32(&reader_buffer, rod, 10, 10), 7.0);
        assert_eq!(read_f32(&reader_buffer, rod, 63, 63), 7.0);
    }

    #[test]
    fn test_fetch_is_idempotent_on_marking() {
        let rig = CacheRig::new(false);
        let effect = Arc::new(RenderFlag::new("Writer1"));
        let rod = rect(0, 0, T, T);
        let (writer, _buffer) = make_entry(
            &rig.store, &rig.registry, &effect, 1, rod, 0, rod, false,
            CacheAccessMode::ReadWrite,
        );

        let first = writer.fetch_and_update_status(false).unwrap();
        let second = writer.fetch_and_update_status(false).unwrap();
        assert!(first.has_unrendered_tiles && second.has_unrendered_tiles);
        // Nothing was allocated and the one claim was not re-taken.
        assert_eq!(rig.store.stats().allocated, 0);
    }

    #[test]
    fn test_two_writers_disjoint_tiles() {
        let rig = CacheRig::new(false);
        let effect = Arc::new(RenderFlag::new("Merge1"));
        let rod = rect(0, 0, 2 * T, T);
        let roi_a = rect(0, 0, T, T);
        let roi_b = rect(T, 0, 2 * T, T);

        let (a, buffer_a) = make_entry(
            &rig.store, &rig.registry, &effect, 2, rod, 0, roi_a, false,
            CacheAccessMode::ReadWrite,
        );
        let (b, buffer_b) = make_entry(
            &rig.store, &rig.registry, &effect, 2, rod, 0, roi_b, false,
            CacheAccessMode::ReadWrite,
        );
        assert!(a.fetch_and_update_status(false).unwrap().has_unrendered_tiles);
        assert!(b.fetch_and_update_status(false).unwrap().has_unrendered_tiles);

        // A full-window observer sees both claims as pending.
        let (observer, observer_buffer) = make_entry(
            &rig.store, &rig.registry, &effect, 2, rod, 0, rod, false,
            CacheAccessMode::ReadWrite,
        );
        let state = observer.fetch_and_update_status(true).unwrap();
        assert!(state.has_pending_tiles);
        assert!(!state.has_unrendered_tiles);
        assert_eq!(state.status.tile_at(0, 0).unwrap().status, TileStatus::Pending);
        assert_eq!(state.status.tile_at(T, 0).unwrap().status, TileStatus::Pending);

        fill_rect_f32(&buffer_a, roi_a, roi_a, 1.0);
        a.mark_rendered().unwrap();
        fill_rect_f32(&buffer_b, roi_b, roi_b, 2.0);
        b.mark_rendered().unwrap();

        let state = observer.fetch_and_update_status(false).unwrap();
        assert!(!state.has_pending_tiles);
        assert!(!state.has_unrendered_tiles);
        assert_eq!(
            state.status.tile_at(0, 0).unwrap().status,
            TileStatus::RenderedHighestQuality
        );
        assert_eq!(
            state.status.tile_at(T, 0).unwrap().status,
            TileStatus::RenderedHighestQuality
        );
        assert_eq!(read_f32(&observer_buffer, rod, 10, 10), 1.0);
        assert_eq!(read_f32(&observer_buffer, rod, T + 10, 10), 2.0);
    }

    #[test]
    fn test_downscale_reconstruction() {
        let rig = CacheRig::new(false);
        let effect = Arc::new(RenderFlag::new("Reader1"));
        let rod0 = rect(0, 0, 2 * T, 2 * T);

        // Render the four level-0 tiles with distinct constants.
        let (writer, buffer) = make_entry(
            &rig.store, &rig.registry, &effect, 3, rod0, 0, rod0, false,
            CacheAccessMode::ReadWrite,
        );
        assert!(writer.fetch_and_update_status(false).unwrap().has_unrendered_tiles);
        fill_rect_f32(&buffer, rod0, rect(0, 0, T, T), 10.0);
        fill_rect_f32(&buffer, rod0, rect(T, 0, 2 * T, T), 20.0);
        fill_rect_f32(&buffer, rod0, rect(0, T, T, 2 * T), 30.0);
        fill_rect_f32(&buffer, rod0, rect(T, T, 2 * T, 2 * T), 40.0);
        writer.mark_rendered().unwrap();

        // A level-1 render of the quarter image reconstructs its single
        // tile from the four finer ones.
        let roi1 = rect(0, 0, T, T);
        let (reader, reader_buffer) = make_entry(
            &rig.store, &rig.registry, &effect, 3, rod0, 1, roi1, false,
            CacheAccessMode::ReadWrite,
        );
        let state = reader.fetch_and_update_status(false).unwrap();
        assert!(!state.has_unrendered_tiles);
        assert!(!state.has_pending_tiles);
        let tile = state.status.tile_at(0, 0).unwrap();
        assert_eq!(tile.status, TileStatus::RenderedHighestQuality);
        assert!(tile.channels_storage[0].is_valid());

        assert_eq!(read_f32(&reader_buffer, roi1, 0, 0), 10.0);
        assert_eq!(read_f32(&reader_buffer, roi1, T / 2, 0), 20.0);
        assert_eq!(read_f32(&reader_buffer, roi1, 0, T / 2), 30.0);
        assert_eq!(read_f32(&reader_buffer, roi1, T / 2, T / 2), 40.0);

        // The reconstruction was published: a second level-1 reader finds
        // it rendered and does no extra work.
        let (second, _buffer) = make_entry(
            &rig.store, &rig.registry, &effect, 3, rod0, 1, roi1, false,
            CacheAccessMode::ReadWrite,
        );
        let state = second.fetch_and_update_status(true).unwrap();
        assert_eq!(
            state.status.tile_at(0, 0).unwrap().status,
            TileStatus::RenderedHighestQuality
        );
    }

    #[test]
    fn test_pending_owner_dies() {
        // Two "processes": separate persistent stores sharing a registry.
        let registry = EntryCache::new(128);
        let store_a = Arc::new(MemoryTileStore::new(true));
        let store_b = Arc::new(MemoryTileStore::new(true));
        let effect = Arc::new(RenderFlag::new("Writer1"));
        let rod = rect(0, 0, T, T);

        let (a, _buffer_a) = make_entry(
            &store_a, &registry, &effect, 4, rod, 0, rod, false,
            CacheAccessMode::ReadWrite,
        );
        assert!(a.fetch_and_update_status(false).unwrap().has_unrendered_tiles);
        // The owner dies without aborting: skip the destructor.
        std::mem::forget(a);

        // Process B sees the stale claim, reclaims it and renders.
        let (b, buffer_b) = make_entry(
            &store_b, &registry, &effect, 4, rod, 0, rod, false,
            CacheAccessMode::ReadWrite,
        );
        let state = b.fetch_and_update_status(false).unwrap();
        assert!(state.has_unrendered_tiles);
        assert!(!state.has_pending_tiles);

        fill_rect_f32(&buffer_b, rod, rod, 5.0);
        b.mark_rendered().unwrap();
        assert_eq!(store_b.stats().allocated, 1);

        let (observer, _buffer) = make_entry(
            &store_b, &registry, &effect, 4, rod, 0, rod, false,
            CacheAccessMode::ReadWrite,
        );
        let state = observer.fetch_and_update_status(true).unwrap();
        assert_eq!(
            state.status.tile_at(0, 0).unwrap().status,
            TileStatus::RenderedHighestQuality
        );
        assert!(!state.has_pending_tiles);
    }

    #[test]
    fn test_low_quality_upgrade() {
        let rig = CacheRig::new(false);
        let effect = Arc::new(RenderFlag::new("Viewer1"));
        let rod = rect(0, 0, T, T);

        // Draft render publishes a low-quality tile.
        let (draft, draft_buffer) = make_entry(
            &rig.store, &rig.registry, &effect, 5, rod, 0, rod, true,
            CacheAccessMode::ReadWrite,
        );
        assert!(draft.fetch_and_update_status(false).unwrap().has_unrendered_tiles);
        fill_rect_f32(&draft_buffer, rod, rod, 1.0);
        draft.mark_rendered().unwrap();
        assert_eq!(
            draft.get_status().status.tile_at(0, 0).unwrap().status,
            TileStatus::RenderedLowQuality
        );

        // A non-draft render does not accept the draft tile and redoes it.
        let (full, full_buffer) = make_entry(
            &rig.store, &rig.registry, &effect, 5, rod, 0, rod, false,
            CacheAccessMode::ReadWrite,
        );
        let state = full.fetch_and_update_status(false).unwrap();
        assert!(state.has_unrendered_tiles);
        fill_rect_f32(&full_buffer, rod, rod, 2.0);
        full.mark_rendered().unwrap();

        // A later draft render is happy with the highest quality tile.
        let (draft2, draft2_buffer) = make_entry(
            &rig.store, &rig.registry, &effect, 5, rod, 0, rod, true,
            CacheAccessMode::ReadWrite,
        );
        let state = draft2.fetch_and_update_status(false).unwrap();
        assert!(!state.has_unrendered_tiles);
        assert!(!state.has_pending_tiles);
        assert_eq!(
            state.status.tile_at(0, 0).unwrap().status,
            TileStatus::RenderedHighestQuality
        );
        assert_eq!(read_f32(&draft2_buffer, rod, 5, 5), 2.0);
    }

    #[test]
    fn test_abort_returns_tiles_to_not_rendered() {
        let rig = CacheRig::new(false);
        let effect = Arc::new(RenderFlag::new("Aborted1"));
        let rod = rect(0, 0, 4 * T, 4 * T);

        let (entry, _buffer) = make_entry(
            &rig.store, &rig.registry, &effect, 6, rod, 0, rod, false,
            CacheAccessMode::ReadWrite,
        );
        let state = entry.fetch_and_update_status(false).unwrap();
        assert!(state.has_unrendered_tiles);

        effect.abort();
        // The drop runs mark_aborted.
        drop(entry);

        let locker = rig.registry.get(test_key(6).digest());
        assert_eq!(locker.status(), EntryStatus::Cached);
        let Some(SharedCacheEntry::InMemory(shared)) = locker.cached_entry() else {
            panic!("expected an in-memory entry");
        };
        let levels = shared.levels.read();
        assert_eq!(levels[0].tiles.len(), 16);
        assert!(levels[0]
            .tiles
            .iter()
            .all(|t| t.status == TileStatus::NotRendered));
    }

    #[test]
    fn test_wait_for_pending_sees_other_worker_finish() {
        let rig = CacheRig::new(false);
        let effect = Arc::new(RenderFlag::new("Writer1"));
        let rod = rect(0, 0, T, T);

        let (a, buffer_a) = make_entry(
            &rig.store, &rig.registry, &effect, 7, rod, 0, rod, false,
            CacheAccessMode::ReadWrite,
        );
        assert!(a.fetch_and_update_status(false).unwrap().has_unrendered_tiles);

        let (b, buffer_b) = make_entry(
            &rig.store, &rig.registry, &effect, 7, rod, 0, rod, false,
            CacheAccessMode::ReadWrite,
        );
        let state = b.fetch_and_update_status(false).unwrap();
        assert!(state.has_pending_tiles);
        assert!(!state.has_unrendered_tiles);

        let worker = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            fill_rect_f32(&buffer_a, rod, rod, 9.0);
            a.mark_rendered().unwrap();
            drop(a);
        });

        assert!(b.wait_for_pending());
        worker.join().unwrap();

        let state = b.get_status();
        assert!(!state.has_pending_tiles);
        assert_eq!(read_f32(&buffer_b, rod, 1, 1), 9.0);
    }

    #[test]
    fn test_write_only_policy_drops_stale_content() {
        let rig = CacheRig::new(false);
        let effect = Arc::new(RenderFlag::new("Writer1"));
        let rod = rect(0, 0, T, T);

        let (first, buffer) = make_entry(
            &rig.store, &rig.registry, &effect, 8, rod, 0, rod, false,
            CacheAccessMode::ReadWrite,
        );
        first.fetch_and_update_status(false).unwrap();
        fill_rect_f32(&buffer, rod, rod, 1.0);
        first.mark_rendered().unwrap();

        // A write-only render ignores the cached tile and reclaims it.
        let (clean, _buffer) = make_entry(
            &rig.store, &rig.registry, &effect, 8, rod, 0, rod, false,
            CacheAccessMode::WriteOnly,
        );
        let state = clean.fetch_and_update_status(false).unwrap();
        assert!(state.has_unrendered_tiles);
        assert!(!state.has_pending_tiles);
    }

    #[test]
    fn test_mark_region_unrendered_releases_storage() {
        let rig = CacheRig::new(false);
        let effect = Arc::new(RenderFlag::new("Writer1"));
        let rod = rect(0, 0, T, T);

        let (entry, buffer) = make_entry(
            &rig.store, &rig.registry, &effect, 9, rod, 0, rod, false,
            CacheAccessMode::ReadWrite,
        );
        entry.fetch_and_update_status(false).unwrap();
        fill_rect_f32(&buffer, rod, rod, 3.0);
        entry.mark_rendered().unwrap();
        assert_eq!(rig.store.stats().resident, 1);

        entry.mark_region_unrendered(rod).unwrap();
        assert_eq!(rig.store.stats().resident, 0);
        assert_eq!(
            entry.get_status().status.tile_at(0, 0).unwrap().status,
            TileStatus::NotRendered
        );

        // The tile can be claimed again.
        let state = entry.fetch_and_update_status(false).unwrap();
        assert!(state.has_unrendered_tiles);
    }

    #[test]
    fn test_ensure_roi_preserves_rendered_tiles() {
        let rig = CacheRig::new(false);
        let effect = Arc::new(RenderFlag::new("Writer1"));
        let rod = rect(0, 0, 2 * T, T);

        let (entry, buffer) = make_entry(
            &rig.store, &rig.registry, &effect, 10, rod, 0, rect(0, 0, T, T), false,
            CacheAccessMode::None,
        );
        entry.fetch_and_update_status(false).unwrap();
        fill_rect_f32(&buffer, rect(0, 0, T, T), rect(0, 0, T, T), 1.0);
        entry.mark_rendered().unwrap();

        let grown_rod = rect(0, 0, 4 * T, T);
        entry
            .ensure_roi(grown_rod, [Some(buffer.clone()), None, None, None], vec![grown_rod])
            .unwrap();

        let state = entry.fetch_and_update_status(false).unwrap();
        assert!(state.has_unrendered_tiles);
        assert_eq!(
            state.status.tile_at(0, 0).unwrap().status,
            TileStatus::RenderedHighestQuality
        );
        assert_eq!(state.status.tile_at(3 * T, 0).unwrap().status, TileStatus::NotRendered);
    }

    #[test]
    #[should_panic]
    fn test_unaligned_roi_asserts() {
        let rig = CacheRig::new(false);
        let effect = Arc::new(RenderFlag::new("Writer1"));
        let rod = rect(0, 0, 100, 100);
        // x1 = 10 is neither tile aligned nor the RoD border.
        let _ = make_entry(
            &rig.store, &rig.registry, &effect, 11, rod, 0, rect(10, 0, 64, 64), false,
            CacheAccessMode::ReadWrite,
        );
    }

    fn sample_levels() -> Vec<TilesState> {
        let mut level0 = TilesState::with_bounds(T, T, rect(-10, 0, 2 * T, T));
        level0.tiles[0].status = TileStatus::RenderedHighestQuality;
        level0.tiles[0].channels_storage = [
            TileInternalIndex(1),
            TileInternalIndex(2),
            TileInternalIndex(3),
            TileInternalIndex(4),
        ];
        level0.tiles[1].status = TileStatus::Pending;
        level0.tiles[1].uuid = Uuid::new_v4();
        let level1 = TilesState::with_bounds(T, T, rect(-5, 0, T, T / 2));
        vec![level0, level1]
    }

    #[test]
    fn test_level_state_segment_round_trip() {
        let levels = sample_levels();
        let mut segment = SegmentStorage::default();
        write_level_states_to_map(true, &levels, &mut segment, None, T, T).unwrap();

        let back = read_level_states_from_map(T, T, segment.map()).unwrap();
        assert_eq!(back, levels);

        // And through the byte mirror as well.
        let bytes = segment.to_bytes().unwrap();
        let segment2 = SegmentStorage::from_bytes(&bytes).unwrap();
        assert_eq!(read_level_states_from_map(T, T, segment2.map()).unwrap(), levels);
    }

    #[test]
    fn test_segment_merge_never_downgrades() {
        let mut rendered = TilesState::with_bounds(T, T, rect(0, 0, T, T));
        rendered.tiles[0].status = TileStatus::RenderedHighestQuality;
        let mut segment = SegmentStorage::default();
        write_level_states_to_map(true, &[rendered.clone()], &mut segment, None, T, T).unwrap();

        // A low-quality publication does not replace the better tile.
        let mut low = rendered.clone();
        low.tiles[0].status = TileStatus::RenderedLowQuality;
        write_level_states_to_map(false, &[low], &mut segment, None, T, T).unwrap();
        let back = read_level_states_from_map(T, T, segment.map()).unwrap();
        assert_eq!(back[0].tiles[0].status, TileStatus::RenderedHighestQuality);

        // A pending claim is never published by a merge.
        let mut fresh = TilesState::with_bounds(T, T, rect(0, 0, T, T));
        let mut segment = SegmentStorage::default();
        write_level_states_to_map(true, &[fresh.clone()], &mut segment, None, T, T).unwrap();
        fresh.tiles[0].status = TileStatus::Pending;
        write_level_states_to_map(false, &[fresh], &mut segment, None, T, T).unwrap();
        let back = read_level_states_from_map(T, T, segment.map()).unwrap();
        assert_eq!(back[0].tiles[0].status, TileStatus::NotRendered);

        // Low quality does upgrade to highest quality.
        let mut low = TilesState::with_bounds(T, T, rect(0, 0, T, T));
        low.tiles[0].status = TileStatus::RenderedLowQuality;
        let mut segment = SegmentStorage::default();
        write_level_states_to_map(true, &[low.clone()], &mut segment, None, T, T).unwrap();
        let mut high = low.clone();
        high.tiles[0].status = TileStatus::RenderedHighestQuality;
        write_level_states_to_map(false, &[high], &mut segment, None, T, T).unwrap();
        let back = read_level_states_from_map(T, T, segment.map()).unwrap();
        assert_eq!(back[0].tiles[0].status, TileStatus::RenderedHighestQuality);
    }

    #[test]
    fn test_segment_merge_only_touches_owned_tiles() {
        let mut state = TilesState::with_bounds(T, T, rect(0, 0, 2 * T, T));
        let mut segment = SegmentStorage::default();
        write_level_states_to_map(true, &[state.clone()], &mut segment, None, T, T).unwrap();

        // Claim to own only tile (0, 0) while writing both as rendered.
        state.tiles[0].status = TileStatus::RenderedHighestQuality;
        state.tiles[1].status = TileStatus::RenderedHighestQuality;
        let mut owned = TileCoordSet::new();
        owned.insert(TileCoord::new(0, 0));
        write_level_states_to_map(false, &[state], &mut segment, Some(&[owned]), T, T).unwrap();

        let back = read_level_states_from_map(T, T, segment.map()).unwrap();
        assert_eq!(back[0].tiles[0].status, TileStatus::RenderedHighestQuality);
        assert_eq!(back[0].tiles[1].status, TileStatus::NotRendered);
    }

    #[test]
    fn test_segment_bad_alloc_frees_in_flight_properties() {
        let levels = vec![TilesState::with_bounds(T, T, rect(0, 0, 32 * T, 32 * T))];
        let mut segment = SegmentStorage::new(512);
        assert_eq!(
            write_level_states_to_map(true, &levels, &mut segment, None, T, T),
            Err(CacheError::BadAlloc)
        );
        assert!(segment.map().get("Status0").is_none());
        assert!(segment.map().get("TileIndices0").is_none());
        assert!(segment.commit_budget().is_ok());
    }

    #[test]
    fn test_persistent_single_writer_round_trip() {
        let rig = CacheRig::new(true);
        let effect = Arc::new(RenderFlag::new("Writer1"));
        let rod = rect(0, 0, T, T);

        let (writer, buffer) = make_entry(
            &rig.store, &rig.registry, &effect, 12, rod, 0, rod, false,
            CacheAccessMode::ReadWrite,
        );
        assert!(writer.fetch_and_update_status(false).unwrap().has_unrendered_tiles);
        fill_rect_f32(&buffer, rod, rod, 4.0);
        writer.mark_rendered().unwrap();

        let (reader, reader_buffer) = make_entry(
            &rig.store, &rig.registry, &effect, 12, rod, 0, rod, false,
            CacheAccessMode::ReadWrite,
        );
        let state = reader.fetch_and_update_status(false).unwrap();
        assert!(!state.has_unrendered_tiles);
        assert!(!state.has_pending_tiles);
        assert_eq!(read_f32(&reader_buffer, rod, 20, 20), 4.0);
    }
}
