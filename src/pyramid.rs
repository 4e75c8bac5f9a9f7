//! Mipmap pyramid tile-state resolution.
//!
//! For a requested tile the lookup walks the cached per-level states from
//! the target level toward the finest one, deciding whether the tile is
//! already rendered, pending elsewhere, reconstructible by downscaling
//! four finer tiles, or must be claimed and rendered here. Claiming
//! mutates the cached state, so a lookup running under a shared lock bails
//! out with `NeedWriteLock` and the caller retries under the writer lock.

use tracing::trace;

use crate::error::{CacheError, CacheResult};
use crate::store::TileStore;
use crate::tile_state::{
    TileCoord, TileCoordSet, TileInternalIndex, TileState, TileStateHeader, TileStatus, TilesState,
};

/// How and where to fetch one tile: either a leaf carrying the per-channel
/// storage indices of a cached tile, or a reconstruction node carrying the
/// four finer tiles to average. Children outside the finer level's rounded
/// bounds are absent.
#[derive(Debug, Clone)]
pub(crate) struct TileCacheIndex {
    pub per_channel: [TileInternalIndex; 4],
    pub tx: i32,
    pub ty: i32,
    /// Aggregate child quality: a reconstruction inherits low quality from
    /// any low-quality child.
    pub low_quality: bool,
    pub upscale: Option<Box<[Option<TileCacheIndex>; 4]>>,
}

impl TileCacheIndex {
    pub fn leaf(tx: i32, ty: i32) -> Self {
        Self {
            per_channel: [TileInternalIndex::INVALID; 4],
            tx,
            ty,
            low_quality: false,
            upscale: None,
        }
    }
}

/// Outcome of a lookup pass over one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LookupOutcome {
    /// Nothing changed in the cached state.
    UpToDate,
    /// The cached state was modified and must be published.
    Updated,
    /// A mutation is required but only a shared lock is held; retry with
    /// the writer lock.
    NeedWriteLock,
}

/// Immutable parameters of one lookup pass.
pub(crate) struct LookupParams<'a> {
    pub has_exclusive_lock: bool,
    pub target_level: usize,
    pub draft: bool,
    pub n_comps: usize,
    pub tile_size_x: i32,
    pub tile_size_y: i32,
    pub store: &'a dyn TileStore,
    /// Initializer passes expect every tile unrendered.
    pub expect_all_not_rendered: bool,
}

/// Mutable state threaded through the recursion. The caller works on
/// temporaries and commits them only when the pass completes without
/// `NeedWriteLock`.
pub(crate) struct LookupScratch<'a> {
    pub cache_levels: &'a mut [TilesState],
    pub local_state: &'a mut TileStateHeader,
    pub marked: &'a mut Vec<TileCoordSet>,
    pub tiles_to_fetch: &'a mut Vec<TileCacheIndex>,
    pub tiles_to_downscale: &'a mut Vec<TileCacheIndex>,
    pub has_pending: &'a mut bool,
}

impl LookupScratch<'_> {
    fn cache_tile(&self, p: &LookupParams, level: usize, coord: TileCoord) -> CacheResult<TileState> {
        self.cache_levels[level]
            .tile_at(p.tile_size_x, p.tile_size_y, coord.tx, coord.ty)
            .cloned()
            .ok_or_else(|| {
                CacheError::failed(format!(
                    "tile ({}, {}) outside the level {} state map",
                    coord.tx, coord.ty, level
                ))
            })
    }

    fn set_cache_tile(
        &mut self,
        p: &LookupParams,
        level: usize,
        coord: TileCoord,
        f: impl FnOnce(&mut TileState),
    ) {
        if let Some(tile) =
            self.cache_levels[level].tile_at_mut(p.tile_size_x, p.tile_size_y, coord.tx, coord.ty)
        {
            f(tile);
        }
    }
}

/// Revert the speculative `Pending` claims taken while recursing below a
/// tile that turned out to be pending or unrendered, so we do not
/// double-claim work that will not happen.
fn remove_from_marked(scratch: &mut LookupScratch, p: &LookupParams, level: usize, node: &TileCacheIndex) {
    if let Some(children) = &node.upscale {
        for child in children.iter().flatten() {
            remove_from_marked(scratch, p, level - 1, child);
        }
    }
    let coord = TileCoord::new(node.tx, node.ty);
    if scratch.marked[level].remove(&coord) {
        scratch.set_cache_tile(p, level, coord, |tile| {
            debug_assert_eq!(tile.status, TileStatus::Pending);
            tile.status = TileStatus::NotRendered;
        });
    }
}

/// Resolve one tile of the requested level.
pub(crate) fn lookup_tile(
    p: &LookupParams,
    scratch: &mut LookupScratch,
    coord: TileCoord,
) -> CacheResult<LookupOutcome> {
    let mut node = TileCacheIndex::leaf(coord.tx, coord.ty);
    lookup_recursive(p, scratch, p.target_level, coord, &mut node).map(|(outcome, _)| outcome)
}

fn lookup_recursive(
    p: &LookupParams,
    scratch: &mut LookupScratch,
    level: usize,
    coord: TileCoord,
    node: &mut TileCacheIndex,
) -> CacheResult<(LookupOutcome, TileStatus)> {
    // A tile we already claimed in a previous pass is our work in
    // progress; nothing to update. The node keeps its invalid coordinate
    // so a sibling revert cannot unmark it.
    if scratch.marked[level].contains(&coord) {
        return Ok((LookupOutcome::UpToDate, TileStatus::NotRendered));
    }
    node.tx = coord.tx;
    node.ty = coord.ty;

    let cached = scratch.cache_tile(p, level, coord)?;
    let mut status = cached.status;

    debug_assert!(!p.expect_all_not_rendered || status == TileStatus::NotRendered);

    // A low-quality tile only counts as rendered for draft renders.
    if status == TileStatus::RenderedLowQuality && !p.draft {
        status = TileStatus::NotRendered;
    }

    // A pending tile whose owner died is abandoned work; reclaim it.
    if status == TileStatus::Pending
        && p.store.is_persistent()
        && !p.store.is_uuid_alive(cached.uuid)
    {
        status = TileStatus::NotRendered;
    }

    let at_target = level == p.target_level;

    match status {
        TileStatus::RenderedHighestQuality | TileStatus::RenderedLowQuality => {
            node.per_channel[..p.n_comps].copy_from_slice(&cached.channels_storage[..p.n_comps]);
            node.low_quality = status == TileStatus::RenderedLowQuality;
            if at_target {
                scratch.tiles_to_fetch.push(node.clone());
                if let Some(local) = scratch.local_state.tile_at_mut(coord.tx, coord.ty) {
                    local.status = status;
                }
            }
            trace!(tx = coord.tx, ty = coord.ty, level, "tile rendered in cache");
            Ok((LookupOutcome::UpToDate, status))
        }
        TileStatus::Pending => {
            if at_target {
                if let Some(local) = scratch.local_state.tile_at_mut(coord.tx, coord.ty) {
                    local.status = TileStatus::Pending;
                }
                *scratch.has_pending = true;
            }
            trace!(tx = coord.tx, ty = coord.ty, level, "tile pending in cache");
            Ok((LookupOutcome::UpToDate, TileStatus::Pending))
        }
        TileStatus::NotRendered => {
            let mut outcome = LookupOutcome::UpToDate;
            let mut aggregate = TileStatus::NotRendered;

            if level > 0 {
                // The four finer tiles covering this one.
                let next_tx = coord.tx * 2;
                let next_ty = coord.ty * 2;
                let upscale_coords = [
                    (next_tx, next_ty),
                    (next_tx + p.tile_size_x, next_ty),
                    (next_tx, next_ty + p.tile_size_y),
                    (next_tx + p.tile_size_x, next_ty + p.tile_size_y),
                ];

                let finer_rounded = scratch.cache_levels[level - 1].bounds_rounded;
                let mut children: Box<[Option<TileCacheIndex>; 4]> =
                    Box::new([None, None, None, None]);
                let mut n_invalid = 0;
                aggregate = TileStatus::RenderedHighestQuality;

                for (i, &(ctx, cty)) in upscale_coords.iter().enumerate() {
                    // Border tiles may have no counterpart in the finer
                    // level's rounded bounds.
                    if ctx < finer_rounded.x1
                        || ctx >= finer_rounded.x2
                        || cty < finer_rounded.y1
                        || cty >= finer_rounded.y2
                    {
                        n_invalid += 1;
                        continue;
                    }

                    let mut child = TileCacheIndex::leaf(-1, -1);
                    let (child_outcome, child_status) = lookup_recursive(
                        p,
                        scratch,
                        level - 1,
                        TileCoord::new(ctx, cty),
                        &mut child,
                    )?;
                    children[i] = Some(child);

                    match child_outcome {
                        LookupOutcome::NeedWriteLock => {
                            return Ok((LookupOutcome::NeedWriteLock, TileStatus::NotRendered))
                        }
                        LookupOutcome::Updated => outcome = LookupOutcome::Updated,
                        LookupOutcome::UpToDate => {}
                    }

                    match child_status {
                        TileStatus::NotRendered => aggregate = TileStatus::NotRendered,
                        TileStatus::Pending => {
                            if aggregate != TileStatus::NotRendered {
                                aggregate = TileStatus::Pending;
                            }
                        }
                        TileStatus::RenderedLowQuality => {
                            if aggregate == TileStatus::RenderedHighestQuality {
                                aggregate = TileStatus::RenderedLowQuality;
                            }
                        }
                        TileStatus::RenderedHighestQuality => {}
                    }
                    if aggregate == TileStatus::NotRendered {
                        // No point visiting (and speculatively claiming)
                        // the remaining children.
                        break;
                    }
                }

                // With enough rounding slack between level RoDs, a tile may
                // have no ancestor at all.
                if n_invalid == 4 {
                    aggregate = TileStatus::NotRendered;
                }
                debug_assert!(
                    aggregate == TileStatus::NotRendered
                        || n_invalid == 0
                        || n_invalid == 2
                        || n_invalid == 3
                );
                node.upscale = Some(children);
            }

            match aggregate {
                TileStatus::Pending => {
                    // Some finer tile is being produced elsewhere; undo any
                    // claims taken on its siblings and wait.
                    if let Some(children) = node.upscale.take() {
                        for child in children.iter().flatten() {
                            remove_from_marked(scratch, p, level - 1, child);
                        }
                        node.upscale = Some(children);
                    }
                    if at_target {
                        if let Some(local) = scratch.local_state.tile_at_mut(coord.tx, coord.ty) {
                            local.status = TileStatus::Pending;
                        }
                        *scratch.has_pending = true;
                    }
                    trace!(
                        tx = coord.tx,
                        ty = coord.ty,
                        level,
                        "tile pending through a finer level"
                    );
                    Ok((outcome, TileStatus::Pending))
                }
                TileStatus::RenderedHighestQuality | TileStatus::RenderedLowQuality => {
                    // All finer tiles are rendered: reconstruct by
                    // downscaling. Claiming the cache tile needs the
                    // writer lock.
                    debug_assert!(node.upscale.is_some());
                    if !p.has_exclusive_lock {
                        return Ok((LookupOutcome::NeedWriteLock, TileStatus::NotRendered));
                    }

                    let session = p.store.current_process_uuid();
                    node.low_quality = aggregate == TileStatus::RenderedLowQuality;

                    if at_target {
                        if let Some(local) = scratch.local_state.tile_at_mut(coord.tx, coord.ty) {
                            // Flips to rendered once the downscale ran.
                            local.status = TileStatus::NotRendered;
                            local.uuid = session;
                        }
                        // Only the requested level goes in the downscale
                        // list; the task builder walks the finer levels
                        // through the node itself.
                        scratch.tiles_to_downscale.push(node.clone());
                    }

                    scratch.set_cache_tile(p, level, coord, |tile| {
                        tile.status = TileStatus::Pending;
                        tile.uuid = session;
                    });
                    scratch.marked[level].insert(coord);
                    trace!(
                        tx = coord.tx,
                        ty = coord.ty,
                        level,
                        "claimed tile for downscale reconstruction"
                    );
                    Ok((LookupOutcome::Updated, aggregate))
                }
                TileStatus::NotRendered => {
                    if let Some(children) = node.upscale.take() {
                        for child in children.iter().flatten() {
                            remove_from_marked(scratch, p, level - 1, child);
                        }
                        node.upscale = Some(children);
                    }

                    if at_target {
                        // Claim the tile for this render. Finer levels stay
                        // unclaimed: the coarse tile is rendered directly.
                        if !p.has_exclusive_lock {
                            return Ok((LookupOutcome::NeedWriteLock, TileStatus::NotRendered));
                        }
                        let session = p.store.current_process_uuid();
                        if let Some(local) = scratch.local_state.tile_at_mut(coord.tx, coord.ty) {
                            local.status = TileStatus::NotRendered;
                            local.uuid = session;
                        }
                        scratch.set_cache_tile(p, level, coord, |tile| {
                            tile.status = TileStatus::Pending;
                            tile.uuid = session;
                        });
                        scratch.marked[level].insert(coord);
                        trace!(tx = coord.tx, ty = coord.ty, level, "claimed tile for render");
                        outcome = LookupOutcome::Updated;
                    }
                    Ok((outcome, TileStatus::NotRendered))
                }
            }
        }
    }
}

/// Collect, in production order, the storage indices to fetch and the tile
/// hashes to allocate for one lookup node. The task builder consumes the
/// store's result arrays in exactly this order.
pub(crate) fn gather_tile_indices(
    node: &TileCacheIndex,
    level: usize,
    n_comps: usize,
    entry_hash: u64,
    indices_to_fetch: &mut Vec<TileInternalIndex>,
    to_allocate: &mut Vec<crate::tile_state::TileHash>,
) {
    if let Some(children) = &node.upscale {
        // One fresh tile per channel for the reconstruction output.
        for c in 0..n_comps {
            to_allocate.push(crate::store::tile_hash(
                node.tx,
                node.ty,
                level as u32,
                c,
                entry_hash,
            ));
        }
        for child in children.iter().flatten() {
            // A child left with an invalid coordinate contributes nothing.
            if child.tx == -1 {
                continue;
            }
            gather_tile_indices(child, level - 1, n_comps, entry_hash, indices_to_fetch, to_allocate);
        }
    } else {
        for c in 0..n_comps {
            indices_to_fetch.push(node.per_channel[c]);
        }
    }
}
