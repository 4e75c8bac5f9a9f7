//! mipcache - Cooperative mipmapped tile cache for a compositing renderer.
//!
//! This crate provides:
//! - Per-image cache entries that let many render threads (and processes)
//!   compute each pixel tile at most once
//! - Mipmap pyramid lookup with reconstruction of coarse tiles by
//!   averaging finer ones
//! - Parallel tile transfer and downscale with rayon
//! - An IPC property-map representation of the per-level tile state for
//!   persistent, cross-process caches

mod effect;
mod entry;
mod entry_cache;
mod error;
mod ipc;
mod pyramid;
mod rect;
mod storage;
mod store;
mod tile_state;
mod transfer;
#[cfg(test)]
pub(crate) mod test_utils;

pub use effect::{RenderEffect, RenderFlag};
pub use entry::{CacheAccessMode, ImageCacheEntry, ImageCacheKey, TilesRenderState};
pub use entry_cache::{
    EntryCache, EntryLocker, EntryStatus, InMemoryEntryState, PersistentEntryState,
    SharedCacheEntry,
};
pub use error::{CacheError, CacheResult};
pub use ipc::{IpcProperty, IpcPropertyMap, IpcValueType, SegmentStorage, DEFAULT_SEGMENT_CAPACITY};
pub use rect::RectI;
pub use storage::{AlignedBuf, BitDepth, ImageBufferLayout, PixelBuffer};
pub use store::{
    tile_hash, tile_size_for_depth, MemoryTileStore, StoreStats, TileBuffer, TileLock, TileStore,
    TILE_SLOT_BYTES,
};
pub use tile_state::{
    abcd_rectangles, minimal_bbox_to_render, minimal_rects_to_render, TileCoord, TileCoordSet,
    TileHash, TileInternalIndex, TileState, TileStateHeader, TileStatus, TilesState,
};
