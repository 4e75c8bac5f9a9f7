//! Shared builders for the unit tests.

use std::sync::Arc;

use crate::effect::RenderFlag;
use crate::entry::{CacheAccessMode, ImageCacheEntry, ImageCacheKey};
use crate::entry_cache::EntryCache;
use crate::rect::RectI;
use crate::storage::{BitDepth, ImageBufferLayout, PixelBuffer};
use crate::store::MemoryTileStore;

/// A store plus an entry registry, the two collaborators every cache
/// entry is built against.
pub(crate) struct CacheRig {
    pub store: Arc<MemoryTileStore>,
    pub registry: Arc<EntryCache>,
}

impl CacheRig {
    pub fn new(persistent: bool) -> Self {
        Self {
            store: Arc::new(MemoryTileStore::new(persistent)),
            registry: EntryCache::new(128),
        }
    }
}

pub(crate) fn test_key(seed: u64) -> ImageCacheKey {
    ImageCacheKey {
        node_hash: seed,
        layer_id: "Color.RGBA".to_owned(),
        proxy_scale: (1.0, 1.0),
        plugin_id: "net.sf.openfx.MergePlugin".to_owned(),
    }
}

/// Single-component float entry over `rod0`, with the per-level RoDs
/// derived by halving. Returns the entry and its channel buffer.
#[allow(clippy::too_many_arguments)]
pub(crate) fn make_entry(
    store: &Arc<MemoryTileStore>,
    registry: &Arc<EntryCache>,
    effect: &Arc<RenderFlag>,
    seed: u64,
    rod0: RectI,
    level: usize,
    roi: RectI,
    draft: bool,
    policy: CacheAccessMode,
) -> (ImageCacheEntry, PixelBuffer) {
    let rods: Vec<RectI> = (0..=level).map(|i| rod0.downscaled_pow2(i as u32)).collect();
    let buffer = PixelBuffer::new();
    let entry = ImageCacheEntry::new(
        Arc::clone(store) as Arc<dyn crate::store::TileStore>,
        Arc::clone(registry),
        test_key(seed),
        rods,
        roi,
        level,
        draft,
        BitDepth::Float,
        1,
        [Some(buffer.clone()), None, None, None],
        ImageBufferLayout::MonoChannel,
        Arc::clone(effect) as Arc<dyn crate::effect::RenderEffect>,
        policy,
    );
    (entry, buffer)
}

/// Fill `rect` of a single-component float plane covering `plane_bounds`.
pub(crate) fn fill_rect_f32(buffer: &PixelBuffer, plane_bounds: RectI, rect: RectI, value: f32) {
    buffer.ensure_allocated(plane_bounds.area() as usize * 4);
    let mut guard = buffer.write();
    let ptr = guard.as_mut_ptr() as *mut f32;
    for y in rect.y1..rect.y2 {
        for x in rect.x1..rect.x2 {
            let i = ((y - plane_bounds.y1) * plane_bounds.width() + (x - plane_bounds.x1)) as usize;
            unsafe { *ptr.add(i) = value };
        }
    }
}

pub(crate) fn read_f32(buffer: &PixelBuffer, plane_bounds: RectI, x: i32, y: i32) -> f32 {
    let guard = buffer.read();
    let ptr = guard.as_ptr() as *const f32;
    let i = ((y - plane_bounds.y1) * plane_bounds.width() + (x - plane_bounds.x1)) as usize;
    unsafe { *ptr.add(i) }
}
