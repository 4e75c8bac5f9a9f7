//! Per-level tile state matrices.
//!
//! Each mipmap level of a cached image plane is described by a row-major
//! vector of tile records. Tiles are ordered by y then x: the first tile's
//! bottom-left corner is the bottom-left corner of the rounded bounds, the
//! last tile's top-right corner the top-right corner.

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::rect::RectI;

/// Render status of one tile. Shared across all channels of the plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileStatus {
    /// The tile is not rendered.
    NotRendered,
    /// The tile is being produced by some thread or process.
    Pending,
    /// Rendered, but by a draft-mode pass.
    RenderedLowQuality,
    /// Rendered at the highest quality possible.
    RenderedHighestQuality,
}

impl TileStatus {
    /// Stable wire encoding used in the shared segment.
    pub fn to_i32(self) -> i32 {
        match self {
            TileStatus::NotRendered => 0,
            TileStatus::Pending => 1,
            TileStatus::RenderedLowQuality => 2,
            TileStatus::RenderedHighestQuality => 3,
        }
    }

    pub fn from_i32(v: i32) -> Option<TileStatus> {
        match v {
            0 => Some(TileStatus::NotRendered),
            1 => Some(TileStatus::Pending),
            2 => Some(TileStatus::RenderedLowQuality),
            3 => Some(TileStatus::RenderedHighestQuality),
            _ => None,
        }
    }

    pub fn is_rendered(self) -> bool {
        matches!(
            self,
            TileStatus::RenderedLowQuality | TileStatus::RenderedHighestQuality
        )
    }
}

/// Bottom-left corner of a tile, aligned to the tile grid.
///
/// Field order gives the derived ordering: by `ty`, then `tx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileCoord {
    pub ty: i32,
    pub tx: i32,
}

impl TileCoord {
    pub fn new(tx: i32, ty: i32) -> Self {
        Self { ty, tx }
    }
}

/// Set of tile coordinates, iterated in row-major order.
pub type TileCoordSet = BTreeSet<TileCoord>;

/// Opaque index of one tile slot in the tile store. The internal layout
/// (file index, intra-file slot) is private to the store; the cache entry
/// only stores and echoes these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileInternalIndex(pub u64);

impl TileInternalIndex {
    /// Sentinel for channels that hold no storage.
    pub const INVALID: TileInternalIndex = TileInternalIndex(u64::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Store-facing identity of one (tile, channel) slot, stable across
/// processes sharing the same cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileHash(pub u64);

/// State of one tile at one mipmap level.
#[derive(Debug, Clone, PartialEq)]
pub struct TileState {
    /// Pixel bounds covered by this tile, clipped to the level's RoD; not
    /// necessarily a full tile on the border.
    pub bounds: RectI,
    pub status: TileStatus,
    /// One storage index per channel; unused channels keep the sentinel.
    pub channels_storage: [TileInternalIndex; 4],
    /// Owner of a `Pending` tile, used to detect abandonment.
    pub uuid: Uuid,
}

impl Default for TileState {
    fn default() -> Self {
        Self {
            bounds: RectI::default(),
            status: TileStatus::NotRendered,
            channels_storage: [TileInternalIndex::INVALID; 4],
            uuid: Uuid::nil(),
        }
    }
}

/// Tile states of one mipmap level. An empty `tiles` vector is the
/// uninitialized state; the first reader initializes it under an exclusive
/// lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TilesState {
    pub bounds: RectI,
    pub bounds_rounded: RectI,
    pub tiles: Vec<TileState>,
}

impl TilesState {
    /// Build an initialized matrix covering `bounds`, all tiles
    /// `NotRendered`, each tile's bounds clipped to `bounds`.
    pub fn with_bounds(tile_size_x: i32, tile_size_y: i32, bounds: RectI) -> Self {
        let bounds_rounded = bounds.rounded_to_tile_size(tile_size_x, tile_size_y);
        let cols = (bounds_rounded.width() / tile_size_x) as usize;
        let rows = (bounds_rounded.height() / tile_size_y) as usize;
        let mut tiles = vec![TileState::default(); cols * rows];

        let mut i = 0;
        let mut ty = bounds_rounded.y1;
        while ty < bounds_rounded.y2 {
            let mut tx = bounds_rounded.x1;
            while tx < bounds_rounded.x2 {
                tiles[i].bounds = RectI {
                    x1: tx.max(bounds.x1),
                    y1: ty.max(bounds.y1),
                    x2: (tx + tile_size_x).min(bounds.x2),
                    y2: (ty + tile_size_y).min(bounds.y2),
                };
                i += 1;
                tx += tile_size_x;
            }
            ty += tile_size_y;
        }

        Self { bounds, bounds_rounded, tiles }
    }

    pub fn is_initialized(&self) -> bool {
        !self.tiles.is_empty()
    }

    /// Number of tiles the rounded bounds require.
    pub fn expected_tile_count(&self, tile_size_x: i32, tile_size_y: i32) -> usize {
        ((self.bounds_rounded.width() / tile_size_x)
            * (self.bounds_rounded.height() / tile_size_y)) as usize
    }

    fn index_of(&self, tile_size_x: i32, tile_size_y: i32, tx: i32, ty: i32) -> Option<usize> {
        debug_assert!(tx % tile_size_x == 0 && ty % tile_size_y == 0);
        let r = &self.bounds_rounded;
        if tx < r.x1 || tx > r.x2 - tile_size_x || ty < r.y1 || ty > r.y2 - tile_size_y {
            return None;
        }
        let cols = (r.width() / tile_size_x) as usize;
        let col = ((tx - r.x1) / tile_size_x) as usize;
        let row = ((ty - r.y1) / tile_size_y) as usize;
        let index = row * cols + col;
        if index < self.tiles.len() {
            Some(index)
        } else {
            None
        }
    }

    pub fn tile_at(&self, tile_size_x: i32, tile_size_y: i32, tx: i32, ty: i32) -> Option<&TileState> {
        self.index_of(tile_size_x, tile_size_y, tx, ty)
            .map(|i| &self.tiles[i])
    }

    pub fn tile_at_mut(
        &mut self,
        tile_size_x: i32,
        tile_size_y: i32,
        tx: i32,
        ty: i32,
    ) -> Option<&mut TileState> {
        self.index_of(tile_size_x, tile_size_y, tx, ty)
            .map(move |i| &mut self.tiles[i])
    }

    /// Rebuild the matrix over `new_rod`, keeping the state of every tile
    /// whose clipped bounds did not change. Border tiles whose clipping
    /// changed reset to `NotRendered`.
    pub fn grow_to(&mut self, tile_size_x: i32, tile_size_y: i32, new_rod: RectI) {
        if new_rod == self.bounds {
            return;
        }
        let mut grown = TilesState::with_bounds(tile_size_x, tile_size_y, new_rod);
        let mut ty = grown.bounds_rounded.y1;
        while ty < grown.bounds_rounded.y2 {
            let mut tx = grown.bounds_rounded.x1;
            while tx < grown.bounds_rounded.x2 {
                if let Some(old) = self.tile_at(tile_size_x, tile_size_y, tx, ty).cloned() {
                    if let Some(new) = grown.tile_at_mut(tile_size_x, tile_size_y, tx, ty) {
                        if old.bounds == new.bounds {
                            *new = old;
                        }
                    }
                }
                tx += tile_size_x;
            }
            ty += tile_size_y;
        }
        *self = grown;
    }
}

/// Owning view over a level state together with the tile size used to
/// index it.
#[derive(Debug, Clone, Default)]
pub struct TileStateHeader {
    pub tile_size_x: i32,
    pub tile_size_y: i32,
    pub state: TilesState,
}

impl TileStateHeader {
    pub fn new(tile_size_x: i32, tile_size_y: i32, state: TilesState) -> Self {
        debug_assert!(
            state.tiles.is_empty()
                || state.tiles.len() == state.expected_tile_count(tile_size_x, tile_size_y)
        );
        Self { tile_size_x, tile_size_y, state }
    }

    /// Reset to an initialized map with unrendered tiles over `bounds`.
    pub fn init(&mut self, tile_size_x: i32, tile_size_y: i32, bounds: RectI) {
        self.tile_size_x = tile_size_x;
        self.tile_size_y = tile_size_y;
        self.state = TilesState::with_bounds(tile_size_x, tile_size_y, bounds);
    }

    pub fn tile_at(&self, tx: i32, ty: i32) -> Option<&TileState> {
        self.state.tile_at(self.tile_size_x, self.tile_size_y, tx, ty)
    }

    pub fn tile_at_mut(&mut self, tx: i32, ty: i32) -> Option<&mut TileState> {
        self.state
            .tile_at_mut(self.tile_size_x, self.tile_size_y, tx, ty)
    }
}

fn assert_roi_aligned(roi: &RectI, header: &TileStateHeader) {
    // The roi must be rounded to the tile size, except where it coincides
    // with the edge of the pixel RoD.
    let b = &header.state.bounds;
    debug_assert!(roi.x1 % header.tile_size_x == 0 || roi.x1 == b.x1);
    debug_assert!(roi.y1 % header.tile_size_y == 0 || roi.y1 == b.y1);
    debug_assert!(roi.x2 % header.tile_size_x == 0 || roi.x2 == b.x2);
    debug_assert!(roi.y2 % header.tile_size_y == 0 || roi.y2 == b.y2);
}

/// Bounding box of the unrendered portion of `roi`.
///
/// Tiles with a `Pending` status are treated as if they were rendered:
/// somebody is already producing them.
pub fn minimal_bbox_to_render(roi: &RectI, header: &TileStateHeader) -> RectI {
    if !header.state.is_initialized() {
        return RectI::default();
    }
    debug_assert!(header.state.bounds_rounded.contains(roi));
    assert_roi_aligned(roi, header);

    let tsx = header.tile_size_x;
    let tsy = header.tile_size_y;
    let mut bbox = roi.rounded_to_tile_size(tsx, tsy);

    let row_has_unrendered = |y: i32, x1: i32, x2: i32| -> bool {
        let mut x = x1;
        while x < x2 {
            if header.tile_at(x, y).map(|t| t.status) == Some(TileStatus::NotRendered) {
                return true;
            }
            x += tsx;
        }
        false
    };
    let col_has_unrendered = |x: i32, y1: i32, y2: i32| -> bool {
        let mut y = y1;
        while y < y2 {
            if header.tile_at(x, y).map(|t| t.status) == Some(TileStatus::NotRendered) {
                return true;
            }
            y += tsy;
        }
        false
    };

    // Shrink from the bottom, then the top.
    while bbox.y1 < bbox.y2 && !row_has_unrendered(bbox.y1, bbox.x1, bbox.x2) {
        bbox.y1 += tsy;
    }
    while bbox.y2 > bbox.y1 && !row_has_unrendered(bbox.y2 - tsy, bbox.x1, bbox.x2) {
        bbox.y2 -= tsy;
    }
    if bbox.is_null() {
        return RectI::default();
    }

    // Then from the left and the right.
    while bbox.x1 < bbox.x2 && !col_has_unrendered(bbox.x1, bbox.y1, bbox.y2) {
        bbox.x1 += tsx;
    }
    while bbox.x2 > bbox.x1 && !col_has_unrendered(bbox.x2 - tsx, bbox.y1, bbox.y2) {
        bbox.x2 -= tsx;
    }
    if bbox.is_null() {
        return RectI::default();
    }

    // The tiles are rounded to tile size, clip back to the pixel bounds.
    bbox.intersection(&header.state.bounds)
}

/// The four rectangles forming the frame between `inner` and `outer`:
///
/// ```text
/// AAAAAAAAAAAAAAAAAAAAAAAAAAAA
/// AAAAAAAAAAAAAAAAAAAAAAAAAAAA
/// DDDDDXXXXXXXXXXXXXXXXXXBBBBB
/// DDDDDXXXXXXXXXXXXXXXXXXBBBBB
/// CCCCCCCCCCCCCCCCCCCCCCCCCCCC
/// CCCCCCCCCCCCCCCCCCCCCCCCCCCC
/// ```
pub fn abcd_rectangles(inner: &RectI, outer: &RectI) -> [RectI; 4] {
    let a = RectI::new(outer.x1, inner.y2, outer.x2, outer.y2);
    let b = RectI::new(inner.x2, inner.y1, outer.x2, inner.y2);
    let c = RectI::new(outer.x1, outer.y1, outer.x2, inner.y1);
    let d = RectI::new(outer.x1, inner.y1, inner.x1, inner.y2);
    [a, b, c, d]
}

/// Refine the unrendered portion of `roi` into a few rectangles: border
/// strips peeled off the minimal bounding box plus the refined core. This
/// keeps the render work tight when panning or zooming out, where the
/// already-rendered region sits in the middle of the requested one.
pub fn minimal_rects_to_render(roi: &RectI, header: &TileStateHeader) -> Vec<RectI> {
    let mut rects = Vec::new();
    if !header.state.is_initialized() {
        return rects;
    }
    assert_roi_aligned(roi, header);

    let bbox_m = minimal_bbox_to_render(roi, header);
    if bbox_m.is_null() {
        return rects;
    }

    let tsx = header.tile_size_x;
    let tsy = header.tile_size_y;
    // The tile states are only valid on the tile grid.
    let mut bbox_x = bbox_m.rounded_to_tile_size(tsx, tsy);

    let row_fully_unrendered = |y: i32, x1: i32, x2: i32| -> bool {
        let mut x = x1;
        while x < x2 {
            if header.tile_at(x, y).map(|t| t.status) != Some(TileStatus::NotRendered) {
                return false;
            }
            x += tsx;
        }
        true
    };
    let col_fully_unrendered = |x: i32, y1: i32, y2: i32| -> bool {
        let mut y = y1;
        while y < y2 {
            if header.tile_at(x, y).map(|t| t.status) != Some(TileStatus::NotRendered) {
                return false;
            }
            y += tsy;
        }
        true
    };

    let mut push_clipped = |r: RectI| {
        if !r.is_null() {
            let clipped = r.intersection(&header.state.bounds);
            if !clipped.is_null() {
                rects.push(clipped);
            }
        }
    };

    // Fully-unrendered strip at the bottom.
    let mut a = bbox_x;
    a.y2 = a.y1;
    while bbox_x.y1 < bbox_x.y2 && row_fully_unrendered(bbox_x.y1, bbox_x.x1, bbox_x.x2) {
        bbox_x.y1 += tsy;
        a.y2 = bbox_x.y1;
    }
    push_clipped(a);

    // Fully-unrendered strip at the top.
    let mut b = bbox_x;
    b.y1 = b.y2;
    while bbox_x.y2 > bbox_x.y1 && row_fully_unrendered(bbox_x.y2 - tsy, bbox_x.x1, bbox_x.x2) {
        bbox_x.y2 -= tsy;
        b.y1 = bbox_x.y2;
    }
    push_clipped(b);

    // Left strip of what remains.
    let mut c = bbox_x;
    c.x2 = c.x1;
    if bbox_x.y1 < bbox_x.y2 {
        while bbox_x.x1 < bbox_x.x2 && col_fully_unrendered(bbox_x.x1, bbox_x.y1, bbox_x.y2) {
            bbox_x.x1 += tsx;
            c.x2 = bbox_x.x1;
        }
    }
    push_clipped(c);

    // Right strip.
    let mut d = bbox_x;
    d.x1 = d.x2;
    if bbox_x.y1 < bbox_x.y2 {
        while bbox_x.x2 > bbox_x.x1 && col_fully_unrendered(bbox_x.x2 - tsx, bbox_x.y1, bbox_x.y2) {
            bbox_x.x2 -= tsx;
            d.x1 = bbox_x.x2;
        }
    }
    push_clipped(d);

    // The core still mixes rendered and unrendered tiles; refine it.
    if !bbox_x.is_null() {
        let clipped = bbox_x.intersection(&header.state.bounds);
        if !clipped.is_null() {
            let core = minimal_bbox_to_render(&clipped, header);
            if !core.is_null() {
                rects.push(core);
            }
        }
    }

    rects
}
