//! Integer pixel rectangles.

use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in pixel coordinates, half-open on the right and
/// top: a pixel (x, y) is inside iff `x1 <= x < x2` and `y1 <= y < y2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RectI {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

fn floor_to_multiple(v: i32, step: i32) -> i32 {
    v.div_euclid(step) * step
}

fn ceil_to_multiple(v: i32, step: i32) -> i32 {
    -((-v).div_euclid(step)) * step
}

impl RectI {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    /// Number of pixels covered.
    pub fn area(&self) -> i64 {
        if self.is_null() {
            0
        } else {
            self.width() as i64 * self.height() as i64
        }
    }

    pub fn is_null(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }

    pub fn contains(&self, other: &RectI) -> bool {
        other.x1 >= self.x1 && other.y1 >= self.y1 && other.x2 <= self.x2 && other.y2 <= self.y2
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.x1 && x < self.x2 && y >= self.y1 && y < self.y2
    }

    /// Intersection with `other`. Returns a null rect when disjoint.
    pub fn intersection(&self, other: &RectI) -> RectI {
        let r = RectI {
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
            x2: self.x2.min(other.x2),
            y2: self.y2.min(other.y2),
        };
        if r.is_null() {
            RectI::default()
        } else {
            r
        }
    }

    /// Smallest rectangle containing both `self` and `other`.
    pub fn union(&self, other: &RectI) -> RectI {
        if self.is_null() {
            return *other;
        }
        if other.is_null() {
            return *self;
        }
        RectI {
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
            x2: self.x2.max(other.x2),
            y2: self.y2.max(other.y2),
        }
    }

    /// Enlarge outward so that x1/y1 are floored and x2/y2 are ceiled to
    /// multiples of the tile size. Correct for negative coordinates.
    pub fn rounded_to_tile_size(&self, tile_size_x: i32, tile_size_y: i32) -> RectI {
        debug_assert!(tile_size_x > 0 && tile_size_y > 0);
        RectI {
            x1: floor_to_multiple(self.x1, tile_size_x),
            y1: floor_to_multiple(self.y1, tile_size_y),
            x2: ceil_to_multiple(self.x2, tile_size_x),
            y2: ceil_to_multiple(self.y2, tile_size_y),
        }
    }

    /// The rectangle covering this one at a mipmap level `level` below
    /// (each level halves the linear resolution).
    pub fn downscaled_pow2(&self, level: u32) -> RectI {
        let step = 1i32 << level;
        RectI {
            x1: self.x1.div_euclid(step),
            y1: self.y1.div_euclid(step),
            x2: -((-self.x2).div_euclid(step)),
            y2: -((-self.y2).div_euclid(step)),
        }
    }

    /// The rectangle covering this one `level` mipmap levels above.
    pub fn upscaled_pow2(&self, level: u32) -> RectI {
        RectI {
            x1: self.x1 << level,
            y1: self.y1 << level,
            x2: self.x2 << level,
            y2: self.y2 << level,
        }
    }
}
