//! Pixel transfer between the tile store and the local image buffers.
//!
//! Two bulk-parallel phases run here: reconstructing coarse tiles by
//! averaging 2x2 blocks of finer tiles, and copying tiles in or out of the
//! per-render buffers. Tasks are fanned out over rayon; every (tile,
//! channel) pair is touched by exactly one task, which is what makes the
//! raw-pointer writes into the shared local planes sound.

use std::sync::Arc;

use rayon::prelude::*;

use crate::effect::RenderEffect;
use crate::error::{CacheError, CacheResult};
use crate::rect::RectI;
use crate::storage::{BitDepth, ImageBufferLayout, PixelBuffer};
use crate::store::TileBuffer;
use crate::tile_state::TileInternalIndex;

/// One tile-channel transfer: the pinned store buffer, its slot index, the
/// clipped pixel bounds and the channel it belongs to.
pub(crate) struct TileTask {
    pub buffer: TileBuffer,
    pub index: TileInternalIndex,
    pub bounds: RectI,
    pub channel: usize,
}

/// Reconstruction of one coarse tile-channel from up to four finer ones.
/// Absent sources are quadrants outside the finer level's bounds.
pub(crate) struct DownscaleTask {
    pub target: Arc<TileTask>,
    pub src: [Option<Arc<TileTask>>; 4],
    pub low_quality: bool,
}

/// Sample conversion used by the averaging kernel.
pub(crate) trait Pixel: Copy + Send + Sync + 'static {
    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;
}

impl Pixel for u8 {
    fn to_f32(self) -> f32 {
        self as f32
    }
    fn from_f32(v: f32) -> Self {
        v.round().clamp(0.0, 255.0) as u8
    }
}

impl Pixel for u16 {
    fn to_f32(self) -> f32 {
        self as f32
    }
    fn from_f32(v: f32) -> Self {
        v.round().clamp(0.0, 65535.0) as u16
    }
}

impl Pixel for f32 {
    fn to_f32(self) -> f32 {
        self
    }
    fn from_f32(v: f32) -> Self {
        v
    }
}

/// Raw plane base shared across rayon workers. Soundness rests on the
/// task partition: no two tasks address the same (tile, channel) elements.
#[derive(Clone, Copy)]
struct PlanePtr(*mut u8);

unsafe impl Send for PlanePtr {}
unsafe impl Sync for PlanePtr {}

/// Copy `window` between two strided planes.
///
/// Each plane is addressed as `base[((y - y1) * width + (x - x1)) * stride]`
/// over its own bounds.
///
/// # Safety
/// Both planes must cover `window` and stay allocated for the call.
unsafe fn copy_plane<T: Copy>(
    window: RectI,
    src: *const T,
    src_bounds: RectI,
    src_stride: usize,
    dst: *mut T,
    dst_bounds: RectI,
    dst_stride: usize,
) {
    let src_row = src_bounds.width() as usize * src_stride;
    let dst_row = dst_bounds.width() as usize * dst_stride;
    for y in window.y1..window.y2 {
        let src_line = src.add((y - src_bounds.y1) as usize * src_row);
        let dst_line = dst.add((y - dst_bounds.y1) as usize * dst_row);
        let mut si = (window.x1 - src_bounds.x1) as usize * src_stride;
        let mut di = (window.x1 - dst_bounds.x1) as usize * dst_stride;
        for _ in window.x1..window.x2 {
            *dst_line.add(di) = *src_line.add(si);
            si += src_stride;
            di += dst_stride;
        }
    }
}

/// Fill the area of a tile outside its clipped `bounds` by repeating the
/// border pixels, so neighbors sampling past the edge see sensible values.
///
/// # Safety
/// `tile` must point at a full `tsx * tsy` plane whose origin is the
/// tile-size-rounded corner of `bounds`.
unsafe fn repeat_edges<T: Copy>(tile: *mut T, bounds: RectI, tsx: i32, tsy: i32) {
    let rounded = bounds.rounded_to_tile_size(tsx, tsy);
    let vx1 = bounds.x1 - rounded.x1;
    let vy1 = bounds.y1 - rounded.y1;
    let vx2 = bounds.x2 - rounded.x1;
    let vy2 = bounds.y2 - rounded.y1;
    for y in 0..tsy {
        let sy = y.clamp(vy1, vy2 - 1);
        for x in 0..tsx {
            let sx = x.clamp(vx1, vx2 - 1);
            if sx != x || sy != y {
                *tile.add((y * tsx + x) as usize) = *tile.add((sy * tsx + sx) as usize);
            }
        }
    }
}

/// Average 2x2 blocks of the four finer tiles into `dst`.
///
/// The four sources tile the doubled rect anchored at twice the target's
/// grid origin, in the order bottom-left, bottom-right, top-left,
/// top-right. Samples falling in an absent quadrant are dropped from the
/// average (numerator and denominator both).
///
/// # Safety
/// `dst` must point at a full `tsx * tsy` plane; each present source at a
/// full plane of the same size.
unsafe fn downscale_tile<T: Pixel>(
    src: [Option<*const T>; 4],
    dst: *mut T,
    dst_bounds: RectI,
    tsx: i32,
    tsy: i32,
) {
    let rounded = dst_bounds.rounded_to_tile_size(tsx, tsy);
    for y in dst_bounds.y1..dst_bounds.y2 {
        for x in dst_bounds.x1..dst_bounds.x2 {
            // Position in the 2x2 source mosaic.
            let sx = 2 * (x - rounded.x1);
            let sy = 2 * (y - rounded.y1);
            let mut sum = 0.0f32;
            let mut count = 0u32;
            for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                let px = sx + dx;
                let py = sy + dy;
                let q = ((py >= tsy) as usize) * 2 + (px >= tsx) as usize;
                let Some(tile) = src[q] else { continue };
                let ox = px - (px >= tsx) as i32 * tsx;
                let oy = py - (py >= tsy) as i32 * tsy;
                sum += (*tile.add((oy * tsx + ox) as usize)).to_f32();
                count += 1;
            }
            if count > 0 {
                *dst.add(((y - rounded.y1) * tsx + (x - rounded.x1)) as usize) =
                    T::from_f32(sum / count as f32);
            }
        }
    }
}

fn copy_one<T: Pixel>(
    to_cache: bool,
    task: &TileTask,
    local_base: PlanePtr,
    offset: usize,
    stride: usize,
    roi: RectI,
    tsx: i32,
    tsy: i32,
) {
    let tile_rounded = task.bounds.rounded_to_tile_size(tsx, tsy);
    if to_cache {
        // Copy full tiles, clipped to the roi; the roi never reaches
        // outside the tile's true bounds.
        let window = tile_rounded.intersection(&roi);
        if window.is_null() {
            return;
        }
        let mut guard = task.buffer.write();
        let tile_ptr = guard.as_mut_ptr() as *mut T;
        unsafe {
            copy_plane::<T>(
                window,
                (local_base.0 as *const T).add(offset),
                roi,
                stride,
                tile_ptr,
                tile_rounded,
                1,
            );
            if task.bounds.width() != tsx || task.bounds.height() != tsy {
                repeat_edges::<T>(tile_ptr, task.bounds, tsx, tsy);
            }
        }
    } else {
        let window = task.bounds.intersection(&roi);
        if window.is_null() {
            return;
        }
        let guard = task.buffer.read();
        let tile_ptr = guard.as_ptr() as *const T;
        unsafe {
            copy_plane::<T>(
                window,
                tile_ptr,
                tile_rounded,
                1,
                (local_base.0 as *mut T).add(offset),
                roi,
                stride,
            );
        }
    }
}

/// Parallel copy of tiles into (`to_cache`) or out of (`!to_cache`) the
/// local planes.
///
/// Copying out observes the abort flag per task; copying in never aborts,
/// because the tiles are already rendered and releasing their indices
/// would cost more than finishing the copy.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_copy_tasks(
    to_cache: bool,
    tasks: &[Arc<TileTask>],
    buffers: &[Option<PixelBuffer>; 4],
    layout: ImageBufferLayout,
    n_comps: usize,
    roi: RectI,
    depth: BitDepth,
    tile_size: (i32, i32),
    effect: &dyn RenderEffect,
) -> CacheResult<()> {
    if tasks.is_empty() {
        return Ok(());
    }
    let (tsx, tsy) = tile_size;

    // Pin the local planes for the whole fan-out; workers address them
    // through raw bases at disjoint (tile, channel) element sets.
    let mut write_guards = Vec::new();
    let mut read_guards = Vec::new();
    let mut bases = [PlanePtr(std::ptr::null_mut()); 4];
    for i in 0..layout.buffer_count(n_comps) {
        let buffer = buffers[i]
            .as_ref()
            .ok_or_else(|| CacheError::failed(format!("local buffer {i} not set")))?;
        if to_cache {
            let guard = buffer.read();
            bases[i] = PlanePtr(guard.as_ptr() as *mut u8);
            read_guards.push(guard);
        } else {
            let mut guard = buffer.write();
            bases[i] = PlanePtr(guard.as_mut_ptr());
            write_guards.push(guard);
        }
    }

    tasks.par_iter().try_for_each(|task| {
        if !to_cache && effect.is_render_aborted() {
            return Err(CacheError::Aborted);
        }
        let (buffer_i, offset, stride) = layout.channel_addressing(n_comps, task.channel);
        let base = bases[buffer_i];
        match depth {
            BitDepth::Byte => copy_one::<u8>(to_cache, task, base, offset, stride, roi, tsx, tsy),
            BitDepth::Short => copy_one::<u16>(to_cache, task, base, offset, stride, roi, tsx, tsy),
            BitDepth::Float => copy_one::<f32>(to_cache, task, base, offset, stride, roi, tsx, tsy),
        }
        Ok(())
    })
}

fn downscale_one<T: Pixel>(task: &DownscaleTask, tsx: i32, tsy: i32) {
    let guards: [Option<_>; 4] = std::array::from_fn(|i| task.src[i].as_ref().map(|s| s.buffer.read()));
    let ptrs: [Option<*const T>; 4] =
        std::array::from_fn(|i| guards[i].as_ref().map(|g| g.as_ptr() as *const T));
    let mut dst = task.target.buffer.write();
    unsafe {
        downscale_tile::<T>(ptrs, dst.as_mut_ptr() as *mut T, task.target.bounds, tsx, tsy);
    }
}

/// Parallel downscale of one mipmap level's reconstruction tasks. Runs to
/// completion even when the render aborts: the destination indices are
/// already allocated and the averaging is cheap.
pub(crate) fn run_downscale_tasks(tasks: &[Arc<DownscaleTask>], depth: BitDepth, tile_size: (i32, i32)) {
    let (tsx, tsy) = tile_size;
    tasks.par_iter().for_each(|task| match depth {
        BitDepth::Byte => downscale_one::<u8>(task, tsx, tsy),
        BitDepth::Short => downscale_one::<u16>(task, tsx, tsy),
        BitDepth::Float => downscale_one::<f32>(task, tsx, tsy),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::RenderFlag;

    const TS: i32 = 4;

    fn tile_of(values: &[f32]) -> TileBuffer {
        assert_eq!(values.len(), (TS * TS) as usize);
        let buffer = TileBuffer::zeroed((TS * TS) as usize * 4);
        {
            let mut guard = buffer.write();
            let ptr = guard.as_mut_ptr() as *mut f32;
            for (i, v) in values.iter().enumerate() {
                unsafe { *ptr.add(i) = *v };
            }
        }
        buffer
    }

    fn tile_values(buffer: &TileBuffer) -> Vec<f32> {
        let guard = buffer.read();
        let ptr = guard.as_ptr() as *const f32;
        (0..(TS * TS) as usize)
            .map(|i| unsafe { *ptr.add(i) })
            .collect()
    }

    #[test]
    fn test_copy_round_trip_packed() {
        // Two interleaved components over a 4x4 roi, one full tile.
        let roi = RectI::new(0, 0, TS, TS);
        let n = (TS * TS) as usize;
        let local = PixelBuffer::with_len(n * 2 * 4);
        {
            let mut guard = local.write();
            let ptr = guard.as_mut_ptr() as *mut f32;
            for i in 0..n {
                unsafe {
                    *ptr.add(i * 2) = i as f32;
                    *ptr.add(i * 2 + 1) = 100.0 + i as f32;
                }
            }
        }
        let buffers = [Some(local), None, None, None];
        let effect = RenderFlag::new("copy");

        let tiles: Vec<Arc<TileTask>> = (0..2)
            .map(|c| {
                Arc::new(TileTask {
                    buffer: TileBuffer::zeroed(n * 4),
                    index: TileInternalIndex(c as u64 + 1),
                    bounds: roi,
                    channel: c,
                })
            })
            .collect();

        run_copy_tasks(
            true,
            &tiles,
            &buffers,
            ImageBufferLayout::PackedInterleaved,
            2,
            roi,
            BitDepth::Float,
            (TS, TS),
            &effect,
        )
        .unwrap();

        assert_eq!(tile_values(&tiles[0].buffer)[5], 5.0);
        assert_eq!(tile_values(&tiles[1].buffer)[5], 105.0);

        // Copy back into a fresh local buffer and compare.
        let back = PixelBuffer::with_len(n * 2 * 4);
        let buffers = [Some(back.clone()), None, None, None];
        run_copy_tasks(
            false,
            &tiles,
            &buffers,
            ImageBufferLayout::PackedInterleaved,
            2,
            roi,
            BitDepth::Float,
            (TS, TS),
            &effect,
        )
        .unwrap();
        let guard = back.read();
        let ptr = guard.as_ptr() as *const f32;
        for i in 0..n {
            unsafe {
                assert_eq!(*ptr.add(i * 2), i as f32);
                assert_eq!(*ptr.add(i * 2 + 1), 100.0 + i as f32);
            }
        }
    }

    #[test]
    fn test_copy_to_cache_repeats_edges() {
        // A border tile covering only the bottom-left 2x2 of the tile grid.
        let bounds = RectI::new(0, 0, 2, 2);
        let roi = bounds;
        let n = (TS * TS) as usize;
        let local = PixelBuffer::with_len(4 * 4);
        {
            let mut guard = local.write();
            let ptr = guard.as_mut_ptr() as *mut f32;
            // Local plane covers the 2x2 roi.
            for (i, v) in [1.0f32, 2.0, 3.0, 4.0].iter().enumerate() {
                unsafe { *ptr.add(i) = *v };
            }
        }
        let buffers = [Some(local), None, None, None];
        let task = Arc::new(TileTask {
            buffer: TileBuffer::zeroed(n * 4),
            index: TileInternalIndex(1),
            bounds,
            channel: 0,
        });
        run_copy_tasks(
            true,
            std::slice::from_ref(&task),
            &buffers,
            ImageBufferLayout::MonoChannel,
            1,
            roi,
            BitDepth::Float,
            (TS, TS),
            &RenderFlag::new("edges"),
        )
        .unwrap();

        let v = tile_values(&task.buffer);
        // Rightward repeat of the last valid column, upward repeat of the
        // last valid row.
        assert_eq!(v[0..4], [1.0, 2.0, 2.0, 2.0]);
        assert_eq!(v[4..8], [3.0, 4.0, 4.0, 4.0]);
        assert_eq!(v[8..12], [3.0, 4.0, 4.0, 4.0]);
        assert_eq!(v[12..16], [3.0, 4.0, 4.0, 4.0]);
    }

    #[test]
    fn test_copy_out_honors_abort() {
        let roi = RectI::new(0, 0, TS, TS);
        let n = (TS * TS) as usize;
        let buffers = [Some(PixelBuffer::with_len(n * 4)), None, None, None];
        let task = Arc::new(TileTask {
            buffer: TileBuffer::zeroed(n * 4),
            index: TileInternalIndex(1),
            bounds: roi,
            channel: 0,
        });
        let effect = RenderFlag::new("aborted");
        effect.abort();
        let status = run_copy_tasks(
            false,
            std::slice::from_ref(&task),
            &buffers,
            ImageBufferLayout::MonoChannel,
            1,
            roi,
            BitDepth::Float,
            (TS, TS),
            &effect,
        );
        assert_eq!(status, Err(CacheError::Aborted));
    }

    #[test]
    fn test_downscale_averages_quads() {
        // Four constant source tiles; the reconstructed tile is made of
        // four constant quadrants.
        let srcs: Vec<Arc<TileTask>> = [10.0f32, 20.0, 30.0, 40.0]
            .iter()
            .enumerate()
            .map(|(i, v)| {
                Arc::new(TileTask {
                    buffer: tile_of(&[*v; 16]),
                    index: TileInternalIndex(i as u64 + 1),
                    bounds: RectI::new(0, 0, TS, TS),
                    channel: 0,
                })
            })
            .collect();
        let task = Arc::new(DownscaleTask {
            target: Arc::new(TileTask {
                buffer: TileBuffer::zeroed(16 * 4),
                index: TileInternalIndex(9),
                bounds: RectI::new(0, 0, TS, TS),
                channel: 0,
            }),
            src: [
                Some(srcs[0].clone()),
                Some(srcs[1].clone()),
                Some(srcs[2].clone()),
                Some(srcs[3].clone()),
            ],
            low_quality: false,
        });
        run_downscale_tasks(std::slice::from_ref(&task), BitDepth::Float, (TS, TS));

        let v = tile_values(&task.target.buffer);
        // Bottom-left quadrant comes from src 0, bottom-right from src 1...
        assert_eq!(v[0], 10.0);
        assert_eq!(v[3], 20.0);
        assert_eq!(v[12], 30.0);
        assert_eq!(v[15], 40.0);
    }

    #[test]
    fn test_downscale_exact_average() {
        let mut values = [0.0f32; 16];
        // Bottom-left 2x2 block of the bottom-left source: 1, 2, 3, 4.
        values[0] = 1.0;
        values[1] = 2.0;
        values[4] = 3.0;
        values[5] = 4.0;
        let src0 = Arc::new(TileTask {
            buffer: tile_of(&values),
            index: TileInternalIndex(1),
            bounds: RectI::new(0, 0, TS, TS),
            channel: 0,
        });
        let task = Arc::new(DownscaleTask {
            target: Arc::new(TileTask {
                buffer: TileBuffer::zeroed(16 * 4),
                index: TileInternalIndex(9),
                bounds: RectI::new(0, 0, TS, TS),
                channel: 0,
            }),
            src: [Some(src0), None, None, None],
            low_quality: false,
        });
        run_downscale_tasks(std::slice::from_ref(&task), BitDepth::Float, (TS, TS));

        let v = tile_values(&task.target.buffer);
        assert_eq!(v[0], (1.0 + 2.0 + 3.0 + 4.0) / 4.0);
    }

    #[test]
    fn test_downscale_missing_quadrant_left_untouched() {
        let src0 = Arc::new(TileTask {
            buffer: tile_of(&[8.0; 16]),
            index: TileInternalIndex(1),
            bounds: RectI::new(0, 0, TS, TS),
            channel: 0,
        });
        let task = Arc::new(DownscaleTask {
            target: Arc::new(TileTask {
                buffer: TileBuffer::zeroed(16 * 4),
                index: TileInternalIndex(9),
                bounds: RectI::new(0, 0, TS, TS),
                channel: 0,
            }),
            src: [Some(src0), None, None, None],
            low_quality: false,
        });
        run_downscale_tasks(std::slice::from_ref(&task), BitDepth::Float, (TS, TS));

        let v = tile_values(&task.target.buffer);
        // Quadrant fed by the present source.
        assert_eq!(v[0], 8.0);
        assert_eq!(v[5], 8.0);
        // Quadrants whose sources are absent keep their contents.
        assert_eq!(v[3], 0.0);
        assert_eq!(v[15], 0.0);
    }

    #[test]
    fn test_byte_depth_rounding() {
        let buffer = TileBuffer::zeroed(16);
        {
            let mut guard = buffer.write();
            let bytes = guard.as_bytes_mut();
            bytes[0] = 1;
            bytes[1] = 2;
            bytes[4] = 2;
            bytes[5] = 2;
        }
        let src0 = Arc::new(TileTask {
            buffer,
            index: TileInternalIndex(1),
            bounds: RectI::new(0, 0, TS, TS),
            channel: 0,
        });
        let task = Arc::new(DownscaleTask {
            target: Arc::new(TileTask {
                buffer: TileBuffer::zeroed(16),
                index: TileInternalIndex(9),
                bounds: RectI::new(0, 0, TS, TS),
                channel: 0,
            }),
            src: [Some(src0), None, None, None],
            low_quality: false,
        });
        run_downscale_tasks(std::slice::from_ref(&task), BitDepth::Byte, (TS, TS));
        // (1 + 2 + 2 + 2) / 4 = 1.75, rounds to 2.
        assert_eq!(task.target.buffer.read().as_bytes()[0], 2);
    }
}
