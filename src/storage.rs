//! Local pixel storage for one render.
//!
//! The cache entry copies pixels between the tile store and a per-render
//! buffer owned by the image being computed. Buffers are raw byte slabs
//! aligned to 8 bytes so they can be viewed as any supported depth, and
//! allocation is deferred until a copy actually needs them.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Bit depth of one pixel component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitDepth {
    Byte,
    Short,
    Float,
}

impl BitDepth {
    pub fn size_of(self) -> usize {
        match self {
            BitDepth::Byte => 1,
            BitDepth::Short => 2,
            BitDepth::Float => 4,
        }
    }
}

/// Memory layout of the local image buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageBufferLayout {
    /// One buffer, components interleaved per pixel (RGBARGBA...).
    PackedInterleaved,
    /// One full-rect buffer per component.
    MonoChannel,
}

impl ImageBufferLayout {
    /// Resolve a component to (buffer index, element offset within the
    /// buffer, pixel stride in elements).
    pub fn channel_addressing(self, n_comps: usize, channel: usize) -> (usize, usize, usize) {
        debug_assert!(channel < n_comps);
        match self {
            ImageBufferLayout::PackedInterleaved => (0, channel, n_comps),
            ImageBufferLayout::MonoChannel => (channel, 0, 1),
        }
    }

    /// Number of buffers the layout uses for `n_comps` components.
    pub fn buffer_count(self, n_comps: usize) -> usize {
        match self {
            ImageBufferLayout::PackedInterleaved => 1,
            ImageBufferLayout::MonoChannel => n_comps,
        }
    }

    /// Components stored per buffer.
    pub fn comps_per_buffer(self, n_comps: usize) -> usize {
        match self {
            ImageBufferLayout::PackedInterleaved => n_comps,
            ImageBufferLayout::MonoChannel => 1,
        }
    }
}

/// A zero-filled byte slab whose base pointer is 8-byte aligned, so it can
/// be reinterpreted as u8, u16 or f32 planes.
#[derive(Debug, Default)]
pub struct AlignedBuf {
    words: Vec<u64>,
    len: usize,
}

impl AlignedBuf {
    pub fn zeroed(len: usize) -> Self {
        Self { words: vec![0u64; len.div_ceil(8)], len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Grow to at least `len` bytes, zero-filling new space. Never shrinks.
    pub fn ensure_len(&mut self, len: usize) {
        if len > self.len {
            self.words.resize(len.div_ceil(8), 0);
            self.len = len;
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.words.as_ptr() as *const u8
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.words.as_mut_ptr() as *mut u8
    }

    pub fn as_bytes(&self) -> &[u8] {
        // The vec always holds at least len bytes.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, self.len) }
    }
}

/// Shared handle on one local image buffer.
#[derive(Debug, Clone, Default)]
pub struct PixelBuffer(Arc<RwLock<AlignedBuf>>);

impl PixelBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_len(len: usize) -> Self {
        Self(Arc::new(RwLock::new(AlignedBuf::zeroed(len))))
    }

    /// Deferred allocation: grow the buffer to `len` bytes if needed.
    pub fn ensure_allocated(&self, len: usize) {
        self.0.write().ensure_len(len);
    }

    pub fn read(&self) -> RwLockReadGuard<'_, AlignedBuf> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, AlignedBuf> {
        self.0.write()
    }
}
