//! Bounds-checked views over guest linear memory, and the view cache that
//! tracks the identity of the buffer behind them.
//!
//! Linear memory can move or change size whenever the guest grows it, which
//! may happen inside any guest call, including the allocator calls the
//! transcoders make themselves. Views therefore borrow the memory slice for
//! the duration of a single read or write and are re-fetched through
//! [`ViewCache`] every time; the cache compares the buffer identity on each
//! fetch and rebuilds on mismatch.
//!
//! Guest pointers are `i32` at the ABI and are interpreted as unsigned.

use std::ops::Range;

use keystone_hostapi::HostError;
use tracing::trace;

/// Convert a guest pointer to a byte offset.
pub fn addr(ptr: i32) -> usize {
    ptr as u32 as usize
}

/// Validate that `[ptr, ptr+len)` lies inside a memory of `mem_size` bytes.
pub fn checked_range(mem_size: usize, ptr: usize, len: usize) -> Result<Range<usize>, HostError> {
    match ptr.checked_add(len) {
        Some(end) if end <= mem_size => Ok(ptr..end),
        _ => Err(HostError::OutOfBounds {
            start: ptr,
            end: ptr.saturating_add(len),
            len: mem_size,
        }),
    }
}

/// Identity of a linear memory buffer: base address and byte length.
///
/// Growth changes the length and may move the base, so either change means
/// any earlier view refers to a buffer that no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferId {
    base: usize,
    len: usize,
}

impl BufferId {
    pub fn of(data: &[u8]) -> Self {
        Self {
            base: data.as_ptr() as usize,
            len: data.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Byte-granularity read view.
#[derive(Debug, Clone, Copy)]
pub struct ByteView<'a> {
    bytes: &'a [u8],
}

impl<'a> ByteView<'a> {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Zero-copy window of `len` bytes at `ptr`.
    pub fn subarray(&self, ptr: usize, len: usize) -> Result<&'a [u8], HostError> {
        let range = checked_range(self.bytes.len(), ptr, len)?;
        Ok(&self.bytes[range])
    }
}

/// Byte-granularity write view.
#[derive(Debug)]
pub struct ByteViewMut<'a> {
    bytes: &'a mut [u8],
}

impl ByteViewMut<'_> {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn subarray(&self, ptr: usize, len: usize) -> Result<&[u8], HostError> {
        let range = checked_range(self.bytes.len(), ptr, len)?;
        Ok(&self.bytes[range])
    }

    pub fn subarray_mut(&mut self, ptr: usize, len: usize) -> Result<&mut [u8], HostError> {
        let range = checked_range(self.bytes.len(), ptr, len)?;
        Ok(&mut self.bytes[range])
    }

    /// Copy `data` into memory at `ptr`.
    pub fn write(&mut self, ptr: usize, data: &[u8]) -> Result<(), HostError> {
        self.subarray_mut(ptr, data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Zero `len` bytes at `ptr`.
    pub fn fill_zero(&mut self, ptr: usize, len: usize) -> Result<(), HostError> {
        self.subarray_mut(ptr, len)?.fill(0);
        Ok(())
    }
}

/// 32-bit-granularity read view, indexed in words.
#[derive(Debug, Clone, Copy)]
pub struct WordView<'a> {
    bytes: &'a [u8],
}

impl WordView<'_> {
    /// Number of whole words in the buffer.
    pub fn len(&self) -> usize {
        self.bytes.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the little-endian i32 at word `index`.
    pub fn get(&self, index: usize) -> Result<i32, HostError> {
        let range = checked_range(self.bytes.len(), index.saturating_mul(4), 4)?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.bytes[range]);
        Ok(i32::from_le_bytes(word))
    }
}

/// 32-bit-granularity write view, indexed in words.
#[derive(Debug)]
pub struct WordViewMut<'a> {
    bytes: &'a mut [u8],
}

impl WordViewMut<'_> {
    pub fn get(&self, index: usize) -> Result<i32, HostError> {
        WordView { bytes: &*self.bytes }.get(index)
    }

    /// Write `value` little-endian at word `index`.
    pub fn set(&mut self, index: usize, value: i32) -> Result<(), HostError> {
        let range = checked_range(self.bytes.len(), index.saturating_mul(4), 4)?;
        self.bytes[range].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}

/// Tracks which buffer the byte and word views were last built over.
#[derive(Debug, Default)]
pub struct ViewCache {
    bytes: Option<BufferId>,
    words: Option<BufferId>,
    rebuilds: u64,
}

impl ViewCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn revalidate(cached: &mut Option<BufferId>, rebuilds: &mut u64, data: &[u8], kind: &'static str) {
        let current = BufferId::of(data);
        if *cached != Some(current) {
            trace!(kind, len = current.len(), "rebuilding memory view");
            *cached = Some(current);
            *rebuilds += 1;
        }
    }

    pub fn byte_view<'a>(&mut self, data: &'a [u8]) -> ByteView<'a> {
        Self::revalidate(&mut self.bytes, &mut self.rebuilds, data, "u8");
        ByteView { bytes: data }
    }

    pub fn byte_view_mut<'a>(&mut self, data: &'a mut [u8]) -> ByteViewMut<'a> {
        Self::revalidate(&mut self.bytes, &mut self.rebuilds, data, "u8");
        ByteViewMut { bytes: data }
    }

    pub fn word_view<'a>(&mut self, data: &'a [u8]) -> WordView<'a> {
        Self::revalidate(&mut self.words, &mut self.rebuilds, data, "i32");
        WordView { bytes: data }
    }

    pub fn word_view_mut<'a>(&mut self, data: &'a mut [u8]) -> WordViewMut<'a> {
        Self::revalidate(&mut self.words, &mut self.rebuilds, data, "i32");
        WordViewMut { bytes: data }
    }

    /// How many times a view had to be rebuilt over a new buffer.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// The buffer the byte view was last built over.
    pub fn current(&self) -> Option<BufferId> {
        self.bytes
    }
}
