//! Pooled byte buffers with zero-copy slicing.
//!
//! An [IoBufMut] is the exclusive, writable tail of a block checked out of a
//! [BufferPool]. Bytes written into it are frozen into an immutable [IoBuf] with
//! [IoBufMut::split], which hands back whatever capacity is left as a new
//! [IoBufMut] over the same block. [IoBuf]s are cheap to clone and slice: every
//! view shares the block, and the block returns to its pool once the last view
//! is dropped.
//!
//! ```text
//! [0 ............ start ........ start+len ............ capacity]
//!  ^               ^              ^                      ^
//!  frozen views    IoBufMut       writable via BufMut    block end
//!  (IoBuf)         filled bytes
//! ```

mod pool;

use bytes::{buf::UninitSlice, Buf, BufMut, Bytes};
use pool::Block;
pub use pool::{BufferPool, BufferPoolConfig, PoolError};
use std::{
    ops::{Bound, Deref, RangeBounds},
    sync::Arc,
};

/// Writable tail of a pooled block.
///
/// Only one [IoBufMut] ever exists for a given region of a block, and frozen
/// [IoBuf]s only cover bytes before it, so writes never alias readable data.
/// Unlike `BytesMut`, the capacity is fixed: writes past [IoBufMut::capacity]
/// panic (per the [BufMut] contract).
pub struct IoBufMut {
    pub(crate) block: Arc<Block>,
    /// Offset of the first byte owned by this view.
    start: usize,
    /// Number of bytes written (and initialized) after `start`.
    len: usize,
}

impl std::fmt::Debug for IoBufMut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBufMut")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl IoBufMut {
    pub(crate) const fn new(block: Arc<Block>) -> Self {
        Self {
            block,
            start: 0,
            len: 0,
        }
    }

    /// Returns the number of bytes written but not yet split off.
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing has been written since the last split.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of bytes this view covers (written plus writable).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.block.capacity() - self.start
    }

    /// Freezes the written bytes into an [IoBuf] without copying.
    ///
    /// The unused remainder of the block is returned as a new [IoBufMut], or
    /// `None` if the block is full.
    pub fn split(self) -> (IoBuf, Option<Self>) {
        let end = self.start + self.len;
        let frozen = IoBuf {
            block: self.block.clone(),
            start: self.start,
            end,
        };
        let rest = (end < self.block.capacity()).then(|| Self {
            block: self.block,
            start: end,
            len: 0,
        });
        (frozen, rest)
    }
}

impl AsRef<[u8]> for IoBufMut {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        // SAFETY: bytes from start..start+len have been initialized and are
        // only reachable through this view.
        unsafe { std::slice::from_raw_parts(self.block.as_ptr().add(self.start), self.len) }
    }
}

// SAFETY: BufMut implementation for IoBufMut.
// - `remaining_mut()` reports bytes available for writing (capacity - len)
// - `chunk_mut()` returns uninitialized memory from start+len to the block end
// - `advance_mut()` advances len within bounds
unsafe impl BufMut for IoBufMut {
    #[inline]
    fn remaining_mut(&self) -> usize {
        self.capacity() - self.len
    }

    #[inline]
    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(
            cnt <= self.remaining_mut(),
            "cannot advance past end of buffer"
        );
        self.len += cnt;
    }

    #[inline]
    fn chunk_mut(&mut self) -> &mut UninitSlice {
        let remaining = self.remaining_mut();
        // SAFETY: the region start+len..capacity is owned exclusively by this
        // view and lies within the block.
        unsafe {
            let ptr = self.block.as_ptr().add(self.start + self.len);
            UninitSlice::from_raw_parts_mut(ptr, remaining)
        }
    }
}

/// Immutable, shareable view over bytes of a pooled block.
///
/// Cloning and [slicing](IoBuf::slice) never copy; they only bump the block's
/// reference count.
#[derive(Clone)]
pub struct IoBuf {
    pub(crate) block: Arc<Block>,
    start: usize,
    end: usize,
}

impl IoBuf {
    /// Returns the number of readable bytes.
    #[inline]
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns true if no readable bytes remain.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Returns a view over a sub-range of this buffer sharing the same block.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds or decreasing.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Self {
        let len = self.len();
        let begin = match range.start_bound() {
            Bound::Included(&n) => n,
            Bound::Excluded(&n) => n + 1,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&n) => n + 1,
            Bound::Excluded(&n) => n,
            Bound::Unbounded => len,
        };
        assert!(begin <= end, "range start must not be greater than end");
        assert!(end <= len, "range end out of bounds: {end} > {len}");

        Self {
            block: self.block.clone(),
            start: self.start + begin,
            end: self.start + end,
        }
    }
}

impl std::fmt::Debug for IoBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuf").field("len", &self.len()).finish()
    }
}

impl AsRef<[u8]> for IoBuf {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        // SAFETY: bytes from start..end were initialized before the view was
        // frozen and are never written again while any view exists.
        unsafe { std::slice::from_raw_parts(self.block.as_ptr().add(self.start), self.len()) }
    }
}

impl Deref for IoBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.as_ref()
    }
}

impl PartialEq<[u8]> for IoBuf {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_ref() == other
    }
}

impl PartialEq for IoBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref() == other.as_ref()
    }
}

impl Eq for IoBuf {}

impl Buf for IoBuf {
    #[inline]
    fn remaining(&self) -> usize {
        self.len()
    }

    #[inline]
    fn chunk(&self) -> &[u8] {
        self.as_ref()
    }

    #[inline]
    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.len(), "cannot advance past end of buffer");
        self.start += cnt;
    }
}

impl From<IoBuf> for Bytes {
    /// Converts without copying; the block stays checked out until the
    /// resulting [Bytes] (and all of its clones) are dropped.
    fn from(buf: IoBuf) -> Self {
        Self::from_owner(buf)
    }
}
