//! Buffer pool for descriptor reads.
//!
//! Provides pooled, aligned blocks of a single fixed capacity that are reused
//! across reads to amortize allocation. A block leaves the pool as an
//! [`IoBufMut`] and returns to the pool once the last view over it (including
//! every [`IoBuf`](super::IoBuf) carved from it) is dropped.
//!
//! # Thread Safety
//!
//! [`BufferPool`] is `Send + Sync` and can be shared across execution contexts.
//! Allocation and release are lock-free operations using atomic counters and a
//! lock-free queue ([`crossbeam_queue::ArrayQueue`]).
//!
//! # Pool Lifecycle
//!
//! Blocks hold a weak reference to the pool, so:
//! - If a block is released after the pool is dropped, it is deallocated
//!   directly instead of being returned to the freelist.
//! - The pool can be dropped while views are still in use; those views remain
//!   valid and their block is deallocated when the last one is dropped.

use super::IoBufMut;
use crossbeam_queue::ArrayQueue;
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::{
    alloc::{alloc, dealloc, Layout},
    mem::ManuallyDrop,
    num::NonZeroUsize,
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
};
use thiserror::Error;

/// Error returned when buffer pool allocation fails.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Every block the pool may hand out is in use.
    #[error("pool exhausted")]
    Exhausted,
    /// The allocator could not provide a new block.
    #[error("block allocation failed")]
    AllocationFailed,
}

/// Returns the system page size.
///
/// On Unix systems, queries the actual page size via `sysconf`.
/// On other systems, defaults to 4KB.
#[cfg(unix)]
fn page_size() -> usize {
    // SAFETY: sysconf is safe to call.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

#[cfg(not(unix))]
fn page_size() -> usize {
    4096
}

/// Returns the cache line size for the current architecture.
///
/// Uses 128 bytes for x86_64 and aarch64 as a conservative estimate that
/// accounts for spatial prefetching. Uses 64 bytes for other architectures.
const fn cache_line_size() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))] {
            128
        } else {
            64
        }
    }
}

/// Configuration for a buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Capacity of every block. Must be >= alignment.
    pub capacity: NonZeroUsize,
    /// Maximum number of blocks the pool tracks (in use plus free).
    pub max_buffers: NonZeroUsize,
    /// Whether to pre-allocate all blocks on pool creation.
    pub prefill: bool,
    /// Block alignment. Must be a power of two.
    pub alignment: NonZeroUsize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self::for_network()
    }
}

impl BufferPoolConfig {
    /// Network I/O preset: cache-line aligned 16KB blocks, 4096 blocks, not
    /// prefilled.
    pub const fn for_network() -> Self {
        let cache_line = NZUsize!(cache_line_size());
        Self {
            capacity: NZUsize!(16 * 1024),
            max_buffers: NZUsize!(4096),
            prefill: false,
            alignment: cache_line,
        }
    }

    /// Storage I/O preset: page-sized, page-aligned blocks, 32 blocks, not
    /// prefilled.
    pub fn for_storage() -> Self {
        let page = NZUsize!(page_size());
        Self {
            capacity: page,
            max_buffers: NZUsize!(32),
            prefill: false,
            alignment: page,
        }
    }

    /// Validates the configuration, panicking on invalid values.
    ///
    /// # Panics
    ///
    /// - `alignment` is not a power of two
    /// - `capacity < alignment`
    fn validate(&self) {
        assert!(
            self.alignment.is_power_of_two(),
            "alignment must be a power of two"
        );
        assert!(
            self.capacity >= self.alignment,
            "capacity ({}) must be >= alignment ({})",
            self.capacity,
            self.alignment
        );
    }
}

/// Metrics for the buffer pool.
struct PoolMetrics {
    /// Number of blocks currently out of the pool.
    allocated: Gauge,
    /// Number of blocks waiting in the freelist.
    available: Gauge,
    /// Total number of successful allocations.
    allocations_total: Counter,
    /// Total number of failed allocations (pool exhausted).
    exhausted_total: Counter,
}

impl PoolMetrics {
    fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            allocated: Gauge::default(),
            available: Gauge::default(),
            allocations_total: Counter::default(),
            exhausted_total: Counter::default(),
        };

        registry.register(
            "buffer_pool_allocated",
            "Number of buffers currently allocated from the pool",
            metrics.allocated.clone(),
        );
        registry.register(
            "buffer_pool_available",
            "Number of buffers available in the pool",
            metrics.available.clone(),
        );
        registry.register(
            "buffer_pool_allocations",
            "Total number of successful buffer allocations",
            metrics.allocations_total.clone(),
        );
        registry.register(
            "buffer_pool_exhausted",
            "Total number of failed allocations due to pool exhaustion",
            metrics.exhausted_total.clone(),
        );

        metrics
    }
}

/// An aligned allocation.
///
/// Deallocates itself on drop using the stored layout. Contents are not
/// zeroed.
pub(crate) struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: AlignedBuffer owns its memory and can be sent between threads.
unsafe impl Send for AlignedBuffer {}
// SAFETY: AlignedBuffer exposes no interior mutability through `&self`.
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocates a new buffer with the given capacity and alignment, returning
    /// `None` if the allocator fails.
    fn new(capacity: usize, alignment: usize) -> Option<Self> {
        let layout = Layout::from_size_align(capacity, alignment).ok()?;

        // SAFETY: Layout is valid (non-zero size, power-of-two alignment).
        let ptr = unsafe { alloc(layout) };
        let ptr = NonNull::new(ptr)?;

        Some(Self { ptr, layout })
    }

    /// Returns the capacity of the buffer.
    #[inline]
    pub(crate) const fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Returns a raw pointer to the buffer.
    #[inline]
    pub(crate) const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A block checked out of the pool.
///
/// Shared (through an [Arc]) by the [`IoBufMut`] tail and every
/// [`IoBuf`](super::IoBuf) carved from it. Returns to the pool when the last
/// reference is dropped.
pub(crate) struct Block {
    buffer: ManuallyDrop<AlignedBuffer>,
    pool: Weak<BufferPoolInner>,
}

impl Block {
    const fn new(buffer: AlignedBuffer, pool: Weak<BufferPoolInner>) -> Self {
        Self {
            buffer: ManuallyDrop::new(buffer),
            pool,
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.buffer.as_ptr()
    }

    /// Returns `true` if this block goes back to a pool when released.
    #[cfg(test)]
    pub(crate) fn is_tracked(&self) -> bool {
        self.pool.strong_count() > 0
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // SAFETY: Drop is only called once and the buffer is not used afterwards.
        let buffer = unsafe { ManuallyDrop::take(&mut self.buffer) };
        if let Some(pool) = self.pool.upgrade() {
            pool.return_buffer(buffer);
        }
        // else: buffer is dropped here, which deallocates it
    }
}

/// Internal state of the buffer pool.
pub(crate) struct BufferPoolInner {
    config: BufferPoolConfig,
    /// Free list storing either reusable buffers (`Some`) or empty slots for
    /// creating a new buffer (`None`).
    freelist: ArrayQueue<Option<AlignedBuffer>>,
    /// Number of blocks currently out of the pool.
    allocated: AtomicUsize,
    metrics: PoolMetrics,
}

impl BufferPoolInner {
    fn try_alloc(&self) -> Result<AlignedBuffer, PoolError> {
        let buffer = match self.freelist.pop() {
            Some(Some(buffer)) => {
                // Reuse existing buffer
                self.metrics.available.dec();
                buffer
            }
            Some(None) => {
                // Create new buffer (we have a slot)
                match AlignedBuffer::new(self.config.capacity.get(), self.config.alignment.get())
                {
                    Some(buffer) => buffer,
                    None => {
                        // Give the slot back so a later attempt can retry
                        let _ = self.freelist.push(None);
                        return Err(PoolError::AllocationFailed);
                    }
                }
            }
            None => {
                self.metrics.exhausted_total.inc();
                return Err(PoolError::Exhausted);
            }
        };
        self.allocated.fetch_add(1, Ordering::Relaxed);
        self.metrics.allocations_total.inc();
        self.metrics.allocated.inc();
        Ok(buffer)
    }

    /// Return a buffer to the pool.
    fn return_buffer(&self, buffer: AlignedBuffer) {
        self.allocated.fetch_sub(1, Ordering::Relaxed);
        self.metrics.allocated.dec();
        if self.freelist.push(Some(buffer)).is_ok() {
            self.metrics.available.inc();
        }
        // else: freelist full, buffer is dropped and deallocated
    }
}

/// A pool of reusable, fixed-capacity, aligned blocks.
///
/// Cloning the pool is cheap and every clone refers to the same blocks.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("config", &self.inner.config)
            .field("allocated", &self.allocated())
            .field("available", &self.available())
            .finish()
    }
}

impl BufferPool {
    /// Creates a new buffer pool with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid or if prefilling fails to
    /// allocate.
    pub fn new(config: BufferPoolConfig, registry: &mut Registry) -> Self {
        config.validate();

        let metrics = PoolMetrics::new(registry);
        let max_buffers = config.max_buffers.get();
        let freelist = ArrayQueue::new(max_buffers);
        for _ in 0..max_buffers {
            let entry = if config.prefill {
                let buffer =
                    AlignedBuffer::new(config.capacity.get(), config.alignment.get())
                        .expect("prefill allocation failed");
                Some(buffer)
            } else {
                None
            };
            let _ = freelist.push(entry);
        }
        if config.prefill {
            metrics.available.set(max_buffers as i64);
        }

        Self {
            inner: Arc::new(BufferPoolInner {
                config,
                freelist,
                allocated: AtomicUsize::new(0),
                metrics,
            }),
        }
    }

    /// Attempts to check a block out of the pool.
    ///
    /// The returned buffer is empty with `capacity() == self.capacity()`. Its
    /// memory is **not** zeroed.
    ///
    /// # Errors
    ///
    /// - [`PoolError::Exhausted`]: all `max_buffers` blocks are in use
    /// - [`PoolError::AllocationFailed`]: the allocator refused a new block
    pub fn try_alloc(&self) -> Result<IoBufMut, PoolError> {
        let buffer = self.inner.try_alloc()?;
        let block = Block::new(buffer, Arc::downgrade(&self.inner));
        Ok(IoBufMut::new(Arc::new(block)))
    }

    /// Checks a block out of the pool, falling back to an untracked heap
    /// allocation (deallocated on release instead of pooled) if the pool is
    /// exhausted.
    ///
    /// # Panics
    ///
    /// Panics if the fallback allocation fails.
    pub fn alloc(&self) -> IoBufMut {
        self.try_alloc().unwrap_or_else(|_| {
            let config = &self.inner.config;
            let buffer = AlignedBuffer::new(config.capacity.get(), config.alignment.get())
                .expect("allocation failed");
            // Using Weak::new() means the buffer won't be returned to the pool on drop.
            IoBufMut::new(Arc::new(Block::new(buffer, Weak::new())))
        })
    }

    /// Returns the capacity of every block handed out by this pool.
    pub fn capacity(&self) -> usize {
        self.inner.config.capacity.get()
    }

    /// Returns the number of blocks currently out of the pool.
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }

    /// Returns the number of previously allocated blocks waiting for reuse.
    pub fn available(&self) -> usize {
        // Slots that have never been filled are `None` and not counted
        self.inner.metrics.available.get() as usize
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &BufferPoolConfig {
        &self.inner.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use std::{sync::mpsc, thread};

    fn test_registry() -> Registry {
        Registry::default()
    }

    fn test_config(capacity: usize, max_buffers: usize) -> BufferPoolConfig {
        BufferPoolConfig {
            capacity: NZUsize!(capacity),
            max_buffers: NZUsize!(max_buffers),
            prefill: false,
            alignment: NZUsize!(cache_line_size()),
        }
    }

    #[test]
    fn test_page_size() {
        let size = page_size();
        assert!(size >= 4096);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn test_aligned_buffer() {
        let page = page_size();
        let buf = AlignedBuffer::new(4096, page).unwrap();
        assert_eq!(buf.capacity(), 4096);
        assert_eq!(buf.as_ptr() as usize % page, 0);

        let cache_line = cache_line_size();
        let buf = AlignedBuffer::new(4096, cache_line).unwrap();
        assert_eq!(buf.as_ptr() as usize % cache_line, 0);
    }

    #[test]
    fn test_presets_are_valid() {
        BufferPoolConfig::for_network().validate();
        BufferPoolConfig::for_storage().validate();
        assert_eq!(BufferPoolConfig::default().capacity.get(), 16 * 1024);
    }

    #[test]
    #[should_panic(expected = "alignment must be a power of two")]
    fn test_config_invalid_alignment() {
        let config = BufferPoolConfig {
            capacity: NZUsize!(4096),
            max_buffers: NZUsize!(1),
            prefill: false,
            alignment: NZUsize!(96),
        };
        config.validate();
    }

    #[test]
    #[should_panic(expected = "must be >= alignment")]
    fn test_config_capacity_below_alignment() {
        let config = BufferPoolConfig {
            capacity: NZUsize!(64),
            max_buffers: NZUsize!(1),
            prefill: false,
            alignment: NZUsize!(4096),
        };
        config.validate();
    }

    #[test]
    fn test_block_returns_after_last_view() {
        let pool = BufferPool::new(test_config(256, 2), &mut test_registry());
        let mut buf = pool.try_alloc().unwrap();
        assert_eq!(buf.capacity(), 256);
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.available(), 0);

        buf.put_slice(b"hello world");
        let (frozen, rest) = buf.split();
        let rest = rest.unwrap();
        let hello = frozen.slice(..5);
        drop(frozen);
        drop(rest);

        // The slice still pins the block
        assert_eq!(pool.allocated(), 1);
        assert_eq!(&hello[..], b"hello");

        drop(hello);
        assert_eq!(pool.allocated(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_block_reuse() {
        let pool = BufferPool::new(test_config(128, 1), &mut test_registry());
        let buf = pool.try_alloc().unwrap();
        let ptr = buf.block.as_ptr();
        drop(buf);

        let buf = pool.try_alloc().unwrap();
        assert_eq!(buf.block.as_ptr(), ptr);
    }

    #[test]
    fn test_exhaustion() {
        let pool = BufferPool::new(test_config(128, 2), &mut test_registry());
        let first = pool.try_alloc().unwrap();
        let _second = pool.try_alloc().unwrap();
        assert_eq!(pool.try_alloc().unwrap_err(), PoolError::Exhausted);

        drop(first);
        assert!(pool.try_alloc().is_ok());
    }

    #[test]
    fn test_alloc_fallback_is_untracked() {
        let pool = BufferPool::new(test_config(128, 1), &mut test_registry());
        let tracked = pool.alloc();
        assert!(tracked.block.is_tracked());

        let untracked = pool.alloc();
        assert!(!untracked.block.is_tracked());
        assert_eq!(untracked.capacity(), 128);
        assert_eq!(pool.allocated(), 1);

        drop(untracked);
        assert_eq!(pool.available(), 0);
        drop(tracked);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_prefill() {
        let config = BufferPoolConfig {
            prefill: true,
            ..test_config(128, 4)
        };
        let pool = BufferPool::new(config, &mut test_registry());
        assert_eq!(pool.available(), 4);

        let _buf = pool.try_alloc().unwrap();
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn test_view_outlives_pool() {
        let pool = BufferPool::new(test_config(128, 1), &mut test_registry());
        let mut buf = pool.try_alloc().unwrap();
        buf.put_slice(b"abc");
        let (frozen, _) = buf.split();
        drop(pool);

        assert!(!frozen.block.is_tracked());
        assert_eq!(&frozen[..], b"abc");
    }

    #[test]
    fn test_metrics_registered() {
        let mut registry = test_registry();
        let pool = BufferPool::new(test_config(128, 2), &mut registry);
        let _buf = pool.try_alloc().unwrap();

        let mut encoded = String::new();
        prometheus_client::encoding::text::encode(&mut encoded, &registry).unwrap();
        assert!(encoded.contains("buffer_pool_allocated 1"));
        assert!(encoded.contains("buffer_pool_allocations_total 1"));
    }

    #[test]
    fn test_release_from_other_thread() {
        let pool = BufferPool::new(test_config(128, 4), &mut test_registry());
        let (sender, receiver) = mpsc::channel();
        for _ in 0..4 {
            let mut buf = pool.try_alloc().unwrap();
            buf.put_slice(&[7; 16]);
            let (frozen, _) = buf.split();
            sender.send(frozen).unwrap();
        }
        drop(sender);

        let handle = thread::spawn(move || receiver.iter().map(|buf| buf.len()).sum::<usize>());
        assert_eq!(handle.join().unwrap(), 64);
        assert_eq!(pool.allocated(), 0);
        assert_eq!(pool.available(), 4);
    }
}
