//! Size classes, pages, and sizing policy for the small-object tiers.
//!
//! Small allocations are served in 64-byte granules: class `c` (1..=255)
//! means a chunk of `64 * c` bytes, so the small-object ceiling is
//! 16,320 bytes. Class 0 is reserved for pages managed by the large heap.
//! The tracked region is carved in 32 KiB pages; every page holds chunks
//! of a single class, which is what lets `free` classify a pointer from
//! the sizemap alone.

/// Log2 of the page size.
pub const PAGE_BITS: usize = 15;

/// Page size in bytes (32 KiB). The unit at which the sizemap records a class.
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;

/// Allocation granularity in bytes. Also the alignment of every chunk.
pub const GRANULARITY: usize = 64;

/// Number of size classes, including the reserved class 0.
pub const MAX_CLASSES: usize = 256;

/// Largest size served by the small-object tiers (class 255).
pub const MAX_SMALL_SIZE: usize = GRANULARITY * (MAX_CLASSES - 1);

/// Maximum number of distinct thread ids the host may hand out.
pub const MAX_THREADS: usize = 2048;

/// A thread cache growing beyond this donates to the central freelists.
pub const MAX_THREAD_CACHE_BYTES: usize = 4096 * 1024;

/// Thread caches try to fetch this many bytes per central-list access.
pub const FETCH_TARGET_BYTES: usize = 32 * 1024;

/// Number of pages needed to hold `size` bytes.
#[inline]
pub fn size_to_pages(size: usize) -> usize {
    (size + PAGE_SIZE - 1) >> PAGE_BITS
}

/// Size class for a request. Returns `MAX_CLASSES` or more for large requests.
#[inline]
pub fn size_to_class(size: usize) -> usize {
    (size + GRANULARITY - 1) >> 6
}

/// Chunk size of a class.
#[inline]
pub fn class_to_size(class: usize) -> usize {
    class << 6
}

/// True if the request must go to the large heap.
#[inline]
pub fn is_large(size: usize) -> bool {
    size_to_class(size) >= MAX_CLASSES
}

/// Rounds a large request up to the allocation granularity.
#[inline]
pub fn round_to_granularity(size: usize) -> usize {
    (size + GRANULARITY - 1) & !(GRANULARITY - 1)
}

/// Bulk-fetch size for a class, targeting [`FETCH_TARGET_BYTES`] per refill.
///
/// Clamped to `[2, 32]`: at least two chunks so a refill outlives the
/// allocation that triggered it, at most one deque block.
#[inline]
pub fn elems_per_fetch(class: usize) -> u32 {
    let target = FETCH_TARGET_BYTES.div_ceil(class_to_size(class)) as u32;
    target.clamp(2, crate::deque::BLOCK_LEN as u32)
}
