//! Allocator state and the four-call internal interface.
//!
//! [`AllocState`] is the process-wide singleton the outer façade routes
//! through: 256 central free lists, the large heap, 2048 thread-cache
//! slots, and the region provider. Everything is placement-constructed by
//! the bootstrap exactly once and never torn down; nothing on the
//! construction path allocates through the allocator itself.
//!
//! Routing is sizemap-driven: `do_alloc` classifies by request size,
//! `do_dealloc` recovers the class from the page of the pointer alone.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::central::{BankedCentralFreeList, CENTRAL_LIST_BANKS};
use crate::host::{HostEnv, NativeHost};
use crate::large::LargeHeap;
use crate::region::{RegionError, RegionLayout, RegionProvider};
use crate::size_class::{
    class_to_size, elems_per_fetch, is_large, round_to_granularity, size_to_class, MAX_CLASSES,
    MAX_THREADS,
};
use crate::thread_cache::ThreadCache;

/// Snapshot of allocator activity counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocStats {
    /// Bulk refills of thread caches from central lists.
    pub thread_cache_refills: u64,
    /// Donation passes from thread caches back to central lists.
    pub donations: u64,
    /// Allocations routed to the large heap.
    pub large_allocs: u64,
    /// Page spans provisioned from the tracked region.
    pub region_provisions: u64,
}

#[derive(Default)]
struct StatCounters {
    thread_cache_refills: AtomicU64,
    donations: AtomicU64,
    large_allocs: AtomicU64,
}

/// One thread's cache slot, unsynchronized.
///
/// The host schedules at most one live thread per id, so the slot's
/// owner is its only writer and the per-thread path takes no lock and
/// issues no atomic operation. Cross-thread reads (diagnostics) must be
/// ordered externally, e.g. after joining the owning thread.
struct CacheSlot(UnsafeCell<ThreadCache>);

// SAFETY: sharing the slot across threads is sound because the host's
// scheduling contract makes each slot single-writer: only the thread
// owning the id touches it, and diagnostic readers order themselves
// against that thread externally.
unsafe impl Sync for CacheSlot {}

impl CacheSlot {
    fn new() -> Self {
        Self(UnsafeCell::new(ThreadCache::new()))
    }

    /// Exclusive access to the cache.
    ///
    /// Callers must be the thread owning this slot's id (or hold an
    /// external happens-before edge over it), and must not hold another
    /// reference into the slot.
    #[allow(clippy::mut_from_ref)]
    unsafe fn cache(&self) -> &mut ThreadCache {
        // SAFETY: deferred to the caller contract above.
        unsafe { &mut *self.0.get() }
    }
}

/// Process-wide allocator state.
pub struct AllocState {
    /// One central list per class; index 0 is reserved and never used.
    class_lists: Vec<BankedCentralFreeList<CENTRAL_LIST_BANKS>>,
    large_heap: LargeHeap,
    /// One slot per host thread id, unsynchronized; see [`CacheSlot`].
    thread_caches: Vec<CacheSlot>,
    region: RegionProvider,
    host: Arc<dyn HostEnv>,
    stats: StatCounters,
}

impl AllocState {
    /// Bootstraps a full allocator over `layout`. This is the whole
    /// initialization sequence: region bookkeeping and sizemap first,
    /// then every central list, the large heap, and all thread-cache
    /// slots. None of it allocates through the allocator being built.
    pub fn new(layout: RegionLayout, host: Arc<dyn HostEnv>) -> Result<Self, RegionError> {
        let region = RegionProvider::new(layout)?;
        let class_lists = (0..MAX_CLASSES)
            .map(|cl| {
                BankedCentralFreeList::new(
                    class_to_size(cl),
                    if cl == 0 { 0 } else { elems_per_fetch(cl) },
                )
            })
            .collect();
        let thread_caches = (0..MAX_THREADS).map(|_| CacheSlot::new()).collect();
        tracing::debug!("allocator state bootstrapped");
        Ok(Self {
            class_lists,
            large_heap: LargeHeap::new(),
            thread_caches,
            region,
            host,
            stats: StatCounters::default(),
        })
    }

    /// Allocates a chunk of at least `size` bytes. `size` must be at
    /// least 1 (the outer façade filters zero-size requests).
    ///
    /// Small requests go through the calling thread's cache; large ones
    /// are granularity-rounded and go to the large heap. The returned
    /// address is 64-byte aligned and lies in the tracked range.
    pub fn do_alloc(&self, size: usize) -> usize {
        debug_assert!(size >= 1, "zero-size requests are filtered by the facade");
        if !is_large(size) {
            let cl = size_to_class(size);
            let tid = self.host.thread_id();
            // SAFETY: `tid` is the calling thread's own id, so this is the
            // slot's single writer, and nothing on the allocation path
            // re-enters the slot.
            let cache = unsafe { self.thread_caches[tid].cache() };
            let (p, refilled) =
                cache.alloc(cl, &self.class_lists[cl], &self.region, &*self.host);
            if refilled {
                self.stats.thread_cache_refills.fetch_add(1, Ordering::Relaxed);
            }
            p
        } else {
            self.stats.large_allocs.fetch_add(1, Ordering::Relaxed);
            self.large_heap.alloc(round_to_granularity(size), &self.region)
        }
    }

    /// Returns a chunk to its owning tier. Null (zero) is a no-op.
    ///
    /// The class comes from the sizemap page entry: non-zero routes to
    /// the calling thread's cache, zero to the large heap.
    pub fn do_dealloc(&self, p: usize) {
        if p == 0 {
            return;
        }
        let cl = self.region.class_of(p) as usize;
        if cl != 0 {
            let tid = self.host.thread_id();
            // SAFETY: as in `do_alloc`, the calling thread owns `tid`'s
            // slot and the deallocation path does not re-enter it.
            let cache = unsafe { self.thread_caches[tid].cache() };
            if cache.dealloc(p, cl, &self.class_lists, &*self.host) {
                self.stats.donations.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            self.large_heap.dealloc(p);
        }
    }

    /// Usable size of the chunk at `p`.
    ///
    /// Small chunks answer from the sizemap; large chunks from the chunk
    /// index, where a stale pointer yields 0 rather than a fault.
    pub fn chunk_size(&self, p: usize) -> usize {
        let cl = self.region.class_of(p) as usize;
        if cl != 0 {
            class_to_size(cl)
        } else {
            self.large_heap.chunk_size_of(p)
        }
    }

    /// True iff `p` lies in the ever-reserved tracked range. Lock-free
    /// range test, not a liveness proof.
    pub fn valid_chunk(&self, p: usize) -> bool {
        self.region.valid_chunk(p)
    }

    /// Activity counter snapshot.
    pub fn stats(&self) -> AllocStats {
        AllocStats {
            thread_cache_refills: self.stats.thread_cache_refills.load(Ordering::Relaxed),
            donations: self.stats.donations.load(Ordering::Relaxed),
            large_allocs: self.stats.large_allocs.load(Ordering::Relaxed),
            region_provisions: self.region.provision_count(),
        }
    }

    /// The region provider backing this state.
    pub fn region(&self) -> &RegionProvider {
        &self.region
    }

    /// The large heap backing this state.
    pub fn large_heap(&self) -> &LargeHeap {
        &self.large_heap
    }

    /// Cached bytes in one thread's cache.
    ///
    /// Diagnostic read of an unsynchronized slot: the caller must order
    /// it against the owning thread's activity (that thread has been
    /// joined, or the caller is the owner).
    pub fn thread_cache_bytes(&self, tid: usize) -> usize {
        // SAFETY: the method contract above gives the required
        // happens-before edge over the slot's single writer.
        unsafe { self.thread_caches[tid].cache() }.cache_size()
    }
}

static GLOBAL: OnceLock<AllocState> = OnceLock::new();

/// Process-global allocator state, bootstrapped on first use.
///
/// First-call-wins and idempotent: concurrent first callers race to
/// initialize, every caller observes the same fully constructed state,
/// and the state lives for the rest of the process.
pub fn global() -> &'static AllocState {
    GLOBAL.get_or_init(|| {
        AllocState::new(RegionLayout::default(), Arc::new(NativeHost))
            .expect("default region layout is valid")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RoundRobinHost;
    use crate::size_class::{GRANULARITY, MAX_SMALL_SIZE, PAGE_SIZE};

    fn state() -> AllocState {
        AllocState::new(
            RegionLayout::with_tracked_span(1 << 30),
            Arc::new(RoundRobinHost::new(0)),
        )
        .unwrap()
    }

    #[test]
    fn small_alloc_routes_through_cache_and_sizemap() {
        let state = state();
        let p = state.do_alloc(100);
        assert_eq!(p % GRANULARITY, 0);
        assert!(state.valid_chunk(p));
        // 100 bytes is class 2: the page is stamped and the reported
        // chunk size is the class size.
        assert_eq!(state.region().class_of(p), 2);
        assert_eq!(state.chunk_size(p), 128);
        assert_eq!(state.stats().thread_cache_refills, 1);
    }

    #[test]
    fn small_free_returns_to_cache_and_is_reused() {
        let state = state();
        let p = state.do_alloc(100);
        state.do_dealloc(p);
        let q = state.do_alloc(100);
        assert_eq!(q, p, "quiet round trip reuses the cached chunk");
    }

    #[test]
    fn large_alloc_routes_to_large_heap() {
        let state = state();
        let p = state.do_alloc(MAX_SMALL_SIZE + 1);
        assert_eq!(state.region().class_of(p), 0);
        // Rounded up to the granularity.
        assert_eq!(state.chunk_size(p), round_to_granularity(MAX_SMALL_SIZE + 1));
        assert_eq!(state.stats().large_allocs, 1);
        state.do_dealloc(p);
        assert_eq!(state.chunk_size(p), round_to_granularity(MAX_SMALL_SIZE + 1));
    }

    #[test]
    fn boundary_sizes_route_by_ceiling() {
        let state = state();
        let small = state.do_alloc(MAX_SMALL_SIZE);
        assert_eq!(state.region().class_of(small), 255);
        assert_eq!(state.chunk_size(small), MAX_SMALL_SIZE);
        let one = state.do_alloc(1);
        assert_eq!(state.chunk_size(one), GRANULARITY);
        let large = state.do_alloc(MAX_SMALL_SIZE + 1);
        assert_eq!(state.region().class_of(large), 0);
    }

    #[test]
    fn null_dealloc_is_noop() {
        let state = state();
        state.do_dealloc(0);
    }

    #[test]
    fn chunks_within_a_page_share_a_class() {
        let state = state();
        let p = state.do_alloc(200); // class 4
        let page_base = p - (p - state.region().tracked_base()) % PAGE_SIZE;
        assert_eq!(state.region().class_of(page_base), 4);
        assert_eq!(state.region().class_of(page_base + PAGE_SIZE - 1), 4);
    }

    #[test]
    fn distinct_tids_use_distinct_caches() {
        let a = Arc::new(RoundRobinHost::new(5));
        let state = AllocState::new(RegionLayout::with_tracked_span(1 << 30), a).unwrap();
        let p = state.do_alloc(64);
        state.do_dealloc(p);
        assert!(state.thread_cache_bytes(5) > 0);
        assert_eq!(state.thread_cache_bytes(6), 0);
    }

    #[test]
    fn global_bootstraps_once() {
        let a = global();
        let b = global();
        assert!(std::ptr::eq(a, b));
        let p = a.do_alloc(64);
        assert!(b.valid_chunk(p));
        a.do_dealloc(p);
    }
}
