//! Per-thread cache of small chunks.
//!
//! One deque per size class plus a running byte count. The cache is the
//! unsynchronized hot path: a hit costs a deque pop, a miss refills in
//! bulk from the class's central list, and frees just push. The byte
//! count is soft-bounded; crossing the watermark donates roughly half of
//! every class back to the central lists, which is the only time a
//! dealloc touches shared state.

use crate::central::{BankedCentralFreeList, CENTRAL_LIST_BANKS};
use crate::deque::BlockedDeque;
use crate::host::HostEnv;
use crate::region::RegionProvider;
use crate::size_class::{class_to_size, MAX_CLASSES, MAX_THREAD_CACHE_BYTES};

/// Central list type the caches are wired to.
pub type CentralLists = [BankedCentralFreeList<CENTRAL_LIST_BANKS>];

/// Unsynchronized per-thread chunk cache.
pub struct ThreadCache {
    /// Cached bytes across all classes.
    cache_size: usize,
    class_lists: Vec<BlockedDeque<usize>>,
}

impl ThreadCache {
    /// Creates an empty cache with a deque per class.
    pub fn new() -> Self {
        Self {
            cache_size: 0,
            class_lists: (0..MAX_CLASSES).map(|_| BlockedDeque::new()).collect(),
        }
    }

    /// Fetches one chunk of class `cl`, refilling from the central list
    /// on an empty deque. Returns true in the second slot when a refill
    /// ran.
    pub fn alloc(
        &mut self,
        cl: usize,
        central: &BankedCentralFreeList<CENTRAL_LIST_BANKS>,
        region: &RegionProvider,
        host: &dyn HostEnv,
    ) -> (usize, bool) {
        let list = &mut self.class_lists[cl];
        let mut refilled = false;
        if list.is_empty() {
            central.bulk_alloc(list, region, host);
            self.cache_size += class_to_size(cl) * list.size() as usize;
            refilled = true;
            tracing::trace!(class = cl, fetched = list.size(), "thread cache refilled");
        }
        let res = self.class_lists[cl].dequeue_back();
        self.cache_size -= class_to_size(cl);
        (res, refilled)
    }

    /// Caches a freed chunk of class `cl`. Returns true when the
    /// watermark was crossed and a donation pass ran.
    pub fn dealloc(
        &mut self,
        p: usize,
        cl: usize,
        central_lists: &CentralLists,
        host: &dyn HostEnv,
    ) -> bool {
        self.class_lists[cl].push_back(p);
        self.cache_size += class_to_size(cl);
        if self.cache_size > MAX_THREAD_CACHE_BYTES {
            self.donate(central_lists, host);
            return true;
        }
        false
    }

    /// Donates about half of every non-empty class to the central lists.
    fn donate(&mut self, central_lists: &CentralLists, host: &dyn HostEnv) {
        tracing::debug!(cache_size = self.cache_size, "thread cache donating");
        for donor_cl in 1..MAX_CLASSES {
            let elems = self.class_lists[donor_cl].size() as usize;
            if elems == 0 {
                continue;
            }
            let to_donate = (elems + 1) / 2;
            central_lists[donor_cl].bulk_dealloc(&mut self.class_lists[donor_cl], to_donate, host);
            let removed = elems - self.class_lists[donor_cl].size() as usize;
            self.cache_size -= removed * class_to_size(donor_cl);
        }
        tracing::debug!(cache_size = self.cache_size, "thread cache donation done");
    }

    /// Cached bytes across all classes.
    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    /// Cached chunks of one class.
    pub fn class_len(&self, cl: usize) -> u64 {
        self.class_lists[cl].size()
    }
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RoundRobinHost;
    use crate::region::{RegionLayout, RegionProvider};
    use crate::size_class::elems_per_fetch;

    fn fixture() -> (RegionProvider, Vec<BankedCentralFreeList<CENTRAL_LIST_BANKS>>) {
        let region = RegionProvider::new(RegionLayout::with_tracked_span(1 << 30)).unwrap();
        let lists = (0..MAX_CLASSES)
            .map(|cl| {
                BankedCentralFreeList::new(
                    class_to_size(cl),
                    if cl == 0 { 0 } else { elems_per_fetch(cl) },
                )
            })
            .collect();
        (region, lists)
    }

    #[test]
    fn refill_then_hit() {
        let (region, lists) = fixture();
        let host = RoundRobinHost::new(0);
        let mut cache = ThreadCache::new();

        let (p, refilled) = cache.alloc(1, &lists[1], &region, &host);
        assert!(refilled);
        // A refill fetches a whole 32-chunk block for class 1.
        assert_eq!(cache.class_len(1), 31);
        assert_eq!(cache.cache_size(), 31 * 64);

        let (q, refilled) = cache.alloc(1, &lists[1], &region, &host);
        assert!(!refilled);
        assert_ne!(p, q);
        assert_eq!(cache.cache_size(), 30 * 64);
    }

    #[test]
    fn dealloc_reuses_lifo() {
        let (region, lists) = fixture();
        let host = RoundRobinHost::new(0);
        let mut cache = ThreadCache::new();

        let (p, _) = cache.alloc(2, &lists[2], &region, &host);
        assert!(!cache.dealloc(p, 2, &lists, &host));
        let (q, refilled) = cache.alloc(2, &lists[2], &region, &host);
        assert!(!refilled);
        assert_eq!(p, q);
    }

    #[test]
    fn byte_accounting_tracks_classes() {
        let (region, lists) = fixture();
        let host = RoundRobinHost::new(0);
        let mut cache = ThreadCache::new();

        let (a, _) = cache.alloc(1, &lists[1], &region, &host);
        let (b, _) = cache.alloc(10, &lists[10], &region, &host);
        let before = cache.cache_size();
        cache.dealloc(a, 1, &lists, &host);
        cache.dealloc(b, 10, &lists, &host);
        assert_eq!(cache.cache_size(), before + class_to_size(1) + class_to_size(10));
    }

    #[test]
    fn donation_halves_oversized_cache() {
        let (region, lists) = fixture();
        let host = RoundRobinHost::new(0);
        let mut cache = ThreadCache::new();

        let chunk = class_to_size(1);
        let n = MAX_THREAD_CACHE_BYTES / chunk + 2;
        let mut held: Vec<usize> =
            (0..n).map(|_| cache.alloc(1, &lists[1], &region, &host).0).collect();

        // Returning them all must cross the watermark exactly once.
        let mut donated = false;
        while let Some(p) = held.pop() {
            let size_before = cache.cache_size();
            if cache.dealloc(p, 1, &lists, &host) {
                donated = true;
                assert!(size_before + chunk > MAX_THREAD_CACHE_BYTES);
                break;
            }
        }
        assert!(donated, "returning {n} chunks must cross the 4 MiB watermark");

        // Half the cache (in whole blocks) went back to the central list.
        let donated_bytes = lists[1].recycled_len() as usize * chunk;
        assert!(donated_bytes >= MAX_THREAD_CACHE_BYTES / 2 - 32 * chunk);
        assert!(cache.cache_size() <= MAX_THREAD_CACHE_BYTES / 2 + 32 * chunk);
        // Conservation: the cache held watermark + one chunk when the
        // donation fired, and every donated byte landed centrally.
        assert_eq!(cache.cache_size() + donated_bytes, MAX_THREAD_CACHE_BYTES + chunk);
    }

    #[test]
    fn donation_sweeps_every_class() {
        let (region, lists) = fixture();
        let host = RoundRobinHost::new(0);
        let mut cache = ThreadCache::new();

        // Park a few chunks of a second class in the cache, then overflow
        // with class 255 (16,320-byte chunks cross the watermark fast).
        let (small, _) = cache.alloc(3, &lists[3], &region, &host);
        cache.dealloc(small, 3, &lists, &host);
        let small_cached = cache.class_len(3);

        let n = MAX_THREAD_CACHE_BYTES / class_to_size(255) + 2;
        let held: Vec<usize> =
            (0..n).map(|_| cache.alloc(255, &lists[255], &region, &host).0).collect();
        let mut donated = false;
        for p in held {
            donated |= cache.dealloc(p, 255, &lists, &host);
        }
        assert!(donated);
        // The sweep halves every non-empty class, not just the offender.
        assert!(cache.class_len(3) < small_cached);
        assert!(lists[3].recycled_len() > 0);
    }
}
