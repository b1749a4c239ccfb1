//! Per-class central free lists feeding the thread caches.
//!
//! Each small size class owns one of these: a deque of recycled chunks
//! plus a bump window of fresh chunks carved from the tracked region.
//! Thread caches move chunks in and out in bulk so the lock is taken once
//! per batch, and batches of a full deque block move by block splicing
//! without touching elements. Recycled chunks are always preferred over
//! carving fresh memory, to keep reuse local within a class.

use crate::deque::{BlockedDeque, BLOCK_LEN};
use crate::host::HostEnv;
use crate::mutex::TicketMutex;
use crate::region::RegionProvider;

/// Banks per central free list. More banks trade capacity for less lock
/// contention; one bank degenerates to a plain list with no hinter call.
pub const CENTRAL_LIST_BANKS: usize = 1;

struct CentralInner {
    recycled: BlockedDeque<usize>,
    bump_start: usize,
    bump_end: usize,
}

/// Shared pool for one size class.
pub struct CentralFreeList {
    chunk_size: usize,
    elems_per_fetch: u32,
    inner: TicketMutex<CentralInner>,
}

impl CentralFreeList {
    /// Builds the pool for chunks of `chunk_size` bytes with the given
    /// bulk-fetch target. Does not allocate.
    pub fn new(chunk_size: usize, elems_per_fetch: u32) -> Self {
        Self {
            chunk_size,
            elems_per_fetch,
            inner: TicketMutex::new(CentralInner {
                recycled: BlockedDeque::new(),
                bump_start: 0,
                bump_end: 0,
            }),
        }
    }

    /// Fetches one chunk: recycled if available, else carved fresh.
    pub fn alloc(&self, region: &RegionProvider) -> usize {
        let mut inner = self.inner.lock();
        if !inner.recycled.is_empty() {
            return inner.recycled.dequeue_back();
        }
        if inner.bump_start + self.chunk_size > inner.bump_end {
            let (start, end) = region.provision(self.chunk_size);
            inner.bump_start = start;
            inner.bump_end = end;
        }
        let res = inner.bump_start;
        inner.bump_start += self.chunk_size;
        debug_assert!(inner.bump_start <= inner.bump_end);
        res
    }

    /// Returns one chunk to the recycled pool.
    pub fn dealloc(&self, p: usize) {
        self.inner.lock().recycled.push_back(p);
    }

    /// Appends up to `elems_per_fetch` chunks to `dst`.
    ///
    /// `dst` must be empty: the whole-block fast path hands it a stolen
    /// block. The recycled pool serves the fetch only when it can satisfy
    /// all of it; otherwise it is left to grow from deallocations and
    /// fresh chunks are carved instead. The fanout of a fresh window into
    /// `dst` happens after the lock is dropped, since the reserved range
    /// is private to this caller by then. A fetch comes up short of the
    /// target only when the remaining bump window holds fewer chunks,
    /// which the next fetch repairs by reprovisioning.
    pub fn bulk_alloc(&self, dst: &mut BlockedDeque<usize>, region: &RegionProvider) {
        let fetch = self.elems_per_fetch as usize;
        let mut inner = self.inner.lock();

        if inner.recycled.size() >= fetch as u64 {
            if fetch >= BLOCK_LEN {
                // The fetch target is clamped to one block, so >= means
                // "exactly a block": steal it whole.
                tracing::trace!(chunk_size = self.chunk_size, "bulk fetch stealing a block");
                inner.recycled.steal_front(dst);
            } else {
                for _ in 0..fetch {
                    let p = inner.recycled.dequeue_back();
                    dst.push_back(p);
                }
            }
            return;
        }

        if inner.bump_start + self.chunk_size > inner.bump_end {
            let (start, end) = region.provision(self.chunk_size);
            inner.bump_start = start;
            inner.bump_end = end;
        }
        let start = inner.bump_start;
        let window_end = inner.bump_end;
        inner.bump_start = start + self.chunk_size * fetch;
        drop(inner); // reserved range is ours; fan out unlocked

        let reserved_end = start + self.chunk_size * fetch;
        let end = if window_end >= reserved_end {
            reserved_end
        } else {
            // Short window: deliver the chunks that fit.
            start + ((window_end - start) / self.chunk_size) * self.chunk_size
        };

        let mut cur = start;
        while cur < end {
            dst.push_back(cur);
            cur += self.chunk_size;
        }
        tracing::trace!(
            chunk_size = self.chunk_size,
            delivered = (end - start) / self.chunk_size,
            "bulk fetch carved fresh chunks"
        );
    }

    /// Returns `elems` chunks from `src` to the recycled pool.
    ///
    /// Full blocks are spliced off `src`'s front outside the critical
    /// section and merged in front of the recycled deque; only a
    /// sub-block count moves element by element under the lock. When
    /// `elems >= 32`, whole blocks are all that moves (`elems` rounds
    /// down to a block multiple) and `src` must retain at least one block
    /// beyond the spliced ones.
    pub fn bulk_dealloc(&self, src: &mut BlockedDeque<usize>, elems: usize) {
        if elems >= BLOCK_LEN {
            let blocks = elems / BLOCK_LEN;
            tracing::trace!(chunk_size = self.chunk_size, blocks, "bulk return of whole blocks");
            let spliced = src.splice_front(blocks);
            self.inner.lock().recycled.merge_front(spliced);
        } else {
            let mut inner = self.inner.lock();
            for _ in 0..elems {
                let p = src.dequeue_back();
                inner.recycled.push_back(p);
            }
        }
    }

    /// Chunk size served by this list.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Recycled chunks currently pooled. Test/stat accessor.
    pub fn recycled_len(&self) -> u64 {
        self.inner.lock().recycled.size()
    }
}

/// N-way banked central free list.
///
/// Every operation is dispatched to a bank picked with the host's bank
/// hinter; there is no cross-bank rebalancing, so the scheme leans on
/// allocation traffic being statistically uniform across banks.
pub struct BankedCentralFreeList<const B: usize> {
    banks: [CentralFreeList; B],
}

impl<const B: usize> BankedCentralFreeList<B> {
    /// Builds `B` identically sized banks.
    pub fn new(chunk_size: usize, elems_per_fetch: u32) -> Self {
        Self {
            banks: std::array::from_fn(|_| CentralFreeList::new(chunk_size, elems_per_fetch)),
        }
    }

    #[inline]
    fn bank(&self, host: &dyn HostEnv) -> &CentralFreeList {
        if B <= 1 {
            &self.banks[0]
        } else {
            &self.banks[(host.bank_hint() % B as u64) as usize]
        }
    }

    /// Fetches one chunk from a hinted bank.
    pub fn alloc(&self, region: &RegionProvider, host: &dyn HostEnv) -> usize {
        self.bank(host).alloc(region)
    }

    /// Returns one chunk to a hinted bank.
    pub fn dealloc(&self, p: usize, host: &dyn HostEnv) {
        self.bank(host).dealloc(p);
    }

    /// Bulk-fetches into `dst` from a hinted bank.
    pub fn bulk_alloc(
        &self,
        dst: &mut BlockedDeque<usize>,
        region: &RegionProvider,
        host: &dyn HostEnv,
    ) {
        self.bank(host).bulk_alloc(dst, region);
    }

    /// Bulk-returns from `src` to a hinted bank.
    pub fn bulk_dealloc(&self, src: &mut BlockedDeque<usize>, elems: usize, host: &dyn HostEnv) {
        self.bank(host).bulk_dealloc(src, elems);
    }

    /// Recycled chunks across all banks. Test/stat accessor.
    pub fn recycled_len(&self) -> u64 {
        self.banks.iter().map(CentralFreeList::recycled_len).sum()
    }
}
