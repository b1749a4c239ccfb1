//! Region provider: tracked-range provisioning and the sizemap.
//!
//! The allocator works against two disjoint address ranges. User chunks
//! live in the *tracked* range, which the host reasons about as ordinary
//! program memory; every piece of allocator bookkeeping lives on the
//! *untracked* side, which the host ignores. The provider owns the
//! tracked bump/mapped-end pair, the byte-per-page sizemap that classifies
//! tracked pages, and the accounting for the sizemap's own untracked
//! window. Backing storage for tracked addresses is the host's concern:
//! the core hands out and classifies addresses but never dereferences
//! them.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use thiserror::Error;

use crate::mutex::TicketMutex;
use crate::size_class::{self, PAGE_BITS, PAGE_SIZE};

/// Regions are mapped in 2 MiB increments (superpage-friendly).
pub const MAP_INCREMENT: usize = 2 * 1024 * 1024;

/// Minimum pages handed out per provisioning call. Amortizes the region
/// lock and bounds per-class fragmentation: worst case one partially used
/// span per class.
pub const MIN_PROVISION_PAGES: usize = 32;

/// Default tracked base, clear of anything a hosted process maps low.
pub const DEFAULT_TRACKED_BASE: usize = 0x0a80_0000_0000;

/// Default tracked span (512 GiB).
pub const DEFAULT_TRACKED_SPAN: usize = 512 << 30;

/// Rejected region layouts.
#[derive(Debug, Error)]
pub enum RegionError {
    #[error("tracked base {base:#x} is not page-aligned")]
    UnalignedBase { base: usize },
    #[error("tracked range [{base:#x}, {bound:#x}) is empty or inverted")]
    EmptyTrackedRange { base: usize, bound: usize },
    #[error("untracked budget {budget} bytes cannot index {pages} tracked pages")]
    UntrackedBudget { budget: usize, pages: usize },
}

/// Placement of the two regions. The fixed addresses a simulator host
/// pins these to become plain configuration here.
#[derive(Debug, Clone)]
pub struct RegionLayout {
    /// First tracked address; page-aligned.
    pub tracked_base: usize,
    /// One past the last address the tracked range may ever reach.
    pub tracked_bound: usize,
    /// Bytes of untracked memory budgeted for the sizemap window.
    pub untracked_budget: usize,
}

impl RegionLayout {
    /// Layout with the default base and a caller-chosen tracked span.
    pub fn with_tracked_span(span: usize) -> Self {
        let tracked_base = DEFAULT_TRACKED_BASE;
        Self {
            tracked_base,
            tracked_bound: tracked_base + span,
            untracked_budget: size_class::size_to_pages(span),
        }
    }

    /// Number of pages the tracked range can ever hold.
    pub fn tracked_pages(&self) -> usize {
        (self.tracked_bound - self.tracked_base) >> PAGE_BITS
    }

    fn validate(&self) -> Result<(), RegionError> {
        if self.tracked_base & (PAGE_SIZE - 1) != 0 {
            return Err(RegionError::UnalignedBase {
                base: self.tracked_base,
            });
        }
        if self.tracked_bound <= self.tracked_base {
            return Err(RegionError::EmptyTrackedRange {
                base: self.tracked_base,
                bound: self.tracked_bound,
            });
        }
        let pages = self.tracked_pages();
        if self.untracked_budget < pages {
            return Err(RegionError::UntrackedBudget {
                budget: self.untracked_budget,
                pages,
            });
        }
        Ok(())
    }
}

impl Default for RegionLayout {
    fn default() -> Self {
        Self::with_tracked_span(DEFAULT_TRACKED_SPAN)
    }
}

struct RegionInner {
    /// First unreserved tracked address.
    tracked_bump: usize,
    /// End of the mapped tracked prefix; extended in [`MAP_INCREMENT`] steps.
    tracked_end: usize,
    /// Sizemap bytes consumed, one per provisioned tracked page.
    sizemap_bump: usize,
    /// End of the mapped sizemap prefix.
    sizemap_end: usize,
}

/// Provisions page spans from the tracked range and classifies them.
pub struct RegionProvider {
    layout: RegionLayout,
    /// One class byte per tracked page; 0 marks large-heap pages.
    sizemap: Box<[AtomicU8]>,
    /// Tracked bump as last published; read by `valid_chunk` without the lock.
    published_bump: AtomicUsize,
    /// Provisioning calls served.
    provisions: AtomicU64,
    inner: TicketMutex<RegionInner>,
}

impl RegionProvider {
    /// Builds a provider over a validated layout. The sizemap for the whole
    /// tracked range is reserved up front on the untracked side, so nothing
    /// on the provisioning path allocates.
    pub fn new(layout: RegionLayout) -> Result<Self, RegionError> {
        layout.validate()?;
        let pages = layout.tracked_pages();
        let mut sizemap = Vec::with_capacity(pages);
        sizemap.resize_with(pages, || AtomicU8::new(0));
        let base = layout.tracked_base;
        Ok(Self {
            layout,
            sizemap: sizemap.into_boxed_slice(),
            published_bump: AtomicUsize::new(base),
            provisions: AtomicU64::new(0),
            inner: TicketMutex::new(RegionInner {
                tracked_bump: base,
                tracked_end: base,
                sizemap_bump: 0,
                sizemap_end: 0,
            }),
        })
    }

    /// Reserves a page span big enough for `chunk_size` bytes.
    ///
    /// Returns the `[start, end)` span. At least [`MIN_PROVISION_PAGES`]
    /// pages are handed out per call. For small-class chunk sizes the
    /// span's sizemap entries are stamped with the class; large spans keep
    /// class 0. Exhausting either region's budget is fatal.
    pub fn provision(&self, chunk_size: usize) -> (usize, usize) {
        let pages = MIN_PROVISION_PAGES.max(size_class::size_to_pages(chunk_size));
        let span = pages << PAGE_BITS;

        let mut inner = self.inner.lock();

        let start = inner.tracked_bump;
        let new_bump = start + span;
        if new_bump > inner.tracked_end {
            let grow = (((new_bump - inner.tracked_end) / MAP_INCREMENT) + 1) * MAP_INCREMENT;
            let new_end = inner.tracked_end + grow;
            if new_bump > self.layout.tracked_bound {
                tracing::error!(
                    bump = new_bump,
                    bound = self.layout.tracked_bound,
                    "tracked region exhausted"
                );
                panic!("tracked region exhausted");
            }
            inner.tracked_end = new_end.min(self.layout.tracked_bound);
        }
        inner.tracked_bump = new_bump;

        let new_sizemap_bump = inner.sizemap_bump + pages;
        if new_sizemap_bump > inner.sizemap_end {
            let grow =
                (((new_sizemap_bump - inner.sizemap_end) / MAP_INCREMENT) + 1) * MAP_INCREMENT;
            if new_sizemap_bump > self.layout.untracked_budget {
                tracing::error!(
                    bump = new_sizemap_bump,
                    budget = self.layout.untracked_budget,
                    "untracked sizemap window exhausted"
                );
                panic!("untracked sizemap window exhausted");
            }
            inner.sizemap_end = (inner.sizemap_end + grow).min(self.layout.untracked_budget);
        }
        inner.sizemap_bump = new_sizemap_bump;

        if !size_class::is_large(chunk_size) {
            let class = size_class::size_to_class(chunk_size) as u8;
            let first = (start - self.layout.tracked_base) >> PAGE_BITS;
            for page in first..first + pages {
                self.sizemap[page].store(class, Ordering::Relaxed);
            }
        }

        // Published only after the span's sizemap entries are stamped, so
        // a lock-free valid_chunk reader that trusts the advanced bump
        // never sees the span still unclassified.
        self.published_bump.store(new_bump, Ordering::SeqCst);

        drop(inner);
        self.provisions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(chunk_size, pages, start, "provisioned span");
        (start, start + span)
    }

    /// Size class of the page holding `p`; 0 for large-heap pages.
    ///
    /// `p` must lie inside the tracked range (callers gate on
    /// [`Self::valid_chunk`] or hold a live chunk).
    #[inline]
    pub fn class_of(&self, p: usize) -> u8 {
        assert!(
            p >= self.layout.tracked_base && p < self.layout.tracked_bound,
            "address {p:#x} outside the tracked range"
        );
        self.sizemap[(p - self.layout.tracked_base) >> PAGE_BITS].load(Ordering::Relaxed)
    }

    /// True iff `p` lies in the ever-reserved tracked range.
    ///
    /// Lock-free; may briefly report false for an address another thread
    /// is just now reserving, never true for one outside the reserved
    /// range.
    #[inline]
    pub fn valid_chunk(&self, p: usize) -> bool {
        p >= self.layout.tracked_base && p <= self.published_bump.load(Ordering::SeqCst)
    }

    /// First tracked address.
    pub fn tracked_base(&self) -> usize {
        self.layout.tracked_base
    }

    /// Current published tracked bump.
    pub fn tracked_bump(&self) -> usize {
        self.published_bump.load(Ordering::SeqCst)
    }

    /// Provisioning calls served so far.
    pub fn provision_count(&self) -> u64 {
        self.provisions.load(Ordering::Relaxed)
    }
}
