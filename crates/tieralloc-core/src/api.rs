//! Hosted façade over the four-call internal interface.
//!
//! A thin malloc-shaped surface: zero-size filtering, the realloc
//! keep-in-place policy, and usable-size queries. The simulator-side
//! concerns of the real façade (deferred commit/abort deallocation,
//! privileged-call bracketing, the C ABI) stay with the host; this is
//! the policy layer both share.

use crate::allocator::AllocState;

/// Malloc-shaped handle over an [`AllocState`].
#[derive(Clone, Copy)]
pub struct Heap<'a> {
    state: &'a AllocState,
}

impl<'a> Heap<'a> {
    /// Wraps an allocator state.
    pub fn new(state: &'a AllocState) -> Self {
        Self { state }
    }

    /// Allocates `size` bytes. Zero-size requests yield `None`, so the
    /// core never sees them.
    pub fn alloc(&self, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        Some(self.state.do_alloc(size))
    }

    /// Frees `p`. Null (zero) is a no-op.
    pub fn free(&self, p: usize) {
        self.state.do_dealloc(p);
    }

    /// Resizes `p` to `size` bytes.
    ///
    /// Null grows from nothing; zero size frees. A chunk already big
    /// enough is kept in place unless more than half of it would go to
    /// waste. Resizing a pointer outside the tracked range is a
    /// programmer error and fatal.
    pub fn realloc(&self, p: usize, size: usize) -> Option<usize> {
        if p == 0 {
            return self.alloc(size);
        }
        assert!(self.state.valid_chunk(p), "realloc of untracked pointer {p:#x}");
        if size == 0 {
            self.free(p);
            return None;
        }
        let chunk = self.state.chunk_size(p);
        if chunk >= size && chunk / 2 <= size {
            return Some(p);
        }
        let new_p = self.state.do_alloc(size);
        // The host owns the byte copy; addresses are all this layer moves.
        self.free(p);
        Some(new_p)
    }

    /// Usable size of `p`. Fatal for pointers outside the tracked range.
    pub fn usable_size(&self, p: usize) -> usize {
        assert!(self.state.valid_chunk(p), "usable_size of untracked pointer {p:#x}");
        self.state.chunk_size(p)
    }
}
