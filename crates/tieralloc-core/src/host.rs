//! Host capabilities the allocator consumes.
//!
//! The simulator host supplies two things the core cannot derive itself:
//! a dense id for the calling thread (it schedules at most one thread per
//! id) and an entropy source for bank selection in the banked central
//! lists. Both are injected behind this trait so hosted tests can pin
//! them down.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::size_class::MAX_THREADS;

/// What the host environment provides to the allocator.
pub trait HostEnv: Send + Sync {
    /// Dense id of the calling thread, below [`MAX_THREADS`]. At most one
    /// live thread maps to an id at a time.
    fn thread_id(&self) -> usize;

    /// Entropy for bank selection. A hardware source on a real host; any
    /// pseudo-random or round-robin stream is acceptable hosted.
    fn bank_hint(&self) -> u64;
}

/// Host implementation for ordinary OS threads.
///
/// Thread ids are dense and stable per thread, assigned from a global
/// counter on first use. Bank hints come from a per-thread xorshift
/// stream seeded from the thread id.
pub struct NativeHost;

static NEXT_TID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_ID: usize = NEXT_TID.fetch_add(1, Ordering::Relaxed);
    static HINT_STATE: Cell<u64> = const { Cell::new(0) };
}

impl HostEnv for NativeHost {
    fn thread_id(&self) -> usize {
        let tid = THREAD_ID.with(|id| *id);
        assert!(tid < MAX_THREADS, "host handed out more than {MAX_THREADS} thread ids");
        tid
    }

    fn bank_hint(&self) -> u64 {
        HINT_STATE.with(|state| {
            let mut x = state.get();
            if x == 0 {
                x = 0x9e37_79b9_7f4a_7c15 ^ (self.thread_id() as u64 + 1);
            }
            x ^= x >> 12;
            x ^= x << 25;
            x ^= x >> 27;
            state.set(x);
            x.wrapping_mul(0x2545_F491_4F6C_DD1D)
        })
    }
}

/// Host with a fixed thread id and a round-robin bank hint. Test helper.
pub struct RoundRobinHost {
    tid: usize,
    next_hint: AtomicU64,
}

impl RoundRobinHost {
    /// Host reporting `tid` for every call.
    pub fn new(tid: usize) -> Self {
        assert!(tid < MAX_THREADS);
        Self {
            tid,
            next_hint: AtomicU64::new(0),
        }
    }
}

impl HostEnv for RoundRobinHost {
    fn thread_id(&self) -> usize {
        self.tid
    }

    fn bank_hint(&self) -> u64 {
        self.next_hint.fetch_add(1, Ordering::Relaxed)
    }
}
