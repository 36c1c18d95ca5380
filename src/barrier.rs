//! Reusable spinning barrier.
//!
//! Every phase transition of the radix join goes through one of these. The
//! last thread to arrive runs an optional callback before releasing the
//! others, which is where phase-level logging and timing happen.
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::{Backoff, CachePadded};

pub struct Barrier {
    threads: usize,
    /// Threads still expected in the current round.
    remaining: CachePadded<AtomicUsize>,
    /// Completed rounds; waiters spin until it moves.
    round: CachePadded<AtomicUsize>,
}

impl Barrier {
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0, "barrier needs at least one thread");
        Self {
            threads,
            remaining: CachePadded::new(AtomicUsize::new(threads)),
            round: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Blocks until all threads arrived. Returns `true` on exactly one
    /// thread, the last arriver.
    pub fn wait(&self) -> bool {
        self.wait_with(|| true)
    }

    /// Like [`wait`](Self::wait), but the last arriver runs `last` before
    /// anyone is released and returns its result. Everyone else gets `false`.
    pub fn wait_with<F: FnOnce() -> bool>(&self, last: F) -> bool {
        // Must be read before we count ourselves in.
        let round = self.round.load(Ordering::Acquire);

        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.remaining.store(self.threads, Ordering::Relaxed);
            let r = last();
            self.round.fetch_add(1, Ordering::Release);
            r
        } else {
            let backoff = Backoff::new();
            while self.round.load(Ordering::Acquire) == round {
                backoff.snooze();
            }
            false
        }
    }
}
