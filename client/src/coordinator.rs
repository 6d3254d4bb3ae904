//! Coordination between the predictive tick loop and replacement replays.
//!
//! A replacement is one replay of the simulation from a fresh authoritative
//! snapshot. At most one may commit; starting a new one supersedes the
//! previous by bumping a generation counter, and the superseded replay
//! notices the bump and abandons itself without side effects.
//!
//! The coordinator also carries the confirmation stream: the input batches
//! the client applied speculatively, queued so each arriving authoritative
//! batch can be compared against exactly one speculative batch. The queue is
//! lock-free since the predictive loop and replacement threads feed it while
//! the network thread drains it.

use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use shared::{Frame, PooledBuffer};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Generation value marking the coordinator permanently stopped.
const STOPPED: i64 = i64::MAX;

struct ConfirmationEntry {
    generation: i64,
    frame: Frame,
    bytes: PooledBuffer,
}

pub struct ReplacementCoordinator {
    generation: AtomicI64,
    /// True while a replacement replay owns the confirmation stream.
    active: AtomicBool,
    confirmations: SegQueue<ConfirmationEntry>,
    /// Serializes generation transitions (acquire, commit, stop).
    guard: Mutex<()>,
}

impl ReplacementCoordinator {
    pub fn new() -> Self {
        Self {
            generation: AtomicI64::new(0),
            active: AtomicBool::new(false),
            confirmations: SegQueue::new(),
            guard: Mutex::new(()),
        }
    }

    pub fn current(&self) -> i64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether `generation` is no longer the live one. A superseded
    /// replacement must abandon itself without committing.
    pub fn is_superseded(&self, generation: i64) -> bool {
        self.current() != generation
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.current() == STOPPED
    }

    /// Starts a new replacement generation, superseding any live one and
    /// discarding stale confirmations. Returns `None` once stopped.
    pub fn acquire(&self) -> Option<i64> {
        let _guard = self.guard.lock();
        if self.is_stopped() {
            return None;
        }
        let generation = self.current() + 1;
        // Ownership is published before the generation: a push_live that
        // observes the new generation also observes the stream as owned.
        self.active.store(true, Ordering::Release);
        self.generation.store(generation, Ordering::Release);
        while self.confirmations.pop().is_some() {}
        Some(generation)
    }

    /// Queues a speculative batch produced by a replacement replay. Returns
    /// false if the replay was superseded, in which case nothing was queued
    /// that a reader will accept.
    pub fn offer(&self, generation: i64, frame: Frame, bytes: PooledBuffer) -> bool {
        if self.is_superseded(generation) {
            return false;
        }
        self.confirmations.push(ConfirmationEntry { generation, frame, bytes });
        !self.is_superseded(generation)
    }

    /// Queues a speculative batch from the live predictive loop. Dropped
    /// while a replacement owns the stream; its replay re-produces batches
    /// for those frames itself.
    pub fn push_live(&self, frame: Frame, bytes: PooledBuffer) {
        // The generation is read before the ownership check: an acquire
        // interleaving after the check then leaves this entry tagged with
        // the dead generation, and readers skip it.
        let generation = self.current();
        if self.is_active() || self.is_stopped() {
            return;
        }
        self.confirmations.push(ConfirmationEntry { generation, frame, bytes });
    }

    /// Takes the speculative batch queued for `frame`, skipping entries from
    /// dead generations. `None` means no live batch for that frame exists
    /// and the caller must treat the frame as mispredicted.
    pub fn next_confirmation(&self, frame: Frame) -> Option<PooledBuffer> {
        loop {
            let entry = self.confirmations.pop()?;
            if entry.generation != self.current() || entry.frame < frame {
                continue;
            }
            if entry.frame == frame {
                return Some(entry.bytes);
            }
            return None;
        }
    }

    /// Runs `commit` only if `generation` is still live, then releases the
    /// stream back to the predictive loop. `None` means superseded.
    pub fn complete<R>(&self, generation: i64, commit: impl FnOnce() -> R) -> Option<R> {
        let _guard = self.guard.lock();
        if self.is_superseded(generation) {
            return None;
        }
        let result = commit();
        self.active.store(false, Ordering::Release);
        Some(result)
    }

    /// Releases the stream without committing anything, used when a
    /// replacement turns out to be unnecessary.
    pub fn finish(&self, generation: i64) {
        let _guard = self.guard.lock();
        if !self.is_superseded(generation) {
            self.active.store(false, Ordering::Release);
        }
    }

    /// Permanently supersedes every present and future replacement.
    pub fn stop(&self) {
        let _guard = self.guard.lock();
        self.active.store(true, Ordering::Release);
        self.generation.store(STOPPED, Ordering::Release);
        while self.confirmations.pop().is_some() {}
    }
}

impl Default for ReplacementCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
