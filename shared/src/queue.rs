//! Frame-indexed contiguous containers.

use crate::Frame;
use std::collections::VecDeque;

/// A contiguous, evictable mapping from frame number to a value.
///
/// The queue always represents a closed interval `[first, last]` of frames.
/// Appending extends the interval at the top, eviction advances it from the
/// bottom, and once a frame has been popped it can never be observed or
/// re-added. This is the backbone for client-submitted input buffers on the
/// server, for the client's own input history replayed during replacement,
/// and for the synchronized clock's tick emission log.
#[derive(Debug, Clone)]
pub struct IndexedQueue<T> {
    first: Frame,
    items: VecDeque<T>,
}

impl<T> IndexedQueue<T> {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates an empty queue whose next `add` returns `frame`.
    pub fn starting_at(frame: Frame) -> Self {
        Self { first: frame, items: VecDeque::new() }
    }

    /// Frame of the oldest retained entry.
    pub fn first_frame(&self) -> Frame {
        self.first
    }

    /// Frame of the newest entry; `first_frame() - 1` while empty.
    pub fn last_frame(&self) -> Frame {
        self.first + self.items.len() as Frame - 1
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Appends `value` at `last + 1` and returns that frame. Across any call
    /// sequence the returned frames are strictly increasing by 1.
    pub fn add(&mut self, value: T) -> Frame {
        self.items.push_back(value);
        self.last_frame()
    }

    /// Returns the value stored for `frame`, `None` outside `[first, last]`.
    pub fn get(&self, frame: Frame) -> Option<&T> {
        if frame < self.first {
            return None;
        }
        self.items.get((frame - self.first) as usize)
    }

    /// Resets the interval to start empty at `frame`; the next `add` returns
    /// `frame`.
    pub fn set(&mut self, frame: Frame) {
        self.items.clear();
        self.first = frame;
    }

    /// Evicts every entry with frame `<= frame`, including frames that were
    /// never added — those become permanent no-ops. Pops below the current
    /// `first` are rejected by early return, so reordered or repeated pops
    /// are idempotent and no frame is ever revisited.
    pub fn pop(&mut self, frame: Frame) {
        if frame < self.first {
            return;
        }
        let evicted = ((frame - self.first + 1) as usize).min(self.items.len());
        self.items.drain(..evicted);
        self.first = frame + 1;
    }
}

impl<T> Default for IndexedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
