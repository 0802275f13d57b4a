use std::collections::{HashMap, VecDeque};

use thiserror::Error;

/// Identifies a frame in the buffer pool.
pub type FrameId = usize;

/// Errors returned by replacer operations. Both variants are
/// precondition violations on the caller's side; the buffer pool never
/// triggers them when its own invariants hold.
#[derive(Debug, Error)]
pub enum ReplacerError {
    /// The frame id is outside the replacer's capacity, or the frame has
    /// never been recorded.
    #[error("invalid frame id {frame_id} (capacity {capacity})")]
    InvalidFrame { frame_id: FrameId, capacity: usize },
    /// Attempted to remove a frame that is pinned in.
    #[error("frame {0} is not evictable")]
    NotEvictable(FrameId),
}

/// Eviction policy for buffer pool frames.
pub trait Replacer {
    /// Chooses a victim frame for eviction and stops tracking it.
    fn evict(&mut self) -> Option<FrameId>;

    /// Records an access to a frame, tracking it from the first access
    /// on. Does not change evictability.
    fn record_access(&mut self, frame_id: FrameId) -> Result<(), ReplacerError>;

    /// Adds or removes a tracked frame from eviction consideration.
    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) -> Result<(), ReplacerError>;

    /// Stops tracking a frame regardless of its access history. No-op
    /// for untracked frames; removing a non-evictable frame is an error.
    fn remove(&mut self, frame_id: FrameId) -> Result<(), ReplacerError>;

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

/// Access history for one frame: the timestamps of its up to `k` most
/// recent accesses, oldest first.
#[derive(Debug, Default)]
struct LRUKNode {
    history: VecDeque<u64>,
    evictable: bool,
}

impl LRUKNode {
    fn record(&mut self, timestamp: u64, k: usize) {
        self.history.push_back(timestamp);
        if self.history.len() > k {
            self.history.pop_front();
        }
    }
}

/// LRU-K replacer: evicts the frame whose k-th most recent access is
/// furthest in the past. Frames with fewer than `k` recorded accesses
/// have infinite backward k-distance and are preferred as victims,
/// tie-broken by their earliest recorded access.
#[derive(Debug)]
pub struct LRUKReplacer {
    node_store: HashMap<FrameId, LRUKNode>,
    current_timestamp: u64,
    curr_size: usize,
    replacer_size: usize,
    k: usize,
}

impl LRUKReplacer {
    /// Creates a replacer tracking up to `capacity` frames with history
    /// depth `k`.
    pub fn new(capacity: usize, k: usize) -> Self {
        Self {
            node_store: HashMap::with_capacity(capacity),
            current_timestamp: 0,
            curr_size: 0,
            replacer_size: capacity,
            k,
        }
    }
}

impl Replacer for LRUKReplacer {
    fn evict(&mut self) -> Option<FrameId> {
        // (frame, has full history, oldest retained access). For frames
        // with full history the oldest retained access is the k-th most
        // recent, so minimizing it maximizes the k-distance; for short
        // histories it is the first access ever, the classic-LRU
        // tie-break.
        let mut victim: Option<(FrameId, bool, u64)> = None;
        for (&frame_id, node) in &self.node_store {
            if !node.evictable {
                continue;
            }
            let Some(&oldest) = node.history.front() else {
                continue;
            };
            let full = node.history.len() >= self.k;
            let better = match victim {
                None => true,
                Some((_, best_full, best_oldest)) => match (full, best_full) {
                    // Infinite k-distance always beats a finite one.
                    (false, true) => true,
                    (true, false) => false,
                    _ => oldest < best_oldest,
                },
            };
            if better {
                victim = Some((frame_id, full, oldest));
            }
        }
        let (frame_id, _, _) = victim?;
        self.node_store.remove(&frame_id);
        self.curr_size -= 1;
        Some(frame_id)
    }

    fn record_access(&mut self, frame_id: FrameId) -> Result<(), ReplacerError> {
        if frame_id >= self.replacer_size {
            return Err(ReplacerError::InvalidFrame {
                frame_id,
                capacity: self.replacer_size,
            });
        }
        let timestamp = self.current_timestamp;
        let k = self.k;
        let node = self.node_store.entry(frame_id).or_default();
        node.record(timestamp, k);
        self.current_timestamp += 1;
        Ok(())
    }

    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) -> Result<(), ReplacerError> {
        let capacity = self.replacer_size;
        let node = self
            .node_store
            .get_mut(&frame_id)
            .ok_or(ReplacerError::InvalidFrame { frame_id, capacity })?;
        if node.evictable != evictable {
            node.evictable = evictable;
            if evictable {
                self.curr_size += 1;
            } else {
                self.curr_size -= 1;
            }
        }
        Ok(())
    }

    fn remove(&mut self, frame_id: FrameId) -> Result<(), ReplacerError> {
        match self.node_store.get(&frame_id) {
            None => Ok(()),
            Some(node) if !node.evictable => Err(ReplacerError::NotEvictable(frame_id)),
            Some(_) => {
                self.node_store.remove(&frame_id);
                self.curr_size -= 1;
                Ok(())
            }
        }
    }

    fn size(&self) -> usize {
        self.curr_size
    }
}
