//! The node-wide queue of work chunks received from the master.
//!
//! Chunks arrive one per grant, are consumed whole or split at the head,
//! and never need random access. The queue also tracks the total id count
//! it still holds, because the low-water check that arms a master work
//! request runs on every refill and must not walk the list.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::range::WorkSpan;

/// FIFO of granted work chunks, drained into per-thread ranges.
pub struct GlobalQueue {
    chunks: Mutex<VecDeque<WorkSpan>>,
    /// Sum of `len()` over queued chunks. Kept outside the lock so the
    /// low-water check is a single atomic load.
    ids_remaining: AtomicU64,
}

impl Default for GlobalQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalQueue {
    pub fn new() -> Self {
        Self {
            chunks: Mutex::new(VecDeque::new()),
            ids_remaining: AtomicU64::new(0),
        }
    }

    /// Append a chunk. Empty spans are dropped.
    pub fn push(&self, span: WorkSpan) {
        if span.is_empty() {
            return;
        }
        let mut chunks = self.chunks.lock().expect("global queue lock poisoned");
        self.ids_remaining.fetch_add(span.len(), Ordering::Relaxed);
        chunks.push_back(span);
    }

    /// Detach up to `max_ids` from the head. A head chunk larger than
    /// `max_ids` is split; the remainder stays at the head so chunk order
    /// is preserved.
    pub fn pull(&self, max_ids: u64) -> Option<WorkSpan> {
        debug_assert!(max_ids > 0);
        let mut chunks = self.chunks.lock().expect("global queue lock poisoned");
        let head = chunks.front_mut()?;
        let out = if head.len() <= max_ids {
            let out = *head;
            chunks.pop_front();
            out
        } else {
            let out = WorkSpan::new(head.start, head.start + max_ids);
            head.start += max_ids;
            out
        };
        self.ids_remaining.fetch_sub(out.len(), Ordering::Relaxed);
        Some(out)
    }

    /// Total object ids still queued.
    #[inline]
    pub fn depth_ids(&self) -> u64 {
        self.ids_remaining.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.depth_ids() == 0
    }

    /// Drop everything. Only called between searches.
    pub fn clear(&self) {
        let mut chunks = self.chunks.lock().expect("global queue lock poisoned");
        chunks.clear();
        self.ids_remaining.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_splits_large_head() {
        let q = GlobalQueue::new();
        q.push(WorkSpan::new(0, 1000));
        assert_eq!(q.pull(256), Some(WorkSpan::new(0, 256)));
        assert_eq!(q.depth_ids(), 744);
        assert_eq!(q.pull(256), Some(WorkSpan::new(256, 512)));
    }

    #[test]
    fn pull_takes_small_head_whole() {
        let q = GlobalQueue::new();
        q.push(WorkSpan::new(0, 100));
        q.push(WorkSpan::new(500, 600));
        assert_eq!(q.pull(256), Some(WorkSpan::new(0, 100)));
        assert_eq!(q.pull(256), Some(WorkSpan::new(500, 600)));
        assert_eq!(q.pull(256), None);
        assert!(q.is_empty());
    }

    #[test]
    fn depth_tracks_pushes_and_pulls() {
        let q = GlobalQueue::new();
        assert_eq!(q.depth_ids(), 0);
        q.push(WorkSpan::new(0, 10));
        q.push(WorkSpan::new(20, 50));
        assert_eq!(q.depth_ids(), 40);
        q.pull(5);
        assert_eq!(q.depth_ids(), 35);
        q.clear();
        assert_eq!(q.depth_ids(), 0);
    }

    #[test]
    fn empty_push_is_dropped() {
        let q = GlobalQueue::new();
        q.push(WorkSpan::empty());
        assert_eq!(q.pull(16), None);
    }
}
