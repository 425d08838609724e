//! Deferred-comparison queue and its free pool.
//!
//! Front-end threads enqueue comparisons that survived the cheap filters;
//! back-end threads drain them. Entries are boxed once and recycled through
//! a free pool, so the steady-state hot path performs no allocation.
//!
//! Two separate locks on purpose: producers touch the pool and then the
//! queue, consumers the queue and then the pool, and neither ever holds
//! both at once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::pipeline::{BackendEntry, FrontPartial};

/// FIFO of deferred comparisons plus the recycling pool.
pub struct BackendQueue<T> {
    queue: Mutex<VecDeque<Box<BackendEntry<T>>>>,
    pool: Mutex<Vec<Box<BackendEntry<T>>>>,
    /// Mirror of the queue length for lock-free backlog checks.
    depth: AtomicU64,
}

impl<T> Default for BackendQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BackendQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            pool: Mutex::new(Vec::new()),
            depth: AtomicU64::new(0),
        }
    }

    /// Build an entry from a front-end partial, reusing a pooled husk when
    /// one is available.
    pub fn acquire(
        &self,
        object_id: u64,
        payload: Arc<[u8]>,
        partial: FrontPartial<T>,
    ) -> Box<BackendEntry<T>> {
        let recycled = self.pool.lock().expect("backend pool lock poisoned").pop();
        match recycled {
            Some(mut entry) => {
                entry.object_id = object_id;
                entry.payload = payload;
                entry.partial = Some(partial.state);
                entry.forward_score = partial.forward_score;
                entry.null_score = partial.null_score;
                entry
            }
            None => Box::new(BackendEntry {
                object_id,
                payload,
                partial: Some(partial.state),
                forward_score: partial.forward_score,
                null_score: partial.null_score,
            }),
        }
    }

    /// Enqueue a deferred comparison. Returns true when the queue was empty
    /// before this push, so the caller can wake sleeping threads exactly on
    /// the empty-to-non-empty edge.
    pub fn push(&self, entry: Box<BackendEntry<T>>) -> bool {
        let mut queue = self.queue.lock().expect("backend queue lock poisoned");
        let was_empty = queue.is_empty();
        queue.push_back(entry);
        self.depth.fetch_add(1, Ordering::Relaxed);
        was_empty
    }

    /// Dequeue the oldest deferred comparison.
    pub fn pop(&self) -> Option<Box<BackendEntry<T>>> {
        let mut queue = self.queue.lock().expect("backend queue lock poisoned");
        let entry = queue.pop_front()?;
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Return a consumed entry to the free pool.
    pub fn release(&self, mut entry: Box<BackendEntry<T>>) {
        entry.partial = None;
        entry.payload = Arc::from(&[][..]);
        self.pool.lock().expect("backend pool lock poisoned").push(entry);
    }

    /// Entries waiting for a back-end thread.
    #[inline]
    pub fn depth(&self) -> u64 {
        self.depth.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Drop queued entries. Only called between searches; the pool is kept.
    pub fn clear(&self) {
        let mut queue = self.queue.lock().expect("backend queue lock poisoned");
        let mut pool = self.pool.lock().expect("backend pool lock poisoned");
        while let Some(mut entry) = queue.pop_front() {
            entry.partial = None;
            entry.payload = Arc::from(&[][..]);
            pool.push(entry);
        }
        self.depth.store(0, Ordering::Relaxed);
    }
}
