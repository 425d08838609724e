//! Per-thread work ranges with an owner-take / thief-steal split.
//!
//! A [`WorkRange`] is the slice of the object-id space a thread is currently
//! responsible for. The owner advances `start`; a thief reduces `end` and
//! walks away with the upper half. Both mutations happen under the range's
//! own lock, so the two pointers can never cross.
//!
//! # Invariants
//!
//! - `start <= end` at all times; the range is exhausted when they meet.
//! - `start` is monotonically non-decreasing and `end` monotonically
//!   non-increasing between installs.
//! - A thread holding a range lock never acquires any other engine lock.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// A half-open span `[start, end)` of global object ids.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSpan {
    pub start: u64,
    pub end: u64,
}

impl WorkSpan {
    #[inline]
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// The empty span.
    #[inline]
    pub fn empty() -> Self {
        Self { start: 0, end: 0 }
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Iterate the ids in the span.
    #[inline]
    pub fn ids(&self) -> std::ops::Range<u64> {
        self.start..self.end
    }
}

/// The work descriptor owned by one worker thread.
pub struct WorkRange {
    span: Mutex<WorkSpan>,
}

impl Default for WorkRange {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkRange {
    pub fn new() -> Self {
        Self {
            span: Mutex::new(WorkSpan::empty()),
        }
    }

    /// Owner only: advance `start` by up to `n` ids and return the taken
    /// sub-span. Returns the empty span if the range is exhausted.
    pub fn take_local(&self, n: u64) -> WorkSpan {
        let mut span = self.span.lock().expect("work range lock poisoned");
        let take = n.min(span.len());
        let out = WorkSpan::new(span.start, span.start + take);
        span.start += take;
        out
    }

    /// Thief: split off the upper half of the victim's range, bounded by
    /// `max`. Ranges shorter than `2 * min_steal` are not split; the owner
    /// drains those faster than a thief could.
    ///
    /// The upper half is returned so the victim's `take_local` pointer does
    /// not collide with the thief.
    pub fn steal(&self, max: u64, min_steal: u64) -> WorkSpan {
        let mut span = self.span.lock().expect("work range lock poisoned");
        let len = span.len();
        if len < 2 * min_steal {
            return WorkSpan::empty();
        }
        let half = len.div_ceil(2);
        let take = half.min(max);
        let out = WorkSpan::new(span.end - take, span.end);
        span.end -= take;
        out
    }

    /// Install a freshly pulled or stolen span as this thread's range.
    ///
    /// Only called by the owner, and only when its range is exhausted.
    pub fn install(&self, new: WorkSpan) {
        let mut span = self.span.lock().expect("work range lock poisoned");
        debug_assert!(span.is_empty(), "installing over live work");
        *span = new;
    }

    /// Take everything that remains, leaving the range empty. Used when a
    /// thread leaves front-end duty and returns its work to the global
    /// queue.
    pub fn flush(&self) -> WorkSpan {
        let mut span = self.span.lock().expect("work range lock poisoned");
        let out = *span;
        *span = WorkSpan::empty();
        out
    }

    /// Remaining id count.
    pub fn remaining(&self) -> u64 {
        self.span.lock().expect("work range lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn take_local_advances_start() {
        let r = WorkRange::new();
        r.install(WorkSpan::new(10, 100));
        assert_eq!(r.take_local(16), WorkSpan::new(10, 26));
        assert_eq!(r.take_local(16), WorkSpan::new(26, 42));
        assert_eq!(r.remaining(), 58);
    }

    #[test]
    fn take_local_clamps_to_remaining() {
        let r = WorkRange::new();
        r.install(WorkSpan::new(0, 10));
        assert_eq!(r.take_local(64), WorkSpan::new(0, 10));
        assert!(r.take_local(64).is_empty());
    }

    #[test]
    fn steal_takes_upper_half() {
        let r = WorkRange::new();
        r.install(WorkSpan::new(0, 100));
        let got = r.steal(256, 16);
        assert_eq!(got, WorkSpan::new(50, 100));
        assert_eq!(r.remaining(), 50);
    }

    #[test]
    fn steal_bounded_by_max() {
        let r = WorkRange::new();
        r.install(WorkSpan::new(0, 1000));
        let got = r.steal(100, 16);
        assert_eq!(got, WorkSpan::new(900, 1000));
    }

    #[test]
    fn steal_respects_min_steal_floor() {
        let r = WorkRange::new();
        r.install(WorkSpan::new(0, 31));
        assert!(r.steal(256, 16).is_empty());
        assert_eq!(r.remaining(), 31);
        r.flush();
        r.install(WorkSpan::new(0, 32));
        assert_eq!(r.steal(256, 16), WorkSpan::new(16, 32));
    }

    #[test]
    fn flush_empties_the_range() {
        let r = WorkRange::new();
        r.install(WorkSpan::new(5, 50));
        assert_eq!(r.flush(), WorkSpan::new(5, 50));
        assert!(r.is_empty());
        assert!(r.flush().is_empty());
    }

    proptest! {
        /// Any interleaving of takes and steals partitions the original
        /// span: no id is lost, none is handed out twice.
        #[test]
        fn take_steal_conserve_ids(
            len in 0u64..10_000,
            ops in prop::collection::vec((prop::bool::ANY, 1u64..512), 0..64),
        ) {
            let r = WorkRange::new();
            r.install(WorkSpan::new(0, len));
            let mut seen = Vec::new();
            for (is_steal, n) in ops {
                let got = if is_steal { r.steal(n, 16) } else { r.take_local(n) };
                if !got.is_empty() {
                    seen.push(got);
                }
            }
            seen.push(r.flush());
            let total: u64 = seen.iter().map(WorkSpan::len).sum();
            prop_assert_eq!(total, len);
            // Spans must be disjoint: sort and check for overlap.
            seen.sort_by_key(|s| s.start);
            for pair in seen.windows(2) {
                prop_assert!(pair[0].end <= pair[1].start || pair[1].is_empty() || pair[0].is_empty());
            }
        }
    }
}
