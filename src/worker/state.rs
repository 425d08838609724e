//! Per-thread shared slots: role cells and statistics.
//!
//! Each worker thread owns one [`ThreadSlot`]. The owner is the only writer
//! of its statistics; the scheduler writes the `pending_role` cell (under
//! the role lock) and reads `comparisons_queued` when choosing which
//! front-end thread to move to back-end duty. Slots are cache-line padded
//! because they sit in one contiguous array and the counters are hot.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Which half of the pipeline a thread is currently serving.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadRole {
    Frontend = 0,
    Backend = 1,
}

impl ThreadRole {
    fn from_u8(v: u8) -> ThreadRole {
        match v {
            0 => ThreadRole::Frontend,
            _ => ThreadRole::Backend,
        }
    }
}

/// Sentinel for "no role change requested".
const PENDING_NONE: u8 = u8::MAX;

/// Shared per-thread state.
pub struct ThreadSlot {
    /// Current role. Written by the owning thread only, at a safe point
    /// between pipeline invocations.
    role: AtomicU8,
    /// Role requested by the scheduler, applied by the owner at the next
    /// safe point. Written under the role lock.
    pending_role: AtomicU8,
    /// Comparisons this thread has deferred to the back end during the
    /// current search. The promotion policy picks the largest.
    pub comparisons_queued: AtomicU64,
    /// Per-search counters, owner-written, read after quiescence.
    pub stats: ThreadStats,
}

impl Default for ThreadSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadSlot {
    pub fn new() -> Self {
        Self {
            role: AtomicU8::new(ThreadRole::Frontend as u8),
            pending_role: AtomicU8::new(PENDING_NONE),
            comparisons_queued: AtomicU64::new(0),
            stats: ThreadStats::default(),
        }
    }

    #[inline]
    pub fn role(&self) -> ThreadRole {
        ThreadRole::from_u8(self.role.load(Ordering::Acquire))
    }

    /// Owner only. Used at search start and when applying a pending role.
    pub fn set_role(&self, role: ThreadRole) {
        self.role.store(role as u8, Ordering::Release);
    }

    /// Scheduler, under the role lock: request a transition.
    pub fn request_role(&self, role: ThreadRole) {
        self.pending_role.store(role as u8, Ordering::Release);
    }

    /// True if a transition has been requested and not yet applied.
    pub fn has_pending_role(&self) -> bool {
        self.pending_role.load(Ordering::Acquire) != PENDING_NONE
    }

    /// Owner only: consume a pending role request, if any.
    pub fn take_pending_role(&self) -> Option<ThreadRole> {
        let v = self.pending_role.swap(PENDING_NONE, Ordering::AcqRel);
        if v == PENDING_NONE {
            None
        } else {
            Some(ThreadRole::from_u8(v))
        }
    }

    /// Reset between searches.
    pub fn reset_for_search(&self, role: ThreadRole) {
        self.set_role(role);
        self.pending_role.store(PENDING_NONE, Ordering::Release);
        self.comparisons_queued.store(0, Ordering::Release);
        self.stats.reset();
    }
}

macro_rules! thread_stats {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Per-thread, per-search counters.
        ///
        /// Plain relaxed atomics: the owner increments, nobody else writes,
        /// and cross-thread reads only need to be exact after the owner has
        /// parked.
        #[derive(Default)]
        pub struct ThreadStats {
            $($(#[$doc])* pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`ThreadStats`].
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        pub struct ThreadStatsSnapshot {
            $(pub $name: u64,)*
        }

        impl ThreadStats {
            pub fn snapshot(&self) -> ThreadStatsSnapshot {
                ThreadStatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }

            fn reset(&self) {
                $(self.$name.store(0, Ordering::Relaxed);)*
            }
        }

        impl ThreadStatsSnapshot {
            pub fn merge(&mut self, other: &ThreadStatsSnapshot) {
                $(self.$name += other.$name;)*
            }
        }
    };
}

thread_stats! {
    /// Objects this thread pushed through the front end.
    objects_offered,
    /// Front-end comparisons that finished with no hit.
    front_pass,
    /// Objects rejected by an early filter.
    front_filtered,
    /// Comparisons deferred to the back end.
    backend_queued,
    /// Deferred comparisons this thread refined.
    backend_run,
    /// Hits this thread added to the collector.
    hits_found,
    /// Comparisons skipped after a pipeline error.
    comparison_errors,
    /// Successful steals from a peer's range.
    steals,
    /// Chunks pulled from the global queue.
    global_pulls,
    /// Role transitions applied.
    role_switches,
}

/// Whole-search statistics, merged from every thread at search end.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SearchStats {
    pub totals: ThreadStatsSnapshot,
    pub hits_uploaded: u64,
}
