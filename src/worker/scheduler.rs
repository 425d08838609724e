//! Scheduling policy: range refill, work-stealing, master-request gating,
//! and dynamic role reassignment.
//!
//! # Refill order
//!
//! A thread whose range runs dry pulls from the global queue first; stealing
//! is the fallback. Victims are scanned in a fixed rotation starting at
//! `(my_id + 1) % N`, and a full fruitless rotation sets the `no_steal`
//! sentinel so peers stop hammering locks that cannot yield work. The
//! sentinel clears when the next chunk arrives.
//!
//! # Request gating
//!
//! Any thread that sees the global queue under `request_threshold` arms a
//! work request, but `work_requested` stays set from the moment the request
//! is armed until the master answers, so at most one request is ever in
//! flight. A slow master therefore delays refills instead of accumulating
//! duplicate grants.
//!
//! # Role policy
//!
//! Moving threads between front-end and back-end duty tracks queue
//! pressure:
//!
//! - When the backend queue exceeds `promote_hi` entries per back-end
//!   thread, the front-end thread that has deferred the most comparisons is
//!   asked to switch; it is feeding the backlog fastest and loses the least
//!   by switching.
//! - A back-end thread that polls an empty queue for a full drain cycle
//!   hands its slot back to the front end.
//! - Both moves keep at least one thread on each side of the pipeline.
//!
//! All role accounting happens under the single role lock; the counters are
//! atomics only so observers can read them without taking it.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::pipeline::SearchPipeline;
use crate::worker::node::NodeShared;
use crate::worker::state::ThreadRole;

/// Consecutive empty polls a back-end thread tolerates before treating the
/// queue as drained and offering its slot back to the front end.
pub(crate) const DRAIN_CYCLE_POLLS: u32 = 8;

impl<P: SearchPipeline> NodeShared<P> {
    /// Refill `tid`'s range from the global queue, or steal from a peer.
    /// Returns false when no work could be found anywhere.
    pub(crate) fn refill(&self, tid: usize) -> bool {
        if let Some(span) = self.global.pull(self.cfg.chunk_size) {
            self.ranges[tid].install(span);
            self.slots[tid].stats.global_pulls.fetch_add(1, Ordering::Relaxed);
            self.arm_work_request();
            return true;
        }
        // The queue is dry; make sure a refill is on its way before
        // falling back to stealing.
        self.arm_work_request();

        if !self.no_steal.load(Ordering::Acquire) {
            let n = self.cfg.num_threads;
            for k in 1..n {
                let victim = (tid + k) % n;
                let got = self.ranges[victim].steal(self.cfg.chunk_size, self.cfg.min_steal);
                if !got.is_empty() {
                    self.ranges[tid].install(got);
                    self.slots[tid].stats.steals.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
            }
            self.no_steal.store(true, Ordering::Release);
        }
        false
    }

    /// Arm a master work request if the global queue is low and none is
    /// outstanding. The flag transition runs under the request lock; the
    /// main thread performs the actual send.
    pub(crate) fn arm_work_request(&self) {
        if self.global.depth_ids() >= self.cfg.request_threshold {
            return;
        }
        if self.master_queue_empty.load(Ordering::Acquire)
            || self.work_requested.load(Ordering::Acquire)
        {
            return;
        }
        let _guard = self
            .work_request_lock
            .lock()
            .expect("work request lock poisoned");
        if self.master_queue_empty.load(Ordering::Acquire)
            || self.work_requested.load(Ordering::Acquire)
        {
            return;
        }
        self.work_requested.store(true, Ordering::Release);
        self.request_work.store(true, Ordering::Release);
    }

    /// Promotion check, run by front-end threads after deferring a
    /// comparison. Cheap double-checked read before the role lock.
    pub(crate) fn promote_if_backlogged(&self) {
        let nb = self.num_backend.load(Ordering::Acquire);
        if self.backend.depth() <= self.cfg.promote_hi * nb as u64 {
            return;
        }
        let _guard = self.role_lock.lock().expect("role lock poisoned");
        let nb = self.num_backend.load(Ordering::Acquire);
        if nb + 1 >= self.cfg.num_threads {
            return;
        }
        if self.backend.depth() <= self.cfg.promote_hi * nb as u64 {
            return;
        }
        // The heaviest feeder of the backlog switches sides.
        let mut victim: Option<(usize, u64)> = None;
        for (tid, slot) in self.slots.iter().enumerate() {
            if slot.role() != ThreadRole::Frontend || slot.has_pending_role() {
                continue;
            }
            let queued = slot.comparisons_queued.load(Ordering::Relaxed);
            if victim.map_or(true, |(_, best)| queued > best) {
                victim = Some((tid, queued));
            }
        }
        if let Some((tid, _)) = victim {
            self.num_backend.store(nb + 1, Ordering::Release);
            self.slots[tid].request_role(ThreadRole::Backend);
            tracing::debug!(thread = tid, backlog = self.backend.depth(), "moving thread to back-end duty");
        }
    }

    /// Self-service switch to back-end duty, used by a front-end thread
    /// that found no range work while the backend queue has backlog.
    pub(crate) fn try_become_backend(&self, tid: usize) -> bool {
        let _guard = self.role_lock.lock().expect("role lock poisoned");
        let nb = self.num_backend.load(Ordering::Acquire);
        if nb + 1 >= self.cfg.num_threads {
            return false;
        }
        self.num_backend.store(nb + 1, Ordering::Release);
        drop(_guard);
        self.apply_role(tid, ThreadRole::Backend);
        true
    }

    /// Hand a back-end slot back to the front end. Refused while this is
    /// the last back-end thread.
    pub(crate) fn try_become_frontend(&self, tid: usize) -> bool {
        let _guard = self.role_lock.lock().expect("role lock poisoned");
        let nb = self.num_backend.load(Ordering::Acquire);
        if nb <= 1 {
            return false;
        }
        self.num_backend.store(nb - 1, Ordering::Release);
        drop(_guard);
        self.apply_role(tid, ThreadRole::Frontend);
        true
    }

    /// Apply a role to `tid`'s slot. Called by the owning thread only, at a
    /// safe point between pipeline invocations; the role accounting has
    /// already happened under the role lock.
    ///
    /// A thread entering back-end duty returns its remaining range to the
    /// global queue so the ids stay reachable by front-end threads; the
    /// small remainder of a range is below every thief's steal floor and
    /// would otherwise be stranded.
    pub(crate) fn apply_role(&self, tid: usize, role: ThreadRole) {
        let slot = &self.slots[tid];
        slot.set_role(role);
        slot.stats.role_switches.fetch_add(1, Ordering::Relaxed);
        if role == ThreadRole::Backend {
            slot.comparisons_queued.store(0, Ordering::Relaxed);
            let flushed = self.ranges[tid].flush();
            if !flushed.is_empty() {
                self.global.push(flushed);
                self.gate.release_all();
            }
        }
        tracing::debug!(thread = tid, ?role, "role applied");
    }

    /// Whether a thread that found nothing to do may park at the gate.
    ///
    /// Sleeping is safe exactly when every source it could draw from is
    /// empty, because each way work can reappear (grant, range flush, the
    /// backend queue going non-empty) bumps the gate generation.
    pub(crate) fn worker_can_sleep(&self, tid: usize) -> bool {
        self.global.is_empty() && self.backend.is_empty() && self.ranges[tid].is_empty()
    }
}

/// Tiered idle backoff for threads that are momentarily out of work but
/// must not park: spin first, then yield, then sleep in short slices.
pub(crate) struct IdleBackoff {
    rounds: u32,
}

const SPIN_ROUNDS: u32 = 64;

impl IdleBackoff {
    pub(crate) fn new() -> Self {
        Self { rounds: 0 }
    }

    pub(crate) fn reset(&mut self) {
        self.rounds = 0;
    }

    pub(crate) fn step(&mut self) {
        self.rounds = self.rounds.saturating_add(1);
        if self.rounds <= SPIN_ROUNDS {
            std::hint::spin_loop();
        } else if self.rounds & 0x3 != 0 {
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_micros(100));
        }
    }
}
