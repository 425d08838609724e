//! The start gate: where worker threads sleep when there is nothing to do.
//!
//! The gate is a generation-counted barrier. A thread that finds no work
//! anywhere first *observes* the generation, re-checks for work, and only
//! then waits; any event that creates work (search start, work grant, an
//! empty queue turning non-empty, shutdown) bumps the generation and wakes
//! everyone. The observe-check-wait order closes the lost-wakeup window: if
//! work arrived between the check and the wait, the generation has already
//! moved and the wait returns immediately.
//!
//! Release protocol, in order: bump the generation, reset the waiter count
//! to zero, broadcast. Waking threads that find nothing loop back through
//! observe-check-wait and park again, so a spurious release costs one scan.
//!
//! The waiter count doubles as the quiescence signal: when it equals the
//! thread count, no worker holds work in flight, so the main thread can
//! trust emptiness checks it makes while they sleep.

use std::sync::{Condvar, Mutex};

struct GateState {
    generation: u64,
    num_waiting: usize,
}

/// Generation-counted start barrier.
pub struct StartGate {
    state: Mutex<GateState>,
    start: Condvar,
}

impl Default for StartGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StartGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                generation: 0,
                num_waiting: 0,
            }),
            start: Condvar::new(),
        }
    }

    /// Snapshot the generation. Call before re-checking for work.
    pub fn observe(&self) -> u64 {
        self.state.lock().expect("gate lock poisoned").generation
    }

    /// Park until the generation moves past `observed`. Returns immediately
    /// if it already has.
    pub fn wait(&self, observed: u64) {
        let mut state = self.state.lock().expect("gate lock poisoned");
        if state.generation != observed {
            return;
        }
        state.num_waiting += 1;
        while state.generation == observed {
            state = self.start.wait(state).expect("gate lock poisoned");
        }
    }

    /// Wake every waiter and reset the waiter count.
    pub fn release_all(&self) {
        let mut state = self.state.lock().expect("gate lock poisoned");
        state.generation = state.generation.wrapping_add(1);
        state.num_waiting = 0;
        self.start.notify_all();
    }

    /// How many threads are parked right now.
    pub fn waiting(&self) -> usize {
        self.state.lock().expect("gate lock poisoned").num_waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn wait_returns_immediately_on_stale_generation() {
        let gate = StartGate::new();
        let gen = gate.observe();
        gate.release_all();
        // Generation moved between observe and wait: no parking.
        gate.wait(gen);
        assert_eq!(gate.waiting(), 0);
    }

    #[test]
    fn release_wakes_all_waiters() {
        let gate = Arc::new(StartGate::new());
        let woken = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            let woken = Arc::clone(&woken);
            handles.push(thread::spawn(move || {
                let gen = gate.observe();
                gate.wait(gen);
                woken.fetch_add(1, Ordering::Relaxed);
            }));
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while gate.waiting() < 4 {
            assert!(Instant::now() < deadline, "threads never parked");
            thread::yield_now();
        }
        gate.release_all();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::Relaxed), 4);
        assert_eq!(gate.waiting(), 0);
    }

    #[test]
    fn waiting_counts_parked_threads() {
        let gate = Arc::new(StartGate::new());
        let g2 = Arc::clone(&gate);
        let h = thread::spawn(move || {
            let gen = g2.observe();
            g2.wait(gen);
        });
        let deadline = Instant::now() + Duration::from_secs(5);
        while gate.waiting() != 1 {
            assert!(Instant::now() < deadline, "thread never parked");
            thread::yield_now();
        }
        gate.release_all();
        h.join().unwrap();
    }
}
