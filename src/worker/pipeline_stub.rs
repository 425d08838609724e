//! Programmable pipeline stub for scheduler tests.
//!
//! The real comparison engine is a black box; scheduler correctness tests
//! need a pipeline whose behavior is chosen per scenario and whose
//! observations can be asserted afterwards. The stub records every object
//! id offered to the front end (the exactly-once ledger) and lets tests
//! program the defer predicate, per-id delays, and back-end hit production.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::pipeline::{
    BackendEntry, FrontOutcome, FrontPartial, Hit, PipelineError, SearchPipeline, SearchQuery,
};
use crate::shard::SeqObject;

type IdPredicate = Box<dyn Fn(u64) -> bool + Send + Sync>;
type DelayFn = Box<dyn Fn(u64) -> Duration + Send + Sync>;
type HitFn = Box<dyn Fn(u64) -> Option<(f64, f64)> + Send + Sync>;

/// Deterministic, programmable [`SearchPipeline`].
pub struct StubPipeline {
    need_backend: IdPredicate,
    front_error: IdPredicate,
    front_delay: DelayFn,
    back_delay: Duration,
    backend_hit: HitFn,
    offered: Mutex<HashMap<u64, u64>>,
    setup_calls: AtomicU64,
}

impl Default for StubPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl StubPipeline {
    /// A stub where every comparison finishes in the front end instantly.
    pub fn new() -> Self {
        Self {
            need_backend: Box::new(|_| false),
            front_error: Box::new(|_| false),
            front_delay: Box::new(|_| Duration::ZERO),
            back_delay: Duration::ZERO,
            backend_hit: Box::new(|id| Some((id as f64, 0.0))),
            offered: Mutex::new(HashMap::new()),
            setup_calls: AtomicU64::new(0),
        }
    }

    /// Defer ids matching the predicate to the back end.
    pub fn with_need_backend(mut self, f: impl Fn(u64) -> bool + Send + Sync + 'static) -> Self {
        self.need_backend = Box::new(f);
        self
    }

    /// Fail the front-end comparison for matching ids.
    pub fn with_front_error(mut self, f: impl Fn(u64) -> bool + Send + Sync + 'static) -> Self {
        self.front_error = Box::new(f);
        self
    }

    /// Sleep this long in the front end, per id. Models slow objects.
    pub fn with_front_delay(
        mut self,
        f: impl Fn(u64) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.front_delay = Box::new(f);
        self
    }

    /// Sleep this long in every back-end refinement.
    pub fn with_back_delay(mut self, d: Duration) -> Self {
        self.back_delay = d;
        self
    }

    /// Score function for back-end hits; `None` means no hit.
    pub fn with_backend_hit(
        mut self,
        f: impl Fn(u64) -> Option<(f64, f64)> + Send + Sync + 'static,
    ) -> Self {
        self.backend_hit = Box::new(f);
        self
    }

    /// How many times each id was offered to the front end.
    pub fn offered_counts(&self) -> HashMap<u64, u64> {
        self.offered.lock().expect("offered lock poisoned").clone()
    }

    /// Total front-end offers, duplicates included.
    pub fn offered_total(&self) -> u64 {
        self.offered
            .lock()
            .expect("offered lock poisoned")
            .values()
            .sum()
    }

    /// `begin_search` invocations so far (one per thread per search).
    pub fn setup_calls(&self) -> u64 {
        self.setup_calls.load(Ordering::Relaxed)
    }

    /// Forget recorded offers, for reuse across searches in one test.
    pub fn reset_observations(&self) {
        self.offered.lock().expect("offered lock poisoned").clear();
        self.setup_calls.store(0, Ordering::Relaxed);
    }
}

impl SearchPipeline for StubPipeline {
    type Scratch = ();
    type Partial = ();

    fn new_scratch(&self) -> Self::Scratch {}

    fn begin_search(&self, _scratch: &mut Self::Scratch, _query: &SearchQuery) {
        self.setup_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn front(
        &self,
        _scratch: &mut Self::Scratch,
        _query: &SearchQuery,
        object: &SeqObject,
    ) -> Result<FrontOutcome<()>, PipelineError> {
        *self
            .offered
            .lock()
            .expect("offered lock poisoned")
            .entry(object.id)
            .or_insert(0) += 1;

        let delay = (self.front_delay)(object.id);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if (self.front_error)(object.id) {
            return Err(PipelineError {
                object_id: object.id,
                reason: "programmed front-end failure".to_string(),
            });
        }
        if (self.need_backend)(object.id) {
            Ok(FrontOutcome::NeedBackend(FrontPartial {
                state: (),
                forward_score: object.id as f64,
                null_score: 0.0,
            }))
        } else {
            Ok(FrontOutcome::Pass)
        }
    }

    fn back(
        &self,
        _scratch: &mut Self::Scratch,
        _query: &SearchQuery,
        entry: &mut BackendEntry<()>,
    ) -> Result<Option<Hit>, PipelineError> {
        if !self.back_delay.is_zero() {
            std::thread::sleep(self.back_delay);
        }
        entry.partial.take();
        Ok((self.backend_hit)(entry.object_id).map(|(primary, secondary)| Hit {
            object_id: entry.object_id,
            primary_key: primary,
            secondary_key: secondary,
            payload: Vec::new(),
        }))
    }
}
