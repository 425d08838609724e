//! The worker node: lifecycle, worker-thread loop, and master main loop.
//!
//! # Architecture
//!
//! ```text
//!   Master ──channel──► main thread ──► GlobalQueue ──► WorkRange[i]
//!                            │                              │ take/steal
//!                            │ release                      ▼
//!                            ▼                      front-end threads
//!                        StartGate ◄── park ──┐             │ defer
//!                            ▲                │             ▼
//!                            └── wake ── BackendQueue ── back-end threads
//!                                                           │ hits
//!                                                           ▼
//!                                                      HitCollector ──► HitsUpload
//! ```
//!
//! The main thread is the only reader of the master channel, the only
//! writer of the search phase, and the only initiator of shutdown. Worker
//! threads communicate back exclusively through shared state: queues, the
//! hit collector, per-thread slots, and the fatal-diagnostic cell.
//!
//! # Lock order
//!
//! Locks nest only in this order (release order is free):
//!
//! 1. role lock
//! 2. gate lock
//! 3. global queue lock
//! 4. work request lock
//! 5. backend queue lock
//! 6. backend pool lock
//! 7. hit list lock
//! 8. any single range lock
//!
//! In particular, a thread holding a range lock never touches the global
//! queue lock; range flushes take the range lock, release it, and only then
//! push. No pipeline invocation runs under any shared lock.

use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use crate::config::WorkerConfig;
use crate::pipeline::{FrontOutcome, SearchKind, SearchPipeline, SearchQuery};
use crate::protocol::{MasterLink, MasterMsg, WorkerMsg};
use crate::shard::{shard_of, DbShard};
use crate::worker::backend_queue::BackendQueue;
use crate::worker::gate::StartGate;
use crate::worker::global_queue::GlobalQueue;
use crate::worker::hits::HitCollector;
use crate::worker::range::{WorkRange, WorkSpan};
use crate::worker::scheduler::{IdleBackoff, DRAIN_CYCLE_POLLS};
use crate::worker::state::{SearchStats, ThreadRole, ThreadSlot, ThreadStatsSnapshot};

/// Where the node is in the search lifecycle.
///
/// The `…Continue` variants exist so a thread that went to sleep waiting
/// for more work does not repeat start-of-search setup when a later grant
/// wakes it. The transition out of the initial variant happens exactly
/// once, when the first grant after the start message arrives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SearchPhase {
    Idle = 0,
    Sequence = 1,
    SequenceContinue = 2,
    Profile = 3,
    ProfileContinue = 4,
}

impl SearchPhase {
    fn from_u8(v: u8) -> SearchPhase {
        match v {
            1 => SearchPhase::Sequence,
            2 => SearchPhase::SequenceContinue,
            3 => SearchPhase::Profile,
            4 => SearchPhase::ProfileContinue,
            _ => SearchPhase::Idle,
        }
    }

    fn initial_for(kind: SearchKind) -> SearchPhase {
        match kind {
            SearchKind::Sequence => SearchPhase::Sequence,
            SearchKind::Profile => SearchPhase::Profile,
        }
    }

    /// A search is underway.
    pub fn is_active(self) -> bool {
        self != SearchPhase::Idle
    }

    /// At least one grant beyond the initial range has arrived.
    pub fn is_continue(self) -> bool {
        matches!(self, SearchPhase::SequenceContinue | SearchPhase::ProfileContinue)
    }
}

/// Setup failures. Fatal before the node runs.
#[derive(Debug)]
pub enum SetupError {
    /// Configuration constraint violated.
    Config(String),
    /// No database shards were provided.
    NoDatabases,
    /// A worker thread could not be spawned.
    ThreadSpawn(io::Error),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::Config(msg) => write!(f, "invalid configuration: {msg}"),
            SetupError::NoDatabases => write!(f, "no database shards loaded"),
            SetupError::ThreadSpawn(e) => write!(f, "failed to spawn worker thread: {e}"),
        }
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SetupError::ThreadSpawn(e) => Some(e),
            _ => None,
        }
    }
}

/// Failures surfaced by the main loop. Either way the node has already
/// initiated shutdown and sent the master a diagnostic when one applies.
#[derive(Debug)]
pub enum NodeError {
    /// Malformed or out-of-order master message.
    Protocol(String),
    /// A worker-side fatal condition (thread panic, resource exhaustion).
    Fatal(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            NodeError::Fatal(msg) => write!(f, "fatal worker error: {msg}"),
        }
    }
}

impl std::error::Error for NodeError {}

/// Outcome of one scheduling step of a worker thread.
enum StepOutcome {
    /// Ran at least one comparison.
    Progress,
    /// Front-end thread's range is exhausted.
    NoFrontWork,
    /// Back-end thread found the queue empty.
    NoBackendWork,
}

/// Everything the worker threads and the main thread share.
pub(crate) struct NodeShared<P: SearchPipeline> {
    pub(crate) cfg: WorkerConfig,
    pub(crate) shards: Vec<Arc<dyn DbShard>>,
    pub(crate) pipeline: Arc<P>,

    pub(crate) slots: Vec<CachePadded<ThreadSlot>>,
    pub(crate) ranges: Vec<WorkRange>,

    /// Guards role transitions; `num_backend` is its atomic mirror.
    pub(crate) role_lock: Mutex<()>,
    pub(crate) num_backend: AtomicUsize,

    pub(crate) gate: StartGate,
    pub(crate) global: GlobalQueue,

    /// Serializes transitions of the three request flags below.
    pub(crate) work_request_lock: Mutex<()>,
    /// Main thread should send a work request.
    pub(crate) request_work: AtomicBool,
    /// A request is in flight; gates re-arming until the master answers.
    pub(crate) work_requested: AtomicBool,
    /// The master has no more work for this search.
    pub(crate) master_queue_empty: AtomicBool,

    pub(crate) backend: BackendQueue<P::Partial>,
    pub(crate) hits: HitCollector,

    /// Stealing recently failed a full rotation; cleared on new work.
    pub(crate) no_steal: AtomicBool,
    pub(crate) shutdown: AtomicBool,

    phase: AtomicU8,
    /// Bumped once per search; threads key per-search setup off it.
    search_gen: AtomicU64,
    query: Mutex<Option<Arc<SearchQuery>>>,

    /// Worker-to-main fatal diagnostics. Workers set it; only the main
    /// thread acts on it.
    fatal: Mutex<Option<String>>,
    fatal_flag: AtomicBool,

    last_search_stats: Mutex<Option<SearchStats>>,
}

impl<P: SearchPipeline> NodeShared<P> {
    pub(crate) fn phase(&self) -> SearchPhase {
        SearchPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: SearchPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub(crate) fn record_fatal(&self, message: String) {
        let mut cell = self.fatal.lock().expect("fatal cell poisoned");
        if cell.is_none() {
            *cell = Some(message);
        }
        self.fatal_flag.store(true, Ordering::Release);
    }

    fn take_fatal(&self) -> Option<String> {
        if !self.fatal_flag.load(Ordering::Acquire) {
            return None;
        }
        self.fatal.lock().expect("fatal cell poisoned").take()
    }

    /// One front-end scheduling step: drain a batch of the thread's range
    /// through the filter stage.
    fn frontend_step(
        &self,
        tid: usize,
        scratch: &mut P::Scratch,
        query: &SearchQuery,
    ) -> StepOutcome {
        let batch = self.ranges[tid].take_local(self.cfg.batch_size);
        if batch.is_empty() {
            return StepOutcome::NoFrontWork;
        }
        let slot = &self.slots[tid];
        let shard = &self.shards[query.database as usize];
        for id in batch.ids() {
            if shard_of(id, self.cfg.num_shards) != self.cfg.my_shard {
                continue;
            }
            let object = match shard.object_at(id) {
                Ok(object) => object,
                Err(e) => {
                    slot.stats.comparison_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(thread = tid, id, error = %e, "object fetch failed");
                    continue;
                }
            };
            slot.stats.objects_offered.fetch_add(1, Ordering::Relaxed);
            match self.pipeline.front(scratch, query, &object) {
                Ok(FrontOutcome::Pass) => {
                    slot.stats.front_pass.fetch_add(1, Ordering::Relaxed);
                }
                Ok(FrontOutcome::Fail) => {
                    slot.stats.front_filtered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(FrontOutcome::NeedBackend(partial)) => {
                    let entry = self.backend.acquire(id, object.data, partial);
                    let was_empty = self.backend.push(entry);
                    slot.comparisons_queued.fetch_add(1, Ordering::Relaxed);
                    slot.stats.backend_queued.fetch_add(1, Ordering::Relaxed);
                    if was_empty {
                        // Sleeping back-end threads only wake on the gate.
                        self.gate.release_all();
                    }
                    self.promote_if_backlogged();
                }
                Err(e) => {
                    slot.stats.comparison_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(thread = tid, error = %e, "front-end comparison failed");
                }
            }
        }
        self.arm_work_request();
        StepOutcome::Progress
    }

    /// One back-end scheduling step: refine one deferred comparison.
    fn backend_step(
        &self,
        tid: usize,
        scratch: &mut P::Scratch,
        query: &SearchQuery,
    ) -> StepOutcome {
        let Some(mut entry) = self.backend.pop() else {
            return StepOutcome::NoBackendWork;
        };
        let slot = &self.slots[tid];
        slot.stats.backend_run.fetch_add(1, Ordering::Relaxed);
        match self.pipeline.back(scratch, query, &mut entry) {
            Ok(Some(hit)) => {
                self.hits.add(hit);
                slot.stats.hits_found.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {}
            Err(e) => {
                slot.stats.comparison_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(thread = tid, error = %e, "back-end comparison failed");
            }
        }
        self.backend.release(entry);
        StepOutcome::Progress
    }

    /// The worker thread body. Runs until shutdown.
    fn worker_loop(&self, tid: usize) {
        let mut scratch = self.pipeline.new_scratch();
        let mut local_gen = 0u64;
        let mut query: Option<Arc<SearchQuery>> = None;
        let mut idle = IdleBackoff::new();
        let mut empty_polls = 0u32;

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            // Order matters: snapshot the gate generation before checking
            // for work, so work arriving after the check wakes us.
            let gate_gen = self.gate.observe();

            if !self.phase().is_active() {
                query = None;
                self.gate.wait(gate_gen);
                continue;
            }

            // Start-of-search setup, exactly once per search per thread.
            let search_gen = self.search_gen.load(Ordering::Acquire);
            if search_gen != local_gen {
                let current = self.query.lock().expect("query lock poisoned").clone();
                match current {
                    Some(q) => {
                        self.pipeline.begin_search(&mut scratch, &q);
                        query = Some(q);
                        local_gen = search_gen;
                        empty_polls = 0;
                        idle.reset();
                    }
                    None => {
                        self.gate.wait(gate_gen);
                        continue;
                    }
                }
            }
            let Some(q) = query.clone() else {
                self.gate.wait(gate_gen);
                continue;
            };

            // Scheduler-requested role changes apply here, between
            // pipeline invocations.
            if let Some(role) = self.slots[tid].take_pending_role() {
                self.apply_role(tid, role);
            }

            let outcome = match self.slots[tid].role() {
                ThreadRole::Frontend => self.frontend_step(tid, &mut scratch, &q),
                ThreadRole::Backend => self.backend_step(tid, &mut scratch, &q),
            };

            match outcome {
                StepOutcome::Progress => {
                    idle.reset();
                    empty_polls = 0;
                }
                StepOutcome::NoFrontWork => {
                    if self.refill(tid) {
                        idle.reset();
                        continue;
                    }
                    // No range work anywhere; help drain the back end
                    // rather than spin beside it.
                    if self.backend.depth() > 0 && self.try_become_backend(tid) {
                        continue;
                    }
                    if self.worker_can_sleep(tid) {
                        self.gate.wait(gate_gen);
                        idle.reset();
                    } else {
                        idle.step();
                    }
                }
                StepOutcome::NoBackendWork => {
                    empty_polls += 1;
                    if empty_polls >= DRAIN_CYCLE_POLLS && self.try_become_frontend(tid) {
                        empty_polls = 0;
                        continue;
                    }
                    if self.worker_can_sleep(tid) {
                        self.gate.wait(gate_gen);
                        idle.reset();
                        empty_polls = 0;
                    } else {
                        idle.step();
                    }
                }
            }
        }
    }
}

/// Slice a span into `parts` contiguous pieces of near-equal length.
fn split_even(span: WorkSpan, parts: usize) -> Vec<WorkSpan> {
    debug_assert!(parts > 0);
    let parts = parts as u64;
    let len = span.len();
    let base = len / parts;
    let extra = len % parts;
    let mut out = Vec::with_capacity(parts as usize);
    let mut start = span.start;
    for i in 0..parts {
        let this = base + u64::from(i < extra);
        out.push(WorkSpan::new(start, start + this));
        start += this;
    }
    debug_assert_eq!(start, span.end);
    out
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Read-only view of a running node, for tests and operational
/// introspection.
pub struct WorkerNodeHandle<P: SearchPipeline> {
    shared: Arc<NodeShared<P>>,
}

impl<P: SearchPipeline> Clone for WorkerNodeHandle<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: SearchPipeline> WorkerNodeHandle<P> {
    pub fn search_phase(&self) -> SearchPhase {
        self.shared.phase()
    }

    pub fn num_threads(&self) -> usize {
        self.shared.cfg.num_threads
    }

    pub fn num_backend_threads(&self) -> usize {
        self.shared.num_backend.load(Ordering::Acquire)
    }

    pub fn thread_stats(&self, tid: usize) -> ThreadStatsSnapshot {
        self.shared.slots[tid].stats.snapshot()
    }

    /// Statistics of the most recently completed search.
    pub fn last_search_stats(&self) -> Option<SearchStats> {
        *self
            .shared
            .last_search_stats
            .lock()
            .expect("stats lock poisoned")
    }

    /// Hits collected so far in the active search.
    pub fn hits_pending(&self) -> u64 {
        self.shared.hits.len()
    }

    /// Worker threads currently parked at the start gate.
    pub fn waiting_threads(&self) -> usize {
        self.shared.gate.waiting()
    }
}

/// The worker node: a fixed pool of comparison threads plus the main-loop
/// driver that talks to the master.
///
/// Created once at process start, survives any number of searches, and is
/// torn down by a `Shutdown` message or master disconnect.
pub struct WorkerNode<P: SearchPipeline> {
    shared: Arc<NodeShared<P>>,
    threads: Vec<JoinHandle<()>>,
}

impl<P: SearchPipeline> WorkerNode<P> {
    /// Create the node and spawn its worker threads. The threads park at
    /// the start gate until the first search begins.
    pub fn new(
        cfg: WorkerConfig,
        shards: Vec<Arc<dyn DbShard>>,
        pipeline: Arc<P>,
    ) -> Result<Self, SetupError> {
        cfg.validate().map_err(SetupError::Config)?;
        if shards.is_empty() {
            return Err(SetupError::NoDatabases);
        }

        let num_threads = cfg.num_threads;
        let shared = Arc::new(NodeShared {
            cfg,
            shards,
            pipeline,
            slots: (0..num_threads).map(|_| CachePadded::new(ThreadSlot::new())).collect(),
            ranges: (0..num_threads).map(|_| WorkRange::new()).collect(),
            role_lock: Mutex::new(()),
            num_backend: AtomicUsize::new(0),
            gate: StartGate::new(),
            global: GlobalQueue::new(),
            work_request_lock: Mutex::new(()),
            request_work: AtomicBool::new(false),
            work_requested: AtomicBool::new(false),
            master_queue_empty: AtomicBool::new(false),
            backend: BackendQueue::new(),
            hits: HitCollector::new(),
            no_steal: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            phase: AtomicU8::new(SearchPhase::Idle as u8),
            search_gen: AtomicU64::new(0),
            query: Mutex::new(None),
            fatal: Mutex::new(None),
            fatal_flag: AtomicBool::new(false),
            last_search_stats: Mutex::new(None),
        });

        let mut threads = Vec::with_capacity(num_threads);
        for tid in 0..num_threads {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("search-worker-{tid}"))
                .spawn(move || {
                    if let Err(payload) =
                        catch_unwind(AssertUnwindSafe(|| shared.worker_loop(tid)))
                    {
                        shared.record_fatal(format!(
                            "worker thread {tid} panicked: {}",
                            panic_message(payload)
                        ));
                    }
                })
                .map_err(SetupError::ThreadSpawn)?;
            threads.push(handle);
        }

        Ok(Self { shared, threads })
    }

    /// Observer handle; cheap to clone, safe to hold across `run`.
    pub fn handle(&self) -> WorkerNodeHandle<P> {
        WorkerNodeHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Drive the node until the master sends `Shutdown` or disconnects.
    ///
    /// On a protocol error or a worker-side fatal condition the node sends
    /// the master a diagnostic, shuts its threads down, and returns the
    /// error. A clean shutdown returns `Ok`.
    pub fn run(mut self, link: MasterLink) -> Result<(), NodeError> {
        let result = self.main_loop(&link);
        if let Err(e) = &result {
            let _ = link.send(WorkerMsg::Diagnostic {
                message: e.to_string(),
            });
            tracing::warn!(error = %e, "worker node shutting down on error");
        }
        self.stop_threads();
        result
    }

    fn main_loop(&mut self, link: &MasterLink) -> Result<(), NodeError> {
        loop {
            match link.recv_timeout(self.shared.cfg.poll_interval) {
                Ok(MasterMsg::SearchStart {
                    kind,
                    database,
                    query,
                    range,
                }) => self.start_search(kind, database, query, range)?,
                Ok(MasterMsg::WorkGrant { range }) => self.add_work(range)?,
                Ok(MasterMsg::NoMoreWork) => self.master_drained()?,
                Ok(MasterMsg::Shutdown) => return Ok(()),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                // A vanished master is a shutdown, not an error.
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return Ok(()),
            }

            if let Some(message) = self.shared.take_fatal() {
                return Err(NodeError::Fatal(message));
            }
            if self.service_work_request(link) {
                return Ok(());
            }
            if self.shared.phase().is_active() && self.search_complete() {
                if self.finish_search(link) {
                    return Ok(());
                }
            }
        }
    }

    /// Send the master a work request if one is armed. Returns true when
    /// the master is gone.
    fn service_work_request(&self, link: &MasterLink) -> bool {
        if !self.shared.request_work.load(Ordering::Acquire) {
            return false;
        }
        {
            let _guard = self
                .shared
                .work_request_lock
                .lock()
                .expect("work request lock poisoned");
            self.shared.request_work.store(false, Ordering::Release);
        }
        tracing::debug!(depth = self.shared.global.depth_ids(), "requesting more work");
        link.send(WorkerMsg::WorkRequest).is_err()
    }

    fn start_search(
        &self,
        kind: SearchKind,
        database: u32,
        query: crate::pipeline::QueryPayload,
        range: WorkSpan,
    ) -> Result<(), NodeError> {
        let shared = &self.shared;
        if shared.phase().is_active() {
            return Err(NodeError::Protocol(
                "SearchStart while a search is active".to_string(),
            ));
        }
        if database as usize >= shared.shards.len() {
            return Err(NodeError::Protocol(format!(
                "SearchStart names database {database}, only {} loaded",
                shared.shards.len()
            )));
        }
        if query.kind() != kind {
            return Err(NodeError::Protocol(
                "SearchStart query payload does not match search kind".to_string(),
            ));
        }
        // Threads must be quiescent from the previous search before state
        // is rebuilt under them.
        self.wait_all_parked()?;

        shared.global.clear();
        shared.backend.clear();
        shared.master_queue_empty.store(false, Ordering::Release);
        shared.work_requested.store(false, Ordering::Release);
        shared.request_work.store(false, Ordering::Release);
        shared.no_steal.store(false, Ordering::Release);

        let num_threads = shared.cfg.num_threads;
        let num_backend = shared.cfg.initial_backend_threads;
        let num_frontend = num_threads - num_backend;
        for (tid, slot) in shared.slots.iter().enumerate() {
            let role = if tid < num_frontend {
                ThreadRole::Frontend
            } else {
                ThreadRole::Backend
            };
            slot.reset_for_search(role);
        }
        shared.num_backend.store(num_backend, Ordering::Release);

        // Front-end threads split the first chunk; back-end ranges stay
        // empty (their work reaches them through the backend queue).
        for (tid, slice) in split_even(range, num_frontend).into_iter().enumerate() {
            debug_assert!(shared.ranges[tid].is_empty());
            shared.ranges[tid].install(slice);
        }

        *shared.query.lock().expect("query lock poisoned") = Some(Arc::new(SearchQuery {
            kind,
            database,
            payload: Arc::from(query.into_bytes()),
        }));
        shared.search_gen.fetch_add(1, Ordering::AcqRel);
        shared.set_phase(SearchPhase::initial_for(kind));

        tracing::info!(
            ?kind,
            database,
            start = range.start,
            end = range.end,
            "search starting"
        );
        shared.gate.release_all();
        Ok(())
    }

    fn add_work(&self, range: WorkSpan) -> Result<(), NodeError> {
        let shared = &self.shared;
        let phase = shared.phase();
        if !phase.is_active() {
            return Err(NodeError::Protocol("WorkGrant while idle".to_string()));
        }
        // First grant of the search flips the phase to its continue
        // variant; threads waking later skip start-of-search setup.
        match phase {
            SearchPhase::Sequence => shared.set_phase(SearchPhase::SequenceContinue),
            SearchPhase::Profile => shared.set_phase(SearchPhase::ProfileContinue),
            _ => {}
        }
        // Push before clearing the in-flight flag so a thread observing a
        // low queue between the two cannot arm a redundant request.
        shared.global.push(range);
        {
            let _guard = shared
                .work_request_lock
                .lock()
                .expect("work request lock poisoned");
            shared.work_requested.store(false, Ordering::Release);
        }
        shared.no_steal.store(false, Ordering::Release);
        tracing::debug!(start = range.start, end = range.end, "work granted");
        shared.gate.release_all();
        Ok(())
    }

    fn master_drained(&self) -> Result<(), NodeError> {
        let shared = &self.shared;
        if !shared.phase().is_active() {
            return Err(NodeError::Protocol("NoMoreWork while idle".to_string()));
        }
        let _guard = shared
            .work_request_lock
            .lock()
            .expect("work request lock poisoned");
        shared.master_queue_empty.store(true, Ordering::Release);
        shared.work_requested.store(false, Ordering::Release);
        tracing::debug!("master queue drained");
        Ok(())
    }

    /// The search is over when nothing is queued anywhere, the master has
    /// nothing left, and every thread is parked (so nothing is in flight).
    fn search_complete(&self) -> bool {
        let shared = &self.shared;
        shared.master_queue_empty.load(Ordering::Acquire)
            && shared.gate.waiting() == shared.cfg.num_threads
            && shared.global.is_empty()
            && shared.backend.is_empty()
            && shared.ranges.iter().all(WorkRange::is_empty)
    }

    /// Upload hits and reset for the next search. Returns true when the
    /// master is gone.
    fn finish_search(&self, link: &MasterLink) -> bool {
        let shared = &self.shared;
        let hits = shared.hits.drain();
        let mut totals = ThreadStatsSnapshot::default();
        for slot in &shared.slots {
            totals.merge(&slot.stats.snapshot());
        }
        *shared
            .last_search_stats
            .lock()
            .expect("stats lock poisoned") = Some(SearchStats {
            totals,
            hits_uploaded: hits.len() as u64,
        });

        shared.set_phase(SearchPhase::Idle);
        *shared.query.lock().expect("query lock poisoned") = None;

        tracing::info!(
            hits = hits.len(),
            offered = totals.objects_offered,
            errors = totals.comparison_errors,
            "search complete"
        );
        link.send(WorkerMsg::HitsUpload { hits }).is_err()
    }

    fn wait_all_parked(&self) -> Result<(), NodeError> {
        let shared = &self.shared;
        let deadline = Instant::now() + Duration::from_secs(10);
        while shared.gate.waiting() < shared.cfg.num_threads {
            if let Some(message) = shared.take_fatal() {
                return Err(NodeError::Fatal(message));
            }
            if Instant::now() > deadline {
                return Err(NodeError::Fatal(
                    "worker threads failed to quiesce".to_string(),
                ));
            }
            thread::yield_now();
        }
        Ok(())
    }

    fn stop_threads(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.gate.release_all();
        for handle in self.threads.drain(..) {
            // A panicked worker already left its diagnostic in the fatal
            // cell; the join result adds nothing.
            let _ = handle.join();
        }
        tracing::debug!("worker threads joined");
    }
}

impl<P: SearchPipeline> Drop for WorkerNode<P> {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop_threads();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_even_covers_span() {
        let parts = split_even(WorkSpan::new(0, 10), 3);
        assert_eq!(
            parts,
            vec![
                WorkSpan::new(0, 4),
                WorkSpan::new(4, 7),
                WorkSpan::new(7, 10)
            ]
        );
    }

    #[test]
    fn split_even_handles_short_spans() {
        let parts = split_even(WorkSpan::new(5, 7), 4);
        let total: u64 = parts.iter().map(WorkSpan::len).sum();
        assert_eq!(total, 2);
        assert_eq!(parts.len(), 4);
        assert!(parts[2].is_empty() && parts[3].is_empty());
    }

    #[test]
    fn phase_transitions() {
        assert!(!SearchPhase::Idle.is_active());
        assert!(SearchPhase::Sequence.is_active());
        assert!(!SearchPhase::Sequence.is_continue());
        assert!(SearchPhase::SequenceContinue.is_continue());
        assert_eq!(
            SearchPhase::initial_for(SearchKind::Profile),
            SearchPhase::Profile
        );
    }
}
