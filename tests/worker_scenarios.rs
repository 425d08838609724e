//! End-to-end scheduler scenarios driven through an in-process master.
//!
//! Each test stands up a full worker node with a programmable stub
//! pipeline, plays a master-side script against it, and asserts the
//! engine-level guarantees: exactly-once offering, sorted uploads, bounded
//! work requests, stealing, and role reassignment. Timing-sensitive
//! scenarios use deadline loops, not fixed sleeps.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use seqsearch_worker::{
    in_process_link, DbShard, Hit, MasterEndpoint, MasterMsg, NodeError, QueryPayload,
    SearchKind, SearchPhase, StubPipeline, VecShard, WorkSpan, WorkerConfig, WorkerMsg,
    WorkerNode, WorkerNodeHandle,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(30);

struct Harness {
    handle: WorkerNodeHandle<StubPipeline>,
    master: MasterEndpoint,
    stub: Arc<StubPipeline>,
    join: thread::JoinHandle<Result<(), NodeError>>,
}

impl Harness {
    fn launch(cfg: WorkerConfig, db_objects: u64, stub: StubPipeline) -> Self {
        let stub = Arc::new(stub);
        let shard = Arc::new(VecShard::synthetic(db_objects, 16)) as Arc<dyn DbShard>;
        let (link, master) = in_process_link(1024);
        let node = WorkerNode::new(cfg, vec![shard], Arc::clone(&stub)).expect("node setup");
        let handle = node.handle();
        let join = thread::spawn(move || node.run(link));
        Self {
            handle,
            master,
            stub,
            join,
        }
    }

    fn start_sequence_search(&self, range: WorkSpan) {
        self.master
            .send(MasterMsg::SearchStart {
                kind: SearchKind::Sequence,
                database: 0,
                query: QueryPayload::Profile(vec![0x7f; 32]),
                range,
            })
            .expect("send search start");
    }

    /// Drain worker messages until the hit upload arrives. Returns the
    /// sorted hits and how many work requests were seen on the way.
    fn await_upload(&self) -> (Vec<Hit>, u64) {
        let mut requests = 0;
        loop {
            match self.master.recv_timeout(RECV_TIMEOUT).expect("worker went quiet") {
                WorkerMsg::HitsUpload { hits } => return (hits, requests),
                WorkerMsg::WorkRequest => requests += 1,
                WorkerMsg::Diagnostic { message } => {
                    panic!("unexpected diagnostic from worker: {message}")
                }
            }
        }
    }

    fn shutdown(self) -> Result<(), NodeError> {
        let _ = self.master.send(MasterMsg::Shutdown);
        self.join.join().expect("node thread panicked")
    }
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while !condition() {
        if Instant::now() > end {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

fn assert_offered_exactly_once(stub: &StubPipeline, expected: impl Iterator<Item = u64>) {
    let counts = stub.offered_counts();
    let expected: HashSet<u64> = expected.collect();
    for id in &expected {
        assert_eq!(
            counts.get(id),
            Some(&1),
            "object {id} offered {:?} times",
            counts.get(id).copied().unwrap_or(0)
        );
    }
    assert_eq!(
        counts.len(),
        expected.len(),
        "objects outside the expected set were offered"
    );
}

fn assert_sorted_descending(hits: &[Hit]) {
    for pair in hits.windows(2) {
        let a = (pair[0].primary_key, pair[0].secondary_key);
        let b = (pair[1].primary_key, pair[1].secondary_key);
        assert!(
            a.0 > b.0 || (a.0 == b.0 && a.1 >= b.1),
            "upload out of order: {a:?} before {b:?}"
        );
    }
}

/// Trivial single-chunk search: every object offered once, the programmed
/// 1-in-7 defer rate reaches the back end, and the upload is sorted.
#[test]
fn single_chunk_sequence_search() {
    let cfg = WorkerConfig {
        num_threads: 4,
        ..WorkerConfig::default()
    };
    let stub = StubPipeline::new()
        .with_need_backend(|id| id % 7 == 0)
        .with_backend_hit(|id| Some((id as f64, -(id as f64))));
    let h = Harness::launch(cfg, 1000, stub);

    h.start_sequence_search(WorkSpan::new(0, 1000));
    h.master.send(MasterMsg::NoMoreWork).expect("send no-more-work");

    let (hits, _) = h.await_upload();

    assert_offered_exactly_once(&h.stub, 0..1000);
    // 143 ids in [0, 1000) are divisible by 7.
    assert_eq!(hits.len(), 143);
    assert_sorted_descending(&hits);

    let stats = h.handle.last_search_stats().expect("stats recorded");
    assert_eq!(stats.totals.objects_offered, 1000);
    assert_eq!(stats.totals.backend_queued, 143);
    assert_eq!(stats.totals.backend_run, 143);
    assert_eq!(stats.totals.hits_found, 143);
    assert_eq!(stats.hits_uploaded, 143);
    // Start-of-search setup ran exactly once per thread.
    assert_eq!(h.stub.setup_calls(), 4);

    assert!(h.shutdown().is_ok());
}

/// Multi-chunk search: the phase flips to its continue variant exactly once
/// (after the first grant) and every granted id is still offered once.
#[test]
fn multi_chunk_continue_transition() {
    let cfg = WorkerConfig {
        num_threads: 4,
        ..WorkerConfig::default()
    };
    let h = Harness::launch(cfg, 1000, StubPipeline::new());

    h.start_sequence_search(WorkSpan::new(0, 100));
    assert!(
        wait_until(Duration::from_secs(10), || {
            h.handle.search_phase() == SearchPhase::Sequence
                || h.handle.search_phase() == SearchPhase::SequenceContinue
        }),
        "search never became active"
    );

    for grant in [
        WorkSpan::new(100, 400),
        WorkSpan::new(400, 700),
        WorkSpan::new(700, 1000),
    ] {
        h.master
            .send(MasterMsg::WorkGrant { range: grant })
            .expect("send grant");
        assert!(
            wait_until(Duration::from_secs(10), || {
                h.handle.search_phase() == SearchPhase::SequenceContinue
            }),
            "phase never reached the continue variant"
        );
    }
    h.master.send(MasterMsg::NoMoreWork).expect("send no-more-work");

    let (hits, _) = h.await_upload();
    assert!(hits.is_empty());
    assert_offered_exactly_once(&h.stub, 0..1000);
    // Back to idle after the upload; the continue variant never reverted
    // mid-search.
    assert!(wait_until(Duration::from_secs(10), || {
        h.handle.search_phase() == SearchPhase::Idle
    }));

    assert!(h.shutdown().is_ok());
}

/// Work stealing: one thread's slice is artificially slow, so its peers
/// must finish it. The slow thread ends up having offered fewer ids than
/// its initial slice while everyone still participates.
#[test]
fn stealing_rebalances_a_slow_range() {
    let cfg = WorkerConfig {
        num_threads: 4,
        // Keep the role split static so the assertion targets stealing
        // alone: a huge backlog factor never promotes anyone.
        promote_hi: 1_000_000,
        min_steal: 8,
        ..WorkerConfig::default()
    };
    let stub = StubPipeline::new()
        .with_front_delay(|id| {
            if id < 250 {
                Duration::from_millis(1)
            } else {
                Duration::ZERO
            }
        })
        .with_need_backend(|id| id % 5 == 0)
        .with_backend_hit(|_| None);
    let h = Harness::launch(cfg, 1000, stub);

    h.start_sequence_search(WorkSpan::new(0, 1000));
    h.master.send(MasterMsg::NoMoreWork).expect("send no-more-work");
    let (hits, _) = h.await_upload();
    assert!(hits.is_empty());

    assert_offered_exactly_once(&h.stub, 0..1000);

    // Three front-end threads split [0, 1000); thread 0 got the slow ids.
    let t0 = h.handle.thread_stats(0);
    assert!(t0.objects_offered > 0, "slow thread never ran");
    assert!(
        t0.objects_offered < 250,
        "slow thread processed {} ids; stealing never happened",
        t0.objects_offered
    );
    for tid in 1..3 {
        assert!(
            h.handle.thread_stats(tid).objects_offered > 0,
            "thread {tid} never participated"
        );
    }
    // The dedicated back-end thread drained the deferred comparisons.
    assert!(h.handle.thread_stats(3).backend_run > 0);

    let total_steals: u64 = (0..4).map(|tid| h.handle.thread_stats(tid).steals).sum();
    assert!(total_steals > 0, "no steals recorded");

    assert!(h.shutdown().is_ok());
}

/// Role promotion: a pipeline that defers everything floods the backend
/// queue, so front-end threads must be moved to back-end duty.
#[test]
fn backlog_promotes_backend_threads() {
    let cfg = WorkerConfig {
        num_threads: 4,
        promote_hi: 4,
        ..WorkerConfig::default()
    };
    let stub = StubPipeline::new()
        .with_need_backend(|_| true)
        .with_back_delay(Duration::from_millis(1));
    let h = Harness::launch(cfg, 1000, stub);

    h.start_sequence_search(WorkSpan::new(0, 1000));
    h.master.send(MasterMsg::NoMoreWork).expect("send no-more-work");

    let mut peak_backend = 0;
    wait_until(Duration::from_secs(10), || {
        if !h.handle.search_phase().is_active() {
            // Not started yet, or already finished draining.
            return peak_backend >= 2;
        }
        let now = h.handle.num_backend_threads();
        peak_backend = peak_backend.max(now);
        // Role invariant holds at every observation while active.
        assert!((1..=3).contains(&now), "num_backend_threads = {now}");
        peak_backend >= 2
    });
    assert!(
        peak_backend >= 2,
        "backlog never promoted a second back-end thread"
    );

    let (hits, _) = h.await_upload();
    assert_eq!(hits.len(), 1000);
    assert_offered_exactly_once(&h.stub, 0..1000);

    assert!(h.shutdown().is_ok());
}

/// Master-request gating: many small refills, never more than one request
/// in flight, and every request is separated by the master's answer.
#[test]
fn work_requests_are_gated() {
    let cfg = WorkerConfig {
        num_threads: 4,
        chunk_size: 32,
        request_threshold: 64,
        batch_size: 16,
        ..WorkerConfig::default()
    };
    let h = Harness::launch(cfg, 1000, StubPipeline::new());

    h.start_sequence_search(WorkSpan::new(0, 100));

    let mut grants = 0u64;
    let mut requests = 0u64;
    let mut hits = None;
    let mut next_chunk = 100u64;
    while hits.is_none() {
        match h.master.recv_timeout(RECV_TIMEOUT).expect("worker went quiet") {
            WorkerMsg::WorkRequest => {
                requests += 1;
                // The gate allows one request in flight: a second must not
                // arrive before this one is answered.
                assert!(
                    h.master.try_recv().is_none(),
                    "two work requests without an intervening answer"
                );
                if next_chunk < 1000 {
                    let end = (next_chunk + 100).min(1000);
                    h.master
                        .send(MasterMsg::WorkGrant {
                            range: WorkSpan::new(next_chunk, end),
                        })
                        .expect("send grant");
                    grants += 1;
                    next_chunk = end;
                } else {
                    h.master.send(MasterMsg::NoMoreWork).expect("send no-more-work");
                }
            }
            WorkerMsg::HitsUpload { hits: h2 } => hits = Some(h2),
            WorkerMsg::Diagnostic { message } => panic!("diagnostic: {message}"),
        }
    }

    assert_eq!(grants, 9);
    // One request per grant plus the final one answered by NoMoreWork.
    assert!(
        requests <= grants + 1,
        "{requests} requests for {grants} grants"
    );
    assert_offered_exactly_once(&h.stub, 0..1000);

    assert!(h.shutdown().is_ok());
}

/// Shard partitioning: only ids belonging to this node's shard are offered.
#[test]
fn shard_predicate_filters_ids() {
    let cfg = WorkerConfig {
        num_threads: 4,
        num_shards: 4,
        my_shard: 2,
        ..WorkerConfig::default()
    };
    let h = Harness::launch(cfg, 1000, StubPipeline::new());

    h.start_sequence_search(WorkSpan::new(0, 1000));
    h.master.send(MasterMsg::NoMoreWork).expect("send no-more-work");
    let (_, _) = h.await_upload();

    assert_offered_exactly_once(&h.stub, (0..1000).filter(|id| id % 4 == 2));
    let stats = h.handle.last_search_stats().expect("stats recorded");
    assert_eq!(stats.totals.objects_offered, 250);

    assert!(h.shutdown().is_ok());
}

/// The node survives searches back to back, including the opposite search
/// kind, without re-running per-search setup for stale state.
#[test]
fn consecutive_searches_reset_state() {
    let cfg = WorkerConfig {
        num_threads: 3,
        ..WorkerConfig::default()
    };
    let stub = StubPipeline::new()
        .with_need_backend(|id| id % 3 == 0)
        .with_backend_hit(|id| Some((1000.0 - id as f64, 0.0)));
    let h = Harness::launch(cfg, 600, stub);

    h.start_sequence_search(WorkSpan::new(0, 600));
    h.master.send(MasterMsg::NoMoreWork).expect("send no-more-work");
    let (first_hits, _) = h.await_upload();
    assert_eq!(first_hits.len(), 200);
    assert_eq!(h.stub.setup_calls(), 3);

    h.stub.reset_observations();
    h.master
        .send(MasterMsg::SearchStart {
            kind: SearchKind::Profile,
            database: 0,
            query: QueryPayload::Sequence(b"MSTNPKPQRKTKRNTNRRPQDVK".to_vec()),
            range: WorkSpan::new(0, 600),
        })
        .expect("send second search");
    h.master.send(MasterMsg::NoMoreWork).expect("send no-more-work");
    let (second_hits, _) = h.await_upload();

    assert_eq!(second_hits.len(), 200);
    assert_sorted_descending(&second_hits);
    assert_offered_exactly_once(&h.stub, 0..600);
    assert_eq!(h.stub.setup_calls(), 3);

    assert!(h.shutdown().is_ok());
}

/// Per-comparison pipeline errors are counted and skipped; the search
/// still completes and covers every other object.
#[test]
fn comparison_errors_do_not_abort_the_search() {
    let cfg = WorkerConfig {
        num_threads: 2,
        ..WorkerConfig::default()
    };
    let stub = StubPipeline::new().with_front_error(|id| id % 100 == 99);
    let h = Harness::launch(cfg, 500, stub);

    h.start_sequence_search(WorkSpan::new(0, 500));
    h.master.send(MasterMsg::NoMoreWork).expect("send no-more-work");
    let (hits, _) = h.await_upload();
    assert!(hits.is_empty());

    // Errored objects were still offered exactly once.
    assert_offered_exactly_once(&h.stub, 0..500);
    let stats = h.handle.last_search_stats().expect("stats recorded");
    assert_eq!(stats.totals.comparison_errors, 5);
    assert_eq!(stats.totals.front_pass, 495);

    assert!(h.shutdown().is_ok());
}

/// An out-of-order master message is fatal: the node reports a diagnostic
/// and shuts down with a protocol error.
#[test]
fn stray_grant_is_a_protocol_error() {
    let cfg = WorkerConfig {
        num_threads: 2,
        ..WorkerConfig::default()
    };
    let h = Harness::launch(cfg, 100, StubPipeline::new());

    h.master
        .send(MasterMsg::WorkGrant {
            range: WorkSpan::new(0, 10),
        })
        .expect("send stray grant");

    match h.master.recv_timeout(RECV_TIMEOUT).expect("worker went quiet") {
        WorkerMsg::Diagnostic { message } => {
            assert!(message.contains("WorkGrant"), "diagnostic: {message}")
        }
        other => panic!("expected diagnostic, got {other:?}"),
    }
    match h.join.join().expect("node thread panicked") {
        Err(NodeError::Protocol(_)) => {}
        other => panic!("expected protocol error, got {other:?}"),
    }
}

/// Searches address one of several loaded databases; naming a database
/// that is not loaded is fatal.
#[test]
fn search_selects_named_database() {
    let cfg = WorkerConfig {
        num_threads: 2,
        ..WorkerConfig::default()
    };
    let stub = Arc::new(StubPipeline::new());
    let shards = vec![
        Arc::new(VecShard::synthetic(100, 16)) as Arc<dyn DbShard>,
        Arc::new(VecShard::synthetic(400, 16)) as Arc<dyn DbShard>,
    ];
    let (link, master) = in_process_link(1024);
    let node = WorkerNode::new(cfg, shards, Arc::clone(&stub)).expect("node setup");
    let join = thread::spawn(move || node.run(link));

    master
        .send(MasterMsg::SearchStart {
            kind: SearchKind::Sequence,
            database: 1,
            query: QueryPayload::Profile(vec![1, 2, 3]),
            range: WorkSpan::new(0, 400),
        })
        .expect("send search start");
    master.send(MasterMsg::NoMoreWork).expect("send no-more-work");
    loop {
        match master.recv_timeout(RECV_TIMEOUT).expect("worker went quiet") {
            WorkerMsg::HitsUpload { .. } => break,
            WorkerMsg::WorkRequest => {}
            WorkerMsg::Diagnostic { message } => panic!("diagnostic: {message}"),
        }
    }
    assert_eq!(stub.offered_total(), 400);

    // A database index past the loaded set is a protocol error.
    master
        .send(MasterMsg::SearchStart {
            kind: SearchKind::Sequence,
            database: 2,
            query: QueryPayload::Profile(vec![1]),
            range: WorkSpan::new(0, 10),
        })
        .expect("send bad search start");
    match master.recv_timeout(RECV_TIMEOUT).expect("worker went quiet") {
        WorkerMsg::Diagnostic { message } => {
            assert!(message.contains("database"), "diagnostic: {message}")
        }
        other => panic!("expected diagnostic, got {other:?}"),
    }
    match join.join().expect("node thread panicked") {
        Err(NodeError::Protocol(_)) => {}
        other => panic!("expected protocol error, got {other:?}"),
    }
}

/// A master that simply disappears is a clean shutdown.
#[test]
fn master_disconnect_is_clean_shutdown() {
    let cfg = WorkerConfig {
        num_threads: 2,
        ..WorkerConfig::default()
    };
    let h = Harness::launch(cfg, 100, StubPipeline::new());
    drop(h.master);
    assert!(h.join.join().expect("node thread panicked").is_ok());
}

/// Immediate shutdown with no search is clean.
#[test]
fn idle_shutdown_is_clean() {
    let cfg = WorkerConfig {
        num_threads: 2,
        ..WorkerConfig::default()
    };
    let h = Harness::launch(cfg, 100, StubPipeline::new());
    assert!(h.shutdown().is_ok());
}
