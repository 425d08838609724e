//! The comparison pipeline as consumed by the worker node.
//!
//! The scoring math itself is a black box behind [`SearchPipeline`]. The
//! engine only relies on its two-stage shape:
//!
//! - `front` is the cheap filter stage. It either finishes a comparison on
//!   the spot (no hit) or defers it with partial state attached.
//! - `back` is the expensive refinement stage. It consumes a deferred
//!   comparison and may produce a [`Hit`].
//!
//! # Thread Safety Model
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 SearchPipeline (Sync)                    │
//! │              (shared across all threads)                 │
//! └──────────────────────────────────────────────────────────┘
//!          │                  │                  │
//!          ▼                  ▼                  ▼
//!   ┌────────────┐     ┌────────────┐     ┌────────────┐
//!   │  Scratch   │     │  Scratch   │     │  Scratch   │
//!   │ (thread 0) │     │ (thread 1) │     │ (thread N) │
//!   └────────────┘     └────────────┘     └────────────┘
//! ```
//!
//! The pipeline is immutable and shared; scratch is per-thread and never
//! crosses threads. Partial state does cross threads: a front-end thread
//! packs it into a [`BackendEntry`] that any back-end thread may consume,
//! so `Partial` must be `Send`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::shard::SeqObject;

/// Which way a search compares the query against the database.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchKind {
    /// One profile model against a database of sequences.
    Sequence,
    /// One sequence against a database of profile models.
    Profile,
}

/// Query payload as carried in a search-start message.
///
/// The bytes are opaque to the engine; the pipeline interprets them
/// according to [`SearchKind`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryPayload {
    /// Serialized profile model for a [`SearchKind::Sequence`] search.
    Profile(Vec<u8>),
    /// Residue sequence for a [`SearchKind::Profile`] search.
    Sequence(Vec<u8>),
}

impl QueryPayload {
    /// The search kind this payload implies.
    pub fn kind(&self) -> SearchKind {
        match self {
            QueryPayload::Profile(_) => SearchKind::Sequence,
            QueryPayload::Sequence(_) => SearchKind::Profile,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            QueryPayload::Profile(b) | QueryPayload::Sequence(b) => b,
        }
    }
}

/// One active search, as seen by every worker thread.
///
/// Built by the main thread when a search starts and shared read-only for
/// the duration of the search. Threads that need private copies of derived
/// query state (optimized profile, background model) build them in their
/// scratch during [`SearchPipeline::begin_search`].
#[derive(Clone, Debug)]
pub struct SearchQuery {
    pub kind: SearchKind,
    /// Which loaded database the search runs against.
    pub database: u32,
    /// Query bytes: a profile model or a residue sequence per `kind`.
    pub payload: Arc<[u8]>,
}

impl SearchQuery {
    /// Query length in bytes (residue count for a sequence query).
    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Outcome of the front-end filter for one (query, object) comparison.
#[derive(Debug)]
pub enum FrontOutcome<T> {
    /// Comparison finished in the front end with no hit.
    Pass,
    /// Object rejected by an early filter.
    Fail,
    /// Comparison needs back-end refinement.
    NeedBackend(FrontPartial<T>),
}

/// Partial state handed from the front end to the back end.
#[derive(Debug)]
pub struct FrontPartial<T> {
    /// Pipeline-private continuation state.
    pub state: T,
    /// Forward-filter score from the front end.
    pub forward_score: f64,
    /// Null-model score from the front end.
    pub null_score: f64,
}

/// A deferred comparison waiting for a back-end thread.
///
/// One entry form serves both search kinds: `payload` holds the database
/// object's bytes (a sequence or a profile), and the pipeline interprets it
/// per the active [`SearchKind`]. Entries are pool-recycled, which is why
/// `partial` is an `Option`: the back end takes the state out, and the
/// empty husk goes back to the free pool.
#[derive(Debug)]
pub struct BackendEntry<T> {
    /// Global id of the database object being compared.
    pub object_id: u64,
    /// The database object's payload bytes.
    pub payload: Arc<[u8]>,
    /// Front-end continuation state. `Some` while queued, taken by `back`.
    pub partial: Option<T>,
    /// Forward-filter score from the front end.
    pub forward_score: f64,
    /// Null-model score from the front end.
    pub null_score: f64,
}

/// A scored match produced by the back end for one (query, object) pair.
///
/// Hits sort by `(primary_key desc, secondary_key desc)`; that order is
/// what the master observes in the final upload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub object_id: u64,
    pub primary_key: f64,
    pub secondary_key: f64,
    /// Opaque report payload (alignment, annotation) passed through to the
    /// master unexamined.
    pub payload: Vec<u8>,
}

/// A failed comparison. Never fatal: the engine skips the object, counts
/// the error, and the search continues.
#[derive(Clone, Debug)]
pub struct PipelineError {
    pub object_id: u64,
    pub reason: String,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "comparison failed for object {}: {}",
            self.object_id, self.reason
        )
    }
}

impl std::error::Error for PipelineError {}

/// The two-stage comparison engine.
///
/// # Contract
///
/// - The pipeline is shared across threads; all mutable comparison state
///   lives in the per-thread `Scratch`.
/// - `begin_search` is called once per thread per search, before that
///   thread's first comparison of the search. Threads woken mid-search by
///   later work grants do not repeat it.
/// - For every object id offered, exactly one of the three front outcomes
///   is observed, and `back` runs at most once per deferred comparison.
pub trait SearchPipeline: Send + Sync + 'static {
    /// Per-thread mutable pipeline state.
    type Scratch: Send + 'static;
    /// Front-to-back continuation state. Crosses threads inside a
    /// [`BackendEntry`].
    type Partial: Send + 'static;

    /// Create one thread's scratch. Called once per worker thread.
    fn new_scratch(&self) -> Self::Scratch;

    /// Per-search, per-thread setup: thread-local copies of the query
    /// model, optimized profile, background model.
    fn begin_search(&self, scratch: &mut Self::Scratch, query: &SearchQuery);

    /// Cheap filter stage for one database object.
    fn front(
        &self,
        scratch: &mut Self::Scratch,
        query: &SearchQuery,
        object: &SeqObject,
    ) -> Result<FrontOutcome<Self::Partial>, PipelineError>;

    /// Expensive refinement stage for one deferred comparison.
    fn back(
        &self,
        scratch: &mut Self::Scratch,
        query: &SearchQuery,
        entry: &mut BackendEntry<Self::Partial>,
    ) -> Result<Option<Hit>, PipelineError>;
}
