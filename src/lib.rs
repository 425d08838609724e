//! Worker-node execution core for a sharded sequence-similarity search
//! service.
//!
//! A cluster consists of one master node that partitions queries and many
//! worker nodes; each worker owns one shard of every loaded database. This
//! crate is the per-worker concurrency engine:
//!
//! - receives work chunks (contiguous ranges of database object ids) from
//!   the master and spreads them across a fixed pool of worker threads;
//! - runs each object through a two-stage comparison pipeline: a cheap
//!   front-end filter and an expensive back-end refinement;
//! - steals work between threads and reassigns threads between front-end
//!   and back-end duty to match queue pressure;
//! - collects hits in upload order and requests more work from the master
//!   before starvation.
//!
//! The comparison math, shard storage, and wire transport are consumed
//! interfaces ([`SearchPipeline`], [`DbShard`], [`protocol`]); this crate
//! supplies the scheduling around them.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use seqsearch_worker::{
//!     in_process_link, DbShard, StubPipeline, VecShard, WorkerConfig, WorkerNode,
//! };
//!
//! let cfg = WorkerConfig::default();
//! let shard = Arc::new(VecShard::synthetic(10_000, 256)) as Arc<dyn DbShard>;
//! let pipeline = Arc::new(StubPipeline::new());
//! let (link, master) = in_process_link(64);
//!
//! let node = WorkerNode::new(cfg, vec![shard], pipeline).expect("setup");
//! let observer = node.handle();
//! node.run(link).expect("clean shutdown");
//! # let _ = (observer, master);
//! ```

pub mod config;
pub mod pipeline;
pub mod protocol;
pub mod shard;
pub mod worker;

pub use config::WorkerConfig;
pub use pipeline::{
    BackendEntry, FrontOutcome, FrontPartial, Hit, PipelineError, QueryPayload, SearchKind,
    SearchPipeline, SearchQuery,
};
pub use protocol::{in_process_link, MasterEndpoint, MasterLink, MasterMsg, WorkerMsg};
pub use shard::{shard_of, DbShard, SeqObject, ShardError, VecShard};
pub use worker::{
    NodeError, SearchPhase, SearchStats, SetupError, StubPipeline, ThreadStatsSnapshot, WorkSpan,
    WorkerNode, WorkerNodeHandle,
};
