//! Master-worker protocol types and the in-process transport.
//!
//! The cluster master partitions queries and hands out work chunks; workers
//! request more before they starve and upload sorted hits at search end.
//! The transport is a seam: this crate ships an in-process channel pair
//! (used by tests and single-process deployments), and a networked
//! deployment frames the same serde types over its own carrier.
//!
//! # Message Flow
//!
//! ```text
//!  Master                                  Worker main thread
//!    │  SearchStart{kind, db, query, range}  │
//!    ├───────────────────────────────────────▶
//!    │  WorkGrant{range}            WorkRequest
//!    ◀───────────────────────────────────────┤
//!    ├───────────────────────────────────────▶
//!    │  NoMoreWork                           │
//!    ├───────────────────────────────────────▶
//!    │                        HitsUpload{hits}
//!    ◀───────────────────────────────────────┤
//! ```
//!
//! At most one `WorkRequest` is outstanding at any time; the worker's
//! request gating enforces it.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::pipeline::{Hit, QueryPayload, SearchKind};
use crate::worker::range::WorkSpan;

/// Messages from the master to a worker node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MasterMsg {
    /// Begin a search. `range` is the first chunk of work.
    SearchStart {
        kind: SearchKind,
        database: u32,
        query: QueryPayload,
        range: WorkSpan,
    },
    /// Another chunk of work for the active search.
    WorkGrant { range: WorkSpan },
    /// The master's queue for this search is exhausted; no further grants
    /// will arrive.
    NoMoreWork,
    /// Stop all threads and exit the main loop.
    Shutdown,
}

/// Messages from a worker node to the master.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WorkerMsg {
    /// Ask for another work chunk.
    WorkRequest,
    /// Search finished: all hits, sorted by `(primary desc, secondary desc)`.
    HitsUpload { hits: Vec<Hit> },
    /// A fatal node-side condition the master should log. Sent at most once,
    /// immediately before the node shuts down.
    Diagnostic { message: String },
}

/// The worker side of the master channel.
pub struct MasterLink {
    rx: Receiver<MasterMsg>,
    tx: Sender<WorkerMsg>,
}

impl MasterLink {
    pub fn new(rx: Receiver<MasterMsg>, tx: Sender<WorkerMsg>) -> Self {
        Self { rx, tx }
    }

    /// Blocking read with a timeout so the main loop can service local
    /// flags between messages.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<MasterMsg, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Send to the master. A disconnected master is reported, not fatal
    /// here; the caller treats it as shutdown.
    pub fn send(&self, msg: WorkerMsg) -> Result<(), LinkClosed> {
        self.tx.send(msg).map_err(|_| LinkClosed)
    }
}

/// The master side of an in-process link. Tests and single-process
/// deployments drive the worker through this.
pub struct MasterEndpoint {
    tx: Sender<MasterMsg>,
    rx: Receiver<WorkerMsg>,
}

impl MasterEndpoint {
    pub fn send(&self, msg: MasterMsg) -> Result<(), LinkClosed> {
        self.tx.send(msg).map_err(|_| LinkClosed)
    }

    /// Non-blocking send used by masters that must never stall on a slow
    /// worker.
    pub fn try_send(&self, msg: MasterMsg) -> Result<(), TrySendError<MasterMsg>> {
        self.tx.try_send(msg)
    }

    pub fn recv(&self) -> Result<WorkerMsg, LinkClosed> {
        self.rx.recv().map_err(|_| LinkClosed)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<WorkerMsg, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<WorkerMsg> {
        self.rx.try_recv().ok()
    }
}

/// The peer hung up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkClosed;

impl std::fmt::Display for LinkClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "master channel closed")
    }
}

impl std::error::Error for LinkClosed {}

/// Build a connected (worker, master) channel pair.
///
/// Capacity bounds both directions so a runaway peer shows up as
/// backpressure instead of unbounded memory growth.
pub fn in_process_link(capacity: usize) -> (MasterLink, MasterEndpoint) {
    let (to_worker_tx, to_worker_rx) = bounded(capacity);
    let (to_master_tx, to_master_rx) = bounded(capacity);
    (
        MasterLink::new(to_worker_rx, to_master_tx),
        MasterEndpoint {
            tx: to_worker_tx,
            rx: to_master_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_round_trip() {
        let (link, master) = in_process_link(16);
        master.send(MasterMsg::NoMoreWork).unwrap();
        match link.recv_timeout(Duration::from_secs(1)) {
            Ok(MasterMsg::NoMoreWork) => {}
            other => panic!("unexpected: {other:?}"),
        }
        link.send(WorkerMsg::WorkRequest).unwrap();
        match master.recv() {
            Ok(WorkerMsg::WorkRequest) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn dropped_master_reports_closed() {
        let (link, master) = in_process_link(1);
        drop(master);
        assert_eq!(link.send(WorkerMsg::WorkRequest), Err(LinkClosed));
    }
}
