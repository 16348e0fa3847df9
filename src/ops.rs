//! Event-channel payloads exchanged between the control loop and its
//! components (design note §9.2: a tagged `Event` variant multiplexed by a
//! single task, here expressed as channel message types rather than one
//! mega-enum so each producer owns its own channel).

use serde::{Deserialize, Serialize};

use crate::model::{Cid, PeerName, RepairStatus};

/// `START_MONITOR` / `STOP_MONITOR` / `RESET_MONITOR`, decoded from the
/// operations channel per their `OperationType` tag (§3, §9.3).
#[derive(Debug, Clone)]
pub enum MonitorOp {
    Start(crate::store::StartRequest),
    Stop { file_cid: Cid },
    Reset { file_cid: Cid, is_data: bool },
}

/// Request to start a collaborative data-block repair (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollabOp {
    pub file_cid: Cid,
    pub meta_cid: Cid,
    pub depth: u32,
    /// Community address to report completion to; empty when self-triggered.
    pub origin: String,
    pub num_peers: usize,
}

/// Request delivered to a worker peer asking it to repair a shard of leaves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitOp {
    pub file_cid: Cid,
    pub meta_cid: Cid,
    pub depth: u32,
    pub origin: String,
    pub failed_indices: Vec<u64>,
}

/// Request to start a strand (parity tree) regeneration (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrandOp {
    pub file_cid: Cid,
    pub meta_cid: Cid,
    pub strand: u32,
    pub depth: u32,
}

/// Reported back from the Collab Repair Coordinator to itself (self-message)
/// so the Strand Repair Coordinator can chain on completion (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollabDone {
    pub file_cid: Cid,
    pub status: RepairStatus,
}

/// A worker peer's report of its shard's outcome, fed back to
/// `ReportUnitRepair` (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitDone {
    pub file_cid: Cid,
    pub peer: PeerName,
    pub leaf_results: std::collections::HashMap<u64, bool>,
    pub bytes_downloaded: u64,
}

/// A gossiped view delivered to `/updateView` (§4.5, §6.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewUpdate {
    pub file_cid: Cid,
    pub metadata_cid: Cid,
    pub strand_root_cid: Cid,
    pub stats: crate::model::FileStats,
}

/// Read-only questions the HTTP surface asks of the control loop instead of
/// locking `ClusterState` itself (§6.4: "no handler touches `ClusterState`
/// directly"). Each variant carries a one-shot responder; the control loop
/// answers from inside its own task, so a read never races a concurrent
/// mutation from the same loop.
#[derive(Debug)]
pub enum StateQuery {
    ListFiles(tokio::sync::oneshot::Sender<Vec<Cid>>),
    FileStatus(Cid, tokio::sync::oneshot::Sender<Option<crate::model::FileStats>>),
    ClusterStatus(tokio::sync::oneshot::Sender<crate::model::ClusterStatusSnapshot>),
    RecomputeHealth(Cid, tokio::sync::oneshot::Sender<Option<f64>>),
}
