//! Core data model: watched files, watched blocks, and the repair records
//! that track in-flight collaborative and strand repairs.
//!
//! Everything here is plain data. Mutation rules live in [`crate::store`],
//! [`crate::inspector`], [`crate::view_sharer`], [`crate::collab`] and
//! [`crate::strand`] — this module only owns the shapes, matching the flat,
//! identifier-joined tables called for in the specification's re-architecture
//! notes (no file → block → peer pointer graph).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque content identifier. The crate never interprets its bytes; it only
/// compares, hashes and forwards them.
pub type Cid = String;

/// A peer's name as known to the block-network cluster (e.g. an IPFS Cluster
/// peer ID).
pub type PeerName = String;

/// Operator-supplied datacentre/rack label attached to a peer.
pub type Region = String;

/// Which of a file's two block kinds an index refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Data,
    Parity,
}

/// A cluster peer reference attached to a watched block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRef {
    pub name: PeerName,
    pub region: Region,
}

/// A block suspected (or confirmed, with repeated probing) absent.
///
/// `probability` estimates the likelihood the block is *actually* gone
/// rather than a transient failure: it starts at 0.33 on first miss and is
/// divided by 3 on each subsequent confirmed miss (§4.3.4, invariant 4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchedBlock {
    pub cid: Cid,
    pub peer: PeerRef,
    pub probability: f64,
}

impl WatchedBlock {
    pub fn first_miss(cid: Cid) -> Self {
        Self {
            cid,
            peer: PeerRef::default(),
            probability: 0.33,
        }
    }
}

/// Per-file monitoring statistics, keyed by `file_cid` in [`crate::store`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStats {
    pub file_cid: Cid,
    pub metadata_cid: Cid,
    pub strand_root_cid: Cid,
    pub strand_number: u32,

    pub data_missing: HashMap<u64, WatchedBlock>,
    pub parity_missing: HashMap<u64, WatchedBlock>,

    /// Parity blocks observed present, retained to support region-targeted
    /// probing. Deliberately excluded from the payload the View-Sharer
    /// broadcasts (§4.5 step 2: "excluding private fields like
    /// `parity_history`").
    #[serde(skip_serializing, default)]
    pub parity_history: HashMap<u64, WatchedBlock>,

    pub block_prob: f64,
    pub health: f64,
}

impl FileStats {
    pub fn fresh(file_cid: Cid, metadata_cid: Cid, strand_root_cid: Cid, strand_number: u32) -> Self {
        Self {
            file_cid,
            metadata_cid,
            strand_root_cid,
            strand_number,
            data_missing: HashMap::new(),
            parity_missing: HashMap::new(),
            parity_history: HashMap::new(),
            block_prob: 1.0,
            health: 1.0,
        }
    }

    pub fn missing_map(&self, kind: BlockKind) -> &HashMap<u64, WatchedBlock> {
        match kind {
            BlockKind::Data => &self.data_missing,
            BlockKind::Parity => &self.parity_missing,
        }
    }

    pub fn missing_map_mut(&mut self, kind: BlockKind) -> &mut HashMap<u64, WatchedBlock> {
        match kind {
            BlockKind::Data => &mut self.data_missing,
            BlockKind::Parity => &mut self.parity_missing,
        }
    }
}

/// Process-wide monitoring state. Exclusively owned and mutated by the
/// control loop under a single lock (see [`crate::control::ServerContext`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterState {
    pub files: HashMap<Cid, FileStats>,
    pub suspect_regions: HashMap<Region, Vec<PeerName>>,

    /// Nanosecond timestamps at which new missing blocks were discovered,
    /// used to report mean-time-between-failures.
    pub miss_timestamps: Vec<i64>,
}

impl ClusterState {
    pub fn mean_time_between_failures_ns(&self) -> Option<f64> {
        if self.miss_timestamps.len() < 2 {
            return None;
        }
        let deltas: Vec<f64> = self
            .miss_timestamps
            .windows(2)
            .map(|w| (w[1] - w[0]) as f64)
            .collect();
        Some(deltas.iter().sum::<f64>() / deltas.len() as f64)
    }
}

/// Outcome of a repair attempt, covering both collaborative and strand
/// repair records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RepairStatus {
    Pending,
    Success,
    Failure,
}

/// One peer's slice of a collaborative repair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerProgress {
    pub name: PeerName,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: RepairStatus,

    /// Leaf index → whether that leaf has been confirmed repaired. Every key
    /// here was part of the shard this peer was originally assigned
    /// (invariant 7).
    pub allocated_blocks: HashMap<u64, bool>,

    /// Per-block download counters reported back by the worker, kept for
    /// observability only.
    pub bytes_downloaded: u64,
}

impl PeerProgress {
    pub fn new(name: PeerName, shard: &[u64]) -> Self {
        Self {
            name,
            start_time: Utc::now(),
            end_time: None,
            status: RepairStatus::Pending,
            allocated_blocks: shard.iter().map(|&i| (i, false)).collect(),
            bytes_downloaded: 0,
        }
    }
}

/// A collaborative data-block repair in flight (or completed) for a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollabRepair {
    pub file_cid: Cid,
    pub meta_cid: Cid,
    pub depth: u32,

    /// Community address to report completion to; empty when this repair
    /// was self-triggered preventively and nobody is waiting on it.
    pub origin: String,

    pub status: RepairStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub peers: HashMap<PeerName, PeerProgress>,
}

impl CollabRepair {
    pub fn new(file_cid: Cid, meta_cid: Cid, depth: u32, origin: String) -> Self {
        Self {
            file_cid,
            meta_cid,
            depth,
            origin,
            status: RepairStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            peers: HashMap::new(),
        }
    }
}

/// A strand (parity tree) regeneration in flight (or completed) for a file.
/// At most one per file is ever PENDING (invariant 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrandRepair {
    pub file_cid: Cid,
    pub meta_cid: Cid,
    pub strand: u32,
    pub depth: u32,
    pub status: RepairStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl StrandRepair {
    pub fn new(file_cid: Cid, meta_cid: Cid, strand: u32, depth: u32) -> Self {
        Self {
            file_cid,
            meta_cid,
            strand,
            depth,
            status: RepairStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
        }
    }
}

/// This node's identity as known to peers via the discovery service.
/// Resolved once at startup and threaded through the server context rather
/// than read from a global (re-architecture note §9 item 5).
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub cluster_name: PeerName,
    pub community_address: String,
    pub cluster_address: String,
}

/// Lightweight, read-only summary of cluster health for `/checkClusterStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatusSnapshot {
    pub total_files: usize,
    pub total_missing_blocks: usize,
    pub suspect_region_count: usize,
    pub mean_time_between_failures_ns: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_file_stats_match_start_rules() {
        let fs = FileStats::fresh("F".into(), "M".into(), "R0".into(), 0);
        assert_eq!(fs.block_prob, 1.0);
        assert_eq!(fs.health, 1.0);
        assert!(fs.data_missing.is_empty());
        assert!(fs.parity_missing.is_empty());
        assert!(fs.parity_history.is_empty());
    }

    #[test]
    fn mean_time_between_failures_requires_two_samples() {
        let mut cs = ClusterState::default();
        assert_eq!(cs.mean_time_between_failures_ns(), None);
        cs.miss_timestamps.push(100);
        assert_eq!(cs.mean_time_between_failures_ns(), None);
        cs.miss_timestamps.push(300);
        cs.miss_timestamps.push(700);
        assert_eq!(cs.mean_time_between_failures_ns(), Some(300.0));
    }

    #[test]
    fn watched_block_first_miss_probability() {
        let wb = WatchedBlock::first_miss("cid7".into());
        assert_eq!(wb.probability, 0.33);
    }
}
