//! Daemon configuration.
//!
//! `SentinelConfig` collects the CLI flags from the `daemon` subcommand
//! (§6.5) together with the tuning constants named throughout the
//! specification (timer intervals, thresholds, sample sizes). Defaults match
//! the values called out in the spec text so a bare `daemon` invocation
//! behaves exactly as described there.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Full daemon configuration, built from CLI flags plus fixed tuning
/// constants that are not exposed on the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    /// Network configuration (bind address, discovery URL, cluster peer).
    pub network: NetworkConfig,

    /// Timer and threshold tuning for the control loop and its components.
    pub tuning: TuningConfig,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            tuning: TuningConfig::default(),
        }
    }
}

/// Everything needed to reach the local cluster node and the outside world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port this node's HTTP surface listens on.
    pub port: u16,

    /// This node's own community address, as advertised to peers.
    pub community_ip: String,

    /// Address of the adjacent cluster (block-store) node.
    pub cluster_ip: String,

    /// Port of the adjacent cluster node's API.
    pub cluster_port: u16,

    /// Address of the underlying content-addressed store (e.g. an IPFS node).
    pub ipfs_ip: String,

    /// Port of the underlying content-addressed store.
    pub ipfs_port: u16,

    /// Base URL of the discovery service.
    pub discovery: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: 8090,
            community_ip: "127.0.0.1".to_string(),
            cluster_ip: "127.0.0.1".to_string(),
            cluster_port: 9094,
            ipfs_ip: "127.0.0.1".to_string(),
            ipfs_port: 5001,
            discovery: "http://127.0.0.1:7000".to_string(),
        }
    }
}

/// Timer intervals, thresholds and sample sizes used by the control plane.
///
/// Field names mirror the constants named in §4 of the specification
/// verbatim so a reader can cross-reference them directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningConfig {
    /// How often the Inspector fires per monitored file (default 30s).
    pub inspection_interval: Duration,

    /// Deadline for a single block fetch during inspection (default 5s).
    pub inspection_deadline: Duration,

    /// How often the View-Sharer broadcasts per-file stats (default 4min).
    pub view_share_interval: Duration,

    /// Deadline for a single inter-peer HTTP call (default 2s).
    pub peer_call_deadline: Duration,

    /// Sliding-window size for the block-probability estimator (§4.3.3).
    pub estimator_window: f64,

    /// Below this `block_prob`, health is recomputed after a miss (§4.3.2).
    pub prob_threshold: f64,

    /// Below this `health`, collaborative repair is triggered (§4.3.2, §4.5).
    pub repair_threshold: f64,

    /// Number of blocks sampled by the Health Estimator (§4.4).
    pub health_sample_size: usize,

    /// Recovery depth requested by the Health Estimator (§4.4).
    pub health_depth: u32,

    /// Recovery depth used when the Inspector escalates to collaborative
    /// repair (matches the reference implementation's `depth=5`).
    pub collab_repair_depth: u32,

    /// Default number of peers to shard collaborative repair across.
    pub collab_repair_num_peers: usize,

    /// Number of peers requested by a strand repair's preliminary collab
    /// repair (fixed at 3 by the spec, §4.7).
    pub strand_collab_num_peers: usize,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            inspection_interval: Duration::from_secs(30),
            inspection_deadline: Duration::from_secs(5),
            view_share_interval: Duration::from_secs(4 * 60),
            peer_call_deadline: Duration::from_secs(2),
            estimator_window: 20.0,
            prob_threshold: 0.8,
            repair_threshold: 0.6,
            health_sample_size: 10,
            health_depth: 2,
            collab_repair_depth: 5,
            collab_repair_num_peers: 2,
            strand_collab_num_peers: 3,
        }
    }
}
