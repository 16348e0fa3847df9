//! View-Sharer (§4.5): periodically gossips per-file stats to peers
//! co-responsible for the same file, merges incoming views, and
//! self-deregisters when this node drops out of the allocation list.

use tracing::{debug, warn};

use crate::adapters::{DiscoveryAdapter, StorageAdapter};
use crate::codec::{EntanglementCodec, Lattice};
use crate::model::{ClusterState, FileStats};
use crate::ops::MonitorOp;

/// What sharing a single file's view produced: zero or more peers to POST
/// to, plus whether this node should stop monitoring (no longer
/// co-responsible).
pub struct ShareOutcome {
    pub posts: Vec<(String, FileStats)>,
    pub self_deregister: bool,
}

/// §4.5 step 1-3, for a single file.
pub async fn share_file(
    state: &ClusterState,
    file_cid: &str,
    self_cluster_name: &str,
    storage: &dyn StorageAdapter,
    discovery: &dyn DiscoveryAdapter,
    self_community_address: &str,
) -> ShareOutcome {
    let Some(fs) = state.files.get(file_cid) else {
        return ShareOutcome {
            posts: vec![],
            self_deregister: false,
        };
    };

    let allocations = match storage.allocations_for(&fs.strand_root_cid).await {
        Ok(a) => a,
        Err(e) => {
            warn!(file_cid, error = %e, "view-sharer could not resolve allocations");
            return ShareOutcome {
                posts: vec![],
                self_deregister: false,
            };
        }
    };

    let self_deregister = !allocations.iter().any(|p| p.name == self_cluster_name);

    let mut posts = Vec::new();
    for peer in &allocations {
        if peer.name == self_cluster_name {
            continue;
        }
        match discovery.list_peers(self_community_address).await {
            Ok(addresses) => {
                if let Some(address) = addresses.into_iter().find(|a| a.contains(&peer.address)) {
                    posts.push((address, fs.clone()));
                } else if !peer.address.is_empty() {
                    posts.push((peer.address.clone(), fs.clone()));
                }
            }
            Err(e) => {
                debug!(peer = %peer.name, error = %e, "discovery unreachable, skipping peer this cycle");
            }
        }
    }

    ShareOutcome {
        posts,
        self_deregister,
    }
}

/// Merge an incoming gossiped view into local state (§4.5 `UpdateView`).
///
/// Returns a [`MonitorOp::Start`] if this node was not monitoring the file
/// (the incoming view becomes a fresh monitor request), or `None` if the
/// merge was applied in place and the caller should check whether health
/// now warrants collaborative repair via [`crate::health::compute_health`].
pub fn update_view(
    state: &mut ClusterState,
    file_cid: &str,
    incoming: &FileStats,
    metadata_cid: &str,
    strand_root_cid: &str,
) -> Option<MonitorOp> {
    if !state.files.contains_key(file_cid) {
        return Some(MonitorOp::Start(crate::store::StartRequest {
            file_cid: file_cid.to_string(),
            metadata_cid: metadata_cid.to_string(),
            strand_root_cid: strand_root_cid.to_string(),
        }));
    }

    let fs = state.files.get_mut(file_cid).expect("checked above");
    for (&idx, wb) in &incoming.data_missing {
        fs.data_missing.insert(idx, wb.clone());
    }
    for (&idx, wb) in &incoming.parity_missing {
        fs.parity_missing.insert(idx, wb.clone());
    }
    fs.block_prob = (fs.block_prob + incoming.block_prob / 2.0).clamp(0.0, 1.0);
    None
}

/// After merging a view, recompute health from a fresh lattice and report
/// whether it now warrants collaborative data repair (§4.5 `UpdateView`,
/// last bullet).
pub async fn health_after_merge(
    state: &mut ClusterState,
    file_cid: &str,
    codec: &dyn EntanglementCodec,
    lattice: &dyn Lattice,
    health_tuning: &crate::health::HealthTuning,
    repair_threshold: f64,
    rng: &mut impl rand::Rng,
) -> bool {
    let _ = codec;
    let health = crate::health::compute_health(state, file_cid, lattice, health_tuning, rng).await;
    if let Some(fs) = state.files.get_mut(file_cid) {
        fs.health = health;
    }
    health < repair_threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WatchedBlock;

    fn fresh() -> FileStats {
        FileStats::fresh("F".into(), "M".into(), "R0".into(), 0)
    }

    #[test]
    fn update_view_starts_monitoring_when_absent() {
        let mut state = ClusterState::default();
        let incoming = fresh();
        let op = update_view(&mut state, "F", &incoming, "M", "R0");
        assert!(matches!(op, Some(MonitorOp::Start(_))));
    }

    #[test]
    fn update_view_unions_missing_maps_and_clamps_block_prob() {
        let mut state = ClusterState::default();
        let mut local = fresh();
        local.block_prob = 0.9;
        local
            .data_missing
            .insert(1, WatchedBlock::first_miss("c1".into()));
        state.files.insert("F".to_string(), local);

        let mut incoming = fresh();
        incoming.block_prob = 0.9;
        incoming
            .data_missing
            .insert(2, WatchedBlock::first_miss("c2".into()));

        let op = update_view(&mut state, "F", &incoming, "M", "R0");
        assert!(op.is_none());
        let fs = &state.files["F"];
        assert!(fs.data_missing.contains_key(&1));
        assert!(fs.data_missing.contains_key(&2));
        assert_eq!(fs.block_prob, 1.0); // 0.9 + 0.45 clamped to 1.0
    }

    #[test]
    fn update_view_idempotent_merge_of_identical_views() {
        let mut state = ClusterState::default();
        let mut local = fresh();
        local.block_prob = 0.5;
        local
            .data_missing
            .insert(3, WatchedBlock::first_miss("c3".into()));
        state.files.insert("F".to_string(), local.clone());

        // feed the same snapshot back (but block_prob halved as the sender
        // would report from its own state before our merge bumped it)
        let mut incoming = local.clone();
        incoming.block_prob = 0.0;
        update_view(&mut state, "F", &incoming, "M", "R0");
        let fs = &state.files["F"];
        assert_eq!(fs.data_missing.keys().collect::<Vec<_>>(), vec![&3]);
        assert_eq!(fs.parity_missing.len(), 0);
    }
}
