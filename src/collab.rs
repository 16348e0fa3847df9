//! Collab Repair Coordinator (§4.6): drives collaborative data-block repair
//! by enumerating failed leaves, sharding them across peers, and folding
//! per-peer reports back into a [`CollabRepair`] record.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use tracing::{info, warn};

use crate::adapters::DiscoveryAdapter;
use crate::codec::EntanglementCodec;
use crate::model::{CollabRepair, PeerProgress, RepairStatus};
use crate::ops::{CollabDone, CollabOp, UnitDone, UnitOp};

/// Registry of in-flight/completed collab repairs, keyed by file CID. Held
/// by the control loop alongside `ClusterState`; a separate map rather than
/// embedding in `FileStats` so a repair can outlive a file being reset.
pub type CollabRegistry = HashMap<String, CollabRepair>;

/// §4.6 `StartCollabRepair`. Returns the peers that were asked to repair a
/// shard (for the caller to actually dispatch the HTTP POSTs against), plus
/// a [`CollabDone`] if the repair resolved immediately (no failed leaves, or
/// no peers available).
pub async fn start_collab_repair(
    registry: &mut CollabRegistry,
    op: CollabOp,
    codec: &dyn EntanglementCodec,
    discovery: &dyn DiscoveryAdapter,
    self_community_address: &str,
    rng: &mut impl rand::Rng,
) -> (Option<CollabDone>, Vec<(String, UnitOp)>) {
    if matches!(registry.get(&op.file_cid), Some(r) if r.status == RepairStatus::Pending) {
        return (None, vec![]);
    }

    let mut record = CollabRepair::new(
        op.file_cid.clone(),
        op.meta_cid.clone(),
        op.depth,
        op.origin.clone(),
    );

    let failed_leaves = match codec
        .retrieve_failed_leaves(&op.file_cid, &op.meta_cid, op.depth)
        .await
    {
        Ok(leaves) => leaves,
        Err(e) => {
            warn!(file_cid = %op.file_cid, error = %e, "retrieve_failed_leaves failed");
            record.status = RepairStatus::Failure;
            record.end_time = Some(chrono::Utc::now());
            let done = CollabDone {
                file_cid: op.file_cid.clone(),
                status: RepairStatus::Failure,
            };
            registry.insert(op.file_cid, record);
            return (Some(done), vec![]);
        }
    };

    if failed_leaves.is_empty() {
        record.status = RepairStatus::Success;
        record.end_time = Some(chrono::Utc::now());
        let done = CollabDone {
            file_cid: op.file_cid.clone(),
            status: RepairStatus::Success,
        };
        registry.insert(op.file_cid, record);
        return (Some(done), vec![]);
    }

    let mut peers = match discovery.list_peers(self_community_address).await {
        Ok(p) => p,
        Err(_) => vec![],
    };
    peers.shuffle(rng);

    if peers.is_empty() {
        record.status = RepairStatus::Failure;
        record.end_time = Some(chrono::Utc::now());
        let done = CollabDone {
            file_cid: op.file_cid.clone(),
            status: RepairStatus::Failure,
        };
        registry.insert(op.file_cid, record);
        return (Some(done), vec![]);
    }

    let p = op.num_peers.min(peers.len()).min(failed_leaves.len());
    let shard_size = failed_leaves.len() / p;
    let shards: Vec<Vec<u64>> = (0..p)
        .map(|i| failed_leaves[i * shard_size..(i + 1) * shard_size].to_vec())
        .collect();

    // Walk the shuffled peers circularly, POSTing each shard; advance to the
    // next peer only once one accepts, bounded by one full lap so an
    // all-unreachable peer set still terminates instead of looping forever.
    let mut dispatches = Vec::new();
    let mut cursor = 0usize;
    for shard in shards {
        let unit_op = UnitOp {
            file_cid: op.file_cid.clone(),
            meta_cid: op.meta_cid.clone(),
            depth: op.depth,
            origin: self_community_address.to_string(),
            failed_indices: shard.clone(),
        };
        let body = match serde_json::to_vec(&unit_op) {
            Ok(b) => b,
            Err(_) => continue,
        };
        let mut accepted_peer = None;
        for _ in 0..peers.len() {
            let candidate = peers[cursor % peers.len()].clone();
            cursor += 1;
            if discovery
                .post_json(&candidate, "/triggerUnitRepair", &body)
                .await
                .is_ok()
            {
                accepted_peer = Some(candidate);
                break;
            }
        }
        if let Some(peer_addr) = accepted_peer {
            record
                .peers
                .insert(peer_addr.clone(), PeerProgress::new(peer_addr.clone(), &shard));
            dispatches.push((peer_addr, unit_op));
        }
    }

    registry.insert(op.file_cid.clone(), record);
    (None, dispatches)
}

/// §4.6 `StartUnitRepair`: this node acting as a worker for another
/// coordinator's shard.
pub async fn start_unit_repair(
    op: &UnitOp,
    codec: &dyn EntanglementCodec,
) -> HashMap<u64, bool> {
    codec
        .repair_failed_leaves(&op.file_cid, &op.meta_cid, op.depth, &op.failed_indices)
        .await
        .unwrap_or_else(|e| {
            warn!(file_cid = %op.file_cid, error = %e, "repair_failed_leaves failed");
            op.failed_indices.iter().map(|&i| (i, false)).collect()
        })
}

/// §4.6 `ReportUnitRepair`: fold one peer's report into the record; returns
/// `Some(CollabDone)` once every peer has reported.
pub fn report_unit_repair(registry: &mut CollabRegistry, done: UnitDone) -> Option<CollabDone> {
    let Some(record) = registry.get_mut(&done.file_cid) else {
        warn!(file_cid = %done.file_cid, "unit repair report for unknown file, dropping");
        return None;
    };
    let Some(progress) = record.peers.get_mut(&done.peer) else {
        warn!(peer = %done.peer, file_cid = %done.file_cid, "unit repair report from unregistered peer, dropping");
        return None;
    };

    for (leaf, ok) in &done.leaf_results {
        if let Some(slot) = progress.allocated_blocks.get_mut(leaf) {
            *slot = *ok;
        }
    }
    progress.bytes_downloaded += done.bytes_downloaded;
    progress.end_time = Some(chrono::Utc::now());
    progress.status = if progress.allocated_blocks.values().all(|&ok| ok) {
        RepairStatus::Success
    } else {
        RepairStatus::Failure
    };

    let all_resolved = record
        .peers
        .values()
        .all(|p| p.status != RepairStatus::Pending);
    if !all_resolved {
        return None;
    }

    let overall = if record
        .peers
        .values()
        .all(|p| p.status == RepairStatus::Success)
    {
        RepairStatus::Success
    } else {
        RepairStatus::Failure
    };
    record.status = overall;
    record.end_time = Some(chrono::Utc::now());
    info!(file_cid = %done.file_cid, status = ?overall, "collab repair complete");

    Some(CollabDone {
        file_cid: done.file_cid,
        status: overall,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use crate::adapters::mock::MockDiscoveryAdapter;
    use crate::codec::mock::MockCodec;

    fn op(num_peers: usize) -> CollabOp {
        CollabOp {
            file_cid: "F".into(),
            meta_cid: "M".into(),
            depth: 5,
            origin: "http://origin".into(),
            num_peers,
        }
    }

    #[tokio::test]
    async fn empty_failed_leaves_is_immediate_success_scenario_s13() {
        let mut registry = CollabRegistry::new();
        let codec = MockCodec::new();
        let discovery = MockDiscoveryAdapter::default();
        let mut rng = rand::rngs::StdRng::from_os_rng();
        let (done, dispatches) =
            start_collab_repair(&mut registry, op(2), &codec, &discovery, "self", &mut rng).await;
        assert!(dispatches.is_empty());
        assert_eq!(done.unwrap().status, RepairStatus::Success);
        assert_eq!(registry["F"].status, RepairStatus::Success);
    }

    #[tokio::test]
    async fn empty_peer_set_reaches_failure_not_infinite_loop_scenario_s12() {
        let mut registry = CollabRegistry::new();
        let codec = MockCodec::new();
        codec.failed_leaves.lock().unwrap().extend([1, 2, 3]);
        let discovery = MockDiscoveryAdapter::default(); // no peers registered
        let mut rng = rand::rngs::StdRng::from_os_rng();
        let (done, dispatches) =
            start_collab_repair(&mut registry, op(2), &codec, &discovery, "self", &mut rng).await;
        assert!(dispatches.is_empty());
        assert_eq!(done.unwrap().status, RepairStatus::Failure);
    }

    #[tokio::test]
    async fn shards_nine_leaves_across_three_peers_scenario_s5() {
        let mut registry = CollabRegistry::new();
        let codec = MockCodec::new();
        codec
            .failed_leaves
            .lock()
            .unwrap()
            .extend([1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let discovery = MockDiscoveryAdapter::default();
        *discovery.peers.lock().unwrap() = vec!["P1".into(), "P2".into(), "P3".into()];
        let mut rng = rand::rngs::StdRng::from_os_rng();
        let (done, dispatches) =
            start_collab_repair(&mut registry, op(3), &codec, &discovery, "self", &mut rng).await;
        assert!(done.is_none());
        assert_eq!(dispatches.len(), 3);
        for (_, unit_op) in &dispatches {
            assert_eq!(unit_op.failed_indices.len(), 3);
        }

        for (peer, _) in &dispatches {
            let leaves: Vec<u64> = registry["F"].peers[peer]
                .allocated_blocks
                .keys()
                .copied()
                .collect();
            let results: HashMap<u64, bool> = leaves.iter().map(|&l| (l, true)).collect();
            let done = report_unit_repair(
                &mut registry,
                UnitDone {
                    file_cid: "F".into(),
                    peer: peer.clone(),
                    leaf_results: results,
                    bytes_downloaded: 10,
                },
            );
            if peer != dispatches.last().unwrap().0.as_str() {
                assert!(done.is_none());
            }
        }
        assert_eq!(registry["F"].status, RepairStatus::Success);
    }

    #[tokio::test]
    async fn reentry_while_pending_is_ignored() {
        let mut registry = CollabRegistry::new();
        registry.insert(
            "F".to_string(),
            CollabRepair::new("F".into(), "M".into(), 5, "".into()),
        );
        let codec = MockCodec::new();
        let discovery = MockDiscoveryAdapter::default();
        let mut rng = rand::rngs::StdRng::from_os_rng();
        let (done, dispatches) =
            start_collab_repair(&mut registry, op(2), &codec, &discovery, "self", &mut rng).await;
        assert!(done.is_none());
        assert!(dispatches.is_empty());
    }

    #[test]
    fn report_from_unregistered_peer_is_dropped() {
        let mut registry = CollabRegistry::new();
        registry.insert(
            "F".to_string(),
            CollabRepair::new("F".into(), "M".into(), 5, "".into()),
        );
        let done = report_unit_repair(
            &mut registry,
            UnitDone {
                file_cid: "F".into(),
                peer: "ghost".into(),
                leaf_results: HashMap::new(),
                bytes_downloaded: 0,
            },
        );
        assert!(done.is_none());
    }
}
