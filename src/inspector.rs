//! Inspector: the adaptive block-sampling heuristic (§4.3).
//!
//! One probe per monitored file per inspection tick. The selection heuristic
//! (§4.3.1) and the estimator math (§4.3.3, §4.3.4) are plain, synchronous
//! and unit-testable; [`inspect_file`] is the async orchestration that wires
//! them to the codec and storage adapter.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::adapters::StorageAdapter;
use crate::codec::EntanglementCodec;
use crate::model::{BlockKind, ClusterState, FileStats, PeerRef, Region, WatchedBlock};
use crate::ops::{CollabOp, StrandOp};

/// Outcome of inspecting one file on one tick.
#[derive(Debug, Clone)]
pub enum InspectorOutcome {
    /// Nothing needed doing (no blocks, or probe succeeded and health stayed up).
    Nothing,
    /// The probed index's intermediate node is itself unreachable, or health
    /// fell below threshold on the data side: escalate to collab repair.
    TriggerCollab(CollabOp),
    /// The probed index's intermediate node is itself unreachable, or health
    /// fell below threshold on the parity side: escalate to strand repair.
    TriggerStrand(StrandOp),
}

/// Tuning knobs the inspector needs, lifted out of [`crate::config::TuningConfig`]
/// so selection/estimator functions stay independent of the full config type.
#[derive(Debug, Clone, Copy)]
pub struct InspectorTuning {
    pub estimator_window: f64,
    pub prob_threshold: f64,
    pub repair_threshold: f64,
    pub collab_repair_depth: u32,
    pub collab_repair_num_peers: usize,
    pub inspection_deadline: Duration,
    pub health_sample_size: usize,
    pub health_depth: u32,
}

/// §4.3.1: choose which kind of block to probe this tick.
pub fn choose_kind(rng: &mut impl Rng) -> BlockKind {
    if rng.random_bool(0.5) {
        BlockKind::Data
    } else {
        BlockKind::Parity
    }
}

/// §4.3.1: select a block index within the chosen kind. Returns the index
/// plus whether it was found via one of the "insights" branches (neighbour,
/// failed-region, retry) rather than uniform random.
///
/// `lattice_size` is the number of blocks of the chosen kind in the full
/// lattice, used only by the uniform-random fallback (design note §9.4: the
/// other branches must draw from the missing/history maps, never from the
/// full lattice size).
pub fn select_index(
    fs: &FileStats,
    kind: BlockKind,
    lattice_size: u64,
    suspect_regions: &HashMap<Region, Vec<crate::model::PeerName>>,
    neighbors_of: impl Fn(u64) -> Vec<u64>,
    rng: &mut impl Rng,
) -> Option<(u64, bool)> {
    let missing = fs.missing_map(kind);
    let n: u32 = rng.random_range(0..8);

    if n < 2 {
        if let Some(idx) = pick_neighbor(missing, &neighbors_of, rng) {
            return Some((idx, true));
        }
    }
    if n < 4 && kind == BlockKind::Parity {
        if let Some(idx) = pick_failed_region(&fs.parity_history, suspect_regions) {
            return Some((idx, true));
        }
    }
    if n < 5 {
        if let Some(idx) = pick_retry(missing, rng) {
            return Some((idx, true));
        }
    }
    if lattice_size == 0 {
        return None;
    }
    Some((rng.random_range(0..lattice_size), false))
}

fn pick_neighbor(
    missing: &HashMap<u64, WatchedBlock>,
    neighbors_of: &impl Fn(u64) -> Vec<u64>,
    rng: &mut impl Rng,
) -> Option<u64> {
    if missing.is_empty() {
        return None;
    }
    let keys: Vec<u64> = missing.keys().copied().collect();
    for _ in 0..4 {
        let base = keys[rng.random_range(0..keys.len())];
        let neighbors = neighbors_of(base);
        if !neighbors.is_empty() {
            return Some(neighbors[rng.random_range(0..neighbors.len())]);
        }
    }
    None
}

fn pick_failed_region(
    history: &HashMap<u64, WatchedBlock>,
    suspect_regions: &HashMap<Region, Vec<crate::model::PeerName>>,
) -> Option<u64> {
    history
        .iter()
        .find(|(_, wb)| {
            !wb.peer.region.is_empty() && suspect_regions.contains_key(&wb.peer.region)
        })
        .map(|(&idx, _)| idx)
}

fn pick_retry(missing: &HashMap<u64, WatchedBlock>, rng: &mut impl Rng) -> Option<u64> {
    if missing.is_empty() {
        return None;
    }
    let keys: Vec<u64> = missing.keys().copied().collect();
    Some(keys[rng.random_range(0..keys.len())])
}

/// §4.3.3: fold an observed availability sample (`1.0` present, `0.0` absent)
/// into the exponential-moving estimator.
pub fn update_estimator(block_prob: f64, value: f64, from_insights: bool, window: f64) -> f64 {
    let updated = if from_insights {
        (block_prob * (window - 0.5) + 0.5 * value) / window
    } else {
        (block_prob * (window - 1.0) + value) / window
    };
    updated.clamp(0.0, 1.0)
}

/// §4.3.4: record a missed probe, returning the probability value the
/// estimator update should use.
pub fn handle_missing(
    state: &mut ClusterState,
    file_cid: &str,
    index: u64,
    kind: BlockKind,
    peer: Option<PeerRef>,
    now_ns: i64,
) -> f64 {
    let fs = state
        .files
        .get_mut(file_cid)
        .expect("handle_missing called for a file no longer monitored");
    let probability = {
        let map = fs.missing_map_mut(kind);
        if let Some(wb) = map.get_mut(&index) {
            wb.probability /= 3.0;
            wb.probability
        } else {
            let mut wb = WatchedBlock::first_miss(String::new());
            if let Some(p) = peer.clone() {
                wb.peer = p;
            }
            let probability = wb.probability;
            map.insert(index, wb);
            state.miss_timestamps.push(now_ns);
            probability
        }
    };
    if kind == BlockKind::Parity {
        if let Some(p) = peer {
            if !p.region.is_empty() {
                state
                    .suspect_regions
                    .entry(p.region)
                    .or_default()
                    .push(p.name);
            }
        }
    }
    probability
}

/// Probe one file and return the escalation (if any) that resulted.
///
/// Orchestrates §4.3.2 end to end: resolves the chosen index through the
/// codec's lattice, fetches it from storage under a bounded deadline, folds
/// the outcome into the estimator, and recomputes health when availability
/// drops below [`InspectorTuning::prob_threshold`].
pub async fn inspect_file(
    state: &mut ClusterState,
    file_cid: &str,
    codec: &dyn EntanglementCodec,
    storage: &dyn StorageAdapter,
    self_origin: &str,
    tuning: &InspectorTuning,
    rng: &mut impl Rng,
) -> InspectorOutcome {
    let Some(fs) = state.files.get(file_cid) else {
        return InspectorOutcome::Nothing;
    };
    let meta_cid = fs.metadata_cid.clone();
    let strand_number = fs.strand_number;

    let (_metadata, getter, lattice) = match tokio::time::timeout(
        tuning.inspection_deadline,
        codec.prepare_repair(file_cid, &meta_cid, 1),
    )
    .await
    {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => {
            warn!(file_cid, error = %e, "prepare_repair failed during inspection");
            return InspectorOutcome::Nothing;
        }
        Err(_) => {
            warn!(file_cid, "prepare_repair timed out during inspection");
            return InspectorOutcome::Nothing;
        }
    };

    let num_data = lattice.num_data_blocks();
    let num_parity = lattice.num_parity_blocks(strand_number);
    if num_data == 0 && num_parity == 0 {
        return InspectorOutcome::Nothing;
    }

    let kind = choose_kind(rng);
    let lattice_size = match kind {
        BlockKind::Data => num_data,
        BlockKind::Parity => num_parity,
    };

    let fs = state.files.get(file_cid).expect("checked above");
    let neighbors_of = |idx: u64| -> Vec<u64> {
        lattice
            .left_neighbors(idx, kind == BlockKind::Data)
            .into_iter()
            .chain(lattice.right_neighbors(idx, kind == BlockKind::Data))
            .map(|n| n.index)
            .collect()
    };
    let selection = select_index(
        fs,
        kind,
        lattice_size,
        &state.suspect_regions,
        neighbors_of,
        rng,
    );
    let Some((index, from_insights)) = selection else {
        return InspectorOutcome::Nothing;
    };

    let cid_fetch = match kind {
        BlockKind::Data => tokio::time::timeout(tuning.inspection_deadline, getter.get_data_cid(index)),
        BlockKind::Parity => tokio::time::timeout(
            tuning.inspection_deadline,
            getter.get_parity_cid(index, strand_number),
        ),
    };
    let cid = cid_fetch.await.unwrap_or_default();
    if cid.is_empty() {
        debug!(file_cid, index, ?kind, "intermediate node unreachable, escalating");
        return escalate(fs, &meta_cid, self_origin, tuning, kind);
    }

    let fetch = tokio::time::timeout(tuning.inspection_deadline, storage.fetch(&cid)).await;
    let success = matches!(fetch, Ok(Ok(_)));

    if success {
        let fs = state.files.get_mut(file_cid).expect("checked above");
        fs.missing_map_mut(kind).remove(&index);
        if kind == BlockKind::Parity && !fs.parity_history.contains_key(&index) {
            if let Ok(allocations) = storage.allocations_for(&cid).await {
                if let Some(peer) = allocations.first() {
                    fs.parity_history.insert(
                        index,
                        WatchedBlock {
                            cid: cid.clone(),
                            peer: PeerRef {
                                name: peer.name.clone(),
                                region: peer.region.clone(),
                            },
                            probability: 0.0,
                        },
                    );
                }
            }
        }
        fs.block_prob = update_estimator(fs.block_prob, 1.0, from_insights, tuning.estimator_window);
        return InspectorOutcome::Nothing;
    }

    let peer = if kind == BlockKind::Parity {
        storage
            .allocations_for(&cid)
            .await
            .ok()
            .and_then(|allocs| allocs.into_iter().next())
            .map(|p| PeerRef {
                name: p.name,
                region: p.region,
            })
    } else {
        None
    };
    let now_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let probability = handle_missing(state, file_cid, index, kind, peer, now_ns);
    let fs = state.files.get_mut(file_cid).expect("checked above");
    fs.block_prob = update_estimator(fs.block_prob, probability, from_insights, tuning.estimator_window);
    let below_prob_threshold = fs.block_prob < tuning.prob_threshold;

    if below_prob_threshold {
        let health_tuning = crate::health::HealthTuning {
            sample_size: tuning.health_sample_size,
            depth: tuning.health_depth,
            per_sample_timeout: tuning.inspection_deadline,
        };
        let health = crate::health::compute_health(
            state,
            file_cid,
            lattice.as_ref(),
            &health_tuning,
            rng,
        )
        .await;
        let fs = state.files.get_mut(file_cid).expect("checked above");
        fs.health = health;
        if health < tuning.repair_threshold {
            let fs = state.files.get(file_cid).expect("checked above");
            return escalate(fs, &meta_cid, self_origin, tuning, kind);
        }
    }
    InspectorOutcome::Nothing
}

fn escalate(
    fs: &FileStats,
    meta_cid: &str,
    self_origin: &str,
    tuning: &InspectorTuning,
    kind: BlockKind,
) -> InspectorOutcome {
    match kind {
        BlockKind::Data => InspectorOutcome::TriggerCollab(CollabOp {
            file_cid: fs.file_cid.clone(),
            meta_cid: meta_cid.to_string(),
            depth: tuning.collab_repair_depth,
            origin: self_origin.to_string(),
            num_peers: tuning.collab_repair_num_peers,
        }),
        BlockKind::Parity => InspectorOutcome::TriggerStrand(StrandOp {
            file_cid: fs.file_cid.clone(),
            meta_cid: meta_cid.to_string(),
            strand: fs.strand_number,
            depth: tuning.collab_repair_depth,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;

    #[test]
    fn estimator_normal_update_matches_scenario_s3() {
        // S3: block_prob = (1.0*19 + 0.33) / 20 = 0.9665
        let updated = update_estimator(1.0, 0.33, false, 20.0);
        assert!((updated - 0.9665).abs() < 1e-9);
    }

    #[test]
    fn estimator_insights_update_downweights_signal() {
        let updated = update_estimator(1.0, 0.0, true, 20.0);
        assert!((updated - (19.5 / 20.0)).abs() < 1e-9);
    }

    #[test]
    fn estimator_clamps_to_unit_interval() {
        assert_eq!(update_estimator(0.0, -5.0, false, 20.0), 0.0);
        assert_eq!(update_estimator(1.0, 5.0, false, 20.0), 1.0);
    }

    #[test]
    fn handle_missing_first_time_sets_033_and_timestamps() {
        let mut state = ClusterState::default();
        state.files.insert(
            "F".to_string(),
            FileStats::fresh("F".into(), "M".into(), "R0".into(), 0),
        );
        let p = handle_missing(&mut state, "F", 7, BlockKind::Data, None, 100);
        assert_eq!(p, 0.33);
        assert_eq!(state.miss_timestamps, vec![100]);
        assert_eq!(
            state.files["F"].data_missing[&7].probability,
            0.33
        );
    }

    #[test]
    fn handle_missing_repeated_divides_by_three_each_time() {
        let mut state = ClusterState::default();
        state.files.insert(
            "F".to_string(),
            FileStats::fresh("F".into(), "M".into(), "R0".into(), 0),
        );
        handle_missing(&mut state, "F", 7, BlockKind::Data, None, 100);
        handle_missing(&mut state, "F", 7, BlockKind::Data, None, 200);
        let p3 = handle_missing(&mut state, "F", 7, BlockKind::Data, None, 300);
        // k = 3 consecutive misses: 0.33 * 3^-(3-1) = 0.33/9
        assert!((p3 - 0.33 / 9.0).abs() < 1e-12);
        // only the first miss appends a timestamp
        assert_eq!(state.miss_timestamps, vec![100]);
    }

    #[test]
    fn handle_missing_parity_records_suspect_region() {
        let mut state = ClusterState::default();
        state.files.insert(
            "F".to_string(),
            FileStats::fresh("F".into(), "M".into(), "R0".into(), 0),
        );
        let peer = PeerRef {
            name: "peerA".into(),
            region: "us-east".into(),
        };
        handle_missing(&mut state, "F", 2, BlockKind::Parity, Some(peer), 100);
        assert_eq!(state.suspect_regions["us-east"], vec!["peerA".to_string()]);
    }

    #[test]
    fn select_index_falls_back_to_uniform_when_no_insight_available() {
        let fs = FileStats::fresh("F".into(), "M".into(), "R0".into(), 0);
        let suspect = HashMap::new();
        // With empty missing/history maps every insights branch must fall
        // through to uniform random regardless of which `n` the rng drew.
        let mut rng = rand::rngs::StdRng::from_os_rng();
        let result = select_index(&fs, BlockKind::Data, 8, &suspect, |_| vec![], &mut rng);
        assert!(result.is_some());
        assert!(!result.unwrap().1);
    }

    #[test]
    fn select_index_retry_branch_picks_from_missing_set() {
        let mut fs = FileStats::fresh("F".into(), "M".into(), "R0".into(), 0);
        fs.data_missing.insert(4, WatchedBlock::first_miss("c4".into()));
        let suspect: HashMap<Region, Vec<crate::model::PeerName>> = HashMap::new();
        // n in [4,5) selects the retry branch deterministically is rng-dependent;
        // instead call pick_retry directly for a deterministic unit check.
        let mut rng = rand::rngs::StdRng::from_os_rng();
        let idx = pick_retry(&fs.data_missing, &mut rng);
        assert_eq!(idx, Some(4));
    }

    proptest::proptest! {
        #[test]
        fn estimator_stays_in_unit_interval(
            block_prob in 0.0f64..=1.0,
            value in -2.0f64..=2.0,
            from_insights: bool,
            window in 1.0f64..=100.0,
        ) {
            let updated = update_estimator(block_prob, value, from_insights, window);
            prop_assert!((0.0..=1.0).contains(&updated));
        }
    }
}
