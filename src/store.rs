//! File State Store (§4.2): the only component allowed to create, destroy or
//! rebase a [`FileStats`] entry. The control loop calls these functions while
//! holding the exclusive `ClusterState` lock; nothing here does its own
//! locking.

use crate::codec::FileMetadata;
use crate::model::{Cid, ClusterState, FileStats};

/// A `START_MONITOR` request, as decoded from the operations channel.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub file_cid: Cid,
    pub metadata_cid: Cid,
    pub strand_root_cid: Cid,
}

/// Register a file for monitoring, or no-op if already registered.
///
/// `strand_number` is resolved by matching `strand_root_cid` against the
/// file's metadata `tree_cids`; no match leaves `strand_number = 0` and the
/// node simply never becomes eligible to drive strand repair for this file.
pub fn start(state: &mut ClusterState, req: StartRequest, metadata: &FileMetadata) {
    if state.files.contains_key(&req.file_cid) {
        return;
    }
    let strand_number = metadata
        .strand_number_for(&req.strand_root_cid)
        .unwrap_or(0);
    let stats = FileStats::fresh(
        req.file_cid.clone(),
        req.metadata_cid,
        req.strand_root_cid,
        strand_number,
    );
    state.files.insert(req.file_cid, stats);
}

/// Remove a file and every WatchedBlock associated with it (invariant 2).
pub fn stop(state: &mut ClusterState, file_cid: &str) {
    state.files.remove(file_cid);
}

/// Damp the estimators after a successful repair without discarding all
/// accumulated knowledge (§4.2 `reset`).
pub fn reset(state: &mut ClusterState, file_cid: &str, is_data: bool) {
    let Some(fs) = state.files.get_mut(file_cid) else {
        return;
    };
    if is_data {
        fs.data_missing.clear();
    } else {
        fs.parity_missing.clear();
    }
    fs.block_prob = (fs.block_prob + 1.0) / 2.0;
    fs.health = (fs.health + 1.0) / 2.0;
}

pub fn get<'a>(state: &'a ClusterState, file_cid: &str) -> Option<&'a FileStats> {
    state.files.get(file_cid)
}

pub fn list(state: &ClusterState) -> Vec<&FileStats> {
    state.files.values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> FileMetadata {
        FileMetadata {
            tree_cids: vec!["R0".to_string(), "R1".to_string()],
            num_blocks: 16,
            alpha: 2,
        }
    }

    fn req() -> StartRequest {
        StartRequest {
            file_cid: "F".to_string(),
            metadata_cid: "M".to_string(),
            strand_root_cid: "R0".to_string(),
        }
    }

    #[test]
    fn start_resolves_strand_number_and_is_idempotent() {
        let mut state = ClusterState::default();
        start(&mut state, req(), &metadata());
        let fs = get(&state, "F").unwrap();
        assert_eq!(fs.strand_number, 0);
        assert_eq!(fs.block_prob, 1.0);
        assert_eq!(fs.health, 1.0);

        // second start is a no-op even with different strand_root_cid
        let mut second = req();
        second.strand_root_cid = "R1".to_string();
        start(&mut state, second, &metadata());
        assert_eq!(get(&state, "F").unwrap().strand_number, 0);
        assert_eq!(state.files.len(), 1);
    }

    #[test]
    fn start_defaults_strand_number_on_unmatched_root() {
        let mut state = ClusterState::default();
        let mut r = req();
        r.strand_root_cid = "unknown".to_string();
        start(&mut state, r, &metadata());
        assert_eq!(get(&state, "F").unwrap().strand_number, 0);
    }

    #[test]
    fn stop_removes_all_watched_blocks() {
        let mut state = ClusterState::default();
        start(&mut state, req(), &metadata());
        state
            .files
            .get_mut("F")
            .unwrap()
            .data_missing
            .insert(3, crate::model::WatchedBlock::first_miss("c3".into()));
        stop(&mut state, "F");
        assert!(get(&state, "F").is_none());
    }

    #[test]
    fn start_stop_start_returns_to_fresh_shape() {
        let mut state = ClusterState::default();
        start(&mut state, req(), &metadata());
        state.files.get_mut("F").unwrap().block_prob = 0.2;
        stop(&mut state, "F");
        start(&mut state, req(), &metadata());
        let fs = get(&state, "F").unwrap();
        assert_eq!(fs.block_prob, 1.0);
        assert_eq!(fs.health, 1.0);
        assert!(fs.data_missing.is_empty());
    }

    #[test]
    fn reset_data_preserves_parity_side() {
        let mut state = ClusterState::default();
        start(&mut state, req(), &metadata());
        {
            let fs = state.files.get_mut("F").unwrap();
            fs.data_missing
                .insert(1, crate::model::WatchedBlock::first_miss("d1".into()));
            fs.parity_missing
                .insert(2, crate::model::WatchedBlock::first_miss("p2".into()));
            fs.parity_history
                .insert(5, crate::model::WatchedBlock::first_miss("p5".into()));
            fs.block_prob = 0.4;
            fs.health = 0.2;
        }
        reset(&mut state, "F", true);
        let fs = get(&state, "F").unwrap();
        assert!(fs.data_missing.is_empty());
        assert_eq!(fs.parity_missing.len(), 1);
        assert_eq!(fs.parity_history.len(), 1);
        assert_eq!(fs.block_prob, 0.7);
        assert_eq!(fs.health, 0.6);
    }
}
