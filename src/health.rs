//! Health Estimator (§4.4): samples a file's data blocks at a shallow
//! recovery depth and reports the fraction recoverable. Ties health to
//! repairability rather than raw availability.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::codec::Lattice;
use crate::model::{BlockKind, ClusterState};

#[derive(Debug, Clone, Copy)]
pub struct HealthTuning {
    pub sample_size: usize,
    pub depth: u32,
    pub per_sample_timeout: std::time::Duration,
}

/// Sample `sample_size` data-block indices without replacement and ask the
/// lattice to recover each at `depth`. Misses are folded into
/// `data_missing` via [`crate::inspector::handle_missing`] with
/// `from_insights = false`, matching the spec's instruction that health
/// sampling use the same missing-block bookkeeping as a normal probe.
pub async fn compute_health(
    state: &mut ClusterState,
    file_cid: &str,
    lattice: &dyn Lattice,
    tuning: &HealthTuning,
    rng: &mut impl Rng,
) -> f64 {
    let total = lattice.num_data_blocks();
    if total == 0 {
        return 0.0;
    }
    let sample_size = tuning.sample_size.min(total as usize);
    let mut indices: Vec<u64> = (0..total).collect();
    indices.shuffle(rng);
    let sample = &indices[..sample_size];

    let mut successes = 0usize;
    for &index in sample {
        let outcome = tokio::time::timeout(
            tuning.per_sample_timeout,
            lattice.get_chunk_depth(index, tuning.depth),
        )
        .await;
        match outcome {
            Ok(Ok(_)) => successes += 1,
            _ => {
                let now_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
                crate::inspector::handle_missing(
                    state,
                    file_cid,
                    index,
                    BlockKind::Data,
                    None,
                    now_ns,
                );
            }
        }
    }
    successes as f64 / sample_size as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use crate::codec::mock::MockCodec;
    use crate::codec::EntanglementCodec;
    use crate::model::FileStats;

    #[tokio::test]
    async fn compute_health_counts_recoverable_fraction() {
        let mut state = ClusterState::default();
        state.files.insert(
            "F".to_string(),
            FileStats::fresh("F".into(), "M".into(), "R0".into(), 0),
        );
        let codec = MockCodec::new();
        *codec.num_data_blocks.lock().unwrap() = 10;
        codec.missing_data.lock().unwrap().extend([0, 1, 2]);
        let (_meta, _getter, lattice) = codec.prepare_repair("F", "M", 2).await.unwrap();

        let tuning = HealthTuning {
            sample_size: 10,
            depth: 2,
            per_sample_timeout: std::time::Duration::from_secs(1),
        };
        let mut rng = rand::rngs::StdRng::from_os_rng();
        let health = compute_health(&mut state, "F", lattice.as_ref(), &tuning, &mut rng).await;
        assert!((health - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn compute_health_zero_data_blocks_is_zero() {
        let mut state = ClusterState::default();
        state.files.insert(
            "F".to_string(),
            FileStats::fresh("F".into(), "M".into(), "R0".into(), 0),
        );
        let codec = MockCodec::new();
        *codec.num_data_blocks.lock().unwrap() = 0;
        let (_meta, _getter, lattice) = codec.prepare_repair("F", "M", 2).await.unwrap();
        let tuning = HealthTuning {
            sample_size: 10,
            depth: 2,
            per_sample_timeout: std::time::Duration::from_secs(1),
        };
        let mut rng = rand::rngs::StdRng::from_os_rng();
        let health = compute_health(&mut state, "F", lattice.as_ref(), &tuning, &mut rng).await;
        assert_eq!(health, 0.0);
    }
}
