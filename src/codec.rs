//! Codec contract: the interface the α-entanglement encoding/decoding
//! library exposes to the control plane (§6.1).
//!
//! The lattice block layout, parity generation and the XOR recovery walk
//! live in a separate codec crate this one depends on; only the interface is
//! defined here. [`MockCodec`] is an in-memory fake used by unit tests so the
//! control plane can be exercised without a real entanglement library.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::Cid;

/// Metadata describing a file's strand layout, as produced by the upload
/// pipeline and resolved through `GetMetaData`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Root CID of each parity strand's tree, indexed by strand number.
    pub tree_cids: Vec<Cid>,
    pub num_blocks: u64,
    pub alpha: u32,
}

impl FileMetadata {
    /// Resolve a `strand_root_cid` to its index in `tree_cids`, per the
    /// File State Store's `start` rule (§4.2).
    pub fn strand_number_for(&self, strand_root_cid: &str) -> Option<u32> {
        self.tree_cids
            .iter()
            .position(|cid| cid == strand_root_cid)
            .map(|i| i as u32)
    }
}

/// A neighbour descriptor used only by the Inspector's neighbour heuristic.
#[derive(Debug, Clone)]
pub struct NeighborRef {
    pub index: u64,
}

/// Resolves block indices to content identifiers. An empty string means the
/// intermediate tree node required to resolve the index is itself
/// unreachable (§4.3.2).
#[async_trait]
pub trait Getter: Send + Sync {
    async fn get_data_cid(&self, index: u64) -> Cid;
    async fn get_parity_cid(&self, index: u64, strand: u32) -> Cid;
}

/// A handle onto a file's entanglement lattice, parameterized by recovery
/// depth, as constructed by [`EntanglementCodec::prepare_repair`].
#[async_trait]
pub trait Lattice: Send + Sync {
    /// Fetch a data chunk, attempting no entanglement recovery.
    async fn get_chunk(&self, index: u64) -> anyhow::Result<Vec<u8>>;

    /// Fetch a data chunk, attempting entanglement recovery up to `depth`
    /// layers.
    async fn get_chunk_depth(&self, index: u64, depth: u32) -> anyhow::Result<Vec<u8>>;

    /// Fetch a parity chunk of the given strand.
    async fn get_parity(&self, index: u64, strand: u32) -> anyhow::Result<Vec<u8>>;

    fn num_data_blocks(&self) -> u64;
    fn num_parity_blocks(&self, strand: u32) -> u64;

    fn left_neighbors(&self, index: u64, kind_is_data: bool) -> Vec<NeighborRef>;
    fn right_neighbors(&self, index: u64, kind_is_data: bool) -> Vec<NeighborRef>;
}

/// The entanglement codec library's repair-facing contract (§6.1).
#[async_trait]
pub trait EntanglementCodec: Send + Sync {
    /// Construct a lattice handle plus metadata/CID-resolution helpers for a
    /// file, parameterized by the recovery depth the caller intends to use.
    async fn prepare_repair(
        &self,
        file_cid: &str,
        meta_cid: &str,
        depth: u32,
    ) -> anyhow::Result<(FileMetadata, Box<dyn Getter>, Box<dyn Lattice>)>;

    /// Repair intermediate tree nodes up to `depth` and return the leaf
    /// indices still missing at depth = 1.
    async fn retrieve_failed_leaves(
        &self,
        file_cid: &str,
        meta_cid: &str,
        depth: u32,
    ) -> anyhow::Result<Vec<u64>>;

    /// Repair the given leaf indices, returning per-leaf success.
    async fn repair_failed_leaves(
        &self,
        file_cid: &str,
        meta_cid: &str,
        depth: u32,
        indices: &[u64],
    ) -> anyhow::Result<HashMap<u64, bool>>;

    /// Regenerate and re-publish an entire parity strand, returning the new
    /// strand tree root CID for comparison against `tree_cids[strand]`.
    async fn repair_strand(
        &self,
        file_cid: &str,
        meta_cid: &str,
        strand: u32,
    ) -> anyhow::Result<Cid>;

    /// Resolve a metadata CID to its `FileMetadata`.
    async fn get_metadata(&self, meta_cid: &str) -> anyhow::Result<FileMetadata>;
}

#[cfg(any(test, feature = "testing"))]
pub mod mock {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// In-memory fake implementing [`EntanglementCodec`] for unit tests.
    /// Behavior is configured up front rather than simulated dynamically:
    /// callers set which indices resolve, which fetches fail, and what the
    /// repair calls should return.
    #[derive(Default)]
    pub struct MockCodec {
        pub metadata: Mutex<Option<FileMetadata>>,
        pub unreachable_data: Mutex<HashSet<u64>>,
        pub unreachable_parity: Mutex<HashSet<u64>>,
        pub missing_data: Mutex<HashSet<u64>>,
        pub missing_parity: Mutex<HashSet<u64>>,
        pub num_data_blocks: Mutex<u64>,
        pub num_parity_blocks: Mutex<u64>,
        pub failed_leaves: Mutex<Vec<u64>>,
        pub repair_results: Mutex<HashMap<u64, bool>>,
        pub strand_repair_result: Mutex<Option<anyhow::Result<Cid>>>,
    }

    impl MockCodec {
        pub fn new() -> Self {
            Self {
                num_data_blocks: Mutex::new(8),
                num_parity_blocks: Mutex::new(8),
                ..Default::default()
            }
        }
    }

    struct MockGetter {
        unreachable_data: HashSet<u64>,
        unreachable_parity: HashSet<u64>,
    }

    #[async_trait]
    impl Getter for MockGetter {
        async fn get_data_cid(&self, index: u64) -> Cid {
            if self.unreachable_data.contains(&index) {
                String::new()
            } else {
                format!("data-cid-{index}")
            }
        }

        async fn get_parity_cid(&self, index: u64, strand: u32) -> Cid {
            if self.unreachable_parity.contains(&index) {
                String::new()
            } else {
                format!("parity-cid-{strand}-{index}")
            }
        }
    }

    struct MockLattice {
        missing_data: HashSet<u64>,
        missing_parity: HashSet<u64>,
        num_data_blocks: u64,
        num_parity_blocks: u64,
    }

    #[async_trait]
    impl Lattice for MockLattice {
        async fn get_chunk(&self, index: u64) -> anyhow::Result<Vec<u8>> {
            if self.missing_data.contains(&index) {
                anyhow::bail!("no data for index {index}")
            } else {
                Ok(vec![0u8; 4])
            }
        }

        async fn get_chunk_depth(&self, index: u64, _depth: u32) -> anyhow::Result<Vec<u8>> {
            self.get_chunk(index).await
        }

        async fn get_parity(&self, index: u64, _strand: u32) -> anyhow::Result<Vec<u8>> {
            if self.missing_parity.contains(&index) {
                anyhow::bail!("no parity for index {index}")
            } else {
                Ok(vec![0u8; 4])
            }
        }

        fn num_data_blocks(&self) -> u64 {
            self.num_data_blocks
        }

        fn num_parity_blocks(&self, _strand: u32) -> u64 {
            self.num_parity_blocks
        }

        fn left_neighbors(&self, index: u64, _kind_is_data: bool) -> Vec<NeighborRef> {
            if index == 0 {
                vec![]
            } else {
                vec![NeighborRef { index: index - 1 }]
            }
        }

        fn right_neighbors(&self, index: u64, _kind_is_data: bool) -> Vec<NeighborRef> {
            vec![NeighborRef { index: index + 1 }]
        }
    }

    #[async_trait]
    impl EntanglementCodec for MockCodec {
        async fn prepare_repair(
            &self,
            _file_cid: &str,
            _meta_cid: &str,
            _depth: u32,
        ) -> anyhow::Result<(FileMetadata, Box<dyn Getter>, Box<dyn Lattice>)> {
            let metadata = self
                .metadata
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(FileMetadata {
                    tree_cids: vec!["R0".to_string()],
                    num_blocks: *self.num_data_blocks.lock().unwrap(),
                    alpha: 1,
                });
            let getter = Box::new(MockGetter {
                unreachable_data: self.unreachable_data.lock().unwrap().clone(),
                unreachable_parity: self.unreachable_parity.lock().unwrap().clone(),
            });
            let lattice = Box::new(MockLattice {
                missing_data: self.missing_data.lock().unwrap().clone(),
                missing_parity: self.missing_parity.lock().unwrap().clone(),
                num_data_blocks: *self.num_data_blocks.lock().unwrap(),
                num_parity_blocks: *self.num_parity_blocks.lock().unwrap(),
            });
            Ok((metadata, getter, lattice))
        }

        async fn retrieve_failed_leaves(
            &self,
            _file_cid: &str,
            _meta_cid: &str,
            _depth: u32,
        ) -> anyhow::Result<Vec<u64>> {
            Ok(self.failed_leaves.lock().unwrap().clone())
        }

        async fn repair_failed_leaves(
            &self,
            _file_cid: &str,
            _meta_cid: &str,
            _depth: u32,
            indices: &[u64],
        ) -> anyhow::Result<HashMap<u64, bool>> {
            let configured = self.repair_results.lock().unwrap();
            Ok(indices
                .iter()
                .map(|&i| (i, *configured.get(&i).unwrap_or(&true)))
                .collect())
        }

        async fn repair_strand(
            &self,
            _file_cid: &str,
            _meta_cid: &str,
            _strand: u32,
        ) -> anyhow::Result<Cid> {
            match self.strand_repair_result.lock().unwrap().take() {
                Some(result) => result,
                None => Ok("R0".to_string()),
            }
        }

        async fn get_metadata(&self, _meta_cid: &str) -> anyhow::Result<FileMetadata> {
            Ok(self
                .metadata
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(FileMetadata {
                    tree_cids: vec!["R0".to_string()],
                    num_blocks: *self.num_data_blocks.lock().unwrap(),
                    alpha: 1,
                }))
        }
    }
}
