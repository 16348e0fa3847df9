//! Outbound boundaries: the block-network/cluster storage surface and the
//! discovery service, each behind an `#[async_trait]` so the control plane
//! runs against in-memory fakes in tests (§6.2, §6.3).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{SentinelError, SentinelResult};
use crate::model::{Cid, PeerName, Region};

/// A peer as returned by cluster membership / discovery lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: PeerName,
    pub region: Region,
    pub address: String,
}

/// Storage-adapter surface onto the adjacent cluster node: peer allocation
/// lookups and raw block pin checks used by the Inspector's probe (§4.3.2)
/// and by repair coordinators resolving who holds what.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Peers the cluster has allocated a CID to, in allocation order.
    async fn allocations_for(&self, cid: &str) -> SentinelResult<Vec<PeerInfo>>;

    /// Whether `peer` currently reports the given CID pinned.
    async fn is_pinned(&self, peer: &PeerInfo, cid: &str) -> SentinelResult<bool>;

    /// Fetch raw bytes for a CID from the local content-addressed store,
    /// used by the probe path when no specific peer is targeted.
    async fn fetch(&self, cid: &str) -> SentinelResult<Vec<u8>>;
}

/// Discovery-service surface: resolving other cluster nodes' community
/// addresses and posting/retrieving gossiped file-stat views (§4.5).
#[async_trait]
pub trait DiscoveryAdapter: Send + Sync {
    /// All other community nodes currently registered with the discovery
    /// service, excluding this node.
    async fn list_peers(&self, self_address: &str) -> SentinelResult<Vec<String>>;

    /// Post a JSON payload to another community node's HTTP surface at
    /// `path`, used for `ShareView`/`UpdateView` and repair handoff.
    async fn post_json(&self, address: &str, path: &str, body: &[u8]) -> SentinelResult<Vec<u8>>;
}

/// [`StorageAdapter`] backed by the adjacent IPFS Cluster / IPFS HTTP APIs.
pub struct HttpStorageAdapter {
    client: reqwest::Client,
    cluster_base: String,
    ipfs_base: String,
}

impl HttpStorageAdapter {
    pub fn new(cluster_base: String, ipfs_base: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("building reqwest client with static config");
        Self {
            client,
            cluster_base,
            ipfs_base,
        }
    }
}

#[derive(Deserialize)]
struct ClusterAllocation {
    peer_name: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    address: String,
}

#[async_trait]
impl StorageAdapter for HttpStorageAdapter {
    async fn allocations_for(&self, cid: &str) -> SentinelResult<Vec<PeerInfo>> {
        let url = format!("{}/pins/{}", self.cluster_base, cid);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SentinelError::TransientFetch {
                what: format!("allocations for {cid}"),
                source: e.into(),
            })?;
        let allocations: Vec<ClusterAllocation> =
            resp.json().await.map_err(|e| SentinelError::Storage(e.to_string()))?;
        Ok(allocations
            .into_iter()
            .map(|a| PeerInfo {
                name: a.peer_name,
                region: a.region,
                address: a.address,
            })
            .collect())
    }

    async fn is_pinned(&self, peer: &PeerInfo, cid: &str) -> SentinelResult<bool> {
        let url = format!("{}/pins/{}/{}", self.cluster_base, peer.name, cid);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SentinelError::TransientFetch {
                what: format!("pin check for {cid} on {}", peer.name),
                source: e.into(),
            })?;
        Ok(resp.status().is_success())
    }

    async fn fetch(&self, cid: &str) -> SentinelResult<Vec<u8>> {
        let url = format!("{}/api/v0/block/get?arg={}", self.ipfs_base, cid);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| SentinelError::TransientFetch {
                what: format!("block fetch {cid}"),
                source: e.into(),
            })?;
        if !resp.status().is_success() {
            return Err(SentinelError::TransientFetch {
                what: format!("block fetch {cid}"),
                source: anyhow::anyhow!("status {}", resp.status()),
            });
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| SentinelError::Storage(e.to_string()))
    }
}

/// [`DiscoveryAdapter`] backed by the community discovery service's HTTP API.
pub struct HttpDiscoveryAdapter {
    client: reqwest::Client,
    discovery_base: String,
}

impl HttpDiscoveryAdapter {
    pub fn new(discovery_base: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("building reqwest client with static config");
        Self {
            client,
            discovery_base,
        }
    }
}

#[derive(Deserialize)]
struct DiscoveryPeer {
    address: String,
}

#[async_trait]
impl DiscoveryAdapter for HttpDiscoveryAdapter {
    async fn list_peers(&self, self_address: &str) -> SentinelResult<Vec<String>> {
        let url = format!("{}/peers", self.discovery_base);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SentinelError::DiscoveryUnreachable {
                peer: self.discovery_base.clone(),
                source: e.into(),
            })?;
        let peers: Vec<DiscoveryPeer> = resp
            .json()
            .await
            .map_err(|e| SentinelError::DiscoveryUnreachable {
                peer: self.discovery_base.clone(),
                source: e.into(),
            })?;
        Ok(peers
            .into_iter()
            .map(|p| p.address)
            .filter(|a| a != self_address)
            .collect())
    }

    async fn post_json(&self, address: &str, path: &str, body: &[u8]) -> SentinelResult<Vec<u8>> {
        let url = format!("{address}{path}");
        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| SentinelError::DiscoveryUnreachable {
                peer: address.to_string(),
                source: e.into(),
            })?;
        if !resp.status().is_success() {
            return Err(SentinelError::DiscoveryUnreachable {
                peer: address.to_string(),
                source: anyhow::anyhow!("status {}", resp.status()),
            });
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| SentinelError::DiscoveryUnreachable {
                peer: address.to_string(),
                source: e.into(),
            })
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod mock {
    use super::*;

    /// In-memory [`StorageAdapter`] fake: allocations and pin state are
    /// configured directly by tests.
    #[derive(Default)]
    pub struct MockStorageAdapter {
        pub allocations: Mutex<HashMap<Cid, Vec<PeerInfo>>>,
        pub pinned: Mutex<HashMap<(PeerName, Cid), bool>>,
        pub blocks: Mutex<HashMap<Cid, Vec<u8>>>,
    }

    #[async_trait]
    impl StorageAdapter for MockStorageAdapter {
        async fn allocations_for(&self, cid: &str) -> SentinelResult<Vec<PeerInfo>> {
            Ok(self
                .allocations
                .lock()
                .unwrap()
                .get(cid)
                .cloned()
                .unwrap_or_default())
        }

        async fn is_pinned(&self, peer: &PeerInfo, cid: &str) -> SentinelResult<bool> {
            Ok(*self
                .pinned
                .lock()
                .unwrap()
                .get(&(peer.name.clone(), cid.to_string()))
                .unwrap_or(&false))
        }

        async fn fetch(&self, cid: &str) -> SentinelResult<Vec<u8>> {
            self.blocks
                .lock()
                .unwrap()
                .get(cid)
                .cloned()
                .ok_or_else(|| SentinelError::TransientFetch {
                    what: format!("mock fetch {cid}"),
                    source: anyhow::anyhow!("no such block"),
                })
        }
    }

    /// In-memory [`DiscoveryAdapter`] fake.
    #[derive(Default)]
    pub struct MockDiscoveryAdapter {
        pub peers: Mutex<Vec<String>>,
        pub posts: Mutex<Vec<(String, String, Vec<u8>)>>,
        pub responses: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl DiscoveryAdapter for MockDiscoveryAdapter {
        async fn list_peers(&self, self_address: &str) -> SentinelResult<Vec<String>> {
            Ok(self
                .peers
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.as_str() != self_address)
                .cloned()
                .collect())
        }

        async fn post_json(&self, address: &str, path: &str, body: &[u8]) -> SentinelResult<Vec<u8>> {
            self.posts
                .lock()
                .unwrap()
                .push((address.to_string(), path.to_string(), body.to_vec()));
            Ok(self
                .responses
                .lock()
                .unwrap()
                .get(&format!("{address}{path}"))
                .cloned()
                .unwrap_or_default())
        }
    }
}
