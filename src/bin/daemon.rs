//! `strandwatch-daemon`: the CLI entry point (§6.5). Parses flags, builds
//! the server context against real HTTP adapters, announces this node to
//! discovery, binds the HTTP surface, and runs the control loop until a
//! shutdown signal arrives.

use std::sync::Arc;

use clap::Parser;
use strandwatch::adapters::{HttpDiscoveryAdapter, HttpStorageAdapter};
use strandwatch::codec::EntanglementCodec;
use strandwatch::config::{NetworkConfig, SentinelConfig};
use strandwatch::control;
use strandwatch::model::NodeIdentity;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Run the monitoring/repair daemon for one community node.
#[derive(Debug, Parser)]
#[command(name = "daemon", about = "Federated monitoring and repair daemon")]
struct DaemonArgs {
    /// Port this node's HTTP surface listens on.
    #[arg(short = 'p', long, default_value_t = 8090)]
    port: u16,

    /// This node's own community address, as advertised to peers.
    #[arg(short = 'c', long = "community-ip", default_value = "127.0.0.1")]
    community_ip: String,

    /// Address of the adjacent cluster (block-store) node.
    #[arg(short = 'l', long = "cluster-ip", default_value = "127.0.0.1")]
    cluster_ip: String,

    /// Port of the adjacent cluster node's API.
    #[arg(short = 'r', long = "cluster-port", default_value_t = 9094)]
    cluster_port: u16,

    /// Address of the underlying content-addressed store.
    #[arg(short = 'i', long = "ipfs-ip", default_value = "127.0.0.1")]
    ipfs_ip: String,

    /// Port of the underlying content-addressed store.
    #[arg(short = 'f', long = "ipfs-port", default_value_t = 5001)]
    ipfs_port: u16,

    /// Base URL of the discovery service.
    #[arg(short = 'd', long, default_value = "http://127.0.0.1:7000")]
    discovery: String,
}

impl From<DaemonArgs> for NetworkConfig {
    fn from(args: DaemonArgs) -> Self {
        NetworkConfig {
            port: args.port,
            community_ip: args.community_ip,
            cluster_ip: args.cluster_ip,
            cluster_port: args.cluster_port,
            ipfs_ip: args.ipfs_ip,
            ipfs_port: args.ipfs_port,
            discovery: args.discovery,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = DaemonArgs::parse();
    let network: NetworkConfig = args.into();
    let config = SentinelConfig {
        network: network.clone(),
        ..SentinelConfig::default()
    };

    let cluster_base = format!("http://{}:{}", network.cluster_ip, network.cluster_port);
    let ipfs_base = format!("http://{}:{}", network.ipfs_ip, network.ipfs_port);
    let storage = Arc::new(HttpStorageAdapter::new(
        cluster_base,
        ipfs_base,
        config.tuning.peer_call_deadline,
    ));
    let discovery = Arc::new(HttpDiscoveryAdapter::new(
        network.discovery.clone(),
        config.tuning.peer_call_deadline,
    ));
    let codec: Arc<dyn EntanglementCodec> = match build_codec() {
        Some(c) => c,
        None => {
            error!("no entanglement codec configured");
            std::process::exit(1);
        }
    };

    let self_community_address = format!("http://{}:{}", network.community_ip, network.port);
    let identity = NodeIdentity {
        cluster_name: network.cluster_ip.clone(),
        community_address: self_community_address.clone(),
        cluster_address: format!("{}:{}", network.cluster_ip, network.cluster_port),
    };

    if let Err(e) = announce(&discovery, &identity).await {
        error!(error = %e, "self-announce to discovery service failed");
        std::process::exit(1);
    }

    let (ctx, receivers) = control::new_context(codec, storage, discovery, identity, config);
    let app = strandwatch::http::router(ctx.clone());

    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", network.port)).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, port = network.port, "failed to bind HTTP surface");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let control_handle = tokio::spawn(control::run(ctx, receivers, shutdown_rx));

    info!(port = network.port, "strandwatch daemon listening");
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_ctrl_c())
        .await;

    let _ = shutdown_tx.send(()).await;
    let _ = control_handle.await;

    if let Err(e) = serve_result {
        error!(error = %e, "HTTP server exited with error");
        std::process::exit(1);
    }
}

async fn wait_for_ctrl_c() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn announce(
    discovery: &strandwatch::adapters::HttpDiscoveryAdapter,
    identity: &NodeIdentity,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&serde_json::json!({
        "cluster_name": identity.cluster_name,
        "community_address": identity.community_address,
    }))?;
    strandwatch::adapters::DiscoveryAdapter::post_json(discovery, &identity.community_address, "/announce", &body)
        .await
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!(e.to_string()))
}

/// The entanglement codec is an external library in production (§1
/// non-goals: its XOR lattice arithmetic is not re-derived here). Without one
/// wired in, run against the in-memory fake so the daemon is still
/// operable end to end for evaluation and integration testing.
fn build_codec() -> Option<Arc<dyn EntanglementCodec>> {
    #[cfg(feature = "testing")]
    {
        tracing::warn!("no production entanglement codec configured, using in-memory fake");
        Some(Arc::new(strandwatch::codec::mock::MockCodec::new()))
    }
    #[cfg(not(feature = "testing"))]
    {
        None
    }
}
