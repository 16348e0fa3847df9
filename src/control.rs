//! The control loop (§4.1, §5, §9.2): single cooperative task, one exclusive
//! lock over [`ClusterState`], multiplexing the operations channels and the
//! two timers. Every mutation to state happens inside `run`'s event loop;
//! everything else in this crate only computes what the loop should do.

use std::sync::Arc;

use rand::SeedableRng;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{self, Duration};
use tracing::{error, info, warn};

use crate::adapters::{DiscoveryAdapter, StorageAdapter};
use crate::codec::EntanglementCodec;
use crate::collab::{self, CollabRegistry};
use crate::config::SentinelConfig;
use crate::health::HealthTuning;
use crate::inspector::{self, InspectorOutcome, InspectorTuning};
use crate::model::{ClusterState, ClusterStatusSnapshot, NodeIdentity};
use crate::ops::{CollabDone, CollabOp, MonitorOp, StateQuery, StrandOp, UnitDone, UnitOp, ViewUpdate};
use crate::store;
use crate::strand::{self, StrandRegistry};
use crate::view_sharer;

/// Senders the HTTP surface (or any other caller) uses to enqueue work onto
/// the control loop. Cloning a channel handle is cheap; every handler clones
/// the one it needs off [`ServerContext`].
///
/// `monitor_tx`/`view_tx` are bounded: they are the externally-facing
/// surface (HTTP handlers), and §5 wants backpressure on callers there. The
/// repair-coordinator channels are unbounded: the loop itself posts to them
/// from within a handler when escalating or chaining repairs (e.g. one
/// inspection tick can escalate several files at once), and a bounded
/// channel the same task both fills and drains is a self-deadlock waiting to
/// happen.
#[derive(Clone)]
pub struct OpChannels {
    pub monitor_tx: mpsc::Sender<MonitorOp>,
    pub collab_tx: mpsc::UnboundedSender<CollabOp>,
    pub unit_tx: mpsc::Sender<UnitOp>,
    pub strand_tx: mpsc::UnboundedSender<StrandOp>,
    pub collab_done_tx: mpsc::UnboundedSender<CollabDone>,
    pub unit_done_tx: mpsc::UnboundedSender<UnitDone>,
    pub view_tx: mpsc::Sender<ViewUpdate>,
    pub query_tx: mpsc::Sender<StateQuery>,
}

struct OpReceivers {
    monitor_rx: mpsc::Receiver<MonitorOp>,
    collab_rx: mpsc::UnboundedReceiver<CollabOp>,
    unit_rx: mpsc::Receiver<UnitOp>,
    strand_rx: mpsc::UnboundedReceiver<StrandOp>,
    collab_done_rx: mpsc::UnboundedReceiver<CollabDone>,
    unit_done_rx: mpsc::UnboundedReceiver<UnitDone>,
    view_rx: mpsc::Receiver<ViewUpdate>,
    query_rx: mpsc::Receiver<StateQuery>,
}

/// Capacity for the externally-facing channels (§5's "unbuffered" requirement
/// approximated: small enough that a burst of requests blocks the caller,
/// not large enough to hide a stalled control loop).
const CHANNEL_CAPACITY: usize = 8;

fn channels() -> (OpChannels, OpReceivers) {
    let (monitor_tx, monitor_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (collab_tx, collab_rx) = mpsc::unbounded_channel();
    let (unit_tx, unit_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (strand_tx, strand_rx) = mpsc::unbounded_channel();
    let (collab_done_tx, collab_done_rx) = mpsc::unbounded_channel();
    let (unit_done_tx, unit_done_rx) = mpsc::unbounded_channel();
    let (view_tx, view_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (query_tx, query_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        OpChannels {
            monitor_tx,
            collab_tx,
            unit_tx,
            strand_tx,
            collab_done_tx,
            unit_done_tx,
            view_tx,
            query_tx,
        },
        OpReceivers {
            monitor_rx,
            collab_rx,
            unit_rx,
            strand_rx,
            collab_done_rx,
            unit_done_rx,
            view_rx,
            query_rx,
        },
    )
}

/// Everything the HTTP surface and the control loop share: state, the
/// two repair registries, the outbound adapters, this node's identity, and
/// the channel handles used to enqueue work. Constructed once at daemon
/// start per design note §9.5.
pub struct ServerContext {
    pub state: Mutex<ClusterState>,
    pub collab: Mutex<CollabRegistry>,
    pub strand: Mutex<StrandRegistry>,
    pub codec: Arc<dyn EntanglementCodec>,
    pub storage: Arc<dyn StorageAdapter>,
    pub discovery: Arc<dyn DiscoveryAdapter>,
    pub identity: NodeIdentity,
    pub config: SentinelConfig,
    pub channels: OpChannels,
}

impl ServerContext {
    pub fn snapshot(state: &ClusterState) -> ClusterStatusSnapshot {
        ClusterStatusSnapshot {
            total_files: state.files.len(),
            total_missing_blocks: state
                .files
                .values()
                .map(|f| f.data_missing.len() + f.parity_missing.len())
                .sum(),
            suspect_region_count: state.suspect_regions.len(),
            mean_time_between_failures_ns: state.mean_time_between_failures_ns(),
        }
    }
}

/// Build a fresh context plus the private receiver half of its channels.
pub fn new_context(
    codec: Arc<dyn EntanglementCodec>,
    storage: Arc<dyn StorageAdapter>,
    discovery: Arc<dyn DiscoveryAdapter>,
    identity: NodeIdentity,
    config: SentinelConfig,
) -> (Arc<ServerContext>, Receivers) {
    let (channels, receivers) = channels();
    let ctx = Arc::new(ServerContext {
        state: Mutex::new(ClusterState::default()),
        collab: Mutex::new(CollabRegistry::new()),
        strand: Mutex::new(StrandRegistry::new()),
        codec,
        storage,
        discovery,
        identity,
        config,
        channels,
    });
    (ctx, Receivers(receivers))
}

/// Opaque handle so callers outside this module can hold the receiver half
/// without reaching into its private fields.
pub struct Receivers(OpReceivers);

/// Run the control loop until `shutdown` fires. This is the single
/// serialization point: every arm below holds `ctx.state` (and the repair
/// registries, where needed) for the duration of its handler and none of
/// them issue unbounded-latency calls while holding it.
pub async fn run(ctx: Arc<ServerContext>, receivers: Receivers, mut shutdown: mpsc::Receiver<()>) {
    let Receivers(mut rx) = receivers;
    let mut inspect_timer = time::interval(ctx.config.tuning.inspection_interval);
    let mut share_timer = time::interval(ctx.config.tuning.view_share_interval);

    info!("control loop started");
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("control loop received shutdown signal");
                break;
            }
            Some(op) = rx.monitor_rx.recv() => {
                handle_monitor_op(&ctx, op).await;
            }
            Some(op) = rx.collab_rx.recv() => {
                handle_collab_op(&ctx, op).await;
            }
            Some(op) = rx.unit_rx.recv() => {
                handle_unit_op(&ctx, op).await;
            }
            Some(op) = rx.strand_rx.recv() => {
                handle_strand_op(&ctx, op).await;
            }
            Some(done) = rx.collab_done_rx.recv() => {
                handle_collab_done(&ctx, done).await;
            }
            Some(done) = rx.unit_done_rx.recv() => {
                handle_unit_done(&ctx, done).await;
            }
            Some(view) = rx.view_rx.recv() => {
                handle_view_update(&ctx, view).await;
            }
            Some(query) = rx.query_rx.recv() => {
                handle_query(&ctx, query).await;
            }
            _ = inspect_timer.tick() => {
                tick_inspect(&ctx).await;
            }
            _ = share_timer.tick() => {
                tick_share(&ctx).await;
            }
        }
    }
}

async fn handle_monitor_op(ctx: &ServerContext, op: MonitorOp) {
    match op {
        MonitorOp::Start(req) => {
            let metadata = match ctx.codec.get_metadata(&req.metadata_cid).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(file_cid = %req.file_cid, error = %e, "could not resolve metadata for start");
                    return;
                }
            };
            let mut state = ctx.state.lock().await;
            store::start(&mut state, req, &metadata);
        }
        MonitorOp::Stop { file_cid } => {
            let mut state = ctx.state.lock().await;
            store::stop(&mut state, &file_cid);
        }
        MonitorOp::Reset { file_cid, is_data } => {
            let mut state = ctx.state.lock().await;
            store::reset(&mut state, &file_cid, is_data);
        }
    }
}

async fn handle_collab_op(ctx: &ServerContext, op: CollabOp) {
    let mut collab = ctx.collab.lock().await;
    let mut rng = rand::rngs::StdRng::from_os_rng();
    let (done, dispatches) = collab::start_collab_repair(
        &mut collab,
        op,
        ctx.codec.as_ref(),
        ctx.discovery.as_ref(),
        &ctx.identity.community_address,
        &mut rng,
    )
    .await;
    drop(collab);

    // start_collab_repair already POSTed each shard to its accepted peer;
    // `dispatches` is kept on the return value only for callers (tests) that
    // want to inspect what was sent.
    let _ = dispatches;

    if let Some(done) = done {
        if ctx.channels.collab_done_tx.send(done).is_err() {
            error!("collab_done channel closed while reporting self-completion");
        }
    }
}

async fn handle_unit_op(ctx: &ServerContext, op: UnitOp) {
    let results = collab::start_unit_repair(&op, ctx.codec.as_ref()).await;
    if op.origin.is_empty() {
        return;
    }
    let done = UnitDone {
        file_cid: op.file_cid.clone(),
        peer: ctx.identity.cluster_name.clone(),
        leaf_results: results,
        bytes_downloaded: 0,
    };
    let body = match serde_json::to_vec(&done) {
        Ok(b) => b,
        Err(_) => return,
    };
    if let Err(e) = ctx
        .discovery
        .post_json(&op.origin, "/reportUnitRepair", &body)
        .await
    {
        warn!(origin = %op.origin, error = %e, "could not report unit repair completion");
    }
}

async fn handle_strand_op(ctx: &ServerContext, op: StrandOp) {
    let mut strand_registry = ctx.strand.lock().await;
    if let Some(collab_op) = strand::start_strand_repair(&mut strand_registry, op) {
        drop(strand_registry);
        if ctx.channels.collab_tx.send(collab_op).is_err() {
            error!("collab channel closed while chaining from strand repair");
        }
    }
}

async fn handle_collab_done(ctx: &ServerContext, done: CollabDone) {
    {
        let mut strand_registry = ctx.strand.lock().await;
        let mut state = ctx.state.lock().await;
        strand::continue_strand_repair(&mut strand_registry, &mut state, &done, ctx.codec.as_ref()).await;
    }

    let collab = ctx.collab.lock().await;
    let Some(record) = collab.get(&done.file_cid) else {
        return;
    };
    if record.origin.is_empty() {
        return;
    }
    let origin = record.origin.clone();
    drop(collab);

    let body = match serde_json::to_vec(&done) {
        Ok(b) => b,
        Err(_) => return,
    };
    if let Err(e) = ctx
        .discovery
        .post_json(&origin, "/reportCollabRepair", &body)
        .await
    {
        warn!(origin = %origin, error = %e, "could not report collab repair completion");
    }
}

async fn handle_unit_done(ctx: &ServerContext, done: UnitDone) {
    let mut collab = ctx.collab.lock().await;
    let completed = collab::report_unit_repair(&mut collab, done);
    drop(collab);
    if let Some(done) = completed {
        if ctx.channels.collab_done_tx.send(done).is_err() {
            error!("collab_done channel closed while completing unit repair");
        }
    }
}

async fn handle_view_update(ctx: &ServerContext, view: ViewUpdate) {
    let meta_cid = {
        let mut state = ctx.state.lock().await;
        let op = view_sharer::update_view(
            &mut state,
            &view.file_cid,
            &view.stats,
            &view.metadata_cid,
            &view.strand_root_cid,
        );
        if let Some(op) = op {
            drop(state);
            if ctx.channels.monitor_tx.send(op).await.is_err() {
                error!("monitor channel closed while starting monitor from incoming view");
            }
            return;
        }
        state
            .files
            .get(&view.file_cid)
            .expect("checked by update_view")
            .metadata_cid
            .clone()
    };

    // prepare_repair has no deadline of its own and must not be awaited
    // while holding the state lock (§5).
    let prepared = ctx
        .codec
        .prepare_repair(&view.file_cid, &meta_cid, ctx.config.tuning.health_depth)
        .await;
    let Ok((_metadata, _getter, lattice)) = prepared else {
        return;
    };
    let health_tuning = HealthTuning {
        sample_size: ctx.config.tuning.health_sample_size,
        depth: ctx.config.tuning.health_depth,
        per_sample_timeout: Duration::from_secs(1),
    };
    let mut rng = rand::rngs::StdRng::from_os_rng();
    let mut state = ctx.state.lock().await;
    let needs_repair = view_sharer::health_after_merge(
        &mut state,
        &view.file_cid,
        ctx.codec.as_ref(),
        lattice.as_ref(),
        &health_tuning,
        ctx.config.tuning.repair_threshold,
        &mut rng,
    )
    .await;
    drop(state);

    if needs_repair {
        let op = CollabOp {
            file_cid: view.file_cid,
            meta_cid,
            depth: ctx.config.tuning.collab_repair_depth,
            origin: String::new(),
            num_peers: ctx.config.tuning.collab_repair_num_peers,
        };
        if ctx.channels.collab_tx.send(op).is_err() {
            error!("collab channel closed while escalating after view merge");
        }
    }
}

async fn handle_query(ctx: &ServerContext, query: StateQuery) {
    match query {
        StateQuery::ListFiles(reply) => {
            let state = ctx.state.lock().await;
            let _ = reply.send(state.files.keys().cloned().collect());
        }
        StateQuery::FileStatus(file_cid, reply) => {
            let state = ctx.state.lock().await;
            let _ = reply.send(store::get(&state, &file_cid).cloned());
        }
        StateQuery::ClusterStatus(reply) => {
            let state = ctx.state.lock().await;
            let _ = reply.send(ServerContext::snapshot(&state));
        }
        StateQuery::RecomputeHealth(file_cid, reply) => {
            let meta_cid = {
                let state = ctx.state.lock().await;
                match store::get(&state, &file_cid) {
                    Some(fs) => fs.metadata_cid.clone(),
                    None => {
                        let _ = reply.send(None);
                        return;
                    }
                }
            };
            let depth = ctx.config.tuning.health_depth;
            let prepared = ctx.codec.prepare_repair(&file_cid, &meta_cid, depth).await;
            let Ok((_metadata, _getter, lattice)) = prepared else {
                let _ = reply.send(None);
                return;
            };
            let health_tuning = HealthTuning {
                sample_size: ctx.config.tuning.health_sample_size,
                depth,
                per_sample_timeout: Duration::from_secs(1),
            };
            let mut rng = rand::rngs::StdRng::from_os_rng();
            let mut state = ctx.state.lock().await;
            let health = crate::health::compute_health(
                &mut state,
                &file_cid,
                lattice.as_ref(),
                &health_tuning,
                &mut rng,
            )
            .await;
            if let Some(fs) = state.files.get_mut(&file_cid) {
                fs.health = health;
            }
            let _ = reply.send(Some(health));
        }
    }
}

async fn tick_inspect(ctx: &ServerContext) {
    let file_cids: Vec<String> = {
        let state = ctx.state.lock().await;
        state.files.keys().cloned().collect()
    };
    let tuning = InspectorTuning {
        estimator_window: ctx.config.tuning.estimator_window,
        prob_threshold: ctx.config.tuning.prob_threshold,
        repair_threshold: ctx.config.tuning.repair_threshold,
        collab_repair_depth: ctx.config.tuning.collab_repair_depth,
        collab_repair_num_peers: ctx.config.tuning.collab_repair_num_peers,
        inspection_deadline: ctx.config.tuning.inspection_deadline,
        health_sample_size: ctx.config.tuning.health_sample_size,
        health_depth: ctx.config.tuning.health_depth,
    };
    let mut rng = rand::rngs::StdRng::from_os_rng();
    for file_cid in file_cids {
        let outcome = {
            let mut state = ctx.state.lock().await;
            inspector::inspect_file(
                &mut state,
                &file_cid,
                ctx.codec.as_ref(),
                ctx.storage.as_ref(),
                &ctx.identity.community_address,
                &tuning,
                &mut rng,
            )
            .await
        };
        match outcome {
            InspectorOutcome::Nothing => {}
            InspectorOutcome::TriggerCollab(op) => {
                if ctx.channels.collab_tx.send(op).is_err() {
                    error!("collab channel closed during inspection escalation");
                }
            }
            InspectorOutcome::TriggerStrand(op) => {
                if ctx.channels.strand_tx.send(op).is_err() {
                    error!("strand channel closed during inspection escalation");
                }
            }
        }
    }
}

async fn tick_share(ctx: &ServerContext) {
    let file_cids: Vec<String> = {
        let state = ctx.state.lock().await;
        state.files.keys().cloned().collect()
    };
    for file_cid in file_cids {
        let outcome = {
            let state = ctx.state.lock().await;
            view_sharer::share_file(
                &state,
                &file_cid,
                &ctx.identity.cluster_name,
                ctx.storage.as_ref(),
                ctx.discovery.as_ref(),
                &ctx.identity.community_address,
            )
            .await
        };

        for (address, stats) in outcome.posts {
            let body = match serde_json::to_string(&stats) {
                Ok(b) => b,
                Err(_) => continue,
            };
            let path = format!("/updateView?fileCID={file_cid}");
            if let Err(e) = ctx
                .discovery
                .post_json(&address, &path, body.as_bytes())
                .await
            {
                warn!(peer = %address, error = %e, "failed to share view");
            }
        }

        if outcome.self_deregister {
            let op = MonitorOp::Stop {
                file_cid: file_cid.clone(),
            };
            if ctx.channels.monitor_tx.send(op).await.is_err() {
                error!("monitor channel closed during self-deregistration");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::{MockDiscoveryAdapter, MockStorageAdapter};
    use crate::codec::mock::MockCodec;

    fn identity() -> NodeIdentity {
        NodeIdentity {
            cluster_name: "self-cluster".into(),
            community_address: "http://self".into(),
            cluster_address: "http://cluster".into(),
        }
    }

    #[tokio::test]
    async fn start_then_stop_via_channels_scenario_s1() {
        let codec = Arc::new(MockCodec::new());
        codec.metadata.lock().unwrap().replace(crate::codec::FileMetadata {
            tree_cids: vec!["R0".into(), "R1".into()],
            num_blocks: 16,
            alpha: 2,
        });
        let storage = Arc::new(MockStorageAdapter::default());
        let discovery = Arc::new(MockDiscoveryAdapter::default());
        let (ctx, receivers) = new_context(codec, storage, discovery, identity(), SentinelConfig::default());
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let loop_ctx = ctx.clone();
        let handle = tokio::spawn(run(loop_ctx, receivers, shutdown_rx));

        ctx.channels
            .monitor_tx
            .send(MonitorOp::Start(store::StartRequest {
                file_cid: "F".into(),
                metadata_cid: "M".into(),
                strand_root_cid: "R0".into(),
            }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        {
            let state = ctx.state.lock().await;
            let fs = state.files.get("F").expect("file should be monitored");
            assert_eq!(fs.strand_number, 0);
            assert_eq!(fs.block_prob, 1.0);
        }

        ctx.channels
            .monitor_tx
            .send(MonitorOp::Stop { file_cid: "F".into() })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        {
            let state = ctx.state.lock().await;
            assert!(state.files.is_empty());
        }

        drop(shutdown_tx);
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }
}
