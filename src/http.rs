//! HTTP surface (§6.4): one axum router per community node. Every handler
//! either enqueues onto a control-loop channel and returns immediately, or
//! reads a point-in-time snapshot of `ClusterState` under the shared lock.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::control::ServerContext;
use crate::model::{Cid, FileStats};
use crate::ops::{CollabDone, CollabOp, MonitorOp, StateQuery, StrandOp, UnitDone, UnitOp, ViewUpdate};
use crate::store;

pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/forwardMonitoring", post(forward_monitoring))
        .route("/startMonitorFile", post(start_monitor_file))
        .route("/stopMonitorFile", post(stop_monitor_file))
        .route("/resetMonitorFile", post(reset_monitor_file))
        .route("/updateView", post(update_view))
        .route("/listMonitor", get(list_monitor))
        .route("/checkFileStatus", get(check_file_status))
        .route("/checkClusterStatus", get(check_cluster_status))
        .route("/recomputeHealth", get(recompute_health))
        .route("/triggerCollabRepair", post(trigger_collab_repair))
        .route("/triggerUnitRepair", post(trigger_unit_repair))
        .route("/triggerStrandRepair", post(trigger_strand_repair))
        .route("/reportUnitRepair", post(report_unit_repair))
        .route("/reportCollabRepair", post(report_collab_repair))
        .route("/health-check", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

#[derive(Debug, Deserialize)]
struct ForwardMonitoringRequest {
    file_cid: Cid,
    metadata_cid: Cid,
    strand_root_cids: Vec<Cid>,
}

async fn forward_monitoring(
    State(ctx): State<Arc<ServerContext>>,
    Json(req): Json<ForwardMonitoringRequest>,
) -> impl IntoResponse {
    for strand_root_cid in req.strand_root_cids {
        let allocations = match ctx.storage.allocations_for(&strand_root_cid).await {
            Ok(a) => a,
            Err(e) => {
                warn!(strand_root_cid, error = %e, "forwardMonitoring could not resolve allocations");
                continue;
            }
        };
        let start_req = StartRequestBody {
            file_cid: req.file_cid.clone(),
            metadata_cid: req.metadata_cid.clone(),
            strand_root_cid: strand_root_cid.clone(),
        };
        let Ok(body) = serde_json::to_vec(&start_req) else {
            continue;
        };
        for peer in allocations {
            if let Err(e) = ctx
                .discovery
                .post_json(&peer.address, "/startMonitorFile", &body)
                .await
            {
                warn!(peer = %peer.name, error = %e, "could not forward monitoring request");
            }
        }
    }
    StatusCode::OK
}

#[derive(Debug, Serialize, Deserialize)]
struct StartRequestBody {
    file_cid: Cid,
    metadata_cid: Cid,
    strand_root_cid: Cid,
}

async fn start_monitor_file(
    State(ctx): State<Arc<ServerContext>>,
    Json(req): Json<StartRequestBody>,
) -> impl IntoResponse {
    let op = MonitorOp::Start(store::StartRequest {
        file_cid: req.file_cid,
        metadata_cid: req.metadata_cid,
        strand_root_cid: req.strand_root_cid,
    });
    enqueue_monitor(&ctx, op).await
}

#[derive(Debug, Deserialize)]
struct StopRequestBody {
    file_cid: Cid,
}

async fn stop_monitor_file(
    State(ctx): State<Arc<ServerContext>>,
    Json(req): Json<StopRequestBody>,
) -> impl IntoResponse {
    enqueue_monitor(&ctx, MonitorOp::Stop { file_cid: req.file_cid }).await
}

#[derive(Debug, Deserialize)]
struct ResetRequestBody {
    file_cid: Cid,
    is_data: bool,
}

async fn reset_monitor_file(
    State(ctx): State<Arc<ServerContext>>,
    Json(req): Json<ResetRequestBody>,
) -> impl IntoResponse {
    enqueue_monitor(
        &ctx,
        MonitorOp::Reset {
            file_cid: req.file_cid,
            is_data: req.is_data,
        },
    )
    .await
}

async fn enqueue_monitor(ctx: &ServerContext, op: MonitorOp) -> StatusCode {
    match ctx.channels.monitor_tx.send(op).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[derive(Debug, Deserialize)]
struct FileCidQuery {
    #[serde(rename = "fileCID")]
    file_cid: Cid,
}

async fn update_view(
    State(ctx): State<Arc<ServerContext>>,
    Query(q): Query<FileCidQuery>,
    Json(stats): Json<FileStats>,
) -> impl IntoResponse {
    let view = ViewUpdate {
        file_cid: q.file_cid,
        metadata_cid: stats.metadata_cid.clone(),
        strand_root_cid: stats.strand_root_cid.clone(),
        stats,
    };
    match ctx.channels.view_tx.send(view).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn list_monitor(State(ctx): State<Arc<ServerContext>>) -> impl IntoResponse {
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    if ctx
        .channels
        .query_tx
        .send(StateQuery::ListFiles(reply_tx))
        .await
        .is_err()
    {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match reply_rx.await {
        Ok(cids) => Json(cids).into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn check_file_status(
    State(ctx): State<Arc<ServerContext>>,
    Query(q): Query<FileCidQuery>,
) -> impl IntoResponse {
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    if ctx
        .channels
        .query_tx
        .send(StateQuery::FileStatus(q.file_cid, reply_tx))
        .await
        .is_err()
    {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match reply_rx.await {
        Ok(Some(fs)) => Json(fs).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn check_cluster_status(State(ctx): State<Arc<ServerContext>>) -> impl IntoResponse {
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    if ctx
        .channels
        .query_tx
        .send(StateQuery::ClusterStatus(reply_tx))
        .await
        .is_err()
    {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match reply_rx.await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn recompute_health(
    State(ctx): State<Arc<ServerContext>>,
    Query(q): Query<FileCidQuery>,
) -> impl IntoResponse {
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    if ctx
        .channels
        .query_tx
        .send(StateQuery::RecomputeHealth(q.file_cid, reply_tx))
        .await
        .is_err()
    {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    match reply_rx.await {
        Ok(Some(health)) => Json(health).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn trigger_collab_repair(
    State(ctx): State<Arc<ServerContext>>,
    Json(op): Json<CollabOp>,
) -> impl IntoResponse {
    match ctx.channels.collab_tx.send(op) {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn trigger_unit_repair(
    State(ctx): State<Arc<ServerContext>>,
    Json(op): Json<UnitOp>,
) -> impl IntoResponse {
    match ctx.channels.unit_tx.send(op).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn trigger_strand_repair(
    State(ctx): State<Arc<ServerContext>>,
    Json(op): Json<StrandOp>,
) -> impl IntoResponse {
    match ctx.channels.strand_tx.send(op) {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn report_unit_repair(
    State(ctx): State<Arc<ServerContext>>,
    Json(done): Json<UnitDone>,
) -> impl IntoResponse {
    match ctx.channels.unit_done_tx.send(done) {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn report_collab_repair(
    State(ctx): State<Arc<ServerContext>>,
    Json(done): Json<CollabDone>,
) -> impl IntoResponse {
    match ctx.channels.collab_done_tx.send(done) {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}
