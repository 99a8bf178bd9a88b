//! HTTP surface: batch API, progress websocket, DLQ admin, health.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::Utc;
use futures_util::{SinkExt as _, StreamExt as _};
use photoflow_engine::HealthChecker;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::coordinator::{BatchCoordinator, BatchRequest};
use crate::dlq::DlqAdmin;
use crate::job::JobStore;
use crate::progress::{ProgressBroadcaster, ProgressEventKind};

/// Websocket keepalive cadence.
const WS_PING_INTERVAL: Duration = Duration::from_secs(54);
/// A socket that sends nothing for this long is considered gone.
const WS_READ_DEADLINE: Duration = Duration::from_secs(60);

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    /// Batch owner.
    pub coordinator: Arc<BatchCoordinator>,
    /// Job snapshots.
    pub jobs: Arc<JobStore>,
    /// Progress hub.
    pub progress: Arc<ProgressBroadcaster>,
    /// DLQ admin backend.
    pub dlq: Arc<DlqAdmin>,
    /// Component prober.
    pub health: Arc<HealthChecker>,
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/batch", post(create_batch).get(list_batches))
        .route("/api/v1/batch/{job_id}", get(get_batch))
        .route("/api/v1/batch/{job_id}/ws", get(batch_progress_ws))
        .route("/admin/failed-jobs/api", get(list_failed_jobs))
        .route("/admin/failed-jobs/requeue", post(requeue_failed_job))
        .route("/health", get(health))
        .with_state(state)
}

async fn create_batch(
    State(state): State<AppState>,
    axum::Json(request): axum::Json<BatchRequest>,
) -> Response {
    match state.coordinator.create_batch(request) {
        Ok(job) => (
            StatusCode::CREATED,
            axum::Json(json!({
                "job_id": job.job_id,
                "status": job.status,
                "created_at": job.created_at,
                "message": format!("accepted {} image(s) for processing", job.total),
            })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({"error": err.to_string()})),
        )
            .into_response(),
    }
}

async fn get_batch(State(state): State<AppState>, Path(job_id): Path<String>) -> Response {
    match state.jobs.get(&job_id) {
        Some(job) => axum::Json(job).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            axum::Json(json!({"error": format!("unknown job {job_id}")})),
        )
            .into_response(),
    }
}

async fn list_batches(State(state): State<AppState>) -> Response {
    let jobs = state.jobs.list();
    axum::Json(json!({"total": jobs.len(), "jobs": jobs})).into_response()
}

async fn batch_progress_ws(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    if state.jobs.get(&job_id).is_none() {
        return (
            StatusCode::NOT_FOUND,
            axum::Json(json!({"error": format!("unknown job {job_id}")})),
        )
            .into_response();
    }
    upgrade.on_upgrade(move |socket| progress_socket(state, job_id, socket))
}

async fn progress_socket(state: AppState, job_id: String, socket: WebSocket) {
    let mut events = state.progress.subscribe(&job_id);
    let (mut sink, mut stream) = socket.split();

    // Catch the subscriber up with where the job already is.
    if let Some(job) = state.jobs.get(&job_id) {
        let snapshot =
            crate::progress::ProgressEvent::for_job(ProgressEventKind::Progress, &job, None);
        if send_event(&mut sink, &snapshot).await.is_err() {
            return;
        }
    }

    let mut ping = tokio::time::interval(WS_PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping.reset();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    // Subscriber was dropped (slow) or the hub evicted the job.
                    break;
                };
                let done = event.kind == ProgressEventKind::JobComplete;
                if send_event(&mut sink, &event).await.is_err() {
                    break;
                }
                if done {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            incoming = tokio::time::timeout(WS_READ_DEADLINE, stream.next()) => {
                match incoming {
                    Err(_) => {
                        debug!(job_id, "websocket read deadline expired");
                        break;
                    }
                    Ok(None) | Ok(Some(Err(_))) => break,
                    Ok(Some(Ok(Message::Close(_)))) => break,
                    // Pongs and client chatter just reset the deadline.
                    Ok(Some(Ok(_))) => {}
                }
            }
        }
    }
    debug!(job_id, "progress websocket closed");
}

async fn send_event(
    sink: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &crate::progress::ProgressEvent,
) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(event).unwrap_or_default();
    sink.send(Message::Text(payload.into())).await
}

async fn list_failed_jobs(State(state): State<AppState>) -> Response {
    match state.dlq.list().await {
        Ok(jobs) => axum::Json(json!({
            "count": jobs.len(),
            "jobs": jobs,
            "timestamp": Utc::now(),
        }))
        .into_response(),
        Err(err) => {
            warn!("dlq listing failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct RequeueRequest {
    job_id: String,
}

async fn requeue_failed_job(
    State(state): State<AppState>,
    axum::Json(request): axum::Json<RequeueRequest>,
) -> Response {
    match state.dlq.requeue(&request.job_id).await {
        Ok(Some(queue)) => axum::Json(json!({
            "status": "requeued",
            "original_queue": queue,
            "job_id": request.job_id,
        }))
        .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            axum::Json(json!({
                "error": format!("job {} not present in the current pull", request.job_id),
            })),
        )
            .into_response(),
        Err(err) => {
            warn!(job_id = %request.job_id, "dlq requeue failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let report = state.health.check().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, axum::Json(report)).into_response()
}
