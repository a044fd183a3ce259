//! HTTP and WebSocket API.
//!
//! Exposes job management, the live streaming WebSocket, the analytics
//! query surface, and CSV export. Configuration errors (missing job, wrong
//! source kind, malformed zones) are reported to the caller before any
//! pipeline starts.

use crate::analytics::AnalyticsStore;
use crate::batch::run_batch_job;
use crate::config::Config;
use crate::jobs::{JobRecord, JobStatus, JobStore, NewJob};
use crate::pipeline::{spawn_pipeline, FrameQueue};
use crate::session::{run_session, FrameSink, SinkError, WireMessage};
use crate::source::{SourceDescriptor, SourceFactory};
use crate::zones::{Zone, ZoneCounter};
use async_trait::async_trait;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Registry of cancellation tokens for running live sessions, so a stop
/// request can reach the session's pipeline.
#[derive(Clone, Default)]
pub struct LiveSessions {
    inner: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl LiveSessions {
    /// Register a session token, cancelling any previous session for the job.
    pub fn register(&self, job_id: Uuid, token: CancellationToken) {
        if let Some(previous) = self.inner.lock().insert(job_id, token) {
            previous.cancel();
        }
    }

    /// Cancel a running session. Returns false when none is registered.
    pub fn stop(&self, job_id: Uuid) -> bool {
        match self.inner.lock().remove(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, job_id: Uuid) {
        self.inner.lock().remove(&job_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Runtime knobs the handlers need from configuration.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub queue_capacity: usize,
    pub keepalive: Duration,
    pub track_grace_frames: u64,
    pub progress_interval: Duration,
}

impl From<&Config> for RuntimeSettings {
    fn from(config: &Config) -> Self {
        Self {
            queue_capacity: config.stream.queue_capacity,
            keepalive: config.keepalive(),
            track_grace_frames: config.counting.track_grace_frames,
            progress_interval: config.progress_interval(),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub jobs: JobStore,
    pub analytics: AnalyticsStore,
    pub sources: Arc<dyn SourceFactory>,
    pub live: LiveSessions,
    pub settings: RuntimeSettings,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.into(),
            code: "BAD_REQUEST".to_string(),
        }),
    )
}

fn not_found(message: impl Into<String>) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: message.into(),
            code: "NOT_FOUND".to_string(),
        }),
    )
}

fn internal(message: impl Into<String>) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: message.into(),
            code: "INTERNAL".to_string(),
        }),
    )
}

/// Job fields exposed over the API
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: String,
    pub name: String,
    pub source_type: String,
    pub target_class: Option<String>,
    pub confidence: f64,
    pub status: String,
    pub progress: i64,
    pub error: Option<String>,
    pub final_count: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl From<JobRecord> for JobResponse {
    fn from(job: JobRecord) -> Self {
        Self {
            id: job.id,
            name: job.name,
            source_type: job.source_type,
            target_class: job.target_class,
            confidence: job.confidence,
            status: job.status,
            progress: job.progress,
            error: job.error,
            final_count: job.final_count,
            created_at: job.created_at,
        }
    }
}

/// Create-job request body
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub name: String,
    pub source: String,
    pub source_type: String,
    #[serde(default)]
    pub target_class: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    pub zones: Vec<Zone>,
}

fn default_confidence() -> f64 {
    0.4
}

/// Heatmap query parameters
#[derive(Debug, Deserialize)]
pub struct HeatmapQuery {
    #[serde(default = "default_grid_size")]
    pub grid_size: u32,
}

fn default_grid_size() -> u32 {
    64
}

/// Progress response
#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    pub progress: i64,
    pub status: String,
}

/// Create the API router
pub fn create_router(state: AppState, config: &Config) -> Router {
    let cors = if config.api.cors_enabled {
        if config.api.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .api
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/ws/live/:job_id", get(live_stream))
        .route("/api/v1/jobs", post(create_job).get(list_jobs))
        .route("/api/v1/jobs/:job_id", get(get_job).delete(delete_job))
        .route("/api/v1/jobs/:job_id/process", post(start_processing))
        .route("/api/v1/jobs/:job_id/stop", post(stop_job))
        .route("/api/v1/jobs/:job_id/progress", get(job_progress))
        .route("/api/v1/jobs/:job_id/analytics/heatmap", get(heatmap))
        .route("/api/v1/jobs/:job_id/analytics/counts", get(class_counts))
        .route("/api/v1/jobs/:job_id/export/csv", get(export_csv))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "zonewatch"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").fetch_one(state.jobs.pool()).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Create a counting job
#[instrument(skip(state, request), fields(name = %request.name))]
async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<Json<JobResponse>, ApiError> {
    SourceDescriptor::from_job(&request.source_type, &request.source)
        .map_err(|e| bad_request(e.to_string()))?;

    // Validate polygons up front so processing never starts on bad zones
    ZoneCounter::new(request.zones.clone(), None, 0.0, 1)
        .map_err(|e| bad_request(e.to_string()))?;

    let job = state
        .jobs
        .create(NewJob {
            name: request.name,
            source: request.source,
            source_type: request.source_type,
            target_class: request.target_class,
            confidence: request.confidence,
            zones: request.zones,
        })
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to create job");
            internal("Failed to create job")
        })?;

    Ok(Json(job.into()))
}

/// List all jobs
async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<JobResponse>>, ApiError> {
    let jobs = state.jobs.list().await.map_err(|e| {
        error!(error = %e, "Failed to list jobs");
        internal("Failed to list jobs")
    })?;
    Ok(Json(jobs.into_iter().map(Into::into).collect()))
}

/// Get a single job
async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = fetch_job(&state, job_id).await?;
    Ok(Json(job.into()))
}

/// Delete a job
async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.live.stop(job_id);
    let deleted = state.jobs.delete(job_id).await.map_err(|e| {
        error!(error = %e, "Failed to delete job");
        internal("Failed to delete job")
    })?;
    if !deleted {
        return Err(not_found("Job not found"));
    }
    Ok(Json(serde_json::json!({"success": true})))
}

/// Start batch processing in the background
#[instrument(skip(state))]
async fn start_processing(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = fetch_job(&state, job_id).await?;

    let descriptor = SourceDescriptor::from_job(&job.source_type, &job.source)
        .map_err(|e| bad_request(e.to_string()))?;
    if descriptor.is_live() {
        return Err(bad_request("Not a batch job; connect to the live endpoint"));
    }

    let jobs = state.jobs.clone();
    let analytics = state.analytics.clone();
    let sources = state.sources.clone();
    let settings = state.settings.clone();
    tokio::spawn(async move {
        if let Err(e) = run_batch_job(
            jobs,
            analytics,
            sources,
            job,
            settings.track_grace_frames,
            settings.progress_interval,
        )
        .await
        {
            error!(job_id = %job_id, error = %e, "Batch job failed");
        }
    });

    Ok(Json(serde_json::json!({
        "status": "processing",
        "message": "Job started in background"
    })))
}

/// Stop a running live session
async fn stop_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stopped = state.live.stop(job_id);
    Ok(Json(serde_json::json!({"stopped": stopped})))
}

/// Progress polling endpoint
async fn job_progress(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<ProgressResponse>, ApiError> {
    let job = fetch_job(&state, job_id).await?;
    Ok(Json(ProgressResponse {
        progress: job.progress,
        status: job.status,
    }))
}

/// Heatmap aggregation query
async fn heatmap(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Query(params): Query<HeatmapQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if params.grid_size == 0 || params.grid_size > 512 {
        return Err(bad_request("grid_size must be between 1 and 512"));
    }
    fetch_job(&state, job_id).await?;

    let buckets = state
        .analytics
        .heatmap(job_id, params.grid_size)
        .await
        .map_err(|e| {
            error!(job_id = %job_id, error = %e, "Heatmap query failed");
            internal("Heatmap query failed")
        })?;
    Ok(Json(buckets))
}

/// Per-class totals query
async fn class_counts(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    fetch_job(&state, job_id).await?;

    let counts = state.analytics.class_counts(job_id).await.map_err(|e| {
        error!(job_id = %job_id, error = %e, "Class count query failed");
        internal("Class count query failed")
    })?;
    Ok(Json(counts))
}

/// CSV export of (timestamp, cumulative count) rows
async fn export_csv(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    fetch_job(&state, job_id).await?;

    let timeline = state.analytics.count_timeline(job_id).await.map_err(|e| {
        error!(job_id = %job_id, error = %e, "Timeline query failed");
        internal("Timeline query failed")
    })?;

    let body = render_csv(&timeline);
    let disposition = format!("attachment; filename=zonewatch_data_{job_id}.csv");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/csv")
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(body.into())
        .map_err(|e| internal(e.to_string()))
}

fn render_csv(timeline: &[crate::analytics::TimelinePoint]) -> String {
    let mut csv = String::from("Timestamp (s),Count\n");
    for point in timeline {
        csv.push_str(&format!("{},{}\n", point.timestamp, point.count));
    }
    csv
}

async fn fetch_job(state: &AppState, job_id: Uuid) -> Result<JobRecord, ApiError> {
    state
        .jobs
        .get(job_id)
        .await
        .map_err(|e| {
            error!(job_id = %job_id, error = %e, "Failed to load job");
            internal("Failed to load job")
        })?
        .ok_or_else(|| not_found("Job not found"))
}

/// WebSocket sink adapter for the streaming session
struct WebSocketSink {
    sender: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, message: WireMessage) -> Result<(), SinkError> {
        self.sender
            .send(Message::Text(message.to_json()))
            .await
            .map_err(|e| SinkError::Send(e.to_string()))
    }
}

/// WebSocket endpoint for live streaming
async fn live_stream(
    ws: WebSocketUpgrade,
    Path(job_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_live_socket(socket, job_id, state))
}

/// Serve one live session over a WebSocket.
///
/// Configuration errors terminate with a wire error before any pipeline
/// starts. Otherwise the blocking pipeline is spawned, the session loop
/// runs, and on any exit the token is cancelled and the pipeline awaited so
/// the capture resource is released exactly once.
async fn handle_live_socket(socket: WebSocket, job_id: Uuid, state: AppState) {
    let (sender, receiver) = socket.split();
    let mut sink = WebSocketSink { sender };

    let job = match state.jobs.get(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            let _ = sink.send(WireMessage::error("Job not found")).await;
            return;
        }
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Failed to load job");
            let _ = sink.send(WireMessage::error("Failed to load job")).await;
            return;
        }
    };

    let descriptor = match SourceDescriptor::from_job(&job.source_type, &job.source) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            let _ = sink.send(WireMessage::error(e.to_string())).await;
            return;
        }
    };
    if !descriptor.is_live() {
        let _ = sink
            .send(WireMessage::error("Not a live stream job"))
            .await;
        return;
    }

    let zones = match job.zone_list() {
        Ok(zones) => zones,
        Err(e) => {
            let _ = sink.send(WireMessage::error(e.to_string())).await;
            return;
        }
    };
    let counter = match ZoneCounter::new(
        zones,
        job.target_class.clone(),
        job.confidence,
        state.settings.track_grace_frames,
    ) {
        Ok(counter) => counter,
        Err(e) => {
            let _ = sink.send(WireMessage::error(e.to_string())).await;
            return;
        }
    };

    let source = match state.sources.open(&descriptor, &job.detector_options()) {
        Ok(source) => source,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Failed to open live source");
            let _ = sink.send(WireMessage::error(e.to_string())).await;
            return;
        }
    };

    if let Err(e) = state.jobs.set_status(job_id, JobStatus::Active).await {
        warn!(job_id = %job_id, error = %e, "Failed to mark job active");
    }

    let token = CancellationToken::new();
    state.live.register(job_id, token.clone());

    let queue = FrameQueue::new(state.settings.queue_capacity);
    let pipeline = spawn_pipeline(source, counter, queue.clone(), token.clone());

    // A client-initiated close cancels the session even while the send
    // side is idle waiting on the queue
    let watcher = tokio::spawn(watch_client(receiver, token.clone()));

    info!(job_id = %job_id, "Live session started");
    let end = run_session(queue, &mut sink, token.clone(), state.settings.keepalive).await;

    // run_session cancelled the token on exit; awaiting the pipeline here
    // guarantees the source was released before the handler returns
    let stats = match pipeline.await {
        Ok(stats) => stats,
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Pipeline task failed");
            Default::default()
        }
    };
    watcher.abort();

    state.live.remove(job_id);
    if let Err(e) = state.jobs.set_status(job_id, JobStatus::Stopped).await {
        warn!(job_id = %job_id, error = %e, "Failed to mark job stopped");
    }

    info!(
        job_id = %job_id,
        end = ?end,
        frames = stats.frames_processed,
        dropped = stats.frames_dropped,
        events = stats.events_emitted,
        "Live session closed"
    );
}

/// Drain client messages; cancel the session when the client goes away.
async fn watch_client(mut receiver: SplitStream<WebSocket>, token: CancellationToken) {
    while let Some(Ok(message)) = receiver.next().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
    }
    token.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::TimelinePoint;

    #[test]
    fn test_live_sessions_registry() {
        let sessions = LiveSessions::default();
        let job_id = Uuid::new_v4();
        let token = CancellationToken::new();

        sessions.register(job_id, token.clone());
        assert_eq!(sessions.len(), 1);

        assert!(sessions.stop(job_id));
        assert!(token.is_cancelled());
        assert!(sessions.is_empty());
        assert!(!sessions.stop(job_id));
    }

    #[test]
    fn test_register_cancels_previous_session() {
        let sessions = LiveSessions::default();
        let job_id = Uuid::new_v4();
        let first = CancellationToken::new();
        let second = CancellationToken::new();

        sessions.register(job_id, first.clone());
        sessions.register(job_id, second.clone());

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn test_csv_rendering() {
        let timeline = vec![
            TimelinePoint { timestamp: 1.1, count: 1 },
            TimelinePoint { timestamp: 2.5, count: 2 },
        ];
        assert_eq!(
            render_csv(&timeline),
            "Timestamp (s),Count\n1.1,1\n2.5,2\n"
        );
    }

    #[test]
    fn test_csv_rendering_empty() {
        assert_eq!(render_csv(&[]), "Timestamp (s),Count\n");
    }
}
