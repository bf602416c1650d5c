use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{
    error::status_for, DatasetId, ExecutorHandle, ExecutorStatus, FlowError, PartitionId,
    ReleaseDatasetResponse, ResourceReport, ShuffleDescriptor, StopResponse, TaskAssignment,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::state::{lock, AgentState};
use crate::supervisor;

pub fn build_router(state: AgentState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/executors", post(start_executor))
        .route("/api/v1/executors/:id", get(executor_status))
        .route("/api/v1/executors/:id/stop", post(stop_executor))
        .route("/api/v1/datasets/locations", post(report_location))
        .route("/api/v1/datasets/:flow/:dataset/:partition", get(lookup_location))
        .route("/api/v1/flows/:flow/cancel", post(cancel_flow))
        .route(
            "/api/v1/flows/:flow/datasets/:dataset/release",
            post(release_dataset),
        )
        .route("/api/v1/resources", get(resources))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct ApiError(pub FlowError);

impl From<FlowError> for ApiError {
    fn from(e: FlowError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = self.0.to_body();
        let status = StatusCode::from_u16(status_for(body.kind))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn start_executor(
    State(state): State<AgentState>,
    Json(assignment): Json<TaskAssignment>,
) -> Result<Json<ExecutorHandle>, ApiError> {
    Ok(Json(supervisor::start_executor(&state, assignment).await?))
}

async fn executor_status(
    State(state): State<AgentState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutorStatus>, ApiError> {
    Ok(Json(supervisor::executor_status(&state, &id)?))
}

async fn stop_executor(
    State(state): State<AgentState>,
    Path(id): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    Ok(Json(supervisor::stop_executor(&state, &id)?))
}

async fn report_location(
    State(state): State<AgentState>,
    Json(desc): Json<ShuffleDescriptor>,
) -> Json<Value> {
    debug!(
        "ubicación d{}-p{} (flow {}, intento {}) en {}",
        desc.dataset, desc.partition, desc.flow_id, desc.attempt, desc.data_addr
    );
    lock(&state.locations).report(desc);
    Json(json!({ "ok": true }))
}

async fn lookup_location(
    State(state): State<AgentState>,
    Path((flow, dataset, partition)): Path<(String, DatasetId, PartitionId)>,
) -> Result<Json<ShuffleDescriptor>, ApiError> {
    lock(&state.locations)
        .lookup(&flow, dataset, partition)
        .cloned()
        .map(Json)
        .ok_or_else(|| {
            ApiError(FlowError::NotFound(format!(
                "d{dataset}-p{partition} del flow {flow}"
            )))
        })
}

async fn cancel_flow(
    State(state): State<AgentState>,
    Path(flow): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let stopped = supervisor::cancel_flow(&state, &flow).await?;
    Ok(Json(json!({ "ok": true, "stopped": stopped })))
}

async fn release_dataset(
    State(state): State<AgentState>,
    Path((flow, dataset)): Path<(String, DatasetId)>,
) -> Result<Json<ReleaseDatasetResponse>, ApiError> {
    let removed = supervisor::release_dataset(&state, &flow, dataset).await?;
    Ok(Json(ReleaseDatasetResponse { removed }))
}

async fn resources(State(state): State<AgentState>) -> Json<ResourceReport> {
    Json(state.resource_report())
}
