use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{
    error::status_for, AgentInfo, AgentRegisterRequest, AgentRegisterResponse,
    AllocationRequest, AllocationResponse, FlowError, HeartbeatRequest, HeartbeatResponse,
    ReleaseRequest, ReleaseResponse,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/agents", get(list_agents))
        .route("/api/v1/agents/register", post(register_agent))
        .route("/api/v1/agents/heartbeat", post(agent_heartbeat))
        .route("/api/v1/agents/:id", get(get_agent))
        .route("/api/v1/allocations", post(request_allocation))
        .route("/api/v1/allocations/release", post(release_allocation))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error HTTP: status según la clase de error, cuerpo `ErrorBody`.
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

async fn register_agent(
    State(state): State<AppState>,
    Json(req): Json<AgentRegisterRequest>,
) -> Json<AgentRegisterResponse> {
    Json(state.registry.register(req, state.config.heartbeat_interval))
}

async fn agent_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    state.registry.heartbeat(&req)?;
    debug!("heartbeat de {}", req.agent_id);
    Ok(Json(HeartbeatResponse { ok: true }))
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentInfo>> {
    Json(state.registry.list())
}

async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AgentInfo>, ApiError> {
    Ok(Json(state.registry.get(&id)?))
}

// Reserva `count` unidades; una asignación parcial es éxito, cero es 503
async fn request_allocation(
    State(state): State<AppState>,
    Json(req): Json<AllocationRequest>,
) -> Result<Json<AllocationResponse>, ApiError> {
    let resp = state.registry.allocate(&req)?;
    info!(
        "asignadas {}/{} unidades de {}",
        resp.allocations.len(),
        req.count,
        req.resource
    );
    Ok(Json(resp))
}

async fn release_allocation(
    State(state): State<AppState>,
    Json(req): Json<ReleaseRequest>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    state.registry.release(&req)?;
    debug!("liberado {} en {}", req.resource, req.agent_id);
    Ok(Json(ReleaseResponse { ok: true }))
}
