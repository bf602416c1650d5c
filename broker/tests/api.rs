use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use broker::{handlers::build_router, AppState};
use common::{
    AgentInfo, AgentRegisterRequest, AgentRegisterResponse, AllocationResponse, BrokerConfig,
    ErrorBody, ErrorKind, Resource, ResourceReport,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use tower::ServiceExt;

fn app() -> Router {
    build_router(AppState::new(BrokerConfig::default()))
}

async fn call(app: &Router, method: &str, uri: &str, body: serde_json::Value) -> (StatusCode, Vec<u8>) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

fn parse<T: DeserializeOwned>(bytes: &[u8]) -> T {
    serde_json::from_slice(bytes).unwrap()
}

async fn register(app: &Router, addr: &str, slots: u32) -> String {
    let req = AgentRegisterRequest {
        address: addr.to_string(),
        data_addr: "127.0.0.1:1".to_string(),
        hostname: "test".to_string(),
        resource: ResourceReport::idle(Resource::new(slots, 512, 0)),
    };
    let (status, body) = call(app, "POST", "/api/v1/agents/register", serde_json::to_value(req).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    parse::<AgentRegisterResponse>(&body).agent_id
}

#[tokio::test]
async fn health_responde_ok() {
    let (status, body) = call(&app(), "GET", "/health", json!(null)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}

#[tokio::test]
async fn registro_listado_y_asignacion() {
    let app = app();
    let a = register(&app, "http://a:1", 2).await;

    let (status, body) = call(&app, "GET", "/api/v1/agents", json!(null)).await;
    assert_eq!(status, StatusCode::OK);
    let agents: Vec<AgentInfo> = parse(&body);
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].agent_id, a);

    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/allocations",
        json!({ "resource": { "slots": 1, "memory_mb": 128, "disk_mb": 0 }, "count": 3 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let resp: AllocationResponse = parse(&body);
    // flota con capacidad para 2: asignación parcial
    assert_eq!(resp.allocations.len(), 2);

    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/allocations",
        json!({ "resource": { "slots": 1, "memory_mb": 128, "disk_mb": 0 }, "count": 1 }),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(parse::<ErrorBody>(&body).kind, ErrorKind::ResourceUnavailable);

    let (status, _) = call(
        &app,
        "POST",
        "/api/v1/allocations/release",
        json!({ "agent_id": a, "resource": { "slots": 1, "memory_mb": 128, "disk_mb": 0 } }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call(&app, "GET", &format!("/api/v1/agents/{a}"), json!(null)).await;
    assert_eq!(parse::<AgentInfo>(&body).free.slots, 1);
}

#[tokio::test]
async fn heartbeat_de_agente_desconocido_es_404() {
    let (status, body) = call(
        &app(),
        "POST",
        "/api/v1/agents/heartbeat",
        serde_json::to_value(common::HeartbeatRequest {
            agent_id: "fantasma".to_string(),
            resource: ResourceReport::idle(Resource::new(1, 1, 0)),
        })
        .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(parse::<ErrorBody>(&body).kind, ErrorKind::UnknownAgent);
}
