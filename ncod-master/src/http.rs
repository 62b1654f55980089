/*!
Operator HTTP surface of the master

Read-only views of the registry plus the two device commands:
- `GET /health` (always open), `GET /system/health`
- `GET /nodes`, `GET /nodes/{id}`, `GET /placement`, `GET /placement/best`
- `POST /nodes/{id}/devices/{device_id}/connect` and `/disconnect`

Every route except `/health` requires an `x-api-key` header equal to
`NCOD_API_KEY`; without a configured key the API is closed.
*/

use crate::commands::{CommandIssuer, IssueError};
use crate::health::{HealthTracker, MasterHealth};
use crate::models::{Device, NodeRecord, NodeStatus};
use crate::placement::{least_loaded, rank_nodes, Placement};
use crate::registry::SharedRegistry;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ncod_protocol::{DeviceKey, EnvelopeSink, LoadReport, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::warn;

#[derive(Clone)]
pub struct AppState<S> {
    pub registry: SharedRegistry,
    pub health: HealthTracker,
    pub issuer: Arc<CommandIssuer<S>>,
    pub api_key: Option<String>,
}

#[derive(Serialize)]
struct NodeView {
    node_id: NodeId,
    hostname: String,
    address: String,
    port: u16,
    status: NodeStatus,
    metadata: HashMap<String, String>,
    version: Option<String>,
    last_seen: String,
    silent_for_seconds: i64,
    devices: Vec<Device>,
    load: Option<LoadReport>,
}

fn to_view(record: NodeRecord) -> NodeView {
    let node = record.node;
    let silent = (OffsetDateTime::now_utc() - node.last_seen).whole_seconds().max(0);
    NodeView {
        last_seen: node.last_seen.format(&Rfc3339).unwrap_or_default(),
        silent_for_seconds: silent,
        node_id: node.node_id,
        hostname: node.hostname,
        address: node.address,
        port: node.port,
        status: node.status,
        metadata: node.metadata,
        version: node.version,
        devices: record.devices,
        load: record.load,
    }
}

#[derive(Debug, Deserialize)]
struct ConnectRequest {
    user_id: String,
    #[serde(default)]
    password: Option<String>,
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

impl From<IssueError> for ApiError {
    fn from(e: IssueError) -> Self {
        let status = match &e {
            IssueError::UnknownNode(_) | IssueError::UnknownDevice { .. } => StatusCode::NOT_FOUND,
            IssueError::NodeNotOnline { .. } | IssueError::DeviceUnavailable { .. } => StatusCode::CONFLICT,
            IssueError::Send(_) => StatusCode::SERVICE_UNAVAILABLE,
            IssueError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

fn parse_target(id: &str, device_id: Option<&str>) -> Result<(NodeId, Option<DeviceKey>), ApiError> {
    let node_id = NodeId::parse(id).map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))?;
    let device_id = device_id
        .map(|raw| raw.parse::<DeviceKey>())
        .transpose()
        .map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok((node_id, device_id))
}

async fn require_api_key<S>(State(app): State<AppState<S>>, req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref() else {
        warn!("SECURITY: NCOD_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };
    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router<S: EnvelopeSink>(state: AppState<S>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health::<S>))
        .route("/nodes", get(get_nodes::<S>))
        .route("/nodes/{id}", get(get_node::<S>))
        .route("/placement", get(get_placement::<S>))
        .route("/placement/best", get(get_best_node::<S>))
        .route("/nodes/{id}/devices/{device_id}/connect", post(connect_device::<S>))
        .route("/nodes/{id}/devices/{device_id}/disconnect", post(disconnect_device::<S>))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key::<S>))
        .with_state(state)
}

// GET /system/health
async fn get_system_health<S>(State(app): State<AppState<S>>) -> Json<MasterHealth> {
    Json(app.health.get_health(&app.registry))
}

// GET /nodes
async fn get_nodes<S>(State(app): State<AppState<S>>) -> Json<Vec<NodeView>> {
    Json(app.registry.nodes().into_iter().map(to_view).collect())
}

// GET /nodes/{id}
async fn get_node<S>(State(app): State<AppState<S>>, Path(id): Path<String>) -> Result<Json<NodeView>, ApiError> {
    let (node_id, _) = parse_target(&id, None)?;
    let record = app
        .registry
        .node(&node_id)
        .ok_or_else(|| ApiError(StatusCode::NOT_FOUND, format!("node {node_id} is not registered")))?;
    Ok(Json(to_view(record)))
}

// GET /placement
async fn get_placement<S>(State(app): State<AppState<S>>) -> Json<Vec<Placement>> {
    Json(rank_nodes(&app.registry))
}

// GET /placement/best
async fn get_best_node<S>(State(app): State<AppState<S>>) -> Result<Json<Placement>, ApiError> {
    least_loaded(&app.registry)
        .map(Json)
        .ok_or_else(|| ApiError(StatusCode::NOT_FOUND, "no online node has reported its load".into()))
}

// POST /nodes/{id}/devices/{device_id}/connect
async fn connect_device<S: EnvelopeSink>(
    State(app): State<AppState<S>>,
    Path((id, device_id)): Path<(String, String)>,
    Json(request): Json<ConnectRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let (node_id, device_id) = parse_target(&id, Some(&device_id))?;
    let device_id = device_id.ok_or_else(|| ApiError(StatusCode::BAD_REQUEST, "missing device id".into()))?;
    let sent = app.issuer.connect(&node_id, &device_id, &request.user_id, request.password)?;
    Ok(accepted(sent.timestamp))
}

// POST /nodes/{id}/devices/{device_id}/disconnect
async fn disconnect_device<S: EnvelopeSink>(
    State(app): State<AppState<S>>,
    Path((id, device_id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let (node_id, device_id) = parse_target(&id, Some(&device_id))?;
    let device_id = device_id.ok_or_else(|| ApiError(StatusCode::BAD_REQUEST, "missing device id".into()))?;
    let sent = app.issuer.disconnect(&node_id, &device_id)?;
    Ok(accepted(sent.timestamp))
}

/// The outcome arrives later as a status_update
fn accepted(sent_at: chrono::DateTime<chrono::Utc>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "sent", "sent_at": sent_at })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DeviceDelta, NodeRegistry};
    use crate::session::tests::{available, node};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use ncod_devkit::{mock_transport, MockLink};
    use ncod_protocol::{MessageType, RegisterPayload, Transport};
    use std::time::Duration;
    use tower::ServiceExt;

    const KEY: &str = "test-api-key";

    fn app(api_key: Option<&str>) -> (Router, SharedRegistry, MockLink) {
        let (transport, link) = mock_transport();
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(15)));
        let registration = RegisterPayload {
            hostname: "bench-01".into(),
            address: "10.0.0.7".into(),
            port: 7575,
            metadata: Default::default(),
            version: "0.1.0".into(),
        };
        registry.upsert_node(&node(), &registration, OffsetDateTime::now_utc());
        registry.open_session(&node(), "t1", OffsetDateTime::now_utc()).unwrap();
        registry
            .apply_device_delta(&node(), DeviceDelta::snapshot(vec![available(1, 2)]))
            .unwrap();

        let state = AppState {
            registry: registry.clone(),
            health: HealthTracker::new(),
            issuer: Arc::new(CommandIssuer::new(registry.clone(), transport.sink())),
            api_key: api_key.map(str::to_string),
        };
        (build_router(state), registry, link)
    }

    fn get(uri: &str, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("x-api-key", KEY)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_open() {
        let (router, _, _) = app(None);
        let response = router.oneshot(get("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_key_required() {
        let (router, _, _) = app(Some(KEY));
        let response = router.clone().oneshot(get("/nodes", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = router.clone().oneshot(get("/nodes", Some("wrong"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // no configured key closes the API
        let (closed, _, _) = app(None);
        let response = closed.oneshot(get("/nodes", Some(KEY))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_node_views() {
        let (router, _, _) = app(Some(KEY));

        let nodes = json(router.clone().oneshot(get("/nodes", Some(KEY))).await.unwrap()).await;
        assert_eq!(nodes[0]["node_id"], "aa:bb:cc:dd:ee:01");
        assert_eq!(nodes[0]["status"], "Online");
        assert_eq!(nodes[0]["devices"][0]["device_id"], "1-2");

        let response = router.clone().oneshot(get("/nodes/AA-BB-CC-DD-EE-01", Some(KEY))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = router.clone().oneshot(get("/nodes/02:00:00:00:00:01", Some(KEY))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = router.oneshot(get("/nodes/not-a-mac", Some(KEY))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_system_health_counts() {
        let (router, _, _) = app(Some(KEY));
        let health = json(router.oneshot(get("/system/health", Some(KEY))).await.unwrap()).await;
        assert_eq!(health["nodes_tracked"], 1);
        assert_eq!(health["nodes_online"], 1);
        assert_eq!(health["devices_tracked"], 1);
    }

    #[tokio::test]
    async fn test_connect_command() {
        let (router, _, link) = app(Some(KEY));
        let uri = "/nodes/aa:bb:cc:dd:ee:01/devices/1-2/connect";

        let response = router
            .clone()
            .oneshot(post(uri, serde_json::json!({ "user_id": "u1" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let sent = link.sent_of(MessageType::ConnectDevice);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].device_id, Some(DeviceKey::port(1, 2)));
        assert_eq!(sent[0].user_id.as_deref(), Some("u1"));

        let response = router
            .clone()
            .oneshot(post(
                "/nodes/aa:bb:cc:dd:ee:01/devices/1-2/disconnect",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        // still Available until the node reports InUse
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = router
            .oneshot(post(
                "/nodes/aa:bb:cc:dd:ee:01/devices/7-7/connect",
                serde_json::json!({ "user_id": "u1" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(link.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_node_refuses_commands() {
        let (router, registry, link) = app(Some(KEY));
        registry.sweep_stale_nodes(OffsetDateTime::now_utc() + time::Duration::minutes(1));

        let response = router
            .oneshot(post(
                "/nodes/aa:bb:cc:dd:ee:01/devices/1-2/connect",
                serde_json::json!({ "user_id": "u1" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = json(response).await;
        assert!(body["error"].as_str().unwrap().contains("Offline"));
        assert!(link.sent().is_empty());
    }

    #[tokio::test]
    async fn test_placement_lists_loaded_nodes() {
        let (router, registry, _) = app(Some(KEY));
        let response = router.clone().oneshot(get("/placement/best", Some(KEY))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        registry
            .record_load(
                &node(),
                LoadReport {
                    cpu_percent: 10.0,
                    memory_percent: 20.0,
                    disk_percent: 30.0,
                    timestamp: chrono::Utc::now(),
                },
            )
            .unwrap();

        let ranked = json(router.clone().oneshot(get("/placement", Some(KEY))).await.unwrap()).await;
        assert_eq!(ranked.as_array().unwrap().len(), 1);
        assert_eq!(ranked[0]["hostname"], "bench-01");
        let best = json(router.oneshot(get("/placement/best", Some(KEY))).await.unwrap()).await;
        assert_eq!(best["node_id"], "aa:bb:cc:dd:ee:01");
    }
}
