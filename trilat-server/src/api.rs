//! HTTP surface of the coordination service
//!
//! ## Endpoints
//!
//! - `WS /ws` - anchor sessions
//! - `GET /visualization` - anchor and target positions for the 3D viewer
//! - `POST /set-node-position` - place an anchor
//! - `POST /calibrate` - set an anchor's path-loss calibration
//! - `GET /status` - anchor roster, liveness and the last fix
//!
//! Every route is CORS-open.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use trilat_core::{AnchorId, Calibration, Position, Target, TARGET_ID};

use crate::error::ApiError;
use crate::service::Coordinator;
use crate::ws;

type ApiResult<T> = Result<T, ApiError>;

/// Build the router with every endpoint
pub fn create_router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/visualization", get(visualization))
        .route("/set-node-position", post(set_node_position))
        .route("/calibrate", post(calibrate))
        .route("/status", get(status))
        .layer(CorsLayer::permissive())
        .with_state(coordinator)
}

/// Serve the router on an already bound listener until the process exits
pub async fn serve(listener: TcpListener, coordinator: Arc<Coordinator>) -> std::io::Result<()> {
    serve_with_shutdown(listener, coordinator, std::future::pending()).await
}

/// Serve until `shutdown` resolves, then close every anchor connection
///
/// Peer addresses are exposed to the WebSocket handler for fallback
/// identities.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(coordinator.clone());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        coordinator.shutdown();
    })
    .await
}

// ============================================================================
// DTOs
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct VisualizationResponse {
    pub nodes: BTreeMap<AnchorId, Position>,
    pub clients: BTreeMap<String, Position>,
}

#[derive(Debug, Deserialize)]
pub struct SetNodePositionRequest {
    pub node_id: AnchorId,
    pub position: Position,
}

#[derive(Debug, Deserialize)]
pub struct CalibrateRequest {
    pub node_id: AnchorId,
    pub rssi_at_1m: f64,
    pub path_loss: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub status: String,
}

impl OkResponse {
    fn ok() -> Json<Self> {
        Json(Self {
            status: "ok".to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct NodeStatus {
    pub id: AnchorId,
    pub mac: String,
    pub connected: bool,
    pub position: Position,
    /// Calibration in effect, the default pair when none was set
    pub calibration: Calibration,
    pub last_rssi: Option<f64>,
    pub last_distance: Option<f64>,
    pub eligible: bool,
    /// Fallback identity left behind by a re-keyed connection
    pub retired: bool,
    pub last_seen_secs: i64,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub total: usize,
    pub connected: usize,
    pub nodes: Vec<NodeStatus>,
    pub target: Target,
}

// ============================================================================
// Handlers
// ============================================================================

async fn visualization(State(coordinator): State<Arc<Coordinator>>) -> Json<VisualizationResponse> {
    let snapshot = coordinator.snapshot();

    let nodes = snapshot
        .anchors
        .into_iter()
        .filter(|a| !a.retired)
        .map(|a| (a.id, a.position))
        .collect();
    let mut clients = BTreeMap::new();
    clients.insert(TARGET_ID.to_string(), snapshot.target.position);

    Json(VisualizationResponse { nodes, clients })
}

async fn set_node_position(
    State(coordinator): State<Arc<Coordinator>>,
    payload: Result<Json<SetNodePositionRequest>, JsonRejection>,
) -> ApiResult<Json<OkResponse>> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    if !request.position.is_finite() {
        return Err(ApiError::BadRequest(
            "position coordinates must be finite".to_string(),
        ));
    }

    coordinator.set_anchor_position(&request.node_id, request.position)?;
    Ok(OkResponse::ok())
}

async fn calibrate(
    State(coordinator): State<Arc<Coordinator>>,
    payload: Result<Json<CalibrateRequest>, JsonRejection>,
) -> ApiResult<Json<OkResponse>> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let calibration = Calibration::new(request.rssi_at_1m, request.path_loss);
    if !calibration.is_valid() {
        return Err(ApiError::BadRequest(
            "rssi_at_1m must be finite and path_loss positive".to_string(),
        ));
    }

    coordinator.set_anchor_calibration(&request.node_id, calibration)?;
    Ok(OkResponse::ok())
}

async fn status(State(coordinator): State<Arc<Coordinator>>) -> Json<StatusResponse> {
    let snapshot = coordinator.snapshot();
    let now = snapshot.taken_at;
    let max_age = coordinator.config().max_measurement_age;
    let default_calibration = coordinator.registry().default_calibration();
    let connected = snapshot.connected_count();

    let nodes: Vec<NodeStatus> = snapshot
        .anchors
        .into_iter()
        .map(|a| NodeStatus {
            connected: a.connection.is_some(),
            calibration: a.calibration.unwrap_or(default_calibration),
            eligible: a.is_eligible(now, max_age),
            retired: a.retired,
            last_seen_secs: now.signed_duration_since(a.last_seen).num_seconds(),
            position: a.position,
            last_rssi: a.last_rssi,
            last_distance: a.last_distance,
            mac: a.hardware_id,
            id: a.id,
        })
        .collect();

    Json(StatusResponse {
        total: nodes.len(),
        connected,
        nodes,
        target: snapshot.target,
    })
}
