use crate::config::MgmtConfig;
use crate::daemon::MgmtDaemon;
use crate::friend_sm::FsmLogEntry;
use crate::op_ctx::{OpReply, OpRequest};
use crate::transport::{PeerRequest, PeerResponse};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use brickfs_volgen::{OptionLookup, VolumeInfo};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;

const AUTH_REALM: &str = r#"Bearer realm="brickfs-mgmt""#;

/// Peer as shown by `peer status`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerView {
    pub uuid: Option<String>,
    pub hostname: String,
    pub port: u16,
    pub state: String,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeBody {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachBody {
    pub host: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OptionCheck {
    pub key: String,
    pub exists: bool,
    /// Full key when `key` was a bare specifier, or a "did you mean" hint
    pub hint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OptionQuery {
    key: String,
}

#[derive(Debug, Deserialize)]
struct FsmLogQuery {
    peer: Option<String>,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

#[derive(Clone)]
pub struct AdminApi {
    daemon: Arc<MgmtDaemon>,
    config: Arc<MgmtConfig>,
}

impl AdminApi {
    pub fn new(daemon: Arc<MgmtDaemon>, config: Arc<MgmtConfig>) -> Self {
        Self { daemon, config }
    }

    pub fn router(self: Arc<Self>) -> Router {
        let protected = Router::new()
            .route("/api/v1/peers", get(peers_handler))
            .route("/api/v1/peers/probe", post(probe_handler))
            .route("/api/v1/peers/detach", post(detach_handler))
            .route("/api/v1/volumes", get(volumes_handler))
            .route("/api/v1/volumes/:name", get(volume_handler))
            .route("/api/v1/ops", post(op_handler))
            .route("/api/v1/options/check", get(option_check_handler))
            .route("/api/v1/fsm-log", get(fsm_log_handler))
            .layer(axum::middleware::from_fn_with_state(
                self.clone(),
                auth_middleware,
            ));

        // peers authenticate by uuid inside the request, not by token
        let public = Router::new()
            .route("/health", get(health_handler))
            .route(crate::http_transport::PEER_RPC_PATH, post(peer_rpc_handler));

        Router::new()
            .merge(protected)
            .merge(public)
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = self.config.bind_addr;
        let router = Arc::new(self).router();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Management API listening on {}", addr);

        axum::serve(listener, router.into_make_service()).await?;
        Ok(())
    }
}

async fn health_handler(State(state): State<Arc<AdminApi>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "uuid": state.daemon.state().uuid().to_string(),
        "hostname": state.daemon.state().local.hostname,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn peers_handler(State(state): State<Arc<AdminApi>>) -> Json<Vec<PeerView>> {
    let peers = state
        .daemon
        .state()
        .peers
        .list()
        .into_iter()
        .map(|p| PeerView {
            uuid: p.uuid.map(|u| u.to_string()),
            hostname: p.hostname,
            port: p.port,
            state: p.state.to_string(),
            connected: p.connected,
        })
        .collect();
    Json(peers)
}

async fn probe_handler(State(state): State<Arc<AdminApi>>, Json(body): Json<ProbeBody>) -> Json<OpReply> {
    let port = body.port.unwrap_or(state.config.port);
    Json(state.daemon.probe(&body.host, port).await)
}

async fn detach_handler(State(state): State<Arc<AdminApi>>, Json(body): Json<DetachBody>) -> Json<OpReply> {
    Json(state.daemon.detach(&body.host, body.force).await)
}

async fn volumes_handler(State(state): State<Arc<AdminApi>>) -> Json<Vec<VolumeInfo>> {
    Json(state.daemon.state().volumes())
}

async fn volume_handler(
    State(state): State<Arc<AdminApi>>,
    Path(name): Path<String>,
) -> Result<Json<VolumeInfo>, ApiError> {
    state
        .daemon
        .state()
        .volume(&name)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Volume {} does not exist", name)))
}

async fn op_handler(State(state): State<Arc<AdminApi>>, Json(request): Json<OpRequest>) -> Json<OpReply> {
    Json(state.daemon.submit(request).await)
}

async fn option_check_handler(
    State(state): State<Arc<AdminApi>>,
    Query(query): Query<OptionQuery>,
) -> Json<OptionCheck> {
    let check = match state.daemon.state().volgen.table().check_option_exists(&query.key) {
        OptionLookup::Exists(full) => OptionCheck {
            exists: true,
            hint: (full != query.key).then_some(full),
            key: query.key,
        },
        OptionLookup::Unknown(hint) => OptionCheck {
            exists: false,
            hint: hint.map(|h| h.to_string()),
            key: query.key,
        },
    };
    Json(check)
}

async fn fsm_log_handler(
    State(state): State<Arc<AdminApi>>,
    Query(query): Query<FsmLogQuery>,
) -> Result<Json<Vec<FsmLogEntry>>, ApiError> {
    state
        .daemon
        .fsm_log(query.peer.as_deref())
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::BAD_GATEWAY, e.to_string()))
}

async fn peer_rpc_handler(State(state): State<Arc<AdminApi>>, Json(request): Json<PeerRequest>) -> Json<PeerResponse> {
    Json(state.daemon.handle_peer_request(request).await)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, AUTH_REALM)],
        "Unauthorized",
    )
        .into_response()
}

async fn auth_middleware(
    State(state): State<Arc<AdminApi>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(token) = state.config.admin_token.as_deref() else {
        tracing::warn!("management API is running without authentication, set admin_token in config");
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(provided) if bool::from(provided.as_bytes().ct_eq(token.as_bytes())) => next.run(request).await,
        _ => unauthorized(),
    }
}
