use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use uuid::Uuid;

use tether_protocol::{ControlConfig, ControlError};

use crate::auth;
use crate::dispatch::{DispatchTarget, Dispatcher};
use crate::master::MasterRelay;
use crate::policy::PolicyEvaluator;
use crate::registry::AgentRegistry;
use crate::store::{Store, unix_now};
use crate::stream::{StreamBroker, StreamConnectRequest};
use crate::terminal::{TerminalBroker, TerminalConnectRequest};
use crate::tools::ToolCatalog;
use crate::transfer::{FileTransferManager, TransferRequest};
use crate::transport;

/// Shared application state. Every component is constructed in main and
/// wired here; nothing is a process global.
pub struct AppState {
    pub config: ControlConfig,
    pub store: Arc<dyn Store>,
    pub registry: Arc<AgentRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub streams: Arc<StreamBroker>,
    pub terminals: Arc<TerminalBroker>,
    pub transfers: Arc<FileTransferManager>,
    pub masters: Arc<MasterRelay>,
    pub policy: Arc<PolicyEvaluator>,
    pub catalog: Arc<ToolCatalog>,
    pub jwt_secret: String,
    pub started_at: std::time::Instant,
}

/// Middleware that adds security headers to every response.
async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );

    response
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/stream/connect", post(mint_stream_token))
        .route("/api/terminal/connect", post(mint_terminal_token))
        .route("/api/files/transfers", post(start_transfer))
        .route("/api/files/transfers/{id}", get(transfer_status))
        .route("/api/files/transfers/{id}", delete(cancel_transfer))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/{id}/relay", post(relay_to_agent))
        .route("/api/tools", get(list_fleet_tools))
        .route("/api/updates/versions", get(list_versions))
        .route("/api/health", get(health_check))
        .route("/api/health/detailed", get(health_check_detailed))
        .route("/metrics", get(metrics))
        .route("/ws/agent", get(agent_ws_upgrade))
        .route("/ws/stream", get(stream_ws_upgrade))
        .route("/ws/terminal", get(terminal_ws_upgrade))
        .layer(RequestBodyLimitLayer::new(65_536)) // 64KB max request body
        .layer(axum::middleware::from_fn(security_headers))
        .with_state(state)
}

/// Query parameters for WebSocket upgrades and header fallback.
#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Extract and validate a JWT from the Authorization header or the `token`
/// query parameter. The header wins when both are present.
fn extract_claims(
    headers: &HeaderMap,
    query: &WsQuery,
    jwt_secret: &str,
) -> Result<auth::Claims, (StatusCode, String)> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or(query.token.as_deref())
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "Missing token".to_string()))?;

    auth::validate_jwt(token, jwt_secret).map_err(|e| {
        tracing::warn!("Invalid JWT: {e}");
        (
            StatusCode::UNAUTHORIZED,
            "Invalid or expired token".to_string(),
        )
    })
}

/// Best-effort caller address for token records.
fn remote_address(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Map a broker error onto an HTTP response carrying the short error code.
fn error_response(err: &ControlError) -> axum::response::Response {
    let status = match err {
        ControlError::AuthFailed => StatusCode::UNAUTHORIZED,
        ControlError::NotAuthorized | ControlError::PolicyDenied(_) => StatusCode::FORBIDDEN,
        ControlError::NotConnected => StatusCode::NOT_FOUND,
        ControlError::LimitExceeded(_) => StatusCode::CONFLICT,
        ControlError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ControlError::ProtocolError(_) => StatusCode::BAD_REQUEST,
        ControlError::PeerError(_)
        | ControlError::AgentDisconnected
        | ControlError::ChecksumMismatch => StatusCode::BAD_GATEWAY,
        ControlError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.code() }))).into_response()
}

/// POST /api/stream/connect - mint a one-shot stream viewer token.
async fn mint_stream_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    Json(req): Json<StreamConnectRequest>,
) -> impl IntoResponse {
    let claims = match extract_claims(&headers, &query, &state.jwt_secret) {
        Ok(claims) => claims,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };

    match state
        .streams
        .mint_token(&claims, &req, remote_address(&headers))
        .await
    {
        Ok((token, expires_at)) => {
            Json(json!({ "token": token, "expiresAt": expires_at })).into_response()
        }
        Err(err) => error_response(&err),
    }
}

/// POST /api/terminal/connect - mint a one-shot terminal viewer token.
async fn mint_terminal_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    Json(req): Json<TerminalConnectRequest>,
) -> impl IntoResponse {
    let claims = match extract_claims(&headers, &query, &state.jwt_secret) {
        Ok(claims) => claims,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };

    match state
        .terminals
        .mint_token(&claims, &req, remote_address(&headers))
        .await
    {
        Ok((token, expires_at)) => {
            Json(json!({ "token": token, "expiresAt": expires_at })).into_response()
        }
        Err(err) => error_response(&err),
    }
}

/// POST /api/files/transfers - initiate an agent-to-agent transfer.
async fn start_transfer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    Json(req): Json<TransferRequest>,
) -> impl IntoResponse {
    let claims = match extract_claims(&headers, &query, &state.jwt_secret) {
        Ok(claims) => claims,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };

    match state.transfers.start(&claims, &req).await {
        Ok(record) => (StatusCode::ACCEPTED, Json(record)).into_response(),
        Err(err) => error_response(&err),
    }
}

/// GET /api/files/transfers/:id - transfer status.
async fn transfer_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let claims = match extract_claims(&headers, &query, &state.jwt_secret) {
        Ok(claims) => claims,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };

    match state.transfers.status(id, &claims).await {
        Some(record) => Json(record).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Transfer not found" })),
        )
            .into_response(),
    }
}

/// DELETE /api/files/transfers/:id - cancel a transfer.
async fn cancel_transfer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let claims = match extract_claims(&headers, &query, &state.jwt_secret) {
        Ok(claims) => claims,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };

    match state.transfers.cancel(id, &claims).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "cancelled": true }))).into_response(),
        Err(err) => error_response(&err),
    }
}

/// GET /api/agents - the caller's owner-scope agents with live state.
async fn list_agents(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let claims = match extract_claims(&headers, &query, &state.jwt_secret) {
        Ok(claims) => claims,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };

    let now = unix_now();
    let mut agents = Vec::new();
    for agent in state.store.agents_by_owner(claims.owner).await {
        let live = state.registry.connection_for_agent(agent.agent_id).await;
        let mut entry = json!({
            "agentId": agent.agent_id,
            "name": agent.peer_name(),
            "hostname": agent.hostname,
            "osType": agent.os_type,
            "arch": agent.arch,
            "agentVersion": agent.agent_version,
            "licenseState": agent.license_state,
            "hasDisplay": agent.has_display,
            "connected": live.is_some(),
            "lost": state.policy.is_lost(&agent, now),
            "lastSeenAt": agent.last_seen_at,
        });
        if let Some(conn) = live {
            // The live connection is fresher than the persisted row.
            entry["hasDisplay"] = json!(conn.has_display());
            entry["powerState"] = json!(conn.power_state());
            entry["screenLocked"] = json!(conn.is_screen_locked());
            entry["currentTask"] = json!(conn.current_task());
        }
        agents.push(entry);
    }
    Json(agents).into_response()
}

/// GET /api/tools - aggregated tool catalog across the caller's connected
/// agents, names prefixed per agent.
async fn list_fleet_tools(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let claims = match extract_claims(&headers, &query, &state.jwt_secret) {
        Ok(claims) => claims,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };

    let mut fleet = Vec::new();
    for agent in state.store.agents_by_owner(claims.owner).await {
        if state.registry.is_agent_connected(agent.agent_id).await {
            fleet.push(agent);
        }
    }
    let tools = state.catalog.tools_for_fleet(&fleet).await;
    Json(json!({ "tools": tools })).into_response()
}

#[derive(Deserialize)]
struct RelayBody {
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

/// POST /api/agents/:id/relay - HTTP entry to a scoped agent command,
/// the alternate path to the WebSocket relay_request.
async fn relay_to_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    Json(body): Json<RelayBody>,
) -> impl IntoResponse {
    let claims = match extract_claims(&headers, &query, &state.jwt_secret) {
        Ok(claims) => claims,
        Err((status, msg)) => return (status, Json(json!({ "error": msg }))).into_response(),
    };

    let Some(agent) = state.store.agent_by_id(id).await else {
        return error_response(&ControlError::NotConnected);
    };
    if agent.owner_id != claims.owner {
        return error_response(&ControlError::NotAuthorized);
    }
    let Some(conn) = state.registry.connection_for_agent(id).await else {
        return error_response(&ControlError::NotConnected);
    };

    let timeout = std::time::Duration::from_secs(state.config.command.relay_timeout_s);
    match state
        .dispatcher
        .dispatch_with_timeout(
            DispatchTarget::Agent(conn.connection_id),
            &body.method,
            body.params,
            Some(timeout),
        )
        .await
    {
        Ok(result) => Json(json!({ "result": result })).into_response(),
        Err(err) => error_response(&err),
    }
}

/// GET /api/updates/versions - published versions with per-platform builds.
async fn list_versions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    if let Err((status, msg)) = extract_claims(&headers, &query, &state.jwt_secret) {
        return (status, Json(json!({ "error": msg }))).into_response();
    }
    let mut versions = state.store.versions().await;
    versions.sort_by(|a, b| b.released_at.cmp(&a.released_at));
    Json(versions).into_response()
}

/// GET /api/health - minimal, unauthenticated, for load balancers.
async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /api/health/detailed - full health info (requires JWT).
async fn health_check_detailed(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    if let Err((status, msg)) = extract_claims(&headers, &query, &state.jwt_secret) {
        return (status, Json(json!({ "error": msg }))).into_response();
    }

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "connected_agents": state.registry.connection_count().await,
        "stream_sessions": state.streams.session_count().await,
        "terminal_sessions": state.terminals.session_count().await,
        "active_transfers": state.transfers.active_count().await,
        "master_sessions": state.masters.session_count().await,
    }))
    .into_response()
}

/// GET /metrics - Prometheus-compatible text endpoint (auth configurable).
async fn metrics(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    if state.config.server.metrics_require_auth
        && let Err((status, msg)) = extract_claims(&headers, &query, &state.jwt_secret)
    {
        return (status, msg).into_response();
    }

    let connected_agents = state.registry.connection_count().await;
    let stream_sessions = state.streams.session_count().await;
    let terminal_sessions = state.terminals.session_count().await;
    let master_sessions = state.masters.session_count().await;
    let active_transfers = state.transfers.active_count().await;
    let uptime_secs = state.started_at.elapsed().as_secs();
    let commands_sent = state.registry.commands_sent.load(Ordering::Relaxed);
    let commands_timed_out = state.registry.commands_timed_out.load(Ordering::Relaxed);
    let sleep_queue_drops = state.registry.sleep_queue_drops.load(Ordering::Relaxed);
    let frames_relayed = state.streams.frames_relayed.load(Ordering::Relaxed);
    let frames_dropped = state.streams.frames_dropped.load(Ordering::Relaxed);
    let bytes_relayed = state.streams.bytes_relayed.load(Ordering::Relaxed);
    let relays_executed = state.masters.relays_executed.load(Ordering::Relaxed);
    let relays_denied = state.masters.relays_denied.load(Ordering::Relaxed);
    let transfers_completed = state.transfers.transfers_completed.load(Ordering::Relaxed);
    let transfers_failed = state.transfers.transfers_failed.load(Ordering::Relaxed);

    let body = format!(
        "# HELP tether_connected_agents Live agent connections\n\
         # TYPE tether_connected_agents gauge\n\
         tether_connected_agents {connected_agents}\n\
         # HELP tether_stream_sessions Live stream sessions\n\
         # TYPE tether_stream_sessions gauge\n\
         tether_stream_sessions {stream_sessions}\n\
         # HELP tether_terminal_sessions Live terminal sessions\n\
         # TYPE tether_terminal_sessions gauge\n\
         tether_terminal_sessions {terminal_sessions}\n\
         # HELP tether_master_sessions Registered master sessions\n\
         # TYPE tether_master_sessions gauge\n\
         tether_master_sessions {master_sessions}\n\
         # HELP tether_active_transfers File transfers in flight\n\
         # TYPE tether_active_transfers gauge\n\
         tether_active_transfers {active_transfers}\n\
         # HELP tether_uptime_seconds Server uptime in seconds\n\
         # TYPE tether_uptime_seconds gauge\n\
         tether_uptime_seconds {uptime_secs}\n\
         # HELP tether_commands_sent_total Correlated commands issued to agents\n\
         # TYPE tether_commands_sent_total counter\n\
         tether_commands_sent_total {commands_sent}\n\
         # HELP tether_commands_timed_out_total Commands that hit their deadline\n\
         # TYPE tether_commands_timed_out_total counter\n\
         tether_commands_timed_out_total {commands_timed_out}\n\
         # HELP tether_sleep_queue_drops_total Commands evicted from full sleep queues\n\
         # TYPE tether_sleep_queue_drops_total counter\n\
         tether_sleep_queue_drops_total {sleep_queue_drops}\n\
         # HELP tether_stream_frames_relayed_total Frames relayed to viewers\n\
         # TYPE tether_stream_frames_relayed_total counter\n\
         tether_stream_frames_relayed_total {frames_relayed}\n\
         # HELP tether_stream_frames_dropped_total Frames dropped to lagging viewers\n\
         # TYPE tether_stream_frames_dropped_total counter\n\
         tether_stream_frames_dropped_total {frames_dropped}\n\
         # HELP tether_stream_bytes_relayed_total Frame bytes relayed to viewers\n\
         # TYPE tether_stream_bytes_relayed_total counter\n\
         tether_stream_bytes_relayed_total {bytes_relayed}\n\
         # HELP tether_relays_executed_total Master relays executed\n\
         # TYPE tether_relays_executed_total counter\n\
         tether_relays_executed_total {relays_executed}\n\
         # HELP tether_relays_denied_total Master relays denied\n\
         # TYPE tether_relays_denied_total counter\n\
         tether_relays_denied_total {relays_denied}\n\
         # HELP tether_transfers_completed_total File transfers completed\n\
         # TYPE tether_transfers_completed_total counter\n\
         tether_transfers_completed_total {transfers_completed}\n\
         # HELP tether_transfers_failed_total File transfers failed\n\
         # TYPE tether_transfers_failed_total counter\n\
         tether_transfers_failed_total {transfers_failed}\n"
    );

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
        .into_response()
}

/// GET /ws/agent - WebSocket upgrade for agents. Agents authenticate by
/// registering, not by JWT; an unregistered socket can do nothing but
/// register or be closed.
async fn agent_ws_upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let remote = remote_address(&headers);
    ws.on_upgrade(move |socket| transport::handle_agent_socket(socket, remote, state))
}

/// GET /ws/stream - WebSocket upgrade for stream viewers. The one-shot
/// token arrives as the first message.
async fn stream_ws_upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let remote = remote_address(&headers);
    let streams = Arc::clone(&state.streams);
    ws.on_upgrade(move |socket| streams.handle_viewer_socket(socket, remote))
}

/// GET /ws/terminal - WebSocket upgrade for terminal viewers.
async fn terminal_ws_upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let remote = remote_address(&headers);
    let terminals = Arc::clone(&state.terminals);
    ws.on_upgrade(move |socket| terminals.handle_viewer_socket(socket, remote))
}
