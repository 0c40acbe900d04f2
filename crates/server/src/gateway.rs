use axum::{
    body::Bytes,
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use sha2::Sha256;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};
use zapdesk_core::config::GatewayConfig;
use zapdesk_core::error::CrmError;
use zapdesk_core::metrics::MetricsSnapshot;
use zapdesk_core::protocol::TransportEvent;
use zapdesk_core::types::TicketStatus;
use zapdesk_engine::tickets::TicketUpdate;
use zapdesk_engine::Engine;

const SIGNATURE_HEADER: &str = "x-bridge-signature";

#[derive(Debug, Clone, Copy)]
pub struct GatewayRuntimeConfig {
    pub ws_heartbeat_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for GatewayRuntimeConfig {
    fn default() -> Self {
        Self {
            ws_heartbeat_secs: 15,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Clone)]
struct AppState {
    engine: Engine,
    /// If set, agent endpoints require `Authorization: Bearer <token>`
    auth_token: Option<String>,
    bridge_secret: Option<String>,
    runtime: GatewayRuntimeConfig,
}

pub struct Gateway {
    engine: Engine,
    port: u16,
    /// Optional auth token. If None, gateway binds to 127.0.0.1 only.
    auth_token: Option<String>,
    bridge_secret: Option<String>,
    runtime: GatewayRuntimeConfig,
}

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Error body the agent UI understands: `{"error": "ERR_..."}`.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: String,
}

impl From<CrmError> for ApiError {
    fn from(err: CrmError) -> Self {
        Self {
            status: StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            code: err.code(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(crm) = err.downcast_ref::<CrmError>() {
            return crm.clone().into();
        }
        error!(error = %err, "Gateway request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "ERR_INTERNAL".to_string(),
        }
    }
}

impl From<StatusCode> for ApiError {
    fn from(status: StatusCode) -> Self {
        Self {
            status,
            code: status
                .canonical_reason()
                .unwrap_or("error")
                .to_ascii_uppercase()
                .replace(' ', "_"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.code }))).into_response()
    }
}

impl Gateway {
    /// If a token is configured the gateway binds to 0.0.0.0, otherwise to
    /// 127.0.0.1 (local-only).
    pub fn new(engine: Engine, config: &GatewayConfig, runtime: GatewayRuntimeConfig) -> Self {
        Self {
            engine,
            port: config.port,
            auth_token: config.auth_token.clone(),
            bridge_secret: config.bridge_secret.clone(),
            runtime,
        }
    }

    fn router(&self) -> Router {
        let state = AppState {
            engine: self.engine.clone(),
            auth_token: self.auth_token.clone(),
            bridge_secret: self.bridge_secret.clone(),
            runtime: self.runtime,
        };

        Router::new()
            .route("/health", get(health_check))
            .route("/api/monitor/metrics", get(get_metrics))
            .route("/api/channels", get(list_channels))
            .route("/api/channels/:id/events", post(bridge_events))
            .route("/api/tickets/:id", put(update_ticket))
            .route("/api/contacts", post(create_contact))
            .route("/ws/events", get(ws_events))
            .layer(DefaultBodyLimit::max(self.runtime.max_body_bytes))
            .with_state(state)
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let app = self.router();

        let addr = if self.auth_token.is_some() {
            SocketAddr::from(([0, 0, 0, 0], self.port))
        } else {
            warn!("No gateway auth token configured, binding to 127.0.0.1 only");
            SocketAddr::from(([127, 0, 0, 1], self.port))
        };
        if self.bridge_secret.is_none() {
            warn!("No bridge secret configured, bridge events are accepted unsigned");
        }

        info!("Gateway listening on {}", addr);

        let listener = TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Verify the Authorization header against the configured token.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected_token) = &state.auth_token else {
        return Ok(());
    };

    let provided_token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if provided_token == expected_token {
        Ok(())
    } else {
        warn!("Unauthorized gateway access attempt");
        Err(StatusCode::UNAUTHORIZED)
    }
}

/// `x-bridge-signature: sha256=<hex hmac of the raw body>`.
fn verify_bridge_signature(headers: &HeaderMap, body: &[u8], secret: &str) -> bool {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();

    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    type HmacSha256 = Hmac<Sha256>;
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(body);
    let expected_hex = mac
        .finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>();
    expected_hex == sig_hex.to_ascii_lowercase()
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn get_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MetricsSnapshot>, StatusCode> {
    check_auth(&state, &headers)?;
    Ok(Json(state.engine.metrics().snapshot()))
}

async fn list_channels(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    check_auth(&state, &headers)?;
    let channels = state.engine.sessions().channel_ids().await;
    Ok(Json(json!({ "channels": channels })))
}

/// Intake for the bridge sidecar: one `TransportEvent` per request.
async fn bridge_events(
    State(state): State<AppState>,
    Path(channel_id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if let Some(secret) = state.bridge_secret.as_deref() {
        if !verify_bridge_signature(&headers, &body, secret) {
            warn!(channel_id, "Rejected bridge event with bad signature");
            return Err(StatusCode::UNAUTHORIZED.into());
        }
    }

    let event: TransportEvent = serde_json::from_slice(&body).map_err(|e| {
        warn!(channel_id, error = %e, "Unparseable bridge event");
        ApiError::from(StatusCode::BAD_REQUEST)
    })?;
    let session = state.engine.session(channel_id).await?;
    let listeners = session.publish(event);
    if listeners == 0 {
        warn!(channel_id, "Bridge event arrived with no listener attached");
    }

    Ok(Json(json!({ "accepted": true, "listeners": listeners })))
}

/// Distinguishes an absent field from an explicit `null`.
fn nullable<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TicketUpdateRequest {
    status: Option<TicketStatus>,
    #[serde(default, deserialize_with = "nullable")]
    user_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "nullable")]
    queue_id: Option<Option<i64>>,
    chatbot: Option<bool>,
    queue_option_id: Option<i64>,
    use_integration: Option<bool>,
    #[serde(default, deserialize_with = "nullable")]
    integration_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "nullable")]
    prompt_id: Option<Option<i64>>,
    unread_messages: Option<i64>,
}

impl From<TicketUpdateRequest> for TicketUpdate {
    fn from(req: TicketUpdateRequest) -> Self {
        TicketUpdate {
            status: req.status,
            user_id: req.user_id,
            queue_id: req.queue_id,
            chatbot: req.chatbot,
            queue_option_id: req.queue_option_id,
            use_integration: req.use_integration,
            integration_id: req.integration_id,
            prompt_id: req.prompt_id,
            unread_messages: req.unread_messages,
        }
    }
}

async fn update_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<TicketUpdateRequest>,
) -> Result<Json<Value>, ApiError> {
    check_auth(&state, &headers)?;
    let outcome = state.engine.update_ticket(ticket_id, req.into()).await?;
    Ok(Json(json!({
        "ticket": outcome.ticket,
        "oldStatus": outcome.old_status,
        "oldUserId": outcome.old_user_id,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateContactRequest {
    name: String,
    number: String,
    /// Channel used to confirm the number is on WhatsApp.
    channel_id: Option<i64>,
    tenant_id: Option<i64>,
}

async fn create_contact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateContactRequest>,
) -> Result<Json<Value>, ApiError> {
    check_auth(&state, &headers)?;

    let tenant_id = match req.channel_id {
        Some(channel_id) => {
            let session = state.engine.session(channel_id).await?;
            state
                .engine
                .check_is_valid_contact(session.transport.as_ref(), &req.number)
                .await?;
            session.tenant_id
        }
        None => req.tenant_id.ok_or(StatusCode::BAD_REQUEST)?,
    };

    let contact = state
        .engine
        .create_contact(tenant_id, &req.name, &req.number)
        .await?;
    Ok(Json(json!({ "contact": contact })))
}

#[derive(Debug, Default, Deserialize)]
struct RoomsQuery {
    #[serde(default)]
    rooms: String,
}

fn parse_rooms(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}

async fn ws_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<RoomsQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    check_auth(&state, &headers)?;

    let rooms = parse_rooms(&query.rooms);
    let engine = state.engine.clone();
    let ws_heartbeat_secs = state.runtime.ws_heartbeat_secs.max(3);
    Ok(ws.on_upgrade(move |socket| handle_ws_events(socket, engine, rooms, ws_heartbeat_secs)))
}

async fn handle_ws_events(
    mut socket: WebSocket,
    engine: Engine,
    rooms: Vec<String>,
    ws_heartbeat_secs: u64,
) {
    let mut rx = engine.bus().subscribe();
    let mut ticker = interval(Duration::from_secs(ws_heartbeat_secs));

    let connected = json!({
        "type": "connected",
        "rooms": rooms,
    });
    if socket
        .send(WsMessage::Text(connected.to_string()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let heartbeat = json!({
                    "type": "heartbeat",
                    "metrics": engine.metrics().snapshot(),
                });
                if socket.send(WsMessage::Text(heartbeat.to_string())).await.is_err() {
                    break;
                }
            }
            event = rx.recv() => {
                let payload = match event {
                    Ok(notification) if notification.reaches(&rooms) => json!({
                        "type": "event",
                        "event": notification.event,
                        "payload": notification.payload,
                    }),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => json!({
                        "type": "lagged",
                        "skipped": skipped,
                    }),
                    Err(RecvError::Closed) => break,
                };
                if socket.send(WsMessage::Text(payload.to_string())).await.is_err() {
                    break;
                }
            }
        }
    }
}
