//! WebSocket transport: one socket per connection, a writer task pumping
//! relay events out and a reader loop dispatching decoded frames in.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use lucid_core::ids::ConnectionId;
use lucid_core::state::ConnectionState;
use lucid_relay::Relay;

use crate::frames::ClientFrame;

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 6969,
            max_send_queue: 256,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub max_send_queue: usize,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle that keeps the listener
/// task alive.
pub async fn start(config: ServerConfig, relay: Arc<Relay>) -> Result<ServerHandle, std::io::Error> {
    let state = AppState {
        relay,
        max_send_queue: config.max_send_queue,
    };
    let router = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    info!(port = local_addr.port(), "server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade handler. The display name comes from the `name`
/// query param, falling back to the `displayname` cookie.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let display_name = params
        .get("name")
        .cloned()
        .or_else(|| name_from_cookie(&headers))
        .filter(|n| !n.trim().is_empty());
    ws.on_upgrade(move |socket| handle_socket(socket, state, display_name))
}

fn name_from_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        if key != "displayname" {
            return None;
        }
        urlencoding::decode(value).ok().map(|v| v.into_owned())
    })
}

/// Handle a new WebSocket connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, state: AppState, display_name: Option<String>) {
    let connection_id = ConnectionId::new();
    let anonymous = display_name.is_none();
    let (tx, mut rx) = mpsc::channel(state.max_send_queue);

    if let Err(e) = state
        .relay
        .registry
        .register(connection_id.clone(), display_name, tx)
    {
        warn!(connection_id = %connection_id, "connection refused: {e}");
        return;
    }
    let _ = state
        .relay
        .registry
        .transition(&connection_id, ConnectionState::Active);
    info!(connection_id = %connection_id, "client connected");

    let (mut sink, mut stream) = socket.split();

    // Writer: ends when the registry entry (the only sender) is dropped.
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(WsMessage::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    if anonymous {
        state.relay.registry.emit(
            &connection_id,
            "prompt_name",
            serde_json::json!({ "data": "please set a display name" }),
        );
    }

    while let Some(message) = stream.next().await {
        match message {
            Ok(WsMessage::Text(text)) => dispatch_frame(&state, &connection_id, &text),
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    info!(connection_id = %connection_id, "client disconnected");
    let relay = Arc::clone(&state.relay);
    tokio::spawn(async move {
        relay.coordinator.close_connection(&connection_id).await;
    });
    let _ = writer.await;
}

/// Decode one inbound frame and hand it to the relay.
fn dispatch_frame(state: &AppState, connection_id: &ConnectionId, raw: &str) {
    let frame: ClientFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(connection_id = %connection_id, "undecodable frame: {e}");
            state.relay.registry.emit(
                connection_id,
                "error",
                serde_json::json!({ "data": "unrecognized frame" }),
            );
            return;
        }
    };

    match frame {
        ClientFrame::Message { data } => {
            if let Err(e) = state.relay.router.route_message(connection_id, &data) {
                warn!(connection_id = %connection_id, "route failed: {e}");
                state.relay.registry.emit(
                    connection_id,
                    "error",
                    serde_json::json!({ "data": "message could not be delivered" }),
                );
            }
        }
        ClientFrame::Chat { data } => {
            let Some(meta) = state.relay.registry.meta(connection_id) else {
                return;
            };
            let filtered = state.relay.router.filter_text(&data);
            state.relay.registry.broadcast(
                "chat",
                serde_json::json!({
                    "from": meta.display_name,
                    "data": filtered,
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                }),
            );
        }
        ClientFrame::Triggers { data } => {
            state.relay.router.route_triggers(connection_id, data);
        }
        ClientFrame::Collar { data, target } => {
            let target_id = target
                .map(ConnectionId::from_raw)
                .unwrap_or_else(|| connection_id.clone());
            if !state.relay.registry.contains(&target_id) {
                state.relay.registry.emit(
                    connection_id,
                    "error",
                    serde_json::json!({ "data": "no such connection" }),
                );
                return;
            }
            state.relay.router.route_collar(&target_id, &data);
            let collar = state
                .relay
                .registry
                .meta(&target_id)
                .and_then(|m| m.collar);
            state
                .relay
                .registry
                .emit(&target_id, "collar", serde_json::json!({ "data": collar }));
        }
        ClientFrame::SetName { data } => {
            let name = data.trim().to_string();
            if name.is_empty() {
                state.relay.registry.emit(
                    connection_id,
                    "error",
                    serde_json::json!({ "data": "display name cannot be empty" }),
                );
                return;
            }
            state
                .relay
                .registry
                .update_display_name(connection_id, name.clone());
            state
                .relay
                .registry
                .emit(connection_id, "name_set", serde_json::json!({ "data": name }));
        }
    }
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "connections": state.relay.registry.len(),
        "workers": state.relay.supervisor.live_count(),
    }))
}
