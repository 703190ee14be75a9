/// Dashboard surface: WebSocket fan-out of the full device snapshot plus
/// protocol status, and the /health collaborator endpoint on the same
/// listener.
///
/// One drift-free loop serialises the playoutStates frame once per tick
/// into a broadcast channel; every connection just forwards it. Client
/// messages are a tiny JSON protocol: getConfig is answered, everything
/// else is logged and dropped.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::AppState;
use crate::timer::DriftFreeTimer;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Bind and serve until cancelled.
pub async fn serve(state: AppState, cancel: CancellationToken) -> anyhow::Result<()> {
    let port = state.inner.config.settings.web_socket_port;
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "WebSocket server listening");
    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

/// Serialise one snapshot per tick into the shared broadcast channel.
pub async fn broadcast_loop(state: AppState, cancel: CancellationToken) {
    let period = Duration::from_millis(state.inner.config.settings.update_interval_ms.max(10));
    let timer = DriftFreeTimer::new(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {}
        }
        let frame = playout_states_frame(&state).await;
        // No receivers is fine; dashboards come and go.
        let _ = state.inner.broadcast_tx.send(frame);
    }
    debug!("broadcast loop stopped");
}

/// The playoutStates frame: all devices plus protocol output status.
pub async fn playout_states_frame(state: &AppState) -> String {
    let devices = state.snapshot().await;
    let protocols = state.inner.protocols.read().await.clone();
    json!({
        "type": "playoutStates",
        "timestamp": state.monotonic_ms(),
        "data": devices,
        "protocols": protocols,
    })
    .to_string()
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    info!("dashboard client connected");

    // Immediate snapshot so the page is never blank for a tick.
    let first = playout_states_frame(&state).await;
    if socket.send(Message::Text(first.into())).await.is_err() {
        return;
    }

    let mut rx = state.inner.broadcast_tx.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(frame) => {
                        if socket.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("dashboard client lagged by {n} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_client_message(&state, text.as_str()) {
                            if socket.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("dashboard socket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    info!("dashboard client disconnected");
}

/// The consumer-side message protocol. Returns an optional reply frame.
fn handle_client_message(state: &AppState, text: &str) -> Option<String> {
    let message: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("malformed dashboard message: {e}");
            return None;
        }
    };
    match message.get("type").and_then(Value::as_str) {
        Some("getConfig") => Some(
            json!({
                "type": "config",
                "data": {
                    "settings": state.inner.config.settings,
                    "servers": state.inner.config.servers,
                },
            })
            .to_string(),
        ),
        Some("updateSettings") => {
            // Reserved: the device list is static configuration.
            info!("updateSettings received and ignored");
            None
        }
        other => {
            debug!(message_type = ?other, "unhandled dashboard message");
            None
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let devices = state.snapshot().await;
    let connected = devices.iter().filter(|d| d.connected).count();
    let protocols = state.inner.protocols.read().await.clone();
    Json(json!({
        "status": "ok",
        "uptimeMs": state.monotonic_ms(),
        "devices": { "total": devices.len(), "connected": connected },
        "protocols": protocols,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn app_state() -> AppState {
        let config: Config = serde_json::from_str(
            r#"{
                "settings": {"defaultFramerate": 25, "webSocketPort": 9080},
                "servers": [
                    {"id": 1, "name": "DECK", "type": "hyperdeck", "ip": "10.0.0.1"}
                ]
            }"#,
        )
        .unwrap();
        let devices = config.resolve_devices().unwrap();
        AppState::new(config, devices)
    }

    #[tokio::test]
    async fn test_playout_states_frame_shape() {
        let state = app_state();
        let frame = playout_states_frame(&state).await;
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "playoutStates");
        assert!(value["timestamp"].is_u64());
        assert_eq!(value["data"].as_array().unwrap().len(), 1);
        assert_eq!(value["data"][0]["state"], "offline");
        assert_eq!(value["protocols"]["emberPlus"]["port"], 9000);
        assert_eq!(value["protocols"]["tslUmd"]["enabled"], false);
    }

    #[tokio::test]
    async fn test_get_config_reply() {
        let state = app_state();
        let reply = handle_client_message(&state, r#"{"type":"getConfig"}"#).unwrap();
        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["type"], "config");
        assert_eq!(value["data"]["settings"]["webSocketPort"], 9080);
        assert_eq!(value["data"]["servers"][0]["type"], "hyperdeck");
    }

    #[tokio::test]
    async fn test_update_settings_is_ignored() {
        let state = app_state();
        assert!(handle_client_message(&state, r#"{"type":"updateSettings","x":1}"#).is_none());
    }

    #[tokio::test]
    async fn test_malformed_json_is_ignored() {
        let state = app_state();
        assert!(handle_client_message(&state, "{not json").is_none());
        assert!(handle_client_message(&state, r#"{"no":"type"}"#).is_none());
    }
}
