//! UI broadcast channel (T3, spec.md §6): one `axum` WebSocket per UI
//! subscriber. Every subscriber gets an `init` snapshot immediately, then the
//! same fan-out of `UiEvent`s everyone else sees — best-effort, a lagging
//! subscriber just re-syncs off its next `init`.

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use serde::Serialize;

use crate::state::AppState;

/// The literal `init` payload shape (spec.md §6): built fresh from
/// `Storage`/`Facade` on every subscribe, with wire field names
/// (`traffic`, `pendingIntercepts`) distinct from the internal model types'
/// own naming.
#[derive(Debug, Serialize)]
struct InitMessage {
    kind: &'static str,
    traffic: Vec<tollbooth_core::model::Flow>,
    conversations: Vec<tollbooth_core::model::Conversation>,
    #[serde(rename = "interceptMode")]
    intercept_mode: tollbooth_core::intercept::InterceptMode,
    #[serde(rename = "rulesEnabled")]
    rules_enabled: bool,
    #[serde(rename = "pendingIntercepts")]
    pending_intercepts: Vec<tollbooth_core::model::PendingIntercept>,
    #[serde(rename = "pendingRefusals")]
    pending_refusals: Vec<tollbooth_core::model::PendingRefusal>,
}

pub async fn ui_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ui_socket(socket, state))
}

async fn handle_ui_socket(mut socket: WebSocket, state: AppState) {
    let init = InitMessage {
        kind: "init",
        traffic: state.storage.list_flows().await,
        conversations: state.storage.list_conversations().await,
        intercept_mode: state.storage.intercept_mode().await,
        rules_enabled: state.storage.rules_enabled().await,
        pending_intercepts: state.storage.list_pending_intercepts().await,
        pending_refusals: state.storage.list_pending_refusals().await,
    };
    let Ok(text) = serde_json::to_string(&init) else { return };
    if socket.send(WsMessage::Text(text)).await.is_err() {
        return;
    }

    let mut events = state.events.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                // The UI channel is output-only; a `Close` or socket error on
                // the read side is the only thing we care about here.
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => continue,
                }
            }
        }
    }
}
