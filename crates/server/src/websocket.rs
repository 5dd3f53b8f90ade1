//! WebSocket handling.
//!
//! One socket can stream output for any number of sessions. Inbound
//! messages are small control frames; outbound traffic is raw PTY
//! output fanned out from the supervisor's per-session broadcast.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flypad_protocol::{ClientMessage, ServerMessage};

use crate::state::AppState;

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!(
        component = "websocket",
        event = "ws.connected",
        "New WebSocket connection"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(256);

    // Forward outbound messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!(
                        component = "websocket",
                        event = "ws.serialize_failed",
                        error = %e,
                        "Failed to serialize message"
                    );
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send_failed",
                    "Send failed, client disconnected"
                );
                break;
            }
        }
    });

    // Per-session output pump tasks for this client
    let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(
                    component = "websocket",
                    event = "ws.recv_error",
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
        };

        let msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(e) => {
                let _ = outbound_tx
                    .send(ServerMessage::Error {
                        code: "parse_error".into(),
                        message: e.to_string(),
                        session_id: None,
                    })
                    .await;
                continue;
            }
        };

        handle_client_message(msg, &state, &outbound_tx, &mut subscriptions).await;
    }

    // Client disconnect cancels only this client's listeners.
    for (_, handle) in subscriptions.drain() {
        handle.abort();
    }
    send_task.abort();
    info!(
        component = "websocket",
        event = "ws.disconnected",
        "WebSocket connection closed"
    );
}

async fn handle_client_message(
    msg: ClientMessage,
    state: &Arc<AppState>,
    outbound_tx: &mpsc::Sender<ServerMessage>,
    subscriptions: &mut HashMap<String, JoinHandle<()>>,
) {
    match msg {
        ClientMessage::SubscribeSession { session_id } => {
            if subscriptions.contains_key(&session_id) {
                return;
            }
            let output_rx = match state.supervisor.subscribe_output(&session_id) {
                Ok(rx) => rx,
                Err(e) => {
                    let _ = outbound_tx
                        .send(ServerMessage::Error {
                            code: e.to_string(),
                            message: format!("cannot subscribe to {session_id}"),
                            session_id: Some(session_id),
                        })
                        .await;
                    return;
                }
            };
            let exit_rx = state.supervisor.subscribe_exit(&session_id).ok();

            let tx = outbound_tx.clone();
            let sid = session_id.clone();
            let handle = tokio::spawn(async move {
                let mut output_rx = output_rx;
                let mut exit_rx = exit_rx;
                loop {
                    tokio::select! {
                        chunk = output_rx.recv() => match chunk {
                            Ok(chunk) => {
                                let msg = ServerMessage::Output {
                                    session_id: sid.clone(),
                                    chunk: String::from_utf8_lossy(&chunk).into_owned(),
                                };
                                if tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        },
                        changed = async {
                            match exit_rx.as_mut() {
                                Some(rx) => rx.changed().await,
                                None => std::future::pending().await,
                            }
                        } => {
                            if changed.is_err() {
                                break;
                            }
                            let status = exit_rx.as_ref().and_then(|rx| *rx.borrow());
                            if let Some(status) = status {
                                let _ = tx
                                    .send(ServerMessage::SessionExit {
                                        session_id: sid.clone(),
                                        status,
                                    })
                                    .await;
                                break;
                            }
                        }
                    }
                }
            });
            subscriptions.insert(session_id, handle);
        }

        ClientMessage::UnsubscribeSession { session_id } => {
            if let Some(handle) = subscriptions.remove(&session_id) {
                handle.abort();
            }
        }

        ClientMessage::Input { session_id, data } => {
            if let Err(e) = state.supervisor.write(&session_id, &data).await {
                let _ = outbound_tx
                    .send(ServerMessage::Error {
                        code: e.to_string(),
                        message: "input failed".into(),
                        session_id: Some(session_id),
                    })
                    .await;
            } else {
                let _ = state.store.append_event(
                    &session_id,
                    "input",
                    &serde_json::json!({ "bytes": data.len(), "via": "ws" }),
                );
            }
        }

        ClientMessage::Resize {
            session_id,
            cols,
            rows,
        } => {
            let _ = state.supervisor.resize(&session_id, cols, rows);
        }

        ClientMessage::Interrupt { session_id } => {
            let _ = state.supervisor.interrupt(&session_id);
        }

        ClientMessage::Ping => {
            let _ = outbound_tx.send(ServerMessage::Pong).await;
        }
    }
}
