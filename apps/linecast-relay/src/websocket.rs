use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::handlers::AppState;
use crate::protocol::{generate_connection_id, ClientMessage, Outbound, ServerMessage};
use crate::registry::AuthRequest;

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

/// One task per connection reads the socket; a second drains the
/// outbound queue into it. Everything the relay wants to tell this
/// client, including its own eviction, arrives through that queue.
async fn handle_socket(state: AppState, socket: WebSocket) {
    let connection_id = generate_connection_id();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    state.registry.admit(&connection_id, tx.clone());
    counter!("linecast_ws_connections_total", 1);
    debug!(%connection_id, "websocket accepted");

    let forward = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let close_after = outbound.closes_connection();
            match outbound.to_json() {
                Ok(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "dropping unserializable frame");
                    continue;
                }
            }
            if close_after {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                if !handle_text(&state, &connection_id, &tx, &text) {
                    break;
                }
            }
            Message::Close(_) => break,
            // Pings are answered by axum; binary frames are not part of
            // the protocol.
            _ => {}
        }
    }

    state.registry.on_disconnect(&connection_id);
    state.broadcaster.unsubscribe(&connection_id);
    let _ = state.quick_pair.remove_socket_from_session(&connection_id);
    drop(tx);
    let _ = forward.await;
    debug!(%connection_id, "websocket closed");
}

/// Returns false when the connection should stop reading.
fn handle_text(
    state: &AppState,
    connection_id: &str,
    tx: &mpsc::UnboundedSender<Outbound>,
    text: &str,
) -> bool {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Auth {
            token,
            device_id,
            channel_id,
        }) => {
            let request = AuthRequest {
                token,
                device_id,
                channel_id,
            };
            match state.registry.authenticate(connection_id, &request) {
                Ok(identity) => {
                    state
                        .broadcaster
                        .subscribe(connection_id, &identity.channel_id, tx.clone());
                    let _ = tx.send(Outbound::Control(ServerMessage::AuthSuccess {
                        connection_id: connection_id.to_string(),
                        device_id: identity.device_id,
                        channel_id: identity.channel_id.as_str().to_string(),
                    }));
                    true
                }
                Err(err) => {
                    counter!("linecast_ws_auth_failures_total", 1);
                    let _ = tx.send(Outbound::Control(ServerMessage::AuthError {
                        reason: err.reason_code().to_string(),
                    }));
                    false
                }
            }
        }
        Ok(ClientMessage::Ping) => {
            let _ = tx.send(Outbound::Control(ServerMessage::Pong));
            true
        }
        Err(err) => {
            debug!(%connection_id, error = %err, "unparseable client frame");
            let _ = tx.send(Outbound::Control(ServerMessage::Error {
                message: "unrecognized message".to_string(),
            }));
            true
        }
    }
}
