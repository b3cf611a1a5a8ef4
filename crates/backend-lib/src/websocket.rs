// ==================
// crates/backend-lib/src/websocket.rs
// ==================
//! Per-connection WebSocket loop.
//!
//! Outbound events are queued on a bounded channel and written by a
//! dedicated task, so the read loop never waits on a slow socket. Inbound
//! text frames are parsed, rate limited, validated and handed to the relay;
//! any rejection is reported back on the same connection.
use crate::error::AppError;
use crate::relay::ConnectionContext;
use crate::validation;
use crate::AppState;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, StreamExt};
use metrics::{counter, gauge};
use okean_common::{ClientMessage, GroupName, ServerMessage, UserSummary};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// How long a closing connection may spend flushing queued events
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Drive one authenticated WebSocket until it closes
pub async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    user: UserSummary,
    initial_groups: Vec<GroupName>,
) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (server_tx, server_rx) =
        mpsc::channel::<ServerMessage>(state.settings.connection.outbound_buffer);
    let mut writer = spawn_writer(ws_tx, server_rx);

    let ctx = match state.relay.connect(user, server_tx, &initial_groups).await {
        Ok(ctx) => ctx,
        Err(err) => {
            warn!(error = %err, "connection rejected after upgrade");
            writer.abort();
            return;
        },
    };

    counter!(crate::metrics::WS_CONNECTION).increment(1);
    gauge!(crate::metrics::WS_ACTIVE).increment(1.0);

    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(connection_id = %ctx.connection_id, error = %err, "socket read failed");
                break;
            },
        };

        let reply = match frame {
            Message::Text(text) => process_text(&state, &ctx, text.as_str()).await,
            Message::Binary(_) => Some(ServerMessage::MalformedMessage {
                err_msg: "binary frames are not supported".to_string(),
            }),
            Message::Close(_) => break,
            // Pings are answered by axum
            Message::Ping(_) | Message::Pong(_) => None,
        };

        if let Some(reply) = reply {
            state.relay.send_to_connection(ctx.connection_id, reply);
        }
    }

    // Cleanup: runs to completion before the task ends
    state.relay.disconnect(&ctx).await;
    state.rate_limiter.forget(ctx.connection_id);

    gauge!(crate::metrics::WS_ACTIVE).decrement(1.0);

    // Unregistering closed the queue; let the writer flush what is left
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        debug!(connection_id = %ctx.connection_id, "writer did not drain in time");
        writer.abort();
    }
}

/// Serialize queued events onto `sink` until the queue closes or a write
/// fails. The sink is handed back when the task finishes.
fn spawn_writer<S>(mut sink: S, mut events: mpsc::Receiver<ServerMessage>) -> JoinHandle<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    error!(error = %err, "failed to serialize server message");
                    continue;
                },
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        sink
    })
}

/// A frame that names a call command but carries bad fields is a call
/// failure; anything else is malformed
fn undecodable(text: &str, err: serde_json::Error) -> ServerMessage {
    let call_command = serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .as_ref()
        .and_then(|value| value.get("msgType"))
        .and_then(|tag| tag.as_str())
        .is_some_and(ClientMessage::is_call_msg_type);
    if call_command {
        AppError::InvalidArgument(err.to_string()).into_client_event(true)
    } else {
        ServerMessage::MalformedMessage {
            err_msg: err.to_string(),
        }
    }
}

/// Handle one text frame, returning the event to report back, if any
pub async fn process_text(state: &AppState, ctx: &ConnectionContext, text: &str) -> Option<ServerMessage> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(err) => return Some(undecodable(text, err)),
    };
    let call_command = message.is_call_command();

    if let Err(err) = state.rate_limiter.check(ctx.connection_id) {
        counter!(crate::metrics::COMMANDS_REJECTED).increment(1);
        return Some(err.into_client_event(call_command));
    }

    if let Err(err) =
        validation::validate_client_message(&message, state.settings.connection.max_payload_bytes)
    {
        return Some(AppError::from(err).into_client_event(call_command));
    }

    let msg_type = message.msg_type();
    match state.relay.handle(ctx, message).await {
        Ok(()) => None,
        Err(err) => {
            match &err {
                AppError::Io(_) | AppError::Json(_) | AppError::Internal(_) => {
                    error!(connection_id = %ctx.connection_id, msg_type, error = %err, "command failed");
                },
                _ => debug!(connection_id = %ctx.connection_id, msg_type, error = %err, "command rejected"),
            }
            Some(err.into_client_event(call_command))
        },
    }
}
