//! The websocket endpoint.
//!
//! First frame after open MUST be `AUTH`; the handshake has a deadline.
//! After that the task pumps two directions: inbound client frames are
//! dispatched (subscriptions, typing, read receipts, pings) and outbound
//! events drain from the connection's bounded queue in FIFO order.
//! Closing the socket cancels any in-flight write; registry cleanup runs
//! on every exit path.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use sonet_proto::events::{ClientFrame, HandshakeReply, WireEvent};

use crate::error::HubError;
use crate::hub::{InboundHandler, RealtimeHub};

/// Everything the endpoint needs, shared across connections.
#[derive(Clone)]
pub struct WsContext {
    pub hub: Arc<RealtimeHub>,
    pub handler: Arc<dyn InboundHandler>,
}

/// GET /ws upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<WsContext>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, ctx))
}

async fn handle_connection(socket: WebSocket, ctx: WsContext) {
    let (conn, mut outbound) = ctx.hub.open_connection();
    let connection_id = conn.connection_id.clone();
    let (mut tx, mut rx) = socket.split();

    // ── Handshake: AUTH within the timeout or the connection dies ────────
    let auth_result = tokio::time::timeout(ctx.hub.config.connection_timeout, rx.next()).await;
    let frame = match auth_result {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<ClientFrame>(&text).ok(),
        Ok(_) => None,
        Err(_) => {
            warn!(connection_id, "handshake timeout");
            ctx.hub.disconnect(&connection_id);
            return;
        }
    };

    let payload = match frame {
        Some(ClientFrame::Auth(payload)) => payload,
        _ => {
            let reply = HandshakeReply::Error { reason: "first frame must be AUTH".into() };
            let _ = send_json(&mut tx, &reply).await;
            ctx.hub.disconnect(&connection_id);
            return;
        }
    };

    match ctx
        .hub
        .authenticate(&connection_id, &payload.user_id, &payload.session_token, &payload.device_id)
        .await
    {
        Ok(()) => {
            if send_json(&mut tx, &HandshakeReply::AuthOk {}).await.is_err() {
                ctx.hub.disconnect(&connection_id);
                return;
            }
        }
        Err(e) => {
            let reply = HandshakeReply::Error { reason: e.to_string() };
            let _ = send_json(&mut tx, &reply).await;
            ctx.hub.disconnect(&connection_id);
            return;
        }
    }

    // ── Steady state ─────────────────────────────────────────────────────
    let mut ping = tokio::time::interval(ctx.hub.config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ping.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            // Outbound: one FIFO queue per connection keeps publish order.
            event = outbound.recv() => {
                match event {
                    Some(event) => {
                        // One retry on a transient write failure, then the
                        // connection is considered gone.
                        if send_event(&mut tx, &event).await.is_err()
                            && send_event(&mut tx, &event).await.is_err()
                        {
                            break;
                        }
                    }
                    // Queue closed: the hub disconnected us (slow consumer
                    // or ban); tell the socket and stop.
                    None => break,
                }
            }

            inbound = rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
                            // One malformed frame closes this connection,
                            // never the server.
                            warn!(connection_id, "malformed frame, closing");
                            break;
                        };
                        if !dispatch(&ctx, &connection_id, &payload.user_id, frame, &mut tx).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }

            _ = ping.tick() => {
                if tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    ctx.hub.disconnect(&connection_id);
    debug!(connection_id, "websocket task finished");
}

/// Handle one authenticated inbound frame. Returns false to close.
async fn dispatch(
    ctx: &WsContext,
    connection_id: &str,
    user_id: &str,
    frame: ClientFrame,
    tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
) -> bool {
    match frame {
        ClientFrame::Auth(_) => {
            // Re-auth on a live connection is a protocol violation.
            false
        }
        ClientFrame::SendMessage {
            chat_id,
            content,
            message_type,
            reply_to_message_id,
            thread_id,
        } => {
            // Message sends consume the connection's rate budget; control
            // frames do not. Repeat violators are banned and dropped.
            match ctx.hub.check_rate(connection_id) {
                Ok(()) => {
                    let status = ctx
                        .handler
                        .on_send_message(
                            user_id,
                            &chat_id,
                            &content,
                            message_type,
                            reply_to_message_id,
                            thread_id,
                        )
                        .await;
                    if !status.is_ok() {
                        let reply = HandshakeReply::Error { reason: status.message };
                        let _ = send_json(tx, &reply).await;
                    }
                    true
                }
                Err(HubError::Banned) => {
                    let reply = HandshakeReply::Error { reason: "banned".into() };
                    let _ = send_json(tx, &reply).await;
                    false
                }
                Err(e) => {
                    let reply = HandshakeReply::Error { reason: e.to_string() };
                    let _ = send_json(tx, &reply).await;
                    true
                }
            }
        }
        ClientFrame::Subscribe { chat_id } => {
            if let Err(e) = ctx.hub.subscribe(connection_id, &chat_id).await {
                let reply = HandshakeReply::Error { reason: e.to_string() };
                let _ = send_json(tx, &reply).await;
            }
            true
        }
        ClientFrame::Unsubscribe { chat_id } => {
            let _ = ctx.hub.unsubscribe(connection_id, &chat_id);
            true
        }
        ClientFrame::Typing { chat_id, is_typing, thread_id: _ } => {
            if let Err(e) = ctx.hub.set_typing(&chat_id, user_id, is_typing).await {
                debug!(connection_id, error = %e, "typing rejected");
            }
            true
        }
        ClientFrame::ReadReceipt { chat_id, message_id, device_id } => {
            ctx.handler
                .on_read_receipt(user_id, &chat_id, &message_id, &device_id)
                .await;
            true
        }
        ClientFrame::Ping => {
            let _ = send_json(tx, &serde_json::json!({ "type": "PONG" })).await;
            true
        }
    }
}

async fn send_event(
    tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &WireEvent,
) -> Result<(), axum::Error> {
    send_json(tx, event).await
}

async fn send_json<T: serde::Serialize>(
    tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    payload: &T,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(payload).unwrap_or_default();
    tx.send(Message::Text(json.into())).await.map_err(axum::Error::new)
}
