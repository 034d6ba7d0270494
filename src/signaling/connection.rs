#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{self, Envelope, ErrorCode, JoinPayload, Nack};
use super::{call, chat, RelayServer};
use crate::auth::ticket;
use crate::presence;
use crate::registry::{ConnId, OUTBOUND_BUFFER};
use crate::rooms::{self, JoinError};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{error, info, warn};

/// Idle timeout — close connection if no frame received within this duration.
/// Prevents Slowloris-style attacks that hold semaphore permits indefinitely.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    server: RelayServer,
    ticket_token: Option<String>,
    _permit: OwnedSemaphorePermit,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // The ticket was already burned out of the cache by the time the client
    // sees any close code, so a rejected handshake cannot be replayed.
    let claims = match ticket::consume(server.cache(), ticket_token.as_deref()).await {
        Ok(claims) => claims,
        Err(e) => {
            warn!("WebSocket handshake rejected: {}", e.message());
            let _ = ws_sender
                .send(Message::Close(Some(CloseFrame {
                    code: e.close_code(),
                    reason: e.message().into(),
                })))
                .await;
            return;
        }
    };

    server.metrics().inc_connections_total();
    let _conn_guard = server.metrics().connection_active_guard();

    // Bounded channel for sending frames to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(OUTBOUND_BUFFER);

    let send_metrics = server.metrics().clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_frames_sent();
            if ws_sender
                .send(Message::Text((*json).clone().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let conn = server
        .registry()
        .register(&claims.user_id, &claims.user_name, tx.clone());
    info!("conn {} open for user {}", conn, claims.user_id);
    presence::mark_online(server.cache(), &claims.user_id).await;
    server.cache().incr_metric("connections").await;

    server.registry().send_to_conn(
        conn,
        protocol::frame(
            "server.ready",
            json!({
                "connId": conn.to_string(),
                "userId": claims.user_id.as_str(),
                "userName": claims.user_name.as_str(),
                "serverTime": chrono::Utc::now().to_rfc3339(),
            }),
        ),
    );
    presence::send_global_snapshot(server.registry(), conn);

    // Token bucket rate limiter state
    let mut tokens_us: u64 = MAX_TOKENS_US;
    let mut last_refill = Instant::now();
    let mut rate_limit_warned = false;

    loop {
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for conn {conn}");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                server.metrics().inc_frames_received();

                // Token bucket rate limiting
                let now = Instant::now();
                let elapsed_us = now.duration_since(last_refill).as_micros() as u64;
                last_refill = now;
                tokens_us = (tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

                if tokens_us >= TOKEN_US {
                    tokens_us -= TOKEN_US;
                    rate_limit_warned = false;
                } else {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for conn {conn}");
                        server.registry().send_to_conn(
                            conn,
                            protocol::error_frame(&format!(
                                "Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} frames/second"
                            )),
                        );
                    }
                    continue;
                }

                let envelope = match protocol::parse_envelope(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        // Malformed, not merely unknown: the requestId (if
                        // any) is unreadable, so the reply is uncorrelated.
                        server.metrics().inc_nacks();
                        server
                            .registry()
                            .send_to_conn(conn, protocol::error_frame(e.message()));
                        continue;
                    }
                };

                let start = Instant::now();
                let result = dispatch(&server, conn, &envelope).await;
                server.metrics().observe_event_handling(start.elapsed());

                match result {
                    Ok(Some(meta)) => {
                        if let Some(request_id) = envelope.request_id.as_deref() {
                            server.metrics().inc_acks();
                            server.registry().send_to_conn(
                                conn,
                                protocol::ack_frame(request_id, &envelope.event, meta),
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(nack) => {
                        server.metrics().inc_nacks();
                        if matches!(nack.code, ErrorCode::ServerError) {
                            server.metrics().inc_errors();
                        }
                        server.registry().send_to_conn(
                            conn,
                            protocol::nack_frame(
                                envelope.request_id.as_deref(),
                                &envelope.event,
                                &nack,
                            ),
                        );
                    }
                }

                // If the channel is closed, the send task has exited
                if tx.is_closed() {
                    break;
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    // Registry state is detached synchronously; presence fan-out follows.
    if let Some(gone) = server.registry().unregister(conn) {
        if let Some(room_id) = &gone.room_id {
            if server
                .registry()
                .user_conns_in_room(room_id, &gone.user_id)
                .is_empty()
            {
                presence::broadcast_left(
                    server.registry(),
                    room_id,
                    &gone.user_id,
                    &claims.user_name,
                );
            }
            presence::broadcast_room_presence(server.registry(), room_id);
            presence::broadcast_global_snapshot(server.registry());
        }
        if gone.last_for_user {
            presence::mark_offline(server.cache(), &gone.user_id).await;
        }
    }

    send_task.abort();
    info!("conn {conn} closed");
}

/// Route one parsed envelope to its handler. `Ok(Some(meta))` becomes an
/// ack when the envelope carried a requestId; `Ok(None)` means no reply.
async fn dispatch(
    server: &RelayServer,
    conn: ConnId,
    envelope: &Envelope,
) -> Result<Option<Value>, Nack> {
    match envelope.event.as_str() {
        "ping" => {
            server.registry().send_to_conn(
                conn,
                protocol::frame(
                    "pong",
                    json!({ "serverTime": chrono::Utc::now().to_rfc3339() }),
                ),
            );
            Ok(None)
        }
        "room.join" => handle_join(server, conn, envelope).await,
        "room.leave" => handle_leave(server, conn).await,
        "chat.send" => {
            chat::handle_chat_send(
                server.store(),
                server.cache(),
                server.registry(),
                server.metrics(),
                conn,
                envelope,
            )
            .await
        }
        event if call::is_call_event(event) => {
            call::handle_call_event(server.cache(), server.registry(), server.metrics(), conn, envelope)
                .await
        }
        other => Err(Nack::new(
            ErrorCode::UnknownEvent,
            format!("unknown event: {other}"),
        )),
    }
}

/// Presence fan-out after a user's connection leaves a room for any reason.
fn refresh_after_leave(server: &RelayServer, room_id: &str, user_id: &str, user_name: &str) {
    if server.registry().user_conns_in_room(room_id, user_id).is_empty() {
        presence::broadcast_left(server.registry(), room_id, user_id, user_name);
    }
    presence::broadcast_room_presence(server.registry(), room_id);
}

async fn handle_join(
    server: &RelayServer,
    conn: ConnId,
    envelope: &Envelope,
) -> Result<Option<Value>, Nack> {
    let payload: JoinPayload = protocol::decode_payload(envelope)?;
    let (user_id, user_name) = server
        .registry()
        .user_of(conn)
        .ok_or_else(|| Nack::new(ErrorCode::ServerError, "connection gone"))?;

    let room = rooms::can_join(server.store(), &payload.room, &user_id)
        .await
        .map_err(|e| match e {
            JoinError::RoomNotFound => Nack::new(ErrorCode::RoomNotFound, "no such room"),
            JoinError::Forbidden => Nack::new(ErrorCode::Forbidden, "membership required"),
            JoinError::Storage(err) => {
                error!("room lookup failed for {}: {err}", payload.room);
                Nack::new(ErrorCode::ServerError, "room lookup failed")
            }
        })?;

    // One active call surface per user: joining a voice-capable room ends
    // this user's other voice-capable sessions. Text joins never evict.
    if room.kind.voice_capable() {
        for (evicted, evicted_room) in server.registry().voice_conns_of_user(&user_id, conn) {
            if evicted_room == room.id {
                continue;
            }
            server.registry().detach_from_room(evicted);
            server.registry().send_to_conn(
                evicted,
                protocol::frame(
                    "room.left",
                    json!({ "roomId": evicted_room, "reason": "voice session superseded" }),
                ),
            );
            server.registry().send_to_conn(
                evicted,
                protocol::error_frame("voice session superseded by a newer call"),
            );
            refresh_after_leave(server, &evicted_room, &user_id, &user_name);
            server.metrics().inc_evictions();
            server.cache().incr_metric("evictions").await;
        }
    }

    let previous = server
        .registry()
        .attach_to_room(conn, &room.id, room.kind)
        .ok_or_else(|| Nack::new(ErrorCode::ServerError, "connection gone"))?;

    // Implicit leave of the previous room
    if let Some(prev) = previous {
        if prev != room.id {
            server.metrics().inc_leaves();
            refresh_after_leave(server, &prev, &user_id, &user_name);
        }
    }

    server.registry().send_to_conn(
        conn,
        protocol::frame(
            "room.joined",
            json!({
                "roomId": room.id,
                "slug": room.slug,
                "title": room.title,
                "kind": room.kind,
            }),
        ),
    );

    let newly_in_room = server.registry().user_conns_in_room(&room.id, &user_id).len() == 1;
    if newly_in_room {
        presence::broadcast_joined(server.registry(), &room.id, &user_id, &user_name);
    }
    presence::broadcast_room_presence(server.registry(), &room.id);
    presence::broadcast_global_snapshot(server.registry());

    server.metrics().inc_joins();
    server.cache().incr_metric("joins").await;

    Ok(Some(json!({ "roomId": room.id, "slug": room.slug, "kind": room.kind })))
}

async fn handle_leave(server: &RelayServer, conn: ConnId) -> Result<Option<Value>, Nack> {
    let (user_id, user_name) = server
        .registry()
        .user_of(conn)
        .ok_or_else(|| Nack::new(ErrorCode::ServerError, "connection gone"))?;
    let room_id = server
        .registry()
        .detach_from_room(conn)
        .ok_or_else(|| Nack::new(ErrorCode::NoActiveRoom, "not in a room"))?;

    server
        .registry()
        .send_to_conn(conn, protocol::frame("room.left", json!({ "roomId": room_id })));
    refresh_after_leave(server, &room_id, &user_id, &user_name);
    presence::broadcast_global_snapshot(server.registry());

    server.metrics().inc_leaves();
    server.cache().incr_metric("leaves").await;

    Ok(Some(json!({ "roomId": room_id })))
}
