#![forbid(unsafe_code)]

// Opaque call signal relay. The server validates size and routing only;
// SDP and ICE payloads pass through untouched and no per-call state is
// kept. Media never transits this process.

use crate::cache::Cache;
use crate::metrics::ServerMetrics;
use crate::registry::{ConnId, Registry};
use crate::signaling::protocol::{
    self, Envelope, ErrorCode, HangupPayload, MicStatePayload, Nack, SignalPayload,
    MAX_SIGNAL_BYTES, MIN_SIGNAL_BYTES,
};
use serde_json::{json, Map, Value};

pub fn is_call_event(event: &str) -> bool {
    matches!(
        event,
        "call.offer" | "call.answer" | "call.ice" | "call.hangup" | "call.reject" | "call.mic_state"
    )
}

struct RelayContext {
    room_id: String,
    from_user_id: String,
    from_user_name: String,
}

fn relay_context(registry: &Registry, conn: ConnId) -> Result<RelayContext, Nack> {
    let room_id = registry
        .room_of(conn)
        .ok_or_else(|| Nack::new(ErrorCode::NoActiveRoom, "join a room first"))?;
    let (from_user_id, from_user_name) = registry
        .user_of(conn)
        .ok_or_else(|| Nack::new(ErrorCode::ServerError, "connection gone"))?;
    Ok(RelayContext {
        room_id,
        from_user_id,
        from_user_name,
    })
}

/// Deliver an echoed call frame. With a target: every connection of that
/// user in the sender's room. Without: everyone else in the room.
fn relay(
    registry: &Registry,
    conn: ConnId,
    ctx: &RelayContext,
    event: &str,
    target_user_id: Option<&str>,
    mut payload: Map<String, Value>,
) -> Result<usize, Nack> {
    payload.insert("fromUserId".to_string(), json!(ctx.from_user_id));
    payload.insert("fromUserName".to_string(), json!(ctx.from_user_name));
    let frame = protocol::frame(event, Value::Object(payload));

    match target_user_id {
        Some(target) => {
            let conns = registry.user_conns_in_room(&ctx.room_id, target);
            if conns.is_empty() {
                return Err(Nack::new(
                    ErrorCode::TargetNotInRoom,
                    format!("{target} has no connection in this room"),
                ));
            }
            registry.send_to_conns(&conns, &frame);
            Ok(conns.len())
        }
        None => {
            registry.broadcast_to_room(&ctx.room_id, &frame, Some(conn));
            Ok(0)
        }
    }
}

/// Handle the five call.* relay events plus the unacked mic state flag.
pub async fn handle_call_event(
    cache: &Cache,
    registry: &Registry,
    metrics: &ServerMetrics,
    conn: ConnId,
    envelope: &Envelope,
) -> Result<Option<Value>, Nack> {
    let ctx = relay_context(registry, conn)?;
    let event = envelope.event.as_str();

    let meta = match event {
        "call.offer" | "call.answer" | "call.ice" => {
            let payload: SignalPayload = protocol::decode_payload(envelope)?;
            let size = payload.signal.to_string().len();
            if !(MIN_SIGNAL_BYTES..=MAX_SIGNAL_BYTES).contains(&size) {
                return Err(Nack::new(
                    ErrorCode::ValidationError,
                    format!("signal must be {MIN_SIGNAL_BYTES}..={MAX_SIGNAL_BYTES} bytes"),
                ));
            }
            let mut body = Map::new();
            body.insert("signal".to_string(), payload.signal);
            let delivered = relay(
                registry,
                conn,
                &ctx,
                event,
                payload.target_user_id.as_deref(),
                body,
            )?;
            Some(json!({ "delivered": delivered }))
        }
        "call.hangup" | "call.reject" => {
            let payload: HangupPayload = protocol::decode_payload(envelope)?;
            let mut body = Map::new();
            if let Some(reason) = &payload.reason {
                body.insert("reason".to_string(), json!(reason));
            }
            let delivered = relay(
                registry,
                conn,
                &ctx,
                event,
                payload.target_user_id.as_deref(),
                body,
            )?;
            Some(json!({ "delivered": delivered }))
        }
        "call.mic_state" => {
            let payload: MicStatePayload = protocol::decode_payload(envelope)?;
            let mut body = Map::new();
            body.insert("muted".to_string(), json!(payload.muted));
            relay(
                registry,
                conn,
                &ctx,
                event,
                payload.target_user_id.as_deref(),
                body,
            )?;
            // Fire and forget: no ack even with a requestId.
            None
        }
        _ => return Err(Nack::new(ErrorCode::UnknownEvent, format!("unknown event: {event}"))),
    };

    metrics.inc_call_relays();
    cache.incr_metric("call_relays").await;
    Ok(meta)
}
