#![forbid(unsafe_code)]

// Chat delivery with at-least-once client retries made idempotent on the
// server. The dedup key is the client's idempotencyKey, falling back to
// requestId; the cached value is the exact chat.message payload that was
// broadcast, so a retry replays the original delivery to the sender.

use crate::cache::Cache;
use crate::db::Store;
use crate::metrics::ServerMetrics;
use crate::registry::{ConnId, Registry};
use crate::signaling::protocol::{
    self, ChatSendPayload, Envelope, ErrorCode, Nack, MAX_CHAT_BYTES,
};
use serde_json::{json, Value};
use tracing::error;

pub const IDEMPOTENCY_TTL_SECS: u64 = 120;

fn idempotency_cache_key(user_id: &str, key: &str) -> String {
    format!("ws:idempotency:{user_id}:{key}")
}

/// Handle `chat.send`. Returns ack metadata on success.
pub async fn handle_chat_send(
    store: &Store,
    cache: &Cache,
    registry: &Registry,
    metrics: &ServerMetrics,
    conn: ConnId,
    envelope: &Envelope,
) -> Result<Option<Value>, Nack> {
    let room_id = registry
        .room_of(conn)
        .ok_or_else(|| Nack::new(ErrorCode::NoActiveRoom, "join a room first"))?;
    let (user_id, user_name) = registry
        .user_of(conn)
        .ok_or_else(|| Nack::new(ErrorCode::ServerError, "connection gone"))?;

    let payload: ChatSendPayload = protocol::decode_payload(envelope)?;
    let text = payload.text.trim();
    if text.is_empty() {
        return Err(Nack::new(ErrorCode::ValidationError, "text must not be empty"));
    }
    if text.len() > MAX_CHAT_BYTES {
        return Err(Nack::new(
            ErrorCode::ValidationError,
            format!("text exceeds {MAX_CHAT_BYTES} bytes"),
        ));
    }

    let dedup_key = envelope
        .idempotency_key
        .as_deref()
        .or(envelope.request_id.as_deref());

    if let Some(key) = dedup_key {
        let cache_key = idempotency_cache_key(&user_id, key);
        match cache.get(&cache_key).await {
            Ok(Some(cached)) => {
                // Replay to the sender only. No writes, no broadcast.
                if let Ok(payload) = serde_json::from_str::<Value>(&cached) {
                    registry.send_to_conn(conn, protocol::frame("chat.message", payload));
                }
                metrics.inc_chat_duplicates();
                cache.incr_metric("chat_duplicates").await;
                return Ok(Some(json!({ "duplicate": true, "idempotencyKey": key })));
            }
            Ok(None) => {}
            Err(e) => {
                // Degraded dedup is better than refusing the send.
                error!("idempotency lookup failed for {cache_key}: {e}");
            }
        }
    }

    let record = store
        .insert_message(&room_id, &user_id, text)
        .await
        .map_err(|e| {
            error!("message insert failed in {room_id}: {e}");
            Nack::new(ErrorCode::ServerError, "message not persisted")
        })?;

    let message_payload = json!({
        "id": record.id,
        "roomId": record.room_id,
        "userId": record.user_id,
        "userName": user_name,
        "text": record.body,
        "createdAt": record.created_at.to_rfc3339(),
        "senderRequestId": envelope.request_id,
    });

    if let Some(key) = dedup_key {
        let cache_key = idempotency_cache_key(&user_id, key);
        if let Err(e) = cache
            .set_ex(&cache_key, &message_payload.to_string(), IDEMPOTENCY_TTL_SECS)
            .await
        {
            error!("idempotency store failed for {cache_key}: {e}");
        }
    }

    let frame = protocol::frame("chat.message", message_payload);
    registry.broadcast_to_room(&room_id, &frame, None);
    metrics.inc_chat_messages();
    cache.incr_metric("chat_messages").await;

    Ok(Some(json!({ "messageId": record.id, "duplicate": false })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::OUTBOUND_BUFFER;
    use crate::rooms::RoomKind;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Harness {
        store: Store,
        cache: Cache,
        registry: Registry,
        metrics: ServerMetrics,
    }

    impl Harness {
        async fn new() -> (Self, ConnId, mpsc::Receiver<Arc<String>>) {
            let store = Store::memory();
            let room = store
                .create_room("general", "General", RoomKind::Text, true)
                .await
                .unwrap();
            let registry = Registry::new();
            let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
            let conn = registry.register("u1", "Ann", tx);
            registry.attach_to_room(conn, &room.id, room.kind);
            (
                Self {
                    store,
                    cache: Cache::memory(),
                    registry,
                    metrics: ServerMetrics::new(),
                },
                conn,
                rx,
            )
        }

        async fn send(&self, conn: ConnId, envelope: &Envelope) -> Result<Option<Value>, Nack> {
            handle_chat_send(&self.store, &self.cache, &self.registry, &self.metrics, conn, envelope)
                .await
        }
    }

    fn envelope(request_id: Option<&str>, idempotency_key: Option<&str>, text: &str) -> Envelope {
        Envelope {
            event: "chat.send".to_string(),
            request_id: request_id.map(str::to_string),
            idempotency_key: idempotency_key.map(str::to_string),
            payload: Some(json!({ "text": text })),
        }
    }

    #[tokio::test]
    async fn first_send_persists_and_broadcasts() {
        let (h, conn, mut rx) = Harness::new().await;
        let meta = h.send(conn, &envelope(Some("r1"), None, "hello")).await.unwrap().unwrap();
        assert_eq!(meta["duplicate"], false);
        assert!(meta["messageId"].is_string());

        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "chat.message");
        assert_eq!(frame["payload"]["text"], "hello");
        assert_eq!(frame["payload"]["senderRequestId"], "r1");
    }

    #[tokio::test]
    async fn retry_with_same_key_replays_without_second_write() {
        let (h, conn, mut rx) = Harness::new().await;
        let room_id = h.registry.room_of(conn).unwrap();

        let first = h.send(conn, &envelope(Some("r1"), Some("k1"), "hi")).await.unwrap().unwrap();
        let second = h.send(conn, &envelope(Some("r1"), Some("k1"), "hi")).await.unwrap().unwrap();
        assert_eq!(second["duplicate"], true);
        assert_eq!(second["idempotencyKey"], "k1");
        assert_eq!(h.store.message_count(&room_id).await, 1);

        // Broadcast from the first send, replay from the second; same id.
        let b1: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let b2: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(b1["payload"]["id"], first["messageId"]);
        assert_eq!(b2["payload"]["id"], first["messageId"]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn new_request_id_with_same_key_is_still_duplicate() {
        let (h, conn, _rx) = Harness::new().await;
        let room_id = h.registry.room_of(conn).unwrap();
        h.send(conn, &envelope(Some("r1"), Some("k1"), "hi")).await.unwrap();
        let meta = h.send(conn, &envelope(Some("r2"), Some("k1"), "hi")).await.unwrap().unwrap();
        assert_eq!(meta["duplicate"], true);
        assert_eq!(h.store.message_count(&room_id).await, 1);
    }

    #[tokio::test]
    async fn request_id_is_dedup_fallback() {
        let (h, conn, _rx) = Harness::new().await;
        let room_id = h.registry.room_of(conn).unwrap();
        h.send(conn, &envelope(Some("r1"), None, "hi")).await.unwrap();
        let meta = h.send(conn, &envelope(Some("r1"), None, "hi")).await.unwrap().unwrap();
        assert_eq!(meta["duplicate"], true);
        assert_eq!(h.store.message_count(&room_id).await, 1);
    }

    #[tokio::test]
    async fn no_correlation_means_no_dedup() {
        let (h, conn, _rx) = Harness::new().await;
        let room_id = h.registry.room_of(conn).unwrap();
        h.send(conn, &envelope(None, None, "hi")).await.unwrap();
        h.send(conn, &envelope(None, None, "hi")).await.unwrap();
        assert_eq!(h.store.message_count(&room_id).await, 2);
    }

    #[tokio::test]
    async fn rejects_when_not_in_a_room() {
        let (h, _conn, _rx) = Harness::new().await;
        let (tx, _rx2) = mpsc::channel(OUTBOUND_BUFFER);
        let lonely = h.registry.register("u2", "Bob", tx);
        let err = h.send(lonely, &envelope(Some("r1"), None, "hi")).await.unwrap_err();
        assert!(matches!(err.code, ErrorCode::NoActiveRoom));
    }

    #[tokio::test]
    async fn rejects_blank_and_oversized_text() {
        let (h, conn, _rx) = Harness::new().await;
        let err = h.send(conn, &envelope(Some("r1"), None, "   ")).await.unwrap_err();
        assert!(matches!(err.code, ErrorCode::ValidationError));

        let big = "x".repeat(MAX_CHAT_BYTES + 1);
        let err = h.send(conn, &envelope(Some("r2"), None, &big)).await.unwrap_err();
        assert!(matches!(err.code, ErrorCode::ValidationError));
    }
}
