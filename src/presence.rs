#![forbid(unsafe_code)]

// Presence is derived state: per-room user lists come straight from the
// registry, liveness flags live in the shared cache. Nothing here is
// authoritative, so every cache failure is logged and swallowed.

use crate::cache::Cache;
use crate::registry::{ConnId, Registry};
use crate::signaling::protocol;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

pub const LIVENESS_TTL_SECS: u64 = 120;

fn liveness_key(user_id: &str) -> String {
    format!("presence:user:{user_id}")
}

fn user_entries(users: &[(String, String)]) -> Vec<serde_json::Value> {
    users
        .iter()
        .map(|(id, name)| json!({ "userId": id, "userName": name }))
        .collect()
}

/// Push the room's deduped user list to everyone attached to it.
pub fn broadcast_room_presence(registry: &Registry, room_id: &str) {
    let users = registry.room_users(room_id);
    let frame = protocol::frame(
        "room.presence",
        json!({ "roomId": room_id, "users": user_entries(&users) }),
    );
    registry.broadcast_to_room(room_id, &frame, None);
}

/// Single-user join delta, sent to the room alongside the full list.
pub fn broadcast_joined(registry: &Registry, room_id: &str, user_id: &str, user_name: &str) {
    let frame = protocol::frame(
        "presence.joined",
        json!({ "roomId": room_id, "userId": user_id, "userName": user_name }),
    );
    registry.broadcast_to_room(room_id, &frame, None);
}

/// Single-user leave delta. Only sent once the user has no connection left
/// in the room.
pub fn broadcast_left(registry: &Registry, room_id: &str, user_id: &str, user_name: &str) {
    let frame = protocol::frame(
        "presence.left",
        json!({ "roomId": room_id, "userId": user_id, "userName": user_name }),
    );
    registry.broadcast_to_room(room_id, &frame, None);
}

/// Build the global room->users snapshot frame.
pub fn global_snapshot_frame(registry: &Registry) -> Arc<String> {
    let rooms: Vec<serde_json::Value> = registry
        .snapshot()
        .into_iter()
        .map(|(room_id, users)| json!({ "roomId": room_id, "users": user_entries(&users) }))
        .collect();
    protocol::frame("rooms.presence", json!({ "rooms": rooms }))
}

/// Deliver the global snapshot to one connection per connected user.
pub fn broadcast_global_snapshot(registry: &Registry) {
    let frame = global_snapshot_frame(registry);
    for conn in registry.primary_conn_per_user() {
        registry.send_to_conn(conn, Arc::clone(&frame));
    }
}

/// Deliver the global snapshot to a single connection, typically right
/// after `server.ready`.
pub fn send_global_snapshot(registry: &Registry, conn: ConnId) {
    registry.send_to_conn(conn, global_snapshot_frame(registry));
}

/// Flip the liveness flag online. Refreshed on connect; the TTL covers
/// the gap if the process dies without cleanup.
pub async fn mark_online(cache: &Cache, user_id: &str) {
    if let Err(e) = cache
        .set_ex(&liveness_key(user_id), "online", LIVENESS_TTL_SECS)
        .await
    {
        warn!("presence online flag failed for {user_id}: {e}");
    }
}

/// Drop the liveness flag. Called only when the user's last connection
/// closes.
pub async fn mark_offline(cache: &Cache, user_id: &str) {
    if let Err(e) = cache.del(&liveness_key(user_id)).await {
        warn!("presence offline flag failed for {user_id}: {e}");
    }
}
