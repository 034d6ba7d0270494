#![forbid(unsafe_code)]

// Room membership gate - resolves slugs, checks visibility, upserts membership

use crate::db::{RoomRecord, Store};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What a room is capable of. Every room carries text chat; voice and video
/// rooms additionally accept call signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Text,
    Voice,
    Video,
}

impl RoomKind {
    /// Voice-capable rooms are subject to the one-active-call-room-per-user
    /// eviction rule; text rooms never are.
    pub fn voice_capable(self) -> bool {
        !matches!(self, Self::Text)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Voice => "voice",
            Self::Video => "video",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(Self::Text),
            "voice" => Some(Self::Voice),
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum JoinError {
    RoomNotFound,
    Forbidden,
    Storage(anyhow::Error),
}

/// Authorize `user_id` to join the room identified by `slug`.
///
/// Absent or archived rooms report `RoomNotFound` (archived rooms are
/// indistinguishable from missing ones on the wire). Non-public rooms
/// require an existing membership row. On success the membership row is
/// upserted, which is a no-op for repeat joins.
pub async fn can_join(store: &Store, slug: &str, user_id: &str) -> Result<RoomRecord, JoinError> {
    let room = store
        .room_by_slug(slug)
        .await
        .map_err(JoinError::Storage)?
        .ok_or(JoinError::RoomNotFound)?;

    if room.archived {
        debug!(slug, "join rejected: room archived");
        return Err(JoinError::RoomNotFound);
    }

    if !room.is_public {
        let member = store
            .is_member(&room.id, user_id)
            .await
            .map_err(JoinError::Storage)?;
        if !member {
            debug!(slug, user_id, "join rejected: not a member of private room");
            return Err(JoinError::Forbidden);
        }
    }

    store
        .ensure_membership(&room.id, user_id)
        .await
        .map_err(JoinError::Storage)?;

    Ok(room)
}
