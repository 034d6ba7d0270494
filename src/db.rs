#![forbid(unsafe_code)]

// Persistence for rooms, memberships and chat messages.
//
// DATABASE_URL set -> PostgreSQL via sqlx. Unset -> an in-memory store so
// the server (and the test suite) runs without external services.

use crate::rooms::RoomKind;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RoomRecord {
    pub id: String,
    pub slug: String,
    pub title: String,
    pub kind: RoomKind,
    pub is_public: bool,
    pub archived: bool,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryStore {
    rooms: HashMap<String, RoomRecord>,
    members: HashSet<(String, String)>,
    messages: Vec<MessageRecord>,
}

enum Backend {
    Postgres(PgPool),
    Memory(Mutex<MemoryStore>),
}

pub struct Store {
    backend: Backend,
}

impl Store {
    /// Connect using DATABASE_URL, falling back to the in-memory store.
    pub async fn connect() -> anyhow::Result<Self> {
        let url = match std::env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                info!("DATABASE_URL not set — using in-memory room store");
                return Ok(Self::memory());
            }
        };

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(3))
            .connect(&url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Connected to PostgreSQL, migrations applied");

        Ok(Self {
            backend: Backend::Postgres(pool),
        })
    }

    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory(Mutex::new(MemoryStore::default())),
        }
    }

    /// Room lookup by public slug. Archived rooms are returned as-is; the
    /// membership gate decides how to report them.
    pub async fn room_by_slug(&self, slug: &str) -> anyhow::Result<Option<RoomRecord>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let row = sqlx::query(
                    "SELECT id, slug, title, kind, is_public, archived FROM rooms WHERE slug = $1",
                )
                .bind(slug)
                .fetch_optional(pool)
                .await?;
                row.map(room_from_row).transpose()
            }
            Backend::Memory(mem) => {
                let mem = mem.lock().await;
                Ok(mem.rooms.get(slug).cloned())
            }
        }
    }

    pub async fn is_member(&self, room_id: &str, user_id: &str) -> anyhow::Result<bool> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let row = sqlx::query(
                    "SELECT 1 AS one FROM room_members WHERE room_id = $1 AND user_id = $2",
                )
                .bind(room_id)
                .bind(user_id)
                .fetch_optional(pool)
                .await?;
                Ok(row.is_some())
            }
            Backend::Memory(mem) => {
                let mem = mem.lock().await;
                Ok(mem
                    .members
                    .contains(&(room_id.to_string(), user_id.to_string())))
            }
        }
    }

    /// Idempotent membership upsert.
    pub async fn ensure_membership(&self, room_id: &str, user_id: &str) -> anyhow::Result<()> {
        match &self.backend {
            Backend::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO room_members (room_id, user_id) VALUES ($1, $2)
                     ON CONFLICT (room_id, user_id) DO NOTHING",
                )
                .bind(room_id)
                .bind(user_id)
                .execute(pool)
                .await?;
                Ok(())
            }
            Backend::Memory(mem) => {
                let mut mem = mem.lock().await;
                mem.members
                    .insert((room_id.to_string(), user_id.to_string()));
                Ok(())
            }
        }
    }

    pub async fn insert_message(
        &self,
        room_id: &str,
        user_id: &str,
        body: &str,
    ) -> anyhow::Result<MessageRecord> {
        let record = MessageRecord {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
        };
        match &self.backend {
            Backend::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO messages (id, room_id, user_id, body, created_at)
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(&record.id)
                .bind(&record.room_id)
                .bind(&record.user_id)
                .bind(&record.body)
                .bind(record.created_at)
                .execute(pool)
                .await?;
            }
            Backend::Memory(mem) => {
                let mut mem = mem.lock().await;
                mem.messages.push(record.clone());
            }
        }
        Ok(record)
    }

    /// Create (seed) a room. Used by operators and the test suite.
    pub async fn create_room(
        &self,
        slug: &str,
        title: &str,
        kind: RoomKind,
        is_public: bool,
    ) -> anyhow::Result<RoomRecord> {
        let record = RoomRecord {
            id: Uuid::new_v4().to_string(),
            slug: slug.to_string(),
            title: title.to_string(),
            kind,
            is_public,
            archived: false,
        };
        match &self.backend {
            Backend::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO rooms (id, slug, title, kind, is_public) VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(&record.id)
                .bind(&record.slug)
                .bind(&record.title)
                .bind(record.kind.as_str())
                .bind(record.is_public)
                .execute(pool)
                .await?;
            }
            Backend::Memory(mem) => {
                let mut mem = mem.lock().await;
                mem.rooms.insert(record.slug.clone(), record.clone());
            }
        }
        Ok(record)
    }

    pub async fn archive_room(&self, room_id: &str) -> anyhow::Result<()> {
        match &self.backend {
            Backend::Postgres(pool) => {
                sqlx::query("UPDATE rooms SET archived = TRUE WHERE id = $1")
                    .bind(room_id)
                    .execute(pool)
                    .await?;
                Ok(())
            }
            Backend::Memory(mem) => {
                let mut mem = mem.lock().await;
                for room in mem.rooms.values_mut() {
                    if room.id == room_id {
                        room.archived = true;
                    }
                }
                Ok(())
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn message_count(&self, room_id: &str) -> usize {
        match &self.backend {
            Backend::Postgres(_) => unreachable!("tests use the memory backend"),
            Backend::Memory(mem) => {
                let mem = mem.lock().await;
                mem.messages.iter().filter(|m| m.room_id == room_id).count()
            }
        }
    }
}

fn room_from_row(row: sqlx::postgres::PgRow) -> anyhow::Result<RoomRecord> {
    let kind: String = row.try_get("kind")?;
    Ok(RoomRecord {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        title: row.try_get("title")?,
        kind: RoomKind::parse(&kind).ok_or_else(|| anyhow!("unknown room kind: {kind}"))?,
        is_public: row.try_get("is_public")?,
        archived: row.try_get("archived")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_membership_roundtrip() {
        let store = Store::memory();
        let room = store
            .create_room("general", "General", RoomKind::Text, true)
            .await
            .unwrap();
        assert!(!store.is_member(&room.id, "u1").await.unwrap());
        store.ensure_membership(&room.id, "u1").await.unwrap();
        store.ensure_membership(&room.id, "u1").await.unwrap();
        assert!(store.is_member(&room.id, "u1").await.unwrap());
    }

    #[tokio::test]
    async fn memory_message_insert_returns_identity() {
        let store = Store::memory();
        let room = store
            .create_room("general", "General", RoomKind::Text, true)
            .await
            .unwrap();
        let msg = store.insert_message(&room.id, "u1", "hello").await.unwrap();
        assert_eq!(msg.room_id, room.id);
        assert_eq!(msg.body, "hello");
        assert!(!msg.id.is_empty());
        assert_eq!(store.message_count(&room.id).await, 1);
    }
}
