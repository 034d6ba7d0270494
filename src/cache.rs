#![forbid(unsafe_code)]

// Shared ephemeral state: one-shot tickets, idempotency replay entries,
// presence liveness keys and daily metric counters.
//
// REDIS_URL set -> Redis over a multiplexed connection. Unset -> an
// in-memory map with the same TTL semantics.

use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Default)]
struct MemoryCache {
    entries: HashMap<String, (String, Instant)>,
    hashes: HashMap<String, HashMap<String, i64>>,
}

impl MemoryCache {
    fn live(&mut self, key: &str) -> Option<String> {
        match self.entries.get(key) {
            Some((value, expires)) if Instant::now() < *expires => Some(value.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[derive(Clone)]
enum Backend {
    Redis(Arc<Mutex<MultiplexedConnection>>),
    Memory(Arc<Mutex<MemoryCache>>),
}

#[derive(Clone)]
pub struct Cache {
    backend: Backend,
}

impl Cache {
    /// Connect using REDIS_URL, falling back to the in-memory cache.
    pub async fn connect() -> anyhow::Result<Self> {
        let url = match std::env::var("REDIS_URL") {
            Ok(url) => url,
            Err(_) => {
                info!("REDIS_URL not set — using in-memory cache");
                return Ok(Self::memory());
            }
        };
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        info!("Connected to Redis");
        Ok(Self {
            backend: Backend::Redis(Arc::new(Mutex::new(conn))),
        })
    }

    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(Mutex::new(MemoryCache::default()))),
        }
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> anyhow::Result<()> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.lock().await;
                redis::cmd("SETEX")
                    .arg(key)
                    .arg(ttl_secs)
                    .arg(value)
                    .query_async::<_, ()>(&mut *conn)
                    .await?;
            }
            Backend::Memory(mem) => {
                let mut mem = mem.lock().await;
                mem.entries.insert(
                    key.to_string(),
                    (value.to_string(), Instant::now() + Duration::from_secs(ttl_secs)),
                );
            }
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.lock().await;
                let value: Option<String> =
                    redis::cmd("GET").arg(key).query_async(&mut *conn).await?;
                Ok(value)
            }
            Backend::Memory(mem) => {
                let mut mem = mem.lock().await;
                Ok(mem.live(key))
            }
        }
    }

    /// Atomic fetch-and-delete. A ticket can be consumed exactly once even
    /// when two sockets race on it.
    pub async fn get_del(&self, key: &str) -> anyhow::Result<Option<String>> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.lock().await;
                let value: Option<String> =
                    redis::cmd("GETDEL").arg(key).query_async(&mut *conn).await?;
                Ok(value)
            }
            Backend::Memory(mem) => {
                let mut mem = mem.lock().await;
                let value = mem.live(key);
                mem.entries.remove(key);
                Ok(value)
            }
        }
    }

    pub async fn del(&self, key: &str) -> anyhow::Result<()> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.lock().await;
                redis::cmd("DEL")
                    .arg(key)
                    .query_async::<_, ()>(&mut *conn)
                    .await?;
            }
            Backend::Memory(mem) => {
                let mut mem = mem.lock().await;
                mem.entries.remove(key);
            }
        }
        Ok(())
    }

    pub async fn hincr(&self, key: &str, field: &str, by: i64) -> anyhow::Result<()> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.lock().await;
                redis::cmd("HINCRBY")
                    .arg(key)
                    .arg(field)
                    .arg(by)
                    .query_async::<_, ()>(&mut *conn)
                    .await?;
            }
            Backend::Memory(mem) => {
                let mut mem = mem.lock().await;
                *mem.hashes
                    .entry(key.to_string())
                    .or_default()
                    .entry(field.to_string())
                    .or_insert(0) += by;
            }
        }
        Ok(())
    }

    /// Bump a field in today's `ws:metrics:{day}` hash. Best effort: a cache
    /// outage must never fail the event that triggered the bump.
    pub async fn incr_metric(&self, field: &str) {
        let key = format!("ws:metrics:{}", chrono::Utc::now().format("%Y-%m-%d"));
        if let Err(e) = self.hincr(&key, field, 1).await {
            warn!("metric increment failed for {field}: {e}");
        }
    }

    #[cfg(test)]
    pub(crate) async fn hash_field(&self, key: &str, field: &str) -> Option<i64> {
        match &self.backend {
            Backend::Redis(_) => unreachable!("tests use the memory backend"),
            Backend::Memory(mem) => {
                let mem = mem.lock().await;
                mem.hashes.get(key).and_then(|h| h.get(field)).copied()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_del_roundtrip() {
        let cache = Cache::memory();
        cache.set_ex("k", "v", 60).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        cache.del("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_del_consumes_once() {
        let cache = Cache::memory();
        cache.set_ex("ticket", "claims", 45).await.unwrap();
        assert_eq!(cache.get_del("ticket").await.unwrap().as_deref(), Some("claims"));
        assert_eq!(cache.get_del("ticket").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zero_ttl_is_already_expired() {
        let cache = Cache::memory();
        cache.set_ex("k", "v", 0).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn metric_increment_accumulates() {
        let cache = Cache::memory();
        cache.incr_metric("chat_messages").await;
        cache.incr_metric("chat_messages").await;
        let key = format!("ws:metrics:{}", chrono::Utc::now().format("%Y-%m-%d"));
        assert_eq!(cache.hash_field(&key, "chat_messages").await, Some(2));
    }
}
