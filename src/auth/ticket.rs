#![forbid(unsafe_code)]

// One-shot WebSocket tickets. An authenticated HTTP call mints a short
// opaque token in the shared cache; the socket handshake consumes it with
// an atomic fetch-and-delete, so a ticket admits at most one connection.

use crate::cache::Cache;
use crate::signaling::protocol::{
    CLOSE_TICKET_CORRUPT, CLOSE_TICKET_INVALID, CLOSE_TICKET_MISSING, CLOSE_TICKET_NO_SUBJECT,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TICKET_TTL_SECS: u64 = 45;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct TicketClaims {
    pub user_id: String,
    pub user_name: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TicketError {
    Missing,
    InvalidOrExpired,
    Corrupted,
    SubjectMissing,
}

impl TicketError {
    /// Distinct application close codes so clients can tell a retryable
    /// failure (mint a new ticket) from a broken one.
    pub fn close_code(&self) -> u16 {
        match self {
            TicketError::Missing => CLOSE_TICKET_MISSING,
            TicketError::InvalidOrExpired => CLOSE_TICKET_INVALID,
            TicketError::Corrupted => CLOSE_TICKET_CORRUPT,
            TicketError::SubjectMissing => CLOSE_TICKET_NO_SUBJECT,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            TicketError::Missing => "ticket required",
            TicketError::InvalidOrExpired => "ticket invalid or expired",
            TicketError::Corrupted => "ticket payload corrupted",
            TicketError::SubjectMissing => "ticket has no subject",
        }
    }
}

fn ticket_key(token: &str) -> String {
    format!("ws:ticket:{token}")
}

pub async fn issue(cache: &Cache, user_id: &str, user_name: &str) -> anyhow::Result<String> {
    let token = Uuid::new_v4().to_string();
    let claims = serde_json::to_string(&TicketClaims {
        user_id: user_id.to_string(),
        user_name: user_name.to_string(),
    })?;
    cache.set_ex(&ticket_key(&token), &claims, TICKET_TTL_SECS).await?;
    Ok(token)
}

pub async fn consume(cache: &Cache, token: Option<&str>) -> Result<TicketClaims, TicketError> {
    let token = match token {
        Some(t) if !t.is_empty() => t,
        _ => return Err(TicketError::Missing),
    };
    let raw = cache
        .get_del(&ticket_key(token))
        .await
        .map_err(|_| TicketError::InvalidOrExpired)?
        .ok_or(TicketError::InvalidOrExpired)?;
    let claims: TicketClaims =
        serde_json::from_str(&raw).map_err(|_| TicketError::Corrupted)?;
    if claims.user_id.is_empty() {
        return Err(TicketError::SubjectMissing);
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ticket_admits_exactly_once() {
        let cache = Cache::memory();
        let token = issue(&cache, "u1", "Ann").await.unwrap();
        let claims = consume(&cache, Some(&token)).await.unwrap();
        assert_eq!(claims.user_id, "u1");
        assert_eq!(claims.user_name, "Ann");
        assert_eq!(
            consume(&cache, Some(&token)).await,
            Err(TicketError::InvalidOrExpired)
        );
    }

    #[tokio::test]
    async fn missing_ticket_rejected() {
        let cache = Cache::memory();
        assert_eq!(consume(&cache, None).await, Err(TicketError::Missing));
        assert_eq!(consume(&cache, Some("")).await, Err(TicketError::Missing));
    }

    #[tokio::test]
    async fn unknown_ticket_rejected() {
        let cache = Cache::memory();
        assert_eq!(
            consume(&cache, Some("nope")).await,
            Err(TicketError::InvalidOrExpired)
        );
    }

    #[tokio::test]
    async fn corrupt_payload_rejected() {
        let cache = Cache::memory();
        cache.set_ex("ws:ticket:t1", "{not json", 45).await.unwrap();
        assert_eq!(
            consume(&cache, Some("t1")).await,
            Err(TicketError::Corrupted)
        );
    }

    #[tokio::test]
    async fn empty_subject_rejected() {
        let cache = Cache::memory();
        cache
            .set_ex(
                "ws:ticket:t2",
                r#"{"user_id":"","user_name":"Ann"}"#,
                45,
            )
            .await
            .unwrap();
        assert_eq!(
            consume(&cache, Some("t2")).await,
            Err(TicketError::SubjectMissing)
        );
    }

    #[test]
    fn close_codes_are_distinct() {
        let codes = [
            TicketError::Missing.close_code(),
            TicketError::InvalidOrExpired.close_code(),
            TicketError::Corrupted.close_code(),
            TicketError::SubjectMissing.close_code(),
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }
}
