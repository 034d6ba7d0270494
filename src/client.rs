#![forbid(unsafe_code)]

// Reconnecting client driver. One task owns the socket for its whole
// lifetime; callers talk to it over channels. Sends are tracked in a
// pending map until acked, resent on timeout, replayed after reconnect,
// and surfaced as terminal failures once the retry ceiling is hit.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const ACK_TIMEOUT: Duration = Duration::from_secs(6);
pub const PING_INTERVAL: Duration = Duration::from_secs(15);
pub const MAX_SEND_ATTEMPTS: u32 = 5;

const BACKOFF_LADDER_SECS: [u64; 5] = [1, 2, 4, 8, 12];

/// Reconnect delay for the given consecutive failure count, capped at the
/// top of the ladder.
pub fn backoff_delay(failures: u32) -> Duration {
    let idx = (failures as usize).min(BACKOFF_LADDER_SECS.len() - 1);
    Duration::from_secs(BACKOFF_LADDER_SECS[idx])
}

/// Mints a fresh one-shot ticket before each connection attempt.
pub trait TicketSource: Send + Sync {
    fn ticket(&self) -> BoxFuture<'_, anyhow::Result<String>>;
}

#[derive(Debug)]
pub enum Command {
    /// Correlated send, tracked until acked.
    Send { event: String, payload: Value },
    Shutdown,
}

#[derive(Debug)]
pub enum ClientEvent {
    Connected,
    Disconnected { reconnect_in: Duration },
    /// Any server frame that is not an ack or nack.
    Frame(Value),
    Acked { request_id: String, meta: Value },
    Failed { request_id: String, reason: String },
}

struct PendingRequest {
    envelope: String,
    attempts: u32,
    deadline: Instant,
}

/// Requests awaiting an ack. Removal is idempotent; an ack racing a resend
/// timer resolves to whichever side removes the entry first.
#[derive(Default)]
struct PendingRequests {
    map: HashMap<String, PendingRequest>,
}

enum DueAction {
    Resend(String, String),
    GiveUp(String),
}

impl PendingRequests {
    fn insert(&mut self, request_id: String, envelope: String) {
        self.map.insert(
            request_id,
            PendingRequest {
                envelope,
                attempts: 1,
                deadline: Instant::now() + ACK_TIMEOUT,
            },
        );
    }

    fn remove(&mut self, request_id: &str) -> bool {
        self.map.remove(request_id).is_some()
    }

    /// Collect timed-out entries: retryable ones get their deadline re-armed
    /// and attempt count bumped, exhausted ones are dropped.
    fn take_due(&mut self, now: Instant) -> Vec<DueAction> {
        let mut actions = Vec::new();
        let due: Vec<String> = self
            .map
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(id, _)| id.clone())
            .collect();
        for id in due {
            let pending = self.map.get_mut(&id).expect("collected above");
            if pending.attempts >= MAX_SEND_ATTEMPTS {
                self.map.remove(&id);
                actions.push(DueAction::GiveUp(id));
            } else {
                pending.attempts += 1;
                pending.deadline = now + ACK_TIMEOUT;
                actions.push(DueAction::Resend(id, pending.envelope.clone()));
            }
        }
        actions
    }

    /// Re-arm every entry for replay on a fresh connection. Attempt counts
    /// carry over; reconnecting is not a free retry budget.
    fn replay_all(&mut self) -> Vec<String> {
        let deadline = Instant::now() + ACK_TIMEOUT;
        self.map
            .values_mut()
            .map(|p| {
                p.deadline = deadline;
                p.envelope.clone()
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

fn build_envelope(event: &str, payload: &Value, request_id: &str) -> String {
    json!({
        "type": event,
        "requestId": request_id,
        "idempotencyKey": request_id,
        "payload": payload,
    })
    .to_string()
}

pub struct ClientConfig {
    /// WebSocket endpoint without the ticket query parameter.
    pub url: String,
}

/// Spawn the driver task. Returns the command handle and the event stream.
pub fn spawn(
    config: ClientConfig,
    tickets: Arc<dyn TicketSource>,
) -> (mpsc::Sender<Command>, mpsc::Receiver<ClientEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(256);
    tokio::spawn(run(config, tickets, cmd_rx, event_tx));
    (cmd_tx, event_rx)
}

async fn run(
    config: ClientConfig,
    tickets: Arc<dyn TicketSource>,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ClientEvent>,
) {
    let mut pending = PendingRequests::default();
    let mut failures: u32 = 0;

    'reconnect: loop {
        let ticket = match tickets.ticket().await {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!("ticket mint failed: {e}");
                let delay = backoff_delay(failures);
                failures += 1;
                let _ = events.send(ClientEvent::Disconnected { reconnect_in: delay }).await;
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let url = format!("{}?ticket={}", config.url, ticket);
        let (mut socket, _) = match connect_async(url.as_str()).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!("connect failed: {e}");
                let delay = backoff_delay(failures);
                failures += 1;
                let _ = events.send(ClientEvent::Disconnected { reconnect_in: delay }).await;
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        failures = 0;
        info!("connected, replaying {} pending request(s)", pending.len());
        for envelope in pending.replay_all() {
            if socket.send(Message::Text(envelope.into())).await.is_err() {
                continue 'reconnect;
            }
        }
        let _ = events.send(ClientEvent::Connected).await;

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await; // first tick fires immediately
        let mut resend_scan = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                msg = socket.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!("socket error: {e}");
                            break;
                        }
                    };
                    handle_server_frame(&text, &mut pending, &events).await;
                }
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Send { event, payload }) => {
                            let request_id = Uuid::new_v4().to_string();
                            let envelope = build_envelope(&event, &payload, &request_id);
                            pending.insert(request_id, envelope.clone());
                            if socket.send(Message::Text(envelope.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(Command::Shutdown) | None => {
                            let _ = socket.close(None).await;
                            return;
                        }
                    }
                }
                _ = ping.tick() => {
                    let frame = json!({ "type": "ping" }).to_string();
                    if socket.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                _ = resend_scan.tick() => {
                    for action in pending.take_due(Instant::now()) {
                        match action {
                            DueAction::Resend(id, envelope) => {
                                debug!("resending request {id}");
                                if socket.send(Message::Text(envelope.into())).await.is_err() {
                                    break;
                                }
                            }
                            DueAction::GiveUp(id) => {
                                let _ = events.send(ClientEvent::Failed {
                                    request_id: id,
                                    reason: "retry ceiling exhausted".to_string(),
                                }).await;
                            }
                        }
                    }
                }
            }
        }

        let delay = backoff_delay(failures);
        failures += 1;
        let _ = events.send(ClientEvent::Disconnected { reconnect_in: delay }).await;
        tokio::time::sleep(delay).await;
    }
}

async fn handle_server_frame(
    text: &str,
    pending: &mut PendingRequests,
    events: &mpsc::Sender<ClientEvent>,
) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("unreadable server frame: {e}");
            return;
        }
    };
    match frame["type"].as_str() {
        Some("ack") => {
            if let Some(request_id) = frame["payload"]["requestId"].as_str() {
                if pending.remove(request_id) {
                    let _ = events
                        .send(ClientEvent::Acked {
                            request_id: request_id.to_string(),
                            meta: frame["payload"]["meta"].clone(),
                        })
                        .await;
                }
            }
        }
        Some("nack") => {
            if let Some(request_id) = frame["payload"]["requestId"].as_str() {
                if pending.remove(request_id) {
                    let reason = frame["payload"]["message"]
                        .as_str()
                        .unwrap_or("rejected")
                        .to_string();
                    let _ = events
                        .send(ClientEvent::Failed {
                            request_id: request_id.to_string(),
                            reason,
                        })
                        .await;
                }
            }
        }
        _ => {
            let _ = events.send(ClientEvent::Frame(frame)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_ladder_caps_at_twelve_seconds() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(4), Duration::from_secs(12));
        assert_eq!(backoff_delay(40), Duration::from_secs(12));
    }

    #[test]
    fn removal_is_idempotent() {
        let mut pending = PendingRequests::default();
        pending.insert("r1".to_string(), "{}".to_string());
        assert!(pending.remove("r1"));
        assert!(!pending.remove("r1"));
    }

    #[test]
    fn timed_out_request_is_rearmed_then_dropped() {
        let mut pending = PendingRequests::default();
        pending.insert("r1".to_string(), "{}".to_string());

        // Not yet due.
        assert!(pending.take_due(Instant::now()).is_empty());

        let mut resends = 0;
        loop {
            let late = Instant::now() + ACK_TIMEOUT + Duration::from_secs(1);
            let actions = pending.take_due(late);
            assert_eq!(actions.len(), 1);
            match &actions[0] {
                DueAction::Resend(id, _) => {
                    assert_eq!(id, "r1");
                    resends += 1;
                }
                DueAction::GiveUp(id) => {
                    assert_eq!(id, "r1");
                    break;
                }
            }
        }
        assert_eq!(resends, MAX_SEND_ATTEMPTS - 1);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn ack_after_giveup_is_a_noop() {
        let mut pending = PendingRequests::default();
        pending.insert("r1".to_string(), "{}".to_string());
        loop {
            let late = Instant::now() + ACK_TIMEOUT + Duration::from_secs(1);
            if matches!(pending.take_due(late).as_slice(), [DueAction::GiveUp(_)]) {
                break;
            }
        }
        assert!(!pending.remove("r1"));
    }

    #[test]
    fn replay_rearms_every_entry() {
        let mut pending = PendingRequests::default();
        pending.insert("r1".to_string(), "a".to_string());
        pending.insert("r2".to_string(), "b".to_string());
        let mut envelopes = pending.replay_all();
        envelopes.sort();
        assert_eq!(envelopes, vec!["a".to_string(), "b".to_string()]);
        // Re-armed, so nothing is due right now.
        assert!(pending.take_due(Instant::now()).is_empty());
    }

    #[test]
    fn envelope_carries_both_correlation_fields() {
        let envelope = build_envelope("chat.send", &json!({ "text": "hi" }), "r1");
        let parsed: Value = serde_json::from_str(&envelope).unwrap();
        assert_eq!(parsed["type"], "chat.send");
        assert_eq!(parsed["requestId"], "r1");
        assert_eq!(parsed["idempotencyKey"], "r1");
        assert_eq!(parsed["payload"]["text"], "hi");
    }
}
