#![forbid(unsafe_code)]

// In-process connection registry. Tracks every live socket, its user and
// the room it is attached to, and owns the outbound frame channels.
//
// All state sits behind one std Mutex with short critical sections; frames
// are handed to per-connection mpsc channels with try_send so one slow
// client never blocks a broadcast.

use crate::rooms::RoomKind;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Monotonic per-process connection identity. Never reused, so a stale
/// close can never tear down a newer socket of the same user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const OUTBOUND_BUFFER: usize = 64;

struct Connection {
    user_id: String,
    user_name: String,
    room_id: Option<String>,
    room_kind: Option<RoomKind>,
    sender: mpsc::Sender<Arc<String>>,
}

#[derive(Default)]
struct Inner {
    conns: HashMap<ConnId, Connection>,
    by_user: HashMap<String, HashSet<ConnId>>,
    by_room: HashMap<String, HashSet<ConnId>>,
}

/// Result of removing a connection, used to drive presence updates.
pub struct Unregistered {
    pub user_id: String,
    pub room_id: Option<String>,
    pub last_for_user: bool,
}

pub struct Registry {
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn register(
        &self,
        user_id: &str,
        user_name: &str,
        sender: mpsc::Sender<Arc<String>>,
    ) -> ConnId {
        let id = ConnId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.conns.insert(
            id,
            Connection {
                user_id: user_id.to_string(),
                user_name: user_name.to_string(),
                room_id: None,
                room_kind: None,
                sender,
            },
        );
        inner.by_user.entry(user_id.to_string()).or_default().insert(id);
        id
    }

    /// Idempotent removal. Returns None when the connection is already gone.
    pub fn unregister(&self, id: ConnId) -> Option<Unregistered> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let conn = inner.conns.remove(&id)?;
        if let Some(room_id) = &conn.room_id {
            if let Some(set) = inner.by_room.get_mut(room_id) {
                set.remove(&id);
                if set.is_empty() {
                    inner.by_room.remove(room_id);
                }
            }
        }
        let last_for_user = match inner.by_user.get_mut(&conn.user_id) {
            Some(set) => {
                set.remove(&id);
                if set.is_empty() {
                    inner.by_user.remove(&conn.user_id);
                    true
                } else {
                    false
                }
            }
            None => true,
        };
        Some(Unregistered {
            user_id: conn.user_id,
            room_id: conn.room_id,
            last_for_user,
        })
    }

    /// Attach a connection to a room, detaching it from any previous room
    /// first. Returns the room it was attached to before, if any.
    pub fn attach_to_room(
        &self,
        id: ConnId,
        room_id: &str,
        kind: RoomKind,
    ) -> Option<Option<String>> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if !inner.conns.contains_key(&id) {
            return None;
        }
        let previous = {
            let conn = inner.conns.get_mut(&id).expect("checked above");
            let previous = conn.room_id.take();
            conn.room_kind = None;
            previous
        };
        if let Some(prev) = &previous {
            if let Some(set) = inner.by_room.get_mut(prev) {
                set.remove(&id);
                if set.is_empty() {
                    inner.by_room.remove(prev);
                }
            }
        }
        let conn = inner.conns.get_mut(&id).expect("checked above");
        conn.room_id = Some(room_id.to_string());
        conn.room_kind = Some(kind);
        inner.by_room.entry(room_id.to_string()).or_default().insert(id);
        Some(previous)
    }

    /// Detach a connection from its room. Returns the room it left.
    pub fn detach_from_room(&self, id: ConnId) -> Option<String> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let conn = inner.conns.get_mut(&id)?;
        let room_id = conn.room_id.take()?;
        conn.room_kind = None;
        if let Some(set) = inner.by_room.get_mut(&room_id) {
            set.remove(&id);
            if set.is_empty() {
                inner.by_room.remove(&room_id);
            }
        }
        Some(room_id)
    }

    pub fn room_of(&self, id: ConnId) -> Option<String> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.conns.get(&id).and_then(|c| c.room_id.clone())
    }

    pub fn connection_count(&self) -> usize {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.conns.len()
    }

    pub fn rooms_active(&self) -> usize {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.by_room.len()
    }

    pub fn users_active(&self) -> usize {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.by_user.len()
    }

    /// Distinct users attached to a room, name included, sorted by user id
    /// for stable presence payloads.
    pub fn room_users(&self, room_id: &str) -> Vec<(String, String)> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut users: BTreeMap<String, String> = BTreeMap::new();
        if let Some(set) = inner.by_room.get(room_id) {
            for id in set {
                if let Some(conn) = inner.conns.get(id) {
                    users.insert(conn.user_id.clone(), conn.user_name.clone());
                }
            }
        }
        users.into_iter().collect()
    }

    /// Global room -> users snapshot, rooms and users sorted.
    pub fn snapshot(&self) -> Vec<(String, Vec<(String, String)>)> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut rooms: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for conn in inner.conns.values() {
            if let Some(room_id) = &conn.room_id {
                rooms
                    .entry(room_id.clone())
                    .or_default()
                    .insert(conn.user_id.clone(), conn.user_name.clone());
            }
        }
        rooms
            .into_iter()
            .map(|(room, users)| (room, users.into_iter().collect()))
            .collect()
    }

    /// The user's other connections currently attached to a voice-capable
    /// room. Used to enforce one active call surface per user.
    pub fn voice_conns_of_user(&self, user_id: &str, except: ConnId) -> Vec<(ConnId, String)> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut out = Vec::new();
        if let Some(set) = inner.by_user.get(user_id) {
            for id in set {
                if *id == except {
                    continue;
                }
                if let Some(conn) = inner.conns.get(id) {
                    if let (Some(room_id), Some(kind)) = (&conn.room_id, conn.room_kind) {
                        if kind.voice_capable() {
                            out.push((*id, room_id.clone()));
                        }
                    }
                }
            }
        }
        out
    }

    /// The lowest connection id per user, one entry per connected user.
    /// Global snapshots go to exactly these connections.
    pub fn primary_conn_per_user(&self) -> Vec<ConnId> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .by_user
            .values()
            .filter_map(|set| set.iter().min().copied())
            .collect()
    }

    /// Connections of `user_id` attached to `room_id`. Call relay targets.
    pub fn user_conns_in_room(&self, room_id: &str, user_id: &str) -> Vec<ConnId> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut out = Vec::new();
        if let Some(set) = inner.by_room.get(room_id) {
            for id in set {
                if let Some(conn) = inner.conns.get(id) {
                    if conn.user_id == user_id {
                        out.push(*id);
                    }
                }
            }
        }
        out
    }

    pub fn user_of(&self, id: ConnId) -> Option<(String, String)> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .conns
            .get(&id)
            .map(|c| (c.user_id.clone(), c.user_name.clone()))
    }

    pub fn user_is_connected(&self, user_id: &str) -> bool {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.by_user.contains_key(user_id)
    }

    /// Deliver a frame to one connection. Drops the frame (with a warning)
    /// when the outbound buffer is full or the connection is gone.
    pub fn send_to_conn(&self, id: ConnId, frame: Arc<String>) {
        let inner = self.inner.lock().expect("registry lock poisoned");
        if let Some(conn) = inner.conns.get(&id) {
            if let Err(e) = conn.sender.try_send(frame) {
                warn!("dropping frame for conn {id}: {e}");
            }
        }
    }

    /// Deliver a frame to every connection in a room, optionally skipping one.
    pub fn broadcast_to_room(&self, room_id: &str, frame: &Arc<String>, except: Option<ConnId>) {
        let inner = self.inner.lock().expect("registry lock poisoned");
        if let Some(set) = inner.by_room.get(room_id) {
            for id in set {
                if Some(*id) == except {
                    continue;
                }
                if let Some(conn) = inner.conns.get(id) {
                    if let Err(e) = conn.sender.try_send(Arc::clone(frame)) {
                        warn!("dropping room frame for conn {id}: {e}");
                    }
                }
            }
        }
    }

    pub fn send_to_conns(&self, ids: &[ConnId], frame: &Arc<String>) {
        for id in ids {
            self.send_to_conn(*id, Arc::clone(frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chan() -> (mpsc::Sender<Arc<String>>, mpsc::Receiver<Arc<String>>) {
        mpsc::channel(OUTBOUND_BUFFER)
    }

    #[test]
    fn conn_ids_are_never_reused() {
        let reg = Registry::new();
        let (tx, _rx) = chan();
        let a = reg.register("u1", "Ann", tx.clone());
        reg.unregister(a);
        let b = reg.register("u1", "Ann", tx);
        assert!(b > a);
    }

    #[test]
    fn unregister_is_idempotent() {
        let reg = Registry::new();
        let (tx, _rx) = chan();
        let a = reg.register("u1", "Ann", tx);
        assert!(reg.unregister(a).is_some());
        assert!(reg.unregister(a).is_none());
    }

    #[test]
    fn last_for_user_tracks_remaining_sockets() {
        let reg = Registry::new();
        let (tx, _rx) = chan();
        let a = reg.register("u1", "Ann", tx.clone());
        let b = reg.register("u1", "Ann", tx);
        assert!(!reg.unregister(a).unwrap().last_for_user);
        assert!(reg.unregister(b).unwrap().last_for_user);
    }

    #[test]
    fn attach_detaches_from_previous_room() {
        let reg = Registry::new();
        let (tx, _rx) = chan();
        let a = reg.register("u1", "Ann", tx);
        assert_eq!(reg.attach_to_room(a, "r1", RoomKind::Text), Some(None));
        let previous = reg.attach_to_room(a, "r2", RoomKind::Text).unwrap();
        assert_eq!(previous.as_deref(), Some("r1"));
        assert!(reg.room_users("r1").is_empty());
        assert_eq!(reg.room_users("r2").len(), 1);
    }

    #[test]
    fn room_users_dedupes_multi_socket_users() {
        let reg = Registry::new();
        let (tx, _rx) = chan();
        let a = reg.register("u1", "Ann", tx.clone());
        let b = reg.register("u1", "Ann", tx.clone());
        let c = reg.register("u2", "Bob", tx);
        for id in [a, b, c] {
            reg.attach_to_room(id, "r1", RoomKind::Text);
        }
        let users = reg.room_users("r1");
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].0, "u1");
        assert_eq!(users[1].0, "u2");
    }

    #[test]
    fn voice_conns_skip_text_rooms_and_self() {
        let reg = Registry::new();
        let (tx, _rx) = chan();
        let a = reg.register("u1", "Ann", tx.clone());
        let b = reg.register("u1", "Ann", tx.clone());
        let c = reg.register("u1", "Ann", tx);
        reg.attach_to_room(a, "voice-room", RoomKind::Voice);
        reg.attach_to_room(b, "text-room", RoomKind::Text);
        let evictable = reg.voice_conns_of_user("u1", c);
        assert_eq!(evictable, vec![(a, "voice-room".to_string())]);
    }

    #[test]
    fn primary_conn_is_lowest_id() {
        let reg = Registry::new();
        let (tx, _rx) = chan();
        let a = reg.register("u1", "Ann", tx.clone());
        let _b = reg.register("u1", "Ann", tx.clone());
        let c = reg.register("u2", "Bob", tx);
        let mut primaries = reg.primary_conn_per_user();
        primaries.sort();
        assert_eq!(primaries, vec![a, c]);
    }

    #[tokio::test]
    async fn broadcast_skips_excluded_conn() {
        let reg = Registry::new();
        let (tx_a, mut rx_a) = chan();
        let (tx_b, mut rx_b) = chan();
        let a = reg.register("u1", "Ann", tx_a);
        let b = reg.register("u2", "Bob", tx_b);
        reg.attach_to_room(a, "r1", RoomKind::Text);
        reg.attach_to_room(b, "r1", RoomKind::Text);
        let frame = Arc::new("hello".to_string());
        reg.broadcast_to_room("r1", &frame, Some(a));
        assert_eq!(*rx_b.recv().await.unwrap(), "hello");
        assert!(rx_a.try_recv().is_err());
    }
}
