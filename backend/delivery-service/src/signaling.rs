//! Peer-to-peer call signaling relay.
//!
//! Offers, answers and ICE candidates are opaque to the relay. A message goes
//! straight to the recipient's open channel when there is one; otherwise it is
//! held for the TTL, one pending message per `(room, recipient)`, a newer one
//! replacing the older. Nothing is persisted.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::metrics;

/// Peers admitted to one room.
pub const MAX_ROOM_PEERS: usize = 2;

const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    pub room_id: String,
    pub from_peer: String,
    pub to_peer: String,
    pub payload: Value,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("room {room_id} already has {MAX_ROOM_PEERS} peers")]
    RoomFull { room_id: String },

    #[error("peer cannot signal itself")]
    SamePeer,

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendOutcome {
    Delivered,
    Buffered {
        #[serde(rename = "expiresAt")]
        expires_at: DateTime<Utc>,
    },
}

struct Pending {
    message: SignalingMessage,
    deadline: Instant,
}

struct ActiveChannel {
    channel_id: Uuid,
    sender: mpsc::Sender<Pending>,
}

#[derive(Default)]
struct Room {
    channels: HashMap<String, ActiveChannel>,
    /// Keyed by recipient.
    pending: HashMap<String, Pending>,
}

impl Room {
    fn participants(&self) -> Vec<&str> {
        let mut peers: Vec<&str> = self.channels.keys().map(String::as_str).collect();
        for pending in self.pending.values() {
            peers.push(&pending.message.from_peer);
            peers.push(&pending.message.to_peer);
        }
        peers.sort_unstable();
        peers.dedup();
        peers
    }

    fn admits(&self, peers: &[&str]) -> bool {
        let mut all = self.participants();
        all.extend_from_slice(peers);
        all.sort_unstable();
        all.dedup();
        all.len() <= MAX_ROOM_PEERS
    }

    fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.pending.is_empty()
    }

    fn drop_expired(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| p.deadline > now);
        before - self.pending.len()
    }
}

#[derive(Default)]
struct RelayState {
    rooms: HashMap<String, Room>,
}

/// Cheap to clone; clones share rooms.
#[derive(Clone)]
pub struct SignalingRelay {
    state: Arc<Mutex<RelayState>>,
    ttl: Duration,
}

fn validate_id(kind: &str, value: &str) -> Result<(), RelayError> {
    if value.is_empty() || value.len() > 128 {
        return Err(RelayError::InvalidId(format!("{kind} must be 1..=128 bytes")));
    }
    if value.chars().any(char::is_control) {
        return Err(RelayError::InvalidId(format!(
            "{kind} contains control characters"
        )));
    }
    Ok(())
}

impl SignalingRelay {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState::default())),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Deliver to `to_peer`'s open channel, or hold it for the TTL.
    pub fn send(
        &self,
        room_id: &str,
        from_peer: &str,
        to_peer: &str,
        payload: Value,
    ) -> Result<SendOutcome, RelayError> {
        validate_id("room id", room_id)?;
        validate_id("peer id", from_peer)?;
        validate_id("peer id", to_peer)?;
        if from_peer == to_peer {
            metrics::record_signaling("rejected");
            return Err(RelayError::SamePeer);
        }

        let now = Instant::now();
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let message = SignalingMessage {
            room_id: room_id.to_string(),
            from_peer: from_peer.to_string(),
            to_peer: to_peer.to_string(),
            payload,
            expires_at,
        };

        let mut state = self.state.lock();
        let room = state.rooms.entry(room_id.to_string()).or_default();
        room.drop_expired(now);
        if !room.admits(&[from_peer, to_peer]) {
            if room.is_empty() {
                state.rooms.remove(room_id);
            }
            metrics::record_signaling("rejected");
            return Err(RelayError::RoomFull {
                room_id: room_id.to_string(),
            });
        }

        let pending = Pending {
            message,
            deadline: now + self.ttl,
        };
        let pending = match room.channels.get(to_peer) {
            Some(active) => match active.sender.try_send(pending) {
                Ok(()) => {
                    metrics::record_signaling("delivered");
                    debug!(room_id = %room_id, from = %from_peer, to = %to_peer, "Signaling message delivered");
                    return Ok(SendOutcome::Delivered);
                }
                // Slow or gone reader: fall back to the pending slot.
                Err(mpsc::error::TrySendError::Full(p))
                | Err(mpsc::error::TrySendError::Closed(p)) => p,
            },
            None => pending,
        };

        let replaced = room.pending.insert(to_peer.to_string(), pending).is_some();

        metrics::record_signaling("buffered");
        debug!(
            room_id = %room_id,
            from = %from_peer,
            to = %to_peer,
            replaced,
            "Signaling message buffered"
        );
        Ok(SendOutcome::Buffered { expires_at })
    }

    /// Take the pending message for `peer`, if one is still within its TTL.
    pub fn receive(&self, room_id: &str, peer: &str) -> Option<SignalingMessage> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let room = state.rooms.get_mut(room_id)?;

        let taken = room.pending.remove(peer);
        let message = match taken {
            Some(p) if p.deadline > now => Some(p.message),
            Some(_) => {
                metrics::record_signaling("expired");
                None
            }
            None => None,
        };

        if room.is_empty() {
            state.rooms.remove(room_id);
        }
        message
    }

    /// Open `peer`'s channel in `room_id`, flushing any pending message into
    /// it. A second connect by the same peer replaces the first channel.
    pub fn connect(&self, room_id: &str, peer: &str) -> Result<RelayChannel, RelayError> {
        validate_id("room id", room_id)?;
        validate_id("peer id", peer)?;

        let now = Instant::now();
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let channel_id = Uuid::new_v4();

        let mut state = self.state.lock();
        let room = state.rooms.entry(room_id.to_string()).or_default();
        room.drop_expired(now);
        if !room.admits(&[peer]) {
            if room.is_empty() {
                state.rooms.remove(room_id);
            }
            return Err(RelayError::RoomFull {
                room_id: room_id.to_string(),
            });
        }

        if let Some(pending) = room.pending.remove(peer) {
            // Fresh channel with spare capacity.
            let _ = sender.try_send(pending);
            metrics::record_signaling("delivered");
        }
        room.channels.insert(
            peer.to_string(),
            ActiveChannel {
                channel_id,
                sender,
            },
        );
        info!(room_id = %room_id, peer = %peer, "Signaling peer connected");

        Ok(RelayChannel {
            room_id: room_id.to_string(),
            peer: peer.to_string(),
            channel_id,
            receiver,
            relay: Arc::downgrade(&self.state),
        })
    }

    pub fn is_connected(&self, room_id: &str, peer: &str) -> bool {
        self.state
            .lock()
            .rooms
            .get(room_id)
            .is_some_and(|room| room.channels.contains_key(peer))
    }

    pub fn room_count(&self) -> usize {
        self.state.lock().rooms.len()
    }

    /// Drop expired pending messages and empty rooms. Returns how many
    /// messages were discarded.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let mut purged = 0;
        state.rooms.retain(|_, room| {
            purged += room.drop_expired(now);
            !room.is_empty()
        });
        if purged > 0 {
            for _ in 0..purged {
                metrics::record_signaling("expired");
            }
            debug!(purged, "Purged expired signaling messages");
        }
        purged
    }
}

/// A peer's live connection to a room. Dropping it disconnects the peer.
pub struct RelayChannel {
    room_id: String,
    peer: String,
    channel_id: Uuid,
    receiver: mpsc::Receiver<Pending>,
    relay: Weak<Mutex<RelayState>>,
}

impl RelayChannel {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// `None` once the channel was replaced by a newer connect.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        self.receiver.recv().await.map(|p| p.message)
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        let Some(state) = self.relay.upgrade() else {
            return;
        };
        let mut state = state.lock();
        let Some(room) = state.rooms.get_mut(&self.room_id) else {
            return;
        };
        if room
            .channels
            .get(&self.peer)
            .is_some_and(|c| c.channel_id == self.channel_id)
        {
            room.channels.remove(&self.peer);

            // Delivered but never read: hand it back to the pending slot
            // under its original deadline.
            self.receiver.close();
            let mut unread = None;
            while let Ok(pending) = self.receiver.try_recv() {
                unread = Some(pending);
            }
            match unread {
                Some(pending) if pending.deadline > Instant::now() => {
                    room.pending.entry(self.peer.clone()).or_insert(pending);
                }
                Some(_) => metrics::record_signaling("expired"),
                None => {}
            }
            debug!(room_id = %self.room_id, peer = %self.peer, "Signaling peer disconnected");
        }
        if room.is_empty() {
            state.rooms.remove(&self.room_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn test_offline_peer_receives_within_ttl() {
        let relay = SignalingRelay::new(TTL);
        let outcome = relay.send("room", "alice", "bob", json!({"sdp": "offer"})).unwrap();
        assert!(matches!(outcome, SendOutcome::Buffered { .. }));

        tokio::time::advance(Duration::from_secs(29)).await;
        let message = relay.receive("room", "bob").unwrap();
        assert_eq!(message.from_peer, "alice");
        assert_eq!(message.payload, json!({"sdp": "offer"}));

        // Drained on delivery.
        assert!(relay.receive("room", "bob").is_none());
        assert_eq!(relay.room_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_message_expires() {
        let relay = SignalingRelay::new(TTL);
        relay.send("room", "alice", "bob", json!("offer")).unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(relay.receive("room", "bob").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_message_replaces_pending() {
        let relay = SignalingRelay::new(TTL);
        relay.send("room", "alice", "bob", json!("first")).unwrap();
        relay.send("room", "alice", "bob", json!("second")).unwrap();

        assert_eq!(relay.receive("room", "bob").unwrap().payload, json!("second"));
        assert!(relay.receive("room", "bob").is_none());
    }

    #[tokio::test]
    async fn test_connected_peer_gets_immediate_delivery() {
        let relay = SignalingRelay::new(TTL);
        let mut bob = relay.connect("room", "bob").unwrap();

        let outcome = relay.send("room", "alice", "bob", json!("candidate")).unwrap();
        assert_eq!(outcome, SendOutcome::Delivered);
        assert_eq!(bob.recv().await.unwrap().payload, json!("candidate"));
        assert!(relay.receive("room", "bob").is_none());
    }

    #[tokio::test]
    async fn test_connect_flushes_pending_message() {
        let relay = SignalingRelay::new(TTL);
        relay.send("room", "alice", "bob", json!("offer")).unwrap();

        let mut bob = relay.connect("room", "bob").unwrap();
        assert_eq!(bob.recv().await.unwrap().payload, json!("offer"));
    }

    #[tokio::test]
    async fn test_disconnect_falls_back_to_buffering() {
        let relay = SignalingRelay::new(TTL);
        let bob = relay.connect("room", "bob").unwrap();
        assert!(relay.is_connected("room", "bob"));
        drop(bob);
        assert!(!relay.is_connected("room", "bob"));

        let outcome = relay.send("room", "alice", "bob", json!("offer")).unwrap();
        assert!(matches!(outcome, SendOutcome::Buffered { .. }));
    }

    #[tokio::test]
    async fn test_unread_message_survives_disconnect() {
        let relay = SignalingRelay::new(TTL);
        let bob = relay.connect("room", "bob").unwrap();
        assert_eq!(
            relay.send("room", "alice", "bob", json!("answer")).unwrap(),
            SendOutcome::Delivered
        );

        drop(bob);
        assert_eq!(relay.receive("room", "bob").unwrap().payload, json!("answer"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unread_message_keeps_original_deadline() {
        let relay = SignalingRelay::new(TTL);
        let bob = relay.connect("room", "bob").unwrap();
        assert_eq!(
            relay.send("room", "alice", "bob", json!("offer")).unwrap(),
            SendOutcome::Delivered
        );

        tokio::time::advance(Duration::from_secs(29)).await;
        drop(bob);
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(relay.receive("room", "bob").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unread_message_past_deadline_is_dropped_on_disconnect() {
        let relay = SignalingRelay::new(TTL);
        let bob = relay.connect("room", "bob").unwrap();
        relay.send("room", "alice", "bob", json!("offer")).unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        drop(bob);
        assert_eq!(relay.room_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_previous_channel() {
        let relay = SignalingRelay::new(TTL);
        let mut first = relay.connect("room", "bob").unwrap();
        let mut second = relay.connect("room", "bob").unwrap();

        assert!(first.recv().await.is_none());
        drop(first);
        assert!(relay.is_connected("room", "bob"));

        relay.send("room", "alice", "bob", json!("hi")).unwrap();
        assert_eq!(second.recv().await.unwrap().payload, json!("hi"));
    }

    #[tokio::test]
    async fn test_room_admits_two_peers() {
        let relay = SignalingRelay::new(TTL);
        relay.send("room", "alice", "bob", json!("offer")).unwrap();

        assert!(matches!(
            relay.send("room", "carol", "bob", json!("offer")),
            Err(RelayError::RoomFull { .. })
        ));
        assert!(matches!(
            relay.connect("room", "carol"),
            Err(RelayError::RoomFull { .. })
        ));
        assert!(relay.send("other", "carol", "bob", json!("offer")).is_ok());
    }

    #[test]
    fn test_same_peer_rejected() {
        let relay = SignalingRelay::new(TTL);
        assert_eq!(
            relay.send("room", "alice", "alice", json!(null)),
            Err(RelayError::SamePeer)
        );
        assert!(matches!(
            relay.send("", "alice", "bob", json!(null)),
            Err(RelayError::InvalidId(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_sweeps_rooms() {
        let relay = SignalingRelay::new(TTL);
        relay.send("a", "alice", "bob", json!(1)).unwrap();
        relay.send("b", "alice", "bob", json!(2)).unwrap();
        assert_eq!(relay.purge_expired(), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(relay.purge_expired(), 2);
        assert_eq!(relay.room_count(), 0);
    }
}
