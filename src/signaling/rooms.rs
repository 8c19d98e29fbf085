use crate::signaling::messages::{PeerLeftPayload, SignalEnvelope, SignalKind};
use crate::types::StreamSummary;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

/// Outbound handle for one member's WebSocket. The connection task owns the
/// sink; the registry only ever enqueues frames.
pub type PeerSender = mpsc::UnboundedSender<Message>;

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: String,
    pub is_streamer: bool,
    pub joined_at: DateTime<Utc>,
    pub sender: PeerSender,
}

#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub id: String,
    pub is_streamer: bool,
}

#[derive(Debug)]
struct Room {
    id: String,
    is_live: bool,
    started_at: Option<DateTime<Utc>>,
    peers: HashMap<String, PeerRecord>,
}

impl Room {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            is_live: false,
            started_at: None,
            peers: HashMap::new(),
        }
    }
}

/// Room membership and message-routing authority. One write guard covers
/// every membership mutation, so two mutations for the same room can never
/// interleave. No chunk data passes through here.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Adds a peer to a room, creating the room lazily. Returns the other
    /// members (self excluded).
    pub async fn join(&self, stream_id: &str, peer: PeerRecord) -> Vec<MemberInfo> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(stream_id.to_string())
            .or_insert_with(|| Room::new(stream_id));

        let others: Vec<MemberInfo> = room
            .peers
            .values()
            .filter(|p| p.id != peer.id)
            .map(|p| MemberInfo {
                id: p.id.clone(),
                is_streamer: p.is_streamer,
            })
            .collect();

        if peer.is_streamer && !room.is_live {
            room.is_live = true;
            room.started_at = Some(Utc::now());
        }
        room.peers.insert(peer.id.clone(), peer);

        others
    }

    /// Removes a peer. Empty rooms are destroyed; otherwise remaining
    /// members get a peer-disconnected notice, plus stream-ended when the
    /// departing peer was the streamer.
    pub async fn leave(&self, stream_id: &str, peer_id: &str) {
        let mut rooms = self.rooms.write().await;
        let destroy = match rooms.get_mut(stream_id) {
            Some(room) => {
                let removed = match room.peers.remove(peer_id) {
                    Some(removed) => removed,
                    None => return,
                };

                if room.peers.is_empty() {
                    true
                } else {
                    let stream_ended =
                        removed.is_streamer && !room.peers.values().any(|p| p.is_streamer);
                    if stream_ended {
                        room.is_live = false;
                        room.started_at = None;
                    }

                    let notice = SignalEnvelope::new(
                        SignalKind::PeerDisconnected,
                        json!(PeerLeftPayload {
                            peer_id: peer_id.to_string(),
                        }),
                        peer_id,
                        None,
                        stream_id,
                    );
                    Self::broadcast(room, None, &notice);

                    if stream_ended {
                        let ended = SignalEnvelope::new(
                            SignalKind::StreamEnded,
                            json!({}),
                            peer_id,
                            None,
                            stream_id,
                        );
                        Self::broadcast(room, None, &ended);
                    }
                    false
                }
            }
            None => return,
        };

        if destroy {
            rooms.remove(stream_id);
        }
    }

    /// Delivers an envelope: to one member when `to` is set, to every other
    /// member otherwise. Unknown rooms and unknown targets are dropped
    /// without an error to the sender.
    pub async fn route(&self, envelope: &SignalEnvelope) {
        let rooms = self.rooms.read().await;
        let room = match rooms.get(&envelope.stream_id) {
            Some(room) => room,
            None => {
                debug!(
                    "Dropping {:?} for unknown stream {}",
                    envelope.kind, envelope.stream_id
                );
                return;
            }
        };

        match &envelope.to {
            Some(target) => match room.peers.get(target) {
                Some(peer) => Self::send(peer, envelope),
                None => debug!(
                    "Dropping {:?} for unknown target {} in stream {}",
                    envelope.kind, target, envelope.stream_id
                ),
            },
            None => Self::broadcast(room, Some(&envelope.from), envelope),
        }
    }

    /// Unicasts an envelope to one member, bypassing routing rules. Used by
    /// the relay server for direct replies such as peer lists.
    pub async fn send_to(&self, stream_id: &str, peer_id: &str, envelope: &SignalEnvelope) {
        let rooms = self.rooms.read().await;
        if let Some(peer) = rooms.get(stream_id).and_then(|r| r.peers.get(peer_id)) {
            Self::send(peer, envelope);
        }
    }

    pub async fn members(&self, stream_id: &str) -> Vec<MemberInfo> {
        let rooms = self.rooms.read().await;
        rooms
            .get(stream_id)
            .map(|room| {
                room.peers
                    .values()
                    .map(|p| MemberInfo {
                        id: p.id.clone(),
                        is_streamer: p.is_streamer,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn room_exists(&self, stream_id: &str) -> bool {
        self.rooms.read().await.contains_key(stream_id)
    }

    pub async fn is_live(&self, stream_id: &str) -> bool {
        self.rooms
            .read()
            .await
            .get(stream_id)
            .map(|r| r.is_live)
            .unwrap_or(false)
    }

    /// Live rooms only. The streamer is excluded from the viewer count.
    pub async fn live_streams(&self) -> Vec<StreamSummary> {
        let rooms = self.rooms.read().await;
        rooms
            .values()
            .filter(|room| room.is_live)
            .filter_map(|room| {
                room.started_at.map(|started| StreamSummary {
                    id: room.id.clone(),
                    viewer_count: room.peers.len().saturating_sub(1),
                    started_at: started.timestamp_millis(),
                })
            })
            .collect()
    }

    fn broadcast(room: &Room, exclude: Option<&str>, envelope: &SignalEnvelope) {
        for peer in room.peers.values() {
            if exclude == Some(peer.id.as_str()) {
                continue;
            }
            Self::send(peer, envelope);
        }
    }

    fn send(peer: &PeerRecord, envelope: &SignalEnvelope) {
        match serde_json::to_string(envelope) {
            Ok(text) => {
                if peer.sender.send(Message::Text(text)).is_err() {
                    warn!("Failed to enqueue message for peer {}", peer.id);
                }
            }
            Err(e) => warn!("Failed to serialize envelope: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, is_streamer: bool) -> (PeerRecord, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            PeerRecord {
                id: id.to_string(),
                is_streamer,
                joined_at: Utc::now(),
                sender: tx,
            },
            rx,
        )
    }

    fn parse(msg: Message) -> SignalEnvelope {
        serde_json::from_str(msg.to_text().unwrap()).unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<SignalEnvelope> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(parse(msg));
        }
        out
    }

    #[tokio::test]
    async fn join_then_leave_restores_pre_join_state() {
        let registry = RoomRegistry::new();
        let (peer, _rx) = record("p1", false);

        let others = registry.join("s1", peer).await;
        assert!(others.is_empty());
        assert!(registry.room_exists("s1").await);

        registry.leave("s1", "p1").await;
        assert!(!registry.room_exists("s1").await);
    }

    #[tokio::test]
    async fn is_live_tracks_streamer_membership_exactly() {
        let registry = RoomRegistry::new();
        let (viewer, _v_rx) = record("viewer", false);
        registry.join("s1", viewer).await;
        assert!(!registry.is_live("s1").await);

        let (streamer, _s_rx) = record("cam", true);
        registry.join("s1", streamer).await;
        assert!(registry.is_live("s1").await);

        // A viewer leaving does not end the stream.
        let (viewer2, _v2_rx) = record("viewer2", false);
        registry.join("s1", viewer2).await;
        registry.leave("s1", "viewer2").await;
        assert!(registry.is_live("s1").await);

        registry.leave("s1", "cam").await;
        assert!(!registry.is_live("s1").await);
    }

    #[tokio::test]
    async fn streamer_departure_broadcasts_stream_ended() {
        let registry = RoomRegistry::new();
        let (streamer, _s_rx) = record("cam", true);
        let (viewer, mut v_rx) = record("viewer", false);
        registry.join("s1", streamer).await;
        registry.join("s1", viewer).await;

        registry.leave("s1", "cam").await;

        let received = drain(&mut v_rx);
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].kind, SignalKind::PeerDisconnected);
        assert_eq!(received[0].payload["peerId"], "cam");
        assert_eq!(received[1].kind, SignalKind::StreamEnded);
    }

    #[tokio::test]
    async fn viewer_count_excludes_streamer_and_lists_only_live() {
        let registry = RoomRegistry::new();
        let (streamer, _s_rx) = record("cam", true);
        let (v1, _rx1) = record("v1", false);
        let (v2, _rx2) = record("v2", false);
        registry.join("s1", streamer).await;
        registry.join("s1", v1).await;
        registry.join("s1", v2).await;

        // A second room with no streamer must not be listed.
        let (lurker, _rx3) = record("lurker", false);
        registry.join("s2", lurker).await;

        let streams = registry.live_streams().await;
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].id, "s1");
        assert_eq!(streams[0].viewer_count, 2);

        // Lone streamer: listed live with zero viewers.
        let (solo, _rx4) = record("solo", true);
        registry.join("s3", solo).await;
        let mut streams = registry.live_streams().await;
        streams.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(streams[1].viewer_count, 0);
    }

    #[tokio::test]
    async fn targeted_route_reaches_only_the_target() {
        let registry = RoomRegistry::new();
        let (a, mut a_rx) = record("a", false);
        let (b, mut b_rx) = record("b", false);
        let (c, mut c_rx) = record("c", false);
        registry.join("s1", a).await;
        registry.join("s1", b).await;
        registry.join("s1", c).await;

        let env = SignalEnvelope::new(
            SignalKind::Offer,
            json!({"sdp": "x"}),
            "a",
            Some("b"),
            "s1",
        );
        registry.route(&env).await;

        assert!(a_rx.try_recv().is_err());
        assert!(c_rx.try_recv().is_err());
        let got = drain(&mut b_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, SignalKind::Offer);
    }

    #[tokio::test]
    async fn broadcast_route_excludes_sender() {
        let registry = RoomRegistry::new();
        let (a, mut a_rx) = record("a", false);
        let (b, mut b_rx) = record("b", false);
        registry.join("s1", a).await;
        registry.join("s1", b).await;

        let env = SignalEnvelope::new(SignalKind::ChunkMap, json!({}), "a", None, "s1");
        registry.route(&env).await;

        assert!(a_rx.try_recv().is_err());
        assert_eq!(drain(&mut b_rx).len(), 1);
    }

    #[tokio::test]
    async fn unknown_target_is_silently_dropped() {
        let registry = RoomRegistry::new();
        let (a, mut a_rx) = record("a", false);
        registry.join("s1", a).await;

        let env = SignalEnvelope::new(
            SignalKind::Answer,
            json!({}),
            "a",
            Some("ghost"),
            "s1",
        );
        registry.route(&env).await;
        registry
            .route(&SignalEnvelope::new(
                SignalKind::Offer,
                json!({}),
                "a",
                Some("b"),
                "no-such-room",
            ))
            .await;

        assert!(a_rx.try_recv().is_err());
    }
}
