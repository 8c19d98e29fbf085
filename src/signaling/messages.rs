use crate::types::StatsUpdate;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    JoinStream,
    LeaveStream,
    Offer,
    Answer,
    IceCandidate,
    PeerList,
    ChunkMap,
    RequestChunk,
    PeerDisconnected,
    StreamEnded,
    Heartbeat,
}

/// The envelope every message between a coordinator and the relay travels
/// in. The payload is opaque to the relay; only the routing fields matter
/// to it. An absent `to` means broadcast to the room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default)]
    pub payload: Value,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(rename = "streamId")]
    pub stream_id: String,
    pub timestamp: i64,
}

impl SignalEnvelope {
    pub fn new(
        kind: SignalKind,
        payload: Value,
        from: &str,
        to: Option<&str>,
        stream_id: &str,
    ) -> Self {
        Self {
            kind,
            payload,
            from: from.to_string(),
            to: to.map(|t| t.to_string()),
            stream_id: stream_id.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub stream_id: String,
    pub peer_id: String,
    pub is_streamer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub id: String,
    pub score: u32,
    pub is_streamer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerListPayload {
    pub peers: Vec<PeerSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub peer_id: String,
    pub stream_id: String,
    pub stats: StatsUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLeftPayload {
    pub peer_id: String,
}
