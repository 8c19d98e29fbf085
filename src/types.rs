use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// One indexed, time-bounded unit of the media stream. Indices are assigned
/// by the producer's segmenter and are gap-free in production order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub index: u64,
    pub stream_id: String,
    pub payload: Bytes,
    pub timestamp: i64,
    pub duration_ms: u64,
    pub is_keyframe: bool,
}

/// Raw per-peer statistics reported over heartbeats. TTL-pruned by the
/// scorer's cleanup pass.
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub upload_bandwidth: u32,
    pub download_bandwidth: u32,
    pub latency: u32,
    pub packets_lost: u32,
    pub last_updated: Instant,
}

impl Default for PeerStats {
    fn default() -> Self {
        Self {
            upload_bandwidth: 0,
            download_bandwidth: 0,
            latency: 100,
            packets_lost: 0,
            last_updated: Instant::now(),
        }
    }
}

/// Partial stats update carried in a heartbeat payload. Absent fields keep
/// their previous values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_bandwidth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_bandwidth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packets_lost: Option<u32>,
}

/// Derived topology score, each component 0-100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerScore {
    pub bandwidth: u32,
    pub stability: u32,
    pub latency: u32,
    pub capacity: u32,
    pub total: u32,
}

/// The topology-decision view of a remote peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    pub stream_id: String,
    pub upload_bandwidth: u32,
    pub download_bandwidth: u32,
    pub latency: u32,
    pub connected_at: i64,
    pub is_streamer: bool,
    #[serde(default)]
    pub chunks_available: Vec<u64>,
    #[serde(default)]
    pub connections: Vec<String>,
}

/// Mesh role assigned by score. Roles inform peer selection; they do not
/// restrict who a coordinator may talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerRole {
    SuperSeed,
    Relay,
    Leaf,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::SuperSeed => write!(f, "super-seed"),
            PeerRole::Relay => write!(f, "relay"),
            PeerRole::Leaf => write!(f, "leaf"),
        }
    }
}

/// Entry in the live-stream directory. The streamer is excluded from the
/// viewer count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub id: String,
    pub viewer_count: usize,
    pub started_at: i64,
}

/// Playback and mesh tuning knobs shared by both session kinds.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub chunk_duration_secs: u64,
    pub buffer_duration_secs: u64,
    pub max_connections: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_duration_secs: 2,
            buffer_duration_secs: 10,
            max_connections: 5,
        }
    }
}
