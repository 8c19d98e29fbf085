use crate::types::ChunkRecord;
use serde::{Deserialize, Serialize};

/// Chunk metadata sent as a structured message immediately before the raw
/// payload on the same transport. Payload bytes are never embedded in the
/// control protocol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub index: u64,
    pub timestamp: i64,
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    #[serde(rename = "isKeyframe")]
    pub is_keyframe: bool,
}

impl From<&ChunkRecord> for ChunkMeta {
    fn from(chunk: &ChunkRecord) -> Self {
        Self {
            index: chunk.index,
            timestamp: chunk.timestamp,
            duration_ms: chunk.duration_ms,
            is_keyframe: chunk.is_keyframe,
        }
    }
}

/// Peer-to-peer control messages, multiplexed with binary chunk payloads on
/// one transport. Dispatch is exhaustive over this closed set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PeerMessage {
    ChunkMap { chunks: Vec<u64> },
    RequestChunkMap,
    RequestChunk {
        #[serde(rename = "chunkIndex")]
        chunk_index: u64,
    },
    ChunkMeta(ChunkMeta),
}

impl PeerMessage {
    /// A frame that does not parse as a control message is not an error:
    /// the caller treats it as a raw chunk payload. Control and binary data
    /// share one channel, so this ambiguity is inherent to the wire format.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn to_text(&self) -> crate::utils::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
