use crate::types::ChunkRecord;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub buffer_duration_secs: u64,
    pub chunk_duration_secs: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_duration_secs: 10,
            chunk_duration_secs: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferHealth {
    pub buffered_seconds: u64,
    pub target_seconds: u64,
    pub percentage: f64,
    pub missing_chunks: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BufferEvent {
    BufferLow(BufferHealth),
    BufferHealthy(BufferHealth),
    ChunksNeeded(Vec<u64>),
}

/// Sliding-window chunk retention plus the buffer health state machine.
///
/// Ingestion (`add_chunk`) and playback dequeue (`next_chunk_to_play`) take
/// `&mut self`; callers sharing a manager across tasks wrap it in a single
/// mutex so the two can never interleave.
#[derive(Debug)]
pub struct BufferManager {
    retained: BTreeMap<u64, ChunkRecord>,
    buffer_duration_secs: u64,
    chunk_duration_secs: u64,
    current_play_index: u64,
    latest_known_index: Option<u64>,
    events: mpsc::UnboundedSender<BufferEvent>,
}

impl BufferManager {
    pub fn new(config: BufferConfig) -> (Self, mpsc::UnboundedReceiver<BufferEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                retained: BTreeMap::new(),
                buffer_duration_secs: config.buffer_duration_secs,
                chunk_duration_secs: config.chunk_duration_secs,
                current_play_index: 0,
                latest_known_index: None,
                events,
            },
            rx,
        )
    }

    fn retention_window(&self) -> u64 {
        // ceil(2 * bufferDuration / chunkDuration)
        (2 * self.buffer_duration_secs).div_ceil(self.chunk_duration_secs)
    }

    fn target_window_chunks(&self) -> u64 {
        self.buffer_duration_secs.div_ceil(self.chunk_duration_secs)
    }

    /// Inserts a chunk (duplicate indices overwrite), advances the known
    /// horizon, evicts everything behind the retention window, then
    /// re-evaluates health.
    pub fn add_chunk(&mut self, chunk: ChunkRecord) {
        let index = chunk.index;
        self.retained.insert(index, chunk);

        self.latest_known_index = Some(match self.latest_known_index {
            Some(latest) => latest.max(index),
            None => index,
        });

        if let Some(latest) = self.latest_known_index {
            let oldest_to_keep = latest.saturating_sub(self.retention_window());
            self.retained.retain(|&i, _| i >= oldest_to_keep);
        }

        self.check_health();
    }

    pub fn chunk(&self, index: u64) -> Option<&ChunkRecord> {
        self.retained.get(&index)
    }

    pub fn has_chunk(&self, index: u64) -> bool {
        self.retained.contains_key(&index)
    }

    pub fn available_indices(&self) -> Vec<u64> {
        self.retained.keys().copied().collect()
    }

    /// Indices inside the target playback window that are absent but already
    /// known to exist. Indices beyond the latest known index are never
    /// "missing".
    pub fn missing_chunks(&self) -> Vec<u64> {
        let latest = match self.latest_known_index {
            Some(latest) => latest,
            None => return Vec::new(),
        };

        let start = self.current_play_index;
        let end = start + self.target_window_chunks();
        (start..end)
            .filter(|i| *i <= latest && !self.retained.contains_key(i))
            .collect()
    }

    /// Removes and returns the chunk at the play position, advancing the
    /// pointer. A miss is a playback stall: the pointer does not move.
    pub fn next_chunk_to_play(&mut self) -> Option<ChunkRecord> {
        let chunk = self.retained.remove(&self.current_play_index)?;
        self.current_play_index += 1;
        Some(chunk)
    }

    pub fn current_play_index(&self) -> u64 {
        self.current_play_index
    }

    pub fn latest_known_index(&self) -> Option<u64> {
        self.latest_known_index
    }

    pub fn health(&self) -> BufferHealth {
        let buffered_chunks = self
            .retained
            .keys()
            .filter(|&&i| i >= self.current_play_index)
            .count() as u64;
        let buffered_seconds = buffered_chunks * self.chunk_duration_secs;
        let percentage =
            (buffered_seconds as f64 / self.buffer_duration_secs as f64 * 100.0).min(100.0);

        BufferHealth {
            buffered_seconds,
            target_seconds: self.buffer_duration_secs,
            percentage,
            missing_chunks: self.missing_chunks(),
        }
    }

    fn check_health(&mut self) {
        let health = self.health();

        if health.percentage < 50.0 {
            let _ = self.events.send(BufferEvent::BufferLow(health.clone()));
        } else if health.percentage >= 90.0 {
            let _ = self.events.send(BufferEvent::BufferHealthy(health.clone()));
        }

        if !health.missing_chunks.is_empty() {
            let _ = self
                .events
                .send(BufferEvent::ChunksNeeded(health.missing_chunks));
        }
    }

    pub fn set_play_position(&mut self, index: u64) {
        self.current_play_index = index;
    }

    pub fn clear(&mut self) {
        self.retained.clear();
        self.current_play_index = 0;
        self.latest_known_index = None;
    }
}
