use crate::types::{PeerStats, StatsUpdate};
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const STATS_TTL: Duration = Duration::from_secs(60);

/// Server-side peer quality bookkeeping. Stats arrive over heartbeats and
/// expire after a TTL; peers without stats score a neutral 50. Owns no
/// timer: the relay server drives `cleanup` periodically.
#[derive(Debug, Default)]
pub struct PeerScorer {
    stats: HashMap<String, PeerStats>,
}

impl PeerScorer {
    pub fn new() -> Self {
        Self {
            stats: HashMap::new(),
        }
    }

    pub fn update_stats(&mut self, peer_id: &str, update: StatsUpdate) {
        let entry = self
            .stats
            .entry(peer_id.to_string())
            .or_insert_with(PeerStats::default);

        if let Some(v) = update.upload_bandwidth {
            entry.upload_bandwidth = v;
        }
        if let Some(v) = update.download_bandwidth {
            entry.download_bandwidth = v;
        }
        if let Some(v) = update.latency {
            entry.latency = v;
        }
        if let Some(v) = update.packets_lost {
            entry.packets_lost = v;
        }
        entry.last_updated = Instant::now();
    }

    pub fn score(&self, peer_id: &str) -> u32 {
        let stats = match self.stats.get(peer_id) {
            Some(stats) => stats,
            None => return 50,
        };

        let bandwidth = (stats.upload_bandwidth as f64 / 1000.0 * 50.0).min(100.0);
        let latency = (100.0 - stats.latency as f64).max(0.0);
        let loss = (100.0 - stats.packets_lost as f64 * 10.0).max(0.0);

        ((bandwidth + latency + loss) / 3.0).round() as u32
    }

    pub fn stats(&self, peer_id: &str) -> Option<&PeerStats> {
        self.stats.get(peer_id)
    }

    pub fn cleanup(&mut self, ttl: Duration) {
        self.stats.retain(|_, s| s.last_updated.elapsed() <= ttl);
    }

    pub fn tracked_peers(&self) -> Vec<(String, u32, u64)> {
        self.stats
            .iter()
            .map(|(id, s)| (id.clone(), self.score(id), s.last_updated.elapsed().as_secs()))
            .collect()
    }
}
