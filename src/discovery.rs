use crate::types::{PeerInfo, PeerRole, PeerScore};
use chrono::Utc;

// Capacity is judged against a fixed slot budget, not the caller's
// max_connections: a peer's advertised connection list is scored on the same
// scale regardless of who is asking.
const PEER_SLOT_BUDGET: f64 = 10.0;

/// Scores a peer for topology decisions. All components and the weighted
/// total land in 0-100.
pub fn calculate_score(peer: &PeerInfo) -> PeerScore {
    calculate_score_at(peer, Utc::now().timestamp_millis())
}

pub fn calculate_score_at(peer: &PeerInfo, now_ms: i64) -> PeerScore {
    // 1000 kbps upload is "excellent".
    let bandwidth = (peer.upload_bandwidth as f64 / 1000.0 * 100.0).min(100.0);

    // Connected for 5+ minutes maxes out stability.
    let connected_minutes = (now_ms - peer.connected_at).max(0) as f64 / 60_000.0;
    let stability = (connected_minutes * 20.0).min(100.0);

    // 0 ms -> 100, 500 ms -> 0.
    let latency = (100.0 - peer.latency as f64 / 5.0).max(0.0);

    let capacity =
        ((PEER_SLOT_BUDGET - peer.connections.len() as f64) / PEER_SLOT_BUDGET * 100.0).max(0.0);

    let total = bandwidth * 0.35 + stability * 0.25 + latency * 0.25 + capacity * 0.15;

    PeerScore {
        bandwidth: bandwidth.round() as u32,
        stability: stability.round() as u32,
        latency: latency.round() as u32,
        capacity: capacity.round() as u32,
        total: total.round() as u32,
    }
}

/// Picks the best unconnected candidates to fill the remaining connection
/// slots. May return fewer than the open slot count.
pub fn select_peers(
    available: &[PeerInfo],
    current_connections: &[String],
    max_connections: usize,
) -> Vec<PeerInfo> {
    let now_ms = Utc::now().timestamp_millis();

    let mut scored: Vec<(PeerInfo, u32)> = available
        .iter()
        .filter(|p| !current_connections.contains(&p.id))
        .map(|p| (p.clone(), calculate_score_at(p, now_ms).total))
        .collect();

    scored.sort_by(|a, b| b.1.cmp(&a.1));

    let slots = max_connections.saturating_sub(current_connections.len());
    scored.into_iter().take(slots).map(|(p, _)| p).collect()
}

/// Classifies a peer's mesh role from its score.
pub fn assign_role(score: &PeerScore) -> PeerRole {
    if score.total >= 75 && score.bandwidth >= 70 {
        PeerRole::SuperSeed
    } else if score.total >= 50 {
        PeerRole::Relay
    } else {
        PeerRole::Leaf
    }
}
