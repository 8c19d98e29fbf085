use crate::bandwidth::BandwidthEstimator;
use crate::buffer::{BufferConfig, BufferEvent, BufferManager};
use crate::chunks::ChunkSegmenter;
use crate::client::RelayClient;
use crate::mesh::{MeshConfig, MeshCoordinator, MeshEvent, TransportFactory, WebRtcFactory};
use crate::signaling::messages::{PeerListPayload, SignalEnvelope, SignalKind};
use crate::types::{ChunkRecord, StatsUpdate, StreamConfig};
use crate::utils::Result;
use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

// A viewer asks at most this many fresh peers per peer-list update, however
// many slots remain open.
const CONNECT_BATCH: usize = 3;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub relay_url: String,
    pub stream_id: String,
    pub stream: StreamConfig,
}

/// Observable broadcaster state, published on a watch channel.
#[derive(Debug, Clone)]
pub struct BroadcastStatus {
    pub peer_id: String,
    pub is_live: bool,
    pub viewer_count: usize,
    pub connected_to_relay: bool,
    pub last_error: Option<String>,
}

/// Observable viewer state, published on a watch channel.
#[derive(Debug, Clone)]
pub struct ViewerStatus {
    pub peer_id: String,
    pub is_playing: bool,
    pub peer_count: usize,
    pub buffer_health_pct: f64,
    pub connected_to_relay: bool,
    pub last_error: Option<String>,
}

/// One live broadcast: segments the capture byte stream, pushes chunks to
/// every connected viewer, and answers chunk requests from a bounded
/// recent-chunk store.
pub struct BroadcastSession {
    peer_id: String,
    status_rx: watch::Receiver<BroadcastStatus>,
    shutdown: mpsc::Sender<()>,
}

impl BroadcastSession {
    pub async fn start(config: SessionConfig, capture_rx: mpsc::Receiver<Bytes>) -> Result<Self> {
        Self::start_with_factory(config, capture_rx, Arc::new(WebRtcFactory::new())).await
    }

    pub async fn start_with_factory(
        config: SessionConfig,
        capture_rx: mpsc::Receiver<Bytes>,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        let peer_id = Uuid::new_v4().to_string();
        let client = RelayClient::connect(&config.relay_url).await?;

        let (mesh, mesh_rx) = MeshCoordinator::new(
            MeshConfig {
                local_peer_id: peer_id.clone(),
                stream_id: config.stream_id.clone(),
            },
            factory,
            client.sender(),
        );

        client.join(&config.stream_id, &peer_id, true)?;
        info!("Broadcasting {} as peer {}", config.stream_id, peer_id);

        let (status_tx, status_rx) = watch::channel(BroadcastStatus {
            peer_id: peer_id.clone(),
            is_live: true,
            viewer_count: 0,
            connected_to_relay: true,
            last_error: None,
        });
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        tokio::spawn(run_broadcast_loop(
            config,
            peer_id.clone(),
            client,
            mesh,
            mesh_rx,
            capture_rx,
            status_tx,
            shutdown_rx,
        ));

        Ok(Self {
            peer_id,
            status_rx,
            shutdown: shutdown_tx,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn status(&self) -> watch::Receiver<BroadcastStatus> {
        self.status_rx.clone()
    }

    pub fn stop(&self) {
        let _ = self.shutdown.try_send(());
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_broadcast_loop(
    config: SessionConfig,
    peer_id: String,
    mut client: RelayClient,
    mesh: MeshCoordinator,
    mut mesh_rx: mpsc::UnboundedReceiver<MeshEvent>,
    mut capture_rx: mpsc::Receiver<Bytes>,
    status_tx: watch::Sender<BroadcastStatus>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let chunk_duration_ms = config.stream.chunk_duration_secs * 1000;
    let mut segmenter = ChunkSegmenter::new(&config.stream_id, chunk_duration_ms);
    let mut estimator = BandwidthEstimator::new();
    let mut recent: BTreeMap<u64, ChunkRecord> = BTreeMap::new();
    let recent_capacity = (2 * config.stream.buffer_duration_secs)
        .div_ceil(config.stream.chunk_duration_secs) as usize;
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                let _ = client.leave(&config.stream_id, &peer_id);
                mesh.destroy().await;
                status_tx.send_modify(|s| s.is_live = false);
                info!("Broadcast of {} stopped", config.stream_id);
                break;
            }
            captured = capture_rx.recv() => match captured {
                Some(bytes) => {
                    estimator.add_sample(bytes.len() as u64, chunk_duration_ms);
                    let chunk = segmenter.segment(bytes);
                    mesh.record_local_chunk(chunk.index).await;

                    recent.insert(chunk.index, chunk.clone());
                    while recent.len() > recent_capacity {
                        recent.pop_first();
                    }
                    if let Some((&oldest, _)) = recent.first_key_value() {
                        mesh.forget_local_chunks_below(oldest).await;
                    }

                    mesh.broadcast_chunk(&chunk).await;
                }
                None => {
                    // Capture source ended: the stream is over.
                    let _ = client.leave(&config.stream_id, &peer_id);
                    mesh.destroy().await;
                    status_tx.send_modify(|s| s.is_live = false);
                    break;
                }
            },
            envelope = client.recv() => match envelope {
                Some(envelope) => {
                    handle_broadcast_envelope(&mesh, envelope).await;
                }
                None => {
                    status_tx.send_modify(|s| {
                        s.connected_to_relay = false;
                        s.last_error = Some("relay connection lost".to_string());
                    });
                    mesh.destroy().await;
                    break;
                }
            },
            event = mesh_rx.recv() => {
                if let Some(event) = event {
                    match event {
                        MeshEvent::PeerConnected(_) | MeshEvent::PeerDisconnected(_) => {
                            let count = mesh.connected_peer_count().await;
                            status_tx.send_modify(|s| s.viewer_count = count);
                        }
                        MeshEvent::ChunkRequested { peer_id, index } => {
                            match recent.get(&index) {
                                Some(chunk) => {
                                    mesh.send_chunk_to_peer(&peer_id, chunk).await;
                                }
                                None => debug!("Requested chunk {} already rotated out", index),
                            }
                        }
                        MeshEvent::TransportError { peer_id, reason } => {
                            warn!("Viewer {} transport failed: {}", peer_id, reason);
                            status_tx.send_modify(|s| s.last_error = Some(reason));
                        }
                        _ => {}
                    }
                }
            }
            _ = heartbeat.tick() => {
                let stats = StatsUpdate {
                    upload_bandwidth: Some(estimator.estimate()),
                    ..Default::default()
                };
                let _ = client.heartbeat(&config.stream_id, &peer_id, stats);
            }
        }
    }
}

async fn handle_broadcast_envelope(mesh: &MeshCoordinator, envelope: SignalEnvelope) {
    match envelope.kind {
        SignalKind::PeerList => {
            let payload: PeerListPayload = match serde_json::from_value(envelope.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Malformed peer list: {}", e);
                    return;
                }
            };
            let known = mesh.known_peer_ids().await;
            for peer in payload.peers {
                mesh.update_peer_score(&peer.id, peer.score).await;
                if !known.contains(&peer.id) {
                    if let Err(e) = mesh.connect(&peer.id, true).await {
                        warn!("Failed to open transport to {}: {}", peer.id, e);
                    }
                }
            }
        }
        SignalKind::Offer | SignalKind::Answer | SignalKind::IceCandidate => {
            if let Err(e) = mesh.handle_signal(envelope).await {
                warn!("Failed to apply signal: {}", e);
            }
        }
        _ => {}
    }
}

/// One viewing session: connects to the best advertised peers, feeds
/// received chunks into the buffer, and turns replenishment events back
/// into chunk requests.
pub struct ViewerSession {
    peer_id: String,
    status_rx: watch::Receiver<ViewerStatus>,
    buffer: Arc<Mutex<BufferManager>>,
    shutdown: mpsc::Sender<()>,
}

impl ViewerSession {
    pub async fn start(config: SessionConfig) -> Result<Self> {
        Self::start_with_factory(config, Arc::new(WebRtcFactory::new())).await
    }

    pub async fn start_with_factory(
        config: SessionConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        let peer_id = Uuid::new_v4().to_string();
        let client = RelayClient::connect(&config.relay_url).await?;

        let (mesh, mesh_rx) = MeshCoordinator::new(
            MeshConfig {
                local_peer_id: peer_id.clone(),
                stream_id: config.stream_id.clone(),
            },
            factory,
            client.sender(),
        );

        let (buffer, buffer_rx) = BufferManager::new(BufferConfig {
            buffer_duration_secs: config.stream.buffer_duration_secs,
            chunk_duration_secs: config.stream.chunk_duration_secs,
        });
        let buffer = Arc::new(Mutex::new(buffer));

        client.join(&config.stream_id, &peer_id, false)?;
        info!("Watching {} as peer {}", config.stream_id, peer_id);

        let (status_tx, status_rx) = watch::channel(ViewerStatus {
            peer_id: peer_id.clone(),
            is_playing: true,
            peer_count: 0,
            buffer_health_pct: 0.0,
            connected_to_relay: true,
            last_error: None,
        });
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        tokio::spawn(run_viewer_loop(
            config,
            peer_id.clone(),
            client,
            mesh,
            mesh_rx,
            buffer.clone(),
            buffer_rx,
            status_tx,
            shutdown_rx,
        ));

        Ok(Self {
            peer_id,
            status_rx,
            buffer,
            shutdown: shutdown_tx,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn status(&self) -> watch::Receiver<ViewerStatus> {
        self.status_rx.clone()
    }

    /// Dequeues the next playable chunk for the playback sink, or None on a
    /// stall.
    pub async fn next_playable(&self) -> Option<ChunkRecord> {
        self.buffer.lock().await.next_chunk_to_play()
    }

    pub fn stop(&self) {
        let _ = self.shutdown.try_send(());
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_viewer_loop(
    config: SessionConfig,
    peer_id: String,
    mut client: RelayClient,
    mesh: MeshCoordinator,
    mut mesh_rx: mpsc::UnboundedReceiver<MeshEvent>,
    buffer: Arc<Mutex<BufferManager>>,
    mut buffer_rx: mpsc::UnboundedReceiver<BufferEvent>,
    status_tx: watch::Sender<ViewerStatus>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut estimator = BandwidthEstimator::new();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                let _ = client.leave(&config.stream_id, &peer_id);
                mesh.destroy().await;
                buffer.lock().await.clear();
                status_tx.send_modify(|s| s.is_playing = false);
                info!("Stopped watching {}", config.stream_id);
                break;
            }
            envelope = client.recv() => match envelope {
                Some(envelope) => {
                    if handle_viewer_envelope(&config, &mesh, &status_tx, envelope).await {
                        mesh.destroy().await;
                        break;
                    }
                }
                None => {
                    status_tx.send_modify(|s| {
                        s.connected_to_relay = false;
                        s.last_error = Some("relay connection lost".to_string());
                    });
                    mesh.destroy().await;
                    break;
                }
            },
            event = mesh_rx.recv() => {
                if let Some(event) = event {
                    handle_viewer_mesh_event(&config, &mesh, &buffer, &mut estimator, &status_tx, event).await;
                }
            }
            needed = buffer_rx.recv() => {
                if let Some(event) = needed {
                    match event {
                        BufferEvent::ChunksNeeded(indices) => {
                            for index in indices {
                                if !mesh.request_chunk(index).await {
                                    debug!("No known holder for chunk {}", index);
                                }
                            }
                        }
                        BufferEvent::BufferLow(health) => {
                            status_tx.send_modify(|s| s.buffer_health_pct = health.percentage);
                            for index in health.missing_chunks {
                                mesh.request_chunk(index).await;
                            }
                        }
                        BufferEvent::BufferHealthy(health) => {
                            status_tx.send_modify(|s| s.buffer_health_pct = health.percentage);
                        }
                    }
                }
            }
            _ = heartbeat.tick() => {
                let stats = StatsUpdate {
                    download_bandwidth: Some(estimator.estimate()),
                    ..Default::default()
                };
                let _ = client.heartbeat(&config.stream_id, &peer_id, stats);
            }
        }
    }
}

/// Returns true when the stream has ended and the session should wind down.
async fn handle_viewer_envelope(
    config: &SessionConfig,
    mesh: &MeshCoordinator,
    status_tx: &watch::Sender<ViewerStatus>,
    envelope: SignalEnvelope,
) -> bool {
    match envelope.kind {
        SignalKind::PeerList => {
            let payload: PeerListPayload = match serde_json::from_value(envelope.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Malformed peer list: {}", e);
                    return false;
                }
            };

            let known = mesh.known_peer_ids().await;
            for peer in &payload.peers {
                mesh.update_peer_score(&peer.id, peer.score).await;
            }

            // Best advertised peers first, capped by the open connection
            // slots. The coordinator itself never enforces the cap.
            let slots = config.stream.max_connections.saturating_sub(known.len());
            let mut candidates: Vec<_> = payload
                .peers
                .into_iter()
                .filter(|p| !known.contains(&p.id))
                .collect();
            candidates.sort_by(|a, b| b.score.cmp(&a.score));

            for peer in candidates.into_iter().take(slots.min(CONNECT_BATCH)) {
                if let Err(e) = mesh.connect(&peer.id, true).await {
                    warn!("Failed to open transport to {}: {}", peer.id, e);
                }
            }
            false
        }
        SignalKind::Offer | SignalKind::Answer | SignalKind::IceCandidate => {
            if let Err(e) = mesh.handle_signal(envelope).await {
                warn!("Failed to apply signal: {}", e);
            }
            false
        }
        SignalKind::StreamEnded => {
            info!("Stream {} ended", config.stream_id);
            status_tx.send_modify(|s| s.is_playing = false);
            true
        }
        _ => false,
    }
}

async fn handle_viewer_mesh_event(
    config: &SessionConfig,
    mesh: &MeshCoordinator,
    buffer: &Arc<Mutex<BufferManager>>,
    estimator: &mut BandwidthEstimator,
    status_tx: &watch::Sender<ViewerStatus>,
    event: MeshEvent,
) {
    match event {
        MeshEvent::PeerConnected(_) | MeshEvent::PeerDisconnected(_) => {
            let count = mesh.connected_peer_count().await;
            status_tx.send_modify(|s| s.peer_count = count);
        }
        MeshEvent::ChunkReceived { peer_id, meta, data } => {
            let meta = match meta {
                Some(meta) => meta,
                None => {
                    // A payload with no preceding metadata carries no index;
                    // nothing useful can be done with it.
                    debug!("Dropping unindexed payload from {}", peer_id);
                    return;
                }
            };

            estimator.add_sample(data.len() as u64, meta.duration_ms.max(1));

            let chunk = ChunkRecord {
                index: meta.index,
                stream_id: config.stream_id.clone(),
                payload: data,
                timestamp: meta.timestamp,
                duration_ms: meta.duration_ms,
                is_keyframe: meta.is_keyframe,
            };

            let (health_pct, oldest_retained) = {
                let mut buffer = buffer.lock().await;
                buffer.add_chunk(chunk);
                (
                    buffer.health().percentage,
                    buffer.available_indices().first().copied(),
                )
            };
            mesh.record_local_chunk(meta.index).await;
            if let Some(oldest) = oldest_retained {
                mesh.forget_local_chunks_below(oldest).await;
            }
            status_tx.send_modify(|s| s.buffer_health_pct = health_pct);
        }
        MeshEvent::ChunkRequested { peer_id, index } => {
            // Viewers redistribute too: serve anything still buffered.
            let chunk = buffer.lock().await.chunk(index).cloned();
            match chunk {
                Some(chunk) => {
                    mesh.send_chunk_to_peer(&peer_id, &chunk).await;
                }
                None => debug!("Cannot serve chunk {}: not buffered", index),
            }
        }
        MeshEvent::TransportError { peer_id, reason } => {
            warn!("Transport to {} failed: {}", peer_id, reason);
            status_tx.send_modify(|s| s.last_error = Some(reason));
        }
        _ => {}
    }
}
