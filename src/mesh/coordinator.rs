use crate::mesh::protocol::{ChunkMeta, PeerMessage};
use crate::mesh::transport::{LinkEvent, PeerState, TransportFactory, TransportLink};
use crate::signaling::messages::{SignalEnvelope, SignalKind};
use crate::types::ChunkRecord;
use crate::utils::Result;
use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub local_peer_id: String,
    pub stream_id: String,
}

/// What the mesh surfaces to its owning session. Chunk bytes arrive paired
/// with the metadata message that preceded them on the same transport;
/// a payload with no pending metadata surfaces with `meta: None`.
#[derive(Debug)]
pub enum MeshEvent {
    PeerConnected(String),
    PeerDisconnected(String),
    ChunkMapUpdated {
        peer_id: String,
        chunks: Vec<u64>,
    },
    ChunkRequested {
        peer_id: String,
        index: u64,
    },
    ChunkReceived {
        peer_id: String,
        meta: Option<ChunkMeta>,
        data: Bytes,
    },
    TransportError {
        peer_id: String,
        reason: String,
    },
}

struct PeerHandle {
    link: Arc<dyn TransportLink>,
    state: PeerState,
    pending_meta: Option<ChunkMeta>,
}

/// Owns the set of peer transports for one local participant: connection
/// lifecycles, per-peer chunk inventories, cached scores, and the control
/// protocol. Transports operate independently; ordering holds only within
/// one transport's byte stream.
#[derive(Clone)]
pub struct MeshCoordinator {
    config: Arc<MeshConfig>,
    factory: Arc<dyn TransportFactory>,
    peers: Arc<RwLock<HashMap<String, PeerHandle>>>,
    inventory: Arc<RwLock<HashMap<String, BTreeSet<u64>>>>,
    scores: Arc<RwLock<HashMap<String, u32>>>,
    local_chunks: Arc<RwLock<BTreeSet<u64>>>,
    signal_tx: mpsc::UnboundedSender<SignalEnvelope>,
    events: mpsc::UnboundedSender<MeshEvent>,
}

impl MeshCoordinator {
    pub fn new(
        config: MeshConfig,
        factory: Arc<dyn TransportFactory>,
        signal_tx: mpsc::UnboundedSender<SignalEnvelope>,
    ) -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                config: Arc::new(config),
                factory,
                peers: Arc::new(RwLock::new(HashMap::new())),
                inventory: Arc::new(RwLock::new(HashMap::new())),
                scores: Arc::new(RwLock::new(HashMap::new())),
                local_chunks: Arc::new(RwLock::new(BTreeSet::new())),
                signal_tx,
                events,
            },
            rx,
        )
    }

    /// Opens a transport toward a peer. Idempotent: an existing transport,
    /// connecting or connected, is left alone. Returns immediately; readiness
    /// arrives as a `PeerConnected` event.
    pub async fn connect(&self, peer_id: &str, initiator: bool) -> Result<()> {
        if self.peers.read().await.contains_key(peer_id) {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let link = self
            .factory
            .create(&self.config.local_peer_id, peer_id, initiator, tx)
            .await?;

        let raced = {
            let mut peers = self.peers.write().await;
            if peers.contains_key(peer_id) {
                true
            } else {
                peers.insert(
                    peer_id.to_string(),
                    PeerHandle {
                        link: link.clone(),
                        state: PeerState::Connecting,
                        pending_meta: None,
                    },
                );
                false
            }
        };
        if raced {
            let _ = link.close().await;
            return Ok(());
        }

        debug!("Opening transport to {} (initiator: {})", peer_id, initiator);
        let mesh = self.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            let mut rx = rx;
            while let Some(event) = rx.recv().await {
                let terminal = matches!(event, LinkEvent::Disconnected | LinkEvent::Failed(_));
                mesh.on_link_event(&peer_id, event).await;
                if terminal {
                    break;
                }
            }
        });

        Ok(())
    }

    /// Feeds a relayed connection-setup envelope into the right transport.
    /// An offer creates the non-initiator side; answers and candidates for
    /// unknown peers are a no-op.
    pub async fn handle_signal(&self, envelope: SignalEnvelope) -> Result<()> {
        match envelope.kind {
            SignalKind::Offer => {
                self.connect(&envelope.from, false).await?;
                if let Some(link) = self.link_for(&envelope.from).await {
                    link.apply_signal(envelope.payload).await?;
                }
                Ok(())
            }
            SignalKind::Answer | SignalKind::IceCandidate => {
                if let Some(link) = self.link_for(&envelope.from).await {
                    link.apply_signal(envelope.payload).await?;
                }
                Ok(())
            }
            other => {
                debug!("Mesh ignoring signal kind {:?}", other);
                Ok(())
            }
        }
    }

    async fn link_for(&self, peer_id: &str) -> Option<Arc<dyn TransportLink>> {
        self.peers.read().await.get(peer_id).map(|h| h.link.clone())
    }

    async fn on_link_event(&self, peer_id: &str, event: LinkEvent) {
        match event {
            LinkEvent::Connected => {
                if let Some(handle) = self.peers.write().await.get_mut(peer_id) {
                    handle.state = PeerState::Connected;
                }
                info!("Peer {} connected", peer_id);
                let _ = self
                    .events
                    .send(MeshEvent::PeerConnected(peer_id.to_string()));
                self.send_message(peer_id, &PeerMessage::RequestChunkMap)
                    .await;
            }
            LinkEvent::Disconnected => {
                self.drop_peer(peer_id).await;
            }
            LinkEvent::Failed(reason) => {
                warn!("Transport to {} failed: {}", peer_id, reason);
                let _ = self.events.send(MeshEvent::TransportError {
                    peer_id: peer_id.to_string(),
                    reason,
                });
                self.drop_peer(peer_id).await;
            }
            LinkEvent::SignalReady { kind, payload } => {
                let envelope = SignalEnvelope::new(
                    kind,
                    payload,
                    &self.config.local_peer_id,
                    Some(peer_id),
                    &self.config.stream_id,
                );
                let _ = self.signal_tx.send(envelope);
            }
            LinkEvent::Text(text) => match PeerMessage::parse(&text) {
                Some(message) => self.dispatch(peer_id, message).await,
                // Not a control message: treat it as a raw chunk payload.
                None => self.incoming_chunk(peer_id, Bytes::from(text)).await,
            },
            LinkEvent::Binary(data) => {
                self.incoming_chunk(peer_id, data).await;
            }
        }
    }

    async fn dispatch(&self, peer_id: &str, message: PeerMessage) {
        match message {
            PeerMessage::ChunkMap { chunks } => {
                self.inventory
                    .write()
                    .await
                    .insert(peer_id.to_string(), chunks.iter().copied().collect());
                let _ = self.events.send(MeshEvent::ChunkMapUpdated {
                    peer_id: peer_id.to_string(),
                    chunks,
                });
            }
            PeerMessage::RequestChunkMap => {
                let chunks: Vec<u64> = self.local_chunks.read().await.iter().copied().collect();
                self.send_message(peer_id, &PeerMessage::ChunkMap { chunks })
                    .await;
            }
            PeerMessage::RequestChunk { chunk_index } => {
                // The coordinator cannot produce chunk bytes; the owning
                // session answers from its own store.
                let _ = self.events.send(MeshEvent::ChunkRequested {
                    peer_id: peer_id.to_string(),
                    index: chunk_index,
                });
            }
            PeerMessage::ChunkMeta(meta) => {
                if let Some(handle) = self.peers.write().await.get_mut(peer_id) {
                    handle.pending_meta = Some(meta);
                }
            }
        }
    }

    async fn incoming_chunk(&self, peer_id: &str, data: Bytes) {
        let meta = match self.peers.write().await.get_mut(peer_id) {
            Some(handle) => handle.pending_meta.take(),
            None => None,
        };
        let _ = self.events.send(MeshEvent::ChunkReceived {
            peer_id: peer_id.to_string(),
            meta,
            data,
        });
    }

    async fn drop_peer(&self, peer_id: &str) {
        let removed = self.peers.write().await.remove(peer_id).is_some();
        self.inventory.write().await.remove(peer_id);
        self.scores.write().await.remove(peer_id);
        if removed {
            info!("Peer {} disconnected", peer_id);
            let _ = self
                .events
                .send(MeshEvent::PeerDisconnected(peer_id.to_string()));
        }
    }

    /// Peers known to hold `index`, best cached score first. Peers without
    /// a cached score rank at the neutral 50.
    pub async fn best_peers_for_chunk(&self, index: u64, count: usize) -> Vec<String> {
        let inventory = self.inventory.read().await;
        let scores = self.scores.read().await;

        let mut holders: Vec<(String, u32)> = inventory
            .iter()
            .filter(|(_, chunks)| chunks.contains(&index))
            .map(|(peer_id, _)| {
                (
                    peer_id.clone(),
                    scores.get(peer_id).copied().unwrap_or(50),
                )
            })
            .collect();

        holders.sort_by(|a, b| b.1.cmp(&a.1));
        holders.into_iter().take(count).map(|(id, _)| id).collect()
    }

    /// Asks the single best-scoring holder for a chunk. False when no
    /// holder is known or the request could not be sent; the caller retries
    /// on its next replenishment pass.
    pub async fn request_chunk(&self, index: u64) -> bool {
        let best = self.best_peers_for_chunk(index, 1).await;
        match best.first() {
            Some(peer_id) => {
                self.send_message(peer_id, &PeerMessage::RequestChunk { chunk_index: index })
                    .await
            }
            None => false,
        }
    }

    /// Chunk transmission is always metadata message then payload, in that
    /// order, on the same transport: payloads are never embedded in the
    /// control protocol.
    pub async fn send_chunk_to_peer(&self, peer_id: &str, chunk: &ChunkRecord) -> bool {
        let link = match self.connected_link(peer_id).await {
            Some(link) => link,
            None => return false,
        };

        let meta = PeerMessage::ChunkMeta(ChunkMeta::from(chunk));
        let text = match meta.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode chunk metadata: {}", e);
                return false;
            }
        };

        if let Err(e) = link.send_text(text).await {
            debug!("Failed to send chunk meta to {}: {}", peer_id, e);
            return false;
        }
        if let Err(e) = link.send_binary(chunk.payload.clone()).await {
            debug!("Failed to send chunk payload to {}: {}", peer_id, e);
            return false;
        }
        true
    }

    pub async fn broadcast_chunk(&self, chunk: &ChunkRecord) {
        for peer_id in self.connected_peer_ids().await {
            self.send_chunk_to_peer(&peer_id, chunk).await;
        }
    }

    async fn connected_link(&self, peer_id: &str) -> Option<Arc<dyn TransportLink>> {
        self.peers
            .read()
            .await
            .get(peer_id)
            .filter(|h| h.state == PeerState::Connected)
            .map(|h| h.link.clone())
    }

    async fn send_message(&self, peer_id: &str, message: &PeerMessage) -> bool {
        let link = match self.connected_link(peer_id).await {
            Some(link) => link,
            None => return false,
        };
        let text = match message.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode control message: {}", e);
                return false;
            }
        };
        match link.send_text(text).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Failed to send control message to {}: {}", peer_id, e);
                false
            }
        }
    }

    /// Mirrors the local chunk store so request-chunk-map can be answered
    /// without asking the session.
    pub async fn record_local_chunk(&self, index: u64) {
        self.local_chunks.write().await.insert(index);
    }

    pub async fn forget_local_chunks_below(&self, min_index: u64) {
        let mut chunks = self.local_chunks.write().await;
        *chunks = chunks.split_off(&min_index);
    }

    pub async fn update_peer_score(&self, peer_id: &str, score: u32) {
        self.scores.write().await.insert(peer_id.to_string(), score);
    }

    pub async fn connected_peer_ids(&self) -> Vec<String> {
        self.peers
            .read()
            .await
            .iter()
            .filter(|(_, h)| h.state == PeerState::Connected)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn connected_peer_count(&self) -> usize {
        self.connected_peer_ids().await.len()
    }

    pub async fn known_peer_ids(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }

    /// Tears down every transport and clears all per-peer state. Idempotent.
    pub async fn destroy(&self) {
        let links: Vec<Arc<dyn TransportLink>> = {
            let mut peers = self.peers.write().await;
            peers.drain().map(|(_, handle)| handle.link).collect()
        };
        self.inventory.write().await.clear();
        self.scores.write().await.clear();
        self.local_chunks.write().await.clear();

        for link in links {
            let _ = link.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::memory::{MemoryFactory, MemoryHub};
    use std::time::Duration;
    use tokio::time::timeout;

    fn coordinator(
        id: &str,
        hub: &Arc<MemoryHub>,
    ) -> (
        MeshCoordinator,
        mpsc::UnboundedReceiver<MeshEvent>,
        mpsc::UnboundedReceiver<SignalEnvelope>,
    ) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (mesh, events) = MeshCoordinator::new(
            MeshConfig {
                local_peer_id: id.to_string(),
                stream_id: "s1".to_string(),
            },
            Arc::new(MemoryFactory::new(hub.clone())),
            signal_tx,
        );
        (mesh, events, signal_rx)
    }

    /// Forwards signaling envelopes between two coordinators, standing in
    /// for the relay.
    fn bridge(
        mut a_rx: mpsc::UnboundedReceiver<SignalEnvelope>,
        b: MeshCoordinator,
        mut b_rx: mpsc::UnboundedReceiver<SignalEnvelope>,
        a: MeshCoordinator,
    ) {
        tokio::spawn(async move {
            while let Some(env) = a_rx.recv().await {
                let _ = b.handle_signal(env).await;
            }
        });
        tokio::spawn(async move {
            while let Some(env) = b_rx.recv().await {
                let _ = a.handle_signal(env).await;
            }
        });
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<MeshEvent>) -> MeshEvent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for mesh event")
            .expect("event channel closed")
    }

    async fn wait_for_connected(rx: &mut mpsc::UnboundedReceiver<MeshEvent>) -> String {
        loop {
            if let MeshEvent::PeerConnected(id) = next_event(rx).await {
                return id;
            }
        }
    }

    #[tokio::test]
    async fn handshake_exchanges_chunk_maps() {
        let hub = MemoryHub::new();
        let (a, mut a_events, a_sig) = coordinator("a", &hub);
        let (b, mut b_events, b_sig) = coordinator("b", &hub);
        bridge(a_sig, b.clone(), b_sig, a.clone());

        a.record_local_chunk(1).await;
        a.record_local_chunk(2).await;

        a.connect("b", true).await.unwrap();

        assert_eq!(wait_for_connected(&mut a_events).await, "b");
        assert_eq!(wait_for_connected(&mut b_events).await, "a");

        // Both sides request the other's map on connect; b learns a's chunks.
        loop {
            if let MeshEvent::ChunkMapUpdated { peer_id, chunks } = next_event(&mut b_events).await
            {
                assert_eq!(peer_id, "a");
                assert_eq!(chunks, vec![1, 2]);
                break;
            }
        }

        assert_eq!(b.best_peers_for_chunk(1, 3).await, vec!["a".to_string()]);
        assert!(b.best_peers_for_chunk(9, 3).await.is_empty());
    }

    #[tokio::test]
    async fn chunk_request_and_delivery_pair_meta_with_payload() {
        let hub = MemoryHub::new();
        let (a, mut a_events, a_sig) = coordinator("a", &hub);
        let (b, mut b_events, b_sig) = coordinator("b", &hub);
        bridge(a_sig, b.clone(), b_sig, a.clone());

        a.record_local_chunk(7).await;
        a.connect("b", true).await.unwrap();
        wait_for_connected(&mut a_events).await;
        wait_for_connected(&mut b_events).await;

        // Wait until b knows a holds chunk 7, then ask for it.
        loop {
            if let MeshEvent::ChunkMapUpdated { .. } = next_event(&mut b_events).await {
                break;
            }
        }
        assert!(b.request_chunk(7).await);

        loop {
            if let MeshEvent::ChunkRequested { peer_id, index } = next_event(&mut a_events).await {
                assert_eq!(peer_id, "b");
                assert_eq!(index, 7);
                break;
            }
        }

        let chunk = ChunkRecord {
            index: 7,
            stream_id: "s1".to_string(),
            payload: Bytes::from_static(b"media"),
            timestamp: 123,
            duration_ms: 2000,
            is_keyframe: false,
        };
        assert!(a.send_chunk_to_peer("b", &chunk).await);

        loop {
            if let MeshEvent::ChunkReceived { peer_id, meta, data } = next_event(&mut b_events).await
            {
                assert_eq!(peer_id, "a");
                let meta = meta.expect("payload should pair with preceding metadata");
                assert_eq!(meta.index, 7);
                assert_eq!(meta.duration_ms, 2000);
                assert_eq!(&data[..], b"media");
                break;
            }
        }
    }

    #[tokio::test]
    async fn request_chunk_without_holder_returns_false() {
        let hub = MemoryHub::new();
        let (a, _events, _sig) = coordinator("a", &hub);
        assert!(!a.request_chunk(3).await);
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let hub = MemoryHub::new();
        let (a, mut a_events, a_sig) = coordinator("a", &hub);
        let (b, mut b_events, b_sig) = coordinator("b", &hub);
        bridge(a_sig, b.clone(), b_sig, a.clone());

        a.connect("b", true).await.unwrap();
        a.connect("b", true).await.unwrap();
        wait_for_connected(&mut a_events).await;
        wait_for_connected(&mut b_events).await;
        a.connect("b", true).await.unwrap();

        assert_eq!(a.connected_peer_count().await, 1);
        // One endpoint per side: repeated connects opened no extra links.
        assert_eq!(hub.endpoint_count(), 2);
    }

    #[tokio::test]
    async fn best_peers_rank_by_cached_score_with_neutral_default() {
        let hub = MemoryHub::new();
        let (a, _events, _sig) = coordinator("a", &hub);

        a.dispatch("p40", PeerMessage::ChunkMap { chunks: vec![7] })
            .await;
        a.dispatch("p90", PeerMessage::ChunkMap { chunks: vec![7] })
            .await;
        a.dispatch("p60", PeerMessage::ChunkMap { chunks: vec![7] })
            .await;
        a.dispatch("other", PeerMessage::ChunkMap { chunks: vec![8] })
            .await;
        a.update_peer_score("p40", 40).await;
        a.update_peer_score("p90", 90).await;
        a.update_peer_score("p60", 60).await;

        assert_eq!(
            a.best_peers_for_chunk(7, 2).await,
            vec!["p90".to_string(), "p60".to_string()]
        );

        // An unscored holder ranks at 50: above 40, below 60.
        a.dispatch("fresh", PeerMessage::ChunkMap { chunks: vec![7] })
            .await;
        assert_eq!(
            a.best_peers_for_chunk(7, 4).await,
            vec![
                "p90".to_string(),
                "p60".to_string(),
                "fresh".to_string(),
                "p40".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn disconnect_drops_inventory_and_score() {
        let hub = MemoryHub::new();
        let (a, mut a_events, a_sig) = coordinator("a", &hub);
        let (b, mut b_events, b_sig) = coordinator("b", &hub);
        bridge(a_sig, b.clone(), b_sig, a.clone());

        b.record_local_chunk(5).await;
        a.connect("b", true).await.unwrap();
        wait_for_connected(&mut a_events).await;
        wait_for_connected(&mut b_events).await;
        loop {
            if let MeshEvent::ChunkMapUpdated { .. } = next_event(&mut a_events).await {
                break;
            }
        }
        a.update_peer_score("b", 80).await;

        b.destroy().await;

        loop {
            if let MeshEvent::PeerDisconnected(id) = next_event(&mut a_events).await {
                assert_eq!(id, "b");
                break;
            }
        }
        assert!(a.best_peers_for_chunk(5, 3).await.is_empty());
        assert_eq!(a.connected_peer_count().await, 0);
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_clears_state() {
        let hub = MemoryHub::new();
        let (a, mut a_events, a_sig) = coordinator("a", &hub);
        let (b, mut b_events, b_sig) = coordinator("b", &hub);
        bridge(a_sig, b.clone(), b_sig, a.clone());

        a.record_local_chunk(1).await;
        a.connect("b", true).await.unwrap();
        wait_for_connected(&mut a_events).await;
        wait_for_connected(&mut b_events).await;

        a.destroy().await;
        a.destroy().await;

        assert_eq!(a.connected_peer_count().await, 0);
        assert!(a.known_peer_ids().await.is_empty());
    }
}
