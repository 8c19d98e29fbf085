use crate::config::RelayConfig;
use crate::signaling::messages::{
    HeartbeatPayload, JoinPayload, PeerListPayload, PeerSummary, SignalEnvelope, SignalKind,
};
use crate::signaling::rooms::{PeerRecord, RoomRegistry};
use crate::signaling::scorer::{PeerScorer, STATS_TTL};
use crate::utils::{Error, Result};
use chrono::Utc;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde_json::json;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use warp::Filter;

const RELAY_PEER_ID: &str = "relay";

/// The rendezvous service: accepts WebSocket connections from coordinators,
/// maintains room membership, and routes signaling envelopes. Media never
/// passes through here.
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<RoomRegistry>,
    scorer: Arc<RwLock<PeerScorer>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            registry: Arc::new(RoomRegistry::new()),
            scorer: Arc::new(RwLock::new(PeerScorer::new())),
        }
    }

    pub fn registry(&self) -> Arc<RoomRegistry> {
        self.registry.clone()
    }

    /// Binds the configured ports and serves until the process exits.
    pub async fn run(&self) -> Result<()> {
        let listener =
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.config.relay_port)).await?;
        info!("Signaling relay listening on {}", listener.local_addr()?);

        self.spawn_http_server();
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener. The scorer's periodic
    /// cleanup tick lives here; the scorer itself owns no timer.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let scorer = self.scorer.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                scorer.write().cleanup(STATS_TTL);
            }
        });

        while let Ok((stream, addr)) = listener.accept().await {
            debug!("New relay connection from {}", addr);
            let registry = self.registry.clone();
            let scorer = self.scorer.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, registry, scorer).await {
                    warn!("Relay connection from {} closed with error: {}", addr, e);
                }
            });
        }

        Ok(())
    }

    fn spawn_http_server(&self) {
        let registry = self.registry.clone();
        let streams = warp::path!("streams").and(warp::get()).and_then(move || {
            let registry = registry.clone();
            async move {
                let list = registry.live_streams().await;
                Ok::<_, warp::Rejection>(warp::reply::json(&list))
            }
        });

        let scorer = self.scorer.clone();
        let peers = warp::path!("debug" / "peers").and(warp::get()).map(move || {
            let snapshot: Vec<_> = scorer
                .read()
                .tracked_peers()
                .into_iter()
                .map(|(id, score, age_secs)| {
                    json!({
                        "peerId": id,
                        "score": score,
                        "lastUpdatedSecsAgo": age_secs,
                    })
                })
                .collect();
            warp::reply::json(&snapshot)
        });

        let mut cors = warp::cors().allow_methods(vec!["GET"]);
        for origin in &self.config.allowed_origins {
            cors = cors.allow_origin(origin.as_str());
        }

        let routes = streams.or(peers).with(cors);
        let port = self.config.http_port;
        tokio::spawn(async move {
            warp::serve(routes).run((Ipv4Addr::UNSPECIFIED, port)).await;
        });
    }

    async fn handle_connection(
        stream: TcpStream,
        registry: Arc<RoomRegistry>,
        scorer: Arc<RwLock<PeerScorer>>,
    ) -> Result<()> {
        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // The connection task owns the sink; everything else enqueues frames.
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let mut current_stream_id: Option<String> = None;
        let mut current_peer_id: Option<String> = None;

        let result = Self::read_loop(
            &mut ws_receiver,
            &tx,
            &registry,
            &scorer,
            &mut current_stream_id,
            &mut current_peer_id,
        )
        .await;

        // Always clean up membership, even when the loop failed.
        if let (Some(stream_id), Some(peer_id)) = (current_stream_id, current_peer_id) {
            info!("Peer {} left stream {}", peer_id, stream_id);
            registry.leave(&stream_id, &peer_id).await;
        }

        result
    }

    async fn read_loop(
        ws_receiver: &mut SplitStream<WebSocketStream<TcpStream>>,
        tx: &mpsc::UnboundedSender<Message>,
        registry: &Arc<RoomRegistry>,
        scorer: &Arc<RwLock<PeerScorer>>,
        current_stream_id: &mut Option<String>,
        current_peer_id: &mut Option<String>,
    ) -> Result<()> {
        while let Some(msg) = ws_receiver.next().await {
            let msg = msg?;
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            // A frame that does not parse as an envelope is an explicit
            // reject: the connection drops with no room mutation.
            let envelope: SignalEnvelope = serde_json::from_str(&text)?;

            match envelope.kind {
                SignalKind::JoinStream => {
                    let payload: JoinPayload = serde_json::from_value(envelope.payload.clone())
                        .map_err(|e| Error::Signaling(format!("Malformed join payload: {}", e)))?;

                    info!(
                        "Peer {} joined stream {} (streamer: {})",
                        payload.peer_id, payload.stream_id, payload.is_streamer
                    );
                    *current_stream_id = Some(payload.stream_id.clone());
                    *current_peer_id = Some(payload.peer_id.clone());

                    registry
                        .join(
                            &payload.stream_id,
                            PeerRecord {
                                id: payload.peer_id.clone(),
                                is_streamer: payload.is_streamer,
                                joined_at: Utc::now(),
                                sender: tx.clone(),
                            },
                        )
                        .await;

                    Self::send_peer_lists(registry, scorer, &payload.stream_id).await;
                }
                SignalKind::LeaveStream => {
                    registry.leave(&envelope.stream_id, &envelope.from).await;
                    *current_stream_id = None;
                    *current_peer_id = None;
                }
                SignalKind::Heartbeat => {
                    match serde_json::from_value::<HeartbeatPayload>(envelope.payload.clone()) {
                        Ok(hb) => scorer.write().update_stats(&hb.peer_id, hb.stats),
                        Err(e) => warn!("Ignoring malformed heartbeat: {}", e),
                    }
                }
                SignalKind::Offer
                | SignalKind::Answer
                | SignalKind::IceCandidate
                | SignalKind::ChunkMap
                | SignalKind::RequestChunk => {
                    registry.route(&envelope).await;
                }
                SignalKind::PeerList | SignalKind::PeerDisconnected | SignalKind::StreamEnded => {
                    warn!(
                        "Ignoring relay-originated kind {:?} sent by peer {}",
                        envelope.kind, envelope.from
                    );
                }
            }
        }

        Ok(())
    }

    /// Sends every member a peer list excluding themselves, with current
    /// scores attached.
    async fn send_peer_lists(
        registry: &Arc<RoomRegistry>,
        scorer: &Arc<RwLock<PeerScorer>>,
        stream_id: &str,
    ) {
        let members = registry.members(stream_id).await;

        for member in &members {
            let peers: Vec<PeerSummary> = members
                .iter()
                .filter(|m| m.id != member.id)
                .map(|m| PeerSummary {
                    id: m.id.clone(),
                    score: scorer.read().score(&m.id),
                    is_streamer: m.is_streamer,
                })
                .collect();

            let envelope = SignalEnvelope::new(
                SignalKind::PeerList,
                json!(PeerListPayload { peers }),
                RELAY_PEER_ID,
                Some(&member.id),
                stream_id,
            );
            registry.send_to(stream_id, &member.id, &envelope).await;
        }
    }
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("relay_port", &self.config.relay_port)
            .field("http_port", &self.config.http_port)
            .finish()
    }
}
