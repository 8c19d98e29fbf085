use crate::signaling::messages::{HeartbeatPayload, JoinPayload, SignalEnvelope, SignalKind};
use crate::types::StatsUpdate;
use crate::utils::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use log::warn;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Client side of the signaling relay link. The WebSocket is split into a
/// writer task and a reader task bridged by channels, so sessions and the
/// mesh coordinator can both hold senders without touching the socket.
pub struct RelayClient {
    outgoing: mpsc::UnboundedSender<SignalEnvelope>,
    incoming: mpsc::UnboundedReceiver<SignalEnvelope>,
}

impl RelayClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<SignalEnvelope>();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(envelope) = outgoing_rx.recv().await {
                match serde_json::to_string(&envelope) {
                    Ok(json) => {
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to serialize outgoing envelope: {}", e),
                }
            }
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(_) => break,
                };
                if let Message::Text(text) = msg {
                    match serde_json::from_str::<SignalEnvelope>(&text) {
                        Ok(envelope) => {
                            if incoming_tx.send(envelope).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Ignoring malformed envelope from relay: {}", e),
                    }
                }
            }
        });

        Ok(Self { outgoing, incoming })
    }

    pub fn send(&self, envelope: SignalEnvelope) -> Result<()> {
        self.outgoing
            .send(envelope)
            .map_err(|_| Error::Signaling("relay link is closed".to_string()))
    }

    /// Returns None once the relay connection is gone.
    pub async fn recv(&mut self) -> Option<SignalEnvelope> {
        self.incoming.recv().await
    }

    /// A sender the mesh coordinator can emit envelopes into directly.
    pub fn sender(&self) -> mpsc::UnboundedSender<SignalEnvelope> {
        self.outgoing.clone()
    }

    pub fn join(&self, stream_id: &str, peer_id: &str, is_streamer: bool) -> Result<()> {
        self.send(SignalEnvelope::new(
            SignalKind::JoinStream,
            json!(JoinPayload {
                stream_id: stream_id.to_string(),
                peer_id: peer_id.to_string(),
                is_streamer,
            }),
            peer_id,
            None,
            stream_id,
        ))
    }

    pub fn leave(&self, stream_id: &str, peer_id: &str) -> Result<()> {
        self.send(SignalEnvelope::new(
            SignalKind::LeaveStream,
            json!({}),
            peer_id,
            None,
            stream_id,
        ))
    }

    pub fn heartbeat(&self, stream_id: &str, peer_id: &str, stats: StatsUpdate) -> Result<()> {
        self.send(SignalEnvelope::new(
            SignalKind::Heartbeat,
            json!(HeartbeatPayload {
                peer_id: peer_id.to_string(),
                stream_id: stream_id.to_string(),
                stats,
            }),
            peer_id,
            None,
            stream_id,
        ))
    }
}
