use crate::signaling::messages::SignalKind;
use crate::utils::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Lifecycle of one remote peer inside the coordinator. Disconnected is
/// terminal; reconnecting means a fresh transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Connecting => write!(f, "connecting"),
            PeerState::Connected => write!(f, "connected"),
            PeerState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Events a transport link delivers on its per-peer channel. Ordering is
/// guaranteed only within one link, never across links.
#[derive(Debug)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    /// A locally generated connection-setup payload that must reach the
    /// remote peer through the signaling relay.
    SignalReady {
        kind: SignalKind,
        payload: Value,
    },
    Text(String),
    Binary(Bytes),
    Failed(String),
}

/// The capability a platform transport provides: accept externally relayed
/// signaling payloads, and carry structured text plus raw binary frames
/// in order on one connection.
#[async_trait]
pub trait TransportLink: Send + Sync {
    async fn apply_signal(&self, payload: Value) -> Result<()>;
    async fn send_text(&self, text: String) -> Result<()>;
    async fn send_binary(&self, data: Bytes) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Creates transport links. The coordinator never constructs links
/// directly, so tests can swap in the in-memory implementation.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        local_peer_id: &str,
        remote_peer_id: &str,
        initiator: bool,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn TransportLink>>;
}
