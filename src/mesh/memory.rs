use crate::mesh::transport::{LinkEvent, TransportFactory, TransportLink};
use crate::signaling::messages::SignalKind;
use crate::utils::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Pairs in-memory links across coordinators in one process. Signaling
/// payloads still travel through the normal envelope path; only the media
/// plane is simulated. Used by tests and local loopback runs.
#[derive(Debug, Default)]
pub struct MemoryHub {
    inner: Mutex<HubInner>,
}

#[derive(Debug, Default)]
struct HubInner {
    endpoints: HashMap<String, mpsc::UnboundedSender<LinkEvent>>,
    routes: HashMap<String, String>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, key: &str, events: mpsc::UnboundedSender<LinkEvent>) {
        self.inner.lock().endpoints.insert(key.to_string(), events);
    }

    /// Wires both directions and tells both endpoints they are connected.
    fn pair(&self, a: &str, b: &str) {
        let mut inner = self.inner.lock();
        inner.routes.insert(a.to_string(), b.to_string());
        inner.routes.insert(b.to_string(), a.to_string());
        for key in [a, b] {
            if let Some(events) = inner.endpoints.get(key) {
                let _ = events.send(LinkEvent::Connected);
            }
        }
    }

    fn deliver(&self, from_key: &str, event: LinkEvent) -> Result<()> {
        let inner = self.inner.lock();
        let target = inner
            .routes
            .get(from_key)
            .ok_or_else(|| Error::Transport(format!("{} is not paired", from_key)))?;
        let events = inner
            .endpoints
            .get(target)
            .ok_or_else(|| Error::Transport(format!("{} has no endpoint", target)))?;
        events
            .send(event)
            .map_err(|_| Error::Transport(format!("{} stopped receiving", target)))
    }

    fn disconnect(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.endpoints.remove(key);
        if let Some(target) = inner.routes.remove(key) {
            inner.routes.remove(&target);
            if let Some(events) = inner.endpoints.get(&target) {
                let _ = events.send(LinkEvent::Disconnected);
            }
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.inner.lock().endpoints.len()
    }
}

pub struct MemoryFactory {
    hub: Arc<MemoryHub>,
}

impl MemoryFactory {
    pub fn new(hub: Arc<MemoryHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl TransportFactory for MemoryFactory {
    async fn create(
        &self,
        local_peer_id: &str,
        remote_peer_id: &str,
        initiator: bool,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn TransportLink>> {
        let key = format!("{}/{}", local_peer_id, remote_peer_id);
        let remote_key = format!("{}/{}", remote_peer_id, local_peer_id);
        self.hub.register(&key, events.clone());

        if initiator {
            let _ = events.send(LinkEvent::SignalReady {
                kind: SignalKind::Offer,
                payload: json!({ "endpoint": key, "handshake": "offer" }),
            });
        }

        Ok(Arc::new(MemoryLink {
            key,
            remote_key,
            hub: self.hub.clone(),
            events,
        }))
    }
}

struct MemoryLink {
    key: String,
    remote_key: String,
    hub: Arc<MemoryHub>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

#[async_trait]
impl TransportLink for MemoryLink {
    async fn apply_signal(&self, payload: Value) -> Result<()> {
        match payload.get("handshake").and_then(Value::as_str) {
            Some("offer") => {
                // The answering side completes the pairing for both ends.
                self.hub.pair(&self.key, &self.remote_key);
                let _ = self.events.send(LinkEvent::SignalReady {
                    kind: SignalKind::Answer,
                    payload: json!({ "endpoint": self.key, "handshake": "answer" }),
                });
                Ok(())
            }
            // The initiator learns of the pairing through its Connected
            // event; the answer itself carries nothing further.
            Some("answer") => Ok(()),
            _ => Err(Error::Transport("unrecognized memory handshake".to_string())),
        }
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.hub.deliver(&self.key, LinkEvent::Text(text))
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.hub.deliver(&self.key, LinkEvent::Binary(data))
    }

    async fn close(&self) -> Result<()> {
        self.hub.disconnect(&self.key);
        Ok(())
    }
}
