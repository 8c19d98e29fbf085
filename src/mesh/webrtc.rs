use crate::mesh::transport::{LinkEvent, TransportFactory, TransportLink};
use crate::signaling::messages::SignalKind;
use crate::utils::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use log::warn;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

const DATA_CHANNEL_LABEL: &str = "stream";

/// Builds data-channel transports over the `webrtc` crate. Offers, answers
/// and trickle ICE candidates surface as `SignalReady` events; the
/// coordinator relays them inside signaling envelopes.
pub struct WebRtcFactory {
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
        }
    }

    pub fn with_ice_servers(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn attach_channel_handlers(dc: &Arc<RTCDataChannel>, events: &mpsc::UnboundedSender<LinkEvent>) {
        let on_open = events.clone();
        dc.on_open(Box::new(move || {
            let _ = on_open.send(LinkEvent::Connected);
            Box::pin(async {})
        }));

        let on_message = events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = on_message.clone();
            Box::pin(async move {
                if msg.is_string {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => {
                            let _ = events.send(LinkEvent::Text(text));
                        }
                        Err(_) => {
                            let _ = events.send(LinkEvent::Binary(msg.data));
                        }
                    }
                } else {
                    let _ = events.send(LinkEvent::Binary(msg.data));
                }
            })
        }));

        let on_close = events.clone();
        dc.on_close(Box::new(move || {
            let _ = on_close.send(LinkEvent::Disconnected);
            Box::pin(async {})
        }));
    }
}

impl Default for WebRtcFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(
        &self,
        _local_peer_id: &str,
        _remote_peer_id: &str,
        initiator: bool,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn TransportLink>> {
        let api = APIBuilder::new().build();
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Failed => {
                        let _ = events.send(LinkEvent::Failed("peer connection failed".to_string()));
                    }
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                        let _ = events.send(LinkEvent::Disconnected);
                    }
                    _ => {}
                }
            })
        }));

        let ice_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = ice_events.clone();
            Box::pin(async move {
                let candidate = match candidate {
                    Some(candidate) => candidate,
                    None => return,
                };
                match candidate.to_json() {
                    Ok(init) => match serde_json::to_value(&init) {
                        Ok(value) => {
                            let _ = events.send(LinkEvent::SignalReady {
                                kind: SignalKind::IceCandidate,
                                payload: json!({ "candidate": value }),
                            });
                        }
                        Err(e) => warn!("Failed to encode ICE candidate: {}", e),
                    },
                    Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        let channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>> = Arc::new(RwLock::new(None));

        if initiator {
            let dc = pc.create_data_channel(DATA_CHANNEL_LABEL, None).await?;
            Self::attach_channel_handlers(&dc, &events);
            *channel.write().await = Some(dc);
        } else {
            let dc_events = events.clone();
            let dc_slot = channel.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = dc_events.clone();
                let slot = dc_slot.clone();
                Box::pin(async move {
                    WebRtcFactory::attach_channel_handlers(&dc, &events);
                    *slot.write().await = Some(dc);
                })
            }));
        }

        let link = Arc::new(WebRtcLink {
            peer_connection: pc.clone(),
            channel,
            events: events.clone(),
        });

        if initiator {
            let offer = pc.create_offer(None).await?;
            pc.set_local_description(offer.clone()).await?;
            let _ = events.send(LinkEvent::SignalReady {
                kind: SignalKind::Offer,
                payload: json!({ "sdp": offer }),
            });
        }

        Ok(link)
    }
}

struct WebRtcLink {
    peer_connection: Arc<RTCPeerConnection>,
    channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

#[async_trait]
impl TransportLink for WebRtcLink {
    async fn apply_signal(&self, payload: Value) -> Result<()> {
        if let Some(sdp) = payload.get("sdp") {
            let desc: RTCSessionDescription = serde_json::from_value(sdp.clone())?;
            match desc.sdp_type {
                RTCSdpType::Offer => {
                    self.peer_connection.set_remote_description(desc).await?;
                    let answer = self.peer_connection.create_answer(None).await?;
                    self.peer_connection
                        .set_local_description(answer.clone())
                        .await?;
                    let _ = self.events.send(LinkEvent::SignalReady {
                        kind: SignalKind::Answer,
                        payload: json!({ "sdp": answer }),
                    });
                }
                RTCSdpType::Answer => {
                    self.peer_connection.set_remote_description(desc).await?;
                }
                other => warn!("Ignoring session description of type {}", other),
            }
            return Ok(());
        }

        if let Some(candidate) = payload.get("candidate") {
            let init: RTCIceCandidateInit = serde_json::from_value(candidate.clone())?;
            if let Err(e) = self.peer_connection.add_ice_candidate(init).await {
                warn!("Could not add ICE candidate: {}", e);
            }
            return Ok(());
        }

        Err(Error::Transport(
            "signal payload carries neither sdp nor candidate".to_string(),
        ))
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let channel = self.channel.read().await;
        let dc = channel
            .as_ref()
            .ok_or_else(|| Error::Transport("data channel not open".to_string()))?;
        dc.send_text(text).await?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        let channel = self.channel.read().await;
        let dc = channel
            .as_ref()
            .ok_or_else(|| Error::Transport("data channel not open".to_string()))?;
        dc.send(&data).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection.close().await?;
        Ok(())
    }
}
