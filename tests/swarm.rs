use bytes::Bytes;
use p2p_stream::client::RelayClient;
use p2p_stream::config::RelayConfig;
use p2p_stream::mesh::memory::{MemoryFactory, MemoryHub};
use p2p_stream::session::{BroadcastSession, SessionConfig, ViewerSession};
use p2p_stream::signaling::messages::{SignalEnvelope, SignalKind};
use p2p_stream::signaling::RelayServer;
use p2p_stream::types::{StatsUpdate, StreamConfig};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_test::assert_ok;

async fn start_relay() -> (SocketAddr, Arc<p2p_stream::signaling::RoomRegistry>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::new(RelayConfig::default());
    let registry = server.registry();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (addr, registry)
}

fn relay_url(addr: SocketAddr) -> String {
    format!("ws://{}", addr)
}

/// Receives envelopes until one of the wanted kind arrives.
async fn recv_kind(client: &mut RelayClient, kind: SignalKind) -> SignalEnvelope {
    timeout(Duration::from_secs(2), async {
        loop {
            let envelope = client.recv().await.expect("relay connection closed");
            if envelope.kind == kind {
                return envelope;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {:?}", kind))
}

#[tokio::test]
async fn relay_routes_join_signal_and_departure_notices() {
    let (addr, registry) = start_relay().await;

    let mut streamer = RelayClient::connect(&relay_url(addr)).await.unwrap();
    assert_ok!(streamer.join("demo", "cam", true));
    let list = recv_kind(&mut streamer, SignalKind::PeerList).await;
    assert_eq!(list.payload["peers"].as_array().unwrap().len(), 0);

    let mut viewer = RelayClient::connect(&relay_url(addr)).await.unwrap();
    assert_ok!(viewer.join("demo", "v1", false));

    // The joiner's list excludes itself and carries the neutral score.
    let list = recv_kind(&mut viewer, SignalKind::PeerList).await;
    let peers = list.payload["peers"].as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["id"], "cam");
    assert_eq!(peers[0]["score"], 50);
    assert_eq!(peers[0]["isStreamer"], true);

    // Existing members learn about the newcomer the same way.
    let list = recv_kind(&mut streamer, SignalKind::PeerList).await;
    let peers = list.payload["peers"].as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["id"], "v1");

    // A targeted offer reaches only its addressee.
    viewer
        .send(SignalEnvelope::new(
            SignalKind::Offer,
            json!({"sdp": "fake"}),
            "v1",
            Some("cam"),
            "demo",
        ))
        .unwrap();
    let offer = recv_kind(&mut streamer, SignalKind::Offer).await;
    assert_eq!(offer.from, "v1");
    assert_eq!(offer.payload["sdp"], "fake");

    // Streamer departure: remaining members get both notices, and the room
    // stops being listed live.
    streamer.leave("demo", "cam").unwrap();
    let notice = recv_kind(&mut viewer, SignalKind::PeerDisconnected).await;
    assert_eq!(notice.payload["peerId"], "cam");
    recv_kind(&mut viewer, SignalKind::StreamEnded).await;

    assert!(!registry.is_live("demo").await);
    assert!(registry.live_streams().await.is_empty());

    // Last member out destroys the room entirely.
    viewer.leave("demo", "v1").unwrap();
    timeout(Duration::from_secs(2), async {
        while registry.room_exists("demo").await {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("room survived its last member");
}

#[tokio::test]
async fn heartbeat_stats_show_up_in_later_peer_lists() {
    let (addr, _registry) = start_relay().await;

    let mut first = RelayClient::connect(&relay_url(addr)).await.unwrap();
    first.join("demo", "p1", false).unwrap();
    recv_kind(&mut first, SignalKind::PeerList).await;

    first
        .heartbeat(
            "demo",
            "p1",
            StatsUpdate {
                upload_bandwidth: Some(1000),
                latency: Some(40),
                packets_lost: Some(2),
                ..Default::default()
            },
        )
        .unwrap();
    // Heartbeats ride a different connection than the join below; give the
    // relay a beat to apply it.
    sleep(Duration::from_millis(200)).await;

    let mut second = RelayClient::connect(&relay_url(addr)).await.unwrap();
    second.join("demo", "p2", false).unwrap();
    let list = recv_kind(&mut second, SignalKind::PeerList).await;
    let peers = list.payload["peers"].as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["id"], "p1");
    // round((50 + 60 + 80) / 3)
    assert_eq!(peers[0]["score"], 63);
}

#[tokio::test]
async fn broadcast_reaches_viewer_end_to_end() {
    let (addr, _registry) = start_relay().await;
    let hub = MemoryHub::new();

    let config = SessionConfig {
        relay_url: relay_url(addr),
        stream_id: "live".to_string(),
        stream: StreamConfig::default(),
    };

    let (capture_tx, capture_rx) = tokio::sync::mpsc::channel(16);
    let broadcaster = BroadcastSession::start_with_factory(
        config.clone(),
        capture_rx,
        Arc::new(MemoryFactory::new(hub.clone())),
    )
    .await
    .unwrap();

    let viewer = ViewerSession::start_with_factory(
        config.clone(),
        Arc::new(MemoryFactory::new(hub.clone())),
    )
    .await
    .unwrap();

    // Feed the capture source; chunks flow segmenter -> mesh -> buffer.
    for i in 0..6u8 {
        capture_tx
            .send(Bytes::from(vec![i; 64]))
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;
    }

    let first = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(chunk) = viewer.next_playable().await {
                return chunk;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("no chunk reached the viewer");

    assert_eq!(first.index, 0);
    assert_eq!(&first.payload[..], &[0u8; 64][..]);

    let mut broadcaster_status = broadcaster.status();
    let status = broadcaster_status.borrow_and_update().clone();
    assert!(status.is_live);
    assert_eq!(status.viewer_count, 1);

    let viewer_status = viewer.status().borrow().clone();
    assert_eq!(viewer_status.peer_count, 1);
    assert!(viewer_status.is_playing);
    assert!(viewer_status.buffer_health_pct > 0.0);

    // Stopping the broadcast ends the stream for the viewer via the relay.
    broadcaster.stop();
    let mut viewer_status_rx = viewer.status();
    timeout(Duration::from_secs(5), async {
        loop {
            if !viewer_status_rx.borrow_and_update().is_playing {
                break;
            }
            if viewer_status_rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .expect("viewer never observed stream end");
    assert!(!viewer.status().borrow().is_playing);
}

#[tokio::test]
async fn viewer_replenishes_missing_chunks_from_the_mesh() {
    let (addr, _registry) = start_relay().await;
    let hub = MemoryHub::new();

    let config = SessionConfig {
        relay_url: relay_url(addr),
        stream_id: "live-2".to_string(),
        stream: StreamConfig::default(),
    };

    let (capture_tx, capture_rx) = tokio::sync::mpsc::channel(16);
    let _broadcaster = BroadcastSession::start_with_factory(
        config.clone(),
        capture_rx,
        Arc::new(MemoryFactory::new(hub.clone())),
    )
    .await
    .unwrap();

    // A late viewer misses the first chunks and must pull them via
    // request-chunk; the broadcaster serves them from its recent store.
    for i in 0..3u8 {
        capture_tx.send(Bytes::from(vec![i; 32])).await.unwrap();
        sleep(Duration::from_millis(30)).await;
    }

    let viewer = ViewerSession::start_with_factory(
        config.clone(),
        Arc::new(MemoryFactory::new(hub.clone())),
    )
    .await
    .unwrap();
    sleep(Duration::from_millis(200)).await;

    for i in 3..6u8 {
        capture_tx.send(Bytes::from(vec![i; 32])).await.unwrap();
        sleep(Duration::from_millis(30)).await;
    }

    // Playback must start at index 0, which only replenishment can supply.
    let first = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(chunk) = viewer.next_playable().await {
                return chunk;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("viewer never recovered the missed chunks");

    assert_eq!(first.index, 0);
    assert_eq!(&first.payload[..], &[0u8; 32][..]);
}
