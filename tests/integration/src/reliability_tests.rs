//! Reliable delivery: ack resolution and retry exhaustion.

use std::collections::HashSet;
use std::time::Duration;

use tokio::net::UdpSocket;

use fieldlink_proto::{DiscoveryAnnounce, Frame, PacketHeader, PacketType};

use fieldlink_mesh::{MeshEngine, MeshEvent};

use crate::test_utils::{current_timestamp_ms, loopback_config, seed_each_other, wait_for};

/// Introduce a fabricated peer to an engine by sending one announce from
/// a raw socket. The engine records the source address as the peer, so
/// later reliable sends target ports derived from it.
async fn introduce_ghost_peer(discovery_port: u16) -> (UdpSocket, String) {
    let ghost = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let announce = DiscoveryAnnounce {
        nickname: "ghost".to_string(),
        capabilities: HashSet::new(),
        known_peers: HashSet::new(),
        network_quality: 1.0,
        last_state_version: 0,
    };
    let header = PacketHeader::new(1, PacketType::Discovery, current_timestamp_ms());
    let bytes = Frame::encode(&header, &serde_json::to_vec(&announce).unwrap()).unwrap();
    ghost
        .send_to(&bytes, ("127.0.0.1", discovery_port))
        .await
        .unwrap();

    let ghost_id = format!("127.0.0.1:{}", ghost.local_addr().unwrap().port());
    (ghost, ghost_id)
}

#[tokio::test]
async fn test_retry_exhaustion_empties_pending_and_records_loss() {
    let cfg = loopback_config("alpha", 49400, 49431);
    let mut a = MeshEngine::new(cfg);
    a.start().await.unwrap();

    // The ghost never acks anything.
    let (_ghost, ghost_id) = introduce_ghost_peer(49400).await;

    let a_ref = &a;
    let ghost_ref = &ghost_id;
    let known = wait_for(Duration::from_secs(3), move || async move {
        a_ref.peers().await.iter().any(|p| &p.peer_id == ghost_ref)
    })
    .await;
    assert!(known, "ghost announce was not processed");

    a.send_location(34.05, -118.24).await.unwrap();

    // With max_retries=2 and retry_delay=100ms the budget is exhausted
    // well within the timeout, leaving nothing pending.
    let drained = wait_for(Duration::from_secs(3), move || async move {
        a_ref.pending_ack_count().await == 0
    })
    .await;
    assert!(drained, "pending-ack table never drained");

    let lost = wait_for(Duration::from_secs(2), move || async move {
        a_ref
            .metrics_for(ghost_ref)
            .await
            .is_some_and(|m| m.packet_loss > 0.0)
    })
    .await;
    assert!(lost, "failed delivery was not reflected in packet loss");

    a.stop().await;
}

#[tokio::test]
async fn test_acked_delivery_leaves_no_loss() {
    let mut cfg_a = loopback_config("alpha", 49440, 49471);
    let mut cfg_b = loopback_config("bravo", 49460, 49471);
    seed_each_other(&mut cfg_a, &mut cfg_b);

    let mut a = MeshEngine::new(cfg_a);
    let mut b = MeshEngine::new(cfg_b);
    let mut b_events = b.subscribe();

    a.start().await.unwrap();
    b.start().await.unwrap();

    let (a_ref, b_ref) = (&a, &b);
    let found = wait_for(Duration::from_secs(5), move || async move {
        a_ref
            .peers()
            .await
            .iter()
            .any(|p| p.peer_id == b_ref.local_peer_id())
    })
    .await;
    assert!(found, "discovery failed");

    a.send_location(40.71, -74.00).await.unwrap();

    // Bravo observes the update through its event bus.
    let a_id = a.local_peer_id().to_string();
    let observed = tokio::time::timeout(Duration::from_secs(3), async move {
        loop {
            match b_events.recv().await.unwrap() {
                MeshEvent::LocationUpdated(update) if update.peer_id == a_id => {
                    return update;
                }
                _ => continue,
            }
        }
    })
    .await
    .expect("location update never observed");
    assert!((observed.latitude - 40.71).abs() < f64::EPSILON);

    // The ack resolved the pending entry; no loss charged to bravo.
    let drained = wait_for(Duration::from_secs(3), move || async move {
        a_ref.pending_ack_count().await == 0
    })
    .await;
    assert!(drained, "ack never resolved the pending entry");

    if let Some(metrics) = a.metrics_for(b.local_peer_id()).await {
        assert!((metrics.packet_loss - 0.0).abs() < f64::EPSILON);
    }

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_duplicate_packets_are_suppressed() {
    let cfg_b = loopback_config("bravo", 49485, 49491);

    let mut b = MeshEngine::new(cfg_b);
    let mut b_events = b.subscribe();
    b.start().await.unwrap();

    // Replay the same annotation frame three times from one socket.
    let replayer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let annotation = fieldlink_proto::Annotation {
        id: "dup-1".to_string(),
        label: "Checkpoint".to_string(),
        latitude: 1.0,
        longitude: 2.0,
        color: None,
        timestamp_ms: current_timestamp_ms(),
    };
    let payload =
        serde_json::to_vec(&fieldlink_proto::AnnotationMessage { annotation }).unwrap();
    let header = PacketHeader::new(42, PacketType::Annotation, current_timestamp_ms());
    let bytes = Frame::encode(&header, &payload).unwrap();
    for _ in 0..3 {
        replayer.send_to(&bytes, ("127.0.0.1", 49491)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Exactly one AnnotationUpdated event may surface.
    let mut seen = 0;
    while let Ok(event) =
        tokio::time::timeout(Duration::from_millis(500), b_events.recv()).await
    {
        if matches!(event.unwrap(), MeshEvent::AnnotationUpdated(_)) {
            seen += 1;
        }
    }
    assert_eq!(seen, 1, "duplicate packets were not suppressed");

    b.stop().await;
}
