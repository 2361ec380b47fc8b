//! State synchronization between live nodes.

use std::collections::HashMap;
use std::time::Duration;

use tokio::net::UdpSocket;

use fieldlink_proto::{
    Channel, Frame, PacketHeader, PacketType, StateSyncMessage, StateVersion,
};

use fieldlink_mesh::MeshEngine;

use crate::test_utils::{current_timestamp_ms, loopback_config, seed_each_other, wait_for};

#[tokio::test]
async fn test_channel_reaches_peer_via_targeted_push() {
    let mut cfg_a = loopback_config("alpha", 49300, 49331);
    let mut cfg_b = loopback_config("bravo", 49320, 49331);
    seed_each_other(&mut cfg_a, &mut cfg_b);

    let mut a = MeshEngine::new(cfg_a);
    let mut b = MeshEngine::new(cfg_b);
    a.start().await.unwrap();
    b.start().await.unwrap();

    // Mutating alpha's state bumps its version; bravo's next announce
    // then advertises an older version and draws a full push.
    a.upsert_channel(Channel {
        id: "ops".to_string(),
        name: "Operations".to_string(),
    })
    .await;

    let b_ref = &b;
    let synced = wait_for(Duration::from_secs(5), move || async move {
        b_ref.channels().await.iter().any(|c| c.id == "ops")
    })
    .await;
    assert!(synced, "channel never propagated to peer");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_stale_sync_version_is_rejected() {
    let mut cfg_a = loopback_config("alpha", 49340, 49371);
    let mut cfg_b = loopback_config("bravo", 49360, 49371);
    seed_each_other(&mut cfg_a, &mut cfg_b);

    let mut a = MeshEngine::new(cfg_a);
    let mut b = MeshEngine::new(cfg_b);
    a.start().await.unwrap();
    b.start().await.unwrap();

    a.upsert_channel(Channel {
        id: "ops".to_string(),
        name: "Operations".to_string(),
    })
    .await;

    let b_ref = &b;
    let synced = wait_for(Duration::from_secs(5), move || async move {
        b_ref.channels().await.iter().any(|c| c.id == "ops")
    })
    .await;
    assert!(synced, "initial sync failed");

    // Inject a sync message claiming an older version of alpha's state.
    // Bravo has already accepted a newer one, so this must be discarded.
    let stale = StateSyncMessage::full(
        StateVersion {
            version: 1,
            timestamp_ms: current_timestamp_ms(),
            peer_id: a.local_peer_id().to_string(),
        },
        vec![Channel {
            id: "bogus".to_string(),
            name: "Should Not Appear".to_string(),
        }],
        HashMap::new(),
        Vec::new(),
    );
    let header = PacketHeader::new(999_999, PacketType::StateSync, current_timestamp_ms());
    let bytes = Frame::encode(&header, &serde_json::to_vec(&stale).unwrap()).unwrap();

    let injector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    injector.send_to(&bytes, ("127.0.0.1", 49370)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let channels = b.channels().await;
    assert!(
        !channels.iter().any(|c| c.id == "bogus"),
        "stale sync replaced newer state"
    );
    assert!(channels.iter().any(|c| c.id == "ops"));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_annotation_propagates_and_newest_wins() {
    let mut cfg_a = loopback_config("alpha", 49380, 49391);
    let mut cfg_b = loopback_config("bravo", 49385, 49391);
    seed_each_other(&mut cfg_a, &mut cfg_b);

    let mut a = MeshEngine::new(cfg_a);
    let mut b = MeshEngine::new(cfg_b);
    a.start().await.unwrap();
    b.start().await.unwrap();

    let now = current_timestamp_ms();
    a.send_annotation(fieldlink_proto::Annotation {
        id: "rally-1".to_string(),
        label: "Rally Point".to_string(),
        latitude: 34.05,
        longitude: -118.24,
        color: Some("#ff0000".to_string()),
        timestamp_ms: now,
    })
    .await
    .unwrap();

    let b_ref = &b;
    let synced = wait_for(Duration::from_secs(5), move || async move {
        b_ref.annotations().await.iter().any(|an| an.id == "rally-1")
    })
    .await;
    assert!(synced, "annotation never propagated");

    // An older edit of the same annotation must not win on either node.
    a.send_annotation(fieldlink_proto::Annotation {
        id: "rally-1".to_string(),
        label: "Outdated".to_string(),
        latitude: 0.0,
        longitude: 0.0,
        color: None,
        timestamp_ms: now - 10_000,
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let kept = a
        .annotations()
        .await
        .into_iter()
        .find(|an| an.id == "rally-1")
        .unwrap();
    assert_eq!(kept.label, "Rally Point");

    a.stop().await;
    b.stop().await;
}
