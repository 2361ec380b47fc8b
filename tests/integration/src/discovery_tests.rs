//! Two-node discovery and liveness over loopback.

use std::time::Duration;

use fieldlink_mesh::{MeshEngine, MeshEvent};

use crate::test_utils::{loopback_config, seed_each_other, wait_for};

#[tokio::test]
async fn test_two_nodes_discover_each_other() {
    let mut cfg_a = loopback_config("alpha", 49200, 49231);
    let mut cfg_b = loopback_config("bravo", 49220, 49231);
    seed_each_other(&mut cfg_a, &mut cfg_b);

    let mut a = MeshEngine::new(cfg_a);
    let mut b = MeshEngine::new(cfg_b);
    let mut a_events = a.subscribe();

    a.start().await.unwrap();
    b.start().await.unwrap();

    let (a_ref, b_ref) = (&a, &b);
    let found = wait_for(Duration::from_secs(5), move || async move {
        let a_sees = a_ref
            .peers()
            .await
            .iter()
            .any(|p| p.peer_id == b_ref.local_peer_id());
        let b_sees = b_ref
            .peers()
            .await
            .iter()
            .any(|p| p.peer_id == a_ref.local_peer_id());
        a_sees && b_sees
    })
    .await;
    assert!(found, "nodes failed to discover each other via seed peers");

    // The announce carries the advertised identity.
    let peers = a.peers().await;
    let bravo = peers
        .iter()
        .find(|p| p.peer_id == b.local_peer_id())
        .unwrap();
    assert_eq!(bravo.nickname.as_deref(), Some("bravo"));

    // Discovery must have surfaced at least one peer-list event.
    let event = tokio::time::timeout(Duration::from_secs(1), a_events.recv())
        .await
        .expect("no event within timeout")
        .unwrap();
    assert!(matches!(event, MeshEvent::PeerListChanged(_)));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_silent_peer_expires() {
    let mut cfg_a = loopback_config("alpha", 49250, 49281);
    let mut cfg_b = loopback_config("bravo", 49270, 49281);
    seed_each_other(&mut cfg_a, &mut cfg_b);

    let mut a = MeshEngine::new(cfg_a);
    let mut b = MeshEngine::new(cfg_b);
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
    assert!(found, "initial discovery failed");

    // Stop bravo; alpha must drop it after the adaptive timeout.
    let bravo_id = b.local_peer_id().to_string();
    b.stop().await;

    let a_ref = &a;
    let gone = wait_for(Duration::from_secs(10), move || {
        let bravo_id = bravo_id.clone();
        async move {
            !a_ref.peers().await.iter().any(|p| p.peer_id == bravo_id)
        }
    })
    .await;
    assert!(gone, "silent peer was never expired");

    a.stop().await;
}
