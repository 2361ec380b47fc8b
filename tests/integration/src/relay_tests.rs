//! Audio relay into per-channel buffers.

use std::time::Duration;

use fieldlink_mesh::MeshEngine;
use fieldlink_mesh::relay::AudioFrame;

use crate::test_utils::{loopback_config, seed_each_other, wait_for};

/// Drain a channel until a frame shows up or the timeout elapses.
async fn drain_until_frame(
    engine: &MeshEngine,
    channel: &str,
    timeout: Duration,
) -> Option<AudioFrame> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        let mut frames = engine.drain_audio(channel).await;
        if !frames.is_empty() {
            return Some(frames.remove(0));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

#[tokio::test]
async fn test_audio_frame_reaches_peer_buffer() {
    let mut cfg_a = loopback_config("alpha", 49500, 49531);
    let mut cfg_b = loopback_config("bravo", 49520, 49531);
    seed_each_other(&mut cfg_a, &mut cfg_b);

    let mut a = MeshEngine::new(cfg_a);
    let mut b = MeshEngine::new(cfg_b);
    a.start().await.unwrap();
    b.start().await.unwrap();

    // Audio targets known peers, so bravo must know alpha first.
    let (a_ref, b_ref) = (&a, &b);
    let found = wait_for(Duration::from_secs(5), move || async move {
        b_ref
            .peers()
            .await
            .iter()
            .any(|p| p.peer_id == a_ref.local_peer_id())
    })
    .await;
    assert!(found, "discovery failed");

    // Raw bytes including the frame-boundary byte must survive.
    let sent: Vec<u8> = vec![0x01, 0x0a, 0xff, 0x00, 0x0a, 0x7f];
    b.send_audio("alpha-net", &sent).await.unwrap();

    let frame = drain_until_frame(&a, "alpha-net", Duration::from_secs(3))
        .await
        .expect("audio frame never arrived");
    assert_eq!(frame.data, sent);
    assert_eq!(frame.peer_id, b.local_peer_id());
    assert_eq!(frame.channel_id, "alpha-net");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_audio_channels_stay_isolated() {
    let mut cfg_a = loopback_config("alpha", 49540, 49571);
    let mut cfg_b = loopback_config("bravo", 49560, 49571);
    seed_each_other(&mut cfg_a, &mut cfg_b);

    let mut a = MeshEngine::new(cfg_a);
    let mut b = MeshEngine::new(cfg_b);
    a.start().await.unwrap();
    b.start().await.unwrap();

    let (a_ref, b_ref) = (&a, &b);
    let found = wait_for(Duration::from_secs(5), move || async move {
        b_ref
            .peers()
            .await
            .iter()
            .any(|p| p.peer_id == a_ref.local_peer_id())
    })
    .await;
    assert!(found, "discovery failed");

    b.send_audio("command-net", b"squelch").await.unwrap();

    let frame = drain_until_frame(&a, "command-net", Duration::from_secs(3))
        .await
        .expect("audio frame never arrived");
    assert_eq!(frame.data, b"squelch");

    // Nothing may leak into a channel no one transmitted on.
    assert!(a.drain_audio("quiet-net").await.is_empty());

    a.stop().await;
    b.stop().await;
}
