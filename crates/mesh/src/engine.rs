//! MeshEngine, the top-level coordinator for the mesh protocol.
//!
//! [`MeshEngine`] is the primary public API of fieldlink_mesh. It owns:
//! - One listener task per bound socket (discovery, location, audio,
//!   state sync, annotations)
//! - Timer tasks (self-announce, state rebroadcast, keep-alive ping,
//!   peer-cache flush)
//! - A single packet dispatch point keyed by packet type, wrapping every
//!   inbound packet in duplicate suppression, ack emission, and metrics
//!   sampling
//!
//! All shared registries live behind locks inside one inner structure;
//! tasks communicate only through those registries and the event bus.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use fieldlink_proto::{
    Annotation, AnnotationMessage, Channel, DiscoveryAnnounce, Frame, LocationUpdate, PacketHeader,
    PacketType, StateSyncMessage,
};

use crate::cache::{CachedPeerRecord, PeerCache};
use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::events::{AnnotationProvider, EventBus, MeshEvent};
use crate::metrics::{ConnectionMetrics, MetricsTable};
use crate::peer::{current_timestamp, peer_id_for, PeerId, PeerRecord, PeerRegistry};
use crate::relay::{AudioBuffers, AudioFrame};
use crate::reliability::{DuplicateFilter, PendingAck, PendingAcks, SequenceCounter};
use crate::state::{SharedState, StateHistory, SyncOutcome};
use crate::transport::{bind_socket, send_to_many, SendStrategy};

/// Offset of the state-sync port from a peer's base port.
const STATE_SYNC_OFFSET: u16 = 10;
/// Offset of the location port from a peer's base port.
const LOCATION_OFFSET: u16 = 1;
/// Offset of the audio port from a peer's base port.
const AUDIO_OFFSET: u16 = 2;

/// Highest base port that still leaves room for every derived data port.
/// Announces and cached records above this are rejected, so registry
/// entries always have derivable ports.
const MAX_PEER_BASE_PORT: u16 = u16::MAX - STATE_SYNC_OFFSET;

/// The stable transport interface any mesh implementation satisfies.
///
/// The surrounding application can swap transports at runtime without
/// knowing engine internals: it only ever holds something with this
/// shape.
pub trait MeshTransport {
    /// Begin listening, announcing, and syncing.
    fn start(&mut self) -> impl std::future::Future<Output = MeshResult<()>> + Send;
    /// Stop all tasks, flush durable state, clear registries.
    fn stop(&mut self) -> impl std::future::Future<Output = ()> + Send;
    /// Share the local position with the mesh.
    fn send_location(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> impl std::future::Future<Output = MeshResult<()>> + Send;
    /// Share an annotation with the mesh.
    fn send_annotation(
        &self,
        annotation: Annotation,
    ) -> impl std::future::Future<Output = MeshResult<()>> + Send;
    /// Send one audio frame on a channel.
    fn send_audio(
        &self,
        channel_id: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = MeshResult<()>> + Send;
    /// Observe mesh change events.
    fn subscribe(&self) -> broadcast::Receiver<MeshEvent>;
}

/// Sockets bound for the lifetime of one engine run.
struct EngineSockets {
    discovery: Arc<UdpSocket>,
    location: Arc<UdpSocket>,
    audio: Arc<UdpSocket>,
    state_sync: Arc<UdpSocket>,
    annotation: Arc<UdpSocket>,
}

/// Shared core every task holds an `Arc` to.
struct EngineInner {
    config: MeshConfig,
    local_peer_id: String,
    peers: RwLock<PeerRegistry>,
    metrics: RwLock<MetricsTable>,
    pending: RwLock<PendingAcks>,
    dedup: RwLock<DuplicateFilter>,
    state: RwLock<SharedState>,
    history: RwLock<StateHistory>,
    audio: RwLock<AudioBuffers>,
    cache: Mutex<Option<PeerCache>>,
    sockets: RwLock<Option<Arc<EngineSockets>>>,
    annotation_provider: RwLock<Option<Arc<dyn AnnotationProvider>>>,
    discovery_interval: RwLock<Duration>,
    events: EventBus,
    sequences: SequenceCounter,
    running: AtomicBool,
}

/// The mesh protocol engine. Create one per node, then [`start`] it.
///
/// [`start`]: MeshEngine::start
pub struct MeshEngine {
    inner: Arc<EngineInner>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl MeshEngine {
    /// Create an engine from configuration. No sockets are bound until
    /// [`start`](MeshEngine::start).
    pub fn new(config: MeshConfig) -> Self {
        let local_ip = match config.bind_addr {
            Some(addr) => addr,
            None => local_ip_address::local_ip().unwrap_or_else(|e| {
                warn!("Local address detection failed ({e}), using loopback");
                IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
            }),
        };
        let local_peer_id = format!("{}:{}", local_ip, config.base_port);

        let inner = EngineInner {
            local_peer_id: local_peer_id.clone(),
            peers: RwLock::new(PeerRegistry::new()),
            metrics: RwLock::new(MetricsTable::new(
                config.peer_timeout_min_ms,
                config.peer_timeout_max_ms,
            )),
            pending: RwLock::new(PendingAcks::new()),
            dedup: RwLock::new(DuplicateFilter::new()),
            state: RwLock::new(SharedState::new(local_peer_id)),
            history: RwLock::new(StateHistory::new()),
            audio: RwLock::new(AudioBuffers::new(config.audio_buffer_frames)),
            cache: Mutex::new(None),
            sockets: RwLock::new(None),
            annotation_provider: RwLock::new(None),
            discovery_interval: RwLock::new(Duration::from_millis(
                config.discovery_interval_min_ms,
            )),
            events: EventBus::new(),
            sequences: SequenceCounter::new(),
            running: AtomicBool::new(false),
            config,
        };

        Self {
            inner: Arc::new(inner),
            shutdown_tx: None,
        }
    }

    /// This node's peer ID (`ip:base_port`).
    pub fn local_peer_id(&self) -> &str {
        &self.inner.local_peer_id
    }

    /// Whether the engine is currently running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Snapshot of all live peers.
    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.inner.peers.read().await.snapshot()
    }

    /// Current version counter of the locally-owned state.
    pub async fn state_version(&self) -> u64 {
        self.inner.state.read().await.version()
    }

    /// Current channel list from the shared state.
    pub async fn channels(&self) -> Vec<Channel> {
        self.inner.state.read().await.channels().to_vec()
    }

    /// Current annotations from the shared state.
    pub async fn annotations(&self) -> Vec<Annotation> {
        self.inner.state.read().await.annotations()
    }

    /// Number of reliable sends still awaiting acknowledgment.
    pub async fn pending_ack_count(&self) -> usize {
        self.inner.pending.read().await.len()
    }

    /// Smoothed link metrics for one peer, if any samples exist.
    pub async fn metrics_for(&self, peer_id: &str) -> Option<ConnectionMetrics> {
        self.inner.metrics.read().await.get(peer_id).cloned()
    }

    /// Add or replace a channel in the locally-owned state. Bumps the
    /// state version so peers announcing older state get a targeted push.
    pub async fn upsert_channel(&self, channel: Channel) {
        let channels = {
            let mut state = self.inner.state.write().await;
            state.upsert_channel(channel);
            state.next_version(current_timestamp());
            state.channels().to_vec()
        };
        self.inner.events.publish(MeshEvent::ChannelsChanged(channels));
    }

    /// Install the pull collaborator consulted when building rebroadcast
    /// payloads.
    pub async fn set_annotation_provider(&self, provider: Arc<dyn AnnotationProvider>) {
        *self.inner.annotation_provider.write().await = Some(provider);
    }

    /// Take all buffered audio frames for a channel, oldest first.
    pub async fn drain_audio(&self, channel_id: &str) -> Vec<AudioFrame> {
        self.inner.audio.write().await.drain(channel_id)
    }

    /// Bind sockets and spawn the listener and timer tasks.
    pub async fn start(&mut self) -> MeshResult<()> {
        if self.is_running() {
            return Ok(());
        }
        let inner = &self.inner;
        let config = &inner.config;
        config.validate()?;

        // Seed the registry from the durable cache before any traffic.
        match PeerCache::open(&config.cache_path) {
            Ok(cache) => {
                let now = current_timestamp();
                match cache.load_all() {
                    Ok(records) => {
                        let mut peers = inner.peers.write().await;
                        for cached in records {
                            if let Some(record) = revive_cached_peer(&cached, now) {
                                if record.peer_id != inner.local_peer_id {
                                    peers.insert(record);
                                }
                            }
                        }
                        info!("Seeded {} peer(s) from cache", peers.len());
                    }
                    Err(e) => warn!("Peer cache load failed, starting cold: {e}"),
                }
                *inner.cache.lock().await = Some(cache);
            }
            Err(e) => warn!("Peer cache unavailable ({e}), running without persistence"),
        }

        let bind_addr = config.bind_addr;
        let groups = config.multicast_groups.clone();
        let sockets = Arc::new(EngineSockets {
            discovery: Arc::new(bind_socket(Some(config.discovery_port()), bind_addr, &groups).await?),
            location: Arc::new(bind_socket(Some(config.location_port()), bind_addr, &[]).await?),
            audio: Arc::new(bind_socket(Some(config.audio_port()), bind_addr, &[]).await?),
            state_sync: Arc::new(bind_socket(Some(config.state_sync_port()), bind_addr, &[]).await?),
            annotation: Arc::new(bind_socket(Some(config.annotation_port), bind_addr, &[]).await?),
        });
        *inner.sockets.write().await = Some(sockets.clone());

        let (shutdown_tx, _) = broadcast::channel(8);
        self.shutdown_tx = Some(shutdown_tx.clone());

        for (socket, name) in [
            (sockets.discovery.clone(), "discovery"),
            (sockets.location.clone(), "location"),
            (sockets.audio.clone(), "audio"),
            (sockets.state_sync.clone(), "state-sync"),
            (sockets.annotation.clone(), "annotation"),
        ] {
            spawn_listener(self.inner.clone(), socket, name, shutdown_tx.subscribe());
        }

        spawn_announce_loop(self.inner.clone(), shutdown_tx.subscribe());
        spawn_ping_loop(self.inner.clone(), shutdown_tx.subscribe());
        spawn_rebroadcast_loop(self.inner.clone(), shutdown_tx.subscribe());
        spawn_cache_flush_loop(self.inner.clone(), shutdown_tx.subscribe());

        inner.running.store(true, Ordering::SeqCst);
        info!(
            "Mesh engine started as {} on base port {}",
            inner.local_peer_id,
            config.base_port
        );
        Ok(())
    }

    /// Stop all tasks, flush the peer cache, close sockets, and clear
    /// every in-memory registry. All-or-nothing; individual operations
    /// are not cancellable.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        let inner = &self.inner;
        {
            let peers = inner.peers.read().await.snapshot();
            let mut cache = inner.cache.lock().await;
            if let Some(cache) = cache.as_mut() {
                if let Err(e) = cache.flush(&peers) {
                    warn!("Peer cache flush on shutdown failed: {e}");
                }
            }
        }

        *inner.sockets.write().await = None;
        *inner.cache.lock().await = None;
        inner.peers.write().await.clear();
        inner.metrics.write().await.clear();
        inner.pending.write().await.clear();
        inner.dedup.write().await.clear();
        inner.history.write().await.clear();
        inner.audio.write().await.clear();
        inner.state.write().await.clear();
        *inner.annotation_provider.write().await = None;

        inner.running.store(false, Ordering::SeqCst);
        info!("Mesh engine {} stopped", inner.local_peer_id);
    }

    /// Share the local position: reliability-wrapped fan-out to every
    /// known peer, or one broadcast while no peers are known.
    pub async fn send_location(&self, latitude: f64, longitude: f64) -> MeshResult<()> {
        self.ensure_running()?;
        let inner = &self.inner;
        let now = current_timestamp();

        let update = LocationUpdate {
            peer_id: inner.local_peer_id.clone(),
            latitude,
            longitude,
            timestamp_ms: now,
        };
        inner.state.write().await.set_peer_location(update.clone());
        inner
            .events
            .publish(MeshEvent::LocationUpdated(update.clone()));

        let payload = serde_json::to_vec(&update)?;
        let peers = inner.peers.read().await.snapshot();
        let broadcast_target = SocketAddr::new(
            IpAddr::V4(inner.config.broadcast_addr),
            inner.config.location_port(),
        );
        let routed: Vec<(PeerRecord, SocketAddr)> = peers
            .into_iter()
            .filter_map(|p| {
                let port = p.addr.port().checked_add(LOCATION_OFFSET)?;
                let target = SocketAddr::new(p.addr.ip(), port);
                Some((p, target))
            })
            .collect();
        let targets: Vec<SocketAddr> = routed.iter().map(|(_, target)| *target).collect();

        match SendStrategy::select(targets, broadcast_target) {
            SendStrategy::Broadcast(addr) => {
                self.send_unreliable(PacketType::Location, None, &payload, &[addr])
                    .await;
            }
            SendStrategy::Unicast(_) => {
                for (peer, target) in routed {
                    send_reliable(
                        Arc::clone(inner),
                        peer.peer_id,
                        target,
                        PacketType::Location,
                        None,
                        payload.clone(),
                    )
                    .await;
                }
            }
        }
        Ok(())
    }

    /// Share an annotation: reliability-wrapped fan-out to every known
    /// peer plus one unconditional broadcast (annotations are high-value,
    /// low-frequency).
    pub async fn send_annotation(&self, annotation: Annotation) -> MeshResult<()> {
        self.ensure_running()?;
        let inner = &self.inner;

        let accepted = {
            let mut state = inner.state.write().await;
            let accepted = state.merge_annotation(annotation.clone());
            if accepted {
                state.next_version(current_timestamp());
            }
            accepted
        };
        if accepted {
            inner
                .events
                .publish(MeshEvent::AnnotationUpdated(annotation.clone()));
        }

        let payload = serde_json::to_vec(&AnnotationMessage { annotation })?;
        let annotation_port = inner.config.annotation_port;

        for peer in inner.peers.read().await.snapshot() {
            let target = SocketAddr::new(peer.addr.ip(), annotation_port);
            send_reliable(
                Arc::clone(inner),
                peer.peer_id,
                target,
                PacketType::Annotation,
                None,
                payload.clone(),
            )
            .await;
        }

        let broadcast_target =
            SocketAddr::new(IpAddr::V4(inner.config.broadcast_addr), annotation_port);
        self.send_unreliable(PacketType::Annotation, None, &payload, &[broadcast_target])
            .await;
        Ok(())
    }

    /// Send one audio frame to every known peer. No reliability wrapper:
    /// audio tolerates loss, not latency.
    pub async fn send_audio(&self, channel_id: &str, data: &[u8]) -> MeshResult<()> {
        self.ensure_running()?;
        let inner = &self.inner;

        let targets: Vec<SocketAddr> = inner
            .peers
            .read()
            .await
            .snapshot()
            .into_iter()
            .filter_map(|p| {
                let port = p.addr.port().checked_add(AUDIO_OFFSET)?;
                Some(SocketAddr::new(p.addr.ip(), port))
            })
            .collect();

        self.send_unreliable(PacketType::Audio, Some(channel_id), data, &targets)
            .await;
        Ok(())
    }

    /// Observe mesh change events.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.inner.events.subscribe()
    }

    fn ensure_running(&self) -> MeshResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(MeshError::InvalidState("engine is not running".to_string()))
        }
    }

    async fn send_unreliable(
        &self,
        packet_type: PacketType,
        channel_id: Option<&str>,
        payload: &[u8],
        targets: &[SocketAddr],
    ) {
        let inner = &self.inner;
        let header = match channel_id {
            Some(channel) => PacketHeader::with_channel(
                inner.sequences.next(),
                packet_type,
                current_timestamp(),
                channel,
            ),
            None => PacketHeader::new(inner.sequences.next(), packet_type, current_timestamp()),
        };

        let bytes = match Frame::encode(&header, payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Frame encoding failed: {e}");
                return;
            }
        };

        if let Some(socket) = inner.discovery_socket().await {
            send_to_many(&socket, &bytes, targets).await;
        }
    }
}

impl MeshTransport for MeshEngine {
    async fn start(&mut self) -> MeshResult<()> {
        MeshEngine::start(self).await
    }

    async fn stop(&mut self) {
        MeshEngine::stop(self).await
    }

    async fn send_location(&self, latitude: f64, longitude: f64) -> MeshResult<()> {
        MeshEngine::send_location(self, latitude, longitude).await
    }

    async fn send_annotation(&self, annotation: Annotation) -> MeshResult<()> {
        MeshEngine::send_annotation(self, annotation).await
    }

    async fn send_audio(&self, channel_id: &str, data: &[u8]) -> MeshResult<()> {
        MeshEngine::send_audio(self, channel_id, data).await
    }

    fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        MeshEngine::subscribe(self)
    }
}

impl EngineInner {
    async fn discovery_socket(&self) -> Option<Arc<UdpSocket>> {
        self.sockets.read().await.as_ref().map(|s| s.discovery.clone())
    }
}

/// Rebuild a registry record from its cached form. Cached peers get a
/// fresh last-seen so they survive until their first real announce or
/// one timeout window, whichever comes first.
fn revive_cached_peer(cached: &CachedPeerRecord, now: u64) -> Option<PeerRecord> {
    let addr: SocketAddr = cached.addr.parse().ok()?;
    if addr.port() > MAX_PEER_BASE_PORT {
        return None;
    }
    Some(PeerRecord {
        peer_id: cached.peer_id.clone(),
        addr,
        last_seen: now,
        nickname: cached.nickname.clone(),
        capabilities: cached.capabilities.clone(),
        quality: cached.quality,
        last_state_version: cached.last_state_version,
    })
}

// ---------------------------------------------------------------------------
// Listener and timer tasks
// ---------------------------------------------------------------------------

fn spawn_listener(
    inner: Arc<EngineInner>,
    socket: Arc<UdpSocket>,
    name: &'static str,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        // Annotation payloads reach 8 KB; leave generous headroom.
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => match Frame::decode(&buf[..len]) {
                            Ok((header, payload)) => {
                                handle_packet(&inner, &socket, src, header, payload).await;
                            }
                            Err(e) => debug!("Dropping malformed datagram from {src} on {name}: {e}"),
                        },
                        Err(e) => {
                            // Transient receive errors must not kill the loop.
                            warn!("Receive error on {name} listener: {e}");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    debug!("{name} listener shutting down");
                    break;
                }
            }
        }
    });
}

/// Single dispatch point for every inbound packet, keyed by packet type.
async fn handle_packet(
    inner: &Arc<EngineInner>,
    socket: &UdpSocket,
    src: SocketAddr,
    header: PacketHeader,
    payload: &[u8],
) {
    let now = current_timestamp();
    let sender = peer_id_for(&src);

    // Our own broadcasts loop back on multicast-capable interfaces.
    if sender == inner.local_peer_id {
        return;
    }

    if header.packet_type == PacketType::Ack {
        let acked = inner.pending.write().await.acknowledge(header.sequence, now);
        if let Some(entry) = acked {
            trace!("Ack for sequence {} from {sender}", header.sequence);
            update_loss_estimate(inner, &entry.peer_id, now).await;
        }
        return;
    }

    if !inner
        .dedup
        .write()
        .await
        .check_and_record(&sender, header.sequence)
    {
        trace!("Duplicate sequence {} from {sender}", header.sequence);
        return;
    }

    // Ack everything that is not itself an ack, before any processing.
    match Frame::encode(&header.ack(now), &[]) {
        Ok(ack_bytes) => {
            if let Err(e) = socket.send_to(&ack_bytes, src).await {
                debug!("Ack to {src} failed: {e}");
            }
        }
        Err(e) => warn!("Ack encoding failed: {e}"),
    }

    let latency_sample = now.saturating_sub(header.timestamp_ms) as f64;
    inner
        .metrics
        .write()
        .await
        .record_latency(&sender, latency_sample, now);
    inner.peers.write().await.touch(&sender, now);

    match header.packet_type {
        PacketType::Discovery => {
            if payload.is_empty() {
                // Keep-alive ping. Liveness and cadence react to every
                // discovery receive, announce or not.
                if run_expiry_sweep(inner, now).await {
                    let snapshot = inner.peers.read().await.snapshot();
                    inner.events.publish(MeshEvent::PeerListChanged(snapshot));
                }
                refresh_discovery_interval(inner).await;
                return;
            }
            match fieldlink_proto::message::parse_payload::<DiscoveryAnnounce>("discovery", payload)
            {
                Ok(announce) => handle_announce(inner, src, &announce, now).await,
                Err(e) => debug!("Dropping announce from {src}: {e}"),
            }
        }
        PacketType::Location => {
            match fieldlink_proto::message::parse_payload::<LocationUpdate>("location", payload) {
                Ok(update) => {
                    inner.state.write().await.set_peer_location(update.clone());
                    inner.events.publish(MeshEvent::LocationUpdated(update));
                }
                Err(e) => debug!("Dropping location from {src}: {e}"),
            }
        }
        PacketType::Annotation => {
            match fieldlink_proto::message::parse_payload::<AnnotationMessage>("annotation", payload)
            {
                Ok(msg) => {
                    let accepted = inner
                        .state
                        .write()
                        .await
                        .merge_annotation(msg.annotation.clone());
                    if accepted {
                        inner
                            .events
                            .publish(MeshEvent::AnnotationUpdated(msg.annotation));
                    }
                }
                Err(e) => debug!("Dropping annotation from {src}: {e}"),
            }
        }
        PacketType::StateSync => {
            match fieldlink_proto::message::parse_payload::<StateSyncMessage>("state_sync", payload)
            {
                Ok(msg) => handle_state_sync(inner, &msg).await,
                Err(e) => debug!("Dropping state sync from {src}: {e}"),
            }
        }
        PacketType::Audio => {
            let Some(channel_id) = header.channel_id.clone() else {
                debug!("Dropping audio packet without channel from {src}");
                return;
            };
            inner.audio.write().await.push(AudioFrame {
                channel_id,
                peer_id: sender,
                data: payload.to_vec(),
                received_at: now,
            });
        }
        // Resolved before the duplicate filter.
        PacketType::Ack => {}
    }
}

async fn handle_announce(
    inner: &Arc<EngineInner>,
    src: SocketAddr,
    announce: &DiscoveryAnnounce,
    now: u64,
) {
    let sender = peer_id_for(&src);
    if src.port() > MAX_PEER_BASE_PORT {
        debug!("Ignoring announce from {src}: data ports not derivable from base port");
        return;
    }
    debug!(
        "Announce from '{}' at {src} (state v{})",
        announce.nickname, announce.last_state_version
    );

    {
        let mut peers = inner.peers.write().await;
        peers.upsert_from_announce(src, announce, now);
    }

    // Durable cache follows every discovery update.
    {
        let peers = inner.peers.read().await;
        if let Some(record) = peers.get(&sender) {
            let cached = CachedPeerRecord::from(record);
            drop(peers);
            let mut cache = inner.cache.lock().await;
            if let Some(cache) = cache.as_mut() {
                if let Err(e) = cache.upsert(&cached) {
                    warn!("Peer cache update failed: {e}");
                }
            }
        }
    }

    run_expiry_sweep(inner, now).await;
    refresh_discovery_interval(inner).await;

    // A peer advertising stale state gets an immediate targeted push.
    if announce.last_state_version < advertised_state_version(inner).await {
        push_full_sync_to(inner, &sender, src).await;
    }

    let snapshot = inner.peers.read().await.snapshot();
    inner.events.publish(MeshEvent::PeerListChanged(snapshot));
}

async fn handle_state_sync(inner: &Arc<EngineInner>, msg: &StateSyncMessage) {
    let outcome = {
        let mut state = inner.state.write().await;
        let mut history = inner.history.write().await;
        state.apply_sync(msg, &mut history)
    };

    let SyncOutcome::Applied {
        channels,
        locations,
        annotations,
    } = outcome
    else {
        trace!(
            "Discarding stale state sync v{} from {}",
            msg.version.version,
            msg.version.peer_id
        );
        return;
    };

    debug!(
        "Applied state sync v{} from {}",
        msg.version.version, msg.version.peer_id
    );

    if channels {
        let list = inner.state.read().await.channels().to_vec();
        inner.events.publish(MeshEvent::ChannelsChanged(list));
    }
    if locations {
        for location in msg.peer_locations.values() {
            inner
                .events
                .publish(MeshEvent::LocationUpdated(location.clone()));
        }
    }
    if annotations {
        let state = inner.state.read().await;
        for annotation in &msg.annotations {
            // Only surface the ones that actually won their merge.
            if state.annotation(&annotation.id).map(|a| a.timestamp_ms)
                == Some(annotation.timestamp_ms)
            {
                inner
                    .events
                    .publish(MeshEvent::AnnotationUpdated(annotation.clone()));
            }
        }
    }
}

/// Reliability-wrapped full state sync to one peer's state-sync port.
async fn push_full_sync_to(inner: &Arc<EngineInner>, peer_id: &str, peer_discovery_addr: SocketAddr) {
    pull_provider_annotations(inner).await;

    let msg = {
        let mut state = inner.state.write().await;
        state.full_sync_message(current_timestamp())
    };

    let payload = match serde_json::to_vec(&msg) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("State sync serialization failed: {e}");
            return;
        }
    };

    let Some(port) = peer_discovery_addr.port().checked_add(STATE_SYNC_OFFSET) else {
        debug!("No state-sync port derivable for {peer_id}, skipping push");
        return;
    };
    let target = SocketAddr::new(peer_discovery_addr.ip(), port);
    debug!("Pushing state v{} to {peer_id}", msg.version.version);
    send_reliable(
        Arc::clone(inner),
        peer_id.to_string(),
        target,
        PacketType::StateSync,
        None,
        payload,
    )
    .await;
}

/// Drop every peer whose silence exceeds its adaptive timeout, along
/// with its metrics and duplicate window. Runs on every discovery
/// receive and before every self-announce, so a quiet mesh still expires
/// its dead. Returns whether anything was removed.
///
/// Registry locks are taken one at a time; the timeouts are snapshotted
/// up front so no guard is ever held across another lock's `.await`.
async fn run_expiry_sweep(inner: &Arc<EngineInner>, now: u64) -> bool {
    let ids = inner.peers.read().await.known_ids();
    let timeouts: HashMap<PeerId, Duration> = {
        let metrics = inner.metrics.read().await;
        ids.iter()
            .map(|id| (id.clone(), metrics.timeout_for(id)))
            .collect()
    };

    // Peers announced after the snapshot get the loosest timeout.
    let fallback = Duration::from_millis(inner.config.peer_timeout_max_ms);
    let removed = inner
        .peers
        .write()
        .await
        .expire(now, |id| timeouts.get(id).copied().unwrap_or(fallback));
    if removed.is_empty() {
        return false;
    }

    {
        let mut metrics = inner.metrics.write().await;
        for peer in &removed {
            metrics.remove(&peer.peer_id);
        }
    }
    let mut dedup = inner.dedup.write().await;
    for peer in &removed {
        info!("Peer {} expired", peer.peer_id);
        dedup.remove(&peer.peer_id);
    }
    true
}

/// Recompute the self-announce cadence from the current mesh condition.
async fn refresh_discovery_interval(inner: &Arc<EngineInner>) {
    let avg_quality = inner.metrics.read().await.average_quality();
    let interval = inner
        .peers
        .read()
        .await
        .adaptive_discovery_interval(avg_quality, &inner.config);
    *inner.discovery_interval.write().await = interval;
}

/// The state version a node advertises in announces: its own counter or
/// the highest version it has accepted from any owner, whichever is
/// larger. Without the latter a node that only ever consumed state would
/// advertise 0 forever and draw a full push on every announce.
async fn advertised_state_version(inner: &Arc<EngineInner>) -> u64 {
    let state = inner.state.read().await;
    let history = inner.history.read().await;
    state.version().max(history.max_version())
}

/// Merge the external annotation store into the shared state before an
/// outgoing full sync.
async fn pull_provider_annotations(inner: &Arc<EngineInner>) {
    let provider = inner.annotation_provider.read().await.clone();
    if let Some(provider) = provider {
        let annotations = provider.annotations();
        let mut state = inner.state.write().await;
        for annotation in annotations {
            state.merge_annotation(annotation);
        }
    }
}

/// Register a packet in the pending-ack table and drive its retries.
/// Best-effort: exhausting the budget records a loss and moves on; the
/// caller is never told delivery failed.
async fn send_reliable(
    inner: Arc<EngineInner>,
    peer_id: String,
    target: SocketAddr,
    packet_type: PacketType,
    channel_id: Option<String>,
    payload: Vec<u8>,
) {
    let now = current_timestamp();
    let sequence = inner.sequences.next();
    let header = match channel_id {
        Some(channel) => PacketHeader::with_channel(sequence, packet_type, now, channel),
        None => PacketHeader::new(sequence, packet_type, now),
    };

    let bytes = match Frame::encode(&header, &payload) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Frame encoding failed: {e}");
            return;
        }
    };

    inner.pending.write().await.register(
        sequence,
        PendingAck {
            peer_id: peer_id.clone(),
            target,
            bytes: bytes.clone(),
            created_at: now,
        },
    );

    let max_retries = inner.config.max_retries;
    let retry_delay = inner.config.retry_delay();
    tokio::spawn(async move {
        for attempt in 1..=max_retries {
            let Some(socket) = inner.discovery_socket().await else {
                break;
            };
            if let Err(e) = socket.send_to(&bytes, target).await {
                debug!("Reliable send attempt {attempt} to {target} failed: {e}");
            }

            tokio::time::sleep(retry_delay).await;
            if !inner.pending.read().await.contains(sequence) {
                return; // Acked.
            }
        }

        let now = current_timestamp();
        if inner.pending.write().await.give_up(sequence, now).is_some() {
            debug!("Giving up on sequence {sequence} to {peer_id} after {max_retries} attempts");
            update_loss_estimate(&inner, &peer_id, now).await;
        }
    });
}

async fn update_loss_estimate(inner: &Arc<EngineInner>, peer_id: &str, now: u64) {
    let window = inner.config.ping_interval_ms;
    let loss = inner.pending.write().await.loss_ratio(peer_id, window, now);
    inner.metrics.write().await.record_loss(peer_id, loss, now);
}

/// Periodic self-announcement at the adaptive discovery interval.
fn spawn_announce_loop(inner: Arc<EngineInner>, mut shutdown: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        loop {
            let interval = *inner.discovery_interval.read().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if run_expiry_sweep(&inner, current_timestamp()).await {
                        let snapshot = inner.peers.read().await.snapshot();
                        inner.events.publish(MeshEvent::PeerListChanged(snapshot));
                    }
                    announce_once(&inner).await;
                }
                _ = shutdown.recv() => {
                    debug!("Announce loop shutting down");
                    break;
                }
            }
        }
    });
}

async fn announce_once(inner: &Arc<EngineInner>) {
    let last_state_version = advertised_state_version(inner).await;
    let known_peers = inner.peers.read().await.known_ids();
    let network_quality = inner.metrics.read().await.average_quality();
    let announce = DiscoveryAnnounce {
        nickname: inner.config.nickname.clone(),
        capabilities: inner.config.capabilities.clone(),
        known_peers,
        network_quality,
        last_state_version,
    };

    let payload = match serde_json::to_vec(&announce) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Announce serialization failed: {e}");
            return;
        }
    };

    let header = PacketHeader::new(
        inner.sequences.next(),
        PacketType::Discovery,
        current_timestamp(),
    );
    let bytes = match Frame::encode(&header, &payload) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Frame encoding failed: {e}");
            return;
        }
    };

    let port = inner.config.discovery_port();
    let mut targets = vec![SocketAddr::new(
        IpAddr::V4(inner.config.broadcast_addr),
        port,
    )];
    for group in &inner.config.multicast_groups {
        targets.push(SocketAddr::new(IpAddr::V4(*group), port));
    }
    targets.extend(inner.config.seed_peers.iter().copied());

    if let Some(socket) = inner.discovery_socket().await {
        let sent = send_to_many(&socket, &bytes, &targets).await;
        trace!("Announce sent to {sent} target(s)");
    }
}

/// Zero-payload discovery pings keep latency samples fresh on quiet
/// links.
fn spawn_ping_loop(inner: Arc<EngineInner>, mut shutdown: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        let interval = inner.config.ping_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let targets: Vec<SocketAddr> = inner
                        .peers
                        .read()
                        .await
                        .snapshot()
                        .into_iter()
                        .map(|p| p.addr)
                        .collect();
                    if targets.is_empty() {
                        continue;
                    }

                    let header = PacketHeader::new(
                        inner.sequences.next(),
                        PacketType::Discovery,
                        current_timestamp(),
                    );
                    let Ok(bytes) = Frame::encode(&header, &[]) else { continue };
                    if let Some(socket) = inner.discovery_socket().await {
                        send_to_many(&socket, &bytes, &targets).await;
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Ping loop shutting down");
                    break;
                }
            }
        }
    });
}

/// Periodic full-state rebroadcast to the local network.
fn spawn_rebroadcast_loop(inner: Arc<EngineInner>, mut shutdown: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        let interval = inner.config.rebroadcast_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    rebroadcast_once(&inner).await;
                }
                _ = shutdown.recv() => {
                    debug!("Rebroadcast loop shutting down");
                    break;
                }
            }
        }
    });
}

async fn rebroadcast_once(inner: &Arc<EngineInner>) {
    pull_provider_annotations(inner).await;

    let msg = {
        let mut state = inner.state.write().await;
        state.full_sync_message(current_timestamp())
    };
    let payload = match serde_json::to_vec(&msg) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("State sync serialization failed: {e}");
            return;
        }
    };

    let header = PacketHeader::new(
        inner.sequences.next(),
        PacketType::StateSync,
        current_timestamp(),
    );
    let Ok(bytes) = Frame::encode(&header, &payload) else {
        return;
    };

    let port = inner.config.state_sync_port();
    let mut targets = vec![SocketAddr::new(
        IpAddr::V4(inner.config.broadcast_addr),
        port,
    )];
    // Seeds listen for state sync at the same offset from their base.
    targets.extend(inner.config.seed_peers.iter().filter_map(|seed| {
        let port = seed.port().checked_add(STATE_SYNC_OFFSET)?;
        Some(SocketAddr::new(seed.ip(), port))
    }));

    if let Some(socket) = inner.discovery_socket().await {
        send_to_many(&socket, &bytes, &targets).await;
        debug!("Rebroadcast state v{}", msg.version.version);
    }
}

/// Periodic durable-cache flush of the full registry.
fn spawn_cache_flush_loop(inner: Arc<EngineInner>, mut shutdown: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        let interval = inner.config.cache_flush_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let peers = inner.peers.read().await.snapshot();
                    let mut cache = inner.cache.lock().await;
                    if let Some(cache) = cache.as_mut() {
                        if let Err(e) = cache.flush(&peers) {
                            warn!("Periodic peer cache flush failed: {e}");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Cache flush loop shutting down");
                    break;
                }
            }
        }
    });
}
