//! UDP socket setup and send-strategy selection.
//!
//! Binding is best-effort: a failed fixed-port or scoped bind falls back
//! to an ephemeral unscoped socket with a warning instead of failing the
//! caller. The unicast-vs-broadcast decision is an explicit strategy
//! value, not an implicit branch at each call site.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::MeshResult;

/// Bind a UDP socket for mesh traffic.
///
/// `port` is fixed for listener sockets and `None` for ephemeral senders.
/// `bind_addr` scopes the socket to one interface when configured.
/// Broadcast is always enabled; each configured multicast group is joined
/// on the scoped interface (or any, when unscoped).
pub async fn bind_socket(
    port: Option<u16>,
    bind_addr: Option<IpAddr>,
    multicast_groups: &[Ipv4Addr],
) -> MeshResult<UdpSocket> {
    let requested = SocketAddr::new(
        bind_addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        port.unwrap_or(0),
    );

    let socket = match UdpSocket::bind(requested).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Bind to {requested} failed ({e}), falling back to ephemeral socket");
            UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?
        }
    };

    if let Err(e) = socket.set_broadcast(true) {
        warn!("Enabling broadcast on {requested} failed: {e}");
    }

    let interface = match bind_addr {
        Some(IpAddr::V4(v4)) => v4,
        _ => Ipv4Addr::UNSPECIFIED,
    };
    for group in multicast_groups {
        if let Err(e) = socket.join_multicast_v4(*group, interface) {
            warn!("Joining multicast group {group} failed: {e}");
        }
    }

    Ok(socket)
}

/// How an outgoing packet reaches its audience.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStrategy {
    /// Send a copy to each known peer.
    Unicast(Vec<SocketAddr>),
    /// No peers known; fall back to the broadcast address.
    Broadcast(SocketAddr),
}

impl SendStrategy {
    /// Pick unicast fan-out when peers are known, broadcast otherwise.
    pub fn select(known: Vec<SocketAddr>, broadcast: SocketAddr) -> Self {
        if known.is_empty() {
            SendStrategy::Broadcast(broadcast)
        } else {
            SendStrategy::Unicast(known)
        }
    }

    /// The concrete destination list for this strategy.
    pub fn targets(&self) -> Vec<SocketAddr> {
        match self {
            SendStrategy::Unicast(addrs) => addrs.clone(),
            SendStrategy::Broadcast(addr) => vec![*addr],
        }
    }
}

/// Send one datagram to every target, logging failures and continuing.
/// Returns the number of successful sends.
pub async fn send_to_many(socket: &UdpSocket, bytes: &[u8], targets: &[SocketAddr]) -> usize {
    let mut sent = 0;
    for target in targets {
        match socket.send_to(bytes, target).await {
            Ok(_) => sent += 1,
            Err(e) => debug!("Send to {target} failed: {e}"),
        }
    }
    sent
}
