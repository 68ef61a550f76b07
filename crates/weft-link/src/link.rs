//! One live link to an adjacent node
//!
//! A [`NeighborLink`] owns the transport for a single point-to-point
//! connection: a receive loop that turns stream bytes into
//! [`LinkEvent::Packet`]s, a keep-alive timer that pings the far end, and
//! a write path serialized by a per-link lock so frames never interleave.
//!
//! Links are created through
//! [`LinkManager::attach`](crate::manager::LinkManager::attach), which
//! issues ids and keeps the registry.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tracing::{debug, instrument, trace, warn};

use weft_core::{
    DEFAULT_MAX_HOPS, MessageIdGenerator, MmcpMessage, VirtualAddress, VirtualPacket, WireError,
};

use crate::error::LinkError;
use crate::framing;

/// Node-local identifier for one link.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LinkId(pub u64);

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Link lifecycle state. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// Events a link feeds into the node's dispatch loop.
#[derive(Debug)]
pub enum LinkEvent {
    /// A packet arrived on the link.
    Packet {
        link: LinkId,
        packet: VirtualPacket,
    },
    /// The link's transport ended or the link was closed.
    Closed { link: LinkId },
}

/// Configuration for link behavior
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// How often the keep-alive timer pings the far end
    pub keepalive_interval: Duration,
    /// Hop budget for keep-alive pings
    pub max_hops: u8,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(12),
            max_hops: DEFAULT_MAX_HOPS,
        }
    }
}

/// Per-link traffic counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkStats {
    /// Packets written to the transport
    pub tx_packets: u64,
    /// Packets read from the transport
    pub rx_packets: u64,
    /// Last measured round-trip time in milliseconds, if any
    pub rtt_ms: Option<u32>,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One live connection to an adjacent node.
///
/// The receive loop and keep-alive timer run as background tasks; both
/// stop when the transport dies or [`close`](Self::close) is called. The
/// state machine is `Connected -> Disconnected` and never goes back: a
/// re-established connection is a new link.
pub struct NeighborLink {
    id: LinkId,
    local_addr: VirtualAddress,
    /// The far end's overlay address. Provided at attach when the caller
    /// knows it, otherwise learned from the first received packet's
    /// last-hop field.
    remote_addr: OnceLock<VirtualAddress>,
    /// The far end's advertised real service endpoint, for chain relays.
    remote_service: OnceLock<SocketAddr>,
    config: LinkConfig,
    ids: Arc<MessageIdGenerator>,
    writer: Mutex<Option<BoxedWriter>>,
    state_tx: watch::Sender<LinkState>,
    shutdown_tx: broadcast::Sender<()>,
    outstanding_ping: Mutex<Option<(i32, Instant)>>,
    rtt_ms: AtomicU32,
    tx_packets: AtomicU64,
    rx_packets: AtomicU64,
    closed: AtomicBool,
}

impl NeighborLink {
    /// Wrap a transport in a link and start its background tasks.
    #[allow(clippy::too_many_arguments)] // Constructor with many dependencies
    pub fn spawn<T>(
        id: LinkId,
        transport: T,
        local_addr: VirtualAddress,
        remote_addr: Option<VirtualAddress>,
        remote_service: Option<SocketAddr>,
        config: LinkConfig,
        events: mpsc::Sender<LinkEvent>,
        ids: Arc<MessageIdGenerator>,
    ) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let (state_tx, _) = watch::channel(LinkState::Connected);
        let (shutdown_tx, _) = broadcast::channel(1);

        let link = Arc::new(Self {
            id,
            local_addr,
            remote_addr: OnceLock::new(),
            remote_service: OnceLock::new(),
            config,
            ids,
            writer: Mutex::new(Some(Box::new(write_half))),
            state_tx,
            shutdown_tx,
            outstanding_ping: Mutex::new(None),
            rtt_ms: AtomicU32::new(0),
            tx_packets: AtomicU64::new(0),
            rx_packets: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        if let Some(addr) = remote_addr {
            let _ = link.remote_addr.set(addr);
        }
        if let Some(service) = remote_service {
            let _ = link.remote_service.set(service);
        }

        let receive_shutdown = link.shutdown_tx.subscribe();
        tokio::spawn(Arc::clone(&link).receive_loop(
            Box::new(read_half),
            events,
            receive_shutdown,
        ));

        let keepalive_shutdown = link.shutdown_tx.subscribe();
        tokio::spawn(Arc::clone(&link).keepalive_loop(keepalive_shutdown));

        link
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    /// The far end's overlay address, once known.
    pub fn remote_addr(&self) -> Option<VirtualAddress> {
        self.remote_addr.get().copied()
    }

    /// The far end's advertised real service endpoint, once known.
    pub fn remote_service(&self) -> Option<SocketAddr> {
        self.remote_service.get().copied()
    }

    /// Record the far end's real service endpoint. First value wins.
    pub fn set_remote_service(&self, service: SocketAddr) {
        let _ = self.remote_service.set(service);
    }

    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    /// Watch for the `Connected -> Disconnected` transition.
    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Last measured round-trip time on this link.
    pub fn rtt(&self) -> Option<Duration> {
        match self.rtt_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms as u64)),
        }
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rtt_ms: match self.rtt_ms.load(Ordering::Relaxed) {
                0 => None,
                ms => Some(ms),
            },
        }
    }

    /// Write one packet to the transport.
    ///
    /// Sends from the keep-alive timer and from the router share the same
    /// lock, so frames never interleave on the stream. A write failure
    /// closes the link.
    pub async fn send(&self, packet: &VirtualPacket) -> Result<(), LinkError> {
        let result = {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(LinkError::Closed)?;
            framing::write_packet(writer, packet).await
        };
        match result {
            Ok(()) => {
                self.tx_packets.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                debug!(link = %self.id, error = %e, "Send failed, closing link");
                self.close().await;
                Err(e)
            }
        }
    }

    /// Resolve a pong against this link's outstanding keep-alive ping.
    ///
    /// Returns the measured round trip when `reply_to` matches; a pong
    /// for any other id is stale and ignored.
    pub async fn handle_pong(&self, reply_to: i32) -> Option<Duration> {
        let mut guard = self.outstanding_ping.lock().await;
        match *guard {
            Some((id, sent)) if id == reply_to => {
                *guard = None;
                let rtt = sent.elapsed().max(Duration::from_millis(1));
                self.rtt_ms
                    .store(rtt.as_millis().min(u32::MAX as u128) as u32, Ordering::Relaxed);
                trace!(link = %self.id, rtt_ms = rtt.as_millis() as u64, "Keep-alive pong");
                Some(rtt)
            }
            _ => None,
        }
    }

    /// Close the link. Idempotent; the state transition is terminal.
    #[instrument(skip(self), fields(link = %self.id))]
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing link");
        let _ = self.shutdown_tx.send(());
        let _ = self.state_tx.send(LinkState::Disconnected);
        *self.writer.lock().await = None;
    }

    async fn receive_loop(
        self: Arc<Self>,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
        events: mpsc::Sender<LinkEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            let packet = tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = framing::read_packet(&mut reader) => match result {
                    Ok(packet) => packet,
                    Err(LinkError::Frame(WireError::PayloadTooLarge { size, .. })) => {
                        // The declared length still frames the stream, so
                        // the over-limit frame can be skipped in place.
                        debug!(link = %self.id, size, "Discarding over-limit frame");
                        let mut discard = vec![0u8; size];
                        if reader.read_exact(&mut discard).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Err(LinkError::Io(e)) => {
                        debug!(link = %self.id, error = %e, "Link transport ended");
                        break;
                    }
                    Err(e) => {
                        warn!(link = %self.id, error = %e, "Unrecoverable frame, closing link");
                        break;
                    }
                },
            };

            // Whatever arrives on a link was transmitted by the adjacent
            // node, so the packet's last hop is the far end's address.
            let _ = self.remote_addr.set(packet.header().last_hop_addr);
            self.rx_packets.fetch_add(1, Ordering::Relaxed);

            if events
                .send(LinkEvent::Packet {
                    link: self.id,
                    packet,
                })
                .await
                .is_err()
            {
                break;
            }
        }

        self.close().await;
        let _ = events.send(LinkEvent::Closed { link: self.id }).await;
    }

    async fn keepalive_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        // First probe after one full period; adverts from the join
        // handshake already flow on a fresh link.
        let start = tokio::time::Instant::now() + self.config.keepalive_interval;
        let mut interval = tokio::time::interval_at(start, self.config.keepalive_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => {
                    if !self.is_connected() {
                        break;
                    }
                    let Some(remote) = self.remote_addr() else {
                        trace!(link = %self.id, "Far end address unknown, skipping keep-alive");
                        continue;
                    };
                    let id = self.ids.next_id();
                    let packet = match MmcpMessage::ping(id).to_packet(
                        self.local_addr,
                        remote,
                        self.config.max_hops,
                    ) {
                        Ok(packet) => packet,
                        Err(e) => {
                            warn!(link = %self.id, error = %e, "Failed to build keep-alive ping");
                            continue;
                        }
                    };
                    *self.outstanding_ping.lock().await = Some((id, Instant::now()));
                    if self.send(&packet).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for NeighborLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeighborLink")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use weft_core::{MmcpKind, VirtualPacketHeader};

    fn addr(tail: u8) -> VirtualAddress {
        VirtualAddress::from_octets([169, 254, 0, tail])
    }

    fn data_packet(from: VirtualAddress, to: VirtualAddress, payload: &[u8]) -> VirtualPacket {
        let header = VirtualPacketHeader {
            to_addr: to,
            to_port: 100,
            from_addr: from,
            from_port: 200,
            last_hop_addr: from,
            hop_count: 1,
            max_hops: 5,
            payload_size: 0,
        };
        VirtualPacket::new(header, payload).unwrap()
    }

    fn spawn_link(
        transport: tokio::io::DuplexStream,
        local: VirtualAddress,
        remote: Option<VirtualAddress>,
        config: LinkConfig,
    ) -> (Arc<NeighborLink>, mpsc::Receiver<LinkEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let link = NeighborLink::spawn(
            LinkId(1),
            transport,
            local,
            remote,
            None,
            config,
            tx,
            Arc::new(MessageIdGenerator::new()),
        );
        (link, rx)
    }

    #[tokio::test]
    async fn test_packet_delivery_and_remote_addr_learning() {
        let (a_side, mut b_side) = tokio::io::duplex(4096);
        let (link, mut events) = spawn_link(a_side, addr(1), None, LinkConfig::default());
        assert_eq!(link.remote_addr(), None);

        // The far end writes a raw frame
        let sent = data_packet(addr(2), addr(1), b"hi there");
        framing::write_packet(&mut b_side, &sent).await.unwrap();

        match events.recv().await.unwrap() {
            LinkEvent::Packet { link: id, packet } => {
                assert_eq!(id, LinkId(1));
                assert_eq!(packet.payload(), b"hi there");
            }
            other => panic!("expected packet, got {:?}", other),
        }
        assert_eq!(link.remote_addr(), Some(addr(2)));
    }

    #[tokio::test]
    async fn test_send_writes_frames() {
        let (a_side, mut b_side) = tokio::io::duplex(4096);
        let (link, _events) = spawn_link(a_side, addr(1), Some(addr(2)), LinkConfig {
            keepalive_interval: Duration::from_secs(3600),
            ..LinkConfig::default()
        });

        link.send(&data_packet(addr(1), addr(2), b"payload")).await.unwrap();
        let received = framing::read_packet(&mut b_side).await.unwrap();
        assert_eq!(received.payload(), b"payload");
        assert_eq!(link.stats().tx_packets, 1);
    }

    #[tokio::test]
    async fn test_keepalive_pings_and_rtt() {
        let (a_side, mut b_side) = tokio::io::duplex(4096);
        let (link, _events) = spawn_link(a_side, addr(1), Some(addr(2)), LinkConfig {
            keepalive_interval: Duration::from_millis(100),
            ..LinkConfig::default()
        });

        let ping_packet = framing::read_packet(&mut b_side).await.unwrap();
        assert_eq!(ping_packet.header().to_port, 0);
        let ping = MmcpMessage::decode(ping_packet.payload()).unwrap();
        assert_eq!(ping.kind, MmcpKind::Ping);

        // A stale pong does not resolve the probe
        assert!(link.handle_pong(ping.message_id + 1000).await.is_none());
        assert!(link.rtt().is_none());

        let rtt = link.handle_pong(ping.message_id).await.unwrap();
        assert!(rtt >= Duration::from_millis(1));
        assert!(link.rtt().is_some());

        // Resolved probes cannot be resolved twice
        assert!(link.handle_pong(ping.message_id).await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_terminal_and_idempotent() {
        let (a_side, _b_side) = tokio::io::duplex(4096);
        let (link, mut events) = spawn_link(a_side, addr(1), Some(addr(2)), LinkConfig::default());
        let mut state = link.state_watch();
        assert_eq!(link.state(), LinkState::Connected);

        link.close().await;
        link.close().await;

        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), LinkState::Disconnected);
        assert!(!link.is_connected());

        let err = link
            .send(&data_packet(addr(1), addr(2), b"late"))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Closed));

        // The receive loop announces the closure
        loop {
            match events.recv().await.unwrap() {
                LinkEvent::Closed { link: id } => {
                    assert_eq!(id, LinkId(1));
                    break;
                }
                LinkEvent::Packet { .. } => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_over_limit_frame_is_skipped() {
        use tokio::io::AsyncWriteExt;
        use weft_core::HEADER_SIZE;

        let (a_side, mut b_side) = tokio::io::duplex(8192);
        let (link, mut events) = spawn_link(a_side, addr(1), Some(addr(2)), LinkConfig {
            keepalive_interval: Duration::from_secs(3600),
            ..LinkConfig::default()
        });

        // A frame declaring more payload than any packet may carry,
        // followed by exactly that many bytes
        let claimed: u16 = 2005;
        let mut bad = [0u8; HEADER_SIZE];
        bad[18..20].copy_from_slice(&claimed.to_be_bytes());
        b_side.write_all(&bad).await.unwrap();
        b_side.write_all(&vec![0xEE; claimed as usize]).await.unwrap();

        framing::write_packet(&mut b_side, &data_packet(addr(2), addr(1), b"after"))
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            LinkEvent::Packet { packet, .. } => assert_eq!(packet.payload(), b"after"),
            other => panic!("expected packet, got {:?}", other),
        }
        assert!(link.is_connected());
    }

    #[tokio::test]
    async fn test_transport_eof_disconnects() {
        let (a_side, b_side) = tokio::io::duplex(4096);
        let (link, mut events) = spawn_link(a_side, addr(1), Some(addr(2)), LinkConfig {
            keepalive_interval: Duration::from_secs(3600),
            ..LinkConfig::default()
        });

        drop(b_side);

        loop {
            match events.recv().await.unwrap() {
                LinkEvent::Closed { link: id } => {
                    assert_eq!(id, LinkId(1));
                    break;
                }
                LinkEvent::Packet { .. } => continue,
            }
        }
        assert_eq!(link.state(), LinkState::Disconnected);
    }
}
