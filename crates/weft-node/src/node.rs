//! The mesh node
//!
//! [`MeshNode`] is the single dispatch point of the overlay: a dispatch
//! task consumes every attached link's receive events and routes each
//! packet (drop on spent hop budget, handle control traffic, deliver to
//! a bound local port, or forward toward the next hop). Three timer tasks
//! drive the routing control plane (advertise, neighbor liveness,
//! eviction). All tasks stop on the node's shutdown broadcast.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tracing::{debug, info, instrument, trace, warn};

use weft_core::{
    CONTROL_PORT, MessageIdGenerator, MmcpKind, MmcpMessage, VirtualAddress, VirtualPacket,
    VirtualPacketHeader,
};
use weft_link::{LinkEvent, LinkId, LinkManager, NeighborLink};
use weft_routing::{
    NeighborSnapshot, NextHop, OriginatorManager, RouteSnapshot, RoutingError,
};

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::events::NodeEvent;
use crate::ports::{PortBinding, PortTable, Protocol};
use crate::socket::{Datagram, MeshSocket};

/// Packets queued between link receive loops and the dispatch task.
const DISPATCH_QUEUE: usize = 256;

/// Node events buffered per subscriber before lag.
const EVENT_QUEUE: usize = 64;

/// Datagrams buffered per socket before delivery drops.
const SOCKET_QUEUE: usize = 64;

/// Link-establishment collaborator that answers hotspot negotiation
/// requests carried over MMCP.
///
/// The request and response blobs are opaque to the mesh core; their
/// contents belong to the platform layer that brings links up.
#[async_trait]
pub trait HotspotResponder: Send + Sync {
    async fn respond(&self, request: Bytes) -> Bytes;
}

/// One node of the mesh overlay.
///
/// Construct with [`MeshNode::start`], which spawns the dispatch and
/// timer tasks immediately. The node runs until [`close`](Self::close).
pub struct MeshNode {
    config: NodeConfig,
    local_addr: VirtualAddress,
    links: Arc<LinkManager>,
    routing: Arc<OriginatorManager>,
    ports: PortTable,
    ids: Arc<MessageIdGenerator>,
    events_tx: broadcast::Sender<NodeEvent>,
    /// Application pings awaiting their pong, keyed by message id.
    pending_pongs: DashMap<i32, oneshot::Sender<()>>,
    /// Hotspot requests awaiting their response, keyed by message id.
    pending_hotspots: DashMap<i32, oneshot::Sender<Bytes>>,
    hotspot: RwLock<Option<Arc<dyn HotspotResponder>>>,
    shutdown_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl MeshNode {
    /// Build a node and start its dispatch and timer tasks.
    pub fn start(config: NodeConfig) -> Arc<Self> {
        let local_addr = config.address.unwrap_or_else(VirtualAddress::random_apipa);
        let ids = Arc::new(MessageIdGenerator::new());
        let (link_events_tx, link_events_rx) = mpsc::channel(DISPATCH_QUEUE);
        let links = Arc::new(LinkManager::new(
            local_addr,
            config.link.clone(),
            link_events_tx,
            Arc::clone(&ids),
        ));
        let routing = Arc::new(OriginatorManager::new(
            local_addr,
            config.routing.clone(),
            Arc::clone(&links),
            Arc::clone(&ids),
        ));
        let (events_tx, _) = broadcast::channel(EVENT_QUEUE);
        let (shutdown_tx, _) = broadcast::channel(1);

        let node = Arc::new(Self {
            config,
            local_addr,
            links,
            routing,
            ports: PortTable::new(),
            ids,
            events_tx,
            pending_pongs: DashMap::new(),
            pending_hotspots: DashMap::new(),
            hotspot: RwLock::new(None),
            shutdown_tx,
            closed: AtomicBool::new(false),
        });
        info!(node = %local_addr, "Mesh node started");

        tokio::spawn(
            Arc::clone(&node).dispatch_loop(link_events_rx, node.shutdown_tx.subscribe()),
        );
        tokio::spawn(Arc::clone(&node).advertise_loop(node.shutdown_tx.subscribe()));
        tokio::spawn(Arc::clone(&node).liveness_loop(node.shutdown_tx.subscribe()));
        tokio::spawn(Arc::clone(&node).evict_loop(node.shutdown_tx.subscribe()));
        node
    }

    /// This node's overlay address.
    pub fn local_address(&self) -> VirtualAddress {
        self.local_addr
    }

    /// The routing control plane, for status surfaces and relays.
    pub fn routing(&self) -> &Arc<OriginatorManager> {
        &self.routing
    }

    /// Subscribe to the node's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events_tx.subscribe()
    }

    /// Known adjacent nodes with their measured round trips.
    pub fn neighbors(&self) -> Vec<NeighborSnapshot> {
        self.routing.neighbors()
    }

    /// The current routing table, as plain data.
    pub fn routes(&self) -> Vec<RouteSnapshot> {
        self.routing.routes()
    }

    /// Replace the capability blob future advertisements carry.
    pub async fn set_capability_blob(&self, blob: Bytes) -> NodeResult<()> {
        self.routing.set_capability_blob(blob).await?;
        Ok(())
    }

    /// Register the collaborator that answers hotspot requests.
    pub async fn set_hotspot_responder(&self, responder: Arc<dyn HotspotResponder>) {
        *self.hotspot.write().await = Some(responder);
    }

    /// Register an already-open transport as a link, without waiting for
    /// the far end to show up in the routing table.
    pub fn attach_link<T>(
        &self,
        transport: T,
        remote_addr: Option<VirtualAddress>,
        remote_service: Option<SocketAddr>,
    ) -> NodeResult<Arc<NeighborLink>>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NodeError::Shutdown);
        }
        Ok(self.links.attach(transport, remote_addr, remote_service))
    }

    /// Register a transport and run the join handshake until the far end
    /// appears as a hop-one neighbor.
    ///
    /// On timeout the link is closed and removed; no half-joined link is
    /// left behind.
    #[instrument(skip(self, transport), fields(node = %self.local_addr))]
    pub async fn connect_neighbor<T>(
        &self,
        transport: T,
        remote_addr: Option<VirtualAddress>,
        remote_service: Option<SocketAddr>,
    ) -> NodeResult<Arc<NeighborLink>>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let link = self.attach_link(transport, remote_addr, remote_service)?;
        if let Err(e) = self.routing.add_neighbor(&link).await {
            self.links.remove(link.id());
            link.close().await;
            return Err(e.into());
        }
        Ok(link)
    }

    /// Bind a virtual datagram socket.
    ///
    /// `None` draws a random ephemeral port. The socket releases its port
    /// on drop.
    pub fn open_socket(self: &Arc<Self>, requested: Option<u16>) -> NodeResult<MeshSocket> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NodeError::Shutdown);
        }
        let (tx, rx) = mpsc::channel(SOCKET_QUEUE);
        let port = self
            .ports
            .allocate(Protocol::Udp, requested, PortBinding::Socket(tx))?;
        debug!(node = %self.local_addr, port, "Socket bound");
        Ok(MeshSocket::new(Arc::clone(self), port, rx))
    }

    /// Install a static forward rule: packets delivered to `bind_port`
    /// are re-addressed to `(dest, dest_port)` and re-sent as fresh local
    /// sends. Returns the bound port.
    pub fn add_forward_rule(
        &self,
        bind_port: Option<u16>,
        dest: VirtualAddress,
        dest_port: u16,
    ) -> NodeResult<u16> {
        let port =
            self.ports
                .allocate(Protocol::Udp, bind_port, PortBinding::Forward { dest, dest_port })?;
        debug!(node = %self.local_addr, port, dest = %dest, dest_port, "Forward rule installed");
        Ok(port)
    }

    /// Remove a forward rule, unbinding its port. Always succeeds.
    pub fn remove_forward_rule(&self, bind_port: u16) {
        self.ports.release(Protocol::Udp, bind_port);
    }

    /// Reserve a port with no delivery target (chain bind points).
    pub fn reserve_port(&self, protocol: Protocol, requested: Option<u16>) -> NodeResult<u16> {
        self.ports.allocate(protocol, requested, PortBinding::Reserved)
    }

    /// Release a bound port. Always succeeds.
    pub fn release_port(&self, protocol: Protocol, port: u16) {
        self.ports.release(protocol, port);
    }

    /// Ping a mesh node and measure the round trip.
    pub async fn ping(&self, dest: VirtualAddress, timeout: Duration) -> NodeResult<Duration> {
        if dest == self.local_addr {
            return Ok(Duration::from_millis(1));
        }
        let id = self.ids.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending_pongs.insert(id, tx);
        let started = Instant::now();
        if let Err(e) = self.send_control(&MmcpMessage::ping(id), dest).await {
            self.pending_pongs.remove(&id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(started.elapsed().max(Duration::from_millis(1))),
            Ok(Err(_)) => Err(NodeError::Shutdown),
            Err(_) => {
                self.pending_pongs.remove(&id);
                Err(NodeError::Timeout)
            }
        }
    }

    /// Ask a mesh node's link-establishment layer a hotspot question.
    ///
    /// The response is correlated by message id: the responder echoes the
    /// request's id on its `HotspotResponse`.
    pub async fn request_hotspot(
        &self,
        dest: VirtualAddress,
        request: Bytes,
        timeout: Duration,
    ) -> NodeResult<Bytes> {
        if dest == self.local_addr {
            let responder = self
                .hotspot
                .read()
                .await
                .clone()
                .ok_or(NodeError::NoHotspotResponder)?;
            return Ok(responder.respond(request).await);
        }
        let id = self.ids.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending_hotspots.insert(id, tx);
        if let Err(e) = self
            .send_control(&MmcpMessage::hotspot_request(id, request), dest)
            .await
        {
            self.pending_hotspots.remove(&id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(NodeError::Shutdown),
            Err(_) => {
                self.pending_hotspots.remove(&id);
                Err(NodeError::Timeout)
            }
        }
    }

    /// Shut the node down: stop all tasks, close every link, clear ports
    /// and routes. Idempotent.
    #[instrument(skip(self), fields(node = %self.local_addr))]
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing mesh node");
        let _ = self.shutdown_tx.send(());
        self.links.close_all().await;
        self.ports.clear();
        self.routing.table().clear();
        self.pending_pongs.clear();
        self.pending_hotspots.clear();
    }

    /// Compose and send a datagram from a bound local port.
    pub(crate) async fn send_datagram(
        &self,
        from_port: u16,
        to: VirtualAddress,
        to_port: u16,
        payload: &[u8],
    ) -> NodeResult<()> {
        let header = VirtualPacketHeader {
            to_addr: to,
            to_port,
            from_addr: self.local_addr,
            from_port,
            last_hop_addr: self.local_addr,
            hop_count: 1,
            max_hops: self.config.max_hops,
            payload_size: 0,
        };
        let packet = VirtualPacket::new(header, payload)?;
        self.send_packet(packet).await
    }

    async fn send_control(&self, message: &MmcpMessage, dest: VirtualAddress) -> NodeResult<()> {
        let packet = message.to_packet(self.local_addr, dest, self.config.max_hops)?;
        self.send_packet(packet).await
    }

    /// Send a locally-composed packet, surfacing routing and link errors
    /// to the caller.
    async fn send_packet(&self, packet: VirtualPacket) -> NodeResult<()> {
        let header = *packet.header();
        if header.to_addr == self.local_addr {
            self.deliver_local(&packet).await;
            return Ok(());
        }
        if header.to_addr.is_broadcast() {
            self.forward(packet, None).await;
            return Ok(());
        }
        let hop = match self.routing.lookup_next_hop(header.to_addr)? {
            NextHop::Local => {
                self.deliver_local(&packet).await;
                return Ok(());
            }
            NextHop::Neighbor { addr, .. } => addr,
            NextHop::Relay { via, .. } => via,
        };
        let link = self
            .links
            .first_usable_to(hop)
            .ok_or(RoutingError::NoRouteToHost(header.to_addr))?;
        link.send(&packet).await?;
        Ok(())
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<LinkEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                event = events.recv() => match event {
                    Some(LinkEvent::Packet { link, packet }) => {
                        self.route(packet, link).await;
                    }
                    Some(LinkEvent::Closed { link }) => {
                        self.links.remove(link);
                        let _ = self.events_tx.send(NodeEvent::LinkClosed { link });
                    }
                    None => break,
                },
            }
        }
    }

    async fn advertise_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let start = tokio::time::Instant::now() + self.routing.config().advertise_initial_delay;
        let mut interval = tokio::time::interval_at(start, self.routing.config().advertise_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.routing.advertise().await {
                        warn!(error = %e, "Advertisement failed");
                    }
                }
            }
        }
    }

    async fn liveness_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.routing.config().neighbor_ping_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => self.routing.ping_neighbors().await,
            }
        }
    }

    async fn evict_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.routing.config().evict_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = interval.tick() => {
                    for entry in self.routing.sweep() {
                        let _ = self.events_tx.send(NodeEvent::RouteExpired {
                            origin: entry.origin,
                            hop_count: entry.hop_count,
                        });
                        if entry.hop_count == 1 {
                            let _ = self.events_tx.send(NodeEvent::NeighborLost {
                                addr: entry.origin,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Route one packet that arrived from a link.
    async fn route(&self, mut packet: VirtualPacket, from_link: LinkId) {
        if packet.hop_budget_spent() {
            debug!(
                from = %packet.header().from_addr,
                to = %packet.header().to_addr,
                hops = packet.header().hop_count,
                "Hop budget spent, dropping packet"
            );
            return;
        }

        // Control traffic is consumed here; when the handler says relay
        // (broadcast advertisements), the same packet continues onward.
        if packet.header().to_port == CONTROL_PORT {
            if self.handle_mmcp(&mut packet, from_link).await {
                self.forward(packet, Some(from_link)).await;
            }
            return;
        }

        let header = *packet.header();
        if header.to_addr == self.local_addr {
            self.deliver_local(&packet).await;
        } else if header.to_addr.is_broadcast() {
            self.deliver_local(&packet).await;
            self.forward(packet, Some(from_link)).await;
        } else {
            self.forward(packet, Some(from_link)).await;
        }
    }

    /// Handle a control packet; returns whether to keep relaying it.
    async fn handle_mmcp(&self, packet: &mut VirtualPacket, from_link: LinkId) -> bool {
        let header = *packet.header();
        let Some(link) = self.links.get(from_link) else {
            return false;
        };
        let message = match MmcpMessage::decode(packet.payload()) {
            Ok(message) => message,
            Err(e) => {
                debug!(link = %from_link, error = %e, "Discarding undecodable control frame");
                return false;
            }
        };
        let to_self = header.to_addr == self.local_addr;

        match message.kind {
            MmcpKind::Ping => {
                if !to_self {
                    return true;
                }
                let pong = MmcpMessage::pong(self.ids.next_id(), message.message_id);
                match pong.to_packet(self.local_addr, header.from_addr, self.config.max_hops) {
                    Ok(reply) => self.forward(reply, None).await,
                    Err(e) => warn!(error = %e, "Failed to build pong"),
                }
                false
            }
            MmcpKind::Pong { reply_to } => {
                if !to_self {
                    return true;
                }
                // Keep-alive probes resolve on the link, liveness probes
                // on the routing engine, application pings here.
                if link.handle_pong(reply_to).await.is_some() {
                    return false;
                }
                if self.routing.handle_pong(reply_to).is_some() {
                    return false;
                }
                if let Some((_, waiter)) = self.pending_pongs.remove(&reply_to) {
                    let _ = waiter.send(());
                } else {
                    trace!(reply_to, "Unmatched pong");
                }
                false
            }
            MmcpKind::Hello | MmcpKind::Ack => {
                trace!(link = %from_link, what = message.what(), "Control greeting");
                !to_self
            }
            MmcpKind::HotspotRequest { blob } => {
                if !to_self {
                    return true;
                }
                let responder = self.hotspot.read().await.clone();
                let Some(responder) = responder else {
                    debug!("No hotspot responder registered, dropping request");
                    return false;
                };
                let response = responder.respond(blob).await;
                if header.from_addr == self.local_addr {
                    // Own request came back around the mesh
                    if let Some((_, waiter)) = self.pending_hotspots.remove(&message.message_id)
                    {
                        let _ = waiter.send(response);
                    }
                } else {
                    let reply = MmcpMessage::hotspot_response(message.message_id, response);
                    match reply.to_packet(self.local_addr, header.from_addr, self.config.max_hops)
                    {
                        Ok(reply) => self.forward(reply, None).await,
                        Err(e) => warn!(error = %e, "Failed to build hotspot response"),
                    }
                }
                false
            }
            MmcpKind::HotspotResponse { blob } => {
                if !to_self {
                    return true;
                }
                if let Some((_, waiter)) = self.pending_hotspots.remove(&message.message_id) {
                    let _ = waiter.send(blob);
                } else {
                    trace!(id = message.message_id, "Unmatched hotspot response");
                }
                false
            }
            MmcpKind::Originator(_) => {
                match self.routing.observe_advert(packet, &link).await {
                    Ok(outcome) => {
                        if outcome.new_origin {
                            let _ = self.events_tx.send(NodeEvent::RouteAdded {
                                origin: outcome.origin,
                                hop_count: outcome.hop_count,
                            });
                            if outcome.hop_count == 1 {
                                let _ = self.events_tx.send(NodeEvent::NeighborUp {
                                    addr: outcome.origin,
                                    link: from_link,
                                });
                            }
                        }
                        outcome.relay
                    }
                    Err(e) => {
                        debug!(link = %from_link, error = %e, "Discarding bad advertisement");
                        false
                    }
                }
            }
        }
    }

    /// Deliver a packet addressed to this node.
    async fn deliver_local(&self, packet: &VirtualPacket) {
        let header = *packet.header();
        match self.ports.get(Protocol::Udp, header.to_port) {
            Some(PortBinding::Socket(tx)) => {
                let datagram = Datagram {
                    from: header.from_addr,
                    from_port: header.from_port,
                    payload: Bytes::copy_from_slice(packet.payload()),
                };
                if tx.send(datagram).await.is_err() {
                    debug!(port = header.to_port, "Socket queue gone, dropping datagram");
                }
            }
            Some(PortBinding::Forward { dest, dest_port }) => {
                if dest == self.local_addr {
                    warn!(port = header.to_port, "Forward rule points at this node, dropping");
                    return;
                }
                let fresh = VirtualPacketHeader {
                    to_addr: dest,
                    to_port: dest_port,
                    from_addr: header.from_addr,
                    from_port: header.from_port,
                    last_hop_addr: self.local_addr,
                    hop_count: 1,
                    max_hops: self.config.max_hops,
                    payload_size: 0,
                };
                match VirtualPacket::new(fresh, packet.payload()) {
                    Ok(forwarded) => self.forward(forwarded, None).await,
                    Err(e) => warn!(error = %e, "Failed to re-address forwarded packet"),
                }
            }
            Some(PortBinding::Reserved) | None => {
                debug!(port = header.to_port, "No listener on port, dropping datagram");
            }
        }
    }

    /// Send a packet toward its destination. Relayed packets stamp this
    /// node before transmit; locally-built packets already carry hop
    /// count 1 and this node as last hop.
    async fn forward(&self, mut packet: VirtualPacket, arrived_on: Option<LinkId>) {
        if arrived_on.is_some() {
            packet.increment_hop_count();
            packet.set_last_hop_addr(self.local_addr);
        }

        let header = *packet.header();
        if header.to_addr.is_broadcast() {
            for link in self.links.connected_links() {
                if Some(link.id()) == arrived_on {
                    continue;
                }
                // Never hand a broadcast back to its original source
                if link.remote_addr() == Some(header.from_addr) {
                    continue;
                }
                if let Err(e) = link.send(&packet).await {
                    trace!(link = %link.id(), error = %e, "Broadcast leg failed");
                }
            }
            return;
        }

        match self.routing.lookup_next_hop(header.to_addr) {
            Ok(NextHop::Local) => {
                debug!(to = %header.to_addr, "Next hop is local, dropping");
            }
            Ok(NextHop::Neighbor { addr, .. }) => self.send_via(addr, &packet).await,
            Ok(NextHop::Relay { via, .. }) => self.send_via(via, &packet).await,
            Err(e) => {
                debug!(to = %header.to_addr, error = %e, "Dropping unroutable packet");
            }
        }
    }

    async fn send_via(&self, hop: VirtualAddress, packet: &VirtualPacket) {
        let Some(link) = self.links.first_usable_to(hop) else {
            debug!(hop = %hop, "No usable link toward next hop");
            return;
        };
        if let Err(e) = link.send(packet).await {
            debug!(link = %link.id(), error = %e, "Forward failed");
        }
    }
}

impl std::fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("local_addr", &self.local_addr)
            .field("links", &self.links.len())
            .field("routes", &self.routing.table().len())
            .finish()
    }
}
