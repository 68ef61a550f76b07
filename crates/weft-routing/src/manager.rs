//! The originator advertisement manager
//!
//! Owns the routing side of the control plane: it broadcasts this node's
//! advertisements, folds received advertisements into the
//! [`OriginatorTable`], measures neighbor latency with liveness pings,
//! and answers next-hop queries. Timers live in the node; this type
//! exposes one operation per tick so the node's loops stay thin.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace, warn};

use weft_core::{
    MAX_PAYLOAD_SIZE, MMCP_HEADER_SIZE, MessageIdGenerator, MmcpError, MmcpKind, MmcpMessage,
    ORIGINATOR_FIXED_SIZE, OriginatorMessage, VirtualAddress, VirtualPacket, bump_ping_time_sum,
};
use weft_link::{LinkId, LinkManager, NeighborLink};

use crate::error::{RoutingError, RoutingResult};
use crate::table::{OriginatorTable, RouteEntry};

/// Largest capability blob an advertisement can carry and still fit in a
/// single control packet.
pub const MAX_CAPABILITY_BLOB: usize =
    MAX_PAYLOAD_SIZE - MMCP_HEADER_SIZE - ORIGINATOR_FIXED_SIZE;

/// Timing knobs for the routing control plane.
///
/// The defaults match the reference protocol timings; tests shrink them
/// to keep runs fast.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// How often this node broadcasts its own advertisement
    pub advertise_interval: Duration,
    /// Delay before the first scheduled advertisement
    pub advertise_initial_delay: Duration,
    /// How often each known neighbor gets a liveness ping
    pub neighbor_ping_interval: Duration,
    /// How long a liveness ping may wait for its pong
    pub ping_timeout: Duration,
    /// How often the eviction sweep runs
    pub evict_interval: Duration,
    /// Routes not refreshed within this window are evicted
    pub lost_node_timeout: Duration,
    /// Overall deadline for the neighbor join handshake
    pub join_timeout: Duration,
    /// How often the join handshake re-sends its advertisement
    pub join_retry_interval: Duration,
    /// Hop budget stamped on outgoing control packets
    pub max_hops: u8,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            advertise_interval: Duration::from_secs(3),
            advertise_initial_delay: Duration::from_secs(1),
            neighbor_ping_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(15),
            evict_interval: Duration::from_secs(1),
            lost_node_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(10),
            join_retry_interval: Duration::from_secs(1),
            max_hops: weft_core::DEFAULT_MAX_HOPS,
        }
    }
}

/// Where a packet for some destination should go next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextHop {
    /// The destination is this node.
    Local,
    /// The destination is adjacent; send on a link to it.
    Neighbor {
        addr: VirtualAddress,
        service: Option<SocketAddr>,
    },
    /// The destination is reached through an adjacent relay.
    Relay {
        via: VirtualAddress,
        service: Option<SocketAddr>,
    },
}

/// What [`OriginatorManager::observe_advert`] concluded about a received
/// advertisement.
#[derive(Debug, Clone, Copy)]
pub struct AdvertOutcome {
    /// The advertisement improved the table; the node should re-broadcast
    /// it so the rest of the mesh hears it too.
    pub relay: bool,
    /// The origin was previously unknown.
    pub new_origin: bool,
    pub origin: VirtualAddress,
    pub hop_count: u8,
}

/// A known adjacent node, for status surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborSnapshot {
    pub addr: VirtualAddress,
    pub link: LinkId,
    pub service: Option<SocketAddr>,
    pub rtt_ms: Option<u64>,
}

/// A routing table row, for status surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSnapshot {
    pub origin: VirtualAddress,
    pub next_hop: VirtualAddress,
    pub hop_count: u8,
    pub ping_time_sum: i16,
    pub sent_time: i64,
    pub age_ms: u64,
}

/// A liveness ping awaiting its pong.
#[derive(Debug, Clone, Copy)]
struct PendingPing {
    neighbor: VirtualAddress,
    sent_at: Instant,
}

/// Routing control plane for one node.
///
/// Shared behind an [`Arc`] by the node's dispatch loop and timers. All
/// state lives in concurrent maps, so every operation takes `&self`.
pub struct OriginatorManager {
    local_addr: VirtualAddress,
    config: RoutingConfig,
    table: OriginatorTable,
    links: Arc<LinkManager>,
    ids: Arc<MessageIdGenerator>,
    /// Liveness pings in flight, keyed by message id.
    pending_pings: DashMap<i32, PendingPing>,
    /// Last measured round trip per neighbor.
    neighbor_rtts: DashMap<VirtualAddress, Duration>,
    /// Opaque payload carried by this node's advertisements.
    capability_blob: RwLock<Bytes>,
}

impl OriginatorManager {
    pub fn new(
        local_addr: VirtualAddress,
        config: RoutingConfig,
        links: Arc<LinkManager>,
        ids: Arc<MessageIdGenerator>,
    ) -> Self {
        Self {
            local_addr,
            config,
            table: OriginatorTable::new(),
            links,
            ids,
            pending_pings: DashMap::new(),
            neighbor_rtts: DashMap::new(),
            capability_blob: RwLock::new(Bytes::new()),
        }
    }

    pub fn local_addr(&self) -> VirtualAddress {
        self.local_addr
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    pub fn table(&self) -> &OriginatorTable {
        &self.table
    }

    /// Replace the capability blob carried by future advertisements.
    pub async fn set_capability_blob(&self, blob: Bytes) -> RoutingResult<()> {
        if blob.len() > MAX_CAPABILITY_BLOB {
            return Err(MmcpError::BlobTooLarge {
                size: blob.len(),
                max: MAX_CAPABILITY_BLOB,
            }
            .into());
        }
        *self.capability_blob.write().await = blob;
        Ok(())
    }

    /// Broadcast this node's advertisement on every connected link.
    ///
    /// A link that fails to send closes itself; the broadcast carries on
    /// to the remaining links.
    pub async fn advertise(&self) -> RoutingResult<()> {
        let packet = self.build_advert().await?;
        for link in self.links.connected_links() {
            if let Err(e) = link.send(&packet).await {
                debug!(link = %link.id(), error = %e, "Advertise failed on link");
            }
        }
        Ok(())
    }

    /// Send this node's advertisement on one specific link.
    pub async fn advertise_on(&self, link: &NeighborLink) -> RoutingResult<()> {
        let packet = self.build_advert().await?;
        link.send(&packet).await?;
        Ok(())
    }

    async fn build_advert(&self) -> RoutingResult<VirtualPacket> {
        let blob = self.capability_blob.read().await.clone();
        let message =
            MmcpMessage::originator(self.ids.next_id(), OriginatorMessage::now(blob));
        Ok(message.to_packet(
            self.local_addr,
            VirtualAddress::BROADCAST,
            self.config.max_hops,
        )?)
    }

    /// Fold a received advertisement into the table.
    ///
    /// The frame's accumulated-latency word is bumped in place by the
    /// arrival link's measured round trip before the freshness comparison,
    /// so relaying the same packet propagates the corrected value. When an
    /// unknown adjacent origin appears, this node answers with its own
    /// advertisement at once instead of waiting for the next scheduled
    /// broadcast.
    pub async fn observe_advert(
        &self,
        packet: &mut VirtualPacket,
        link: &NeighborLink,
    ) -> RoutingResult<AdvertOutcome> {
        let header = *packet.header();
        let origin = header.from_addr;

        // Our own advertisement came back around the mesh
        if origin == self.local_addr {
            return Ok(AdvertOutcome {
                relay: false,
                new_origin: false,
                origin,
                hop_count: header.hop_count,
            });
        }

        let delta_ms = link
            .rtt()
            .map(|rtt| i16::try_from(rtt.as_millis()).unwrap_or(i16::MAX))
            .unwrap_or(0);
        let ping_time_sum = bump_ping_time_sum(packet.payload_mut(), delta_ms)?;

        let message = MmcpMessage::decode(packet.payload())?;
        let what = message.what();
        let MmcpKind::Originator(advert) = message.kind else {
            return Err(MmcpError::NotOriginator(what).into());
        };

        let entry = RouteEntry {
            origin,
            sent_time: advert.sent_time,
            ping_time_sum,
            hop_count: header.hop_count,
            blob: advert.blob,
            last_hop_addr: header.last_hop_addr,
            last_hop_service: link.remote_service(),
            link: link.id(),
            received_at: Instant::now(),
        };
        let outcome = self.table.observe(entry);
        if outcome.accepted {
            debug!(
                origin = %origin,
                via = %header.last_hop_addr,
                hops = header.hop_count,
                ping_time_sum,
                "Route updated"
            );
        } else {
            trace!(origin = %origin, "Advertisement not better than known route");
        }

        // A first-time adjacent origin learns our routes without waiting
        // for the next advertise tick
        if outcome.accepted && outcome.new_origin && header.hop_count == 1 {
            if let Err(e) = self.advertise_on(link).await {
                debug!(link = %link.id(), error = %e, "Reply advertisement failed");
            }
        }

        Ok(AdvertOutcome {
            relay: outcome.accepted,
            new_origin: outcome.new_origin,
            origin,
            hop_count: header.hop_count,
        })
    }

    /// Send a liveness ping to every known adjacent origin.
    ///
    /// Each ping is recorded before it is written so a fast pong can
    /// never race the bookkeeping.
    pub async fn ping_neighbors(&self) {
        for entry in self.table.neighbors() {
            let Some(link) = self.links.first_usable_to(entry.origin) else {
                trace!(neighbor = %entry.origin, "No usable link for liveness ping");
                continue;
            };
            let id = self.ids.next_id();
            let packet = match MmcpMessage::ping(id).to_packet(
                self.local_addr,
                entry.origin,
                self.config.max_hops,
            ) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(neighbor = %entry.origin, error = %e, "Failed to build liveness ping");
                    continue;
                }
            };
            self.pending_pings.insert(
                id,
                PendingPing {
                    neighbor: entry.origin,
                    sent_at: Instant::now(),
                },
            );
            if link.send(&packet).await.is_err() {
                self.pending_pings.remove(&id);
            }
        }
    }

    /// Resolve a pong against the outstanding liveness pings.
    ///
    /// Returns the neighbor and its measured round trip when `reply_to`
    /// matches a pending ping; unmatched pongs are stale and ignored.
    pub fn handle_pong(&self, reply_to: i32) -> Option<(VirtualAddress, Duration)> {
        let (_, pending) = self.pending_pings.remove(&reply_to)?;
        let rtt = pending.sent_at.elapsed().max(Duration::from_millis(1));
        self.neighbor_rtts.insert(pending.neighbor, rtt);
        trace!(
            neighbor = %pending.neighbor,
            rtt_ms = rtt.as_millis() as u64,
            "Liveness pong"
        );
        Some((pending.neighbor, rtt))
    }

    /// Evict routes that were not refreshed within the lost-node window
    /// and abandon liveness pings that outlived their pong deadline.
    ///
    /// Returns the evicted routes so the node can announce them.
    pub fn sweep(&self) -> Vec<RouteEntry> {
        let removed = self.table.prune_lost(self.config.lost_node_timeout);
        for entry in &removed {
            self.neighbor_rtts.remove(&entry.origin);
            debug!(origin = %entry.origin, hops = entry.hop_count, "Route lost");
        }
        let ping_timeout = self.config.ping_timeout;
        self.pending_pings
            .retain(|_, pending| pending.sent_at.elapsed() < ping_timeout);
        removed
    }

    /// Where a packet for `dest` should go next.
    pub fn lookup_next_hop(&self, dest: VirtualAddress) -> RoutingResult<NextHop> {
        if dest == self.local_addr {
            return Ok(NextHop::Local);
        }
        let entry = self
            .table
            .get(dest)
            .ok_or(RoutingError::NoRouteToHost(dest))?;
        if entry.hop_count == 1 {
            Ok(NextHop::Neighbor {
                addr: dest,
                service: entry.last_hop_service,
            })
        } else {
            Ok(NextHop::Relay {
                via: entry.last_hop_addr,
                service: entry.last_hop_service,
            })
        }
    }

    /// Run the join handshake on a freshly attached link.
    ///
    /// Sends this node's advertisement and waits for the far end's to
    /// land in the table, re-sending every retry interval. Completes when
    /// the link carries a hop-one route; fails with
    /// [`RoutingError::NeighborJoinTimeout`] when the deadline passes
    /// first.
    #[instrument(skip(self, link), fields(link = %link.id()))]
    pub async fn add_neighbor(&self, link: &NeighborLink) -> RoutingResult<()> {
        let mut revision = self.table.revision_watch();
        let handshake = async {
            loop {
                if self.joined_on(link) {
                    return Ok(());
                }
                self.advertise_on(link).await?;
                let retry = tokio::time::sleep(self.config.join_retry_interval);
                tokio::pin!(retry);
                loop {
                    tokio::select! {
                        _ = &mut retry => break,
                        changed = revision.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            if self.joined_on(link) {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        };
        match tokio::time::timeout(self.config.join_timeout, handshake).await {
            Ok(result) => {
                if result.is_ok() {
                    debug!("Neighbor joined");
                }
                result
            }
            Err(_) => {
                warn!("Neighbor join timed out");
                Err(RoutingError::NeighborJoinTimeout)
            }
        }
    }

    fn joined_on(&self, link: &NeighborLink) -> bool {
        self.table
            .snapshot()
            .iter()
            .any(|entry| entry.hop_count == 1 && entry.link == link.id())
    }

    /// Known adjacent nodes, with their last measured round trips.
    pub fn neighbors(&self) -> Vec<NeighborSnapshot> {
        self.table
            .neighbors()
            .into_iter()
            .map(|entry| {
                let rtt = self
                    .neighbor_rtts
                    .get(&entry.origin)
                    .map(|rtt| *rtt)
                    .or_else(|| self.links.get(entry.link).and_then(|link| link.rtt()));
                NeighborSnapshot {
                    addr: entry.origin,
                    link: entry.link,
                    service: entry.last_hop_service,
                    rtt_ms: rtt.map(|rtt| rtt.as_millis() as u64),
                }
            })
            .collect()
    }

    /// Every route this node knows, as plain data.
    pub fn routes(&self) -> Vec<RouteSnapshot> {
        self.table
            .snapshot()
            .into_iter()
            .map(|entry| RouteSnapshot {
                origin: entry.origin,
                next_hop: entry.last_hop_addr,
                hop_count: entry.hop_count,
                ping_time_sum: entry.ping_time_sum,
                sent_time: entry.sent_time,
                age_ms: entry.received_at.elapsed().as_millis() as u64,
            })
            .collect()
    }
}

impl std::fmt::Debug for OriginatorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginatorManager")
            .field("local_addr", &self.local_addr)
            .field("routes", &self.table.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc;
    use weft_link::{LinkConfig, LinkEvent, framing};

    const QUIET: Duration = Duration::from_secs(3600);

    fn addr(tail: u8) -> VirtualAddress {
        VirtualAddress::from_octets([169, 254, 0, tail])
    }

    fn test_config() -> RoutingConfig {
        RoutingConfig {
            ping_timeout: Duration::from_millis(30),
            lost_node_timeout: Duration::from_millis(30),
            join_timeout: Duration::from_millis(150),
            join_retry_interval: Duration::from_millis(20),
            ..RoutingConfig::default()
        }
    }

    struct Setup {
        manager: Arc<OriginatorManager>,
        links: Arc<LinkManager>,
        events: mpsc::Receiver<LinkEvent>,
    }

    fn setup(local: VirtualAddress, keepalive: Duration) -> Setup {
        let (tx, events) = mpsc::channel(64);
        let ids = Arc::new(MessageIdGenerator::new());
        let links = Arc::new(LinkManager::new(
            local,
            LinkConfig {
                keepalive_interval: keepalive,
                ..LinkConfig::default()
            },
            tx,
            Arc::clone(&ids),
        ));
        let manager = Arc::new(OriginatorManager::new(
            local,
            test_config(),
            Arc::clone(&links),
            ids,
        ));
        Setup {
            manager,
            links,
            events,
        }
    }

    fn advert_packet(
        origin: VirtualAddress,
        via: VirtualAddress,
        hop_count: u8,
        sent_time: i64,
        ping_time_sum: i16,
    ) -> VirtualPacket {
        let advert = OriginatorMessage {
            ping_time_sum,
            sent_time,
            blob: Bytes::new(),
        };
        let mut packet = MmcpMessage::originator(77, advert)
            .to_packet(origin, VirtualAddress::BROADCAST, 8)
            .unwrap();
        for _ in 1..hop_count {
            packet.increment_hop_count();
        }
        packet.set_last_hop_addr(via);
        packet
    }

    #[tokio::test]
    async fn test_observe_advert_records_route() {
        let setup = setup(addr(1), QUIET);
        let (a_side, mut b_side) = tokio::io::duplex(4096);
        let link = setup.links.attach(a_side, Some(addr(2)), None);

        let mut packet = advert_packet(addr(2), addr(2), 1, 1000, 0);
        let outcome = setup.manager.observe_advert(&mut packet, &link).await.unwrap();
        assert!(outcome.relay);
        assert!(outcome.new_origin);
        assert_eq!(outcome.origin, addr(2));

        // The new adjacent origin gets an immediate advertisement back
        let reply = framing::read_packet(&mut b_side).await.unwrap();
        assert_eq!(reply.header().from_addr, addr(1));
        assert!(reply.header().to_addr.is_broadcast());
        let message = MmcpMessage::decode(reply.payload()).unwrap();
        assert!(matches!(message.kind, MmcpKind::Originator(_)));

        // A refresh from a known origin does not trigger another reply
        let mut refresh = advert_packet(addr(2), addr(2), 1, 1001, 0);
        let outcome = setup.manager.observe_advert(&mut refresh, &link).await.unwrap();
        assert!(outcome.relay);
        assert!(!outcome.new_origin);
        let silent =
            tokio::time::timeout(Duration::from_millis(30), framing::read_packet(&mut b_side))
                .await;
        assert!(silent.is_err());
    }

    #[tokio::test]
    async fn test_own_advert_is_not_relayed() {
        let setup = setup(addr(1), QUIET);
        let (a_side, _b_side) = tokio::io::duplex(4096);
        let link = setup.links.attach(a_side, Some(addr(2)), None);

        let mut packet = advert_packet(addr(1), addr(2), 2, 1000, 0);
        let outcome = setup.manager.observe_advert(&mut packet, &link).await.unwrap();
        assert!(!outcome.relay);
        assert!(setup.manager.table().is_empty());
    }

    #[tokio::test]
    async fn test_stale_advert_is_not_relayed() {
        let setup = setup(addr(1), QUIET);
        let (a_side, _b_side) = tokio::io::duplex(4096);
        let link = setup.links.attach(a_side, Some(addr(2)), None);

        let mut fresh = advert_packet(addr(5), addr(2), 2, 2000, 0);
        assert!(setup.manager.observe_advert(&mut fresh, &link).await.unwrap().relay);

        let mut stale = advert_packet(addr(5), addr(2), 1, 1000, 0);
        let outcome = setup.manager.observe_advert(&mut stale, &link).await.unwrap();
        assert!(!outcome.relay);
        assert_eq!(setup.manager.table().get(addr(5)).unwrap().sent_time, 2000);
    }

    #[tokio::test]
    async fn test_observe_advert_adds_link_latency() {
        let setup = setup(addr(1), Duration::from_millis(50));
        let (a_side, mut b_side) = tokio::io::duplex(4096);
        let link = setup.links.attach(a_side, Some(addr(2)), None);

        // Resolve one keep-alive so the link has a measured round trip
        let ping = framing::read_packet(&mut b_side).await.unwrap();
        let message = MmcpMessage::decode(ping.payload()).unwrap();
        link.handle_pong(message.message_id).await.unwrap();
        assert!(link.rtt().is_some());

        let mut packet = advert_packet(addr(5), addr(2), 2, 1000, 10);
        setup.manager.observe_advert(&mut packet, &link).await.unwrap();

        let entry = setup.manager.table().get(addr(5)).unwrap();
        assert!(entry.ping_time_sum >= 11);

        // The frame the node would relay carries the bumped value
        let relayed = MmcpMessage::decode(packet.payload()).unwrap();
        match relayed.kind {
            MmcpKind::Originator(advert) => {
                assert_eq!(advert.ping_time_sum, entry.ping_time_sum)
            }
            other => panic!("expected originator, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_advertise_reaches_every_connected_link() {
        let setup = setup(addr(1), QUIET);
        let (a1, mut b1) = tokio::io::duplex(4096);
        let (a2, mut b2) = tokio::io::duplex(4096);
        setup.links.attach(a1, Some(addr(2)), None);
        setup.links.attach(a2, Some(addr(3)), None);

        setup.manager.advertise().await.unwrap();

        for side in [&mut b1, &mut b2] {
            let packet = framing::read_packet(side).await.unwrap();
            assert!(packet.header().to_addr.is_broadcast());
            assert_eq!(packet.header().from_addr, addr(1));
            assert_eq!(packet.header().hop_count, 1);
            let message = MmcpMessage::decode(packet.payload()).unwrap();
            assert!(matches!(message.kind, MmcpKind::Originator(_)));
        }
    }

    #[tokio::test]
    async fn test_capability_blob_rides_the_advert() {
        let setup = setup(addr(1), QUIET);
        setup
            .manager
            .set_capability_blob(Bytes::from_static(b"wifi:5g"))
            .await
            .unwrap();

        let (a_side, mut b_side) = tokio::io::duplex(4096);
        let link = setup.links.attach(a_side, Some(addr(2)), None);
        setup.manager.advertise_on(&link).await.unwrap();

        let packet = framing::read_packet(&mut b_side).await.unwrap();
        let message = MmcpMessage::decode(packet.payload()).unwrap();
        match message.kind {
            MmcpKind::Originator(advert) => assert_eq!(&advert.blob[..], b"wifi:5g"),
            other => panic!("expected originator, got {:?}", other),
        }

        let oversized = Bytes::from(vec![0u8; MAX_CAPABILITY_BLOB + 1]);
        assert!(setup.manager.set_capability_blob(oversized).await.is_err());
    }

    #[tokio::test]
    async fn test_lookup_next_hop() {
        let setup = setup(addr(1), QUIET);
        let (a_side, _b_side) = tokio::io::duplex(4096);
        let link = setup.links.attach(a_side, Some(addr(2)), None);

        assert_eq!(setup.manager.lookup_next_hop(addr(1)).unwrap(), NextHop::Local);
        assert!(matches!(
            setup.manager.lookup_next_hop(addr(9)),
            Err(RoutingError::NoRouteToHost(_))
        ));

        let mut adjacent = advert_packet(addr(2), addr(2), 1, 1000, 0);
        setup.manager.observe_advert(&mut adjacent, &link).await.unwrap();
        assert!(matches!(
            setup.manager.lookup_next_hop(addr(2)).unwrap(),
            NextHop::Neighbor { addr: hop, .. } if hop == addr(2)
        ));

        let mut distant = advert_packet(addr(5), addr(2), 2, 1000, 0);
        setup.manager.observe_advert(&mut distant, &link).await.unwrap();
        assert!(matches!(
            setup.manager.lookup_next_hop(addr(5)).unwrap(),
            NextHop::Relay { via, .. } if via == addr(2)
        ));
    }

    #[tokio::test]
    async fn test_sweep_evicts_unrefreshed_routes() {
        let setup = setup(addr(1), QUIET);
        let (a_side, _b_side) = tokio::io::duplex(4096);
        let link = setup.links.attach(a_side, Some(addr(2)), None);

        let mut packet = advert_packet(addr(5), addr(2), 2, 1000, 0);
        setup.manager.observe_advert(&mut packet, &link).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let removed = setup.manager.sweep();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].origin, addr(5));
        assert!(matches!(
            setup.manager.lookup_next_hop(addr(5)),
            Err(RoutingError::NoRouteToHost(_))
        ));
    }

    #[tokio::test]
    async fn test_liveness_ping_round() {
        let setup = setup(addr(1), QUIET);
        let (a_side, mut b_side) = tokio::io::duplex(4096);
        let link = setup.links.attach(a_side, Some(addr(2)), None);

        let mut packet = advert_packet(addr(2), addr(2), 1, 1000, 0);
        setup.manager.observe_advert(&mut packet, &link).await.unwrap();
        // Drain the immediate reply advertisement
        framing::read_packet(&mut b_side).await.unwrap();

        setup.manager.ping_neighbors().await;
        let ping = framing::read_packet(&mut b_side).await.unwrap();
        assert_eq!(ping.header().to_addr, addr(2));
        assert_eq!(ping.header().to_port, 0);
        let message = MmcpMessage::decode(ping.payload()).unwrap();
        assert_eq!(message.kind, MmcpKind::Ping);

        // A stale pong resolves nothing
        assert!(setup.manager.handle_pong(message.message_id + 900).is_none());

        let (neighbor, rtt) = setup.manager.handle_pong(message.message_id).unwrap();
        assert_eq!(neighbor, addr(2));
        assert!(rtt >= Duration::from_millis(1));

        let snapshot = setup.manager.neighbors();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].addr, addr(2));
        assert!(snapshot[0].rtt_ms.is_some());
    }

    #[tokio::test]
    async fn test_add_neighbor_completes_when_adverts_flow() {
        let setup = setup(addr(1), QUIET);
        let (a_side, mut b_side) = tokio::io::duplex(4096);
        let link = setup.links.attach(a_side, Some(addr(2)), None);

        // Dispatch received packets into the manager, as the node would
        let manager = Arc::clone(&setup.manager);
        let links = Arc::clone(&setup.links);
        let mut events = setup.events;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let LinkEvent::Packet { link, mut packet } = event {
                    if let Some(link) = links.get(link) {
                        let _ = manager.observe_advert(&mut packet, &link).await;
                    }
                }
            }
        });

        // The far end answers the join advertisement with its own
        tokio::spawn(async move {
            let _ = framing::read_packet(&mut b_side).await;
            let reply = advert_packet(addr(2), addr(2), 1, 5000, 0);
            let _ = framing::write_packet(&mut b_side, &reply).await;
            while framing::read_packet(&mut b_side).await.is_ok() {}
        });

        setup.manager.add_neighbor(&link).await.unwrap();
        assert!(matches!(
            setup.manager.lookup_next_hop(addr(2)).unwrap(),
            NextHop::Neighbor { addr: hop, .. } if hop == addr(2)
        ));
    }

    #[tokio::test]
    async fn test_add_neighbor_times_out_on_silence() {
        let setup = setup(addr(1), QUIET);
        let (a_side, _b_side) = tokio::io::duplex(4096);
        let link = setup.links.attach(a_side, None, None);

        let err = setup.manager.add_neighbor(&link).await.unwrap_err();
        assert!(matches!(err, RoutingError::NeighborJoinTimeout));
    }
}
