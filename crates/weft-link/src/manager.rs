//! Link registry and attachment
//!
//! The [`LinkManager`] turns transports handed in by the host platform
//! into running [`NeighborLink`]s, issues link ids from a node-local
//! counter, and keeps the registry consulted by forwarding.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info};

use weft_core::{MessageIdGenerator, VirtualAddress};

use crate::link::{LinkConfig, LinkEvent, LinkId, NeighborLink};

/// Attaches transports and tracks the node's live links.
///
/// Several links to the same neighbor may coexist (one per physical
/// connection); forwarding picks the first usable one.
pub struct LinkManager {
    /// This node's overlay address, stamped on keep-alive pings
    local_addr: VirtualAddress,
    /// Link behavior shared by every attached link
    config: LinkConfig,
    /// Live links indexed by id
    links: DashMap<LinkId, Arc<NeighborLink>>,
    /// Where every link delivers received packets
    events: mpsc::Sender<LinkEvent>,
    /// Shared MMCP id source
    ids: Arc<MessageIdGenerator>,
    next_id: AtomicU64,
}

impl LinkManager {
    pub fn new(
        local_addr: VirtualAddress,
        config: LinkConfig,
        events: mpsc::Sender<LinkEvent>,
        ids: Arc<MessageIdGenerator>,
    ) -> Self {
        Self {
            local_addr,
            config,
            links: DashMap::new(),
            events,
            ids,
            next_id: AtomicU64::new(1),
        }
    }

    /// Wrap an already-open transport in a link and register it.
    ///
    /// `remote_addr` and `remote_service` may be unknown at attach time;
    /// the overlay address is then learned from the first received packet.
    pub fn attach<T>(
        &self,
        transport: T,
        remote_addr: Option<VirtualAddress>,
        remote_service: Option<SocketAddr>,
    ) -> Arc<NeighborLink>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = LinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let link = NeighborLink::spawn(
            id,
            transport,
            self.local_addr,
            remote_addr,
            remote_service,
            self.config.clone(),
            self.events.clone(),
            Arc::clone(&self.ids),
        );
        self.links.insert(id, Arc::clone(&link));
        info!(
            link = %id,
            remote_addr = ?remote_addr,
            remote_service = ?remote_service,
            "Neighbor link attached"
        );
        link
    }

    pub fn get(&self, id: LinkId) -> Option<Arc<NeighborLink>> {
        self.links.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop a link from the registry. The caller closes it.
    pub fn remove(&self, id: LinkId) -> Option<Arc<NeighborLink>> {
        self.links.remove(&id).map(|(_, link)| {
            debug!(link = %id, "Link removed from registry");
            link
        })
    }

    /// The first usable link whose far end is `addr`: lowest id wins so
    /// the choice is stable across calls.
    pub fn first_usable_to(&self, addr: VirtualAddress) -> Option<Arc<NeighborLink>> {
        self.links
            .iter()
            .filter(|entry| {
                let link = entry.value();
                link.is_connected() && link.remote_addr() == Some(addr)
            })
            .min_by_key(|entry| *entry.key())
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every currently connected link.
    pub fn connected_links(&self) -> Vec<Arc<NeighborLink>> {
        self.links
            .iter()
            .filter(|entry| entry.value().is_connected())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Close every link and clear the registry.
    pub async fn close_all(&self) {
        let links: Vec<_> = self
            .links
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.links.clear();
        for link in links {
            link.close().await;
        }
    }
}
