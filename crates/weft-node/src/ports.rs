//! The local port table
//!
//! Tracks which virtual ports are bound, under which protocol, and what a
//! delivered packet on each port goes to. Port 0 is the control plane and
//! can never be bound.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use weft_core::VirtualAddress;

use crate::error::NodeError;
use crate::socket::Datagram;

/// Transport protocol namespace a virtual port is allocated under.
///
/// The namespaces are independent: the same port number may be bound under
/// both at once, as on a real IP stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Udp,
    Tcp,
}

/// What a bound port delivers to.
#[derive(Debug, Clone)]
pub enum PortBinding {
    /// A virtual datagram socket's receive queue.
    Socket(mpsc::Sender<Datagram>),
    /// A static forward rule: delivered packets are re-addressed to the
    /// destination and re-sent.
    Forward {
        dest: VirtualAddress,
        dest_port: u16,
    },
    /// Reserved with no delivery target (chain bind points and the like).
    Reserved,
}

/// Start of the range random allocation draws from, as on real IP stacks.
const EPHEMERAL_MIN: u16 = 49152;

/// Random draws before allocation gives up.
const MAX_RANDOM_ATTEMPTS: usize = 64;

/// Bound virtual ports for one node.
#[derive(Debug, Default)]
pub struct PortTable {
    bound: DashMap<(Protocol, u16), PortBinding>,
}

impl PortTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a port, returning the port number actually bound.
    ///
    /// An explicit request fails with [`NodeError::PortInUse`] when the
    /// port is taken (port 0 always counts as taken). `None` draws random
    /// ports from the ephemeral range, failing with
    /// [`NodeError::PortAllocationExhausted`] after a bounded number of
    /// attempts.
    pub fn allocate(
        &self,
        protocol: Protocol,
        requested: Option<u16>,
        binding: PortBinding,
    ) -> Result<u16, NodeError> {
        match requested {
            Some(0) => Err(NodeError::PortInUse(0)),
            Some(port) => match self.bound.entry((protocol, port)) {
                Entry::Occupied(_) => Err(NodeError::PortInUse(port)),
                Entry::Vacant(slot) => {
                    slot.insert(binding);
                    Ok(port)
                }
            },
            None => {
                let mut rng = rand::rng();
                for _ in 0..MAX_RANDOM_ATTEMPTS {
                    let port = rng.random_range(EPHEMERAL_MIN..=u16::MAX);
                    if let Entry::Vacant(slot) = self.bound.entry((protocol, port)) {
                        slot.insert(binding.clone());
                        return Ok(port);
                    }
                }
                Err(NodeError::PortAllocationExhausted)
            }
        }
    }

    /// Release a port. Releasing an unbound port is a no-op.
    pub fn release(&self, protocol: Protocol, port: u16) {
        self.bound.remove(&(protocol, port));
    }

    pub fn get(&self, protocol: Protocol, port: u16) -> Option<PortBinding> {
        self.bound
            .get(&(protocol, port))
            .map(|binding| binding.clone())
    }

    pub fn is_bound(&self, protocol: Protocol, port: u16) -> bool {
        self.bound.contains_key(&(protocol, port))
    }

    pub fn len(&self) -> usize {
        self.bound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }

    pub fn clear(&self) {
        self.bound.clear();
    }
}
