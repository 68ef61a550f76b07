//! Node events for observers

use serde::{Deserialize, Serialize};

use weft_core::VirtualAddress;
use weft_link::LinkId;

/// Things a running node announces on its event stream.
///
/// Delivered through a `tokio::sync::broadcast` channel; slow subscribers
/// may observe lag, never block the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeEvent {
    /// A previously unknown adjacent node appeared.
    NeighborUp { addr: VirtualAddress, link: LinkId },
    /// A hop-one route expired without refresh.
    NeighborLost { addr: VirtualAddress },
    /// A route to a previously unknown origin was recorded.
    RouteAdded { origin: VirtualAddress, hop_count: u8 },
    /// A route was evicted by the staleness sweep.
    RouteExpired { origin: VirtualAddress, hop_count: u8 },
    /// A link ended and left the registry.
    LinkClosed { link: LinkId },
}
