//! # Weft Routing
//!
//! Proactive routing for the Weft mesh.
//!
//! Every node periodically advertises itself with an originator message
//! flooded across the mesh; what each node remembers about those
//! advertisements *is* the routing table. There is no separate topology
//! exchange and no route computation beyond remembering the best recent
//! advertisement per origin.
//!
//! ## Core Components
//!
//! - [`OriginatorManager`]: drives advertisements, liveness pings, and
//!   eviction, and answers next-hop queries
//! - [`OriginatorTable`]: the table of best-known advertisements with a
//!   revision watch for event-driven waits
//! - [`RouteEntry`]: one remembered advertisement and where it came from
//! - [`NextHop`]: the answer to "which adjacent node gets this packet"
//!
//! ## Routing Algorithm
//!
//! 1. **Advertise**: on a short timer each node floods an originator
//!    message carrying its send time and capability blob, hop count 1.
//! 2. **Accept or drop**: a node receiving an advertisement first adds the
//!    arrival link's measured round-trip time to the message's accumulated
//!    latency, then accepts it if it is strictly newer than the known one,
//!    or equally new with a shorter path. Accepted advertisements replace
//!    the table entry and are relayed onward; rejected ones stop here.
//! 3. **Next hop**: packets for an origin are handed to the adjacent node
//!    the accepted advertisement arrived from; a hop-count-1 entry means
//!    the origin itself is adjacent.
//! 4. **Evict**: entries not refreshed within the lost-node timeout are
//!    swept out, so silence is what removes a vanished node.
//!
//! ## Liveness
//!
//! Direct neighbors are additionally pinged on their own timer; measured
//! round trips (floored at 1 ms) feed the latency accumulation and the
//! neighbor snapshots. An unanswered ping expires quietly; eviction is
//! driven by missing advertisements, not missing pongs.

pub mod error;
pub mod manager;
pub mod table;

// Re-export main types
pub use error::{RoutingError, RoutingResult};
pub use manager::{
    AdvertOutcome, NeighborSnapshot, NextHop, OriginatorManager, RouteSnapshot, RoutingConfig,
    MAX_CAPABILITY_BLOB,
};
pub use table::{OriginatorTable, RouteEntry, is_more_recent_or_better};
