//! Mesh node runtime
//!
//! Ties the link layer and the routing control plane together into a
//! running overlay participant: a [`MeshNode`] owns its links, keeps a
//! routing table fed by originator advertisements, and exposes virtual
//! datagram sockets plus static forward rules over the node's port
//! table.
//!
//! ```no_run
//! use weft_node::{MeshNode, NodeConfig};
//!
//! # async fn demo() -> Result<(), weft_node::NodeError> {
//! let node = MeshNode::start(NodeConfig::default());
//! let socket = node.open_socket(None)?;
//! println!("listening on {}:{}", node.local_address(), socket.local_port());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod node;
pub mod ports;
pub mod socket;

pub use config::NodeConfig;
pub use error::{NodeError, NodeResult};
pub use events::NodeEvent;
pub use node::{HotspotResponder, MeshNode};
pub use ports::{PortBinding, PortTable, Protocol};
pub use socket::{Datagram, MeshSocket};

pub use weft_core::VirtualAddress;
pub use weft_link::LinkConfig;
pub use weft_routing::{NeighborSnapshot, RouteSnapshot, RoutingConfig};
