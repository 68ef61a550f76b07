//! Error types for node operations

use thiserror::Error;

use weft_core::{MmcpError, WireError};
use weft_link::LinkError;
use weft_routing::RoutingError;

/// Errors surfaced by [`MeshNode`](crate::node::MeshNode) operations.
#[derive(Error, Debug)]
pub enum NodeError {
    /// The requested port is already bound under that protocol
    #[error("Port {0} is already bound")]
    PortInUse(u16),

    /// Random port allocation gave up after its retry budget
    #[error("No free port found")]
    PortAllocationExhausted,

    /// A request did not receive its reply in time
    #[error("Timed out waiting for a reply")]
    Timeout,

    /// A hotspot request was made with no responder registered
    #[error("No hotspot responder registered")]
    NoHotspotResponder,

    /// The node has been closed
    #[error("Node is shut down")]
    Shutdown,

    /// Routing failure
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    /// Link failure
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// Packet construction or parsing failure
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// Control message failure
    #[error("Control message error: {0}")]
    Mmcp(#[from] MmcpError),
}

/// Convenience result type for node operations.
pub type NodeResult<T> = Result<T, NodeError>;
