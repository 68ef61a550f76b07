//! Routing error types

use thiserror::Error;

use weft_core::{MmcpError, VirtualAddress};
use weft_link::LinkError;

/// Errors from the routing engine
#[derive(Debug, Error)]
pub enum RoutingError {
    /// No advertisement from the destination is currently known
    #[error("No route to host {0}")]
    NoRouteToHost(VirtualAddress),

    /// The far end never advertised itself during the join handshake
    #[error("Timed out waiting for neighbor to join")]
    NeighborJoinTimeout,

    /// A control message could not be built or read
    #[error("Control message error: {0}")]
    Mmcp(#[from] MmcpError),

    /// Sending on a link failed
    #[error("Link error: {0}")]
    Link(#[from] LinkError),
}

/// Result type for routing operations
pub type RoutingResult<T> = Result<T, RoutingError>;
