//! Error types for chain relaying

use thiserror::Error;

use weft_core::VirtualAddress;
use weft_routing::RoutingError;

#[derive(Debug, Error)]
pub enum ChainError {
    /// The first bytes of an inbound connection were not a chain request.
    #[error("Bad chain request magic {0:#06x}")]
    BadMagic(u16),

    /// The next hop toward the destination never advertised a service
    /// endpoint, so no real socket can be opened toward it.
    #[error("No service endpoint known for {0}")]
    NoServiceEndpoint(VirtualAddress),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ChainResult<T> = Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ChainError::BadMagic(0xdead);
        assert_eq!(err.to_string(), "Bad chain request magic 0xdead");

        let err = ChainError::NoServiceEndpoint(VirtualAddress::from_octets([169, 254, 1, 2]));
        assert_eq!(err.to_string(), "No service endpoint known for 169.254.1.2");
    }

    #[test]
    fn test_routing_error_wraps() {
        let err = ChainError::from(RoutingError::NoRouteToHost(VirtualAddress::from_octets([
            169, 254, 9, 9,
        ])));
        assert_eq!(err.to_string(), "Routing error: No route to host 169.254.9.9");
    }
}
