//! Node configuration

use weft_core::{DEFAULT_MAX_HOPS, VirtualAddress};
use weft_link::LinkConfig;
use weft_routing::RoutingConfig;

/// Configuration for a mesh node.
///
/// The defaults give the reference protocol timings; tests shrink the
/// embedded link and routing intervals to keep runs fast.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's overlay address; `None` draws a random APIPA address
    pub address: Option<VirtualAddress>,
    /// Hop budget stamped on locally-originated packets
    pub max_hops: u8,
    /// Behavior shared by every attached link
    pub link: LinkConfig,
    /// Routing control-plane timing
    pub routing: RoutingConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: None,
            max_hops: DEFAULT_MAX_HOPS,
            link: LinkConfig::default(),
            routing: RoutingConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn with_address(mut self, address: VirtualAddress) -> Self {
        self.address = Some(address);
        self
    }

    /// Set the hop budget everywhere it is stamped: data sends, keep-alive
    /// pings, and advertisements.
    pub fn with_max_hops(mut self, max_hops: u8) -> Self {
        self.max_hops = max_hops;
        self.link.max_hops = max_hops;
        self.routing.max_hops = max_hops;
        self
    }

    pub fn with_link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    pub fn with_routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }
}
