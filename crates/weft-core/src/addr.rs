//! Virtual overlay addressing
//!
//! Every node owns exactly one [`VirtualAddress`]: a 32-bit value rendered
//! as a dotted quad. Fresh addresses are drawn from the link-local style
//! 169.254.0.0/16 range so they are visually distinct from anything the
//! host's real interfaces carry. The address is chosen once and persisted
//! by the host application; it never changes while a node is running.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// A 32-bit address in the mesh overlay.
///
/// Compared and hashed as a plain integer; formatted as a dotted quad.
/// The all-ones value is reserved for broadcast.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VirtualAddress(pub u32);

impl VirtualAddress {
    /// The broadcast address, 255.255.255.255.
    pub const BROADCAST: Self = Self(u32::MAX);

    /// Create an address from a raw 32-bit value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Create an address from dotted-quad octets, most significant first.
    pub const fn from_octets(octets: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(octets))
    }

    /// The dotted-quad octets, most significant first.
    pub const fn octets(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// The raw 32-bit value.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Whether this is the broadcast address.
    pub const fn is_broadcast(&self) -> bool {
        self.0 == u32::MAX
    }

    /// Generate a random address in 169.254.x.y with host octets 1..=254.
    ///
    /// Collisions across a mesh are possible but vanishingly rare at the
    /// mesh sizes this stack targets; the host application persists the
    /// value so a node keeps its address across restarts.
    pub fn random_apipa() -> Self {
        let mut rng = rand::rng();
        let x: u8 = rng.random_range(1..=254);
        let y: u8 = rng.random_range(1..=254);
        Self::from_octets([169, 254, x, y])
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.octets();
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<u32> for VirtualAddress {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<VirtualAddress> for u32 {
    fn from(addr: VirtualAddress) -> Self {
        addr.0
    }
}
