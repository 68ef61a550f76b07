//! # Weft Link
//!
//! Neighbor link management for the Weft mesh.
//!
//! A link is one point-to-point connection to an adjacent node, carried
//! over any byte stream the host platform can establish (TCP, Bluetooth
//! RFCOMM bridges, in-process pipes in tests). This crate owns everything
//! per-link:
//!
//! ## Core Components
//!
//! - [`NeighborLink`]: one live link, owning its receive loop, keep-alive
//!   timer, round-trip-time tracking, and a serialized write path
//! - [`LinkManager`]: attaches transports, issues link ids, and keeps the
//!   registry of live links
//! - [`LinkEvent`]: the channel feeding every received packet (and link
//!   closures) into the node's dispatch loop
//! - [`framing`]: the fixed-header packet framing over a byte stream
//!
//! ## Lifecycle
//!
//! A link starts `Connected` and ends `Disconnected`; the transition is
//! terminal. Reconnection means attaching a fresh transport, which yields
//! a new link with a new id.

pub mod error;
pub mod framing;
pub mod link;
pub mod manager;

// Re-export main types
pub use error::*;
pub use link::*;
pub use manager::*;
