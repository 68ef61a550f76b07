//! # Weft Core
//!
//! Core wire format, addressing, and control messages for the Weft mesh
//! overlay network.
//!
//! A Weft mesh presents a virtual IPv4-style address space on top of
//! whatever point-to-point links the host platform can establish. Every
//! packet carries a fixed 20-byte big-endian header; nodes exchange MMCP
//! control messages on port 0 to greet neighbors, measure link latency,
//! and propagate routes.
//!
//! ## Key Types
//!
//! - [`VirtualAddress`]: 32-bit overlay address with dotted-quad formatting
//! - [`VirtualPacketHeader`]: the fixed-layout big-endian packet header
//! - [`VirtualPacket`]: an owned header + payload buffer, composed for
//!   sending or parsed from link bytes
//! - [`MmcpMessage`]: the control-message union and its codec
//! - [`OriginatorMessage`]: the route advertisement at the heart of the
//!   routing protocol
//!
//! This crate is free of I/O and async. Links, routing, and node lifecycle
//! live in `weft-link`, `weft-routing`, and `weft-node`.

pub mod addr;
pub mod error;
pub mod mmcp;
pub mod wire;

// Re-export main types
pub use addr::*;
pub use error::*;
pub use mmcp::*;
pub use wire::*;
