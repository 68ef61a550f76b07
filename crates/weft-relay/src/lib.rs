//! TCP chain relays over the Weft mesh
//!
//! Tunnels real TCP connections across the overlay: each mesh hop on
//! the path carries one socket leg, spliced together by the relays'
//! chain listeners. A chain starts with a fixed [`ChainRequest`] frame
//! naming the final destination; after the handshake the chain is a
//! transparent byte pipe.

pub mod chain;
pub mod error;
pub mod frame;

pub use chain::{ChainListener, chain_connect};
pub use error::{ChainError, ChainResult};
pub use frame::{CHAIN_MAGIC, CHAIN_REQUEST_SIZE, ChainRequest};
