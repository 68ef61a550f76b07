//! Error types for the wire and control codecs

use thiserror::Error;

/// Errors from packet header and packet buffer handling
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Buffer too short: need {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Payload size {size} exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Errors from MMCP message encoding and decoding
#[derive(Debug, Error)]
pub enum MmcpError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Truncated MMCP frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Blob size {size} exceeds maximum {max}")]
    BlobTooLarge { size: usize, max: usize },

    #[error("Negative blob size: {0}")]
    NegativeBlobSize(i16),

    #[error("Not an originator frame (message type {0})")]
    NotOriginator(u8),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
}
