//! Chain request frame
//!
//! The out-of-band control message that opens a relayed leg: the first
//! bytes on a freshly-accepted chain connection name the final
//! destination, and everything after them is tunneled payload. Encoding
//! is big-endian, fixed size, magic first so a stray connection is
//! rejected before any routing work happens.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use weft_core::VirtualAddress;

use crate::error::{ChainError, ChainResult};

/// Marks the start of a chain request.
pub const CHAIN_MAGIC: u16 = 0xC4A1;

/// Encoded size: `[magic: u16][dest: u32][dest_port: u16]`.
pub const CHAIN_REQUEST_SIZE: usize = 8;

/// Asks the receiving relay to extend the chain toward `dest:dest_port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainRequest {
    pub dest: VirtualAddress,
    pub dest_port: u16,
}

impl ChainRequest {
    pub fn new(dest: VirtualAddress, dest_port: u16) -> Self {
        Self { dest, dest_port }
    }

    pub fn encode(&self) -> [u8; CHAIN_REQUEST_SIZE] {
        let mut buf = [0u8; CHAIN_REQUEST_SIZE];
        buf[0..2].copy_from_slice(&CHAIN_MAGIC.to_be_bytes());
        buf[2..6].copy_from_slice(&self.dest.0.to_be_bytes());
        buf[6..8].copy_from_slice(&self.dest_port.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; CHAIN_REQUEST_SIZE]) -> ChainResult<Self> {
        let magic = u16::from_be_bytes([buf[0], buf[1]]);
        if magic != CHAIN_MAGIC {
            return Err(ChainError::BadMagic(magic));
        }
        let dest = VirtualAddress(u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]));
        let dest_port = u16::from_be_bytes([buf[6], buf[7]]);
        Ok(Self { dest, dest_port })
    }

    pub async fn read_from<R>(reader: &mut R) -> ChainResult<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = [0u8; CHAIN_REQUEST_SIZE];
        reader.read_exact(&mut buf).await?;
        Self::decode(&buf)
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> ChainResult<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }
}
