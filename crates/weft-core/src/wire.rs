//! Virtual packet wire format
//!
//! A packet on a Weft link is a fixed 20-byte big-endian header followed
//! by up to [`MAX_PAYLOAD_SIZE`] payload bytes. The layout is a
//! compatibility contract and never changes shape:
//!
//! ```text
//! offset  size  field
//!      0     4  to_addr
//!      4     2  to_port
//!      6     4  from_addr
//!     10     2  from_port
//!     12     4  last_hop_addr
//!     16     1  hop_count
//!     17     1  max_hops
//!     18     2  payload_size
//! ```
//!
//! [`VirtualPacket`] keeps the encoded bytes and the decoded header
//! together in one owned buffer; the relay mutations write through to the
//! encoded bytes so the two views never diverge.

use bytes::{BufMut, BytesMut};

use crate::addr::VirtualAddress;
use crate::error::WireError;

/// Encoded size of a [`VirtualPacketHeader`].
pub const HEADER_SIZE: usize = 20;

/// Largest payload a single virtual packet may carry.
pub const MAX_PAYLOAD_SIZE: usize = 2000;

/// Port 0 on both ends marks MMCP control traffic.
pub const CONTROL_PORT: u16 = 0;

/// Default hop budget for locally originated packets.
pub const DEFAULT_MAX_HOPS: u8 = 8;

const OFF_LAST_HOP_ADDR: usize = 12;
const OFF_HOP_COUNT: usize = 16;

/// The fixed header at the front of every virtual packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualPacketHeader {
    /// Destination overlay address.
    pub to_addr: VirtualAddress,
    /// Destination port; 0 is the control port.
    pub to_port: u16,
    /// Originating overlay address. Never rewritten in flight.
    pub from_addr: VirtualAddress,
    /// Originating port.
    pub from_port: u16,
    /// Address of the most recent node to transmit the packet.
    pub last_hop_addr: VirtualAddress,
    /// Hops taken so far; 1 on the originating link.
    pub hop_count: u8,
    /// Hop budget; the packet is dropped once `hop_count` reaches it.
    pub max_hops: u8,
    /// Number of payload bytes following the header.
    pub payload_size: u16,
}

fn read_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

impl VirtualPacketHeader {
    /// Encode into `buf` starting at `offset`.
    pub fn encode_at(&self, buf: &mut [u8], offset: usize) -> Result<(), WireError> {
        let available = buf.len().saturating_sub(offset);
        if available < HEADER_SIZE {
            return Err(WireError::Truncated {
                offset,
                needed: HEADER_SIZE,
                available,
            });
        }
        if self.payload_size as usize > MAX_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge {
                size: self.payload_size as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let b = &mut buf[offset..offset + HEADER_SIZE];
        b[0..4].copy_from_slice(&self.to_addr.as_u32().to_be_bytes());
        b[4..6].copy_from_slice(&self.to_port.to_be_bytes());
        b[6..10].copy_from_slice(&self.from_addr.as_u32().to_be_bytes());
        b[10..12].copy_from_slice(&self.from_port.to_be_bytes());
        b[12..16].copy_from_slice(&self.last_hop_addr.as_u32().to_be_bytes());
        b[16] = self.hop_count;
        b[17] = self.max_hops;
        b[18..20].copy_from_slice(&self.payload_size.to_be_bytes());
        Ok(())
    }

    /// Encode into a fresh fixed-size array.
    pub fn encode(&self) -> Result<[u8; HEADER_SIZE], WireError> {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_at(&mut buf, 0)?;
        Ok(buf)
    }

    /// Decode the header found in `buf` at `offset`.
    pub fn decode_at(buf: &[u8], offset: usize) -> Result<Self, WireError> {
        let available = buf.len().saturating_sub(offset);
        if available < HEADER_SIZE {
            return Err(WireError::Truncated {
                offset,
                needed: HEADER_SIZE,
                available,
            });
        }
        let b = &buf[offset..offset + HEADER_SIZE];
        let header = Self {
            to_addr: VirtualAddress::new(read_u32(&b[0..4])),
            to_port: read_u16(&b[4..6]),
            from_addr: VirtualAddress::new(read_u32(&b[6..10])),
            from_port: read_u16(&b[10..12]),
            last_hop_addr: VirtualAddress::new(read_u32(&b[12..16])),
            hop_count: b[16],
            max_hops: b[17],
            payload_size: read_u16(&b[18..20]),
        };
        if header.payload_size as usize > MAX_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge {
                size: header.payload_size as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(header)
    }
}

/// An owned virtual packet: header bytes immediately followed by payload
/// bytes in a single buffer.
///
/// A packet is composed for sending or parsed from link bytes, then owned
/// for at most one hop of processing. Header mutations used during relay
/// ([`increment_hop_count`](Self::increment_hop_count),
/// [`set_last_hop_addr`](Self::set_last_hop_addr)) update the buffer in
/// place.
#[derive(Debug, Clone)]
pub struct VirtualPacket {
    buf: BytesMut,
    header: VirtualPacketHeader,
    header_offset: usize,
    payload_offset: usize,
}

impl VirtualPacket {
    /// Compose a packet from a header and payload.
    ///
    /// `payload_size` in the header is overwritten with the payload's
    /// actual length.
    pub fn new(mut header: VirtualPacketHeader, payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        header.payload_size = payload.len() as u16;
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_slice(&header.encode()?);
        buf.put_slice(payload);
        Ok(Self {
            buf,
            header,
            header_offset: 0,
            payload_offset: HEADER_SIZE,
        })
    }

    /// Parse a packet from one received datagram or link frame.
    ///
    /// The buffer must hold the full header and at least the payload the
    /// header declares; trailing bytes beyond the declared payload are cut
    /// off.
    pub fn from_datagram(mut buf: BytesMut) -> Result<Self, WireError> {
        let header = VirtualPacketHeader::decode_at(&buf, 0)?;
        let total = HEADER_SIZE + header.payload_size as usize;
        if buf.len() < total {
            return Err(WireError::Truncated {
                offset: HEADER_SIZE,
                needed: header.payload_size as usize,
                available: buf.len() - HEADER_SIZE,
            });
        }
        buf.truncate(total);
        Ok(Self {
            buf,
            header,
            header_offset: 0,
            payload_offset: HEADER_SIZE,
        })
    }

    /// The decoded header.
    pub fn header(&self) -> &VirtualPacketHeader {
        &self.header
    }

    /// The payload bytes.
    pub fn payload(&self) -> &[u8] {
        let start = self.payload_offset;
        &self.buf[start..start + self.header.payload_size as usize]
    }

    /// Mutable payload bytes, for the in-place originator bump.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.payload_offset;
        let end = start + self.header.payload_size as usize;
        &mut self.buf[start..end]
    }

    /// The full wire form (header followed by payload), ready to send.
    pub fn as_datagram(&self) -> &[u8] {
        let start = self.header_offset;
        let end = self.payload_offset + self.header.payload_size as usize;
        &self.buf[start..end]
    }

    /// Record one relay hop in the encoded bytes.
    pub fn increment_hop_count(&mut self) {
        self.header.hop_count = self.header.hop_count.saturating_add(1);
        self.buf[self.header_offset + OFF_HOP_COUNT] = self.header.hop_count;
    }

    /// Rewrite the last-hop field in the encoded bytes.
    pub fn set_last_hop_addr(&mut self, addr: VirtualAddress) {
        self.header.last_hop_addr = addr;
        let start = self.header_offset + OFF_LAST_HOP_ADDR;
        self.buf[start..start + 4].copy_from_slice(&addr.as_u32().to_be_bytes());
    }

    /// Whether the hop budget is spent and the packet must be dropped.
    pub fn hop_budget_spent(&self) -> bool {
        self.header.hop_count >= self.header.max_hops
    }
}
