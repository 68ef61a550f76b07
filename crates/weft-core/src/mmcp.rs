//! MMCP, the mesh control protocol
//!
//! Control messages ride in ordinary virtual packets addressed to port 0
//! on both ends. Every frame starts with a 5-byte header,
//! `[what: u8][message_id: i32]`, followed by a payload that depends on
//! the message type. All integers are big-endian.
//!
//! Message types:
//!
//! - `Hello`: link-level greeting, no payload
//! - `Ping` / `Pong`: liveness probes; a pong echoes the ping's id
//! - `Ack`: bare acknowledgement, no payload
//! - `HotspotRequest` / `HotspotResponse`: opaque blobs owned by the
//!   link-establishment collaborator; the mesh only carries them
//! - `Originator`: the route advertisement, see [`OriginatorMessage`]
//!
//! An originator frame keeps its accumulated-latency word at a fixed
//! offset so relays can bump it inside already-encoded packet bytes with
//! [`bump_ping_time_sum`], without a decode/re-encode cycle.

use std::sync::atomic::{AtomicI32, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;

use crate::addr::VirtualAddress;
use crate::error::MmcpError;
use crate::wire::{CONTROL_PORT, VirtualPacket, VirtualPacketHeader};

/// Encoded size of the `[what][message_id]` frame header.
pub const MMCP_HEADER_SIZE: usize = 5;

/// Message type tags. Fixed on the wire.
pub const WHAT_HELLO: u8 = 1;
pub const WHAT_PING: u8 = 2;
pub const WHAT_PONG: u8 = 3;
pub const WHAT_ACK: u8 = 4;
pub const WHAT_HOTSPOT_REQUEST: u8 = 5;
pub const WHAT_HOTSPOT_RESPONSE: u8 = 6;
pub const WHAT_ORIGINATOR: u8 = 7;

const OFF_PING_TIME_SUM: usize = MMCP_HEADER_SIZE;

/// Bytes of an originator body before the capability blob:
/// `[ping_time_sum: i16][sent_time: i64][blob_size: i16]`.
pub const ORIGINATOR_FIXED_SIZE: usize = 12;

/// Issues MMCP message ids for one node.
///
/// Ids only need to be unique across the probes a node has in flight, so
/// a wrapping 32-bit counter is plenty. One generator is shared by a
/// node's links and timers; nothing here is process-global.
#[derive(Debug)]
pub struct MessageIdGenerator(AtomicI32);

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self(AtomicI32::new(1))
    }

    /// Next message id.
    pub fn next_id(&self) -> i32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A route advertisement.
///
/// Nodes broadcast one on a timer; every relay bumps `ping_time_sum` by
/// the latency of the link the advertisement arrived on, so the value
/// accumulates path latency hop by hop. Receivers judge freshness by
/// `sent_time` (origin wall clock) and break ties on the packet header's
/// hop count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginatorMessage {
    /// Accumulated path latency in milliseconds.
    pub ping_time_sum: i16,
    /// Wall-clock send time at the origin, Unix milliseconds.
    pub sent_time: i64,
    /// Opaque capability payload the origin shares with the mesh.
    pub blob: Bytes,
}

impl OriginatorMessage {
    /// Build a fresh advertisement stamped with the current wall clock.
    pub fn now(blob: Bytes) -> Self {
        Self {
            ping_time_sum: 0,
            sent_time: Utc::now().timestamp_millis(),
            blob,
        }
    }
}

/// One MMCP control message: a node-local id plus the typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmcpMessage {
    pub message_id: i32,
    pub kind: MmcpKind,
}

/// The typed payload of an [`MmcpMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MmcpKind {
    Hello,
    Ping,
    Pong { reply_to: i32 },
    Ack,
    HotspotRequest { blob: Bytes },
    HotspotResponse { blob: Bytes },
    Originator(OriginatorMessage),
}

impl MmcpMessage {
    pub fn new(message_id: i32, kind: MmcpKind) -> Self {
        Self { message_id, kind }
    }

    pub fn hello(message_id: i32) -> Self {
        Self::new(message_id, MmcpKind::Hello)
    }

    pub fn ping(message_id: i32) -> Self {
        Self::new(message_id, MmcpKind::Ping)
    }

    pub fn pong(message_id: i32, reply_to: i32) -> Self {
        Self::new(message_id, MmcpKind::Pong { reply_to })
    }

    pub fn hotspot_request(message_id: i32, blob: Bytes) -> Self {
        Self::new(message_id, MmcpKind::HotspotRequest { blob })
    }

    pub fn hotspot_response(message_id: i32, blob: Bytes) -> Self {
        Self::new(message_id, MmcpKind::HotspotResponse { blob })
    }

    pub fn originator(message_id: i32, advert: OriginatorMessage) -> Self {
        Self::new(message_id, MmcpKind::Originator(advert))
    }

    /// The wire tag for this message's type.
    pub fn what(&self) -> u8 {
        match &self.kind {
            MmcpKind::Hello => WHAT_HELLO,
            MmcpKind::Ping => WHAT_PING,
            MmcpKind::Pong { .. } => WHAT_PONG,
            MmcpKind::Ack => WHAT_ACK,
            MmcpKind::HotspotRequest { .. } => WHAT_HOTSPOT_REQUEST,
            MmcpKind::HotspotResponse { .. } => WHAT_HOTSPOT_RESPONSE,
            MmcpKind::Originator(_) => WHAT_ORIGINATOR,
        }
    }

    /// Encode into a standalone MMCP frame.
    pub fn encode(&self) -> Result<Bytes, MmcpError> {
        let mut buf = BytesMut::with_capacity(MMCP_HEADER_SIZE + 16);
        buf.put_u8(self.what());
        buf.put_i32(self.message_id);
        match &self.kind {
            MmcpKind::Hello | MmcpKind::Ping | MmcpKind::Ack => {}
            MmcpKind::Pong { reply_to } => buf.put_i32(*reply_to),
            MmcpKind::HotspotRequest { blob } | MmcpKind::HotspotResponse { blob } => {
                buf.put_slice(blob);
            }
            MmcpKind::Originator(advert) => {
                let blob_size =
                    i16::try_from(advert.blob.len()).map_err(|_| MmcpError::BlobTooLarge {
                        size: advert.blob.len(),
                        max: i16::MAX as usize,
                    })?;
                buf.put_i16(advert.ping_time_sum);
                buf.put_i64(advert.sent_time);
                buf.put_i16(blob_size);
                buf.put_slice(&advert.blob);
            }
        }
        Ok(buf.freeze())
    }

    /// Decode a frame. Unknown tags are an error for the caller to log
    /// and discard; they never abort the link.
    pub fn decode(frame: &[u8]) -> Result<Self, MmcpError> {
        if frame.len() < MMCP_HEADER_SIZE {
            return Err(MmcpError::Truncated {
                needed: MMCP_HEADER_SIZE,
                available: frame.len(),
            });
        }
        let what = frame[0];
        let message_id = i32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let body = &frame[MMCP_HEADER_SIZE..];
        let kind = match what {
            WHAT_HELLO => MmcpKind::Hello,
            WHAT_PING => MmcpKind::Ping,
            WHAT_ACK => MmcpKind::Ack,
            WHAT_PONG => {
                if body.len() < 4 {
                    return Err(MmcpError::Truncated {
                        needed: MMCP_HEADER_SIZE + 4,
                        available: frame.len(),
                    });
                }
                MmcpKind::Pong {
                    reply_to: i32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                }
            }
            WHAT_HOTSPOT_REQUEST => MmcpKind::HotspotRequest {
                blob: Bytes::copy_from_slice(body),
            },
            WHAT_HOTSPOT_RESPONSE => MmcpKind::HotspotResponse {
                blob: Bytes::copy_from_slice(body),
            },
            WHAT_ORIGINATOR => {
                if body.len() < ORIGINATOR_FIXED_SIZE {
                    return Err(MmcpError::Truncated {
                        needed: MMCP_HEADER_SIZE + ORIGINATOR_FIXED_SIZE,
                        available: frame.len(),
                    });
                }
                let ping_time_sum = i16::from_be_bytes([body[0], body[1]]);
                let sent_time = i64::from_be_bytes([
                    body[2], body[3], body[4], body[5], body[6], body[7], body[8], body[9],
                ]);
                let blob_size = i16::from_be_bytes([body[10], body[11]]);
                if blob_size < 0 {
                    return Err(MmcpError::NegativeBlobSize(blob_size));
                }
                let blob_size = blob_size as usize;
                if body.len() < ORIGINATOR_FIXED_SIZE + blob_size {
                    return Err(MmcpError::Truncated {
                        needed: MMCP_HEADER_SIZE + ORIGINATOR_FIXED_SIZE + blob_size,
                        available: frame.len(),
                    });
                }
                MmcpKind::Originator(OriginatorMessage {
                    ping_time_sum,
                    sent_time,
                    blob: Bytes::copy_from_slice(
                        &body[ORIGINATOR_FIXED_SIZE..ORIGINATOR_FIXED_SIZE + blob_size],
                    ),
                })
            }
            other => return Err(MmcpError::UnknownMessageType(other)),
        };
        Ok(Self { message_id, kind })
    }

    /// Wrap this message in a control packet from `from` to `to`.
    ///
    /// Control packets use port 0 on both ends and originate with a hop
    /// count of 1.
    pub fn to_packet(
        &self,
        from: VirtualAddress,
        to: VirtualAddress,
        max_hops: u8,
    ) -> Result<VirtualPacket, MmcpError> {
        let frame = self.encode()?;
        let header = VirtualPacketHeader {
            to_addr: to,
            to_port: CONTROL_PORT,
            from_addr: from,
            from_port: CONTROL_PORT,
            last_hop_addr: from,
            hop_count: 1,
            max_hops,
            payload_size: 0,
        };
        Ok(VirtualPacket::new(header, &frame)?)
    }
}

/// Add `delta_ms` to the accumulated-latency word of an encoded originator
/// frame, saturating at `i16::MAX`.
///
/// `frame` is the MMCP frame, i.e. a control packet's payload. Relays
/// call this before the freshness comparison so the advertised latency
/// includes the link the advertisement just crossed.
pub fn bump_ping_time_sum(frame: &mut [u8], delta_ms: i16) -> Result<i16, MmcpError> {
    if frame.len() < OFF_PING_TIME_SUM + 2 {
        return Err(MmcpError::Truncated {
            needed: OFF_PING_TIME_SUM + 2,
            available: frame.len(),
        });
    }
    if frame[0] != WHAT_ORIGINATOR {
        return Err(MmcpError::NotOriginator(frame[0]));
    }
    let current = i16::from_be_bytes([frame[OFF_PING_TIME_SUM], frame[OFF_PING_TIME_SUM + 1]]);
    let bumped = current.saturating_add(delta_ms);
    frame[OFF_PING_TIME_SUM..OFF_PING_TIME_SUM + 2].copy_from_slice(&bumped.to_be_bytes());
    Ok(bumped)
}
