//! Packet framing over a byte stream
//!
//! The fixed 20-byte header is its own length prefix: read the header,
//! validate it, then read exactly the payload it declares. A header that
//! declares an over-limit payload surfaces the claimed size in the error
//! so the caller can skip that many bytes and keep the stream framed;
//! truncation and I/O errors mean the transport is gone.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use weft_core::{HEADER_SIZE, VirtualPacket, VirtualPacketHeader};

use crate::error::LinkError;

/// Read one virtual packet from the stream.
pub async fn read_packet<R>(reader: &mut R) -> Result<VirtualPacket, LinkError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;
    let header = VirtualPacketHeader::decode_at(&header_buf, 0)?;

    let total = HEADER_SIZE + header.payload_size as usize;
    let mut buf = BytesMut::with_capacity(total);
    buf.extend_from_slice(&header_buf);
    buf.resize(total, 0);
    reader.read_exact(&mut buf[HEADER_SIZE..]).await?;

    Ok(VirtualPacket::from_datagram(buf)?)
}

/// Write one virtual packet to the stream and flush it.
pub async fn write_packet<W>(writer: &mut W, packet: &VirtualPacket) -> Result<(), LinkError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(packet.as_datagram()).await?;
    writer.flush().await?;
    Ok(())
}
