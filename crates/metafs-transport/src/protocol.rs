//! Packet codec for the metafs RPC protocol.
//!
//! Every packet starts with a fixed 24-byte header. All multi-byte fields are
//! big-endian on the wire and host-order once decoded:
//!
//! ```text
//! packet_type:4 | opcode:4 | xid:8 | status:4 | payload_len:4 | payload...
//! ```
//!
//! Decoding is all-or-nothing: a caller either gets a fully validated envelope
//! or a [`TransportError::MalformedPacket`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};

/// Header size in bytes.
pub const HEADER_SIZE: usize = 24;

/// Largest payload accepted in a single packet (128 KiB request buffers).
pub const MAX_PAYLOAD: usize = 128 * 1024;

/// Kind of packet carried by a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketType {
    /// Client request.
    Request = 1,
    /// Server reply.
    Reply = 2,
    /// Bulk data pushed to a niobuf.
    Bulk = 3,
}

impl PacketType {
    /// Parses a raw wire value.
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(PacketType::Request),
            2 => Some(PacketType::Reply),
            3 => Some(PacketType::Bulk),
            _ => None,
        }
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Raw packet type.
    pub packet_type: u32,
    /// Raw opcode; unknown values are kept so routing can reject them.
    pub opcode: u32,
    /// Transaction id.
    pub xid: u64,
    /// Status, zero in requests.
    pub status: i32,
    /// Length of the payload following the header.
    pub payload_len: u32,
}

impl PacketHeader {
    /// Decodes a header and checks that `payload_len` matches the buffer.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(TransportError::malformed(format!(
                "packet of {} bytes is shorter than the {} byte header",
                buf.len(),
                HEADER_SIZE
            )));
        }
        let mut cur = &buf[..HEADER_SIZE];
        let header = PacketHeader {
            packet_type: cur.get_u32(),
            opcode: cur.get_u32(),
            xid: cur.get_u64(),
            status: cur.get_i32(),
            payload_len: cur.get_u32(),
        };
        let actual = buf.len() - HEADER_SIZE;
        if header.payload_len as usize != actual {
            return Err(TransportError::malformed(format!(
                "payload_len {} disagrees with {} payload bytes",
                header.payload_len, actual
            )));
        }
        if actual > MAX_PAYLOAD {
            return Err(TransportError::malformed(format!(
                "payload of {} bytes exceeds {}",
                actual, MAX_PAYLOAD
            )));
        }
        Ok(header)
    }

    fn put(&self, out: &mut BytesMut) {
        out.put_u32(self.packet_type);
        out.put_u32(self.opcode);
        out.put_u64(self.xid);
        out.put_i32(self.status);
        out.put_u32(self.payload_len);
    }
}

/// A decoded request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    /// Transaction id, echoed by the reply.
    pub xid: u64,
    /// Raw opcode.
    pub opcode: u32,
    /// Opcode specific payload.
    pub payload: Bytes,
}

/// A reply ready to be encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEnvelope {
    /// Transaction id of the request being answered.
    pub xid: u64,
    /// Opcode of the request being answered.
    pub opcode: u32,
    /// 0 on success, negative errno otherwise.
    pub status: i32,
    /// Reply payload; empty for error replies.
    pub payload: Bytes,
}

impl ReplyEnvelope {
    /// Builds an error reply carrying only a status.
    pub fn error(xid: u64, opcode: u32, status: i32) -> Self {
        Self {
            xid,
            opcode,
            status,
            payload: Bytes::new(),
        }
    }
}

/// Decodes a request packet.
pub fn decode_request(packet: &Bytes) -> Result<RequestEnvelope> {
    let header = PacketHeader::decode(packet)?;
    if PacketType::from_u32(header.packet_type) != Some(PacketType::Request) {
        return Err(TransportError::malformed(format!(
            "wrong packet type {}",
            header.packet_type
        )));
    }
    Ok(RequestEnvelope {
        xid: header.xid,
        opcode: header.opcode,
        payload: packet.slice(HEADER_SIZE..),
    })
}

/// Encodes a reply packet.
pub fn encode_reply(reply: &ReplyEnvelope) -> Bytes {
    encode(
        PacketType::Reply,
        reply.opcode,
        reply.xid,
        reply.status,
        &reply.payload,
    )
}

/// Encodes a request packet.
pub fn encode_request(xid: u64, opcode: u32, payload: &[u8]) -> Bytes {
    encode(PacketType::Request, opcode, xid, 0, payload)
}

/// Decodes a reply packet.
pub fn decode_reply(packet: &Bytes) -> Result<ReplyEnvelope> {
    let header = PacketHeader::decode(packet)?;
    if PacketType::from_u32(header.packet_type) != Some(PacketType::Reply) {
        return Err(TransportError::malformed(format!(
            "expected reply, got packet type {}",
            header.packet_type
        )));
    }
    Ok(ReplyEnvelope {
        xid: header.xid,
        opcode: header.opcode,
        status: header.status,
        payload: packet.slice(HEADER_SIZE..),
    })
}

/// Encodes a bulk packet: the destination address followed by the data.
pub fn encode_bulk(xid: u64, addr: u64, data: &[u8]) -> Bytes {
    let mut payload = BytesMut::with_capacity(8 + data.len());
    payload.put_u64(addr);
    payload.put_slice(data);
    encode(PacketType::Bulk, 0, xid, 0, &payload)
}

fn encode(kind: PacketType, opcode: u32, xid: u64, status: i32, payload: &[u8]) -> Bytes {
    let header = PacketHeader {
        packet_type: kind as u32,
        opcode,
        xid,
        status,
        payload_len: payload.len() as u32,
    };
    let mut out = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    header.put(&mut out);
    out.put_slice(payload);
    out.freeze()
}
