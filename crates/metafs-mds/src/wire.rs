//! MDS request and reply bodies.
//!
//! The packet header is handled by `metafs_transport::protocol`; this module
//! encodes what follows it. All fields are big-endian.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::{FileIdentifier, InodeAttr, MdsError, Timestamp};

/// Operations served by the MDS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MdsOpcode {
    /// Attribute lookup.
    Getattr = 1,
    /// Open a file, returning an object handle.
    Open = 2,
    /// Close an object handle.
    Close = 3,
    /// Read one page of a file or directory.
    Readpage = 4,
    /// Apply an update record.
    Reint = 5,
}

impl MdsOpcode {
    /// Every declared opcode.
    pub const ALL: [MdsOpcode; 5] = [
        MdsOpcode::Getattr,
        MdsOpcode::Open,
        MdsOpcode::Close,
        MdsOpcode::Readpage,
        MdsOpcode::Reint,
    ];

    /// Looks up a raw wire opcode.
    pub fn from_u32(raw: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|op| *op as u32 == raw)
    }

    /// Wire value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Lowercase name for logs.
    pub fn name(self) -> &'static str {
        match self {
            MdsOpcode::Getattr => "getattr",
            MdsOpcode::Open => "open",
            MdsOpcode::Close => "close",
            MdsOpcode::Readpage => "readpage",
            MdsOpcode::Reint => "reint",
        }
    }
}

impl fmt::Display for MdsOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const FID_SIZE: usize = 12;
const TIME_SIZE: usize = 12;

/// Fixed part of a request body.
pub const REQUEST_FIXED_SIZE: usize = 2 * FID_SIZE + 4 + 8 + 8 + 4;

/// Fixed part of a reply body.
pub const REPLY_FIXED_SIZE: usize = 8 + 4 + 8 + 4 * 4 + 3 * TIME_SIZE + 4 + 8 + 4;

/// Every attribute field in the reply is valid.
pub const VALID_ALL: u32 = u32::MAX;

/// Decoded request body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MdsRequest {
    /// Primary object.
    pub fid1: FileIdentifier,
    /// Secondary object.
    pub fid2: FileIdentifier,
    /// Open flags.
    pub flags: u32,
    /// Size, or the page offset for READPAGE.
    pub size: u64,
    /// Object handle echoed back by CLOSE.
    pub objid: u64,
    /// Target data: a niobuf for READPAGE, the update record for REINT.
    pub tgt: Bytes,
}

fn get_fid(buf: &mut Bytes) -> FileIdentifier {
    let ino = buf.get_u64();
    let generation = buf.get_u32();
    FileIdentifier::new(ino, generation)
}

fn put_fid(out: &mut BytesMut, fid: &FileIdentifier) {
    out.put_u64(fid.ino);
    out.put_u32(fid.generation);
}

fn get_time(buf: &mut Bytes) -> Timestamp {
    let secs = buf.get_u64();
    let nanos = buf.get_u32();
    Timestamp { secs, nanos }
}

fn put_time(out: &mut BytesMut, t: &Timestamp) {
    out.put_u64(t.secs);
    out.put_u32(t.nanos);
}

impl MdsRequest {
    /// Request carrying only a primary identifier.
    pub fn for_fid(fid1: FileIdentifier) -> Self {
        Self {
            fid1,
            ..Default::default()
        }
    }

    /// Decodes a request body. Fails with `Protocol` on short or
    /// inconsistent input; nothing is returned for a partial body.
    pub fn decode(payload: &Bytes) -> Result<Self, MdsError> {
        if payload.len() < REQUEST_FIXED_SIZE {
            return Err(MdsError::Protocol(format!(
                "request body is {} bytes, need at least {}",
                payload.len(),
                REQUEST_FIXED_SIZE
            )));
        }
        let mut buf = payload.clone();
        let fid1 = get_fid(&mut buf);
        let fid2 = get_fid(&mut buf);
        let flags = buf.get_u32();
        let size = buf.get_u64();
        let objid = buf.get_u64();
        let tgtlen = buf.get_u32() as usize;
        if tgtlen != buf.remaining() {
            return Err(MdsError::Protocol(format!(
                "target length {} but {} bytes follow",
                tgtlen,
                buf.remaining()
            )));
        }
        Ok(Self {
            fid1,
            fid2,
            flags,
            size,
            objid,
            tgt: buf,
        })
    }

    /// Encodes the request body.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(REQUEST_FIXED_SIZE + self.tgt.len());
        put_fid(&mut out, &self.fid1);
        put_fid(&mut out, &self.fid2);
        out.put_u32(self.flags);
        out.put_u64(self.size);
        out.put_u64(self.objid);
        out.put_u32(self.tgt.len() as u32);
        out.put_slice(&self.tgt);
        out.freeze()
    }
}

/// Reply body for a successful request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MdsReply {
    /// Inode number.
    pub ino: u64,
    /// Inode generation.
    pub generation: u32,
    /// Size in bytes.
    pub size: u64,
    /// Type and permission bits.
    pub mode: u32,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Link count.
    pub nlink: u32,
    /// Access time.
    pub atime: Timestamp,
    /// Modification time.
    pub mtime: Timestamp,
    /// Change time.
    pub ctime: Timestamp,
    /// Which attribute fields are meaningful.
    pub valid: u32,
    /// Object id (GETATTR) or object handle (OPEN).
    pub objid: u64,
    /// Inline data (local READPAGE).
    pub data: Bytes,
}

impl MdsReply {
    /// Copies every attribute into the reply and marks them all valid.
    pub fn fill_attr(&mut self, attr: &InodeAttr) {
        self.ino = attr.ino.as_u64();
        self.generation = attr.generation;
        self.size = attr.size;
        self.mode = attr.mode;
        self.uid = attr.uid;
        self.gid = attr.gid;
        self.nlink = attr.nlink;
        self.atime = attr.atime;
        self.mtime = attr.mtime;
        self.ctime = attr.ctime;
        self.objid = attr.objid;
        self.valid = VALID_ALL;
    }

    /// Encodes the reply body.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(REPLY_FIXED_SIZE + self.data.len());
        out.put_u64(self.ino);
        out.put_u32(self.generation);
        out.put_u64(self.size);
        out.put_u32(self.mode);
        out.put_u32(self.uid);
        out.put_u32(self.gid);
        out.put_u32(self.nlink);
        put_time(&mut out, &self.atime);
        put_time(&mut out, &self.mtime);
        put_time(&mut out, &self.ctime);
        out.put_u32(self.valid);
        out.put_u64(self.objid);
        out.put_u32(self.data.len() as u32);
        out.put_slice(&self.data);
        out.freeze()
    }

    /// Decodes a reply body.
    pub fn decode(payload: &Bytes) -> Result<Self, MdsError> {
        if payload.len() < REPLY_FIXED_SIZE {
            return Err(MdsError::Protocol(format!(
                "reply body is {} bytes, need at least {}",
                payload.len(),
                REPLY_FIXED_SIZE
            )));
        }
        let mut buf = payload.clone();
        let mut reply = MdsReply {
            ino: buf.get_u64(),
            generation: buf.get_u32(),
            size: buf.get_u64(),
            mode: buf.get_u32(),
            uid: buf.get_u32(),
            gid: buf.get_u32(),
            nlink: buf.get_u32(),
            ..Default::default()
        };
        reply.atime = get_time(&mut buf);
        reply.mtime = get_time(&mut buf);
        reply.ctime = get_time(&mut buf);
        reply.valid = buf.get_u32();
        reply.objid = buf.get_u64();
        let data_len = buf.get_u32() as usize;
        if data_len != buf.remaining() {
            return Err(MdsError::Protocol(format!(
                "data length {} but {} bytes follow",
                data_len,
                buf.remaining()
            )));
        }
        reply.data = buf;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InodeId;
    use proptest::prelude::*;

    #[test]
    fn test_opcode_lookup() {
        for op in MdsOpcode::ALL {
            assert_eq!(MdsOpcode::from_u32(op.as_u32()), Some(op));
        }
        assert_eq!(MdsOpcode::from_u32(0), None);
        assert_eq!(MdsOpcode::from_u32(999), None);
        assert_eq!(MdsOpcode::Readpage.to_string(), "readpage");
    }

    #[test]
    fn test_request_layout() {
        let req = MdsRequest {
            fid1: FileIdentifier::new(42, 7),
            flags: 2,
            size: 8192,
            objid: 0xdead,
            tgt: Bytes::from_static(b"abc"),
            ..Default::default()
        };
        let bytes = req.encode();
        assert_eq!(bytes.len(), REQUEST_FIXED_SIZE + 3);
        assert_eq!(&bytes[..8], &42u64.to_be_bytes());
        assert_eq!(&bytes[8..12], &7u32.to_be_bytes());
        assert_eq!(MdsRequest::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn test_request_too_short() {
        let err = MdsRequest::decode(&Bytes::from_static(&[0u8; 10])).unwrap_err();
        assert!(matches!(err, MdsError::Protocol(_)));
    }

    #[test]
    fn test_request_target_length_mismatch() {
        let mut raw = BytesMut::from(&MdsRequest::default().encode()[..]);
        raw.put_u8(1);
        let err = MdsRequest::decode(&raw.freeze()).unwrap_err();
        assert!(matches!(err, MdsError::Protocol(_)));
    }

    #[test]
    fn test_reply_fill_attr() {
        let attr = InodeAttr {
            ino: InodeId::new(42),
            generation: 7,
            mode: 0o100644,
            uid: 10,
            gid: 20,
            nlink: 1,
            size: 1024,
            atime: Timestamp::from_secs(1),
            mtime: Timestamp::from_secs(2),
            ctime: Timestamp::from_secs(3),
            objid: 99,
        };
        let mut reply = MdsReply::default();
        reply.fill_attr(&attr);
        let decoded = MdsReply::decode(&reply.encode()).unwrap();
        assert_eq!(decoded.ino, 42);
        assert_eq!(decoded.size, 1024);
        assert_eq!(decoded.mtime, Timestamp::from_secs(2));
        assert_eq!(decoded.objid, 99);
        assert_eq!(decoded.valid, VALID_ALL);
        assert!(decoded.data.is_empty());
    }

    proptest! {
        #[test]
        fn prop_request_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..96)) {
            let _ = MdsRequest::decode(&Bytes::from(data));
        }
    }
}
