//! Update records carried by REINT.
//!
//! A record is a `u32` count followed by tagged sub-operations. They are
//! applied in order and application stops at the first failure. Nothing is
//! rolled back; sub-operations applied before the failure stay applied.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::backend::{AttrChanges, MdsFilesystem};
use crate::types::{FileIdentifier, MdsError, Timestamp};

/// Most sub-operations accepted in one record.
pub const MAX_SUBOPS: usize = 1024;

const TAG_SETATTR: u32 = 1;
const TAG_CREATE: u32 = 2;
const TAG_LINK: u32 = 3;
const TAG_UNLINK: u32 = 4;
const TAG_RENAME: u32 = 5;

/// One metadata mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOp {
    /// Change attributes.
    SetAttr {
        /// Target.
        fid: FileIdentifier,
        /// Fields to change.
        changes: AttrChanges,
    },
    /// Create a file or directory.
    Create {
        /// Directory to create in.
        parent: FileIdentifier,
        /// New entry name.
        name: String,
        /// Type and permission bits.
        mode: u32,
        /// Owner.
        uid: u32,
        /// Group.
        gid: u32,
    },
    /// Add a hard link.
    Link {
        /// Existing file.
        fid: FileIdentifier,
        /// Directory for the new link.
        parent: FileIdentifier,
        /// New link name.
        name: String,
    },
    /// Remove a directory entry.
    Unlink {
        /// Directory holding the entry.
        parent: FileIdentifier,
        /// Entry name.
        name: String,
    },
    /// Move an entry.
    Rename {
        /// Source directory.
        src_parent: FileIdentifier,
        /// Source name.
        src_name: String,
        /// Destination directory.
        dst_parent: FileIdentifier,
        /// Destination name.
        dst_name: String,
    },
}

impl UpdateOp {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateOp::SetAttr { .. } => "setattr",
            UpdateOp::Create { .. } => "create",
            UpdateOp::Link { .. } => "link",
            UpdateOp::Unlink { .. } => "unlink",
            UpdateOp::Rename { .. } => "rename",
        }
    }
}

/// Failure of one sub-operation in a record.
#[derive(Debug)]
pub struct SubopFailure {
    /// Position of the failed sub-operation.
    pub index: usize,
    /// Why it failed.
    pub error: MdsError,
}

/// A decoded REINT record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateRecord {
    /// Sub-operations in application order.
    pub ops: Vec<UpdateOp>,
}

fn invalid(reason: impl Into<String>) -> MdsError {
    MdsError::InvalidArgument(reason.into())
}

fn need(buf: &Bytes, n: usize, what: &str) -> Result<(), MdsError> {
    if buf.remaining() < n {
        return Err(invalid(format!(
            "record truncated in {}: need {} bytes, have {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_u32(buf: &mut Bytes, what: &str) -> Result<u32, MdsError> {
    need(buf, 4, what)?;
    Ok(buf.get_u32())
}

fn get_fid(buf: &mut Bytes, what: &str) -> Result<FileIdentifier, MdsError> {
    need(buf, 12, what)?;
    let ino = buf.get_u64();
    let generation = buf.get_u32();
    Ok(FileIdentifier::new(ino, generation))
}

fn get_name(buf: &mut Bytes, what: &str) -> Result<String, MdsError> {
    let len = get_u32(buf, what)? as usize;
    need(buf, len, what)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| invalid(format!("{} is not UTF-8", what)))
}

fn put_fid(out: &mut BytesMut, fid: &FileIdentifier) {
    out.put_u64(fid.ino);
    out.put_u32(fid.generation);
}

fn put_name(out: &mut BytesMut, name: &str) {
    out.put_u32(name.len() as u32);
    out.put_slice(name.as_bytes());
}

fn decode_op(buf: &mut Bytes) -> Result<UpdateOp, MdsError> {
    let tag = get_u32(buf, "tag")?;
    let op = match tag {
        TAG_SETATTR => {
            let fid = get_fid(buf, "setattr fid")?;
            need(buf, 4 * 4 + 8 + 12, "setattr")?;
            let changes = AttrChanges {
                valid: buf.get_u32(),
                mode: buf.get_u32(),
                uid: buf.get_u32(),
                gid: buf.get_u32(),
                size: buf.get_u64(),
                mtime: Timestamp {
                    secs: buf.get_u64(),
                    nanos: buf.get_u32(),
                },
            };
            UpdateOp::SetAttr { fid, changes }
        }
        TAG_CREATE => {
            let parent = get_fid(buf, "create parent")?;
            let name = get_name(buf, "create name")?;
            UpdateOp::Create {
                parent,
                name,
                mode: get_u32(buf, "create mode")?,
                uid: get_u32(buf, "create uid")?,
                gid: get_u32(buf, "create gid")?,
            }
        }
        TAG_LINK => UpdateOp::Link {
            fid: get_fid(buf, "link fid")?,
            parent: get_fid(buf, "link parent")?,
            name: get_name(buf, "link name")?,
        },
        TAG_UNLINK => UpdateOp::Unlink {
            parent: get_fid(buf, "unlink parent")?,
            name: get_name(buf, "unlink name")?,
        },
        TAG_RENAME => UpdateOp::Rename {
            src_parent: get_fid(buf, "rename source")?,
            src_name: get_name(buf, "rename source name")?,
            dst_parent: get_fid(buf, "rename target")?,
            dst_name: get_name(buf, "rename target name")?,
        },
        other => return Err(invalid(format!("unknown sub-operation tag {}", other))),
    };
    Ok(op)
}

impl UpdateRecord {
    /// Creates a record from sub-operations.
    pub fn new(ops: Vec<UpdateOp>) -> Self {
        Self { ops }
    }

    /// Decodes a record. Any inconsistency fails the whole record with
    /// `InvalidArgument`.
    pub fn decode(raw: &Bytes) -> Result<Self, MdsError> {
        let mut buf = raw.clone();
        let count = get_u32(&mut buf, "count")? as usize;
        if count > MAX_SUBOPS {
            return Err(invalid(format!(
                "{} sub-operations, limit {}",
                count, MAX_SUBOPS
            )));
        }
        let mut ops = Vec::with_capacity(count);
        for _ in 0..count {
            ops.push(decode_op(&mut buf)?);
        }
        if buf.has_remaining() {
            return Err(invalid(format!(
                "{} trailing bytes after record",
                buf.remaining()
            )));
        }
        Ok(Self { ops })
    }

    /// Encodes the record.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_u32(self.ops.len() as u32);
        for op in &self.ops {
            match op {
                UpdateOp::SetAttr { fid, changes } => {
                    out.put_u32(TAG_SETATTR);
                    put_fid(&mut out, fid);
                    out.put_u32(changes.valid);
                    out.put_u32(changes.mode);
                    out.put_u32(changes.uid);
                    out.put_u32(changes.gid);
                    out.put_u64(changes.size);
                    out.put_u64(changes.mtime.secs);
                    out.put_u32(changes.mtime.nanos);
                }
                UpdateOp::Create {
                    parent,
                    name,
                    mode,
                    uid,
                    gid,
                } => {
                    out.put_u32(TAG_CREATE);
                    put_fid(&mut out, parent);
                    put_name(&mut out, name);
                    out.put_u32(*mode);
                    out.put_u32(*uid);
                    out.put_u32(*gid);
                }
                UpdateOp::Link { fid, parent, name } => {
                    out.put_u32(TAG_LINK);
                    put_fid(&mut out, fid);
                    put_fid(&mut out, parent);
                    put_name(&mut out, name);
                }
                UpdateOp::Unlink { parent, name } => {
                    out.put_u32(TAG_UNLINK);
                    put_fid(&mut out, parent);
                    put_name(&mut out, name);
                }
                UpdateOp::Rename {
                    src_parent,
                    src_name,
                    dst_parent,
                    dst_name,
                } => {
                    out.put_u32(TAG_RENAME);
                    put_fid(&mut out, src_parent);
                    put_name(&mut out, src_name);
                    put_fid(&mut out, dst_parent);
                    put_name(&mut out, dst_name);
                }
            }
        }
        out.freeze()
    }

    /// Applies the sub-operations in order, stopping at the first failure.
    /// Returns how many were applied.
    pub fn apply(&self, fs: &dyn MdsFilesystem) -> Result<usize, SubopFailure> {
        for (index, op) in self.ops.iter().enumerate() {
            if let Err(error) = fs.apply_update(op) {
                warn!(
                    index,
                    kind = op.kind(),
                    applied = index,
                    error = %error,
                    "update record stopped"
                );
                return Err(SubopFailure { index, error });
            }
            debug!(index, kind = op.kind(), "sub-operation applied");
        }
        Ok(self.ops.len())
    }
}
