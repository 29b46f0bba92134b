//! Filesystem adapter consumed by the metadata server.
//!
//! The MDS owns no on-disk format. It reaches the backing filesystem only
//! through [`MdsFilesystem`], mounted by a [`Mounter`]. [`crate::memfs`]
//! provides the in-memory implementation.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::reint::UpdateOp;
use crate::types::{FileIdentifier, InodeAttr, InodeId, MdsError, Timestamp};

/// Filesystem types the MDS can serve from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    /// Journaling variant.
    Ext3,
    /// Non-journaling variant.
    Ext2,
}

impl FsType {
    /// Every supported type.
    pub const SUPPORTED: [FsType; 2] = [FsType::Ext3, FsType::Ext2];

    /// Name used in mount specs.
    pub fn name(&self) -> &'static str {
        match self {
            FsType::Ext3 => "ext3",
            FsType::Ext2 => "ext2",
        }
    }

    /// Whether metadata updates go through a journal.
    pub fn journaled(&self) -> bool {
        matches!(self, FsType::Ext3)
    }
}

impl FromStr for FsType {
    type Err = MdsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FsType::SUPPORTED
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| MdsError::UnsupportedFsType(s.to_string()))
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Open flags, Linux `O_*` values.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Read only.
    pub const READ_ONLY: OpenFlags = OpenFlags(0);
    /// Write only.
    pub const WRITE_ONLY: OpenFlags = OpenFlags(0o1);
    /// Read and write.
    pub const READ_WRITE: OpenFlags = OpenFlags(0o2);
    /// Truncate on open.
    pub const TRUNCATE: OpenFlags = OpenFlags(0o1000);
    /// Large file offsets.
    pub const LARGEFILE: OpenFlags = OpenFlags(0o100000);

    const ACCMODE: u32 = 0o3;

    /// Wraps raw wire flags.
    pub fn from_bits(bits: u32) -> Self {
        OpenFlags(bits)
    }

    /// Raw bits.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// True if every bit of `other` is set.
    pub fn contains(&self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if the access mode permits reads.
    pub fn is_readable(&self) -> bool {
        matches!(self.0 & Self::ACCMODE, 0 | 2)
    }

    /// True if the access mode permits writes.
    pub fn is_writable(&self) -> bool {
        matches!(self.0 & Self::ACCMODE, 1 | 2)
    }

    /// True for the reserved access mode 3.
    pub fn is_invalid_mode(&self) -> bool {
        self.0 & Self::ACCMODE == Self::ACCMODE
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        OpenFlags(self.0 | rhs.0)
    }
}

/// Attribute changes carried by a SETATTR update. Only fields whose bit is
/// set in `valid` are applied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttrChanges {
    /// Bitmask of `ATTR_*` flags.
    pub valid: u32,
    /// New permission bits (type bits are preserved).
    pub mode: u32,
    /// New owner.
    pub uid: u32,
    /// New group.
    pub gid: u32,
    /// New size; truncates or zero-extends.
    pub size: u64,
    /// New modification time.
    pub mtime: Timestamp,
}

impl AttrChanges {
    /// Apply `mode`.
    pub const ATTR_MODE: u32 = 1 << 0;
    /// Apply `uid`.
    pub const ATTR_UID: u32 = 1 << 1;
    /// Apply `gid`.
    pub const ATTR_GID: u32 = 1 << 2;
    /// Apply `size`.
    pub const ATTR_SIZE: u32 = 1 << 3;
    /// Apply `mtime`.
    pub const ATTR_MTIME: u32 = 1 << 4;

    /// True if `flag` is set in `valid`.
    pub fn has(&self, flag: u32) -> bool {
        self.valid & flag != 0
    }
}

/// Snapshot of an inode as seen by the lookup table.
#[derive(Clone, Debug)]
pub struct FsEntry {
    /// Current attributes.
    pub attr: InodeAttr,
    /// Inode failed validation when read.
    pub bad: bool,
    /// Path from the root, if a chain of parent links reaches it.
    pub path: Option<String>,
}

/// Callback run on an inode right before the filesystem reclaims it.
pub trait InodeDeleteHook: Send + Sync {
    /// May modify the attributes about to be discarded.
    fn before_delete(&self, attr: &mut InodeAttr);
}

/// The backing filesystem as seen by the MDS.
pub trait MdsFilesystem: Send + Sync {
    /// Filesystem type string this instance was mounted as.
    fn fs_type(&self) -> String;

    /// Device or path the filesystem was mounted from.
    fn device(&self) -> String;

    /// Looks an inode up by number. Fails with `NotFound` if it is not live.
    fn lookup_by_inode(&self, ino: InodeId) -> Result<FsEntry, MdsError>;

    /// Resolves a name in a directory.
    fn lookup_name(&self, parent: InodeId, name: &str) -> Result<InodeId, MdsError>;

    /// Opens an inode, returning an opaque handle value.
    fn open_entry(&self, ino: InodeId, flags: OpenFlags) -> Result<u64, MdsError>;

    /// Closes a handle returned by `open_entry`. Each handle closes once.
    fn close_handle(&self, handle: u64) -> Result<(), MdsError>;

    /// Reads up to `buf.len()` bytes at `offset` through an open handle.
    fn read_page(&self, handle: u64, offset: u64, buf: &mut [u8]) -> Result<usize, MdsError>;

    /// Writes bytes at `offset`, extending the file.
    fn write_at(&self, ino: InodeId, offset: u64, data: &[u8]) -> Result<usize, MdsError>;

    /// Changes attributes of `fid`, returning the updated attributes.
    fn set_attr(&self, fid: FileIdentifier, changes: &AttrChanges) -> Result<InodeAttr, MdsError>;

    /// Creates `name` under `parent`. Directories are created when `mode`
    /// carries the directory type bits.
    fn create(
        &self,
        parent: FileIdentifier,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<InodeAttr, MdsError>;

    /// Adds a hard link to `fid` named `name` under `parent`.
    fn link(&self, fid: FileIdentifier, parent: FileIdentifier, name: &str) -> Result<(), MdsError>;

    /// Removes `name` from `parent`.
    fn unlink(&self, parent: FileIdentifier, name: &str) -> Result<(), MdsError>;

    /// Moves `src_name` to `dst_name`, replacing a non-directory target.
    fn rename(
        &self,
        src_parent: FileIdentifier,
        src_name: &str,
        dst_parent: FileIdentifier,
        dst_name: &str,
    ) -> Result<(), MdsError>;

    /// Applies one metadata mutation from an update record.
    fn apply_update(&self, op: &UpdateOp) -> Result<(), MdsError> {
        match op {
            UpdateOp::SetAttr { fid, changes } => self.set_attr(*fid, changes).map(|_| ()),
            UpdateOp::Create {
                parent,
                name,
                mode,
                uid,
                gid,
            } => self.create(*parent, name, *mode, *uid, *gid).map(|_| ()),
            UpdateOp::Link { fid, parent, name } => self.link(*fid, *parent, name),
            UpdateOp::Unlink { parent, name } => self.unlink(*parent, name),
            UpdateOp::Rename {
                src_parent,
                src_name,
                dst_parent,
                dst_name,
            } => self.rename(*src_parent, src_name, *dst_parent, dst_name),
        }
    }

    /// Object id stored with an inode.
    fn object_id(&self, ino: InodeId) -> Result<u64, MdsError>;

    /// Stores an object id with an inode.
    fn set_object_id(&self, ino: InodeId, objid: u64) -> Result<(), MdsError>;

    /// Installs a delete hook, returning the one it replaces.
    fn install_delete_hook(&self, hook: Arc<dyn InodeDeleteHook>)
        -> Option<Arc<dyn InodeDeleteHook>>;

    /// Removes the delete hook, restoring plain reclaim.
    fn remove_delete_hook(&self) -> Option<Arc<dyn InodeDeleteHook>>;
}

/// Mounts and unmounts backing filesystems.
pub trait Mounter: Send + Sync {
    /// Mounts `device` as `fstype`.
    fn mount(&self, fstype: &str, device: &str) -> Result<Arc<dyn MdsFilesystem>, MdsError>;

    /// Releases a mount.
    fn unmount(&self, fs: Arc<dyn MdsFilesystem>) -> Result<(), MdsError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fs_type_allow_list() {
        assert_eq!("ext3".parse::<FsType>().unwrap(), FsType::Ext3);
        assert_eq!("ext2".parse::<FsType>().unwrap(), FsType::Ext2);
        let err = "xfs".parse::<FsType>().unwrap_err();
        assert!(matches!(err, MdsError::UnsupportedFsType(t) if t == "xfs"));
        assert!(FsType::Ext3.journaled());
        assert!(!FsType::Ext2.journaled());
    }

    #[test]
    fn test_open_flags_access_mode() {
        assert!(OpenFlags::READ_ONLY.is_readable());
        assert!(!OpenFlags::READ_ONLY.is_writable());
        assert!(OpenFlags::WRITE_ONLY.is_writable());
        assert!(!OpenFlags::WRITE_ONLY.is_readable());
        let rw = OpenFlags::READ_WRITE | OpenFlags::LARGEFILE;
        assert!(rw.is_readable() && rw.is_writable());
        assert!(rw.contains(OpenFlags::LARGEFILE));
        assert!(OpenFlags::from_bits(3).is_invalid_mode());
    }

    #[test]
    fn test_attr_changes_mask() {
        let changes = AttrChanges {
            valid: AttrChanges::ATTR_SIZE | AttrChanges::ATTR_UID,
            ..Default::default()
        };
        assert!(changes.has(AttrChanges::ATTR_SIZE));
        assert!(changes.has(AttrChanges::ATTR_UID));
        assert!(!changes.has(AttrChanges::ATTR_MODE));
    }
}
