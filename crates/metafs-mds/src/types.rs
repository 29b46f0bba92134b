//! Core metadata types and the error taxonomy shared by every MDS module.

use serde::{Deserialize, Serialize};
use std::fmt;

use metafs_transport::TransportError;

/// Wire status codes (negated errno values).
pub mod status {
    /// Success.
    pub const OK: i32 = 0;
    /// Operation not permitted.
    pub const EPERM: i32 = -1;
    /// No such file or directory.
    pub const ENOENT: i32 = -2;
    /// Interrupted.
    pub const EINTR: i32 = -4;
    /// I/O error.
    pub const EIO: i32 = -5;
    /// Bad file handle.
    pub const EBADF: i32 = -9;
    /// Out of memory.
    pub const ENOMEM: i32 = -12;
    /// Device or resource busy.
    pub const EBUSY: i32 = -16;
    /// File exists.
    pub const EEXIST: i32 = -17;
    /// No such device.
    pub const ENODEV: i32 = -19;
    /// Not a directory.
    pub const ENOTDIR: i32 = -20;
    /// Invalid argument.
    pub const EINVAL: i32 = -22;
    /// Directory not empty.
    pub const ENOTEMPTY: i32 = -39;
    /// Protocol error.
    pub const EPROTO: i32 = -71;
    /// Operation already in progress.
    pub const EALREADY: i32 = -114;
    /// Stale file handle.
    pub const ESTALE: i32 = -116;
}

/// File type bits of `mode`.
pub const S_IFMT: u32 = 0o170000;
/// Directory.
pub const S_IFDIR: u32 = 0o040000;
/// Regular file.
pub const S_IFREG: u32 = 0o100000;

/// Inode number in the backing filesystem.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeId(u64);

impl InodeId {
    /// Root directory inode of a freshly formatted filesystem.
    pub const ROOT: InodeId = InodeId(2);

    /// Creates an InodeId from a raw value.
    pub fn new(id: u64) -> Self {
        InodeId(id)
    }

    /// Raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network-visible name of a filesystem object.
///
/// Caller supplied and never trusted: the generation is checked against the
/// live inode before a handle is handed out. A generation of 0 means "any".
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FileIdentifier {
    /// Inode number.
    pub ino: u64,
    /// Inode generation at the time the identifier was issued.
    pub generation: u32,
}

impl FileIdentifier {
    /// Creates an identifier.
    pub fn new(ino: u64, generation: u32) -> Self {
        Self { ino, generation }
    }

    /// Inode number as a typed id.
    pub fn inode(&self) -> InodeId {
        InodeId::new(self.ino)
    }
}

impl fmt::Display for FileIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.ino, self.generation)
    }
}

/// Seconds/nanoseconds timestamp.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub secs: u64,
    /// Nanoseconds within the second.
    pub nanos: u32,
}

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }

    /// Timestamp from whole seconds.
    pub fn from_secs(secs: u64) -> Self {
        Self { secs, nanos: 0 }
    }
}

/// Attributes of an inode as reported by GETATTR.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    /// Inode number.
    pub ino: InodeId,
    /// Generation, bumped when the inode number is reused.
    pub generation: u32,
    /// Type and permission bits.
    pub mode: u32,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Hard link count.
    pub nlink: u32,
    /// Size in bytes.
    pub size: u64,
    /// Last access.
    pub atime: Timestamp,
    /// Last modification.
    pub mtime: Timestamp,
    /// Last status change.
    pub ctime: Timestamp,
    /// Object id stored with the inode (cleared before the inode is reclaimed).
    pub objid: u64,
}

impl InodeAttr {
    /// True for directories.
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

/// Errors produced while serving metadata requests.
///
/// Every variant maps to a wire status through [`MdsError::status`]; handler
/// errors become reply statuses and never escape the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum MdsError {
    /// The identifier no longer names a live inode.
    #[error("stale file identifier {0}")]
    StaleHandle(FileIdentifier),

    /// Lookup target does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// An operation-specific precondition was violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Close of a handle that is not open.
    #[error("bad file handle {0:#x}")]
    BadHandle(u64),

    /// A reply or transfer buffer could not be allocated.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A bulk transfer was interrupted or timed out.
    #[error("bulk transfer {xid} interrupted")]
    Interrupted {
        /// Transaction id of the transfer.
        xid: u64,
    },

    /// The transport failed to move data.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// A fault-injection point forced the failure.
    #[error("injected failure at fail point {0:#x}")]
    InjectedFailure(u32),

    /// A fault-injection point forced this raw status.
    #[error("forced status {0}")]
    Forced(i32),

    /// Backing filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Name already exists in the directory.
    #[error("entry {0} already exists")]
    Exists(String),

    /// Parent is not a directory.
    #[error("inode {0} is not a directory")]
    NotADirectory(InodeId),

    /// Directory still has entries.
    #[error("directory {0} is not empty")]
    DirectoryNotEmpty(InodeId),

    /// Malformed request body.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Teardown attempted with client sessions attached. Never on the wire.
    #[error("{0} client session(s) still attached")]
    Busy(usize),

    /// Mount requested a filesystem type outside the allow-list.
    #[error("unsupported MDS filesystem type {0}")]
    UnsupportedFsType(String),

    /// The service is not set up.
    #[error("service not running")]
    NotRunning,

    /// The service is already set up.
    #[error("service already running")]
    AlreadyRunning,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal invariant broken (poisoned lock, worker panic).
    #[error("internal error: {0}")]
    Internal(String),
}

impl MdsError {
    /// Negative errno-style wire status for this error.
    pub fn status(&self) -> i32 {
        match self {
            MdsError::StaleHandle(_) => status::ESTALE,
            MdsError::NotFound(_) => status::ENOENT,
            MdsError::InvalidArgument(_) | MdsError::Config(_) => status::EINVAL,
            MdsError::BadHandle(_) => status::EBADF,
            MdsError::ResourceExhausted(_) => status::ENOMEM,
            MdsError::Interrupted { .. } => status::EINTR,
            MdsError::TransportFailure(_)
            | MdsError::InjectedFailure(_)
            | MdsError::Io(_)
            | MdsError::Internal(_) => status::EIO,
            MdsError::Forced(rc) => *rc,
            MdsError::Exists(_) => status::EEXIST,
            MdsError::NotADirectory(_) => status::ENOTDIR,
            MdsError::DirectoryNotEmpty(_) => status::ENOTEMPTY,
            MdsError::Protocol(_) => status::EPROTO,
            MdsError::Busy(_) => status::EBUSY,
            MdsError::UnsupportedFsType(_) => status::EPERM,
            MdsError::NotRunning => status::ENODEV,
            MdsError::AlreadyRunning => status::EALREADY,
        }
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        MdsError::Internal(format!("{} lock poisoned", what))
    }
}

impl From<TransportError> for MdsError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Interrupted { xid } | TransportError::Timeout { xid, .. } => {
                MdsError::Interrupted { xid }
            }
            TransportError::PoolExhausted { max_count } => MdsError::ResourceExhausted(format!(
                "all {} page buffers in use",
                max_count
            )),
            TransportError::MalformedPacket { reason } => MdsError::Protocol(reason),
            other => MdsError::TransportFailure(other.to_string()),
        }
    }
}
