//! File identifier to live handle resolution.
//!
//! Identifiers arrive from the network and are never trusted: the inode must
//! be live, valid, and (for a non-zero generation) carry the same generation.
//! The result is tagged once, at resolve time, as connected (a path from the
//! root is known) or disconnected (entry only). Every handle holds a counted
//! reference on its inode and optionally on the mount; both are released
//! when the handle drops.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error};

use crate::backend::{FsEntry, MdsFilesystem};
use crate::types::{FileIdentifier, InodeAttr, InodeId, MdsError};

/// A counted reference on the mounted filesystem.
pub struct MountRef {
    fs: Arc<dyn MdsFilesystem>,
    count: Arc<AtomicUsize>,
}

impl MountRef {
    /// The mounted filesystem.
    pub fn fs(&self) -> &Arc<dyn MdsFilesystem> {
        &self.fs
    }
}

impl Drop for MountRef {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A filesystem entry with a held reference.
pub struct HeldEntry {
    entry: FsEntry,
    mount: Option<MountRef>,
    held: Arc<DashMap<InodeId, usize>>,
}

impl HeldEntry {
    /// Mount reference taken at resolve time, if one was requested.
    pub fn mount(&self) -> Option<&MountRef> {
        self.mount.as_ref()
    }
}

impl Deref for HeldEntry {
    type Target = FsEntry;

    fn deref(&self) -> &FsEntry {
        &self.entry
    }
}

impl Drop for HeldEntry {
    fn drop(&mut self) {
        let ino = self.entry.attr.ino;
        self.held.remove_if_mut(&ino, |_, count| {
            *count -= 1;
            *count == 0
        });
    }
}

/// A resolved identifier. Valid for one request; never cached.
pub enum ResolvedHandle {
    /// Entry reachable from the root by `path`.
    Connected {
        /// The entry.
        entry: HeldEntry,
        /// Path from the filesystem root.
        path: String,
    },
    /// Entry without a known path. Fine for attribute, open, read and close.
    Disconnected {
        /// The entry.
        entry: HeldEntry,
    },
}

impl ResolvedHandle {
    /// The held entry.
    pub fn entry(&self) -> &HeldEntry {
        match self {
            ResolvedHandle::Connected { entry, .. } | ResolvedHandle::Disconnected { entry } => {
                entry
            }
        }
    }

    /// Attributes at resolve time.
    pub fn attr(&self) -> &InodeAttr {
        &self.entry().attr
    }

    /// Inode number.
    pub fn ino(&self) -> InodeId {
        self.attr().ino
    }

    /// True for connected handles.
    pub fn is_connected(&self) -> bool {
        matches!(self, ResolvedHandle::Connected { .. })
    }

    /// Path for connected handles.
    pub fn path(&self) -> Option<&str> {
        match self {
            ResolvedHandle::Connected { path, .. } => Some(path),
            ResolvedHandle::Disconnected { .. } => None,
        }
    }

    /// Mounted filesystem, if a mount reference was requested.
    pub fn mount(&self) -> Option<&Arc<dyn MdsFilesystem>> {
        self.entry().mount().map(MountRef::fs)
    }
}

/// Resolves identifiers against one mounted filesystem.
pub struct HandleResolver {
    fs: Arc<dyn MdsFilesystem>,
    held: Arc<DashMap<InodeId, usize>>,
    mount_refs: Arc<AtomicUsize>,
}

impl HandleResolver {
    /// Creates a resolver for `fs`.
    pub fn new(fs: Arc<dyn MdsFilesystem>) -> Self {
        Self {
            fs,
            held: Arc::new(DashMap::new()),
            mount_refs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The filesystem identifiers are resolved against.
    pub fn fs(&self) -> &Arc<dyn MdsFilesystem> {
        &self.fs
    }

    /// Resolves `fid`, taking a mount reference as well when `with_mount`.
    pub fn resolve(
        &self,
        fid: FileIdentifier,
        with_mount: bool,
    ) -> Result<ResolvedHandle, MdsError> {
        if fid.ino == 0 {
            return Err(MdsError::StaleHandle(fid));
        }
        let entry = match self.fs.lookup_by_inode(fid.inode()) {
            Ok(entry) => entry,
            Err(MdsError::NotFound(_)) => {
                debug!(fid = %fid, "no such inode");
                return Err(MdsError::StaleHandle(fid));
            }
            Err(e) => return Err(e),
        };
        if entry.bad || (fid.generation != 0 && entry.attr.generation != fid.generation) {
            error!(
                fid = %fid,
                bad = entry.bad,
                nlink = entry.attr.nlink,
                generation = entry.attr.generation,
                "identifier does not match live inode"
            );
            return Err(MdsError::StaleHandle(fid));
        }

        *self.held.entry(entry.attr.ino).or_insert(0) += 1;
        let mount = with_mount.then(|| {
            self.mount_refs.fetch_add(1, Ordering::AcqRel);
            MountRef {
                fs: self.fs.clone(),
                count: self.mount_refs.clone(),
            }
        });
        let path = entry.path.clone();
        let held = HeldEntry {
            entry,
            mount,
            held: self.held.clone(),
        };
        Ok(match path {
            Some(path) => ResolvedHandle::Connected { entry: held, path },
            None => ResolvedHandle::Disconnected { entry: held },
        })
    }

    /// Live references on `ino`.
    pub fn held_count(&self, ino: InodeId) -> usize {
        self.held.get(&ino).map(|c| *c).unwrap_or(0)
    }

    /// Live references across all inodes.
    pub fn total_held(&self) -> usize {
        self.held.iter().map(|c| *c.value()).sum()
    }

    /// Live mount references.
    pub fn mount_refs(&self) -> usize {
        self.mount_refs.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfs::MemoryFs;
    use proptest::prelude::*;

    fn setup() -> (Arc<MemoryFs>, HandleResolver) {
        let fs = Arc::new(MemoryFs::new("dev"));
        fs.insert_inode(InodeId::new(42), 7, 0o644, Some((InodeId::ROOT, "f")))
            .unwrap();
        let resolver = HandleResolver::new(fs.clone());
        (fs, resolver)
    }

    #[test]
    fn test_matching_generation_resolves_connected() {
        let (_fs, resolver) = setup();
        let handle = resolver.resolve(FileIdentifier::new(42, 7), false).unwrap();
        assert!(handle.is_connected());
        assert_eq!(handle.path(), Some("/f"));
        assert_eq!(handle.ino(), InodeId::new(42));
        assert!(handle.mount().is_none());
    }

    #[test]
    fn test_zero_generation_matches_any() {
        let (_fs, resolver) = setup();
        assert!(resolver.resolve(FileIdentifier::new(42, 0), false).is_ok());
    }

    #[test]
    fn test_generation_mismatch_is_stale() {
        let (_fs, resolver) = setup();
        let err = resolver
            .resolve(FileIdentifier::new(42, 8), false)
            .err()
            .unwrap();
        assert!(matches!(err, MdsError::StaleHandle(f) if f == FileIdentifier::new(42, 8)));
        assert_eq!(resolver.total_held(), 0);
    }

    #[test]
    fn test_missing_and_zero_inode_are_stale() {
        let (_fs, resolver) = setup();
        for fid in [FileIdentifier::new(0, 0), FileIdentifier::new(999, 1)] {
            let err = resolver.resolve(fid, false).err().unwrap();
            assert!(matches!(err, MdsError::StaleHandle(_)));
        }
    }

    #[test]
    fn test_bad_inode_is_stale() {
        let (fs, resolver) = setup();
        fs.mark_bad(InodeId::new(42)).unwrap();
        let err = resolver
            .resolve(FileIdentifier::new(42, 7), false)
            .err()
            .unwrap();
        assert!(matches!(err, MdsError::StaleHandle(_)));
    }

    #[test]
    fn test_pathless_entry_is_disconnected() {
        let (fs, resolver) = setup();
        fs.insert_inode(InodeId::new(50), 3, 0o644, None).unwrap();
        let handle = resolver.resolve(FileIdentifier::new(50, 3), true).unwrap();
        assert!(!handle.is_connected());
        assert!(handle.path().is_none());
        assert!(handle.mount().is_some());
    }

    #[test]
    fn test_references_released_on_drop() {
        let (_fs, resolver) = setup();
        let a = resolver.resolve(FileIdentifier::new(42, 7), true).unwrap();
        let b = resolver.resolve(FileIdentifier::new(42, 7), false).unwrap();
        assert_eq!(resolver.held_count(InodeId::new(42)), 2);
        assert_eq!(resolver.mount_refs(), 1);
        drop(a);
        assert_eq!(resolver.held_count(InodeId::new(42)), 1);
        assert_eq!(resolver.mount_refs(), 0);
        drop(b);
        assert_eq!(resolver.held_count(InodeId::new(42)), 0);
        assert_eq!(resolver.total_held(), 0);
    }

    proptest! {
        #[test]
        fn prop_mismatched_generation_is_stale(generation in 1u32.., with_mount in any::<bool>()) {
            prop_assume!(generation != 7);
            let (_fs, resolver) = setup();
            let fid = FileIdentifier::new(42, generation);
            let err = resolver.resolve(fid, with_mount).err().unwrap();
            prop_assert!(matches!(err, MdsError::StaleHandle(f) if f == fid));
            prop_assert_eq!(resolver.total_held(), 0);
            prop_assert_eq!(resolver.mount_refs(), 0);
        }
    }
}
