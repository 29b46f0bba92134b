//! In-memory backing filesystem.
//!
//! Inodes carry generations that are bumped whenever an inode number is
//! reused, directory links that define connectedness, and an open-handle
//! table. An inode is reclaimed once its link count is zero and no handle
//! refers to it; the installed delete hook sees its attributes first.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::backend::{AttrChanges, FsEntry, InodeDeleteHook, MdsFilesystem, Mounter, OpenFlags};
use crate::types::{
    FileIdentifier, InodeAttr, InodeId, MdsError, Timestamp, S_IFDIR, S_IFMT, S_IFREG,
};

/// Longest permitted directory entry name.
pub const MAX_NAME_LEN: usize = 255;

/// Largest file the in-memory store will hold.
pub const MAX_FILE_SIZE: u64 = 1 << 32;

const MAX_PATH_DEPTH: usize = 256;
const FIRST_FREE_INO: u64 = 11;

struct Node {
    attr: InodeAttr,
    data: Vec<u8>,
    children: BTreeMap<String, InodeId>,
    parents: Vec<(InodeId, String)>,
    open_count: u32,
    bad: bool,
}

impl Node {
    fn new(attr: InodeAttr) -> Self {
        Self {
            attr,
            data: Vec::new(),
            children: BTreeMap::new(),
            parents: Vec::new(),
            open_count: 0,
            bad: false,
        }
    }
}

struct OpenFile {
    ino: InodeId,
    flags: OpenFlags,
}

struct State {
    fs_type: String,
    nodes: HashMap<InodeId, Node>,
    generations: HashMap<InodeId, u32>,
    free: BTreeSet<u64>,
    next_ino: u64,
    handles: HashMap<u64, OpenFile>,
    next_handle: u64,
}

impl State {
    fn node(&self, ino: InodeId) -> Result<&Node, MdsError> {
        self.nodes
            .get(&ino)
            .ok_or_else(|| MdsError::NotFound(format!("inode {}", ino)))
    }

    fn node_mut(&mut self, ino: InodeId) -> Result<&mut Node, MdsError> {
        self.nodes
            .get_mut(&ino)
            .ok_or_else(|| MdsError::NotFound(format!("inode {}", ino)))
    }

    /// Checks a caller-supplied identifier against the live inode.
    fn check_fid(&self, fid: FileIdentifier) -> Result<InodeId, MdsError> {
        let ino = fid.inode();
        match self.nodes.get(&ino) {
            Some(node)
                if !node.bad && (fid.generation == 0 || fid.generation == node.attr.generation) =>
            {
                Ok(ino)
            }
            _ => Err(MdsError::StaleHandle(fid)),
        }
    }

    fn check_dir(&self, fid: FileIdentifier) -> Result<InodeId, MdsError> {
        let ino = self.check_fid(fid)?;
        if !self.node(ino)?.attr.is_dir() {
            return Err(MdsError::NotADirectory(ino));
        }
        Ok(ino)
    }

    fn child(&self, dir: InodeId, name: &str) -> Result<InodeId, MdsError> {
        self.node(dir)?
            .children
            .get(name)
            .copied()
            .ok_or_else(|| MdsError::NotFound(name.to_string()))
    }

    fn alloc(&mut self) -> (InodeId, u32) {
        let raw = match self.free.pop_first() {
            Some(raw) => raw,
            None => {
                let raw = self.next_ino;
                self.next_ino += 1;
                raw
            }
        };
        let ino = InodeId::new(raw);
        let generation = self
            .generations
            .entry(ino)
            .and_modify(|g| *g = g.wrapping_add(1).max(1))
            .or_insert(1);
        (ino, *generation)
    }

    fn path_of(&self, ino: InodeId) -> Option<String> {
        let mut names = Vec::new();
        let mut cur = ino;
        for _ in 0..MAX_PATH_DEPTH {
            if cur == InodeId::ROOT {
                names.reverse();
                return Some(format!("/{}", names.join("/")));
            }
            let (parent, name) = self.nodes.get(&cur)?.parents.first()?;
            names.push(name.clone());
            cur = *parent;
        }
        None
    }

    fn is_ancestor(&self, ancestor: InodeId, of: InodeId) -> bool {
        let mut cur = of;
        for _ in 0..MAX_PATH_DEPTH {
            if cur == ancestor {
                return true;
            }
            match self.nodes.get(&cur).and_then(|n| n.parents.first()) {
                Some((parent, _)) => cur = *parent,
                None => return false,
            }
        }
        false
    }

    fn add_link(&mut self, dir: InodeId, name: &str, ino: InodeId) -> Result<(), MdsError> {
        let now = Timestamp::now();
        let parent = self.node_mut(dir)?;
        parent.children.insert(name.to_string(), ino);
        parent.attr.mtime = now;
        parent.attr.ctime = now;
        let node = self.node_mut(ino)?;
        node.parents.push((dir, name.to_string()));
        Ok(())
    }

    /// Removes a directory entry and drops the link it held.
    fn drop_link(&mut self, dir: InodeId, name: &str) -> Result<InodeId, MdsError> {
        let now = Timestamp::now();
        let ino = self.child(dir, name)?;
        let is_dir = self.node(ino)?.attr.is_dir();
        let parent = self.node_mut(dir)?;
        parent.children.remove(name);
        parent.attr.mtime = now;
        parent.attr.ctime = now;
        if is_dir {
            parent.attr.nlink = parent.attr.nlink.saturating_sub(1);
        }
        let node = self.node_mut(ino)?;
        node.parents.retain(|(p, n)| !(*p == dir && n == name));
        node.attr.nlink = if is_dir {
            0
        } else {
            node.attr.nlink.saturating_sub(1)
        };
        node.attr.ctime = now;
        Ok(ino)
    }
}

fn validate_name(name: &str) -> Result<(), MdsError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(MdsError::InvalidArgument(format!("bad name {:?}", name)));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(MdsError::InvalidArgument(format!(
            "name is {} bytes, limit {}",
            name.len(),
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

fn new_attr(ino: InodeId, generation: u32, mode: u32, uid: u32, gid: u32) -> InodeAttr {
    let now = Timestamp::now();
    let mode = if mode & S_IFMT == 0 { mode | S_IFREG } else { mode };
    InodeAttr {
        ino,
        generation,
        mode,
        uid,
        gid,
        nlink: if mode & S_IFMT == S_IFDIR { 2 } else { 1 },
        size: 0,
        atime: now,
        mtime: now,
        ctime: now,
        objid: 0,
    }
}

/// In-memory [`MdsFilesystem`].
pub struct MemoryFs {
    device: String,
    state: RwLock<State>,
    delete_hook: RwLock<Option<Arc<dyn InodeDeleteHook>>>,
    reclaimed: AtomicU64,
}

impl MemoryFs {
    /// Formats an empty filesystem holding only the root directory.
    pub fn new(device: impl Into<String>) -> Self {
        let mut nodes = HashMap::new();
        let mut generations = HashMap::new();
        nodes.insert(
            InodeId::ROOT,
            Node::new(new_attr(InodeId::ROOT, 1, S_IFDIR | 0o755, 0, 0)),
        );
        generations.insert(InodeId::ROOT, 1);
        Self {
            device: device.into(),
            state: RwLock::new(State {
                fs_type: String::new(),
                nodes,
                generations,
                free: BTreeSet::new(),
                next_ino: FIRST_FREE_INO,
                handles: HashMap::new(),
                next_handle: 1,
            }),
            delete_hook: RwLock::new(None),
            reclaimed: AtomicU64::new(0),
        }
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, MdsError> {
        self.state.read().map_err(|_| MdsError::poisoned("memfs"))
    }

    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, MdsError> {
        self.state.write().map_err(|_| MdsError::poisoned("memfs"))
    }

    pub(crate) fn set_mounted_as(&self, fs_type: &str) -> Result<(), MdsError> {
        self.write_state()?.fs_type = fs_type.to_string();
        Ok(())
    }

    /// Places an inode with a chosen number and generation, as found on an
    /// existing volume. With `link` the inode is entered into that directory;
    /// without it the inode exists but no path to it is known.
    pub fn insert_inode(
        &self,
        ino: InodeId,
        generation: u32,
        mode: u32,
        link: Option<(InodeId, &str)>,
    ) -> Result<InodeAttr, MdsError> {
        let mut state = self.write_state()?;
        if state.nodes.contains_key(&ino) {
            return Err(MdsError::Exists(format!("inode {}", ino)));
        }
        if let Some((dir, name)) = link {
            validate_name(name)?;
            if !state.node(dir)?.attr.is_dir() {
                return Err(MdsError::NotADirectory(dir));
            }
            if state.node(dir)?.children.contains_key(name) {
                return Err(MdsError::Exists(name.to_string()));
            }
        }
        let attr = new_attr(ino, generation, mode, 0, 0);
        state.nodes.insert(ino, Node::new(attr.clone()));
        state.generations.insert(ino, generation);
        state.free.remove(&ino.as_u64());
        if ino.as_u64() >= state.next_ino {
            state.next_ino = ino.as_u64() + 1;
        }
        if let Some((dir, name)) = link {
            state.add_link(dir, name, ino)?;
            if attr.is_dir() {
                state.node_mut(dir)?.attr.nlink += 1;
            }
        }
        Ok(attr)
    }

    /// Marks an inode as failing validation.
    pub fn mark_bad(&self, ino: InodeId) -> Result<(), MdsError> {
        self.write_state()?.node_mut(ino)?.bad = true;
        Ok(())
    }

    /// Number of handles currently open.
    pub fn open_handle_count(&self) -> usize {
        self.state.read().map(|s| s.handles.len()).unwrap_or(0)
    }

    /// Number of inodes reclaimed so far.
    pub fn reclaimed_count(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    /// True if a delete hook is installed.
    pub fn has_delete_hook(&self) -> bool {
        self.delete_hook.read().map(|h| h.is_some()).unwrap_or(false)
    }

    fn reclaim_if_unused(&self, state: &mut State, ino: InodeId) -> Result<(), MdsError> {
        let unused = state
            .nodes
            .get(&ino)
            .is_some_and(|n| n.attr.nlink == 0 && n.open_count == 0);
        if !unused || ino == InodeId::ROOT {
            return Ok(());
        }
        let hook = self
            .delete_hook
            .read()
            .map_err(|_| MdsError::poisoned("delete hook"))?
            .clone();
        if let Some(hook) = hook {
            hook.before_delete(&mut state.node_mut(ino)?.attr);
        }
        if let Some(node) = state.nodes.remove(&ino) {
            state.free.insert(ino.as_u64());
            self.reclaimed.fetch_add(1, Ordering::Relaxed);
            debug!(ino = %ino, generation = node.attr.generation, "inode reclaimed");
        }
        Ok(())
    }
}

impl MdsFilesystem for MemoryFs {
    fn fs_type(&self) -> String {
        self.read_state().map(|s| s.fs_type.clone()).unwrap_or_default()
    }

    fn device(&self) -> String {
        self.device.clone()
    }

    fn lookup_by_inode(&self, ino: InodeId) -> Result<FsEntry, MdsError> {
        let state = self.read_state()?;
        let node = state.node(ino)?;
        Ok(FsEntry {
            attr: node.attr.clone(),
            bad: node.bad,
            path: state.path_of(ino),
        })
    }

    fn lookup_name(&self, parent: InodeId, name: &str) -> Result<InodeId, MdsError> {
        let state = self.read_state()?;
        if !state.node(parent)?.attr.is_dir() {
            return Err(MdsError::NotADirectory(parent));
        }
        state.child(parent, name)
    }

    fn open_entry(&self, ino: InodeId, flags: OpenFlags) -> Result<u64, MdsError> {
        if flags.is_invalid_mode() {
            return Err(MdsError::InvalidArgument(format!(
                "open flags {:#o}",
                flags.bits()
            )));
        }
        let mut state = self.write_state()?;
        let node = state.node_mut(ino)?;
        if node.bad {
            return Err(MdsError::Io(format!("inode {} is bad", ino)));
        }
        if node.attr.is_dir() && flags.is_writable() {
            return Err(MdsError::InvalidArgument(format!(
                "inode {} is a directory",
                ino
            )));
        }
        if flags.is_writable() && flags.contains(OpenFlags::TRUNCATE) {
            node.data.clear();
            node.attr.size = 0;
            node.attr.mtime = Timestamp::now();
        }
        node.open_count += 1;
        let handle = state.next_handle;
        state.next_handle += 1;
        state.handles.insert(handle, OpenFile { ino, flags });
        Ok(handle)
    }

    fn close_handle(&self, handle: u64) -> Result<(), MdsError> {
        let mut state = self.write_state()?;
        let file = state
            .handles
            .remove(&handle)
            .ok_or(MdsError::BadHandle(handle))?;
        if let Some(node) = state.nodes.get_mut(&file.ino) {
            node.open_count = node.open_count.saturating_sub(1);
        }
        self.reclaim_if_unused(&mut state, file.ino)
    }

    fn read_page(&self, handle: u64, offset: u64, buf: &mut [u8]) -> Result<usize, MdsError> {
        let state = self.read_state()?;
        let file = state.handles.get(&handle).ok_or(MdsError::BadHandle(handle))?;
        if !file.flags.is_readable() {
            return Err(MdsError::BadHandle(handle));
        }
        let data = &state.node(file.ino)?.data;
        let len = data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, ino: InodeId, offset: u64, data: &[u8]) -> Result<usize, MdsError> {
        let mut state = self.write_state()?;
        let node = state.node_mut(ino)?;
        if node.attr.is_dir() {
            return Err(MdsError::InvalidArgument(format!(
                "inode {} is a directory",
                ino
            )));
        }
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= MAX_FILE_SIZE)
            .and_then(|end| usize::try_from(end).ok())
            .ok_or_else(|| {
                MdsError::InvalidArgument(format!("write of {} at {}", data.len(), offset))
            })?;
        let start = end - data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[start..end].copy_from_slice(data);
        node.attr.size = node.data.len() as u64;
        let now = Timestamp::now();
        node.attr.mtime = now;
        node.attr.ctime = now;
        Ok(data.len())
    }

    fn set_attr(&self, fid: FileIdentifier, changes: &AttrChanges) -> Result<InodeAttr, MdsError> {
        let mut state = self.write_state()?;
        let ino = state.check_fid(fid)?;
        let node = state.node_mut(ino)?;
        if changes.has(AttrChanges::ATTR_SIZE) {
            if node.attr.is_dir() {
                return Err(MdsError::InvalidArgument(format!(
                    "cannot resize directory {}",
                    ino
                )));
            }
            if changes.size > MAX_FILE_SIZE {
                return Err(MdsError::InvalidArgument(format!("size {}", changes.size)));
            }
            node.data.resize(changes.size as usize, 0);
            node.attr.size = changes.size;
        }
        if changes.has(AttrChanges::ATTR_MODE) {
            node.attr.mode = (node.attr.mode & S_IFMT) | (changes.mode & !S_IFMT);
        }
        if changes.has(AttrChanges::ATTR_UID) {
            node.attr.uid = changes.uid;
        }
        if changes.has(AttrChanges::ATTR_GID) {
            node.attr.gid = changes.gid;
        }
        if changes.has(AttrChanges::ATTR_MTIME) {
            node.attr.mtime = changes.mtime;
        }
        node.attr.ctime = Timestamp::now();
        Ok(node.attr.clone())
    }

    fn create(
        &self,
        parent: FileIdentifier,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<InodeAttr, MdsError> {
        validate_name(name)?;
        let mut state = self.write_state()?;
        let dir = state.check_dir(parent)?;
        if state.node(dir)?.children.contains_key(name) {
            return Err(MdsError::Exists(name.to_string()));
        }
        let (ino, generation) = state.alloc();
        let attr = new_attr(ino, generation, mode, uid, gid);
        state.nodes.insert(ino, Node::new(attr.clone()));
        state.add_link(dir, name, ino)?;
        if attr.is_dir() {
            state.node_mut(dir)?.attr.nlink += 1;
        }
        debug!(parent = %dir, name, ino = %ino, generation, "created");
        Ok(attr)
    }

    fn link(&self, fid: FileIdentifier, parent: FileIdentifier, name: &str) -> Result<(), MdsError> {
        validate_name(name)?;
        let mut state = self.write_state()?;
        let ino = state.check_fid(fid)?;
        let dir = state.check_dir(parent)?;
        if state.node(ino)?.attr.is_dir() {
            return Err(MdsError::InvalidArgument(format!(
                "cannot link directory {}",
                ino
            )));
        }
        if state.node(dir)?.children.contains_key(name) {
            return Err(MdsError::Exists(name.to_string()));
        }
        state.add_link(dir, name, ino)?;
        let node = state.node_mut(ino)?;
        node.attr.nlink += 1;
        node.attr.ctime = Timestamp::now();
        Ok(())
    }

    fn unlink(&self, parent: FileIdentifier, name: &str) -> Result<(), MdsError> {
        let mut state = self.write_state()?;
        let dir = state.check_dir(parent)?;
        let ino = state.child(dir, name)?;
        let node = state.node(ino)?;
        if node.attr.is_dir() && !node.children.is_empty() {
            return Err(MdsError::DirectoryNotEmpty(ino));
        }
        state.drop_link(dir, name)?;
        self.reclaim_if_unused(&mut state, ino)
    }

    fn rename(
        &self,
        src_parent: FileIdentifier,
        src_name: &str,
        dst_parent: FileIdentifier,
        dst_name: &str,
    ) -> Result<(), MdsError> {
        validate_name(dst_name)?;
        let mut state = self.write_state()?;
        let src_dir = state.check_dir(src_parent)?;
        let dst_dir = state.check_dir(dst_parent)?;
        let ino = state.child(src_dir, src_name)?;
        if src_dir == dst_dir && src_name == dst_name {
            return Ok(());
        }
        let is_dir = state.node(ino)?.attr.is_dir();
        if is_dir && state.is_ancestor(ino, dst_dir) {
            return Err(MdsError::InvalidArgument(format!(
                "cannot move {} below itself",
                src_name
            )));
        }
        let existing = state.node(dst_dir)?.children.get(dst_name).copied();
        let replaced = match existing {
            Some(target) if state.node(target)?.attr.is_dir() => {
                return Err(MdsError::Exists(dst_name.to_string()));
            }
            Some(_) => Some(state.drop_link(dst_dir, dst_name)?),
            None => None,
        };

        let now = Timestamp::now();
        let src = state.node_mut(src_dir)?;
        src.children.remove(src_name);
        src.attr.mtime = now;
        if is_dir && src_dir != dst_dir {
            src.attr.nlink = src.attr.nlink.saturating_sub(1);
        }
        let dst = state.node_mut(dst_dir)?;
        dst.children.insert(dst_name.to_string(), ino);
        dst.attr.mtime = now;
        if is_dir && src_dir != dst_dir {
            dst.attr.nlink += 1;
        }
        let node = state.node_mut(ino)?;
        for link in node.parents.iter_mut() {
            if link.0 == src_dir && link.1 == src_name {
                *link = (dst_dir, dst_name.to_string());
                break;
            }
        }
        node.attr.ctime = now;

        if let Some(old) = replaced {
            self.reclaim_if_unused(&mut state, old)?;
        }
        Ok(())
    }

    fn object_id(&self, ino: InodeId) -> Result<u64, MdsError> {
        Ok(self.read_state()?.node(ino)?.attr.objid)
    }

    fn set_object_id(&self, ino: InodeId, objid: u64) -> Result<(), MdsError> {
        self.write_state()?.node_mut(ino)?.attr.objid = objid;
        Ok(())
    }

    fn install_delete_hook(
        &self,
        hook: Arc<dyn InodeDeleteHook>,
    ) -> Option<Arc<dyn InodeDeleteHook>> {
        self.delete_hook.write().ok()?.replace(hook)
    }

    fn remove_delete_hook(&self) -> Option<Arc<dyn InodeDeleteHook>> {
        self.delete_hook.write().ok()?.take()
    }
}

/// [`Mounter`] over in-memory volumes keyed by device name. Unknown devices
/// are formatted on first mount.
#[derive(Default)]
pub struct MemoryMounter {
    devices: Mutex<HashMap<String, Arc<MemoryFs>>>,
    mounted: Mutex<BTreeSet<String>>,
}

impl MemoryMounter {
    /// Creates a mounter with no volumes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a prepared volume under `device`.
    pub fn add_device(&self, device: impl Into<String>, fs: Arc<MemoryFs>) {
        if let Ok(mut devices) = self.devices.lock() {
            devices.insert(device.into(), fs);
        }
    }

    /// The volume behind `device`, if it exists.
    pub fn volume(&self, device: &str) -> Option<Arc<MemoryFs>> {
        self.devices.lock().ok()?.get(device).cloned()
    }

    /// True while `device` is mounted.
    pub fn is_mounted(&self, device: &str) -> bool {
        self.mounted
            .lock()
            .map(|m| m.contains(device))
            .unwrap_or(false)
    }
}

impl Mounter for MemoryMounter {
    fn mount(&self, fstype: &str, device: &str) -> Result<Arc<dyn MdsFilesystem>, MdsError> {
        if device.is_empty() {
            return Err(MdsError::InvalidArgument("empty device".to_string()));
        }
        let mut mounted = self.mounted.lock().map_err(|_| MdsError::poisoned("mounts"))?;
        if mounted.contains(device) {
            return Err(MdsError::InvalidArgument(format!(
                "{} is already mounted",
                device
            )));
        }
        let fs = self
            .devices
            .lock()
            .map_err(|_| MdsError::poisoned("devices"))?
            .entry(device.to_string())
            .or_insert_with(|| Arc::new(MemoryFs::new(device)))
            .clone();
        fs.set_mounted_as(fstype)?;
        mounted.insert(device.to_string());
        debug!(fstype, device, "mounted");
        Ok(fs)
    }

    fn unmount(&self, fs: Arc<dyn MdsFilesystem>) -> Result<(), MdsError> {
        let device = fs.device();
        let removed = self
            .mounted
            .lock()
            .map_err(|_| MdsError::poisoned("mounts"))?
            .remove(&device);
        if !removed {
            return Err(MdsError::InvalidArgument(format!(
                "{} is not mounted",
                device
            )));
        }
        debug!(device = %device, "unmounted");
        Ok(())
    }
}
