// SPDX-License-Identifier: BSD-3-Clause

//! The file system the kernel talks to: a single flat directory holding one entry per exposed
//! file. Directory structure and attributes come from the registry; every open hands out a fresh
//! [`LazyFile`] which does the real work.

use crate::error::{Error, Result};
use crate::lazy::{Fetcher, LazyFile};
use crate::oslib;
use crate::registry::{FileRegistry, RegistryEntry};
use crate::util::ebadf;
use bitflags::bitflags;
use log::debug;
use std::collections::{btree_map, BTreeMap};
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub type Inode = u64;
pub type Handle = u64;

/// Inode of the mount's root directory.
pub const ROOT_ID: Inode = 1;

// Registry entries get consecutive inodes in listing order, starting here.
const FIRST_FILE_ID: Inode = ROOT_ID + 1;

const ROOT_MODE: u32 = libc::S_IFDIR | 0o755;

bitflags! {
    /// Options controlling the behavior of files opened by the server in response to an open or
    /// create request.
    pub struct OpenOptions: u32 {
        const DIRECT_IO = 1;
        const KEEP_CACHE = 2;
    }
}

bitflags! {
    /// The attributes a `setattr` request asks to change. Values follow the protocol's `FATTR_*`.
    pub struct SetattrValid: u32 {
        const MODE = 1;
        const UID = 2;
        const GID = 4;
        const SIZE = 8;
        const ATIME = 16;
        const MTIME = 32;
        const ATIME_NOW = 128;
        const MTIME_NOW = 256;
    }
}

/// The caching policy that the file system should report to the FUSE client. By default the FUSE
/// protocol uses close-to-open consistency. This means that any cached contents of the file are
/// invalidated the next time that file is opened.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// The client should never cache file data and all I/O should be directly forwarded to the
    /// server.
    Never,

    /// The client is free to choose when and how to cache file data. This is the default policy and
    /// uses close-to-open consistency as described in the enum documentation.
    #[default]
    Auto,

    /// The client should always cache file data. Only safe while nothing but this mount touches
    /// the fetched copies.
    Always,
}

impl FromStr for CachePolicy {
    type Err = &'static str;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match &s.to_lowercase()[..] {
            "never" => Ok(CachePolicy::Never),
            "auto" => Ok(CachePolicy::Auto),
            "always" => Ok(CachePolicy::Always),
            _ => Err("invalid cache policy"),
        }
    }
}

/// Options that configure the behavior of the file system.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long the FUSE client should consider directory entries to be valid.
    ///
    /// The default value for this option is 5 seconds.
    pub entry_timeout: Duration,

    /// How long the FUSE client should consider file and directory attributes to be valid. Before
    /// a file is fetched its attributes are the ones recorded at checkpoint time.
    ///
    /// The default value for this option is 5 seconds.
    pub attr_timeout: Duration,

    /// The caching policy the file system should use. See the documentation of `CachePolicy` for
    /// more details.
    pub cache_policy: CachePolicy,

    /// Number of worker threads serving requests on fetched files. Requests that may still wait
    /// for a fetch get a thread each instead, so they never occupy the pool. With 0 every request
    /// is served on the session thread, and one slow fetch stalls the whole mount.
    ///
    /// The default value for this option is 4.
    pub thread_pool_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            entry_timeout: Duration::from_secs(5),
            attr_timeout: Duration::from_secs(5),
            cache_policy: Default::default(),
            thread_pool_size: 4,
        }
    }
}

/// The reply to a lookup.
#[derive(Clone, Copy)]
pub struct Entry {
    pub inode: Inode,
    pub attr: libc::stat64,
    pub attr_timeout: Duration,
    pub entry_timeout: Duration,
}

/// One directory entry. `offset` is the position of the entry that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: Inode,
    pub offset: u64,
    pub type_: u32,
    pub name: String,
}

struct HandleData {
    inode: Inode,
    file: Arc<LazyFile>,
}

pub struct LazyFs {
    registry: Arc<FileRegistry>,
    fetcher: Arc<dyn Fetcher>,

    // Open files. Each handle owns its own `LazyFile`, two opens of one name share nothing.
    handles: RwLock<BTreeMap<Handle, Arc<HandleData>>>,
    next_handle: AtomicU64,

    // Owner reported for every entry that has no local copy.
    uid: libc::uid_t,
    gid: libc::gid_t,

    cfg: Config,
}

impl LazyFs {
    pub fn new(registry: Arc<FileRegistry>, fetcher: Arc<dyn Fetcher>, cfg: Config) -> Self {
        let (uid, gid) = oslib::current_ids();
        LazyFs {
            registry,
            fetcher,
            handles: RwLock::new(BTreeMap::new()),
            next_handle: AtomicU64::new(1),
            uid,
            gid,
            cfg,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn registry(&self) -> &FileRegistry {
        &self.registry
    }

    fn entry_for(&self, inode: Inode) -> Result<&Arc<RegistryEntry>> {
        inode
            .checked_sub(FIRST_FILE_ID)
            .and_then(|index| self.registry.get_index(index as usize))
            .ok_or_else(|| Error::NotFound(format!("inode {inode}")))
    }

    fn inode_for(&self, name: &str) -> Result<Inode> {
        self.registry
            .index_of(name)
            .map(|index| index as Inode + FIRST_FILE_ID)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    fn blank_stat(&self, inode: Inode, mode: u32) -> libc::stat64 {
        // SAFETY: all-zero byte-pattern is a valid `libc::stat64`
        let mut st: libc::stat64 = unsafe { std::mem::zeroed() };
        st.st_ino = inode;
        st.st_mode = mode;
        st.st_uid = self.uid;
        st.st_gid = self.gid;
        st.st_blksize = 4096;
        st
    }

    fn root_stat(&self) -> libc::stat64 {
        let mut st = self.blank_stat(ROOT_ID, ROOT_MODE);
        st.st_nlink = 2;
        st
    }

    /// Attributes recorded at checkpoint time. The size is the one the process saw, whether or
    /// not the file has been fetched.
    fn recorded_stat(&self, inode: Inode, entry: &RegistryEntry) -> libc::stat64 {
        let mut st = self.blank_stat(inode, entry.mode());
        st.st_nlink = 1;
        st.st_size = entry.size() as libc::off64_t;
        st.st_blocks = entry.size().div_ceil(512) as libc::blkcnt64_t;
        st
    }

    /// Attributes of the local copy while some open instance of `inode` has fetched it. The
    /// copy lives at the remote path, so this never waits for an operation on that instance.
    fn live_stat(&self, inode: Inode, entry: &RegistryEntry) -> Option<libc::stat64> {
        let fetched = self
            .handles
            .read()
            .unwrap()
            .values()
            .any(|hd| hd.inode == inode && hd.file.is_cached());
        if !fetched {
            return None;
        }
        match oslib::stat(entry.remote_path()) {
            Ok(mut st) => {
                st.st_ino = inode;
                Some(st)
            }
            Err(e) => {
                debug!("{}: local copy vanished: {e}", entry.local_name());
                None
            }
        }
    }

    fn current_stat(&self, inode: Inode, entry: &RegistryEntry) -> libc::stat64 {
        self.live_stat(inode, entry)
            .unwrap_or_else(|| self.recorded_stat(inode, entry))
    }

    /// Attributes of `name` relative to the root. The empty name is the root itself. A file is
    /// described by its checkpoint record until an open instance fetches it.
    pub fn attributes(&self, name: &str) -> Result<libc::stat64> {
        if name.is_empty() {
            return Ok(self.root_stat());
        }
        let inode = self.inode_for(name)?;
        Ok(self.current_stat(inode, self.entry_for(inode)?))
    }

    /// Lists the directory at `path`. Only the root (the empty path) exists.
    pub fn list_root(&self, path: &str) -> Result<Vec<DirEntry>> {
        if !path.is_empty() {
            return Err(Error::NotFound(path.to_string()));
        }
        Ok(self
            .registry
            .iter()
            .enumerate()
            .map(|(index, entry)| DirEntry {
                ino: index as Inode + FIRST_FILE_ID,
                offset: index as u64 + 1,
                type_: libc::DT_REG as u32,
                name: entry.local_name().to_string(),
            })
            .collect())
    }

    /// A fresh, unfetched instance of `name`.
    pub fn open_file(&self, name: &str) -> Result<LazyFile> {
        let entry = self
            .registry
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        Ok(LazyFile::new(entry.clone(), self.fetcher.clone()))
    }

    fn find_handle(&self, handle: Handle, inode: Inode) -> Result<Arc<LazyFile>> {
        self.handles
            .read()
            .unwrap()
            .get(&handle)
            .filter(|hd| hd.inode == inode)
            .map(|hd| hd.file.clone())
            .ok_or_else(|| ebadf().into())
    }

    pub fn lookup(&self, parent: Inode, name: &str) -> Result<Entry> {
        if parent != ROOT_ID {
            return Err(Error::NotFound(name.to_string()));
        }
        let inode = self.inode_for(name)?;
        Ok(Entry {
            inode,
            attr: self.current_stat(inode, self.entry_for(inode)?),
            attr_timeout: self.cfg.attr_timeout,
            entry_timeout: self.cfg.entry_timeout,
        })
    }

    /// Attributes of `inode`. They are those of the local copy once the file behind `handle`,
    /// or without a handle any open instance, has been fetched; otherwise the recorded ones.
    pub fn getattr(&self, inode: Inode, handle: Option<Handle>) -> Result<(libc::stat64, Duration)> {
        if inode == ROOT_ID {
            return Ok((self.root_stat(), self.cfg.attr_timeout));
        }
        let entry = self.entry_for(inode)?;

        if let Some(handle) = handle {
            if let Some(mut st) = self.find_handle(handle, inode)?.getattr()? {
                st.st_ino = inode;
                return Ok((st, self.cfg.attr_timeout));
            }
        }
        Ok((self.current_stat(inode, entry), self.cfg.attr_timeout))
    }

    /// A handle open on `inode`, preferring one whose file has been fetched.
    pub fn any_open(&self, inode: Inode) -> Option<Handle> {
        let handles = self.handles.read().unwrap();
        let mut found = None;
        for (&handle, hd) in handles.iter().filter(|(_, hd)| hd.inode == inode) {
            if hd.file.is_cached() {
                return Some(handle);
            }
            found.get_or_insert(handle);
        }
        found
    }

    /// Whether the file behind `handle` has been fetched, in which case requests on it never
    /// wait for a transfer. Unknown handles fail fast and count as fetched.
    pub fn is_fetched(&self, inode: Inode, handle: Handle) -> bool {
        self.find_handle(handle, inode)
            .map_or(true, |file| file.is_cached())
    }

    pub fn opendir(&self, inode: Inode) -> Result<()> {
        match inode {
            ROOT_ID => Ok(()),
            _ => {
                self.entry_for(inode)?;
                Err(io::Error::from_raw_os_error(libc::ENOTDIR).into())
            }
        }
    }

    /// The root listing with `.` and `..`, starting after position `offset`.
    pub fn readdir(&self, inode: Inode, offset: u64) -> Result<Vec<DirEntry>> {
        self.opendir(inode)?;
        let dots = [".", ".."].map(|name| DirEntry {
            ino: ROOT_ID,
            offset: 0,
            type_: libc::DT_DIR as u32,
            name: name.to_string(),
        });
        Ok(dots
            .into_iter()
            .chain(self.list_root("")?)
            .enumerate()
            .map(|(i, entry)| DirEntry {
                offset: i as u64 + 1,
                ..entry
            })
            .skip(offset as usize)
            .collect())
    }

    pub fn open(&self, inode: Inode, flags: u32) -> Result<(Handle, OpenOptions)> {
        let entry = self.entry_for(inode)?;
        let file = self.open_file(entry.local_name())?;

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        debug!("open: {} as handle {handle}, flags {flags:#o}", file);
        let data = HandleData {
            inode,
            file: Arc::new(file),
        };
        self.handles.write().unwrap().insert(handle, Arc::new(data));

        let opts = match self.cfg.cache_policy {
            CachePolicy::Never => OpenOptions::DIRECT_IO,
            CachePolicy::Auto => OpenOptions::empty(),
            CachePolicy::Always => OpenOptions::KEEP_CACHE,
        };
        Ok((handle, opts))
    }

    pub fn release(&self, inode: Inode, handle: Handle) -> Result<()> {
        let data = {
            let mut handles = self.handles.write().unwrap();
            match handles.entry(handle) {
                btree_map::Entry::Occupied(e) if e.get().inode == inode => e.remove(),
                _ => return Err(ebadf().into()),
            }
        };
        // A worker may still hold the file; releasing it here closes the local copy anyway.
        data.file.release();
        Ok(())
    }

    pub fn read(&self, inode: Inode, handle: Handle, size: u32, offset: u64) -> Result<Vec<u8>> {
        self.find_handle(handle, inode)?.read(size as usize, offset)
    }

    pub fn write(&self, inode: Inode, handle: Handle, data: &[u8], offset: u64) -> Result<usize> {
        self.find_handle(handle, inode)?.write(data, offset)
    }

    pub fn flush(&self, inode: Inode, handle: Handle) -> Result<()> {
        self.find_handle(handle, inode)?.flush()
    }

    pub fn fsync(&self, inode: Inode, datasync: bool, handle: Handle) -> Result<()> {
        self.find_handle(handle, inode)?.fsync(datasync)
    }

    pub fn fallocate(
        &self,
        inode: Inode,
        handle: Handle,
        mode: u32,
        offset: u64,
        length: u64,
    ) -> Result<()> {
        self.find_handle(handle, inode)?
            .fallocate(mode as libc::c_int, offset, length)
    }

    /// Applies the changes selected by `valid`, taking the new values from `attr`. Without a
    /// handle they go to any open instance of `inode`; with none open the request is refused.
    pub fn setattr(
        &self,
        inode: Inode,
        attr: libc::stat64,
        handle: Option<Handle>,
        valid: SetattrValid,
    ) -> Result<(libc::stat64, Duration)> {
        if inode != ROOT_ID {
            self.entry_for(inode)?;
        }
        let Some(handle) = handle.or_else(|| self.any_open(inode)) else {
            debug!("setattr: inode {inode} is not open, refusing {valid:?}");
            return Err(self.unsupported("setattr"));
        };
        let file = self.find_handle(handle, inode)?;

        if valid.contains(SetattrValid::MODE) {
            file.chmod(attr.st_mode & 0o7777)?;
        }

        if valid.intersects(SetattrValid::UID | SetattrValid::GID) {
            let uid = valid.contains(SetattrValid::UID).then_some(attr.st_uid);
            let gid = valid.contains(SetattrValid::GID).then_some(attr.st_gid);
            file.chown(uid, gid)?;
        }

        if valid.contains(SetattrValid::SIZE) {
            file.truncate(attr.st_size as u64)?;
        }

        if valid.intersects(SetattrValid::ATIME | SetattrValid::MTIME) {
            let mut tvs = [
                libc::timespec {
                    tv_sec: 0,
                    tv_nsec: libc::UTIME_OMIT,
                },
                libc::timespec {
                    tv_sec: 0,
                    tv_nsec: libc::UTIME_OMIT,
                },
            ];

            if valid.contains(SetattrValid::ATIME_NOW) {
                tvs[0].tv_nsec = libc::UTIME_NOW;
            } else if valid.contains(SetattrValid::ATIME) {
                tvs[0].tv_sec = attr.st_atime;
                tvs[0].tv_nsec = attr.st_atime_nsec;
            }

            if valid.contains(SetattrValid::MTIME_NOW) {
                tvs[1].tv_nsec = libc::UTIME_NOW;
            } else if valid.contains(SetattrValid::MTIME) {
                tvs[1].tv_sec = attr.st_mtime;
                tvs[1].tv_nsec = attr.st_mtime_nsec;
            }

            file.utimens(&tvs)?;
        }

        self.getattr(inode, Some(handle))
    }

    /// Creating, removing and renaming entries is not offered.
    pub fn unsupported(&self, op: &'static str) -> Error {
        debug!("{op}: not supported");
        Error::Unsupported(op)
    }

    /// Closes every file still open, at unmount.
    pub fn destroy(&self) {
        let handles = std::mem::take(&mut *self.handles.write().unwrap());
        for data in handles.into_values() {
            data.file.release();
        }
    }
}
