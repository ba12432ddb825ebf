// SPDX-License-Identifier: BSD-3-Clause

use super::fetch::Fetcher;
use crate::error::{Error, Result};
use crate::oslib;
use crate::registry::RegistryEntry;
use crate::util::ebadf;
use log::{debug, error, info};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

enum FileState {
    /// Only checkpoint metadata exists, nothing has been fetched.
    Placeholder,
    /// The local copy, opened the way the checkpointed process had it open.
    Cached(File),
}

/// One open instance of an exposed file.
///
/// The first `read` or `write` fetches the file from the origin host and opens the local copy;
/// every later operation is delegated to that copy. Until then metadata operations succeed
/// without effect, so a chmod, chown, truncate or allocate issued before the first read or
/// write is dropped.
///
/// All operations, the fetch included, run under one lock. Two callers racing on a fresh
/// instance therefore trigger a single fetch, and a failed fetch leaves the instance in
/// `Placeholder` so the next call tries again.
pub struct LazyFile {
    entry: Arc<RegistryEntry>,
    fetcher: Arc<dyn Fetcher>,
    // `None` once released.
    state: Mutex<Option<FileState>>,
    // Mirrors `Cached` in `state`, readable without waiting for a running operation.
    cached: AtomicBool,
}

impl LazyFile {
    pub fn new(entry: Arc<RegistryEntry>, fetcher: Arc<dyn Fetcher>) -> Self {
        LazyFile {
            entry,
            fetcher,
            state: Mutex::new(Some(FileState::Placeholder)),
            cached: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        self.entry.local_name()
    }

    pub fn entry(&self) -> &RegistryEntry {
        &self.entry
    }

    /// Whether the local copy is open. Never blocks.
    pub fn is_cached(&self) -> bool {
        self.cached.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().unwrap().is_none()
    }

    fn materialize(&self) -> Result<File> {
        let path = self.entry.remote_path();
        self.fetcher
            .fetch(path, self.entry.mode())
            .map_err(|source| {
                error!("{}: fetch failed: {}", self, source);
                Error::FetchFailed {
                    path: path.to_path_buf(),
                    source,
                }
            })?;

        open_fetched(path, self.entry.flags(), self.entry.mode()).map_err(|source| {
            Error::OpenFailed {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    /// Runs `op` against the local copy, fetching it first if this is the first data access.
    fn with_fetched<T>(&self, op: impl FnOnce(&File) -> io::Result<T>) -> Result<T> {
        let mut guard = self.state.lock().unwrap();
        let state = guard.as_mut().ok_or_else(ebadf)?;

        match state {
            FileState::Cached(file) => Ok(op(file)?),
            FileState::Placeholder => {
                let file = self.materialize()?;
                let res = op(&file);
                *state = FileState::Cached(file);
                self.cached.store(true, Ordering::Release);
                info!("{}", self);
                Ok(res?)
            }
        }
    }

    /// Runs `op` against the local copy if there is one. Returns `None` for a placeholder.
    fn with_cached<T>(
        &self,
        what: &str,
        op: impl FnOnce(&File) -> io::Result<T>,
    ) -> Result<Option<T>> {
        let guard = self.state.lock().unwrap();

        match guard.as_ref().ok_or_else(ebadf)? {
            FileState::Cached(file) => Ok(Some(op(file)?)),
            FileState::Placeholder => {
                debug!("{what}: {} is not fetched, nothing to do", self.name());
                Ok(None)
            }
        }
    }

    /// Reads up to `size` bytes at `offset`; fewer only at end of file.
    pub fn read(&self, size: usize, offset: u64) -> Result<Vec<u8>> {
        self.with_fetched(|file| read_full_at(file, size, offset))
    }

    pub fn write(&self, data: &[u8], offset: u64) -> Result<usize> {
        self.with_fetched(|file| file.write_at(data, offset))
    }

    pub fn flush(&self) -> Result<()> {
        self.with_cached("flush", oslib::flush_by_dup)?;
        Ok(())
    }

    pub fn fsync(&self, datasync: bool) -> Result<()> {
        self.with_cached("fsync", |file| oslib::fsync(file, datasync))?;
        Ok(())
    }

    pub fn truncate(&self, size: u64) -> Result<()> {
        self.with_cached("truncate", |file| file.set_len(size))?;
        Ok(())
    }

    /// Attributes of the local copy, `None` while there is none.
    pub fn getattr(&self) -> Result<Option<libc::stat64>> {
        self.with_cached("getattr", oslib::fstat)
    }

    pub fn chmod(&self, mode: u32) -> Result<()> {
        self.with_cached("chmod", |file| oslib::fchmod(file, mode))?;
        Ok(())
    }

    pub fn chown(&self, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.with_cached("chown", |file| oslib::fchown(file, uid, gid))?;
        Ok(())
    }

    /// `times` holds access and modification time in `futimens(2)` form.
    pub fn utimens(&self, times: &[libc::timespec; 2]) -> Result<()> {
        self.with_cached("utimens", |file| oslib::futimens(file, times))?;
        Ok(())
    }

    pub fn fallocate(&self, mode: i32, offset: u64, length: u64) -> Result<()> {
        self.with_cached("fallocate", |file| {
            oslib::fallocate(file, mode, offset, length)
        })?;
        Ok(())
    }

    /// Closes the local copy. Calling it again does nothing.
    pub fn release(&self) {
        let state = self.state.lock().unwrap().take();
        self.cached.store(false, Ordering::Release);
        match state {
            // Dropping the file closes it.
            Some(FileState::Cached(_file)) => debug!("release: closed {}", self.name()),
            Some(FileState::Placeholder) => debug!("release: {} was never fetched", self.name()),
            None => {}
        }
    }
}

impl fmt::Display for LazyFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = if self.is_cached() {
            "CACHED"
        } else {
            "PLACEHOLDER"
        };
        write!(
            f,
            "{tag}: ({}) -> {}",
            self.name(),
            self.entry.remote_path().display()
        )
    }
}

/// Opens the fetched copy with the access mode and flags recorded at checkpoint time. Flags
/// that only make sense at creation are dropped, as is `O_APPEND`: the kernel hands us the
/// offset of every write.
fn open_fetched(path: &Path, flags: u32, mode: u32) -> io::Result<File> {
    let flags = flags as libc::c_int;
    let (read, write) = match flags & libc::O_ACCMODE {
        libc::O_WRONLY => (false, true),
        libc::O_RDWR => (true, true),
        _ => (true, false),
    };
    let dropped = libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC | libc::O_APPEND;

    OpenOptions::new()
        .read(read)
        .write(write)
        .mode(mode & 0o7777)
        .custom_flags((flags & !dropped) | libc::O_CLOEXEC)
        .open(path)
}

fn read_full_at(file: &File, size: usize, offset: u64) -> io::Result<Vec<u8>> {
    let mut buf = vec![0; size];
    let mut done = 0;
    while done < size {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    buf.truncate(done);
    Ok(buf)
}
