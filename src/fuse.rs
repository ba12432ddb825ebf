// SPDX-License-Identifier: BSD-3-Clause

//! Binding of [`LazyFs`] to the kernel. Lookups, listings and path-based attribute queries are
//! answered on the session thread. Requests on an open file run elsewhere: on the worker pool
//! once the file has been fetched, on a thread of their own while they may still wait for a
//! transfer. A stalled fetch thus only holds up requests on that one open file.

use crate::error::Error;
use crate::filesystem::{LazyFs, OpenOptions, SetattrValid};
use fuser::{
    consts, FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use futures::executor::ThreadPool;
use log::{debug, error, info};
use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const FS_NAME: &str = "lazyfs";

/// Options passed to the kernel at mount time.
#[derive(Debug, Clone, Default)]
pub struct MountConfig {
    /// Let users other than the mounter access the files. Needs `user_allow_other` in
    /// `/etc/fuse.conf` for unprivileged mounts.
    pub allow_other: bool,
}

struct FuseAdapter {
    fs: Arc<LazyFs>,
    // `None` runs every request on the session thread.
    pool: Option<ThreadPool>,
}

impl FuseAdapter {
    fn new(fs: LazyFs) -> io::Result<Self> {
        let pool = match fs.config().thread_pool_size {
            0 => None,
            size => Some(
                ThreadPool::builder()
                    .pool_size(size)
                    .name_prefix("lazyfs-worker-")
                    .create()?,
            ),
        };
        Ok(FuseAdapter {
            fs: Arc::new(fs),
            pool,
        })
    }

    fn dispatch<F>(&self, ino: u64, fh: u64, op: F)
    where
        F: FnOnce(&LazyFs) + Send + 'static,
    {
        let fs = self.fs.clone();
        let Some(pool) = &self.pool else {
            return op(&fs);
        };

        if fs.is_fetched(ino, fh) {
            pool.spawn_ok(async move { op(&fs) });
            return;
        }
        let spawned = thread::Builder::new()
            .name(format!("lazyfs-fetch-{ino}"))
            .spawn(move || op(&fs));
        if let Err(e) = spawned {
            // Dropping the unanswered reply fails the request with EIO.
            error!("cannot start a request thread for inode {ino}: {e}");
        }
    }
}

fn errno(op: &str, err: Error) -> libc::c_int {
    debug!("{op}: {err}");
    err.errno()
}

fn system_time(sec: i64, nsec: i64) -> SystemTime {
    let nsec = nsec.clamp(0, 999_999_999) as u32;
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec)
    } else {
        UNIX_EPOCH - Duration::from_secs(sec.unsigned_abs()) + Duration::from_nanos(nsec.into())
    }
}

fn file_attr(st: &libc::stat64) -> FileAttr {
    let kind = match st.st_mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        _ => FileType::RegularFile,
    };
    FileAttr {
        ino: st.st_ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: system_time(st.st_atime as i64, st.st_atime_nsec as i64),
        mtime: system_time(st.st_mtime as i64, st.st_mtime_nsec as i64),
        ctime: system_time(st.st_ctime as i64, st.st_ctime_nsec as i64),
        crtime: UNIX_EPOCH,
        kind,
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

fn open_flags(opts: OpenOptions) -> u32 {
    let mut flags = 0;
    if opts.contains(OpenOptions::DIRECT_IO) {
        flags |= consts::FOPEN_DIRECT_IO;
    }
    if opts.contains(OpenOptions::KEEP_CACHE) {
        flags |= consts::FOPEN_KEEP_CACHE;
    }
    flags
}

/// Translates the optional fields of a setattr request into the `stat64` + bitmask form.
fn setattr_request(
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    size: Option<u64>,
    atime: Option<TimeOrNow>,
    mtime: Option<TimeOrNow>,
) -> (libc::stat64, SetattrValid) {
    // SAFETY: all-zero byte-pattern is a valid `libc::stat64`
    let mut attr: libc::stat64 = unsafe { std::mem::zeroed() };
    let mut valid = SetattrValid::empty();

    if let Some(mode) = mode {
        attr.st_mode = mode;
        valid |= SetattrValid::MODE;
    }
    if let Some(uid) = uid {
        attr.st_uid = uid;
        valid |= SetattrValid::UID;
    }
    if let Some(gid) = gid {
        attr.st_gid = gid;
        valid |= SetattrValid::GID;
    }
    if let Some(size) = size {
        attr.st_size = size as libc::off64_t;
        valid |= SetattrValid::SIZE;
    }

    let since_epoch = |t: SystemTime| t.duration_since(UNIX_EPOCH).unwrap_or_default();
    match atime {
        Some(TimeOrNow::Now) => valid |= SetattrValid::ATIME | SetattrValid::ATIME_NOW,
        Some(TimeOrNow::SpecificTime(t)) => {
            let d = since_epoch(t);
            attr.st_atime = d.as_secs() as _;
            attr.st_atime_nsec = d.subsec_nanos() as _;
            valid |= SetattrValid::ATIME;
        }
        None => {}
    }
    match mtime {
        Some(TimeOrNow::Now) => valid |= SetattrValid::MTIME | SetattrValid::MTIME_NOW,
        Some(TimeOrNow::SpecificTime(t)) => {
            let d = since_epoch(t);
            attr.st_mtime = d.as_secs() as _;
            attr.st_mtime_nsec = d.subsec_nanos() as _;
            valid |= SetattrValid::MTIME;
        }
        None => {}
    }

    (attr, valid)
}

impl Filesystem for FuseAdapter {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        info!(
            "serving {} files, {} workers",
            self.fs.registry().len(),
            self.fs.config().thread_pool_size
        );
        Ok(())
    }

    fn destroy(&mut self) {
        self.fs.destroy();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_string_lossy();
        match self.fs.lookup(parent, &name) {
            Ok(entry) => reply.entry(&entry.entry_timeout, &file_attr(&entry.attr), 0),
            Err(e) => reply.error(errno("lookup", e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let answer = move |fs: &LazyFs| match fs.getattr(ino, fh) {
            Ok((st, timeout)) => reply.attr(&timeout, &file_attr(&st)),
            Err(e) => reply.error(errno("getattr", e)),
        };
        // Only a handle makes this wait on the file's lock.
        match fh {
            Some(fh) => self.dispatch(ino, fh, answer),
            None => answer(&self.fs),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let (attr, valid) = setattr_request(mode, uid, gid, size, atime, mtime);
        let Some(fh) = fh.or_else(|| self.fs.any_open(ino)) else {
            return match self.fs.setattr(ino, attr, None, valid) {
                Ok((st, timeout)) => reply.attr(&timeout, &file_attr(&st)),
                Err(e) => reply.error(errno("setattr", e)),
            };
        };
        self.dispatch(ino, fh, move |fs| match fs.setattr(ino, attr, Some(fh), valid) {
            Ok((st, timeout)) => reply.attr(&timeout, &file_attr(&st)),
            Err(e) => reply.error(errno("setattr", e)),
        });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.fs.opendir(ino) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(errno("opendir", e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.fs.readdir(ino, offset.max(0) as u64) {
            Ok(entries) => entries,
            Err(e) => return reply.error(errno("readdir", e)),
        };
        for entry in entries {
            let kind = if entry.type_ == u32::from(libc::DT_DIR) {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            if reply.add(entry.ino, entry.offset as i64, kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.fs.open(ino, flags as u32) {
            Ok((fh, opts)) => reply.opened(fh, open_flags(opts)),
            Err(e) => reply.error(errno("open", e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        self.dispatch(ino, fh, move |fs| match fs.read(ino, fh, size, offset as u64) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", e)),
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        let data = data.to_vec();
        self.dispatch(ino, fh, move |fs| match fs.write(ino, fh, &data, offset as u64) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(errno("write", e)),
        });
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        self.dispatch(ino, fh, move |fs| match fs.flush(ino, fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("flush", e)),
        });
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        self.dispatch(ino, fh, move |fs| match fs.fsync(ino, datasync, fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("fsync", e)),
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.dispatch(ino, fh, move |fs| match fs.release(ino, fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("release", e)),
        });
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        if offset < 0 || length <= 0 {
            return reply.error(libc::EINVAL);
        }
        self.dispatch(ino, fh, move |fs| {
            match fs.fallocate(ino, fh, mode as u32, offset as u64, length as u64) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(errno("fallocate", e)),
            }
        });
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        reply.error(self.fs.unsupported("create").errno());
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(self.fs.unsupported("mknod").errno());
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(self.fs.unsupported("mkdir").errno());
    }

    fn unlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(self.fs.unsupported("unlink").errno());
    }

    fn rmdir(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(self.fs.unsupported("rmdir").errno());
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(self.fs.unsupported("rename").errno());
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(self.fs.unsupported("link").errno());
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _link_name: &OsStr,
        _target: &Path,
        reply: ReplyEntry,
    ) {
        reply.error(self.fs.unsupported("symlink").errno());
    }
}

/// Mounts `fs` on `mountpoint` and serves requests until it is unmounted.
pub fn mount(fs: LazyFs, mountpoint: &Path, cfg: &MountConfig) -> io::Result<()> {
    let adapter = FuseAdapter::new(fs)?;

    let mut options = vec![
        MountOption::FSName(FS_NAME.to_string()),
        MountOption::Subtype(FS_NAME.to_string()),
        MountOption::DefaultPermissions,
        MountOption::NoDev,
        MountOption::NoSuid,
    ];
    if cfg.allow_other {
        options.push(MountOption::AllowOther);
        options.push(MountOption::AutoUnmount);
    }

    info!("mounting on {}", mountpoint.display());
    fuser::mount2(adapter, mountpoint, &options)?;
    info!("{} unmounted", mountpoint.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::ROOT_ID;
    use crate::images::proto::{FdTypes, FdinfoEntry, FownEntry, RegFileEntry};
    use crate::registry::local_name;
    use crate::{Config, Fetcher, FileRegistry};
    use std::path::PathBuf;
    use std::sync::mpsc;
    use std::time::Instant;

    /// An origin where one file takes far longer to arrive than the rest.
    struct SlowOrigin {
        slow: PathBuf,
    }

    impl Fetcher for SlowOrigin {
        fn fetch(&self, remote_path: &Path, _mode: u32) -> io::Result<()> {
            if remote_path == self.slow {
                thread::sleep(Duration::from_secs(3));
            }
            std::fs::write(remote_path, b"contents")
        }
    }

    fn adapter(paths: &[&Path], slow: &Path, cfg: Config) -> FuseAdapter {
        let fdinfos = (0..paths.len() as u32).map(|id| FdinfoEntry {
            id,
            flags: 0,
            r#type: FdTypes::Reg as i32,
            fd: id + 3,
            xattr_security_selinux: None,
        });
        let regfiles = paths.iter().zip(0..).map(|(path, id)| RegFileEntry {
            id,
            flags: libc::O_RDWR as u32,
            pos: 0,
            fown: FownEntry::default(),
            name: path.display().to_string(),
            mnt_id: None,
            size: Some(8),
            ext: None,
            mode: Some(0o100644),
        });
        let registry = FileRegistry::build(fdinfos, regfiles);
        let origin = SlowOrigin {
            slow: slow.to_path_buf(),
        };
        FuseAdapter::new(LazyFs::new(Arc::new(registry), Arc::new(origin), cfg)).unwrap()
    }

    #[test]
    fn stalled_fetch_does_not_hold_up_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let slow = dir.path().join("slow");
        let fast = dir.path().join("fast");
        let cfg = Config {
            thread_pool_size: 1,
            ..Default::default()
        };
        let adapter = adapter(&[&slow, &fast], &slow, cfg);
        let fs = adapter.fs.clone();
        let inode = |path: &Path| {
            let name = local_name(&path.display().to_string());
            fs.lookup(ROOT_ID, &name).unwrap().inode
        };
        let (slow_ino, fast_ino) = (inode(&slow), inode(&fast));

        let (fast_fh, _) = fs.open(fast_ino, 0).unwrap();
        fs.read(fast_ino, fast_fh, 1, 0).unwrap();

        // More waiting requests than there are workers.
        for _ in 0..4 {
            let (fh, _) = fs.open(slow_ino, 0).unwrap();
            adapter.dispatch(slow_ino, fh, move |fs| {
                let _ = fs.read(slow_ino, fh, 1, 0);
            });
        }

        let start = Instant::now();
        let (tx, rx) = mpsc::channel();
        adapter.dispatch(fast_ino, fast_fh, move |fs| {
            tx.send(fs.read(fast_ino, fast_fh, 64, 0).unwrap()).unwrap();
        });
        let data = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(data, b"contents");

        // Path-based queries never touch a file lock.
        assert_eq!(fs.getattr(slow_ino, None).unwrap().0.st_size, 8);
        assert_eq!(fs.any_open(fast_ino), Some(fast_fh));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn converts_attributes() {
        // SAFETY: all-zero byte-pattern is a valid `libc::stat64`
        let mut st: libc::stat64 = unsafe { std::mem::zeroed() };
        st.st_ino = 7;
        st.st_mode = libc::S_IFREG | 0o640;
        st.st_size = 12345;
        st.st_blocks = 32;
        st.st_nlink = 1;
        st.st_mtime = 1_000_000;
        st.st_mtime_nsec = 500;

        let attr = file_attr(&st);
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o640);
        assert_eq!(attr.size, 12345);
        assert_eq!(attr.blocks, 32);
        assert_eq!(
            attr.mtime,
            UNIX_EPOCH + Duration::from_secs(1_000_000) + Duration::from_nanos(500)
        );

        st.st_mode = libc::S_IFDIR | 0o755;
        assert_eq!(file_attr(&st).kind, FileType::Directory);
    }

    #[test]
    fn pre_epoch_times_do_not_panic() {
        assert_eq!(system_time(-2, 0), UNIX_EPOCH - Duration::from_secs(2));
    }

    #[test]
    fn translates_setattr_requests() {
        let (_, valid) = setattr_request(None, None, None, None, None, None);
        assert!(valid.is_empty());

        let t = UNIX_EPOCH + Duration::new(42, 7);
        let (attr, valid) = setattr_request(
            Some(0o600),
            None,
            Some(100),
            Some(5),
            Some(TimeOrNow::Now),
            Some(TimeOrNow::SpecificTime(t)),
        );
        assert_eq!(
            valid,
            SetattrValid::MODE
                | SetattrValid::GID
                | SetattrValid::SIZE
                | SetattrValid::ATIME
                | SetattrValid::ATIME_NOW
                | SetattrValid::MTIME
        );
        assert_eq!(attr.st_mode, 0o600);
        assert_eq!(attr.st_gid, 100);
        assert_eq!(attr.st_size, 5);
        assert_eq!(attr.st_mtime, 42);
        assert_eq!(attr.st_mtime_nsec, 7);
    }

    #[test]
    fn maps_open_options() {
        assert_eq!(open_flags(OpenOptions::empty()), 0);
        assert_eq!(open_flags(OpenOptions::DIRECT_IO), consts::FOPEN_DIRECT_IO);
        assert_eq!(
            open_flags(OpenOptions::DIRECT_IO | OpenOptions::KEEP_CACHE),
            consts::FOPEN_DIRECT_IO | consts::FOPEN_KEEP_CACHE
        );
    }
}
