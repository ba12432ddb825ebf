// SPDX-License-Identifier: BSD-3-Clause

use std::ffi::CString;
use std::io::{Error, Result};
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

// A helper function that check the return value of a C function call
// and wraps it in a `Result` type, returning the `errno` code as `Err`.
fn check_retval<T: From<i8> + PartialEq>(t: T) -> Result<T> {
    if t == T::from(-1_i8) {
        Err(Error::last_os_error())
    } else {
        Ok(t)
    }
}

/// Safe wrapper for `fchmod(2)`
///
/// # Errors
///
/// Will return `Err(errno)` if `fchmod(2)` fails.
/// Each filesystem type may have its own special errors, see `fchmod(2)` for details.
pub fn fchmod(fd: &impl AsRawFd, mode: libc::mode_t) -> Result<()> {
    // SAFETY: this doesn't modify any memory and we check the return value.
    check_retval(unsafe { libc::fchmod(fd.as_raw_fd(), mode) })?;
    Ok(())
}

/// Safe wrapper for `fchown(2)`. `None` leaves the respective id unchanged.
///
/// # Errors
///
/// Will return `Err(errno)` if `fchown(2)` fails, see `fchown(2)` for details.
pub fn fchown(fd: &impl AsRawFd, uid: Option<libc::uid_t>, gid: Option<libc::gid_t>) -> Result<()> {
    // Cannot use -1 here because these are unsigned values.
    let uid = uid.unwrap_or(u32::MAX);
    let gid = gid.unwrap_or(u32::MAX);

    // SAFETY: this doesn't modify any memory and we check the return value.
    check_retval(unsafe { libc::fchown(fd.as_raw_fd(), uid, gid) })?;
    Ok(())
}

/// Safe wrapper for `fstat64(2)`
///
/// # Errors
///
/// Will return `Err(errno)` if `fstat64(2)` fails.
pub fn fstat(fd: &impl AsRawFd) -> Result<libc::stat64> {
    let mut st = MaybeUninit::<libc::stat64>::zeroed();

    // SAFETY: the kernel will only write data in `st` and we check the return value.
    check_retval(unsafe { libc::fstat64(fd.as_raw_fd(), st.as_mut_ptr()) })?;

    // SAFETY: `fstat64` succeeded, so `st` has been initialized.
    Ok(unsafe { st.assume_init() })
}

/// Safe wrapper for `stat64(2)`
///
/// # Errors
///
/// Will return `Err(errno)` if `stat64(2)` fails, or `EINVAL` if `path` contains a nul byte.
pub fn stat(path: &Path) -> Result<libc::stat64> {
    let path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::from_raw_os_error(libc::EINVAL))?;
    let mut st = MaybeUninit::<libc::stat64>::zeroed();

    // SAFETY: `path` is nul-terminated, the kernel will only write data in `st` and we check
    // the return value.
    check_retval(unsafe { libc::stat64(path.as_ptr(), st.as_mut_ptr()) })?;

    // SAFETY: `stat64` succeeded, so `st` has been initialized.
    Ok(unsafe { st.assume_init() })
}

/// Safe wrapper for `fsync(2)` and `fdatasync(2)`
///
/// # Errors
///
/// Will return `Err(errno)` if the sync fails, see `fsync(2)` for details.
pub fn fsync(fd: &impl AsRawFd, datasync: bool) -> Result<()> {
    // SAFETY: this doesn't modify any memory and we check the return value.
    check_retval(unsafe {
        if datasync {
            libc::fdatasync(fd.as_raw_fd())
        } else {
            libc::fsync(fd.as_raw_fd())
        }
    })?;
    Ok(())
}

/// Emulates `close(2)` on a file that must stay open: the fd is duplicated and the duplicate is
/// closed, so the underlying file system sees a flush without us losing the descriptor.
///
/// # Errors
///
/// Will return `Err(errno)` if either `dup(2)` or `close(2)` fails.
pub fn flush_by_dup(fd: &impl AsRawFd) -> Result<()> {
    // SAFETY: this doesn't modify any memory and we check the return values.
    let newfd = check_retval(unsafe { libc::dup(fd.as_raw_fd()) })?;
    check_retval(unsafe { libc::close(newfd) })?;
    Ok(())
}

/// Safe wrapper for `fallocate64(2)`
///
/// # Errors
///
/// Will return `Err(errno)` if `fallocate64(2)` fails, see `fallocate(2)` for details.
pub fn fallocate(fd: &impl AsRawFd, mode: libc::c_int, offset: u64, length: u64) -> Result<()> {
    // SAFETY: this doesn't modify any memory and we check the return value.
    check_retval(unsafe {
        libc::fallocate64(
            fd.as_raw_fd(),
            mode,
            offset as libc::off64_t,
            length as libc::off64_t,
        )
    })?;
    Ok(())
}

/// Safe wrapper for `futimens(2)`. `times[0]` is the access time and `times[1]` the modification
/// time; either may carry `UTIME_OMIT` or `UTIME_NOW` in `tv_nsec`.
///
/// # Errors
///
/// Will return `Err(errno)` if `futimens(2)` fails.
pub fn futimens(fd: &impl AsRawFd, times: &[libc::timespec; 2]) -> Result<()> {
    // SAFETY: `times` points to two valid `timespec` values and we check the return value.
    check_retval(unsafe { libc::futimens(fd.as_raw_fd(), times.as_ptr()) })?;
    Ok(())
}

/// Safe wrapper for `getuid(2)` and `getgid(2)`, these never fail.
pub fn current_ids() -> (libc::uid_t, libc::gid_t) {
    // SAFETY: neither call touches memory nor can fail.
    unsafe { (libc::getuid(), libc::getgid()) }
}
