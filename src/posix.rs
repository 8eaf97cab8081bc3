//! POSIX-shaped entry points over a process-wide router
//!
//! These mirror the C calls they replace: failures return the usual
//! sentinel (`-1`, `None` or a null pointer) and leave the reason in
//! `errno`. [`install`] must run before any of them is used; until then
//! every call fails with `ENXIO`.
//!
//! ```no_run
//! use packfs::{posix, RouterConfig, Router};
//!
//! let router = Router::with_image(RouterConfig::default(), "app.pkf")?;
//! posix::install(router)?;
//!
//! let mut st = Default::default();
//! if posix::stat("/__packfs__/lib/index.js", &mut st) == 0 {
//!     println!("{} bytes", st.size);
//! }
//! # Ok::<(), packfs::RouterError>(())
//! ```

use crate::backend::{DirEntry, DirHandle, FileStat, OpenOptions};
use crate::dirstream::{CompareFn, SelectFn};
use crate::error::{Result, RouterError};
use crate::router::Router;
use errno::{set_errno, Errno};
use libc::{c_int, c_void};
use std::io::{IoSliceMut, SeekFrom};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::OnceLock;
use tracing::warn;

static ROUTER: OnceLock<Router> = OnceLock::new();

extern "C" fn remove_shadow_at_exit() {
    if let Some(router) = ROUTER.get() {
        router.cleanup();
    }
}

/// Install `router` as the process-wide router
///
/// Registers an exit hook that removes the shadow overlay. Fails if a
/// router is already installed.
pub fn install(router: Router) -> Result<&'static Router> {
    ROUTER
        .set(router)
        .map_err(|_| RouterError::InvalidArgument("a router is already installed".to_string()))?;

    if unsafe { libc::atexit(remove_shadow_at_exit) } != 0 {
        warn!("failed to register shadow cleanup at exit");
    }
    installed()
}

/// The installed router
pub fn installed() -> Result<&'static Router> {
    ROUTER.get().ok_or(RouterError::NotInstalled)
}

/// Record `err` in `errno` and hand back the sentinel
fn fail<T>(err: RouterError, sentinel: T) -> T {
    set_errno(Errno(err.errno()));
    sentinel
}

fn status(result: Result<()>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(err) => fail(err, -1),
    }
}

fn count(result: Result<usize>) -> isize {
    match result.and_then(|n| {
        isize::try_from(n).map_err(|_| RouterError::InvalidArgument("count overflows".into()))
    }) {
        Ok(n) => n,
        Err(err) => fail(err, -1),
    }
}

fn with_router<T>(f: impl FnOnce(&'static Router) -> Result<T>) -> Result<T> {
    f(installed()?)
}

fn seek_from(offset: i64, whence: c_int) -> Result<SeekFrom> {
    match whence {
        libc::SEEK_SET => u64::try_from(offset)
            .map(SeekFrom::Start)
            .map_err(|_| RouterError::InvalidArgument(format!("negative offset {}", offset))),
        libc::SEEK_CUR => Ok(SeekFrom::Current(offset)),
        libc::SEEK_END => Ok(SeekFrom::End(offset)),
        _ => Err(RouterError::InvalidArgument(format!("bad whence {}", whence))),
    }
}

pub fn stat(path: &str, buf: &mut FileStat) -> c_int {
    status(with_router(|r| r.stat(path)).map(|st| *buf = st))
}

pub fn lstat(path: &str, buf: &mut FileStat) -> c_int {
    status(with_router(|r| r.lstat(path)).map(|st| *buf = st))
}

pub fn access(path: &str, mode: c_int) -> c_int {
    status(with_router(|r| r.access(path, mode)))
}

pub fn mkdir(path: &str, mode: u32) -> c_int {
    status(with_router(|r| r.mkdir(path, mode)))
}

pub fn chdir(path: &str) -> c_int {
    status(with_router(|r| r.chdir(path)))
}

/// Copy the working directory into `buf`, returning its length
pub fn getcwd(buf: &mut [u8]) -> Option<usize> {
    match with_router(|r| r.getcwd_into(buf)) {
        Ok(len) => Some(len),
        Err(err) => fail(err, None),
    }
}

/// Copy a link target into `buf` without a terminator, truncating
pub fn readlink(path: &str, buf: &mut [u8]) -> isize {
    count(with_router(|r| {
        let target = r.readlink(path)?;
        let bytes = target.as_os_str().as_bytes();
        let len = bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&bytes[..len]);
        Ok(len)
    }))
}

pub fn open(path: &str, options: &OpenOptions) -> RawFd {
    match with_router(|r| r.open(path, options)) {
        Ok(fd) => fd,
        Err(err) => fail(err, -1),
    }
}

pub fn close(fd: RawFd) -> c_int {
    status(with_router(|r| r.close(fd)))
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    count(with_router(|r| r.read(fd, buf)))
}

pub fn pread(fd: RawFd, buf: &mut [u8], offset: i64) -> isize {
    count(with_router(|r| {
        let offset = u64::try_from(offset)
            .map_err(|_| RouterError::InvalidArgument(format!("negative offset {}", offset)))?;
        r.pread(fd, buf, offset)
    }))
}

pub fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> isize {
    count(with_router(|r| r.readv(fd, bufs)))
}

pub fn lseek(fd: RawFd, offset: i64, whence: c_int) -> i64 {
    let result = with_router(|r| {
        let position = r.lseek(fd, seek_from(offset, whence)?)?;
        i64::try_from(position)
            .map_err(|_| RouterError::Io(std::io::Error::from_raw_os_error(libc::EOVERFLOW)))
    });
    match result {
        Ok(position) => position,
        Err(err) => fail(err, -1),
    }
}

pub fn fstat(fd: RawFd, buf: &mut FileStat) -> c_int {
    status(with_router(|r| r.fstat(fd)).map(|st| *buf = st))
}

pub fn opendir(path: &str) -> Option<DirHandle> {
    match with_router(|r| r.opendir(path)) {
        Ok(dir) => Some(dir),
        Err(err) => fail(err, None),
    }
}

/// Next entry; `None` at the end of the stream leaves `errno` untouched
pub fn readdir(dir: DirHandle) -> Option<DirEntry> {
    match with_router(|r| r.readdir(dir)) {
        Ok(entry) => entry,
        Err(err) => fail(err, None),
    }
}

pub fn telldir(dir: DirHandle) -> i64 {
    match with_router(|r| r.telldir(dir)) {
        Ok(loc) => loc,
        Err(err) => fail(err, -1),
    }
}

pub fn seekdir(dir: DirHandle, loc: i64) {
    if let Err(err) = with_router(|r| r.seekdir(dir, loc)) {
        fail(err, ());
    }
}

pub fn rewinddir(dir: DirHandle) {
    if let Err(err) = with_router(|r| r.rewinddir(dir)) {
        fail(err, ());
    }
}

pub fn dirfd(dir: DirHandle) -> RawFd {
    match with_router(|r| r.dirfd(dir)) {
        Ok(fd) => fd,
        Err(err) => fail(err, -1),
    }
}

pub fn closedir(dir: DirHandle) -> c_int {
    status(with_router(|r| r.closedir(dir)))
}

pub fn scandir(
    path: &str,
    select: Option<SelectFn<'_>>,
    compare: Option<CompareFn<'_>>,
) -> Option<Vec<DirEntry>> {
    match with_router(|r| r.scandir(path, select, compare)) {
        Ok(entries) => Some(entries),
        Err(err) => fail(err, None),
    }
}

/// Load a library; null on failure
pub fn dlopen(path: &str, flags: c_int) -> *mut c_void {
    match with_router(|r| r.dlopen(path, flags)) {
        Ok(handle) => handle.as_ptr(),
        Err(err) => fail(err, ptr::null_mut()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use errno::errno;

    // Nothing in the unit test binary installs a router
    #[test]
    fn test_calls_fail_before_install() {
        let mut st = FileStat::default();
        assert_eq!(stat("/__packfs__/a", &mut st), -1);
        assert_eq!(errno().0, libc::ENXIO);

        assert_eq!(open("/tmp", &OpenOptions::read_only()), -1);
        assert!(opendir("/tmp").is_none());
        assert_eq!(errno().0, libc::ENXIO);
    }

    #[test]
    fn test_seek_from_whence() {
        assert_eq!(seek_from(4, libc::SEEK_SET).unwrap(), SeekFrom::Start(4));
        assert_eq!(seek_from(-4, libc::SEEK_END).unwrap(), SeekFrom::End(-4));
        assert!(seek_from(-1, libc::SEEK_SET).is_err());
        assert!(seek_from(0, 99).is_err());
    }
}
