//! Host backend over the platform's libc and std calls

use super::{DirEntry, DirHandle, FileKind, FileStat, HostBackend, LibraryHandle, OpenOptions};
use errno::{errno, set_errno, Errno};
use libc::c_int;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::io::{self, IoSliceMut, SeekFrom};
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};

fn cstring(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn cvt(ret: c_int) -> io::Result<c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_size(ret: isize) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn whence(pos: SeekFrom) -> (libc::off_t, c_int) {
    match pos {
        SeekFrom::Start(offset) => (offset as libc::off_t, libc::SEEK_SET),
        SeekFrom::Current(offset) => (offset as libc::off_t, libc::SEEK_CUR),
        SeekFrom::End(offset) => (offset as libc::off_t, libc::SEEK_END),
    }
}

fn kind_from_dtype(d_type: u8) -> FileKind {
    match d_type {
        libc::DT_REG => FileKind::File,
        libc::DT_DIR => FileKind::Directory,
        libc::DT_LNK => FileKind::Symlink,
        _ => FileKind::Other,
    }
}

struct DirStream(NonNull<libc::DIR>);

// A DIR stream is only touched while the owning table's mutex is held.
unsafe impl Send for DirStream {}

/// Host backend that calls straight into the operating system
///
/// Directory streams are tracked in a table so that stale or foreign handles
/// fail with `EBADF` instead of being dereferenced.
#[derive(Default)]
pub struct StdHost {
    dirs: Mutex<HashMap<usize, DirStream>>,
}

impl StdHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_dir<T>(
        &self,
        dir: DirHandle,
        f: impl FnOnce(*mut libc::DIR) -> io::Result<T>,
    ) -> io::Result<T> {
        let dirs = self.dirs.lock().unwrap_or_else(PoisonError::into_inner);
        match dirs.get(&dir.0) {
            Some(stream) => f(stream.0.as_ptr()),
            None => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }

    fn stat_with(
        path: &str,
        call: unsafe extern "C" fn(*const libc::c_char, *mut libc::stat) -> c_int,
    ) -> io::Result<FileStat> {
        let path = cstring(path.as_bytes())?;
        let mut st = MaybeUninit::<libc::stat>::uninit();
        cvt(unsafe { call(path.as_ptr(), st.as_mut_ptr()) })?;
        let st = unsafe { st.assume_init() };
        Ok(FileStat::from(&st))
    }
}

impl HostBackend for StdHost {
    fn stat(&self, path: &str) -> io::Result<FileStat> {
        Self::stat_with(path, libc::stat)
    }

    fn lstat(&self, path: &str) -> io::Result<FileStat> {
        Self::stat_with(path, libc::lstat)
    }

    fn readlink(&self, path: &str) -> io::Result<PathBuf> {
        std::fs::read_link(path)
    }

    fn access(&self, path: &str, mode: i32) -> io::Result<()> {
        let path = cstring(path.as_bytes())?;
        cvt(unsafe { libc::access(path.as_ptr(), mode) })?;
        Ok(())
    }

    fn mkdir(&self, path: &str, mode: u32) -> io::Result<()> {
        std::fs::DirBuilder::new().mode(mode).create(path)
    }

    fn chdir(&self, path: &str) -> io::Result<()> {
        std::env::set_current_dir(path)
    }

    fn getcwd(&self) -> io::Result<PathBuf> {
        std::env::current_dir()
    }

    fn open(&self, path: &str, options: &OpenOptions) -> io::Result<RawFd> {
        let path = cstring(path.as_bytes())?;
        let mode = options.mode().unwrap_or(0) as libc::c_uint;
        cvt(unsafe { libc::open(path.as_ptr(), options.flags(), mode) })
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        cvt(unsafe { libc::close(fd) })?;
        Ok(())
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        cvt_size(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })
    }

    fn pread(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        cvt_size(unsafe {
            libc::pread(fd, buf.as_mut_ptr().cast(), buf.len(), offset as libc::off_t)
        })
    }

    fn readv(&self, fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        // IoSliceMut is ABI compatible with iovec on unix targets.
        let count = bufs.len().min(c_int::MAX as usize) as c_int;
        cvt_size(unsafe { libc::readv(fd, bufs.as_ptr().cast(), count) })
    }

    fn seek(&self, fd: RawFd, pos: SeekFrom) -> io::Result<u64> {
        let (offset, whence) = whence(pos);
        let ret = unsafe { libc::lseek(fd, offset, whence) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as u64)
    }

    fn fstat(&self, fd: RawFd) -> io::Result<FileStat> {
        let mut st = MaybeUninit::<libc::stat>::uninit();
        cvt(unsafe { libc::fstat(fd, st.as_mut_ptr()) })?;
        let st = unsafe { st.assume_init() };
        Ok(FileStat::from(&st))
    }

    fn opendir(&self, path: &str) -> io::Result<DirHandle> {
        let path = cstring(path.as_bytes())?;
        let ptr = unsafe { libc::opendir(path.as_ptr()) };
        let stream = NonNull::new(ptr).ok_or_else(io::Error::last_os_error)?;
        let handle = DirHandle(ptr as usize);
        self.dirs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.0, DirStream(stream));
        Ok(handle)
    }

    fn readdir(&self, dir: DirHandle) -> io::Result<Option<DirEntry>> {
        self.with_dir(dir, |stream| {
            set_errno(Errno(0));
            let entry = unsafe { libc::readdir(stream) };
            if entry.is_null() {
                return match errno().0 {
                    0 => Ok(None),
                    code => Err(io::Error::from_raw_os_error(code)),
                };
            }
            let entry = unsafe { &*entry };
            let name = unsafe { CStr::from_ptr(entry.d_name.as_ptr()) };
            Ok(Some(DirEntry {
                ino: entry.d_ino as u64,
                kind: kind_from_dtype(entry.d_type),
                name: name.to_string_lossy().into_owned(),
            }))
        })
    }

    fn telldir(&self, dir: DirHandle) -> io::Result<i64> {
        self.with_dir(dir, |stream| {
            let loc = unsafe { libc::telldir(stream) };
            if loc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(loc as i64)
        })
    }

    fn seekdir(&self, dir: DirHandle, loc: i64) -> io::Result<()> {
        self.with_dir(dir, |stream| {
            unsafe { libc::seekdir(stream, loc as libc::c_long) };
            Ok(())
        })
    }

    fn rewinddir(&self, dir: DirHandle) -> io::Result<()> {
        self.with_dir(dir, |stream| {
            unsafe { libc::rewinddir(stream) };
            Ok(())
        })
    }

    fn dirfd(&self, dir: DirHandle) -> io::Result<RawFd> {
        self.with_dir(dir, |stream| cvt(unsafe { libc::dirfd(stream) }))
    }

    fn closedir(&self, dir: DirHandle) -> io::Result<()> {
        let stream = self
            .dirs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&dir.0)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        cvt(unsafe { libc::closedir(stream.0.as_ptr()) })?;
        Ok(())
    }

    fn scandir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let dir = self.opendir(path)?;
        let mut entries = Vec::new();
        let listed = loop {
            match self.readdir(dir) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        self.closedir(dir)?;
        listed.map(|()| entries)
    }

    fn dlopen(&self, path: &Path, flags: i32) -> io::Result<LibraryHandle> {
        let path = cstring(path.as_os_str().as_bytes())?;
        let handle = unsafe { libc::dlopen(path.as_ptr(), flags) };
        match NonNull::new(handle) {
            Some(handle) => Ok(LibraryHandle::new(handle)),
            None => {
                let message = unsafe {
                    let err = libc::dlerror();
                    if err.is_null() {
                        "dlopen failed".to_string()
                    } else {
                        CStr::from_ptr(err).to_string_lossy().into_owned()
                    }
                };
                Err(io::Error::other(message))
            }
        }
    }
}

impl Drop for StdHost {
    fn drop(&mut self) {
        let dirs = self.dirs.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, stream) in dirs.drain() {
            unsafe { libc::closedir(stream.0.as_ptr()) };
        }
    }
}
