//! Backend capability interfaces
//!
//! The router owns no storage. It talks to two collaborators:
//! - an [`ArchiveBackend`] serving the read-only packed image, keyed by
//!   virtual path or by a descriptor in the reserved virtual range
//! - a [`HostBackend`] wrapping the real operating system calls

mod host;

pub use host::StdHost;

use crate::error::{Result, RouterError};
use std::ffi::c_void;
use std::io::{self, IoSliceMut, SeekFrom};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Opaque directory stream handle
///
/// Ownership is decided by asking the archive backend whether the value is in
/// its open-directory registry, never by inspecting the value itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirHandle(pub usize);

/// Type of a filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl FileKind {
    /// `S_IFMT` bits for this kind
    pub fn mode_bits(self) -> u32 {
        match self {
            FileKind::File => libc::S_IFREG as u32,
            FileKind::Directory => libc::S_IFDIR as u32,
            FileKind::Symlink => libc::S_IFLNK as u32,
            FileKind::Other => 0,
        }
    }

    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFREG as u32 => FileKind::File,
            m if m == libc::S_IFDIR as u32 => FileKind::Directory,
            m if m == libc::S_IFLNK as u32 => FileKind::Symlink,
            _ => FileKind::Other,
        }
    }
}

/// Metadata returned by the stat family
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileStat {
    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind() == FileKind::File
    }

    pub fn is_symlink(&self) -> bool {
        self.kind() == FileKind::Symlink
    }

    /// Permission bits without the file type
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

impl From<&libc::stat> for FileStat {
    #[allow(clippy::unnecessary_cast)]
    fn from(st: &libc::stat) -> Self {
        Self {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            mode: st.st_mode as u32,
            nlink: st.st_nlink as u64,
            uid: st.st_uid as u32,
            gid: st.st_gid as u32,
            size: st.st_size as u64,
            blksize: st.st_blksize as u64,
            blocks: st.st_blocks as u64,
            atime: st.st_atime as i64,
            mtime: st.st_mtime as i64,
            ctime: st.st_ctime as i64,
        }
    }
}

/// One directory stream record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub kind: FileKind,
    pub name: String,
}

/// Arguments of an `open` call
///
/// Replaces the variadic C signature: the mode is only meaningful, and only
/// required, when `O_CREAT` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    flags: i32,
    mode: Option<u32>,
}

impl OpenOptions {
    pub fn new(flags: i32) -> Self {
        Self { flags, mode: None }
    }

    pub fn read_only() -> Self {
        Self::new(libc::O_RDONLY)
    }

    /// `O_CREAT` with the given permission bits
    pub fn create(flags: i32, mode: u32) -> Self {
        Self {
            flags: flags | libc::O_CREAT,
            mode: Some(mode),
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn flags(&self) -> i32 {
        self.flags
    }

    pub fn mode(&self) -> Option<u32> {
        self.mode
    }

    pub fn creates(&self) -> bool {
        self.flags & libc::O_CREAT != 0
    }

    /// Reject `O_CREAT` without a mode
    pub fn validate(&self) -> Result<()> {
        if self.creates() && self.mode.is_none() {
            return Err(RouterError::InvalidArgument(
                "O_CREAT requires a mode".to_string(),
            ));
        }
        Ok(())
    }
}

/// Handle returned by a successful `dlopen`
#[derive(Debug)]
pub struct LibraryHandle(NonNull<c_void>);

impl LibraryHandle {
    pub fn new(ptr: NonNull<c_void>) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// Read-only packed image, addressed by virtual path or virtual descriptor
pub trait ArchiveBackend: Send + Sync {
    fn stat(&self, path: &str) -> Result<FileStat>;
    fn lstat(&self, path: &str) -> Result<FileStat>;
    fn readlink(&self, path: &str) -> Result<String>;

    /// Open a member; the returned descriptor lies in the virtual range
    fn open(&self, path: &str) -> Result<RawFd>;
    fn close(&self, fd: RawFd) -> Result<()>;
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> Result<usize>;
    fn seek(&self, fd: RawFd, pos: SeekFrom) -> Result<u64>;
    fn fstat(&self, fd: RawFd) -> Result<FileStat>;

    /// Whether `fd` lies in the range reserved for virtual descriptors
    fn is_descriptor(&self, fd: RawFd) -> bool;

    fn opendir(&self, path: &str) -> Result<DirHandle>;
    /// Whether `dir` is in the registry of open archive directory streams
    fn owns_dir(&self, dir: DirHandle) -> bool;
    fn readdir(&self, dir: DirHandle) -> Result<Option<DirEntry>>;
    fn telldir(&self, dir: DirHandle) -> Result<i64>;
    fn seekdir(&self, dir: DirHandle, loc: i64) -> Result<()>;
    fn rewinddir(&self, dir: DirHandle) -> Result<()>;
    fn dirfd(&self, dir: DirHandle) -> Result<RawFd>;
    fn closedir(&self, dir: DirHandle) -> Result<()>;
    fn scandir(&self, path: &str) -> Result<Vec<DirEntry>>;

    /// Materialize a member on the real filesystem
    fn extract(&self, path: &str, name_hint: Option<&str>) -> Result<PathBuf>;
}

/// Real operating system filesystem calls
pub trait HostBackend: Send + Sync {
    fn stat(&self, path: &str) -> io::Result<FileStat>;
    fn lstat(&self, path: &str) -> io::Result<FileStat>;
    fn readlink(&self, path: &str) -> io::Result<PathBuf>;
    fn access(&self, path: &str, mode: i32) -> io::Result<()>;
    fn mkdir(&self, path: &str, mode: u32) -> io::Result<()>;
    fn chdir(&self, path: &str) -> io::Result<()>;
    fn getcwd(&self) -> io::Result<PathBuf>;

    fn open(&self, path: &str, options: &OpenOptions) -> io::Result<RawFd>;
    fn close(&self, fd: RawFd) -> io::Result<()>;
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;
    fn pread(&self, fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    fn readv(&self, fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize>;
    fn seek(&self, fd: RawFd, pos: SeekFrom) -> io::Result<u64>;
    fn fstat(&self, fd: RawFd) -> io::Result<FileStat>;

    fn opendir(&self, path: &str) -> io::Result<DirHandle>;
    fn readdir(&self, dir: DirHandle) -> io::Result<Option<DirEntry>>;
    fn telldir(&self, dir: DirHandle) -> io::Result<i64>;
    fn seekdir(&self, dir: DirHandle, loc: i64) -> io::Result<()>;
    fn rewinddir(&self, dir: DirHandle) -> io::Result<()>;
    fn dirfd(&self, dir: DirHandle) -> io::Result<RawFd>;
    fn closedir(&self, dir: DirHandle) -> io::Result<()>;
    fn scandir(&self, path: &str) -> io::Result<Vec<DirEntry>>;

    fn dlopen(&self, path: &Path, flags: i32) -> io::Result<LibraryHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mode_roundtrip() {
        for kind in [FileKind::File, FileKind::Directory, FileKind::Symlink] {
            assert_eq!(FileKind::from_mode(kind.mode_bits() | 0o755), kind);
        }
        assert_eq!(FileKind::from_mode(0o644), FileKind::Other);
    }

    #[test]
    fn test_open_options_validation() {
        assert!(OpenOptions::read_only().validate().is_ok());
        assert!(OpenOptions::create(libc::O_WRONLY, 0o644).validate().is_ok());

        let missing_mode = OpenOptions::new(libc::O_WRONLY | libc::O_CREAT);
        assert!(matches!(
            missing_mode.validate(),
            Err(RouterError::InvalidArgument(_))
        ));
        assert!(missing_mode.with_mode(0o600).validate().is_ok());
    }
}
