//! Archive backend over a packed image

use crate::backend::{ArchiveBackend, DirEntry, DirHandle, FileKind, FileStat};
use crate::classify::PathClassifier;
use crate::config::RouterConfig;
use crate::error::{Result, RouterError};
use crate::image::format::EntryKind;
use crate::image::reader::ImageReader;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tempfile::TempDir;
use tracing::{debug, trace};

/// First descriptor of the range reserved for image members
pub const VFD_BASE: RawFd = 0x4000_0000;

/// Symbolic links followed before a lookup fails with ELOOP
pub const MAX_SYMLINK_HOPS: usize = 40;

const BLOCK_SIZE: u64 = 4096;
const ROOT_INO: u64 = 1;

#[derive(Debug, Clone)]
struct Node {
    kind: EntryKind,
    mode: u32,
    size: u64,
    mtime: u64,
    ino: u64,
}

#[derive(Debug)]
struct OpenFile {
    data: Arc<[u8]>,
    position: u64,
    stat: FileStat,
}

#[derive(Debug)]
struct OpenDir {
    entries: Vec<DirEntry>,
    position: usize,
    fd: RawFd,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

fn file_kind(kind: EntryKind) -> FileKind {
    match kind {
        EntryKind::File => FileKind::File,
        EntryKind::Directory => FileKind::Directory,
        EntryKind::Symlink => FileKind::Symlink,
    }
}

/// Serves a packed image under the mount scope
///
/// Paths handed to this backend are full virtual paths; the marker segment
/// is stripped before lookup. Lookups resolve `.`, `..` and symbolic links
/// component by component. Absolute link targets must point back into the
/// mount scope.
pub struct ImageFs {
    classifier: PathClassifier,
    reader: Mutex<ImageReader>,
    nodes: HashMap<String, Node>,
    children: HashMap<String, Vec<String>>,
    links: HashMap<String, String>,
    files: Mutex<HashMap<RawFd, OpenFile>>,
    next_fd: AtomicI32,
    dirs: Mutex<HashMap<usize, OpenDir>>,
    next_dir: AtomicUsize,
    extract_prefix: String,
    temp_root: PathBuf,
    extract_dir: Mutex<Option<TempDir>>,
    extracted: Mutex<HashMap<(String, String), PathBuf>>,
}

impl ImageFs {
    /// Open an image file and serve it under the configured marker
    pub fn open<P: AsRef<Path>>(path: P, config: &RouterConfig) -> Result<Self> {
        let reader = ImageReader::open(path)?;
        Self::new(reader, config)
    }

    pub fn new(mut reader: ImageReader, config: &RouterConfig) -> Result<Self> {
        let mut nodes = HashMap::new();
        nodes.insert(
            String::new(),
            Node {
                kind: EntryKind::Directory,
                mode: 0o755,
                size: 0,
                mtime: 0,
                ino: ROOT_INO,
            },
        );

        let mut next_ino = ROOT_INO + 1;
        let mut link_paths = Vec::new();
        for entry in reader.entries() {
            nodes.insert(
                entry.path.clone(),
                Node {
                    kind: entry.kind,
                    mode: entry.mode,
                    size: entry.uncompressed_size,
                    mtime: entry.modified_time,
                    ino: next_ino,
                },
            );
            next_ino += 1;
            if entry.kind == EntryKind::Symlink {
                link_paths.push(entry.path.clone());
            }
        }

        // Images from other writers may omit parent directories
        let paths: Vec<String> = nodes.keys().filter(|p| !p.is_empty()).cloned().collect();
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for path in paths {
            let mut current = path.as_str();
            while !current.is_empty() {
                let parent = parent_of(current);
                let name = current.rsplit('/').next().unwrap_or(current);
                let siblings = children.entry(parent.to_string()).or_default();
                if !siblings.iter().any(|existing| existing == name) {
                    siblings.push(name.to_string());
                }
                if nodes.contains_key(parent) {
                    break;
                }
                nodes.insert(
                    parent.to_string(),
                    Node {
                        kind: EntryKind::Directory,
                        mode: 0o755,
                        size: 0,
                        mtime: 0,
                        ino: next_ino,
                    },
                );
                next_ino += 1;
                current = parent;
            }
        }
        for siblings in children.values_mut() {
            siblings.sort();
        }

        let mut links = HashMap::with_capacity(link_paths.len());
        for path in link_paths {
            let target = reader.read_link(&path)?;
            links.insert(path, target);
        }

        Ok(Self {
            classifier: PathClassifier::new(config),
            reader: Mutex::new(reader),
            nodes,
            children,
            links,
            files: Mutex::new(HashMap::new()),
            next_fd: AtomicI32::new(VFD_BASE),
            dirs: Mutex::new(HashMap::new()),
            next_dir: AtomicUsize::new(1),
            extract_prefix: config.extract_prefix.clone(),
            temp_root: config.temp_root(),
            extract_dir: Mutex::new(None),
            extracted: Mutex::new(HashMap::new()),
        })
    }

    /// Number of entries, synthesized directories included
    pub fn entry_count(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Resolve a virtual path to an image path
    fn lookup(&self, path: &str, follow_last: bool) -> Result<String> {
        let inner = self
            .classifier
            .strip_scope(path)
            .ok_or_else(|| RouterError::ScopeViolation(path.to_string()))?;

        let mut pending: Vec<String> = inner.rsplit('/').map(str::to_string).collect();
        let mut resolved: Vec<String> = Vec::new();
        let mut hops = 0;

        while let Some(part) = pending.pop() {
            let current = resolved.join("/");
            if self.nodes.get(&current).map(|node| node.kind) != Some(EntryKind::Directory) {
                return Err(RouterError::NotADirectory(path.to_string()));
            }

            match part.as_str() {
                "" | "." => continue,
                ".." => {
                    resolved.pop();
                    continue;
                }
                _ => resolved.push(part),
            }

            let current = resolved.join("/");
            let node = self
                .nodes
                .get(&current)
                .ok_or_else(|| RouterError::NotFound(path.to_string()))?;
            if node.kind != EntryKind::Symlink || (!follow_last && pending.is_empty()) {
                continue;
            }

            hops += 1;
            if hops > MAX_SYMLINK_HOPS {
                return Err(RouterError::TooManyLinks(path.to_string()));
            }
            let target = self
                .links
                .get(&current)
                .ok_or_else(|| RouterError::NotFound(current.clone()))?;
            resolved.pop();

            let relative = if target.starts_with('/') {
                resolved.clear();
                self.classifier
                    .strip_scope(target)
                    .ok_or_else(|| RouterError::ScopeViolation(target.clone()))?
            } else {
                target.as_str()
            };
            pending.extend(relative.rsplit('/').map(str::to_string));
        }

        Ok(resolved.join("/"))
    }

    fn node(&self, image_path: &str) -> Result<&Node> {
        self.nodes
            .get(image_path)
            .ok_or_else(|| RouterError::NotFound(image_path.to_string()))
    }

    fn stat_node(&self, image_path: &str, node: &Node) -> FileStat {
        let size = match node.kind {
            EntryKind::File => node.size,
            EntryKind::Symlink => self.links.get(image_path).map_or(0, |t| t.len() as u64),
            EntryKind::Directory => 0,
        };
        let nlink = match node.kind {
            EntryKind::Directory => 2,
            _ => 1,
        };
        FileStat {
            dev: 0,
            ino: node.ino,
            mode: file_kind(node.kind).mode_bits() | (node.mode & 0o7777),
            nlink,
            uid: 0,
            gid: 0,
            size,
            blksize: BLOCK_SIZE,
            blocks: size.div_ceil(512),
            atime: node.mtime as i64,
            mtime: node.mtime as i64,
            ctime: node.mtime as i64,
        }
    }

    fn allocate_fd(&self, file: OpenFile) -> Result<RawFd> {
        let fd = self
            .next_fd
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |fd| fd.checked_add(1))
            .map_err(|_| RouterError::Io(io::Error::from_raw_os_error(libc::EMFILE)))?;
        lock(&self.files).insert(fd, file);
        Ok(fd)
    }

    fn read_member(&self, image_path: &str) -> Result<Arc<[u8]>> {
        let data = lock(&self.reader).read_entry(image_path)?;
        Ok(Arc::from(data))
    }

    fn dir_entries(&self, image_path: &str) -> Result<Vec<DirEntry>> {
        let node = self.node(image_path)?;
        let parent_ino = self
            .nodes
            .get(parent_of(image_path))
            .map_or(ROOT_INO, |parent| parent.ino);

        let mut entries = vec![
            DirEntry {
                ino: node.ino,
                kind: FileKind::Directory,
                name: ".".to_string(),
            },
            DirEntry {
                ino: if image_path.is_empty() { ROOT_INO } else { parent_ino },
                kind: FileKind::Directory,
                name: "..".to_string(),
            },
        ];

        for name in self.children.get(image_path).into_iter().flatten() {
            let child_path = if image_path.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", image_path, name)
            };
            let child = self.node(&child_path)?;
            entries.push(DirEntry {
                ino: child.ino,
                kind: file_kind(child.kind),
                name: name.clone(),
            });
        }
        Ok(entries)
    }

    fn with_dir<T>(&self, dir: DirHandle, f: impl FnOnce(&mut OpenDir) -> Result<T>) -> Result<T> {
        let mut dirs = lock(&self.dirs);
        let open = dirs
            .get_mut(&dir.0)
            .ok_or(RouterError::BadDescriptor(dir.0 as i32))?;
        f(open)
    }

    fn with_file<T>(&self, fd: RawFd, f: impl FnOnce(&mut OpenFile) -> Result<T>) -> Result<T> {
        let mut files = lock(&self.files);
        let open = files.get_mut(&fd).ok_or(RouterError::BadDescriptor(fd))?;
        f(open)
    }

    /// Directory receiving extracted members, created on first use
    fn extract_root(&self) -> Result<PathBuf> {
        let mut slot = lock(&self.extract_dir);
        if let Some(dir) = slot.as_ref() {
            return Ok(dir.path().to_path_buf());
        }
        let dir = tempfile::Builder::new()
            .prefix(&self.extract_prefix)
            .tempdir_in(&self.temp_root)?;
        let path = dir.path().to_path_buf();
        debug!(root = %path.display(), "created extraction directory");
        *slot = Some(dir);
        Ok(path)
    }
}

/// File name for an extracted member
fn extract_name(image_path: &str, name_hint: Option<&str>) -> String {
    let raw = name_hint.unwrap_or_else(|| image_path.rsplit('/').next().unwrap_or(image_path));
    let name = raw.replace(['/', '\\', '\0'], "_");
    match name.as_str() {
        "" | "." | ".." => "member".to_string(),
        _ => name,
    }
}

impl ArchiveBackend for ImageFs {
    fn stat(&self, path: &str) -> Result<FileStat> {
        let image_path = self.lookup(path, true)?;
        let node = self.node(&image_path)?;
        Ok(self.stat_node(&image_path, node))
    }

    fn lstat(&self, path: &str) -> Result<FileStat> {
        let image_path = self.lookup(path, false)?;
        let node = self.node(&image_path)?;
        Ok(self.stat_node(&image_path, node))
    }

    fn readlink(&self, path: &str) -> Result<String> {
        let image_path = self.lookup(path, false)?;
        self.links
            .get(&image_path)
            .cloned()
            .ok_or_else(|| RouterError::InvalidArgument(format!("Not a symbolic link: {}", path)))
    }

    fn open(&self, path: &str) -> Result<RawFd> {
        let image_path = self.lookup(path, true)?;
        let node = self.node(&image_path)?;
        let stat = self.stat_node(&image_path, node);
        let data = match node.kind {
            EntryKind::Directory => Arc::from(Vec::new()),
            _ => self.read_member(&image_path)?,
        };

        let fd = self.allocate_fd(OpenFile {
            data,
            position: 0,
            stat,
        })?;
        trace!(path, fd, "opened image member");
        Ok(fd)
    }

    fn close(&self, fd: RawFd) -> Result<()> {
        lock(&self.files)
            .remove(&fd)
            .map(|_| ())
            .ok_or(RouterError::BadDescriptor(fd))
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> Result<usize> {
        self.with_file(fd, |file| {
            if file.stat.is_dir() {
                return Err(RouterError::IsADirectory(format!("descriptor {}", fd)));
            }
            let start = usize::try_from(file.position)
                .unwrap_or(usize::MAX)
                .min(file.data.len());
            let count = buf.len().min(file.data.len() - start);
            buf[..count].copy_from_slice(&file.data[start..start + count]);
            file.position += count as u64;
            Ok(count)
        })
    }

    fn seek(&self, fd: RawFd, pos: SeekFrom) -> Result<u64> {
        self.with_file(fd, |file| {
            let target = match pos {
                SeekFrom::Start(offset) => Some(offset),
                SeekFrom::Current(delta) => file.position.checked_add_signed(delta),
                SeekFrom::End(delta) => (file.data.len() as u64).checked_add_signed(delta),
            };
            let target = target.ok_or_else(|| {
                RouterError::InvalidArgument(format!("Seek before start of descriptor {}", fd))
            })?;
            file.position = target;
            Ok(target)
        })
    }

    fn fstat(&self, fd: RawFd) -> Result<FileStat> {
        self.with_file(fd, |file| Ok(file.stat.clone()))
    }

    fn is_descriptor(&self, fd: RawFd) -> bool {
        fd >= VFD_BASE
    }

    fn opendir(&self, path: &str) -> Result<DirHandle> {
        let image_path = self.lookup(path, true)?;
        let node = self.node(&image_path)?;
        if node.kind != EntryKind::Directory {
            return Err(RouterError::NotADirectory(path.to_string()));
        }

        let entries = self.dir_entries(&image_path)?;
        let fd = self.allocate_fd(OpenFile {
            data: Arc::from(Vec::new()),
            position: 0,
            stat: self.stat_node(&image_path, node),
        })?;

        // Odd values never collide with an aligned host stream pointer
        let handle = self.next_dir.fetch_add(2, Ordering::SeqCst);
        lock(&self.dirs).insert(
            handle,
            OpenDir {
                entries,
                position: 0,
                fd,
            },
        );
        trace!(path, handle, "opened image directory");
        Ok(DirHandle(handle))
    }

    fn owns_dir(&self, dir: DirHandle) -> bool {
        lock(&self.dirs).contains_key(&dir.0)
    }

    fn readdir(&self, dir: DirHandle) -> Result<Option<DirEntry>> {
        self.with_dir(dir, |open| {
            let entry = open.entries.get(open.position).cloned();
            if entry.is_some() {
                open.position += 1;
            }
            Ok(entry)
        })
    }

    fn telldir(&self, dir: DirHandle) -> Result<i64> {
        self.with_dir(dir, |open| Ok(open.position as i64))
    }

    fn seekdir(&self, dir: DirHandle, loc: i64) -> Result<()> {
        self.with_dir(dir, |open| {
            let loc = usize::try_from(loc)
                .map_err(|_| RouterError::InvalidArgument(format!("Bad directory offset {}", loc)))?;
            open.position = loc.min(open.entries.len());
            Ok(())
        })
    }

    fn rewinddir(&self, dir: DirHandle) -> Result<()> {
        self.with_dir(dir, |open| {
            open.position = 0;
            Ok(())
        })
    }

    fn dirfd(&self, dir: DirHandle) -> Result<RawFd> {
        self.with_dir(dir, |open| Ok(open.fd))
    }

    fn closedir(&self, dir: DirHandle) -> Result<()> {
        let open = lock(&self.dirs)
            .remove(&dir.0)
            .ok_or(RouterError::BadDescriptor(dir.0 as i32))?;
        lock(&self.files).remove(&open.fd);
        Ok(())
    }

    fn scandir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let image_path = self.lookup(path, true)?;
        if self.node(&image_path)?.kind != EntryKind::Directory {
            return Err(RouterError::NotADirectory(path.to_string()));
        }
        self.dir_entries(&image_path)
    }

    fn extract(&self, path: &str, name_hint: Option<&str>) -> Result<PathBuf> {
        let image_path = self.lookup(path, true)?;
        let node = self.node(&image_path)?.clone();
        if node.kind == EntryKind::Directory {
            return Err(RouterError::IsADirectory(path.to_string()));
        }

        let key = (image_path.clone(), name_hint.unwrap_or_default().to_string());
        if let Some(existing) = lock(&self.extracted).get(&key) {
            return Ok(existing.clone());
        }

        // Members sharing a file name get separate directories
        let digest = hex::encode(Sha256::digest(image_path.as_bytes()));
        let dir = self.extract_root()?.join(&digest[..16]);
        std::fs::create_dir_all(&dir)?;

        let target = dir.join(extract_name(&image_path, name_hint));
        let data = self.read_member(&image_path)?;
        std::fs::write(&target, &data)?;
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(node.mode & 0o7777))?;

        debug!(path, target = %target.display(), "extracted image member");
        lock(&self.extracted).insert(key, target.clone());
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageWriter;
    use tempfile::NamedTempFile;

    fn build() -> Result<(NamedTempFile, ImageFs)> {
        let image = NamedTempFile::new()?;
        {
            let mut writer = ImageWriter::create(image.path())?;
            writer.add_file("a/b/c.txt", b"hello world")?;
            writer.add_file_with_mode("bin/tool", b"#!/bin/sh\n", 0o755)?;
            writer.add_symlink("a/rel", "b/c.txt")?;
            writer.add_symlink("a/abs", "/__scope__/bin")?;
            writer.add_symlink("a/escape", "/etc/passwd")?;
            writer.add_symlink("loop1", "loop2")?;
            writer.add_symlink("loop2", "loop1")?;
            writer.finalize()?;
        }
        let config = RouterConfig::default().with_mount_marker("/__scope__");
        let fs = ImageFs::open(image.path(), &config)?;
        Ok((image, fs))
    }

    #[test]
    fn test_stat_kinds() -> Result<()> {
        let (_image, fs) = build()?;

        assert!(fs.stat("/__scope__")?.is_dir());
        assert!(fs.stat("/__scope__/a/b")?.is_dir());

        let file = fs.stat("/__scope__/a/b/c.txt")?;
        assert!(file.is_file());
        assert_eq!(file.size, 11);
        assert_eq!(fs.stat("/__scope__/bin/tool")?.permissions(), 0o755);

        assert!(fs.stat("/__scope__/missing").unwrap_err().is_not_found());
        assert!(matches!(
            fs.stat("/__scope__/a/b/c.txt/x"),
            Err(RouterError::NotADirectory(_))
        ));
        Ok(())
    }

    #[test]
    fn test_dot_components_and_symlinks() -> Result<()> {
        let (_image, fs) = build()?;

        assert!(fs.stat("/__scope__/a/./b/../b/c.txt")?.is_file());
        assert!(fs.stat("/__scope__/../a/b")?.is_dir());

        assert!(fs.lstat("/__scope__/a/rel")?.is_symlink());
        assert_eq!(fs.stat("/__scope__/a/rel")?.size, 11);
        assert_eq!(fs.readlink("/__scope__/a/rel")?, "b/c.txt");
        assert!(fs.stat("/__scope__/a/abs/tool")?.is_file());

        assert!(matches!(
            fs.readlink("/__scope__/a/b/c.txt"),
            Err(RouterError::InvalidArgument(_))
        ));
        assert!(matches!(
            fs.stat("/__scope__/a/escape"),
            Err(RouterError::ScopeViolation(_))
        ));
        assert!(matches!(
            fs.stat("/__scope__/loop1"),
            Err(RouterError::TooManyLinks(_))
        ));
        Ok(())
    }

    #[test]
    fn test_descriptor_reads_and_seeks() -> Result<()> {
        let (_image, fs) = build()?;
        let fd = fs.open("/__scope__/a/b/c.txt")?;
        assert!(fs.is_descriptor(fd));

        let mut buf = [0u8; 5];
        assert_eq!(fs.read(fd, &mut buf)?, 5);
        assert_eq!(&buf, b"hello");

        assert_eq!(fs.seek(fd, SeekFrom::End(-5))?, 6);
        let mut rest = [0u8; 16];
        assert_eq!(fs.read(fd, &mut rest)?, 5);
        assert_eq!(&rest[..5], b"world");
        assert_eq!(fs.read(fd, &mut rest)?, 0);

        assert!(matches!(
            fs.seek(fd, SeekFrom::Current(-100)),
            Err(RouterError::InvalidArgument(_))
        ));
        assert_eq!(fs.fstat(fd)?.size, 11);

        fs.close(fd)?;
        assert!(matches!(fs.read(fd, &mut buf), Err(RouterError::BadDescriptor(_))));
        assert!(matches!(fs.close(fd), Err(RouterError::BadDescriptor(_))));
        Ok(())
    }

    #[test]
    fn test_directory_stream() -> Result<()> {
        let (_image, fs) = build()?;
        let dir = fs.opendir("/__scope__/a")?;
        assert!(fs.owns_dir(dir));
        assert_eq!(dir.0 % 2, 1);

        let mut names = Vec::new();
        while let Some(entry) = fs.readdir(dir)? {
            names.push(entry.name);
        }
        assert_eq!(names, [".", "..", "abs", "b", "escape", "rel"]);

        fs.seekdir(dir, 2)?;
        assert_eq!(fs.telldir(dir)?, 2);
        assert_eq!(fs.readdir(dir)?.map(|e| e.name).as_deref(), Some("abs"));

        fs.rewinddir(dir)?;
        assert_eq!(fs.readdir(dir)?.map(|e| e.name).as_deref(), Some("."));

        let fd = fs.dirfd(dir)?;
        assert!(fs.fstat(fd)?.is_dir());

        fs.closedir(dir)?;
        assert!(!fs.owns_dir(dir));
        assert!(matches!(fs.fstat(fd), Err(RouterError::BadDescriptor(_))));
        Ok(())
    }

    #[test]
    fn test_scandir_root() -> Result<()> {
        let (_image, fs) = build()?;
        let names: Vec<_> = fs
            .scandir("/__scope__/")?
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, [".", "..", "a", "bin", "loop1", "loop2"]);

        assert!(matches!(
            fs.opendir("/__scope__/bin/tool"),
            Err(RouterError::NotADirectory(_))
        ));
        Ok(())
    }

    #[test]
    fn test_extract_keeps_mode_and_caches() -> Result<()> {
        let (_image, fs) = build()?;

        let path = fs.extract("/__scope__/bin/tool", None)?;
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("tool"));
        assert_eq!(std::fs::read(&path)?, b"#!/bin/sh\n");
        assert_eq!(std::fs::metadata(&path)?.permissions().mode() & 0o777, 0o755);
        assert_eq!(fs.extract("/__scope__/bin/tool", None)?, path);

        let hinted = fs.extract("/__scope__/a/rel", Some("lib/../x.so"))?;
        assert_eq!(hinted.file_name().and_then(|n| n.to_str()), Some("lib_.._x.so"));
        assert_eq!(std::fs::read(&hinted)?, b"hello world");

        assert!(matches!(
            fs.extract("/__scope__/a", None),
            Err(RouterError::IsADirectory(_))
        ));
        Ok(())
    }
}
