use crate::error::{Result, RouterError};
use crate::image::format::{CompressionMethod, EntryKind, ImageHeader, IndexEntry, HEADER_SIZE};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default permission bits for synthesized directories
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Default permission bits for files added from memory
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Normalize an image path: forward slashes, no empty or `.` components,
/// no leading or trailing slash. `..` is rejected.
pub fn normalize_path(path: &str) -> Result<String> {
    let mut parts = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(RouterError::PathError(format!(
                    "Parent directory components are not allowed: {}",
                    path
                )))
            }
            _ => parts.push(part),
        }
    }
    Ok(parts.join("/"))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Image writer for creating packed images
pub struct ImageWriter {
    writer: BufWriter<File>,
    entries: Vec<IndexEntry>,
    paths: HashSet<String>,
    current_offset: u64,
}

impl ImageWriter {
    /// Create a new image file
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);

        // Placeholder header, rewritten at finalization
        ImageHeader::new().write_to(&mut writer)?;

        Ok(Self {
            writer,
            entries: Vec::new(),
            paths: HashSet::new(),
            current_offset: HEADER_SIZE as u64,
        })
    }

    /// Add a file with default permissions and automatic compression
    pub fn add_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.add_file_with_mode(path, data, DEFAULT_FILE_MODE)
    }

    /// Add a file with explicit permission bits
    pub fn add_file_with_mode(&mut self, path: &str, data: &[u8], mode: u32) -> Result<()> {
        let compression = CompressionMethod::choose_for_file(path, data.len() as u64);
        self.add_entry(path, EntryKind::File, data, mode, compression)
    }

    /// Add a file with a specific compression method
    pub fn add_file_with_compression(
        &mut self,
        path: &str,
        data: &[u8],
        compression: CompressionMethod,
    ) -> Result<()> {
        self.add_entry(path, EntryKind::File, data, DEFAULT_FILE_MODE, compression)
    }

    /// Add a file from disk, keeping its permission bits
    pub fn add_file_from_disk(&mut self, image_path: &str, disk_path: &Path) -> Result<()> {
        let data = std::fs::read(disk_path)?;
        let mode = std::fs::metadata(disk_path)?.permissions().mode();
        self.add_file_with_mode(image_path, &data, mode & 0o7777)
    }

    /// Add an explicit directory entry
    pub fn add_dir(&mut self, path: &str, mode: u32) -> Result<()> {
        self.add_entry(path, EntryKind::Directory, &[], mode, CompressionMethod::None)
    }

    /// Add a symbolic link; the target is stored verbatim
    pub fn add_symlink(&mut self, path: &str, target: &str) -> Result<()> {
        self.add_entry(
            path,
            EntryKind::Symlink,
            target.as_bytes(),
            0o777,
            CompressionMethod::None,
        )
    }

    /// Add a directory tree from disk under `image_prefix`
    pub fn add_tree(&mut self, image_prefix: &str, disk_dir: &Path) -> Result<()> {
        let prefix = normalize_path(image_prefix)?;
        if !prefix.is_empty() && !self.paths.contains(&prefix) {
            let mode = std::fs::metadata(disk_dir)?.permissions().mode();
            self.add_dir(&prefix, mode & 0o7777)?;
        }

        let mut children: Vec<_> = std::fs::read_dir(disk_dir)?.collect::<std::io::Result<_>>()?;
        children.sort_by_key(|entry| entry.file_name());

        for child in children {
            let name = child.file_name();
            let name = name.to_str().ok_or_else(|| {
                RouterError::PathError(format!("Non UTF-8 file name in {}", disk_dir.display()))
            })?;
            let image_path = if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", prefix, name)
            };

            let file_type = child.file_type()?;
            if file_type.is_dir() {
                self.add_tree(&image_path, &child.path())?;
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(child.path())?;
                let target = target.to_str().ok_or_else(|| {
                    RouterError::PathError(format!("Non UTF-8 link target for {}", image_path))
                })?;
                self.add_symlink(&image_path, target)?;
            } else if file_type.is_file() {
                self.add_file_from_disk(&image_path, &child.path())?;
            }
        }

        Ok(())
    }

    fn add_entry(
        &mut self,
        path: &str,
        kind: EntryKind,
        data: &[u8],
        mode: u32,
        compression: CompressionMethod,
    ) -> Result<()> {
        let normalized_path = normalize_path(path)?;
        if normalized_path.is_empty() {
            return Err(RouterError::PathError(
                "The image root cannot be added as an entry".to_string(),
            ));
        }
        if !self.paths.insert(normalized_path.clone()) {
            return Err(RouterError::PathError(format!(
                "Duplicate entry: {}",
                normalized_path
            )));
        }

        let (payload, actual_compression) = Self::compress_data(data, compression)?;

        self.writer.write_all(&payload)?;
        self.entries.push(IndexEntry {
            path: normalized_path,
            kind,
            mode: mode & 0o7777,
            data_offset: self.current_offset,
            uncompressed_size: data.len() as u64,
            compressed_size: payload.len() as u64,
            crc32: crc32fast::hash(data),
            modified_time: now_secs(),
            compression: actual_compression,
        });
        self.current_offset += payload.len() as u64;

        Ok(())
    }

    /// Finalize the image by writing the index and updating the header
    pub fn finalize(mut self) -> Result<()> {
        self.add_missing_parents()?;

        let index_offset = self.current_offset;
        let mut index = Vec::new();
        for entry in &self.entries {
            entry.write_to(&mut index)?;
        }
        self.writer.write_all(&index)?;
        self.writer.flush()?;

        let mut header = ImageHeader::new();
        header.index_offset = index_offset;
        header.index_size = index.len() as u64;
        header.entry_count = self.entries.len() as u32;
        header.index_crc = crc32fast::hash(&index);

        let mut file = self.writer.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        header.write_to(&mut file)?;
        file.flush()?;

        Ok(())
    }

    /// Synthesize directory entries for every parent that was not added explicitly
    fn add_missing_parents(&mut self) -> Result<()> {
        let kinds: HashMap<&str, EntryKind> = self
            .entries
            .iter()
            .map(|entry| (entry.path.as_str(), entry.kind))
            .collect();

        let mut missing = BTreeSet::new();
        for entry in &self.entries {
            let mut path = entry.path.as_str();
            while let Some((parent, _)) = path.rsplit_once('/') {
                match kinds.get(parent) {
                    Some(EntryKind::Directory) => {}
                    Some(_) => {
                        return Err(RouterError::PathError(format!(
                            "{} is used as a directory but is not one",
                            parent
                        )))
                    }
                    None => {
                        missing.insert(parent.to_string());
                    }
                }
                path = parent;
            }
        }
        drop(kinds);

        for parent in missing {
            self.add_dir(&parent, DEFAULT_DIR_MODE)?;
        }
        Ok(())
    }

    /// Compress data with fallback to stored if not beneficial
    fn compress_data(
        data: &[u8],
        compression: CompressionMethod,
    ) -> Result<(Vec<u8>, CompressionMethod)> {
        let compressed = match compression {
            CompressionMethod::None => return Ok((data.to_vec(), CompressionMethod::None)),
            CompressionMethod::Lz4 => lz4_flex::compress_prepend_size(data),
            CompressionMethod::Zstd => zstd::encode_all(data, 6).map_err(|e| {
                RouterError::CompressionFailed(format!("Zstd compression failed: {}", e))
            })?,
        };

        if compressed.len() < data.len() {
            Ok((compressed, compression))
        } else {
            Ok((data.to_vec(), CompressionMethod::None))
        }
    }
}
