use crate::error::{Result, RouterError};
use crate::image::format::{
    CompressionMethod, EntryKind, ImageHeader, IndexEntry, ENTRY_FIXED_SIZE, HEADER_SIZE,
};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

/// Image reader with O(1) entry lookup
pub struct ImageReader {
    file: File,
    header: ImageHeader,
    entries: HashMap<String, IndexEntry>,
    entry_list: Vec<String>,
}

impl ImageReader {
    /// Open an image file and load its index
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();

        let header = ImageHeader::read_from(&mut file)?;
        header.validate_version()?;

        let index_end = header
            .index_offset
            .checked_add(header.index_size)
            .filter(|end| *end <= file_len && header.index_offset >= HEADER_SIZE as u64)
            .ok_or_else(|| {
                RouterError::InvalidFormat("Index extends beyond end of image".to_string())
            })?;

        let max_entries = header.index_size / ENTRY_FIXED_SIZE as u64;
        if u64::from(header.entry_count) > max_entries {
            return Err(RouterError::InvalidFormat(format!(
                "Entry count {} does not fit in a {} byte index",
                header.entry_count, header.index_size
            )));
        }

        // Read and verify the whole index before parsing it
        file.seek(SeekFrom::Start(header.index_offset))?;
        let mut index = vec![0u8; (index_end - header.index_offset) as usize];
        file.read_exact(&mut index)?;

        let computed_crc = crc32fast::hash(&index);
        if computed_crc != header.index_crc {
            return Err(RouterError::CrcMismatch {
                expected: header.index_crc,
                actual: computed_crc,
            });
        }

        let mut cursor = Cursor::new(&index[..]);
        let mut entries = HashMap::with_capacity(header.entry_count as usize);
        let mut entry_list = Vec::with_capacity(header.entry_count as usize);

        for _ in 0..header.entry_count {
            let entry = IndexEntry::read_from(&mut cursor)?;
            let data_end = entry.data_offset.checked_add(entry.compressed_size);
            if data_end.map_or(true, |end| end > header.index_offset) {
                return Err(RouterError::InvalidFormat(format!(
                    "Data for {} overlaps the index",
                    entry.path
                )));
            }
            entry_list.push(entry.path.clone());
            entries.insert(entry.path.clone(), entry);
        }

        Ok(Self {
            file,
            header,
            entries,
            entry_list,
        })
    }

    /// Get image header information
    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    /// Get number of entries in the image
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// List all entry paths in index order
    pub fn list_entries(&self) -> &[String] {
        &self.entry_list
    }

    /// Iterate over all index entries in index order
    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entry_list.iter().filter_map(|path| self.entries.get(path))
    }

    /// Check if an entry exists
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Get entry information without reading data
    pub fn get_entry(&self, path: &str) -> Option<&IndexEntry> {
        self.entries.get(path)
    }

    /// Read and decompress the payload of a file or symlink entry
    pub fn read_entry(&mut self, path: &str) -> Result<Vec<u8>> {
        let entry = self
            .entries
            .get(path)
            .ok_or_else(|| RouterError::NotFound(path.to_string()))?
            .clone();

        if entry.kind == EntryKind::Directory {
            return Err(RouterError::IsADirectory(path.to_string()));
        }

        self.file.seek(SeekFrom::Start(entry.data_offset))?;
        let mut raw = vec![0u8; entry.compressed_size as usize];
        self.file.read_exact(&mut raw)?;

        let data = match entry.compression {
            CompressionMethod::None => raw,
            CompressionMethod::Lz4 => Self::decompress_lz4(&raw, &entry)?,
            CompressionMethod::Zstd => Self::decompress_zstd(&raw)?,
        };

        if data.len() as u64 != entry.uncompressed_size {
            return Err(RouterError::DecompressionFailed(format!(
                "{}: expected {} bytes, got {}",
                path,
                entry.uncompressed_size,
                data.len()
            )));
        }

        let computed_crc = crc32fast::hash(&data);
        if computed_crc != entry.crc32 {
            return Err(RouterError::CrcMismatch {
                expected: entry.crc32,
                actual: computed_crc,
            });
        }

        Ok(data)
    }

    /// Read a symlink's target
    pub fn read_link(&mut self, path: &str) -> Result<String> {
        match self.entries.get(path).map(|entry| entry.kind) {
            Some(EntryKind::Symlink) => {}
            Some(_) => {
                return Err(RouterError::InvalidArgument(format!(
                    "Not a symbolic link: {}",
                    path
                )))
            }
            None => return Err(RouterError::NotFound(path.to_string())),
        }

        let data = self.read_entry(path)?;
        String::from_utf8(data)
            .map_err(|e| RouterError::PathError(format!("Invalid UTF-8 in link target: {}", e)))
    }

    /// Decompress LZ4 data, refusing sizes that disagree with the index
    fn decompress_lz4(data: &[u8], entry: &IndexEntry) -> Result<Vec<u8>> {
        // compress_prepend_size stores the uncompressed size up front
        let declared = data
            .get(..4)
            .map(|prefix| u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]))
            .ok_or_else(|| RouterError::DecompressionFailed("LZ4 payload truncated".to_string()))?;

        if u64::from(declared) != entry.uncompressed_size {
            return Err(RouterError::DecompressionFailed(format!(
                "LZ4 size prefix {} disagrees with index size {}",
                declared, entry.uncompressed_size
            )));
        }

        lz4_flex::decompress_size_prepended(data).map_err(|e| {
            RouterError::DecompressionFailed(format!("LZ4 decompression failed: {}", e))
        })
    }

    /// Decompress Zstd data
    fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| {
            RouterError::DecompressionFailed(format!("Zstd decompression failed: {}", e))
        })
    }
}
