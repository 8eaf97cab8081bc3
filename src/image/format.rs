use crate::error::{Result, RouterError};
use std::io::{Read, Write};

/// Magic number: 0x89 'P' 'K' 'F' 0x0D 0x0A 0x1A 0x0A
/// Follows PNG pattern for corruption detection
pub const MAGIC_NUMBER: [u8; 8] = [0x89, b'P', b'K', b'F', 0x0D, 0x0A, 0x1A, 0x0A];

/// Current format version
pub const FORMAT_VERSION_MAJOR: u16 = 1;
pub const FORMAT_VERSION_MINOR: u16 = 0;

/// Header size in bytes
pub const HEADER_SIZE: usize = 48;

/// Fixed part of an index entry, before the path bytes
pub const ENTRY_FIXED_SIZE: usize = 48;

/// Maximum path length in bytes (UTF-8)
pub const MAX_PATH_LENGTH: usize = 4096;

/// Index entry signature "PENT"
pub const ENTRY_SIGNATURE: [u8; 4] = [0x50, 0x45, 0x4E, 0x54];

/// Compression methods supported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionMethod {
    None = 0,
    Lz4 = 1,
    Zstd = 2,
}

impl CompressionMethod {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            2 => Ok(Self::Zstd),
            _ => Err(RouterError::InvalidCompression(value)),
        }
    }

    /// Choose compression from file name and size
    ///
    /// Shared libraries and executables use LZ4 since they are extracted
    /// on the hot path of `dlopen`; text uses Zstd.
    pub fn choose_for_file(path: &str, size: u64) -> Self {
        // Don't compress small files
        if size < 4096 {
            return Self::None;
        }

        let extension = path.rsplit('.').next().unwrap_or("").to_lowercase();
        match extension.as_str() {
            // Already compressed formats
            "png" | "jpg" | "jpeg" | "gif" | "mp3" | "mp4" | "zip" | "gz" | "xz" | "7z" => {
                Self::None
            }
            // Text formats
            "txt" | "md" | "json" | "toml" | "xml" | "html" | "css" | "js" | "py" | "rb" => {
                Self::Zstd
            }
            // Native code
            "so" | "dylib" | "node" | "wasm" => Self::Lz4,
            _ => Self::Zstd,
        }
    }
}

/// Kind of an image entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryKind {
    File = 0,
    Directory = 1,
    Symlink = 2,
}

impl EntryKind {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::File),
            1 => Ok(Self::Directory),
            2 => Ok(Self::Symlink),
            _ => Err(RouterError::InvalidFormat(format!(
                "Unknown entry kind: {}",
                value
            ))),
        }
    }
}

/// Image header at the beginning of the file
///
/// Layout (48 bytes, little endian):
/// magic(8) major(2) minor(2) flags(4) index_offset(8) index_size(8)
/// entry_count(4) index_crc(4) reserved(8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub version_major: u16,
    pub version_minor: u16,
    pub flags: u32,
    pub index_offset: u64,
    pub index_size: u64,
    pub entry_count: u32,
    pub index_crc: u32,
}

impl ImageHeader {
    pub fn new() -> Self {
        Self {
            version_major: FORMAT_VERSION_MAJOR,
            version_minor: FORMAT_VERSION_MINOR,
            flags: 0,
            index_offset: 0,
            index_size: 0,
            entry_count: 0,
            index_crc: 0,
        }
    }

    /// Write header to a writer
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_all(&MAGIC_NUMBER)?;
        writer.write_all(&self.version_major.to_le_bytes())?;
        writer.write_all(&self.version_minor.to_le_bytes())?;
        writer.write_all(&self.flags.to_le_bytes())?;
        writer.write_all(&self.index_offset.to_le_bytes())?;
        writer.write_all(&self.index_size.to_le_bytes())?;
        writer.write_all(&self.entry_count.to_le_bytes())?;
        writer.write_all(&self.index_crc.to_le_bytes())?;
        writer.write_all(&[0u8; 8])?;
        Ok(())
    }

    /// Read header from a reader
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;

        if magic != MAGIC_NUMBER {
            return Err(RouterError::InvalidMagic);
        }

        let version_major = read_u16(&mut reader)?;
        let version_minor = read_u16(&mut reader)?;
        let flags = read_u32(&mut reader)?;
        let index_offset = read_u64(&mut reader)?;
        let index_size = read_u64(&mut reader)?;
        let entry_count = read_u32(&mut reader)?;
        let index_crc = read_u32(&mut reader)?;

        let mut reserved = [0u8; 8];
        reader.read_exact(&mut reserved)?;

        Ok(Self {
            version_major,
            version_minor,
            flags,
            index_offset,
            index_size,
            entry_count,
            index_crc,
        })
    }

    /// Validate version compatibility
    pub fn validate_version(&self) -> Result<()> {
        if self.version_major > FORMAT_VERSION_MAJOR {
            return Err(RouterError::UnsupportedVersion(
                self.version_major << 8 | self.version_minor,
            ));
        }
        Ok(())
    }
}

impl Default for ImageHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Index entry metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Normalized image path, no leading or trailing slash
    pub path: String,
    pub kind: EntryKind,
    /// Permission bits
    pub mode: u32,
    pub data_offset: u64,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub crc32: u32,
    pub modified_time: u64,
    pub compression: CompressionMethod,
}

impl IndexEntry {
    /// Write entry to the index, returning the number of bytes written
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        let path_bytes = self.path.as_bytes();
        if path_bytes.len() > MAX_PATH_LENGTH {
            return Err(RouterError::PathError(format!(
                "Path too long: {} bytes (max {})",
                path_bytes.len(),
                MAX_PATH_LENGTH
            )));
        }

        writer.write_all(&ENTRY_SIGNATURE)?;
        writer.write_all(&[self.kind as u8])?;
        writer.write_all(&[self.compression as u8])?;
        writer.write_all(&self.mode.to_le_bytes())?;
        writer.write_all(&self.data_offset.to_le_bytes())?;
        writer.write_all(&self.uncompressed_size.to_le_bytes())?;
        writer.write_all(&self.compressed_size.to_le_bytes())?;
        writer.write_all(&self.crc32.to_le_bytes())?;
        writer.write_all(&self.modified_time.to_le_bytes())?;
        writer.write_all(&(path_bytes.len() as u16).to_le_bytes())?;
        writer.write_all(path_bytes)?;

        Ok(ENTRY_FIXED_SIZE + path_bytes.len())
    }

    /// Read entry from the index
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut sig = [0u8; 4];
        reader.read_exact(&mut sig)?;
        if sig != ENTRY_SIGNATURE {
            return Err(RouterError::InvalidFormat(
                "Invalid index entry signature".to_string(),
            ));
        }

        let mut kind_and_compression = [0u8; 2];
        reader.read_exact(&mut kind_and_compression)?;
        let kind = EntryKind::from_u8(kind_and_compression[0])?;
        let compression = CompressionMethod::from_u8(kind_and_compression[1])?;

        let mode = read_u32(&mut reader)?;
        let data_offset = read_u64(&mut reader)?;
        let uncompressed_size = read_u64(&mut reader)?;
        let compressed_size = read_u64(&mut reader)?;
        let crc32 = read_u32(&mut reader)?;
        let modified_time = read_u64(&mut reader)?;

        let path_len = read_u16(&mut reader)? as usize;
        if path_len > MAX_PATH_LENGTH {
            return Err(RouterError::PathError(format!(
                "Path too long: {} bytes (max {})",
                path_len, MAX_PATH_LENGTH
            )));
        }

        let mut path_buf = vec![0u8; path_len];
        reader.read_exact(&mut path_buf)?;
        let path = String::from_utf8(path_buf)
            .map_err(|e| RouterError::PathError(format!("Invalid UTF-8 in path: {}", e)))?;

        Ok(Self {
            path,
            kind,
            mode,
            data_offset,
            uncompressed_size,
            compressed_size,
            crc32,
            modified_time,
            compression,
        })
    }
}

// Helper functions for reading primitive types
fn read_u16<R: Read>(mut reader: R) -> Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(mut reader: R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(mut reader: R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
