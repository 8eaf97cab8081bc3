//! Packed read-only image format
//!
//! ```text
//! +------------------+
//! | header (48)      |  magic, version, index location, index CRC
//! +------------------+
//! | member payloads  |  stored, LZ4 or Zstd, one per file or link
//! +------------------+
//! | index            |  one variable-length record per entry
//! +------------------+
//! ```
//!
//! [`ImageWriter`] builds images, [`ImageReader`] decodes them and
//! [`ImageFs`] serves a decoded image as an archive backend.

mod format;
mod fs;
mod reader;
mod writer;

pub use format::{
    CompressionMethod, EntryKind, ImageHeader, IndexEntry, ENTRY_FIXED_SIZE, ENTRY_SIGNATURE,
    FORMAT_VERSION_MAJOR, FORMAT_VERSION_MINOR, HEADER_SIZE, MAGIC_NUMBER, MAX_PATH_LENGTH,
};
pub use fs::{ImageFs, MAX_SYMLINK_HOPS, VFD_BASE};
pub use reader::ImageReader;
pub use writer::{normalize_path, ImageWriter, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
