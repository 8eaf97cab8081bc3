use std::io;
use thiserror::Error;

/// Result type for packfs operations
pub type Result<T> = std::result::Result<T, RouterError>;

/// Unified error type for routing, image and configuration failures
#[derive(Debug, Error)]
pub enum RouterError {
    // Routing errors
    #[error("No such entry: {0}")]
    NotFound(String),

    #[error("Entry already exists: {0}")]
    AlreadyExists(String),

    #[error("Out of memory while building path")]
    OutOfMemory,

    #[error("Path is outside the mount scope: {0}")]
    ScopeViolation(String),

    #[error("Path too long: {0} bytes")]
    NameTooLong(usize),

    #[error("Bad descriptor: {0}")]
    BadDescriptor(i32),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Too many levels of symbolic links: {0}")]
    TooManyLinks(String),

    #[error("No router installed")]
    NotInstalled,

    // Image errors
    #[error("Invalid image format: {0}")]
    InvalidFormat(String),

    #[error("Invalid magic number in image header")]
    InvalidMagic,

    #[error("Unsupported image version: {0}")]
    UnsupportedVersion(u16),

    #[error("Invalid compression method: {0}")]
    InvalidCompression(u8),

    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("CRC mismatch: expected {expected:08x}, got {actual:08x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Path error: {0}")]
    PathError(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("TOML error: {0}")]
    TomlError(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    // Backend failures are passed through unchanged
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RouterError {
    /// The errno value a POSIX caller observes for this error
    pub fn errno(&self) -> i32 {
        match self {
            RouterError::NotFound(_) | RouterError::ScopeViolation(_) => libc::ENOENT,
            RouterError::AlreadyExists(_) => libc::EEXIST,
            RouterError::OutOfMemory => libc::ENOMEM,
            RouterError::NameTooLong(_) => libc::ENAMETOOLONG,
            RouterError::BadDescriptor(_) => libc::EBADF,
            RouterError::NotADirectory(_) => libc::ENOTDIR,
            RouterError::IsADirectory(_) => libc::EISDIR,
            RouterError::InvalidArgument(_) => libc::EINVAL,
            RouterError::TooManyLinks(_) => libc::ELOOP,
            RouterError::NotInstalled => libc::ENXIO,
            RouterError::Config(_) | RouterError::TomlError(_) | RouterError::JsonError(_) => {
                libc::EINVAL
            }
            RouterError::Io(err) => err.raw_os_error().unwrap_or_else(|| kind_errno(err.kind())),
            RouterError::InvalidFormat(_)
            | RouterError::InvalidMagic
            | RouterError::UnsupportedVersion(_)
            | RouterError::InvalidCompression(_)
            | RouterError::CompressionFailed(_)
            | RouterError::DecompressionFailed(_)
            | RouterError::CrcMismatch { .. }
            | RouterError::PathError(_) => libc::EIO,
        }
    }

    /// True for the "no such entry" family
    pub fn is_not_found(&self) -> bool {
        self.errno() == libc::ENOENT
    }
}

fn kind_errno(kind: io::ErrorKind) -> i32 {
    match kind {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::UnexpectedEof => libc::EIO,
        io::ErrorKind::OutOfMemory => libc::ENOMEM,
        io::ErrorKind::Unsupported => libc::ENOSYS,
        _ => libc::EIO,
    }
}

impl From<RouterError> for io::Error {
    fn from(err: RouterError) -> io::Error {
        match err {
            RouterError::Io(inner) => inner,
            other => io::Error::from_raw_os_error(other.errno()),
        }
    }
}

impl From<toml::de::Error> for RouterError {
    fn from(err: toml::de::Error) -> Self {
        RouterError::TomlError(err.to_string())
    }
}

impl From<std::collections::TryReserveError> for RouterError {
    fn from(_: std::collections::TryReserveError) -> Self {
        RouterError::OutOfMemory
    }
}
