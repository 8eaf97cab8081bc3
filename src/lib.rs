//! packfs: a virtual filesystem overlay router
//!
//! Routes filesystem calls between three stores that share one namespace:
//! - a read-only packed image mounted under a marker segment such as
//!   `/__packfs__`
//! - a writable shadow overlay created on the first write into that
//!   namespace
//! - the real filesystem, for every other path
//!
//! Relative paths follow a virtual working directory, so code that changes
//! into a packed directory keeps working without the host knowing about it.
//! Descriptors and directory streams handed out by the image are recognized
//! on later calls and dispatched back to it.
//!
//! # Example
//!
//! ```no_run
//! use packfs::{ImageWriter, OpenOptions, Router, RouterConfig};
//!
//! // Pack a tree
//! let mut writer = ImageWriter::create("app.pkf")?;
//! writer.add_file("lib/index.js", b"console.log('hi')")?;
//! writer.finalize()?;
//!
//! // Serve it
//! let router = Router::with_image(RouterConfig::default(), "app.pkf")?;
//! router.chdir("/__packfs__/lib")?;
//! let fd = router.open("index.js", &OpenOptions::read_only())?;
//! let mut buf = [0u8; 64];
//! let n = router.read(fd, &mut buf)?;
//! router.close(fd)?;
//! # let _ = n;
//! # Ok::<(), packfs::RouterError>(())
//! ```

// Routing core
pub mod classify;
pub mod config;
pub mod cwd;
pub mod error;
pub mod router;
pub mod shadow;

mod dirstream;
mod dispatch;
mod extract;

// Collaborators and surfaces
pub mod backend;
pub mod image;
pub mod posix;

pub use backend::{
    ArchiveBackend, DirEntry, DirHandle, FileKind, FileStat, HostBackend, LibraryHandle,
    OpenOptions, StdHost,
};
pub use classify::{PathClass, PathClassifier};
pub use config::{RouterConfig, DEFAULT_MAX_PATH_LEN, DEFAULT_MOUNT_MARKER};
pub use dirstream::{alphasort, CompareFn, SelectFn};
pub use error::{Result, RouterError};
pub use image::{CompressionMethod, ImageFs, ImageReader, ImageWriter, VFD_BASE};
pub use router::Router;
