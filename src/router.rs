//! Path routing between the image, the shadow overlay and the host
//!
//! Every path call is resolved once: relative paths are expanded against the
//! virtual working directory when one is set, then the classifier decides
//! whether the path is virtual. A virtual path is served by the shadow
//! overlay when the overlay already holds it and by the archive otherwise.
//! Real paths pass to the host untouched.

use crate::backend::{ArchiveBackend, FileStat, HostBackend, OpenOptions, StdHost};
use crate::classify::PathClassifier;
use crate::config::RouterConfig;
use crate::cwd::VirtualCwd;
use crate::error::{Result, RouterError};
use crate::image::ImageFs;
use crate::shadow::ShadowOverlay;
use std::borrow::Cow;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Namespace of a resolved path
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    /// Full virtual path, relative input already expanded
    Virtual(String),
    Real,
}

/// Backend chosen to serve a path
#[derive(Debug)]
pub(crate) enum Target<'a> {
    /// Virtual path to hand to the archive
    Archive(String),
    /// Host path: the caller's own, or its shadow overlay mapping
    Host(Cow<'a, str>),
}

/// Filesystem call router
///
/// Owns the virtual working directory and the shadow overlay, and shares
/// the two backends.
pub struct Router {
    config: RouterConfig,
    pub(crate) classifier: PathClassifier,
    pub(crate) cwd: VirtualCwd,
    pub(crate) shadow: ShadowOverlay,
    pub(crate) archive: Arc<dyn ArchiveBackend>,
    pub(crate) host: Arc<dyn HostBackend>,
}

impl Router {
    pub fn new(
        config: RouterConfig,
        archive: Arc<dyn ArchiveBackend>,
        host: Arc<dyn HostBackend>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            classifier: PathClassifier::new(&config),
            cwd: VirtualCwd::new(config.max_path_len, config.windows_forms),
            shadow: ShadowOverlay::new(&config),
            archive,
            host,
            config,
        })
    }

    /// Serve a packed image under the configured marker, with the real host
    pub fn with_image<P: AsRef<Path>>(config: RouterConfig, image: P) -> Result<Self> {
        config.validate()?;
        let archive = ImageFs::open(image, &config)?;
        Self::new(config, Arc::new(archive), Arc::new(StdHost::new()))
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn classifier(&self) -> &PathClassifier {
        &self.classifier
    }

    /// Root of the shadow overlay, once something has been written to it
    pub fn shadow_root(&self) -> Option<&str> {
        self.shadow.root()
    }

    /// Remove the shadow overlay for good
    ///
    /// Runs automatically when the router is dropped. The installed global
    /// router is never dropped and calls it from an exit hook instead.
    pub(crate) fn cleanup(&self) {
        self.shadow.cleanup();
    }

    pub(crate) fn route(&self, path: &str) -> Result<Route> {
        if path.is_empty() {
            return Ok(Route::Real);
        }

        if self.classifier.is_relative(path) {
            return Ok(match self.cwd.resolve(&self.classifier, path)? {
                Some(expanded) => Route::Virtual(expanded),
                None => Route::Real,
            });
        }

        if !self.classifier.is_virtual(path) {
            return Ok(Route::Real);
        }
        if path.len() > self.classifier.max_path_len() {
            return Err(RouterError::NameTooLong(path.len()));
        }
        Ok(Route::Virtual(path.to_string()))
    }

    pub(crate) fn target<'a>(&self, path: &'a str) -> Result<Target<'a>> {
        let target = match self.route(path)? {
            Route::Real => Target::Host(Cow::Borrowed(path)),
            Route::Virtual(vpath) => match self.shadow.lookup(&vpath, self.host.as_ref()) {
                Some(mapped) => Target::Host(Cow::Owned(mapped)),
                None => Target::Archive(vpath),
            },
        };
        debug!(path, ?target, "routed path");
        Ok(target)
    }

    /// Whether `path` resolves into the virtual namespace
    pub fn is_virtual(&self, path: &str) -> bool {
        matches!(self.route(path), Ok(Route::Virtual(_)))
    }

    /// The virtual path a call on `path` would use, if any
    pub fn resolve_virtual(&self, path: &str) -> Result<Option<String>> {
        Ok(match self.route(path)? {
            Route::Virtual(vpath) => Some(vpath),
            Route::Real => None,
        })
    }

    pub fn stat(&self, path: &str) -> Result<FileStat> {
        match self.target(path)? {
            Target::Archive(vpath) => self.archive.stat(&vpath),
            Target::Host(real) => Ok(self.host.stat(&real)?),
        }
    }

    pub fn lstat(&self, path: &str) -> Result<FileStat> {
        match self.target(path)? {
            Target::Archive(vpath) => self.archive.lstat(&vpath),
            Target::Host(real) => Ok(self.host.lstat(&real)?),
        }
    }

    pub fn readlink(&self, path: &str) -> Result<PathBuf> {
        match self.target(path)? {
            Target::Archive(vpath) => self.archive.readlink(&vpath).map(PathBuf::from),
            Target::Host(real) => Ok(self.host.readlink(&real)?),
        }
    }

    /// Permission check; archive members only need to exist
    pub fn access(&self, path: &str, mode: i32) -> Result<()> {
        match self.target(path)? {
            Target::Archive(vpath) => self.archive.stat(&vpath).map(|_| ()),
            Target::Host(real) => Ok(self.host.access(&real, mode)?),
        }
    }

    /// Open a file
    ///
    /// With `O_CREAT` a virtual path is always opened in the shadow overlay,
    /// which must already exist.
    pub fn open(&self, path: &str, options: &OpenOptions) -> Result<RawFd> {
        options.validate()?;

        if options.creates() {
            return match self.route(path)? {
                Route::Real => Ok(self.host.open(path, options)?),
                Route::Virtual(vpath) => {
                    if self.shadow.root().is_none() {
                        return Err(RouterError::NotFound(vpath));
                    }
                    let mapped = self
                        .shadow
                        .map(&vpath)
                        .ok_or(RouterError::ScopeViolation(vpath))?;
                    debug!(shadow = %mapped, "creating in shadow");
                    Ok(self.host.open(&mapped, options)?)
                }
            };
        }

        match self.target(path)? {
            Target::Archive(vpath) => self.archive.open(&vpath),
            Target::Host(real) => Ok(self.host.open(&real, options)?),
        }
    }

    /// Create a directory
    ///
    /// Virtual directories that the archive already holds fail with
    /// `AlreadyExists`; anything else is created in the shadow overlay.
    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        match self.route(path)? {
            Route::Real => Ok(self.host.mkdir(path, mode)?),
            Route::Virtual(vpath) => {
                if self.archive.stat(&vpath).is_ok() {
                    return Err(RouterError::AlreadyExists(vpath));
                }
                self.shadow.consult_and_create_dir(
                    &vpath,
                    mode,
                    self.archive.as_ref(),
                    self.host.as_ref(),
                )
            }
        }
    }

    /// Change the working directory
    ///
    /// Entering a virtual directory only updates the virtual working
    /// directory, unless the shadow overlay holds it, in which case the host
    /// changes directory too. Entering a real directory clears it.
    pub fn chdir(&self, path: &str) -> Result<()> {
        match self.route(path)? {
            Route::Real => {
                self.host.chdir(path)?;
                self.cwd.clear();
            }
            Route::Virtual(vpath) => {
                if let Some(mapped) = self.shadow.lookup(&vpath, self.host.as_ref()) {
                    self.host.chdir(&mapped)?;
                } else if !self.archive.stat(&vpath)?.is_dir() {
                    return Err(RouterError::NotFound(vpath));
                }
                self.cwd.set(&vpath)?;
                debug!(cwd = %vpath, "entered virtual directory");
            }
        }
        Ok(())
    }

    /// The working directory: the virtual one when set, the host's otherwise
    pub fn current_dir(&self) -> Result<PathBuf> {
        match self.cwd.display() {
            Some(virtual_dir) => Ok(PathBuf::from(virtual_dir)),
            None => Ok(self.host.getcwd()?),
        }
    }

    /// Copy the working directory into `buf`, NUL-terminated
    ///
    /// A virtual directory that does not fit is truncated. A host directory
    /// that does not fit fails with ERANGE.
    pub fn getcwd_into(&self, buf: &mut [u8]) -> Result<usize> {
        if let Some(len) = self.cwd.copy_into(buf)? {
            return Ok(len);
        }

        let real = self.host.getcwd()?;
        let bytes = real.as_os_str().as_bytes();
        if bytes.len() >= buf.len() {
            return Err(RouterError::Io(std::io::Error::from_raw_os_error(libc::ERANGE)));
        }
        buf[..bytes.len()].copy_from_slice(bytes);
        buf[bytes.len()] = 0;
        Ok(bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageWriter;
    use std::os::unix::fs::MetadataExt;
    use tempfile::{NamedTempFile, TempDir};

    struct Fixture {
        _scratch: TempDir,
        _image: NamedTempFile,
        router: Router,
    }

    fn fixture() -> Result<Fixture> {
        let scratch = TempDir::new()?;
        let image = NamedTempFile::new()?;
        {
            let mut writer = ImageWriter::create(image.path())?;
            writer.add_file("a/b/c.txt", b"archived")?;
            writer.add_symlink("a/link", "b/c.txt")?;
            writer.finalize()?;
        }
        let config = RouterConfig::default()
            .with_mount_marker("/__scope__")
            .with_temp_root(scratch.path());
        let router = Router::with_image(config, image.path())?;
        Ok(Fixture {
            _scratch: scratch,
            _image: image,
            router,
        })
    }

    #[test]
    fn test_route_classification() -> Result<()> {
        let f = fixture()?;
        assert_eq!(
            f.router.route("/__scope__/a")?,
            Route::Virtual("/__scope__/a".to_string())
        );
        assert_eq!(f.router.route("/usr/lib")?, Route::Real);
        assert_eq!(f.router.route("rel")?, Route::Real);
        assert_eq!(f.router.route("")?, Route::Real);

        f.router.cwd.set("/__scope__/a")?;
        assert_eq!(
            f.router.route("b/../b")?,
            Route::Virtual("/__scope__/a/b/../b".to_string())
        );
        assert_eq!(f.router.route("")?, Route::Real);
        Ok(())
    }

    #[test]
    fn test_overlong_virtual_path() -> Result<()> {
        let f = fixture()?;
        let long = format!("/__scope__/{}", "x".repeat(5000));
        assert!(matches!(
            f.router.stat(&long),
            Err(RouterError::NameTooLong(_))
        ));
        Ok(())
    }

    #[test]
    fn test_stat_and_readlink_from_archive() -> Result<()> {
        let f = fixture()?;
        assert!(f.router.stat("/__scope__/a/b")?.is_dir());
        assert!(f.router.lstat("/__scope__/a/link")?.is_symlink());
        assert_eq!(
            f.router.readlink("/__scope__/a/link")?,
            PathBuf::from("b/c.txt")
        );
        assert!(f.router.access("/__scope__/a/b/c.txt", libc::R_OK).is_ok());
        assert!(f.router.stat("/__scope__/nope").unwrap_err().is_not_found());
        Ok(())
    }

    #[test]
    fn test_mkdir_existing_archive_dir() -> Result<()> {
        let f = fixture()?;
        let err = f.router.mkdir("/__scope__/a/b", 0o755).unwrap_err();
        assert!(matches!(err, RouterError::AlreadyExists(_)));
        assert_eq!(err.errno(), libc::EEXIST);

        // the bare marker names the image root
        for path in ["/__scope__", "/__scope__/", "/__scope__/a/.."] {
            let err = f.router.mkdir(path, 0o755).unwrap_err();
            assert!(matches!(err, RouterError::AlreadyExists(_)), "{}", path);
        }
        assert_eq!(f.router.shadow_root(), None);
        Ok(())
    }

    #[test]
    fn test_shadow_takes_over_after_mkdir() -> Result<()> {
        let f = fixture()?;
        f.router.mkdir("/__scope__/a/b/d", 0o755)?;

        let root = f.router.shadow_root().unwrap().to_string();
        assert!(Path::new(&format!("{}/a/b/d", root)).is_dir());

        // Paths the overlay holds come from the host, the rest from the image
        let shadow_dir = f.router.stat("/__scope__/a/b")?;
        assert_eq!(shadow_dir.ino, std::fs::metadata(format!("{}/a/b", root))?.ino());
        assert!(f.router.stat("/__scope__/a/b/c.txt")?.is_file());
        assert!(f.router.stat("/__scope__/a/b/d")?.is_dir());
        Ok(())
    }

    #[test]
    fn test_create_requires_shadow_root() -> Result<()> {
        let f = fixture()?;
        let options = OpenOptions::create(libc::O_WRONLY, 0o644);
        assert!(f
            .router
            .open("/__scope__/new.txt", &options)
            .unwrap_err()
            .is_not_found());

        f.router.mkdir("/__scope__/out", 0o755)?;
        let fd = f.router.open("/__scope__/out/new.txt", &options)?;
        assert!(!f.router.archive.is_descriptor(fd));
        f.router.close(fd)?;
        assert!(f.router.stat("/__scope__/out/new.txt")?.is_file());

        assert!(matches!(
            f.router.open(
                "/__scope__/x",
                &OpenOptions::new(libc::O_WRONLY | libc::O_CREAT)
            ),
            Err(RouterError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_virtual_chdir_into_file_fails() -> Result<()> {
        let f = fixture()?;
        assert!(f.router.chdir("/__scope__/a/b/c.txt").unwrap_err().is_not_found());
        assert!(f.router.chdir("/__scope__/missing").unwrap_err().is_not_found());
        assert!(!f.router.cwd.is_set());
        Ok(())
    }

    #[test]
    fn test_shadow_removed_on_drop() -> Result<()> {
        let f = fixture()?;
        f.router.mkdir("/__scope__/tmp", 0o700)?;
        let root = f.router.shadow_root().unwrap().to_string();
        assert!(Path::new(&root).is_dir());

        drop(f.router);
        assert!(!Path::new(&root).exists());
        Ok(())
    }
}
