//! Writable shadow overlay
//!
//! Writes aimed at the read-only image land in a real directory created on
//! first use. A virtual path `/<marker>/x/y` maps to `<root>/x/y`.

use crate::backend::{ArchiveBackend, HostBackend};
use crate::classify::PathClassifier;
use crate::config::RouterConfig;
use crate::error::{Result, RouterError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use tempfile::TempDir;
use tracing::{debug, info, warn};

pub struct ShadowOverlay {
    classifier: PathClassifier,
    prefix: String,
    temp_root: PathBuf,
    root: OnceLock<String>,
    dir: Mutex<Option<TempDir>>,
    closed: AtomicBool,
}

impl ShadowOverlay {
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            classifier: PathClassifier::new(config),
            prefix: config.shadow_prefix.clone(),
            temp_root: config.temp_root(),
            root: OnceLock::new(),
            dir: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// The overlay root, if it has been created and not yet removed
    pub fn root(&self) -> Option<&str> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        self.root.get().map(String::as_str)
    }

    /// Create the overlay root on first use
    ///
    /// Creation happens at most once; a failed attempt leaves the root
    /// absent so that a later call can retry.
    pub fn ensure_root(&self) -> Result<&str> {
        if let Some(root) = self.root() {
            return Ok(root);
        }

        let mut slot = self.dir.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::Acquire) {
            return Err(RouterError::NotFound(self.temp_root.display().to_string()));
        }
        if let Some(root) = self.root() {
            return Ok(root);
        }

        let dir = tempfile::Builder::new()
            .prefix(&self.prefix)
            .tempdir_in(&self.temp_root)
            .map_err(|e| {
                warn!(error = %e, "failed to create shadow root");
                RouterError::NotFound(self.temp_root.display().to_string())
            })?;
        let path = dir
            .path()
            .to_str()
            .ok_or_else(|| RouterError::PathError("Shadow root is not UTF-8".to_string()))?
            .to_string();

        info!(root = %path, "created shadow root");
        *slot = Some(dir);
        Ok(self.root.get_or_init(|| path).as_str())
    }

    /// Host path shadowing `vpath`, if the root exists
    ///
    /// `None` when the marker is not followed by a separator. `..` never
    /// climbs above the root, matching how the archive resolves it.
    pub fn map(&self, vpath: &str) -> Option<String> {
        let root = self.root()?;
        let rest = self.classifier.strip_scope(vpath)?;
        if !rest.starts_with(|c: char| self.classifier.is_separator(c)) {
            return None;
        }
        let mut mapped = root.to_string();
        for part in self.components(rest) {
            mapped.push('/');
            mapped.push_str(part);
        }
        Some(mapped)
    }

    /// Components below the marker with `.` dropped and `..` clamped at the root
    fn components<'a>(&self, rest: &'a str) -> Vec<&'a str> {
        let mut parts = Vec::new();
        for part in rest.split(|c: char| self.classifier.is_separator(c)) {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                _ => parts.push(part),
            }
        }
        parts
    }

    /// The shadow path serving `vpath`, when the host already holds it
    pub fn lookup(&self, vpath: &str, host: &dyn HostBackend) -> Option<String> {
        let mapped = self.map(vpath)?;
        match host.stat(&mapped) {
            Ok(_) => {
                debug!(path = vpath, shadow = %mapped, "served from shadow");
                Some(mapped)
            }
            Err(_) => None,
        }
    }

    /// Create the directory `path` in the overlay
    ///
    /// Every leading component that the archive reports as a directory is
    /// mirrored first, ignoring failures. Mirroring stops at the first
    /// component the archive does not hold as a directory; the final
    /// directory is then created directly.
    pub fn consult_and_create_dir(
        &self,
        path: &str,
        mode: u32,
        archive: &dyn ArchiveBackend,
        host: &dyn HostBackend,
    ) -> Result<()> {
        let trimmed = path.trim_end_matches(|c: char| self.classifier.is_separator(c));
        let rest = self
            .classifier
            .strip_scope(trimmed)
            .filter(|rest| rest.starts_with(|c: char| self.classifier.is_separator(c)))
            .ok_or_else(|| RouterError::ScopeViolation(path.to_string()))?;
        let scope = &trimmed[..trimmed.len() - rest.len()];
        let parts = self.components(rest);
        let (_, parents) = parts
            .split_last()
            .ok_or_else(|| RouterError::ScopeViolation(path.to_string()))?;

        let root = self.ensure_root()?;

        let mut vprefix = scope.to_string();
        let mut mirror = root.to_string();
        for part in parents {
            vprefix.push('/');
            vprefix.push_str(part);
            mirror.push('/');
            mirror.push_str(part);
            match archive.stat(&vprefix) {
                Ok(stat) if stat.is_dir() => {
                    if let Err(e) = host.mkdir(&mirror, mode) {
                        debug!(path = %mirror, error = %e, "mirror directory not created");
                    }
                }
                _ => break,
            }
        }

        let target = format!("{}/{}", root, parts.join("/"));
        debug!(path, shadow = %target, "creating shadow directory");
        host.mkdir(&target, mode)?;
        Ok(())
    }

    /// Remove the overlay root and everything under it
    ///
    /// Terminal: the overlay is never recreated afterwards, and virtual
    /// writes fail with `NotFound`.
    pub(crate) fn cleanup(&self) {
        let taken = {
            let mut slot = self.dir.lock().unwrap_or_else(PoisonError::into_inner);
            self.closed.store(true, Ordering::Release);
            slot.take()
        };
        if let Some(dir) = taken {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(root = %path.display(), error = %e, "failed to remove shadow root");
            }
        }
    }
}

impl Drop for ShadowOverlay {
    fn drop(&mut self) {
        self.cleanup();
    }
}
