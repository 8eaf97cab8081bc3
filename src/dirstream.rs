//! Directory stream dispatch
//!
//! Opening a stream routes by path like any other path call. Every later
//! call routes by handle: the archive is asked whether the handle is one of
//! its open streams, and the host gets everything else.

use crate::backend::{DirEntry, DirHandle};
use crate::error::Result;
use crate::router::{Router, Target};
use std::cmp::Ordering;
use std::os::unix::io::RawFd;
use tracing::trace;

/// Entry filter for [`Router::scandir`]
pub type SelectFn<'a> = &'a dyn Fn(&DirEntry) -> bool;

/// Entry ordering for [`Router::scandir`]
pub type CompareFn<'a> = &'a dyn Fn(&DirEntry, &DirEntry) -> Ordering;

impl Router {
    fn is_archive_dir(&self, dir: DirHandle) -> bool {
        let owned = self.archive.owns_dir(dir);
        trace!(handle = dir.0, archive = owned, "dispatching directory stream");
        owned
    }

    pub fn opendir(&self, path: &str) -> Result<DirHandle> {
        match self.target(path)? {
            Target::Archive(vpath) => self.archive.opendir(&vpath),
            Target::Host(real) => Ok(self.host.opendir(&real)?),
        }
    }

    /// Next entry, or `None` at the end of the stream
    pub fn readdir(&self, dir: DirHandle) -> Result<Option<DirEntry>> {
        if self.is_archive_dir(dir) {
            self.archive.readdir(dir)
        } else {
            Ok(self.host.readdir(dir)?)
        }
    }

    pub fn telldir(&self, dir: DirHandle) -> Result<i64> {
        if self.is_archive_dir(dir) {
            self.archive.telldir(dir)
        } else {
            Ok(self.host.telldir(dir)?)
        }
    }

    pub fn seekdir(&self, dir: DirHandle, loc: i64) -> Result<()> {
        if self.is_archive_dir(dir) {
            self.archive.seekdir(dir, loc)
        } else {
            Ok(self.host.seekdir(dir, loc)?)
        }
    }

    pub fn rewinddir(&self, dir: DirHandle) -> Result<()> {
        if self.is_archive_dir(dir) {
            self.archive.rewinddir(dir)
        } else {
            Ok(self.host.rewinddir(dir)?)
        }
    }

    pub fn dirfd(&self, dir: DirHandle) -> Result<RawFd> {
        if self.is_archive_dir(dir) {
            self.archive.dirfd(dir)
        } else {
            Ok(self.host.dirfd(dir)?)
        }
    }

    pub fn closedir(&self, dir: DirHandle) -> Result<()> {
        if self.is_archive_dir(dir) {
            self.archive.closedir(dir)
        } else {
            Ok(self.host.closedir(dir)?)
        }
    }

    /// List a directory in one call
    ///
    /// Entries rejected by `select` are dropped, and the rest are sorted
    /// with `compare` when one is given. Both apply the same way whichever
    /// backend serves the directory.
    pub fn scandir(
        &self,
        path: &str,
        select: Option<SelectFn<'_>>,
        compare: Option<CompareFn<'_>>,
    ) -> Result<Vec<DirEntry>> {
        let mut entries = match self.target(path)? {
            Target::Archive(vpath) => self.archive.scandir(&vpath)?,
            Target::Host(real) => self.host.scandir(&real)?,
        };

        if let Some(select) = select {
            entries.retain(|entry| select(entry));
        }
        if let Some(compare) = compare {
            entries.sort_by(|a, b| compare(a, b));
        }
        Ok(entries)
    }
}

/// Ordering by entry name, the usual `alphasort`
pub fn alphasort(a: &DirEntry, b: &DirEntry) -> Ordering {
    a.name.cmp(&b.name)
}
