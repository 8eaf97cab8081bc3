//! Member extraction and library loading

use crate::backend::LibraryHandle;
use crate::error::Result;
use crate::router::{Route, Router};
use std::path::PathBuf;
use tracing::debug;

impl Router {
    /// A real path holding the contents of `path`
    ///
    /// Real paths come back unchanged. Virtual paths the shadow overlay holds
    /// map to their overlay copy; anything else is extracted from the
    /// archive, named after `name_hint` when one is given.
    pub fn extract(&self, path: &str, name_hint: Option<&str>) -> Result<PathBuf> {
        let vpath = match self.route(path)? {
            Route::Real => return Ok(PathBuf::from(path)),
            Route::Virtual(vpath) => vpath,
        };

        if let Some(mapped) = self.shadow.lookup(&vpath, self.host.as_ref()) {
            return Ok(PathBuf::from(mapped));
        }
        self.archive.extract(&vpath, name_hint)
    }

    /// Load a shared library, extracting it first when it is packed
    pub fn dlopen(&self, path: &str, flags: i32) -> Result<LibraryHandle> {
        let real = self.extract(path, None)?;
        debug!(path, real = %real.display(), "loading library");
        Ok(self.host.dlopen(&real, flags)?)
    }
}
