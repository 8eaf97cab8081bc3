//! Virtual working directory store

use crate::classify::PathClassifier;
use crate::error::{Result, RouterError};
use std::sync::{PoisonError, RwLock};

/// Process-wide virtual working directory
///
/// Either empty (the host's working directory applies) or an absolute
/// virtual path ending in exactly one separator.
#[derive(Debug)]
pub struct VirtualCwd {
    value: RwLock<String>,
    max_len: usize,
    windows_forms: bool,
}

impl VirtualCwd {
    pub fn new(max_len: usize, windows_forms: bool) -> Self {
        Self {
            value: RwLock::new(String::new()),
            max_len,
            windows_forms,
        }
    }

    /// Whether a virtual directory is active
    pub fn is_set(&self) -> bool {
        !self.value.read().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    /// The stored value, trailing separator included
    pub fn get(&self) -> Option<String> {
        let value = self.value.read().unwrap_or_else(PoisonError::into_inner);
        (!value.is_empty()).then(|| value.clone())
    }

    /// The stored value as `getcwd` reports it, without the trailing separator
    pub fn display(&self) -> Option<String> {
        self.get().map(|mut value| {
            value.pop();
            value
        })
    }

    /// Copy the reported value into `buf` as a NUL-terminated string
    ///
    /// Returns `Ok(None)` when no virtual directory is active. A value that
    /// does not fit is silently truncated to `buf.len() - 1` bytes.
    pub fn copy_into(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        if buf.is_empty() {
            return Err(RouterError::InvalidArgument(
                "getcwd buffer has zero capacity".to_string(),
            ));
        }

        let Some(value) = self.display() else {
            return Ok(None);
        };

        let len = value.len().min(buf.len() - 1);
        buf[..len].copy_from_slice(&value.as_bytes()[..len]);
        buf[len] = 0;
        Ok(Some(len))
    }

    /// Replace the stored value with `path`, normalized to one trailing separator
    ///
    /// Paths longer than the configured limit are rejected and leave the
    /// current value in place.
    pub fn set(&self, path: &str) -> Result<()> {
        let trimmed =
            path.trim_end_matches(|c: char| c == '/' || (self.windows_forms && c == '\\'));
        let len = trimmed.len() + 1;
        if len > self.max_len {
            return Err(RouterError::NameTooLong(len));
        }

        let mut normalized = String::new();
        normalized.try_reserve_exact(len)?;
        normalized.push_str(trimmed);
        normalized.push('/');

        *self.value.write().unwrap_or_else(PoisonError::into_inner) = normalized;
        Ok(())
    }

    /// Revert to the host's working directory
    pub fn clear(&self) {
        self.value
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Expand a relative path against the stored value
    ///
    /// Returns `Ok(None)` when no virtual directory is active.
    pub fn resolve(&self, classifier: &PathClassifier, relative: &str) -> Result<Option<String>> {
        let value = self.value.read().unwrap_or_else(PoisonError::into_inner);
        if value.is_empty() {
            return Ok(None);
        }
        classifier.expand(&value, relative).map(Some)
    }
}
