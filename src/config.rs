//! Router configuration
//!
//! Loaded from TOML or JSON. Every field has a default, so an empty document
//! yields a working configuration.

use crate::error::{Result, RouterError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default mount scope marker
pub const DEFAULT_MOUNT_MARKER: &str = "/__packfs__";

/// Default maximum length of a virtual path, in bytes
pub const DEFAULT_MAX_PATH_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Root segment of the virtual namespace, e.g. `/__packfs__`
    pub mount_marker: String,

    /// Longest virtual path the router accepts
    pub max_path_len: usize,

    /// Name prefix for the shadow overlay directory
    pub shadow_prefix: String,

    /// Name prefix for the extraction directory
    pub extract_prefix: String,

    /// Parent of the shadow and extraction directories (system temp dir if unset)
    pub temp_root: Option<PathBuf>,

    /// Recognize backslash separators, drive letters and `\\?\` long paths
    pub windows_forms: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mount_marker: DEFAULT_MOUNT_MARKER.to_string(),
            max_path_len: DEFAULT_MAX_PATH_LEN,
            shadow_prefix: ".packfs-shadow-".to_string(),
            extract_prefix: ".packfs-extract-".to_string(),
            temp_root: None,
            windows_forms: cfg!(windows),
        }
    }
}

impl RouterConfig {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; `.json` files are parsed as JSON, anything else as TOML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_toml_str(&text),
        }
    }

    /// Builder-style marker override
    pub fn with_mount_marker(mut self, marker: &str) -> Self {
        self.mount_marker = marker.to_string();
        self
    }

    /// Builder-style temp root override
    pub fn with_temp_root<P: AsRef<Path>>(mut self, root: P) -> Self {
        self.temp_root = Some(root.as_ref().to_path_buf());
        self
    }

    /// Check the marker shape and limits
    pub fn validate(&self) -> Result<()> {
        let marker = &self.mount_marker;
        if !marker.starts_with('/') {
            return Err(RouterError::Config(format!(
                "mount_marker must start with '/': {:?}",
                marker
            )));
        }

        let segment = &marker[1..];
        if segment.is_empty() || segment.contains(['/', '\\']) {
            return Err(RouterError::Config(format!(
                "mount_marker must be a single non-empty segment: {:?}",
                marker
            )));
        }

        if self.max_path_len <= marker.len() {
            return Err(RouterError::Config(format!(
                "max_path_len {} cannot hold the mount marker",
                self.max_path_len
            )));
        }

        if self.shadow_prefix.contains('/') || self.extract_prefix.contains('/') {
            return Err(RouterError::Config(
                "directory prefixes must not contain '/'".to_string(),
            ));
        }

        Ok(())
    }

    /// Directory under which temporary trees are created
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}
