//! Runtime settings for detection and batch reads.
//!
//! Settings come from an optional TOML file; the unrecognized-file log path
//! can additionally be overridden through `SCANTREE_UNRECOGNIZED_LOG`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Environment variable overriding [`Settings::unrecognized_log`].
pub const UNRECOGNIZED_LOG_ENV: &str = "SCANTREE_UNRECOGNIZED_LOG";

/// Default location of the unrecognized-file log.
pub const DEFAULT_UNRECOGNIZED_LOG: &str = "/tmp/unrecognized_files.txt";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read settings file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Append-only log receiving one line per unresolved mimetype.
    pub unrecognized_log: PathBuf,

    /// Bytes read from the head of a file by the content probes.
    pub sniff_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            unrecognized_log: PathBuf::from(DEFAULT_UNRECOGNIZED_LOG),
            sniff_bytes: 64 * 1024,
        }
    }
}

impl Settings {
    /// Parse settings from TOML text; missing keys keep their defaults.
    pub fn from_toml_str(text: &str, origin: &str) -> Result<Self, SettingsError> {
        toml::from_str(text).map_err(|source| SettingsError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text, &path.display().to_string())
    }

    /// Load from `path` when given, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let settings = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        Ok(settings.with_env_overrides(std::env::var_os(UNRECOGNIZED_LOG_ENV)))
    }

    fn with_env_overrides(mut self, log_path: Option<std::ffi::OsString>) -> Self {
        if let Some(p) = log_path.filter(|p| !p.is_empty()) {
            self.unrecognized_log = PathBuf::from(p);
        }
        self
    }
}
