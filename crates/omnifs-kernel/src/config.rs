//! omnifs configuration.
//!
//! Loaded from a RON file at `$OMNIFS_CONFIG`, or
//! `~/.config/omnifs/config.ron`. Every field has a default, so a missing
//! file or a partial one is fine:
//!
//! ```ron
//! (
//!     transfer: (buffer_size: 131072, progress_interval_ms: 1000),
//!     ftp: (mode: Active, encoding: "ISO-8859-1"),
//!     dav: (propagate_last_modified: false),
//! )
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "OMNIFS_CONFIG";

/// Error type for config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("RON parse error in {path}: {source}")]
    Ron {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size for manual copies.
    pub buffer_size: usize,
    /// Default minimum interval between progress callbacks.
    pub progress_interval_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            progress_interval_ms: 200,
        }
    }
}

impl TransferConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Capacity of path to native-id caches.
    pub id_capacity: usize,
    /// Capacity of one-shot caches holding rows from the latest listings.
    pub listing_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            id_capacity: 1024,
            listing_capacity: 512,
        }
    }
}

/// FTP data connection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FtpMode {
    #[default]
    Passive,
    Active,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FtpConfig {
    /// Mode used when the URI has no `mode` parameter.
    pub mode: FtpMode,
    /// Control-channel encoding used when the URI has no `encoding`
    /// parameter.
    pub encoding: String,
    pub connect_timeout_secs: u64,
    /// Idle sessions kept per server.
    pub max_idle_sessions: usize,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            mode: FtpMode::Passive,
            encoding: "UTF-8".to_string(),
            connect_timeout_secs: 30,
            max_idle_sessions: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DavConfig {
    /// Send PROPPATCH for last-modified times. Many servers reject or
    /// ignore it, so it is off unless asked for.
    pub propagate_last_modified: bool,
    pub timeout_secs: u64,
}

impl Default for DavConfig {
    fn default() -> Self {
        Self {
            propagate_last_modified: false,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Directory for spooled copies of non-local archives. System temp dir
    /// when unset.
    pub spool_dir: Option<PathBuf>,
    /// Passwords tried for every encrypted archive.
    pub passwords: Vec<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OmnifsConfig {
    pub transfer: TransferConfig,
    pub cache: CacheConfig,
    pub ftp: FtpConfig,
    pub dav: DavConfig,
    pub archive: ArchiveConfig,
}

impl OmnifsConfig {
    /// Default config file path (~/.config/omnifs/config.ron).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("omnifs").join("config.ron"))
    }

    pub fn from_ron(text: &str, path: &Path) -> Result<Self, ConfigError> {
        ron::from_str(text).map_err(|source| ConfigError::Ron {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ron(&text, path)
    }

    /// Load from `$OMNIFS_CONFIG` or the default path. A missing file at
    /// the default path yields the defaults; a missing file named by the
    /// environment variable is an error.
    pub fn load() -> Result<Self, ConfigError> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load_from(Path::new(&path));
        }
        let Some(path) = Self::default_path() else {
            tracing::debug!("no config directory available, using defaults");
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = OmnifsConfig::from_ron(
            "(ftp: (mode: Active), dav: (propagate_last_modified: true))",
            Path::new("test.ron"),
        )
        .unwrap();
        assert_eq!(config.ftp.mode, FtpMode::Active);
        assert_eq!(config.ftp.encoding, "UTF-8");
        assert!(config.dav.propagate_last_modified);
        assert_eq!(config.transfer, TransferConfig::default());
    }

    #[test]
    fn test_empty_config() {
        let config = OmnifsConfig::from_ron("()", Path::new("test.ron")).unwrap();
        assert_eq!(config, OmnifsConfig::default());
        assert!(!config.dav.propagate_last_modified);
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = OmnifsConfig::from_ron("(ftp: 12", Path::new("bad.ron")).unwrap_err();
        assert!(err.to_string().contains("bad.ron"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ron");
        std::fs::write(&path, "(transfer: (buffer_size: 4096))").unwrap();
        let config = OmnifsConfig::load_from(&path).unwrap();
        assert_eq!(config.transfer.buffer_size, 4096);
        assert_eq!(config.transfer.progress_interval_ms, 200);

        let missing = OmnifsConfig::load_from(&dir.path().join("nope.ron"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
