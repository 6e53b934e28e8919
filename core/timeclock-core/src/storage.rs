//! Storage configuration and path management for the timeclock agent.
//!
//! All file paths the daemon and CLI touch are derived from a single root so
//! tests can point everything at a temp directory.
//!
//! ## Layout
//!
//! ```text
//! ~/.timeclock/
//!   config.toml             user configuration
//!   state.json              persisted key-value state document
//!   daemon.sock             IPC socket
//!   relaunch-backoff.json   recent generation starts
//!   logs/                   rolling daemon logs
//! ```

use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Result, TimeclockError};

/// Overrides the storage root when set.
pub const HOME_ENV: &str = "TIMECLOCK_HOME";

/// Central configuration for all timeclock storage paths.
///
/// Production code uses [`StorageConfig::resolve`], which honors `TIMECLOCK_HOME`
/// and falls back to `~/.timeclock`. Tests use [`StorageConfig::with_root`].
#[derive(Debug, Clone)]
pub struct StorageConfig {
    root: PathBuf,
}

impl StorageConfig {
    pub fn resolve() -> Result<Self> {
        if let Some(root) = env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
            return Ok(Self {
                root: PathBuf::from(root),
            });
        }
        let home = dirs::home_dir().ok_or(TimeclockError::HomeDirNotFound)?;
        Ok(Self {
            root: home.join(".timeclock"),
        })
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn socket_file(&self) -> PathBuf {
        self.root.join("daemon.sock")
    }

    pub fn backoff_file(&self) -> PathBuf {
        self.root.join("relaunch-backoff.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}
