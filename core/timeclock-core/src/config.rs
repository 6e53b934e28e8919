//! Runtime configuration loaded from `config.toml`.
//!
//! Every section is optional; a missing file yields defaults. Graph credentials
//! may also come from `TIMECLOCK_TENANT_ID`, `TIMECLOCK_CLIENT_ID` and
//! `TIMECLOCK_CLIENT_SECRET`, which take precedence over the file.

use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TimeclockError};

const TENANT_ENV: &str = "TIMECLOCK_TENANT_ID";
const CLIENT_ID_ENV: &str = "TIMECLOCK_CLIENT_ID";
const CLIENT_SECRET_ENV: &str = "TIMECLOCK_CLIENT_SECRET";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeclockConfig {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub power: PowerConfig,
    #[serde(default)]
    pub restart: RestartConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub presence_interval_secs: u64,
    pub idle_threshold_secs: u64,
    pub default_reminder_minutes: u32,
    /// Minimum wall-clock gap between ticks that reads as an unreported sleep.
    pub sleep_gap_secs: u64,
    /// Activity reports older than this are ignored.
    pub activity_stale_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 7,
            presence_interval_secs: 60,
            idle_threshold_secs: 300,
            default_reminder_minutes: 15,
            sleep_gap_secs: 120,
            activity_stale_secs: 120,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn presence_interval(&self) -> Duration {
        Duration::from_secs(self.presence_interval_secs)
    }

    /// Gap after which a tick assumes the machine slept in between.
    pub fn sleep_gap(&self) -> chrono::Duration {
        let floor = self.interval_secs.saturating_mul(3);
        chrono::Duration::seconds(self.sleep_gap_secs.max(floor) as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Process names of the collaboration client, matched case-insensitively.
    pub process_names: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            process_names: vec![
                "teams.exe".to_string(),
                "ms-teams.exe".to_string(),
                "ms-teams".to_string(),
                "teams".to_string(),
                "microsoft teams".to_string(),
                "teams-for-linux".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub base_url: String,
    pub login_url: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub request_timeout_secs: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.microsoft.com".to_string(),
            login_url: "https://login.microsoftonline.com".to_string(),
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            request_timeout_secs: 30,
        }
    }
}

impl GraphConfig {
    pub fn has_credentials(&self) -> bool {
        !self.tenant_id.is_empty() && !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub reachability_addr: String,
    pub reachability_retry_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            reachability_addr: "graph.microsoft.com:443".to_string(),
            reachability_retry_secs: 5,
        }
    }
}

impl RecoveryConfig {
    pub fn reachability_retry(&self) -> Duration {
        Duration::from_secs(self.reachability_retry_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub enabled: bool,
    /// Site holding the list; the tenant root site when empty.
    pub site_id: String,
    pub list_name: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            site_id: String::new(),
            list_name: "Timesheet".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Command kept running while the hold is acquired, e.g.
    /// `["systemd-inhibit", "--what=idle", "sleep", "infinity"]`. Empty disables the hold.
    pub inhibit_command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub window_secs: i64,
    pub max_starts: usize,
    pub step_secs: u64,
    pub max_secs: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            window_secs: 120,
            max_starts: 3,
            step_secs: 10,
            max_secs: 60,
        }
    }
}

/// Loads the configuration, falling back to defaults when the file is missing.
pub fn load_config(path: &Path) -> Result<TimeclockConfig> {
    let mut config = if path.exists() {
        let content = fs_err::read_to_string(path).map_err(|source| TimeclockError::Io {
            context: format!("reading {}", path.display()),
            source,
        })?;
        toml::from_str::<TimeclockConfig>(&content).map_err(|err| {
            TimeclockError::ConfigMalformed {
                path: path.to_path_buf(),
                details: err.to_string(),
            }
        })?
    } else {
        TimeclockConfig::default()
    };

    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

impl TimeclockConfig {
    fn apply_env_overrides(&mut self) {
        let read = |key: &str| env::var(key).ok().filter(|value| !value.trim().is_empty());
        if let Some(value) = read(TENANT_ENV) {
            self.graph.tenant_id = value;
        }
        if let Some(value) = read(CLIENT_ID_ENV) {
            self.graph.client_id = value;
        }
        if let Some(value) = read(CLIENT_SECRET_ENV) {
            self.graph.client_secret = value;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("sync.interval_secs", self.sync.interval_secs),
            ("sync.presence_interval_secs", self.sync.presence_interval_secs),
            ("sync.activity_stale_secs", self.sync.activity_stale_secs),
            ("recovery.reachability_retry_secs", self.recovery.reachability_retry_secs),
            ("graph.request_timeout_secs", self.graph.request_timeout_secs),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(TimeclockError::ConfigInvalid(format!("{name} must be positive")));
        }
        if self.sync.default_reminder_minutes == 0 {
            return Err(TimeclockError::ConfigInvalid(
                "sync.default_reminder_minutes must be at least 1".to_string(),
            ));
        }
        if self.client.process_names.is_empty() {
            return Err(TimeclockError::ConfigInvalid(
                "client.process_names must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
