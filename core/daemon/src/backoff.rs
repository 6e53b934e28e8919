use chrono::{DateTime, Utc};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::cmp;
use std::path::PathBuf;
use std::time::Duration as StdDuration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use timeclock_core::RestartConfig;

#[derive(Debug, Default, Serialize, Deserialize)]
struct BackoffState {
    starts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackoffSnapshot {
    pub recent_starts: usize,
    pub window_secs: i64,
    pub last_delay_secs: Option<u64>,
}

/// Delays generation starts that come in quick succession.
///
/// Start times are persisted, so a crash loop across process restarts is
/// throttled the same way as in-process relaunches.
pub struct RelaunchBackoff {
    path: Option<PathBuf>,
    policy: RestartConfig,
    last_delay_secs: std::sync::Mutex<Option<u64>>,
}

impl RelaunchBackoff {
    pub fn new(path: Option<PathBuf>, policy: RestartConfig) -> Self {
        Self {
            path,
            policy,
            last_delay_secs: std::sync::Mutex::new(None),
        }
    }

    /// Records this start and sleeps when the window is over budget.
    /// Returns early if `shutdown` fires.
    pub async fn before_start(&self, shutdown: &CancellationToken) {
        let now = Utc::now();
        let mut state = self.load().unwrap_or_else(|err| {
            warn!(error = %err, "Ignoring unreadable relaunch backoff state");
            BackoffState::default()
        });
        let backoff_secs = compute_backoff(now, &mut state, &self.policy);

        if let Err(err) = self.save(&state) {
            warn!(error = %err, "Failed to persist relaunch backoff state");
        }
        if let Ok(mut last) = self.last_delay_secs.lock() {
            *last = backoff_secs;
        }

        if let Some(secs) = backoff_secs {
            warn!(
                count = state.starts.len(),
                backoff_secs = secs,
                "Relaunch backoff engaged"
            );
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(StdDuration::from_secs(secs)) => {}
            }
        }
    }

    pub fn snapshot(&self) -> BackoffSnapshot {
        let now = Utc::now();
        let recent_starts = self
            .load()
            .map(|state| {
                state
                    .starts
                    .iter()
                    .filter(|value| within_window(value, now, self.policy.window_secs))
                    .count()
            })
            .unwrap_or(0);
        BackoffSnapshot {
            recent_starts,
            window_secs: self.policy.window_secs,
            last_delay_secs: self.last_delay_secs.lock().ok().and_then(|last| *last),
        }
    }

    fn load(&self) -> Result<BackoffState, String> {
        let Some(path) = self.path.as_ref() else {
            return Ok(BackoffState::default());
        };
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BackoffState::default())
            }
            Err(err) => return Err(format!("Failed to read backoff state: {}", err)),
        };

        serde_json::from_slice(&data)
            .map_err(|err| format!("Failed to parse backoff state: {}", err))
    }

    fn save(&self, state: &BackoffState) -> Result<(), String> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| format!("Failed to create backoff dir: {}", err))?;
        }

        let payload = serde_json::to_vec_pretty(state)
            .map_err(|err| format!("Failed to serialize backoff state: {}", err))?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, payload)
            .map_err(|err| format!("Failed to write backoff state: {}", err))?;
        fs::rename(&tmp_path, path)
            .map_err(|err| format!("Failed to commit backoff state: {}", err))?;
        Ok(())
    }
}

fn compute_backoff(
    now: DateTime<Utc>,
    state: &mut BackoffState,
    policy: &RestartConfig,
) -> Option<u64> {
    state
        .starts
        .retain(|value| within_window(value, now, policy.window_secs));

    state.starts.push(now.to_rfc3339());

    if state.starts.len() <= policy.max_starts {
        return None;
    }

    let extra = state.starts.len().saturating_sub(policy.max_starts) as u64;
    let backoff = policy.step_secs.saturating_mul(extra);
    Some(cmp::min(backoff, policy.max_secs))
}

fn within_window(value: &str, now: DateTime<Utc>, window_secs: i64) -> bool {
    parse_timestamp(value)
        .map(|timestamp| now.signed_duration_since(timestamp).num_seconds() <= window_secs)
        .unwrap_or(false)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
