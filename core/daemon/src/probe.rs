//! Local signals: is the collaboration client running, and is the worker at the keyboard.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use sysinfo::{ProcessRefreshKind, System};

pub trait ClientProbe: Send + Sync {
    fn is_running(&self) -> bool;
}

/// Scans the process table for any of the configured client names.
pub struct SysinfoClientProbe {
    names: Vec<String>,
    system: Mutex<System>,
}

impl SysinfoClientProbe {
    pub fn new(process_names: &[String]) -> Self {
        Self {
            names: process_names
                .iter()
                .map(|name| name.to_lowercase())
                .collect(),
            system: Mutex::new(System::new()),
        }
    }
}

impl ClientProbe for SysinfoClientProbe {
    fn is_running(&self) -> bool {
        let Ok(mut system) = self.system.lock() else {
            return false;
        };
        system.refresh_processes_specifics(ProcessRefreshKind::new());
        let running = system
            .processes()
            .values()
            .any(|process| matches_client(&self.names, process.name()));
        running
    }
}

fn matches_client(names: &[String], process_name: &str) -> bool {
    let process_name = process_name.to_lowercase();
    names.iter().any(|name| *name == process_name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActivitySample {
    pub idle_secs: u64,
    pub reported_at: DateTime<Utc>,
}

/// Latest idle report from the OS integration.
///
/// Idle time keeps growing between reports. Without a report, or once the
/// last one is older than `stale_after_secs`, the worker is treated as active,
/// so breaks are never automated without a live signal.
pub struct ActivityTracker {
    threshold_secs: u64,
    stale_after_secs: u64,
    latest: Mutex<Option<ActivitySample>>,
}

impl ActivityTracker {
    pub fn new(threshold_secs: u64, stale_after_secs: u64) -> Self {
        Self {
            threshold_secs,
            stale_after_secs,
            latest: Mutex::new(None),
        }
    }

    pub fn report(&self, idle_secs: u64, at: DateTime<Utc>) {
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(ActivitySample {
                idle_secs,
                reported_at: at,
            });
        }
    }

    pub fn latest(&self) -> Option<ActivitySample> {
        self.latest.lock().ok().and_then(|latest| *latest)
    }

    /// Extrapolated idle time, or `None` when no fresh report exists.
    pub fn idle_secs_at(&self, now: DateTime<Utc>) -> Option<u64> {
        let sample = self.latest()?;
        let elapsed = now
            .signed_duration_since(sample.reported_at)
            .num_seconds()
            .max(0) as u64;
        if elapsed > self.stale_after_secs {
            return None;
        }
        Some(sample.idle_secs.saturating_add(elapsed))
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.idle_secs_at(now)
            .map_or(true, |idle| idle < self.threshold_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn process_names_match_case_insensitively() {
        let names = vec!["ms-teams.exe".to_string(), "teams".to_string()];
        assert!(matches_client(&names, "MS-Teams.exe"));
        assert!(matches_client(&names, "Teams"));
        assert!(!matches_client(&names, "teamsupdater"));
    }

    #[test]
    fn no_report_means_active() {
        let tracker = ActivityTracker::new(300, 120);
        assert!(tracker.is_active(Utc::now()));
        assert_eq!(tracker.idle_secs_at(Utc::now()), None);
    }

    #[test]
    fn idle_time_grows_between_reports() {
        let tracker = ActivityTracker::new(300, 600);
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        tracker.report(100, at);

        assert!(tracker.is_active(at + Duration::seconds(199)));
        assert!(!tracker.is_active(at + Duration::seconds(200)));

        tracker.report(0, at + Duration::seconds(250));
        assert!(tracker.is_active(at + Duration::seconds(251)));
    }

    #[test]
    fn silent_reporter_falls_back_to_active() {
        let tracker = ActivityTracker::new(300, 120);
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        tracker.report(250, at);

        assert!(!tracker.is_active(at + Duration::seconds(60)));
        assert_eq!(tracker.idle_secs_at(at + Duration::seconds(120)), Some(370));

        assert_eq!(tracker.idle_secs_at(at + Duration::seconds(121)), None);
        assert!(tracker.is_active(at + Duration::seconds(3600)));
    }
}
