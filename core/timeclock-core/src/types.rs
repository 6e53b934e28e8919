//! Domain types shared by the daemon and its clients.
//!
//! `SessionSnapshot` mirrors the remote time card. The remote service owns it;
//! the daemon only keeps a read-through copy in the state store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SnapshotAnomaly;

/// Identity of the single worker this agent manages.
///
/// Written once by `Configure`; immutable until the worker is reconfigured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub team_id: String,
    pub email: String,
    pub team_name: String,
}

/// Attendance state of a time card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    #[default]
    ClockedOut,
    ClockedIn,
    OnBreak,
    #[serde(other)]
    Unknown,
}

impl SessionState {
    /// `Unknown` is treated as clocked out for every decision.
    pub fn is_clocked_out(self) -> bool {
        matches!(self, SessionState::ClockedOut | SessionState::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::ClockedOut => "clockedOut",
            SessionState::ClockedIn => "clockedIn",
            SessionState::OnBreak => "onBreak",
            SessionState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A break inside a session. `end` is `None` while the break is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakInterval {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl BreakInterval {
    pub fn closed(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            id: None,
            start,
            end: Some(end),
        }
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Length of a closed break. Open breaks have no duration yet.
    pub fn duration(&self) -> Option<Duration> {
        self.end.map(|end| end.signed_duration_since(self.start))
    }
}

/// Read-through copy of the remote time card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub state: SessionState,
    #[serde(default)]
    pub clock_in: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clock_out: Option<DateTime<Utc>>,
    #[serde(default)]
    pub breaks: Vec<BreakInterval>,
}

impl SessionSnapshot {
    /// The currently running break, if the break sequence is well formed.
    pub fn open_break(&self) -> Option<&BreakInterval> {
        self.breaks.last().filter(|interval| interval.is_open())
    }

    /// State derived from the break sequence.
    ///
    /// `OnBreak` holds iff the last break has no end. A reported `OnBreak` with no
    /// open break reads as `ClockedIn`; more than one open break, or an open break
    /// that is not last, is an anomaly the caller must not act on.
    pub fn effective_state(&self) -> Result<SessionState, SnapshotAnomaly> {
        let open: Vec<usize> = self
            .breaks
            .iter()
            .enumerate()
            .filter(|(_, interval)| interval.is_open())
            .map(|(index, _)| index)
            .collect();

        match open.as_slice() {
            [] if self.state == SessionState::OnBreak => Ok(SessionState::ClockedIn),
            [] => Ok(self.state),
            [index] if *index + 1 == self.breaks.len() => Ok(SessionState::OnBreak),
            [index] => Err(SnapshotAnomaly::OpenBreakNotLast { index: *index }),
            many => Err(SnapshotAnomaly::MultipleOpenBreaks { count: many.len() }),
        }
    }

    pub fn has_break(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.breaks
            .iter()
            .any(|interval| interval.start == start && interval.end == Some(end))
    }

    /// Appends a closed break unless the exact (start, end) pair is already present.
    /// Returns whether the break was appended.
    pub fn append_break(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        if self.has_break(start, end) {
            return false;
        }
        self.breaks.push(BreakInterval::closed(start, end));
        true
    }

    /// Sum of all closed breaks.
    pub fn total_break(&self) -> Duration {
        self.breaks
            .iter()
            .filter_map(BreakInterval::duration)
            .fold(Duration::zero(), |total, duration| total + duration)
    }

    /// Clock-in to clock-out, when both are known.
    pub fn total_duration(&self) -> Option<Duration> {
        match (self.clock_in, self.clock_out) {
            (Some(start), Some(end)) => Some(end.signed_duration_since(start)),
            _ => None,
        }
    }

    /// Total duration minus closed breaks, never negative.
    pub fn active_duration(&self) -> Option<Duration> {
        self.total_duration()
            .map(|total| (total - self.total_break()).max(Duration::zero()))
    }
}

/// Remote availability reported by the collaboration service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Availability {
    Available,
    AvailableIdle,
    Away,
    BeRightBack,
    Busy,
    BusyIdle,
    DoNotDisturb,
    Offline,
    #[default]
    #[serde(other)]
    PresenceUnknown,
}

impl Availability {
    pub fn as_str(self) -> &'static str {
        match self {
            Availability::Available => "Available",
            Availability::AvailableIdle => "AvailableIdle",
            Availability::Away => "Away",
            Availability::BeRightBack => "BeRightBack",
            Availability::Busy => "Busy",
            Availability::BusyIdle => "BusyIdle",
            Availability::DoNotDisturb => "DoNotDisturb",
            Availability::Offline => "Offline",
            Availability::PresenceUnknown => "PresenceUnknown",
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presence as last refreshed by the presence chain.
///
/// `availability` is informational only; `worker_active` is the local signal
/// the state machine consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub availability: Availability,
    #[serde(default)]
    pub activity: Option<String>,
    pub worker_active: bool,
    pub observed_at: DateTime<Utc>,
}

/// Suspend timestamp recorded while clocked in; consumed once on resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakStartMarker {
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, min, 0).unwrap()
    }

    fn snapshot(state: SessionState, breaks: Vec<BreakInterval>) -> SessionSnapshot {
        SessionSnapshot {
            id: "card-1".to_string(),
            state,
            clock_in: Some(at(9, 0)),
            clock_out: None,
            breaks,
        }
    }

    #[test]
    fn open_last_break_means_on_break() {
        let card = snapshot(
            SessionState::ClockedIn,
            vec![
                BreakInterval::closed(at(10, 0), at(10, 15)),
                BreakInterval {
                    id: None,
                    start: at(12, 0),
                    end: None,
                },
            ],
        );
        assert_eq!(card.effective_state(), Ok(SessionState::OnBreak));
        assert_eq!(card.open_break().map(|b| b.start), Some(at(12, 0)));
    }

    #[test]
    fn reported_break_without_open_interval_reads_clocked_in() {
        let card = snapshot(
            SessionState::OnBreak,
            vec![BreakInterval::closed(at(10, 0), at(10, 15))],
        );
        assert_eq!(card.effective_state(), Ok(SessionState::ClockedIn));
        assert!(card.open_break().is_none());
    }

    #[test]
    fn two_open_breaks_are_an_anomaly() {
        let open = |hour| BreakInterval {
            id: None,
            start: at(hour, 0),
            end: None,
        };
        let card = snapshot(SessionState::OnBreak, vec![open(10), open(11)]);
        assert_eq!(
            card.effective_state(),
            Err(SnapshotAnomaly::MultipleOpenBreaks { count: 2 })
        );
    }

    #[test]
    fn open_break_in_the_middle_is_an_anomaly() {
        let card = snapshot(
            SessionState::ClockedIn,
            vec![
                BreakInterval {
                    id: None,
                    start: at(10, 0),
                    end: None,
                },
                BreakInterval::closed(at(11, 0), at(11, 5)),
            ],
        );
        assert_eq!(
            card.effective_state(),
            Err(SnapshotAnomaly::OpenBreakNotLast { index: 0 })
        );
    }

    #[test]
    fn append_break_rejects_identical_pair() {
        let mut card = snapshot(SessionState::ClockedIn, Vec::new());
        assert!(card.append_break(at(13, 0), at(13, 40)));
        assert!(!card.append_break(at(13, 0), at(13, 40)));
        assert!(card.append_break(at(13, 0), at(13, 41)));
        assert_eq!(card.breaks.len(), 2);
    }

    #[test]
    fn active_duration_subtracts_closed_breaks() {
        let mut card = snapshot(
            SessionState::ClockedOut,
            vec![
                BreakInterval::closed(at(10, 0), at(10, 15)),
                BreakInterval::closed(at(12, 0), at(12, 45)),
            ],
        );
        card.clock_out = Some(at(17, 0));
        assert_eq!(card.total_duration(), Some(Duration::hours(8)));
        assert_eq!(card.active_duration(), Some(Duration::hours(7)));
    }

    #[test]
    fn unknown_state_strings_deserialize_as_unknown() {
        let state: SessionState = serde_json::from_str("\"unknownFutureValue\"").unwrap();
        assert_eq!(state, SessionState::Unknown);
        assert!(state.is_clocked_out());
    }

    #[test]
    fn unknown_availability_deserializes_as_presence_unknown() {
        let availability: Availability = serde_json::from_str("\"OutOfOffice\"").unwrap();
        assert_eq!(availability, Availability::PresenceUnknown);
    }
}
