//! Daily attendance row for the optional reporting sink.
//!
//! One row per (worker, local date). Field names match the list columns.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::fmt::Display;

use crate::types::{Availability, PresenceSnapshot, SessionSnapshot, SessionState, UserIdentity};

const DATE_FORMAT: &str = "%d/%m/%Y";
const STAMP_FORMAT: &str = "%d/%m/%y, %H:%M:%S";
const PENDING: &str = "⌛";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReportRow {
    pub date: String,
    pub employee_name: String,
    pub team_name: String,
    pub clock_in: String,
    pub clock_out: String,
    pub breaks: String,
    pub state: String,
    pub availability: String,
    pub last_updated: String,
}

fn state_icon(state: SessionState) -> &'static str {
    match state {
        SessionState::ClockedIn => "✅",
        SessionState::ClockedOut => "❌",
        SessionState::OnBreak => "⏸️",
        SessionState::Unknown => "❓",
    }
}

fn availability_icon(availability: Availability) -> &'static str {
    match availability {
        Availability::Available => "🟢",
        Availability::Busy | Availability::BusyIdle => "🔴",
        Availability::Away | Availability::BeRightBack | Availability::AvailableIdle => "🟡",
        Availability::DoNotDisturb => "⛔",
        Availability::Offline => "⚪",
        Availability::PresenceUnknown => "❓",
    }
}

/// Builds today's row. Returns `None` when the card was clocked in on another day.
pub fn build_report_row<Tz>(
    username: &str,
    identity: &UserIdentity,
    snapshot: &SessionSnapshot,
    presence: Option<&PresenceSnapshot>,
    last_updated: DateTime<Utc>,
    now: DateTime<Utc>,
    tz: &Tz,
) -> Option<ReportRow>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let today = now.with_timezone(tz).format(DATE_FORMAT).to_string();
    if let Some(clock_in) = snapshot.clock_in {
        if clock_in.with_timezone(tz).format(DATE_FORMAT).to_string() != today {
            return None;
        }
    }

    let stamp = |at: Option<DateTime<Utc>>| {
        at.map(|at| at.with_timezone(tz).format(STAMP_FORMAT).to_string())
            .unwrap_or_else(|| PENDING.to_string())
    };

    let breaks = snapshot
        .breaks
        .iter()
        .map(|interval| {
            format!(
                "Start: {} ➜ End: {}",
                stamp(Some(interval.start)),
                stamp(interval.end)
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let state = snapshot.effective_state().unwrap_or(snapshot.state);
    let availability = presence
        .map(|presence| presence.availability)
        .unwrap_or_default();

    Some(ReportRow {
        date: today,
        employee_name: username.to_string(),
        team_name: identity.team_name.clone(),
        clock_in: stamp(snapshot.clock_in),
        clock_out: stamp(snapshot.clock_out),
        breaks,
        state: format!("{}{}", state_icon(state), state),
        availability: format!("{}{}", availability_icon(availability), availability),
        last_updated: stamp(Some(last_updated)),
    })
}
