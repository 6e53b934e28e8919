//! Notification messages sent to the worker and the team owners.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::fmt::{Display, Write};

use crate::types::{SessionSnapshot, UserIdentity};

const LOCAL_TIME_FORMAT: &str = "%d/%m/%Y, %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    Html(String),
}

impl MessageBody {
    pub fn content(&self) -> &str {
        match self {
            MessageBody::Text(content) | MessageBody::Html(content) => content,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub subject: String,
    pub body: MessageBody,
}

/// Formats a duration as `"1 hrs 5 mins 3 secs"`, leaving out zero parts.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    let (hours, mins, secs) = (total / 3600, (total % 3600) / 60, total % 60);

    let parts: Vec<String> = [(hours, "hrs"), (mins, "mins"), (secs, "secs")]
        .into_iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{value} {unit}"))
        .collect();

    if parts.is_empty() {
        "0 secs".to_string()
    } else {
        parts.join(" ")
    }
}

fn local<Tz>(at: DateTime<Utc>, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    at.with_timezone(tz).format(LOCAL_TIME_FORMAT).to_string()
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn clock_in_notification<Tz>(
    username: &str,
    identity: &UserIdentity,
    clock_in: DateTime<Utc>,
    tz: &Tz,
) -> Notification
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let html = format!(
        r#"<html>
  <body style="font-family: Arial, sans-serif; color: #333;">
    <div style="border: 2px solid #4CAF50; border-radius: 10px; padding: 20px; max-width: 500px;">
      <div style="font-size: 1.2em; font-weight: bold; color: #4CAF50; margin-bottom: 15px;">Clock-in Notification</div>
      <div>User: <b>{name} ({email})</b></div>
      <div>Team: <b>{team}</b></div>
      <div>Clocked in at: <b>{time}</b></div>
    </div>
  </body>
</html>
"#,
        name = escape(username),
        email = escape(&identity.email),
        team = escape(&identity.team_name),
        time = local(clock_in, tz),
    );

    Notification {
        subject: "Clock in Update".to_string(),
        body: MessageBody::Html(html),
    }
}

/// End-of-shift summary. Missing timestamps render as `-` instead of failing.
pub fn clock_out_summary<Tz>(
    username: &str,
    identity: &UserIdentity,
    snapshot: &SessionSnapshot,
    tz: &Tz,
) -> Notification
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let stamp = |at: Option<DateTime<Utc>>| {
        at.map(|at| local(at, tz))
            .unwrap_or_else(|| "-".to_string())
    };
    let span = |duration: Option<Duration>| {
        duration
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string())
    };

    let mut html = String::new();
    let _ = write!(
        html,
        r#"<html>
  <body style="font-family: Arial, sans-serif; color: #333;">
    <h2>Timecard Summary for {name}</h2>
    <p><strong>User:</strong> {name} ({email})</p>
    <p><strong>Team:</strong> {team}</p>
    <table border="1" cellpadding="10" cellspacing="0" style="border-collapse: collapse; width: 100%; max-width: 650px;">
      <tr style="background-color: #f2f2f2;"><th>Clock-In Time</th><th>Clock-Out Time</th><th>Active Duration</th><th>Total Duration</th></tr>
      <tr><td>{clock_in}</td><td>{clock_out}</td><td>{active}</td><td>{total}</td></tr>
    </table>
"#,
        name = escape(username),
        email = escape(&identity.email),
        team = escape(&identity.team_name),
        clock_in = stamp(snapshot.clock_in),
        clock_out = stamp(snapshot.clock_out),
        active = span(snapshot.active_duration()),
        total = span(snapshot.total_duration()),
    );

    if !snapshot.breaks.is_empty() {
        html.push_str(
            r#"    <h3>Break Details</h3>
    <table border="1" cellpadding="10" cellspacing="0" style="border-collapse: collapse; width: 100%; max-width: 650px;">
      <tr style="background-color: #f2f2f2;"><th>Break</th><th>Start Time</th><th>End Time</th><th>Duration</th></tr>
"#,
        );
        for (index, interval) in snapshot.breaks.iter().enumerate() {
            let _ = writeln!(
                html,
                "      <tr><td>Break {}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                index + 1,
                local(interval.start, tz),
                stamp(interval.end),
                span(interval.duration()),
            );
        }
        html.push_str("    </table>\n");
    }

    html.push_str(
        r#"    <i style="font-size: 12px; color: #777;">This is an automated email from the timeclock agent.</i>
  </body>
</html>
"#,
    );

    Notification {
        subject: "Clock out Update".to_string(),
        body: MessageBody::Html(html),
    }
}
