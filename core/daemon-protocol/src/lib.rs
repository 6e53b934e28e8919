//! IPC protocol types and validation for timeclock-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.
//!
//! Framing: one JSON request per connection, terminated by `\n`; one JSON
//! response back, terminated by `\n`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_REMINDER_MINUTES: u32 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    GetStatus,
    ListPrompts,
    AnswerPrompt,
    ReportActivity,
    PowerEvent,
    Configure,
    SyncNow,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: None,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Prompts
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKindWire {
    ClockIn,
    ClockOut,
    ReminderDelay,
}

/// A prompt waiting for the worker's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptView {
    pub id: u64,
    pub kind: PromptKindWire,
    pub opened_at: DateTime<Utc>,
}

/// `{"confirm": true}` answers clock-in/clock-out; `{"delay_minutes": 5}` (or
/// `null` to keep the previous delay) answers a reminder-delay prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum PromptAnswer {
    Confirm(bool),
    DelayMinutes(Option<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnswerPromptParams {
    pub id: u64,
    pub answer: PromptAnswer,
}

impl AnswerPromptParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if let PromptAnswer::DelayMinutes(Some(minutes)) = self.answer {
            if minutes == 0 || minutes > MAX_REMINDER_MINUTES {
                return Err(ErrorInfo::new(
                    "invalid_delay",
                    format!("reminder delay must be between 1 and {MAX_REMINDER_MINUTES} minutes"),
                ));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Signals from the OS integration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportActivityParams {
    /// Seconds since the last keyboard/mouse input.
    pub idle_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerEventKind {
    Suspend,
    Resume,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PowerEventParams {
    pub event: PowerEventKind,
}

// ─────────────────────────────────────────────────────────────────────────────
// Onboarding boundary
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigureParams {
    pub email: String,
    pub team_name: String,
}

impl ConfigureParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        let email = self.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(ErrorInfo::new(
                "invalid_email",
                "email must be a mailbox address",
            ));
        }
        if self.team_name.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_team", "team_name is required"));
        }
        Ok(())
    }
}

/// Parses the request params into `T`, rejecting a missing payload.
pub fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ErrorInfo> {
    let params = params.ok_or_else(|| ErrorInfo::new("invalid_params", "params are required"))?;
    serde_json::from_value(params)
        .map_err(|err| ErrorInfo::new("invalid_params", format!("params are invalid: {}", err)))
}

pub fn parse_answer(params: Option<Value>) -> Result<AnswerPromptParams, ErrorInfo> {
    let parsed: AnswerPromptParams = parse_params(params)?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn parse_configure(params: Option<Value>) -> Result<ConfigureParams, ErrorInfo> {
    let parsed: ConfigureParams = parse_params(params)?;
    parsed.validate()?;
    Ok(parsed)
}
