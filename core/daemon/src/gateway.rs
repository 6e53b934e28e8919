//! Boundaries to the collaboration service.
//!
//! The sync loop only sees these traits. `graph::GraphClient` implements all
//! three against Microsoft Graph; tests use scripted fakes.

use async_trait::async_trait;
use thiserror::Error;
use timeclock_core::{Availability, Notification, ReportRow, SessionSnapshot, UserIdentity};

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Connection reset, refused, timed out, or a 5xx/429 from the service.
    #[error("transient network failure: {0}")]
    Transient(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("gateway is not configured: {0}")]
    NotConfigured(String),
}

impl GatewayError {
    /// Failures the restart policy treats as connectivity loss.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Transient(_) => true,
            GatewayError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePresence {
    pub availability: Availability,
    pub activity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryUser {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Team {
    pub id: String,
    pub display_name: String,
}

#[async_trait]
pub trait SessionGateway: Send + Sync {
    /// Latest time card of the worker in the team, if any exists.
    async fn fetch_latest(&self, identity: &UserIdentity) -> GatewayResult<Option<SessionSnapshot>>;

    /// Opens a new card and returns it.
    async fn clock_in(&self, identity: &UserIdentity) -> GatewayResult<SessionSnapshot>;

    async fn clock_out(&self, identity: &UserIdentity, session_id: &str) -> GatewayResult<()>;

    async fn start_break(&self, identity: &UserIdentity, session_id: &str) -> GatewayResult<()>;

    async fn end_break(&self, identity: &UserIdentity, session_id: &str) -> GatewayResult<()>;

    /// Replaces the card's fields (used to append reconciled breaks).
    async fn update_session(
        &self,
        identity: &UserIdentity,
        snapshot: &SessionSnapshot,
    ) -> GatewayResult<()>;

    async fn fetch_presence(&self, identity: &UserIdentity) -> GatewayResult<RemotePresence>;
}

#[async_trait]
pub trait DirectoryGateway: Send + Sync {
    async fn resolve_user(&self, email: &str) -> GatewayResult<DirectoryUser>;

    async fn joined_teams(&self, user_id: &str) -> GatewayResult<Vec<Team>>;

    /// Mail addresses of the team owners.
    async fn list_owners(&self, team_id: &str) -> GatewayResult<Vec<String>>;

    /// Sends from the sender's mailbox.
    async fn send_mail(
        &self,
        sender_id: &str,
        to: &[String],
        cc: &[String],
        notification: &Notification,
    ) -> GatewayResult<()>;
}

#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Creates or patches the row keyed by (employee, date).
    async fn upsert_day(&self, row: &ReportRow) -> GatewayResult<()>;
}
