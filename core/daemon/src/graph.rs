//! Microsoft Graph implementation of the gateway traits.
//!
//! Time cards live under `beta/teams/{team}/schedule/timeCards` and are called
//! with `MS-APP-ACTS-AS` set to the worker, since the app authenticates with
//! client credentials. Directory, mail and list calls use `v1.0`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use timeclock_core::{
    Availability, BreakInterval, GraphConfig, MessageBody, Notification, ReportConfig, ReportRow,
    SessionSnapshot, SessionState, UserIdentity,
};

use crate::gateway::{
    DirectoryGateway, DirectoryUser, GatewayError, GatewayResult, RemotePresence, ReportSink,
    SessionGateway, Team,
};

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
const ACTS_AS_HEADER: &str = "MS-APP-ACTS-AS";
const TOKEN_REFRESH_SLACK_SECS: u64 = 60;

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Clone)]
struct ListTarget {
    site_id: String,
    list_id: String,
}

pub struct GraphClient {
    http: Client,
    base_url: String,
    login_url: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    report: ReportConfig,
    token: Mutex<Option<CachedToken>>,
    list_target: Mutex<Option<ListTarget>>,
}

impl GraphClient {
    pub fn new(graph: &GraphConfig, report: &ReportConfig) -> GatewayResult<Self> {
        let http = Client::builder()
            .timeout(graph.request_timeout())
            .build()
            .map_err(|err| GatewayError::NotConfigured(format!("http client: {}", err)))?;

        Ok(Self {
            http,
            base_url: graph.base_url.trim_end_matches('/').to_string(),
            login_url: graph.login_url.trim_end_matches('/').to_string(),
            tenant_id: graph.tenant_id.clone(),
            client_id: graph.client_id.clone(),
            client_secret: graph.client_secret.clone(),
            report: report.clone(),
            token: Mutex::new(None),
            list_target: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn time_cards_url(&self, identity: &UserIdentity) -> String {
        self.url(&format!(
            "beta/teams/{}/schedule/timeCards",
            identity.team_id
        ))
    }

    async fn access_token(&self) -> GatewayResult<String> {
        if self.tenant_id.is_empty() || self.client_id.is_empty() || self.client_secret.is_empty()
        {
            return Err(GatewayError::NotConfigured(
                "graph tenant_id, client_id and client_secret are required".to_string(),
            ));
        }

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        debug!("Requesting Graph access token");
        let url = format!("{}/{}/oauth2/v2.0/token", self.login_url, self.tenant_id);
        let response = self
            .http
            .post(url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("scope", GRAPH_SCOPE),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.is_server_error() {
                return Err(GatewayError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            return Err(GatewayError::Auth(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| GatewayError::Decode(format!("token response: {}", err)))?;
        let lifetime = token.expires_in.saturating_sub(TOKEN_REFRESH_SLACK_SECS);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        });
        Ok(token.access_token)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> GatewayResult<Response> {
        let token = self.access_token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(classify_transport)?;
        match check_status(response, what).await {
            Err(GatewayError::Auth(message)) => {
                // Force a fresh token on the next call.
                *self.token.lock().await = None;
                Err(GatewayError::Auth(message))
            }
            other => other,
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> GatewayResult<T> {
        let response = self.send(request, what).await?;
        response
            .json()
            .await
            .map_err(|err| GatewayError::Decode(format!("{}: {}", what, err)))
    }

    async fn card_action(
        &self,
        identity: &UserIdentity,
        session_id: &str,
        action: &str,
    ) -> GatewayResult<()> {
        let url = format!("{}/{}/{}", self.time_cards_url(identity), session_id, action);
        info!(action, session_id, "Calling time card action");
        let request = self
            .http
            .post(url)
            .header(ACTS_AS_HEADER, &identity.user_id)
            .json(&json!({}));
        self.send(request, action).await?;
        info!(action, session_id, "Time card action succeeded");
        Ok(())
    }

    async fn list_target(&self) -> GatewayResult<ListTarget> {
        let mut cached = self.list_target.lock().await;
        if let Some(target) = cached.as_ref() {
            return Ok(target.clone());
        }

        let site_id = if self.report.site_id.is_empty() {
            let site: IdOnly = self
                .send_json(
                    self.http
                        .get(self.url("v1.0/sites/root"))
                        .query(&[("$select", "id")]),
                    "root site",
                )
                .await?;
            site.id
        } else {
            self.report.site_id.clone()
        };

        let filter = format!("displayName eq {}", odata_literal(&self.report.list_name));
        let lists: Page<IdOnly> = self
            .send_json(
                self.http
                    .get(self.url(&format!("v1.0/sites/{}/lists", site_id)))
                    .query(&[("$filter", filter.as_str()), ("$select", "id")]),
                "report list",
            )
            .await?;
        let list_id = lists
            .value
            .into_iter()
            .next()
            .map(|list| list.id)
            .ok_or_else(|| GatewayError::NotFound(format!("list '{}'", self.report.list_name)))?;

        let target = ListTarget { site_id, list_id };
        *cached = Some(target.clone());
        Ok(target)
    }
}

#[async_trait]
impl SessionGateway for GraphClient {
    async fn fetch_latest(&self, identity: &UserIdentity) -> GatewayResult<Option<SessionSnapshot>> {
        let filter = format!("userId eq {}", odata_literal(&identity.user_id));
        let mut request = self
            .http
            .get(self.time_cards_url(identity))
            .query(&[("$filter", filter.as_str())]);

        let mut cards: Vec<WireTimeCard> = Vec::new();
        loop {
            let page: Page<WireTimeCard> = self
                .send_json(
                    request.header(ACTS_AS_HEADER, &identity.user_id),
                    "time cards",
                )
                .await?;
            cards.extend(page.value);
            match page.next_link {
                Some(next) => request = self.http.get(next),
                None => break,
            }
        }
        debug!(cards = cards.len(), "Fetched time cards");

        Ok(cards
            .into_iter()
            .rev()
            .find(|card| {
                card.user_id
                    .as_deref()
                    .map_or(true, |user_id| user_id == identity.user_id)
            })
            .map(WireTimeCard::into_snapshot))
    }

    async fn clock_in(&self, identity: &UserIdentity) -> GatewayResult<SessionSnapshot> {
        info!(user_id = %identity.user_id, "Attempting to clock in");
        let request = self
            .http
            .post(format!("{}/clockIn", self.time_cards_url(identity)))
            .header(ACTS_AS_HEADER, &identity.user_id)
            .json(&json!({}));
        let card: WireTimeCard = self.send_json(request, "clock in").await?;
        info!(session_id = %card.id, "Clocked in");
        Ok(card.into_snapshot())
    }

    async fn clock_out(&self, identity: &UserIdentity, session_id: &str) -> GatewayResult<()> {
        self.card_action(identity, session_id, "clockOut").await
    }

    async fn start_break(&self, identity: &UserIdentity, session_id: &str) -> GatewayResult<()> {
        self.card_action(identity, session_id, "startBreak").await
    }

    async fn end_break(&self, identity: &UserIdentity, session_id: &str) -> GatewayResult<()> {
        self.card_action(identity, session_id, "endBreak").await
    }

    async fn update_session(
        &self,
        identity: &UserIdentity,
        snapshot: &SessionSnapshot,
    ) -> GatewayResult<()> {
        let url = format!("{}/{}", self.time_cards_url(identity), snapshot.id);
        info!(session_id = %snapshot.id, breaks = snapshot.breaks.len(), "Updating time card");
        let request = self
            .http
            .put(url)
            .header(ACTS_AS_HEADER, &identity.user_id)
            .json(&WireTimeCardUpdate::from_snapshot(identity, snapshot));
        self.send(request, "update time card").await?;
        Ok(())
    }

    async fn fetch_presence(&self, identity: &UserIdentity) -> GatewayResult<RemotePresence> {
        let presence: WirePresence = self
            .send_json(
                self.http
                    .get(self.url(&format!("beta/users/{}/presence", identity.user_id))),
                "presence",
            )
            .await?;
        Ok(RemotePresence {
            availability: presence.availability,
            activity: presence.activity,
        })
    }
}

#[async_trait]
impl DirectoryGateway for GraphClient {
    async fn resolve_user(&self, email: &str) -> GatewayResult<DirectoryUser> {
        let user: WireUser = self
            .send_json(
                self.http.get(self.url(&format!("v1.0/users/{}", email))),
                "user",
            )
            .await?;
        Ok(DirectoryUser {
            display_name: user.display_name.unwrap_or_else(|| email.to_string()),
            id: user.id,
        })
    }

    async fn joined_teams(&self, user_id: &str) -> GatewayResult<Vec<Team>> {
        let teams: Page<WireTeam> = self
            .send_json(
                self.http
                    .get(self.url(&format!("v1.0/users/{}/joinedTeams", user_id))),
                "joined teams",
            )
            .await?;
        Ok(teams
            .value
            .into_iter()
            .map(|team| Team {
                id: team.id,
                display_name: team.display_name.unwrap_or_default(),
            })
            .collect())
    }

    async fn list_owners(&self, team_id: &str) -> GatewayResult<Vec<String>> {
        let owners: Page<WireOwner> = self
            .send_json(
                self.http
                    .get(self.url(&format!("v1.0/groups/{}/owners", team_id))),
                "team owners",
            )
            .await?;
        Ok(owners.value.into_iter().filter_map(|owner| owner.mail).collect())
    }

    async fn send_mail(
        &self,
        sender_id: &str,
        to: &[String],
        cc: &[String],
        notification: &Notification,
    ) -> GatewayResult<()> {
        let content_type = match notification.body {
            MessageBody::Text(_) => "Text",
            MessageBody::Html(_) => "HTML",
        };
        let recipients = |addresses: &[String]| {
            addresses
                .iter()
                .map(|address| json!({ "emailAddress": { "address": address } }))
                .collect::<Vec<_>>()
        };
        let payload = json!({
            "message": {
                "subject": notification.subject,
                "body": {
                    "contentType": content_type,
                    "content": notification.body.content(),
                },
                "toRecipients": recipients(to),
                "ccRecipients": recipients(cc),
            }
        });
        let request = self
            .http
            .post(self.url(&format!("v1.0/users/{}/sendMail", sender_id)))
            .json(&payload);
        self.send(request, "send mail").await?;
        info!(subject = %notification.subject, to = to.len(), cc = cc.len(), "Notification sent");
        Ok(())
    }
}

#[async_trait]
impl ReportSink for GraphClient {
    async fn upsert_day(&self, row: &ReportRow) -> GatewayResult<()> {
        let target = self.list_target().await?;
        let items_url = self.url(&format!(
            "v1.0/sites/{}/lists/{}/items",
            target.site_id, target.list_id
        ));

        let filter = format!(
            "fields/EmployeeName eq {} and fields/Date eq {}",
            odata_literal(&row.employee_name),
            odata_literal(&row.date)
        );
        let existing: Page<IdOnly> = self
            .send_json(
                self.http
                    .get(&items_url)
                    .header("Prefer", "HonorNonIndexedQueriesWarningMayFailRandomly")
                    .query(&[("$filter", filter.as_str()), ("$select", "id")]),
                "report row lookup",
            )
            .await?;

        match existing.value.into_iter().next() {
            Some(item) => {
                debug!(item_id = %item.id, date = %row.date, "Patching report row");
                let request = self
                    .http
                    .patch(format!("{}/{}/fields", items_url, item.id))
                    .json(row);
                self.send(request, "report row patch").await?;
            }
            None => {
                debug!(date = %row.date, "Creating report row");
                let request = self
                    .http
                    .post(&items_url)
                    .json(&json!({ "fields": row }));
                self.send(request, "report row create").await?;
            }
        }
        Ok(())
    }
}

fn classify_transport(err: reqwest::Error) -> GatewayError {
    if err.is_decode() {
        GatewayError::Decode(err.to_string())
    } else if err.is_builder() {
        GatewayError::NotConfigured(err.to_string())
    } else {
        GatewayError::Transient(err.to_string())
    }
}

async fn check_status(response: Response, what: &str) -> GatewayResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), what, "Graph request failed");
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            GatewayError::Auth(format!("{} returned {}: {}", what, status, body))
        }
        StatusCode::NOT_FOUND => GatewayError::NotFound(what.to_string()),
        other => GatewayError::Status {
            status: other.as_u16(),
            body,
        },
    })
}

/// Quotes a value for an OData `$filter` string literal.
fn odata_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_lifetime")]
    expires_in: u64,
}

fn default_token_lifetime() -> u64 {
    3600
}

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUser {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTeam {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct WireOwner {
    #[serde(default)]
    mail: Option<String>,
}

#[derive(Deserialize)]
struct WirePresence {
    #[serde(default)]
    availability: Availability,
    #[serde(default)]
    activity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent {
    date_time: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBreak {
    #[serde(default)]
    break_id: Option<String>,
    #[serde(default)]
    start: Option<WireEvent>,
    #[serde(default)]
    end: Option<WireEvent>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTimeCard {
    id: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    state: SessionState,
    #[serde(default)]
    clock_in_event: Option<WireEvent>,
    #[serde(default)]
    clock_out_event: Option<WireEvent>,
    #[serde(default)]
    breaks: Vec<WireBreak>,
}

impl WireTimeCard {
    fn into_snapshot(self) -> SessionSnapshot {
        let card_id = self.id;
        let breaks = self
            .breaks
            .into_iter()
            .filter_map(|wire| match wire.start {
                Some(start) => Some(BreakInterval {
                    id: wire.break_id,
                    start: start.date_time,
                    end: wire.end.map(|end| end.date_time),
                }),
                None => {
                    warn!(session_id = %card_id, "Dropping break without a start time");
                    None
                }
            })
            .collect();

        SessionSnapshot {
            id: card_id,
            state: self.state,
            clock_in: self.clock_in_event.map(|event| event.date_time),
            clock_out: self.clock_out_event.map(|event| event.date_time),
            breaks,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireBreakOut {
    #[serde(skip_serializing_if = "Option::is_none")]
    break_id: Option<String>,
    start: WireEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    end: Option<WireEvent>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTimeCardUpdate {
    user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    clock_in_event: Option<WireEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    clock_out_event: Option<WireEvent>,
    breaks: Vec<WireBreakOut>,
}

impl WireTimeCardUpdate {
    fn from_snapshot(identity: &UserIdentity, snapshot: &SessionSnapshot) -> Self {
        let event = |at: DateTime<Utc>| WireEvent { date_time: at };
        Self {
            user_id: identity.user_id.clone(),
            clock_in_event: snapshot.clock_in.map(event),
            clock_out_event: snapshot.clock_out.map(event),
            breaks: snapshot
                .breaks
                .iter()
                .map(|interval| WireBreakOut {
                    break_id: interval.id.clone(),
                    start: event(interval.start),
                    end: interval.end.map(event),
                })
                .collect(),
        }
    }
}
