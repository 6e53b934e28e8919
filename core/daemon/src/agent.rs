//! The synchronization loop.
//!
//! One `Agent` exists per supervisor generation. It owns the generation's
//! cancellation token and relaunch handle; everything that must survive a
//! relaunch (store, loop control, prompts, probes) lives in `Services`.
//!
//! Sub-flows live next to it: `reminder.rs` (deferred clock-in), `presence.rs`
//! (availability refresh and reporting) and `recovery.rs` (sleep/resume).

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use timeclock_core::{
    clock_in_notification, clock_out_summary, next_action, Action, ControlFlags, LoopControl,
    Notification, Phase, PresenceSnapshot, PromptKind, SessionSnapshot, SessionState,
    SharedControl, StateStore, TickGuard, TickInputs, TimeclockConfig, UserIdentity,
};
use timeclock_daemon_protocol::ErrorInfo;

use crate::clock::Clock;
use crate::gateway::{DirectoryGateway, GatewayError, ReportSink, SessionGateway};
use crate::probe::{ActivitySample, ActivityTracker, ClientProbe};
use crate::prompt::{PromptReply, Prompter};
use crate::recovery::{PowerHold, Reachability};
use crate::restart::RestartHandle;

/// Collaborators shared by every generation.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<TimeclockConfig>,
    pub sessions: Arc<dyn SessionGateway>,
    pub directory: Arc<dyn DirectoryGateway>,
    pub report: Option<Arc<dyn ReportSink>>,
    pub store: Arc<Mutex<StateStore>>,
    pub control: SharedControl,
    pub prompts: Arc<dyn Prompter>,
    pub client: Arc<dyn ClientProbe>,
    pub activity: Arc<ActivityTracker>,
    pub clock: Arc<dyn Clock>,
    pub network: Arc<dyn Reachability>,
    pub power: Arc<PowerHold>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another tick is still in flight.
    Busy,
    /// A suspend was reported and no resume has arrived yet.
    Suspended,
    /// No identity has been configured.
    Unconfigured,
    /// The time card failed integrity checks; nothing was done.
    Anomaly,
    /// This generation is being torn down.
    Relaunching,
    Acted(Action),
}

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub generation: u64,
    pub phase: Phase,
    pub flags: ControlFlags,
    pub suspended: bool,
    pub identity: Option<UserIdentity>,
    pub username: Option<String>,
    pub state: Option<SessionState>,
    pub session: Option<SessionSnapshot>,
    pub presence: Option<PresenceSnapshot>,
    pub last_updated: Option<DateTime<Utc>>,
    pub break_marker_at: Option<DateTime<Utc>>,
    pub activity: Option<ActivitySample>,
    pub worker_active: bool,
}

pub struct Agent {
    pub(crate) services: Services,
    pub(crate) generation: u64,
    pub(crate) cancel: CancellationToken,
    pub(crate) restart: RestartHandle,
    pub(crate) suspended: AtomicBool,
    pub(crate) recovery_lock: tokio::sync::Mutex<()>,
    last_tick_at: Mutex<Option<DateTime<Utc>>>,
}

impl Agent {
    pub fn new(
        services: Services,
        generation: u64,
        cancel: CancellationToken,
        restart: RestartHandle,
    ) -> Self {
        Self {
            services,
            generation,
            cancel,
            restart,
            suspended: AtomicBool::new(false),
            recovery_lock: tokio::sync::Mutex::new(()),
            last_tick_at: Mutex::new(None),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Starts the generation: power hold, pending-break recovery, then the
    /// presence chain and the sync loop.
    pub fn start(self: &Arc<Self>) {
        self.services.power.acquire();
        let agent = Arc::clone(self);
        self.spawn(async move { agent.run().await });
    }

    async fn run(self: Arc<Self>) {
        if self.reconcile_pending_break().await.ends_generation() {
            return;
        }

        let presence = Arc::clone(&self);
        self.spawn(async move { presence.run_presence_loop().await });

        let interval = self.services.config.sync.interval();
        loop {
            self.tick().await;
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Runs `task` until it finishes or the generation is cancelled.
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = task => {}
            }
        });
    }

    /// One pass of the decision cycle. At most one transition is taken.
    pub async fn tick(self: &Arc<Self>) -> TickOutcome {
        if self.cancel.is_cancelled() {
            return TickOutcome::Relaunching;
        }
        let Some(_guard) = TickGuard::acquire(&self.services.control) else {
            debug!("Tick already in flight; skipping");
            return TickOutcome::Busy;
        };
        let Some(identity) = self.identity() else {
            debug!("No identity configured; waiting for configure");
            return TickOutcome::Unconfigured;
        };

        let now = self.services.clock.now();
        let previous = self.last_tick_at.lock().ok().and_then(|last| *last);
        let slept = previous.filter(|previous| now - *previous > self.services.config.sync.sleep_gap());

        let outcome = self.run_cycle(identity, now, slept).await;
        // Gateway latency inside a tick must not count toward the sleep gap.
        if let Ok(mut last) = self.last_tick_at.lock() {
            *last = Some(self.services.clock.now());
        }
        outcome
    }

    async fn run_cycle(
        self: &Arc<Self>,
        identity: UserIdentity,
        now: DateTime<Utc>,
        slept: Option<DateTime<Utc>>,
    ) -> TickOutcome {
        if self.suspended.load(Ordering::SeqCst) {
            if slept.is_none() {
                return TickOutcome::Suspended;
            }
            warn!("Resume was never reported; reconciling after the sleep gap");
            if self.on_resume().await.ends_generation() {
                return TickOutcome::Relaunching;
            }
        } else if let Some(previous) = slept {
            if self.recover_unreported_sleep(previous).await {
                return TickOutcome::Relaunching;
            }
        }

        self.ensure_directory_cache(&identity).await;

        let snapshot = match self.services.sessions.fetch_latest(&identity).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                error!(error = %err, "Failed to fetch the latest time card");
                self.restart
                    .request(format!("time card fetch failed: {}", err));
                return TickOutcome::Relaunching;
            }
        };

        let state = match snapshot.as_ref().map(SessionSnapshot::effective_state).transpose() {
            Ok(state) => state.unwrap_or(SessionState::ClockedOut),
            Err(anomaly) => {
                warn!(anomaly = %anomaly, "Time card failed integrity checks; no transition this tick");
                self.persist_snapshot(snapshot.as_ref(), now);
                return TickOutcome::Anomaly;
            }
        };

        let inputs = TickInputs {
            client_running: self.services.client.is_running(),
            worker_active: self.services.activity.is_active(now),
        };
        self.persist_snapshot(snapshot.as_ref(), now);

        let action = next_action(state, inputs);
        if action == Action::None {
            debug!(state = %state, ?inputs, "No transition");
        } else {
            info!(state = %state, ?inputs, action = ?action, "Transition selected");
        }

        match action {
            Action::None => {}
            Action::PromptClockIn => {
                if self.with_control(|control| control.try_open_prompt(PromptKind::ClockIn)) == Some(true) {
                    let agent = Arc::clone(self);
                    self.spawn(async move { agent.confirm_clock_in().await });
                }
            }
            Action::PromptClockOut => {
                if self.with_control(|control| control.try_open_prompt(PromptKind::ClockOut)) == Some(true) {
                    let agent = Arc::clone(self);
                    self.spawn(async move { agent.confirm_clock_out().await });
                }
            }
            Action::StartBreak | Action::EndBreak => {
                if let Some(snapshot) = snapshot.as_ref() {
                    self.apply_break(&identity, &snapshot.id, action).await;
                }
            }
        }

        TickOutcome::Acted(action)
    }

    async fn confirm_clock_in(self: Arc<Self>) {
        match self.services.prompts.ask(PromptKind::ClockIn).await {
            Some(PromptReply::Confirm(true)) => {
                self.clock_in_sequence().await;
                self.close_prompt();
            }
            Some(PromptReply::Confirm(false)) => {
                if self.with_control(LoopControl::decline_clock_in) == Some(true) {
                    self.run_reminder_chain().await;
                } else {
                    self.close_prompt();
                }
            }
            _ => self.close_prompt(),
        }
    }

    async fn confirm_clock_out(self: Arc<Self>) {
        if let Some(PromptReply::Confirm(true)) = self.services.prompts.ask(PromptKind::ClockOut).await
        {
            self.clock_out_sequence().await;
        }
        self.close_prompt();
    }

    /// Remote clock-in, cache the new card, notify the team.
    pub(crate) async fn clock_in_sequence(&self) -> bool {
        let Some(identity) = self.identity() else {
            warn!("Clock-in confirmed without an identity");
            return false;
        };
        if !self.cached_state().is_clocked_out() {
            info!("Already clocked in; skipping clock-in");
            return false;
        }

        let snapshot = match self.services.sessions.clock_in(&identity).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                error!(error = %err, "Clock-in failed");
                self.restart.request(format!("clock-in failed: {}", err));
                return false;
            }
        };
        let now = self.services.clock.now();
        self.persist_snapshot(Some(&snapshot), now);

        let username = self.username(&identity);
        let clocked_in_at = snapshot.clock_in.unwrap_or(now);
        let notification = clock_in_notification(&username, &identity, clocked_in_at, &Local);
        self.notify(&identity, &notification).await;
        true
    }

    /// Remote clock-out, refetch the final card, send the summary.
    ///
    /// Only runs when the cached card is clocked in.
    pub(crate) async fn clock_out_sequence(&self) -> bool {
        let Some(identity) = self.identity() else {
            warn!("Clock-out confirmed without an identity");
            return false;
        };
        let cached = self.read_store(StateStore::latest_session).flatten();
        let Some(cached) = cached.filter(|card| card.effective_state() == Ok(SessionState::ClockedIn))
        else {
            info!("Cached time card is not clocked in; skipping clock-out");
            return false;
        };

        if let Err(err) = self
            .services
            .sessions
            .clock_out(&identity, &cached.id)
            .await
        {
            error!(error = %err, session_id = %cached.id, "Clock-out failed");
            self.restart.request(format!("clock-out failed: {}", err));
            return false;
        }

        let final_card = match self.services.sessions.fetch_latest(&identity).await {
            Ok(Some(card)) => card,
            Ok(None) => cached,
            Err(err) => {
                error!(error = %err, "Failed to fetch the final time card");
                self.restart
                    .request(format!("time card fetch failed: {}", err));
                return false;
            }
        };
        self.persist_snapshot(Some(&final_card), self.services.clock.now());

        let username = self.username(&identity);
        let summary = clock_out_summary(&username, &identity, &final_card, &Local);
        self.notify(&identity, &summary).await;
        true
    }

    async fn apply_break(&self, identity: &UserIdentity, session_id: &str, action: Action) {
        let sessions = &self.services.sessions;
        let result = match action {
            Action::StartBreak => sessions.start_break(identity, session_id).await,
            Action::EndBreak => sessions.end_break(identity, session_id).await,
            _ => return,
        };
        match result {
            Ok(()) => info!(action = ?action, session_id, "Break updated"),
            Err(err) if err.is_transient() => {
                error!(error = %err, action = ?action, "Break call lost connectivity");
                self.restart.request(format!("break call failed: {}", err));
            }
            Err(err) => warn!(error = %err, action = ?action, "Break call failed"),
        }
    }

    async fn notify(&self, identity: &UserIdentity, notification: &Notification) {
        let owners = self
            .read_store(StateStore::owners)
            .flatten()
            .unwrap_or_default();
        let cc = vec![identity.email.clone()];
        if let Err(err) = self
            .services
            .directory
            .send_mail(&identity.user_id, &owners, &cc, notification)
            .await
        {
            warn!(error = %err, subject = %notification.subject, "Failed to send notification");
        }
    }

    /// Owners and display name are fetched once and cached.
    async fn ensure_directory_cache(&self, identity: &UserIdentity) {
        let (has_owners, has_username) = self
            .read_store(|store| (store.owners().is_some(), store.username().is_some()))
            .unwrap_or((true, true));

        if !has_owners {
            match self.services.directory.list_owners(&identity.team_id).await {
                Ok(owners) => {
                    debug!(owners = owners.len(), "Cached team owners");
                    self.write_store("owners", |store| store.set_owners(&owners));
                }
                Err(err) => warn!(error = %err, "Failed to list team owners"),
            }
        }
        if !has_username {
            match self.services.directory.resolve_user(&identity.email).await {
                Ok(user) => {
                    self.write_store("username", |store| store.set_username(&user.display_name))
                }
                Err(err) => warn!(error = %err, "Failed to resolve the worker's display name"),
            }
        }
    }

    /// Resolves the worker and team, stores the identity, then relaunches.
    pub async fn configure(&self, email: &str, team_name: &str) -> Result<UserIdentity, ErrorInfo> {
        let directory = &self.services.directory;
        let user = directory
            .resolve_user(email)
            .await
            .map_err(|err| directory_error(err, "unknown_user", email))?;
        let teams = directory
            .joined_teams(&user.id)
            .await
            .map_err(|err| directory_error(err, "unknown_user", email))?;

        let Some(team) = teams.iter().find(|team| team.display_name == team_name) else {
            let names: Vec<&str> = teams.iter().map(|team| team.display_name.as_str()).collect();
            return Err(ErrorInfo::new(
                "unknown_team",
                format!(
                    "'{}' is not one of the joined teams: {}",
                    team_name,
                    names.join(", ")
                ),
            ));
        };

        let identity = UserIdentity {
            user_id: user.id,
            team_id: team.id.clone(),
            email: email.to_string(),
            team_name: team.display_name.clone(),
        };
        let saved = self
            .services
            .store
            .lock()
            .map_err(|_| ErrorInfo::new("store_error", "state store is unavailable"))
            .and_then(|mut store| {
                store
                    .set_identity(&identity)
                    .and_then(|_| store.clear_directory_cache())
                    .map_err(|err| ErrorInfo::new("store_error", err.to_string()))
            });
        saved?;

        info!(user_id = %identity.user_id, team = %identity.team_name, "Identity configured");
        self.restart.request("identity configured");
        Ok(identity)
    }

    pub fn status(&self) -> StatusView {
        let now = self.services.clock.now();
        let control = self
            .services
            .control
            .lock()
            .map(|control| (control.phase(), control.flags()))
            .ok();
        let (phase, flags) = control.unwrap_or((
            Phase::Idle,
            ControlFlags {
                prompt_open: false,
                reminder_open: false,
                reminder_loop_active: false,
                main_loop_active: false,
            },
        ));

        let store = self.services.store.lock().ok();
        let session = store.as_ref().and_then(|store| store.latest_session());
        StatusView {
            generation: self.generation,
            phase,
            flags,
            suspended: self.suspended.load(Ordering::SeqCst),
            identity: store.as_ref().and_then(|store| store.identity()),
            username: store.as_ref().and_then(|store| store.username()),
            state: session
                .as_ref()
                .map(|card| card.effective_state().unwrap_or(card.state)),
            presence: store.as_ref().and_then(|store| store.presence()),
            last_updated: store.as_ref().and_then(|store| store.last_updated()),
            break_marker_at: store
                .as_ref()
                .and_then(|store| store.break_marker())
                .map(|marker| marker.started_at),
            session,
            activity: self.services.activity.latest(),
            worker_active: self.services.activity.is_active(now),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Shared-state helpers
    // ─────────────────────────────────────────────────────────────────────

    pub(crate) fn identity(&self) -> Option<UserIdentity> {
        self.read_store(StateStore::identity).flatten()
    }

    fn username(&self, identity: &UserIdentity) -> String {
        self.read_store(StateStore::username)
            .flatten()
            .unwrap_or_else(|| identity.email.clone())
    }

    /// Decision state of the cached card; no card reads as clocked out.
    pub(crate) fn cached_state(&self) -> SessionState {
        self.read_store(StateStore::latest_session)
            .flatten()
            .map(|card| card.effective_state().unwrap_or(card.state))
            .unwrap_or(SessionState::ClockedOut)
    }

    pub(crate) fn persist_snapshot(&self, snapshot: Option<&SessionSnapshot>, at: DateTime<Utc>) {
        self.write_store("latest session", |store| {
            store.set_latest_session(snapshot)?;
            store.set_last_updated(at)
        });
    }

    pub(crate) fn read_store<T>(&self, read: impl FnOnce(&StateStore) -> T) -> Option<T> {
        match self.services.store.lock() {
            Ok(store) => Some(read(&store)),
            Err(_) => {
                error!("State store lock poisoned");
                None
            }
        }
    }

    pub(crate) fn write_store<T: Default>(
        &self,
        what: &str,
        write: impl FnOnce(&mut StateStore) -> timeclock_core::Result<T>,
    ) -> T {
        match self.services.store.lock() {
            Ok(mut store) => write(&mut store).unwrap_or_else(|err| {
                warn!(error = %err, what, "Failed to persist state");
                T::default()
            }),
            Err(_) => {
                error!(what, "State store lock poisoned");
                T::default()
            }
        }
    }

    pub(crate) fn with_control<T>(&self, update: impl FnOnce(&mut LoopControl) -> T) -> Option<T> {
        self.services
            .control
            .lock()
            .ok()
            .map(|mut control| update(&mut control))
    }

    pub(crate) fn close_prompt(&self) {
        self.with_control(LoopControl::close);
    }
}

fn directory_error(err: GatewayError, not_found_code: &str, subject: &str) -> ErrorInfo {
    match err {
        GatewayError::NotFound(_) => {
            ErrorInfo::new(not_found_code, format!("'{}' was not found in the directory", subject))
        }
        other => ErrorInfo::new("directory_error", other.to_string()),
    }
}
