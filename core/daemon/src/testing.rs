//! In-memory collaborators for agent tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use timeclock_core::{
    Availability, BreakInterval, ControlFlags, LoopControl, Notification, Phase, PromptKind,
    ReportRow, SessionSnapshot, SessionState, StateStore, TimeclockConfig, UserIdentity,
};

use crate::agent::{Agent, Services};
use crate::clock::Clock;
use crate::gateway::{
    DirectoryGateway, DirectoryUser, GatewayError, GatewayResult, RemotePresence, ReportSink,
    SessionGateway, Team,
};
use crate::probe::{ActivityTracker, ClientProbe};
use crate::prompt::{PromptReply, Prompter};
use crate::recovery::{PowerHold, Reachability};
use crate::restart::{RestartHandle, RestartRequest};

pub(crate) fn at(hour: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, hour, min, 0).unwrap()
}

pub(crate) fn card(state: SessionState, breaks: Vec<BreakInterval>) -> SessionSnapshot {
    SessionSnapshot {
        id: "card-1".to_string(),
        state,
        clock_in: Some(at(9, 0)),
        clock_out: None,
        breaks,
    }
}

pub(crate) fn identity() -> UserIdentity {
    UserIdentity {
        user_id: "user-1".to_string(),
        team_id: "team-1".to_string(),
        email: "ada@example.com".to_string(),
        team_name: "Engines".to_string(),
    }
}

pub(crate) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub(crate) fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Remote service
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct FakeSessions {
    clock: Arc<ManualClock>,
    card: Mutex<Option<SessionSnapshot>>,
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    updates: Mutex<Vec<SessionSnapshot>>,
    fetch_latency: Mutex<Option<chrono::Duration>>,
}

impl FakeSessions {
    fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            card: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            updates: Mutex::new(Vec::new()),
            fetch_latency: Mutex::new(None),
        }
    }

    /// Every later `fetch_latest` moves the clock forward by `latency`.
    pub(crate) fn slow_fetches(&self, latency: chrono::Duration) {
        *self.fetch_latency.lock().unwrap() = Some(latency);
    }

    pub(crate) fn set_card(&self, card: Option<SessionSnapshot>) {
        *self.card.lock().unwrap() = card;
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn calls_named(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|call| *call == name).count()
    }

    pub(crate) fn clock_in_calls(&self) -> usize {
        self.calls_named("clock_in")
    }

    /// Makes every later call to `op` fail as if the connection dropped.
    pub(crate) fn fail_transient(&self, op: &str) {
        self.failing.lock().unwrap().insert(op.to_string());
    }

    pub(crate) fn updates(&self) -> Vec<SessionSnapshot> {
        self.updates.lock().unwrap().clone()
    }

    fn record(&self, op: &str) -> GatewayResult<()> {
        self.calls.lock().unwrap().push(op.to_string());
        if self.failing.lock().unwrap().contains(op) {
            return Err(GatewayError::Transient("connection reset".to_string()));
        }
        Ok(())
    }

    fn edit_card(&self, edit: impl FnOnce(&mut SessionSnapshot)) -> GatewayResult<()> {
        let mut card = self.card.lock().unwrap();
        let card = card
            .as_mut()
            .ok_or_else(|| GatewayError::NotFound("time card".to_string()))?;
        edit(card);
        Ok(())
    }
}

#[async_trait]
impl SessionGateway for FakeSessions {
    async fn fetch_latest(&self, _identity: &UserIdentity) -> GatewayResult<Option<SessionSnapshot>> {
        if let Some(latency) = *self.fetch_latency.lock().unwrap() {
            self.clock.set(self.clock.now() + latency);
        }
        self.record("fetch_latest")?;
        Ok(self.card.lock().unwrap().clone())
    }

    async fn clock_in(&self, _identity: &UserIdentity) -> GatewayResult<SessionSnapshot> {
        self.record("clock_in")?;
        let snapshot = SessionSnapshot {
            id: "card-1".to_string(),
            state: SessionState::ClockedIn,
            clock_in: Some(self.clock.now()),
            clock_out: None,
            breaks: Vec::new(),
        };
        self.set_card(Some(snapshot.clone()));
        Ok(snapshot)
    }

    async fn clock_out(&self, _identity: &UserIdentity, _session_id: &str) -> GatewayResult<()> {
        self.record("clock_out")?;
        let now = self.clock.now();
        self.edit_card(|card| {
            card.state = SessionState::ClockedOut;
            card.clock_out = Some(now);
        })
    }

    async fn start_break(&self, _identity: &UserIdentity, _session_id: &str) -> GatewayResult<()> {
        self.record("start_break")?;
        let now = self.clock.now();
        self.edit_card(|card| {
            card.state = SessionState::OnBreak;
            card.breaks.push(BreakInterval {
                id: None,
                start: now,
                end: None,
            });
        })
    }

    async fn end_break(&self, _identity: &UserIdentity, _session_id: &str) -> GatewayResult<()> {
        self.record("end_break")?;
        let now = self.clock.now();
        self.edit_card(|card| {
            card.state = SessionState::ClockedIn;
            if let Some(open) = card.breaks.iter_mut().rev().find(|interval| interval.is_open()) {
                open.end = Some(now);
            }
        })
    }

    async fn update_session(
        &self,
        _identity: &UserIdentity,
        snapshot: &SessionSnapshot,
    ) -> GatewayResult<()> {
        self.record("update_session")?;
        self.updates.lock().unwrap().push(snapshot.clone());
        self.set_card(Some(snapshot.clone()));
        Ok(())
    }

    async fn fetch_presence(&self, _identity: &UserIdentity) -> GatewayResult<RemotePresence> {
        self.record("fetch_presence")?;
        Ok(RemotePresence {
            availability: Availability::Available,
            activity: Some("Available".to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SentMail {
    pub subject: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
}

#[derive(Default)]
pub(crate) struct FakeDirectory {
    sent: Mutex<Vec<SentMail>>,
    owner_lookups: AtomicUsize,
}

impl FakeDirectory {
    pub(crate) fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn owner_lookups(&self) -> usize {
        self.owner_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectoryGateway for FakeDirectory {
    async fn resolve_user(&self, email: &str) -> GatewayResult<DirectoryUser> {
        if email != "ada@example.com" {
            return Err(GatewayError::NotFound(format!("users/{}", email)));
        }
        Ok(DirectoryUser {
            id: "user-1".to_string(),
            display_name: "Ada Lovelace".to_string(),
        })
    }

    async fn joined_teams(&self, _user_id: &str) -> GatewayResult<Vec<Team>> {
        Ok(vec![Team {
            id: "team-1".to_string(),
            display_name: "Engines".to_string(),
        }])
    }

    async fn list_owners(&self, _team_id: &str) -> GatewayResult<Vec<String>> {
        self.owner_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(vec!["owner@example.com".to_string()])
    }

    async fn send_mail(
        &self,
        _sender_id: &str,
        to: &[String],
        cc: &[String],
        notification: &Notification,
    ) -> GatewayResult<()> {
        self.sent.lock().unwrap().push(SentMail {
            subject: notification.subject.clone(),
            to: to.to_vec(),
            cc: cc.to_vec(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeReport {
    rows: Mutex<Vec<ReportRow>>,
}

impl FakeReport {
    pub(crate) fn rows(&self) -> Vec<ReportRow> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportSink for FakeReport {
    async fn upsert_day(&self, row: &ReportRow) -> GatewayResult<()> {
        self.rows.lock().unwrap().push(row.clone());
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Local signals and prompts
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct FakeClient {
    running: AtomicBool,
}

impl FakeClient {
    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

impl ClientProbe for FakeClient {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Unreachable for the first N attempts, then reachable.
#[derive(Default)]
pub(crate) struct FakeNetwork {
    failures_left: AtomicU32,
    attempts: AtomicU32,
}

impl FakeNetwork {
    pub(crate) fn fail_first(&self, attempts: u32) {
        self.failures_left.store(attempts, Ordering::SeqCst);
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reachability for FakeNetwork {
    async fn is_reachable(&self) -> bool {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_err()
    }
}

/// Answers prompts from a script; with the script exhausted a prompt stays open forever.
#[derive(Default)]
pub(crate) struct ScriptedPrompter {
    replies: Mutex<VecDeque<PromptReply>>,
    asked: Mutex<Vec<(PromptKind, Instant)>>,
}

impl ScriptedPrompter {
    pub(crate) fn script(&self, replies: impl IntoIterator<Item = PromptReply>) {
        self.replies.lock().unwrap().extend(replies);
    }

    pub(crate) fn asked(&self) -> Vec<(PromptKind, Instant)> {
        self.asked.lock().unwrap().clone()
    }

    pub(crate) fn asked_kinds(&self) -> Vec<PromptKind> {
        self.asked().into_iter().map(|(kind, _)| kind).collect()
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn ask(&self, kind: PromptKind) -> Option<PromptReply> {
        self.asked.lock().unwrap().push((kind, Instant::now()));
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(reply) => Some(reply),
            None => std::future::pending().await,
        }
    }

    fn withdraw_all(&self) {}
}

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct Harness {
    pub services: Services,
    pub sessions: Arc<FakeSessions>,
    pub directory: Arc<FakeDirectory>,
    pub report: Arc<FakeReport>,
    pub prompts: Arc<ScriptedPrompter>,
    pub client: Arc<FakeClient>,
    pub activity: Arc<ActivityTracker>,
    pub clock: Arc<ManualClock>,
    pub network: Arc<FakeNetwork>,
    pub identity: UserIdentity,
    restart_tx: mpsc::UnboundedSender<RestartRequest>,
    restart_rx: Mutex<mpsc::UnboundedReceiver<RestartRequest>>,
    restart_count: AtomicUsize,
    generation: AtomicU64,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let harness = Self::unconfigured();
        harness
            .services
            .store
            .lock()
            .unwrap()
            .set_identity(&harness.identity)
            .unwrap();
        harness
    }

    pub(crate) fn unconfigured() -> Self {
        let config = TimeclockConfig::default();
        let clock = Arc::new(ManualClock {
            now: Mutex::new(at(10, 0)),
        });
        let sessions = Arc::new(FakeSessions::new(Arc::clone(&clock)));
        let directory = Arc::new(FakeDirectory::default());
        let report = Arc::new(FakeReport::default());
        let prompts = Arc::new(ScriptedPrompter::default());
        let client = Arc::new(FakeClient::default());
        let activity = Arc::new(ActivityTracker::new(
            config.sync.idle_threshold_secs,
            config.sync.activity_stale_secs,
        ));
        let network = Arc::new(FakeNetwork::default());

        let services = Services {
            config: Arc::new(config),
            sessions: sessions.clone(),
            directory: directory.clone(),
            report: Some(report.clone()),
            store: Arc::new(Mutex::new(StateStore::new_in_memory())),
            control: Arc::new(Mutex::new(LoopControl::default())),
            prompts: prompts.clone(),
            client: client.clone(),
            activity: Arc::clone(&activity),
            clock: clock.clone(),
            network: network.clone(),
            power: Arc::new(PowerHold::new(Vec::new())),
        };
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();

        Self {
            services,
            sessions,
            directory,
            report,
            prompts,
            client,
            activity,
            clock,
            network,
            identity: identity(),
            restart_tx,
            restart_rx: Mutex::new(restart_rx),
            restart_count: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// A fresh generation wired to the harness's relaunch channel.
    pub(crate) fn agent(&self) -> Arc<Agent> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let restart = RestartHandle::new(generation, cancel.clone(), self.restart_tx.clone());
        Arc::new(Agent::new(self.services.clone(), generation, cancel, restart))
    }

    /// Total relaunch requests seen so far.
    pub(crate) fn restart_requests(&self) -> usize {
        let mut rx = self.restart_rx.lock().unwrap();
        while rx.try_recv().is_ok() {
            self.restart_count.fetch_add(1, Ordering::SeqCst);
        }
        self.restart_count.load(Ordering::SeqCst)
    }

    pub(crate) fn restart_requested(&self) -> bool {
        self.restart_requests() > 0
    }

    pub(crate) fn control_flags(&self) -> ControlFlags {
        self.services.control.lock().unwrap().flags()
    }

    pub(crate) fn control_phase(&self) -> Phase {
        self.services.control.lock().unwrap().phase()
    }

    pub(crate) fn seed_cached_card(&self, card: SessionSnapshot) {
        self.services
            .store
            .lock()
            .unwrap()
            .set_latest_session(Some(&card))
            .unwrap();
    }
}
