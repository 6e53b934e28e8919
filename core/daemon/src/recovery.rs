//! Sleep/resume handling.
//!
//! A suspend while clocked in leaves a `BreakStartMarker` in the store. On
//! resume (reported, or inferred from a wall-clock gap between ticks) the
//! marker is reconciled into exactly one closed break on the remote card, and
//! the generation relaunches so every chain restarts from fresh state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::process::Stdio;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use timeclock_core::{BreakStartMarker, SessionState, StateStore};

use crate::agent::Agent;

#[async_trait]
pub trait Reachability: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Considers the network up once a TCP connection to `addr` succeeds.
pub struct TcpReachability {
    addr: String,
    timeout: Duration,
}

impl TcpReachability {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Reachability for TcpReachability {
    async fn is_reachable(&self) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await,
            Ok(Ok(_))
        )
    }
}

/// Polls until the network is reachable. Returns `false` only if cancelled.
pub async fn wait_for_network(
    network: &dyn Reachability,
    retry: Duration,
    cancel: &CancellationToken,
) -> bool {
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        if network.is_reachable().await {
            if attempts > 1 {
                info!(attempts, "Network reachable");
            }
            return true;
        }
        debug!(attempts, retry_secs = retry.as_secs(), "Network unreachable; retrying");
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(retry) => {}
        }
    }
}

/// Keeps the machine from idling into sleep while a generation runs.
///
/// The hold is a child process (for example `systemd-inhibit ... sleep infinity`)
/// that lives as long as the hold does. An empty command disables it.
pub struct PowerHold {
    command: Vec<String>,
    child: Mutex<Option<Child>>,
}

impl PowerHold {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            child: Mutex::new(None),
        }
    }

    pub fn acquire(&self) {
        let Some((program, args)) = self.command.split_first() else {
            return;
        };
        let Ok(mut child) = self.child.lock() else {
            return;
        };
        if let Some(held) = child.as_mut() {
            if matches!(held.try_wait(), Ok(None)) {
                return;
            }
        }

        match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(spawned) => {
                info!(pid = ?spawned.id(), "Power hold acquired");
                *child = Some(spawned);
            }
            Err(err) => warn!(error = %err, program = %program, "Failed to acquire power hold"),
        }
    }

    pub fn release(&self) {
        let Ok(mut child) = self.child.lock() else {
            return;
        };
        if let Some(mut held) = child.take() {
            if let Err(err) = held.start_kill() {
                debug!(error = %err, "Power hold already gone");
            }
            info!("Power hold released");
        }
    }

    pub fn is_held(&self) -> bool {
        self.child
            .lock()
            .map(|mut child| {
                child
                    .as_mut()
                    .is_some_and(|held| matches!(held.try_wait(), Ok(None)))
            })
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    NoMarker,
    /// The generation was cancelled while waiting for the network.
    Cancelled,
    /// The marker was dropped without touching the card.
    Discarded(&'static str),
    Appended {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// A remote call failed; the marker is kept for the next generation.
    Relaunching,
}

impl Reconciliation {
    /// Whether the caller should stop; the generation is gone or going.
    pub fn ends_generation(&self) -> bool {
        matches!(
            self,
            Reconciliation::Appended { .. } | Reconciliation::Relaunching | Reconciliation::Cancelled
        )
    }
}

impl Agent {
    /// Records the suspend time as a pending break if the cached card is clocked in.
    /// Returns whether a marker was written.
    pub fn on_suspend(&self) -> bool {
        self.suspended.store(true, Ordering::SeqCst);
        let now = self.services.clock.now();

        let cached = self.read_store(StateStore::latest_session).flatten();
        let recorded = match cached.filter(|card| card.effective_state() == Ok(SessionState::ClockedIn)) {
            Some(card) => {
                let marker = BreakStartMarker {
                    started_at: now,
                    session_id: Some(card.id),
                };
                self.write_store("break marker", |store| store.record_break_marker(&marker))
            }
            None => false,
        };

        self.services.power.release();
        info!(recorded, "Suspend reported");
        recorded
    }

    pub async fn on_resume(&self) -> Reconciliation {
        info!("Resume reported");
        self.services.power.acquire();
        let outcome = self.reconcile_pending_break().await;
        self.suspended.store(false, Ordering::SeqCst);
        outcome
    }

    /// A tick saw a wall-clock gap with no suspend report. Treats the previous
    /// tick as the suspend time. Returns whether the generation is ending.
    pub(crate) async fn recover_unreported_sleep(&self, previous: DateTime<Utc>) -> bool {
        let cached = self.read_store(StateStore::latest_session).flatten();
        if let Some(card) = cached.filter(|card| card.effective_state() == Ok(SessionState::ClockedIn)) {
            let marker = BreakStartMarker {
                started_at: previous,
                session_id: Some(card.id),
            };
            if self.write_store("break marker", |store| store.record_break_marker(&marker)) {
                warn!(since = %previous, "Unreported sleep detected");
            }
        }
        self.reconcile_pending_break().await.ends_generation()
    }

    /// Turns a pending marker into one closed break on a fresh copy of the card.
    pub(crate) async fn reconcile_pending_break(&self) -> Reconciliation {
        let _serial = self.recovery_lock.lock().await;

        let Some(marker) = self.read_store(StateStore::break_marker).flatten() else {
            return Reconciliation::NoMarker;
        };
        let Some(identity) = self.identity() else {
            return self.discard_marker("no identity configured");
        };
        info!(started_at = %marker.started_at, "Reconciling break across sleep");

        let retry = self.services.config.recovery.reachability_retry();
        if !wait_for_network(self.services.network.as_ref(), retry, &self.cancel).await {
            return Reconciliation::Cancelled;
        }
        let end = self.services.clock.now();

        let card = match self.services.sessions.fetch_latest(&identity).await {
            Ok(card) => card,
            Err(err) => {
                error!(error = %err, "Failed to fetch the time card after resume");
                self.restart
                    .request(format!("time card fetch failed after resume: {}", err));
                return Reconciliation::Relaunching;
            }
        };
        let Some(mut card) = card else {
            return self.discard_marker("no time card");
        };
        if marker
            .session_id
            .as_deref()
            .is_some_and(|session_id| session_id != card.id)
        {
            return self.discard_marker("time card changed during sleep");
        }
        match card.effective_state() {
            Ok(SessionState::ClockedIn) => {}
            Ok(_) => return self.discard_marker("not clocked in"),
            Err(_) => return self.discard_marker("time card failed integrity checks"),
        }
        if end <= marker.started_at {
            return self.discard_marker("resume is not after suspend");
        }
        if !card.append_break(marker.started_at, end) {
            return self.discard_marker("break already recorded");
        }

        if let Err(err) = self.services.sessions.update_session(&identity, &card).await {
            if err.is_transient() {
                error!(error = %err, "Failed to record the sleep break");
                self.restart
                    .request(format!("break update failed: {}", err));
                return Reconciliation::Relaunching;
            }
            warn!(error = %err, "Time card rejected the sleep break");
            return self.discard_marker("update rejected");
        }

        self.persist_snapshot(Some(&card), end);
        self.write_store("break marker", StateStore::clear_break_marker);
        info!(start = %marker.started_at, end = %end, "Sleep recorded as a break");
        self.restart.request("sleep break recorded");
        Reconciliation::Appended {
            start: marker.started_at,
            end,
        }
    }

    fn discard_marker(&self, reason: &'static str) -> Reconciliation {
        info!(reason, "Discarding break marker");
        self.write_store("break marker", StateStore::clear_break_marker);
        Reconciliation::Discarded(reason)
    }
}
