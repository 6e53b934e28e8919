//! In-process relaunch.
//!
//! Every recoverable failure ends the current generation through its
//! `RestartHandle`. The supervisor cancels the generation's token (which tears
//! down the sync loop, presence chain, reminder chain and open prompts), applies
//! the persisted backoff, reloads the state store and starts a fresh `Agent`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use timeclock_core::StateStore;

use crate::agent::{Agent, Services};
use crate::backoff::RelaunchBackoff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartRequest {
    pub generation: u64,
    pub reason: String,
}

/// Fires at most once per generation.
#[derive(Clone)]
pub struct RestartHandle {
    generation: u64,
    fired: Arc<AtomicBool>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<RestartRequest>,
}

impl RestartHandle {
    pub fn new(
        generation: u64,
        cancel: CancellationToken,
        tx: mpsc::UnboundedSender<RestartRequest>,
    ) -> Self {
        Self {
            generation,
            fired: Arc::new(AtomicBool::new(false)),
            cancel,
            tx,
        }
    }

    /// Cancels the generation and asks the supervisor for a new one.
    /// Returns `false` if a relaunch was already requested.
    pub fn request(&self, reason: impl Into<String>) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            debug!(generation = self.generation, "Relaunch already requested");
            return false;
        }
        let reason = reason.into();
        warn!(generation = self.generation, reason = %reason, "Relaunch requested");
        self.cancel.cancel();
        if self
            .tx
            .send(RestartRequest {
                generation: self.generation,
                reason,
            })
            .is_err()
        {
            debug!("Supervisor is gone; relaunch request dropped");
        }
        true
    }

    pub fn is_requested(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// The live generation, shared with the IPC server.
#[derive(Default)]
pub struct AgentSlot {
    current: Mutex<Option<Arc<Agent>>>,
    relaunches: AtomicU64,
}

impl AgentSlot {
    pub fn current(&self) -> Option<Arc<Agent>> {
        self.current.lock().ok().and_then(|current| current.clone())
    }

    pub fn relaunches(&self) -> u64 {
        self.relaunches.load(Ordering::SeqCst)
    }

    pub(crate) fn install(&self, agent: Arc<Agent>) {
        if let Ok(mut current) = self.current.lock() {
            if current.replace(agent).is_some() {
                self.relaunches.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

pub struct Supervisor {
    services: Services,
    backoff: Arc<RelaunchBackoff>,
    state_file: Option<PathBuf>,
    slot: Arc<AgentSlot>,
}

impl Supervisor {
    pub fn new(
        services: Services,
        backoff: Arc<RelaunchBackoff>,
        state_file: Option<PathBuf>,
        slot: Arc<AgentSlot>,
    ) -> Self {
        Self {
            services,
            backoff,
            state_file,
            slot,
        }
    }

    /// Runs generations until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut generation: u64 = 0;

        loop {
            self.backoff.before_start(&shutdown).await;
            if shutdown.is_cancelled() {
                break;
            }

            generation += 1;
            self.prepare_generation();
            let cancel = shutdown.child_token();
            let handle = RestartHandle::new(generation, cancel.clone(), tx.clone());
            let agent = Arc::new(Agent::new(
                self.services.clone(),
                generation,
                cancel.clone(),
                handle,
            ));
            self.slot.install(Arc::clone(&agent));
            info!(generation, "Starting agent generation");
            agent.start();

            let request = loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break None,
                    received = rx.recv() => match received {
                        Some(request) if request.generation == generation => break Some(request),
                        Some(stale) => {
                            debug!(generation = stale.generation, "Ignoring stale relaunch request");
                        }
                        None => break None,
                    }
                }
            };

            cancel.cancel();
            let Some(request) = request else {
                break;
            };
            info!(generation, reason = %request.reason, "Relaunching agent");
            // Let the cancelled tasks unwind before shared state is reset.
            tokio::task::yield_now().await;
        }

        self.services.prompts.withdraw_all();
        self.services.power.release();
        info!("Supervisor stopped");
    }

    /// Clears process-local state the previous generation may have left behind.
    fn prepare_generation(&self) {
        if let Ok(mut control) = self.services.control.lock() {
            control.reset();
        }
        self.services.prompts.withdraw_all();

        let Some(path) = self.state_file.as_ref() else {
            return;
        };
        match StateStore::load(path) {
            Ok(reloaded) => {
                if let Ok(mut store) = self.services.store.lock() {
                    *store = reloaded;
                }
            }
            Err(err) => warn!(error = %err, "Failed to reload state; keeping the in-memory copy"),
        }
    }
}
