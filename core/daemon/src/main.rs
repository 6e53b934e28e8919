//! Timeclock daemon entrypoint.
//!
//! A single-instance background agent: it watches for the collaboration client
//! and the worker's activity, keeps the remote time card in step, and serves a
//! local control socket for prompts and OS signals.

use fs_err as fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use timeclock_core::{load_config, LoopControl, StateStore, StorageConfig, TimeclockConfig};

mod agent;
mod backoff;
mod clock;
mod gateway;
mod graph;
mod ipc;
mod logging;
mod presence;
mod probe;
mod prompt;
mod recovery;
mod reminder;
mod restart;
#[cfg(test)]
mod testing;

use agent::Services;
use backoff::RelaunchBackoff;
use clock::{Clock, SystemClock};
use gateway::ReportSink;
use graph::GraphClient;
use ipc::IpcContext;
use probe::{ActivityTracker, SysinfoClientProbe};
use prompt::PromptRegistry;
use recovery::{PowerHold, TcpReachability};
use restart::{AgentSlot, Supervisor};

const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(3);

fn main() {
    let storage = match StorageConfig::resolve() {
        Ok(storage) => storage,
        Err(err) => {
            eprintln!("timeclock-daemon: {}", err);
            std::process::exit(1);
        }
    };
    let _log_guard = logging::init(&storage.logs_dir());

    let config = match load_config(&storage.config_file()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, path = %storage.config_file().display(), "Invalid configuration");
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "Failed to start the async runtime");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(storage, config)) {
        error!(error = %err, "Timeclock daemon stopped");
        std::process::exit(1);
    }
}

async fn run(storage: StorageConfig, config: TimeclockConfig) -> Result<(), String> {
    let socket_path = storage.socket_file();
    if !claim_socket(&socket_path).await? {
        info!(path = %socket_path.display(), "Another daemon is already running");
        return Ok(());
    }
    let listener = UnixListener::bind(&socket_path)
        .map_err(|err| format!("Failed to bind {}: {}", socket_path.display(), err))?;
    info!(path = %socket_path.display(), "Timeclock daemon started");

    let config = Arc::new(config);
    if !config.graph.has_credentials() {
        warn!("Graph credentials are not configured; remote calls will fail");
    }
    let graph = Arc::new(
        GraphClient::new(&config.graph, &config.report).map_err(|err| err.to_string())?,
    );
    let report: Option<Arc<dyn ReportSink>> = if config.report.enabled {
        Some(graph.clone())
    } else {
        None
    };
    let store = StateStore::load(&storage.state_file()).map_err(|err| err.to_string())?;

    let prompts = Arc::new(PromptRegistry::new());
    let activity = Arc::new(ActivityTracker::new(
        config.sync.idle_threshold_secs,
        config.sync.activity_stale_secs,
    ));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let services = Services {
        config: Arc::clone(&config),
        sessions: graph.clone(),
        directory: graph,
        report,
        store: Arc::new(Mutex::new(store)),
        control: Arc::new(Mutex::new(LoopControl::default())),
        prompts: prompts.clone(),
        client: Arc::new(SysinfoClientProbe::new(&config.client.process_names)),
        activity: Arc::clone(&activity),
        clock: Arc::clone(&clock),
        network: Arc::new(TcpReachability::new(
            config.recovery.reachability_addr.clone(),
            REACHABILITY_TIMEOUT,
        )),
        power: Arc::new(PowerHold::new(config.power.inhibit_command.clone())),
    };

    let backoff = Arc::new(RelaunchBackoff::new(
        Some(storage.backoff_file()),
        config.restart.clone(),
    ));
    let slot = Arc::new(AgentSlot::default());
    let shutdown = CancellationToken::new();

    let context = Arc::new(IpcContext {
        slot: Arc::clone(&slot),
        prompts,
        activity,
        clock,
        backoff: Arc::clone(&backoff),
    });
    let server = tokio::spawn(ipc::serve(listener, context, shutdown.clone()));
    tokio::spawn(wait_for_signal(shutdown.clone()));

    Supervisor::new(services, backoff, Some(storage.state_file()), slot)
        .run(shutdown.clone())
        .await;

    shutdown.cancel();
    if let Err(err) = server.await {
        warn!(error = %err, "Control socket task ended abnormally");
    }
    if let Err(err) = fs::remove_file(&socket_path) {
        warn!(error = %err, "Failed to remove control socket");
    }
    info!("Timeclock daemon stopped");
    Ok(())
}

/// Returns `false` if a live daemon already answers on the socket. A stale
/// socket file is removed.
async fn claim_socket(socket_path: &Path) -> Result<bool, String> {
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("Failed to create socket directory: {}", err))?;
    }
    if !socket_path.exists() {
        return Ok(true);
    }
    if UnixStream::connect(socket_path).await.is_ok() {
        return Ok(false);
    }
    fs::remove_file(socket_path)
        .map_err(|err| format!("Failed to remove stale socket: {}", err))?;
    Ok(true)
}

async fn wait_for_signal(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            warn!(error = %err, "Failed to install SIGTERM handler");
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
            return;
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if result.is_err() {
                return;
            }
        }
        _ = terminate.recv() => {}
    }
    info!("Shutdown requested");
    shutdown.cancel();
}
