//! Tracing setup: stderr plus a daily-rolling file under the storage root.

use fs_err as fs;
use std::env;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEBUG_ENV: &str = "TIMECLOCK_DEBUG_LOG";

/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process.
pub fn init(logs_dir: &Path) -> Option<WorkerGuard> {
    let (file_layer, guard) = match file_appender(logs_dir) {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        Err(err) => {
            eprintln!("timeclock-daemon: file logging disabled: {}", err);
            (None, None)
        }
    };

    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();
    guard
}

fn filter() -> EnvFilter {
    let debug_enabled = env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn file_appender(logs_dir: &Path) -> Result<RollingFileAppender, String> {
    fs::create_dir_all(logs_dir).map_err(|err| err.to_string())?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("daemon")
        .filename_suffix("log")
        .max_log_files(7)
        .build(logs_dir)
        .map_err(|err| err.to_string())
}
