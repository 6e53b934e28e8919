//! # timeclock-core
//!
//! Core library for the timeclock agent, shared by the daemon and its control CLI.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. The daemon wraps these calls in its own tasks.
//! - **Pure decisions**: The attendance state machine and loop-control guards are plain
//!   functions over plain data, so every transition is unit-testable without I/O.
//! - **Graceful degradation**: Missing or corrupt state files load as empty, not errors.
//! - **Single writer**: Only the daemon writes the persisted state document.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use timeclock_core::{next_action, StateStore, StorageConfig, TickInputs};
//!
//! let storage = StorageConfig::default();
//! let store = StateStore::load(&storage.state_file())?;
//! let state = store.latest_session().map(|s| s.state).unwrap_or_default();
//! let action = next_action(state, TickInputs { client_running: true, worker_active: true });
//! ```

pub mod config;
pub mod control;
pub mod error;
pub mod machine;
pub mod notify;
pub mod report;
pub mod storage;
pub mod store;
pub mod types;

pub use config::*;
pub use control::{ControlFlags, LoopControl, Phase, PromptKind, SharedControl, TickGuard};
pub use error::{Result, SnapshotAnomaly, TimeclockError};
pub use machine::{next_action, Action, TickInputs};
pub use notify::{
    clock_in_notification, clock_out_summary, format_duration, MessageBody, Notification,
};
pub use report::{build_report_row, ReportRow};
pub use storage::StorageConfig;
pub use store::{StateStore, StoreKey};
pub use types::*;
