//! File-backed key-value state document.
//!
//! The daemon is the only writer. Every `set` writes through to disk so a
//! relaunch (or a crash) always reloads the latest values.
//!
//! # File Format
//!
//! ```json
//! {
//!   "identity": { "user_id": "...", "team_id": "...", "email": "...", "team_name": "..." },
//!   "owners": ["lead@example.com"],
//!   "username": "Ada Lovelace",
//!   "latest-session": { ... SessionSnapshot ... },
//!   "presence": { ... PresenceSnapshot ... },
//!   "last-updated": "2026-03-02T09:00:00Z",
//!   "break-start": { "started_at": "2026-03-02T12:00:00Z" }
//! }
//! ```
//!
//! Unknown keys are preserved. An empty or corrupt file loads as an empty
//! document with a warning; a malformed value reads as absent.
//!
//! # Atomic Writes
//!
//! Uses temp file + rename so a partial write never replaces the document.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{Result, TimeclockError};
use crate::types::{BreakStartMarker, PresenceSnapshot, SessionSnapshot, UserIdentity};

/// Keys of the persisted document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKey {
    Identity,
    Owners,
    Username,
    LatestSession,
    Presence,
    LastUpdated,
    BreakStart,
}

impl StoreKey {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreKey::Identity => "identity",
            StoreKey::Owners => "owners",
            StoreKey::Username => "username",
            StoreKey::LatestSession => "latest-session",
            StoreKey::Presence => "presence",
            StoreKey::LastUpdated => "last-updated",
            StoreKey::BreakStart => "break-start",
        }
    }
}

pub struct StateStore {
    values: Map<String, Value>,
    file_path: Option<PathBuf>,
}

impl StateStore {
    pub fn new_in_memory() -> Self {
        StateStore {
            values: Map::new(),
            file_path: None,
        }
    }

    pub fn load(file_path: &Path) -> Result<Self> {
        let empty = StateStore {
            values: Map::new(),
            file_path: Some(file_path.to_path_buf()),
        };
        if !file_path.exists() {
            return Ok(empty);
        }

        let content = fs_err::read_to_string(file_path).map_err(|source| TimeclockError::Io {
            context: "reading state document".to_string(),
            source,
        })?;
        if content.trim().is_empty() {
            warn!(path = %file_path.display(), "Empty state document, starting fresh");
            return Ok(empty);
        }

        match serde_json::from_str::<Map<String, Value>>(&content) {
            Ok(values) => Ok(StateStore {
                values,
                file_path: Some(file_path.to_path_buf()),
            }),
            Err(err) => {
                warn!(
                    path = %file_path.display(),
                    error = %err,
                    "Corrupt state document, starting fresh"
                );
                Ok(empty)
            }
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: StoreKey) -> Option<T> {
        let value = self.values.get(key.as_str())?;
        match serde_json::from_value(value.clone()) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!(key = key.as_str(), error = %err, "Ignoring malformed stored value");
                None
            }
        }
    }

    pub fn set<T: Serialize>(&mut self, key: StoreKey, value: &T) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|source| {
            TimeclockError::StateValueMalformed {
                key: key.as_str().to_string(),
                source,
            }
        })?;
        self.values.insert(key.as_str().to_string(), value);
        self.save()
    }

    /// Removes a key. Returns whether it was present.
    pub fn remove(&mut self, key: StoreKey) -> Result<bool> {
        let removed = self.values.remove(key.as_str()).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn contains(&self, key: StoreKey) -> bool {
        self.values.contains_key(key.as_str())
    }

    fn save(&self) -> Result<()> {
        let Some(file_path) = self.file_path.as_ref() else {
            return Ok(());
        };
        let write_error = |source| TimeclockError::StateWriteFailed {
            path: file_path.clone(),
            source,
        };

        let content =
            serde_json::to_string_pretty(&self.values).map_err(|source| TimeclockError::Json {
                context: "serializing state document".to_string(),
                source,
            })?;
        let parent_dir = file_path.parent().unwrap_or_else(|| Path::new("."));
        fs_err::create_dir_all(parent_dir).map_err(write_error)?;

        let mut temp_file = NamedTempFile::new_in(parent_dir).map_err(write_error)?;
        temp_file
            .write_all(content.as_bytes())
            .map_err(write_error)?;
        temp_file.flush().map_err(write_error)?;
        temp_file
            .persist(file_path)
            .map_err(|err| write_error(err.error))?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Typed accessors
    // ─────────────────────────────────────────────────────────────────────

    pub fn identity(&self) -> Option<UserIdentity> {
        self.get(StoreKey::Identity)
    }

    pub fn set_identity(&mut self, identity: &UserIdentity) -> Result<()> {
        self.set(StoreKey::Identity, identity)
    }

    pub fn owners(&self) -> Option<Vec<String>> {
        self.get(StoreKey::Owners)
    }

    pub fn set_owners(&mut self, owners: &[String]) -> Result<()> {
        self.set(StoreKey::Owners, &owners)
    }

    pub fn username(&self) -> Option<String> {
        self.get(StoreKey::Username)
    }

    pub fn set_username(&mut self, username: &str) -> Result<()> {
        self.set(StoreKey::Username, &username)
    }

    /// Drops everything derived from the identity; the next tick re-resolves it.
    pub fn clear_directory_cache(&mut self) -> Result<()> {
        self.values.remove(StoreKey::Owners.as_str());
        self.values.remove(StoreKey::Username.as_str());
        self.values.remove(StoreKey::LatestSession.as_str());
        self.save()
    }

    pub fn latest_session(&self) -> Option<SessionSnapshot> {
        self.get(StoreKey::LatestSession)
    }

    /// Caches the latest snapshot; `None` records that the worker has no time card.
    pub fn set_latest_session(&mut self, snapshot: Option<&SessionSnapshot>) -> Result<()> {
        match snapshot {
            Some(snapshot) => self.set(StoreKey::LatestSession, snapshot),
            None => self.remove(StoreKey::LatestSession).map(|_| ()),
        }
    }

    pub fn presence(&self) -> Option<PresenceSnapshot> {
        self.get(StoreKey::Presence)
    }

    pub fn set_presence(&mut self, presence: &PresenceSnapshot) -> Result<()> {
        self.set(StoreKey::Presence, presence)
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.get(StoreKey::LastUpdated)
    }

    pub fn set_last_updated(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.set(StoreKey::LastUpdated, &at)
    }

    pub fn break_marker(&self) -> Option<BreakStartMarker> {
        self.get(StoreKey::BreakStart)
    }

    /// Records a suspend marker unless one is already waiting to be consumed.
    /// Returns whether the marker was written.
    pub fn record_break_marker(&mut self, marker: &BreakStartMarker) -> Result<bool> {
        if self.contains(StoreKey::BreakStart) {
            return Ok(false);
        }
        self.set(StoreKey::BreakStart, marker)?;
        Ok(true)
    }

    pub fn clear_break_marker(&mut self) -> Result<bool> {
        self.remove(StoreKey::BreakStart)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionState;
    use chrono::TimeZone;

    fn identity() -> UserIdentity {
        UserIdentity {
            user_id: "user-1".to_string(),
            team_id: "team-1".to_string(),
            email: "ada@example.com".to_string(),
            team_name: "Engines".to_string(),
        }
    }

    #[test]
    fn values_survive_reload() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("state.json");

        let mut store = StateStore::load(&path).expect("load");
        store.set_identity(&identity()).expect("identity");
        store
            .set_owners(&["lead@example.com".to_string()])
            .expect("owners");
        store
            .set_latest_session(Some(&SessionSnapshot {
                id: "card-1".to_string(),
                state: SessionState::ClockedIn,
                clock_in: Some(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()),
                clock_out: None,
                breaks: Vec::new(),
            }))
            .expect("session");

        let reloaded = StateStore::load(&path).expect("reload");
        assert_eq!(reloaded.identity(), Some(identity()));
        assert_eq!(reloaded.owners(), Some(vec!["lead@example.com".to_string()]));
        assert_eq!(
            reloaded.latest_session().map(|s| s.state),
            Some(SessionState::ClockedIn)
        );
    }

    #[test]
    fn corrupt_document_loads_empty() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("state.json");
        fs_err::write(&path, "{not json").expect("write");

        let store = StateStore::load(&path).expect("load");
        assert!(store.identity().is_none());
    }

    #[test]
    fn unknown_keys_are_preserved() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("state.json");
        fs_err::write(&path, r#"{"legacy-key": 42}"#).expect("write");

        let mut store = StateStore::load(&path).expect("load");
        store.set_username("Ada").expect("username");

        let raw = fs_err::read_to_string(&path).expect("read");
        assert!(raw.contains("legacy-key"));
        assert!(raw.contains("Ada"));
    }

    #[test]
    fn malformed_value_reads_as_absent() {
        let mut store = StateStore::new_in_memory();
        store.set(StoreKey::Identity, &"not an identity").expect("set");
        assert!(store.identity().is_none());
    }

    #[test]
    fn only_one_break_marker_at_a_time() {
        let mut store = StateStore::new_in_memory();
        let first = BreakStartMarker {
            started_at: Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap(),
            session_id: Some("card-1".to_string()),
        };
        let second = BreakStartMarker {
            started_at: Utc.with_ymd_and_hms(2026, 3, 2, 13, 0, 0).unwrap(),
            session_id: Some("card-1".to_string()),
        };

        assert!(store.record_break_marker(&first).expect("first"));
        assert!(!store.record_break_marker(&second).expect("second"));
        assert_eq!(store.break_marker(), Some(first));

        assert!(store.clear_break_marker().expect("clear"));
        assert!(!store.clear_break_marker().expect("clear again"));
        assert!(store.break_marker().is_none());
    }

    #[test]
    fn clearing_directory_cache_keeps_identity() {
        let mut store = StateStore::new_in_memory();
        store.set_identity(&identity()).expect("identity");
        store.set_username("Ada").expect("username");
        store.set_owners(&[]).expect("owners");

        store.clear_directory_cache().expect("clear");
        assert!(store.identity().is_some());
        assert!(store.username().is_none());
        assert!(store.owners().is_none());
    }
}
