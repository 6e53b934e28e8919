//! Presence refresh chain and the daily report row.
//!
//! Runs beside the sync loop on its own interval. Remote availability is
//! stored for status and reporting only; it never drives a break.

use chrono::Local;
use std::sync::Arc;
use tracing::{debug, error, warn};

use timeclock_core::{build_report_row, PresenceSnapshot};

use crate::agent::Agent;

impl Agent {
    pub(crate) async fn run_presence_loop(self: Arc<Self>) {
        let interval = self.services.config.sync.presence_interval();
        loop {
            self.refresh_presence().await;
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Fetches remote presence, stores it and publishes today's report row.
    pub async fn refresh_presence(&self) -> Option<PresenceSnapshot> {
        let identity = self.identity()?;
        let remote = match self.services.sessions.fetch_presence(&identity).await {
            Ok(remote) => remote,
            Err(err) if err.is_transient() => {
                error!(error = %err, "Presence fetch lost connectivity");
                self.restart.request(format!("presence fetch failed: {}", err));
                return None;
            }
            Err(err) => {
                warn!(error = %err, "Presence fetch failed");
                return None;
            }
        };

        let now = self.services.clock.now();
        let snapshot = PresenceSnapshot {
            availability: remote.availability,
            activity: remote.activity,
            worker_active: self.services.activity.is_active(now),
            observed_at: now,
        };
        debug!(
            availability = %snapshot.availability,
            worker_active = snapshot.worker_active,
            "Presence refreshed"
        );
        self.write_store("presence", |store| store.set_presence(&snapshot));
        self.publish_report(&snapshot).await;
        Some(snapshot)
    }

    async fn publish_report(&self, presence: &PresenceSnapshot) {
        let Some(sink) = self.services.report.as_ref() else {
            return;
        };
        let Some(identity) = self.identity() else {
            return;
        };
        let (session, username, last_updated) = match self.read_store(|store| {
            (
                store.latest_session(),
                store.username(),
                store.last_updated(),
            )
        }) {
            Some(values) => values,
            None => return,
        };
        let Some(session) = session else {
            debug!("No time card yet; skipping report");
            return;
        };

        let now = self.services.clock.now();
        let username = username.unwrap_or_else(|| identity.email.clone());
        let Some(row) = build_report_row(
            &username,
            &identity,
            &session,
            Some(presence),
            last_updated.unwrap_or(now),
            now,
            &Local,
        ) else {
            debug!(session_id = %session.id, "Time card is from another day; skipping report");
            return;
        };

        if let Err(err) = sink.upsert_day(&row).await {
            warn!(error = %err, date = %row.date, "Failed to publish report row");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::Clock;
    use crate::testing::{card, Harness};
    use timeclock_core::{Availability, SessionState};

    #[tokio::test(start_paused = true)]
    async fn presence_is_stored_with_the_local_activity_signal() {
        let harness = Harness::new();
        harness.activity.report(900, harness.clock.now());
        let agent = harness.agent();

        let snapshot = agent.refresh_presence().await.expect("presence");
        assert_eq!(snapshot.availability, Availability::Available);
        assert!(!snapshot.worker_active);
        assert_eq!(agent.status().presence, Some(snapshot));
    }

    #[tokio::test(start_paused = true)]
    async fn report_row_is_published_for_todays_card() {
        let harness = Harness::new();
        harness.seed_cached_card(card(SessionState::ClockedIn, Vec::new()));
        let agent = harness.agent();

        agent.refresh_presence().await;

        let rows = harness.report.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].team_name, "Engines");
        assert!(rows[0].availability.contains("Available"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_presence_failure_relaunches() {
        let harness = Harness::new();
        harness.sessions.fail_transient("fetch_presence");
        let agent = harness.agent();

        assert!(agent.refresh_presence().await.is_none());
        assert_eq!(harness.restart_requests(), 1);
        assert!(harness.report.rows().is_empty());
    }
}
