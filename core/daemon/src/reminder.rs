//! Deferred clock-in.
//!
//! Entered when the worker declines a clock-in prompt. Each cycle asks for a
//! delay, sleeps, then asks about clock-in again. The chain is a plain loop,
//! so deferring forever does not grow the stack. It ends when clock-in is
//! accepted, the cached card is no longer clocked out, a clock-out prompt
//! takes over, or the generation is torn down.

use std::time::Duration;
use tracing::{debug, info};

use timeclock_core::{Phase, PromptKind};

use crate::agent::Agent;
use crate::prompt::PromptReply;

impl Agent {
    pub(crate) async fn run_reminder_chain(&self) {
        let mut delay_minutes = self.services.config.sync.default_reminder_minutes.max(1);

        loop {
            match self.services.prompts.ask(PromptKind::ReminderDelay).await {
                Some(PromptReply::DelayMinutes(Some(minutes))) => delay_minutes = minutes.max(1),
                Some(_) => {}
                None => {
                    self.close_prompt();
                    return;
                }
            }

            if self.with_control(|control| control.start_reminder_wait()) != Some(true) {
                return;
            }
            info!(delay_minutes, "Clock-in reminder scheduled");
            tokio::time::sleep(Duration::from_secs(u64::from(delay_minutes) * 60)).await;

            if !self.cached_state().is_clocked_out() {
                info!("Already clocked in; ending reminder chain");
                self.with_control(|control| {
                    if control.phase() == Phase::Reminding {
                        control.close();
                    }
                });
                return;
            }
            if self.with_control(|control| control.reopen_from_reminder()) != Some(true) {
                debug!("Reminder chain was superseded");
                return;
            }

            info!("Reminder elapsed; asking to clock in again");
            match self.services.prompts.ask(PromptKind::ClockIn).await {
                Some(PromptReply::Confirm(true)) => {
                    self.clock_in_sequence().await;
                    self.close_prompt();
                    return;
                }
                Some(PromptReply::Confirm(false)) => {
                    if self.with_control(|control| control.decline_clock_in()) != Some(true) {
                        return;
                    }
                }
                _ => {
                    self.close_prompt();
                    return;
                }
            }
        }
    }
}
