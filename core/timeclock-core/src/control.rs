//! Process-local guards for the synchronization loop and its sub-flows.
//!
//! One `Phase` replaces the separate prompt/reminder booleans: a prompt can only
//! open from a phase that allows it, so two prompts can never be open at once.
//! State is never persisted; a relaunch starts from `Phase::Idle`.

use serde::Serialize;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    ClockIn,
    ClockOut,
    ReminderDelay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    /// A clock-in or clock-out confirmation is waiting for an answer.
    Prompting(PromptKind),
    /// The worker declined a clock-in and is being asked for a reminder delay.
    AwaitingDelay,
    /// The reminder chain is sleeping until its next clock-in prompt.
    Reminding,
}

/// Flag view of the control state, as reported by `get_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControlFlags {
    pub prompt_open: bool,
    pub reminder_open: bool,
    pub reminder_loop_active: bool,
    pub main_loop_active: bool,
}

#[derive(Debug)]
pub struct LoopControl {
    phase: Phase,
    reminder_chain: bool,
    main_loop_active: bool,
}

impl Default for LoopControl {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            reminder_chain: false,
            main_loop_active: false,
        }
    }
}

impl LoopControl {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn flags(&self) -> ControlFlags {
        ControlFlags {
            prompt_open: matches!(self.phase, Phase::Prompting(_)),
            reminder_open: self.phase == Phase::AwaitingDelay,
            reminder_loop_active: self.reminder_chain,
            main_loop_active: self.main_loop_active,
        }
    }

    /// Opens a confirmation prompt raised by the main loop.
    ///
    /// Clock-in needs a fully idle loop (no reminder chain either). Clock-out may
    /// also interrupt a sleeping reminder chain, which then ends on its next wake.
    pub fn try_open_prompt(&mut self, kind: PromptKind) -> bool {
        let allowed = match kind {
            PromptKind::ClockIn => self.phase == Phase::Idle,
            PromptKind::ClockOut => matches!(self.phase, Phase::Idle | Phase::Reminding),
            PromptKind::ReminderDelay => false,
        };
        if allowed {
            self.phase = Phase::Prompting(kind);
            self.reminder_chain = false;
        }
        allowed
    }

    /// Reminder chain woke up and wants to ask about clock-in again.
    pub fn reopen_from_reminder(&mut self) -> bool {
        if self.phase != Phase::Reminding || !self.reminder_chain {
            return false;
        }
        self.phase = Phase::Prompting(PromptKind::ClockIn);
        true
    }

    /// The clock-in prompt was declined; ask for a reminder delay next.
    pub fn decline_clock_in(&mut self) -> bool {
        if self.phase != Phase::Prompting(PromptKind::ClockIn) {
            return false;
        }
        self.phase = Phase::AwaitingDelay;
        self.reminder_chain = true;
        true
    }

    /// The delay was chosen; the chain sleeps until the next reminder.
    pub fn start_reminder_wait(&mut self) -> bool {
        if self.phase != Phase::AwaitingDelay {
            return false;
        }
        self.phase = Phase::Reminding;
        true
    }

    /// Closes whatever is open and ends any reminder chain.
    pub fn close(&mut self) {
        self.phase = Phase::Idle;
        self.reminder_chain = false;
    }

    /// Clears everything, including the tick guard. Used when a new loop generation starts.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn begin_tick(&mut self) -> bool {
        if self.main_loop_active {
            return false;
        }
        self.main_loop_active = true;
        true
    }
}

/// Shared handle used by the loop, its sub-flows and the IPC status view.
pub type SharedControl = Arc<Mutex<LoopControl>>;

/// Holds the tick re-entrancy flag for as long as it lives.
pub struct TickGuard {
    control: SharedControl,
}

impl TickGuard {
    /// Returns `None` when another tick is still in flight.
    pub fn acquire(control: &SharedControl) -> Option<Self> {
        let acquired = control
            .lock()
            .map(|mut state| state.begin_tick())
            .unwrap_or(false);
        acquired.then(|| TickGuard {
            control: Arc::clone(control),
        })
    }
}

impl Drop for TickGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.control.lock() {
            state.main_loop_active = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_cannot_open_twice() {
        let mut control = LoopControl::default();
        assert!(control.try_open_prompt(PromptKind::ClockIn));
        assert!(!control.try_open_prompt(PromptKind::ClockIn));
        assert!(!control.try_open_prompt(PromptKind::ClockOut));
        assert!(control.flags().prompt_open);

        control.close();
        assert!(!control.flags().prompt_open);
        assert!(control.try_open_prompt(PromptKind::ClockOut));
    }

    #[test]
    fn reminder_chain_walks_through_phases() {
        let mut control = LoopControl::default();
        assert!(control.try_open_prompt(PromptKind::ClockIn));
        assert!(control.decline_clock_in());
        assert!(control.flags().reminder_open);
        assert!(control.flags().reminder_loop_active);

        assert!(control.start_reminder_wait());
        assert_eq!(control.phase(), Phase::Reminding);
        assert!(!control.try_open_prompt(PromptKind::ClockIn));

        assert!(control.reopen_from_reminder());
        assert_eq!(control.phase(), Phase::Prompting(PromptKind::ClockIn));
        assert!(control.flags().reminder_loop_active);

        control.close();
        assert_eq!(control.phase(), Phase::Idle);
        assert!(!control.flags().reminder_loop_active);
    }

    #[test]
    fn clock_out_prompt_ends_sleeping_reminder_chain() {
        let mut control = LoopControl::default();
        control.try_open_prompt(PromptKind::ClockIn);
        control.decline_clock_in();
        control.start_reminder_wait();

        assert!(control.try_open_prompt(PromptKind::ClockOut));
        control.close();
        assert!(!control.reopen_from_reminder());
    }

    #[test]
    fn reminder_delay_is_never_opened_by_the_loop() {
        let mut control = LoopControl::default();
        assert!(!control.try_open_prompt(PromptKind::ReminderDelay));
        assert_eq!(control.phase(), Phase::Idle);
    }

    #[test]
    fn tick_guard_is_exclusive_and_released_on_drop() {
        let control: SharedControl = Arc::new(Mutex::new(LoopControl::default()));
        let guard = TickGuard::acquire(&control).expect("first tick");
        assert!(TickGuard::acquire(&control).is_none());
        assert!(control.lock().unwrap().flags().main_loop_active);

        drop(guard);
        assert!(!control.lock().unwrap().flags().main_loop_active);
        assert!(TickGuard::acquire(&control).is_some());
    }
}
