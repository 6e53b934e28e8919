//! Maps the tick's signals to at most one attendance action.
//!
//! Break start/end follow the local activity signal only. Remote availability
//! never reaches this function.

use crate::types::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickInputs {
    /// The collaboration client is running locally.
    pub client_running: bool,
    /// The worker has used the machine within the idle threshold.
    pub worker_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    /// Needs confirmation.
    PromptClockIn,
    /// Needs confirmation.
    PromptClockOut,
    StartBreak,
    EndBreak,
}

pub fn next_action(state: SessionState, inputs: TickInputs) -> Action {
    match (state, inputs.client_running, inputs.worker_active) {
        (SessionState::ClockedOut | SessionState::Unknown, true, _) => Action::PromptClockIn,
        (SessionState::ClockedOut | SessionState::Unknown, false, _) => Action::None,
        (SessionState::ClockedIn, true, false) => Action::StartBreak,
        (SessionState::ClockedIn, true, true) => Action::None,
        (SessionState::ClockedIn, false, _) => Action::PromptClockOut,
        (SessionState::OnBreak, true, true) => Action::EndBreak,
        (SessionState::OnBreak, true, false) => Action::None,
        // Client closed mid-break: close the break without asking.
        (SessionState::OnBreak, false, _) => Action::EndBreak,
    }
}
