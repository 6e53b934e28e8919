//! Human-in-the-loop prompts.
//!
//! The sync loop asks through the `Prompter` trait and suspends until an answer
//! arrives. `PromptRegistry` parks each question behind a oneshot channel and
//! lets IPC clients list and answer them. There is no timeout: a prompt stays
//! open until it is answered or its generation is torn down.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};

use timeclock_core::PromptKind;
use timeclock_daemon_protocol::{ErrorInfo, PromptAnswer, PromptKindWire, PromptView};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptReply {
    Confirm(bool),
    /// `None` keeps the previous delay.
    DelayMinutes(Option<u32>),
}

#[async_trait]
pub trait Prompter: Send + Sync {
    /// Waits for the answer. `None` means the prompt was withdrawn.
    async fn ask(&self, kind: PromptKind) -> Option<PromptReply>;

    /// Withdraws every open prompt; pending `ask` calls return `None`.
    fn withdraw_all(&self);
}

struct PendingPrompt {
    kind: PromptKind,
    opened_at: DateTime<Utc>,
    reply: oneshot::Sender<PromptReply>,
}

#[derive(Default)]
pub struct PromptRegistry {
    next_id: AtomicU64,
    pending: Mutex<BTreeMap<u64, PendingPrompt>>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> Vec<PromptView> {
        self.pending
            .lock()
            .map(|pending| {
                pending
                    .iter()
                    .map(|(id, prompt)| PromptView {
                        id: *id,
                        kind: wire_kind(prompt.kind),
                        opened_at: prompt.opened_at,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn answer(&self, id: u64, answer: PromptAnswer) -> Result<(), ErrorInfo> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| ErrorInfo::new("internal_error", "prompt registry is unavailable"))?;

        let kind = pending
            .get(&id)
            .map(|prompt| prompt.kind)
            .ok_or_else(|| ErrorInfo::new("unknown_prompt", format!("no open prompt {}", id)))?;

        let reply = match (kind, answer) {
            (PromptKind::ClockIn | PromptKind::ClockOut, PromptAnswer::Confirm(confirmed)) => {
                PromptReply::Confirm(confirmed)
            }
            (PromptKind::ReminderDelay, PromptAnswer::DelayMinutes(minutes)) => {
                PromptReply::DelayMinutes(minutes)
            }
            _ => {
                return Err(ErrorInfo::new(
                    "answer_mismatch",
                    format!("prompt {} expects a different kind of answer", id),
                ))
            }
        };

        if let Some(prompt) = pending.remove(&id) {
            info!(prompt_id = id, kind = ?prompt.kind, reply = ?reply, "Prompt answered");
            let _ = prompt.reply.send(reply);
        }
        Ok(())
    }
}

/// Removes the entry if the asking task is dropped before an answer arrives.
struct PendingGuard<'a> {
    registry: &'a PromptRegistry,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.registry.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

#[async_trait]
impl Prompter for PromptRegistry {
    async fn ask(&self, kind: PromptKind) -> Option<PromptReply> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().ok()?;
            pending.insert(
                id,
                PendingPrompt {
                    kind,
                    opened_at: Utc::now(),
                    reply: tx,
                },
            );
        }
        info!(prompt_id = id, kind = ?kind, "Prompt opened");

        let _guard = PendingGuard { registry: self, id };
        let reply = rx.await.ok();
        if reply.is_none() {
            debug!(prompt_id = id, "Prompt withdrawn");
        }
        reply
    }

    fn withdraw_all(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            if !pending.is_empty() {
                info!(count = pending.len(), "Withdrawing open prompts");
            }
            pending.clear();
        }
    }
}

fn wire_kind(kind: PromptKind) -> PromptKindWire {
    match kind {
        PromptKind::ClockIn => PromptKindWire::ClockIn,
        PromptKind::ClockOut => PromptKindWire::ClockOut,
        PromptKind::ReminderDelay => PromptKindWire::ReminderDelay,
    }
}
