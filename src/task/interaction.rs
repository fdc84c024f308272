//! The ask/say protocol: blocking questions and fire-and-forget progress.
//!
//! `say` appends (or streams into) UI records. `ask` appends a question,
//! registers it under one of three pending classes (idle, resumable,
//! interactive), then polls until a response lands or the task aborts.
//! Only the last record of the log may be partial; finalization flips the
//! flag in place.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::errors::{Result, RuntimeError, TaskError};
use crate::events::{EventBus, TaskEvent};
use crate::messages::{AskKind, MessageManager, SayKind, UiMessage, UiMessageKind};
use crate::task::state::TaskStateManager;

const ASK_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AskResponseKind {
    Approved,
    Denied,
    MessageResponse,
}

#[derive(Debug, Clone)]
pub struct AskResponse {
    pub kind: AskResponseKind,
    pub text: Option<String>,
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct PendingAsk {
    pub ts: i64,
    pub kind: AskKind,
}

pub struct UserInteractionManager {
    state: Arc<TaskStateManager>,
    messages: Arc<MessageManager>,
    bus: Arc<EventBus>,
    pending_idle: Mutex<Option<PendingAsk>>,
    pending_resumable: Mutex<Option<PendingAsk>>,
    pending_interactive: Mutex<Option<PendingAsk>>,
    response: Mutex<Option<AskResponse>>,
}

impl UserInteractionManager {
    pub fn new(
        state: Arc<TaskStateManager>,
        messages: Arc<MessageManager>,
        bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            messages,
            bus,
            pending_idle: Mutex::new(None),
            pending_resumable: Mutex::new(None),
            pending_interactive: Mutex::new(None),
            response: Mutex::new(None),
        })
    }

    // ─── Say ───────────────────────────────────────────────────────

    /// Append or stream a progress record. On an aborted task this is a
    /// silent no-op.
    ///
    /// `partial = Some(true)` streams: the last record is updated in
    /// place when it is the same kind and still partial, otherwise a new
    /// partial record is appended. `Some(false)` finalizes the matching
    /// partial (or appends a complete record). `None` appends complete.
    pub async fn say(
        &self,
        kind: SayKind,
        text: Option<String>,
        partial: Option<bool>,
    ) -> Result<Option<i64>> {
        if self.state.is_aborted() {
            return Ok(None);
        }

        match partial {
            Some(true) => {
                if self.last_is_partial_say(kind).await {
                    self.messages
                        .update_last_ui_message(|m| m.text = text)
                        .await?;
                    Ok(None)
                } else {
                    let mut message = UiMessage::say(kind, text);
                    message.partial = true;
                    Ok(Some(self.messages.add_ui_message(message).await?))
                }
            }
            Some(false) => {
                if self.last_is_partial_say(kind).await {
                    self.messages
                        .update_last_ui_message(|m| {
                            m.text = text;
                            m.partial = false;
                        })
                        .await?;
                    Ok(None)
                } else {
                    Ok(Some(
                        self.messages.add_ui_message(UiMessage::say(kind, text)).await?,
                    ))
                }
            }
            None => Ok(Some(
                self.messages.add_ui_message(UiMessage::say(kind, text)).await?,
            )),
        }
    }

    async fn last_is_partial_say(&self, kind: SayKind) -> bool {
        matches!(
            self.messages.last_ui_message().await,
            Some(UiMessage { kind: UiMessageKind::Say { say }, partial: true, .. }) if say == kind
        )
    }

    // ─── Ask ───────────────────────────────────────────────────────

    /// Pose a question and block until a response arrives or the task
    /// aborts. Partial asks (`partial = Some(true)`) stream the question
    /// text without blocking and return `None`.
    pub async fn ask(
        &self,
        kind: AskKind,
        text: Option<String>,
        partial: Option<bool>,
    ) -> Result<Option<AskResponse>> {
        if self.state.is_aborted() {
            return Err(TaskError::Aborted {
                task_id: self.state.task_id().to_string(),
            }
            .into());
        }

        let ts = match partial {
            Some(true) => {
                if self.last_is_partial_ask(kind).await {
                    self.messages
                        .update_last_ui_message(|m| m.text = text)
                        .await?;
                } else {
                    let mut message = UiMessage::ask(kind, text);
                    message.partial = true;
                    self.messages.add_ui_message(message).await?;
                }
                return Ok(None);
            }
            Some(false) => {
                if self.last_is_partial_ask(kind).await {
                    let mut finalized_ts = 0;
                    self.messages
                        .update_last_ui_message(|m| {
                            m.text = text;
                            m.partial = false;
                            finalized_ts = m.ts;
                        })
                        .await?;
                    finalized_ts
                } else {
                    self.messages.add_ui_message(UiMessage::ask(kind, text)).await?
                }
            }
            None => self.messages.add_ui_message(UiMessage::ask(kind, text)).await?,
        };

        *self.response.lock().expect("ask response poisoned") = None;
        self.state.set_last_message_ts(ts);
        self.register_pending(PendingAsk { ts, kind });
        self.emit_ask_event(kind, ts);

        loop {
            tokio::time::sleep(ASK_POLL_INTERVAL).await;

            if self.state.is_aborted() {
                return Err(TaskError::Aborted {
                    task_id: self.state.task_id().to_string(),
                }
                .into());
            }
            // A newer message superseded this ask; its answer will never
            // arrive.
            if self.state.last_message_ts() != ts {
                return Err(RuntimeError::Internal(
                    "ask superseded by a newer message".to_string(),
                ));
            }
            if let Some(response) = self.response.lock().expect("ask response poisoned").take() {
                self.clear_asks();
                return Ok(Some(response));
            }
        }
    }

    async fn last_is_partial_ask(&self, kind: AskKind) -> bool {
        matches!(
            self.messages.last_ui_message().await,
            Some(UiMessage { kind: UiMessageKind::Ask { ask }, partial: true, .. }) if ask == kind
        )
    }

    fn register_pending(&self, pending: PendingAsk) {
        let slot = if pending.kind.is_idle() {
            &self.pending_idle
        } else if pending.kind.is_resumable() {
            &self.pending_resumable
        } else {
            &self.pending_interactive
        };
        *slot.lock().expect("pending ask poisoned") = Some(pending);
    }

    fn emit_ask_event(&self, kind: AskKind, ts: i64) {
        let task_id = self.state.task_id().to_string();
        let event = if kind.is_idle() {
            TaskEvent::IdleAsk { task_id, ts }
        } else if kind.is_resumable() {
            TaskEvent::ResumableAsk { task_id, ts }
        } else {
            TaskEvent::InteractiveAsk { task_id, ts }
        };
        self.bus.emit(event);
    }

    /// Deliver the user's answer to whatever ask is currently blocked.
    pub fn handle_ask_response(
        &self,
        kind: AskResponseKind,
        text: Option<String>,
        images: Vec<String>,
    ) {
        debug!(task_id = %self.state.task_id(), ?kind, "ask response received");
        *self.response.lock().expect("ask response poisoned") =
            Some(AskResponse { kind, text, images });
    }

    pub fn approve(&self) {
        self.handle_ask_response(AskResponseKind::Approved, None, Vec::new());
    }

    pub fn deny(&self) {
        self.handle_ask_response(AskResponseKind::Denied, None, Vec::new());
    }

    pub fn pending_idle_ask(&self) -> Option<PendingAsk> {
        *self.pending_idle.lock().expect("pending ask poisoned")
    }

    pub fn pending_resumable_ask(&self) -> Option<PendingAsk> {
        *self.pending_resumable.lock().expect("pending ask poisoned")
    }

    pub fn pending_interactive_ask(&self) -> Option<PendingAsk> {
        *self.pending_interactive.lock().expect("pending ask poisoned")
    }

    pub fn clear_asks(&self) {
        *self.pending_idle.lock().expect("pending ask poisoned") = None;
        *self.pending_resumable.lock().expect("pending ask poisoned") = None;
        *self.pending_interactive.lock().expect("pending ask poisoned") = None;
    }
}
