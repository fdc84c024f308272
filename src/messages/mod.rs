//! Conversation data model and the per-task message logs.
//!
//! Two append-only logs exist per task: the API conversation history
//! (role-tagged messages sent to and received from the model) and the
//! UI-facing message log (ask/say records the host renders). Both are
//! owned by `MessageManager` and persisted on every mutation.

pub mod persistence;
pub mod reconcile;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One block of message content. Serialized with an explicit `type` tag so
/// the on-disk history stays self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    Reasoning {
        text: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, ContentBlock::ToolResult { .. })
    }
}

/// One entry in the API conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub ts: i64,
    /// Logical position used as the unit of checkpoint restoration
    /// precision. Present on assistant messages only.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub conversation_index: Option<u64>,
}

impl ApiMessage {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content,
            ts: chrono::Utc::now().timestamp_millis(),
            conversation_index: None,
        }
    }

    pub fn assistant(content: Vec<ContentBlock>, conversation_index: Option<u64>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            ts: chrono::Utc::now().timestamp_millis(),
            conversation_index,
        }
    }

    /// Tool-use ids in this message, in emission order.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// The kind of question an ask record poses. Classification into the three
/// pending classes drives which lifecycle event the bus carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskKind {
    Followup,
    Command,
    CommandOutput,
    Tool,
    CompletionResult,
    ApiReqFailed,
    MistakeLimitReached,
    ResumeTask,
    ResumeCompletedTask,
}

impl AskKind {
    /// The task finished its turn; nothing blocks, the user may respond
    /// whenever they like.
    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            AskKind::CompletionResult | AskKind::ApiReqFailed | AskKind::MistakeLimitReached
        )
    }

    /// The task stopped mid-flight and can be picked back up.
    pub fn is_resumable(&self) -> bool {
        matches!(self, AskKind::ResumeTask | AskKind::ResumeCompletedTask)
    }

    /// The task is blocked waiting for an approval or answer.
    pub fn is_interactive(&self) -> bool {
        !self.is_idle() && !self.is_resumable()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SayKind {
    Task,
    Text,
    Reasoning,
    Error,
    ApiReqStarted,
    ApiReqRetryDelayed,
    CompletionResult,
    SubtaskResult,
    UserFeedback,
    CheckpointSaved,
    ToolProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiMessageKind {
    Ask { ask: AskKind },
    Say { say: SayKind },
}

/// One entry in the UI-facing message log. Mutable in place only while
/// `partial` is true, and only ever as the last record of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
    pub ts: i64,
    #[serde(flatten)]
    pub kind: UiMessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[serde(default)]
    pub partial: bool,
    /// Shadow-repo commit hash, set on checkpoint markers.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub checkpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub progress_status: Option<serde_json::Value>,
}

impl UiMessage {
    pub fn say(kind: SayKind, text: Option<String>) -> Self {
        Self {
            ts: chrono::Utc::now().timestamp_millis(),
            kind: UiMessageKind::Say { say: kind },
            text,
            images: Vec::new(),
            partial: false,
            checkpoint: None,
            progress_status: None,
        }
    }

    pub fn ask(kind: AskKind, text: Option<String>) -> Self {
        Self {
            ts: chrono::Utc::now().timestamp_millis(),
            kind: UiMessageKind::Ask { ask: kind },
            text,
            images: Vec::new(),
            partial: false,
            checkpoint: None,
            progress_status: None,
        }
    }
}

/// Owns both message logs for one task instance. All access goes through
/// the async mutexes; every mutation is persisted before returning.
pub struct MessageManager {
    task_id: String,
    storage_root: PathBuf,
    api_history: Mutex<Vec<ApiMessage>>,
    ui_messages: Mutex<Vec<UiMessage>>,
}

impl MessageManager {
    pub fn new(task_id: impl Into<String>, storage_root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            task_id: task_id.into(),
            storage_root: storage_root.into(),
            api_history: Mutex::new(Vec::new()),
            ui_messages: Mutex::new(Vec::new()),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn storage_root(&self) -> &PathBuf {
        &self.storage_root
    }

    /// Load both logs from durable storage. Missing files read as empty.
    pub async fn load(&self) -> Result<()> {
        let api = persistence::read_api_messages(&self.storage_root, &self.task_id).await?;
        let ui = persistence::read_ui_messages(&self.storage_root, &self.task_id).await?;
        *self.api_history.lock().await = api;
        *self.ui_messages.lock().await = ui;
        Ok(())
    }

    pub async fn api_history(&self) -> Vec<ApiMessage> {
        self.api_history.lock().await.clone()
    }

    pub async fn api_history_len(&self) -> usize {
        self.api_history.lock().await.len()
    }

    pub async fn add_api_message(&self, message: ApiMessage) -> Result<()> {
        let snapshot = {
            let mut history = self.api_history.lock().await;
            history.push(message);
            history.clone()
        };
        self.persist_api(&snapshot).await
    }

    /// Replace the entire history, used by conversation restore.
    pub async fn overwrite_api_history(&self, messages: Vec<ApiMessage>) -> Result<()> {
        let snapshot = {
            let mut history = self.api_history.lock().await;
            *history = messages;
            history.clone()
        };
        self.persist_api(&snapshot).await
    }

    /// Drop the most recent history entry, used when a failed attempt's
    /// user message must be removed before the retry re-appends it.
    pub async fn pop_api_message(&self) -> Result<Option<ApiMessage>> {
        let (popped, snapshot) = {
            let mut history = self.api_history.lock().await;
            let popped = history.pop();
            (popped, history.clone())
        };
        if popped.is_some() {
            self.persist_api(&snapshot).await?;
        }
        Ok(popped)
    }

    pub async fn ui_messages(&self) -> Vec<UiMessage> {
        self.ui_messages.lock().await.clone()
    }

    pub async fn add_ui_message(&self, message: UiMessage) -> Result<i64> {
        let (ts, snapshot) = {
            let mut messages = self.ui_messages.lock().await;
            let ts = message.ts;
            messages.push(message);
            (ts, messages.clone())
        };
        self.persist_ui(&snapshot).await?;
        Ok(ts)
    }

    pub async fn last_ui_message(&self) -> Option<UiMessage> {
        self.ui_messages.lock().await.last().cloned()
    }

    /// Mutate the last record in place. The caller is responsible for the
    /// partial-last-only discipline; this never touches earlier records.
    pub async fn update_last_ui_message(
        &self,
        update: impl FnOnce(&mut UiMessage),
    ) -> Result<bool> {
        let snapshot = {
            let mut messages = self.ui_messages.lock().await;
            match messages.last_mut() {
                Some(last) => {
                    update(last);
                    messages.clone()
                }
                None => return Ok(false),
            }
        };
        self.persist_ui(&snapshot).await?;
        Ok(true)
    }

    /// Point lookup by timestamp, scanning from the tail since lookups
    /// overwhelmingly target recent records.
    pub async fn find_ui_message_by_ts(&self, ts: i64) -> Option<UiMessage> {
        self.ui_messages
            .lock()
            .await
            .iter()
            .rev()
            .find(|m| m.ts == ts)
            .cloned()
    }

    pub async fn overwrite_ui_messages(&self, messages: Vec<UiMessage>) -> Result<()> {
        let snapshot = {
            let mut ui = self.ui_messages.lock().await;
            *ui = messages;
            ui.clone()
        };
        self.persist_ui(&snapshot).await
    }

    /// Index of the most recent `api_req_started` say record, the anchor
    /// the streaming loop updates with per-request metadata.
    pub async fn last_api_req_started_index(&self) -> Option<usize> {
        self.ui_messages
            .lock()
            .await
            .iter()
            .rposition(|m| matches!(m.kind, UiMessageKind::Say { say: SayKind::ApiReqStarted }))
    }

    async fn persist_api(&self, snapshot: &[ApiMessage]) -> Result<()> {
        persistence::save_api_messages(&self.storage_root, &self.task_id, snapshot)
            .await
            .map_err(|e| {
                warn!(task_id = %self.task_id, "failed to persist api history: {e}");
                e.into()
            })
    }

    async fn persist_ui(&self, snapshot: &[UiMessage]) -> Result<()> {
        persistence::save_ui_messages(&self.storage_root, &self.task_id, snapshot)
            .await
            .map_err(|e| {
                warn!(task_id = %self.task_id, "failed to persist ui messages: {e}");
                e.into()
            })
    }
}
