//! One agent run: the bundle of per-task managers and its event bus.

pub mod interaction;
pub mod manager;
pub mod request;
pub mod state;
pub mod tool_calls;
pub mod usage;

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::checkpoint::{CheckpointManager, ShadowCheckpointService};
use crate::errors::{is_abort_error, Result};
use crate::events::{EventBus, TaskEvent};
use crate::messages::{ApiMessage, ContentBlock, MessageManager, SayKind};
use crate::provider::{
    ApiHandler, ContextSteward, EnvironmentReporter, ProviderHandle, ToolProtocol, ToolRunner,
};
use interaction::UserInteractionManager;
use request::ApiRequestManager;
use state::{AbortReason, TaskStateManager};
use usage::UsageTracker;

/// Everything the runtime consumes from the outside world. Cloned into
/// each task; all handles are shared, the provider deliberately weak.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Weak<dyn ProviderHandle>,
    pub api: Arc<dyn ApiHandler>,
    pub environment: Arc<dyn EnvironmentReporter>,
    pub context: Arc<dyn ContextSteward>,
    pub tools: Arc<dyn ToolRunner>,
}

/// Persisted summary of a task, enough to rehydrate it later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub id: String,
    pub number: i32,
    pub task: String,
    pub workspace: PathBuf,
    pub mode: String,
    pub tool_protocol: ToolProtocol,
    pub ts: i64,
}

pub struct Task {
    pub state: Arc<TaskStateManager>,
    pub messages: Arc<MessageManager>,
    pub usage: Arc<UsageTracker>,
    pub interaction: Arc<UserInteractionManager>,
    pub requests: Arc<ApiRequestManager>,
    pub bus: Arc<EventBus>,
    checkpoints: tokio::sync::Mutex<Option<Arc<CheckpointManager>>>,
    storage_root: PathBuf,
    task_text: String,
}

impl Task {
    /// Build a fresh task from a user prompt.
    pub fn new(
        task_text: impl Into<String>,
        workspace: impl Into<PathBuf>,
        storage_root: impl Into<PathBuf>,
        task_number: i32,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let task_id = Uuid::new_v4().to_string();
        Self::build(
            task_id,
            task_text.into(),
            workspace.into(),
            storage_root.into(),
            task_number,
            None,
            collaborators,
        )
    }

    /// Rehydrate from a persisted history item, reloading both message
    /// logs from durable storage.
    pub async fn from_history_item(
        item: HistoryItem,
        storage_root: impl Into<PathBuf>,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>> {
        let task = Self::build(
            item.id,
            item.task,
            item.workspace,
            storage_root.into(),
            item.number,
            Some((item.mode, item.tool_protocol)),
            collaborators,
        );
        task.messages.load().await?;
        let history_len = task.messages.api_history_len().await;
        info!(
            task_id = %task.state.task_id(),
            instance_id = %task.state.instance_id(),
            history_len,
            "task rehydrated"
        );
        Ok(task)
    }

    fn build(
        task_id: String,
        task_text: String,
        workspace: PathBuf,
        storage_root: PathBuf,
        task_number: i32,
        mode_override: Option<(String, ToolProtocol)>,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let (mode, tool_protocol) = mode_override.unwrap_or_else(|| {
            // Fresh tasks take their defaults from the live provider
            // config; a dead provider falls back to crate defaults.
            collaborators
                .provider
                .upgrade()
                .map(|p| {
                    let s = p.state();
                    (s.mode, s.tool_protocol)
                })
                .unwrap_or_else(|| ("code".to_string(), ToolProtocol::Native))
        });

        let bus = Arc::new(EventBus::new());
        let state = TaskStateManager::new(
            task_id.clone(),
            task_number,
            workspace,
            mode,
            tool_protocol,
            collaborators.provider,
        );
        let messages = MessageManager::new(task_id.clone(), storage_root.clone());
        let usage = UsageTracker::new(task_id.clone(), Arc::clone(&bus));
        let interaction = UserInteractionManager::new(
            Arc::clone(&state),
            Arc::clone(&messages),
            Arc::clone(&bus),
        );
        let requests = ApiRequestManager::new(
            Arc::clone(&state),
            Arc::clone(&messages),
            Arc::clone(&interaction),
            Arc::clone(&usage),
            collaborators.api,
            collaborators.environment,
            collaborators.context,
            collaborators.tools,
            "You are an autonomous coding agent working in the user's workspace.",
        );

        Arc::new(Self {
            state,
            messages,
            usage,
            interaction,
            requests,
            bus,
            checkpoints: tokio::sync::Mutex::new(None),
            storage_root,
            task_text,
        })
    }

    pub fn task_text(&self) -> &str {
        &self.task_text
    }

    /// Build and initialize the checkpoint store for this task on first
    /// call; later calls return the same manager. Construction failures
    /// (protected workspace, nested repo) leave the task checkpoint-less.
    pub async fn init_checkpoints(&self) -> Result<Arc<CheckpointManager>> {
        let mut slot = self.checkpoints.lock().await;
        if let Some(existing) = slot.as_ref() {
            return Ok(Arc::clone(existing));
        }
        let service = Arc::new(ShadowCheckpointService::new(
            self.state.task_id(),
            ShadowCheckpointService::task_repo_dir(&self.storage_root, self.state.task_id()),
            self.state.workspace_path(),
        )?);
        service.init()?;
        let manager = CheckpointManager::new(
            service,
            Arc::clone(&self.messages),
            Arc::clone(&self.state),
            &self.storage_root,
        )
        .await;
        *slot = Some(Arc::clone(&manager));
        Ok(manager)
    }

    pub async fn checkpoints(&self) -> Option<Arc<CheckpointManager>> {
        self.checkpoints.lock().await.clone()
    }

    pub fn history_item(&self) -> HistoryItem {
        HistoryItem {
            id: self.state.task_id().to_string(),
            number: self.state.task_number(),
            task: self.task_text.clone(),
            workspace: self.state.workspace_path().clone(),
            mode: self.state.mode(),
            tool_protocol: self.state.tool_protocol(),
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Drive the streaming loop from the initial prompt until the model
    /// finishes or the task aborts. Emits `Started` on entry and
    /// `Completed` (with final usage) on a clean finish.
    pub async fn run(&self) -> Result<()> {
        self.bus.emit(TaskEvent::Started {
            task_id: self.state.task_id().to_string(),
        });
        let initial = vec![ContentBlock::text(format!("<task>\n{}\n</task>", self.task_text))];
        let result = self.requests.recursively_make_requests(initial).await;

        match &result {
            Ok(()) => {
                self.usage.flush();
                self.bus.emit(TaskEvent::Completed {
                    task_id: self.state.task_id().to_string(),
                    token_usage: self.usage.token_usage(),
                    tool_usage: self.usage.tool_usage(),
                });
            }
            Err(e) if is_abort_error(e) => {
                // Abort already emitted its own event via abort().
            }
            Err(_) => {
                // Streaming failed; record the reason so the manager can
                // decide to rehydrate.
                self.abort(AbortReason::StreamingFailed, false);
            }
        }
        result
    }

    /// Abort: set flags, cancel the in-flight request, flush usage, and
    /// emit. Safe to call more than once.
    pub fn abort(&self, reason: AbortReason, abandoned: bool) {
        if self.state.is_aborted() {
            return;
        }
        if abandoned {
            self.state.set_abandoned();
        }
        self.state.set_aborted(reason);
        self.state.cancel_current_request();
        self.usage.flush();
        self.bus.emit(TaskEvent::Aborted {
            task_id: self.state.task_id().to_string(),
        });
    }

    /// Pick the task back up after a delegated child finishes: unpause,
    /// record the child's result in the UI log, and append it to the
    /// conversation so the next request sees what the child produced.
    pub async fn resume_after_delegation(&self, result: &str) -> Result<()> {
        if self.state.is_paused() {
            self.unpause();
        }
        self.interaction
            .say(SayKind::SubtaskResult, Some(result.to_string()), None)
            .await?;
        self.messages
            .add_api_message(ApiMessage::user(vec![ContentBlock::text(format!(
                "[subtask completed] Result: {result}"
            ))]))
            .await?;
        Ok(())
    }

    pub fn pause(&self) {
        self.state.set_paused(true);
        self.bus.emit(TaskEvent::Paused {
            task_id: self.state.task_id().to_string(),
        });
    }

    pub fn unpause(&self) {
        self.state.set_paused(false);
        self.bus.emit(TaskEvent::Unpaused {
            task_id: self.state.task_id().to_string(),
        });
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_abort_emits_once_and_cancels_request() {
        let dir = TempDir::new().unwrap();
        let task = Task::new("do it", dir.path(), dir.path(), 1, tests_support::collaborators());
        let mut rx = task.bus.subscribe();

        let cancel = task.state.begin_request();
        task.abort(AbortReason::UserCancelled, false);
        task.abort(AbortReason::UserCancelled, false);

        assert!(task.state.is_aborted());
        assert!(cancel.is_cancelled());
        assert!(matches!(rx.try_recv(), Ok(TaskEvent::Aborted { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_history_item_round_trips_into_rehydration() {
        let dir = TempDir::new().unwrap();
        let task = Task::new("fix the bug", dir.path(), dir.path(), 3, tests_support::collaborators());
        task.messages
            .add_api_message(crate::messages::ApiMessage::user(vec![ContentBlock::text(
                "fix the bug",
            )]))
            .await
            .unwrap();
        let item = task.history_item();

        let rehydrated =
            Task::from_history_item(item.clone(), dir.path(), tests_support::collaborators())
                .await
                .unwrap();

        assert_eq!(rehydrated.state.task_id(), item.id);
        assert_eq!(rehydrated.state.task_number(), 3);
        assert_eq!(rehydrated.task_text(), "fix the bug");
        assert_eq!(rehydrated.messages.api_history_len().await, 1);
        // Same task, new instance.
        assert_ne!(rehydrated.state.instance_id(), task.state.instance_id());
    }

    #[tokio::test]
    async fn test_init_checkpoints_is_lazy_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path().join("workspace");
        std::fs::create_dir_all(&workspace).unwrap();
        let task = Task::new("t", &workspace, dir.path(), 1, tests_support::collaborators());

        assert!(task.checkpoints().await.is_none());
        let first = task.init_checkpoints().await.unwrap();
        let second = task.init_checkpoints().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(task.checkpoints().await.is_some());
    }

    #[tokio::test]
    async fn test_pause_unpause_events() {
        let dir = TempDir::new().unwrap();
        let task = Task::new("t", dir.path(), dir.path(), 1, tests_support::collaborators());
        let mut rx = task.bus.subscribe();

        task.pause();
        assert!(task.state.is_paused());
        task.unpause();
        assert!(!task.state.is_paused());

        assert!(matches!(rx.try_recv(), Ok(TaskEvent::Paused { .. })));
        assert!(matches!(rx.try_recv(), Ok(TaskEvent::Unpaused { .. })));
    }
}
