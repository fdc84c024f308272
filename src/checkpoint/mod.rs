//! Checkpointing: the shadow git service plus the conversation axis.
//!
//! `ShadowCheckpointService` snapshots workspace files; `CheckpointManager`
//! adds the side map from commit hash to conversation request index so a
//! restore can rewind the conversation to the same logical point. The two
//! axes restore independently: a failed conversation restore never rolls
//! back an already-completed file restore.

pub mod excludes;
pub mod shadow;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::errors::{CheckpointError, Result};
use crate::messages::persistence::task_dir;
use crate::messages::{ContentBlock, MessageManager, Role};
use crate::provider::ToolProtocol;
use crate::task::state::TaskStateManager;

pub use shadow::{CheckpointDiffEntry, ShadowCheckpointService};

const REQUEST_INDEX_FILE: &str = "checkpoint_request_index.json";

pub struct CheckpointManager {
    service: Arc<ShadowCheckpointService>,
    messages: Arc<MessageManager>,
    state: Arc<TaskStateManager>,
    /// commit hash -> request index, persisted per task. Not part of git
    /// history; the conversation axis lives here.
    request_indices: Mutex<HashMap<String, u64>>,
    storage_root: PathBuf,
}

impl CheckpointManager {
    /// Loads the persisted request-index map; a missing or unreadable map
    /// starts empty rather than failing construction.
    pub async fn new(
        service: Arc<ShadowCheckpointService>,
        messages: Arc<MessageManager>,
        state: Arc<TaskStateManager>,
        storage_root: impl Into<PathBuf>,
    ) -> Arc<Self> {
        let storage_root = storage_root.into();
        let map_path = Self::map_path(&storage_root, state.task_id());
        let request_indices = match tokio::fs::read(&map_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %map_path.display(), "unreadable request-index map: {e}");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Arc::new(Self {
            service,
            messages,
            state,
            request_indices: Mutex::new(request_indices),
            storage_root,
        })
    }

    fn map_path(storage_root: &Path, task_id: &str) -> PathBuf {
        task_dir(storage_root, task_id).join(REQUEST_INDEX_FILE)
    }

    pub fn service(&self) -> &Arc<ShadowCheckpointService> {
        &self.service
    }

    pub fn request_index_for(&self, commit_hash: &str) -> Option<u64> {
        self.request_indices
            .lock()
            .expect("request indices poisoned")
            .get(commit_hash)
            .copied()
    }

    /// Save a file checkpoint and associate it with a conversation
    /// request index. Map persistence is best-effort; the checkpoint
    /// itself is already durable in git.
    pub async fn create_checkpoint(
        &self,
        message: &str,
        request_index: u64,
        allow_empty: bool,
        suppress_message: bool,
    ) -> Result<Option<String>> {
        let Some(hash) = self
            .service
            .save_checkpoint(message, allow_empty, suppress_message)?
        else {
            return Ok(None);
        };

        self.request_indices
            .lock()
            .expect("request indices poisoned")
            .insert(hash.clone(), request_index);
        if let Err(e) = self.persist_map().await {
            warn!(task_id = %self.state.task_id(), "failed to persist request-index map: {e}");
        }
        Ok(Some(hash))
    }

    /// Restore workspace files, and optionally rewind the conversation to
    /// the request index recorded for this checkpoint. The file restore
    /// is fatal on failure; everything after it degrades to warnings.
    pub async fn restore_extended(
        &self,
        commit_hash: &str,
        restore_conversation: bool,
    ) -> Result<()> {
        self.service.restore_checkpoint(commit_hash)?;

        if !restore_conversation {
            return Ok(());
        }

        let Some(request_index) = self.request_index_for(commit_hash) else {
            warn!(
                task_id = %self.state.task_id(),
                commit_hash,
                "no request index recorded for checkpoint, conversation left as-is"
            );
            return Ok(());
        };

        if let Err(e) = self.truncate_conversation(request_index).await {
            warn!(
                task_id = %self.state.task_id(),
                "conversation restore failed after successful file restore: {e}"
            );
        }
        Ok(())
    }

    async fn truncate_conversation(&self, request_index: u64) -> Result<()> {
        let history = self.messages.api_history().await;

        // Keep through the last assistant message anchored at or before
        // the restored request index.
        let cut = history
            .iter()
            .rposition(|m| {
                m.role == Role::Assistant
                    && m.conversation_index.is_some_and(|i| i <= request_index)
            })
            .map(|pos| pos + 1);
        let Some(cut) = cut else {
            warn!(
                task_id = %self.state.task_id(),
                request_index,
                "no anchored assistant message at or before restore point"
            );
            return Ok(());
        };

        let truncated: Vec<_> = history[..cut].to_vec();
        info!(
            task_id = %self.state.task_id(),
            kept = truncated.len(),
            dropped = history.len() - truncated.len(),
            "conversation truncated to restored checkpoint"
        );

        // Best-effort re-derivation of the active tool protocol from the
        // most recent tool-using assistant turn. Telemetry-grade: the
        // model may have mixed protocols mid-task.
        let rederived = truncated
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .find(|m| {
                m.content
                    .iter()
                    .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
            })
            .map(|_| ToolProtocol::Native);
        if let Some(protocol) = rederived {
            debug!(task_id = %self.state.task_id(), ?protocol, "re-derived tool protocol");
            self.state.set_tool_protocol(protocol);
        }

        self.messages.overwrite_api_history(truncated).await?;
        // The next request must not chain to a response the model no
        // longer remembers sending.
        self.state.set_skip_prev_response_id_once();
        Ok(())
    }

    pub fn get_diff(
        &self,
        from: Option<&str>,
        to: Option<&str>,
    ) -> std::result::Result<Vec<CheckpointDiffEntry>, CheckpointError> {
        self.service.get_diff(from, to)
    }

    async fn persist_map(&self) -> std::result::Result<(), std::io::Error> {
        let path = Self::map_path(&self.storage_root, self.state.task_id());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let snapshot = self
            .request_indices
            .lock()
            .expect("request indices poisoned")
            .clone();
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
