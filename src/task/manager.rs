//! The task stack: at most one open task per provider instance.
//!
//! Opening a new top-level task closes the current top first (pop, abort,
//! detach listeners), so the top of the stack is always the task
//! receiving user input. Every task's events are re-emitted on the
//! manager's own bus; forwarder handles are keyed by instance id so
//! teardown detaches exactly one instance's plumbing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{Result, TaskError};
use crate::events::{EventBus, TaskEvent};
use crate::task::state::AbortReason;
use crate::task::{Collaborators, HistoryItem, Task};

/// Abandoned inline-edit requests are evicted after this long.
const PENDING_EDIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PendingEditOperation {
    pub operation_id: String,
    pub message_ts: i64,
    pub edited_content: String,
}

pub struct TaskManager {
    stack: tokio::sync::Mutex<Vec<Arc<Task>>>,
    bus: Arc<EventBus>,
    /// Forwarder join handles keyed by task instance id.
    forwarders: Mutex<HashMap<String, JoinHandle<()>>>,
    pending_edits: Mutex<HashMap<String, PendingEditOperation>>,
    collaborators: Collaborators,
    storage_root: PathBuf,
    task_counter: AtomicI32,
}

impl TaskManager {
    pub fn new(collaborators: Collaborators, storage_root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            stack: tokio::sync::Mutex::new(Vec::new()),
            bus: Arc::new(EventBus::new()),
            forwarders: Mutex::new(HashMap::new()),
            pending_edits: Mutex::new(HashMap::new()),
            collaborators,
            storage_root: storage_root.into(),
            task_counter: AtomicI32::new(0),
        })
    }

    /// One event stream for the whole stack, regardless of depth.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TaskEvent> {
        self.bus.subscribe()
    }

    pub async fn stack_size(&self) -> usize {
        self.stack.lock().await.len()
    }

    pub async fn current_task(&self) -> Option<Arc<Task>> {
        self.stack.lock().await.last().cloned()
    }

    // ─── Creation ──────────────────────────────────────────────────

    /// Open a new top-level task. The current open task, if any, is
    /// closed first; the stack never grows past its pre-call size + 1.
    pub async fn create_task(
        self: &Arc<Self>,
        prompt: impl Into<String>,
        workspace: impl Into<PathBuf>,
    ) -> Arc<Task> {
        self.remove_from_stack().await;

        let number = self.task_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let task = Task::new(
            prompt,
            workspace,
            &self.storage_root,
            number,
            self.collaborators.clone(),
        );
        self.push_task(Arc::clone(&task)).await;
        task
    }

    /// Delegate to a child task: the parent is paused, not closed, and
    /// the child takes the top of the stack.
    pub async fn spawn_subtask(self: &Arc<Self>, prompt: impl Into<String>) -> Option<Arc<Task>> {
        let parent = self.current_task().await?;
        parent.pause();

        let number = self.task_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let child = Task::new(
            prompt,
            parent.state.workspace_path().clone(),
            &self.storage_root,
            number,
            self.collaborators.clone(),
        );
        self.bus.emit(TaskEvent::Spawned {
            task_id: parent.state.task_id().to_string(),
            child_task_id: child.state.task_id().to_string(),
        });
        self.push_task(Arc::clone(&child)).await;
        Some(child)
    }

    /// Rehydrate a persisted task. When the current top already carries
    /// the same task id, the outgoing instance is swapped in place
    /// without an abort-and-detach cycle (avoids UI flicker when a
    /// transient failure is being resumed); otherwise this is a normal
    /// close-then-push.
    pub async fn create_task_with_history_item(
        self: &Arc<Self>,
        item: HistoryItem,
    ) -> Result<Arc<Task>> {
        let same_identity = {
            let stack = self.stack.lock().await;
            stack
                .last()
                .is_some_and(|top| top.state.task_id() == item.id)
        };

        let task =
            Task::from_history_item(item, &self.storage_root, self.collaborators.clone()).await?;

        if same_identity {
            let outgoing = {
                let mut stack = self.stack.lock().await;
                let outgoing = stack.pop();
                stack.push(Arc::clone(&task));
                outgoing
            };
            if let Some(outgoing) = outgoing {
                debug!(
                    task_id = %task.state.task_id(),
                    "same-identity rehydrate, swapping instance in place"
                );
                self.detach_forwarder(outgoing.state.instance_id());
            }
            self.attach_forwarder(&task);
            self.bus.emit(TaskEvent::Focused {
                task_id: task.state.task_id().to_string(),
            });
        } else {
            self.remove_from_stack().await;
            self.push_task(Arc::clone(&task)).await;
        }
        Ok(task)
    }

    async fn push_task(self: &Arc<Self>, task: Arc<Task>) {
        self.attach_forwarder(&task);
        self.stack.lock().await.push(Arc::clone(&task));
        info!(
            task_id = %task.state.task_id(),
            instance_id = %task.state.instance_id(),
            "task pushed"
        );
        self.bus.emit(TaskEvent::Focused {
            task_id: task.state.task_id().to_string(),
        });
    }

    // ─── Removal ───────────────────────────────────────────────────

    /// Pop the top task, signal it unfocused, best-effort abort it, and
    /// detach its listeners. Idempotent on an empty stack.
    pub async fn remove_from_stack(self: &Arc<Self>) {
        let Some(task) = self.stack.lock().await.pop() else {
            return;
        };
        self.bus.emit(TaskEvent::Unfocused {
            task_id: task.state.task_id().to_string(),
        });
        // Abort failures must never block stack integrity; our abort is
        // flag-based and cannot fail, but a wedged task stays wedged on
        // its own time.
        task.abort(AbortReason::UserCancelled, false);
        self.detach_forwarder(task.state.instance_id());
        info!(
            task_id = %task.state.task_id(),
            instance_id = %task.state.instance_id(),
            "task removed from stack"
        );
        // A paused parent exposed by the pop goes back to taking input.
        if let Some(top) = self.stack.lock().await.last() {
            if top.state.is_paused() {
                top.unpause();
            }
        }
    }

    /// Finish the top subtask: pop it and hand its result back to the
    /// parent, which resumes with the result recorded in both logs.
    pub async fn complete_subtask(self: &Arc<Self>, result: impl Into<String>) -> Result<()> {
        if self.stack_size().await < 2 {
            return Err(TaskError::NoActiveTask.into());
        }
        self.remove_from_stack().await;
        let parent = self.current_task().await.ok_or(TaskError::NoActiveTask)?;
        parent.resume_after_delegation(&result.into()).await
    }

    /// User-initiated cancel: abort the current task, nudge the host to
    /// refresh, then pop.
    pub async fn cancel_task(self: &Arc<Self>) {
        let Some(task) = self.current_task().await else {
            return;
        };
        task.abort(AbortReason::UserCancelled, false);
        if let Some(provider) = task.state.provider() {
            provider.post_state_update();
        }
        self.remove_from_stack().await;
    }

    /// Tear down the whole stack and any pending bookkeeping.
    pub async fn dispose(self: &Arc<Self>) {
        while self.stack_size().await > 0 {
            self.remove_from_stack().await;
        }
        self.clear_all_pending_edit_operations();
        let mut forwarders = self.forwarders.lock().expect("forwarders poisoned");
        for (_, handle) in forwarders.drain() {
            handle.abort();
        }
    }

    // ─── Event forwarding / auto-rehydrate ─────────────────────────

    fn attach_forwarder(self: &Arc<Self>, task: &Arc<Task>) {
        let mut rx = task.bus.subscribe();
        let manager: Weak<TaskManager> = Arc::downgrade(self);
        let state = Arc::clone(&task.state);
        let instance_id = task.state.instance_id().to_string();

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(manager) = manager.upgrade() else { break };
                let rehydrate = matches!(event, TaskEvent::Aborted { .. })
                    && state.abort_reason() == Some(AbortReason::StreamingFailed);
                manager.bus.emit(event);
                if rehydrate {
                    let manager = Arc::clone(&manager);
                    let task_id = state.task_id().to_string();
                    let instance_id = state.instance_id().to_string();
                    tokio::spawn(async move {
                        manager.auto_rehydrate(&task_id, &instance_id).await;
                    });
                }
            }
        });
        self.forwarders
            .lock()
            .expect("forwarders poisoned")
            .insert(instance_id, handle);
    }

    fn detach_forwarder(&self, instance_id: &str) {
        if let Some(handle) = self
            .forwarders
            .lock()
            .expect("forwarders poisoned")
            .remove(instance_id)
        {
            handle.abort();
        }
    }

    /// Silent resume after a streaming failure. Guarded by instance
    /// identity: if another path already replaced the top, this race
    /// loser backs off rather than double-rehydrating.
    async fn auto_rehydrate(self: &Arc<Self>, task_id: &str, instance_id: &str) {
        let item = {
            let stack = self.stack.lock().await;
            let Some(top) = stack.last() else { return };
            if top.state.task_id() != task_id || top.state.instance_id() != instance_id {
                debug!(task_id, "top already replaced, skipping auto-rehydrate");
                return;
            }
            top.history_item()
        };

        info!(task_id, "rehydrating after streaming failure");
        match self.create_task_with_history_item(item).await {
            Ok(_) => {}
            Err(e) => {
                // No retry loop: the task stays aborted.
                warn!(task_id, "auto-rehydrate failed: {e}");
            }
        }
    }

    // ─── Pending edit operations ───────────────────────────────────

    /// Register an inline-edit operation; it evicts itself after 30s so
    /// an abandoned request cannot leak.
    pub fn register_pending_edit(self: &Arc<Self>, operation: PendingEditOperation) {
        let operation_id = operation.operation_id.clone();
        self.pending_edits
            .lock()
            .expect("pending edits poisoned")
            .insert(operation_id.clone(), operation);

        let manager: Weak<TaskManager> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(PENDING_EDIT_TIMEOUT).await;
            let Some(manager) = manager.upgrade() else { return };
            let evicted = manager
                .pending_edits
                .lock()
                .expect("pending edits poisoned")
                .remove(&operation_id)
                .is_some();
            if evicted {
                warn!(operation_id, "pending edit operation timed out");
            }
        });
    }

    pub fn take_pending_edit(&self, operation_id: &str) -> Option<PendingEditOperation> {
        self.pending_edits
            .lock()
            .expect("pending edits poisoned")
            .remove(operation_id)
    }

    pub fn clear_all_pending_edit_operations(&self) {
        self.pending_edits
            .lock()
            .expect("pending edits poisoned")
            .clear();
    }
}
