//! Lifecycle and checkpoint event types, plus the per-instance event bus.
//!
//! Every `Task` owns one `EventBus`; the `TaskManager` subscribes to each
//! task's bus and re-emits on its own, so external collaborators observe a
//! single stream regardless of stack depth. Subscribers that drop their
//! receiver are pruned on the next emit.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::task::usage::{TokenUsage, ToolUsage};

/// Lifecycle events emitted by a task (and re-emitted by the manager).
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Started {
        task_id: String,
    },
    Completed {
        task_id: String,
        token_usage: TokenUsage,
        tool_usage: ToolUsage,
    },
    Aborted {
        task_id: String,
    },
    Focused {
        task_id: String,
    },
    Unfocused {
        task_id: String,
    },
    /// The task finished its turn and is waiting on a non-blocking ask.
    IdleAsk {
        task_id: String,
        ts: i64,
    },
    /// The task can be resumed from where it stopped.
    ResumableAsk {
        task_id: String,
        ts: i64,
    },
    /// The task is blocked on an approval or answer.
    InteractiveAsk {
        task_id: String,
        ts: i64,
    },
    TokenUsageUpdated {
        task_id: String,
        token_usage: TokenUsage,
        tool_usage: ToolUsage,
    },
    UserMessage {
        task_id: String,
    },
    Spawned {
        task_id: String,
        child_task_id: String,
    },
    Paused {
        task_id: String,
    },
    Unpaused {
        task_id: String,
    },
}

impl TaskEvent {
    /// The id of the task this event concerns.
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Started { task_id }
            | TaskEvent::Completed { task_id, .. }
            | TaskEvent::Aborted { task_id }
            | TaskEvent::Focused { task_id }
            | TaskEvent::Unfocused { task_id }
            | TaskEvent::IdleAsk { task_id, .. }
            | TaskEvent::ResumableAsk { task_id, .. }
            | TaskEvent::InteractiveAsk { task_id, .. }
            | TaskEvent::TokenUsageUpdated { task_id, .. }
            | TaskEvent::UserMessage { task_id }
            | TaskEvent::Spawned { task_id, .. }
            | TaskEvent::Paused { task_id }
            | TaskEvent::Unpaused { task_id } => task_id,
        }
    }
}

/// Events emitted by the checkpoint store.
#[derive(Debug, Clone)]
pub enum CheckpointEvent {
    Initialize {
        workspace_dir: PathBuf,
        base_hash: String,
        /// Whether the shadow repo was created (vs reused) by this init.
        created: bool,
        duration: Duration,
    },
    Checkpoint {
        from_hash: String,
        to_hash: String,
        duration: Duration,
        suppress_message: bool,
    },
    Restore {
        commit_hash: String,
        duration: Duration,
    },
    Error {
        message: String,
    },
}

/// Fan-out channel for task events. Emission never blocks; a subscriber
/// that stopped listening is dropped from the list on the next emit.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TaskEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TaskEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("event bus poisoned")
            .push(tx);
        rx
    }

    pub fn emit(&self, event: TaskEvent) {
        let mut subscribers = self.subscribers.lock().expect("event bus poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("event bus poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(TaskEvent::Started { task_id: "t1".into() });

        assert!(matches!(a.recv().await, Some(TaskEvent::Started { .. })));
        assert!(matches!(b.recv().await, Some(TaskEvent::Started { .. })));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let mut live = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(rx);
        bus.emit(TaskEvent::Aborted { task_id: "t1".into() });

        assert_eq!(bus.subscriber_count(), 1);
        assert!(matches!(live.recv().await, Some(TaskEvent::Aborted { .. })));
    }

    #[test]
    fn test_event_task_id() {
        let event = TaskEvent::Unfocused { task_id: "abc".into() };
        assert_eq!(event.task_id(), "abc");
    }
}
