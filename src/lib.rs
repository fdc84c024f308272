//! Taskstack - Execution Core for an Autonomous Coding Agent
//!
//! The runtime that drives one agent conversation at a time: a LIFO task
//! stack with a single open task, a streaming request loop with retry and
//! cancellation, and a git-backed shadow repository that checkpoints the
//! workspace alongside the conversation.
//!
//! - **Tasks**: Stack discipline, pause/resume, rehydration from history
//! - **Streaming**: Chunked model output, partial UI messages, tool calls
//! - **Resilience**: Exponential backoff, context-window recovery, aborts
//! - **Checkpoints**: Shadow git repo per task, dual file + conversation
//!   restoration, workspace left untouched
//!
//! # Quick Start
//!
//! ```ignore
//! use taskstack::task::{Collaborators, TaskManager};
//!
//! let manager = TaskManager::new(collaborators, storage_root);
//! let task = manager.create_task("Fix the failing test", workspace).await;
//! task.run().await?;
//! ```

// ─── Core modules ──────────────────────────────────────────────────
pub mod checkpoint;
pub mod errors;
pub mod events;
pub mod messages;
pub mod provider;
pub mod task;

pub use checkpoint::{CheckpointManager, ShadowCheckpointService};
pub use errors::{Result, RuntimeError};
pub use events::{CheckpointEvent, EventBus, TaskEvent};
pub use messages::{ApiMessage, MessageManager, UiMessage};
pub use task::manager::TaskManager;
pub use task::{Collaborators, HistoryItem, Task};
