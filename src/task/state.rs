//! Per-task mutable state: identity, abort/pause flags, mode and tool
//! protocol, the weak provider back-reference, and the per-request
//! cancellation handle.
//!
//! This is the single source of truth every other manager reads and
//! writes through. All flags are atomics so the streaming loop can poll
//! them at suspension points without taking a lock.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;
use uuid::Uuid;

use crate::provider::{ProviderHandle, ToolProtocol};

/// Why a task was aborted. Drives the manager's auto-rehydrate decision:
/// only streaming failures are silently resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    UserCancelled,
    StreamingFailed,
}

/// Cancellation handle scoped to one in-flight network request. Lets the
/// host interrupt the active request (mode switch, message edit) without
/// aborting the whole task.
#[derive(Default)]
pub struct RequestCancellation {
    cancelled: AtomicBool,
    notify: Notify,
}

impl RequestCancellation {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolve once cancelled. Safe to race with `cancel`: the flag is
    /// checked both before and after arming the notification.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

pub struct TaskStateManager {
    task_id: String,
    /// Short random id distinguishing instances that share a task id
    /// (rehydration creates a new instance for the same task).
    instance_id: String,
    root_task_id: Option<String>,
    parent_task_id: Option<String>,
    task_number: i32,
    workspace_path: PathBuf,

    aborted: AtomicBool,
    paused: AtomicBool,
    abandoned: AtomicBool,
    abort_reason: Mutex<Option<AbortReason>>,

    mode: Mutex<String>,
    tool_protocol: Mutex<ToolProtocol>,
    provider: Mutex<Weak<dyn ProviderHandle>>,
    current_request: Mutex<Option<Arc<RequestCancellation>>>,

    /// Timestamp of the ask the task is currently blocked on, used to
    /// match responses to the right question.
    last_message_ts: AtomicI64,
    /// One-shot: the next request must not reference the previous
    /// response id (set after history edits and restores).
    skip_prev_response_id_once: AtomicBool,
}

impl TaskStateManager {
    pub fn new(
        task_id: impl Into<String>,
        task_number: i32,
        workspace_path: impl Into<PathBuf>,
        mode: impl Into<String>,
        tool_protocol: ToolProtocol,
        provider: Weak<dyn ProviderHandle>,
    ) -> Arc<Self> {
        Arc::new(Self {
            task_id: task_id.into(),
            instance_id: Uuid::new_v4().to_string()[..8].to_string(),
            root_task_id: None,
            parent_task_id: None,
            task_number,
            workspace_path: workspace_path.into(),
            aborted: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
            mode: Mutex::new(mode.into()),
            tool_protocol: Mutex::new(tool_protocol),
            provider: Mutex::new(provider),
            current_request: Mutex::new(None),
            last_message_ts: AtomicI64::new(0),
            skip_prev_response_id_once: AtomicBool::new(false),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn task_number(&self) -> i32 {
        self.task_number
    }

    pub fn workspace_path(&self) -> &PathBuf {
        &self.workspace_path
    }

    pub fn root_task_id(&self) -> Option<&str> {
        self.root_task_id.as_deref()
    }

    pub fn parent_task_id(&self) -> Option<&str> {
        self.parent_task_id.as_deref()
    }

    // ─── Abort / pause / abandon ───────────────────────────────────

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn set_aborted(&self, reason: AbortReason) {
        *self.abort_reason.lock().expect("abort reason poisoned") = Some(reason);
        self.aborted.store(true, Ordering::Release);
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        *self.abort_reason.lock().expect("abort reason poisoned")
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    /// Abandoned means the host gave up waiting for a graceful abort;
    /// the instance must not touch shared state from here on.
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    pub fn set_abandoned(&self) {
        self.abandoned.store(true, Ordering::Release);
    }

    // ─── Mode / protocol ───────────────────────────────────────────

    pub fn mode(&self) -> String {
        self.mode.lock().expect("mode poisoned").clone()
    }

    pub fn set_mode(&self, mode: impl Into<String>) {
        *self.mode.lock().expect("mode poisoned") = mode.into();
    }

    pub fn tool_protocol(&self) -> ToolProtocol {
        *self.tool_protocol.lock().expect("tool protocol poisoned")
    }

    pub fn set_tool_protocol(&self, protocol: ToolProtocol) {
        *self.tool_protocol.lock().expect("tool protocol poisoned") = protocol;
    }

    // ─── Provider back-reference ───────────────────────────────────

    /// Upgrade the weak provider handle. `None` means the host has been
    /// torn down; callers treat that as a silent no-op.
    pub fn provider(&self) -> Option<Arc<dyn ProviderHandle>> {
        self.provider.lock().expect("provider poisoned").upgrade()
    }

    pub fn set_provider(&self, provider: Weak<dyn ProviderHandle>) {
        *self.provider.lock().expect("provider poisoned") = provider;
    }

    // ─── Per-request cancellation ──────────────────────────────────

    /// Install a fresh cancellation handle for the request about to go
    /// out, replacing (and implicitly orphaning) any previous one.
    pub fn begin_request(&self) -> Arc<RequestCancellation> {
        let handle = RequestCancellation::new();
        *self
            .current_request
            .lock()
            .expect("current request poisoned") = Some(Arc::clone(&handle));
        handle
    }

    /// Cancel just the in-flight request, if any. The task stays alive.
    pub fn cancel_current_request(&self) {
        if let Some(handle) = self
            .current_request
            .lock()
            .expect("current request poisoned")
            .take()
        {
            handle.cancel();
        }
    }

    // ─── Ask handshake / request flags ─────────────────────────────

    pub fn last_message_ts(&self) -> i64 {
        self.last_message_ts.load(Ordering::Acquire)
    }

    pub fn set_last_message_ts(&self, ts: i64) {
        self.last_message_ts.store(ts, Ordering::Release);
    }

    pub fn set_skip_prev_response_id_once(&self) {
        self.skip_prev_response_id_once.store(true, Ordering::Release);
    }

    /// Consume the one-shot flag.
    pub fn take_skip_prev_response_id(&self) -> bool {
        self.skip_prev_response_id_once.swap(false, Ordering::AcqRel)
    }
}
