//! Collaborator seams: the host ("provider"), the model API handler, and the
//! environment/context suppliers.
//!
//! The runtime core never talks to an editor, a settings store, or a vendor
//! SDK directly. Everything it needs from the outside world comes through the
//! traits in this module, and everything it holds onto is a `Weak` handle so
//! a torn-down host is observed as "gone", never kept alive artificially.

use std::sync::{Mutex, Weak};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio::sync::mpsc;

use crate::errors::ApiError;
use crate::messages::ApiMessage;

/// Snapshot of host-side configuration consumed by the core. Read fresh at
/// each use site; never cached across a task boundary.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub diff_enabled: bool,
    pub checkpoints_enabled: bool,
    pub checkpoint_timeout_secs: u64,
    pub fuzzy_match_threshold: f64,
    pub mode: String,
    pub tool_protocol: ToolProtocol,
    /// Base delay for exponential backoff between failed requests.
    pub request_delay_secs: u64,
    /// Maximum streaming attempts for transient provider errors.
    pub max_request_retries: u32,
}

impl Default for ProviderState {
    fn default() -> Self {
        Self {
            diff_enabled: true,
            checkpoints_enabled: true,
            checkpoint_timeout_secs: 15,
            fuzzy_match_threshold: 1.0,
            mode: "code".to_string(),
            tool_protocol: ToolProtocol::Native,
            request_delay_secs: 5,
            max_request_retries: 3,
        }
    }
}

/// How the model is asked to invoke tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolProtocol {
    Native,
    Xml,
}

/// The host that owns the runtime: supplies configuration and receives
/// state-refresh pokes. Held as `Weak<dyn ProviderHandle>` everywhere.
pub trait ProviderHandle: Send + Sync {
    fn state(&self) -> ProviderState;

    /// Ask the host to refresh whatever surface mirrors task state.
    /// Best-effort: the core never depends on this happening.
    fn post_state_update(&self);

    /// Whether this provider instance is currently visible to the user.
    /// Used by the registry to find "the" active instance.
    fn is_visible(&self) -> bool {
        true
    }
}

/// Metadata attached to every outbound model request.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub task_id: String,
    pub mode: String,
    pub tool_protocol: ToolProtocol,
    pub suppress_previous_response_id: bool,
}

/// One typed chunk of an incremental model response.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Text(String),
    Reasoning(String),
    Usage(UsageChunk),
    /// A fragment of a tool call. Arguments for a single call id may arrive
    /// split across many of these; they are reassembled by id before parsing.
    ToolCallPartial {
        index: usize,
        id: String,
        name: Option<String>,
        arguments_fragment: String,
    },
    Done,
}

#[derive(Debug, Clone, Default)]
pub struct UsageChunk {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: Option<u64>,
    pub cache_write_tokens: Option<u64>,
    pub total_cost: Option<f64>,
}

/// The receiving half of a model response stream.
pub type ChunkStream = mpsc::Receiver<std::result::Result<StreamChunk, ApiError>>;

/// Live API handle capable of opening a streaming request against whatever
/// model the host has configured.
#[async_trait]
pub trait ApiHandler: Send + Sync {
    async fn create_message(
        &self,
        system_prompt: &str,
        history: &[ApiMessage],
        meta: RequestMeta,
    ) -> std::result::Result<ChunkStream, ApiError>;
}

/// Supplies the live environment block (open tabs, terminal output, workspace
/// listing) appended to outbound user messages.
#[async_trait]
pub trait EnvironmentReporter: Send + Sync {
    async fn environment_details(&self, include_file_details: bool) -> String;
}

/// Executes one assembled tool invocation on behalf of the model. The
/// returned string (or error text) is fed back as the tool result for the
/// next request; approval flows are the host's concern.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run_tool(
        &self,
        name: &str,
        arguments: &serde_json::Value,
    ) -> std::result::Result<String, String>;
}

/// Context-management collaborator. Invoked when the model reports the
/// conversation no longer fits its window.
#[async_trait]
pub trait ContextSteward: Send + Sync {
    /// Attempt a recovery (condense, truncate) ahead of a retry.
    async fn handle_context_window_exceeded(&self, history: &mut Vec<ApiMessage>);

    /// Forcibly reduce the history to roughly `fraction` of the budget.
    /// Called once the bounded retry ceiling is exhausted.
    async fn force_reduce(&self, history: &mut Vec<ApiMessage>, fraction: f64);
}

// ─── Global provider registry ──────────────────────────────────────

static PROVIDER_REGISTRY: Lazy<Mutex<Vec<Weak<dyn ProviderHandle>>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

/// Register a provider instance. Call on construction; the matching
/// `unregister_provider` belongs in the instance's teardown path.
pub fn register_provider(provider: Weak<dyn ProviderHandle>) {
    let mut registry = PROVIDER_REGISTRY.lock().expect("provider registry poisoned");
    registry.push(provider);
}

/// Drop dead entries and any entry pointing at the given instance.
pub fn unregister_provider(provider: &Weak<dyn ProviderHandle>) {
    let mut registry = PROVIDER_REGISTRY.lock().expect("provider registry poisoned");
    registry.retain(|p| p.strong_count() > 0 && !p.ptr_eq(provider));
}

/// Find the first live provider matching `predicate`. Dead weak handles are
/// pruned as a side effect.
pub fn find_provider(
    predicate: impl Fn(&dyn ProviderHandle) -> bool,
) -> Option<std::sync::Arc<dyn ProviderHandle>> {
    let mut registry = PROVIDER_REGISTRY.lock().expect("provider registry poisoned");
    registry.retain(|p| p.strong_count() > 0);
    registry.iter().filter_map(|p| p.upgrade()).find(|p| predicate(p.as_ref()))
}

/// Find the provider currently visible to the user, if any.
pub fn find_visible_provider() -> Option<std::sync::Arc<dyn ProviderHandle>> {
    find_provider(|p| p.is_visible())
}
