//! The streaming request loop.
//!
//! One logical user message is turned into a model request; the incremental
//! response is consumed chunk by chunk and dispatched into UI says, usage
//! accounting, and the tool-call accumulator. Tool results feed the next
//! iteration of an explicit work stack, so arbitrarily long tool chains
//! never grow the call stack. Abort is checked at loop entry and inside
//! every wait.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::errors::{is_abort_error, ApiError, Result, RuntimeError, TaskError};
use crate::messages::reconcile::validate_and_fix_tool_result_ids;
use crate::messages::{ApiMessage, ContentBlock, MessageManager, Role, SayKind};
use crate::provider::{
    ApiHandler, ContextSteward, EnvironmentReporter, RequestMeta, StreamChunk, ToolRunner,
};
use crate::task::interaction::UserInteractionManager;
use crate::task::state::TaskStateManager;
use crate::task::tool_calls::{ToolCallAccumulator, ToolCallReady};
use crate::task::usage::UsageTracker;

/// Context-window failures get this many steward-assisted retries before
/// the forced reduction.
const MAX_CONTEXT_WINDOW_RETRIES: u32 = 3;
/// Exponential backoff cap.
const MAX_BACKOFF_SECS: u64 = 120;
/// Budget fraction requested from the steward once the retry ceiling is
/// exhausted.
const FORCED_REDUCTION_FRACTION: f64 = 0.75;
/// Base delay used when no live provider can supply one.
const DEFAULT_BASE_DELAY_SECS: u64 = 5;
const DEFAULT_MAX_RETRIES: u32 = 3;

struct AttemptOutcome {
    assistant_blocks: Vec<ContentBlock>,
    tool_call: Option<ToolCallReady>,
}

pub struct ApiRequestManager {
    state: Arc<TaskStateManager>,
    messages: Arc<MessageManager>,
    interaction: Arc<UserInteractionManager>,
    usage: Arc<UsageTracker>,
    api: Arc<dyn ApiHandler>,
    environment: Arc<dyn EnvironmentReporter>,
    context: Arc<dyn ContextSteward>,
    tools: Arc<dyn ToolRunner>,
    system_prompt: String,
    accumulator: Mutex<ToolCallAccumulator>,
    request_count: std::sync::atomic::AtomicU64,
}

impl ApiRequestManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<TaskStateManager>,
        messages: Arc<MessageManager>,
        interaction: Arc<UserInteractionManager>,
        usage: Arc<UsageTracker>,
        api: Arc<dyn ApiHandler>,
        environment: Arc<dyn EnvironmentReporter>,
        context: Arc<dyn ContextSteward>,
        tools: Arc<dyn ToolRunner>,
        system_prompt: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            messages,
            interaction,
            usage,
            api,
            environment,
            context,
            tools,
            system_prompt: system_prompt.into(),
            accumulator: Mutex::new(ToolCallAccumulator::new()),
            request_count: std::sync::atomic::AtomicU64::new(0),
        })
    }

    fn aborted(&self) -> RuntimeError {
        TaskError::Aborted {
            task_id: self.state.task_id().to_string(),
        }
        .into()
    }

    fn request_cancelled(&self) -> RuntimeError {
        TaskError::RequestCancelled {
            task_id: self.state.task_id().to_string(),
        }
        .into()
    }

    fn check_abort(&self) -> Result<()> {
        if self.state.is_aborted() {
            Err(self.aborted())
        } else {
            Ok(())
        }
    }

    /// Drive the request loop until the model finishes a turn without
    /// invoking a tool. Iterative with an explicit work stack.
    pub async fn recursively_make_requests(
        self: &Arc<Self>,
        user_content: Vec<ContentBlock>,
    ) -> Result<()> {
        let mut work_stack = vec![user_content];

        while let Some(content) = work_stack.pop() {
            self.check_abort()?;
            if let Some(next) = self.make_request(content).await? {
                work_stack.push(next);
            }
        }
        Ok(())
    }

    /// One request cycle: announce, resolve content, stream with retries,
    /// record the assistant turn, and run at most one tool invocation.
    /// Returns the next outbound user content, or `None` when the turn is
    /// final.
    async fn make_request(
        self: &Arc<Self>,
        mut content: Vec<ContentBlock>,
    ) -> Result<Option<Vec<ContentBlock>>> {
        let request_number = self
            .request_count
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);

        self.interaction
            .say(
                SayKind::ApiReqStarted,
                Some(
                    serde_json::json!({ "request": request_number + 1 }).to_string(),
                ),
                None,
            )
            .await?;

        // Repair tool-result correlation against the previous assistant
        // turn before the message ships.
        let history = self.messages.api_history().await;
        let previous_assistant = history.iter().rev().find(|m| m.role == Role::Assistant);
        validate_and_fix_tool_result_ids(&mut content, previous_assistant);

        // Environment context rides along as a trailing text block; the
        // full file listing only on the first request of the task.
        let env = self
            .environment
            .environment_details(request_number == 0)
            .await;
        if !env.is_empty() {
            content.push(ContentBlock::text(env));
        }

        // Appended exactly once per work item; retries below reuse it.
        self.messages.add_api_message(ApiMessage::user(content)).await?;

        let suppress_previous_response_id = self.state.take_skip_prev_response_id();
        let (base_delay, max_retries) = self.retry_policy();

        let mut attempt: u32 = 0;
        let mut cwe_retries: u32 = 0;
        let outcome = loop {
            self.check_abort()?;
            match self.attempt_stream(suppress_previous_response_id).await {
                Ok(outcome) => break outcome,
                Err(e) if is_abort_error(&e) => return Err(e),
                Err(RuntimeError::Api(api)) if api.is_context_window_exceeded() => {
                    if cwe_retries < MAX_CONTEXT_WINDOW_RETRIES {
                        warn!(
                            task_id = %self.state.task_id(),
                            retry = cwe_retries + 1,
                            "context window exceeded, asking steward to recover"
                        );
                        let mut history = self.messages.api_history().await;
                        self.context.handle_context_window_exceeded(&mut history).await;
                        self.messages.overwrite_api_history(history).await?;
                        self.backoff_and_announce(cwe_retries, &api, base_delay).await?;
                        cwe_retries += 1;
                    } else {
                        error!(
                            task_id = %self.state.task_id(),
                            "context window retries exhausted, forcing reduction"
                        );
                        let mut history = self.messages.api_history().await;
                        self.context
                            .force_reduce(&mut history, FORCED_REDUCTION_FRACTION)
                            .await;
                        self.messages.overwrite_api_history(history).await?;
                        self.interaction
                            .say(SayKind::Error, Some(api.to_string()), None)
                            .await?;
                        return Err(api.into());
                    }
                }
                Err(RuntimeError::Api(api)) if api.is_transient() && attempt < max_retries => {
                    self.backoff_and_announce(attempt, &api, base_delay).await?;
                    attempt += 1;
                }
                Err(e) => {
                    self.interaction
                        .say(SayKind::Error, Some(format!("Request failed: {e}")), None)
                        .await?;
                    return Err(e);
                }
            }
        };

        // Anchor the assistant turn to its logical position; this index,
        // not the timestamp, is the unit of checkpoint restoration.
        let conversation_index = self.messages.api_history_len().await as u64;
        let mut assistant_blocks = outcome.assistant_blocks;
        if let Some(call) = &outcome.tool_call {
            assistant_blocks.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.arguments.clone(),
            });
        }
        self.messages
            .add_api_message(ApiMessage::assistant(
                assistant_blocks,
                Some(conversation_index),
            ))
            .await?;

        let Some(call) = outcome.tool_call else {
            return Ok(None);
        };

        self.usage.record_tool_attempt(&call.name);
        let result_content = match self.tools.run_tool(&call.name, &call.arguments).await {
            Ok(output) => output,
            Err(failure) => {
                self.usage.record_tool_failure(&call.name);
                failure
            }
        };
        Ok(Some(vec![ContentBlock::ToolResult {
            tool_use_id: call.id,
            content: result_content,
        }]))
    }

    fn retry_policy(&self) -> (u64, u32) {
        match self.state.provider() {
            Some(provider) => {
                let state = provider.state();
                (state.request_delay_secs, state.max_request_retries)
            }
            None => (DEFAULT_BASE_DELAY_SECS, DEFAULT_MAX_RETRIES),
        }
    }

    /// Run one streaming attempt against the provider, dispatching chunks
    /// as they arrive. The in-flight request carries its own cancellation
    /// handle so the host can interrupt it without aborting the task.
    async fn attempt_stream(&self, suppress_previous_response_id: bool) -> Result<AttemptOutcome> {
        self.accumulator.lock().await.clear();

        let cancel = self.state.begin_request();
        let history = self.messages.api_history().await;
        let meta = RequestMeta {
            task_id: self.state.task_id().to_string(),
            mode: self.state.mode(),
            tool_protocol: self.state.tool_protocol(),
            suppress_previous_response_id,
        };

        let mut stream = self
            .api
            .create_message(&self.system_prompt, &history, meta)
            .await
            .map_err(RuntimeError::Api)?;

        let mut assistant_text = String::new();
        let mut reasoning_text = String::new();
        let mut tool_call: Option<ToolCallReady> = None;
        let mut received_any = false;

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => {
                    // The whole task aborting and the host interrupting
                    // just this request both fire the same token; only
                    // the former counts as a task abort.
                    return Err(if self.state.is_aborted() {
                        self.aborted()
                    } else {
                        self.request_cancelled()
                    });
                }
                item = stream.recv() => item,
            };
            let Some(chunk) = item else { break };
            let chunk = chunk.map_err(RuntimeError::Api)?;
            received_any = true;
            self.check_abort()?;

            match chunk {
                StreamChunk::Text(text) => {
                    assistant_text.push_str(&text);
                    self.interaction
                        .say(SayKind::Text, Some(assistant_text.clone()), Some(true))
                        .await?;
                }
                StreamChunk::Reasoning(text) => {
                    reasoning_text.push_str(&text);
                    self.interaction
                        .say(SayKind::Reasoning, Some(reasoning_text.clone()), Some(true))
                        .await?;
                }
                StreamChunk::Usage(usage) => {
                    self.usage.record_usage(&usage);
                }
                StreamChunk::ToolCallPartial {
                    id,
                    name,
                    arguments_fragment,
                    ..
                } => {
                    let ready = self
                        .accumulator
                        .lock()
                        .await
                        .push_fragment(&id, name.as_deref(), &arguments_fragment);
                    if let Some(ready) = ready {
                        self.accept_tool_call(&mut tool_call, ready).await?;
                    }
                }
                StreamChunk::Done => break,
            }
        }

        if !received_any {
            return Err(ApiError::EmptyStream.into());
        }

        // Zero-parameter calls only settle once the stream has ended.
        let settled = self.accumulator.lock().await.finish();
        for ready in settled {
            self.accept_tool_call(&mut tool_call, ready).await?;
        }

        // Finalize any still-partial streaming records.
        if !reasoning_text.is_empty() {
            self.interaction
                .say(SayKind::Reasoning, Some(reasoning_text), Some(false))
                .await?;
        }
        let mut assistant_blocks = Vec::new();
        if !assistant_text.is_empty() {
            self.interaction
                .say(SayKind::Text, Some(assistant_text.clone()), Some(false))
                .await?;
            assistant_blocks.push(ContentBlock::text(assistant_text));
        }

        Ok(AttemptOutcome {
            assistant_blocks,
            tool_call,
        })
    }

    /// Only one tool invocation is honored per turn; later ones are
    /// announced and dropped.
    async fn accept_tool_call(
        &self,
        slot: &mut Option<ToolCallReady>,
        ready: ToolCallReady,
    ) -> Result<()> {
        if slot.is_some() {
            debug!(ignored = %ready.name, "additional tool call in same turn");
            self.interaction
                .say(
                    SayKind::ToolProgress,
                    Some(format!(
                        "Ignoring additional tool call '{}': only one tool may run per message",
                        ready.name
                    )),
                    None,
                )
                .await?;
        } else {
            *slot = Some(ready);
        }
        Ok(())
    }

    /// Wait out an exponential backoff, announcing a live countdown once
    /// per second. Abort is re-checked every second and raises
    /// immediately; the countdown must never block cancellation.
    pub async fn backoff_and_announce(
        &self,
        attempt: u32,
        error: &ApiError,
        base_delay_secs: u64,
    ) -> Result<()> {
        let delay = base_delay_secs
            .saturating_mul(1u64 << attempt.min(30))
            .min(MAX_BACKOFF_SECS);
        let detail = error.to_string();

        for remaining in (1..=delay).rev() {
            if self.state.is_aborted() {
                return Err(TaskError::AbortedDuringRetryCountdown {
                    task_id: self.state.task_id().to_string(),
                }
                .into());
            }
            self.interaction
                .say(
                    SayKind::ApiReqRetryDelayed,
                    Some(format!("{detail}\nRetrying in {remaining} seconds...")),
                    Some(true),
                )
                .await?;
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }

        if self.state.is_aborted() {
            return Err(TaskError::AbortedDuringRetryCountdown {
                task_id: self.state.task_id().to_string(),
            }
            .into());
        }
        self.interaction
            .say(
                SayKind::ApiReqRetryDelayed,
                Some(format!("{detail}\nRetrying now...")),
                Some(false),
            )
            .await?;
        Ok(())
    }
}
