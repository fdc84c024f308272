//! Token/cost and tool-usage accounting with debounced change notification.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::events::{EventBus, TaskEvent};
use crate::provider::UsageChunk;

/// How long counter changes are coalesced before a `TokenUsageUpdated`
/// event goes out.
const EMIT_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cache_reads: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cache_writes: Option<u64>,
    pub total_cost: f64,
    /// Token footprint of the most recent request, not a running total.
    pub context_tokens: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolStats {
    pub attempts: u64,
    pub failures: u64,
}

pub type ToolUsage = HashMap<String, ToolStats>;

/// Aggregates usage counters for one task and emits `TokenUsageUpdated` on
/// the task's bus, debounced and only when something actually changed.
pub struct UsageTracker {
    task_id: String,
    bus: Arc<EventBus>,
    token_usage: Mutex<TokenUsage>,
    tool_usage: Mutex<ToolUsage>,
    last_emitted: Mutex<(TokenUsage, ToolUsage)>,
    emit_scheduled: AtomicBool,
    debounce: Duration,
}

impl UsageTracker {
    pub fn new(task_id: impl Into<String>, bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            task_id: task_id.into(),
            bus,
            token_usage: Mutex::new(TokenUsage::default()),
            tool_usage: Mutex::new(ToolUsage::default()),
            last_emitted: Mutex::new((TokenUsage::default(), ToolUsage::default())),
            emit_scheduled: AtomicBool::new(false),
            debounce: EMIT_DEBOUNCE,
        })
    }

    pub fn record_usage(self: &Arc<Self>, chunk: &UsageChunk) {
        {
            let mut usage = self.token_usage.lock().expect("usage poisoned");
            usage.total_tokens_in += chunk.input_tokens;
            usage.total_tokens_out += chunk.output_tokens;
            if let Some(reads) = chunk.cache_read_tokens {
                *usage.total_cache_reads.get_or_insert(0) += reads;
            }
            if let Some(writes) = chunk.cache_write_tokens {
                *usage.total_cache_writes.get_or_insert(0) += writes;
            }
            if let Some(cost) = chunk.total_cost {
                usage.total_cost += cost;
            }
            usage.context_tokens = chunk.input_tokens
                + chunk.output_tokens
                + chunk.cache_read_tokens.unwrap_or(0)
                + chunk.cache_write_tokens.unwrap_or(0);
        }
        self.schedule_emit();
    }

    pub fn record_tool_attempt(self: &Arc<Self>, tool_name: &str) {
        self.tool_usage
            .lock()
            .expect("tool usage poisoned")
            .entry(tool_name.to_string())
            .or_default()
            .attempts += 1;
        self.schedule_emit();
    }

    pub fn record_tool_failure(self: &Arc<Self>, tool_name: &str) {
        self.tool_usage
            .lock()
            .expect("tool usage poisoned")
            .entry(tool_name.to_string())
            .or_default()
            .failures += 1;
        self.schedule_emit();
    }

    pub fn token_usage(&self) -> TokenUsage {
        self.token_usage.lock().expect("usage poisoned").clone()
    }

    pub fn tool_usage(&self) -> ToolUsage {
        self.tool_usage.lock().expect("tool usage poisoned").clone()
    }

    /// Force the trailing emit out immediately. Called at task completion
    /// and abort so the final counters are never lost to the debounce.
    pub fn flush(&self) {
        self.emit_if_changed();
    }

    fn schedule_emit(self: &Arc<Self>) {
        if self.emit_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.debounce).await;
            this.emit_scheduled.store(false, Ordering::Release);
            this.emit_if_changed();
        });
    }

    fn emit_if_changed(&self) {
        let token_usage = self.token_usage();
        let tool_usage = self.tool_usage();
        {
            let mut last = self.last_emitted.lock().expect("last emitted poisoned");
            if last.0 == token_usage && last.1 == tool_usage {
                return;
            }
            *last = (token_usage.clone(), tool_usage.clone());
        }
        self.bus.emit(TaskEvent::TokenUsageUpdated {
            task_id: self.task_id.clone(),
            token_usage,
            tool_usage,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(input: u64, output: u64) -> UsageChunk {
        UsageChunk {
            input_tokens: input,
            output_tokens: output,
            cache_read_tokens: None,
            cache_write_tokens: None,
            total_cost: Some(0.01),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_rapid_updates() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let tracker = UsageTracker::new("t1", Arc::clone(&bus));

        tracker.record_usage(&chunk(100, 10));
        tracker.record_usage(&chunk(200, 20));
        tracker.record_usage(&chunk(300, 30));

        tokio::time::sleep(Duration::from_secs(1)).await;

        let event = rx.recv().await.expect("one debounced event");
        match event {
            TaskEvent::TokenUsageUpdated { token_usage, .. } => {
                assert_eq!(token_usage.total_tokens_in, 600);
                assert_eq!(token_usage.total_tokens_out, 60);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // No second event queued for the same counters.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_skips_when_unchanged() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let tracker = UsageTracker::new("t1", Arc::clone(&bus));

        tracker.record_usage(&chunk(50, 5));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.recv().await.is_some());

        tracker.flush();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tool_counters() {
        let bus = Arc::new(EventBus::new());
        let tracker = UsageTracker::new("t1", bus);

        tracker.record_tool_attempt("read_file");
        tracker.record_tool_attempt("read_file");
        tracker.record_tool_failure("read_file");
        tracker.record_tool_attempt("write_file");

        let usage = tracker.tool_usage();
        assert_eq!(usage["read_file"], ToolStats { attempts: 2, failures: 1 });
        assert_eq!(usage["write_file"], ToolStats { attempts: 1, failures: 0 });
    }

    #[tokio::test]
    async fn test_context_tokens_track_latest_request() {
        let bus = Arc::new(EventBus::new());
        let tracker = UsageTracker::new("t1", bus);

        tracker.record_usage(&chunk(1000, 100));
        tracker.record_usage(&chunk(400, 40));

        let usage = tracker.token_usage();
        assert_eq!(usage.total_tokens_in, 1400);
        assert_eq!(usage.context_tokens, 440);
    }
}
