//! Incremental tool-call assembly.
//!
//! Tool-call arguments arrive as text fragments spread across stream
//! chunks, keyed by call id, and several calls can interleave in the same
//! turn. Fragments are appended per id; a call is surfaced exactly once,
//! as soon as its accumulated arguments parse as a complete JSON document
//! and its name is known. Zero-parameter calls only surface at end of
//! stream: providers often send the name with an empty first fragment and
//! the argument text in later chunks, so an empty buffer mid-stream means
//! "not yet", not "no parameters".

use serde_json::Value;

/// A fully assembled tool invocation ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallReady {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug)]
struct PendingToolCall {
    id: String,
    name: Option<String>,
    arguments: String,
    emitted: bool,
}

/// Per-attempt accumulator. Cleared unconditionally at the start of each
/// streaming attempt so a failed attempt's fragments never bleed into the
/// retry.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: Vec<PendingToolCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.calls.clear();
    }

    /// Feed one fragment. Returns the assembled call the first time its
    /// arguments form a complete document; later fragments for an already
    /// emitted id are ignored.
    pub fn push_fragment(
        &mut self,
        id: &str,
        name: Option<&str>,
        arguments_fragment: &str,
    ) -> Option<ToolCallReady> {
        let call = match self.calls.iter_mut().find(|c| c.id == id) {
            Some(call) => call,
            None => {
                self.calls.push(PendingToolCall {
                    id: id.to_string(),
                    name: None,
                    arguments: String::new(),
                    emitted: false,
                });
                self.calls.last_mut().unwrap()
            }
        };

        if let Some(name) = name {
            call.name.get_or_insert_with(|| name.to_string());
        }
        call.arguments.push_str(arguments_fragment);

        if call.emitted {
            return None;
        }
        let name = call.name.clone()?;

        // An empty buffer is indistinguishable from arguments that have
        // not arrived yet; finish() settles those.
        if call.arguments.trim().is_empty() {
            return None;
        }
        match serde_json::from_str::<Value>(&call.arguments) {
            Ok(arguments) => {
                call.emitted = true;
                Some(ToolCallReady {
                    id: call.id.clone(),
                    name,
                    arguments,
                })
            }
            // Incomplete document; keep accumulating.
            Err(_) => None,
        }
    }

    /// End-of-stream pass. Named calls whose buffers are still empty are
    /// valid zero-parameter invocations and surface here with `{}`;
    /// anything with a half-built document stays unemitted.
    pub fn finish(&mut self) -> Vec<ToolCallReady> {
        self.calls
            .iter_mut()
            .filter(|c| !c.emitted && c.arguments.trim().is_empty())
            .filter_map(|call| {
                let name = call.name.clone()?;
                call.emitted = true;
                Some(ToolCallReady {
                    id: call.id.clone(),
                    name,
                    arguments: Value::Object(serde_json::Map::new()),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragmented_arguments_emit_once_complete() {
        let mut acc = ToolCallAccumulator::new();

        assert!(acc.push_fragment("call-1", Some("read_file"), "{\"path\":").is_none());
        assert!(acc.push_fragment("call-1", None, " \"src/li").is_none());
        let ready = acc
            .push_fragment("call-1", None, "b.rs\"}")
            .expect("complete document");

        assert_eq!(ready.name, "read_file");
        assert_eq!(ready.arguments, serde_json::json!({"path": "src/lib.rs"}));
    }

    #[test]
    fn test_interleaved_calls_tracked_independently() {
        let mut acc = ToolCallAccumulator::new();

        assert!(acc.push_fragment("a", Some("first"), "{\"x\":").is_none());
        assert!(acc.push_fragment("b", Some("second"), "{\"y\":").is_none());
        let a = acc.push_fragment("a", None, "1}").unwrap();
        let b = acc.push_fragment("b", None, "2}").unwrap();

        assert_eq!(a.name, "first");
        assert_eq!(b.name, "second");
    }

    #[test]
    fn test_emits_only_once_per_id() {
        let mut acc = ToolCallAccumulator::new();
        assert!(acc.push_fragment("c", Some("tool"), "{}").is_some());
        assert!(acc.push_fragment("c", None, "").is_none());
    }

    #[test]
    fn test_zero_parameter_call_surfaces_at_finish() {
        let mut acc = ToolCallAccumulator::new();
        assert!(acc.push_fragment("c", Some("list_files"), "").is_none());

        let done = acc.finish();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].name, "list_files");
        assert_eq!(done[0].arguments, serde_json::json!({}));
        // A second finish does not re-emit.
        assert!(acc.finish().is_empty());
    }

    #[test]
    fn test_name_first_empty_fragment_keeps_accumulating() {
        let mut acc = ToolCallAccumulator::new();
        // Name arrives with an empty fragment, arguments stream later.
        assert!(acc.push_fragment("c", Some("read_file"), "").is_none());
        assert!(acc.push_fragment("c", None, "{\"path\": \"src/").is_none());
        let ready = acc.push_fragment("c", None, "main.rs\"}").unwrap();

        assert_eq!(ready.arguments, serde_json::json!({"path": "src/main.rs"}));
        assert!(acc.finish().is_empty());
    }

    #[test]
    fn test_finish_leaves_incomplete_documents_unemitted() {
        let mut acc = ToolCallAccumulator::new();
        acc.push_fragment("c", Some("write_file"), "{\"path\":");
        assert!(acc.finish().is_empty());
    }

    #[test]
    fn test_nameless_call_waits_for_name() {
        let mut acc = ToolCallAccumulator::new();
        assert!(acc.push_fragment("c", None, "{\"done\": true}").is_none());
        let ready = acc.push_fragment("c", Some("finish"), "").unwrap();
        assert_eq!(ready.name, "finish");
    }

    #[test]
    fn test_clear_drops_pending_state() {
        let mut acc = ToolCallAccumulator::new();
        acc.push_fragment("c", Some("tool"), "{\"unfinished\":");
        acc.clear();
        // Same id starts from scratch after a clear.
        assert!(acc.push_fragment("c", Some("tool"), "{\"done\":").is_none());
        assert!(acc.push_fragment("c", None, "1}").is_some());
    }
}
