//! Tool-result id reconciliation.
//!
//! Assistant tool invocations and user tool-result blocks must correlate
//! by id, but upstream layers can rewrite or drop ids. Rather than fail
//! the turn, results are repaired positionally against the previous
//! assistant message: the i-th result takes the i-th tool-use id, surplus
//! results are dropped, and missing results are synthesized so the model
//! never sees an unanswered invocation.

use tracing::warn;

use crate::messages::{ApiMessage, ContentBlock};

const INTERRUPTED_RESULT: &str = "Tool execution was interrupted before completion.";

/// Repair the tool-result blocks of an outbound user message so they match
/// the tool-use ids of `previous_assistant`, one result per use, in order.
/// Non-tool-result content is preserved in its original order.
pub fn validate_and_fix_tool_result_ids(
    user_content: &mut Vec<ContentBlock>,
    previous_assistant: Option<&ApiMessage>,
) {
    let expected_ids: Vec<String> = previous_assistant
        .map(|m| m.tool_use_ids().into_iter().map(String::from).collect())
        .unwrap_or_default();

    let result_count = user_content.iter().filter(|b| b.is_tool_result()).count();

    if expected_ids.is_empty() {
        // Nothing to correlate against; stray results would confuse the
        // model, so they are dropped.
        if result_count > 0 {
            warn!("dropping {result_count} tool results with no matching tool use");
            user_content.retain(|b| !b.is_tool_result());
        }
        return;
    }

    // Positional reassignment, dropping anything past the expected count.
    let mut position = 0usize;
    user_content.retain_mut(|block| {
        if let ContentBlock::ToolResult { tool_use_id, .. } = block {
            if position >= expected_ids.len() {
                warn!(dropped_id = %tool_use_id, "dropping surplus tool result");
                return false;
            }
            if *tool_use_id != expected_ids[position] {
                warn!(
                    from = %tool_use_id,
                    to = %expected_ids[position],
                    "reassigning tool result id positionally"
                );
                *tool_use_id = expected_ids[position].clone();
            }
            position += 1;
        }
        true
    });

    // Synthesize results for unanswered invocations, each prepended in
    // turn so the front ends up in reverse emission order.
    for id in &expected_ids[position.min(expected_ids.len())..] {
        warn!(tool_use_id = %id, "synthesizing missing tool result");
        user_content.insert(
            0,
            ContentBlock::ToolResult {
                tool_use_id: id.clone(),
                content: INTERRUPTED_RESULT.to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ApiMessage;

    fn assistant_with_uses(ids: &[&str]) -> ApiMessage {
        ApiMessage::assistant(
            ids.iter()
                .map(|id| ContentBlock::ToolUse {
                    id: id.to_string(),
                    name: "some_tool".into(),
                    input: serde_json::json!({}),
                })
                .collect(),
            None,
        )
    }

    fn result(id: &str, content: &str) -> ContentBlock {
        ContentBlock::ToolResult {
            tool_use_id: id.into(),
            content: content.into(),
        }
    }

    fn result_ids(content: &[ContentBlock]) -> Vec<&str> {
        content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_positional_reassignment_preserves_content() {
        let assistant = assistant_with_uses(&["tool-1", "tool-2"]);
        let mut content = vec![result("wrong-1", "output A"), result("wrong-2", "output B")];

        validate_and_fix_tool_result_ids(&mut content, Some(&assistant));

        assert_eq!(result_ids(&content), vec!["tool-1", "tool-2"]);
        assert_eq!(content.len(), 2);
        match &content[0] {
            ContentBlock::ToolResult { content, .. } => assert_eq!(content, "output A"),
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn test_surplus_results_dropped_not_duplicated() {
        let assistant = assistant_with_uses(&["tool-1"]);
        let mut content = vec![result("wrong-1", "kept"), result("extra-id", "dropped")];

        validate_and_fix_tool_result_ids(&mut content, Some(&assistant));

        assert_eq!(result_ids(&content), vec!["tool-1"]);
        assert_eq!(content.len(), 1);
    }

    #[test]
    fn test_missing_results_synthesized_in_reverse_at_front() {
        let assistant = assistant_with_uses(&["tool-1", "tool-2"]);
        let mut content = vec![ContentBlock::text("user typed this")];

        validate_and_fix_tool_result_ids(&mut content, Some(&assistant));

        assert_eq!(result_ids(&content), vec!["tool-2", "tool-1"]);
        assert_eq!(content.len(), 3);
        for block in &content[..2] {
            match block {
                ContentBlock::ToolResult { content, .. } => {
                    assert_eq!(content, INTERRUPTED_RESULT);
                }
                other => panic!("unexpected block: {other:?}"),
            }
        }
        assert_eq!(content[2], ContentBlock::text("user typed this"));
    }

    #[test]
    fn test_partial_results_fill_missing_tail() {
        let assistant = assistant_with_uses(&["tool-1", "tool-2"]);
        let mut content = vec![result("wrong-1", "real output")];

        validate_and_fix_tool_result_ids(&mut content, Some(&assistant));

        // Synthesized for tool-2 at the front, real result reassigned.
        assert_eq!(result_ids(&content), vec!["tool-2", "tool-1"]);
        match &content[1] {
            ContentBlock::ToolResult { content, .. } => assert_eq!(content, "real output"),
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn test_no_previous_assistant_strips_results() {
        let mut content = vec![result("orphan", "x"), ContentBlock::text("hello")];
        validate_and_fix_tool_result_ids(&mut content, None);
        assert_eq!(content, vec![ContentBlock::text("hello")]);
    }

    #[test]
    fn test_matching_ids_untouched() {
        let assistant = assistant_with_uses(&["tool-1"]);
        let mut content = vec![result("tool-1", "fine"), ContentBlock::text("note")];
        let before = content.clone();

        validate_and_fix_tool_result_ids(&mut content, Some(&assistant));
        assert_eq!(content, before);
    }
}
