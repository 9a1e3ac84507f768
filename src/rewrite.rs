//! Request rewriting before forwarding upstream.
//!
//! Two rewrites exist, both idempotent:
//! - the native compaction edit is stripped from `context_management` so the
//!   upstream API never compacts on its own (other edits are preserved),
//! - `compaction` content blocks left over from a previous swap are
//!   converted to plain text blocks, which the API accepts.

use serde_json::Value;

use crate::wire::MessagesRequest;

/// The `context_management` edit type that triggers native compaction.
pub const COMPACT_EDIT_TYPE: &str = "compact_20260112";

/// Remove the compaction edit from `context_management`, keeping other
/// edits. Removes the `context_management` field entirely when no edits
/// remain. Returns whether the request was modified.
pub fn strip_compact_edit(request: &mut MessagesRequest) -> bool {
    let Some(ctx) = request.context_management.as_mut() else {
        return false;
    };
    let Some(edits) = ctx.get_mut("edits").and_then(Value::as_array_mut) else {
        return false;
    };

    let before = edits.len();
    edits.retain(|edit| edit.get("type").and_then(Value::as_str) != Some(COMPACT_EDIT_TYPE));
    if edits.len() == before {
        return false;
    }

    if edits.is_empty() {
        request.context_management = None;
    }
    true
}

/// Convert `compaction` content blocks to plain text blocks in place.
/// Returns whether any block was converted.
pub fn strip_compaction_blocks(messages: &mut [Value]) -> bool {
    let mut changed = false;
    for message in messages.iter_mut() {
        let Some(blocks) = message.get_mut("content").and_then(Value::as_array_mut) else {
            continue;
        };
        for block in blocks.iter_mut() {
            if block.get("type").and_then(Value::as_str) != Some("compaction") {
                continue;
            }
            let text = block
                .get("content")
                .and_then(Value::as_str)
                .filter(|content| !content.is_empty())
                .unwrap_or("[conversation summary]")
                .to_string();
            *block = serde_json::json!({"type": "text", "text": text});
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: Value) -> MessagesRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_strip_compact_edit_preserves_others() {
        let mut req = request(json!({
            "model": "m",
            "messages": [],
            "context_management": {"edits": [
                {"type": "compact_20260112", "trigger": {"type": "input_tokens", "value": 50000}},
                {"type": "clear_thinking_20251015"},
            ]},
        }));
        assert!(strip_compact_edit(&mut req));
        let edits = req.context_management.as_ref().unwrap()["edits"]
            .as_array()
            .unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0]["type"], "clear_thinking_20251015");
    }

    #[test]
    fn test_strip_compact_edit_removes_empty_context_management() {
        let mut req = request(json!({
            "model": "m",
            "messages": [],
            "context_management": {"edits": [{"type": "compact_20260112"}]},
        }));
        assert!(strip_compact_edit(&mut req));
        assert!(req.context_management.is_none());
    }

    #[test]
    fn test_strip_compact_edit_noop_without_edit() {
        let mut req = request(json!({
            "model": "m",
            "messages": [],
            "context_management": {"edits": [{"type": "clear_thinking_20251015"}]},
        }));
        assert!(!strip_compact_edit(&mut req));
        assert!(req.context_management.is_some());
    }

    #[test]
    fn test_strip_compaction_blocks_converts_to_text() {
        let mut messages = vec![json!({
            "role": "assistant",
            "content": [
                {"type": "compaction", "content": "the summary"},
                {"type": "text", "text": "untouched"},
            ],
        })];
        assert!(strip_compaction_blocks(&mut messages));
        let blocks = messages[0]["content"].as_array().unwrap();
        assert_eq!(blocks[0], json!({"type": "text", "text": "the summary"}));
        assert_eq!(blocks[1]["text"], "untouched");
    }

    #[test]
    fn test_strip_compaction_blocks_empty_content_placeholder() {
        let mut messages = vec![json!({
            "role": "assistant",
            "content": [{"type": "compaction", "content": ""}],
        })];
        assert!(strip_compaction_blocks(&mut messages));
        assert_eq!(
            messages[0]["content"][0]["text"],
            "[conversation summary]"
        );
    }

    #[test]
    fn test_strip_compaction_blocks_noop() {
        let mut messages = vec![json!({"role": "user", "content": "plain string"})];
        assert!(!strip_compaction_blocks(&mut messages));
    }
}
