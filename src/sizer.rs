//! Token estimation over raw message JSON.
//!
//! The proxy never tokenizes for real; it only needs an estimate that is
//! monotone in input length, because every threshold is a fraction of the
//! context window. The heuristic is ~4 characters per token plus small fixed
//! overheads for message framing and tool blocks.

use serde_json::Value;

/// Estimates token counts for wire-format message values.
pub struct TokenEstimator;

impl TokenEstimator {
    /// Characters per token estimate; actual ratio varies by content.
    const CHARS_PER_TOKEN: u64 = 4;

    /// Overhead tokens per message (role, formatting).
    const MESSAGE_OVERHEAD: u64 = 4;

    /// Overhead for tool use blocks (id, name, formatting).
    const TOOL_USE_OVERHEAD: u64 = 20;

    /// Overhead for tool result blocks (id, formatting).
    const TOOL_RESULT_OVERHEAD: u64 = 10;

    /// Estimate tokens for a text string.
    #[must_use]
    pub const fn estimate_text(text: &str) -> u64 {
        (text.len() as u64).div_ceil(Self::CHARS_PER_TOKEN)
    }

    /// Estimate tokens for a single wire message object.
    #[must_use]
    pub fn estimate_message(message: &Value) -> u64 {
        let content_tokens = match message.get("content") {
            Some(Value::String(text)) => Self::estimate_text(text),
            Some(Value::Array(blocks)) => blocks.iter().map(Self::estimate_block).sum(),
            _ => 0,
        };
        content_tokens + Self::MESSAGE_OVERHEAD
    }

    fn estimate_block(block: &Value) -> u64 {
        let text_of = |key: &str| {
            block
                .get(key)
                .and_then(Value::as_str)
                .map_or(0, Self::estimate_text)
        };
        match block.get("type").and_then(Value::as_str) {
            Some("text") => text_of("text"),
            Some("tool_use") => {
                let input = block
                    .get("input")
                    .map(|input| serde_json::to_string(input).unwrap_or_default())
                    .unwrap_or_default();
                text_of("name") + Self::estimate_text(&input) + Self::TOOL_USE_OVERHEAD
            }
            Some("tool_result") => {
                let content = match block.get("content") {
                    Some(Value::String(text)) => Self::estimate_text(text),
                    Some(Value::Array(parts)) => parts
                        .iter()
                        .map(|part| {
                            part.get("text")
                                .and_then(Value::as_str)
                                .map_or(0, Self::estimate_text)
                        })
                        .sum(),
                    _ => 0,
                };
                content + Self::TOOL_RESULT_OVERHEAD
            }
            Some("compaction") => text_of("content"),
            _ => {
                // Unknown block: charge for its serialized length so the
                // estimate stays monotone in input size.
                let serialized = serde_json::to_string(block).unwrap_or_default();
                Self::estimate_text(&serialized)
            }
        }
    }

    /// Estimate total tokens for a message list.
    #[must_use]
    pub fn estimate_messages(messages: &[Value]) -> u64 {
        messages.iter().map(Self::estimate_message).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_estimate_text() {
        assert_eq!(TokenEstimator::estimate_text(""), 0);
        assert_eq!(TokenEstimator::estimate_text("hi"), 1);
        assert_eq!(TokenEstimator::estimate_text("test"), 1);
        assert_eq!(TokenEstimator::estimate_text("hello"), 2);
        assert_eq!(TokenEstimator::estimate_text("hello world!"), 3);
    }

    #[test]
    fn test_estimate_string_content_message() {
        let message = json!({"role": "user", "content": "Hello, how are you?"});
        // 5 content tokens + 4 overhead
        assert_eq!(TokenEstimator::estimate_message(&message), 9);
    }

    #[test]
    fn test_estimate_block_message_with_tool_use() {
        let message = json!({
            "role": "assistant",
            "content": [
                {"type": "text", "text": "Let me help."},
                {"type": "tool_use", "id": "tool_123", "name": "read", "input": {"path": "/test.txt"}},
            ],
        });
        let estimate = TokenEstimator::estimate_message(&message);
        assert!(estimate > 25, "tool use overhead missing: {estimate}");
    }

    #[test]
    fn test_estimate_tool_result() {
        let message = json!({
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": "tool_123",
                "content": "File contents here...",
            }],
        });
        // 6 content + 10 overhead + 4 message overhead
        assert_eq!(TokenEstimator::estimate_message(&message), 20);
    }

    #[test]
    fn test_estimate_is_monotone_in_length() {
        let short = vec![json!({"role": "user", "content": "short"})];
        let long = vec![json!({"role": "user", "content": "a much longer message body"})];
        assert!(
            TokenEstimator::estimate_messages(&long) > TokenEstimator::estimate_messages(&short)
        );
    }

    #[test]
    fn test_empty_history() {
        assert_eq!(TokenEstimator::estimate_messages(&[]), 0);
    }
}
