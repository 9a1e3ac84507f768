//! Classification of inbound requests.
//!
//! A compaction request is an ordinary completion request whose last user
//! message asks the model to summarize the conversation; there is no special
//! edit type or content block on the wire. Classification errs toward
//! `Ordinary`: a false negative merely loses the acceleration, a false
//! positive would corrupt the client's conversation.

use serde_json::Value;

use crate::wire::{message_role, message_text, MessagesRequest};

/// Marker text the client includes in its compaction prompt, matched
/// case-insensitively against the last user message.
pub const COMPACT_PROMPT_MARKER: &str = "create a detailed summary of the conversation";

/// Marker for ephemeral suggestion-mode requests, which must not update
/// conversation state.
const SUGGESTION_MARKER: &str = "[SUGGESTION MODE:";

/// How an inbound completion request is treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestClass {
    /// A normal conversation turn.
    Ordinary,
    /// A compaction request eligible for substitution.
    Compact,
}

/// Classify a request as ordinary or compact.
#[must_use]
pub fn classify(request: &MessagesRequest) -> RequestClass {
    // A lone compaction-shaped message with no history is not a real
    // compaction of anything; leave it alone.
    if request.messages.len() < 2 {
        return RequestClass::Ordinary;
    }
    let Some(last) = request.last_message() else {
        return RequestClass::Ordinary;
    };
    if message_role(last) != "user" {
        return RequestClass::Ordinary;
    }
    if message_text(last).to_lowercase().contains(COMPACT_PROMPT_MARKER) {
        RequestClass::Compact
    } else {
        RequestClass::Ordinary
    }
}

/// Whether this is a suggestion-mode request (ephemeral, skips buffer logic).
#[must_use]
pub fn is_suggestion_request(request: &MessagesRequest) -> bool {
    let Some(last) = request.last_message() else {
        return false;
    };
    message_role(last) == "user" && message_text(last).contains(SUGGESTION_MARKER)
}

/// Whether any message carries a `compaction` content block, meaning the
/// client already holds a compaction and local state is stale.
#[must_use]
pub fn has_compaction_block(messages: &[Value]) -> bool {
    messages.iter().any(|message| {
        message
            .get("content")
            .and_then(Value::as_array)
            .is_some_and(|blocks| {
                blocks.iter().any(|block| {
                    block.get("type").and_then(Value::as_str) == Some("compaction")
                })
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(messages: Value) -> MessagesRequest {
        serde_json::from_value(json!({"model": "m", "messages": messages})).unwrap()
    }

    #[test]
    fn test_compact_request_detected() {
        let req = request(json!([
            {"role": "user", "content": "do the thing"},
            {"role": "assistant", "content": "done"},
            {"role": "user", "content": "Please CREATE a Detailed Summary of the Conversation so far."},
        ]));
        assert_eq!(classify(&req), RequestClass::Compact);
    }

    #[test]
    fn test_compact_marker_in_text_blocks() {
        let req = request(json!([
            {"role": "user", "content": "context"},
            {"role": "user", "content": [
                {"type": "text", "text": "create a detailed summary"},
                {"type": "text", "text": "of the conversation above"},
            ]},
        ]));
        assert_eq!(classify(&req), RequestClass::Compact);
    }

    #[test]
    fn test_ordinary_turn() {
        let req = request(json!([
            {"role": "user", "content": "hello"},
            {"role": "assistant", "content": "hi"},
            {"role": "user", "content": "summarize this function for me"},
        ]));
        assert_eq!(classify(&req), RequestClass::Ordinary);
    }

    #[test]
    fn test_last_message_must_be_user() {
        let req = request(json!([
            {"role": "user", "content": "create a detailed summary of the conversation"},
            {"role": "assistant", "content": "create a detailed summary of the conversation"},
        ]));
        assert_eq!(classify(&req), RequestClass::Ordinary);
    }

    #[test]
    fn test_trivial_history_is_ordinary() {
        let req = request(json!([
            {"role": "user", "content": "create a detailed summary of the conversation"},
        ]));
        assert_eq!(classify(&req), RequestClass::Ordinary);
    }

    #[test]
    fn test_suggestion_mode() {
        let req = request(json!([
            {"role": "user", "content": "[SUGGESTION MODE: complete the next word]"},
        ]));
        assert!(is_suggestion_request(&req));
        assert!(!is_suggestion_request(&request(json!([
            {"role": "user", "content": "ordinary"},
        ]))));
    }

    #[test]
    fn test_compaction_block_detection() {
        let with_block = vec![json!({
            "role": "assistant",
            "content": [{"type": "compaction", "content": "summary text"}],
        })];
        let without = vec![json!({"role": "user", "content": "plain"})];
        assert!(has_compaction_block(&with_block));
        assert!(!has_compaction_block(&without));
    }
}
