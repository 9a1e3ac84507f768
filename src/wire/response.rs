//! Synthetic compaction responses.
//!
//! When a swap executes, the client receives a response shaped exactly like
//! the native API's compaction output: a `message` carrying a single
//! `compaction` content block with `stop_reason: "compaction"`. The
//! streaming variant emits the equivalent six-event SSE sequence.

use serde_json::json;
use uuid::Uuid;

use super::sse::SseEvent;

/// Generate a `msg_`-prefixed message id.
#[must_use]
pub fn new_message_id() -> String {
    format!("msg_proxy_{}", Uuid::new_v4().simple())
}

/// Build the non-streaming compaction response body.
#[must_use]
pub fn compaction_message_json(compaction_content: &str, model: &str) -> serde_json::Value {
    json!({
        "id": new_message_id(),
        "type": "message",
        "role": "assistant",
        "content": [{"type": "compaction", "content": compaction_content}],
        "model": model,
        "stop_reason": "compaction",
        "stop_sequence": null,
        "usage": {"input_tokens": 0, "output_tokens": 0},
    })
}

/// Build the streaming compaction response as an SSE event sequence:
/// message_start, content_block_start, content_block_delta (carrying the
/// complete content), content_block_stop, message_delta, message_stop.
#[must_use]
pub fn compaction_sse_events(compaction_content: &str, model: &str) -> Vec<SseEvent> {
    let message_id = new_message_id();

    vec![
        SseEvent::new(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": message_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                },
            }),
        ),
        SseEvent::new(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": {"type": "compaction", "content": ""},
            }),
        ),
        SseEvent::new(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "compaction_delta", "content": compaction_content},
            }),
        ),
        SseEvent::new(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": 0}),
        ),
        SseEvent::new(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": "compaction", "stop_sequence": null},
                "usage": {"output_tokens": 0},
            }),
        ),
        SseEvent::new("message_stop", json!({"type": "message_stop"})),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_response_shape() {
        let body = compaction_message_json("the summary", "claude-opus-4-6");
        assert_eq!(body["type"], "message");
        assert_eq!(body["role"], "assistant");
        assert_eq!(body["stop_reason"], "compaction");
        assert_eq!(body["content"][0]["type"], "compaction");
        assert_eq!(body["content"][0]["content"], "the summary");
        assert!(body["id"].as_str().unwrap().starts_with("msg_"));
    }

    #[test]
    fn test_sse_sequence_order_and_content() {
        let events = compaction_sse_events("the summary", "claude-opus-4-6");
        let names: Vec<&str> = events.iter().map(|event| event.event.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        let delta: serde_json::Value = serde_json::from_str(&events[2].data).unwrap();
        assert_eq!(delta["delta"]["type"], "compaction_delta");
        assert_eq!(delta["delta"]["content"], "the summary");
    }
}
