//! Tolerant parsing of inbound completion requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An inbound `/v1/messages` request body.
///
/// Only the fields the proxy inspects are typed; everything else is
/// preserved verbatim in `rest` so a rewritten body can be re-serialized
/// without dropping unknown fields. Forwarding of unmodified requests reuses
/// the original bytes, so serialization order here only matters for bodies
/// the proxy actually rewrites.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MessagesRequest {
    #[serde(default)]
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,

    #[serde(default)]
    pub messages: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_management: Option<Value>,

    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

impl MessagesRequest {
    /// Whether the client asked for a streaming response.
    #[must_use]
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// The last message in the request, if any.
    #[must_use]
    pub fn last_message(&self) -> Option<&Value> {
        self.messages.last()
    }
}

/// The `role` of a wire message object, or `"unknown"`.
#[must_use]
pub fn message_role(message: &Value) -> &str {
    message
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
}

/// Concatenated text of a wire message's content.
///
/// String content is returned as-is; block content contributes its `text`
/// blocks joined by spaces. Non-text blocks are skipped.
#[must_use]
pub fn message_text(message: &Value) -> String {
    match message.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter_map(|block| match block {
                    Value::String(text) => Some(text.as_str()),
                    Value::Object(_) if block.get("type").and_then(Value::as_str) == Some("text") => {
                        block.get("text").and_then(Value::as_str)
                    }
                    _ => None,
                })
                .collect();
            parts.join(" ")
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_fields_survive_roundtrip() {
        let body = json!({
            "model": "claude-opus-4-6",
            "max_tokens": 4096,
            "temperature": 0.3,
            "messages": [{"role": "user", "content": "hi"}],
            "some_future_field": {"nested": true},
        });
        let parsed: MessagesRequest = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.model, "claude-opus-4-6");
        assert!(parsed.rest.contains_key("max_tokens"));
        assert!(parsed.rest.contains_key("some_future_field"));

        let reserialized = serde_json::to_value(&parsed).unwrap();
        assert_eq!(reserialized["temperature"], json!(0.3));
        assert_eq!(reserialized["some_future_field"]["nested"], json!(true));
    }

    #[test]
    fn test_stream_flag_absent_is_not_serialized() {
        let parsed: MessagesRequest =
            serde_json::from_value(json!({"model": "m", "messages": []})).unwrap();
        assert!(!parsed.is_stream());
        let reserialized = serde_json::to_value(&parsed).unwrap();
        assert!(reserialized.get("stream").is_none());
    }

    #[test]
    fn test_message_text_from_blocks() {
        let message = json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "first"},
                {"type": "tool_result", "tool_use_id": "t1", "content": "ignored"},
                {"type": "text", "text": "second"},
            ],
        });
        assert_eq!(message_text(&message), "first second");
        assert_eq!(message_role(&message), "user");
    }
}
