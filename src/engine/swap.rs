//! Swap response construction: compaction block plus WAL stitching.
//!
//! The substitute compaction content carries BOTH the checkpoint summary and
//! the WAL tail (messages observed after the checkpoint anchor), so the
//! block is a complete record of the conversation up to the swap point. A
//! framing note tells the model to respond normally afterwards instead of
//! continuing to summarize.

use bytes::Bytes;
use serde_json::Value;

use crate::wire::{compaction_message_json, compaction_sse_events, SseEvent};

/// A pre-built response the proxy sends instead of calling upstream.
pub enum SyntheticResponse {
    Json(Value),
    Stream(Vec<SseEvent>),
}

impl SyntheticResponse {
    #[must_use]
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json(_) => "application/json",
            Self::Stream(_) => "text/event-stream",
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Json(body) => Bytes::from(body.to_string()),
            Self::Stream(events) => {
                let parts: Vec<Bytes> = events.iter().map(SseEvent::to_bytes).collect();
                parts.concat().into()
            }
        }
    }
}

/// Build the swap response for the client, in the wire shape it asked for.
#[must_use]
pub fn build_swap_response(
    checkpoint_content: &str,
    model: &str,
    stream: bool,
    wal_messages: &[Value],
) -> SyntheticResponse {
    let content = format_compaction_with_wal(checkpoint_content, wal_messages);
    if stream {
        SyntheticResponse::Stream(compaction_sse_events(&content, model))
    } else {
        SyntheticResponse::Json(compaction_message_json(&content, model))
    }
}

/// Combine the checkpoint summary with the serialized WAL tail.
#[must_use]
pub fn format_compaction_with_wal(checkpoint_content: &str, wal_messages: &[Value]) -> String {
    let mut parts: Vec<String> = vec![
        "<context_summary>".to_string(),
        "This is a summary of the conversation so far. \
         All prior context has been incorporated below. \
         Respond normally to the user's next message."
            .to_string(),
        String::new(),
        checkpoint_content.to_string(),
    ];

    if !wal_messages.is_empty() {
        let serialized: Vec<String> = wal_messages.iter().map(serialize_message).collect();
        parts.push(String::new());
        parts.push("<recent_activity>".to_string());
        parts.push(serialized.join("\n\n"));
        parts.push("</recent_activity>".to_string());
    }

    parts.push("</context_summary>".to_string());
    parts.join("\n")
}

/// Serialize one wire message to readable text for the WAL section.
fn serialize_message(message: &Value) -> String {
    let role = crate::wire::message_role(message);
    match message.get("content") {
        Some(Value::String(text)) => format!("[{role}]\n{text}"),
        Some(Value::Array(blocks)) => {
            let parts: Vec<String> = blocks.iter().map(serialize_block).collect();
            format!("[{role}]\n{}", parts.join("\n"))
        }
        other => format!("[{role}]\n{}", other.map(Value::to_string).unwrap_or_default()),
    }
}

fn serialize_block(block: &Value) -> String {
    match block {
        Value::String(text) => text.clone(),
        Value::Object(_) => match block.get("type").and_then(Value::as_str) {
            Some("text") => block
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            Some("tool_use") => {
                let name = block.get("name").and_then(Value::as_str).unwrap_or("?");
                let input = block
                    .get("input")
                    .map(|input| truncate(&input.to_string(), 200))
                    .unwrap_or_default();
                format!("[tool_use: {name}({input})]")
            }
            Some("tool_result") => {
                let content = match block.get("content") {
                    Some(Value::String(text)) => text.clone(),
                    Some(Value::Array(parts)) => parts
                        .iter()
                        .filter_map(|part| part.get("text").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join(" "),
                    other => other.map(Value::to_string).unwrap_or_default(),
                };
                format!("[tool_result: {}]", truncate(&content, 500))
            }
            Some("compaction") => "[prior compaction summary]".to_string(),
            other => format!("[{} block]", other.unwrap_or("unknown")),
        },
        other => other.to_string(),
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() > limit {
        text.chars().take(limit).collect()
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_without_wal() {
        let content = format_compaction_with_wal("the checkpoint", &[]);
        assert!(content.starts_with("<context_summary>"));
        assert!(content.ends_with("</context_summary>"));
        assert!(content.contains("the checkpoint"));
        assert!(!content.contains("<recent_activity>"));
    }

    #[test]
    fn test_format_with_wal_tail() {
        let wal = vec![
            json!({"role": "user", "content": "a follow-up question"}),
            json!({"role": "assistant", "content": [
                {"type": "text", "text": "an answer"},
                {"type": "tool_use", "id": "t1", "name": "grep", "input": {"pattern": "x"}},
            ]}),
        ];
        let content = format_compaction_with_wal("summary body", &wal);
        assert!(content.contains("<recent_activity>"));
        assert!(content.contains("[user]\na follow-up question"));
        assert!(content.contains("[tool_use: grep"));
        assert!(content.contains("summary body"));
    }

    #[test]
    fn test_tool_result_truncated() {
        let wal = vec![json!({"role": "user", "content": [
            {"type": "tool_result", "tool_use_id": "t1", "content": "x".repeat(2000)},
        ]})];
        let content = format_compaction_with_wal("s", &wal);
        assert!(content.len() < 1200);
    }

    #[test]
    fn test_build_swap_response_shapes() {
        let json_resp = build_swap_response("sum", "tiny", false, &[]);
        assert_eq!(json_resp.content_type(), "application/json");
        match &json_resp {
            SyntheticResponse::Json(body) => {
                assert_eq!(body["stop_reason"], "compaction");
                assert!(body["content"][0]["content"]
                    .as_str()
                    .unwrap()
                    .contains("sum"));
            }
            SyntheticResponse::Stream(_) => panic!("expected json"),
        }

        let stream_resp = build_swap_response("sum", "tiny", true, &[]);
        assert_eq!(stream_resp.content_type(), "text/event-stream");
        let bytes = stream_resp.to_bytes();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("event: message_start"));
        assert!(text.trim_end().ends_with("data: {\"type\":\"message_stop\"}"));
    }
}
