//! Background summarization via the upstream compaction API.
//!
//! A checkpoint call is a one-shot non-streaming completion request carrying
//! the conversation snapshot and a `context_management` compaction edit with
//! `pause_after_compaction: true`; the response's `compaction` block is the
//! summary.

use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use thiserror::Error;

use crate::rewrite::strip_compaction_blocks;
use crate::sizer::TokenEstimator;
use crate::upstream::{UpstreamClient, UpstreamRequest, CHECKPOINT_TIMEOUT};

/// Beta flag required for the compaction edit.
pub const COMPACT_BETA: &str = "compact-2026-01-12";

/// Base delay after a failed checkpoint attempt.
pub const BACKOFF_BASE: Duration = Duration::from_secs(30);

/// Ceiling for the failure backoff.
pub const BACKOFF_CAP: Duration = Duration::from_secs(600);

/// Why a checkpoint attempt produced no summary.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The conversation is below the upstream minimum for compaction; no
    /// call was made.
    #[error("conversation too small to checkpoint ({tokens} < {minimum} tokens)")]
    TooSmall { tokens: u64, minimum: u64 },

    #[error("checkpoint network failure: {0}")]
    Network(String),

    #[error("checkpoint rejected by upstream: status {status}")]
    Upstream { status: u16, body: String },

    /// The attempt was cancelled or superseded; the result is discarded.
    #[error("checkpoint cancelled")]
    Cancelled,
}

/// Everything a checkpoint call needs, snapshotted while the conversation
/// lock was held. The executor itself never touches shared state.
#[derive(Clone, Debug)]
pub struct CheckpointContext {
    pub model: String,
    pub system: Option<Value>,
    pub tools: Option<Value>,
    /// Messages up to (exclusive) the checkpoint anchor.
    pub messages: Vec<Value>,
    /// Auth headers captured from the client, lowercase names.
    pub auth_headers: Vec<(String, String)>,
    /// Query string of the original request, without the `?`.
    pub query_string: String,
    pub compact_trigger_tokens: u64,
}

/// Exponential backoff delay for the nth consecutive failure (1-based).
#[must_use]
pub fn backoff_delay(failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let exp = failures.saturating_sub(1).min(16);
    BACKOFF_BASE.saturating_mul(1 << exp).min(BACKOFF_CAP)
}

/// Run one checkpoint call, returning the summary text.
///
/// # Errors
/// [`CheckpointError::TooSmall`] without touching the network when the
/// snapshot is below `compact_trigger_tokens`; otherwise network and
/// upstream failures as their respective kinds.
pub async fn run_checkpoint(
    upstream: &dyn UpstreamClient,
    ctx: &CheckpointContext,
) -> Result<String, CheckpointError> {
    let estimated = TokenEstimator::estimate_messages(&ctx.messages);
    if estimated < ctx.compact_trigger_tokens {
        return Err(CheckpointError::TooSmall {
            tokens: estimated,
            minimum: ctx.compact_trigger_tokens,
        });
    }

    // Compaction blocks from earlier swaps are rejected by the API.
    let mut messages = ctx.messages.clone();
    strip_compaction_blocks(&mut messages);

    let mut body = json!({
        "model": ctx.model,
        "max_tokens": 4096,
        "messages": messages,
        "context_management": {
            "edits": [{
                "type": crate::rewrite::COMPACT_EDIT_TYPE,
                "trigger": {"type": "input_tokens", "value": ctx.compact_trigger_tokens},
                "pause_after_compaction": true,
            }],
        },
    });
    if let Some(system) = &ctx.system {
        body["system"] = system.clone();
    }
    if let Some(tools) = &ctx.tools {
        body["tools"] = tools.clone();
    }

    let headers = build_headers(&ctx.auth_headers);
    let path = if ctx.query_string.is_empty() {
        "/v1/messages".to_string()
    } else {
        format!("/v1/messages?{}", ctx.query_string)
    };

    tracing::info!(
        model = %ctx.model,
        message_count = ctx.messages.len(),
        "checkpoint started"
    );

    let request = UpstreamRequest::post(path, Bytes::from(body.to_string()))
        .with_headers(headers)
        .with_timeout(CHECKPOINT_TIMEOUT);
    let response = upstream
        .send(request)
        .await
        .map_err(|err| CheckpointError::Network(err.to_string()))?;

    if response.status != 200 {
        let status = response.status;
        let body = response
            .collect_body()
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).chars().take(500).collect())
            .unwrap_or_default();
        tracing::error!(status, %body, "checkpoint api error");
        return Err(CheckpointError::Upstream { status, body });
    }

    let bytes = response
        .collect_body()
        .await
        .map_err(|err| CheckpointError::Network(err.to_string()))?;
    let parsed: Value = serde_json::from_slice(&bytes)
        .map_err(|err| CheckpointError::Network(format!("unparseable response: {err}")))?;

    let content = parsed
        .get("content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|block| block.get("type").and_then(Value::as_str) == Some("compaction"))
        .and_then(|block| block.get("content").and_then(Value::as_str));

    match content {
        Some(summary) => {
            tracing::info!(
                compaction_length = summary.len(),
                stop_reason = parsed.get("stop_reason").and_then(serde_json::Value::as_str),
                "checkpoint completed"
            );
            Ok(summary.to_string())
        }
        None => Err(CheckpointError::Upstream {
            status: 200,
            body: "response contained no compaction block".to_string(),
        }),
    }
}

fn build_headers(auth_headers: &[(String, String)]) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> =
        vec![("content-type".to_string(), "application/json".to_string())];
    headers.extend(auth_headers.iter().cloned());

    // Merge the compact beta into any existing anthropic-beta header.
    match headers.iter().position(|(name, _)| name == "anthropic-beta") {
        Some(index) => {
            if !headers[index].1.contains(COMPACT_BETA) {
                let merged = format!("{},{COMPACT_BETA}", headers[index].1);
                headers[index].1 = merged;
            }
        }
        None => headers.push(("anthropic-beta".to_string(), COMPACT_BETA.to_string())),
    }

    if !headers.iter().any(|(name, _)| name == "anthropic-version") {
        headers.push(("anthropic-version".to_string(), "2023-06-01".to_string()));
    }
    headers
}

/// Find a clean boundary for the checkpoint anchor: the index (exclusive) of
/// the last message safe to summarize. A clean boundary has no `tool_use`
/// without its matching `tool_result`; when unresolved tool calls exist, the
/// anchor lands before the earliest one.
#[must_use]
pub fn find_checkpoint_anchor(messages: &[Value]) -> usize {
    let mut tool_use_positions: Vec<(String, usize)> = Vec::new();
    let mut tool_result_ids: Vec<String> = Vec::new();

    for (index, message) in messages.iter().enumerate() {
        let Some(blocks) = message.get("content").and_then(Value::as_array) else {
            continue;
        };
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("tool_use") => {
                    if let Some(id) = block.get("id").and_then(Value::as_str) {
                        tool_use_positions.push((id.to_string(), index));
                    }
                }
                Some("tool_result") => {
                    if let Some(id) = block.get("tool_use_id").and_then(Value::as_str) {
                        tool_result_ids.push(id.to_string());
                    }
                }
                _ => {}
            }
        }
    }

    let earliest_unresolved = tool_use_positions
        .iter()
        .filter(|(id, _)| !tool_result_ids.iter().any(|resolved| resolved == id))
        .map(|(_, index)| *index)
        .min();

    earliest_unresolved.unwrap_or(messages.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_anchor_full_list_when_resolved() {
        let messages = vec![
            json!({"role": "user", "content": "q"}),
            json!({"role": "assistant", "content": [
                {"type": "tool_use", "id": "t1", "name": "read", "input": {}},
            ]}),
            json!({"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": "ok"},
            ]}),
            json!({"role": "assistant", "content": "done"}),
        ];
        assert_eq!(find_checkpoint_anchor(&messages), 4);
    }

    #[test]
    fn test_anchor_before_unresolved_tool_use() {
        let messages = vec![
            json!({"role": "user", "content": "q"}),
            json!({"role": "assistant", "content": "working"}),
            json!({"role": "assistant", "content": [
                {"type": "tool_use", "id": "t9", "name": "bash", "input": {}},
            ]}),
        ];
        assert_eq!(find_checkpoint_anchor(&messages), 2);
    }

    #[test]
    fn test_anchor_empty_list() {
        assert_eq!(find_checkpoint_anchor(&[]), 0);
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        assert_eq!(backoff_delay(0), Duration::ZERO);
        assert_eq!(backoff_delay(1), Duration::from_secs(30));
        assert_eq!(backoff_delay(2), Duration::from_secs(60));
        assert_eq!(backoff_delay(3), Duration::from_secs(120));
        assert_eq!(backoff_delay(6), Duration::from_secs(600));
        assert_eq!(backoff_delay(30), Duration::from_secs(600));
    }

    #[test]
    fn test_build_headers_merges_beta() {
        let headers = build_headers(&[
            ("x-api-key".to_string(), "sk-test".to_string()),
            ("anthropic-beta".to_string(), "other-beta".to_string()),
        ]);
        let beta = headers
            .iter()
            .find(|(name, _)| name == "anthropic-beta")
            .map(|(_, value)| value.as_str())
            .unwrap();
        assert_eq!(beta, format!("other-beta,{COMPACT_BETA}"));
        assert!(headers.iter().any(|(name, _)| name == "anthropic-version"));
    }

    #[test]
    fn test_build_headers_adds_beta_and_version() {
        let headers = build_headers(&[("authorization".to_string(), "Bearer tok".to_string())]);
        assert!(headers
            .iter()
            .any(|(name, value)| name == "anthropic-beta" && value == COMPACT_BETA));
    }

    struct PanicUpstream;

    #[async_trait::async_trait]
    impl UpstreamClient for PanicUpstream {
        async fn send(
            &self,
            _request: UpstreamRequest,
        ) -> Result<crate::upstream::UpstreamResponse, crate::upstream::UpstreamError> {
            panic!("upstream must not be called for too-small conversations");
        }
    }

    #[tokio::test]
    async fn test_too_small_short_circuits() {
        let ctx = CheckpointContext {
            model: "tiny".to_string(),
            system: None,
            tools: None,
            messages: vec![json!({"role": "user", "content": "hi"})],
            auth_headers: Vec::new(),
            query_string: String::new(),
            compact_trigger_tokens: 50_000,
        };
        let result = run_checkpoint(&PanicUpstream, &ctx).await;
        assert!(matches!(result, Err(CheckpointError::TooSmall { .. })));
    }
}
