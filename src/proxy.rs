//! The `/v1/messages` interception handler and the passthrough forwarders.
//!
//! For each inbound completion request: tolerant parse, fingerprint, state
//! sync under the conversation mutex, classification, then either a
//! synthetic swap response or a forward to upstream. Forwarded streaming
//! responses are piped to the client verbatim while an observer extracts
//! the authoritative token usage from the SSE events.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

use crate::detector::{classify, has_compaction_block, is_suggestion_request, RequestClass};
use crate::engine::swap::SyntheticResponse;
use crate::identity::compute_fingerprint;
use crate::rewrite::{strip_compact_edit, strip_compaction_blocks};
use crate::server::SharedState;
use crate::sizer::TokenEstimator;
use crate::store::Conversation;
use crate::upstream::{UpstreamRequest, UpstreamResponse, FORWARD_TIMEOUT};
use crate::wire::{MessagesRequest, SseParser, StreamObserver};

/// Upper bound on inbound body size.
const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

/// Response header carrying the conversation's buffer phase.
const PHASE_HEADER: &str = "x-compaction-phase";
/// Response header carrying the short conversation id.
const CONV_ID_HEADER: &str = "x-compaction-conv-id";

/// Headers forwarded from client to upstream. Whitelisting avoids leaking
/// hop-by-hop or proxy-internal headers.
const FORWARD_HEADERS: &[&str] = &[
    "x-api-key",
    "authorization",
    "content-type",
    "anthropic-version",
    "anthropic-beta",
    "anthropic-dangerous-direct-browser-access",
    "accept",
    "accept-encoding",
];

/// Headers captured for reuse on checkpoint calls.
const AUTH_HEADERS: &[&str] = &[
    "x-api-key",
    "authorization",
    "anthropic-version",
    "anthropic-beta",
];

/// `POST /v1/messages`
pub async fn handle_messages(State(state): State<SharedState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => return invalid_request(&err.to_string()),
    };
    let parsed: MessagesRequest = match serde_json::from_slice(&body_bytes) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::error!(error = %err, "request parse error");
            return invalid_request(&err.to_string());
        }
    };

    let stream = parsed.is_stream();
    let query = parts.uri.query().unwrap_or_default().to_string();
    let fingerprint = compute_fingerprint(&parsed);
    let context_window = state.config.context_window_for(&parsed.model);
    let (conversation, _created) = state
        .store
        .get_or_create(&fingerprint, &parsed.model, context_window)
        .await;

    tracing::info!(
        conv_id = %conversation.conv_id,
        model = %parsed.model,
        stream,
        message_count = parsed.messages.len(),
        "request received"
    );

    // Suggestion-mode requests are ephemeral and must not touch state.
    if is_suggestion_request(&parsed) {
        tracing::debug!(conv_id = %conversation.conv_id, "suggestion request passthrough");
        return forward(&state, &conversation, parsed, body_bytes, &query, &parts.headers, stream, false)
            .await;
    }

    // The client already holds a compaction: local buffers are stale.
    if has_compaction_block(&parsed.messages) {
        tracing::info!(conv_id = %conversation.conv_id, "incoming compaction detected");
        state
            .engine
            .reset_conversation(&conversation, "incoming_compaction")
            .await;
    }

    {
        let mut conv_state = conversation.lock().await;
        conv_state.messages = parsed.messages.clone();
        conv_state.auth_headers = capture_auth_headers(&parts.headers);
        conv_state.query_string = query.clone();
        conv_state.system = parsed.system.clone();
        conv_state.tools = parsed.tools.clone();
        if !conv_state.tokens_authoritative {
            // Seed with an estimate until upstream reports real usage.
            conv_state.total_input_tokens = TokenEstimator::estimate_messages(&conv_state.messages);
        }
        conv_state.touch();
    }

    if state.config.passthrough {
        return forward(&state, &conversation, parsed, body_bytes, &query, &parts.headers, stream, true)
            .await;
    }

    if classify(&parsed) == RequestClass::Compact {
        if let Some(synthetic) = state.engine.handle_compact(&conversation, stream).await {
            return synthetic_response(&conversation, &synthetic).await;
        }
        // No checkpoint available: the native compact goes upstream.
        tracing::info!(conv_id = %conversation.conv_id, "client compact forwarded natively");
    }

    forward(&state, &conversation, parsed, body_bytes, &query, &parts.headers, stream, true).await
}

/// Forward a completion request upstream and relay the response.
///
/// `observe` controls whether the response updates conversation state and
/// re-evaluates the engine; suggestion-mode requests forward blind.
#[allow(clippy::too_many_arguments)]
async fn forward(
    state: &SharedState,
    conversation: &Arc<Conversation>,
    mut parsed: MessagesRequest,
    original_bytes: Bytes,
    query: &str,
    client_headers: &HeaderMap,
    stream: bool,
    observe: bool,
) -> Response {
    // Suppress native compaction and convert stale compaction blocks. When
    // nothing changed, the original bytes go out untouched.
    let mut modified = strip_compact_edit(&mut parsed);
    modified |= strip_compaction_blocks(&mut parsed.messages);
    let body_bytes = if modified {
        match serde_json::to_vec(&parsed) {
            Ok(bytes) => Bytes::from(bytes),
            Err(_) => original_bytes,
        }
    } else {
        original_bytes
    };

    let headers = forward_headers(client_headers, body_bytes.len());
    let path = if query.is_empty() {
        "/v1/messages".to_string()
    } else {
        format!("/v1/messages?{query}")
    };

    tracing::debug!(conv_id = %conversation.conv_id, path = %path, "request forwarded");

    let upstream_request = UpstreamRequest::post(path, body_bytes)
        .with_headers(headers)
        .with_timeout(FORWARD_TIMEOUT);
    let response = match state.upstream.send(upstream_request).await {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(conv_id = %conversation.conv_id, error = %err, "upstream connection error");
            state
                .engine
                .publish_api_error(&conversation.conv_id, 502, &err.to_string());
            return proxy_error(&format!("Upstream connection failed: {err}"));
        }
    };

    if response.status >= 400 {
        return relay_upstream_error(state, conversation, response).await;
    }

    let is_event_stream = response
        .header("content-type")
        .is_some_and(|value| value.contains("text/event-stream"));

    if stream && is_event_stream {
        forward_streaming(state, conversation, response, observe).await
    } else {
        forward_buffered(state, conversation, response, observe).await
    }
}

/// Relay an upstream HTTP error verbatim and tell the dashboard.
async fn relay_upstream_error(
    state: &SharedState,
    conversation: &Arc<Conversation>,
    response: UpstreamResponse,
) -> Response {
    let status = response.status;
    let content_type = response
        .header("content-type")
        .unwrap_or("application/json")
        .to_string();
    let body = response.collect_body().await.unwrap_or_default();
    let preview: String = String::from_utf8_lossy(&body).chars().take(500).collect();
    tracing::error!(conv_id = %conversation.conv_id, status, body = %preview, "upstream error");
    state
        .engine
        .publish_api_error(&conversation.conv_id, status, &preview);

    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY))
        .header("content-type", content_type)
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// Pipe an upstream SSE response through to the client while observing
/// usage and compaction markers; state updates happen after the stream
/// completes, never while the response is in flight.
async fn forward_streaming(
    state: &SharedState,
    conversation: &Arc<Conversation>,
    response: UpstreamResponse,
    observe: bool,
) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(32);
    let engine = Arc::clone(&state.engine);
    let conversation_task = Arc::clone(conversation);
    let mut upstream_body = response.body;

    tokio::spawn(async move {
        let mut parser = SseParser::new();
        let mut observer = StreamObserver::new();
        let mut clean = true;

        while let Some(chunk) = upstream_body.next().await {
            match chunk {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    let mut client_gone = false;
                    for event in parser.feed(&text) {
                        observer.observe(&event);
                        if tx.send(Ok(event.to_bytes())).await.is_err() {
                            client_gone = true;
                            break;
                        }
                    }
                    if client_gone {
                        clean = false;
                        break;
                    }
                }
                Err(err) => {
                    tracing::error!(
                        conv_id = %conversation_task.conv_id,
                        error = %err,
                        "upstream stream interrupted"
                    );
                    let _ = tx.send(Err(std::io::Error::other(err.to_string()))).await;
                    clean = false;
                    break;
                }
            }
        }
        drop(tx);

        tracing::debug!(
            conv_id = %conversation_task.conv_id,
            stop_reason = observer.stop_reason(),
            has_compaction = observer.has_compaction(),
            "stream complete"
        );

        if observe && clean {
            engine
                .observe_response(&conversation_task, observer.usage(), observer.has_compaction())
                .await;
        }
    });

    let (phase, conv_id) = phase_headers(conversation).await;
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header(PHASE_HEADER, phase)
        .header(CONV_ID_HEADER, conv_id)
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Forward a non-streaming response, updating token accounting from the
/// body's usage block.
async fn forward_buffered(
    state: &SharedState,
    conversation: &Arc<Conversation>,
    response: UpstreamResponse,
    observe: bool,
) -> Response {
    let status = response.status;
    let content_type = response
        .header("content-type")
        .unwrap_or("application/json")
        .to_string();
    let body = match response.collect_body().await {
        Ok(body) => body,
        Err(err) => {
            tracing::error!(conv_id = %conversation.conv_id, error = %err, "upstream body read failed");
            state
                .engine
                .publish_api_error(&conversation.conv_id, 502, &err.to_string());
            return proxy_error(&format!("Upstream connection failed: {err}"));
        }
    };

    if observe {
        let parsed: Option<serde_json::Value> = serde_json::from_slice(&body).ok();
        let usage = parsed
            .as_ref()
            .and_then(|value| value.get("usage"))
            .and_then(|usage| serde_json::from_value(usage.clone()).ok());
        let upstream_compacted = parsed
            .as_ref()
            .and_then(|value| value.get("content"))
            .and_then(serde_json::Value::as_array)
            .is_some_and(|blocks| {
                blocks.iter().any(|block| {
                    block.get("type").and_then(serde_json::Value::as_str) == Some("compaction")
                })
            });
        state
            .engine
            .observe_response(conversation, usage, upstream_compacted)
            .await;
    }

    let (phase, conv_id) = phase_headers(conversation).await;
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
        .header("content-type", content_type)
        .header(PHASE_HEADER, phase)
        .header(CONV_ID_HEADER, conv_id)
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Send a pre-built swap response.
async fn synthetic_response(
    conversation: &Arc<Conversation>,
    synthetic: &SyntheticResponse,
) -> Response {
    let body = synthetic.to_bytes();
    tracing::info!(
        conv_id = %conversation.conv_id,
        bytes = body.len(),
        "synthetic response sent"
    );
    let (phase, conv_id) = phase_headers(conversation).await;
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", synthetic.content_type())
        .header(PHASE_HEADER, phase)
        .header(CONV_ID_HEADER, conv_id)
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Catch-all passthrough for other API paths (token counting, OAuth,
/// settings). Byte-faithful: the upstream body goes back unmodified, minus
/// hop-by-hop headers.
pub async fn handle_passthrough(State(state): State<SharedState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => return invalid_request(&err.to_string()),
    };
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string());

    let upstream_request = UpstreamRequest {
        method: parts.method.as_str().to_string(),
        path_and_query: path_and_query.clone(),
        headers: forward_headers(&parts.headers, body_bytes.len()),
        body: body_bytes,
        timeout: std::time::Duration::from_secs(120),
    };

    match state.upstream.send(upstream_request).await {
        Ok(response) => {
            let status = response.status;
            let headers: Vec<(String, String)> = response
                .headers
                .iter()
                .filter(|(name, _)| {
                    !matches!(
                        name.as_str(),
                        "transfer-encoding" | "connection" | "keep-alive" | "content-length"
                    )
                })
                .cloned()
                .collect();
            let body = response.collect_body().await.unwrap_or_default();

            let mut builder =
                Response::builder().status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK));
            for (name, value) in headers {
                builder = builder.header(name, value);
            }
            builder
                .body(Body::from(body))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
        }
        Err(err) => {
            tracing::error!(path = %path_and_query, error = %err, "passthrough error");
            proxy_error(&err.to_string())
        }
    }
}

async fn phase_headers(conversation: &Arc<Conversation>) -> (String, String) {
    let state = conversation.lock().await;
    (
        state.phase.as_str().to_string(),
        conversation.conv_id.clone(),
    )
}

fn capture_auth_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_lowercase();
            if AUTH_HEADERS.contains(&name.as_str()) {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name, value.to_string()))
            } else {
                None
            }
        })
        .collect()
}

fn forward_headers(headers: &HeaderMap, body_len: usize) -> Vec<(String, String)> {
    let mut forwarded: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_lowercase();
            if FORWARD_HEADERS.contains(&name.as_str()) {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name, value.to_string()))
            } else {
                None
            }
        })
        .collect();
    forwarded.push(("content-length".to_string(), body_len.to_string()));
    forwarded
}

fn invalid_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        axum::Json(json!({"error": {"type": "invalid_request", "message": message}})),
    )
        .into_response()
}

fn proxy_error(message: &str) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        axum::Json(json!({"error": {"type": "proxy_error", "message": message}})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_headers_whitelists() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "sk-test".parse().unwrap());
        headers.insert("cookie", "secret".parse().unwrap());
        headers.insert("host", "localhost".parse().unwrap());
        headers.insert("anthropic-version", "2023-06-01".parse().unwrap());

        let forwarded = forward_headers(&headers, 42);
        assert!(forwarded.iter().any(|(name, _)| name == "x-api-key"));
        assert!(forwarded.iter().any(|(name, _)| name == "anthropic-version"));
        assert!(forwarded
            .iter()
            .any(|(name, value)| name == "content-length" && value == "42"));
        assert!(!forwarded.iter().any(|(name, _)| name == "cookie"));
        assert!(!forwarded.iter().any(|(name, _)| name == "host"));
    }

    #[test]
    fn test_capture_auth_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer tok".parse().unwrap());
        headers.insert("accept", "application/json".parse().unwrap());

        let captured = capture_auth_headers(&headers);
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].0, "authorization");
    }
}
