//! SSE line protocol: incremental parsing, serialization, and the
//! stream observer that extracts token usage from a forwarded response.

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

/// A single Server-Sent Event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: String,
    pub retry: Option<u64>,
}

impl SseEvent {
    /// Event with a JSON payload, the only kind the proxy synthesizes.
    #[must_use]
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data: data.to_string(),
            id: String::new(),
            retry: None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.event.is_empty() && self.data.is_empty()
    }

    /// Serialize back to SSE wire format, blank-line terminated.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut out = String::new();
        if !self.event.is_empty() {
            out.push_str("event: ");
            out.push_str(&self.event);
            out.push('\n');
        }
        if !self.data.is_empty() {
            for line in self.data.split('\n') {
                out.push_str("data: ");
                out.push_str(line);
                out.push('\n');
            }
        }
        if !self.id.is_empty() {
            out.push_str("id: ");
            out.push_str(&self.id);
            out.push('\n');
        }
        if let Some(retry) = self.retry {
            out.push_str(&format!("retry: {retry}\n"));
        }
        out.push('\n');
        Bytes::from(out)
    }
}

/// Incremental SSE parser that turns byte chunks into complete events.
///
/// Chunks may split lines and events arbitrarily; state carries over between
/// [`SseParser::feed`] calls.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    current: SseEvent,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of text, returning any events completed by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches('\n').trim_end_matches('\r');

            if line.is_empty() {
                // Blank line dispatches the accumulated event.
                if !self.current.is_empty() {
                    events.push(std::mem::take(&mut self.current));
                } else {
                    self.current = SseEvent::default();
                }
                continue;
            }

            if line.starts_with(':') {
                continue; // comment
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            match field {
                "event" => self.current.event = value.to_string(),
                "data" => {
                    if self.current.data.is_empty() {
                        self.current.data = value.to_string();
                    } else {
                        self.current.data.push('\n');
                        self.current.data.push_str(value);
                    }
                }
                "id" => self.current.id = value.to_string(),
                "retry" => {
                    if let Ok(retry) = value.parse() {
                        self.current.retry = Some(retry);
                    }
                }
                _ => {}
            }
        }

        events
    }
}

/// Token usage reported by the upstream API.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct UsageTotals {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl UsageTotals {
    /// The full input-side total: fresh plus cache-created plus cache-read.
    #[must_use]
    pub const fn effective_input(&self) -> u64 {
        self.input_tokens + self.cache_creation_input_tokens + self.cache_read_input_tokens
    }

    /// Fold a later usage object (e.g. from `message_delta`) into this one.
    /// Zero fields in `update` leave the existing values in place.
    pub fn merge(&mut self, update: Self) {
        if update.input_tokens > 0 {
            self.input_tokens = update.input_tokens;
        }
        if update.cache_creation_input_tokens > 0 {
            self.cache_creation_input_tokens = update.cache_creation_input_tokens;
        }
        if update.cache_read_input_tokens > 0 {
            self.cache_read_input_tokens = update.cache_read_input_tokens;
        }
        if update.output_tokens > 0 {
            self.output_tokens = update.output_tokens;
        }
    }
}

/// Observes a forwarded SSE response without altering it.
///
/// Tracks the usage block (seeded by `message_start`, updated by
/// `message_delta`), the stop reason, and whether the upstream response
/// contained a compaction block, meaning the real API compacted first and
/// local state must reset.
#[derive(Debug, Default)]
pub struct StreamObserver {
    usage: Option<UsageTotals>,
    stop_reason: Option<String>,
    has_compaction: bool,
}

impl StreamObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect one event; the event itself is forwarded unchanged.
    pub fn observe(&mut self, event: &SseEvent) {
        if event.data.is_empty() {
            return;
        }
        let Ok(data) = serde_json::from_str::<Value>(&event.data) else {
            return;
        };

        match data.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(usage) = data.pointer("/message/usage") {
                    if let Ok(parsed) = serde_json::from_value::<UsageTotals>(usage.clone()) {
                        self.usage = Some(parsed);
                    }
                }
            }
            Some("content_block_start") => {
                if data.pointer("/content_block/type").and_then(Value::as_str)
                    == Some("compaction")
                {
                    self.has_compaction = true;
                }
            }
            Some("content_block_delta") => {
                if data.pointer("/delta/type").and_then(Value::as_str) == Some("compaction_delta") {
                    self.has_compaction = true;
                }
            }
            Some("message_delta") => {
                if let Some(reason) = data.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    self.stop_reason = Some(reason.to_string());
                }
                if let Some(usage) = data.get("usage") {
                    if let Ok(parsed) = serde_json::from_value::<UsageTotals>(usage.clone()) {
                        let mut merged = self.usage.unwrap_or_default();
                        merged.merge(parsed);
                        self.usage = Some(merged);
                    }
                }
            }
            _ => {}
        }
    }

    #[must_use]
    pub const fn usage(&self) -> Option<UsageTotals> {
        self.usage
    }

    #[must_use]
    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    #[must_use]
    pub const fn has_compaction(&self) -> bool {
        self.has_compaction
    }
}
