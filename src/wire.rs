//! Wire types for the intercepted Messages API.
//!
//! Three concerns live here:
//! - [`MessagesRequest`]: a tolerant view of an inbound completion request
//!   that preserves unknown fields,
//! - synthetic compaction responses in both JSON and SSE form,
//! - the SSE line protocol parser and the observer that harvests usage
//!   totals from a forwarded stream.

mod request;
mod response;
mod sse;

pub use request::{message_role, message_text, MessagesRequest};
pub use response::{compaction_message_json, compaction_sse_events, new_message_id};
pub use sse::{SseEvent, SseParser, StreamObserver, UsageTotals};
