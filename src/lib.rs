//! compaction-proxy - a localhost interception proxy that pre-computes
//! conversation compaction for coding-assistant clients.
//!
//! The proxy sits between a client and the Anthropic Messages API. As a
//! conversation grows it tracks token utilization per conversation; at a
//! threshold it checkpoints the conversation in the background (a one-shot
//! summarization call), and when the client later sends its own compaction
//! request the pre-computed summary is returned instantly instead of
//! blocking on the real API. With no checkpoint ready, everything forwards
//! unchanged.
//!
//! Per conversation the buffer cycles through
//! `IDLE → CHECKPOINT_PENDING → CHECKPOINTING → WAL_ACTIVE → SWAP_READY →
//! SWAP_EXECUTING → IDLE`; messages observed after the checkpoint anchor
//! form a write-ahead log that is stitched into the substitute response.

#![forbid(unsafe_code)]

pub mod config;
pub mod dashboard;
pub mod db;
pub mod detector;
pub mod engine;
pub mod identity;
pub mod proxy;
pub mod rewrite;
pub mod server;
pub mod sizer;
pub mod store;
pub mod upstream;
pub mod wire;

pub use config::Config;
pub use engine::phase::Phase;
pub use engine::BufferEngine;
pub use server::{router, AppState, SharedState};
pub use store::{Conversation, ConversationStore};
pub use upstream::{UpstreamClient, UpstreamRequest, UpstreamResponse};
