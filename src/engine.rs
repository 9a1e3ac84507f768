//! The per-conversation double-buffer engine.
//!
//! Orchestrates the phase machine: decides when a background checkpoint
//! starts, commits or discards completed checkpoints, executes swaps, and
//! answers the client-compact decision (replay, early swap, await, or
//! forward). All observable mutation happens under the conversation mutex;
//! the mutex is never held across an upstream call.

pub mod checkpoint;
pub mod phase;
pub mod swap;

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::time::Instant;

use crate::config::Config;
use crate::dashboard::Publisher;
use crate::db::DbHandle;
use crate::store::{CheckpointHandle, Conversation, ConversationState, ConversationStore};
use crate::upstream::UpstreamClient;
use crate::wire::UsageTotals;

use checkpoint::{backoff_delay, find_checkpoint_anchor, run_checkpoint, CheckpointContext, CheckpointError};
use phase::Phase;
use swap::{build_swap_response, SyntheticResponse};

/// Engine shared by the request handlers and background tasks.
pub struct BufferEngine {
    config: Arc<Config>,
    store: Arc<ConversationStore>,
    upstream: Arc<dyn UpstreamClient>,
    publisher: Publisher,
    db: Option<DbHandle>,
}

enum Evaluation {
    Done,
    /// Utilization jumped past both thresholds in one request: run the
    /// checkpoint inline, without a background task.
    RunBlocking { ctx: CheckpointContext, epoch: u64 },
}

impl BufferEngine {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        store: Arc<ConversationStore>,
        upstream: Arc<dyn UpstreamClient>,
        publisher: Publisher,
        db: Option<DbHandle>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            upstream,
            publisher,
            db,
        })
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Record the outcome of a forwarded response and re-evaluate the
    /// thresholds for this conversation.
    pub async fn observe_response(
        self: &Arc<Self>,
        conversation: &Arc<Conversation>,
        usage: Option<UsageTotals>,
        upstream_compacted: bool,
    ) {
        if let Some(usage) = usage {
            let mut state = conversation.lock().await;
            state.total_input_tokens = usage.effective_input();
            state.tokens_authoritative = true;
            tracing::info!(
                conv_id = %conversation.conv_id,
                total = state.total_input_tokens,
                utilization = %format!("{:.1}%", conversation.utilization(&state) * 100.0),
                phase = %state.phase,
                "tokens updated"
            );
            self.notify_locked(conversation, &state);
        }

        if upstream_compacted {
            // The real API compacted first; local buffers are stale.
            self.reset_conversation(conversation, "upstream_compaction")
                .await;
        } else {
            self.evaluate(conversation).await;
        }
    }

    /// Check thresholds and drive transitions. May spawn a background
    /// checkpoint or, when both thresholds were jumped at once, run one
    /// inline.
    pub async fn evaluate(self: &Arc<Self>, conversation: &Arc<Conversation>) {
        if self.config.passthrough {
            return;
        }

        let evaluation = {
            let mut state = conversation.lock().await;
            let util = conversation.utilization(&state);
            match state.phase {
                Phase::Idle if util >= self.config.checkpoint_threshold => {
                    if let Some(until) = state.backoff_until {
                        if Instant::now() < until {
                            tracing::debug!(
                                conv_id = %conversation.conv_id,
                                failures = state.checkpoint_failures,
                                "checkpoint gated by backoff"
                            );
                            return;
                        }
                    }
                    if util >= self.config.swap_threshold {
                        match self.prepare_blocking_checkpoint(conversation, &mut state, util) {
                            Some(evaluation) => evaluation,
                            None => return,
                        }
                    } else {
                        if conversation
                            .set_phase(
                                &mut state,
                                Phase::CheckpointPending,
                                &format!("utilization={:.1}%", util * 100.0),
                            )
                            .is_err()
                        {
                            return;
                        }
                        self.notify_locked(conversation, &state);
                        self.spawn_checkpoint(conversation, &mut state);
                        Evaluation::Done
                    }
                }
                Phase::WalActive if util >= self.config.swap_threshold => {
                    let _ = conversation.set_phase(
                        &mut state,
                        Phase::SwapReady,
                        &format!("utilization={:.1}%", util * 100.0),
                    );
                    self.notify_locked(conversation, &state);
                    Evaluation::Done
                }
                _ => Evaluation::Done,
            }
        };

        if let Evaluation::RunBlocking { ctx, epoch } = evaluation {
            self.run_blocking_checkpoint(conversation, ctx, epoch).await;
        }
    }

    /// Decide what a client compaction request gets: a synthetic swap
    /// response, or `None` to forward the request natively.
    ///
    /// Cases: SWAP_READY replays the cached compaction; WAL_ACTIVE promotes
    /// early; CHECKPOINTING waits for the in-flight checkpoint; anything
    /// else forwards.
    pub async fn handle_compact(
        self: &Arc<Self>,
        conversation: &Arc<Conversation>,
        stream: bool,
    ) -> Option<SyntheticResponse> {
        loop {
            let mut state = conversation.lock().await;
            match state.phase {
                Phase::SwapReady => {
                    return self.execute_swap_locked(conversation, &mut state, stream);
                }
                Phase::WalActive if state.checkpoint_content.is_some() => {
                    let _ = conversation.set_phase(
                        &mut state,
                        Phase::SwapReady,
                        "client_compact_early_swap",
                    );
                    self.notify_locked(conversation, &state);
                    return self.execute_swap_locked(conversation, &mut state, stream);
                }
                Phase::Checkpointing => {
                    tracing::info!(
                        conv_id = %conversation.conv_id,
                        "client compact awaiting in-flight checkpoint"
                    );
                    let mut watch = conversation.phase_watch();
                    drop(state);
                    if watch
                        .wait_for(|phase| *phase != Phase::Checkpointing)
                        .await
                        .is_err()
                    {
                        return None;
                    }
                    // Re-examine under the lock; the checkpoint may have
                    // failed, in which case the compact forwards natively.
                }
                _ => return None,
            }
        }
    }

    /// Execute the swap: synthesize the compaction response and reset the
    /// buffer for the next cycle.
    fn execute_swap_locked(
        &self,
        conversation: &Arc<Conversation>,
        state: &mut ConversationState,
        stream: bool,
    ) -> Option<SyntheticResponse> {
        conversation
            .set_phase(state, Phase::SwapExecuting, "swap_triggered")
            .ok()?;
        self.notify_locked(conversation, state);

        let wal_messages: Vec<serde_json::Value> = state
            .wal_start_index
            .map(|index| state.messages[index.min(state.messages.len())..].to_vec())
            .unwrap_or_default();
        let response = build_swap_response(
            state.checkpoint_content.as_deref().unwrap_or(""),
            &conversation.model,
            stream,
            &wal_messages,
        );

        tracing::info!(
            conv_id = %conversation.conv_id,
            wal_length = wal_messages.len(),
            stream,
            "swap executed"
        );

        state.last_swap = Some(crate::store::SwapSnapshot {
            messages: state.messages.iter().map(crate::store::message_view).collect(),
            wal_start_index: state.wal_start_index,
        });
        self.log_event(conversation, "swap_executed");

        let _ = conversation.set_phase(state, Phase::Idle, "swap_complete");
        if let Some(content) = state.checkpoint_content.take() {
            state.last_checkpoint_content = Some(content);
        }
        state.wal_start_index = None;
        state.wal_candidate_index = None;
        state.total_input_tokens = 0; // refreshed by the next response
        state.tokens_authoritative = false;
        self.notify_locked(conversation, state);

        Some(response)
    }

    /// Reset one conversation to IDLE, cancelling any in-flight checkpoint.
    /// Idempotent.
    pub async fn reset_conversation(&self, conversation: &Arc<Conversation>, reason: &str) {
        let mut state = conversation.lock().await;
        state.abort_in_flight();

        if state.phase != Phase::Idle {
            let _ = conversation.set_phase(
                &mut state,
                Phase::Idle,
                &format!("reset:{reason}"),
            );
        }

        state.messages.clear();
        state.checkpoint_content = None;
        state.wal_start_index = None;
        state.wal_candidate_index = None;
        state.total_input_tokens = 0;
        state.tokens_authoritative = false;
        state.checkpoint_failures = 0;
        state.backoff_until = None;
        self.log_event(conversation, "reset");
        self.notify_locked(conversation, &state);
    }

    /// Reset conversations whose key or conv_id matches the prefix; returns
    /// how many were reset.
    pub async fn reset_matching(&self, prefix: &str, reason: &str) -> usize {
        let matches = self.store.find_matching(prefix);
        for conversation in &matches {
            self.reset_conversation(conversation, reason).await;
        }
        matches.len()
    }

    /// Reset every conversation; returns how many were reset.
    pub async fn reset_all(&self, reason: &str) -> usize {
        let all = self.store.all();
        for conversation in &all {
            self.reset_conversation(conversation, reason).await;
        }
        all.len()
    }

    /// Publish an upstream API error to dashboard subscribers.
    pub fn publish_api_error(&self, conv_id: &str, status: u16, body: &str) {
        self.publisher.api_error(conv_id, status, body);
    }

    /// Append an event row, best-effort.
    fn log_event(&self, conversation: &Arc<Conversation>, event_type: &'static str) {
        if let Some(db) = &self.db {
            let db = db.clone();
            let key = conversation.key.clone();
            tokio::spawn(async move {
                if let Err(err) = db
                    .call(move |db| db.log_event(event_type, Some(&key), None))
                    .await
                {
                    tracing::warn!(error = %err, "event log failed");
                }
            });
        }
    }

    /// Broadcast the current state and persist a snapshot, best-effort.
    fn notify_locked(&self, conversation: &Arc<Conversation>, state: &ConversationState) {
        let summary = conversation.summary_locked(state);
        self.publisher.state_update(&summary);

        if let Some(db) = &self.db {
            let db = db.clone();
            let detail = conversation.detail_locked(state);
            let key = conversation.key.clone();
            tokio::spawn(async move {
                let snapshot = serde_json::to_string(&detail).unwrap_or_default();
                let result = db
                    .call(move |db| {
                        db.upsert_conversation(
                            &key,
                            &detail.summary.model,
                            detail.summary.context_window,
                            detail.summary.phase.as_str(),
                            detail.summary.total_input_tokens,
                            &snapshot,
                        )
                    })
                    .await;
                if let Err(err) = result {
                    tracing::warn!(error = %err, "snapshot persistence failed");
                }
            });
        }
    }

    /// Launch the background checkpoint task. Caller holds the lock and has
    /// already moved the phase to CHECKPOINT_PENDING.
    fn spawn_checkpoint(self: &Arc<Self>, conversation: &Arc<Conversation>, state: &mut ConversationState) {
        let Some((ctx, anchor)) = self.checkpoint_context(conversation, state) else {
            let _ = conversation.set_phase(state, Phase::Idle, "checkpoint_not_startable");
            self.notify_locked(conversation, state);
            return;
        };

        state.wal_candidate_index = Some(anchor);
        if conversation
            .set_phase(state, Phase::Checkpointing, &format!("anchor_index={anchor}"))
            .is_err()
        {
            return;
        }

        state.checkpoint_epoch += 1;
        let epoch = state.checkpoint_epoch;
        state.checkpoint_started_at = Some(OffsetDateTime::now_utc());
        state.checkpoint_completed_at = None;

        let engine = Arc::clone(self);
        let conversation_task = Arc::clone(conversation);
        let upstream = Arc::clone(&self.upstream);
        let task = tokio::spawn(async move {
            let result = run_checkpoint(upstream.as_ref(), &ctx).await;
            engine
                .finalize_checkpoint(&conversation_task, epoch, result)
                .await;
        });
        state.in_flight = Some(CheckpointHandle::new(epoch, task));
        self.notify_locked(conversation, state);
    }

    /// Snapshot everything a checkpoint call needs. Returns `None` when the
    /// conversation has no usable context or no clean anchor.
    fn checkpoint_context(
        &self,
        conversation: &Arc<Conversation>,
        state: &ConversationState,
    ) -> Option<(CheckpointContext, usize)> {
        if state.auth_headers.is_empty() || state.messages.is_empty() {
            tracing::error!(conv_id = %conversation.conv_id, "checkpoint missing request context");
            return None;
        }
        let anchor = find_checkpoint_anchor(&state.messages);
        if anchor == 0 {
            tracing::warn!(conv_id = %conversation.conv_id, "no valid checkpoint anchor");
            return None;
        }
        let ctx = CheckpointContext {
            model: conversation.model.clone(),
            system: state.system.clone(),
            tools: state.tools.clone(),
            messages: state.messages[..anchor].to_vec(),
            auth_headers: state.auth_headers.clone(),
            query_string: state.query_string.clone(),
            compact_trigger_tokens: self.config.compact_trigger_tokens,
        };
        Some((ctx, anchor))
    }

    /// Set up the inline (blocking) checkpoint used when a request jumps
    /// past both thresholds at once. Runs under the lock; the actual call
    /// happens after the lock is released.
    fn prepare_blocking_checkpoint(
        &self,
        conversation: &Arc<Conversation>,
        state: &mut ConversationState,
        util: f64,
    ) -> Option<Evaluation> {
        tracing::warn!(
            conv_id = %conversation.conv_id,
            utilization = %format!("{:.1}%", util * 100.0),
            "emergency: both thresholds crossed in one request"
        );
        let (ctx, anchor) = self.checkpoint_context(conversation, state)?;

        state.wal_candidate_index = Some(anchor);
        conversation
            .set_phase(state, Phase::CheckpointPending, "emergency_blocking")
            .ok()?;
        state.checkpoint_epoch += 1;
        state.checkpoint_started_at = Some(OffsetDateTime::now_utc());
        state.checkpoint_completed_at = None;
        self.notify_locked(conversation, state);
        Some(Evaluation::RunBlocking {
            ctx,
            epoch: state.checkpoint_epoch,
        })
    }

    async fn run_blocking_checkpoint(
        self: &Arc<Self>,
        conversation: &Arc<Conversation>,
        ctx: CheckpointContext,
        epoch: u64,
    ) {
        let result = run_checkpoint(self.upstream.as_ref(), &ctx).await;

        let mut state = conversation.lock().await;
        if state.phase != Phase::CheckpointPending || state.checkpoint_epoch != epoch {
            tracing::debug!(conv_id = %conversation.conv_id, "blocking checkpoint result discarded");
            return;
        }
        state.checkpoint_completed_at = Some(OffsetDateTime::now_utc());

        match result {
            Ok(summary) => {
                state.checkpoint_content = Some(summary.clone());
                state.last_checkpoint_content = Some(summary);
                state.wal_start_index = state.wal_candidate_index;
                state.checkpoint_failures = 0;
                state.backoff_until = None;
                let _ = conversation.set_phase(
                    &mut state,
                    Phase::WalActive,
                    "blocking_checkpoint_complete",
                );
                let _ =
                    conversation.set_phase(&mut state, Phase::SwapReady, "emergency_swap_ready");
                self.notify_locked(conversation, &state);
            }
            Err(err) => {
                self.record_checkpoint_failure(conversation, &mut state, &err);
            }
        }
    }

    /// Commit or discard a completed background checkpoint. Runs in the
    /// spawned task; verifies the state is still CHECKPOINTING and the
    /// epoch still matches before mutating anything.
    async fn finalize_checkpoint(
        self: &Arc<Self>,
        conversation: &Arc<Conversation>,
        epoch: u64,
        result: Result<String, CheckpointError>,
    ) {
        let mut state = conversation.lock().await;
        if state.phase != Phase::Checkpointing || state.checkpoint_epoch != epoch {
            tracing::debug!(
                conv_id = %conversation.conv_id,
                phase = %state.phase,
                "checkpoint result discarded (cancelled or superseded)"
            );
            return;
        }
        state.in_flight = None;
        state.checkpoint_completed_at = Some(OffsetDateTime::now_utc());

        match result {
            Ok(summary) => {
                tracing::info!(
                    conv_id = %conversation.conv_id,
                    checkpoint_length = summary.len(),
                    anchor_index = ?state.wal_candidate_index,
                    "write-ahead log started"
                );
                state.checkpoint_content = Some(summary.clone());
                state.last_checkpoint_content = Some(summary);
                state.wal_start_index = state.wal_candidate_index;
                state.checkpoint_failures = 0;
                state.backoff_until = None;
                let _ =
                    conversation.set_phase(&mut state, Phase::WalActive, "checkpoint_complete");
                if conversation.utilization(&state) >= self.config.swap_threshold {
                    let _ = conversation.set_phase(
                        &mut state,
                        Phase::SwapReady,
                        "utilization_already_past_swap",
                    );
                }
                self.notify_locked(conversation, &state);
            }
            Err(err) => {
                self.record_checkpoint_failure(conversation, &mut state, &err);
            }
        }
    }

    fn record_checkpoint_failure(
        &self,
        conversation: &Arc<Conversation>,
        state: &mut ConversationState,
        err: &CheckpointError,
    ) {
        state.wal_candidate_index = None;
        match err {
            CheckpointError::Cancelled => {
                tracing::debug!(conv_id = %conversation.conv_id, "checkpoint cancelled");
            }
            CheckpointError::TooSmall { tokens, minimum } => {
                // Not a failure: the conversation is still growing toward
                // the trigger, so no backoff is armed.
                tracing::info!(
                    conv_id = %conversation.conv_id,
                    tokens = *tokens,
                    minimum = *minimum,
                    "conversation too small to checkpoint"
                );
            }
            CheckpointError::Network(_) | CheckpointError::Upstream { .. } => {
                tracing::error!(conv_id = %conversation.conv_id, error = %err, "checkpoint failed");
                state.checkpoint_failures += 1;
                state.backoff_until =
                    Some(Instant::now() + backoff_delay(state.checkpoint_failures));
            }
        }
        let _ = conversation.set_phase(state, Phase::Idle, "checkpoint_failed");
        self.notify_locked(conversation, state);
    }
}
