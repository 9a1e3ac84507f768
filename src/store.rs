//! Conversation store: fingerprint → live conversation state.
//!
//! The store owns the map; each conversation serializes its observable
//! mutations through one async mutex that is never held across upstream
//! I/O. Background checkpoint tasks hold only the key plus a store handle
//! and re-acquire the lock to publish results.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::engine::phase::Phase;
use crate::identity::short_id;
use crate::sizer::TokenEstimator;
use crate::wire::{message_role, message_text};

/// Handle to a running checkpoint task.
///
/// The epoch pins the attempt: a completing task must find its own epoch
/// still current before committing, so results from cancelled or superseded
/// attempts are discarded.
#[derive(Debug)]
pub struct CheckpointHandle {
    pub epoch: u64,
    task: JoinHandle<()>,
}

impl CheckpointHandle {
    #[must_use]
    pub fn new(epoch: u64, task: JoinHandle<()>) -> Self {
        Self { epoch, task }
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    fn into_task(self) -> JoinHandle<()> {
        self.task
    }
}

/// Snapshot of the pre-swap conversation, kept for dashboard visibility.
#[derive(Clone, Debug, Serialize)]
pub struct SwapSnapshot {
    pub messages: Vec<MessageView>,
    pub wal_start_index: Option<usize>,
}

/// A message as shown on the dashboard.
#[derive(Clone, Debug, Serialize)]
pub struct MessageView {
    pub role: String,
    pub preview: String,
    pub token_estimate: u64,
}

/// Mutable per-conversation state, guarded by the conversation mutex.
#[derive(Debug)]
pub struct ConversationState {
    pub phase: Phase,
    /// Raw message objects as last observed on the wire.
    pub messages: Vec<Value>,
    pub total_input_tokens: u64,
    /// Whether the total came from upstream usage rather than an estimate.
    pub tokens_authoritative: bool,
    /// Start of the write-ahead region; set only while a checkpoint exists.
    pub wal_start_index: Option<usize>,
    /// Anchor recorded at checkpoint spawn, promoted on success.
    pub wal_candidate_index: Option<usize>,
    pub checkpoint_content: Option<String>,
    /// Survives the swap so the dashboard can still show the summary.
    pub last_checkpoint_content: Option<String>,
    pub checkpoint_started_at: Option<OffsetDateTime>,
    pub checkpoint_completed_at: Option<OffsetDateTime>,
    pub last_activity_at: OffsetDateTime,
    pub in_flight: Option<CheckpointHandle>,
    /// Bumped whenever an attempt starts or is invalidated.
    pub checkpoint_epoch: u64,
    pub checkpoint_failures: u32,
    pub backoff_until: Option<tokio::time::Instant>,
    /// Request context reused for checkpoint calls.
    pub auth_headers: Vec<(String, String)>,
    pub query_string: String,
    pub system: Option<Value>,
    pub tools: Option<Value>,
    pub last_swap: Option<SwapSnapshot>,
}

impl ConversationState {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            messages: Vec::new(),
            total_input_tokens: 0,
            tokens_authoritative: false,
            wal_start_index: None,
            wal_candidate_index: None,
            checkpoint_content: None,
            last_checkpoint_content: None,
            checkpoint_started_at: None,
            checkpoint_completed_at: None,
            last_activity_at: OffsetDateTime::now_utc(),
            in_flight: None,
            checkpoint_epoch: 0,
            checkpoint_failures: 0,
            backoff_until: None,
            auth_headers: Vec::new(),
            query_string: String::new(),
            system: None,
            tools: None,
            last_swap: None,
        }
    }

    /// Abort any running checkpoint and invalidate its epoch so a completion
    /// racing with this call cannot commit.
    pub fn abort_in_flight(&mut self) -> Option<JoinHandle<()>> {
        self.checkpoint_epoch += 1;
        self.in_flight.take().map(|handle| {
            handle.abort();
            handle.into_task()
        })
    }

    pub fn touch(&mut self) {
        self.last_activity_at = OffsetDateTime::now_utc();
    }
}

/// One tracked conversation. Immutable identity lives on the struct; all
/// mutable state sits behind the mutex.
pub struct Conversation {
    pub key: String,
    pub conv_id: String,
    pub model: String,
    pub context_window: u64,
    state: Mutex<ConversationState>,
    phase_tx: watch::Sender<Phase>,
}

impl Conversation {
    fn new(fingerprint: &str, model: &str, context_window: u64) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Idle);
        Self {
            key: format!("{fingerprint}:{model}"),
            conv_id: short_id(fingerprint),
            model: model.to_string(),
            context_window,
            state: Mutex::new(ConversationState::new()),
            phase_tx,
        }
    }

    /// Acquire the per-conversation mutex.
    pub async fn lock(&self) -> MutexGuard<'_, ConversationState> {
        self.state.lock().await
    }

    fn try_lock(&self) -> Option<MutexGuard<'_, ConversationState>> {
        self.state.try_lock().ok()
    }

    /// Watch phase changes without holding the state lock.
    #[must_use]
    pub fn phase_watch(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    /// Commit a validated phase transition under the lock, publishing it to
    /// phase watchers.
    ///
    /// # Errors
    /// Returns [`crate::engine::phase::InvalidTransition`] when the
    /// transition is not allowed.
    pub fn set_phase(
        &self,
        state: &mut ConversationState,
        target: Phase,
        trigger: &str,
    ) -> Result<(), crate::engine::phase::InvalidTransition> {
        state.phase = crate::engine::phase::transition(state.phase, target, &self.conv_id, trigger)?;
        self.phase_tx.send_replace(state.phase);
        Ok(())
    }

    #[must_use]
    pub fn utilization(&self, state: &ConversationState) -> f64 {
        if self.context_window == 0 {
            return 0.0;
        }
        state.total_input_tokens as f64 / self.context_window as f64
    }

    /// Dashboard list entry for the current state.
    #[must_use]
    pub fn summary_locked(&self, state: &ConversationState) -> ConversationSummary {
        ConversationSummary {
            key: self.key.clone(),
            conv_id: self.conv_id.clone(),
            model: self.model.clone(),
            phase: state.phase,
            utilization: (self.utilization(state) * 10_000.0).round() / 10_000.0,
            total_input_tokens: state.total_input_tokens,
            context_window: self.context_window,
            checkpoint_ready: state.checkpoint_content.is_some(),
            wal_start_index: state.wal_start_index,
            message_count: state.messages.len(),
        }
    }

    /// Full dashboard detail, including message previews.
    #[must_use]
    pub fn detail_locked(&self, state: &ConversationState) -> ConversationDetail {
        let messages = state.messages.iter().map(message_view).collect();
        let checkpoint_content = state
            .checkpoint_content
            .clone()
            .or_else(|| state.last_checkpoint_content.clone())
            .unwrap_or_default();
        ConversationDetail {
            summary: self.summary_locked(state),
            messages,
            checkpoint_content,
            last_swap: state.last_swap.clone(),
        }
    }
}

/// Build the dashboard view of one wire message.
#[must_use]
pub fn message_view(message: &Value) -> MessageView {
    let preview = match message.get("content") {
        Some(Value::String(_)) => message_text(message),
        Some(Value::Array(blocks)) => {
            let parts: Vec<String> = blocks
                .iter()
                .map(|block| match block.get("type").and_then(Value::as_str) {
                    Some("text") => block
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    Some("tool_use") => {
                        let name = block.get("name").and_then(Value::as_str).unwrap_or("?");
                        let input = block
                            .get("input")
                            .map(|input| {
                                serde_json::to_string_pretty(input).unwrap_or_default()
                            })
                            .unwrap_or_default();
                        format!("[tool_use: {name}]\n{input}")
                    }
                    Some("tool_result") => {
                        let content = match block.get("content") {
                            Some(Value::String(text)) => text.clone(),
                            Some(Value::Array(parts)) => parts
                                .iter()
                                .filter_map(|part| part.get("text").and_then(Value::as_str))
                                .collect::<Vec<_>>()
                                .join("\n"),
                            other => other.map(Value::to_string).unwrap_or_default(),
                        };
                        format!("[tool_result]\n{content}")
                    }
                    Some("compaction") => format!(
                        "[compaction]\n{}",
                        block.get("content").and_then(Value::as_str).unwrap_or_default()
                    ),
                    other => format!("[{}]", other.unwrap_or("unknown")),
                })
                .collect();
            parts.join("\n")
        }
        _ => String::new(),
    };

    MessageView {
        role: message_role(message).to_string(),
        token_estimate: TokenEstimator::estimate_message(message),
        preview,
    }
}

/// Public point-in-time view of one conversation.
#[derive(Clone, Debug, Serialize)]
pub struct ConversationSummary {
    pub key: String,
    pub conv_id: String,
    pub model: String,
    pub phase: Phase,
    pub utilization: f64,
    pub total_input_tokens: u64,
    pub context_window: u64,
    pub checkpoint_ready: bool,
    pub wal_start_index: Option<usize>,
    pub message_count: usize,
}

/// Detail view for the per-conversation dashboard endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub summary: ConversationSummary,
    pub messages: Vec<MessageView>,
    pub checkpoint_content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_swap: Option<SwapSnapshot>,
}

/// Owner of all tracked conversations.
pub struct ConversationStore {
    inner: StdMutex<HashMap<String, Arc<Conversation>>>,
    ttl: Duration,
}

impl ConversationStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: StdMutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Look up or create the conversation for `(fingerprint, model)`,
    /// touching its activity timestamp. Returns whether it was created.
    pub async fn get_or_create(
        &self,
        fingerprint: &str,
        model: &str,
        context_window: u64,
    ) -> (Arc<Conversation>, bool) {
        let (conversation, created) = {
            let mut map = self.inner.lock().expect("store lock poisoned");
            let key = format!("{fingerprint}:{model}");
            match map.get(&key) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let conversation =
                        Arc::new(Conversation::new(fingerprint, model, context_window));
                    map.insert(key, Arc::clone(&conversation));
                    tracing::info!(
                        conv_id = %conversation.conv_id,
                        model,
                        context_window,
                        "conversation registered"
                    );
                    (conversation, true)
                }
            }
        };
        conversation.lock().await.touch();
        (conversation, created)
    }

    /// All live conversations.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Conversation>> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Conversations whose key or conv_id starts with `prefix`.
    #[must_use]
    pub fn find_matching(&self, prefix: &str) -> Vec<Arc<Conversation>> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .values()
            .filter(|conversation| {
                conversation.key.starts_with(prefix) || conversation.conv_id.starts_with(prefix)
            })
            .cloned()
            .collect()
    }

    /// Point-in-time summaries of every conversation; no locks held after
    /// return.
    pub async fn snapshot(&self) -> Vec<ConversationSummary> {
        let mut summaries = Vec::new();
        for conversation in self.all() {
            let state = conversation.lock().await;
            summaries.push(conversation.summary_locked(&state));
        }
        summaries
    }

    /// Remove conversations idle past the TTL.
    ///
    /// A conversation with a checkpoint in flight gets an abort request and
    /// stays until a later sweep observes the task finished; one whose state
    /// lock is busy is skipped this round.
    pub fn evict_idle(&self, now: OffsetDateTime) -> Vec<String> {
        let ttl = time::Duration::seconds(self.ttl.as_secs() as i64);
        let mut evicted = Vec::new();
        let mut map = self.inner.lock().expect("store lock poisoned");
        map.retain(|key, conversation| {
            let Some(mut state) = conversation.try_lock() else {
                return true; // actively in use
            };
            let idle = now - state.last_activity_at;
            if idle <= ttl {
                return true;
            }
            let checkpoint_finished = match &state.in_flight {
                Some(handle) => {
                    handle.abort();
                    handle.is_finished()
                }
                None => true,
            };
            if !checkpoint_finished {
                return true; // deferred until the task observes the abort
            }
            if state.in_flight.is_some() {
                state.abort_in_flight();
            }
            tracing::info!(key = %key, "conversation expired");
            evicted.push(key.clone());
            false
        });
        evicted
    }

    /// Remove one conversation outright.
    pub fn remove(&self, key: &str) {
        self.inner.lock().expect("store lock poisoned").remove(key);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every in-flight checkpoint and wait for the tasks to drain,
    /// up to `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        let mut tasks = Vec::new();
        for conversation in self.all() {
            let mut state = conversation.lock().await;
            if let Some(task) = state.abort_in_flight() {
                tasks.push(task);
            }
        }
        if tasks.is_empty() {
            return;
        }
        let drain = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!("checkpoint tasks did not drain within the grace period");
        }
    }
}
