//! Buffer phase state machine.
//!
//! ```text
//! IDLE ──[util ≥ checkpoint_threshold]──→ CHECKPOINT_PENDING
//!                                              │
//!                              ┌───────────────┴───────────────┐
//!                    [executor spawned]            [emergency: past swap
//!                              │                    threshold already]
//!                              v                               │
//!                        CHECKPOINTING                         │
//!                              │                               │
//!                    [summary completes]                       │
//!                              v                               │
//!                        WAL_ACTIVE ←──────────────────────────┘
//!                              │
//!                    [util ≥ swap_threshold]
//!                              v
//!                        SWAP_READY ──[compact request]──→ SWAP_EXECUTING ──→ IDLE
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle phase of one conversation's buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Idle,
    CheckpointPending,
    Checkpointing,
    WalActive,
    SwapReady,
    SwapExecuting,
}

impl Phase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::CheckpointPending => "CHECKPOINT_PENDING",
            Self::Checkpointing => "CHECKPOINTING",
            Self::WalActive => "WAL_ACTIVE",
            Self::SwapReady => "SWAP_READY",
            Self::SwapExecuting => "SWAP_EXECUTING",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempted transition not present in the table.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transition: {from} → {to}")]
pub struct InvalidTransition {
    pub from: Phase,
    pub to: Phase,
}

#[must_use]
pub fn is_valid_transition(from: Phase, to: Phase) -> bool {
    use Phase::{CheckpointPending, Checkpointing, Idle, SwapExecuting, SwapReady, WalActive};
    matches!(
        (from, to),
        (Idle, CheckpointPending)
            | (CheckpointPending, Checkpointing)
            // Emergency: swap threshold hit before the checkpoint started.
            | (CheckpointPending, WalActive)
            | (Checkpointing, WalActive)
            | (WalActive, SwapReady)
            | (WalActive, SwapExecuting)
            | (SwapReady, SwapExecuting)
            | (SwapExecuting, Idle)
            // Reset from any non-idle state.
            | (CheckpointPending, Idle)
            | (Checkpointing, Idle)
            | (WalActive, Idle)
            | (SwapReady, Idle)
    )
}

/// Execute a validated transition, logging the change.
///
/// # Errors
/// Returns [`InvalidTransition`] when the transition is not in the table.
pub fn transition(
    current: Phase,
    target: Phase,
    conv_id: &str,
    trigger: &str,
) -> Result<Phase, InvalidTransition> {
    if !is_valid_transition(current, target) {
        return Err(InvalidTransition {
            from: current,
            to: target,
        });
    }
    tracing::info!(
        conv_id,
        from_phase = current.as_str(),
        to_phase = target.as_str(),
        trigger,
        "phase transition"
    );
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_cycle() {
        let steps = [
            (Phase::Idle, Phase::CheckpointPending),
            (Phase::CheckpointPending, Phase::Checkpointing),
            (Phase::Checkpointing, Phase::WalActive),
            (Phase::WalActive, Phase::SwapReady),
            (Phase::SwapReady, Phase::SwapExecuting),
            (Phase::SwapExecuting, Phase::Idle),
        ];
        for (from, to) in steps {
            assert!(is_valid_transition(from, to), "{from} → {to}");
        }
    }

    #[test]
    fn test_early_swap_from_wal_active() {
        assert!(is_valid_transition(Phase::WalActive, Phase::SwapExecuting));
    }

    #[test]
    fn test_resets_allowed_from_non_idle() {
        for from in [
            Phase::CheckpointPending,
            Phase::Checkpointing,
            Phase::WalActive,
            Phase::SwapReady,
        ] {
            assert!(is_valid_transition(from, Phase::Idle), "{from} → IDLE");
        }
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        assert!(!is_valid_transition(Phase::Idle, Phase::SwapReady));
        assert!(!is_valid_transition(Phase::Idle, Phase::Checkpointing));
        assert!(!is_valid_transition(Phase::SwapExecuting, Phase::SwapReady));
        let err = transition(Phase::Idle, Phase::WalActive, "abc", "test").unwrap_err();
        assert_eq!(
            err,
            InvalidTransition {
                from: Phase::Idle,
                to: Phase::WalActive,
            }
        );
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_value(Phase::CheckpointPending).unwrap(),
            serde_json::json!("CHECKPOINT_PENDING")
        );
        assert_eq!(Phase::WalActive.as_str(), "WAL_ACTIVE");
    }
}
