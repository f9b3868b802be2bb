//! Engine Error Taxonomy
//!
//! Errors are split by how callers should react:
//! - `Validation` is malformed input, never retried.
//! - `InvalidState`, `UnknownBattle`, `UnknownPlayer` are surfaced as no-ops.
//! - `DuplicateAction` is benign; the engine maps it to a success outcome.
//! - `LockTimeout` is transient; callers may retry.
//! - Queue errors (`AlreadyQueued`, `AlreadyInBattle`, `DailyLimitExceeded`)
//!   are user-facing and non-retryable.

use chrono::{DateTime, Utc};

use crate::core::ids::InviteId;

/// Errors produced by engine operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Malformed input (out-of-range energy, power, match range, ...).
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Operation not valid for the battle's current status.
    #[error("Battle is not in a valid state for this operation")]
    InvalidState,

    /// Battle id is not registered.
    #[error("Unknown battle")]
    UnknownBattle,

    /// User is not a participant of the battle.
    #[error("User is not a participant of this battle")]
    UnknownPlayer,

    /// Second submission for the same (battle, player, round).
    /// Benign: the engine reports it as an idempotent success.
    #[error("Action already submitted for this round")]
    DuplicateAction,

    /// Could not acquire the battle critical section within the
    /// configured retry budget.
    #[error("Timed out waiting for battle lock")]
    LockTimeout,

    /// User already has a queue entry.
    #[error("Already queued for matchmaking")]
    AlreadyQueued,

    /// User already has an active battle.
    #[error("Already in an active battle")]
    AlreadyInBattle,

    /// Daily battle allowance exhausted for the user's tier.
    #[error("Daily battle limit exceeded, resets at {reset_at}")]
    DailyLimitExceeded {
        /// When the daily counter resets.
        reset_at: DateTime<Utc>,
    },

    /// Invitation id not found or not addressed to the caller.
    #[error("Invitation {0} not found")]
    InviteNotFound(InviteId),
}

/// Failure from the realtime channel collaborator.
///
/// Never converted into [`EngineError`]: publishes are best-effort and
/// the game continues when they fail.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Publish failed: {0}")]
pub struct PublishError(pub String);

/// Failure from the reward/ledger collaborator.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Ledger call failed: {0}")]
pub struct LedgerError(pub String);
