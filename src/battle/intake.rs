//! Action Intake & Concurrency Guard
//!
//! The synchronization point for per-round action submissions. Each
//! battle's `(Battle, RoundIntake)` pair lives behind one
//! `tokio::sync::Mutex`; two players and the round-timeout task race
//! into that critical section, and exactly one of them closes the round.
//!
//! The intake accepts at most one action per `(battle, slot, round)`
//! triple. A duplicate is benign (`Duplicate`), an action for an
//! already-resolved round is success-but-ignored (`Superseded`).

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::battle::state::PlayerSlot;
use crate::combat::resolver::{Action, RoundInput};
use crate::config::EngineConfig;
use crate::error::EngineError;

/// A buffered action awaiting round resolution.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PendingAction {
    /// Submitting seat.
    pub slot: PlayerSlot,
    /// Round the action belongs to.
    pub round: u32,
    /// The chosen action.
    pub action: Action,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
}

/// How a submission was absorbed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Buffered for the current round.
    Accepted {
        /// Both players' actions are now present; the caller must close
        /// the round before releasing the critical section.
        both_present: bool,
    },
    /// Same seat already submitted this round. Idempotent no-op.
    Duplicate,
    /// The battle already advanced past the submitter's round. Normal,
    /// not an error.
    Superseded,
}

/// Per-battle buffer of the current round's submissions.
///
/// Owned by the battle's critical section; never shared.
#[derive(Clone, Debug, Default)]
pub struct RoundIntake {
    /// Round currently collecting actions (1-based).
    round: u32,
    p1: Option<PendingAction>,
    p2: Option<PendingAction>,
    /// Bumped every time a round closes; round timers carry the
    /// generation they were armed for so a stale timer never fires.
    generation: u64,
}

impl RoundIntake {
    /// Start collecting for round 1.
    pub fn new() -> Self {
        Self { round: 1, p1: None, p2: None, generation: 0 }
    }

    /// Round currently collecting actions.
    pub fn current_round(&self) -> u32 {
        self.round
    }

    /// Current timer generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Buffer one action.
    ///
    /// `round` pins the submission to a specific round; `None` targets
    /// whatever round is currently collecting. A pinned round that has
    /// already resolved yields `Superseded`; a future round is malformed.
    pub fn submit(
        &mut self,
        slot: PlayerSlot,
        action: Action,
        round: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome, EngineError> {
        if let Some(r) = round {
            if r < self.round {
                return Ok(SubmitOutcome::Superseded);
            }
            if r > self.round {
                return Err(EngineError::Validation(format!(
                    "round {r} has not opened yet (current {})",
                    self.round
                )));
            }
        }

        let entry = match slot {
            PlayerSlot::One => &mut self.p1,
            PlayerSlot::Two => &mut self.p2,
        };
        if entry.is_some() {
            return Ok(SubmitOutcome::Duplicate);
        }
        *entry = Some(PendingAction { slot, round: self.round, action, submitted_at: now });

        Ok(SubmitOutcome::Accepted { both_present: self.p1.is_some() && self.p2.is_some() })
    }

    /// Whether both seats have submitted for the current round.
    pub fn both_present(&self) -> bool {
        self.p1.is_some() && self.p2.is_some()
    }

    /// The buffered action for a seat, if any.
    pub fn pending(&self, slot: PlayerSlot) -> Option<&PendingAction> {
        match slot {
            PlayerSlot::One => self.p1.as_ref(),
            PlayerSlot::Two => self.p2.as_ref(),
        }
    }

    /// Consume the round's actions exactly once and open the next round.
    ///
    /// A missing submission becomes a defaulted attack so an
    /// unresponsive client never stalls the battle; the resolver gives
    /// that stand-in no energy bonus and spends nothing for it.
    pub fn close_round(&mut self) -> (RoundInput, RoundInput) {
        let a1 = self
            .p1
            .take()
            .map(|p| RoundInput::chosen(p.action))
            .unwrap_or_else(RoundInput::defaulted_attack);
        let a2 = self
            .p2
            .take()
            .map(|p| RoundInput::chosen(p.action))
            .unwrap_or_else(RoundInput::defaulted_attack);
        self.round += 1;
        self.generation += 1;
        (a1, a2)
    }

    /// Discard buffered actions when the battle terminates.
    pub fn discard(&mut self) {
        self.p1 = None;
        self.p2 = None;
        self.generation += 1;
    }
}

/// Acquire a battle critical section with bounded retries.
///
/// One initial attempt plus `max_retry_attempts` backed-off retries,
/// each bounded by `lock_timeout`; the backoff doubles per retry
/// (1s, 2s, 4s with default config). Exhausting the schedule surfaces
/// `LockTimeout`, which means contention under pathological load, not
/// steady-state behavior.
pub async fn lock_with_retry<'a, T>(
    mutex: &'a Mutex<T>,
    config: &EngineConfig,
) -> Result<MutexGuard<'a, T>, EngineError> {
    if let Ok(guard) = timeout(config.lock_timeout, mutex.lock()).await {
        return Ok(guard);
    }
    for retry in 0..config.max_retry_attempts {
        let backoff = config.retry_backoff(retry);
        debug!(retry, ?backoff, "battle lock contended, backing off");
        sleep(backoff).await;
        if let Ok(guard) = timeout(config.lock_timeout, mutex.lock()).await {
            return Ok(guard);
        }
    }
    Err(EngineError::LockTimeout)
}

// =============================================================================
// TESTS
// =============================================================================
