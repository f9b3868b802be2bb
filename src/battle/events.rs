//! Battle Events
//!
//! Every state-changing engine transition produces one of these, which
//! the broadcaster publishes to the participants' private channels and,
//! where relevant, to the aggregate channels. Within one battle, events
//! are published in causal order (round N before round N+1).

use serde::{Serialize, Deserialize};

use crate::battle::state::{EndReason, RoundOutcome};
use crate::core::ids::{BattleId, InviteId, UserId};

/// A state-changing engine event.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BattleEvent {
    /// A direct challenge was issued.
    InvitationCreated {
        /// Invitation id.
        invite_id: InviteId,
        /// Challenger.
        from: UserId,
        /// Challenged player.
        to: UserId,
    },

    /// A direct challenge was accepted; a battle was created.
    InvitationAccepted {
        /// Invitation id.
        invite_id: InviteId,
        /// Challenger.
        from: UserId,
        /// Accepting player.
        to: UserId,
        /// The battle created from the invitation.
        battle_id: BattleId,
    },

    /// A direct challenge was rejected.
    InvitationRejected {
        /// Invitation id.
        invite_id: InviteId,
        /// Challenger.
        from: UserId,
        /// Rejecting player.
        to: UserId,
    },

    /// A battle was created and its countdown is running.
    BattleCreated {
        /// Battle id.
        battle_id: BattleId,
        /// Player 1.
        player1: UserId,
        /// Player 2.
        player2: UserId,
        /// Client-facing countdown before actions are accepted.
        countdown_ms: u64,
    },

    /// The countdown elapsed; the battle accepts actions.
    BattleStarted {
        /// Battle id.
        battle_id: BattleId,
        /// Round resolution cadence.
        round_interval_ms: u64,
    },

    /// A round resolved (by both actions arriving or by the round timer).
    RoundResolved {
        /// Battle id.
        battle_id: BattleId,
        /// The immutable outcome record appended to the round log.
        outcome: RoundOutcome,
    },

    /// The battle reached `Completed`.
    BattleCompleted {
        /// Battle id.
        battle_id: BattleId,
        /// Winner; None is an explicit draw.
        winner_id: Option<UserId>,
        /// Why the battle ended.
        reason: EndReason,
    },

    /// The battle was cancelled; no rewards.
    BattleCancelled {
        /// Battle id.
        battle_id: BattleId,
        /// Cancellation cause.
        reason: String,
    },

    /// The matchmaking pool population changed.
    QueueStatusChanged {
        /// Players currently waiting.
        waiting: usize,
    },
}

impl BattleEvent {
    /// Stable event name used as the publish subject.
    pub fn name(&self) -> &'static str {
        match self {
            BattleEvent::InvitationCreated { .. } => "invitation_created",
            BattleEvent::InvitationAccepted { .. } => "invitation_accepted",
            BattleEvent::InvitationRejected { .. } => "invitation_rejected",
            BattleEvent::BattleCreated { .. } => "battle_created",
            BattleEvent::BattleStarted { .. } => "battle_started",
            BattleEvent::RoundResolved { .. } => "round_resolved",
            BattleEvent::BattleCompleted { .. } => "battle_completed",
            BattleEvent::BattleCancelled { .. } => "battle_cancelled",
            BattleEvent::QueueStatusChanged { .. } => "queue_status_changed",
        }
    }
}
