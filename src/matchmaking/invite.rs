//! Direct Challenges
//!
//! Pending player-to-player invitations. Accepting one funnels into the
//! same battle-creation path as a queue match; rejecting or expiring it
//! simply removes the record and notifies the challenger.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::core::ids::{InviteId, UserId};
use crate::error::EngineError;

/// A pending challenge from one player to another.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Invitation {
    /// Unique invitation id.
    pub id: InviteId,
    /// Challenger.
    pub from: UserId,
    /// Challenger's combat power, captured at challenge time.
    pub from_combat_power: u32,
    /// Challenged player.
    pub to: UserId,
    /// Creation time, used for expiry.
    pub created_at: DateTime<Utc>,
}

/// Book of pending invitations.
///
/// Mutated only under the matchmaking critical section.
#[derive(Debug, Default)]
pub struct InviteBook {
    invites: BTreeMap<InviteId, Invitation>,
}

impl InviteBook {
    /// Create an empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new challenge.
    ///
    /// Self-challenges are malformed. A duplicate pending challenge for
    /// the same ordered pair is rejected so a challenger cannot spam the
    /// same opponent.
    pub fn create(
        &mut self,
        from: UserId,
        from_combat_power: u32,
        to: UserId,
        now: DateTime<Utc>,
    ) -> Result<Invitation, EngineError> {
        if from == to {
            return Err(EngineError::Validation(
                "cannot challenge yourself".to_string(),
            ));
        }
        if self.invites.values().any(|i| i.from == from && i.to == to) {
            return Err(EngineError::Validation(format!(
                "a challenge from {from} to {to} is already pending"
            )));
        }

        let invitation =
            Invitation { id: InviteId::random(), from, from_combat_power, to, created_at: now };
        self.invites.insert(invitation.id, invitation.clone());
        Ok(invitation)
    }

    /// Accept a pending challenge, removing it from the book.
    ///
    /// Only the challenged player may accept.
    pub fn accept(&mut self, id: InviteId, user: UserId) -> Result<Invitation, EngineError> {
        match self.invites.get(&id) {
            Some(invitation) if invitation.to == user => {
                Ok(self.invites.remove(&id).expect("checked above"))
            }
            // An invite addressed to someone else is indistinguishable
            // from a missing one to the caller
            _ => Err(EngineError::InviteNotFound(id)),
        }
    }

    /// Reject a pending challenge, removing it from the book.
    ///
    /// Either party may remove it: the challenged player rejects, the
    /// challenger withdraws.
    pub fn reject(&mut self, id: InviteId, user: UserId) -> Result<Invitation, EngineError> {
        match self.invites.get(&id) {
            Some(invitation) if invitation.to == user || invitation.from == user => {
                Ok(self.invites.remove(&id).expect("checked above"))
            }
            _ => Err(EngineError::InviteNotFound(id)),
        }
    }

    /// Remove and return every invitation older than `ttl`.
    pub fn expire(&mut self, now: DateTime<Utc>, ttl: Duration) -> Vec<Invitation> {
        let cutoff = now - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expired: Vec<InviteId> = self
            .invites
            .values()
            .filter(|i| i.created_at < cutoff)
            .map(|i| i.id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.invites.remove(&id))
            .collect()
    }

    /// Pending challenges addressed to a player.
    pub fn pending_for(&self, user: UserId) -> Vec<&Invitation> {
        self.invites.values().filter(|i| i.to == user).collect()
    }

    /// Number of pending invitations.
    pub fn len(&self) -> usize {
        self.invites.len()
    }

    /// Whether the book is empty.
    pub fn is_empty(&self) -> bool {
        self.invites.is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================
