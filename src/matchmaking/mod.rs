//! Matchmaking: the waiting pool and direct challenges.

pub mod invite;
pub mod queue;

pub use invite::{Invitation, InviteBook};
pub use queue::{MatchPool, MatchedPair, QueueEntry};
