//! Deterministic primitives shared across the engine.
//!
//! Everything in this module is free of I/O and system time so combat
//! outcomes can be replayed from a battle's seed.

pub mod ids;
pub mod rng;

pub use ids::{BattleId, InviteId, UserId};
pub use rng::{derive_battle_seed, DeterministicRng};
