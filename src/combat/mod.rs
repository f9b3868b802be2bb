//! Pure combat resolution.
//!
//! No I/O, no locking, no system time. Safe to call from any context.

pub mod resolver;

pub use resolver::{
    resolve_round, Action, Resolution, RoundInput, SideOutcome, SideState,
    MAX_DEFENSE_ENERGY, MAX_ENERGY, MAX_HEALTH, MIN_COMBAT_POWER,
};
