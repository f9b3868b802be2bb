//! Battle lifecycle: state machine, per-round intake, and events.

pub mod events;
pub mod intake;
pub mod state;

pub use events::BattleEvent;
pub use intake::{lock_with_retry, PendingAction, RoundIntake, SubmitOutcome};
pub use state::{
    Battle, BattleStatus, Combatant, EndReason, EnergyKind, PlayerSlot, PlayerSnapshot,
    RoundOutcome, RoundSide, RoundVerdict,
};
