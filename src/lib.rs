//! # Arena Battle Engine
//!
//! Authoritative real-time PvP battle engine: matchmaking, synchronized
//! round-based combat between two players, and reward settlement.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ARENA BATTLE ENGINE                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Shared primitives                         │
//! │  ├── ids.rs      - UserId / BattleId / InviteId newtypes     │
//! │  └── rng.rs      - Deterministic Xorshift128+ PRNG           │
//! │                                                              │
//! │  combat/         - Pure round resolution                     │
//! │  └── resolver.rs - Damage, crit, dodge, energy accounting    │
//! │                                                              │
//! │  battle/         - Battle lifecycle                          │
//! │  ├── state.rs    - State machine and round log               │
//! │  ├── intake.rs   - Action buffering and the lock discipline  │
//! │  └── events.rs   - Published event types                     │
//! │                                                              │
//! │  matchmaking/    - Finding an opponent                       │
//! │  ├── queue.rs    - Tolerance-window matching pool            │
//! │  └── invite.rs   - Direct challenges                         │
//! │                                                              │
//! │  engine/         - Orchestration (non-deterministic)         │
//! │  ├── mod.rs      - Registry, timers, round closing           │
//! │  ├── broadcast.rs- Realtime channel boundary                 │
//! │  └── ledger.rs   - Reward / daily-limit boundary             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism
//!
//! Combat itself is **fully deterministic**: every roll comes from a
//! per-battle Xorshift128+ stream seeded from the battle id and both
//! participants, and state iterates through `BTreeMap` only. Given the
//! same seed and action sequence, a battle replays identically, so the
//! round log is sufficient for client-side replay and audit.
//!
//! Orchestration (timers, lock scheduling, broadcasting) is where the
//! wall clock lives; it decides *when* rounds close, never *how* they
//! resolve.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod battle;
pub mod combat;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod matchmaking;

// Re-export commonly used types
pub use crate::battle::{Battle, BattleEvent, BattleStatus, EndReason, EnergyKind, RoundOutcome};
pub use crate::combat::resolver::{Action, RoundInput};
pub use crate::config::{DailyLimits, EngineConfig};
pub use crate::core::ids::{BattleId, InviteId, UserId};
pub use crate::core::rng::DeterministicRng;
pub use crate::engine::{
    ActionReceipt, BattleEngine, BattleOutcome, Broadcaster, ChannelKey, InMemoryChannel,
    InMemoryLedger, QueueStatus, RealtimeChannel, RewardLedger, Tier,
};
pub use crate::error::{EngineError, LedgerError, PublishError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
