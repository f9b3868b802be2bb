//! Engine Configuration
//!
//! All recognized tuning options with production defaults. Tests shrink
//! the timers to keep runs fast.

use std::time::Duration;

/// Daily battle allowance per subscription tier.
#[derive(Debug, Clone, Copy)]
pub struct DailyLimits {
    /// Free tier battles per day.
    pub free: u32,
    /// Pro tier battles per day.
    pub pro: u32,
    /// Enterprise tier (None = unlimited).
    pub enterprise: Option<u32>,
}

impl Default for DailyLimits {
    fn default() -> Self {
        Self {
            free: 3,
            pro: 10,
            enterprise: None,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Countdown shown to clients before a battle turns ongoing.
    pub countdown: Duration,
    /// Fixed resolution cadence per round; on expiry the round is
    /// force-advanced with missing actions defaulted to attack.
    pub round_interval: Duration,
    /// Hard cap on battle duration; exceeded battles complete with the
    /// higher-health player as winner (equal health = draw).
    pub battle_timeout: Duration,
    /// Bound on a single battle-lock acquisition attempt.
    pub lock_timeout: Duration,
    /// Lock acquisition attempts before surfacing `LockTimeout`.
    pub max_retry_attempts: u32,
    /// Base delay for exponential backoff between lock attempts
    /// (1s, 2s, 4s with the default base).
    pub retry_backoff_base: Duration,
    /// Matchmaking sweep cadence.
    pub queue_sweep_interval: Duration,
    /// Window during which two users who fought are not re-paired.
    pub recent_opponent_cooldown: Duration,
    /// Retries for a transient realtime publish failure.
    pub publish_retries: u32,
    /// Retries for the idempotent reward grant before escalating.
    pub reward_grant_retries: u32,
    /// How long terminal battles stay readable before the cleanup
    /// pass reaps them.
    pub completed_battle_retention: Duration,
    /// Daily battle allowances per tier.
    pub daily_limits: DailyLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            countdown: Duration::from_secs(3),
            round_interval: Duration::from_secs(3),
            battle_timeout: Duration::from_secs(600),
            lock_timeout: Duration::from_secs(5),
            max_retry_attempts: 3,
            retry_backoff_base: Duration::from_secs(1),
            queue_sweep_interval: Duration::from_secs(2),
            recent_opponent_cooldown: Duration::from_secs(24 * 3600),
            publish_retries: 2,
            reward_grant_retries: 3,
            completed_battle_retention: Duration::from_secs(300),
            daily_limits: DailyLimits::default(),
        }
    }
}

impl EngineConfig {
    /// Backoff delay before retry attempt `attempt` (0-based).
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff_base * 2u32.saturating_pow(attempt)
    }
}
