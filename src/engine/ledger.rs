//! Reward/Ledger Collaborator Boundary
//!
//! The engine talks to the surrounding application's reward and
//! daily-limit ledger through [`RewardLedger`]. Grants are idempotent
//! per battle id; the engine retries transient failures and escalates
//! (logs) persistent ones without ever rolling back a completed battle.
//!
//! [`InMemoryLedger`] is the reference implementation used by the demo
//! binary and the tests. It applies the production reward rules:
//! +10/-5 combat power (floored at 100), +100/+25 XP, and a 24h
//! fee-discount entitlement for the winner.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::combat::resolver::MIN_COMBAT_POWER;
use crate::config::DailyLimits;
use crate::core::ids::{BattleId, UserId};
use crate::error::LedgerError;

/// Combat-power delta for a win.
const WINNER_CP_DELTA: u32 = 10;
/// Combat-power delta for a loss.
const LOSER_CP_DELTA: u32 = 5;
/// XP granted to the winner.
const WINNER_XP: u32 = 100;
/// XP granted to the loser.
const LOSER_XP: u32 = 25;

/// Completed-battle outcome handed to the ledger exactly once.
#[derive(Clone, Copy, Debug)]
pub struct BattleOutcome {
    /// Idempotency key.
    pub battle_id: BattleId,
    /// Winner; None for a draw.
    pub winner_id: Option<UserId>,
    /// Loser; None for a draw.
    pub loser_id: Option<UserId>,
}

/// A user's battle count for the current day.
#[derive(Clone, Copy, Debug)]
pub struct DailyBattleCount {
    /// Battles counted today.
    pub count: u32,
    /// Tier allowance; None = unlimited.
    pub tier_limit: Option<u32>,
    /// When the counter resets.
    pub reset_at: DateTime<Utc>,
}

impl DailyBattleCount {
    /// Whether another battle is permitted.
    pub fn exhausted(&self) -> bool {
        match self.tier_limit {
            Some(limit) => self.count >= limit,
            None => false,
        }
    }
}

/// Boundary to the external reward/daily-limit ledger.
pub trait RewardLedger: Send + Sync {
    /// Grant rewards for a completed battle. Idempotent per battle id.
    fn grant_battle_outcome(&self, outcome: &BattleOutcome) -> Result<(), LedgerError>;

    /// The user's battle count for the current day.
    fn daily_battle_count(&self, user_id: UserId) -> Result<DailyBattleCount, LedgerError>;

    /// Record that a battle started for both participants, for daily
    /// accounting. Cancelled battles still count toward the limit.
    fn record_battle_start(&self, users: [UserId; 2]) -> Result<(), LedgerError>;
}

/// Subscription tier, which bounds battles per day.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Tier {
    /// Free tier.
    #[default]
    Free,
    /// Pro tier.
    Pro,
    /// Enterprise tier (unlimited).
    Enterprise,
}

impl Tier {
    /// Daily battle allowance for this tier.
    pub fn daily_limit(self, limits: &DailyLimits) -> Option<u32> {
        match self {
            Tier::Free => Some(limits.free),
            Tier::Pro => Some(limits.pro),
            Tier::Enterprise => limits.enterprise,
        }
    }
}

#[derive(Clone, Debug)]
struct Profile {
    combat_power: u32,
    xp: u32,
    tier: Tier,
    fee_discount_until: Option<DateTime<Utc>>,
    battles_today: u32,
    counted_on: chrono::NaiveDate,
}

impl Profile {
    fn new(combat_power: u32) -> Self {
        Self {
            combat_power,
            xp: 0,
            tier: Tier::Free,
            fee_discount_until: None,
            battles_today: 0,
            counted_on: Utc::now().date_naive(),
        }
    }

    fn roll_day(&mut self, today: chrono::NaiveDate) {
        if self.counted_on != today {
            self.counted_on = today;
            self.battles_today = 0;
        }
    }
}

/// In-memory ledger with the production reward rules.
#[derive(Default)]
pub struct InMemoryLedger {
    limits: DailyLimits,
    inner: Mutex<LedgerState>,
}

#[derive(Default)]
struct LedgerState {
    profiles: BTreeMap<UserId, Profile>,
    granted: BTreeSet<BattleId>,
}

impl InMemoryLedger {
    /// Create a ledger with the given tier limits.
    pub fn new(limits: DailyLimits) -> Self {
        Self { limits, inner: Mutex::new(LedgerState::default()) }
    }

    /// Register a user with a starting combat power and tier.
    pub fn register(&self, user_id: UserId, combat_power: u32, tier: Tier) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut profile = Profile::new(combat_power);
        profile.tier = tier;
        state.profiles.insert(user_id, profile);
    }

    /// Current combat power (registers unknown users at the minimum).
    pub fn combat_power(&self, user_id: UserId) -> u32 {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state
            .profiles
            .entry(user_id)
            .or_insert_with(|| Profile::new(MIN_COMBAT_POWER))
            .combat_power
    }

    /// Current XP.
    pub fn xp(&self, user_id: UserId) -> u32 {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.profiles.get(&user_id).map(|p| p.xp).unwrap_or(0)
    }

    /// Whether the user holds an active fee-discount entitlement.
    pub fn has_fee_discount(&self, user_id: UserId, now: DateTime<Utc>) -> bool {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state
            .profiles
            .get(&user_id)
            .and_then(|p| p.fee_discount_until)
            .map(|until| until > now)
            .unwrap_or(false)
    }

    fn next_reset(now: DateTime<Utc>) -> DateTime<Utc> {
        let tomorrow = now.date_naive() + ChronoDuration::days(1);
        tomorrow
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc())
            .unwrap_or(now + ChronoDuration::days(1))
    }
}

impl RewardLedger for InMemoryLedger {
    fn grant_battle_outcome(&self, outcome: &BattleOutcome) -> Result<(), LedgerError> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        // Idempotent per battle id
        if !state.granted.insert(outcome.battle_id) {
            return Ok(());
        }

        let now = Utc::now();
        if let Some(winner) = outcome.winner_id {
            let profile = state
                .profiles
                .entry(winner)
                .or_insert_with(|| Profile::new(MIN_COMBAT_POWER));
            profile.combat_power += WINNER_CP_DELTA;
            profile.xp += WINNER_XP;
            profile.fee_discount_until = Some(now + ChronoDuration::hours(24));
        }
        if let Some(loser) = outcome.loser_id {
            let profile = state
                .profiles
                .entry(loser)
                .or_insert_with(|| Profile::new(MIN_COMBAT_POWER));
            profile.combat_power = profile
                .combat_power
                .saturating_sub(LOSER_CP_DELTA)
                .max(MIN_COMBAT_POWER);
            profile.xp += LOSER_XP;
        }
        Ok(())
    }

    fn daily_battle_count(&self, user_id: UserId) -> Result<DailyBattleCount, LedgerError> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let today = now.date_naive();
        let profile = state
            .profiles
            .entry(user_id)
            .or_insert_with(|| Profile::new(MIN_COMBAT_POWER));
        profile.roll_day(today);

        Ok(DailyBattleCount {
            count: profile.battles_today,
            tier_limit: profile.tier.daily_limit(&self.limits),
            reset_at: Self::next_reset(now),
        })
    }

    fn record_battle_start(&self, users: [UserId; 2]) -> Result<(), LedgerError> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let today = Utc::now().date_naive();
        for user_id in users {
            let profile = state
                .profiles
                .entry(user_id)
                .or_insert_with(|| Profile::new(MIN_COMBAT_POWER));
            profile.roll_day(today);
            profile.battles_today += 1;
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_applies_reward_rules() {
        let ledger = InMemoryLedger::new(DailyLimits::default());
        let winner = UserId::random();
        let loser = UserId::random();
        ledger.register(winner, 150, Tier::Free);
        ledger.register(loser, 150, Tier::Free);

        let outcome = BattleOutcome {
            battle_id: BattleId::random(),
            winner_id: Some(winner),
            loser_id: Some(loser),
        };
        ledger.grant_battle_outcome(&outcome).unwrap();

        assert_eq!(ledger.combat_power(winner), 160);
        assert_eq!(ledger.combat_power(loser), 145);
        assert_eq!(ledger.xp(winner), 100);
        assert_eq!(ledger.xp(loser), 25);
        assert!(ledger.has_fee_discount(winner, Utc::now()));
        assert!(!ledger.has_fee_discount(loser, Utc::now()));
    }

    #[test]
    fn test_grant_is_idempotent_per_battle() {
        let ledger = InMemoryLedger::new(DailyLimits::default());
        let winner = UserId::random();
        let loser = UserId::random();
        ledger.register(winner, 200, Tier::Free);
        ledger.register(loser, 200, Tier::Free);

        let outcome = BattleOutcome {
            battle_id: BattleId::random(),
            winner_id: Some(winner),
            loser_id: Some(loser),
        };
        ledger.grant_battle_outcome(&outcome).unwrap();
        ledger.grant_battle_outcome(&outcome).unwrap();
        ledger.grant_battle_outcome(&outcome).unwrap();

        // Applied once, not three times
        assert_eq!(ledger.combat_power(winner), 210);
        assert_eq!(ledger.combat_power(loser), 195);
    }

    #[test]
    fn test_loser_power_floors_at_minimum() {
        let ledger = InMemoryLedger::new(DailyLimits::default());
        let winner = UserId::random();
        let loser = UserId::random();
        ledger.register(loser, 102, Tier::Free);

        ledger
            .grant_battle_outcome(&BattleOutcome {
                battle_id: BattleId::random(),
                winner_id: Some(winner),
                loser_id: Some(loser),
            })
            .unwrap();

        assert_eq!(ledger.combat_power(loser), MIN_COMBAT_POWER);
    }

    #[test]
    fn test_draw_grants_nothing() {
        let ledger = InMemoryLedger::new(DailyLimits::default());
        let p1 = UserId::random();
        ledger.register(p1, 150, Tier::Free);

        ledger
            .grant_battle_outcome(&BattleOutcome {
                battle_id: BattleId::random(),
                winner_id: None,
                loser_id: None,
            })
            .unwrap();

        assert_eq!(ledger.combat_power(p1), 150);
        assert_eq!(ledger.xp(p1), 0);
    }

    #[test]
    fn test_daily_count_tracks_tier_limits() {
        let ledger = InMemoryLedger::new(DailyLimits::default());
        let free = UserId::random();
        let pro = UserId::random();
        let ent = UserId::random();
        ledger.register(free, 150, Tier::Free);
        ledger.register(pro, 150, Tier::Pro);
        ledger.register(ent, 150, Tier::Enterprise);

        assert_eq!(ledger.daily_battle_count(free).unwrap().tier_limit, Some(3));
        assert_eq!(ledger.daily_battle_count(pro).unwrap().tier_limit, Some(10));
        assert_eq!(ledger.daily_battle_count(ent).unwrap().tier_limit, None);

        for _ in 0..3 {
            ledger.record_battle_start([free, pro]).unwrap();
        }
        let count = ledger.daily_battle_count(free).unwrap();
        assert_eq!(count.count, 3);
        assert!(count.exhausted());
        assert!(count.reset_at > Utc::now());

        assert!(!ledger.daily_battle_count(pro).unwrap().exhausted());
        assert!(!ledger.daily_battle_count(ent).unwrap().exhausted());
    }
}
