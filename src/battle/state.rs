//! Battle State Machine
//!
//! The `Battle` aggregate owns one battle's lifecycle
//! (`preparing -> ongoing -> completed | cancelled`), its health and
//! energy pools, the round counter, and the append-only round log.
//! Mutation happens only through the methods here; the engine wraps each
//! battle in its own critical section.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use std::time::Duration;

use crate::combat::resolver::{
    resolve_round, Action, Resolution, RoundInput, SideOutcome, SideState,
    MAX_DEFENSE_ENERGY, MAX_ENERGY, MAX_HEALTH, MIN_COMBAT_POWER,
};
use crate::core::ids::{BattleId, UserId};
use crate::core::rng::{derive_battle_seed, DeterministicRng};
use crate::error::EngineError;

// =============================================================================
// SNAPSHOTS & COMBATANTS
// =============================================================================

/// Immutable per-battle-start view of a player.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    /// The player.
    pub user_id: UserId,
    /// Combat power at battle start (>= 100).
    pub combat_power: u32,
}

impl PlayerSnapshot {
    /// Create a validated snapshot.
    pub fn new(user_id: UserId, combat_power: u32) -> Result<Self, EngineError> {
        if combat_power < MIN_COMBAT_POWER {
            return Err(EngineError::Validation(format!(
                "combat power {combat_power} below minimum {MIN_COMBAT_POWER}"
            )));
        }
        Ok(Self { user_id, combat_power })
    }
}

/// A player's live state inside a battle.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Combatant {
    /// The player.
    pub user_id: UserId,
    /// Combat power, fixed for the battle.
    pub combat_power: u32,
    /// Health, 0..=100.
    pub health: u32,
    /// Attack energy, 0..=20.
    pub energy: u32,
    /// Defense energy, 0..=15.
    pub defense_energy: u32,
}

impl Combatant {
    fn from_snapshot(snapshot: PlayerSnapshot) -> Self {
        Self {
            user_id: snapshot.user_id,
            combat_power: snapshot.combat_power,
            health: MAX_HEALTH,
            energy: 0,
            defense_energy: 0,
        }
    }

    fn side_state(&self) -> SideState {
        SideState {
            combat_power: self.combat_power,
            energy: self.energy,
            defense_energy: self.defense_energy,
        }
    }
}

/// Which seat a participant occupies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerSlot {
    /// Player 1.
    One,
    /// Player 2.
    Two,
}

impl PlayerSlot {
    /// The other seat.
    pub fn other(self) -> Self {
        match self {
            PlayerSlot::One => PlayerSlot::Two,
            PlayerSlot::Two => PlayerSlot::One,
        }
    }
}

/// Which energy pool an external top-up credits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnergyKind {
    /// Attack energy (cap 20).
    Attack,
    /// Defense energy (cap 15).
    Defense,
}

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Battle lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BattleStatus {
    /// Countdown before actions are accepted.
    Preparing,
    /// Rounds are being played.
    Ongoing,
    /// Terminal: winner decided or draw.
    Completed,
    /// Terminal: abandoned without rewards.
    Cancelled,
}

/// Why a battle reached a terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// A player's health reached 0.
    Knockout,
    /// Hard duration cap hit; higher health won.
    Timeout,
    /// Hard duration cap hit with equal health; no winner.
    TimeoutDraw,
    /// Explicitly cancelled.
    Cancelled,
}

/// One side of a resolved round, as appended to the round log.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RoundSide {
    /// Action taken.
    pub action: Action,
    /// Damage dealt to the opponent.
    pub damage_dealt: u32,
    /// Whether the attack was critical.
    pub was_critical: bool,
    /// Whether the attack was dodged.
    pub was_dodged: bool,
    /// Attack energy after the round.
    pub energy_after: u32,
    /// Defense energy after the round.
    pub defense_energy_after: u32,
    /// Health after the round.
    pub health_after: u32,
}

impl RoundSide {
    fn new(outcome: &SideOutcome, health_after: u32) -> Self {
        Self {
            action: outcome.action,
            damage_dealt: outcome.damage_dealt,
            was_critical: outcome.was_critical,
            was_dodged: outcome.was_dodged,
            energy_after: outcome.energy_after,
            defense_energy_after: outcome.defense_energy_after,
            health_after,
        }
    }
}

/// Immutable record of one resolved round.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RoundOutcome {
    /// 1-based round number.
    pub round: u32,
    /// Player 1's side of the exchange.
    pub p1: RoundSide,
    /// Player 2's side of the exchange.
    pub p2: RoundSide,
}

/// What `advance_round` decided after applying the outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundVerdict {
    /// Battle continues.
    Continue,
    /// A knockout ended the battle.
    Knockout {
        /// Winner, None on a simultaneous knockout with equal damage.
        winner: Option<UserId>,
    },
    /// The duration cap ended the battle.
    Timeout {
        /// Winner, None on equal health.
        winner: Option<UserId>,
    },
}

// =============================================================================
// BATTLE
// =============================================================================

/// The battle aggregate root.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Battle {
    /// Unique battle id.
    pub id: BattleId,
    /// Lifecycle status.
    pub status: BattleStatus,
    /// Player 1.
    pub player1: Combatant,
    /// Player 2.
    pub player2: Combatant,
    /// Rounds resolved so far; strictly increasing.
    pub round: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the battle turned ongoing.
    pub started_at: Option<DateTime<Utc>>,
    /// When the battle reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Winner, set only when completed (None = draw).
    pub winner_id: Option<UserId>,
    /// Why the battle ended.
    pub end_reason: Option<EndReason>,
    /// Free-text cancellation cause, when cancelled.
    pub cancel_reason: Option<String>,
    /// Append-only record of resolved rounds, for client replay.
    pub round_log: Vec<RoundOutcome>,
    /// Seed the battle's RNG was created from.
    pub rng_seed: u64,
    /// Combat roll source.
    #[serde(skip)]
    rng: DeterministicRng,
}

impl Battle {
    /// Create a battle in `Preparing` with both players at full health
    /// and zero energy. The RNG seed is derived from the battle id and
    /// both participants.
    pub fn new(
        id: BattleId,
        player1: PlayerSnapshot,
        player2: PlayerSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Self, EngineError> {
        if player1.user_id == player2.user_id {
            return Err(EngineError::Validation(
                "a battle needs two distinct players".to_string(),
            ));
        }

        let seed = derive_battle_seed(
            id.as_bytes(),
            &[*player1.user_id.as_bytes(), *player2.user_id.as_bytes()],
        );

        Ok(Self {
            id,
            status: BattleStatus::Preparing,
            player1: Combatant::from_snapshot(player1),
            player2: Combatant::from_snapshot(player2),
            round: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            winner_id: None,
            end_reason: None,
            cancel_reason: None,
            round_log: Vec::new(),
            rng_seed: seed,
            rng: DeterministicRng::new(seed),
        })
    }

    /// Transition `Preparing -> Ongoing` once the countdown elapses.
    pub fn begin(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.status != BattleStatus::Preparing {
            return Err(EngineError::InvalidState);
        }
        self.status = BattleStatus::Ongoing;
        self.started_at = Some(now);
        Ok(())
    }

    /// Which slot a user occupies, if any.
    pub fn participant_slot(&self, user_id: UserId) -> Option<PlayerSlot> {
        if self.player1.user_id == user_id {
            Some(PlayerSlot::One)
        } else if self.player2.user_id == user_id {
            Some(PlayerSlot::Two)
        } else {
            None
        }
    }

    /// The combatant in a slot.
    pub fn combatant(&self, slot: PlayerSlot) -> &Combatant {
        match slot {
            PlayerSlot::One => &self.player1,
            PlayerSlot::Two => &self.player2,
        }
    }

    fn combatant_mut(&mut self, slot: PlayerSlot) -> &mut Combatant {
        match slot {
            PlayerSlot::One => &mut self.player1,
            PlayerSlot::Two => &mut self.player2,
        }
    }

    /// Whether the battle reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, BattleStatus::Completed | BattleStatus::Cancelled)
    }

    /// Credit externally-earned energy to a participant.
    ///
    /// Valid only while ongoing; the pool saturates at its cap.
    pub fn add_energy(
        &mut self,
        user_id: UserId,
        kind: EnergyKind,
        amount: u32,
    ) -> Result<u32, EngineError> {
        if self.status != BattleStatus::Ongoing {
            return Err(EngineError::InvalidState);
        }
        let slot = self.participant_slot(user_id).ok_or(EngineError::UnknownPlayer)?;
        let combatant = self.combatant_mut(slot);
        let new_value = match kind {
            EnergyKind::Attack => {
                combatant.energy = (combatant.energy + amount).min(MAX_ENERGY);
                combatant.energy
            }
            EnergyKind::Defense => {
                combatant.defense_energy =
                    (combatant.defense_energy + amount).min(MAX_DEFENSE_ENERGY);
                combatant.defense_energy
            }
        };
        Ok(new_value)
    }

    /// Resolve one round with both players' inputs, apply the deltas,
    /// append the outcome, and run the termination check.
    ///
    /// A bare `Action` is a player-chosen input; the round timer passes
    /// `RoundInput::defaulted_attack()` for a missing submission.
    /// `battle_timeout` is the hard duration cap checked after the
    /// round applies.
    pub fn advance_round(
        &mut self,
        p1_input: impl Into<RoundInput>,
        p2_input: impl Into<RoundInput>,
        now: DateTime<Utc>,
        battle_timeout: Duration,
    ) -> Result<(RoundOutcome, RoundVerdict), EngineError> {
        if self.status != BattleStatus::Ongoing {
            return Err(EngineError::InvalidState);
        }

        let resolution = resolve_round(
            &self.player1.side_state(),
            &self.player2.side_state(),
            p1_input,
            p2_input,
            &mut self.rng,
        )?;

        let outcome = self.apply_resolution(&resolution);
        self.round = outcome.round;
        self.round_log.push(outcome);

        let verdict = self.termination_check(&resolution, now, battle_timeout);
        Ok((outcome, verdict))
    }

    fn apply_resolution(&mut self, resolution: &Resolution) -> RoundOutcome {
        self.player1.health = self.player1.health.saturating_sub(resolution.damage_to_p1());
        self.player2.health = self.player2.health.saturating_sub(resolution.damage_to_p2());

        self.player1.energy = resolution.p1.energy_after;
        self.player1.defense_energy = resolution.p1.defense_energy_after;
        self.player2.energy = resolution.p2.energy_after;
        self.player2.defense_energy = resolution.p2.defense_energy_after;

        RoundOutcome {
            round: self.round + 1,
            p1: RoundSide::new(&resolution.p1, self.player1.health),
            p2: RoundSide::new(&resolution.p2, self.player2.health),
        }
    }

    fn termination_check(
        &mut self,
        resolution: &Resolution,
        now: DateTime<Utc>,
        battle_timeout: Duration,
    ) -> RoundVerdict {
        let p1_down = self.player1.health == 0;
        let p2_down = self.player2.health == 0;

        if p1_down || p2_down {
            // Simultaneous knockout: whoever dealt more this round takes
            // it; equal damage is a draw.
            let winner = match (p1_down, p2_down) {
                (true, false) => Some(self.player2.user_id),
                (false, true) => Some(self.player1.user_id),
                _ => match resolution.p1.damage_dealt.cmp(&resolution.p2.damage_dealt) {
                    std::cmp::Ordering::Greater => Some(self.player1.user_id),
                    std::cmp::Ordering::Less => Some(self.player2.user_id),
                    std::cmp::Ordering::Equal => None,
                },
            };
            self.complete(winner, EndReason::Knockout, now);
            return RoundVerdict::Knockout { winner };
        }

        let elapsed_ms = self
            .started_at
            .map(|s| (now - s).num_milliseconds().max(0) as u128)
            .unwrap_or(0);
        if elapsed_ms >= battle_timeout.as_millis() {
            let verdict = self.force_timeout(now);
            if let RoundVerdict::Timeout { winner } = verdict {
                return RoundVerdict::Timeout { winner };
            }
        }

        RoundVerdict::Continue
    }

    /// Complete the battle under the duration-cap rule: higher current
    /// health wins, equal health is an explicit draw.
    pub fn force_timeout(&mut self, now: DateTime<Utc>) -> RoundVerdict {
        if self.is_terminal() {
            return RoundVerdict::Continue;
        }
        let (winner, reason) = match self.player1.health.cmp(&self.player2.health) {
            std::cmp::Ordering::Greater => (Some(self.player1.user_id), EndReason::Timeout),
            std::cmp::Ordering::Less => (Some(self.player2.user_id), EndReason::Timeout),
            std::cmp::Ordering::Equal => (None, EndReason::TimeoutDraw),
        };
        self.complete(winner, reason, now);
        RoundVerdict::Timeout { winner }
    }

    fn complete(&mut self, winner: Option<UserId>, reason: EndReason, now: DateTime<Utc>) {
        self.status = BattleStatus::Completed;
        self.winner_id = winner;
        self.end_reason = Some(reason);
        self.completed_at = Some(now);
    }

    /// Cancel from `Preparing` or `Ongoing`. No rewards are granted for
    /// a cancelled battle.
    pub fn cancel(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.is_terminal() {
            return Err(EngineError::InvalidState);
        }
        self.status = BattleStatus::Cancelled;
        self.end_reason = Some(EndReason::Cancelled);
        self.cancel_reason = Some(reason.to_string());
        self.completed_at = Some(now);
        Ok(())
    }

    /// The loser, when a completed battle has a winner.
    pub fn loser_id(&self) -> Option<UserId> {
        let winner = self.winner_id?;
        if winner == self.player1.user_id {
            Some(self.player2.user_id)
        } else {
            Some(self.player1.user_id)
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn players() -> (PlayerSnapshot, PlayerSnapshot) {
        (
            PlayerSnapshot::new(UserId::random(), 150).unwrap(),
            PlayerSnapshot::new(UserId::random(), 120).unwrap(),
        )
    }

    fn ongoing_battle() -> Battle {
        let (p1, p2) = players();
        let now = Utc::now();
        let mut battle = Battle::new(BattleId::random(), p1, p2, now).unwrap();
        battle.begin(now).unwrap();
        battle
    }

    const TIMEOUT: Duration = Duration::from_secs(600);

    #[test]
    fn test_new_battle_initial_state() {
        let (p1, p2) = players();
        let battle = Battle::new(BattleId::random(), p1, p2, Utc::now()).unwrap();

        assert_eq!(battle.status, BattleStatus::Preparing);
        assert_eq!(battle.round, 0);
        assert_eq!(battle.player1.health, 100);
        assert_eq!(battle.player2.health, 100);
        assert_eq!(battle.player1.energy, 0);
        assert_eq!(battle.player2.defense_energy, 0);
        assert!(battle.round_log.is_empty());
        assert!(battle.winner_id.is_none());
    }

    #[test]
    fn test_rejects_self_battle() {
        let uid = UserId::random();
        let p = PlayerSnapshot::new(uid, 150).unwrap();
        let result = Battle::new(BattleId::random(), p, p, Utc::now());
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_snapshot_rejects_weak_power() {
        assert!(matches!(
            PlayerSnapshot::new(UserId::random(), 99),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_advance_requires_ongoing() {
        let (p1, p2) = players();
        let mut battle = Battle::new(BattleId::random(), p1, p2, Utc::now()).unwrap();

        let result =
            battle.advance_round(Action::Attack, Action::Attack, Utc::now(), TIMEOUT);
        assert!(matches!(result, Err(EngineError::InvalidState)));
    }

    #[test]
    fn test_round_counter_strictly_increases() {
        let mut battle = ongoing_battle();
        let now = Utc::now();

        for expected in 1..=3u32 {
            if battle.is_terminal() {
                break;
            }
            let (outcome, _) = battle
                .advance_round(Action::Defend, Action::Defend, now, TIMEOUT)
                .unwrap();
            assert_eq!(outcome.round, expected);
            assert_eq!(battle.round, expected);
        }
        assert_eq!(battle.round_log.len(), battle.round as usize);
    }

    #[test]
    fn test_knockout_completes_with_opponent_winner() {
        let mut battle = ongoing_battle();
        let now = Utc::now();

        // Drive until someone drops; attack-only battles always finish.
        let mut verdict = RoundVerdict::Continue;
        for _ in 0..200 {
            let (_, v) = battle
                .advance_round(Action::Attack, Action::Attack, now, TIMEOUT)
                .unwrap();
            verdict = v;
            if battle.is_terminal() {
                break;
            }
        }

        assert_eq!(battle.status, BattleStatus::Completed);
        match verdict {
            RoundVerdict::Knockout { winner } => {
                if let Some(w) = winner {
                    let loser = battle.loser_id().unwrap();
                    let loser_slot = battle.participant_slot(loser).unwrap();
                    assert_eq!(battle.combatant(loser_slot).health, 0);
                    assert_ne!(w, loser);
                } else {
                    // Double knockout draw
                    assert_eq!(battle.player1.health, 0);
                    assert_eq!(battle.player2.health, 0);
                }
            }
            other => panic!("expected knockout, got {other:?}"),
        }

        // No further rounds accepted
        let result =
            battle.advance_round(Action::Attack, Action::Attack, now, TIMEOUT);
        assert!(matches!(result, Err(EngineError::InvalidState)));
    }

    #[test]
    fn test_timeout_higher_health_wins() {
        let mut battle = ongoing_battle();
        battle.player1.health = 60;
        battle.player2.health = 40;

        let verdict = battle.force_timeout(Utc::now());
        assert_eq!(battle.status, BattleStatus::Completed);
        assert_eq!(battle.end_reason, Some(EndReason::Timeout));
        assert_eq!(verdict, RoundVerdict::Timeout { winner: Some(battle.player1.user_id) });
        assert_eq!(battle.winner_id, Some(battle.player1.user_id));
        assert_eq!(battle.loser_id(), Some(battle.player2.user_id));
    }

    #[test]
    fn test_timeout_equal_health_is_draw() {
        let mut battle = ongoing_battle();
        battle.player1.health = 50;
        battle.player2.health = 50;

        let verdict = battle.force_timeout(Utc::now());
        assert_eq!(battle.status, BattleStatus::Completed);
        assert_eq!(battle.end_reason, Some(EndReason::TimeoutDraw));
        assert_eq!(verdict, RoundVerdict::Timeout { winner: None });
        assert!(battle.winner_id.is_none());
        assert!(battle.loser_id().is_none());
    }

    #[test]
    fn test_advance_past_deadline_times_out() {
        let mut battle = ongoing_battle();
        battle.player1.health = 80;
        battle.player2.health = 70;

        // A round resolved past the hard cap completes the battle.
        let later = battle.started_at.unwrap() + chrono::Duration::seconds(601);
        let (_, verdict) = battle
            .advance_round(Action::Defend, Action::Defend, later, TIMEOUT)
            .unwrap();

        assert!(matches!(verdict, RoundVerdict::Timeout { winner: Some(_) }));
        assert_eq!(battle.winner_id, Some(battle.player1.user_id));
    }

    #[test]
    fn test_both_defend_changes_nothing() {
        let mut battle = ongoing_battle();
        battle.player1.energy = 10;
        battle.player2.defense_energy = 5;
        let now = Utc::now();

        let (outcome, verdict) = battle
            .advance_round(Action::Defend, Action::Defend, now, TIMEOUT)
            .unwrap();

        assert_eq!(verdict, RoundVerdict::Continue);
        assert_eq!(outcome.p1.damage_dealt, 0);
        assert_eq!(outcome.p2.damage_dealt, 0);
        assert_eq!(battle.player1.health, 100);
        assert_eq!(battle.player2.health, 100);
        assert_eq!(battle.player1.energy, 10);
        assert_eq!(battle.player2.defense_energy, 5);
    }

    #[test]
    fn test_timer_default_preserves_banked_energy() {
        let mut battle = ongoing_battle();
        let uid = battle.player1.user_id;
        battle.add_energy(uid, EnergyKind::Attack, 20).unwrap();

        let (outcome, _) = battle
            .advance_round(
                RoundInput::defaulted_attack(),
                RoundInput::defaulted_attack(),
                Utc::now(),
                TIMEOUT,
            )
            .unwrap();

        // The stand-in attack neither drains nor benefits from the pool:
        // without the energy bonus damage caps at 6 * power * crit.
        assert_eq!(outcome.p1.action, Action::Attack);
        assert_eq!(outcome.p1.energy_after, 20);
        assert_eq!(battle.player1.energy, 20);
        assert!(outcome.p1.damage_dealt <= 12);
    }

    #[test]
    fn test_add_energy_caps() {
        let mut battle = ongoing_battle();
        let uid = battle.player1.user_id;

        assert_eq!(battle.add_energy(uid, EnergyKind::Attack, 12).unwrap(), 12);
        assert_eq!(battle.add_energy(uid, EnergyKind::Attack, 12).unwrap(), 20);
        assert_eq!(battle.add_energy(uid, EnergyKind::Defense, 99).unwrap(), 15);
    }

    #[test]
    fn test_add_energy_rejects_outsiders_and_wrong_state() {
        let mut battle = ongoing_battle();
        let stranger = UserId::random();
        assert!(matches!(
            battle.add_energy(stranger, EnergyKind::Attack, 5),
            Err(EngineError::UnknownPlayer)
        ));

        battle.cancel("test", Utc::now()).unwrap();
        let uid = battle.player1.user_id;
        assert!(matches!(
            battle.add_energy(uid, EnergyKind::Attack, 5),
            Err(EngineError::InvalidState)
        ));
    }

    #[test]
    fn test_cancel_only_from_live_states() {
        let mut battle = ongoing_battle();
        battle.cancel("disconnect", Utc::now()).unwrap();
        assert_eq!(battle.status, BattleStatus::Cancelled);
        assert_eq!(battle.end_reason, Some(EndReason::Cancelled));
        assert_eq!(battle.cancel_reason.as_deref(), Some("disconnect"));

        // Terminal battles cannot be re-cancelled
        assert!(matches!(
            battle.cancel("again", Utc::now()),
            Err(EngineError::InvalidState)
        ));
    }

    #[test]
    fn test_round_log_matches_seed_replay() {
        let (p1, p2) = players();
        let id = BattleId::random();
        let now = Utc::now();

        let run = |seq: &[(Action, Action)]| {
            let mut battle = Battle::new(id, p1, p2, now).unwrap();
            battle.begin(now).unwrap();
            for &(a1, a2) in seq {
                if battle.is_terminal() {
                    break;
                }
                battle.advance_round(a1, a2, now, TIMEOUT).unwrap();
            }
            battle
        };

        let seq = [
            (Action::Attack, Action::Defend),
            (Action::Attack, Action::Attack),
            (Action::Defend, Action::Attack),
        ];
        let a = run(&seq);
        let b = run(&seq);

        assert_eq!(a.round_log.len(), b.round_log.len());
        for (ra, rb) in a.round_log.iter().zip(&b.round_log) {
            assert_eq!(ra.p1.damage_dealt, rb.p1.damage_dealt);
            assert_eq!(ra.p2.damage_dealt, rb.p2.damage_dealt);
            assert_eq!(ra.p1.health_after, rb.p1.health_after);
        }
    }

    #[test]
    fn test_invariants_hold_under_random_actions() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0xB417);
        for _ in 0..50 {
            let mut battle = ongoing_battle();
            let now = Utc::now();
            let mut prev = (battle.player1.health, battle.player2.health);

            while !battle.is_terminal() && battle.round < 100 {
                if rng.gen_bool(0.3) {
                    let uid = if rng.gen_bool(0.5) {
                        battle.player1.user_id
                    } else {
                        battle.player2.user_id
                    };
                    let kind = if rng.gen_bool(0.5) { EnergyKind::Attack } else { EnergyKind::Defense };
                    battle.add_energy(uid, kind, rng.gen_range(1..=6)).unwrap();
                }
                let pick = |r: &mut StdRng| {
                    if r.gen_bool(0.6) { Action::Attack } else { Action::Defend }
                };
                let (a1, a2) = (pick(&mut rng), pick(&mut rng));
                battle.advance_round(a1, a2, now, TIMEOUT).unwrap();

                // Health never rises, pools never exceed their caps
                assert!(battle.player1.health <= prev.0);
                assert!(battle.player2.health <= prev.1);
                assert!(battle.player1.energy <= MAX_ENERGY);
                assert!(battle.player2.energy <= MAX_ENERGY);
                assert!(battle.player1.defense_energy <= MAX_DEFENSE_ENERGY);
                assert!(battle.player2.defense_energy <= MAX_DEFENSE_ENERGY);
                prev = (battle.player1.health, battle.player2.health);
            }
        }
    }

    #[test]
    fn test_power_advantage_wins_faster_on_average() {
        // Seed-controlled statistical check: CP 150 vs 100 should finish
        // in fewer mean rounds than a CP 100 mirror when both sides
        // attack every round.
        let mean_rounds = |cp1: u32, cp2: u32, trials: u64| -> f64 {
            let now = Utc::now();
            let mut total = 0u64;
            let mut p1_wins = 0u64;
            for i in 0..trials {
                let p1 = PlayerSnapshot::new(
                    UserId(uuid::Uuid::from_u64_pair(1, i + 1)),
                    cp1,
                )
                .unwrap();
                let p2 = PlayerSnapshot::new(
                    UserId(uuid::Uuid::from_u64_pair(2, i + 1)),
                    cp2,
                )
                .unwrap();
                let id = BattleId(uuid::Uuid::from_u64_pair(3, i + 1));
                let mut battle = Battle::new(id, p1, p2, now).unwrap();
                battle.begin(now).unwrap();
                while !battle.is_terminal() {
                    battle
                        .advance_round(Action::Attack, Action::Attack, now, TIMEOUT)
                        .unwrap();
                }
                total += battle.round as u64;
                if battle.winner_id == Some(battle.player1.user_id) {
                    p1_wins += 1;
                }
            }
            // The stronger side must win a clear majority
            if cp1 > cp2 {
                assert!(p1_wins * 3 > trials * 2, "p1 won only {p1_wins}/{trials}");
            }
            total as f64 / trials as f64
        };

        let strong = mean_rounds(150, 100, 300);
        let even = mean_rounds(100, 100, 300);
        assert!(
            strong < even,
            "power advantage should shorten battles: {strong} vs {even}"
        );
    }
}
