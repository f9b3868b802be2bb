//! Round Resolution
//!
//! Pure, deterministic-given-seed resolution of one simultaneous round.
//! Both players' actions are resolved against each other in the same
//! tick: a defender deals no damage but reduces what it takes.
//!
//! All randomness comes from the battle's [`DeterministicRng`], drawn in
//! a fixed order (player 1's strike, then player 2's) so a round log can
//! be replayed from the battle seed.

use serde::{Serialize, Deserialize};

use crate::core::rng::DeterministicRng;
use crate::error::EngineError;

/// Maximum health pool.
pub const MAX_HEALTH: u32 = 100;
/// Attack energy bound.
pub const MAX_ENERGY: u32 = 20;
/// Defense energy bound.
pub const MAX_DEFENSE_ENERGY: u32 = 15;
/// Minimum combat power a snapshot may carry.
pub const MIN_COMBAT_POWER: u32 = 100;

/// Critical hit chance, permille.
const CRIT_CHANCE: u32 = 150;
/// Base dodge chance when defending, permille.
const DODGE_BASE: u32 = 100;
/// Dodge chance lost per point of defense energy, permille (0.5%).
const DODGE_PENALTY_PER_DEFENSE: u32 = 5;
/// Dodge chance never drops below this, permille.
const DODGE_FLOOR: u32 = 20;
/// Attack energy consumed per attack.
const ATTACK_ENERGY_COST: u32 = 5;
/// Defense energy consumed when a defend actually reduces a hit.
const BLOCK_DEFENSE_COST: u32 = 2;

/// A player's chosen action for one round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Deal damage; consumes 5 energy.
    Attack,
    /// Deal nothing; reduce incoming damage and maybe dodge.
    Defend,
}

/// One side's input to round resolution: the action plus whether the
/// player chose it or the round timer supplied it. A defaulted attack
/// carries no energy bonus and spends no energy, so an absent player
/// neither benefits from nor drains a banked pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundInput {
    /// The action to resolve.
    pub action: Action,
    /// True when the round timer supplied the action.
    pub defaulted: bool,
}

impl RoundInput {
    /// A player-chosen action.
    pub fn chosen(action: Action) -> Self {
        Self { action, defaulted: false }
    }

    /// The timer's stand-in for a missing submission.
    pub fn defaulted_attack() -> Self {
        Self { action: Action::Attack, defaulted: true }
    }
}

impl From<Action> for RoundInput {
    fn from(action: Action) -> Self {
        Self::chosen(action)
    }
}

/// Combat-relevant state of one side entering the round.
#[derive(Clone, Copy, Debug)]
pub struct SideState {
    /// Matchmaking strength rating; biases the damage ratio.
    pub combat_power: u32,
    /// Attack energy, 0..=20.
    pub energy: u32,
    /// Defense energy, 0..=15.
    pub defense_energy: u32,
}

/// One side's view of a resolved round.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SideOutcome {
    /// Action this side took.
    pub action: Action,
    /// Damage this side dealt to the opponent.
    pub damage_dealt: u32,
    /// This side's attack landed a critical hit.
    pub was_critical: bool,
    /// This side's attack was dodged by the opponent.
    pub was_dodged: bool,
    /// Attack energy after the round.
    pub energy_after: u32,
    /// Defense energy after the round.
    pub defense_energy_after: u32,
}

/// Outcome of one simultaneous round.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Resolution {
    /// Player 1's strike and energy accounting.
    pub p1: SideOutcome,
    /// Player 2's strike and energy accounting.
    pub p2: SideOutcome,
}

impl Resolution {
    /// Damage arriving at player 1.
    #[inline]
    pub fn damage_to_p1(&self) -> u32 {
        self.p2.damage_dealt
    }

    /// Damage arriving at player 2.
    #[inline]
    pub fn damage_to_p2(&self) -> u32 {
        self.p1.damage_dealt
    }
}

/// One directed strike before energy accounting.
struct Strike {
    damage: u32,
    critical: bool,
    dodged: bool,
    /// Whether the defender's defend actually reduced a hit.
    blocked: bool,
}

/// Resolve a single simultaneous round.
///
/// Returns per-side damage, crit/dodge flags, and post-round energies.
/// Fails with `Validation` when any input is out of range; there are no
/// other failure modes.
pub fn resolve_round(
    p1: &SideState,
    p2: &SideState,
    p1_input: impl Into<RoundInput>,
    p2_input: impl Into<RoundInput>,
    rng: &mut DeterministicRng,
) -> Result<Resolution, EngineError> {
    let i1 = p1_input.into();
    let i2 = p2_input.into();
    validate_side(p1, "player1")?;
    validate_side(p2, "player2")?;

    // Fixed draw order: player 1's strike first.
    let strike1 = resolve_strike(p1, p2, i1, i2.action, rng);
    let strike2 = resolve_strike(p2, p1, i2, i1.action, rng);

    Ok(Resolution {
        p1: side_outcome(p1, i1, &strike1, &strike2),
        p2: side_outcome(p2, i2, &strike2, &strike1),
    })
}

fn validate_side(side: &SideState, label: &str) -> Result<(), EngineError> {
    if side.energy > MAX_ENERGY {
        return Err(EngineError::Validation(format!(
            "{label} energy {} exceeds {}",
            side.energy, MAX_ENERGY
        )));
    }
    if side.defense_energy > MAX_DEFENSE_ENERGY {
        return Err(EngineError::Validation(format!(
            "{label} defense energy {} exceeds {}",
            side.defense_energy, MAX_DEFENSE_ENERGY
        )));
    }
    if side.combat_power < MIN_COMBAT_POWER {
        return Err(EngineError::Validation(format!(
            "{label} combat power {} below minimum {}",
            side.combat_power, MIN_COMBAT_POWER
        )));
    }
    Ok(())
}

/// Resolve one directed strike: attacker's action against the defender.
fn resolve_strike(
    attacker: &SideState,
    defender: &SideState,
    attacker_input: RoundInput,
    defender_action: Action,
    rng: &mut DeterministicRng,
) -> Strike {
    if attacker_input.action == Action::Defend {
        // Defenders deal nothing and draw nothing.
        return Strike { damage: 0, critical: false, dodged: false, blocked: false };
    }

    let critical = rng.roll_permille(CRIT_CHANCE);
    let base = 4 + rng.next_int(3);

    if defender_action == Action::Defend {
        let dodge_chance = DODGE_BASE
            .saturating_sub(defender.defense_energy * DODGE_PENALTY_PER_DEFENSE)
            .max(DODGE_FLOOR);
        if rng.roll_permille(dodge_chance) {
            return Strike { damage: 0, critical, dodged: true, blocked: false };
        }
    }

    // A defaulted attack carries no banked-energy bonus.
    let energy_mult = if attacker_input.defaulted {
        1.0
    } else {
        (1.0 + attacker.energy as f64 * 0.15).min(2.0)
    };
    let power_mult = 0.5
        + attacker.combat_power as f64
            / (attacker.combat_power as f64 + defender.combat_power as f64);

    let mut damage = base as f64 * energy_mult * power_mult;

    let blocked = defender_action == Action::Defend;
    if blocked {
        // Attack into a defend lands at 60%, then the defend's own
        // reduction applies on top.
        damage *= 0.6;
        let reduction = (0.5 - defender.defense_energy as f64 * 0.1).max(0.1);
        damage *= reduction;
    }

    if critical {
        damage *= 2.0;
    }

    Strike {
        damage: damage.floor() as u32,
        critical,
        dodged: false,
        blocked,
    }
}

/// Post-round energy accounting for one side.
///
/// `own_strike` is this side's outgoing strike; `incoming` is the
/// opponent's strike against this side.
fn side_outcome(
    side: &SideState,
    input: RoundInput,
    own_strike: &Strike,
    incoming: &Strike,
) -> SideOutcome {
    // A defaulted attack spends nothing: the absent player's pool is
    // never drained on their behalf.
    let energy_after = match input.action {
        Action::Attack if !input.defaulted => side.energy.saturating_sub(ATTACK_ENERGY_COST),
        _ => side.energy,
    };

    // Defense energy is only spent when the defend actually reduced a
    // hit. A dodge avoids the hit entirely and costs nothing.
    let defense_energy_after = if incoming.blocked && incoming.damage > 0 {
        side.defense_energy.saturating_sub(BLOCK_DEFENSE_COST)
    } else {
        side.defense_energy
    };

    SideOutcome {
        action: input.action,
        damage_dealt: own_strike.damage,
        was_critical: own_strike.critical,
        was_dodged: own_strike.dodged,
        energy_after,
        defense_energy_after,
    }
}

// =============================================================================
// TESTS
// =============================================================================
