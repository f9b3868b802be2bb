//! Deterministic Random Number Generator
//!
//! Uses Xorshift128+ for fast, high-quality, deterministic randomness.
//! Every battle owns one RNG seeded from its id and participants, so a
//! battle's full round history can be replayed from the seed alone.

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

/// Deterministic PRNG using Xorshift128+ algorithm.
///
/// Given the same seed, produces the exact same sequence of combat rolls
/// on any platform.
///
/// # Example
///
/// ```
/// use arena_battle::core::rng::DeterministicRng;
///
/// let mut rng = DeterministicRng::new(12345);
/// let value = rng.next_u64();
/// assert_eq!(value, 6233086606872742541); // Always the same!
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: [u64; 2],
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DeterministicRng {
    /// Create a new RNG from a 64-bit seed.
    ///
    /// Uses SplitMix64 to initialize the internal state, ensuring
    /// good distribution even from weak seeds.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // Ensure state is never all zeros
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Generate the next 64-bit random value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Generate a random integer in range [0, max).
    #[inline]
    pub fn next_int(&mut self, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        // Simple modulo - slight bias for very large max, but acceptable
        (self.next_u64() % max as u64) as u32
    }

    /// Roll a chance expressed in tenths of a percent (0..=1000).
    ///
    /// `roll_permille(150)` succeeds 15% of the time. Combat chances are
    /// kept in integer permille so rolls stay reproducible per seed.
    #[inline]
    pub fn roll_permille(&mut self, chance: u32) -> bool {
        self.next_int(1000) < chance.min(1000)
    }

    /// Get current state (for checkpointing/debugging).
    pub fn state(&self) -> [u64; 2] {
        self.state
    }

    /// Restore from saved state.
    pub fn set_state(&mut self, state: [u64; 2]) {
        self.state = state;
    }
}

/// SplitMix64 for seed initialization.
/// Produces well-distributed values from sequential seeds.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Derive a battle seed from the battle id and its participants.
///
/// The participant ids are sorted internally so neither player's join
/// order influences the seed. The seed is reproducible after the battle
/// for round-log verification.
pub fn derive_battle_seed(battle_id: &[u8; 16], user_ids: &[[u8; 16]]) -> u64 {
    let mut hasher = Sha256::new();

    // Domain separator
    hasher.update(b"ARENA_BATTLE_SEED_V1");

    // Battle ID (unique per battle)
    hasher.update(battle_id);

    // Participant IDs (sorted for determinism)
    let mut sorted: Vec<[u8; 16]> = user_ids.to_vec();
    sorted.sort();
    for uid in &sorted {
        hasher.update(uid);
    }

    let hash = hasher.finalize();

    // Take first 8 bytes as seed
    u64::from_le_bytes(hash[0..8].try_into().unwrap())
}

// =============================================================================
// TESTS
// =============================================================================
