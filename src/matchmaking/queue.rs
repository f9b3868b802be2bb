//! Matchmaking Pool
//!
//! A continuously-evaluated pool of waiting players. The sweep pairs
//! entries whose combat powers fall inside each other's tolerance
//! windows, skipping recently-fought opponents, preferring the closest
//! power match and servicing the oldest waiter first.
//!
//! The pool itself is synchronous; the engine owns it behind a single
//! mutex (the queue's critical section) and drives the sweep from a
//! periodic task plus eagerly on each join.

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::core::ids::UserId;
use crate::error::EngineError;

/// Lowest accepted tolerance, percent.
pub const MIN_MATCH_RANGE: u32 = 10;
/// Highest accepted tolerance, percent.
pub const MAX_MATCH_RANGE: u32 = 50;
/// Tolerance step, percent.
pub const MATCH_RANGE_STEP: u32 = 5;

/// A waiting player's matchmaking record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueEntry {
    /// The waiting player.
    pub user_id: UserId,
    /// Combat power used for the tolerance check.
    pub combat_power: u32,
    /// This player's own tolerance window, percent (10-50, step 5).
    pub match_range_percent: u32,
    /// When the entry joined the pool.
    pub enqueued_at: DateTime<Utc>,
    /// Opponents fought recently, with the time of the last battle.
    pub excluded_opponents: BTreeMap<UserId, DateTime<Utc>>,
}

impl QueueEntry {
    /// Whether this entry's own tolerance accepts the other's power.
    fn accepts(&self, other_power: u32) -> bool {
        let diff = self.combat_power.abs_diff(other_power) as u64;
        // diff <= combat_power * range% without intermediate truncation
        diff * 100 <= self.combat_power as u64 * self.match_range_percent as u64
    }

    /// Whether this entry fought the other user within the cooldown.
    fn fought_recently(&self, other: UserId, now: DateTime<Utc>, cooldown: Duration) -> bool {
        match self.excluded_opponents.get(&other) {
            Some(last) => {
                let elapsed = (now - *last).num_milliseconds().max(0) as u128;
                elapsed < cooldown.as_millis()
            }
            None => false,
        }
    }
}

/// A matched pair removed from the pool.
#[derive(Clone, Debug)]
pub struct MatchedPair {
    /// Older waiter of the two.
    pub first: QueueEntry,
    /// Its counterpart.
    pub second: QueueEntry,
}

/// The pool of waiting players.
///
/// Mutated only under the queue's critical section.
#[derive(Debug, Default)]
pub struct MatchPool {
    entries: BTreeMap<UserId, QueueEntry>,
}

impl MatchPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a tolerance window: 10-50 percent in steps of 5.
    pub fn validate_range(match_range_percent: u32) -> Result<(), EngineError> {
        if !(MIN_MATCH_RANGE..=MAX_MATCH_RANGE).contains(&match_range_percent)
            || match_range_percent % MATCH_RANGE_STEP != 0
        {
            return Err(EngineError::Validation(format!(
                "match range {match_range_percent}% must be {MIN_MATCH_RANGE}-{MAX_MATCH_RANGE} in steps of {MATCH_RANGE_STEP}"
            )));
        }
        Ok(())
    }

    /// Add an entry. Rejects a user who is already waiting.
    pub fn join(&mut self, entry: QueueEntry) -> Result<(), EngineError> {
        Self::validate_range(entry.match_range_percent)?;
        if self.entries.contains_key(&entry.user_id) {
            return Err(EngineError::AlreadyQueued);
        }
        self.entries.insert(entry.user_id, entry);
        Ok(())
    }

    /// Remove an entry. Idempotent.
    pub fn leave(&mut self, user_id: UserId) -> bool {
        self.entries.remove(&user_id).is_some()
    }

    /// Return a previously-removed entry to the pool (aborted match).
    pub fn restore(&mut self, entry: QueueEntry) {
        self.entries.entry(entry.user_id).or_insert(entry);
    }

    /// Whether a user is waiting.
    pub fn contains(&self, user_id: UserId) -> bool {
        self.entries.contains_key(&user_id)
    }

    /// Number of waiting players.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 1-based wait position by enqueue time, if the user is waiting.
    pub fn position(&self, user_id: UserId) -> Option<usize> {
        let me = self.entries.get(&user_id)?;
        let ahead = self
            .entries
            .values()
            .filter(|e| {
                (e.enqueued_at, e.user_id) < (me.enqueued_at, me.user_id)
            })
            .count();
        Some(ahead + 1)
    }

    /// One matching sweep: greedily pair compatible entries and remove
    /// them from the pool.
    ///
    /// Entries are visited oldest-first to bound worst-case wait. For
    /// each entry, candidates must pass BOTH sides' own tolerance
    /// windows and the recently-fought exclusion in both directions;
    /// the closest power match wins, ties broken by earliest enqueue.
    pub fn sweep(&mut self, now: DateTime<Utc>, cooldown: Duration) -> Vec<MatchedPair> {
        let mut pairs = Vec::new();

        loop {
            // Oldest unmatched entry first
            let mut order: Vec<(DateTime<Utc>, UserId)> = self
                .entries
                .values()
                .map(|e| (e.enqueued_at, e.user_id))
                .collect();
            order.sort();

            let mut matched = None;
            'outer: for &(_, seeker_id) in &order {
                let seeker = &self.entries[&seeker_id];

                let mut best: Option<(u32, DateTime<Utc>, UserId)> = None;
                for candidate in self.entries.values() {
                    if candidate.user_id == seeker_id {
                        continue;
                    }
                    if !seeker.accepts(candidate.combat_power)
                        || !candidate.accepts(seeker.combat_power)
                    {
                        continue;
                    }
                    if seeker.fought_recently(candidate.user_id, now, cooldown)
                        || candidate.fought_recently(seeker_id, now, cooldown)
                    {
                        continue;
                    }
                    let distance = seeker.combat_power.abs_diff(candidate.combat_power);
                    let key = (distance, candidate.enqueued_at, candidate.user_id);
                    if best.map(|b| key < b).unwrap_or(true) {
                        best = Some(key);
                    }
                }

                if let Some((_, _, candidate_id)) = best {
                    matched = Some((seeker_id, candidate_id));
                    break 'outer;
                }
            }

            match matched {
                Some((a, b)) => {
                    // Both removed atomically under the pool's critical section
                    let first = self.entries.remove(&a).expect("seeker present");
                    let second = self.entries.remove(&b).expect("candidate present");
                    pairs.push(MatchedPair { first, second });
                }
                None => break,
            }
        }

        pairs
    }
}

// =============================================================================
// TESTS
// =============================================================================
