//! Battle Engine
//!
//! The orchestrator: owns the battle registry, the matchmaking pool,
//! the invitation book, and the background timers, and wires combat
//! resolution to the realtime broadcaster and the reward ledger.
//!
//! Concurrency model: every battle lives behind its own
//! `tokio::sync::Mutex<BattleCell>` (state machine + action intake).
//! The two players and the round timer race into that critical section;
//! whichever closes the round does the advance, publishes the outcome,
//! and re-arms the timer before releasing the lock, so per-battle event
//! order is causal and each round resolves exactly once.

pub mod broadcast;
pub mod ledger;

pub use broadcast::{Broadcaster, ChannelKey, InMemoryChannel, RealtimeChannel};
pub use ledger::{BattleOutcome, DailyBattleCount, InMemoryLedger, RewardLedger, Tier};

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::battle::events::BattleEvent;
use crate::battle::intake::{lock_with_retry, RoundIntake, SubmitOutcome};
use crate::battle::state::{
    Battle, BattleStatus, EndReason, EnergyKind, PlayerSnapshot, RoundVerdict,
};
use crate::combat::resolver::Action;
use crate::config::EngineConfig;
use crate::core::ids::{BattleId, InviteId, UserId};
use crate::error::EngineError;
use crate::matchmaking::invite::InviteBook;
use crate::matchmaking::queue::{MatchPool, MatchedPair, QueueEntry};

/// Unanswered challenges expire after this long.
const INVITE_TTL: Duration = Duration::from_secs(300);

/// One battle's critical section: the state machine, the round's
/// action buffer, and the battle's scheduled timers. Never accessible
/// outside its mutex.
struct BattleCell {
    battle: Battle,
    intake: RoundIntake,
    /// Round timer armed for the generation currently collecting.
    round_timer: Option<AbortHandle>,
    /// The battle's duration-cap task.
    watchdog: Option<AbortHandle>,
}

impl BattleCell {
    /// Abort the battle's scheduled timers on a terminal transition so
    /// no task stays parked against a finished battle.
    fn abort_timers(&mut self) {
        for handle in [self.round_timer.take(), self.watchdog.take()].into_iter().flatten() {
            abort_unless_current(handle);
        }
    }
}

/// Abort a timer task unless it is the task running right now: a timer
/// that is itself completing the battle must not cancel its own
/// follow-up work.
fn abort_unless_current(handle: AbortHandle) {
    if tokio::task::try_id() != Some(handle.id()) {
        handle.abort();
    }
}

type SharedCell = Arc<Mutex<BattleCell>>;

/// What a caller learns from submitting an action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionReceipt {
    /// Buffered; waiting for the opponent or the round timer.
    Accepted,
    /// The submission completed the pair and the round resolved.
    RoundResolved,
    /// Same seat already submitted this round. Idempotent success.
    Duplicate,
    /// The round had already resolved; the submission was ignored.
    Superseded,
}

/// A waiting player's view of the queue.
#[derive(Clone, Copy, Debug)]
pub struct QueueStatus {
    /// 1-based position by enqueue time.
    pub position: usize,
    /// Total players waiting.
    pub waiting: usize,
}

/// Deferred work for a battle that just reached a terminal state.
///
/// Built inside the critical section, executed after it is released so
/// reward-grant retries never hold a battle lock.
struct Completion {
    battle_id: BattleId,
    players: [UserId; 2],
    winner_id: Option<UserId>,
    loser_id: Option<UserId>,
    cancelled: bool,
}

// =============================================================================
// ENGINE
// =============================================================================

/// The battle engine.
///
/// Generic over the two collaborator boundaries so tests and the demo
/// binary run fully in-memory.
pub struct BattleEngine<L, C> {
    config: EngineConfig,
    ledger: Arc<L>,
    broadcaster: Broadcaster<C>,
    /// Back-reference for the timer tasks the engine spawns on itself.
    self_ref: Weak<Self>,
    /// Battle registry. The outer lock is held only to look up or
    /// insert cells, never across a cell's critical section.
    battles: RwLock<BTreeMap<BattleId, SharedCell>>,
    /// Active battle per user; one at a time.
    active: RwLock<BTreeMap<UserId, BattleId>>,
    pool: Mutex<MatchPool>,
    invites: Mutex<InviteBook>,
    /// Last completed-battle time per opponent pair, both directions.
    recent: Mutex<BTreeMap<UserId, BTreeMap<UserId, DateTime<Utc>>>>,
}

impl<L, C> BattleEngine<L, C>
where
    L: RewardLedger + 'static,
    C: RealtimeChannel + 'static,
{
    /// Create an engine over the given collaborators.
    pub fn new(config: EngineConfig, ledger: Arc<L>, channel: Arc<C>) -> Arc<Self> {
        let broadcaster = Broadcaster::new(channel, config.publish_retries);
        Arc::new_cyclic(|self_ref| Self {
            config,
            ledger,
            broadcaster,
            self_ref: self_ref.clone(),
            battles: RwLock::new(BTreeMap::new()),
            active: RwLock::new(BTreeMap::new()),
            pool: Mutex::new(MatchPool::new()),
            invites: Mutex::new(InviteBook::new()),
            recent: Mutex::new(BTreeMap::new()),
        })
    }

    /// The owning `Arc`, for handing to spawned tasks. The engine is
    /// only reachable through its `Arc`, so the upgrade cannot fail.
    fn strong(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("engine accessed through its Arc")
    }

    /// Spawn the periodic maintenance task: queue sweeps, invite
    /// expiry, and reaping of finished battles past their retention.
    pub fn start_maintenance(&self) -> tokio::task::JoinHandle<()> {
        let engine = self.strong();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.queue_sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                engine.sweep_queue().await;
                engine.expire_invites().await;
                engine.reap_finished_battles().await;
            }
        })
    }

    // =========================================================================
    // MATCHMAKING
    // =========================================================================

    /// Enter the matchmaking pool.
    ///
    /// Rejected when the user is already queued, already in a battle,
    /// or out of daily battles. A successful join triggers an immediate
    /// sweep so two compatible players never wait for the next tick.
    pub async fn join_queue(
        &self,
        user_id: UserId,
        combat_power: u32,
        match_range_percent: u32,
    ) -> Result<(), EngineError> {
        // Validates the power floor
        PlayerSnapshot::new(user_id, combat_power)?;
        MatchPool::validate_range(match_range_percent)?;

        if self.active.read().await.contains_key(&user_id) {
            return Err(EngineError::AlreadyInBattle);
        }
        self.check_daily_limit(user_id)?;

        let excluded = self
            .recent
            .lock()
            .await
            .get(&user_id)
            .cloned()
            .unwrap_or_default();

        let waiting = {
            let mut pool = self.pool.lock().await;
            pool.join(QueueEntry {
                user_id,
                combat_power,
                match_range_percent,
                enqueued_at: Utc::now(),
                excluded_opponents: excluded,
            })?;
            pool.len()
        };

        info!(%user_id, combat_power, match_range_percent, waiting, "joined matchmaking queue");
        self.broadcaster
            .publish(
                &[ChannelKey::BattleQueue],
                &BattleEvent::QueueStatusChanged { waiting },
            )
            .await;

        self.sweep_queue().await;
        Ok(())
    }

    /// Leave the matchmaking pool. Idempotent; returns whether an
    /// entry was actually removed.
    pub async fn leave_queue(&self, user_id: UserId) -> bool {
        let (removed, waiting) = {
            let mut pool = self.pool.lock().await;
            (pool.leave(user_id), pool.len())
        };
        if removed {
            info!(%user_id, waiting, "left matchmaking queue");
            self.broadcaster
                .publish(
                    &[ChannelKey::BattleQueue],
                    &BattleEvent::QueueStatusChanged { waiting },
                )
                .await;
        }
        removed
    }

    /// The caller's queue position, if queued.
    pub async fn queue_status(&self, user_id: UserId) -> Option<QueueStatus> {
        let pool = self.pool.lock().await;
        pool.position(user_id)
            .map(|position| QueueStatus { position, waiting: pool.len() })
    }

    /// Run one matching sweep and start a battle per matched pair.
    pub async fn sweep_queue(&self) {
        let pairs = {
            let mut pool = self.pool.lock().await;
            pool.sweep(Utc::now(), self.config.recent_opponent_cooldown)
        };
        if pairs.is_empty() {
            return;
        }

        for pair in pairs {
            match self.start_matched_battle(&pair).await {
                Ok(battle_id) => {
                    info!(
                        %battle_id,
                        player1 = %pair.first.user_id,
                        player2 = %pair.second.user_id,
                        "matched pair from queue"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "matched pair could not start a battle");
                    // Return whoever is still eligible to the pool
                    let active = self.active.read().await;
                    let mut pool = self.pool.lock().await;
                    for entry in [pair.first, pair.second] {
                        if !active.contains_key(&entry.user_id) {
                            pool.restore(entry);
                        }
                    }
                }
            }
        }

        let waiting = self.pool.lock().await.len();
        self.broadcaster
            .publish(
                &[ChannelKey::BattleQueue],
                &BattleEvent::QueueStatusChanged { waiting },
            )
            .await;
    }

    async fn start_matched_battle(
        &self,
        pair: &MatchedPair,
    ) -> Result<BattleId, EngineError> {
        let p1 = PlayerSnapshot::new(pair.first.user_id, pair.first.combat_power)?;
        let p2 = PlayerSnapshot::new(pair.second.user_id, pair.second.combat_power)?;
        self.create_battle(p1, p2).await
    }

    // =========================================================================
    // DIRECT CHALLENGES
    // =========================================================================

    /// Issue a direct challenge to another player.
    pub async fn challenge(
        &self,
        from: UserId,
        from_combat_power: u32,
        to: UserId,
    ) -> Result<InviteId, EngineError> {
        PlayerSnapshot::new(from, from_combat_power)?;
        if self.active.read().await.contains_key(&from) {
            return Err(EngineError::AlreadyInBattle);
        }
        self.check_daily_limit(from)?;

        let invitation = self
            .invites
            .lock()
            .await
            .create(from, from_combat_power, to, Utc::now())?;

        info!(invite_id = %invitation.id, %from, %to, "challenge issued");
        self.broadcaster
            .publish(
                &[ChannelKey::User(from), ChannelKey::User(to)],
                &BattleEvent::InvitationCreated { invite_id: invitation.id, from, to },
            )
            .await;
        Ok(invitation.id)
    }

    /// Accept a pending challenge and start the battle.
    ///
    /// The invitation is consumed even if battle creation then fails;
    /// the challenger can simply challenge again.
    pub async fn accept_invite(
        &self,
        invite_id: InviteId,
        user: UserId,
        combat_power: u32,
    ) -> Result<BattleId, EngineError> {
        let p2 = PlayerSnapshot::new(user, combat_power)?;
        let invitation = self.invites.lock().await.accept(invite_id, user)?;
        let p1 = PlayerSnapshot::new(invitation.from, invitation.from_combat_power)?;

        let battle_id = self.create_battle(p1, p2).await?;
        self.broadcaster
            .publish(
                &[ChannelKey::User(invitation.from), ChannelKey::User(user)],
                &BattleEvent::InvitationAccepted {
                    invite_id,
                    from: invitation.from,
                    to: user,
                    battle_id,
                },
            )
            .await;
        Ok(battle_id)
    }

    /// Reject (or, as the challenger, withdraw) a pending challenge.
    pub async fn reject_invite(
        &self,
        invite_id: InviteId,
        user: UserId,
    ) -> Result<(), EngineError> {
        let invitation = self.invites.lock().await.reject(invite_id, user)?;
        info!(%invite_id, %user, "challenge rejected");
        self.broadcaster
            .publish(
                &[ChannelKey::User(invitation.from), ChannelKey::User(invitation.to)],
                &BattleEvent::InvitationRejected {
                    invite_id,
                    from: invitation.from,
                    to: invitation.to,
                },
            )
            .await;
        Ok(())
    }

    async fn expire_invites(&self) {
        let expired = self.invites.lock().await.expire(Utc::now(), INVITE_TTL);
        for invitation in expired {
            debug!(invite_id = %invitation.id, "challenge expired unanswered");
            self.broadcaster
                .publish(
                    &[ChannelKey::User(invitation.from), ChannelKey::User(invitation.to)],
                    &BattleEvent::InvitationRejected {
                        invite_id: invitation.id,
                        from: invitation.from,
                        to: invitation.to,
                    },
                )
                .await;
        }
    }

    // =========================================================================
    // BATTLE LIFECYCLE
    // =========================================================================

    /// Create a battle in `Preparing` and start its countdown.
    pub async fn create_battle(
        &self,
        p1: PlayerSnapshot,
        p2: PlayerSnapshot,
    ) -> Result<BattleId, EngineError> {
        self.check_daily_limit(p1.user_id)?;
        self.check_daily_limit(p2.user_id)?;

        let battle = Battle::new(BattleId::random(), p1, p2, Utc::now())?;
        let battle_id = battle.id;

        {
            // Check-and-claim under one write lock so two concurrent
            // creations cannot both claim the same player
            let mut active = self.active.write().await;
            if active.contains_key(&p1.user_id) || active.contains_key(&p2.user_id) {
                return Err(EngineError::AlreadyInBattle);
            }
            active.insert(p1.user_id, battle_id);
            active.insert(p2.user_id, battle_id);
        }
        {
            // A challenged player may also be waiting in the queue
            let mut pool = self.pool.lock().await;
            pool.leave(p1.user_id);
            pool.leave(p2.user_id);
        }

        let cell = Arc::new(Mutex::new(BattleCell {
            battle,
            intake: RoundIntake::new(),
            round_timer: None,
            watchdog: None,
        }));
        self.battles.write().await.insert(battle_id, cell);

        if let Err(e) = self.ledger.record_battle_start([p1.user_id, p2.user_id]) {
            warn!(%battle_id, error = %e, "could not record battle start in ledger");
        }

        info!(%battle_id, player1 = %p1.user_id, player2 = %p2.user_id, "battle created");
        self.broadcaster
            .publish(
                &[
                    ChannelKey::User(p1.user_id),
                    ChannelKey::User(p2.user_id),
                    ChannelKey::BattleStats,
                ],
                &BattleEvent::BattleCreated {
                    battle_id,
                    player1: p1.user_id,
                    player2: p2.user_id,
                    countdown_ms: self.config.countdown.as_millis() as u64,
                },
            )
            .await;

        let engine = self.strong();
        tokio::spawn(async move { engine.run_countdown(battle_id).await });
        Ok(battle_id)
    }

    async fn run_countdown(self: Arc<Self>, battle_id: BattleId) {
        sleep(self.config.countdown).await;
        let Some(cell) = self.cell(battle_id).await else { return };
        let mut guard = match lock_with_retry(&cell, &self.config).await {
            Ok(guard) => guard,
            Err(e) => {
                error!(%battle_id, error = %e, "countdown could not acquire battle lock");
                return;
            }
        };

        // Cancelled during the countdown
        if guard.battle.is_terminal() {
            return;
        }
        if let Err(e) = guard.battle.begin(Utc::now()) {
            warn!(%battle_id, error = %e, "battle could not begin");
            return;
        }

        let channels = Self::participant_channels(&guard.battle);
        info!(%battle_id, "battle started");
        self.broadcaster
            .publish(
                &channels,
                &BattleEvent::BattleStarted {
                    battle_id,
                    round_interval_ms: self.config.round_interval.as_millis() as u64,
                },
            )
            .await;

        self.spawn_round_timer(&mut guard, battle_id);
        let engine = Arc::clone(&self);
        let watchdog = tokio::spawn(async move { engine.fire_battle_watchdog(battle_id).await });
        guard.watchdog = Some(watchdog.abort_handle());
    }

    /// Submit an action for the current round.
    ///
    /// `round` optionally pins the submission to a specific round; a
    /// round that already resolved yields `Superseded`, not an error.
    pub async fn submit_action(
        &self,
        battle_id: BattleId,
        user_id: UserId,
        action: Action,
        round: Option<u32>,
    ) -> Result<ActionReceipt, EngineError> {
        let cell = self.cell(battle_id).await.ok_or(EngineError::UnknownBattle)?;
        let mut guard = lock_with_retry(&cell, &self.config).await?;

        if guard.battle.status != BattleStatus::Ongoing {
            return Err(EngineError::InvalidState);
        }
        let slot = guard
            .battle
            .participant_slot(user_id)
            .ok_or(EngineError::UnknownPlayer)?;

        match guard.intake.submit(slot, action, round, Utc::now())? {
            SubmitOutcome::Duplicate => {
                debug!(%battle_id, %user_id, "duplicate action absorbed");
                Ok(ActionReceipt::Duplicate)
            }
            SubmitOutcome::Superseded => Ok(ActionReceipt::Superseded),
            SubmitOutcome::Accepted { both_present: false } => {
                debug!(%battle_id, %user_id, ?action, "action buffered");
                Ok(ActionReceipt::Accepted)
            }
            SubmitOutcome::Accepted { both_present: true } => {
                let completion = self.resolve_current_round(&mut guard, battle_id).await;
                drop(guard);
                if let Some(completion) = completion {
                    self.finalize(completion).await;
                }
                Ok(ActionReceipt::RoundResolved)
            }
        }
    }

    /// Credit externally-earned energy to a battle participant.
    pub async fn add_energy(
        &self,
        battle_id: BattleId,
        user_id: UserId,
        kind: EnergyKind,
        amount: u32,
    ) -> Result<u32, EngineError> {
        if amount == 0 {
            return Err(EngineError::Validation("energy amount must be positive".to_string()));
        }
        let cell = self.cell(battle_id).await.ok_or(EngineError::UnknownBattle)?;
        let mut guard = lock_with_retry(&cell, &self.config).await?;
        let new_value = guard.battle.add_energy(user_id, kind, amount)?;
        debug!(%battle_id, %user_id, ?kind, amount, new_value, "energy credited");
        Ok(new_value)
    }

    /// Cancel a live battle. No rewards are granted.
    pub async fn cancel_battle(
        &self,
        battle_id: BattleId,
        reason: &str,
    ) -> Result<(), EngineError> {
        let cell = self.cell(battle_id).await.ok_or(EngineError::UnknownBattle)?;
        let mut guard = lock_with_retry(&cell, &self.config).await?;
        guard.battle.cancel(reason, Utc::now())?;
        guard.intake.discard();
        guard.abort_timers();

        let channels = Self::participant_channels(&guard.battle);
        info!(%battle_id, reason, "battle cancelled");
        self.broadcaster
            .publish(
                &channels,
                &BattleEvent::BattleCancelled { battle_id, reason: reason.to_string() },
            )
            .await;

        let completion = Completion {
            battle_id,
            players: [guard.battle.player1.user_id, guard.battle.player2.user_id],
            winner_id: None,
            loser_id: None,
            cancelled: true,
        };
        drop(guard);
        self.finalize(completion).await;
        Ok(())
    }

    // =========================================================================
    // READ SIDE
    // =========================================================================

    /// Snapshot of a battle, including its round log.
    pub async fn battle(&self, battle_id: BattleId) -> Option<Battle> {
        let cell = self.cell(battle_id).await?;
        let guard = cell.lock().await;
        Some(guard.battle.clone())
    }

    /// The caller's active battle, if any.
    pub async fn current_battle(&self, user_id: UserId) -> Option<Battle> {
        let battle_id = *self.active.read().await.get(&user_id)?;
        self.battle(battle_id).await
    }

    /// Finished battles still within the retention window that the
    /// user took part in, oldest first.
    pub async fn battle_history(&self, user_id: UserId) -> Vec<Battle> {
        // Clone the cells out first: a contended cell must never be
        // awaited while the registry read lock is held, or it would
        // stall every registry writer behind this read.
        let cells: Vec<SharedCell> = self.battles.read().await.values().cloned().collect();
        let mut history = Vec::new();
        for cell in cells {
            let guard = cell.lock().await;
            if guard.battle.is_terminal() && guard.battle.participant_slot(user_id).is_some() {
                history.push(guard.battle.clone());
            }
        }
        history.sort_by_key(|b| b.completed_at);
        history
    }

    async fn cell(&self, battle_id: BattleId) -> Option<SharedCell> {
        self.battles.read().await.get(&battle_id).cloned()
    }

    // =========================================================================
    // ROUND RESOLUTION & TIMERS
    // =========================================================================

    /// Close the collecting round and advance the state machine. Runs
    /// inside the battle's critical section; `RoundResolved` (and, on a
    /// terminal verdict, `BattleCompleted`) are published before the
    /// lock is released so per-battle order stays causal.
    async fn resolve_current_round(
        &self,
        cell: &mut BattleCell,
        battle_id: BattleId,
    ) -> Option<Completion> {
        let round = cell.intake.current_round();
        let (a1, a2) = cell.intake.close_round();

        let (outcome, verdict) =
            match cell.battle.advance_round(a1, a2, Utc::now(), self.config.battle_timeout) {
                Ok(result) => result,
                Err(e) => {
                    error!(%battle_id, round, error = %e, "round resolution failed");
                    return None;
                }
            };

        debug!(%battle_id, round, ?verdict, "round resolved");
        let channels = Self::participant_channels(&cell.battle);
        self.broadcaster
            .publish(&channels, &BattleEvent::RoundResolved { battle_id, outcome })
            .await;

        match verdict {
            RoundVerdict::Continue => {
                self.spawn_round_timer(cell, battle_id);
                None
            }
            RoundVerdict::Knockout { .. } | RoundVerdict::Timeout { .. } => {
                Some(self.complete_locked(cell, battle_id).await)
            }
        }
    }

    /// Publish completion and build the deferred follow-up. Must be
    /// called with the battle already in `Completed`.
    async fn complete_locked(&self, cell: &mut BattleCell, battle_id: BattleId) -> Completion {
        cell.intake.discard();
        cell.abort_timers();
        let battle = &cell.battle;
        let reason = battle.end_reason.unwrap_or(EndReason::Knockout);

        info!(%battle_id, winner = ?battle.winner_id, ?reason, round = battle.round, "battle completed");
        let channels = [
            ChannelKey::User(battle.player1.user_id),
            ChannelKey::User(battle.player2.user_id),
            ChannelKey::BattleStats,
        ];
        self.broadcaster
            .publish(
                &channels,
                &BattleEvent::BattleCompleted { battle_id, winner_id: battle.winner_id, reason },
            )
            .await;

        Completion {
            battle_id,
            players: [battle.player1.user_id, battle.player2.user_id],
            winner_id: battle.winner_id,
            loser_id: battle.loser_id(),
            cancelled: false,
        }
    }

    /// Post-terminal bookkeeping, run outside the battle lock.
    async fn finalize(&self, completion: Completion) {
        if !completion.cancelled {
            // Recorded before the players are freed so an immediate
            // re-queue already sees the opponent cooldown
            let now = Utc::now();
            let [p1, p2] = completion.players;
            let mut recent = self.recent.lock().await;
            recent.entry(p1).or_default().insert(p2, now);
            recent.entry(p2).or_default().insert(p1, now);
        }

        {
            let mut active = self.active.write().await;
            for user in completion.players {
                if active.get(&user) == Some(&completion.battle_id) {
                    active.remove(&user);
                }
            }
        }

        if !completion.cancelled {
            self.grant_rewards(&completion).await;
        }
    }

    /// Grant rewards with bounded retries. The grant is idempotent per
    /// battle id; persistent failure is escalated in the log, never
    /// rolled back into battle state.
    async fn grant_rewards(&self, completion: &Completion) {
        let outcome = BattleOutcome {
            battle_id: completion.battle_id,
            winner_id: completion.winner_id,
            loser_id: completion.loser_id,
        };
        let attempts = self.config.reward_grant_retries.max(1);
        for attempt in 0..attempts {
            match self.ledger.grant_battle_outcome(&outcome) {
                Ok(()) => {
                    debug!(battle_id = %completion.battle_id, "rewards granted");
                    return;
                }
                Err(e) if attempt + 1 < attempts => {
                    warn!(battle_id = %completion.battle_id, error = %e, attempt, "reward grant failed, retrying");
                    sleep(self.config.retry_backoff(attempt)).await;
                }
                Err(e) => {
                    error!(
                        battle_id = %completion.battle_id,
                        error = %e,
                        "reward grant failed after retries, manual reconciliation required"
                    );
                }
            }
        }
    }

    /// Arm the round timer for the generation currently collecting and
    /// retain its abort handle. A replaced timer is aborted outright;
    /// the generation check stays as the backstop for one already past
    /// its sleep.
    fn spawn_round_timer(&self, cell: &mut BattleCell, battle_id: BattleId) {
        let generation = cell.intake.generation();
        let engine = self.strong();
        let handle = tokio::spawn(async move {
            sleep(engine.config.round_interval).await;
            engine.fire_round_timer(battle_id, generation).await;
        });
        if let Some(previous) = cell.round_timer.replace(handle.abort_handle()) {
            abort_unless_current(previous);
        }
    }

    async fn fire_round_timer(&self, battle_id: BattleId, generation: u64) {
        let Some(cell) = self.cell(battle_id).await else { return };
        let mut guard = match lock_with_retry(&cell, &self.config).await {
            Ok(guard) => guard,
            Err(e) => {
                error!(%battle_id, error = %e, "round timer could not acquire battle lock");
                return;
            }
        };

        if guard.battle.is_terminal() || guard.intake.generation() != generation {
            debug!(%battle_id, generation, "stale round timer, ignoring");
            return;
        }

        debug!(
            %battle_id,
            round = guard.intake.current_round(),
            "round timer expired, missing actions default to attack"
        );
        let completion = self.resolve_current_round(&mut guard, battle_id).await;
        drop(guard);
        if let Some(completion) = completion {
            self.finalize(completion).await;
        }
    }

    /// Hard duration cap. Fires once per battle; if the battle already
    /// ended it is a no-op.
    async fn fire_battle_watchdog(self: Arc<Self>, battle_id: BattleId) {
        sleep(self.config.battle_timeout).await;
        let Some(cell) = self.cell(battle_id).await else { return };
        let mut guard = match lock_with_retry(&cell, &self.config).await {
            Ok(guard) => guard,
            Err(e) => {
                error!(%battle_id, error = %e, "watchdog could not acquire battle lock");
                return;
            }
        };

        if guard.battle.is_terminal() {
            return;
        }
        warn!(%battle_id, "battle hit the duration cap, forcing completion");
        guard.battle.force_timeout(Utc::now());
        let completion = self.complete_locked(&mut guard, battle_id).await;
        drop(guard);
        self.finalize(completion).await;
    }

    // =========================================================================
    // MAINTENANCE
    // =========================================================================

    /// Drop terminal battles older than the retention window. Contended
    /// cells are skipped and retried next tick.
    async fn reap_finished_battles(&self) {
        let now = Utc::now();
        let mut reap = Vec::new();
        {
            let battles = self.battles.read().await;
            for (id, cell) in battles.iter() {
                let Ok(guard) = cell.try_lock() else { continue };
                if !guard.battle.is_terminal() {
                    continue;
                }
                let expired = guard
                    .battle
                    .completed_at
                    .and_then(|done| (now - done).to_std().ok())
                    .map(|age| age >= self.config.completed_battle_retention)
                    .unwrap_or(false);
                if expired {
                    reap.push(*id);
                }
            }
        }
        if !reap.is_empty() {
            let mut battles = self.battles.write().await;
            for id in reap {
                battles.remove(&id);
                debug!(battle_id = %id, "reaped finished battle");
            }
        }
    }

    fn check_daily_limit(&self, user_id: UserId) -> Result<(), EngineError> {
        match self.ledger.daily_battle_count(user_id) {
            Ok(count) if count.exhausted() => {
                Err(EngineError::DailyLimitExceeded { reset_at: count.reset_at })
            }
            Ok(_) => Ok(()),
            Err(e) => {
                // Ledger unavailable: admit rather than lock players out
                warn!(%user_id, error = %e, "daily limit check failed, admitting");
                Ok(())
            }
        }
    }

    fn participant_channels(battle: &Battle) -> [ChannelKey; 2] {
        [
            ChannelKey::User(battle.player1.user_id),
            ChannelKey::User(battle.player2.user_id),
        ]
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DailyLimits;

    type TestEngine = Arc<BattleEngine<InMemoryLedger, InMemoryChannel>>;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            countdown: Duration::from_millis(10),
            round_interval: Duration::from_millis(60),
            battle_timeout: Duration::from_secs(30),
            lock_timeout: Duration::from_millis(200),
            max_retry_attempts: 3,
            retry_backoff_base: Duration::from_millis(5),
            queue_sweep_interval: Duration::from_millis(20),
            recent_opponent_cooldown: Duration::from_secs(24 * 3600),
            publish_retries: 1,
            reward_grant_retries: 2,
            completed_battle_retention: Duration::from_secs(300),
            daily_limits: DailyLimits::default(),
        }
    }

    fn new_engine(config: EngineConfig) -> (TestEngine, Arc<InMemoryLedger>, Arc<InMemoryChannel>) {
        let ledger = Arc::new(InMemoryLedger::new(config.daily_limits));
        let channel = Arc::new(InMemoryChannel::new());
        let engine = BattleEngine::new(config, ledger.clone(), channel.clone());
        (engine, ledger, channel)
    }

    async fn wait_until_ongoing(engine: &TestEngine, battle_id: BattleId) {
        for _ in 0..200 {
            if let Some(battle) = engine.battle(battle_id).await {
                if battle.status == BattleStatus::Ongoing {
                    return;
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("battle never became ongoing");
    }

    async fn wait_until_terminal(engine: &TestEngine, battle_id: BattleId) -> Battle {
        for _ in 0..1000 {
            if let Some(battle) = engine.battle(battle_id).await {
                if battle.is_terminal() {
                    return battle;
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("battle never terminated");
    }

    #[tokio::test]
    async fn test_queue_join_matches_compatible_players() {
        let (engine, _, channel) = new_engine(fast_config());
        let (alice, bob) = (UserId::random(), UserId::random());

        engine.join_queue(alice, 150, 20).await.unwrap();
        assert_eq!(engine.queue_status(alice).await.unwrap().position, 1);

        engine.join_queue(bob, 160, 20).await.unwrap();

        // The eager sweep matched them immediately
        let battle = engine.current_battle(alice).await.expect("alice in battle");
        assert_eq!(engine.current_battle(bob).await.unwrap().id, battle.id);
        assert!(engine.queue_status(alice).await.is_none());
        assert!(engine.queue_status(bob).await.is_none());

        let events = channel.delivered_to(&ChannelKey::User(alice));
        assert!(events.iter().any(|(name, _)| name == "battle_created"));
    }

    #[tokio::test]
    async fn test_queue_rejects_double_join_and_in_battle() {
        let (engine, _, _) = new_engine(fast_config());
        let (alice, bob) = (UserId::random(), UserId::random());

        engine.join_queue(alice, 150, 20).await.unwrap();
        assert!(matches!(
            engine.join_queue(alice, 150, 20).await,
            Err(EngineError::AlreadyQueued)
        ));

        engine.join_queue(bob, 150, 20).await.unwrap();
        // Both are now in a battle
        assert!(matches!(
            engine.join_queue(alice, 150, 20).await,
            Err(EngineError::AlreadyInBattle)
        ));
    }

    #[tokio::test]
    async fn test_incompatible_powers_stay_queued() {
        let (engine, _, _) = new_engine(fast_config());
        let (alice, bob) = (UserId::random(), UserId::random());

        engine.join_queue(alice, 100, 10).await.unwrap();
        engine.join_queue(bob, 1000, 10).await.unwrap();

        assert!(engine.current_battle(alice).await.is_none());
        assert_eq!(engine.queue_status(bob).await.unwrap().waiting, 2);

        assert!(engine.leave_queue(alice).await);
        assert!(!engine.leave_queue(alice).await);
    }

    #[tokio::test]
    async fn test_daily_limit_blocks_queue_join() {
        let (engine, ledger, _) = new_engine(fast_config());
        let alice = UserId::random();
        ledger.register(alice, 150, Tier::Free);
        for _ in 0..3 {
            ledger.record_battle_start([alice, UserId::random()]).unwrap();
        }

        let result = engine.join_queue(alice, 150, 20).await;
        assert!(matches!(result, Err(EngineError::DailyLimitExceeded { .. })));
    }

    #[tokio::test]
    async fn test_full_battle_flow_grants_rewards_once() {
        let (engine, ledger, channel) = new_engine(fast_config());
        let (alice, bob) = (UserId::random(), UserId::random());
        ledger.register(alice, 200, Tier::Pro);
        ledger.register(bob, 200, Tier::Pro);

        engine.join_queue(alice, 200, 20).await.unwrap();
        engine.join_queue(bob, 200, 20).await.unwrap();
        let battle_id = engine.current_battle(alice).await.unwrap().id;
        wait_until_ongoing(&engine, battle_id).await;

        // Drive the battle; the round timer covers any round where a
        // submission raced the resolution.
        for _ in 0..500 {
            match engine.submit_action(battle_id, alice, Action::Attack, None).await {
                Ok(_) => {}
                Err(EngineError::InvalidState) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
            match engine.submit_action(battle_id, bob, Action::Attack, None).await {
                Ok(_) => {}
                Err(EngineError::InvalidState) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
            sleep(Duration::from_millis(2)).await;
        }
        let battle = wait_until_terminal(&engine, battle_id).await;
        assert_eq!(battle.status, BattleStatus::Completed);
        assert!(!battle.round_log.is_empty());

        // Rewards applied exactly once
        let total: u32 = ledger.combat_power(alice) + ledger.combat_power(bob);
        match battle.winner_id {
            Some(_) => assert_eq!(total, 405),
            None => assert_eq!(total, 400),
        }

        // Both users are free again
        for _ in 0..100 {
            if engine.current_battle(alice).await.is_none() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(engine.current_battle(alice).await.is_none());
        assert!(engine.current_battle(bob).await.is_none());

        let events = channel.delivered_to(&ChannelKey::User(alice));
        let completed = events.iter().filter(|(name, _)| name == "battle_completed").count();
        assert_eq!(completed, 1);

        let history = engine.battle_history(alice).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, battle_id);

        // No timer stays parked against the finished battle
        let cell = engine.cell(battle_id).await.unwrap();
        let guard = cell.lock().await;
        assert!(guard.round_timer.is_none());
        assert!(guard.watchdog.is_none());
    }

    #[tokio::test]
    async fn test_event_order_is_causal_per_battle() {
        let (engine, _, channel) = new_engine(fast_config());
        let (alice, bob) = (UserId::random(), UserId::random());

        engine.join_queue(alice, 150, 20).await.unwrap();
        engine.join_queue(bob, 150, 20).await.unwrap();
        let battle_id = engine.current_battle(alice).await.unwrap().id;
        wait_until_terminal(&engine, battle_id).await;

        let names: Vec<String> = channel
            .delivered_to(&ChannelKey::User(alice))
            .into_iter()
            .map(|(name, _)| name)
            .collect();

        let created = names.iter().position(|n| n == "battle_created").unwrap();
        let started = names.iter().position(|n| n == "battle_started").unwrap();
        let first_round = names.iter().position(|n| n == "round_resolved").unwrap();
        let completed = names.iter().position(|n| n == "battle_completed").unwrap();
        assert!(created < started && started < first_round && first_round < completed);

        // Round outcomes arrive in strictly increasing round order
        let rounds: Vec<u64> = channel
            .delivered_to(&ChannelKey::User(alice))
            .into_iter()
            .filter(|(name, _)| name == "round_resolved")
            .map(|(_, payload)| payload["outcome"]["round"].as_u64().unwrap())
            .collect();
        assert!(rounds.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_concurrent_submissions_resolve_round_once() {
        let mut config = fast_config();
        // Long timer so only the submissions can close round 1
        config.round_interval = Duration::from_secs(30);
        let (engine, _, _) = new_engine(config);
        let (alice, bob) = (UserId::random(), UserId::random());

        engine.join_queue(alice, 150, 20).await.unwrap();
        engine.join_queue(bob, 150, 20).await.unwrap();
        let battle_id = engine.current_battle(alice).await.unwrap().id;
        wait_until_ongoing(&engine, battle_id).await;

        let (r1, r2) = tokio::join!(
            engine.submit_action(battle_id, alice, Action::Attack, Some(1)),
            engine.submit_action(battle_id, bob, Action::Defend, Some(1)),
        );
        let receipts = [r1.unwrap(), r2.unwrap()];

        // Exactly one submission closed the round
        let resolved = receipts.iter().filter(|r| **r == ActionReceipt::RoundResolved).count();
        assert_eq!(resolved, 1);

        let battle = engine.battle(battle_id).await.unwrap();
        assert_eq!(battle.round, 1);
        assert_eq!(battle.round_log.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_idempotent_success() {
        let mut config = fast_config();
        config.round_interval = Duration::from_secs(30);
        let (engine, _, _) = new_engine(config);
        let (alice, bob) = (UserId::random(), UserId::random());

        engine.join_queue(alice, 150, 20).await.unwrap();
        engine.join_queue(bob, 150, 20).await.unwrap();
        let battle_id = engine.current_battle(alice).await.unwrap().id;
        wait_until_ongoing(&engine, battle_id).await;

        let first = engine.submit_action(battle_id, alice, Action::Attack, None).await.unwrap();
        assert_eq!(first, ActionReceipt::Accepted);
        let second = engine.submit_action(battle_id, alice, Action::Defend, None).await.unwrap();
        assert_eq!(second, ActionReceipt::Duplicate);

        // The buffered action is unchanged: nothing resolved yet
        assert_eq!(engine.battle(battle_id).await.unwrap().round, 0);
    }

    #[tokio::test]
    async fn test_round_timer_forces_resolution() {
        let (engine, _, _) = new_engine(fast_config());
        let (alice, bob) = (UserId::random(), UserId::random());

        engine.join_queue(alice, 150, 20).await.unwrap();
        engine.join_queue(bob, 150, 20).await.unwrap();
        let battle_id = engine.current_battle(alice).await.unwrap().id;
        wait_until_ongoing(&engine, battle_id).await;

        // Neither player submits; the timer must keep the battle moving
        for _ in 0..200 {
            if engine.battle(battle_id).await.map(|b| b.round >= 2).unwrap_or(false) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let battle = engine.battle(battle_id).await.unwrap();
        assert!(battle.round >= 2, "timer should force-advance rounds");
        assert_eq!(battle.round_log[0].p1.action, Action::Attack);
        assert_eq!(battle.round_log[0].p2.action, Action::Attack);
    }

    #[tokio::test]
    async fn test_timer_defaulted_attack_spares_banked_energy() {
        let mut config = fast_config();
        config.round_interval = Duration::from_millis(150);
        let (engine, _, _) = new_engine(config);
        let (alice, bob) = (UserId::random(), UserId::random());

        engine.join_queue(alice, 150, 20).await.unwrap();
        engine.join_queue(bob, 150, 20).await.unwrap();
        let battle_id = engine.current_battle(alice).await.unwrap().id;
        wait_until_ongoing(&engine, battle_id).await;

        engine.add_energy(battle_id, alice, EnergyKind::Attack, 20).await.unwrap();

        // Neither player submits; the timer closes round 1 for them
        for _ in 0..200 {
            if engine.battle(battle_id).await.map(|b| b.round >= 1).unwrap_or(false) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let battle = engine.battle(battle_id).await.unwrap();
        let first = &battle.round_log[0];
        let side = if battle.player1.user_id == alice { &first.p1 } else { &first.p2 };

        // The stand-in attack left the banked pool untouched
        assert_eq!(side.action, Action::Attack);
        assert_eq!(side.energy_after, 20);
    }

    #[tokio::test]
    async fn test_terminal_battle_clears_scheduled_timers() {
        let mut config = fast_config();
        config.round_interval = Duration::from_secs(30);
        config.battle_timeout = Duration::from_secs(30);
        let (engine, _, _) = new_engine(config);
        let (alice, bob) = (UserId::random(), UserId::random());

        engine.join_queue(alice, 150, 20).await.unwrap();
        engine.join_queue(bob, 150, 20).await.unwrap();
        let battle_id = engine.current_battle(alice).await.unwrap().id;
        wait_until_ongoing(&engine, battle_id).await;

        let cell = engine.cell(battle_id).await.unwrap();
        {
            let guard = cell.lock().await;
            assert!(guard.round_timer.is_some());
            assert!(guard.watchdog.is_some());
        }

        engine.cancel_battle(battle_id, "client gone").await.unwrap();

        let guard = cell.lock().await;
        assert!(guard.round_timer.is_none());
        assert!(guard.watchdog.is_none());
    }

    #[tokio::test]
    async fn test_history_read_does_not_block_registry_writers() {
        let mut config = fast_config();
        config.round_interval = Duration::from_secs(30);
        let (engine, _, _) = new_engine(config);
        let (alice, bob) = (UserId::random(), UserId::random());
        let (carol, dave) = (UserId::random(), UserId::random());

        engine.join_queue(alice, 150, 20).await.unwrap();
        engine.join_queue(bob, 150, 20).await.unwrap();
        let battle_id = engine.current_battle(alice).await.unwrap().id;
        wait_until_ongoing(&engine, battle_id).await;

        // Park a history read behind the held battle lock
        let cell = engine.cell(battle_id).await.unwrap();
        let held = cell.clone().lock_owned().await;
        let reader = engine.clone();
        let history = tokio::spawn(async move { reader.battle_history(alice).await });
        sleep(Duration::from_millis(20)).await;

        // Registry writers must keep making progress meanwhile
        let invite = engine.challenge(carol, 150, dave).await.unwrap();
        let created = tokio::time::timeout(
            Duration::from_millis(500),
            engine.accept_invite(invite, dave, 150),
        )
        .await;
        assert!(created.is_ok(), "battle creation stalled behind a history read");

        drop(held);
        assert!(history.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_skips_rewards_and_frees_players() {
        let mut config = fast_config();
        config.round_interval = Duration::from_secs(30);
        let (engine, ledger, channel) = new_engine(config);
        let (alice, bob) = (UserId::random(), UserId::random());
        ledger.register(alice, 200, Tier::Pro);
        ledger.register(bob, 200, Tier::Pro);

        engine.join_queue(alice, 200, 20).await.unwrap();
        engine.join_queue(bob, 200, 20).await.unwrap();
        let battle_id = engine.current_battle(alice).await.unwrap().id;
        wait_until_ongoing(&engine, battle_id).await;

        engine.cancel_battle(battle_id, "player disconnected").await.unwrap();

        let battle = engine.battle(battle_id).await.unwrap();
        assert_eq!(battle.status, BattleStatus::Cancelled);
        assert_eq!(ledger.combat_power(alice), 200);
        assert_eq!(ledger.combat_power(bob), 200);
        assert!(engine.current_battle(alice).await.is_none());

        let events = channel.delivered_to(&ChannelKey::User(bob));
        assert!(events.iter().any(|(name, _)| name == "battle_cancelled"));

        // Late action against a cancelled battle is an invalid state
        let result = engine.submit_action(battle_id, alice, Action::Attack, None).await;
        assert!(matches!(result, Err(EngineError::InvalidState)));
    }

    #[tokio::test]
    async fn test_completed_pair_not_rematched_within_cooldown() {
        let (engine, _, _) = new_engine(fast_config());
        let (alice, bob) = (UserId::random(), UserId::random());

        engine.join_queue(alice, 150, 20).await.unwrap();
        engine.join_queue(bob, 150, 20).await.unwrap();
        let battle_id = engine.current_battle(alice).await.unwrap().id;
        wait_until_terminal(&engine, battle_id).await;
        for _ in 0..100 {
            if engine.current_battle(alice).await.is_none() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }

        engine.join_queue(alice, 150, 20).await.unwrap();
        engine.join_queue(bob, 150, 20).await.unwrap();

        // Same pair inside the cooldown: both keep waiting
        assert!(engine.current_battle(alice).await.is_none());
        assert_eq!(engine.queue_status(alice).await.unwrap().waiting, 2);
    }

    #[tokio::test]
    async fn test_challenge_accept_creates_battle() {
        let (engine, _, channel) = new_engine(fast_config());
        let (alice, bob) = (UserId::random(), UserId::random());

        let invite_id = engine.challenge(alice, 150, bob).await.unwrap();
        let battle_id = engine.accept_invite(invite_id, bob, 400).await.unwrap();

        // Direct challenges ignore the tolerance window entirely
        let battle = engine.battle(battle_id).await.unwrap();
        assert_eq!(battle.player1.combat_power, 150);
        assert_eq!(battle.player2.combat_power, 400);

        let events = channel.delivered_to(&ChannelKey::User(alice));
        assert!(events.iter().any(|(name, _)| name == "invitation_created"));
        assert!(events.iter().any(|(name, _)| name == "invitation_accepted"));

        // Consumed: cannot be accepted twice
        assert!(matches!(
            engine.accept_invite(invite_id, bob, 400).await,
            Err(EngineError::InviteNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_challenge_reject_notifies_both() {
        let (engine, _, channel) = new_engine(fast_config());
        let (alice, bob) = (UserId::random(), UserId::random());

        let invite_id = engine.challenge(alice, 150, bob).await.unwrap();
        engine.reject_invite(invite_id, bob).await.unwrap();

        assert!(engine.current_battle(alice).await.is_none());
        let events = channel.delivered_to(&ChannelKey::User(alice));
        assert!(events.iter().any(|(name, _)| name == "invitation_rejected"));
    }

    #[tokio::test]
    async fn test_accept_removes_challenged_player_from_queue() {
        let (engine, _, _) = new_engine(fast_config());
        let (alice, bob) = (UserId::random(), UserId::random());

        // Bob waits in the queue with nobody compatible
        engine.join_queue(bob, 9000, 10).await.unwrap();
        let invite_id = engine.challenge(alice, 150, bob).await.unwrap();
        engine.accept_invite(invite_id, bob, 9000).await.unwrap();

        assert!(engine.queue_status(bob).await.is_none());
        assert!(engine.current_battle(bob).await.is_some());
    }

    #[tokio::test]
    async fn test_add_energy_reaches_battle() {
        let mut config = fast_config();
        config.round_interval = Duration::from_secs(30);
        let (engine, _, _) = new_engine(config);
        let (alice, bob) = (UserId::random(), UserId::random());

        engine.join_queue(alice, 150, 20).await.unwrap();
        engine.join_queue(bob, 150, 20).await.unwrap();
        let battle_id = engine.current_battle(alice).await.unwrap().id;
        wait_until_ongoing(&engine, battle_id).await;

        assert_eq!(
            engine.add_energy(battle_id, alice, EnergyKind::Attack, 8).await.unwrap(),
            8
        );
        assert_eq!(
            engine.add_energy(battle_id, alice, EnergyKind::Defense, 99).await.unwrap(),
            15
        );
        assert!(matches!(
            engine.add_energy(battle_id, alice, EnergyKind::Attack, 0).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            engine.add_energy(battle_id, UserId::random(), EnergyKind::Attack, 5).await,
            Err(EngineError::UnknownPlayer)
        ));
    }

    #[tokio::test]
    async fn test_unknown_battle_and_player_errors() {
        let (engine, _, _) = new_engine(fast_config());
        let result = engine
            .submit_action(BattleId::random(), UserId::random(), Action::Attack, None)
            .await;
        assert!(matches!(result, Err(EngineError::UnknownBattle)));

        let (alice, bob) = (UserId::random(), UserId::random());
        engine.join_queue(alice, 150, 20).await.unwrap();
        engine.join_queue(bob, 150, 20).await.unwrap();
        let battle_id = engine.current_battle(alice).await.unwrap().id;
        wait_until_ongoing(&engine, battle_id).await;

        let result = engine
            .submit_action(battle_id, UserId::random(), Action::Attack, None)
            .await;
        assert!(matches!(result, Err(EngineError::UnknownPlayer)));
    }

    #[tokio::test]
    async fn test_submission_before_start_is_invalid_state() {
        let mut config = fast_config();
        config.countdown = Duration::from_secs(30);
        let (engine, _, _) = new_engine(config);
        let (alice, bob) = (UserId::random(), UserId::random());

        engine.join_queue(alice, 150, 20).await.unwrap();
        engine.join_queue(bob, 150, 20).await.unwrap();
        let battle_id = engine.current_battle(alice).await.unwrap().id;

        // Still preparing: countdown has not elapsed
        let result = engine.submit_action(battle_id, alice, Action::Attack, None).await;
        assert!(matches!(result, Err(EngineError::InvalidState)));
    }

    #[tokio::test]
    async fn test_reaper_drops_old_finished_battles() {
        let mut config = fast_config();
        config.completed_battle_retention = Duration::from_millis(0);
        let (engine, _, _) = new_engine(config);
        let (alice, bob) = (UserId::random(), UserId::random());

        engine.join_queue(alice, 150, 20).await.unwrap();
        engine.join_queue(bob, 150, 20).await.unwrap();
        let battle_id = engine.current_battle(alice).await.unwrap().id;
        wait_until_terminal(&engine, battle_id).await;

        engine.reap_finished_battles().await;
        assert!(engine.battle(battle_id).await.is_none());
    }
}
