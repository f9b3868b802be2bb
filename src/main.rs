//! Arena Battle Server
//!
//! Demo binary: spins up the engine with in-memory collaborators,
//! matches two players through the queue, plays a full battle with a
//! simple energy-aware policy, and reports the settled rewards.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use arena_battle::{
    Action, BattleEngine, BattleStatus, EnergyKind, EngineConfig, InMemoryChannel,
    InMemoryLedger, Tier, UserId, VERSION,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Arena Battle Server v{}", VERSION);

    demo_battle().await
}

/// Demo function to exercise the full queue-to-rewards path.
async fn demo_battle() -> Result<()> {
    info!("=== Starting Demo Battle ===");

    // Short timers so the demo finishes in seconds
    let config = EngineConfig {
        countdown: Duration::from_millis(500),
        round_interval: Duration::from_millis(400),
        queue_sweep_interval: Duration::from_millis(200),
        ..EngineConfig::default()
    };
    info!("Round interval: {:?}", config.round_interval);
    info!("Battle timeout: {:?}", config.battle_timeout);

    let ledger = Arc::new(InMemoryLedger::new(config.daily_limits));
    let channel = Arc::new(InMemoryChannel::new());
    let engine = BattleEngine::new(config, ledger.clone(), channel.clone());
    let maintenance = engine.start_maintenance();

    let alice = UserId::random();
    let bob = UserId::random();
    ledger.register(alice, 180, Tier::Free);
    ledger.register(bob, 150, Tier::Free);
    info!("Alice: {} (CP 180)", alice);
    info!("Bob:   {} (CP 150)", bob);

    engine.join_queue(alice, 180, 20).await?;
    engine.join_queue(bob, 150, 20).await?;

    let battle = engine
        .current_battle(alice)
        .await
        .context("queue did not match the players")?;
    let battle_id = battle.id;
    info!("Matched into battle {} (seed {})", battle_id, battle.rng_seed);

    // Wait out the countdown
    loop {
        match engine.battle(battle_id).await {
            Some(b) if b.status == BattleStatus::Ongoing => break,
            Some(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            None => anyhow::bail!("battle vanished during countdown"),
        }
    }
    info!("Battle started");

    // Drive both players: top up energy every round, attack with a
    // charged pool, defend while recharging.
    let mut reported_rounds = 0usize;
    loop {
        let Some(snapshot) = engine.battle(battle_id).await else { break };
        if snapshot.is_terminal() {
            report_rounds(&snapshot, &mut reported_rounds);
            break;
        }
        report_rounds(&snapshot, &mut reported_rounds);

        for (user, combatant) in [(alice, &snapshot.player1), (bob, &snapshot.player2)] {
            let _ = engine.add_energy(battle_id, user, EnergyKind::Attack, 3).await;
            let _ = engine.add_energy(battle_id, user, EnergyKind::Defense, 1).await;
            let action = if combatant.energy >= 5 { Action::Attack } else { Action::Defend };
            match engine.submit_action(battle_id, user, action, None).await {
                Ok(_) => {}
                Err(e) => info!("submission for {user} not accepted: {e}"),
            }
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Print final results
    info!("=== Battle Results ===");
    let final_state = engine
        .battle(battle_id)
        .await
        .context("battle reaped before results were read")?;
    match final_state.winner_id {
        Some(winner) => info!(
            "Winner: {} after {} rounds ({:?})",
            winner,
            final_state.round,
            final_state.end_reason
        ),
        None => info!("Draw after {} rounds", final_state.round),
    }
    info!(
        "Final health: Alice {} / Bob {}",
        final_state.player1.health, final_state.player2.health
    );

    info!("=== Settled Rewards ===");
    for (name, user) in [("Alice", alice), ("Bob", bob)] {
        info!(
            "{}: CP {} | XP {} | fee discount: {}",
            name,
            ledger.combat_power(user),
            ledger.xp(user),
            ledger.has_fee_discount(user, chrono::Utc::now())
        );
    }

    let pushed = channel.delivered().len();
    info!("Realtime events published: {}", pushed);

    maintenance.abort();
    Ok(())
}

/// Log any rounds that resolved since the last report.
fn report_rounds(snapshot: &arena_battle::Battle, reported: &mut usize) {
    for outcome in &snapshot.round_log[*reported..] {
        info!(
            "Round {:>2}: p1 {:?} dealt {}{} | p2 {:?} dealt {}{} | health {}/{}",
            outcome.round,
            outcome.p1.action,
            outcome.p1.damage_dealt,
            if outcome.p1.was_critical { " (crit)" } else if outcome.p1.was_dodged { " (dodged)" } else { "" },
            outcome.p2.action,
            outcome.p2.damage_dealt,
            if outcome.p2.was_critical { " (crit)" } else if outcome.p2.was_dodged { " (dodged)" } else { "" },
            outcome.p1.health_after,
            outcome.p2.health_after,
        );
    }
    *reported = snapshot.round_log.len();
}
