//! Realtime Broadcaster
//!
//! Thin publish wrapper over the external realtime channel. Best-effort
//! by contract: transient failures are retried briefly, persistent
//! failures are logged and swallowed. A missed push never blocks or
//! fails game logic; clients reconcile via on-demand state fetch.
//!
//! Causal ordering within one battle's channel is preserved because the
//! engine publishes round N's events before the critical section that
//! produced them is released.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::battle::events::BattleEvent;
use crate::core::ids::UserId;
use crate::error::PublishError;

/// Delay between publish retry attempts. Kept short so retries never
/// noticeably delay the battle path.
const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Destination for a published event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChannelKey {
    /// A user's private notification channel.
    User(UserId),
    /// Global aggregate channel for battle statistics.
    BattleStats,
    /// Global aggregate channel for queue population.
    BattleQueue,
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKey::User(id) => write!(f, "user:{id}"),
            ChannelKey::BattleStats => write!(f, "battle-stats"),
            ChannelKey::BattleQueue => write!(f, "battle-queue"),
        }
    }
}

/// Boundary to the external realtime push transport.
pub trait RealtimeChannel: Send + Sync {
    /// Publish one event to one channel.
    fn publish(&self, channel: &ChannelKey, event: &str, payload: &Value)
        -> Result<(), PublishError>;
}

/// Retrying, swallow-on-failure publisher used by the engine.
pub struct Broadcaster<C> {
    channel: Arc<C>,
    retries: u32,
}

impl<C: RealtimeChannel> Broadcaster<C> {
    /// Wrap a channel with the configured retry budget.
    pub fn new(channel: Arc<C>, retries: u32) -> Self {
        Self { channel, retries }
    }

    /// Publish an event to every listed channel.
    ///
    /// Infallible by design: failures are logged and the game continues.
    pub async fn publish(&self, channels: &[ChannelKey], event: &BattleEvent) {
        let payload = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                warn!(event = event.name(), error = %e, "failed to serialize event payload");
                return;
            }
        };

        for channel in channels {
            self.publish_one(channel, event.name(), &payload).await;
        }
    }

    async fn publish_one(&self, channel: &ChannelKey, event: &str, payload: &Value) {
        let attempts = self.retries + 1;
        for attempt in 0..attempts {
            match self.channel.publish(channel, event, payload) {
                Ok(()) => {
                    debug!(%channel, event, "event published");
                    return;
                }
                Err(e) if attempt + 1 < attempts => {
                    debug!(%channel, event, error = %e, "publish failed, retrying");
                    sleep(PUBLISH_RETRY_DELAY).await;
                }
                Err(e) => {
                    warn!(%channel, event, error = %e, "publish failed, dropping event");
                }
            }
        }
    }
}

// =============================================================================
// IN-MEMORY CHANNEL
// =============================================================================

/// In-memory channel used by the demo binary and tests.
///
/// Records every delivered event and can inject a number of transient
/// failures to exercise the retry path.
#[derive(Default)]
pub struct InMemoryChannel {
    inner: std::sync::Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    delivered: Vec<(ChannelKey, String, Value)>,
    fail_next: u32,
}

impl InMemoryChannel {
    /// Create an empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publish calls.
    pub fn inject_failures(&self, n: u32) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).fail_next = n;
    }

    /// Everything delivered so far.
    pub fn delivered(&self) -> Vec<(ChannelKey, String, Value)> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .delivered
            .clone()
    }

    /// Events delivered to one channel, in publish order.
    pub fn delivered_to(&self, channel: &ChannelKey) -> Vec<(String, Value)> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .delivered
            .iter()
            .filter(|(c, _, _)| c == channel)
            .map(|(_, name, payload)| (name.clone(), payload.clone()))
            .collect()
    }
}

impl RealtimeChannel for InMemoryChannel {
    fn publish(
        &self,
        channel: &ChannelKey,
        event: &str,
        payload: &Value,
    ) -> Result<(), PublishError> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(PublishError("injected transient failure".to_string()));
        }
        state
            .delivered
            .push((*channel, event.to_string(), payload.clone()));
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
