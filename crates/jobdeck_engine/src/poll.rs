use std::time::Duration;

use deck_logging::{deck_debug, deck_warn};
use jobdeck_core::{ResourceKey, SubscriptionId};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, sleep_until, Instant};

use crate::guard::{Lease, ResourceGuard, SubscriptionHandle};
use crate::OpError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub interval: Duration,
    /// Wall-clock limit for the whole subscription. `None` polls until settled.
    pub ceiling: Option<Duration>,
    /// Consecutive failed fetches tolerated before the target is marked failed.
    pub max_consecutive_failures: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::jobs()
    }
}

impl PollSettings {
    pub fn jobs() -> Self {
        Self {
            interval: Duration::from_secs(2),
            ceiling: None,
            max_consecutive_failures: 3,
        }
    }

    pub fn vm() -> Self {
        Self {
            interval: Duration::from_secs(5),
            ..Self::jobs()
        }
    }

    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = Some(ceiling);
        self
    }
}

/// A resource the scheduler can refresh on a timer.
#[async_trait::async_trait]
pub trait PollTarget: Send + 'static {
    type Update: Send + 'static;

    async fn fetch(&mut self) -> Result<Self::Update, OpError>;

    /// Hands a fresh result to whoever owns the state.
    fn apply(&mut self, sub: SubscriptionId, update: Self::Update);

    /// Whether the resource still needs polling after the last `apply`.
    fn is_live(&self) -> bool;

    fn fail(&mut self, sub: SubscriptionId, error: OpError);

    fn time_out(&mut self, _sub: SubscriptionId) {}
}

#[derive(Clone)]
pub struct PollScheduler {
    guard: ResourceGuard,
}

impl PollScheduler {
    pub fn new(guard: ResourceGuard) -> Self {
        Self { guard }
    }

    /// Starts polling `key`. Fails with `AlreadySubscribed` when a poller already holds it.
    pub fn subscribe<T: PollTarget>(
        &self,
        key: ResourceKey,
        target: T,
        settings: PollSettings,
    ) -> Result<SubscriptionHandle, OpError> {
        let lease = self.guard.acquire(key)?;
        let handle = self.guard.handle(&lease);
        tokio::spawn(poll_loop(self.guard.clone(), lease, target, settings));
        Ok(handle)
    }
}

enum Tick<U> {
    Released,
    CeilingReached,
    Fetched(Result<U, OpError>),
}

async fn poll_loop<T: PollTarget>(
    guard: ResourceGuard,
    lease: Lease,
    mut target: T,
    settings: PollSettings,
) {
    let Lease { key, sub, token } = lease;
    let deadline = settings.ceiling.map(|ceiling| Instant::now() + ceiling);
    let mut failures = 0u32;
    deck_debug!("Polling {} every {:?} ({})", key, settings.interval, sub);

    // At most one fetch is in flight: the next tick is only scheduled once this one settles.
    loop {
        let tick = tokio::select! {
            biased;
            _ = token.cancelled() => Tick::Released,
            _ = until(deadline) => Tick::CeilingReached,
            result = target.fetch() => Tick::Fetched(result),
        };

        match tick {
            Tick::Released => break,
            Tick::CeilingReached => {
                deck_warn!("Poll ceiling reached for {}", key);
                target.time_out(sub);
                break;
            }
            // Released while the request was in flight; the result is discarded.
            Tick::Fetched(_) if token.is_cancelled() => break,
            Tick::Fetched(Ok(update)) => {
                failures = 0;
                target.apply(sub, update);
                if !target.is_live() {
                    break;
                }
            }
            Tick::Fetched(Err(err)) => {
                failures += 1;
                if failures >= settings.max_consecutive_failures.max(1) {
                    deck_warn!("Polling {} gave up after {} failures: {}", key, failures, err);
                    target.fail(sub, err);
                    break;
                }
                deck_warn!("Poll of {} failed ({}/{}): {}", key, failures, settings.max_consecutive_failures, err);
            }
        }

        let tick: Tick<()> = tokio::select! {
            biased;
            _ = token.cancelled() => Tick::Released,
            _ = until(deadline) => Tick::CeilingReached,
            _ = sleep(settings.interval) => Tick::Fetched(Ok(())),
        };
        match tick {
            Tick::Released => break,
            Tick::CeilingReached => {
                deck_warn!("Poll ceiling reached for {}", key);
                target.time_out(sub);
                break;
            }
            Tick::Fetched(_) => {}
        }
    }

    guard.release(&key, sub);
    deck_debug!("Stopped polling {} ({})", key, sub);
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
