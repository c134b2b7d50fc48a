use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jobdeck_core::{JobId, ResourceKey, SubscriptionId};
use jobdeck_engine::{FailureKind, OpError, PollScheduler, PollSettings, PollTarget, ResourceGuard};
use pretty_assertions::assert_eq;

#[derive(Default)]
struct Probe {
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    fetches: AtomicU32,
    log: Mutex<Vec<String>>,
}

impl Probe {
    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

/// Counts up on each fetch and reports live until `settle_at`.
struct Counter {
    probe: Arc<Probe>,
    latency: Duration,
    settle_at: u32,
    fail_from: Option<u32>,
    last: u32,
}

impl Counter {
    fn new(probe: &Arc<Probe>, latency: Duration, settle_at: u32) -> Self {
        Self {
            probe: probe.clone(),
            latency,
            settle_at,
            fail_from: None,
            last: 0,
        }
    }
}

#[async_trait::async_trait]
impl PollTarget for Counter {
    type Update = u32;

    async fn fetch(&mut self) -> Result<u32, OpError> {
        let now = self.probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let n = self.probe.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.latency).await;
        self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);
        match self.fail_from {
            Some(from) if n >= from => Err(OpError::new(FailureKind::Timeout, "slow")),
            _ => Ok(n),
        }
    }

    fn apply(&mut self, _: SubscriptionId, update: u32) {
        self.last = update;
        self.probe.log.lock().unwrap().push(format!("apply {update}"));
    }

    fn is_live(&self) -> bool {
        self.last < self.settle_at
    }

    fn fail(&mut self, _: SubscriptionId, error: OpError) {
        self.probe.log.lock().unwrap().push(format!("fail {}", error.kind));
    }

    fn time_out(&mut self, _: SubscriptionId) {
        self.probe.log.lock().unwrap().push("time out".to_string());
    }
}

fn settings(interval_ms: u64) -> PollSettings {
    PollSettings {
        interval: Duration::from_millis(interval_ms),
        ceiling: None,
        max_consecutive_failures: 3,
    }
}

fn job_key() -> ResourceKey {
    ResourceKey::Job(JobId::new("j1"))
}

#[tokio::test(start_paused = true)]
async fn never_more_than_one_request_in_flight() {
    let guard = ResourceGuard::detached();
    let scheduler = PollScheduler::new(guard.clone());
    let probe = Arc::new(Probe::default());

    // Requests take longer than the interval.
    let target = Counter::new(&probe, Duration::from_millis(3500), 5);
    let _handle = scheduler.subscribe(job_key(), target, settings(2000)).unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(probe.fetches.load(Ordering::SeqCst), 5);
    assert!(!guard.is_held(&job_key()));
}

#[tokio::test(start_paused = true)]
async fn first_fetch_is_immediate_and_then_every_interval() {
    let guard = ResourceGuard::detached();
    let scheduler = PollScheduler::new(guard.clone());
    let probe = Arc::new(Probe::default());
    let _handle = scheduler
        .subscribe(job_key(), Counter::new(&probe, Duration::ZERO, 100), settings(2000))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(probe.fetches.load(Ordering::SeqCst), 1);
    tokio::time::sleep(Duration::from_millis(4000)).await;
    assert_eq!(probe.fetches.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn release_discards_in_flight_response() {
    let guard = ResourceGuard::detached();
    let scheduler = PollScheduler::new(guard.clone());
    let probe = Arc::new(Probe::default());
    let handle = scheduler
        .subscribe(job_key(), Counter::new(&probe, Duration::from_secs(1), 100), settings(2000))
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(handle.release());
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(probe.fetches.load(Ordering::SeqCst), 1);
    assert!(probe.log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_subscription_on_same_key_is_refused() {
    let guard = ResourceGuard::detached();
    let scheduler = PollScheduler::new(guard.clone());
    let probe = Arc::new(Probe::default());
    let _first = scheduler
        .subscribe(job_key(), Counter::new(&probe, Duration::ZERO, 100), settings(2000))
        .unwrap();
    let err = scheduler
        .subscribe(job_key(), Counter::new(&probe, Duration::ZERO, 100), settings(2000))
        .unwrap_err();
    assert_eq!(err.kind, FailureKind::AlreadySubscribed);
}

#[tokio::test(start_paused = true)]
async fn consecutive_failures_past_threshold_fail_the_target() {
    let guard = ResourceGuard::detached();
    let scheduler = PollScheduler::new(guard.clone());
    let probe = Arc::new(Probe::default());
    let mut target = Counter::new(&probe, Duration::ZERO, 100);
    target.fail_from = Some(2);
    let _handle = scheduler.subscribe(job_key(), target, settings(1000)).unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(probe.log(), vec!["apply 1".to_string(), "fail timeout".to_string()]);
    assert_eq!(probe.fetches.load(Ordering::SeqCst), 4);
    assert!(!guard.is_held(&job_key()));
}

#[tokio::test(start_paused = true)]
async fn ceiling_times_out_and_stops() {
    let guard = ResourceGuard::detached();
    let scheduler = PollScheduler::new(guard.clone());
    let probe = Arc::new(Probe::default());
    let settings = PollSettings::vm().with_ceiling(Duration::from_secs(120));
    let _handle = scheduler
        .subscribe(ResourceKey::Vm, Counter::new(&probe, Duration::ZERO, u32::MAX), settings)
        .unwrap();

    tokio::time::sleep(Duration::from_secs(119)).await;
    assert!(guard.is_held(&ResourceKey::Vm));
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(!guard.is_held(&ResourceKey::Vm));
    assert_eq!(probe.log().last().map(String::as_str), Some("time out"));
    // Fetches at 0, 5, ..., 115 s.
    assert_eq!(probe.fetches.load(Ordering::SeqCst), 24);
}
