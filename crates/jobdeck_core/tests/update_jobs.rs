use std::sync::Once;

use chrono::Utc;
use jobdeck_core::{
    update, AppState, ControlAck, Effect, Job, JobAction, JobId, JobKind, JobMode, JobSnapshot,
    JobStatus, Msg, Notice, ReasonCode, ResourceKey, SubscriptionId,
};

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(deck_logging::initialize_for_tests);
}

fn job_id() -> JobId {
    JobId::new("job-1")
}

fn created(mode: JobMode, total: u32) -> AppState {
    let job = Job::new(job_id(), JobKind::PassCheck, mode, total, Utc::now());
    let (state, _) = update(AppState::new(), Msg::JobCreated { job });
    state
}

fn confirm(state: AppState, action: JobAction) -> (AppState, Vec<Effect>) {
    update(
        state,
        Msg::ControlConfirmed {
            job_id: job_id(),
            action,
            ack: ControlAck::default(),
            at: Utc::now(),
        },
    )
}

fn subscribe(state: AppState, raw: u64) -> (AppState, SubscriptionId) {
    let sub = SubscriptionId::new(raw);
    let (state, _) = update(
        state,
        Msg::Subscribed {
            key: ResourceKey::Job(job_id()),
            sub,
        },
    );
    (state, sub)
}

fn polled(
    state: AppState,
    sub: SubscriptionId,
    status: JobStatus,
    index: u32,
    passed: u32,
    errors: u32,
) -> (AppState, Vec<Effect>) {
    let epoch = state.job(&job_id()).map(Job::epoch).unwrap_or_default();
    update(
        state,
        Msg::JobPolled {
            sub,
            job_id: job_id(),
            epoch,
            snapshot: JobSnapshot {
                status,
                current_index: index,
                passed_count: passed,
                error_count: errors,
                total_items: None,
                endpoint: None,
                started_at: None,
                completed_at: None,
                error: None,
            },
            at: Utc::now(),
        },
    )
}

#[test]
fn headless_job_runs_to_completion_over_five_polls() {
    init_logging();
    let state = created(JobMode::HeadlessApi, 5);
    assert_eq!(state.view().jobs[0].status, JobStatus::Pending);

    let (state, effects) = confirm(state, JobAction::Start);
    assert_eq!(state.view().jobs[0].status, JobStatus::Running);
    assert_eq!(effects, vec![Effect::ArmJobPolling { job_id: job_id() }]);

    let (mut state, sub) = subscribe(state, 1);
    for index in 1..5 {
        let (next, effects) = polled(state, sub, JobStatus::Running, index, index, 0);
        assert!(effects.is_empty());
        state = next;
    }
    let (mut state, effects) = polled(state, sub, JobStatus::Completed, 5, 5, 0);

    let row = state.view().jobs[0].clone();
    assert_eq!(row.status, JobStatus::Completed);
    assert_eq!(
        (row.current_index, row.passed_count, row.error_count),
        (5, 5, 0)
    );
    assert_eq!(row.percent(), 100);
    assert_eq!(
        effects,
        vec![
            Effect::Release {
                key: ResourceKey::Job(job_id()),
                sub
            },
            Effect::Notify(Notice::JobSettled {
                job_id: job_id(),
                status: JobStatus::Completed
            }),
        ]
    );
    assert!(state.consume_dirty());
}

#[test]
fn interactive_job_walks_launch_wait_start() {
    init_logging();
    let state = created(JobMode::InteractiveBrowser, 2);
    let (state, effects) = update(
        state,
        Msg::ControlConfirmed {
            job_id: job_id(),
            action: JobAction::Launch,
            ack: ControlAck {
                status: None,
                endpoint: Some("https://vm.example.com/view".parse().unwrap()),
            },
            at: Utc::now(),
        },
    );
    assert_eq!(state.view().jobs[0].status, JobStatus::Launching);
    assert!(state.view().jobs[0].endpoint.is_some());
    assert_eq!(effects, vec![Effect::ArmJobPolling { job_id: job_id() }]);

    let (state, sub) = subscribe(state, 3);
    let (state, effects) = polled(state, sub, JobStatus::Waiting, 0, 0, 0);
    assert!(effects.is_empty());
    assert_eq!(state.view().jobs[0].status, JobStatus::Waiting);

    // Already polled, so confirming start does not arm a second poller.
    let (state, effects) = confirm(state, JobAction::Start);
    assert!(effects.is_empty());
    assert_eq!(state.view().jobs[0].status, JobStatus::Running);
}

#[test]
fn stop_releases_the_poller_and_keeps_counters() {
    init_logging();
    let state = created(JobMode::HeadlessApi, 4);
    let (state, _) = confirm(state, JobAction::Start);
    let (state, sub) = subscribe(state, 7);
    let (state, _) = polled(state, sub, JobStatus::Running, 2, 1, 1);

    let (state, effects) = confirm(state, JobAction::Stop);
    let row = &state.view().jobs[0];
    assert_eq!(row.status, JobStatus::Stopped);
    assert_eq!((row.current_index, row.passed_count, row.error_count), (2, 1, 1));
    assert!(effects.contains(&Effect::Release {
        key: ResourceKey::Job(job_id()),
        sub
    }));

    // A late poll after stop changes nothing.
    let (after, _) = polled(state.clone(), sub, JobStatus::Running, 3, 2, 1);
    assert_eq!(after.view().jobs, state.view().jobs);
}

#[test]
fn snapshot_from_released_subscription_is_discarded() {
    init_logging();
    let state = created(JobMode::HeadlessApi, 5);
    let (state, _) = confirm(state, JobAction::Start);
    let (state, old) = subscribe(state, 1);
    let (state, _) = update(
        state,
        Msg::SubscriptionReleased {
            key: ResourceKey::Job(job_id()),
            sub: old,
        },
    );

    let (mut state, effects) = polled(state, old, JobStatus::Running, 3, 3, 0);
    assert!(effects.is_empty());
    assert_eq!(state.view().jobs[0].current_index, 0);
    state.consume_dirty();

    let (state, fresh) = subscribe(state, 2);
    let (state, _) = polled(state, fresh, JobStatus::Running, 3, 3, 0);
    assert_eq!(state.view().jobs[0].current_index, 3);
}

#[test]
fn out_of_order_poll_is_dropped() {
    init_logging();
    let state = created(JobMode::HeadlessApi, 5);
    let (state, _) = confirm(state, JobAction::Start);
    let (state, sub) = subscribe(state, 1);
    let (state, _) = polled(state, sub, JobStatus::Running, 4, 3, 1);
    let (mut state, _) = polled(state, sub, JobStatus::Running, 2, 2, 0);
    state.consume_dirty();

    let row = &state.view().jobs[0];
    assert_eq!((row.current_index, row.passed_count, row.error_count), (4, 3, 1));
    assert!(!state.consume_dirty());
}

#[test]
fn poll_failure_threshold_marks_job_error() {
    init_logging();
    let state = created(JobMode::HeadlessApi, 5);
    let (state, _) = confirm(state, JobAction::Start);
    let (state, sub) = subscribe(state, 9);
    let (state, effects) = update(
        state,
        Msg::JobPollFailed {
            sub,
            job_id: job_id(),
            code: ReasonCode::Timeout,
            message: "status request timed out".into(),
            at: Utc::now(),
        },
    );

    let row = &state.view().jobs[0];
    assert_eq!(row.status, JobStatus::Error);
    assert_eq!(row.last_error.as_deref(), Some("status request timed out"));
    assert!(effects.contains(&Effect::Notify(Notice::Failure {
        resource: ResourceKey::Job(job_id()),
        code: ReasonCode::Timeout,
        message: "status request timed out".into(),
    })));
}

#[test]
fn delete_removes_job() {
    init_logging();
    let state = created(JobMode::HeadlessApi, 1);
    let (state, _) = confirm(state, JobAction::Start);
    let (state, _) = confirm(state, JobAction::Stop);
    let (state, effects) = update(state, Msg::JobDeleted { job_id: job_id() });

    assert!(state.view().jobs.is_empty());
    assert!(effects.is_empty());
}
