//! End-to-end flows through the engine facade against the demo backend, on paused time.

use std::time::Duration;

use jobdeck_core::{
    BulkEnd, JobAction, JobKind, JobMode, JobStatus, MessageId, Notice, ReasonCode, ReplyOutcome,
    ResourceKey, VmStatus,
};
use jobdeck_engine::{BackendKind, DemoScript, DemoSettings, EngineHandle, EngineSettings};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast::Receiver;

fn drain(rx: &mut Receiver<Notice>) -> Vec<Notice> {
    let mut notices = Vec::new();
    while let Ok(notice) = rx.try_recv() {
        notices.push(notice);
    }
    notices
}

fn engine_with(demo: DemoSettings) -> EngineHandle {
    EngineHandle::connect(EngineSettings {
        demo,
        ..EngineSettings::default()
    })
}

async fn wait(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

#[tokio::test(start_paused = true)]
async fn headless_job_runs_to_completion() {
    let engine = engine_with(DemoSettings::default());
    assert_eq!(engine.mode(), BackendKind::Demo);
    let mut notices = engine.notices();

    let items = ["A1", "A2", "A3", "A4", "A5"].map(String::from).to_vec();
    let job_id = engine
        .create_job(JobKind::PassCheck, JobMode::HeadlessApi, items)
        .await
        .unwrap();
    let status = engine.control_job(&job_id, JobAction::Start).await.unwrap();
    assert_eq!(status, JobStatus::Running);
    assert!(engine.is_subscribed(&ResourceKey::Job(job_id.clone())));

    // Polls land on even seconds; sample between them.
    wait(5).await;
    let row = engine.view().job(&job_id).cloned().unwrap();
    assert_eq!(row.status, JobStatus::Running);
    assert_eq!(row.current_index, 2);

    wait(7).await;
    let row = engine.view().job(&job_id).cloned().unwrap();
    assert_eq!(row.status, JobStatus::Completed);
    assert_eq!((row.current_index, row.passed_count, row.error_count), (5, 5, 0));
    assert_eq!(row.percent(), 100);
    assert!(!engine.is_subscribed(&ResourceKey::Job(job_id.clone())));
    assert_eq!(
        drain(&mut notices),
        vec![Notice::JobSettled {
            job_id: job_id.clone(),
            status: JobStatus::Completed
        }]
    );

    let results = engine.job_results(&job_id).await.unwrap();
    assert_eq!(results.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn interactive_job_launches_waits_and_pauses() {
    let engine = engine_with(DemoSettings::default());
    let job_id = engine
        .create_job(
            JobKind::ReturnToOrigin,
            JobMode::InteractiveBrowser,
            vec!["R1".into(), "R2".into(), "R3".into()],
        )
        .await
        .unwrap();

    let err = engine.control_job(&job_id, JobAction::Start).await.unwrap_err();
    assert_eq!(err.code(), ReasonCode::InvalidTransition);

    assert_eq!(
        engine.control_job(&job_id, JobAction::Launch).await.unwrap(),
        JobStatus::Launching
    );
    assert!(engine.view().job(&job_id).unwrap().endpoint.is_some());

    wait(5).await;
    assert_eq!(engine.view().job(&job_id).unwrap().status, JobStatus::Waiting);

    engine.control_job(&job_id, JobAction::Start).await.unwrap();
    wait(2).await;
    assert_eq!(
        engine.control_job(&job_id, JobAction::Pause).await.unwrap(),
        JobStatus::Paused
    );
    let paused_at = engine.view().job(&job_id).unwrap().current_index;

    wait(20).await;
    let row = engine.view().job(&job_id).cloned().unwrap();
    assert_eq!(row.status, JobStatus::Paused);
    assert_eq!(row.current_index, paused_at);

    engine.control_job(&job_id, JobAction::Resume).await.unwrap();
    wait(10).await;
    assert_eq!(engine.view().job(&job_id).unwrap().status, JobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn stop_then_delete_removes_the_job() {
    let engine = engine_with(DemoSettings::default());
    let job_id = engine
        .create_job(JobKind::Return, JobMode::HeadlessApi, vec!["X".into(), "Y".into()])
        .await
        .unwrap();
    engine.control_job(&job_id, JobAction::Start).await.unwrap();

    let err = engine.control_job(&job_id, JobAction::Delete).await.unwrap_err();
    assert_eq!(err.code(), ReasonCode::InvalidTransition);

    assert_eq!(
        engine.control_job(&job_id, JobAction::Stop).await.unwrap(),
        JobStatus::Stopped
    );
    assert!(!engine.is_subscribed(&ResourceKey::Job(job_id.clone())));

    engine.control_job(&job_id, JobAction::Delete).await.unwrap();
    assert!(engine.view().job(&job_id).is_none());
}

#[tokio::test(start_paused = true)]
async fn bulk_reply_reports_scripted_outcomes() {
    let engine = engine_with(DemoSettings {
        script: DemoScript {
            unmapped_messages: vec![MessageId::new("id2")],
            ..DemoScript::default()
        },
        ..DemoSettings::default()
    });
    let mut notices = engine.notices();

    let ids = ["id1", "id2", "id3", "id1"].map(MessageId::new).to_vec();
    engine.start_bulk_reply(ids).await.unwrap();
    wait(10).await;

    let bulk = engine.view().bulk.unwrap();
    assert!(!bulk.is_active);
    assert_eq!((bulk.completed, bulk.total), (3, 3));
    assert_eq!((bulk.replied, bulk.no_mapping), (2, 1));
    assert_eq!(bulk.results[1].outcome, ReplyOutcome::NoMapping);
    assert_eq!(
        drain(&mut notices),
        vec![Notice::BulkSettled {
            completed: 3,
            total: 3,
            end: BulkEnd::Complete
        }]
    );
    assert!(!engine.cancel_bulk_reply());
}

#[tokio::test(start_paused = true)]
async fn cancelled_bulk_reply_applies_nothing_more() {
    let engine = engine_with(DemoSettings::default());
    let mut notices = engine.notices();
    let ids = ["a", "b", "c"].map(MessageId::new).to_vec();
    engine.start_bulk_reply(ids.clone()).await.unwrap();

    wait(2).await;
    assert!(engine.cancel_bulk_reply());
    let at_cancel = engine.view().bulk.unwrap();
    assert!(at_cancel.cancelled);
    assert_eq!(at_cancel.results.len(), 1);

    wait(10).await;
    assert_eq!(engine.view().bulk.unwrap(), at_cancel);
    assert_eq!(
        drain(&mut notices),
        vec![Notice::BulkSettled {
            completed: 1,
            total: 3,
            end: BulkEnd::Cancelled
        }]
    );

    // A new operation may start once the old one is released.
    engine.start_bulk_reply(ids).await.unwrap();
    assert!(engine.view().bulk.unwrap().is_active);
}

#[tokio::test(start_paused = true)]
async fn vm_start_polls_until_running() {
    let engine = engine_with(DemoSettings::default());
    let mut notices = engine.notices();

    assert_eq!(engine.start_vm().await.unwrap(), VmStatus::Staging);
    assert!(engine.is_subscribed(&ResourceKey::Vm));
    wait(16).await;

    let vm = engine.view().vm;
    assert_eq!(vm.status, VmStatus::Running);
    assert!(vm.endpoint.is_some());
    assert!(!engine.is_subscribed(&ResourceKey::Vm));
    assert_eq!(
        drain(&mut notices),
        vec![Notice::VmSettled {
            status: VmStatus::Running
        }]
    );

    assert_eq!(engine.stop_vm().await.unwrap(), VmStatus::Stopping);
    wait(10).await;
    assert_eq!(engine.view().vm.status, VmStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn vm_that_never_boots_hits_the_start_ceiling() {
    let engine = engine_with(DemoSettings {
        vm_boot_time: Duration::from_secs(600),
        ..DemoSettings::default()
    });
    let mut notices = engine.notices();

    engine.start_vm().await.unwrap();
    wait(125).await;

    assert_eq!(engine.view().vm.status, VmStatus::Staging);
    assert!(!engine.is_subscribed(&ResourceKey::Vm));
    let notices = drain(&mut notices);
    assert!(matches!(
        notices.as_slice(),
        [Notice::Failure {
            resource: ResourceKey::Vm,
            code: ReasonCode::StartTimedOut,
            ..
        }]
    ));
}

#[tokio::test(start_paused = true)]
async fn empty_inputs_are_refused_locally() {
    let engine = engine_with(DemoSettings::default());
    let err = engine
        .create_job(JobKind::PassCheck, JobMode::HeadlessApi, vec!["  ".into()])
        .await
        .unwrap_err();
    assert_eq!(err.code(), ReasonCode::InvalidInput);
    let err = engine.start_bulk_reply(Vec::new()).await.unwrap_err();
    assert_eq!(err.code(), ReasonCode::InvalidInput);
}
