use deck_logging::{deck_debug, deck_warn};

use crate::{
    AppState, BulkEnd, BulkReplyOperation, BulkStep, Effect, JobAction, Msg, Notice, ReasonCode,
    ResourceKey, SnapshotOutcome, SubscriptionId, VmAction,
};

/// Pure update function: applies a message to state and returns any effects.
pub fn update(mut state: AppState, msg: Msg) -> (AppState, Vec<Effect>) {
    let effects = match msg {
        Msg::JobCreated { job } => {
            state.insert_job(job);
            state.mark_dirty();
            Vec::new()
        }
        Msg::ControlConfirmed {
            job_id,
            action,
            ack,
            at,
        } => {
            if action == JobAction::Delete {
                return (state, Vec::new());
            }
            let Some(job) = state.job_mut(&job_id) else {
                return (state, Vec::new());
            };
            if !job.confirm(action, &ack, at) {
                deck_debug!(
                    "{} on job {} superseded by status {}",
                    action,
                    job_id,
                    job.status()
                );
                return (state, Vec::new());
            }
            let status = job.status();
            state.mark_dirty();

            let key = ResourceKey::Job(job_id.clone());
            let mut effects = Vec::new();
            match state.subscription(&key) {
                None if status.is_live() => effects.push(Effect::ArmJobPolling { job_id }),
                Some(sub) if status.is_terminal() => {
                    effects.push(Effect::Release { key, sub });
                    effects.push(Effect::Notify(Notice::JobSettled { job_id, status }));
                }
                None if status.is_terminal() => {
                    effects.push(Effect::Notify(Notice::JobSettled { job_id, status }));
                }
                _ => {}
            }
            effects
        }
        Msg::JobDeleted { job_id } => {
            if state.remove_job(&job_id).is_some() {
                state.mark_dirty();
            }
            let key = ResourceKey::Job(job_id);
            match state.subscription(&key) {
                Some(sub) => vec![Effect::Release { key, sub }],
                None => Vec::new(),
            }
        }
        Msg::Subscribed { key, sub } => {
            state.set_subscription(key, sub);
            Vec::new()
        }
        Msg::SubscriptionReleased { key, sub } => {
            if !state.is_current(&key, sub) {
                return (state, Vec::new());
            }
            state.clear_subscription(&key);
            if key != ResourceKey::BulkReply {
                return (state, Vec::new());
            }
            let Some(op) = state.bulk_mut() else {
                return (state, Vec::new());
            };
            if !op.cancel() {
                return (state, Vec::new());
            }
            let notice = Notice::BulkSettled {
                completed: op.completed(),
                total: op.total(),
                end: BulkEnd::Cancelled,
            };
            state.mark_dirty();
            vec![Effect::Notify(notice)]
        }
        Msg::JobPolled {
            sub,
            job_id,
            epoch,
            snapshot,
            at,
        } => {
            let key = ResourceKey::Job(job_id.clone());
            if !owns(&state, &key, sub) {
                return (state, Vec::new());
            }
            let Some(job) = state.job_mut(&job_id) else {
                return (state, Vec::new());
            };
            let outcome = job.apply_snapshot(&snapshot, epoch, at);
            let status = job.status();
            match outcome {
                SnapshotOutcome::Applied => state.mark_dirty(),
                SnapshotOutcome::Stale | SnapshotOutcome::Frozen => {
                    deck_debug!("Dropped {:?} snapshot for job {}", outcome, job_id);
                }
                SnapshotOutcome::Rejected => {
                    deck_warn!(
                        "Rejected snapshot for job {}: {} -> {} at index {}",
                        job_id,
                        status,
                        snapshot.status,
                        snapshot.current_index
                    );
                }
            }

            let mut effects = Vec::new();
            if !status.is_live() {
                effects.push(Effect::Release { key, sub });
            }
            if status.is_terminal() && outcome == SnapshotOutcome::Applied {
                effects.push(Effect::Notify(Notice::JobSettled { job_id, status }));
            }
            effects
        }
        Msg::JobPollFailed {
            sub,
            job_id,
            code,
            message,
            at,
        } => {
            let key = ResourceKey::Job(job_id.clone());
            if !owns(&state, &key, sub) {
                return (state, Vec::new());
            }
            let mut effects = vec![Effect::Release {
                key: key.clone(),
                sub,
            }];
            effects.push(Effect::Notify(Notice::Failure {
                resource: key,
                code,
                message: message.clone(),
            }));
            if let Some(job) = state.job_mut(&job_id) {
                if job.fail(message, at) {
                    let status = job.status();
                    state.mark_dirty();
                    effects.push(Effect::Notify(Notice::JobSettled { job_id, status }));
                }
            }
            effects
        }
        Msg::BulkStarted { sub, message_ids } => {
            if !owns(&state, &ResourceKey::BulkReply, sub) {
                return (state, Vec::new());
            }
            state.set_bulk(BulkReplyOperation::new(message_ids));
            state.mark_dirty();
            Vec::new()
        }
        Msg::BulkEvent { sub, event } => {
            let key = ResourceKey::BulkReply;
            if !owns(&state, &key, sub) {
                return (state, Vec::new());
            }
            let Some(op) = state.bulk_mut() else {
                return (state, Vec::new());
            };
            match op.apply(&event) {
                BulkStep::Applied => {
                    state.mark_dirty();
                    Vec::new()
                }
                BulkStep::Ignored(reason) => {
                    deck_debug!("Ignored bulk {} event: {}", event.kind(), reason);
                    Vec::new()
                }
                BulkStep::Terminal => {
                    let end = match op.error() {
                        Some(message) => BulkEnd::Failed(message.to_owned()),
                        None => BulkEnd::Complete,
                    };
                    let notice = Notice::BulkSettled {
                        completed: op.completed(),
                        total: op.total(),
                        end,
                    };
                    state.mark_dirty();
                    vec![Effect::Release { key, sub }, Effect::Notify(notice)]
                }
            }
        }
        Msg::BulkDecodeFailed { sub, message } => {
            let key = ResourceKey::BulkReply;
            if !owns(&state, &key, sub) {
                return (state, Vec::new());
            }
            vec![Effect::Notify(Notice::Failure {
                resource: key,
                code: ReasonCode::StreamDecode,
                message,
            })]
        }
        Msg::BulkStreamFailed { sub, code, message } => {
            let key = ResourceKey::BulkReply;
            if !owns(&state, &key, sub) {
                return (state, Vec::new());
            }
            let mut effects = vec![
                Effect::Release {
                    key: key.clone(),
                    sub,
                },
                Effect::Notify(Notice::Failure {
                    resource: key,
                    code,
                    message: message.clone(),
                }),
            ];
            if let Some(op) = state.bulk_mut() {
                if op.fail(message.clone()) {
                    let notice = Notice::BulkSettled {
                        completed: op.completed(),
                        total: op.total(),
                        end: BulkEnd::Failed(message),
                    };
                    state.mark_dirty();
                    effects.push(Effect::Notify(notice));
                }
            }
            effects
        }
        Msg::VmControlConfirmed { action } => {
            state.vm_mut().begin(action);
            state.mark_dirty();
            if state.subscription(&ResourceKey::Vm).is_none() {
                vec![Effect::ArmVmPolling]
            } else {
                Vec::new()
            }
        }
        Msg::VmPolled { sub, snapshot } => {
            let key = ResourceKey::Vm;
            if let Some(sub) = sub {
                if !owns(&state, &key, sub) {
                    return (state, Vec::new());
                }
            }
            let changed = state.vm_mut().apply_snapshot(&snapshot);
            let status = state.vm().vm_status();
            let mut effects = Vec::new();
            if changed {
                state.mark_dirty();
            }
            match (sub, status.is_transitional()) {
                (Some(sub), false) => {
                    effects.push(Effect::Release { key, sub });
                    effects.push(Effect::Notify(Notice::VmSettled { status }));
                }
                (None, true) if state.subscription(&key).is_none() => {
                    effects.push(Effect::ArmVmPolling);
                }
                _ => {}
            }
            effects
        }
        Msg::VmPollFailed { sub, code, message } => {
            let key = ResourceKey::Vm;
            if !owns(&state, &key, sub) {
                return (state, Vec::new());
            }
            state.vm_mut().abandon();
            vec![
                Effect::Release {
                    key: key.clone(),
                    sub,
                },
                Effect::Notify(Notice::Failure {
                    resource: key,
                    code,
                    message,
                }),
            ]
        }
        Msg::VmPollTimedOut { sub } => {
            let key = ResourceKey::Vm;
            if !owns(&state, &key, sub) {
                return (state, Vec::new());
            }
            let status = state.vm().vm_status();
            let (code, message) = match state.vm_mut().abandon() {
                Some(VmAction::Stop) => (
                    ReasonCode::Timeout,
                    format!("vm still {status} when the stop ceiling elapsed"),
                ),
                _ => (
                    ReasonCode::StartTimedOut,
                    format!("vm still {status} when the start ceiling elapsed"),
                ),
            };
            vec![
                Effect::Release {
                    key: key.clone(),
                    sub,
                },
                Effect::Notify(Notice::Failure {
                    resource: key,
                    code,
                    message,
                }),
            ]
        }
    };

    (state, effects)
}

/// Whether `sub` still owns `key`. Messages from released subscriptions are dropped here.
fn owns(state: &AppState, key: &ResourceKey, sub: SubscriptionId) -> bool {
    let current = state.is_current(key, sub);
    if !current {
        deck_debug!("Discarding message for {} from released {}", key, sub);
    }
    current
}
