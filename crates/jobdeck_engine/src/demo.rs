//! In-memory backend used when no real backend is configured or reachable.
//!
//! Progress is derived from elapsed time on tokio's clock, so paused-time tests
//! can drive a whole job by advancing the clock.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use deck_logging::deck_debug;
use futures_util::stream::{self, StreamExt};
use jobdeck_core::{
    BulkEvent, ControlAck, FailureOutcome, ItemOutcome, ItemResult, JobAction, JobId, JobMode,
    JobSnapshot, JobStatus, MessageId, VmSnapshot, VmStatus,
};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use url::Url;

use crate::stream::EventLines;
use crate::{BackendKind, CreateJobRequest, CreatedJob, FailureKind, JobBackend, OpError};

/// Scripted outcomes. Anything not listed succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoScript {
    pub failing_items: Vec<String>,
    pub skipped_items: Vec<String>,
    pub failing_messages: Vec<MessageId>,
    pub unmapped_messages: Vec<MessageId>,
    pub messages_without_video: Vec<MessageId>,
}

impl DemoScript {
    fn item_outcome(&self, item: &str) -> ItemOutcome {
        if self.failing_items.iter().any(|failing| failing == item) {
            ItemOutcome::Failed
        } else if self.skipped_items.iter().any(|skipped| skipped == item) {
            ItemOutcome::Skipped
        } else {
            ItemOutcome::Passed
        }
    }

    fn reply_event(&self, message_id: &MessageId) -> BulkEvent {
        let outcome = if self.unmapped_messages.contains(message_id) {
            FailureOutcome::NoMapping
        } else if self.messages_without_video.contains(message_id) {
            FailureOutcome::NoVideo
        } else if self.failing_messages.contains(message_id) {
            FailureOutcome::Failed
        } else {
            return BulkEvent::Replied {
                message_id: message_id.clone(),
            };
        };
        let error = match outcome {
            FailureOutcome::NoMapping => "no tracking number mapped to this message",
            FailureOutcome::NoVideo => "no recording found for this shipment",
            FailureOutcome::Failed => "reply could not be sent",
        };
        BulkEvent::Failed {
            message_id: message_id.clone(),
            error: error.to_string(),
            outcome,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoSettings {
    /// Time to process one job item or one bulk message.
    pub item_cadence: Duration,
    /// Time an interactive job spends launching before it waits for start.
    pub launch_delay: Duration,
    pub vm_boot_time: Duration,
    pub vm_stop_time: Duration,
    pub vm_endpoint: String,
    pub job_endpoint: String,
    pub script: DemoScript,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            item_cadence: Duration::from_millis(1500),
            launch_delay: Duration::from_secs(3),
            vm_boot_time: Duration::from_secs(12),
            vm_stop_time: Duration::from_secs(4),
            vm_endpoint: "https://demo.jobdeck.invalid/vm".to_string(),
            job_endpoint: "https://demo.jobdeck.invalid/session".to_string(),
            script: DemoScript::default(),
        }
    }
}

/// An unparsable configured endpoint is reported as absent.
fn endpoint(raw: &str) -> Option<Url> {
    Url::parse(raw).ok()
}

pub struct DemoBackend {
    settings: DemoSettings,
    state: Mutex<DemoState>,
}

#[derive(Default)]
struct DemoState {
    next_id: u64,
    jobs: HashMap<JobId, DemoJob>,
    vm: DemoVm,
}

struct DemoJob {
    mode: JobMode,
    items: Vec<String>,
    status: JobStatus,
    results: Vec<ItemResult>,
    /// When the next item started processing; `None` unless running.
    checkpoint: Option<Instant>,
    launched_at: Option<Instant>,
    started_at: Option<chrono::DateTime<Utc>>,
    completed_at: Option<chrono::DateTime<Utc>>,
}

struct DemoVm {
    status: VmStatus,
    changed_at: Instant,
}

impl Default for DemoVm {
    fn default() -> Self {
        Self {
            status: VmStatus::Stopped,
            changed_at: Instant::now(),
        }
    }
}

impl DemoJob {
    fn advance(&mut self, settings: &DemoSettings, now: Instant) {
        if self.status == JobStatus::Launching {
            if let Some(launched) = self.launched_at {
                if now.duration_since(launched) >= settings.launch_delay {
                    self.status = JobStatus::Waiting;
                }
            }
        }
        let Some(mut checkpoint) = self.checkpoint else {
            return;
        };
        let cadence = settings.item_cadence.max(Duration::from_millis(1));
        while self.results.len() < self.items.len() && now.duration_since(checkpoint) >= cadence {
            let index = self.results.len();
            let item = self.items[index].clone();
            let outcome = settings.script.item_outcome(&item);
            let detail = (outcome == ItemOutcome::Failed).then(|| format!("check failed for {item}"));
            self.results.push(ItemResult {
                index: index as u32,
                item,
                outcome,
                detail,
            });
            checkpoint += cadence;
        }
        self.checkpoint = Some(checkpoint);
        if self.results.len() == self.items.len() {
            self.finish(JobStatus::Completed);
        }
    }

    fn finish(&mut self, status: JobStatus) {
        self.status = status;
        self.checkpoint = None;
        self.completed_at = Some(Utc::now());
    }

    fn count(&self, outcome: ItemOutcome) -> u32 {
        self.results.iter().filter(|r| r.outcome == outcome).count() as u32
    }

    fn snapshot(&self, settings: &DemoSettings) -> JobSnapshot {
        let endpoint = (self.mode == JobMode::InteractiveBrowser
            && !self.status.is_terminal()
            && self.status != JobStatus::Pending)
            .then(|| endpoint(&settings.job_endpoint))
            .flatten();
        JobSnapshot {
            status: self.status,
            current_index: self.results.len() as u32,
            passed_count: self.count(ItemOutcome::Passed),
            error_count: self.count(ItemOutcome::Failed),
            total_items: Some(self.items.len() as u32),
            endpoint,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: None,
        }
    }
}

impl DemoVm {
    fn advance(&mut self, settings: &DemoSettings, now: Instant) {
        let elapsed = now.duration_since(self.changed_at);
        let next = match self.status {
            VmStatus::Staging if elapsed >= settings.vm_boot_time => VmStatus::Running,
            VmStatus::Stopping if elapsed >= settings.vm_stop_time => VmStatus::Stopped,
            _ => return,
        };
        self.status = next;
        self.changed_at = now;
    }

    fn set(&mut self, status: VmStatus) {
        self.status = status;
        self.changed_at = Instant::now();
    }
}

impl DemoBackend {
    pub fn new(settings: DemoSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(DemoState::default()),
        }
    }

    pub fn settings(&self) -> &DemoSettings {
        &self.settings
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DemoState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` on an up-to-date job.
    fn with_job<T>(
        &self,
        job_id: &JobId,
        f: impl FnOnce(&mut DemoJob, &DemoSettings) -> Result<T, OpError>,
    ) -> Result<T, OpError> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| OpError::rejected(404, format!("job {job_id} not found")))?;
        job.advance(&self.settings, Instant::now());
        f(job, &self.settings)
    }
}

fn refuse(status: JobStatus, action: &str) -> OpError {
    OpError::rejected(409, format!("cannot {action} a job that is {status}"))
}

#[async_trait::async_trait]
impl JobBackend for DemoBackend {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Demo
    }

    async fn create_job(&self, request: &CreateJobRequest) -> Result<CreatedJob, OpError> {
        if request.items.is_empty() {
            return Err(OpError::rejected(422, "a job needs at least one item"));
        }
        let mut state = self.lock();
        state.next_id += 1;
        let id = JobId::new(format!("demo-{}", state.next_id));
        state.jobs.insert(
            id.clone(),
            DemoJob {
                mode: request.mode,
                items: request.items.clone(),
                status: JobStatus::Pending,
                results: Vec::new(),
                checkpoint: None,
                launched_at: None,
                started_at: None,
                completed_at: None,
            },
        );
        deck_debug!("Demo created {} with {} items", id, request.items.len());
        Ok(CreatedJob {
            id,
            total_items: request.items.len() as u32,
        })
    }

    async fn launch_job(&self, job_id: &JobId) -> Result<ControlAck, OpError> {
        self.with_job(job_id, |job, settings| {
            if job.mode != JobMode::InteractiveBrowser || job.status != JobStatus::Pending {
                return Err(refuse(job.status, "launch"));
            }
            job.status = JobStatus::Launching;
            job.launched_at = Some(Instant::now());
            Ok(ControlAck {
                status: Some(JobStatus::Launching),
                endpoint: endpoint(&settings.job_endpoint),
            })
        })
    }

    async fn control_job(&self, job_id: &JobId, action: JobAction) -> Result<ControlAck, OpError> {
        self.with_job(job_id, |job, _| {
            let now = Instant::now();
            match (action, job.status) {
                (JobAction::Start, JobStatus::Waiting)
                    if job.mode == JobMode::InteractiveBrowser => {}
                (JobAction::Start, JobStatus::Pending) if job.mode == JobMode::HeadlessApi => {}
                (JobAction::Pause, JobStatus::Running) | (JobAction::Resume, JobStatus::Paused) => {}
                (
                    JobAction::Stop,
                    JobStatus::Running | JobStatus::Paused | JobStatus::Waiting | JobStatus::Launching,
                ) => {}
                (action, status) => return Err(refuse(status, action.as_str())),
            }
            match action {
                JobAction::Start | JobAction::Resume => {
                    job.status = JobStatus::Running;
                    job.checkpoint = Some(now);
                    job.started_at.get_or_insert_with(Utc::now);
                }
                JobAction::Pause => {
                    job.status = JobStatus::Paused;
                    job.checkpoint = None;
                }
                _ => job.finish(JobStatus::Stopped),
            }
            Ok(ControlAck {
                status: Some(job.status),
                endpoint: None,
            })
        })
    }

    async fn job_status(&self, job_id: &JobId) -> Result<JobSnapshot, OpError> {
        self.with_job(job_id, |job, settings| Ok(job.snapshot(settings)))
    }

    async fn job_results(&self, job_id: &JobId) -> Result<Vec<ItemResult>, OpError> {
        self.with_job(job_id, |job, _| Ok(job.results.clone()))
    }

    async fn delete_job(&self, job_id: &JobId) -> Result<(), OpError> {
        self.with_job(job_id, |job, _| {
            if job.status.is_terminal() {
                Ok(())
            } else {
                Err(refuse(job.status, "delete"))
            }
        })?;
        self.lock().jobs.remove(job_id);
        Ok(())
    }

    async fn vm_status(&self) -> Result<VmSnapshot, OpError> {
        let mut state = self.lock();
        state.vm.advance(&self.settings, Instant::now());
        let status = state.vm.status;
        Ok(VmSnapshot {
            status,
            endpoint: (status == VmStatus::Running)
                .then(|| endpoint(&self.settings.vm_endpoint))
                .flatten(),
        })
    }

    async fn vm_start(&self) -> Result<(), OpError> {
        let mut state = self.lock();
        state.vm.advance(&self.settings, Instant::now());
        match state.vm.status {
            VmStatus::Stopped | VmStatus::Terminated => {
                state.vm.set(VmStatus::Staging);
                Ok(())
            }
            other => Err(OpError::rejected(409, format!("vm is {other}"))),
        }
    }

    async fn vm_stop(&self) -> Result<(), OpError> {
        let mut state = self.lock();
        state.vm.advance(&self.settings, Instant::now());
        match state.vm.status {
            VmStatus::Running | VmStatus::Staging => {
                state.vm.set(VmStatus::Stopping);
                Ok(())
            }
            other => Err(OpError::rejected(409, format!("vm is {other}"))),
        }
    }

    async fn open_bulk_stream(&self, message_ids: &[MessageId]) -> Result<EventLines, OpError> {
        if message_ids.is_empty() {
            return Err(OpError::rejected(422, "no message ids given"));
        }
        let mut seen = HashSet::new();
        let unique: Vec<&MessageId> = message_ids.iter().filter(|id| seen.insert(*id)).collect();
        let cadence = self.settings.item_cadence;
        let mut script: Vec<(Duration, BulkEvent)> = vec![(
            Duration::ZERO,
            BulkEvent::Start {
                total: unique.len() as u32,
            },
        )];
        for (index, message_id) in unique.into_iter().enumerate() {
            script.push((
                cadence,
                BulkEvent::Progress {
                    current: index as u32 + 1,
                },
            ));
            script.push((Duration::ZERO, self.settings.script.reply_event(message_id)));
        }
        script.push((Duration::ZERO, BulkEvent::Complete));

        let lines = stream::iter(script).then(|(delay, event)| async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            serde_json::to_string(&event)
                .map_err(|err| OpError::new(FailureKind::StreamDecode, err.to_string()))
        });
        Ok(lines.boxed())
    }
}
