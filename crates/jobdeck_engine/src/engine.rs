use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use deck_logging::{deck_debug, deck_info, deck_warn};
use jobdeck_core::{
    AppViewModel, BulkEvent, Effect, ItemResult, Job, JobAction, JobId, JobKind, JobMode,
    JobSnapshot, JobStatus, MessageId, Msg, Notice, ResourceKey, SubscriptionId, VmAction,
    VmSnapshot, VmStatus,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::client::{BackendSettings, JobBackend, ReqwestBackend};
use crate::demo::{DemoBackend, DemoSettings};
use crate::guard::{LeaseObserver, ResourceGuard, SubscriptionHandle};
use crate::poll::{PollScheduler, PollSettings, PollTarget};
use crate::select::SelectingBackend;
use crate::store::Store;
use crate::stream::{BulkSink, EventStreamConsumer, StreamSettings};
use crate::{BackendKind, CreateJobRequest, FailureKind, OpError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub backend: BackendSettings,
    pub job_polling: PollSettings,
    pub vm_polling: PollSettings,
    /// How long a VM start (or stop) may stay unconfirmed before polling gives up.
    /// An unfinished start surfaces as `StartTimedOut`.
    pub vm_start_ceiling: Duration,
    pub stream: StreamSettings,
    pub demo: DemoSettings,
    /// Skip the live backend even when one is configured.
    pub force_demo: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            backend: BackendSettings::default(),
            job_polling: PollSettings::jobs(),
            vm_polling: PollSettings::vm(),
            vm_start_ceiling: Duration::from_secs(120),
            stream: StreamSettings::default(),
            demo: DemoSettings::default(),
            force_demo: false,
        }
    }
}

/// The surface the CLI (or any UI) drives. Outcomes are values, notices, or `OpError`.
pub struct EngineHandle {
    shared: Arc<Shared>,
}

struct Shared {
    store: Store,
    guard: ResourceGuard,
    scheduler: PollScheduler,
    consumer: EventStreamConsumer,
    backend: Arc<dyn JobBackend>,
    settings: EngineSettings,
    handles: Mutex<HashMap<ResourceKey, SubscriptionHandle>>,
}

impl EngineHandle {
    /// Builds the live/demo backend pair from `settings` and selects between them on first use.
    pub fn connect(settings: EngineSettings) -> Self {
        let demo: Arc<dyn JobBackend> = Arc::new(DemoBackend::new(settings.demo.clone()));
        let live: Option<Arc<dyn JobBackend>> = if settings.force_demo {
            None
        } else if settings.backend.base_url.is_some() {
            match ReqwestBackend::new(settings.backend.clone()) {
                Ok(backend) => {
                    deck_info!("Backend configured at {}", backend.base_url());
                    Some(Arc::new(backend))
                }
                Err(err) => {
                    deck_warn!("Backend client unavailable: {}", err);
                    None
                }
            }
        } else {
            None
        };
        let backend = Arc::new(SelectingBackend::new(live, demo));
        Self::with_backend(settings, backend)
    }

    pub fn with_backend(settings: EngineSettings, backend: Arc<dyn JobBackend>) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let observer: Weak<dyn LeaseObserver> = weak.clone();
            let guard = ResourceGuard::new(observer);
            Shared {
                store: Store::new(),
                scheduler: PollScheduler::new(guard.clone()),
                consumer: EventStreamConsumer::new(guard.clone(), settings.stream.clone()),
                guard,
                backend,
                settings,
                handles: Mutex::new(HashMap::new()),
            }
        });
        Self { shared }
    }

    pub fn mode(&self) -> BackendKind {
        self.shared.backend.backend_kind()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.shared.settings
    }

    pub async fn create_job(
        &self,
        kind: JobKind,
        mode: JobMode,
        items: Vec<String>,
    ) -> Result<JobId, OpError> {
        let items: Vec<String> = items
            .into_iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect();
        if items.is_empty() {
            return Err(OpError::new(
                FailureKind::InvalidInput,
                "a job needs at least one item",
            ));
        }
        let request = CreateJobRequest { kind, mode, items };
        let created = self.shared.backend.create_job(&request).await?;
        deck_info!(
            "Created job {} ({} items, {:?}, {:?})",
            created.id,
            created.total_items,
            kind,
            mode
        );
        let job = Job::new(
            created.id.clone(),
            kind,
            mode,
            created.total_items,
            Utc::now(),
        );
        self.shared.dispatch(Msg::JobCreated { job });
        Ok(created.id)
    }

    /// Validates locally, makes one backend call, then records the confirmed transition.
    ///
    /// A failed call leaves the job exactly as it was.
    pub async fn control_job(&self, job_id: &JobId, action: JobAction) -> Result<JobStatus, OpError> {
        let job = self.shared.job(job_id).ok_or_else(|| unknown_job(job_id))?;
        job.check_action(action)?;
        deck_info!("{} job {} (currently {})", action, job_id, job.status());

        let backend = &self.shared.backend;
        let outcome = match action {
            JobAction::Launch => backend.launch_job(job_id).await,
            JobAction::Delete => backend.delete_job(job_id).await.map(|()| Default::default()),
            other => backend.control_job(job_id, other).await,
        };
        let ack = outcome.inspect_err(|err| {
            deck_warn!("{} job {} failed: {}", action, job_id, err);
        })?;

        if action == JobAction::Delete {
            self.shared.dispatch(Msg::JobDeleted {
                job_id: job_id.clone(),
            });
            self.shared.drop_handle(&ResourceKey::Job(job_id.clone()));
            return Ok(job.status());
        }
        self.shared.dispatch(Msg::ControlConfirmed {
            job_id: job_id.clone(),
            action,
            ack,
            at: Utc::now(),
        });
        Ok(self
            .shared
            .job(job_id)
            .map(|job| job.status())
            .unwrap_or(job.status()))
    }

    /// Starts polling a job. Fails with `AlreadySubscribed` if it is already polled.
    pub fn subscribe_job_status(&self, job_id: &JobId) -> Result<SubscriptionId, OpError> {
        if self.shared.job(job_id).is_none() {
            return Err(unknown_job(job_id));
        }
        self.shared.arm_job(job_id.clone())
    }

    pub fn unsubscribe_job_status(&self, job_id: &JobId) -> bool {
        self.shared.drop_handle(&ResourceKey::Job(job_id.clone()))
    }

    pub async fn job_results(&self, job_id: &JobId) -> Result<Vec<ItemResult>, OpError> {
        self.shared.backend.job_results(job_id).await
    }

    /// Opens the bulk reply stream. Duplicate ids are sent once.
    pub async fn start_bulk_reply(&self, message_ids: Vec<MessageId>) -> Result<SubscriptionId, OpError> {
        let mut unique: Vec<MessageId> = Vec::with_capacity(message_ids.len());
        for id in message_ids {
            if !id.as_str().trim().is_empty() && !unique.contains(&id) {
                unique.push(id);
            }
        }
        if unique.is_empty() {
            return Err(OpError::new(
                FailureKind::InvalidInput,
                "bulk reply needs at least one message id",
            ));
        }
        let sink: Arc<dyn BulkSink> = Arc::new(StoreSink(self.shared.clone()));
        let handle = self
            .shared
            .consumer
            .open(self.shared.backend.as_ref(), unique, sink)
            .await?;
        let sub = handle.id();
        self.shared.keep_handle(handle);
        Ok(sub)
    }

    /// Cancels the running bulk reply. Once this returns no further event is applied.
    pub fn cancel_bulk_reply(&self) -> bool {
        let released = self.shared.drop_handle(&ResourceKey::BulkReply);
        if released {
            deck_info!("Bulk reply cancelled");
        }
        released
    }

    pub async fn refresh_vm(&self) -> Result<VmStatus, OpError> {
        let snapshot = self.shared.backend.vm_status().await?;
        self.shared.dispatch(Msg::VmPolled {
            sub: None,
            snapshot,
        });
        Ok(self.shared.vm_status())
    }

    /// Requests a VM start and polls it until running or the start ceiling elapses.
    pub async fn start_vm(&self) -> Result<VmStatus, OpError> {
        self.control_vm(VmAction::Start).await
    }

    pub async fn stop_vm(&self) -> Result<VmStatus, OpError> {
        self.control_vm(VmAction::Stop).await
    }

    async fn control_vm(&self, action: VmAction) -> Result<VmStatus, OpError> {
        // A fresh session knows nothing about the VM yet; ask before judging the action.
        if !self.shared.store.read(|state| state.vm().is_observed()) {
            self.refresh_vm().await?;
        }
        self.shared
            .store
            .read(|state| state.vm().check(action))?;
        deck_info!("{} vm (currently {})", action, self.shared.vm_status());
        let outcome = match action {
            VmAction::Start => self.shared.backend.vm_start().await,
            VmAction::Stop => self.shared.backend.vm_stop().await,
        };
        outcome.inspect_err(|err| deck_warn!("{} vm failed: {}", action, err))?;

        // The new flow gets its own poller and ceiling.
        self.shared.drop_handle(&ResourceKey::Vm);
        self.shared.dispatch(Msg::VmControlConfirmed { action });
        Ok(self.shared.vm_status())
    }

    pub fn view(&self) -> AppViewModel {
        self.shared.store.view()
    }

    pub fn job(&self, job_id: &JobId) -> Option<Job> {
        self.shared.job(job_id)
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.shared.store.notices()
    }

    /// Whether a poller or stream currently holds `key`.
    pub fn is_subscribed(&self, key: &ResourceKey) -> bool {
        self.shared.guard.is_held(key)
    }

    /// Cancels every poller and stream. Further subscriptions are refused.
    pub fn shutdown(&self) {
        if self.shared.guard.is_shut_down() {
            return;
        }
        deck_info!("Engine shutting down");
        self.shared.guard.shutdown();
        let handles: Vec<SubscriptionHandle> = self
            .shared
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        drop(handles);
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn unknown_job(job_id: &JobId) -> OpError {
    OpError::new(FailureKind::InvalidInput, format!("unknown job {job_id}"))
}

impl Shared {
    fn dispatch(self: &Arc<Self>, msg: Msg) {
        let effects = self.store.dispatch(msg);
        self.run(effects);
    }

    fn run(self: &Arc<Self>, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Release { key, sub } => {
                    self.guard.release(&key, sub);
                    self.forget_handle(&key, sub);
                }
                Effect::ArmJobPolling { job_id } => {
                    if let Err(err) = self.arm_job(job_id) {
                        deck_debug!("Job polling not armed: {}", err);
                    }
                }
                Effect::ArmVmPolling => {
                    if let Err(err) = self.arm_vm() {
                        deck_debug!("VM polling not armed: {}", err);
                    }
                }
                Effect::Notify(notice) => self.store.publish(notice),
            }
        }
    }

    fn job(&self, job_id: &JobId) -> Option<Job> {
        self.store.read(|state| state.job(job_id).cloned())
    }

    fn vm_status(&self) -> VmStatus {
        self.store.read(|state| state.vm().vm_status())
    }

    fn arm_job(self: &Arc<Self>, job_id: JobId) -> Result<SubscriptionId, OpError> {
        let target = JobPollTarget {
            shared: self.clone(),
            job_id: job_id.clone(),
            epoch: 0,
        };
        let handle = self.scheduler.subscribe(
            ResourceKey::Job(job_id),
            target,
            self.settings.job_polling.clone(),
        )?;
        let sub = handle.id();
        self.keep_handle(handle);
        Ok(sub)
    }

    fn arm_vm(self: &Arc<Self>) -> Result<SubscriptionId, OpError> {
        let mut settings = self.settings.vm_polling.clone();
        if self.store.read(|state| state.vm().pending().is_some()) {
            settings = settings.with_ceiling(self.settings.vm_start_ceiling);
        }
        let target = VmPollTarget {
            shared: self.clone(),
        };
        let handle = self.scheduler.subscribe(ResourceKey::Vm, target, settings)?;
        let sub = handle.id();
        self.keep_handle(handle);
        Ok(sub)
    }

    fn keep_handle(&self, handle: SubscriptionHandle) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        // The loop may already have settled and released before we got here.
        let (previous, finished) = if handle.is_active() {
            (handles.insert(handle.key().clone(), handle), None)
        } else {
            (None, Some(handle))
        };
        drop(handles);
        // Dropped outside the lock: releasing re-enters the store.
        drop(previous);
        drop(finished);
    }

    /// Releases whatever holds `key`. Returns whether a live lease was released.
    fn drop_handle(&self, key: &ResourceKey) -> bool {
        let handle = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        match handle {
            Some(handle) if handle.is_active() => handle.release(),
            _ => self
                .guard
                .current(key)
                .is_some_and(|sub| self.guard.release(key, sub)),
        }
    }

    fn forget_handle(&self, key: &ResourceKey, sub: SubscriptionId) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        let stale = match handles.get(key) {
            Some(handle) if handle.id() == sub => handles.remove(key),
            _ => None,
        };
        drop(handles);
        drop(stale);
    }
}

impl LeaseObserver for Shared {
    fn acquired(&self, key: &ResourceKey, sub: SubscriptionId) {
        // Subscribing never produces effects.
        let effects = self.store.dispatch(Msg::Subscribed {
            key: key.clone(),
            sub,
        });
        debug_assert!(effects.is_empty());
    }

    fn released(&self, key: &ResourceKey, sub: SubscriptionId) {
        let effects = self.store.dispatch(Msg::SubscriptionReleased {
            key: key.clone(),
            sub,
        });
        // Only notices follow a release; nothing here re-arms.
        for effect in effects {
            if let Effect::Notify(notice) = effect {
                self.store.publish(notice);
            }
        }
    }
}

struct JobPollTarget {
    shared: Arc<Shared>,
    job_id: JobId,
    /// Job epoch when the current request was issued.
    epoch: u64,
}

#[async_trait::async_trait]
impl PollTarget for JobPollTarget {
    type Update = JobSnapshot;

    async fn fetch(&mut self) -> Result<JobSnapshot, OpError> {
        self.epoch = self
            .shared
            .store
            .read(|state| state.job(&self.job_id).map(Job::epoch).unwrap_or_default());
        self.shared.backend.job_status(&self.job_id).await
    }

    fn apply(&mut self, sub: SubscriptionId, snapshot: JobSnapshot) {
        self.shared.dispatch(Msg::JobPolled {
            sub,
            job_id: self.job_id.clone(),
            epoch: self.epoch,
            snapshot,
            at: Utc::now(),
        });
    }

    fn is_live(&self) -> bool {
        self.shared
            .store
            .read(|state| state.job(&self.job_id).is_some_and(|job| job.status().is_live()))
    }

    fn fail(&mut self, sub: SubscriptionId, error: OpError) {
        self.shared.dispatch(Msg::JobPollFailed {
            sub,
            job_id: self.job_id.clone(),
            code: error.code(),
            message: error.message,
            at: Utc::now(),
        });
    }
}

struct VmPollTarget {
    shared: Arc<Shared>,
}

#[async_trait::async_trait]
impl PollTarget for VmPollTarget {
    type Update = VmSnapshot;

    async fn fetch(&mut self) -> Result<VmSnapshot, OpError> {
        self.shared.backend.vm_status().await
    }

    fn apply(&mut self, sub: SubscriptionId, snapshot: VmSnapshot) {
        self.shared.dispatch(Msg::VmPolled {
            sub: Some(sub),
            snapshot,
        });
    }

    fn is_live(&self) -> bool {
        self.shared.vm_status().is_transitional()
    }

    fn fail(&mut self, sub: SubscriptionId, error: OpError) {
        self.shared.dispatch(Msg::VmPollFailed {
            sub,
            code: error.code(),
            message: error.message,
        });
    }

    fn time_out(&mut self, sub: SubscriptionId) {
        self.shared.dispatch(Msg::VmPollTimedOut { sub });
    }
}

/// Feeds stream consumer output into the store.
struct StoreSink(Arc<Shared>);

impl BulkSink for StoreSink {
    fn started(&self, sub: SubscriptionId, message_ids: Vec<MessageId>) {
        self.0.dispatch(Msg::BulkStarted { sub, message_ids });
    }

    fn event(&self, sub: SubscriptionId, event: BulkEvent) {
        self.0.dispatch(Msg::BulkEvent { sub, event });
    }

    fn decode_failed(&self, sub: SubscriptionId, message: String) {
        self.0.dispatch(Msg::BulkDecodeFailed { sub, message });
    }

    fn failed(&self, sub: SubscriptionId, error: OpError) {
        self.0.dispatch(Msg::BulkStreamFailed {
            sub,
            code: error.code(),
            message: error.message,
        });
    }
}
