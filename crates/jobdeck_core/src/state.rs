use std::collections::{BTreeMap, HashMap};

use crate::view_model::{AppViewModel, BulkView, JobRowView, VmView};
use crate::{BulkReplyOperation, Job, JobId, ResourceKey, ServiceAvailability, SubscriptionId};

/// Every record the reducer owns. Nothing else writes to these.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppState {
    jobs: BTreeMap<JobId, Job>,
    bulk: Option<BulkReplyOperation>,
    vm: ServiceAvailability,
    subscriptions: HashMap<ResourceKey, SubscriptionId>,
    dirty: bool,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(&self, job_id: &JobId) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn bulk(&self) -> Option<&BulkReplyOperation> {
        self.bulk.as_ref()
    }

    pub fn vm(&self) -> &ServiceAvailability {
        &self.vm
    }

    /// Current subscription on a resource, if any.
    pub fn subscription(&self, key: &ResourceKey) -> Option<SubscriptionId> {
        self.subscriptions.get(key).copied()
    }

    pub fn is_current(&self, key: &ResourceKey, sub: SubscriptionId) -> bool {
        self.subscription(key) == Some(sub)
    }

    pub fn view(&self) -> AppViewModel {
        AppViewModel {
            jobs: self.jobs.values().map(JobRowView::from_job).collect(),
            bulk: self.bulk.as_ref().map(BulkView::from_operation),
            vm: VmView::from_availability(&self.vm),
            dirty: self.dirty,
        }
    }

    /// Returns whether anything changed since the last call, and resets the flag.
    pub fn consume_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn job_mut(&mut self, job_id: &JobId) -> Option<&mut Job> {
        self.jobs.get_mut(job_id)
    }

    pub(crate) fn insert_job(&mut self, job: Job) {
        self.jobs.insert(job.id().clone(), job);
    }

    pub(crate) fn remove_job(&mut self, job_id: &JobId) -> Option<Job> {
        self.jobs.remove(job_id)
    }

    pub(crate) fn bulk_mut(&mut self) -> Option<&mut BulkReplyOperation> {
        self.bulk.as_mut()
    }

    pub(crate) fn set_bulk(&mut self, operation: BulkReplyOperation) {
        self.bulk = Some(operation);
    }

    pub(crate) fn vm_mut(&mut self) -> &mut ServiceAvailability {
        &mut self.vm
    }

    pub(crate) fn set_subscription(&mut self, key: ResourceKey, sub: SubscriptionId) {
        self.subscriptions.insert(key, sub);
    }

    pub(crate) fn clear_subscription(&mut self, key: &ResourceKey) {
        self.subscriptions.remove(key);
    }
}
