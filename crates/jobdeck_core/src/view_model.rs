use url::Url;

use crate::{
    BulkReplyOperation, BulkReplyResult, Job, JobId, JobKind, JobMode, JobStatus, ReplyOutcome,
    ServiceAvailability, VmStatus,
};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppViewModel {
    pub jobs: Vec<JobRowView>,
    pub bulk: Option<BulkView>,
    pub vm: VmView,
    pub dirty: bool,
}

impl AppViewModel {
    pub fn job(&self, job_id: &JobId) -> Option<&JobRowView> {
        self.jobs.iter().find(|row| &row.job_id == job_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRowView {
    pub job_id: JobId,
    pub kind: JobKind,
    pub mode: JobMode,
    pub status: JobStatus,
    pub total_items: u32,
    pub current_index: u32,
    pub passed_count: u32,
    pub error_count: u32,
    pub endpoint: Option<Url>,
    pub last_error: Option<String>,
}

impl JobRowView {
    pub(crate) fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id().clone(),
            kind: job.kind(),
            mode: job.mode(),
            status: job.status(),
            total_items: job.total_items(),
            current_index: job.current_index(),
            passed_count: job.passed_count(),
            error_count: job.error_count(),
            endpoint: job.endpoint().cloned(),
            last_error: job.last_error().map(ToOwned::to_owned),
        }
    }

    /// Whole-number completion percentage.
    pub fn percent(&self) -> u32 {
        if self.total_items == 0 {
            return 0;
        }
        (u64::from(self.current_index) * 100 / u64::from(self.total_items)) as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkView {
    pub is_active: bool,
    pub total: u32,
    pub completed: u32,
    pub replied: usize,
    pub failed: usize,
    pub no_mapping: usize,
    pub no_video: usize,
    pub results: Vec<BulkReplyResult>,
    pub error: Option<String>,
    pub cancelled: bool,
}

impl BulkView {
    pub(crate) fn from_operation(op: &BulkReplyOperation) -> Self {
        Self {
            is_active: op.is_active(),
            total: op.total(),
            completed: op.completed(),
            replied: op.count(ReplyOutcome::Replied),
            failed: op.count(ReplyOutcome::Failed),
            no_mapping: op.count(ReplyOutcome::NoMapping),
            no_video: op.count(ReplyOutcome::NoVideo),
            results: op.results().to_vec(),
            error: op.error().map(ToOwned::to_owned),
            cancelled: op.was_cancelled(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VmView {
    pub status: VmStatus,
    pub endpoint: Option<Url>,
}

impl VmView {
    pub(crate) fn from_availability(vm: &ServiceAvailability) -> Self {
        Self {
            status: vm.vm_status(),
            endpoint: vm.endpoint().cloned(),
        }
    }
}
