use crate::{JobId, JobStatus, ReasonCode, ResourceKey, SubscriptionId, VmStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// The resource left its live state; its lease must be released.
    Release { key: ResourceKey, sub: SubscriptionId },
    /// A confirmed control call made the job live and nothing polls it yet.
    ArmJobPolling { job_id: JobId },
    /// The VM entered a transitional state and nothing polls it yet.
    ArmVmPolling,
    Notify(Notice),
}

/// Something the caller should hear about, independent of view rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    JobSettled {
        job_id: JobId,
        status: JobStatus,
    },
    BulkSettled {
        completed: u32,
        total: u32,
        end: BulkEnd,
    },
    VmSettled {
        status: VmStatus,
    },
    Failure {
        resource: ResourceKey,
        code: ReasonCode,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkEnd {
    Complete,
    Failed(String),
    Cancelled,
}
