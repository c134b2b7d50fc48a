use chrono::{DateTime, Utc};

use crate::{
    BulkEvent, ControlAck, Job, JobAction, JobId, JobSnapshot, MessageId, ReasonCode, ResourceKey,
    SubscriptionId, VmAction, VmSnapshot,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Msg {
    /// Backend accepted `POST /jobs`.
    JobCreated { job: Job },
    /// Backend accepted a control call on a job.
    ControlConfirmed {
        job_id: JobId,
        action: JobAction,
        ack: ControlAck,
        at: DateTime<Utc>,
    },
    /// Backend accepted `DELETE /jobs/{id}`.
    JobDeleted { job_id: JobId },
    /// A lease was granted on a resource.
    Subscribed { key: ResourceKey, sub: SubscriptionId },
    /// A lease was released; later messages carrying `sub` are dropped.
    SubscriptionReleased { key: ResourceKey, sub: SubscriptionId },
    /// A status poll settled. `epoch` is the job epoch when the request was issued.
    JobPolled {
        sub: SubscriptionId,
        job_id: JobId,
        epoch: u64,
        snapshot: JobSnapshot,
        at: DateTime<Utc>,
    },
    /// Polling gave up after too many consecutive failures.
    JobPollFailed {
        sub: SubscriptionId,
        job_id: JobId,
        code: ReasonCode,
        message: String,
        at: DateTime<Utc>,
    },
    /// The bulk stream connected.
    BulkStarted {
        sub: SubscriptionId,
        message_ids: Vec<MessageId>,
    },
    /// One decoded stream event, in arrival order.
    BulkEvent { sub: SubscriptionId, event: BulkEvent },
    /// A stream line could not be decoded and was skipped.
    BulkDecodeFailed { sub: SubscriptionId, message: String },
    /// The stream broke before a terminal event.
    BulkStreamFailed {
        sub: SubscriptionId,
        code: ReasonCode,
        message: String,
    },
    /// Backend accepted `POST /vm/start` or `POST /vm/stop`.
    VmControlConfirmed { action: VmAction },
    /// A VM status request settled, polled or explicit.
    VmPolled {
        sub: Option<SubscriptionId>,
        snapshot: VmSnapshot,
    },
    VmPollFailed {
        sub: SubscriptionId,
        code: ReasonCode,
        message: String,
    },
    /// A pending start or stop was not reported done within the ceiling.
    VmPollTimedOut { sub: SubscriptionId },
}
