//! Jobdeck core: pure job/bulk/VM state machines and view-model helpers.
mod bulk;
mod effect;
mod error;
mod job;
mod msg;
mod state;
mod subscription;
mod update;
mod view_model;
mod vm;

pub use bulk::{
    BulkEvent, BulkReplyOperation, BulkReplyResult, BulkStep, FailureOutcome, MessageId,
    ReplyOutcome,
};
pub use effect::{BulkEnd, Effect, Notice};
pub use error::{InvalidTransition, ReasonCode};
pub use job::{
    ControlAck, ItemOutcome, ItemResult, Job, JobAction, JobId, JobKind, JobMode, JobSnapshot,
    JobStatus, SnapshotOutcome,
};
pub use msg::Msg;
pub use state::AppState;
pub use subscription::{ResourceKey, SubscriptionId};
pub use update::update;
pub use view_model::{AppViewModel, BulkView, JobRowView, VmView};
pub use vm::{ServiceAvailability, VmAction, VmSnapshot, VmStatus};
