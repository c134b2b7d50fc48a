//! Jobdeck engine: backend client, pollers, the bulk event stream and the engine facade.
mod client;
mod demo;
mod engine;
mod guard;
mod poll;
mod select;
mod store;
mod stream;
mod types;

pub use client::{BackendSettings, JobBackend, ReqwestBackend};
pub use demo::{DemoBackend, DemoScript, DemoSettings};
pub use engine::{EngineHandle, EngineSettings};
pub use guard::{Lease, LeaseObserver, ResourceGuard, SubscriptionHandle};
pub use poll::{PollScheduler, PollSettings, PollTarget};
pub use select::SelectingBackend;
pub use store::Store;
pub use stream::{decode_lines, BulkSink, EventLines, EventStreamConsumer, LineDecoder, StreamSettings};
pub use types::{BackendKind, CreateJobRequest, CreatedJob, FailureKind, OpError};
