use std::sync::{Arc, OnceLock};

use deck_logging::{deck_info, deck_warn};
use jobdeck_core::{ControlAck, ItemResult, JobAction, JobId, JobSnapshot, MessageId, VmSnapshot};

use crate::stream::EventLines;
use crate::{BackendKind, CreateJobRequest, CreatedJob, FailureKind, JobBackend, OpError};

/// Chooses between the live backend and the demo once per session.
///
/// Without a live backend the session is demo from the start. Otherwise the
/// first call decides: `Unreachable` switches to demo and re-issues the call
/// there, anything the backend actually answered pins live.
pub struct SelectingBackend {
    live: Option<Arc<dyn JobBackend>>,
    demo: Arc<dyn JobBackend>,
    choice: OnceLock<BackendKind>,
}

impl SelectingBackend {
    pub fn new(live: Option<Arc<dyn JobBackend>>, demo: Arc<dyn JobBackend>) -> Self {
        let choice = OnceLock::new();
        if live.is_none() {
            deck_info!("No backend configured, running in demo mode");
            let _ = choice.set(BackendKind::Demo);
        }
        Self { live, demo, choice }
    }

    /// `None` until the first call has settled the choice.
    pub fn selected(&self) -> Option<BackendKind> {
        self.choice.get().copied()
    }

    fn decided(&self) -> Option<&Arc<dyn JobBackend>> {
        match (self.choice.get(), self.live.as_ref()) {
            (Some(BackendKind::Live), Some(live)) => Some(live),
            (Some(_), _) | (None, None) => Some(&self.demo),
            (None, Some(_)) => None,
        }
    }

    fn undecided_live(&self) -> &Arc<dyn JobBackend> {
        self.live.as_ref().unwrap_or(&self.demo)
    }

    fn settle<T>(&self, result: &Result<T, OpError>) -> bool {
        match result {
            Err(err) if err.kind == FailureKind::Unreachable => {
                if self.choice.set(BackendKind::Demo).is_ok() {
                    deck_warn!("Backend unreachable ({}), switching to demo mode", err.message);
                }
                self.selected() == Some(BackendKind::Demo)
            }
            // A timeout says nothing about reachability; decide on a later call.
            Err(err) if err.kind == FailureKind::Timeout => false,
            _ => {
                if self.choice.set(BackendKind::Live).is_ok() {
                    deck_info!("Backend reachable, using live mode");
                }
                false
            }
        }
    }
}

/// Runs the call on the decided backend, or probes live and falls back.
macro_rules! route {
    ($self:ident, |$backend:ident| $call:expr) => {{
        match $self.decided() {
            Some($backend) => $call.await,
            None => {
                let $backend = $self.undecided_live();
                let result = $call.await;
                if $self.settle(&result) {
                    let $backend = &$self.demo;
                    $call.await
                } else {
                    result
                }
            }
        }
    }};
}

#[async_trait::async_trait]
impl JobBackend for SelectingBackend {
    fn backend_kind(&self) -> BackendKind {
        self.selected().unwrap_or(BackendKind::Live)
    }

    async fn create_job(&self, request: &CreateJobRequest) -> Result<CreatedJob, OpError> {
        route!(self, |backend| backend.create_job(request))
    }

    async fn launch_job(&self, job_id: &JobId) -> Result<ControlAck, OpError> {
        route!(self, |backend| backend.launch_job(job_id))
    }

    async fn control_job(&self, job_id: &JobId, action: JobAction) -> Result<ControlAck, OpError> {
        route!(self, |backend| backend.control_job(job_id, action))
    }

    async fn job_status(&self, job_id: &JobId) -> Result<JobSnapshot, OpError> {
        route!(self, |backend| backend.job_status(job_id))
    }

    async fn job_results(&self, job_id: &JobId) -> Result<Vec<ItemResult>, OpError> {
        route!(self, |backend| backend.job_results(job_id))
    }

    async fn delete_job(&self, job_id: &JobId) -> Result<(), OpError> {
        route!(self, |backend| backend.delete_job(job_id))
    }

    async fn vm_status(&self) -> Result<VmSnapshot, OpError> {
        route!(self, |backend| backend.vm_status())
    }

    async fn vm_start(&self) -> Result<(), OpError> {
        route!(self, |backend| backend.vm_start())
    }

    async fn vm_stop(&self) -> Result<(), OpError> {
        route!(self, |backend| backend.vm_stop())
    }

    async fn open_bulk_stream(&self, message_ids: &[MessageId]) -> Result<EventLines, OpError> {
        route!(self, |backend| backend.open_bulk_stream(message_ids))
    }
}
