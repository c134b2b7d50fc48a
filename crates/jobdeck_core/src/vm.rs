use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::InvalidTransition;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    #[default]
    Stopped,
    Staging,
    Running,
    Stopping,
    Terminated,
}

impl VmStatus {
    /// Transitional states that are worth polling.
    pub fn is_transitional(self) -> bool {
        matches!(self, VmStatus::Staging | VmStatus::Stopping)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VmStatus::Stopped => "stopped",
            VmStatus::Staging => "staging",
            VmStatus::Running => "running",
            VmStatus::Stopping => "stopping",
            VmStatus::Terminated => "terminated",
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmAction {
    Start,
    Stop,
}

impl VmAction {
    pub fn as_str(self) -> &'static str {
        match self {
            VmAction::Start => "start",
            VmAction::Stop => "stop",
        }
    }
}

impl fmt::Display for VmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `GET /vm/status` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSnapshot {
    pub status: VmStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Url>,
}

/// Reachability of the remote environment that backs browser jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceAvailability {
    vm_status: VmStatus,
    endpoint: Option<Url>,
    /// False until a status report or a confirmed control call has been seen.
    observed: bool,
    /// Control call whose outcome polling is still waiting for.
    pending: Option<VmAction>,
}

impl ServiceAvailability {
    pub fn vm_status(&self) -> VmStatus {
        self.vm_status
    }

    /// Interactive view URL; present only while running.
    pub fn endpoint(&self) -> Option<&Url> {
        self.endpoint.as_ref()
    }

    /// Whether `vm_status` reflects anything the backend said.
    pub fn is_observed(&self) -> bool {
        self.observed
    }

    pub fn pending(&self) -> Option<VmAction> {
        self.pending
    }

    pub fn check(&self, action: VmAction) -> Result<(), InvalidTransition> {
        let allowed = match action {
            VmAction::Start => matches!(self.vm_status, VmStatus::Stopped | VmStatus::Terminated),
            VmAction::Stop => matches!(self.vm_status, VmStatus::Running | VmStatus::Staging),
        };
        if allowed {
            Ok(())
        } else {
            Err(InvalidTransition::new(self.vm_status, action))
        }
    }

    /// Optimistic move toward staging/stopping once the control call succeeded.
    pub fn begin(&mut self, action: VmAction) {
        self.vm_status = match action {
            VmAction::Start => VmStatus::Staging,
            VmAction::Stop => VmStatus::Stopping,
        };
        self.endpoint = None;
        self.observed = true;
        self.pending = Some(action);
    }

    /// Ends a pending start or stop without its outcome, e.g. when a ceiling elapses.
    pub fn abandon(&mut self) -> Option<VmAction> {
        self.pending.take()
    }

    /// Records a status report. Returns whether anything changed.
    ///
    /// While a start or stop is pending, reports that still show the old state
    /// are lag: the VM stays staging (or stopping) until the requested outcome
    /// is reported.
    pub fn apply_snapshot(&mut self, snapshot: &VmSnapshot) -> bool {
        let (mut status, mut endpoint) = match (snapshot.status, &snapshot.endpoint) {
            (VmStatus::Running, Some(endpoint)) => (VmStatus::Running, Some(endpoint.clone())),
            // Running without a view URL is not usable yet.
            (VmStatus::Running, None) => (VmStatus::Staging, None),
            (status, _) => (status, None),
        };
        match self.pending {
            Some(VmAction::Start) if status != VmStatus::Running => {
                status = VmStatus::Staging;
                endpoint = None;
            }
            Some(VmAction::Stop) if !matches!(status, VmStatus::Stopped | VmStatus::Terminated) => {
                status = VmStatus::Stopping;
                endpoint = None;
            }
            Some(_) => self.pending = None,
            None => {}
        }
        let changed = !self.observed || status != self.vm_status || endpoint != self.endpoint;
        self.vm_status = status;
        self.endpoint = endpoint;
        self.observed = true;
        changed
    }
}
