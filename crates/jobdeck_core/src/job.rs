use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::InvalidTransition;

/// Opaque, server-assigned job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    PassCheck,
    ReturnToOrigin,
    Return,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    InteractiveBrowser,
    HeadlessApi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Launching,
    Waiting,
    Running,
    Paused,
    Completed,
    Stopped,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Stopped | JobStatus::Error
        )
    }

    /// States in which the remote side can still change the job on its own.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            JobStatus::Launching | JobStatus::Waiting | JobStatus::Running | JobStatus::Paused
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Launching => "launching",
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Stopped => "stopped",
            JobStatus::Error => "error",
        }
    }

    /// Non-terminal edges a status report may move along.
    fn reaches(self, next: JobStatus, mode: JobMode) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Launching) | (Launching, Waiting) | (Waiting, Running) => {
                mode == JobMode::InteractiveBrowser
            }
            (Pending, Running) => mode == JobMode::HeadlessApi,
            (Running, Paused) | (Paused, Running) => true,
            _ => false,
        }
    }

    /// Whether a polled terminal report may end a job in this status.
    ///
    /// Only a running or paused job completes. Launch and wait can fail, and a
    /// stop issued by another client shows up as a polled `Stopped`.
    fn accepts_terminal(self, reported: JobStatus) -> bool {
        use JobStatus::*;
        match reported {
            Completed => matches!(self, Running | Paused),
            Error | Stopped => self.is_live(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Launch,
    Start,
    Pause,
    Resume,
    Stop,
    Delete,
}

impl JobAction {
    pub fn as_str(self) -> &'static str {
        match self {
            JobAction::Launch => "launch",
            JobAction::Start => "start",
            JobAction::Pause => "pause",
            JobAction::Resume => "resume",
            JobAction::Stop => "stop",
            JobAction::Delete => "delete",
        }
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a successful control call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlAck {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub endpoint: Option<Url>,
}

/// Polled `GET /jobs/{id}` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub current_index: u32,
    pub passed_count: u32,
    pub error_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_items: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Passed,
    Failed,
    Skipped,
}

/// One row of `GET /jobs/{id}/results`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub index: u32,
    pub item: String,
    pub outcome: ItemOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// What happened to a polled snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Applied,
    /// Reported counters went backwards; an older response arrived late.
    Stale,
    /// The job is terminal and no longer changes.
    Frozen,
    /// The report breaks a counter invariant or names an edge that does not exist.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    id: JobId,
    kind: JobKind,
    mode: JobMode,
    total_items: u32,
    current_index: u32,
    passed_count: u32,
    error_count: u32,
    status: JobStatus,
    endpoint: Option<Url>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    /// Bumped on every confirmed control call. Snapshots requested before the
    /// latest confirmation may not override its status.
    epoch: u64,
}

impl Job {
    pub fn new(
        id: JobId,
        kind: JobKind,
        mode: JobMode,
        total_items: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind,
            mode,
            total_items,
            current_index: 0,
            passed_count: 0,
            error_count: 0,
            status: JobStatus::Pending,
            endpoint: None,
            created_at,
            started_at: None,
            completed_at: None,
            last_error: None,
            epoch: 0,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn mode(&self) -> JobMode {
        self.mode
    }

    pub fn total_items(&self) -> u32 {
        self.total_items
    }

    pub fn current_index(&self) -> u32 {
        self.current_index
    }

    pub fn passed_count(&self) -> u32 {
        self.passed_count
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn endpoint(&self) -> Option<&Url> {
        self.endpoint.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Local validation of a control action, done before any network call.
    pub fn check_action(&self, action: JobAction) -> Result<(), InvalidTransition> {
        use JobStatus::*;
        let allowed = match action {
            JobAction::Launch => self.mode == JobMode::InteractiveBrowser && self.status == Pending,
            JobAction::Start => match self.mode {
                JobMode::InteractiveBrowser => self.status == Waiting,
                JobMode::HeadlessApi => self.status == Pending,
            },
            JobAction::Pause => self.status == Running,
            JobAction::Resume => self.status == Paused,
            JobAction::Stop => matches!(self.status, Running | Paused | Waiting | Launching),
            JobAction::Delete => self.status.is_terminal(),
        };
        if allowed {
            Ok(())
        } else {
            Err(InvalidTransition::new(self.status, action))
        }
    }

    /// Applies the optimistic transition for a control call the backend accepted.
    ///
    /// Returns false when the job moved on while the call was in flight, in
    /// which case the confirmed state wins.
    pub fn confirm(&mut self, action: JobAction, ack: &ControlAck, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || self.check_action(action).is_err() {
            return false;
        }
        self.epoch += 1;
        if let Some(reported) = ack.status.filter(|status| status.is_terminal()) {
            self.finish(reported, Some(at), None);
            return true;
        }
        match action {
            JobAction::Launch => {
                self.status = JobStatus::Launching;
                self.endpoint = ack.endpoint.clone();
            }
            JobAction::Start | JobAction::Resume => {
                self.status = JobStatus::Running;
                self.started_at.get_or_insert(at);
            }
            JobAction::Pause => self.status = JobStatus::Paused,
            JobAction::Stop => self.finish(JobStatus::Stopped, Some(at), None),
            JobAction::Delete => return false,
        }
        true
    }

    /// Reconciles a polled snapshot that was requested while `requested_epoch`
    /// was current.
    pub fn apply_snapshot(
        &mut self,
        snapshot: &JobSnapshot,
        requested_epoch: u64,
        at: DateTime<Utc>,
    ) -> SnapshotOutcome {
        if self.status.is_terminal() {
            return SnapshotOutcome::Frozen;
        }
        if snapshot.current_index < self.current_index
            || snapshot.passed_count < self.passed_count
            || snapshot.error_count < self.error_count
        {
            return SnapshotOutcome::Stale;
        }
        let settled = snapshot
            .passed_count
            .checked_add(snapshot.error_count)
            .unwrap_or(u32::MAX);
        if snapshot.current_index > self.total_items || settled > snapshot.current_index {
            return SnapshotOutcome::Rejected;
        }

        let reported = snapshot.status;
        let next = if reported.is_terminal() {
            if !self.status.accepts_terminal(reported) {
                return SnapshotOutcome::Rejected;
            }
            reported
        } else if reported == self.status || requested_epoch < self.epoch {
            // An older request cannot undo a confirmed control call.
            self.status
        } else if self.status.reaches(reported, self.mode) {
            reported
        } else {
            return SnapshotOutcome::Rejected;
        };

        if next != JobStatus::Paused {
            self.current_index = snapshot.current_index;
            self.passed_count = snapshot.passed_count;
            self.error_count = snapshot.error_count;
        }
        if let Some(endpoint) = &snapshot.endpoint {
            self.endpoint = Some(endpoint.clone());
        }
        if let Some(started) = snapshot.started_at {
            self.started_at.get_or_insert(started);
        }
        if next == JobStatus::Running {
            self.started_at.get_or_insert(at);
        }

        if next.is_terminal() {
            let completed = snapshot.completed_at.or(Some(at));
            self.finish(next, completed, snapshot.error.clone());
        } else {
            self.status = next;
        }
        SnapshotOutcome::Applied
    }

    /// Marks the job failed after polling gave up on it.
    pub fn fail(&mut self, message: impl Into<String>, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.finish(JobStatus::Error, Some(at), Some(message.into()));
        true
    }

    fn finish(
        &mut self,
        status: JobStatus,
        completed_at: Option<DateTime<Utc>>,
        error: Option<String>,
    ) {
        self.status = status;
        self.completed_at = completed_at;
        if error.is_some() {
            self.last_error = error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(mode: JobMode) -> Job {
        Job::new(JobId::new("j-1"), JobKind::PassCheck, mode, 5, Utc::now())
    }

    fn snapshot(status: JobStatus, index: u32, passed: u32, errors: u32) -> JobSnapshot {
        JobSnapshot {
            status,
            current_index: index,
            passed_count: passed,
            error_count: errors,
            total_items: Some(5),
            endpoint: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    #[test]
    fn headless_start_skips_launch_and_wait() {
        let mut job = job(JobMode::HeadlessApi);
        assert!(job.check_action(JobAction::Launch).is_err());
        assert!(job.confirm(JobAction::Start, &ControlAck::default(), Utc::now()));
        assert_eq!(job.status(), JobStatus::Running);
        assert!(job.started_at().is_some());
    }

    #[test]
    fn interactive_needs_launch_then_ready_then_start() {
        let mut job = job(JobMode::InteractiveBrowser);
        assert!(job.check_action(JobAction::Start).is_err());

        let ack = ControlAck {
            status: None,
            endpoint: Some(Url::parse("https://vm.example.com/view").unwrap()),
        };
        assert!(job.confirm(JobAction::Launch, &ack, Utc::now()));
        assert_eq!(job.status(), JobStatus::Launching);
        assert_eq!(job.endpoint().unwrap().host_str(), Some("vm.example.com"));

        let epoch = job.epoch();
        let outcome = job.apply_snapshot(&snapshot(JobStatus::Waiting, 0, 0, 0), epoch, Utc::now());
        assert_eq!(outcome, SnapshotOutcome::Applied);
        assert_eq!(job.status(), JobStatus::Waiting);

        assert!(job.confirm(JobAction::Start, &ControlAck::default(), Utc::now()));
        assert_eq!(job.status(), JobStatus::Running);
    }

    #[test]
    fn terminal_report_beats_optimistic_pause() {
        let mut job = job(JobMode::HeadlessApi);
        job.confirm(JobAction::Start, &ControlAck::default(), Utc::now());
        let before_pause = job.epoch();
        job.confirm(JobAction::Pause, &ControlAck::default(), Utc::now());

        let outcome = job.apply_snapshot(
            &snapshot(JobStatus::Completed, 5, 5, 0),
            before_pause,
            Utc::now(),
        );
        assert_eq!(outcome, SnapshotOutcome::Applied);
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.current_index(), 5);
    }

    #[test]
    fn late_running_report_does_not_undo_confirmed_pause() {
        let mut job = job(JobMode::HeadlessApi);
        job.confirm(JobAction::Start, &ControlAck::default(), Utc::now());
        let before_pause = job.epoch();
        job.confirm(JobAction::Pause, &ControlAck::default(), Utc::now());

        job.apply_snapshot(&snapshot(JobStatus::Running, 2, 2, 0), before_pause, Utc::now());
        assert_eq!(job.status(), JobStatus::Paused);
        assert_eq!(job.current_index(), 0);
    }

    #[test]
    fn regressing_index_is_stale() {
        let mut job = job(JobMode::HeadlessApi);
        job.confirm(JobAction::Start, &ControlAck::default(), Utc::now());
        let epoch = job.epoch();
        job.apply_snapshot(&snapshot(JobStatus::Running, 3, 3, 0), epoch, Utc::now());
        let outcome = job.apply_snapshot(&snapshot(JobStatus::Running, 2, 2, 0), epoch, Utc::now());
        assert_eq!(outcome, SnapshotOutcome::Stale);
        assert_eq!(job.current_index(), 3);
    }

    #[test]
    fn counters_that_exceed_index_are_rejected() {
        let mut job = job(JobMode::HeadlessApi);
        job.confirm(JobAction::Start, &ControlAck::default(), Utc::now());
        let epoch = job.epoch();
        let outcome = job.apply_snapshot(&snapshot(JobStatus::Running, 2, 2, 1), epoch, Utc::now());
        assert_eq!(outcome, SnapshotOutcome::Rejected);
        let outcome = job.apply_snapshot(&snapshot(JobStatus::Running, 6, 6, 0), epoch, Utc::now());
        assert_eq!(outcome, SnapshotOutcome::Rejected);
    }

    #[test]
    fn terminal_reports_only_end_jobs_that_could_reach_them() {
        let mut pending = job(JobMode::HeadlessApi);
        let outcome = pending.apply_snapshot(&snapshot(JobStatus::Completed, 0, 0, 0), 0, Utc::now());
        assert_eq!(outcome, SnapshotOutcome::Rejected);
        let outcome = pending.apply_snapshot(&snapshot(JobStatus::Stopped, 0, 0, 0), 0, Utc::now());
        assert_eq!(outcome, SnapshotOutcome::Rejected);
        assert_eq!(pending.status(), JobStatus::Pending);

        let mut waiting = job(JobMode::InteractiveBrowser);
        waiting.confirm(JobAction::Launch, &ControlAck::default(), Utc::now());
        let epoch = waiting.epoch();
        waiting.apply_snapshot(&snapshot(JobStatus::Waiting, 0, 0, 0), epoch, Utc::now());
        let outcome = waiting.apply_snapshot(&snapshot(JobStatus::Completed, 0, 0, 0), epoch, Utc::now());
        assert_eq!(outcome, SnapshotOutcome::Rejected);
        assert_eq!(waiting.status(), JobStatus::Waiting);

        let outcome = waiting.apply_snapshot(&snapshot(JobStatus::Error, 0, 0, 0), epoch, Utc::now());
        assert_eq!(outcome, SnapshotOutcome::Applied);
        assert_eq!(waiting.status(), JobStatus::Error);
    }

    #[test]
    fn delete_only_from_terminal() {
        let mut job = job(JobMode::HeadlessApi);
        let err = job.check_action(JobAction::Delete).unwrap_err();
        assert_eq!(err.to_string(), "cannot delete while pending");
        job.confirm(JobAction::Start, &ControlAck::default(), Utc::now());
        job.confirm(JobAction::Stop, &ControlAck::default(), Utc::now());
        assert_eq!(job.status(), JobStatus::Stopped);
        assert!(job.check_action(JobAction::Delete).is_ok());
    }

    #[test]
    fn snapshot_parses_camel_case_wire_format() {
        let raw = r#"{"status":"running","currentIndex":2,"passedCount":1,"errorCount":1}"#;
        let parsed: JobSnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.status, JobStatus::Running);
        assert_eq!(parsed.current_index, 2);
        assert_eq!(parsed.error_count, 1);
        assert_eq!(parsed.total_items, None);
    }
}
