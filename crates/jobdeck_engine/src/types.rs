use std::fmt;

use jobdeck_core::{InvalidTransition, JobId, JobKind, JobMode, ReasonCode};
use serde::{Deserialize, Serialize};

/// Whether calls are served by the real backend or the local simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Live,
    Demo,
}

/// `POST /jobs` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub kind: JobKind,
    pub mode: JobMode,
    pub items: Vec<String>,
}

/// `POST /jobs` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedJob {
    pub id: JobId,
    pub total_items: u32,
}

/// Failure of a control call, poll, or stream, normalized across transports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct OpError {
    pub kind: FailureKind,
    pub message: String,
}

impl OpError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ReasonCode {
        self.kind.code()
    }

    pub(crate) fn unreachable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unreachable, message)
    }

    pub(crate) fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::new(
            FailureKind::Rejected {
                status: Some(status),
            },
            message,
        )
    }
}

impl From<InvalidTransition> for OpError {
    fn from(err: InvalidTransition) -> Self {
        Self::new(FailureKind::InvalidTransition, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// No network path to the backend.
    Unreachable,
    /// A bounded wait elapsed.
    Timeout,
    /// The backend refused the request; `status` is the HTTP status when there was one.
    Rejected { status: Option<u16> },
    /// Detected locally before any network call.
    InvalidTransition,
    /// Malformed caller input, detected locally.
    InvalidInput,
    StreamDecode,
    StartTimedOut,
    AlreadySubscribed,
    Cancelled,
}

impl FailureKind {
    pub fn code(&self) -> ReasonCode {
        match self {
            FailureKind::Unreachable => ReasonCode::Unreachable,
            FailureKind::Timeout => ReasonCode::Timeout,
            FailureKind::Rejected { .. } => ReasonCode::Rejected,
            FailureKind::InvalidTransition => ReasonCode::InvalidTransition,
            FailureKind::InvalidInput => ReasonCode::InvalidInput,
            FailureKind::StreamDecode => ReasonCode::StreamDecode,
            FailureKind::StartTimedOut => ReasonCode::StartTimedOut,
            FailureKind::AlreadySubscribed => ReasonCode::AlreadySubscribed,
            FailureKind::Cancelled => ReasonCode::Cancelled,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Rejected {
                status: Some(status),
            } => write!(f, "rejected (http {status})"),
            other => f.write_str(other.code().as_str()),
        }
    }
}
