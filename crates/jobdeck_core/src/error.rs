use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable reason code attached to every surfaced failure.
///
/// The UI keys its "retry" versus "contact support" messaging off this value,
/// so the string forms must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Unreachable,
    Timeout,
    Rejected,
    InvalidTransition,
    InvalidInput,
    StreamDecode,
    StartTimedOut,
    AlreadySubscribed,
    Cancelled,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::Unreachable => "unreachable",
            ReasonCode::Timeout => "timeout",
            ReasonCode::Rejected => "rejected",
            ReasonCode::InvalidTransition => "invalid_transition",
            ReasonCode::InvalidInput => "invalid_input",
            ReasonCode::StreamDecode => "stream_decode",
            ReasonCode::StartTimedOut => "start_timed_out",
            ReasonCode::AlreadySubscribed => "already_subscribed",
            ReasonCode::Cancelled => "cancelled",
        }
    }

    /// Whether a manual retry of the same request can reasonably succeed.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ReasonCode::Unreachable | ReasonCode::Timeout | ReasonCode::StartTimedOut
        )
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An action was attempted from a state that has no such outbound edge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {action} while {from}")]
pub struct InvalidTransition {
    pub from: String,
    pub action: String,
}

impl InvalidTransition {
    pub(crate) fn new(from: impl fmt::Display, action: impl fmt::Display) -> Self {
        Self {
            from: from.to_string(),
            action: action.to_string(),
        }
    }
}
