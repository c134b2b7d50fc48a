use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyOutcome {
    Replied,
    Failed,
    NoMapping,
    NoVideo,
}

/// Why a `failed` event failed. Absent on the wire means a plain failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOutcome {
    #[default]
    Failed,
    NoMapping,
    NoVideo,
}

impl FailureOutcome {
    fn is_plain(&self) -> bool {
        *self == FailureOutcome::Failed
    }
}

impl From<FailureOutcome> for ReplyOutcome {
    fn from(outcome: FailureOutcome) -> Self {
        match outcome {
            FailureOutcome::Failed => ReplyOutcome::Failed,
            FailureOutcome::NoMapping => ReplyOutcome::NoMapping,
            FailureOutcome::NoVideo => ReplyOutcome::NoVideo,
        }
    }
}

/// One line of the bulk-reply push stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BulkEvent {
    Start {
        total: u32,
    },
    Progress {
        current: u32,
    },
    #[serde(rename_all = "camelCase")]
    Replied {
        message_id: MessageId,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        message_id: MessageId,
        #[serde(default)]
        error: String,
        #[serde(default, skip_serializing_if = "FailureOutcome::is_plain")]
        outcome: FailureOutcome,
    },
    Complete,
    Error {
        message: String,
    },
}

impl BulkEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BulkEvent::Complete | BulkEvent::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BulkEvent::Start { .. } => "start",
            BulkEvent::Progress { .. } => "progress",
            BulkEvent::Replied { .. } => "replied",
            BulkEvent::Failed { .. } => "failed",
            BulkEvent::Complete => "complete",
            BulkEvent::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkReplyResult {
    pub message_id: MessageId,
    pub outcome: ReplyOutcome,
    pub error: Option<String>,
}

/// Result of feeding one event to a [`BulkReplyOperation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkStep {
    Applied,
    Ignored(&'static str),
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkReplyOperation {
    message_ids: Vec<MessageId>,
    is_active: bool,
    total: u32,
    completed: u32,
    reported_progress: u32,
    results: Vec<BulkReplyResult>,
    seen: HashSet<MessageId>,
    error: Option<String>,
    cancelled: bool,
}

impl BulkReplyOperation {
    pub fn new(message_ids: Vec<MessageId>) -> Self {
        let total = u32::try_from(message_ids.len()).unwrap_or(u32::MAX);
        Self {
            message_ids,
            is_active: true,
            total,
            completed: 0,
            reported_progress: 0,
            results: Vec::new(),
            seen: HashSet::new(),
            error: None,
            cancelled: false,
        }
    }

    pub fn message_ids(&self) -> &[MessageId] {
        &self.message_ids
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn completed(&self) -> u32 {
        self.completed
    }

    /// Last `progress{current}` value reported by the stream.
    pub fn reported_progress(&self) -> u32 {
        self.reported_progress
    }

    pub fn results(&self) -> &[BulkReplyResult] {
        &self.results
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn count(&self, outcome: ReplyOutcome) -> usize {
        self.results
            .iter()
            .filter(|result| result.outcome == outcome)
            .count()
    }

    pub fn apply(&mut self, event: &BulkEvent) -> BulkStep {
        if !self.is_active {
            return BulkStep::Ignored("operation is no longer active");
        }
        match event {
            BulkEvent::Start { total } => {
                // The server may dedupe ids; its count wins until results arrive.
                if self.completed == 0 {
                    self.total = *total;
                }
                BulkStep::Applied
            }
            BulkEvent::Progress { current } => {
                let current = (*current).min(self.total);
                if current < self.reported_progress {
                    return BulkStep::Ignored("progress went backwards");
                }
                self.reported_progress = current;
                BulkStep::Applied
            }
            BulkEvent::Replied { message_id } => {
                self.record(message_id, ReplyOutcome::Replied, None)
            }
            BulkEvent::Failed {
                message_id,
                error,
                outcome,
            } => {
                let error = (!error.is_empty()).then(|| error.clone());
                self.record(message_id, (*outcome).into(), error)
            }
            BulkEvent::Complete => {
                self.is_active = false;
                BulkStep::Terminal
            }
            BulkEvent::Error { message } => {
                self.is_active = false;
                self.error = Some(message.clone());
                BulkStep::Terminal
            }
        }
    }

    /// Stops observing the operation. Returns false if it had already ended.
    pub fn cancel(&mut self) -> bool {
        if !self.is_active {
            return false;
        }
        self.is_active = false;
        self.cancelled = true;
        true
    }

    /// Ends the operation after the stream itself failed.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if !self.is_active {
            return false;
        }
        self.is_active = false;
        self.error = Some(message.into());
        true
    }

    fn record(
        &mut self,
        message_id: &MessageId,
        outcome: ReplyOutcome,
        error: Option<String>,
    ) -> BulkStep {
        if self.seen.contains(message_id) {
            return BulkStep::Ignored("duplicate message id");
        }
        if self.completed >= self.total {
            return BulkStep::Ignored("more results than messages");
        }
        self.seen.insert(message_id.clone());
        self.results.push(BulkReplyResult {
            message_id: message_id.clone(),
            outcome,
            error,
        });
        self.completed += 1;
        self.reported_progress = self.reported_progress.max(self.completed);
        BulkStep::Applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<MessageId> {
        raw.iter().copied().map(MessageId::from).collect()
    }

    #[test]
    fn decodes_every_event_kind() {
        let lines = [
            r#"{"type":"start","total":3}"#,
            r#"{"type":"progress","current":1}"#,
            r#"{"type":"replied","messageId":"m1"}"#,
            r#"{"type":"failed","messageId":"m2","error":"no AWB","outcome":"no_mapping"}"#,
            r#"{"type":"failed","messageId":"m3","error":"smtp"}"#,
            r#"{"type":"complete"}"#,
            r#"{"type":"error","message":"quota"}"#,
        ];
        let kinds: Vec<_> = lines
            .iter()
            .map(|line| serde_json::from_str::<BulkEvent>(line).unwrap().kind())
            .collect();
        assert_eq!(
            kinds,
            ["start", "progress", "replied", "failed", "failed", "complete", "error"]
        );

        let failed: BulkEvent = serde_json::from_str(lines[4]).unwrap();
        assert_eq!(
            failed,
            BulkEvent::Failed {
                message_id: "m3".into(),
                error: "smtp".into(),
                outcome: FailureOutcome::Failed,
            }
        );
    }

    #[test]
    fn unknown_type_is_a_decode_error() {
        assert!(serde_json::from_str::<BulkEvent>(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn duplicate_results_are_ignored() {
        let mut op = BulkReplyOperation::new(ids(&["m1", "m2"]));
        let replied = BulkEvent::Replied {
            message_id: "m1".into(),
        };
        assert_eq!(op.apply(&replied), BulkStep::Applied);
        assert!(matches!(op.apply(&replied), BulkStep::Ignored(_)));
        assert_eq!(op.completed(), 1);
        assert_eq!(op.results().len(), 1);
    }

    #[test]
    fn nothing_is_appended_after_cancel() {
        let mut op = BulkReplyOperation::new(ids(&["m1", "m2"]));
        assert!(op.cancel());
        let step = op.apply(&BulkEvent::Replied {
            message_id: "m1".into(),
        });
        assert!(matches!(step, BulkStep::Ignored(_)));
        assert!(op.results().is_empty());
        assert!(op.was_cancelled());
    }

    #[test]
    fn completed_never_exceeds_total() {
        let mut op = BulkReplyOperation::new(ids(&["m1"]));
        op.apply(&BulkEvent::Replied {
            message_id: "m1".into(),
        });
        let step = op.apply(&BulkEvent::Replied {
            message_id: "m9".into(),
        });
        assert!(matches!(step, BulkStep::Ignored(_)));
        assert_eq!(op.completed(), op.total());
    }
}
