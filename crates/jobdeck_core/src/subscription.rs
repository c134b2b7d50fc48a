use std::fmt;

use crate::JobId;

/// Token identifying one subscription (poller or stream) on a resource.
///
/// Ids are never reused within a session, so a message carrying a released
/// token can always be told apart from one carrying the current token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// A resource that can have at most one active subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKey {
    Job(JobId),
    Vm,
    BulkReply,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Job(id) => write!(f, "job {id}"),
            ResourceKey::Vm => f.write_str("vm"),
            ResourceKey::BulkReply => f.write_str("bulk reply"),
        }
    }
}
