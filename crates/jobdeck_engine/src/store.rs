use std::sync::{Mutex, PoisonError};

use deck_logging::{deck_info, deck_trace, deck_warn};
use jobdeck_core::{update, AppState, AppViewModel, Effect, Msg, Notice};
use tokio::sync::broadcast;

const NOTICE_CAPACITY: usize = 256;

/// Holds the one `AppState` and is the only place the reducer runs.
pub struct Store {
    state: Mutex<AppState>,
    notices: broadcast::Sender<Notice>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            state: Mutex::new(AppState::new()),
            notices,
        }
    }

    /// Applies `msg` under the lock and hands back the effects to run once it is released.
    pub fn dispatch(&self, msg: Msg) -> Vec<Effect> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = std::mem::take(&mut *guard);
        let (next, effects) = update(state, msg);
        *guard = next;
        if !effects.is_empty() {
            deck_trace!("Dispatch produced {} effects", effects.len());
        }
        effects
    }

    pub fn read<T>(&self, f: impl FnOnce(&AppState) -> T) -> T {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    pub fn view(&self) -> AppViewModel {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let view = guard.view();
        guard.consume_dirty();
        view
    }

    pub fn publish(&self, notice: Notice) {
        match &notice {
            Notice::Failure {
                resource,
                code,
                message,
            } => deck_warn!("{} failed [{}]: {}", resource, code, message),
            other => deck_info!("{:?}", other),
        }
        // Nobody listening is fine; the view still reflects the outcome.
        let _ = self.notices.send(notice);
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jobdeck_core::{Job, JobId, JobKind, JobMode};

    #[test]
    fn dispatch_updates_state_and_view_clears_dirty() {
        let store = Store::new();
        let job = Job::new(JobId::new("j"), JobKind::Return, JobMode::HeadlessApi, 2, Utc::now());
        store.dispatch(Msg::JobCreated { job });

        assert!(store.read(|state| state.job(&JobId::new("j")).is_some()));
        assert!(store.view().dirty);
        assert!(!store.view().dirty);
    }

    #[tokio::test]
    async fn published_notices_reach_subscribers() {
        let store = Store::new();
        let mut rx = store.notices();
        store.publish(Notice::VmSettled {
            status: jobdeck_core::VmStatus::Running,
        });
        assert_eq!(
            rx.recv().await.unwrap(),
            Notice::VmSettled {
                status: jobdeck_core::VmStatus::Running
            }
        );
    }
}
