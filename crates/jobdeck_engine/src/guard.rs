use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use deck_logging::deck_debug;
use jobdeck_core::{ResourceKey, SubscriptionId};
use tokio_util::sync::CancellationToken;

use crate::{FailureKind, OpError};

/// Told about every lease change so the store can track which subscription is current.
pub trait LeaseObserver: Send + Sync {
    fn acquired(&self, key: &ResourceKey, sub: SubscriptionId);
    fn released(&self, key: &ResourceKey, sub: SubscriptionId);
}

/// A granted lease. The token is cancelled the moment the lease is released.
#[derive(Debug, Clone)]
pub struct Lease {
    pub key: ResourceKey,
    pub sub: SubscriptionId,
    pub token: CancellationToken,
}

/// Owns every background lease and enforces one live subscription per resource.
#[derive(Clone)]
pub struct ResourceGuard {
    inner: Arc<GuardInner>,
}

struct GuardInner {
    leases: Mutex<HashMap<ResourceKey, Lease>>,
    next_sub: AtomicU64,
    root: CancellationToken,
    observer: Option<Weak<dyn LeaseObserver>>,
}

impl ResourceGuard {
    pub fn new(observer: Weak<dyn LeaseObserver>) -> Self {
        Self::build(Some(observer))
    }

    /// A guard nobody listens to; used by components tested in isolation.
    pub fn detached() -> Self {
        Self::build(None)
    }

    fn build(observer: Option<Weak<dyn LeaseObserver>>) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                leases: Mutex::new(HashMap::new()),
                next_sub: AtomicU64::new(1),
                root: CancellationToken::new(),
                observer,
            }),
        }
    }

    pub fn acquire(&self, key: ResourceKey) -> Result<Lease, OpError> {
        if self.inner.root.is_cancelled() {
            return Err(OpError::new(FailureKind::Cancelled, "engine is shut down"));
        }
        let lease = {
            let mut leases = self.lock();
            if leases.contains_key(&key) {
                return Err(OpError::new(
                    FailureKind::AlreadySubscribed,
                    format!("{key} already has an active subscription"),
                ));
            }
            let sub = SubscriptionId::new(self.inner.next_sub.fetch_add(1, Ordering::Relaxed));
            let lease = Lease {
                key: key.clone(),
                sub,
                token: self.inner.root.child_token(),
            };
            leases.insert(key, lease.clone());
            lease
        };
        deck_debug!("Acquired {} for {}", lease.sub, lease.key);
        if let Some(observer) = self.observer() {
            observer.acquired(&lease.key, lease.sub);
        }
        Ok(lease)
    }

    /// Releases the lease if `sub` is still the one holding `key`. Idempotent.
    pub fn release(&self, key: &ResourceKey, sub: SubscriptionId) -> bool {
        let removed = {
            let mut leases = self.lock();
            match leases.get(key) {
                Some(lease) if lease.sub == sub => leases.remove(key),
                _ => None,
            }
        };
        let Some(lease) = removed else {
            return false;
        };
        lease.token.cancel();
        deck_debug!("Released {} for {}", lease.sub, lease.key);
        if let Some(observer) = self.observer() {
            observer.released(&lease.key, lease.sub);
        }
        true
    }

    pub fn current(&self, key: &ResourceKey) -> Option<SubscriptionId> {
        self.lock().get(key).map(|lease| lease.sub)
    }

    pub fn is_held(&self, key: &ResourceKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn handle(&self, lease: &Lease) -> SubscriptionHandle {
        SubscriptionHandle {
            guard: self.clone(),
            key: lease.key.clone(),
            sub: lease.sub,
            token: lease.token.clone(),
            released: false,
        }
    }

    /// Cancels every lease and refuses new ones.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
        let held: Vec<(ResourceKey, SubscriptionId)> = self
            .lock()
            .values()
            .map(|lease| (lease.key.clone(), lease.sub))
            .collect();
        for (key, sub) in held {
            self.release(&key, sub);
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    fn observer(&self) -> Option<Arc<dyn LeaseObserver>> {
        self.inner.observer.as_ref().and_then(Weak::upgrade)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ResourceKey, Lease>> {
        self.inner
            .leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Caller's side of a lease. Dropping it releases the lease.
pub struct SubscriptionHandle {
    guard: ResourceGuard,
    key: ResourceKey,
    sub: SubscriptionId,
    token: CancellationToken,
    released: bool,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.sub
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// False once the lease is gone, whether released here or by the task itself.
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    pub fn release(mut self) -> bool {
        self.released = true;
        self.guard.release(&self.key, self.sub)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if !self.released {
            self.guard.release(&self.key, self.sub);
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .field("sub", &self.sub)
            .field("active", &self.is_active())
            .finish()
    }
}
