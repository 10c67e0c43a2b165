//! Observer callbacks and subscription tokens.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use uuid::Uuid;

/// Receives state snapshots synchronously after every transition.
///
/// Implemented for any `Fn(&S) + Send + Sync`. Observers run after the
/// owning lock has been released, so they may call back into the cache.
pub trait Observer<S>: Send + Sync + 'static {
    fn notify(&self, state: &S);
}

impl<S, F> Observer<S> for F
where
    F: Fn(&S) + Send + Sync + 'static,
{
    fn notify(&self, state: &S) {
        self(state)
    }
}

/// Registered observer plus its identity.
pub(crate) struct ObserverEntry<S> {
    pub(crate) id: Uuid,
    pub(crate) observer: Arc<dyn Observer<S>>,
}

impl<S> Clone for ObserverEntry<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            observer: Arc::clone(&self.observer),
        }
    }
}

/// Deliver `state` to each observer. A panicking observer is logged and
/// skipped; the rest are still notified.
pub(crate) fn dispatch<S: 'static>(observers: &[ObserverEntry<S>], state: &S, source: &str) {
    for entry in observers {
        notify_one(entry, state, source);
    }
}

pub(crate) fn notify_one<S: 'static>(entry: &ObserverEntry<S>, state: &S, source: &str) {
    let outcome = catch_unwind(AssertUnwindSafe(|| entry.observer.notify(state)));
    if outcome.is_err() {
        tracing::warn!(
            source = %source,
            observer_id = %entry.id,
            "Observer panicked during notification"
        );
    }
}

/// Capability token for one registered observer.
///
/// Dropping the token (or calling [`Subscription::unsubscribe`]) removes the
/// observer. Once a query has no observers left it becomes eligible for
/// garbage collection.
#[must_use = "dropping a Subscription immediately unsubscribes the observer"]
pub struct Subscription {
    id: Uuid,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new<F>(id: Uuid, release: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            id,
            release: Some(Box::new(release)),
        }
    }

    /// A token that is not attached to anything.
    pub(crate) fn detached(id: Uuid) -> Self {
        Self { id, release: None }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
