//! Synchronous signal dispatch to external subscribers.
//!
//! Shards report lifecycle events (instance state changes, readiness,
//! cluster-mode mismatches) through [`Observer`] values. Subscribers run
//! synchronously in registration order, and are always invoked with no shard
//! lock held, so a subscriber may re-enter the shard.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Observer<T> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

impl<T> Observer<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, subscriber: impl Fn(&T) + Send + Sync + 'static) {
        self.subscribers.lock().push(Arc::new(subscriber));
    }

    /// Invoke every subscriber with `payload`.
    ///
    /// The subscriber list is snapshotted first, so a subscriber may call
    /// [`subscribe`](Self::subscribe) without deadlocking; the new
    /// subscription takes effect from the next emission. A panicking
    /// subscriber is isolated and logged, never propagated.
    pub fn emit(&self, payload: &T) {
        let snapshot = self.subscribers.lock().clone();
        for subscriber in snapshot {
            if catch_unwind(AssertUnwindSafe(|| subscriber(payload))).is_err() {
                warn!("signal subscriber panicked, continuing with remaining subscribers");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<T> Default for Observer<T> {
    fn default() -> Self {
        Self::new()
    }
}
