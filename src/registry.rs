//! Subscriber sets and broadcast.
//!
//! Every instrumented holder owns exactly one [`SubscriberSet`]. Subscribers
//! are identified by handle identity: two clones of the same
//! [`Subscriber`] are the same subscriber, two subscribers built from
//! identical closures are not.
//!
//! Broadcast takes a snapshot of the set and calls each member outside the
//! lock, so callbacks may add or remove subscribers (or re-enter the store)
//! freely. A subscriber removed while a broadcast is in flight is not called
//! for the rest of that broadcast; subscribers added mid-broadcast may or may
//! not see it.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::StateHolder;
use crate::arena;
use crate::hash::FastHashBuilder;

type Callback<T> = dyn Fn(&T, &T) + Send + Sync;

/// A change callback invoked as `(next, prev)`.
pub struct Subscriber<T> {
    callback: Arc<Callback<T>>,
}

impl<T> Subscriber<T> {
    /// Wrap a `(next, prev)` callback.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Identity key: the address of the shared callback.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.callback).cast::<()>() as usize
    }

    pub(crate) fn call(&self, next: &T, prev: &T) {
        (self.callback)(next, prev);
    }
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            callback: Arc::clone(&self.callback),
        }
    }
}

impl<T> PartialEq for Subscriber<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<T> Eq for Subscriber<T> {}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Subscriber")
            .field(&format_args!("{:#x}", self.key()))
            .finish()
    }
}

/// The live set of subscribers of one instrumented holder.
pub struct SubscriberSet<T> {
    entries: Mutex<IndexMap<usize, Subscriber<T>, FastHashBuilder>>,
}

impl<T> Default for SubscriberSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SubscriberSet<T> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(IndexMap::with_hasher(FastHashBuilder)),
        }
    }

    /// Add a subscriber. Returns false if it was already present.
    pub fn add(&self, subscriber: &Subscriber<T>) -> bool {
        let mut entries = self.entries.lock();
        let added = entries
            .insert(subscriber.key(), subscriber.clone())
            .is_none();
        trace!(subscriber = ?subscriber, added, len = entries.len(), "subscriber added");
        added
    }

    /// Remove a subscriber. Removing an absent subscriber is a no-op and
    /// returns false.
    pub fn remove(&self, subscriber: &Subscriber<T>) -> bool {
        let mut entries = self.entries.lock();
        let removed = entries.shift_remove(&subscriber.key()).is_some();
        trace!(subscriber = ?subscriber, removed, len = entries.len(), "subscriber removed");
        removed
    }

    /// Whether `subscriber` is currently registered.
    pub fn contains(&self, subscriber: &Subscriber<T>) -> bool {
        self.entries.lock().contains_key(&subscriber.key())
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Call every registered subscriber with `(next, prev)`.
    ///
    /// Returns the number of subscribers actually called.
    pub fn broadcast(&self, next: &T, prev: &T) -> usize {
        let snapshot: Vec<Subscriber<T>> = self.entries.lock().values().cloned().collect();
        let mut called = 0;
        for subscriber in &snapshot {
            // Skip subscribers torn down by an earlier callback in this round.
            if !self.contains(subscriber) {
                cov_mark::hit!(broadcast_skips_removed_subscriber);
                continue;
            }
            subscriber.call(next, prev);
            called += 1;
        }
        called
    }
}

impl<T> fmt::Debug for SubscriberSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberSet")
            .field("len", &self.len())
            .finish()
    }
}

/// Subscribe to `holder` if it has been instrumented.
///
/// Returns false (and does nothing) for a holder that was never
/// instrumented or whose store is gone.
pub fn subscribe<H: StateHolder>(holder: &Arc<H>, subscriber: &Subscriber<H::State>) -> bool {
    match arena::lookup(holder) {
        Some(store) => store.subscribe(subscriber),
        None => {
            cov_mark::hit!(registry_op_on_plain_holder);
            false
        }
    }
}

/// Unsubscribe from `holder`. A no-op for unknown holders or subscribers.
pub fn unsubscribe<H: StateHolder>(holder: &Arc<H>, subscriber: &Subscriber<H::State>) -> bool {
    match arena::lookup(holder) {
        Some(store) => store.unsubscribe(subscriber),
        None => {
            cov_mark::hit!(registry_op_on_plain_holder);
            false
        }
    }
}

/// Broadcast `(next, prev)` to the subscribers of `holder`.
///
/// This bypasses change detection and does not touch the store's last
/// observed state. Returns the number of subscribers called, zero for a
/// holder that was never instrumented.
pub fn broadcast<H: StateHolder>(holder: &Arc<H>, next: &H::State, prev: &H::State) -> usize {
    match arena::lookup(holder) {
        Some(store) => store.broadcast_unchecked(next, prev),
        None => {
            cov_mark::hit!(registry_op_on_plain_holder);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> Subscriber<i32> {
        let counter = Arc::clone(counter);
        Subscriber::new(move |_, _| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn clones_share_identity() {
        let a = Subscriber::<i32>::new(|_, _| {});
        let b = Subscriber::<i32>::new(|_, _| {});

        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn adding_twice_keeps_one_entry() {
        let set = SubscriberSet::new();
        let subscriber = Subscriber::<i32>::new(|_, _| {});

        assert!(set.add(&subscriber));
        assert!(!set.add(&subscriber.clone()));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn removing_unknown_subscriber_is_silent() {
        let set = SubscriberSet::<i32>::new();

        assert!(!set.remove(&Subscriber::new(|_, _| {})));
        assert!(set.is_empty());
    }

    #[test]
    fn broadcast_passes_next_then_prev() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let set = SubscriberSet::new();
        let sink = Arc::clone(&seen);
        set.add(&Subscriber::new(move |next: &i32, prev: &i32| {
            sink.lock().push((*next, *prev));
        }));

        assert_eq!(set.broadcast(&2, &1), 1);
        assert_eq!(*seen.lock(), vec![(2, 1)]);
    }

    #[test]
    fn removal_during_broadcast_skips_only_the_removed() {
        cov_mark::check!(broadcast_skips_removed_subscriber);

        let set = Arc::new(SubscriberSet::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let victim = counting(&hits);
        let tail = counting(&hits);

        let set_in_cb = Arc::clone(&set);
        let victim_in_cb = victim.clone();
        let remover = Subscriber::new(move |_: &i32, _: &i32| {
            set_in_cb.remove(&victim_in_cb);
        });

        set.add(&remover);
        set.add(&victim);
        set.add(&tail);

        assert_eq!(set.broadcast(&1, &0), 2);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(set.len(), 2);
    }
}
