//! Mutator instrumentation.
//!
//! A [`Store`] wraps a shared [`StateHolder`] so that running a mutator
//! through it automatically notifies subscribers when the holder's state
//! actually changed.
//!
//! # Change bookkeeping
//!
//! The store remembers the most recently observed state. After a mutator
//! runs, the accessor is read again and compared with that snapshot using
//! [`Shallow`]. Only when it changed:
//!
//! 1. the snapshot is replaced by the new state, and
//! 2. every subscriber is called with `(next, prev)`.
//!
//! A mutation that is not broadcast (cancelled, failed, or unchanged) never
//! refreshes the snapshot, so a change that slipped through unnotified is
//! reported by the next broadcast instead of being forgotten.
//!
//! # Serialization
//!
//! Each store owns a reentrant serial lock. A synchronous mutator, the change
//! check after it and the broadcast all run while holding it, as does the
//! check that follows a deferred settlement. Across threads this means:
//!
//! - mutations through one store never interleave with each other or with a
//!   change check, and
//! - broadcasts reach subscribers in the order the mutations ran.
//!
//! The lock is reentrant, so a subscriber may run mutators on the same store
//! from inside its callback. [`Store::unsubscribe`] takes it as well: once it
//! returns, no broadcast is still about to call the removed subscriber.
//!
//! A mutator must not block on another thread that mutates the same store.
//!
//! # Mutator flavours
//!
//! - [`Store::act`]: synchronous mutator. Its return value is classified
//!   through [`Settle`], which is how [`cancel`](crate::cancel) and `Err`
//!   results suppress notification.
//! - [`Store::act_async`]: deferred mutator. Any synchronous change is
//!   broadcast right away; the returned [`Deferred`] runs another check
//!   once the future settles.

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tracing::debug;

use crate::actions::{ActionTable, Actions};
use crate::arena::{self, HolderKey};
use crate::binding::{Binding, Source};
use crate::equality::Shallow;
use crate::executor::Deferred;
use crate::outcome::Settle;
use crate::registry::{Subscriber, SubscriberSet};

/// Suffix marking a declared action as untracked (read-only).
pub const DEFAULT_UNTRACKED_SUFFIX: &str = "_";

/// An object exposing a pure state accessor and mutating methods.
///
/// Mutators take `&self` and use interior mutability; the holder is shared
/// between every consumer bound to it.
///
/// # Example
/// ```ignore
/// struct Counter {
///     count: AtomicI64,
/// }
///
/// impl StateHolder for Counter {
///     type State = i64;
///
///     fn state(&self) -> i64 {
///         self.count.load(Ordering::SeqCst)
///     }
///
///     fn declare(actions: &mut ActionTable<Self>) {
///         actions
///             .mutator("increment", |c: &Counter, by: i64| {
///                 c.count.fetch_add(by, Ordering::SeqCst);
///             })
///             .helper("is_positive", |c: &Counter, ()| c.state() > 0);
///     }
/// }
/// ```
pub trait StateHolder: Send + Sync + Sized + 'static {
    /// Snapshot type returned by the accessor.
    type State: Shallow + Clone + Send + Sync + 'static;

    /// Read the current state. Must not have side effects.
    fn state(&self) -> Self::State;

    /// Declare the named actions exposed to bindings.
    ///
    /// Called once, when the holder is first instrumented.
    fn declare(actions: &mut ActionTable<Self>) {
        let _ = actions;
    }

    /// Called once when a keyed registry creates this holder.
    fn on_created(&self) {}

    /// Called once when a keyed registry tears this holder down.
    fn on_destroyed(&self) {}
}

/// Instrumentation state shared by every handle to one holder's store.
pub(crate) struct StoreInner<H: StateHolder> {
    holder: Arc<H>,
    key: HolderKey,
    label: Cow<'static, str>,
    /// Held across mutation, change check and broadcast
    serial: ReentrantMutex<()>,
    /// Most recently observed (and broadcast) state
    observed: Mutex<H::State>,
    subscribers: SubscriberSet<H::State>,
    actions: ActionTable<H>,
}

impl<H: StateHolder> Drop for StoreInner<H> {
    fn drop(&mut self) {
        arena::release(self.key);
    }
}

/// Handle to an instrumented holder.
///
/// Cloning is cheap and every clone refers to the same subscriber set and
/// observed state. Instrumenting the same `Arc<H>` twice yields handles to
/// the same store.
pub struct Store<H: StateHolder> {
    inner: Arc<StoreInner<H>>,
}

impl<H: StateHolder> Clone for Store<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: StateHolder> fmt::Debug for Store<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("label", &self.inner.label)
            .field("subscribers", &self.inner.subscribers.len())
            .field("actions", &self.inner.actions.len())
            .finish()
    }
}

/// Instrument `holder`, or return its existing store.
pub fn instrument<H: StateHolder>(holder: Arc<H>) -> Store<H> {
    Store::builder(holder).build()
}

/// Builder for configuring a store before instrumentation.
///
/// Settings only apply when the holder is not instrumented yet; building
/// against an instrumented holder returns the existing store unchanged.
pub struct StoreBuilder<H: StateHolder> {
    holder: Arc<H>,
    label: Option<Cow<'static, str>>,
    untracked_suffix: Cow<'static, str>,
}

impl<H: StateHolder> StoreBuilder<H> {
    /// Label used in log events. Defaults to the holder's type name.
    pub fn label(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Name suffix that marks a declared action as untracked.
    ///
    /// Default: [`DEFAULT_UNTRACKED_SUFFIX`]
    pub fn untracked_suffix(mut self, suffix: impl Into<Cow<'static, str>>) -> Self {
        self.untracked_suffix = suffix.into();
        self
    }

    /// Instrument the holder.
    pub fn build(self) -> Store<H> {
        let Self {
            holder,
            label,
            untracked_suffix,
        } = self;

        let (store, created) = arena::get_or_insert_with(&holder, || {
            let label = label.unwrap_or(Cow::Borrowed(std::any::type_name::<H>()));
            let mut actions = ActionTable::new(untracked_suffix);
            H::declare(&mut actions);
            debug!(store = %label, actions = actions.len(), "instrumenting state holder");
            Arc::new(StoreInner {
                serial: ReentrantMutex::new(()),
                observed: Mutex::new(holder.state()),
                key: HolderKey::of(&holder),
                holder: Arc::clone(&holder),
                label,
                subscribers: SubscriberSet::new(),
                actions,
            })
        });

        if !created {
            cov_mark::hit!(reinstrument_returns_existing_store);
            debug!(store = %store.label(), "holder already instrumented");
        }
        store
    }
}

impl<H: StateHolder> Store<H> {
    /// Start configuring instrumentation for `holder`.
    pub fn builder(holder: Arc<H>) -> StoreBuilder<H> {
        StoreBuilder {
            holder,
            label: None,
            untracked_suffix: Cow::Borrowed(DEFAULT_UNTRACKED_SUFFIX),
        }
    }

    pub(crate) fn from_inner(inner: Arc<StoreInner<H>>) -> Self {
        Self { inner }
    }

    /// The instrumented holder.
    pub fn holder(&self) -> &Arc<H> {
        &self.inner.holder
    }

    /// Label used in log events.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Current state, read through the accessor.
    pub fn state(&self) -> H::State {
        self.inner.holder.state()
    }

    /// The state as of the last broadcast (or instrumentation).
    pub fn observed(&self) -> H::State {
        self.inner.observed.lock().clone()
    }

    /// The subscriber set.
    pub fn subscribers(&self) -> &SubscriberSet<H::State> {
        &self.inner.subscribers
    }

    /// Register a `(next, prev)` subscriber.
    pub fn subscribe(&self, subscriber: &Subscriber<H::State>) -> bool {
        self.inner.subscribers.add(subscriber)
    }

    /// Remove a subscriber. Unknown subscribers are ignored.
    ///
    /// Waits for a broadcast running on another thread to finish, so the
    /// subscriber is never called after this returns.
    pub fn unsubscribe(&self, subscriber: &Subscriber<H::State>) -> bool {
        let _serial = self.inner.serial.lock();
        self.inner.subscribers.remove(subscriber)
    }

    /// Broadcast `(next, prev)` without change detection, in line with
    /// other broadcasts of this store.
    pub(crate) fn broadcast_unchecked(&self, next: &H::State, prev: &H::State) -> usize {
        let _serial = self.inner.serial.lock();
        self.inner.subscribers.broadcast(next, prev)
    }

    /// The flat action surface declared by the holder.
    pub fn actions(&self) -> Actions<H> {
        Actions::new(self.clone())
    }

    pub(crate) fn action_table(&self) -> &ActionTable<H> {
        &self.inner.actions
    }

    /// Bind the full state of this store.
    pub fn bind(&self) -> Binding<H, H::State> {
        Binding::new(Source::store(self))
    }

    /// Bind a projection of this store's state.
    pub fn bind_select<S, F>(&self, selector: F) -> Binding<H, S>
    where
        S: Shallow + Clone + Send + Sync + 'static,
        F: Fn(&H::State) -> S + Send + Sync + 'static,
    {
        Binding::select(Source::store(self), selector)
    }

    /// True if both handles refer to the same store.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run a mutator and broadcast if the state changed.
    ///
    /// The return value decides whether notification may happen (see
    /// [`Settle`]). A cancelled or failed mutation hands back its payload
    /// without broadcasting and leaves the observed state untouched.
    ///
    /// Panics raised by `mutator` propagate; nothing is broadcast for them.
    pub fn act<R: Settle>(&self, mutator: impl FnOnce(&H) -> R) -> R::Output {
        let _serial = self.inner.serial.lock();
        let (output, proceed) = mutator(&self.inner.holder).settle();
        if proceed {
            self.notify_if_changed("sync");
        } else {
            cov_mark::hit!(sync_mutation_suppressed);
            debug!(store = %self.label(), "mutation settled without notification");
        }
        output
    }

    /// Run a deferred mutator.
    ///
    /// `mutator` runs immediately; a change it made before returning its
    /// future is broadcast right away. The returned [`Deferred`] resolves to
    /// the settled value and, unless the settlement is a cancellation or an
    /// `Err`, broadcasts any further change at that point.
    pub fn act_async<F, Fut>(&self, mutator: F) -> Deferred<H, Fut>
    where
        F: FnOnce(Arc<H>) -> Fut,
        Fut: Future,
        Fut::Output: Settle,
    {
        let _serial = self.inner.serial.lock();
        let pending = mutator(Arc::clone(&self.inner.holder));
        if self.notify_if_changed("before-settle") {
            cov_mark::hit!(deferred_mutation_changed_synchronously);
        }
        Deferred::new(self.clone(), pending)
    }

    /// Compare the current state with the observed one and broadcast if it
    /// changed. Returns whether a broadcast happened.
    pub(crate) fn notify_if_changed(&self, phase: &'static str) -> bool {
        let _serial = self.inner.serial.lock();
        let (next, prev) = {
            let mut observed = self.inner.observed.lock();
            let next = self.inner.holder.state();
            if !next.changed_from(&observed) {
                cov_mark::hit!(unchanged_state_not_broadcast);
                return false;
            }
            let prev = std::mem::replace(&mut *observed, next.clone());
            (next, prev)
        };

        let notified = self.inner.subscribers.broadcast(&next, &prev);
        debug!(store = %self.label(), phase, notified, "state change broadcast");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    struct Counter {
        count: AtomicI64,
    }

    impl Counter {
        fn new(count: i64) -> Self {
            Self {
                count: AtomicI64::new(count),
            }
        }
    }

    impl StateHolder for Counter {
        type State = i64;

        fn state(&self) -> i64 {
            self.count.load(Ordering::SeqCst)
        }
    }

    fn counting_subscriber(hits: &Arc<AtomicUsize>) -> Subscriber<i64> {
        let hits = Arc::clone(hits);
        Subscriber::new(move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn instrumenting_twice_returns_same_store() {
        cov_mark::check!(reinstrument_returns_existing_store);

        let holder = Arc::new(Counter::new(0));
        let first = instrument(Arc::clone(&holder));
        let second = Store::builder(Arc::clone(&holder)).label("ignored").build();

        assert!(first.ptr_eq(&second));
        assert_ne!(second.label(), "ignored");
    }

    #[test]
    fn side_table_entry_dies_with_store() {
        let holder = Arc::new(Counter::new(0));
        let store = instrument(Arc::clone(&holder));
        assert!(arena::is_instrumented(&holder));

        drop(store);
        assert!(!arena::is_instrumented(&holder));
    }

    #[test]
    fn unchanged_state_is_not_broadcast() {
        cov_mark::check!(unchanged_state_not_broadcast);

        let store = instrument(Arc::new(Counter::new(3)));
        let hits = Arc::new(AtomicUsize::new(0));
        store.subscribe(&counting_subscriber(&hits));

        store.act(|c| c.count.store(3, Ordering::SeqCst));

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancelled_mutation_keeps_observed_state() {
        cov_mark::check!(sync_mutation_suppressed);

        let store = instrument(Arc::new(Counter::new(0)));
        let payload = store.act(|c| {
            c.count.store(9, Ordering::SeqCst);
            crate::cancel("kept quiet")
        });

        assert_eq!(payload, "kept quiet");
        assert_eq!(store.observed(), 0);
        assert_eq!(store.state(), 9);
    }

    #[test]
    fn observed_state_follows_broadcasts() {
        let store = instrument(Arc::new(Counter::new(1)));
        store.act(|c| c.count.fetch_add(1, Ordering::SeqCst));

        assert_eq!(store.observed(), 2);
    }

    #[test]
    fn cancel_through_act_hands_back_payload() {
        let store = instrument(Arc::new(Counter::new(0)));
        let hits = Arc::new(AtomicUsize::new(0));
        store.subscribe(&counting_subscriber(&hits));

        let payload: i32 = store.act(|c| {
            c.count.store(5, Ordering::SeqCst);
            crate::cancel(3)
        });

        assert_eq!(payload, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn plain_return_values_pass_through() {
        let store = instrument(Arc::new(Counter::new(1)));

        let before = store.act(|c| c.count.fetch_add(1, Ordering::SeqCst));

        assert_eq!(before, 1);
        assert_eq!(store.observed(), 2);
    }

    #[test]
    fn subscriber_may_reenter_the_store() {
        let store = instrument(Arc::new(Counter::new(0)));
        let inner = store.clone();
        store.subscribe(&Subscriber::new(move |next: &i64, _: &i64| {
            if *next == 1 {
                inner.act(|c| c.count.store(2, Ordering::SeqCst));
            }
        }));

        store.act(|c| c.count.store(1, Ordering::SeqCst));

        assert_eq!(store.observed(), 2);
    }
}
