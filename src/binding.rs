//! Per-consumer bindings.
//!
//! A consumer goes through three stages, each a distinct type:
//!
//! ```text
//! Source ──Binding::new/select──► Binding ──activate──► ActiveBinding ──deactivate/drop──► (gone)
//!          resolve + instrument        subscribe                 unsubscribe
//! ```
//!
//! [`Binding`] is the "compute once" half: the source is resolved (a factory
//! runs at most once), the holder is instrumented, and the initial value is
//! read. It can be cloned freely and activated later.
//!
//! [`ActiveBinding`] is the "subscribe" half. It owns the one [`Subscriber`]
//! handle it registered and removes exactly that handle when it is
//! deactivated or dropped. Deactivation is terminal; a consumer that comes
//! back to life activates a fresh clone of its `Binding`.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::actions::Actions;
use crate::equality::{Shallow, selection_changed};
use crate::registry::Subscriber;
use crate::store::{StateHolder, Store, instrument};

type Project<T, S> = Arc<dyn Fn(&T) -> S + Send + Sync>;
type Compare<S> = Arc<dyn Fn(&S, &S) -> bool + Send + Sync>;

/// Where a binding gets its holder from.
pub struct Source<H: StateHolder>(SourceKind<H>);

enum SourceKind<H: StateHolder> {
    Holder(Arc<H>),
    Store(Store<H>),
    Factory(Box<dyn FnOnce() -> H + Send>),
}

impl<H: StateHolder> Source<H> {
    /// A holder that may be shared with other bindings.
    pub fn shared(holder: Arc<H>) -> Self {
        Self(SourceKind::Holder(holder))
    }

    /// An already instrumented store.
    pub fn store(store: &Store<H>) -> Self {
        Self(SourceKind::Store(store.clone()))
    }

    /// A factory producing a fresh holder. Runs once, when the binding is
    /// created.
    pub fn factory(factory: impl FnOnce() -> H + Send + 'static) -> Self {
        Self(SourceKind::Factory(Box::new(factory)))
    }

    fn resolve(self) -> Store<H> {
        match self.0 {
            SourceKind::Holder(holder) => instrument(holder),
            SourceKind::Store(store) => store,
            SourceKind::Factory(factory) => {
                cov_mark::hit!(binding_runs_factory);
                instrument(Arc::new(factory()))
            }
        }
    }
}

impl<H: StateHolder> fmt::Debug for Source<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.0 {
            SourceKind::Holder(_) => "Holder",
            SourceKind::Store(_) => "Store",
            SourceKind::Factory(_) => "Factory",
        };
        f.debug_tuple("Source").field(&kind).finish()
    }
}

/// Decides whether a broadcast reaches the consumer.
enum Gate<S> {
    /// Every broadcast is a real change of the full state.
    Always,
    /// The selected slice changed under [`selection_changed`].
    Selection,
    /// Caller-supplied `(prev, next) -> update?` predicate.
    Custom(Compare<S>),
}

impl<S> Clone for Gate<S> {
    fn clone(&self) -> Self {
        match self {
            Gate::Always => Gate::Always,
            Gate::Selection => Gate::Selection,
            Gate::Custom(compare) => Gate::Custom(Arc::clone(compare)),
        }
    }
}

/// Receives the new exposed value when the consumer should update.
pub trait Dispatch<S>: Send + Sync + 'static {
    /// Request an update with `value`.
    fn dispatch(&self, value: S);
}

impl<S, F> Dispatch<S> for F
where
    F: Fn(S) + Send + Sync + 'static,
{
    fn dispatch(&self, value: S) {
        (self)(value)
    }
}

/// A resolved, instrumented source together with its projection.
///
/// `S` is the exposed value: the full state for [`Binding::new`], the
/// selected slice for [`Binding::select`].
pub struct Binding<H: StateHolder, S = <H as StateHolder>::State> {
    store: Store<H>,
    project: Project<H::State, S>,
    gate: Gate<S>,
    initial: S,
}

impl<H: StateHolder, S: Clone> Clone for Binding<H, S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            project: Arc::clone(&self.project),
            gate: self.gate.clone(),
            initial: self.initial.clone(),
        }
    }
}

impl<H: StateHolder, S: fmt::Debug> fmt::Debug for Binding<H, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("store", &self.store.label())
            .field("initial", &self.initial)
            .finish_non_exhaustive()
    }
}

impl<H: StateHolder> Binding<H> {
    /// Bind the full state of `source`.
    pub fn new(source: Source<H>) -> Self {
        let store = source.resolve();
        let initial = store.state();
        Self {
            store,
            project: Arc::new(<H::State as Clone>::clone),
            gate: Gate::Always,
            initial,
        }
    }
}

impl<H, S> Binding<H, S>
where
    H: StateHolder,
    S: Shallow + Clone + Send + Sync + 'static,
{
    /// Bind the slice of `source`'s state picked by `selector`.
    ///
    /// Broadcasts that leave the slice unchanged (see
    /// [`selection_changed`]) never reach the consumer.
    pub fn select<F>(source: Source<H>, selector: F) -> Self
    where
        F: Fn(&H::State) -> S + Send + Sync + 'static,
    {
        let store = source.resolve();
        let initial = selector(&store.state());
        Self {
            store,
            project: Arc::new(selector),
            gate: Gate::Selection,
            initial,
        }
    }

    /// Replace the update check with `compare(prev, next)`, which returns
    /// true when the consumer should update.
    pub fn should<F>(mut self, compare: F) -> Self
    where
        F: Fn(&S, &S) -> bool + Send + Sync + 'static,
    {
        self.gate = Gate::Custom(Arc::new(compare));
        self
    }

    /// The exposed value at bind time.
    pub fn value(&self) -> S {
        self.initial.clone()
    }

    /// The store's action surface.
    pub fn actions(&self) -> Actions<H> {
        self.store.actions()
    }

    /// The resolved store.
    pub fn store(&self) -> &Store<H> {
        &self.store
    }

    /// Subscribe, forwarding every relevant change to `dispatch`.
    pub fn activate<D: Dispatch<S>>(self, dispatch: D) -> ActiveBinding<H, S> {
        let Self {
            store,
            project,
            gate,
            initial,
        } = self;
        let current = Arc::new(Mutex::new(initial));

        let latest = Arc::clone(&current);
        let subscriber = Subscriber::new(move |next: &H::State, prev: &H::State| {
            let next = project(next);
            let update = match &gate {
                Gate::Always => true,
                Gate::Selection => selection_changed(&project(prev), &next),
                Gate::Custom(should) => should(&project(prev), &next),
            };
            if !update {
                cov_mark::hit!(binding_update_gated);
                return;
            }
            *latest.lock() = next.clone();
            dispatch.dispatch(next);
        });

        store.subscribe(&subscriber);
        debug!(store = %store.label(), subscribers = store.subscribers().len(), "binding activated");
        ActiveBinding {
            store,
            subscriber,
            current,
        }
    }
}

/// A subscribed binding. Dropping it unsubscribes.
pub struct ActiveBinding<H: StateHolder, S> {
    store: Store<H>,
    subscriber: Subscriber<H::State>,
    current: Arc<Mutex<S>>,
}

impl<H: StateHolder, S: Clone> ActiveBinding<H, S> {
    /// The most recently dispatched value, or the initial one.
    pub fn value(&self) -> S {
        self.current.lock().clone()
    }

    /// The store's action surface.
    pub fn actions(&self) -> Actions<H> {
        self.store.actions()
    }

    /// The resolved store.
    pub fn store(&self) -> &Store<H> {
        &self.store
    }

    /// Whether this binding's subscriber is still registered.
    pub fn is_subscribed(&self) -> bool {
        self.store.subscribers().contains(&self.subscriber)
    }

    /// Unsubscribe. Equivalent to dropping the binding.
    pub fn deactivate(self) {
        drop(self);
    }
}

impl<H: StateHolder, S> Drop for ActiveBinding<H, S> {
    fn drop(&mut self) {
        let removed = self.store.unsubscribe(&self.subscriber);
        trace!(store = %self.store.label(), removed, "binding deactivated");
    }
}

impl<H: StateHolder, S> fmt::Debug for ActiveBinding<H, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveBinding")
            .field("store", &self.store.label())
            .field("subscriber", &self.subscriber)
            .finish_non_exhaustive()
    }
}
