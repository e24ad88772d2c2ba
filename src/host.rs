//! Glue between bindings and a consumer framework.
//!
//! A host is whatever re-renders consumers: a UI component tree, a TUI
//! widget, a test harness. The binding layer asks exactly three things of
//! it, captured by [`Host`]. [`use_store`] and [`use_store_select`] combine
//! them into the usual "bind once, subscribe while mounted" shape.

use std::fmt;
use std::sync::Arc;

use crate::actions::Actions;
use crate::binding::{Binding, Source};
use crate::equality::Shallow;
use crate::store::StateHolder;

/// Teardown returned from a mount effect.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// The capabilities a consumer framework provides to a binding.
///
/// Each method is called once per render, in the same order on every
/// render, the way hook-style frameworks identify state by call position.
pub trait Host {
    /// Create a value on the first render and return a clone of it on
    /// every later render.
    fn memo<T: Clone + Send + 'static>(&mut self, init: impl FnOnce() -> T) -> T;

    /// Consumer-local state seeded by `initial` on the first render.
    ///
    /// Calling the setter stores a new value and schedules a re-render.
    fn local_state<S: Clone + Send + Sync + 'static>(
        &mut self,
        initial: impl FnOnce() -> S,
    ) -> (S, Setter<S>);

    /// Run `mount` once, when the consumer goes live. The returned cleanup
    /// runs when it is torn down. Later renders ignore the call.
    fn on_mount(&mut self, mount: impl FnOnce() -> Cleanup + Send + 'static);
}

/// Setter half of [`Host::local_state`].
pub struct Setter<S>(Arc<dyn Fn(S) + Send + Sync>);

impl<S> Setter<S> {
    /// Wrap the host's update function.
    pub fn new(set: impl Fn(S) + Send + Sync + 'static) -> Self {
        Self(Arc::new(set))
    }

    /// Store `value` and request a re-render.
    pub fn set(&self, value: S) {
        (self.0)(value)
    }
}

impl<S> Clone for Setter<S> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<S> fmt::Debug for Setter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Setter").finish_non_exhaustive()
    }
}

/// Bind once per consumer and stay subscribed while it is mounted.
///
/// `bind` runs on the first render only. Returns the consumer's current
/// value and the store's actions.
pub fn use_binding<X, H, S>(host: &mut X, bind: impl FnOnce() -> Binding<H, S>) -> (S, Actions<H>)
where
    X: Host,
    H: StateHolder,
    S: Shallow + Clone + Send + Sync + 'static,
{
    let binding = host.memo(bind);
    let (value, setter) = host.local_state(|| binding.value());
    let actions = binding.actions();

    host.on_mount(move || {
        let active = binding.activate(move |value: S| setter.set(value));
        Box::new(move || active.deactivate()) as Cleanup
    });

    (value, actions)
}

/// [`use_binding`] over the full state of `source`.
pub fn use_store<X, H>(host: &mut X, source: impl FnOnce() -> Source<H>) -> (H::State, Actions<H>)
where
    X: Host,
    H: StateHolder,
{
    use_binding(host, || Binding::new(source()))
}

/// [`use_binding`] over the slice of `source`'s state picked by `selector`.
pub fn use_store_select<X, H, S, F>(
    host: &mut X,
    source: impl FnOnce() -> Source<H>,
    selector: F,
) -> (S, Actions<H>)
where
    X: Host,
    H: StateHolder,
    S: Shallow + Clone + Send + Sync + 'static,
    F: Fn(&H::State) -> S + Send + Sync + 'static,
{
    use_binding(host, || Binding::select(source(), selector))
}
