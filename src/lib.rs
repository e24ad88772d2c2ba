#![deny(missing_docs)]

//! Change-detecting state holders for UI bindings.
//!
//! A *state holder* owns some state, exposes it through a pure accessor and
//! mutates it through methods. This crate instruments holders so that every
//! mutation that actually changes the state is broadcast to subscribers,
//! and binds consumers (components, widgets, views) to them so they only
//! re-render when the part of the state they look at changed.
//!
//! # Quick Start
//!
//! ```ignore
//! use bindstate::{ActionTable, Binding, Source, StateHolder, instrument};
//!
//! struct Counter {
//!     count: AtomicI64,
//! }
//!
//! impl StateHolder for Counter {
//!     type State = i64;
//!
//!     fn state(&self) -> i64 {
//!         self.count.load(Ordering::SeqCst)
//!     }
//!
//!     fn declare(actions: &mut ActionTable<Self>) {
//!         actions.mutator("add", |c: &Counter, by: i64| {
//!             c.count.fetch_add(by, Ordering::SeqCst);
//!         });
//!     }
//! }
//!
//! let store = instrument(Arc::new(Counter { count: AtomicI64::new(0) }));
//!
//! // Re-render whenever the count changes
//! let active = store.bind().activate(|count: i64| println!("count = {count}"));
//!
//! store.act(|c| c.count.fetch_add(1, Ordering::SeqCst)); // prints "count = 1"
//! store.act(|c| c.count.fetch_add(0, Ordering::SeqCst)); // unchanged, prints nothing
//! active.actions().call::<i64, ()>("add", 2)?;          // prints "count = 3"
//! ```
//!
//! # Core Types
//!
//! - [`Store`] - Instrumented holder. Runs mutators and broadcasts changes.
//! - [`Shallow`] / [`Identity`] - Change detection between two snapshots.
//! - [`Outcome`] - Mutator return value that can [`cancel`] notification.
//! - [`Deferred`] - Async mutator in flight; notifies again once settled.
//! - [`Binding`] / [`ActiveBinding`] - One consumer's view of a store.
//! - [`Actions`] - Flat map of a store's named mutators and helpers.
//! - [`KeyedStores`] - Shared stores looked up by key.
//!
//! # Change detection
//!
//! ```ignore
//! #[derive(Clone)]
//! struct Todo { title: String, done: bool, weight: f64 }
//! bindstate::shallow_record!(Todo { title, done, weight });
//!
//! // Fields are compared by identity; NaN is identical to NaN
//! ```
//!
//! Collections compare element-wise, driven by the keys (or indices) of the
//! newer snapshot. A selector slice switching between `None` and `Some` is
//! always a change, see [`selection_changed`].
//!
//! # Mutators
//!
//! ```ignore
//! store.act(|todos| todos.push(todo));               // broadcast if changed
//! store.act(|todos| bindstate::cancel(todos.len())); // never broadcast
//! store.act_async(|todos| async move { ... })        // broadcast now and after settling
//!     .detach(&executor)?;
//! ```
//!
//! # Bindings
//!
//! ```ignore
//! let binding = Binding::select(Source::factory(TodoList::new), |s| s.pending);
//! let active = binding.activate(move |pending| rerender(pending));
//! drop(active); // unsubscribes
//! ```
//!
//! Frameworks with hook-style state implement [`Host`] and call
//! [`use_store`] or [`use_store_select`] on every render.

// Internal modules
mod actions;
pub(crate) mod arena;
mod binding;
mod equality;
mod error;
mod executor;
mod hash;
mod host;
mod keyed;
mod outcome;
mod registry;
mod store;

// Change detection
pub use equality::{Identity, Shallow, selection_changed};

// Instrumentation
pub use arena::is_instrumented;
pub use executor::Deferred;
pub use outcome::{Outcome, Settle, cancel};
pub use store::{DEFAULT_UNTRACKED_SUFFIX, StateHolder, Store, StoreBuilder, instrument};

// Subscriptions
pub use registry::{Subscriber, SubscriberSet, broadcast, subscribe, unsubscribe};

// Bindings and actions
pub use actions::{ActionTable, Actions};
pub use binding::{ActiveBinding, Binding, Dispatch, Source};
pub use host::{Cleanup, Host, Setter, use_binding, use_store, use_store_select};
pub use keyed::{KeyedStores, Lease};

pub use error::{Error, Result};
