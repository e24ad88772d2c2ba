//! The flat, name-addressed action surface of a store.
//!
//! A holder declares its actions once, in [`StateHolder::declare`]. Each
//! entry lands in one of two buckets:
//!
//! - **mutators** (`mutator`, `deferred`): run through the store,
//!   so subscribers hear about any change they make. A mutator whose name
//!   ends with the store's untracked suffix (default `"_"`) runs directly
//!   on the holder instead and never notifies.
//! - **helpers**: non-mutating functions exposed next to the mutators. They
//!   are never tracked, whatever their name.
//!
//! Consumers see both buckets merged into one map through [`Actions`]. The
//! state accessor itself is never part of it.
//!
//! Arguments and return values cross the map type-erased; asking for the
//! wrong types is reported as an [`Error`], not a panic.

use std::any::{Any, type_name};
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::hash::FastHashBuilder;
use crate::outcome::Settle;
use crate::store::{StateHolder, Store};

type Erased = Box<dyn Any + Send>;
type SyncFn<H> = Arc<dyn Fn(&Store<H>, Erased) -> Result<Erased> + Send + Sync>;
type AsyncFn<H> = Arc<dyn Fn(&Store<H>, Erased) -> Result<BoxFuture<'static, Erased>> + Send + Sync>;

enum Invoke<H: StateHolder> {
    Sync(SyncFn<H>),
    Deferred(AsyncFn<H>),
}

impl<H: StateHolder> Clone for Invoke<H> {
    fn clone(&self) -> Self {
        match self {
            Invoke::Sync(f) => Invoke::Sync(Arc::clone(f)),
            Invoke::Deferred(f) => Invoke::Deferred(Arc::clone(f)),
        }
    }
}

pub(crate) struct Entry<H: StateHolder> {
    invoke: Invoke<H>,
    tracked: bool,
    helper: bool,
}

/// Declared actions of one holder type, keyed by name in declaration order.
pub struct ActionTable<H: StateHolder> {
    entries: IndexMap<Cow<'static, str>, Entry<H>, FastHashBuilder>,
    untracked_suffix: Cow<'static, str>,
}

impl<H: StateHolder> ActionTable<H> {
    pub(crate) fn new(untracked_suffix: Cow<'static, str>) -> Self {
        Self {
            entries: IndexMap::with_hasher(FastHashBuilder),
            untracked_suffix,
        }
    }

    /// Number of declared actions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing was declared.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Entry<H>> {
        self.entries.get(name)
    }

    fn tracks(&self, name: &str) -> bool {
        self.untracked_suffix.is_empty() || !name.ends_with(&*self.untracked_suffix)
    }

    fn insert(&mut self, name: Cow<'static, str>, invoke: Invoke<H>, tracked: bool, helper: bool) {
        trace!(action = %name, tracked, helper, "declaring action");
        let entry = Entry {
            invoke,
            tracked,
            helper,
        };
        if self.entries.insert(name.clone(), entry).is_some() {
            warn!(action = %name, "action declared twice, keeping the later declaration");
        }
    }

    /// Declare a mutator.
    ///
    /// Unless the name carries the untracked suffix, it runs through
    /// [`Store::act`] and subscribers are notified when the state changed.
    /// The return value goes through [`Settle`]: callers receive
    /// `R::Output`, e.g. the payload of an [`Outcome`](crate::Outcome), and
    /// a cancelled or failed mutation never notifies.
    pub fn mutator<A, R, F>(&mut self, name: impl Into<Cow<'static, str>>, mutator: F) -> &mut Self
    where
        A: Any + Send,
        R: Settle,
        R::Output: Any + Send,
        F: Fn(&H, A) -> R + Send + Sync + 'static,
    {
        let name = name.into();
        let tracked = self.tracks(&name);
        let label = name.clone();
        let invoke: SyncFn<H> = Arc::new(move |store: &Store<H>, arg: Erased| -> Result<Erased> {
            let arg = downcast_arg::<A>(&label, arg)?;
            let out = if tracked {
                store.act(|holder| mutator(holder, arg))
            } else {
                mutator(store.holder(), arg).settle().0
            };
            Ok(Box::new(out) as Erased)
        });
        self.insert(name, Invoke::Sync(invoke), tracked, false);
        self
    }

    /// Declare a deferred mutator, see [`Store::act_async`].
    pub fn deferred<A, Fut, F>(&mut self, name: impl Into<Cow<'static, str>>, mutator: F) -> &mut Self
    where
        A: Any + Send,
        Fut: Future + Send + 'static,
        Fut::Output: Settle,
        <Fut::Output as Settle>::Output: Any + Send,
        F: Fn(Arc<H>, A) -> Fut + Send + Sync + 'static,
    {
        let name = name.into();
        let tracked = self.tracks(&name);
        let label = name.clone();
        let invoke: AsyncFn<H> = Arc::new(
            move |store: &Store<H>, arg: Erased| -> Result<BoxFuture<'static, Erased>> {
                let arg = downcast_arg::<A>(&label, arg)?;
                let pending = if tracked {
                    store
                        .act_async(|holder| mutator(holder, arg))
                        .map(|out| Box::new(out) as Erased)
                        .boxed()
                } else {
                    mutator(Arc::clone(store.holder()), arg)
                        .map(|settled| Box::new(settled.settle().0) as Erased)
                        .boxed()
                };
                Ok(pending)
            },
        );
        self.insert(name, Invoke::Deferred(invoke), tracked, false);
        self
    }

    /// Declare a non-mutating helper. Helpers never notify.
    pub fn helper<A, R, F>(&mut self, name: impl Into<Cow<'static, str>>, helper: F) -> &mut Self
    where
        A: Any + Send,
        R: Any + Send,
        F: Fn(&H, A) -> R + Send + Sync + 'static,
    {
        let name = name.into();
        let label = name.clone();
        let invoke: SyncFn<H> = Arc::new(move |store: &Store<H>, arg: Erased| -> Result<Erased> {
            let arg = downcast_arg::<A>(&label, arg)?;
            Ok(Box::new(helper(store.holder(), arg)) as Erased)
        });
        self.insert(name, Invoke::Sync(invoke), false, true);
        self
    }
}

impl<H: StateHolder> fmt::Debug for ActionTable<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionTable")
            .field("names", &self.entries.keys().collect::<Vec<_>>())
            .field("untracked_suffix", &self.untracked_suffix)
            .finish()
    }
}

fn downcast_arg<A: Any>(name: &str, arg: Erased) -> Result<A> {
    arg.downcast::<A>()
        .map(|arg| *arg)
        .map_err(|_| Error::ArgumentType {
            name: name.to_owned(),
            expected: type_name::<A>(),
        })
}

fn downcast_ret<R: Any>(name: &str, out: Erased) -> Result<R> {
    out.downcast::<R>()
        .map(|out| *out)
        .map_err(|_| Error::ReturnType {
            name: name.to_owned(),
            requested: type_name::<R>(),
        })
}

/// Merged map of a store's mutators and helpers.
///
/// ```ignore
/// let actions = store.actions();
/// actions.call::<i64, ()>("increment", 2)?;
/// let positive: bool = actions.call("is_positive", ())?;
/// ```
pub struct Actions<H: StateHolder> {
    store: Store<H>,
}

impl<H: StateHolder> Clone for Actions<H> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<H: StateHolder> fmt::Debug for Actions<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actions")
            .field("store", &self.store.label())
            .field("names", &self.names())
            .finish()
    }
}

impl<H: StateHolder> Actions<H> {
    pub(crate) fn new(store: Store<H>) -> Self {
        Self { store }
    }

    /// The underlying store, for typed access to the holder.
    pub fn store(&self) -> &Store<H> {
        &self.store
    }

    /// Whether an action called `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.store.action_table().get(name).is_some()
    }

    /// All action names, in declaration order.
    pub fn names(&self) -> Vec<&str> {
        self.store
            .action_table()
            .entries
            .keys()
            .map(|name| name.as_ref())
            .collect()
    }

    /// `Some(true)` for a tracked mutator, `Some(false)` for untracked
    /// mutators and helpers, `None` for unknown names.
    pub fn is_tracked(&self, name: &str) -> Option<bool> {
        self.store.action_table().get(name).map(|entry| entry.tracked)
    }

    /// `Some(true)` if `name` was declared as a helper.
    pub fn is_helper(&self, name: &str) -> Option<bool> {
        self.store.action_table().get(name).map(|entry| entry.helper)
    }

    /// Invoke a synchronous action.
    pub fn call<A, R>(&self, name: &str, arg: A) -> Result<R>
    where
        A: Any + Send,
        R: Any,
    {
        let invoke = match self.lookup(name)? {
            Invoke::Sync(invoke) => invoke,
            Invoke::Deferred(_) => {
                return Err(Error::Deferred {
                    name: name.to_owned(),
                });
            }
        };
        trace!(store = %self.store.label(), action = name, "calling action");
        let out = invoke(&self.store, Box::new(arg))?;
        downcast_ret(name, out)
    }

    /// Invoke a deferred action.
    ///
    /// The mutator runs right away; the returned future resolves to its
    /// settled value and must be polled for the post-settlement
    /// notification to happen.
    pub fn call_async<A, R>(&self, name: &str, arg: A) -> Result<BoxFuture<'static, Result<R>>>
    where
        A: Any + Send,
        R: Any,
    {
        let invoke = match self.lookup(name)? {
            Invoke::Deferred(invoke) => invoke,
            Invoke::Sync(_) => {
                return Err(Error::NotDeferred {
                    name: name.to_owned(),
                });
            }
        };
        trace!(store = %self.store.label(), action = name, "calling deferred action");
        let pending = invoke(&self.store, Box::new(arg))?;
        let name = name.to_owned();
        Ok(pending.map(move |out| downcast_ret(&name, out)).boxed())
    }

    fn lookup(&self, name: &str) -> Result<Invoke<H>> {
        match self.store.action_table().get(name) {
            Some(entry) => Ok(entry.invoke.clone()),
            None => {
                cov_mark::hit!(unknown_action_requested);
                Err(Error::UnknownAction {
                    name: name.to_owned(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Subscriber;
    use crate::{Outcome, instrument};
    use futures::executor::block_on;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    struct Account {
        balance: AtomicI64,
    }

    impl StateHolder for Account {
        type State = i64;

        fn state(&self) -> i64 {
            self.balance.load(Ordering::SeqCst)
        }

        fn declare(actions: &mut ActionTable<Self>) {
            actions
                .mutator("deposit", |a: &Account, amount: i64| {
                    a.balance.fetch_add(amount, Ordering::SeqCst);
                })
                .mutator("reset_", |a: &Account, ()| {
                    a.balance.store(0, Ordering::SeqCst);
                })
                .mutator("bump_quietly", |a: &Account, ()| {
                    a.balance.fetch_add(1, Ordering::SeqCst);
                    crate::cancel(7u8)
                })
                .mutator("withdraw", |a: &Account, amount: i64| {
                    let balance = a.balance.load(Ordering::SeqCst);
                    if amount > balance {
                        return crate::cancel(false);
                    }
                    a.balance.fetch_sub(amount, Ordering::SeqCst);
                    Outcome::Commit(true)
                })
                .deferred("interest", |a: Arc<Account>, rate: i64| async move {
                    let balance = a.balance.load(Ordering::SeqCst);
                    a.balance.store(balance + balance * rate / 100, Ordering::SeqCst);
                })
                .helper("can_afford", |a: &Account, amount: i64| {
                    a.balance.load(Ordering::SeqCst) >= amount
                });
        }
    }

    fn account(balance: i64) -> (Store<Account>, Arc<AtomicUsize>) {
        let store = instrument(Arc::new(Account {
            balance: AtomicI64::new(balance),
        }));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        store.subscribe(&Subscriber::new(move |_: &i64, _: &i64| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        (store, hits)
    }

    #[test]
    fn tracked_mutator_notifies() {
        let (store, hits) = account(0);

        store.actions().call::<i64, ()>("deposit", 5).unwrap();

        assert_eq!(store.state(), 5);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn suffixed_mutator_is_untracked() {
        let (store, hits) = account(10);
        let actions = store.actions();

        actions.call::<(), ()>("reset_", ()).unwrap();

        assert_eq!(actions.is_tracked("reset_"), Some(false));
        assert_eq!(store.state(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(store.observed(), 10);
    }

    #[test]
    fn cancelling_mutator_hands_back_payload() {
        let (store, hits) = account(3);
        let actions = store.actions();

        assert!(!actions.call::<i64, bool>("withdraw", 7).unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert!(actions.call::<i64, bool>("withdraw", 2).unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_from_a_mutating_entry_is_honoured() {
        cov_mark::check!(sync_mutation_suppressed);

        let (store, hits) = account(1);

        assert_eq!(store.actions().call::<(), u8>("bump_quietly", ()).unwrap(), 7);
        assert_eq!(store.state(), 2);
        assert_eq!(store.observed(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn helpers_share_the_map_without_tracking() {
        let (store, hits) = account(4);
        let actions = store.actions();

        assert!(actions.call::<i64, bool>("can_afford", 4).unwrap());
        assert_eq!(actions.is_helper("can_afford"), Some(true));
        assert_eq!(actions.is_tracked("can_afford"), Some(false));
        assert_eq!(
            actions.names(),
            vec![
                "deposit",
                "reset_",
                "bump_quietly",
                "withdraw",
                "interest",
                "can_afford"
            ]
        );
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn deferred_action_notifies_after_settling() {
        let (store, hits) = account(100);
        let pending = store
            .actions()
            .call_async::<i64, ()>("interest", 10)
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        block_on(pending).unwrap();
        assert_eq!(store.state(), 110);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn misuse_is_reported() {
        cov_mark::check!(unknown_action_requested);

        let (store, _) = account(0);
        let actions = store.actions();

        assert!(matches!(
            actions.call::<(), ()>("state", ()),
            Err(Error::UnknownAction { .. })
        ));
        assert!(matches!(
            actions.call::<&str, ()>("deposit", "five"),
            Err(Error::ArgumentType { .. })
        ));
        assert!(matches!(
            actions.call::<i64, String>("can_afford", 1),
            Err(Error::ReturnType { .. })
        ));
        assert!(matches!(
            actions.call::<i64, ()>("interest", 1),
            Err(Error::Deferred { .. })
        ));
        assert!(matches!(
            actions.call_async::<i64, ()>("deposit", 1),
            Err(Error::NotDeferred { .. })
        ));
    }

    #[test]
    fn custom_suffix_changes_tracking() {
        struct Flag(AtomicI64);

        impl StateHolder for Flag {
            type State = i64;

            fn state(&self) -> i64 {
                self.0.load(Ordering::SeqCst)
            }

            fn declare(actions: &mut ActionTable<Self>) {
                actions
                    .mutator("set_", |f: &Flag, v: i64| f.0.store(v, Ordering::SeqCst))
                    .mutator("peek_readonly", |f: &Flag, ()| f.0.load(Ordering::SeqCst));
            }
        }

        let store = Store::builder(Arc::new(Flag(AtomicI64::new(0))))
            .untracked_suffix("_readonly")
            .build();
        let actions = store.actions();

        assert_eq!(actions.is_tracked("set_"), Some(true));
        assert_eq!(actions.is_tracked("peek_readonly"), Some(false));
    }
}
