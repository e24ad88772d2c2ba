// Holder arena - side table of instrumented state holders
//
// Instrumentation metadata (the live subscriber set and the last observed
// state) is never stored on the holder itself. Instead this table maps the
// holder's identity, the address of its `Arc`, to a weak reference to the
// store internals created for it.
//
// LIFECYCLE:
// - An entry is created the first time a holder is instrumented.
// - Looking a holder up upgrades the weak reference; a dead entry reads as
//   "never instrumented".
// - When the store internals are dropped they prune their own entry. The
//   store keeps the holder alive, so an address cannot be reused by another
//   holder while its entry is live.
//
// Lookups are lock-free (papaya). Creation and pruning are serialized by a
// reentrant lock so that two threads instrumenting the same holder end up
// sharing one store, and so that instrumenting another holder from inside a
// holder's action declarations does not deadlock.

use std::any::Any;
use std::sync::{Arc, LazyLock, Weak};

use papaya::HashMap as PapayaHashMap;
use parking_lot::{ReentrantMutex, const_reentrant_mutex};

use crate::hash::FastHashBuilder;
use crate::store::{StateHolder, Store, StoreInner};

type ErasedStore = dyn Any + Send + Sync;

/// Global side table: holder address -> store internals
static INSTRUMENTED: LazyLock<PapayaHashMap<HolderKey, Weak<ErasedStore>, FastHashBuilder>> =
    LazyLock::new(|| PapayaHashMap::with_hasher(FastHashBuilder));

/// Serializes create-if-absent and pruning
static CREATION: ReentrantMutex<()> = const_reentrant_mutex(());

/// Identity of an instrumented holder: the address of its shared allocation.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct HolderKey(usize);

impl HolderKey {
    /// Key for `holder`
    pub fn of<H>(holder: &Arc<H>) -> Self {
        Self(Arc::as_ptr(holder) as usize)
    }
}

/// Look up the store instrumenting `holder`, if any.
pub(crate) fn lookup<H: StateHolder>(holder: &Arc<H>) -> Option<Store<H>> {
    lookup_inner(HolderKey::of(holder)).map(Store::from_inner)
}

fn lookup_inner<H: StateHolder>(key: HolderKey) -> Option<Arc<StoreInner<H>>> {
    let guard = INSTRUMENTED.pin();
    let erased = guard.get(&key)?.upgrade()?;
    // A live entry for this address always belongs to a holder of type H:
    // the store owns the holder, so the address cannot have been recycled.
    erased.downcast::<StoreInner<H>>().ok()
}

/// Return the store for `holder`, creating it with `create` if the holder
/// has not been instrumented yet.
///
/// The boolean is true when `create` ran.
pub(crate) fn get_or_insert_with<H, F>(holder: &Arc<H>, create: F) -> (Store<H>, bool)
where
    H: StateHolder,
    F: FnOnce() -> Arc<StoreInner<H>>,
{
    let key = HolderKey::of(holder);
    let _creation = CREATION.lock();

    if let Some(existing) = lookup_inner::<H>(key) {
        return (Store::from_inner(existing), false);
    }

    let inner = create();
    let erased: Arc<ErasedStore> = inner.clone();
    INSTRUMENTED.pin().insert(key, Arc::downgrade(&erased));
    (Store::from_inner(inner), true)
}

/// Prune the entry for `key` if its store is gone.
///
/// Called from the store's `Drop`, at which point the weak reference can no
/// longer be upgraded.
pub(crate) fn release(key: HolderKey) {
    let _creation = CREATION.lock();
    let guard = INSTRUMENTED.pin();
    if guard
        .get(&key)
        .is_some_and(|weak| weak.strong_count() == 0)
    {
        guard.remove(&key);
    }
}

/// Whether `holder` currently has a live store.
pub fn is_instrumented<H: StateHolder>(holder: &Arc<H>) -> bool {
    lookup(holder).is_some()
}
