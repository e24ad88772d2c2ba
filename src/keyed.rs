//! Shared stores looked up by a caller-chosen key.
//!
//! Useful when many unrelated consumers need the same holder but none of
//! them owns it: the first [`KeyedStores::acquire`] for a key creates and
//! instruments the holder, later ones share it. Every acquire hands out a
//! [`Lease`]; the entry is torn down when the last lease is dropped, or
//! earlier through [`KeyedStores::destroy`].
//!
//! The holder's [`StateHolder::on_created`] runs once per created entry and
//! [`StateHolder::on_destroyed`] once per teardown, both outside the
//! registry lock.

use std::any::Any;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::hash::FastHashBuilder;
use crate::store::{StateHolder, Store, instrument};

/// Type-erased view of a keyed store.
trait ErasedStore: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn subscriber_count(&self) -> usize;
    fn destroyed(&self);
}

impl<H: StateHolder> ErasedStore for Store<H> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    fn destroyed(&self) {
        debug!(store = %self.label(), "keyed store torn down");
        self.holder().on_destroyed();
    }
}

struct Slot {
    store: Box<dyn ErasedStore>,
    /// Distinguishes this entry from a later one under the same key.
    generation: u64,
    leases: usize,
}

struct Registry<K> {
    slots: Mutex<HashMap<K, Slot, FastHashBuilder>>,
    generations: AtomicU64,
}

impl<K: Eq + Hash> Registry<K> {
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drop one lease on `key`. Returns the slot if it was the last one.
    fn release(&self, key: &K, generation: u64) -> Option<Slot> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(key)?;
        if slot.generation != generation {
            cov_mark::hit!(stale_lease_released);
            return None;
        }
        slot.leases -= 1;
        if slot.leases > 0 {
            return None;
        }
        slots.remove(key)
    }
}

/// Registry of stores keyed by `K`.
///
/// Cloning is cheap; clones share the same entries.
pub struct KeyedStores<K> {
    registry: Arc<Registry<K>>,
}

impl<K> Clone for KeyedStores<K> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<K: Eq + Hash + Clone + fmt::Debug + Send + 'static> Default for KeyedStores<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedStores<K>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                slots: Mutex::new(HashMap::with_hasher(FastHashBuilder)),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Lease the store for `key`, creating it with `factory` if absent.
    ///
    /// `factory` runs without the registry lock held. Fails with
    /// [`Error::KeyType`] if `key` holds a store of a different holder
    /// type.
    pub fn acquire<H: StateHolder>(&self, key: K, factory: impl FnOnce() -> H) -> Result<Lease<K, H>> {
        if let Some(slot) = self.registry.slots.lock().get_mut(&key) {
            return self.lease(key, slot);
        }

        let store = instrument(Arc::new(factory()));
        let generation = self.registry.next_generation();
        {
            let mut slots = self.registry.slots.lock();
            match slots.entry(key.clone()) {
                Entry::Occupied(mut occupied) => {
                    cov_mark::hit!(keyed_creation_raced);
                    return self.lease(key, occupied.get_mut());
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(Slot {
                        store: Box::new(store.clone()),
                        generation,
                        leases: 1,
                    });
                }
            }
        }

        debug!(key = ?key, store = %store.label(), "keyed store created");
        store.holder().on_created();
        Ok(Lease {
            registry: Arc::clone(&self.registry),
            key,
            generation,
            store,
        })
    }

    fn lease<H: StateHolder>(&self, key: K, slot: &mut Slot) -> Result<Lease<K, H>> {
        let store = slot
            .store
            .as_any()
            .downcast_ref::<Store<H>>()
            .cloned()
            .ok_or_else(|| Error::KeyType {
                key: format!("{key:?}"),
            })?;
        slot.leases += 1;
        Ok(Lease {
            registry: Arc::clone(&self.registry),
            key,
            generation: slot.generation,
            store,
        })
    }

    /// The store for `key`, without taking a lease.
    pub fn get<H: StateHolder>(&self, key: &K) -> Option<Store<H>> {
        self.registry
            .slots
            .lock()
            .get(key)?
            .store
            .as_any()
            .downcast_ref::<Store<H>>()
            .cloned()
    }

    /// Whether `key` currently has a store.
    pub fn contains(&self, key: &K) -> bool {
        self.registry.slots.lock().contains_key(key)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.registry.slots.lock().len()
    }

    /// True if there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Outstanding leases on `key`, zero if absent.
    pub fn lease_count(&self, key: &K) -> usize {
        self.registry
            .slots
            .lock()
            .get(key)
            .map_or(0, |slot| slot.leases)
    }

    /// Tear down the entry for `key`.
    ///
    /// Without `force` this only happens when nobody is subscribed to the
    /// store. Outstanding leases stay usable but no longer keep the entry
    /// alive; the next acquire creates a fresh holder. Returns whether the
    /// entry was removed.
    pub fn destroy(&self, key: &K, force: bool) -> bool {
        let slot = {
            let mut slots = self.registry.slots.lock();
            let Some(slot) = slots.get(key) else {
                return false;
            };
            if !force && slot.store.subscriber_count() > 0 {
                cov_mark::hit!(keyed_destroy_refused);
                debug!(key = ?key, "keyed store still has subscribers, not destroying");
                return false;
            }
            slots.remove(key)
        };
        match slot {
            Some(slot) => {
                slot.store.destroyed();
                true
            }
            None => false,
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for KeyedStores<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedStores")
            .field("keys", &self.registry.slots.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A counted claim on a keyed store. Dropping the last lease on an entry
/// tears it down.
pub struct Lease<K: Eq + Hash, H: StateHolder> {
    registry: Arc<Registry<K>>,
    key: K,
    generation: u64,
    store: Store<H>,
}

impl<K: Eq + Hash, H: StateHolder> Lease<K, H> {
    /// The leased store.
    pub fn store(&self) -> &Store<H> {
        &self.store
    }

    /// The key this lease was acquired under.
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + Clone, H: StateHolder> Clone for Lease<K, H> {
    fn clone(&self) -> Self {
        if let Some(slot) = self.registry.slots.lock().get_mut(&self.key) {
            if slot.generation == self.generation {
                slot.leases += 1;
            }
        }
        Self {
            registry: Arc::clone(&self.registry),
            key: self.key.clone(),
            generation: self.generation,
            store: self.store.clone(),
        }
    }
}

impl<K: Eq + Hash, H: StateHolder> Drop for Lease<K, H> {
    fn drop(&mut self) {
        if let Some(slot) = self.registry.release(&self.key, self.generation) {
            slot.store.destroyed();
        }
    }
}

impl<K: Eq + Hash + fmt::Debug, H: StateHolder> fmt::Debug for Lease<K, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("store", &self.store)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Subscriber;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Session {
        created: Arc<AtomicUsize>,
        destroyed: Arc<AtomicUsize>,
    }

    impl StateHolder for Session {
        type State = ();

        fn state(&self) {}

        fn on_created(&self) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }

        fn on_destroyed(&self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Counts {
        created: Arc<AtomicUsize>,
        destroyed: Arc<AtomicUsize>,
    }

    impl Counts {
        fn new() -> Self {
            Self {
                created: Arc::new(AtomicUsize::new(0)),
                destroyed: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn session(&self) -> Session {
            Session {
                created: Arc::clone(&self.created),
                destroyed: Arc::clone(&self.destroyed),
            }
        }

        fn get(&self) -> (usize, usize) {
            (
                self.created.load(Ordering::SeqCst),
                self.destroyed.load(Ordering::SeqCst),
            )
        }
    }

    #[test]
    fn shares_one_store_per_key() {
        let stores = KeyedStores::new();
        let counts = Counts::new();

        let first = stores.acquire("main", || counts.session()).unwrap();
        let second = stores.acquire("main", || counts.session()).unwrap();

        assert!(first.store().ptr_eq(second.store()));
        assert_eq!(stores.lease_count(&"main"), 2);
        assert_eq!(counts.get(), (1, 0));
    }

    #[test]
    fn last_lease_tears_down() {
        let stores = KeyedStores::new();
        let counts = Counts::new();

        let lease = stores.acquire(7u32, || counts.session()).unwrap();
        let copy = lease.clone();
        drop(lease);
        assert!(stores.contains(&7));

        drop(copy);
        assert!(!stores.contains(&7));
        assert_eq!(counts.get(), (1, 1));

        let _fresh = stores.acquire(7u32, || counts.session()).unwrap();
        assert_eq!(counts.get(), (2, 1));
    }

    #[test]
    fn destroy_without_force_respects_subscribers() {
        cov_mark::check!(keyed_destroy_refused);

        let stores = KeyedStores::new();
        let counts = Counts::new();
        let lease = stores.acquire("ui", || counts.session()).unwrap();
        let subscriber = Subscriber::new(|_: &(), _: &()| {});
        lease.store().subscribe(&subscriber);

        assert!(!stores.destroy(&"ui", false));

        lease.store().unsubscribe(&subscriber);
        assert!(stores.destroy(&"ui", false));
        assert_eq!(counts.get(), (1, 1));
    }

    #[test]
    fn forced_destroy_leaves_old_leases_inert() {
        cov_mark::check!(stale_lease_released);

        let stores = KeyedStores::new();
        let counts = Counts::new();
        let stale = stores.acquire("ui", || counts.session()).unwrap();

        assert!(stores.destroy(&"ui", true));
        let fresh = stores.acquire("ui", || counts.session()).unwrap();
        drop(stale);

        assert!(stores.contains(&"ui"));
        assert_eq!(stores.lease_count(&"ui"), 1);
        assert_eq!(counts.get(), (2, 1));
        drop(fresh);
        assert_eq!(counts.get(), (2, 2));
    }

    #[test]
    fn key_type_mismatch_is_an_error() {
        struct Other;

        impl StateHolder for Other {
            type State = ();

            fn state(&self) {}
        }

        let stores = KeyedStores::new();
        let counts = Counts::new();
        let _lease = stores.acquire("shared", || counts.session()).unwrap();

        assert!(matches!(
            stores.acquire("shared", || Other),
            Err(Error::KeyType { .. })
        ));
        assert!(stores.get::<Other>(&"shared").is_none());
        assert!(stores.get::<Session>(&"shared").is_some());
    }
}
