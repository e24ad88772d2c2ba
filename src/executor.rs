//! Deferred mutators and their post-settlement check.
//!
//! A deferred mutator returns a future. The store broadcasts whatever changed
//! synchronously before the future was returned, then hands the future back
//! wrapped in a [`Deferred`]. When the wrapped future settles, `Deferred`
//! runs the change check again on the same task, before handing the settled
//! value to whoever awaited it:
//!
//! ```text
//! act_async(f) ──► f runs ──► sync check (broadcast #1 if changed)
//!                                  │
//!                                  ▼
//!                     Deferred polled ... future settles
//!                                  │
//!                                  ▼
//!                  settle(): Cancel / Err ──► no check
//!                            otherwise    ──► check (broadcast #2 if changed)
//! ```
//!
//! Rust futures only make progress when polled, so the check runs exactly
//! when the mutator's work completes. To run a deferred mutator without
//! awaiting it, hand it to an executor with [`Deferred::detach`] (any
//! [`Spawn`]) or [`Deferred::detach_local`] (any [`LocalSpawn`], for the
//! single-threaded case).
//!
//! ## Usage
//!
//! ```ignore
//! let mut pool = LocalPool::new();
//! store
//!     .act_async(|todos| async move {
//!         let fetched = api.fetch().await?;
//!         todos.replace(fetched);
//!         Ok::<_, FetchError>(())
//!     })
//!     .detach_local(&pool.spawner())?;
//! pool.run_until_stalled();
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures::future::RemoteHandle;
use futures::task::{LocalSpawn, LocalSpawnExt, Spawn, SpawnExt};
use pin_project::pin_project;
use tracing::debug;

use crate::error::Result;
use crate::outcome::Settle;
use crate::store::{StateHolder, Store};

/// Future returned by [`Store::act_async`].
///
/// Resolves to the mutator's settled value (see [`Settle`]). Completing it
/// runs the post-settlement change check.
#[pin_project]
#[must_use = "a deferred mutation only finishes, and only notifies, when it is polled"]
pub struct Deferred<H: StateHolder, Fut> {
    store: Store<H>,
    #[pin]
    pending: Fut,
}

impl<H, Fut> Deferred<H, Fut>
where
    H: StateHolder,
    Fut: Future,
    Fut::Output: Settle,
{
    pub(crate) fn new(store: Store<H>, pending: Fut) -> Self {
        Self { store, pending }
    }

    /// The store this mutation runs against.
    pub fn store(&self) -> &Store<H> {
        &self.store
    }

    /// Run to completion on `spawner`, discarding the settled value.
    ///
    /// A failed settlement is still logged at `debug` when it completes.
    pub fn detach<S>(self, spawner: &S) -> Result<()>
    where
        S: Spawn + ?Sized,
        Self: Send + 'static,
    {
        spawner.spawn(async move {
            let _ = self.await;
        })?;
        Ok(())
    }

    /// Run to completion on a single-threaded `spawner`, discarding the
    /// settled value. A failed settlement is still logged.
    pub fn detach_local<S>(self, spawner: &S) -> Result<()>
    where
        S: LocalSpawn + ?Sized,
        Self: 'static,
    {
        spawner.spawn_local(async move {
            let _ = self.await;
        })?;
        Ok(())
    }

    /// Run on `spawner` and return a handle to the settled value.
    ///
    /// Dropping the handle cancels the mutation at its next suspension
    /// point; call [`RemoteHandle::forget`] to keep it running.
    pub fn spawn_with_handle<S>(
        self,
        spawner: &S,
    ) -> Result<RemoteHandle<<Fut::Output as Settle>::Output>>
    where
        S: Spawn + ?Sized,
        Self: Send + 'static,
        <Fut::Output as Settle>::Output: Send,
    {
        Ok(SpawnExt::spawn_with_handle(spawner, self)?)
    }
}

impl<H, Fut> Future for Deferred<H, Fut>
where
    H: StateHolder,
    Fut: Future,
    Fut::Output: Settle,
{
    type Output = <Fut::Output as Settle>::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let settled = ready!(this.pending.poll(cx));
        let failed = settled.failed();
        let (output, proceed) = settled.settle();
        if proceed {
            this.store.notify_if_changed("settled");
        } else if failed {
            cov_mark::hit!(deferred_settlement_failed);
            debug!(store = %this.store.label(), "deferred mutation failed, skipping notification");
        } else {
            cov_mark::hit!(deferred_settlement_suppressed);
            debug!(store = %this.store.label(), "deferred mutation cancelled, skipping notification");
        }
        Poll::Ready(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Subscriber;
    use crate::{Outcome, instrument};
    use futures::executor::{LocalPool, block_on};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI32, Ordering};

    struct Gauge {
        level: AtomicI32,
    }

    impl StateHolder for Gauge {
        type State = i32;

        fn state(&self) -> i32 {
            self.level.load(Ordering::SeqCst)
        }
    }

    fn gauge() -> Arc<Gauge> {
        Arc::new(Gauge {
            level: AtomicI32::new(0),
        })
    }

    fn recording(store: &Store<Gauge>) -> Arc<Mutex<Vec<(i32, i32)>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        store.subscribe(&Subscriber::new(move |next: &i32, prev: &i32| {
            sink.lock().push((*next, *prev));
        }));
        log
    }

    #[test]
    fn settlement_change_is_broadcast_once_completed() {
        let store = instrument(gauge());
        let log = recording(&store);

        let deferred = store.act_async(|g| async move {
            g.level.store(5, Ordering::SeqCst);
        });
        assert!(log.lock().is_empty());

        block_on(deferred);
        assert_eq!(*log.lock(), vec![(5, 0)]);
    }

    #[test]
    fn cancelled_settlement_is_not_broadcast() {
        cov_mark::check!(deferred_settlement_suppressed);

        let store = instrument(gauge());
        let log = recording(&store);

        let payload = block_on(store.act_async(|g| async move {
            g.level.store(1, Ordering::SeqCst);
            crate::cancel(17)
        }));

        assert_eq!(payload, 17);
        assert!(log.lock().is_empty());
        assert_eq!(store.observed(), 0);
    }

    #[test]
    fn failed_settlement_skips_the_check() {
        cov_mark::check!(deferred_settlement_failed);

        let store = instrument(gauge());
        let log = recording(&store);

        let result = block_on(store.act_async(|g| async move {
            g.level.store(3, Ordering::SeqCst);
            Err::<(), _>("unreachable backend")
        }));

        assert_eq!(result, Err("unreachable backend"));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn detached_mutation_runs_on_local_pool() {
        let mut pool = LocalPool::new();
        let store = instrument(gauge());
        let log = recording(&store);

        store
            .act_async(|g| async move {
                g.level.store(8, Ordering::SeqCst);
                Outcome::Commit(())
            })
            .detach_local(&pool.spawner())
            .expect("local pool accepts tasks");

        assert!(log.lock().is_empty());
        pool.run_until_stalled();
        assert_eq!(*log.lock(), vec![(8, 0)]);
    }

    #[test]
    fn detached_failure_is_reported_not_broadcast() {
        cov_mark::check!(deferred_settlement_failed);

        let mut pool = LocalPool::new();
        let store = instrument(gauge());
        let log = recording(&store);

        store
            .act_async(|g| async move {
                g.level.store(4, Ordering::SeqCst);
                Err::<(), _>("quota exceeded")
            })
            .detach_local(&pool.spawner())
            .expect("local pool accepts tasks");
        pool.run_until_stalled();

        assert!(log.lock().is_empty());
        assert_eq!(store.observed(), 0);
    }
}
