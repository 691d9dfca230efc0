use core::borrow::Borrow;
use core::fmt::{self, Debug};
use core::future::Future;
use core::hash::Hash;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tracing::{error, instrument, trace};

use crate::call::Call;
use crate::error::{Error, Result};

/// Group represents a class of work and creates a space in which units of work
/// can be executed with duplicate suppression.
///
/// Clones share the same registry.
pub struct Group<K, V> {
    calls: Arc<Mutex<HashMap<K, Arc<Call<V>>>>>,
}

enum Role<'a, K: Hash + Eq, V> {
    Leader(Leader<'a, K, V>),
    Waiter(Arc<Call<V>>),
}

/// Held by the caller that registered a call. Dropping it completes the call
/// if nothing was published yet and removes the key from the registry, on
/// every exit path.
struct Leader<'a, K: Hash + Eq, V> {
    group: &'a Group<K, V>,
    key: K,
    call: Arc<Call<V>>,
}

impl<K: Hash + Eq, V> Leader<'_, K, V> {
    fn finish(self, outcome: Result<V>) -> (Result<V>, bool)
    where
        V: Clone,
    {
        self.call.complete(outcome.clone());
        trace!("Work done");
        let call = self.call.clone();
        drop(self);
        (outcome, call.dups() > 0)
    }
}

impl<K: Hash + Eq, V> Drop for Leader<'_, K, V> {
    fn drop(&mut self) {
        if !self.call.is_complete() {
            let err = if thread::panicking() {
                Error::Panicked {
                    message: Arc::from("leader panicked before publishing"),
                }
            } else {
                Error::LeaderDropped
            };
            error!(error = %err, "Leader exited without a result");
            self.call.complete(Err(err));
        }
        self.group.deregister(&self.key, &self.call);
    }
}

/// Held by an async caller waiting on someone else's call. If the caller is
/// dropped before the outcome is published, it no longer counts as a waiter.
struct Waiter<V> {
    call: Arc<Call<V>>,
}

impl<V> Drop for Waiter<V> {
    fn drop(&mut self) {
        if !self.call.is_complete() {
            self.call.leave();
            trace!("Waiter dropped before work done");
        }
    }
}

impl<K, V> Group<K, V> {
    pub fn new() -> Group<K, V> {
        Group {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V> Default for Group<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Clone for Group<K, V> {
    fn clone(&self) -> Self {
        Self {
            calls: self.calls.clone(),
        }
    }
}

impl<K, V> Debug for Group<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("in_flight", &self.calls.lock().len())
            .finish()
    }
}

impl<K: Hash + Eq, V> Group<K, V> {
    /// Number of keys with a call currently in flight.
    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }

    pub fn is_in_flight<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.calls.lock().contains_key(key)
    }

    /// Number of callers currently waiting on the in-flight call for `key`,
    /// not counting the leader. Zero when nothing is in flight.
    pub fn waiters<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.calls.lock().get(key).map_or(0, |call| call.dups())
    }

    fn deregister(&self, key: &K, call: &Arc<Call<V>>) {
        let mut map = self.calls.lock();
        // Only the call this leader registered may be removed.
        if map.get(key).is_some_and(|c| Arc::ptr_eq(c, call)) {
            map.remove(key);
            trace!("Entry removed");
        }
    }
}

impl<K, V> Group<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn join_or_lead<Q>(&self, key: &Q) -> Role<'_, K, V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        let mut map = self.calls.lock();
        trace!("Acquire registry lock");
        if let Some(call) = map.get(key) {
            call.join();
            return Role::Waiter(call.clone());
        }

        let key = key.to_owned();
        let call = Arc::new(Call::new());
        map.insert(key.clone(), call.clone());
        trace!("Entry inited");
        Role::Leader(Leader {
            group: self,
            key,
            call,
        })
    }

    /// work executes and returns the results of the given function, making
    /// sure that only one execution is in-flight for a given key at a
    /// time. If a duplicate comes in, the duplicate caller waits for the
    /// original to complete and receives the same results.
    ///
    /// If `work` panics, the panic is caught and every caller receives
    /// [`Error::Panicked`]. Calling `work` again for the same key from inside
    /// `work` deadlocks.
    pub fn work<Q, E, F>(&self, key: &Q, work: F) -> Result<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + Debug + ?Sized,
        E: Into<anyhow::Error>,
        F: FnOnce() -> core::result::Result<V, E>,
    {
        self.work_shared(key, work).0
    }

    /// Like [`Group::work`]. The returned flag tells whether the result was
    /// given to more than one caller.
    #[instrument(skip(self, work))]
    pub fn work_shared<Q, E, F>(&self, key: &Q, work: F) -> (Result<V>, bool)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + Debug + ?Sized,
        E: Into<anyhow::Error>,
        F: FnOnce() -> core::result::Result<V, E>,
    {
        let leader = match self.join_or_lead(key) {
            Role::Waiter(call) => {
                trace!("Reading...");
                return (call.wait(), true);
            }
            Role::Leader(leader) => leader,
        };

        trace!("working...");
        let outcome = match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(res) => into_outcome(res),
            Err(payload) => panicked(payload),
        };
        leader.finish(outcome)
    }

    /// async_work is like work but takes a future. Waiters suspend instead of
    /// blocking their thread.
    ///
    /// If the leader's future is dropped before it resolves, waiters receive
    /// [`Error::LeaderDropped`].
    pub async fn async_work<Q, E, Fut>(&self, key: &Q, fut: Fut) -> Result<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + Debug + ?Sized,
        E: Into<anyhow::Error>,
        Fut: Future<Output = core::result::Result<V, E>>,
    {
        self.async_work_shared(key, fut).await.0
    }

    #[instrument(skip(self, fut))]
    pub async fn async_work_shared<Q, E, Fut>(&self, key: &Q, fut: Fut) -> (Result<V>, bool)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + Debug + ?Sized,
        E: Into<anyhow::Error>,
        Fut: Future<Output = core::result::Result<V, E>>,
    {
        let leader = match self.join_or_lead(key) {
            Role::Waiter(call) => {
                trace!("Reading...");
                let waiter = Waiter { call };
                return (waiter.call.wait_async().await, true);
            }
            Role::Leader(leader) => leader,
        };

        trace!("working...");
        let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(res) => into_outcome(res),
            Err(payload) => panicked(payload),
        };
        leader.finish(outcome)
    }
}

fn into_outcome<V, E: Into<anyhow::Error>>(res: core::result::Result<V, E>) -> Result<V> {
    res.map_err(|e| {
        let err = Error::work(e);
        error!(error = %err, "Error occur during work");
        err
    })
}

fn panicked<V>(payload: Box<dyn core::any::Any + Send>) -> Result<V> {
    let err = Error::from_panic(payload);
    error!(error = %err, "Work panicked");
    Err(err)
}
