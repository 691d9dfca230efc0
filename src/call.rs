use core::pin::pin;
use core::sync::atomic::{AtomicUsize, Ordering};
use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::{trace, warn};

use crate::error::Result;

#[derive(Debug)]
enum Status<V> {
    Starting,
    Done(Result<V>),
}

/// Call is an in-flight or completed unit of work shared by every caller
/// that asked for the same key while it was registered.
///
/// The outcome is written once, under the same lock waiters check it under,
/// and only then are waiters woken. Once done, a call never goes back to
/// starting.
#[derive(Debug)]
pub(crate) struct Call<V> {
    status: Mutex<Status<V>>,
    cvar: Condvar,
    notify: Notify,
    dups: AtomicUsize,
}

impl<V> Call<V> {
    pub(crate) fn new() -> Self {
        Call {
            status: Mutex::new(Status::Starting),
            cvar: Condvar::new(),
            notify: Notify::new(),
            dups: AtomicUsize::new(0),
        }
    }

    /// Publishes the outcome and wakes every waiter, blocking or async.
    /// A call that is already done keeps its first outcome.
    pub(crate) fn complete(&self, outcome: Result<V>) {
        let mut status = self.status.lock();
        if let Status::Done(_) = *status {
            warn!("Call already completed, outcome discarded");
            return;
        }
        *status = Status::Done(outcome);
        drop(status);

        self.cvar.notify_all();
        self.notify.notify_waiters();
        trace!("Waiters notified");
    }

    pub(crate) fn is_complete(&self) -> bool {
        matches!(*self.status.lock(), Status::Done(_))
    }

    /// Records one more caller attached to this call.
    pub(crate) fn join(&self) {
        self.dups.fetch_add(1, Ordering::AcqRel);
    }

    /// Undoes a `join` for a caller that stopped waiting before the outcome.
    pub(crate) fn leave(&self) {
        self.dups.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn dups(&self) -> usize {
        self.dups.load(Ordering::Acquire)
    }
}

impl<V: Clone> Call<V> {
    fn outcome(&self) -> Option<Result<V>> {
        match &*self.status.lock() {
            Status::Starting => None,
            Status::Done(outcome) => Some(outcome.clone()),
        }
    }

    /// Blocks the current thread until the call is done.
    pub(crate) fn wait(&self) -> Result<V> {
        let mut status = self.status.lock();
        loop {
            if let Status::Done(outcome) = &*status {
                trace!("Work done noticed");
                return outcome.clone();
            }
            trace!("Not return, waiting...");
            self.cvar.wait(&mut status);
        }
    }

    /// Waits for the call without blocking the executor thread.
    pub(crate) async fn wait_async(&self) -> Result<V> {
        loop {
            // Register interest before checking, so a completion landing in
            // between is not missed.
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            if let Some(outcome) = self.outcome() {
                trace!("Work done noticed");
                return outcome;
            }
            trace!("Not return, waiting...");
            notified.await;
        }
    }
}
