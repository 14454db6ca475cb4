//! Key-indexed, time-bounded waiter store for delayed produce and fetch
//! operations.
//!
//! Operations are passive state machines: nothing blocks inside `try_complete`,
//! and no request-handler thread parks waiting for a result. Registration
//! spawns a single timer thread per operation; completion is triggered either
//! by that timer or by a `check_and_complete` call from whichever thread
//! caused the state the operation is waiting on to change (HW advance,
//! follower fetch, log truncation). Completion is idempotent: exactly one of
//! the racing triggers actually runs the operation's callback.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

/// A unit of work that cannot be completed immediately and is parked in a
/// [`Purgatory`] until some other thread's progress makes it completable, or
/// its timeout elapses.
pub trait DelayedOperation: Send + Sync + 'static {
    /// Attempt completion. Returning `true` commits to completing: the
    /// purgatory will call `on_complete` at most once, from whichever thread's
    /// `try_complete` (or timeout) first returned `true`. Must not block.
    fn try_complete(&self) -> bool;

    /// Invoked exactly once, either because `try_complete` returned `true` or
    /// because the operation's deadline elapsed first. `timed_out` tells the
    /// operation which case this is so it can report `RequestTimedOut` for the
    /// partitions that never completed.
    fn on_complete(&self, timed_out: bool);
}

struct Entry<O> {
    op: Arc<O>,
    completed: AtomicBool,
}

impl<O: DelayedOperation> Entry<O> {
    fn force_complete(&self, timed_out: bool) -> bool {
        if self
            .completed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.op.on_complete(timed_out);
            true
        } else {
            false
        }
    }

    fn maybe_complete(&self) -> bool {
        if self.completed.load(Ordering::SeqCst) {
            return true;
        }
        if self.op.try_complete() {
            self.force_complete(false);
            true
        } else {
            false
        }
    }
}

/// Holds operations of type `O` watched under keys of type `K`.
///
/// One purgatory instance exists per operation kind (the replica manager keeps
/// a separate produce purgatory and fetch purgatory), so `O` is fixed for the
/// whole purgatory rather than being a trait object per entry.
pub struct Purgatory<K, O> {
    watchers: Mutex<HashMap<K, Vec<Arc<Entry<O>>>>>,
}

impl<K, O> Default for Purgatory<K, O>
where
    K: Eq + Hash + Clone + Send + 'static,
    O: DelayedOperation,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, O> Purgatory<K, O>
where
    K: Eq + Hash + Clone + Send + 'static,
    O: DelayedOperation,
{
    pub fn new() -> Self {
        Self {
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Attempt to complete `op` immediately; if it cannot complete yet,
    /// register it under every key in `keys` and start its timeout. Returns
    /// `true` iff the operation completed synchronously (the caller still
    /// invokes no callback itself — `on_complete` already ran).
    pub fn try_complete_else_watch(&self, op: O, keys: Vec<K>, timeout: Duration) -> bool {
        let entry = Arc::new(Entry {
            op: Arc::new(op),
            completed: AtomicBool::new(false),
        });

        if entry.maybe_complete() {
            return true;
        }

        {
            let mut watchers = self.watchers.lock();
            for key in &keys {
                watchers
                    .entry(key.clone())
                    .or_default()
                    .push(Arc::clone(&entry));
            }
        }

        // Re-check after registering: a completing event between the first
        // `maybe_complete` and the registration above would otherwise be
        // missed forever.
        if entry.maybe_complete() {
            self.prune(&keys);
            return true;
        }

        let timer_entry = Arc::clone(&entry);
        thread::spawn(move || {
            thread::sleep(timeout);
            timer_entry.force_complete(true);
        });
        false
    }

    /// Attempt to complete every operation watched under `key`. Returns the
    /// number of operations that completed as a result of this call (timer
    /// expirations and other keys' triggers are not counted).
    pub fn check_and_complete(&self, key: &K) -> usize {
        let entries = {
            let mut watchers = self.watchers.lock();
            match watchers.get_mut(key) {
                Some(list) => {
                    list.retain(|e| !e.completed.load(Ordering::SeqCst));
                    list.clone()
                }
                None => return 0,
            }
        };

        let mut completed = 0;
        for entry in entries {
            if entry.maybe_complete() {
                completed += 1;
            }
        }
        self.prune(std::slice::from_ref(key));
        completed
    }

    /// Number of operations still watched across all keys (entries are pruned
    /// lazily, so this is an upper bound until the next check).
    pub fn watched_len(&self) -> usize {
        self.watchers.lock().values().map(|v| v.len()).sum()
    }

    fn prune(&self, keys: &[K]) {
        let mut watchers = self.watchers.lock();
        for key in keys {
            if let Some(list) = watchers.get_mut(key) {
                list.retain(|e| !e.completed.load(Ordering::SeqCst));
                if list.is_empty() {
                    watchers.remove(key);
                }
            }
        }
    }
}
