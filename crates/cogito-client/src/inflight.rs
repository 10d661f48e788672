//! At most one vendor call per fingerprint at a time.
//!
//! The first caller for a key becomes the leader and performs the call;
//! callers arriving while it runs block on the leader's slot and receive a
//! clone of its result.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use tracing::debug;

use cogito_core::{CogitoError, CogitoResult, Fingerprint};

struct Slot<V> {
    result: Mutex<Option<CogitoResult<V>>>,
    ready: Condvar,
}

impl<V: Clone> Slot<V> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn publish(&self, result: CogitoResult<V>) {
        let mut guard = self.result.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(result);
        self.ready.notify_all();
    }

    fn wait(&self) -> CogitoResult<V> {
        let guard = self.result.lock().unwrap_or_else(|e| e.into_inner());
        let guard = self
            .ready
            .wait_while(guard, |result| result.is_none())
            .unwrap_or_else(|e| e.into_inner());
        (*guard).clone().unwrap_or(Err(CogitoError::Cancelled))
    }
}

pub struct Inflight<V> {
    slots: Mutex<HashMap<Fingerprint, Arc<Slot<V>>>>,
}

/// Outcome of [`Inflight::begin`].
pub enum Flight<'a, V: Clone> {
    /// The re-check found a value; no call is needed.
    Cached(V),
    /// Another caller was already in flight; this is its result.
    Joined(CogitoResult<V>),
    /// This caller must perform the call and complete the guard.
    Leader(LeaderGuard<'a, V>),
}

impl<V: Clone> Default for Inflight<V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone> Inflight<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join an in-flight call for `key`, or become its leader.
    ///
    /// `recheck` runs while the slot map is locked, so a value stored by a
    /// leader that just finished is seen instead of starting a second call.
    pub fn begin(&self, key: &Fingerprint, recheck: impl FnOnce() -> Option<V>) -> Flight<'_, V> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get(key).cloned() {
            drop(slots);
            debug!(key = %key, "joining in-flight request");
            return Flight::Joined(slot.wait());
        }
        if let Some(value) = recheck() {
            return Flight::Cached(value);
        }
        let slot = Arc::new(Slot::new());
        slots.insert(key.clone(), Arc::clone(&slot));
        Flight::Leader(LeaderGuard {
            owner: self,
            key: key.clone(),
            slot,
            completed: false,
        })
    }

    /// Callers currently blocked on `key`.
    pub fn waiters(&self, key: &Fingerprint) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .get(key)
            // one reference in the map, one held by the leader
            .map(|slot| Arc::strong_count(slot).saturating_sub(2))
            .unwrap_or(0)
    }

    pub fn is_in_flight(&self, key: &Fingerprint) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.contains_key(key)
    }

    fn finish(&self, key: &Fingerprint, slot: &Slot<V>, result: CogitoResult<V>) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(key);
        slot.publish(result);
    }
}

/// Held by the caller performing the call. Dropping it without
/// [`LeaderGuard::complete`] wakes joiners with `Cancelled`.
pub struct LeaderGuard<'a, V: Clone> {
    owner: &'a Inflight<V>,
    key: Fingerprint,
    slot: Arc<Slot<V>>,
    completed: bool,
}

impl<V: Clone> LeaderGuard<'_, V> {
    pub fn complete(mut self, result: CogitoResult<V>) {
        self.completed = true;
        self.owner.finish(&self.key, &self.slot, result);
    }
}

impl<V: Clone> Drop for LeaderGuard<'_, V> {
    fn drop(&mut self) {
        if !self.completed {
            self.owner
                .finish(&self.key, &self.slot, Err(CogitoError::Cancelled));
        }
    }
}
