//! Correlation-id keyed waiters with exactly-once resolution.
//!
//! A caller [`WaiterMap::register`]s before triggering the work that will
//! eventually answer it, then awaits [`WaiterMap::wait`] with a timeout.
//! Resolution removes the slots under the shard lock and delivers after the
//! lock is released, so a timeout and a genuine response racing on the same
//! id can never both deliver. Waiters on different ids only contend when
//! they hash to the same shard.

use hashbrown::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

const SHARDS: usize = 16;

struct Slot<V> {
    token: u64,
    tx: oneshot::Sender<V>,
}

pub struct WaiterMap<K, V> {
    shards: Vec<Mutex<HashMap<K, Vec<Slot<V>>>>>,
    hasher: hashbrown::DefaultHashBuilder,
    next_token: AtomicU64,
}

/// Handle returned by [`WaiterMap::register`]
pub struct Waiter<K, V> {
    key: K,
    token: u64,
    rx: oneshot::Receiver<V>,
}

impl<K, V> Default for WaiterMap<K, V>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> WaiterMap<K, V>
where
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            hasher: hashbrown::DefaultHashBuilder::default(),
            next_token: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &K) -> MutexGuard<'_, HashMap<K, Vec<Slot<V>>>> {
        let idx = (self.hasher.hash_one(key) as usize) % SHARDS;
        // a panic while holding the lock leaves the map itself consistent
        self.shards[idx]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, key: K) -> Waiter<K, V> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shard(&key)
            .entry(key.clone())
            .or_default()
            .push(Slot { token, tx });
        Waiter { key, token, rx }
    }

    /// Number of callers currently waiting on `key`
    pub fn pending(&self, key: &K) -> usize {
        self.shard(key).get(key).map(Vec::len).unwrap_or(0)
    }

    /// Wait for the resolution of `waiter`, giving up after `timeout`.
    ///
    /// A timed out waiter takes its own slot out of the map. If the slot
    /// is already gone a resolver claimed it first, and whatever it
    /// managed to deliver is returned.
    pub async fn wait(&self, waiter: Waiter<K, V>, timeout: Duration) -> Option<V> {
        let Waiter { key, token, mut rx } = waiter;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(_closed)) => None,
            Err(_elapsed) => {
                if self.remove_slot(&key, token) {
                    None
                } else {
                    rx.try_recv().ok()
                }
            }
        }
    }

    fn remove_slot(&self, key: &K, token: u64) -> bool {
        let mut shard = self.shard(key);
        let Some(slots) = shard.get_mut(key) else {
            return false;
        };

        let before = slots.len();
        slots.retain(|slot| slot.token != token);
        let removed = slots.len() != before;
        if slots.is_empty() {
            shard.remove(key);
        }
        removed
    }
}

impl<K, V> WaiterMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Resolve every waiter registered on `key`. Returns how many callers
    /// received the value. A key with no waiters is a silent no-op.
    pub fn resolve(&self, key: &K, value: V) -> usize {
        let slots = self.shard(key).remove(key);
        let Some(slots) = slots else {
            return 0;
        };

        slots
            .into_iter()
            .filter(|slot| !slot.tx.is_closed())
            .map(|slot| slot.tx.send(value.clone()).is_ok())
            .filter(|sent| *sent)
            .count()
    }
}
