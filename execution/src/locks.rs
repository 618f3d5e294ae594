use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Number of idle entries tolerated before unused locks are pruned.
const PRUNE_THRESHOLD: usize = 4_096;

/// One async mutex per key, created on demand.
///
/// Guards are owned so they can be held across `.await` points while the ledger state lock is
/// taken and released.
pub struct KeyedLocks<K> {
    inner: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Clone + Eq + Hash + Ord> KeyedLocks<K> {
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let mutex = self.entry(key);
        mutex.lock_owned().await
    }

    /// Locks several keys in ascending order so concurrent callers cannot deadlock.
    pub async fn lock_many(&self, keys: &[K]) -> Vec<OwnedMutexGuard<()>> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock(&key).await);
        }
        guards
    }

    fn entry(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut map = match self.inner.lock() {
            Ok(map) => map,
            Err(poisoned) => {
                tracing::warn!("keyed lock table poisoned; recovering");
                poisoned.into_inner()
            }
        };
        if map.len() >= PRUNE_THRESHOLD {
            map.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        }
        map.entry(key.clone()).or_default().clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }
}
