use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::RwLock;

pub mod network;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("map capacity exceeded ({0} entries)")]
    CapacityExceeded(usize),
}

/// Bounded, thread-safe string-keyed map. One typed map per entity kind.
///
/// Readers proceed in parallel; a writer excludes. Iteration copies a
/// consistent snapshot under the read lock and visits it lock-free, so a
/// callback may re-enter the map without deadlocking.
#[derive(Debug)]
pub struct SafeStrMap<V> {
    cap: usize,
    inner: RwLock<HashMap<String, V>>,
}

impl<V: Clone> SafeStrMap<V> {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Inserts or overwrites. Fails only when the map is full and the key
    /// is not already present.
    pub async fn set(&self, key: &str, value: V) -> Result<(), StoreError> {
        let mut m = self.inner.write().await;
        if m.len() >= self.cap && !m.contains_key(key) {
            return Err(StoreError::CapacityExceeded(self.cap));
        }
        m.insert(key.to_string(), value);
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        self.inner.read().await.get(key).cloned()
    }

    pub async fn del(&self, key: &str) -> bool {
        self.inner.write().await.remove(key).is_some()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Copies the current entries. Order is unspecified but stable within
    /// one snapshot.
    pub async fn snapshot(&self) -> Vec<(String, V)> {
        let m = self.inner.read().await;
        m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Visits a snapshot of the entries with the lock released.
    pub async fn iter<F>(&self, mut f: F)
    where
        F: FnMut(&str, &V),
    {
        for (k, v) in self.snapshot().await {
            f(&k, &v);
        }
    }
}
