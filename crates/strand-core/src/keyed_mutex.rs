//! Per-key asynchronous mutual exclusion.
//!
//! `KeyedMutex` hands out one lock per key without blocking a runtime thread
//! while waiting. Entries are created when the first caller asks for a key
//! and removed when the last holder or waiter lets go, so the map only ever
//! contains keys that are in use.
//!
//! The lock is not re-entrant: locking a key twice from the same task without
//! dropping the first guard never completes.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OwnedMutexGuard;

struct Entry {
    lock: Arc<tokio::sync::Mutex<()>>,
    /// Holders plus waiters.
    refs: usize,
}

pub struct KeyedMutex<K> {
    entries: Mutex<HashMap<K, Entry>>,
}

impl<K> KeyedMutex<K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive access to `key`.
    ///
    /// Dropping the returned future before it resolves gives the reservation
    /// back, so a cancelled waiter never leaks an entry.
    pub async fn lock(&self, key: K) -> KeyedMutexGuard<'_, K> {
        let lock = self.reserve(&key);
        let mut pending = PendingReservation {
            owner: self,
            key: &key,
            armed: true,
        };
        let guard = lock.lock_owned().await;
        pending.armed = false;
        drop(pending);

        KeyedMutexGuard {
            owner: self,
            key,
            guard: Some(guard),
        }
    }

    /// Take the lock for `key` only if nobody holds it right now.
    pub fn try_lock(&self, key: K) -> Option<KeyedMutexGuard<'_, K>> {
        let lock = self.reserve(&key);
        match lock.try_lock_owned() {
            Ok(guard) => Some(KeyedMutexGuard {
                owner: self,
                key,
                guard: Some(guard),
            }),
            Err(_) => {
                self.release(&key);
                None
            }
        }
    }

    /// Run `fut` while holding the lock for `key`.
    pub async fn with_lock<F, T>(&self, key: K, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.lock(key).await;
        fut.await
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries().contains_key(key)
    }

    /// Find-or-create the entry and count the caller in.
    fn reserve(&self, key: &K) -> Arc<tokio::sync::Mutex<()>> {
        let mut entries = self.entries();
        let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
            lock: Arc::new(tokio::sync::Mutex::new(())),
            refs: 0,
        });
        entry.refs += 1;
        Arc::clone(&entry.lock)
    }

    /// Count the caller out and drop the entry once nobody references it.
    fn release(&self, key: &K) {
        let mut entries = self.entries();
        let remove = match entries.get_mut(key) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs == 0
            }
            None => false,
        };
        if remove {
            if let Some(entry) = entries.remove(key) {
                debug_assert!(entry.lock.try_lock().is_ok(), "released entry still locked");
            }
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, Entry>> {
        // The map is only touched in short, panic-free sections.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<K> Default for KeyedMutex<K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

struct PendingReservation<'a, 'k, K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    owner: &'a KeyedMutex<K>,
    key: &'k K,
    armed: bool,
}

impl<K> Drop for PendingReservation<'_, '_, K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    fn drop(&mut self) {
        if self.armed {
            self.owner.release(self.key);
        }
    }
}

/// Exclusive access to one key; released on drop.
pub struct KeyedMutexGuard<'a, K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    owner: &'a KeyedMutex<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K> KeyedMutexGuard<'_, K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for KeyedMutexGuard<'_, K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    fn drop(&mut self) {
        // Unlock first, then count out.
        drop(self.guard.take());
        self.owner.release(&self.key);
    }
}
