//! Per-key async mutual exclusion.
//!
//! Used to serialize writes to one itinerary, one canonical place or one task
//! commit while leaving unrelated keys fully parallel. An entry lives only while
//! a guard holds it or a caller waits on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = HashMap<String, Arc<Mutex<()>>>;

#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<StdMutex<LockMap>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire exclusive access to `key`. Released when the guard drops.
    pub async fn acquire(&self, key: &str) -> KeyedLockGuard {
        let lock = self.entry(key);
        let guard = lock.lock_owned().await;
        KeyedLockGuard {
            key: key.to_string(),
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Returns `None` if the key is currently held.
    pub fn try_acquire(&self, key: &str) -> Option<KeyedLockGuard> {
        let lock = self.entry(key);
        match lock.try_lock_owned() {
            Ok(guard) => Some(KeyedLockGuard {
                key: key.to_string(),
                guard: Some(guard),
                locks: self.locks.clone(),
            }),
            Err(_) => {
                prune(&self.locks, key);
                None
            }
        }
    }

    /// Number of keys currently held or waited on.
    pub fn len(&self) -> usize {
        lock_map(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        lock_map(&self.locks)
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn lock_map(locks: &StdMutex<LockMap>) -> MutexGuard<'_, LockMap> {
    locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Remove `key` once the map's own handle is the last one.
fn prune(locks: &StdMutex<LockMap>, key: &str) {
    let mut map = lock_map(locks);
    if map.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
        map.remove(key);
    }
}

pub struct KeyedLockGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<StdMutex<LockMap>>,
}

impl Drop for KeyedLockGuard {
    fn drop(&mut self) {
        // Release first so the owned guard's handle is not counted.
        drop(self.guard.take());
        prune(&self.locks, &self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_sequential_access() {
        let locks = KeyedLocks::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter1 = counter.clone();
        let locks1 = locks.clone();
        let t1 = tokio::spawn(async move {
            let _guard = locks1.acquire("trip-1").await;
            counter1.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            counter1.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        let counter2 = counter.clone();
        let locks2 = locks.clone();
        let t2 = tokio::spawn(async move {
            let _guard = locks2.acquire("trip-1").await;
            assert!(counter2.load(Ordering::SeqCst) >= 2);
            counter2.fetch_add(1, Ordering::SeqCst);
        });

        t1.await.unwrap();
        t2.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_different_keys_parallel() {
        let locks = KeyedLocks::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter1 = counter.clone();
        let locks1 = locks.clone();
        let t1 = tokio::spawn(async move {
            let _guard = locks1.acquire("trip-1").await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            counter1.fetch_add(1, Ordering::SeqCst);
        });

        let counter2 = counter.clone();
        let locks2 = locks.clone();
        let t2 = tokio::spawn(async move {
            let _guard = locks2.acquire("trip-2").await;
            counter2.fetch_add(1, Ordering::SeqCst);
        });

        t2.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        t1.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_try_acquire() {
        let locks = KeyedLocks::new();

        let guard1 = locks.try_acquire("place-1");
        assert!(guard1.is_some());
        assert!(locks.try_acquire("place-1").is_none());
        assert_eq!(locks.len(), 1);

        drop(guard1);
        assert!(locks.is_empty());
        assert!(locks.try_acquire("place-1").is_some());
    }

    #[tokio::test]
    async fn test_released_keys_are_pruned() {
        let locks = KeyedLocks::new();
        for i in 0..200 {
            drop(locks.acquire(&format!("trip-{i}")).await);
        }
        assert!(locks.is_empty());

        let held = locks.acquire("a").await;
        drop(locks.acquire("b").await);
        assert_eq!(locks.len(), 1);
        drop(held);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_keeps_entry_alive() {
        let locks = KeyedLocks::new();
        let held = locks.acquire("trip-1").await;

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = locks2.acquire("trip-1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(held);
        assert_eq!(locks.len(), 1);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
