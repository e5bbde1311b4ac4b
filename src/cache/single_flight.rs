//! Process-local, key-scoped mutual exclusion.
//!
//! Concurrent callers with the same key queue on one lock. The lock entry is removed
//! once no caller holds or awaits it, so the map only tracks keys in flight.

use dashmap::DashMap;
use std::{future::Future, sync::Arc};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct SingleFlight {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SingleFlight {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`.
    ///
    /// `f` must re-check whatever the caller found missing: a previous holder may
    /// already have produced it.
    pub async fn run<F, Fut, T>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = Arc::clone(
            self.locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );

        let result = {
            let _guard = lock.lock().await;
            f().await
        };

        drop(lock);
        // Clones happen under the shard lock, so a count of one means nobody is waiting.
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::task::JoinSet;

    #[tokio::test]
    async fn serializes_same_key_and_cleans_up() {
        let flights = Arc::new(SingleFlight::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let mut tasks = JoinSet::new();
        for _ in 0..8 {
            let flights = Arc::clone(&flights);
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            tasks.spawn(async move {
                flights
                    .run("permset:t1:u1", || async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_active.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            });
        }
        while tasks.join_next().await.is_some() {}

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let flights = SingleFlight::new();
        let outer = flights
            .run("a", || async { flights.run("b", || async { 7 }).await })
            .await;
        assert_eq!(outer, 7);
        assert_eq!(flights.in_flight(), 0);
    }
}
