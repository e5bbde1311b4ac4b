//! Process-local volatile store.
//!
//! Expired entries are dropped lazily on read and swept every few hundred writes.

use dashmap::{mapref::entry::Entry as MapEntry, DashMap};
use std::{
    future,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use super::{StoreError, VolatileFuture, VolatileStore};

const SWEEP_EVERY_WRITES: u64 = 256;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    writes: AtomicU64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn note_write(&self) {
        let count = self.writes.fetch_add(1, Ordering::Relaxed);
        if count % SWEEP_EVERY_WRITES == SWEEP_EVERY_WRITES - 1 {
            let now = Instant::now();
            self.entries.retain(|_, entry| entry.is_live(now));
        }
    }

    fn get_now(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let value = self
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone());
        if value.is_none() {
            self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        }
        value
    }

    fn set_if_absent_now(&self, key: &str, value: String, ttl: Option<Duration>) -> bool {
        let now = Instant::now();
        let stored = match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    false
                } else {
                    occupied.insert(Entry::new(value, ttl));
                    true
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::new(value, ttl));
                true
            }
        };
        if stored {
            self.note_write();
        }
        stored
    }

    fn incr_now(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = Instant::now();
        let count = match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) if occupied.get().is_live(now) => {
                let entry = occupied.get_mut();
                let current: u64 = entry
                    .value
                    .parse()
                    .map_err(|_| StoreError::Corrupt(key.to_string()))?;
                let next = current.saturating_add(1);
                entry.value = next.to_string();
                next
            }
            MapEntry::Occupied(mut occupied) => {
                occupied.insert(Entry::new("1".to_string(), Some(ttl)));
                1
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::new("1".to_string(), Some(ttl)));
                1
            }
        };
        if count == 1 {
            self.note_write();
        }
        Ok(count)
    }
}

impl VolatileStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> VolatileFuture<'a, Option<String>> {
        Box::pin(future::ready(Ok(self.get_now(key))))
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Option<Duration>,
    ) -> VolatileFuture<'a, ()> {
        self.entries.insert(key.to_string(), Entry::new(value, ttl));
        self.note_write();
        Box::pin(future::ready(Ok(())))
    }

    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Option<Duration>,
    ) -> VolatileFuture<'a, bool> {
        Box::pin(future::ready(Ok(self.set_if_absent_now(key, value, ttl))))
    }

    fn incr<'a>(&'a self, key: &'a str, ttl: Duration) -> VolatileFuture<'a, u64> {
        Box::pin(future::ready(self.incr_now(key, ttl)))
    }

    fn delete<'a>(&'a self, key: &'a str) -> VolatileFuture<'a, ()> {
        self.entries.remove(key);
        Box::pin(future::ready(Ok(())))
    }

    fn ping(&self) -> VolatileFuture<'_, ()> {
        Box::pin(future::ready(Ok(())))
    }
}
