//! Time-expiring collections and stopwatches used by the per-duty loops.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// A set whose members expire `ttl` after their last insertion.
#[derive(Debug, Clone)]
pub struct VolatileSet<T: Eq + Hash> {
    items: HashMap<T, Instant>,
    ttl: Duration,
}

impl<T: Eq + Hash + Clone> VolatileSet<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            items: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or refresh. Returns true if the item was not present.
    pub fn insert(&mut self, item: T) -> bool {
        self.items.insert(item, Instant::now()).is_none()
    }

    pub fn extend<I: IntoIterator<Item = T>>(&mut self, items: I) {
        let now = Instant::now();
        for item in items {
            self.items.insert(item, now);
        }
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.contains_key(item)
    }

    pub fn remove(&mut self, item: &T) -> bool {
        self.items.remove(item).is_some()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.keys()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.items.keys().cloned().collect()
    }

    /// Drop members older than the ttl.
    pub fn trim(&mut self) {
        self.trim_at(Instant::now());
    }

    pub fn trim_at(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.items
            .retain(|_, at| now.saturating_duration_since(*at) < ttl);
    }
}

/// A map whose entries expire `ttl` after their last write.
#[derive(Debug, Clone)]
pub struct VolatileMap<K: Eq + Hash, V> {
    items: HashMap<K, (V, Instant)>,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone, V: Clone> VolatileMap<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            items: HashMap::new(),
            ttl,
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.items.insert(key, (value, Instant::now()));
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.items.get(key).map(|(v, _)| v)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.items.remove(key).map(|(v, _)| v)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn trim(&mut self) {
        self.trim_at(Instant::now());
    }

    pub fn trim_at(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.items
            .retain(|_, (_, at)| now.saturating_duration_since(*at) < ttl);
    }
}

/// Gates a sub-action to a cadence. Fires on the first check.
#[derive(Debug, Clone, Default)]
pub struct Stopwatch {
    last: Option<Instant>,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// A stopwatch whose first firing is one full interval after `now`.
    pub fn started(now: Instant) -> Self {
        Self { last: Some(now) }
    }

    /// True (and restarts) when `interval` has passed since the last firing.
    pub fn due(&mut self, now: Instant, interval: Duration) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        self.last.map(|l| now.saturating_duration_since(l))
    }

    pub fn restart(&mut self, now: Instant) {
        self.last = Some(now);
    }
}
