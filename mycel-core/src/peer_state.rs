//! Per-peer gossip bookkeeping and the table that owns it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tracing::debug;

use crate::types::{Key, Node};
use crate::volatile::{VolatileMap, VolatileSet};

/// Gossip sets live this long.
pub const GOSSIP_TTL: Duration = Duration::from_secs(30 * 60);
/// "Already sent" stock sets live this long.
pub const STOCK_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_TABLE_CAPACITY: usize = 128;

/// Bounds and mapping for the tit-for-tat score.
#[derive(Debug, Clone, Copy)]
pub struct PriorityPolicy {
    /// Score is clamped to `[-bound, bound]`.
    pub bound: i32,
    /// Mediation pulls scores outside `[-band, band]` one step toward it.
    pub mediate_band: i32,
    /// Grant probability is `(score + normalizer) / (2 * normalizer)`.
    pub normalizer: i32,
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self {
            bound: 256,
            mediate_band: 32,
            normalizer: 256,
        }
    }
}

/// Everything the engine remembers about one peer.
#[derive(Debug)]
pub struct PeerState {
    id: u32,
    priority: i32,
    pub session_id: Option<Vec<u8>>,
    pub last_pull_time: Instant,
    pub received_bytes: u64,
    pub sent_bytes: u64,

    pub stock_blocks: VolatileSet<Key>,
    /// Signature -> creation time of the newest link seed sent.
    pub stock_link_seeds: VolatileMap<String, SystemTime>,
    pub stock_store_seeds: VolatileMap<String, SystemTime>,

    pub pushed_blocks_link: VolatileSet<Key>,
    pub pulled_blocks_link: VolatileSet<Key>,
    pub pushed_blocks_request: VolatileSet<Key>,
    pub pulled_blocks_request: VolatileSet<Key>,
    pub pushed_seeds_request: VolatileSet<String>,
    pub pulled_seeds_request: VolatileSet<String>,
}

impl PeerState {
    fn new(id: u32) -> Self {
        Self {
            id,
            priority: 0,
            session_id: None,
            last_pull_time: Instant::now(),
            received_bytes: 0,
            sent_bytes: 0,
            stock_blocks: VolatileSet::new(STOCK_TTL),
            stock_link_seeds: VolatileMap::new(STOCK_TTL),
            stock_store_seeds: VolatileMap::new(STOCK_TTL),
            pushed_blocks_link: VolatileSet::new(GOSSIP_TTL),
            pulled_blocks_link: VolatileSet::new(GOSSIP_TTL),
            pushed_blocks_request: VolatileSet::new(GOSSIP_TTL),
            pulled_blocks_request: VolatileSet::new(GOSSIP_TTL),
            pushed_seeds_request: VolatileSet::new(GOSSIP_TTL),
            pulled_seeds_request: VolatileSet::new(GOSSIP_TTL),
        }
    }

    /// Small integer id, unique among live entries.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn increment_priority(&mut self, policy: &PriorityPolicy) {
        self.priority = (self.priority + 1).min(policy.bound);
    }

    pub fn decrement_priority(&mut self, policy: &PriorityPolicy) {
        self.priority = (self.priority - 1).max(-policy.bound);
    }

    /// One step of decay toward the mediation band.
    pub fn mediate(&mut self, policy: &PriorityPolicy) {
        if self.priority > policy.mediate_band {
            self.priority -= 1;
        } else if self.priority < -policy.mediate_band {
            self.priority += 1;
        }
    }

    /// Probability in `[0, 1]` of granting this peer an upload slot.
    pub fn grant_probability(&self, policy: &PriorityPolicy) -> f64 {
        let n = policy.normalizer.max(1) as f64;
        ((self.priority as f64 + n) / (2.0 * n)).clamp(0.0, 1.0)
    }

    fn trim(&mut self, now: Instant) {
        self.stock_blocks.trim_at(now);
        self.stock_link_seeds.trim_at(now);
        self.stock_store_seeds.trim_at(now);
        self.pushed_blocks_link.trim_at(now);
        self.pulled_blocks_link.trim_at(now);
        self.pushed_blocks_request.trim_at(now);
        self.pulled_blocks_request.trim_at(now);
        self.pushed_seeds_request.trim_at(now);
        self.pulled_seeds_request.trim_at(now);
    }
}

struct Entry {
    state: PeerState,
    touched: u64,
}

#[derive(Default)]
struct TableInner {
    entries: HashMap<Node, Entry>,
    ids: BTreeSet<u32>,
    clock: u64,
}

fn lowest_free_id(ids: &BTreeSet<u32>) -> u32 {
    let mut candidate = 0u32;
    for &id in ids {
        if id != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}

impl TableInner {
    fn remove(&mut self, node: &Node) -> bool {
        match self.entries.remove(node) {
            Some(e) => {
                self.ids.remove(&e.state.id);
                true
            }
            None => false,
        }
    }
}

/// Owns every PeerState. Access goes through `with`, which creates on first use.
pub struct PeerStateTable {
    inner: Mutex<TableInner>,
    capacity: usize,
}

impl PeerStateTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(TableInner::default()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Run `f` on the peer's state, creating it if absent. Stamps the touch time.
    pub fn with<R>(&self, node: &Node, f: impl FnOnce(&mut PeerState) -> R) -> R {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let clock = inner.clock;
        let TableInner { entries, ids, .. } = &mut *inner;
        let entry = entries.entry(node.clone()).or_insert_with(|| {
            let id = lowest_free_id(ids);
            ids.insert(id);
            Entry {
                state: PeerState::new(id),
                touched: clock,
            }
        });
        entry.touched = clock;
        f(&mut entry.state)
    }

    /// Read a peer's state without creating or touching it.
    pub fn peek<R>(&self, node: &Node, f: impl FnOnce(&PeerState) -> R) -> Option<R> {
        self.inner.lock().entries.get(node).map(|e| f(&e.state))
    }

    /// Replace the peer's state with a fresh one (same id slot semantics as a new peer).
    pub fn reset(&self, node: &Node) {
        let mut inner = self.inner.lock();
        inner.remove(node);
        drop(inner);
        self.with(node, |_| ());
    }

    pub fn remove(&self, node: &Node) -> bool {
        self.inner.lock().remove(node)
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.inner.lock().entries.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    /// Apply `f` to every state.
    pub fn for_each(&self, mut f: impl FnMut(&Node, &mut PeerState)) {
        let mut inner = self.inner.lock();
        for (node, entry) in inner.entries.iter_mut() {
            f(node, &mut entry.state);
        }
    }

    /// Drop expired entries from every sub-collection.
    pub fn trim(&self, now: Instant) {
        self.for_each(|_, s| s.trim(now));
    }

    /// Evict least-recently-touched peers above capacity, never touching `connected`.
    /// Returns the number evicted.
    pub fn reclaim(&self, connected: &HashSet<Node>) -> usize {
        let mut inner = self.inner.lock();
        let excess = inner.entries.len().saturating_sub(self.capacity);
        if excess == 0 {
            return 0;
        }
        let mut candidates: Vec<(u64, Node)> = inner
            .entries
            .iter()
            .filter(|(node, _)| !connected.contains(*node))
            .map(|(node, e)| (e.touched, node.clone()))
            .collect();
        candidates.sort_by_key(|(touched, _)| *touched);
        let mut evicted = 0;
        for (_, node) in candidates.into_iter().take(excess) {
            if inner.remove(&node) {
                evicted += 1;
            }
        }
        debug!(target: "engine", evicted, remaining = inner.entries.len(), "reclaimed peer states");
        evicted
    }
}

impl Default for PeerStateTable {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_CAPACITY)
    }
}
