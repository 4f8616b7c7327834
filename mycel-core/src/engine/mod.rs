//! GossipEngine: the session set, per-peer drivers and global gossip rounds.
//!
//! All shared peer, session and routing state lives behind one lock
//! (`Shared`). Per-peer bookkeeping lives in the [`PeerStateTable`]. Sends
//! never happen while the engine lock is held: every duty computes what to
//! send under the lock, releases it, sends, then records the outcome.
//!
//! Duties are exposed as tick methods taking the current `Instant` so a host
//! (or a test) can drive them directly; `start` spawns the threads that call
//! them once a second.

mod connect;
mod events;
mod peer;
mod rounds;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::StopFlag;
use crate::config::EngineConfig;
use crate::identity::CertificateError;
use crate::peer_state::{PeerStateTable, PriorityPolicy};
use crate::routing::RoutingTable;
use crate::seeds::{SeedCategory, SeedTable};
use crate::session::{PeerSession, SessionDirection, SessionHandler};
use crate::store::BlockStore;
use crate::transport::{BandwidthLimit, Dialer, Listener};
use crate::types::{Key, Node, Seed};
use crate::volatile::{Stopwatch, VolatileSet};

const WAITING_TTL: Duration = Duration::from_secs(30);
const CUT_TTL: Duration = Duration::from_secs(10 * 60);
const REMOVED_TTL: Duration = Duration::from_secs(30 * 60);
const SUCCEEDED_TTL: Duration = Duration::from_secs(60 * 60);
const DOWNLOAD_TTL: Duration = Duration::from_secs(30 * 60);
const SEEDS_REQUEST_TTL: Duration = Duration::from_secs(3 * 60);
const RELAY_TTL: Duration = Duration::from_secs(30 * 60);
const TICK: Duration = Duration::from_secs(1);

/// Called with keys whose upload obligations are satisfied.
pub type UploadedCallback = Box<dyn Fn(&[Key]) + Send + Sync>;
/// Returns signatures that pruning must keep.
pub type TrustLock = Box<dyn Fn() -> HashSet<String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Connecting,
    Active,
    Closing,
    Removed,
}

/// How the engine reaches and accepts peers.
pub struct Network {
    pub dialer: Arc<dyn Dialer>,
    pub listener: Option<Arc<dyn Listener>>,
    pub bandwidth: Arc<BandwidthLimit>,
}

struct PeerTimers {
    push_nodes: Stopwatch,
    outbox: Stopwatch,
    diffusion: Stopwatch,
    seeds: Stopwatch,
}

impl PeerTimers {
    fn new(now: Instant) -> Self {
        Self {
            push_nodes: Stopwatch::new(),
            outbox: Stopwatch::started(now),
            diffusion: Stopwatch::started(now),
            seeds: Stopwatch::started(now),
        }
    }
}

struct SessionEntry {
    session: Arc<PeerSession>,
    phase: PeerPhase,
    timers: PeerTimers,
    diffusion_queue: VecDeque<Key>,
    upload_queue: VecDeque<Key>,
}

#[derive(Default)]
struct GlobalTimers {
    trim: Stopwatch,
    mediate: Stopwatch,
    diffusion: Stopwatch,
    upload: Stopwatch,
    download: Stopwatch,
    seeds_upload: Stopwatch,
    seeds_download: Stopwatch,
    shed: Stopwatch,
    prune: Stopwatch,
}

struct Shared {
    routing: RoutingTable,
    connection_limit: usize,
    sessions: HashMap<Node, SessionEntry>,
    connecting: HashSet<Node>,
    waiting: VolatileSet<Node>,
    cut: VolatileSet<Node>,
    removed: VolatileSet<Node>,
    succeeded_addresses: VolatileSet<String>,
    download_blocks: VolatileSet<Key>,
    seeds_requests: VolatileSet<String>,
    relay_blocks: VolatileSet<Key>,
    diffusion_requests: HashSet<Key>,
    /// Every key here holds one store lock.
    upload_requests: HashSet<Key>,
    seeds: SeedTable,
    links_outbox: HashMap<Node, Vec<Key>>,
    requests_outbox: HashMap<Node, Vec<Key>>,
    seeds_outbox: HashMap<Node, Vec<String>>,
    timers: GlobalTimers,
}

impl Shared {
    fn new(base_node: Node, connection_limit: usize) -> Self {
        Self {
            routing: RoutingTable::new(base_node),
            connection_limit,
            sessions: HashMap::new(),
            connecting: HashSet::new(),
            waiting: VolatileSet::new(WAITING_TTL),
            cut: VolatileSet::new(CUT_TTL),
            removed: VolatileSet::new(REMOVED_TTL),
            succeeded_addresses: VolatileSet::new(SUCCEEDED_TTL),
            download_blocks: VolatileSet::new(DOWNLOAD_TTL),
            seeds_requests: VolatileSet::new(SEEDS_REQUEST_TTL),
            relay_blocks: VolatileSet::new(RELAY_TTL),
            diffusion_requests: HashSet::new(),
            upload_requests: HashSet::new(),
            seeds: SeedTable::new(),
            links_outbox: HashMap::new(),
            requests_outbox: HashMap::new(),
            seeds_outbox: HashMap::new(),
            timers: GlobalTimers::default(),
        }
    }

    fn connected(&self) -> Vec<Node> {
        self.sessions.keys().cloned().collect()
    }

    fn count(&self, direction: SessionDirection) -> usize {
        self.sessions
            .values()
            .filter(|e| e.session.direction() == direction)
            .count()
    }

    fn forget_session(&mut self, node: &Node) {
        self.sessions.remove(node);
        self.links_outbox.remove(node);
        self.requests_outbox.remove(node);
        self.seeds_outbox.remove(node);
    }
}

#[derive(Default)]
struct Counters {
    pushed_nodes: AtomicU64,
    pulled_nodes: AtomicU64,
    pushed_block_links: AtomicU64,
    pulled_block_links: AtomicU64,
    pushed_block_requests: AtomicU64,
    pulled_block_requests: AtomicU64,
    pushed_blocks: AtomicU64,
    pulled_blocks: AtomicU64,
    pushed_seed_requests: AtomicU64,
    pulled_seed_requests: AtomicU64,
    pushed_seeds: AtomicU64,
    pulled_seeds: AtomicU64,
    relayed_blocks: AtomicU64,
    accepted_connections: AtomicU64,
    created_connections: AtomicU64,
}

fn bump(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Counters snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Information {
    pub state: EngineState,
    pub sessions: usize,
    pub inbound: usize,
    pub outbound: usize,
    pub routing_nodes: usize,
    pub received_bytes: u64,
    pub sent_bytes: u64,
    pub pushed_nodes: u64,
    pub pulled_nodes: u64,
    pub pushed_block_links: u64,
    pub pulled_block_links: u64,
    pub pushed_block_requests: u64,
    pub pulled_block_requests: u64,
    pub pushed_blocks: u64,
    pub pulled_blocks: u64,
    pub pushed_seed_requests: u64,
    pub pulled_seed_requests: u64,
    pub pushed_seeds: u64,
    pub pulled_seeds: u64,
    pub relayed_blocks: u64,
    pub accepted_connections: u64,
    pub created_connections: u64,
    pub download_waiting: usize,
    pub upload_waiting: usize,
    pub diffusion_waiting: usize,
}

/// Persisted engine state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub base_node: Node,
    pub other_nodes: Vec<Node>,
    pub connection_limit: usize,
    pub bandwidth_limit: u64,
    pub diffusion_requests: Vec<Key>,
    pub upload_requests: Vec<Key>,
    pub seeds: SeedTable,
}

pub struct GossipEngine {
    config: EngineConfig,
    policy: PriorityPolicy,
    store: Arc<dyn BlockStore>,
    network: Network,
    shared: Mutex<Shared>,
    peers: PeerStateTable,
    rng: Mutex<StdRng>,
    uploaded: RwLock<Vec<UploadedCallback>>,
    trust_lock: RwLock<Option<TrustLock>>,
    pruning: AtomicBool,
    counters: Counters,
    state: Mutex<EngineState>,
    stop: StopFlag,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// At most one live driver per connected node.
    drivers: Mutex<HashMap<Node, JoinHandle<()>>>,
}

impl GossipEngine {
    pub fn new(
        base_node: Node,
        config: EngineConfig,
        store: Arc<dyn BlockStore>,
        network: Network,
    ) -> Arc<Self> {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        if config.bandwidth_limit > 0 {
            network.bandwidth.set(config.bandwidth_limit);
        }
        Arc::new(Self {
            policy: config.priority_policy(),
            peers: PeerStateTable::new(config.peer_state_capacity),
            shared: Mutex::new(Shared::new(base_node, config.connection_limit)),
            config,
            store,
            network,
            rng: Mutex::new(rng),
            uploaded: RwLock::new(Vec::new()),
            trust_lock: RwLock::new(None),
            pruning: AtomicBool::new(false),
            counters: Counters::default(),
            state: Mutex::new(EngineState::Stopped),
            stop: StopFlag::new(),
            threads: Mutex::new(Vec::new()),
            drivers: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn peers(&self) -> &PeerStateTable {
        &self.peers
    }

    pub fn base_node(&self) -> Node {
        self.shared.lock().routing.base_node().clone()
    }

    pub fn set_base_node(&self, node: Node) {
        self.shared.lock().routing.set_base_node(node);
    }

    /// Feed known peers into the routing table. Invalid or recently removed ones are skipped.
    pub fn set_other_nodes(&self, nodes: impl IntoIterator<Item = Node>) {
        let mut shared = self.shared.lock();
        for node in nodes {
            if !node.is_valid() || shared.removed.contains(&node) {
                continue;
            }
            shared.routing.add(node);
        }
    }

    pub fn other_nodes(&self) -> Vec<Node> {
        self.shared.lock().routing.to_vec()
    }

    pub fn connection_limit(&self) -> usize {
        self.shared.lock().connection_limit
    }

    pub fn set_connection_limit(&self, limit: usize) {
        self.shared.lock().connection_limit = limit;
    }

    pub fn bandwidth_limit(&self) -> u64 {
        self.network.bandwidth.get()
    }

    pub fn set_bandwidth_limit(&self, bytes_per_second: u64) {
        self.network.bandwidth.set(bytes_per_second);
    }

    pub fn is_download_waiting(&self, key: &Key) -> bool {
        self.shared.lock().download_blocks.contains(key)
    }

    pub fn is_upload_waiting(&self, key: &Key) -> bool {
        self.shared.lock().upload_requests.contains(key)
    }

    /// Ask the network for `key`.
    pub fn download(&self, key: &Key) {
        self.shared.lock().download_blocks.insert(key.clone());
    }

    /// Keep offering `key` until it has been delivered. Holds a store lock meanwhile.
    pub fn upload(&self, key: &Key) {
        let mut shared = self.shared.lock();
        if shared.upload_requests.insert(key.clone()) {
            self.store.lock(key);
        }
    }

    pub fn send_seeds_request(&self, signature: &str) {
        self.shared.lock().seeds_requests.insert(signature.to_string());
    }

    pub fn link_seed(&self, signature: &str) -> Option<Seed> {
        self.shared
            .lock()
            .seeds
            .get(SeedCategory::Link, signature)
            .cloned()
    }

    pub fn store_seed(&self, signature: &str) -> Option<Seed> {
        self.shared
            .lock()
            .seeds
            .get(SeedCategory::Store, signature)
            .cloned()
    }

    /// Publish one of our own seeds into whichever table its label selects.
    pub fn upload_seed(&self, seed: &Seed) -> Result<bool, CertificateError> {
        let now = SystemTime::now();
        let mut shared = self.shared.lock();
        if shared.seeds.admit(SeedCategory::Link, seed, now)? {
            return Ok(true);
        }
        shared.seeds.admit(SeedCategory::Store, seed, now)
    }

    pub fn signatures(&self) -> Vec<String> {
        self.shared.lock().seeds.signatures()
    }

    pub fn on_uploaded(&self, callback: UploadedCallback) {
        self.uploaded.write().push(callback);
    }

    pub fn set_trust_lock(&self, callback: TrustLock) {
        *self.trust_lock.write() = Some(callback);
    }

    fn fire_uploaded(&self, keys: &[Key]) {
        if keys.is_empty() {
            return;
        }
        for callback in self.uploaded.read().iter() {
            callback(keys);
        }
    }

    /// Drop `key` from both request sets, releasing the upload lock.
    fn settle(&self, shared: &mut Shared, key: &Key) {
        if shared.upload_requests.remove(key) {
            if let Err(e) = self.store.unlock(key) {
                warn!(target: "engine", %key, %e, "upload request held no lock");
            }
        }
        shared.diffusion_requests.remove(key);
    }

    pub fn session_count(&self) -> usize {
        self.shared.lock().sessions.len()
    }

    pub fn connected_nodes(&self) -> Vec<Node> {
        self.shared.lock().connected()
    }

    pub fn peer_phase(&self, node: &Node) -> PeerPhase {
        let shared = self.shared.lock();
        if let Some(entry) = shared.sessions.get(node) {
            return entry.phase;
        }
        if shared.connecting.contains(node) {
            return PeerPhase::Connecting;
        }
        PeerPhase::Removed
    }

    pub fn information(&self) -> Information {
        let shared = self.shared.lock();
        let c = &self.counters;
        let (received_bytes, sent_bytes) = shared.sessions.values().fold((0, 0), |(r, s), e| {
            (r + e.session.received_bytes(), s + e.session.sent_bytes())
        });
        Information {
            state: *self.state.lock(),
            sessions: shared.sessions.len(),
            inbound: shared.count(SessionDirection::Inbound),
            outbound: shared.count(SessionDirection::Outbound),
            routing_nodes: shared.routing.len(),
            received_bytes,
            sent_bytes,
            pushed_nodes: read(&c.pushed_nodes),
            pulled_nodes: read(&c.pulled_nodes),
            pushed_block_links: read(&c.pushed_block_links),
            pulled_block_links: read(&c.pulled_block_links),
            pushed_block_requests: read(&c.pushed_block_requests),
            pulled_block_requests: read(&c.pulled_block_requests),
            pushed_blocks: read(&c.pushed_blocks),
            pulled_blocks: read(&c.pulled_blocks),
            pushed_seed_requests: read(&c.pushed_seed_requests),
            pulled_seed_requests: read(&c.pulled_seed_requests),
            pushed_seeds: read(&c.pushed_seeds),
            pulled_seeds: read(&c.pulled_seeds),
            relayed_blocks: read(&c.relayed_blocks),
            accepted_connections: read(&c.accepted_connections),
            created_connections: read(&c.created_connections),
            download_waiting: shared.download_blocks.len(),
            upload_waiting: shared.upload_requests.len(),
            diffusion_waiting: shared.diffusion_requests.len(),
        }
    }

    /// Admit a handshaken session. Rejected sessions are closed.
    pub fn add_session(self: &Arc<Self>, session: Arc<PeerSession>) -> bool {
        let node = session.other_node().clone();
        let now = Instant::now();
        {
            let mut shared = self.shared.lock();
            let reason = if node.id == shared.routing.base_node().id {
                Some("self")
            } else if shared.sessions.contains_key(&node) {
                Some("duplicate")
            } else if shared.sessions.len() >= shared.connection_limit {
                Some("limit")
            } else {
                None
            };
            if let Some(reason) = reason {
                drop(shared);
                debug!(target: "engine", peer = %node, reason, "rejecting session");
                session.close();
                return false;
            }
            shared.sessions.insert(
                node.clone(),
                SessionEntry {
                    session: session.clone(),
                    phase: PeerPhase::Active,
                    timers: PeerTimers::new(now),
                    diffusion_queue: VecDeque::new(),
                    upload_queue: VecDeque::new(),
                },
            );
        }

        let session_id = session.other_session_id().to_vec();
        let previous = self.peers.peek(&node, |s| s.session_id.clone()).flatten();
        if matches!(&previous, Some(old) if *old != session_id) {
            debug!(target: "engine", peer = %node, "session id changed, resetting peer state");
            self.peers.reset(&node);
        }
        self.peers.with(&node, |s| s.session_id = Some(session_id));

        info!(target: "engine", peer = %node, direction = ?session.direction(), "session added");
        session.start(self.clone() as Arc<dyn SessionHandler>);
        if *self.state.lock() == EngineState::Started {
            self.spawn_peer_driver(node);
        }
        true
    }

    /// Close the session and drop its entry. Idempotent.
    fn remove_session(&self, node: &Node) {
        if let Some(session) = self.begin_close(node) {
            session.close();
            self.finish_close(node, &session);
        }
    }

    /// Flag the entry `Closing`. It keeps its slot, so a duplicate cannot be
    /// admitted until `finish_close`.
    fn begin_close(&self, node: &Node) -> Option<Arc<PeerSession>> {
        let mut shared = self.shared.lock();
        let entry = shared.sessions.get_mut(node)?;
        entry.phase = PeerPhase::Closing;
        Some(entry.session.clone())
    }

    fn finish_close(&self, node: &Node, session: &Arc<PeerSession>) {
        let mut shared = self.shared.lock();
        let current = shared
            .sessions
            .get(node)
            .map(|e| Arc::ptr_eq(&e.session, session))
            .unwrap_or(false);
        if current {
            shared.forget_session(node);
            debug!(target: "engine", peer = %node, "session removed");
        }
    }

    /// Forcibly forget a peer: it may not reconnect for a while.
    fn remove_node(&self, shared: &mut Shared, node: &Node) {
        shared.removed.insert(node.clone());
        shared.cut.remove(node);
        if shared.routing.len() > self.config.routing_removal_threshold {
            shared.routing.remove(node);
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    fn spawn(&self, name: String, body: impl FnOnce() + Send + 'static) {
        match std::thread::Builder::new().name(name).spawn(body) {
            Ok(handle) => self.threads.lock().push(handle),
            Err(e) => warn!(target: "engine", %e, "failed to spawn engine thread"),
        }
    }

    /// Start the per-peer loop unless one is already running for `node`.
    fn spawn_peer_driver(self: &Arc<Self>, node: Node) {
        let mut drivers = self.drivers.lock();
        drivers.retain(|_, h| !h.is_finished());
        if drivers.contains_key(&node) {
            return;
        }
        let engine = self.clone();
        let peer = node.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("mycel-peer-{}", node.short_id()))
            .spawn(move || {
                while engine.stop.sleep(TICK) {
                    if !engine.tick_peer(&peer, Instant::now()) && engine.retire_driver(&peer) {
                        break;
                    }
                }
            });
        match spawned {
            Ok(handle) => {
                drivers.insert(node, handle);
            }
            Err(e) => warn!(target: "engine", %e, "failed to spawn peer driver"),
        }
    }

    /// Called by a driver whose session is gone. Returns false if a new
    /// session for the node arrived meanwhile and the driver should keep going.
    fn retire_driver(&self, node: &Node) -> bool {
        let mut drivers = self.drivers.lock();
        if self.shared.lock().sessions.contains_key(node) {
            return false;
        }
        drivers.remove(node);
        true
    }

    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state != EngineState::Stopped {
                return;
            }
            *state = EngineState::Starting;
        }
        self.stop.reset();
        let dropped = self.shared.lock().seeds.verify_all();
        if dropped > 0 {
            info!(target: "engine", dropped, "dropped seeds failing verification");
        }

        let engine = self.clone();
        self.spawn("mycel-rounds".into(), move || {
            while engine.stop.sleep(TICK) {
                engine.tick(Instant::now());
            }
        });
        let engine = self.clone();
        self.spawn("mycel-prune".into(), move || {
            while engine.stop.sleep(TICK) {
                engine.tick_prune(Instant::now());
            }
        });
        for i in 0..self.config.connect_loops {
            let engine = self.clone();
            self.spawn(format!("mycel-connect-{}", i), move || {
                while engine.stop.sleep(TICK) {
                    engine.tick_connect(Instant::now());
                }
            });
        }
        if self.network.listener.is_some() {
            for i in 0..self.config.accept_loops {
                let engine = self.clone();
                self.spawn(format!("mycel-accept-{}", i), move || {
                    while !engine.stop.is_stopped() {
                        engine.tick_accept();
                    }
                });
            }
        }
        // Sessions admitted from here on spawn their own driver; the
        // listing below covers everything admitted before.
        *self.state.lock() = EngineState::Started;
        for node in self.connected_nodes() {
            self.spawn_peer_driver(node);
        }
        info!(target: "engine", "engine started");
    }

    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != EngineState::Started {
                return;
            }
            *state = EngineState::Stopping;
        }
        self.stop.stop();
        let mut handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        handles.extend(self.drivers.lock().drain().map(|(_, h)| h));
        for handle in handles {
            if handle.join().is_err() {
                warn!(target: "engine", "engine thread panicked");
            }
        }
        for node in self.connected_nodes() {
            self.remove_session(&node);
        }
        {
            let mut shared = self.shared.lock();
            shared.cut.clear();
            shared.removed.clear();
            shared.connecting.clear();
            shared.links_outbox.clear();
            shared.requests_outbox.clear();
            shared.seeds_outbox.clear();
        }
        for node in self.peers.nodes() {
            self.peers.remove(&node);
        }
        *self.state.lock() = EngineState::Stopped;
        info!(target: "engine", "engine stopped");
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let shared = self.shared.lock();
        EngineSnapshot {
            base_node: shared.routing.base_node().clone(),
            other_nodes: shared.routing.to_vec(),
            connection_limit: shared.connection_limit,
            bandwidth_limit: self.network.bandwidth.get(),
            diffusion_requests: shared.diffusion_requests.iter().cloned().collect(),
            upload_requests: shared.upload_requests.iter().cloned().collect(),
            seeds: shared.seeds.clone(),
        }
    }

    /// Load persisted state. Upload requests re-take their store locks.
    pub fn restore(&self, snapshot: EngineSnapshot) {
        let mut shared = self.shared.lock();
        shared.routing.set_base_node(snapshot.base_node);
        for node in snapshot.other_nodes {
            if node.is_valid() {
                shared.routing.add(node);
            }
        }
        shared.connection_limit = snapshot.connection_limit;
        self.network.bandwidth.set(snapshot.bandwidth_limit);
        shared.diffusion_requests.extend(snapshot.diffusion_requests);
        for key in snapshot.upload_requests {
            if shared.upload_requests.insert(key.clone()) {
                self.store.lock(&key);
            }
        }
        shared.seeds = snapshot.seeds;
    }
}

impl SessionHandler for GossipEngine {
    fn on_event(&self, session: &Arc<PeerSession>, event: crate::session::SessionEvent) {
        self.handle_event(session, event);
    }
}
