//! Global rounds: housekeeping plus the periodic routing of keys and seed
//! requests to the peers nearest to them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::time::Instant;

use rand::seq::{IteratorRandom, SliceRandom};
use tracing::{debug, info, trace};

use super::{GossipEngine, Shared};
use crate::config::secs;
use crate::identity::signature_hash;
use crate::routing::{search, search_closer_than};
use crate::seeds::MAX_TRACKED_SIGNATURES;
use crate::types::{Key, Node};

struct Due {
    trim: bool,
    mediate: bool,
    diffusion: bool,
    upload: bool,
    download: bool,
    seeds_upload: bool,
    seeds_download: bool,
    shed: bool,
}

/// Route each item to its nearest peers, capping every per-peer list at `cap`.
fn route<T: Clone>(
    items: &[T],
    target: impl Fn(&T) -> Vec<u8>,
    peers: &[Node],
    fanout: usize,
    cap: usize,
) -> HashMap<Node, Vec<T>> {
    let mut routed: HashMap<Node, Vec<T>> = HashMap::new();
    for item in items {
        for node in search(&target(item), peers, fanout) {
            let list = routed.entry(node).or_default();
            if list.len() < cap {
                list.push(item.clone());
            }
        }
    }
    routed
}

impl GossipEngine {
    /// One pass of the global rounds. Each round runs when its interval has
    /// elapsed and enough sessions are open.
    pub fn tick(&self, now: Instant) {
        let c = &self.config;
        let due = {
            let mut shared = self.shared.lock();
            let connections = shared.sessions.len();
            let shed_floor = shared.connection_limit / 3;
            let t = &mut shared.timers;
            Due {
                trim: t.trim.due(now, secs(c.trim_interval)),
                mediate: t.mediate.due(now, secs(c.mediate_interval)),
                diffusion: connections > c.diffusion_lower_limit
                    && t.diffusion.due(now, secs(c.diffusion_round_interval)),
                upload: connections >= c.upload_lower_limit
                    && t.upload.due(now, secs(c.upload_round_interval)),
                download: connections >= c.download_lower_limit
                    && t.download.due(now, secs(c.download_round_interval)),
                seeds_upload: connections >= c.upload_lower_limit
                    && t.seeds_upload.due(now, secs(c.seeds_round_interval)),
                seeds_download: connections >= c.download_lower_limit
                    && t.seeds_download.due(now, secs(c.seeds_round_interval)),
                shed: connections > shed_floor && t.shed.due(now, secs(c.shed_interval)),
            }
        };

        if due.trim {
            self.trim(now);
        }
        if due.mediate {
            let policy = self.policy;
            self.peers.for_each(|_, s| s.mediate(&policy));
        }
        if due.diffusion {
            self.diffusion_round();
        }
        if due.upload {
            self.upload_round();
        }
        if due.download {
            self.download_round();
        }
        if due.seeds_upload {
            self.seeds_upload_round();
        }
        if due.seeds_download {
            self.seeds_download_round();
        }
        if due.shed {
            self.shed_worst_peer();
        }
    }

    /// Bound the seed tables. At most one prune runs at a time.
    pub fn tick_prune(&self, now: Instant) {
        if !self
            .shared
            .lock()
            .timers
            .prune
            .due(now, secs(self.config.prune_interval))
        {
            return;
        }
        if self.pruning.swap(true, Ordering::AcqRel) {
            return;
        }
        let locked = self
            .trust_lock
            .read()
            .as_ref()
            .map(|f| f())
            .unwrap_or_default();
        let dropped = self.shared.lock().seeds.prune(MAX_TRACKED_SIGNATURES, &locked);
        if dropped > 0 {
            debug!(target: "engine", dropped, "pruned seeds");
        }
        self.pruning.store(false, Ordering::Release);
    }

    fn trim(&self, now: Instant) {
        let connected: HashSet<Node> = {
            let mut shared = self.shared.lock();
            shared.waiting.trim_at(now);
            shared.cut.trim_at(now);
            shared.removed.trim_at(now);
            shared.succeeded_addresses.trim_at(now);
            shared.download_blocks.trim_at(now);
            shared.seeds_requests.trim_at(now);
            shared.relay_blocks.trim_at(now);
            shared.sessions.keys().cloned().collect()
        };
        self.peers.trim(now);
        let reclaimed = self.peers.reclaim(&connected);
        if reclaimed > 0 {
            trace!(target: "engine", reclaimed, "reclaimed peer states");
        }
    }

    /// Drop requests whose block is gone and cap the diffusion backlog.
    fn prune_requests(&self, shared: &mut Shared) {
        let backlog = self.config.diffusion_backlog;
        if shared.diffusion_requests.len() > backlog {
            let excess = shared.diffusion_requests.len() - backlog;
            let evicted: Vec<Key> = {
                let mut rng = self.rng.lock();
                shared
                    .diffusion_requests
                    .iter()
                    .cloned()
                    .choose_multiple(&mut *rng, excess)
            };
            for key in &evicted {
                shared.diffusion_requests.remove(key);
            }
            debug!(target: "engine", evicted = evicted.len(), "diffusion backlog trimmed");
        }
        let missing: Vec<Key> = shared
            .upload_requests
            .iter()
            .chain(shared.diffusion_requests.iter())
            .filter(|k| !self.store.contains(k))
            .cloned()
            .collect();
        for key in &missing {
            self.settle(shared, key);
        }
    }

    /// Queue each pending block on the peer nearer to it than we are. A block
    /// with no nearer peer is already where it belongs.
    fn diffusion_round(&self) {
        let (keys, peers, base_id) = {
            let mut shared = self.shared.lock();
            self.prune_requests(&mut shared);
            let mut rng = self.rng.lock();
            let max = self.config.max_link_count;
            let mut keys: Vec<Key> = shared
                .upload_requests
                .iter()
                .cloned()
                .choose_multiple(&mut *rng, max);
            keys.extend(
                shared
                    .diffusion_requests
                    .iter()
                    .filter(|k| !shared.upload_requests.contains(*k))
                    .cloned()
                    .choose_multiple(&mut *rng, max),
            );
            keys.shuffle(&mut *rng);
            (keys, shared.connected(), shared.routing.base_node().id.clone())
        };

        let mut queues: HashMap<Node, VecDeque<Key>> = HashMap::new();
        let mut arrived: Vec<Key> = Vec::new();
        for key in keys {
            let targets = search_closer_than(key.digest(), &base_id, &peers, self.config.diffusion_fanout);
            if targets.is_empty() {
                arrived.push(key);
                continue;
            }
            for node in targets {
                queues.entry(node).or_default().push_back(key.clone());
            }
        }

        {
            let mut shared = self.shared.lock();
            for key in &arrived {
                self.settle(&mut shared, key);
            }
            for (node, entry) in shared.sessions.iter_mut() {
                entry.diffusion_queue = queues.remove(node).unwrap_or_default();
            }
        }
        trace!(target: "engine", arrived = arrived.len(), "diffusion round");
        self.fire_uploaded(&arrived);
    }

    /// Stage, per peer, the blocks it asked for that we hold.
    fn upload_round(&self) {
        let peers = self.connected_nodes();
        let mut queues: HashMap<Node, VecDeque<Key>> = HashMap::new();
        for node in peers {
            let mut wanted = self
                .peers
                .peek(&node, |s| s.pulled_blocks_request.to_vec())
                .unwrap_or_default();
            wanted.retain(|k| self.store.contains(k));
            wanted.shuffle(&mut *self.rng.lock());
            wanted.truncate(self.config.upload_batch);
            queues.insert(node, wanted.into_iter().collect());
        }
        let mut shared = self.shared.lock();
        for (node, entry) in shared.sessions.iter_mut() {
            entry.upload_queue = queues.remove(node).unwrap_or_default();
        }
    }

    /// Route our links and pending requests, plus what peers passed on to us,
    /// towards the peers nearest each key.
    fn download_round(&self) {
        let c = &self.config;
        let (own_requests, peers) = {
            let shared = self.shared.lock();
            (shared.download_blocks.to_vec(), shared.connected())
        };
        if peers.is_empty() {
            return;
        }
        let link_quota = c.max_link_count.saturating_mul(8) / peers.len();
        let request_quota = c.max_request_count.saturating_mul(8) / peers.len();

        let mut links: Vec<Key>;
        let mut requests: Vec<Key>;
        let mut advertised: HashMap<Key, Vec<Node>> = HashMap::new();
        {
            let mut rng = self.rng.lock();
            links = self.store.keys().into_iter().choose_multiple(&mut *rng, c.max_link_count);
            requests = own_requests
                .into_iter()
                .filter(|k| !self.store.contains(k))
                .choose_multiple(&mut *rng, c.max_request_count);
            for node in &peers {
                let (peer_links, peer_requests) = self
                    .peers
                    .peek(node, |s| (s.pulled_blocks_link.to_vec(), s.pulled_blocks_request.to_vec()))
                    .unwrap_or_default();
                for key in &peer_links {
                    advertised.entry(key.clone()).or_default().push(node.clone());
                }
                links.extend(peer_links.into_iter().choose_multiple(&mut *rng, link_quota));
                requests.extend(
                    peer_requests
                        .into_iter()
                        .filter(|k| !self.store.contains(k))
                        .choose_multiple(&mut *rng, request_quota),
                );
            }
            links.sort();
            links.dedup();
            links.shuffle(&mut *rng);
            requests.sort();
            requests.dedup();
            requests.shuffle(&mut *rng);
        }

        let links_out = route(&links, |k| k.digest().to_vec(), &peers, c.link_fanout, c.max_link_count);
        let mut requests_out = route(
            &requests,
            |k| k.digest().to_vec(),
            &peers,
            c.request_fanout,
            c.max_request_count,
        );
        for key in &requests {
            let Some(holders) = advertised.get(key) else {
                continue;
            };
            for node in holders {
                let list = requests_out.entry(node.clone()).or_default();
                if list.len() < c.max_request_count && !list.contains(key) {
                    list.push(key.clone());
                }
            }
        }

        trace!(
            target: "engine",
            links = links.len(),
            requests = requests.len(),
            "download round"
        );
        let mut shared = self.shared.lock();
        shared.links_outbox = links_out;
        shared.requests_outbox = requests_out;
    }

    /// Tell the peers nearest each known signature that we can answer for it.
    fn seeds_upload_round(&self) {
        let (signatures, peers) = {
            let shared = self.shared.lock();
            (shared.seeds.signatures(), shared.connected())
        };
        for signature in signatures {
            let target = signature_hash(&signature);
            for node in search(&target, &peers, self.config.seed_fanout) {
                self.peers
                    .with(&node, |s| s.pulled_seeds_request.insert(signature.clone()));
            }
        }
    }

    /// Route our own and relayed seed requests to the peers nearest each signature.
    fn seeds_download_round(&self) {
        let c = &self.config;
        let (own, peers) = {
            let shared = self.shared.lock();
            (shared.seeds_requests.to_vec(), shared.connected())
        };
        if peers.is_empty() {
            return;
        }
        let quota = c.max_seed_request_count.saturating_mul(8) / peers.len();
        let mut signatures: Vec<String> = {
            let mut rng = self.rng.lock();
            let mut all = own
                .into_iter()
                .choose_multiple(&mut *rng, c.max_seed_request_count);
            for node in &peers {
                let relayed = self
                    .peers
                    .peek(node, |s| s.pulled_seeds_request.to_vec())
                    .unwrap_or_default();
                all.extend(relayed.into_iter().choose_multiple(&mut *rng, quota));
            }
            all
        };
        signatures.sort();
        signatures.dedup();
        let routed = route(
            &signatures,
            |s| signature_hash(s).to_vec(),
            &peers,
            c.seed_fanout,
            c.max_seed_request_count,
        );
        self.shared.lock().seeds_outbox = routed;
    }

    /// Close the least useful session to make room for fresh peers.
    fn shed_worst_peer(&self) {
        let peers = self.connected_nodes();
        let worst = peers
            .into_iter()
            .filter_map(|node| {
                self.peers
                    .peek(&node, |s| (s.priority(), s.last_pull_time))
                    .map(|rank| (rank, node))
            })
            .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)))
            .map(|(_, node)| node);
        if let Some(node) = worst {
            info!(target: "engine", peer = %node, "shedding lowest priority peer");
            self.remove_session(&node);
        }
    }
}
