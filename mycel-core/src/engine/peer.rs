//! Per-peer driver: one pass of the loop that serves a single session.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, trace};

use super::{bump, GossipEngine};
use crate::config::secs;
use crate::seeds::SeedCategory;
use crate::session::PeerSession;
use crate::store::StoreError;
use crate::types::{Key, Node, Seed};

/// Which queue a pushed block came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    Diffusion,
    Upload,
}

struct Outbox {
    links: Option<Vec<Key>>,
    requests: Option<Vec<Key>>,
    seeds_requests: Option<Vec<String>>,
}

impl GossipEngine {
    /// Run one pass of the peer's driver. Returns false once the peer is gone.
    pub fn tick_peer(&self, node: &Node, now: Instant) -> bool {
        let (session, connections, nodes_due, outbox_due, diffusion_due, seeds_due) = {
            let mut shared = self.shared.lock();
            let connections = shared.sessions.len();
            let Some(entry) = shared.sessions.get_mut(node) else {
                return false;
            };
            let timers = &mut entry.timers;
            (
                entry.session.clone(),
                connections,
                timers.push_nodes.due(now, secs(self.config.push_nodes_interval)),
                timers.outbox.due(now, secs(self.config.outbox_interval)),
                timers.diffusion.due(now, secs(connections as u64)),
                timers.seeds.due(now, secs(self.config.push_seeds_interval)),
            )
        };
        if session.is_closed() {
            return false;
        }
        session.keep_alive(now);

        if self.starved(node, now) {
            debug!(target: "engine", peer = %node, "dropping starved peer");
            {
                let mut shared = self.shared.lock();
                self.remove_node(&mut shared, node);
            }
            let _ = session.push_cancel();
            self.remove_session(node);
            return false;
        }

        let uploading = connections >= self.config.upload_lower_limit;
        let downloading = connections >= self.config.download_lower_limit;

        if nodes_due && !self.push_nodes(&session) {
            return false;
        }
        if outbox_due && !self.flush_outbox(&session, uploading, downloading) {
            return false;
        }
        if diffusion_due && uploading && !self.push_queued_block(&session, Grant::Diffusion) {
            return false;
        }
        let grant = {
            let probability = self
                .peers
                .with(node, |s| s.grant_probability(&self.policy));
            self.rng.lock().gen::<f64>() < probability
        };
        if grant && uploading && !self.push_queued_block(&session, Grant::Upload) {
            return false;
        }
        if seeds_due && uploading && !self.push_seeds(&session) {
            return false;
        }
        true
    }

    /// Negative score and no useful pull for the starvation window.
    fn starved(&self, node: &Node, now: Instant) -> bool {
        let window = secs(self.config.starvation_timeout);
        self.peers
            .peek(node, |s| {
                s.priority() < 0 && now.saturating_duration_since(s.last_pull_time) >= window
            })
            .unwrap_or(false)
    }

    /// Sample of known nodes, preferring ones with a recently succeeded address.
    fn push_nodes(&self, session: &Arc<PeerSession>) -> bool {
        let nodes: Vec<Node> = {
            let shared = self.shared.lock();
            let mut rng = self.rng.lock();
            let mut all: Vec<&Node> = shared.routing.iter().collect();
            all.shuffle(&mut *rng);
            let mut picked: Vec<Node> = Vec::new();
            let mut seen: HashSet<&Node> = HashSet::new();
            for node in &all {
                if picked.len() >= self.config.succeeded_sample {
                    break;
                }
                if node
                    .addresses
                    .iter()
                    .any(|a| shared.succeeded_addresses.contains(a))
                    && seen.insert(*node)
                {
                    picked.push((*node).clone());
                }
            }
            for node in &all {
                if picked.len() >= self.config.node_sample {
                    break;
                }
                if seen.insert(*node) {
                    picked.push((*node).clone());
                }
            }
            picked.shuffle(&mut *rng);
            picked
        };
        if nodes.is_empty() {
            return true;
        }
        let count = nodes.len();
        match session.push_nodes(nodes) {
            Ok(()) => {
                trace!(target: "engine", peer = %session.other_node(), count, "pushed nodes");
                bump(&self.counters.pushed_nodes, count);
                true
            }
            Err(_) => false,
        }
    }

    fn flush_outbox(&self, session: &Arc<PeerSession>, uploading: bool, downloading: bool) -> bool {
        let node = session.other_node();
        let outbox = {
            let mut shared = self.shared.lock();
            Outbox {
                links: if uploading { shared.links_outbox.remove(node) } else { None },
                requests: if downloading { shared.requests_outbox.remove(node) } else { None },
                seeds_requests: if downloading { shared.seeds_outbox.remove(node) } else { None },
            }
        };

        if let Some(keys) = outbox.links.filter(|k| !k.is_empty()) {
            let count = keys.len();
            if session.push_blocks_link(keys.clone()).is_err() {
                return false;
            }
            self.peers.with(node, |s| s.pushed_blocks_link.extend(keys));
            bump(&self.counters.pushed_block_links, count);
            trace!(target: "engine", peer = %node, count, "pushed block links");
        }
        if let Some(keys) = outbox.requests.filter(|k| !k.is_empty()) {
            let count = keys.len();
            if session.push_blocks_request(keys.clone()).is_err() {
                return false;
            }
            self.peers.with(node, |s| s.pushed_blocks_request.extend(keys));
            bump(&self.counters.pushed_block_requests, count);
            trace!(target: "engine", peer = %node, count, "pushed block requests");
        }
        if let Some(signatures) = outbox.seeds_requests.filter(|s| !s.is_empty()) {
            let count = signatures.len();
            if session.push_seeds_request(signatures.clone()).is_err() {
                return false;
            }
            {
                let mut shared = self.shared.lock();
                for signature in &signatures {
                    shared.seeds_requests.remove(signature);
                }
            }
            self.peers
                .with(node, |s| s.pushed_seeds_request.extend(signatures));
            bump(&self.counters.pushed_seed_requests, count);
        }
        true
    }

    /// Dequeue one block from the peer's diffusion or upload queue and send it.
    fn push_queued_block(&self, session: &Arc<PeerSession>, grant: Grant) -> bool {
        let node = session.other_node();
        let key = {
            let mut shared = self.shared.lock();
            let Some(entry) = shared.sessions.get_mut(node) else {
                return false;
            };
            match grant {
                Grant::Diffusion => entry.diffusion_queue.pop_front(),
                Grant::Upload => entry.upload_queue.pop_front(),
            }
        };
        let Some(key) = key else {
            return true;
        };
        self.peers.with(node, |s| s.stock_blocks.insert(key.clone()));

        let value = match self.store.get(&key) {
            Ok(v) => v,
            Err(StoreError::NotFound(_)) => {
                self.peers.with(node, |s| s.stock_blocks.remove(&key));
                return true;
            }
            Err(e) => {
                debug!(target: "engine", %key, %e, "cannot read queued block");
                self.peers.with(node, |s| s.stock_blocks.remove(&key));
                return true;
            }
        };
        let len = value.len() as u64;
        if session.push_block(key.clone(), value).is_err() {
            self.peers.with(node, |s| s.stock_blocks.remove(&key));
            return false;
        }
        bump(&self.counters.pushed_blocks, 1);
        trace!(target: "engine", peer = %node, %key, ?grant, "pushed block");

        let policy = self.policy;
        self.peers.with(node, |s| {
            s.pulled_blocks_request.remove(&key);
            s.sent_bytes += len;
            if grant == Grant::Upload {
                s.decrement_priority(&policy);
            }
        });
        {
            let mut shared = self.shared.lock();
            if grant == Grant::Upload && shared.relay_blocks.contains(&key) {
                bump(&self.counters.relayed_blocks, 1);
            }
            self.settle(&mut shared, &key);
        }
        self.fire_uploaded(std::slice::from_ref(&key));
        true
    }

    /// Answer the peer's seed requests with seeds newer than what it already has.
    fn push_seeds(&self, session: &Arc<PeerSession>) -> bool {
        let node = session.other_node();
        let half = (self.config.max_seed_count / 2).max(1);
        let mut signatures = self
            .peers
            .with(node, |s| s.pulled_seeds_request.to_vec());
        if signatures.is_empty() {
            return true;
        }

        let mut picked: Vec<(SeedCategory, Seed)> = Vec::new();
        {
            let shared = self.shared.lock();
            let mut rng = self.rng.lock();
            for category in [SeedCategory::Link, SeedCategory::Store] {
                signatures.shuffle(&mut *rng);
                let mut taken = 0;
                for signature in &signatures {
                    let Some(seed) = shared.seeds.get(category, signature) else {
                        continue;
                    };
                    let stocked = self
                        .peers
                        .peek(node, |s| match category {
                            SeedCategory::Link => s.stock_link_seeds.get(signature).copied(),
                            SeedCategory::Store => s.stock_store_seeds.get(signature).copied(),
                        })
                        .flatten();
                    let fresh = stocked.map(|at| seed.creation_time > at).unwrap_or(true);
                    if fresh {
                        picked.push((category, seed.clone()));
                        taken += 1;
                        if taken >= half {
                            break;
                        }
                    }
                }
            }
            picked.shuffle(&mut *rng);
        }
        if picked.is_empty() {
            return true;
        }

        let seeds: Vec<Seed> = picked.iter().map(|(_, s)| s.clone()).collect();
        let count = seeds.len();
        if session.push_seeds(seeds).is_err() {
            return false;
        }
        bump(&self.counters.pushed_seeds, count);
        self.peers.with(node, |s| {
            for (category, seed) in picked {
                let Some(signature) = seed.signature() else {
                    continue;
                };
                match category {
                    SeedCategory::Link => s.stock_link_seeds.insert(signature, seed.creation_time),
                    SeedCategory::Store => s.stock_store_seeds.insert(signature, seed.creation_time),
                }
            }
        });
        trace!(target: "engine", peer = %node, count, "pushed seeds");
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::super::tests::{engine_with, link, node, test_config, wait_until};
    use crate::config::EngineConfig;
    use crate::identity::DigitalSignature;
    use crate::seeds::STORE_LABEL;
    use crate::store::BlockStore;
    use crate::types::{CodecParams, HashAlgorithm, Key, Seed};

    #[test]
    fn starved_peer_is_cancelled() {
        let config = EngineConfig {
            starvation_timeout: 0,
            ..test_config()
        };
        let (a, _) = engine_with(1, config);
        let (b, _) = engine_with(2, test_config());
        let _ = link(&a, &b);
        a.peers.with(&node(2), |s| s.decrement_priority(&a.policy));
        assert!(!a.tick_peer(&node(2), Instant::now()));
        assert_eq!(a.session_count(), 0);
        assert!(a.shared.lock().removed.contains(&node(2)));
        assert!(wait_until(|| b.session_count() == 0));
    }

    #[test]
    fn outbox_requests_reach_the_peer() {
        let (a, _) = engine_with(1, test_config());
        let (b, _) = engine_with(2, test_config());
        let _ = link(&a, &b);
        let key = Key::from_data(HashAlgorithm::Sha256, b"want");
        a.shared
            .lock()
            .requests_outbox
            .insert(node(2), vec![key.clone()]);
        let later = Instant::now() + Duration::from_secs(31);
        assert!(a.tick_peer(&node(2), later));
        assert!(a
            .peers
            .peek(&node(2), |s| s.pushed_blocks_request.contains(&key))
            .unwrap());
        assert!(wait_until(|| b
            .peers
            .peek(&node(1), |s| s.pulled_blocks_request.contains(&key))
            .unwrap_or(false)));
    }

    #[test]
    fn granted_upload_costs_priority_and_settles() {
        let (a, store_a) = engine_with(1, test_config());
        let (b, store_b) = engine_with(2, test_config());
        let _ = link(&a, &b);
        let value = b"served".to_vec();
        let key = Key::from_data(HashAlgorithm::Sha256, &value);
        store_a.put(&key, &value).unwrap();
        a.upload(&key);
        let uploaded = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = uploaded.clone();
        a.on_uploaded(Box::new(move |keys| sink.lock().extend_from_slice(keys)));

        a.peers.with(&node(2), |s| {
            for _ in 0..300 {
                s.increment_priority(&a.policy);
            }
        });
        a.shared
            .lock()
            .sessions
            .get_mut(&node(2))
            .unwrap()
            .upload_queue
            .push_back(key.clone());
        assert!(a.tick_peer(&node(2), Instant::now()));
        assert!(wait_until(|| store_b.contains(&key)));
        assert_eq!(a.peers.peek(&node(2), |s| s.priority()), Some(255));
        assert!(!a.is_upload_waiting(&key));
        assert_eq!(store_a.lock_count(&key), 0);
        assert_eq!(uploaded.lock().as_slice(), &[key]);
    }

    #[test]
    fn requested_seeds_are_pushed_once() {
        let (a, _) = engine_with(1, test_config());
        let (b, _) = engine_with(2, test_config());
        let _ = link(&a, &b);
        let bob = DigitalSignature::generate("bob");
        let mut seed = Seed::new(STORE_LABEL, 0, 1, None, CodecParams::plain());
        bob.sign_seed(&mut seed).unwrap();
        assert!(a.upload_seed(&seed).unwrap());
        a.peers
            .with(&node(2), |s| s.pulled_seeds_request.insert(bob.signature()));

        let later = Instant::now() + Duration::from_secs(31);
        assert!(a.tick_peer(&node(2), later));
        assert!(wait_until(|| b.store_seed(&bob.signature()).is_some()));
        let pushed = a.information().pushed_seeds;
        assert_eq!(pushed, 1);
        assert!(a.tick_peer(&node(2), later + Duration::from_secs(31)));
        assert_eq!(a.information().pushed_seeds, 1);
    }
}
