//! Session event handling.

use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tracing::{debug, trace};

use super::{bump, GossipEngine};
use crate::seeds::SeedCategory;
use crate::session::{PeerSession, SessionEvent};
use crate::types::{Key, Node, Seed};
use crate::volatile::VolatileSet;

/// Soft per-peer budget: a set may hold `max * ttl_minutes` entries.
fn over_budget<T: Eq + std::hash::Hash + Clone>(set: &VolatileSet<T>, max: usize) -> bool {
    let minutes = (set.ttl().as_secs() / 60).max(1) as usize;
    set.len() > max.saturating_mul(minutes)
}

impl GossipEngine {
    pub(super) fn handle_event(&self, session: &Arc<PeerSession>, event: SessionEvent) {
        let node = session.other_node();
        match event {
            SessionEvent::Nodes(nodes) => self.pull_nodes(node, nodes),
            SessionEvent::BlocksLink(keys) => self.pull_blocks_link(node, keys),
            SessionEvent::BlocksRequest(keys) => self.pull_blocks_request(node, keys),
            SessionEvent::Block { key, value } => self.pull_block(node, key, value),
            SessionEvent::SeedsRequest(signatures) => self.pull_seeds_request(node, signatures),
            SessionEvent::Seeds(seeds) => self.pull_seeds(node, seeds),
            SessionEvent::Cancel => {
                debug!(target: "engine", peer = %node, "pulled cancel");
                {
                    let mut shared = self.shared.lock();
                    self.remove_node(&mut shared, node);
                }
                self.remove_session(node);
            }
            SessionEvent::Closed => self.session_closed(session),
        }
    }

    fn session_closed(&self, session: &Arc<PeerSession>) {
        let node = session.other_node();
        let mut shared = self.shared.lock();
        let current = shared
            .sessions
            .get(node)
            .map(|e| Arc::ptr_eq(&e.session, session))
            .unwrap_or(false);
        if !shared.removed.contains(node) {
            shared.cut.insert(node.clone());
        }
        if current {
            shared.forget_session(node);
            debug!(target: "engine", peer = %node, "session closed");
        }
    }

    fn pull_nodes(&self, from: &Node, nodes: Vec<Node>) {
        trace!(target: "engine", peer = %from, count = nodes.len(), "pulled nodes");
        let mut shared = self.shared.lock();
        let mut added = 0;
        for node in nodes.into_iter().take(self.config.max_node_count) {
            if !node.is_valid() || shared.removed.contains(&node) {
                continue;
            }
            shared.routing.add(node);
            added += 1;
        }
        bump(&self.counters.pulled_nodes, added);
    }

    fn pull_blocks_link(&self, from: &Node, keys: Vec<Key>) {
        let max = self.config.max_link_count;
        let added = self.peers.with(from, |s| {
            if over_budget(&s.pulled_blocks_link, max) {
                return 0;
            }
            let mut added = 0;
            for key in keys.into_iter().take(max).filter(Key::is_well_formed) {
                s.pulled_blocks_link.insert(key);
                added += 1;
            }
            added
        });
        trace!(target: "engine", peer = %from, added, "pulled block links");
        bump(&self.counters.pulled_block_links, added);
    }

    fn pull_blocks_request(&self, from: &Node, keys: Vec<Key>) {
        let max = self.config.max_request_count;
        let added = self.peers.with(from, |s| {
            if over_budget(&s.pulled_blocks_request, max) {
                return 0;
            }
            let mut added = 0;
            for key in keys.into_iter().take(max).filter(Key::is_well_formed) {
                s.pulled_blocks_request.insert(key);
                added += 1;
            }
            added
        });
        trace!(target: "engine", peer = %from, added, "pulled block requests");
        bump(&self.counters.pulled_block_requests, added);
    }

    fn pull_block(&self, from: &Node, key: Key, value: Vec<u8>) {
        if !key.is_well_formed() || value.is_empty() {
            return;
        }
        let len = value.len() as u64;
        if let Err(e) = self.store.put(&key, &value) {
            debug!(target: "engine", peer = %from, %key, %e, "dropping block");
            return;
        }
        let wanted = {
            let mut shared = self.shared.lock();
            let wanted = shared.download_blocks.remove(&key)
                || shared.sessions.keys().any(|n| {
                    self.peers
                        .peek(n, |s| s.pulled_blocks_request.contains(&key))
                        .unwrap_or(false)
                });
            if wanted {
                shared.relay_blocks.insert(key.clone());
            } else {
                shared.diffusion_requests.insert(key.clone());
            }
            wanted
        };
        let policy = self.policy;
        self.peers.with(from, |s| {
            if wanted {
                s.last_pull_time = Instant::now();
                s.increment_priority(&policy);
            }
            s.stock_blocks.insert(key.clone());
            s.received_bytes += len;
        });
        trace!(target: "engine", peer = %from, %key, wanted, "pulled block");
        bump(&self.counters.pulled_blocks, 1);
    }

    fn pull_seeds_request(&self, from: &Node, signatures: Vec<String>) {
        let max = self.config.max_seed_request_count;
        let accepted: Vec<String> = self.peers.with(from, |s| {
            if over_budget(&s.pulled_seeds_request, max) {
                return Vec::new();
            }
            let accepted: Vec<String> = signatures
                .into_iter()
                .take(max)
                .filter(|sig| !sig.is_empty() && sig.len() <= 256)
                .collect();
            s.pulled_seeds_request.extend(accepted.iter().cloned());
            accepted
        });
        if accepted.is_empty() {
            return;
        }
        let now = SystemTime::now();
        let mut shared = self.shared.lock();
        for signature in &accepted {
            shared.seeds.touch(signature, now);
        }
        bump(&self.counters.pulled_seed_requests, accepted.len());
    }

    fn pull_seeds(&self, from: &Node, seeds: Vec<Seed>) {
        let max = self.config.max_seed_count;
        let full = self
            .peers
            .with(from, |s| {
                let minutes = (crate::peer_state::STOCK_TTL.as_secs() / 60) as usize;
                s.stock_link_seeds.len() > max.saturating_mul(minutes)
                    || s.stock_store_seeds.len() > max.saturating_mul(minutes)
            });
        if full {
            return;
        }
        let now = SystemTime::now();
        let mut admitted: Vec<(SeedCategory, String, SystemTime)> = Vec::new();
        {
            let mut shared = self.shared.lock();
            for seed in seeds.iter().take(max) {
                let Some(signature) = seed.signature() else {
                    continue;
                };
                for category in [SeedCategory::Link, SeedCategory::Store] {
                    match shared.seeds.admit(category, seed, now) {
                        Ok(true) => {
                            admitted.push((category, signature.clone(), seed.creation_time));
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            debug!(target: "engine", peer = %from, %signature, %e, "seed rejected");
                            break;
                        }
                    }
                }
            }
        }
        let count = seeds.len().min(max);
        self.peers.with(from, |s| {
            for (category, signature, at) in admitted {
                match category {
                    SeedCategory::Link => s.stock_link_seeds.insert(signature, at),
                    SeedCategory::Store => s.stock_store_seeds.insert(signature, at),
                }
            }
        });
        bump(&self.counters.pulled_seeds, count);
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{engine_with, link, node, test_config, wait_until};
    use crate::identity::DigitalSignature;
    use crate::seeds::LINK_LABEL;
    use crate::store::BlockStore;
    use crate::types::{CodecParams, HashAlgorithm, Key, Node, Seed};

    #[test]
    fn pulled_nodes_feed_routing() {
        let (a, _) = engine_with(1, test_config());
        let (b, _) = engine_with(2, test_config());
        let (_sa, sb) = link(&a, &b);
        let good = node(9);
        let bad = Node::new(Vec::new(), vec!["mem:x".into()]);
        let no_address = Node::new(vec![8; 32], Vec::new());
        sb.push_nodes(vec![good.clone(), bad, no_address]).unwrap();
        assert!(wait_until(|| a.other_nodes().contains(&good)));
        assert_eq!(a.other_nodes().len(), 1);
    }

    #[test]
    fn unrequested_block_is_queued_for_diffusion() {
        let (a, store_a) = engine_with(1, test_config());
        let (b, _) = engine_with(2, test_config());
        let (_sa, sb) = link(&a, &b);
        let value = b"payload".to_vec();
        let key = Key::from_data(HashAlgorithm::Sha256, &value);
        sb.push_block(key.clone(), value).unwrap();
        assert!(wait_until(|| store_a.contains(&key)));
        assert!(wait_until(|| a.shared.lock().diffusion_requests.contains(&key)));
        assert_eq!(a.peers.peek(&node(2), |s| s.priority()), Some(0));
    }

    #[test]
    fn requested_block_rewards_sender() {
        let (a, store_a) = engine_with(1, test_config());
        let (b, _) = engine_with(2, test_config());
        let (_sa, sb) = link(&a, &b);
        let value = b"wanted".to_vec();
        let key = Key::from_data(HashAlgorithm::Sha256, &value);
        a.download(&key);
        sb.push_block(key.clone(), value).unwrap();
        assert!(wait_until(|| store_a.contains(&key)));
        assert!(wait_until(|| a.peers.peek(&node(2), |s| s.priority()) == Some(1)));
        assert!(!a.is_download_waiting(&key));
        assert_eq!(a.information().download_waiting, 0);
        assert!(!a.shared.lock().diffusion_requests.contains(&key));
    }

    #[test]
    fn corrupt_block_is_dropped() {
        let (a, store_a) = engine_with(1, test_config());
        let (b, _) = engine_with(2, test_config());
        let (_sa, sb) = link(&a, &b);
        let key = Key::from_data(HashAlgorithm::Sha256, b"real");
        sb.push_block(key.clone(), b"fake".to_vec()).unwrap();
        sb.push_blocks_link(vec![key.clone()]).unwrap();
        assert!(wait_until(|| a
            .peers
            .peek(&node(2), |s| s.pulled_blocks_link.contains(&key))
            .unwrap_or(false)));
        assert!(!store_a.contains(&key));
    }

    #[test]
    fn pulled_seeds_are_admitted_and_stocked() {
        let (a, _) = engine_with(1, test_config());
        let (b, _) = engine_with(2, test_config());
        let (_sa, sb) = link(&a, &b);
        let alice = DigitalSignature::generate("alice");
        let mut seed = Seed::new(LINK_LABEL, 0, 1, None, CodecParams::plain());
        alice.sign_seed(&mut seed).unwrap();
        let mut forged = seed.clone();
        forged.creation_time += std::time::Duration::from_secs(1);
        sb.push_seeds(vec![forged]).unwrap();
        sb.push_seeds(vec![seed.clone()]).unwrap();
        let signature = alice.signature();
        assert!(wait_until(|| a.link_seed(&signature).is_some()));
        assert_eq!(a.link_seed(&signature), Some(seed));
        assert!(a.store_seed(&signature).is_none());
        assert!(a
            .peers
            .peek(&node(2), |s| s.stock_link_seeds.get(&signature).is_some())
            .unwrap());
    }
}
