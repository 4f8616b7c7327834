//! Outbound dialing and inbound accepting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::IteratorRandom;
use tracing::{debug, trace, warn};

use super::{bump, GossipEngine};
use crate::session::{PeerSession, SessionDirection, HANDSHAKE_TIMEOUT};
use crate::types::Node;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_POLL: Duration = Duration::from_secs(1);

impl GossipEngine {
    /// Try to open one outbound session. Recently cut peers are retried first,
    /// then a random routing entry. Returns true if a session was added.
    pub fn tick_connect(self: &Arc<Self>, now: Instant) -> bool {
        let candidate = {
            let mut shared = self.shared.lock();
            if shared.count(SessionDirection::Outbound) >= self.config.outbound_limit()
                || shared.sessions.len() >= shared.connection_limit
            {
                return false;
            }
            shared.waiting.trim_at(now);
            let base_id = shared.routing.base_node().id.clone();
            let skip = |n: &Node| {
                n.id == base_id
                    || shared.sessions.contains_key(n)
                    || shared.connecting.contains(n)
                    || shared.waiting.contains(n)
                    || shared.removed.contains(n)
            };
            let mut rng = self.rng.lock();
            let picked = shared
                .cut
                .iter()
                .filter(|n| !skip(*n))
                .choose(&mut *rng)
                .cloned()
                .or_else(|| shared.routing.random(&mut *rng, &skip));
            drop(rng);
            let Some(node) = picked else {
                return false;
            };
            shared.connecting.insert(node.clone());
            node
        };

        let session = self.dial(&candidate);
        let added = match session {
            Some((session, address)) => {
                {
                    let mut shared = self.shared.lock();
                    shared.succeeded_addresses.insert(address);
                    shared.routing.live(candidate.clone());
                    shared.cut.remove(&candidate);
                }
                let added = self.add_session(session);
                if added {
                    bump(&self.counters.created_connections, 1);
                }
                added
            }
            None => {
                self.shared.lock().waiting.insert(candidate.clone());
                false
            }
        };
        self.shared.lock().connecting.remove(&candidate);
        added
    }

    /// Dial each of the node's addresses until one handshakes as that node.
    fn dial(&self, node: &Node) -> Option<(Arc<PeerSession>, String)> {
        let base = self.base_node();
        for address in node.addresses.iter().take(self.config.addresses_per_node) {
            let connection = match self.network.dialer.dial(address, DIAL_TIMEOUT) {
                Ok(c) => c,
                Err(e) => {
                    trace!(target: "engine", peer = %node, %address, %e, "dial failed");
                    continue;
                }
            };
            match PeerSession::connect(connection, SessionDirection::Outbound, &base, HANDSHAKE_TIMEOUT) {
                Ok(session) if session.other_node().id == node.id => {
                    return Some((session, address.clone()));
                }
                Ok(session) => {
                    debug!(target: "engine", peer = %node, %address, got = %session.other_node(), "unexpected node at address");
                    session.close();
                }
                Err(e) => {
                    trace!(target: "engine", peer = %node, %address, %e, "handshake failed");
                }
            }
        }
        None
    }

    /// Wait briefly for one inbound connection and admit it.
    pub fn tick_accept(self: &Arc<Self>) -> bool {
        let Some(listener) = self.network.listener.as_ref() else {
            return false;
        };
        let connection = match listener.accept(ACCEPT_POLL) {
            Ok(Some(c)) => c,
            Ok(None) => return false,
            Err(e) => {
                warn!(target: "engine", %e, "accept failed");
                std::thread::sleep(ACCEPT_POLL);
                return false;
            }
        };
        let full = {
            let shared = self.shared.lock();
            shared.count(SessionDirection::Inbound) >= self.config.inbound_limit()
                || shared.sessions.len() >= shared.connection_limit
        };
        if full {
            trace!(target: "engine", "inbound limit reached, dropping connection");
            connection.close();
            return false;
        }
        let base = self.base_node();
        let session = match PeerSession::connect(connection, SessionDirection::Inbound, &base, HANDSHAKE_TIMEOUT) {
            Ok(s) => s,
            Err(e) => {
                debug!(target: "engine", %e, "inbound handshake failed");
                return false;
            }
        };
        if self.shared.lock().removed.contains(session.other_node()) {
            debug!(target: "engine", peer = %session.other_node(), "refusing removed peer");
            session.close();
            return false;
        }
        let added = self.add_session(session);
        if added {
            bump(&self.counters.accepted_connections, 1);
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::super::tests::{node, test_config, wait_until};
    use super::super::{GossipEngine, Network};
    use crate::config::EngineConfig;
    use crate::store::MemoryBlockStore;
    use crate::transport::{BandwidthLimit, MemoryNetwork};

    fn listening(net: &MemoryNetwork, tag: u8, config: EngineConfig) -> Arc<GossipEngine> {
        let address = format!("mem:{}", tag);
        GossipEngine::new(
            node(tag),
            config,
            Arc::new(MemoryBlockStore::new()),
            Network {
                dialer: Arc::new(net.dialer(&address)),
                listener: Some(Arc::new(net.listen(&address))),
                bandwidth: Arc::new(BandwidthLimit::new(0)),
            },
        )
    }

    #[test]
    fn dials_known_node_and_peer_accepts() {
        let net = MemoryNetwork::new();
        let a = listening(&net, 1, test_config());
        let b = listening(&net, 2, test_config());
        a.set_other_nodes([node(2)]);

        let acceptor = b.clone();
        let t = std::thread::spawn(move || acceptor.tick_accept());
        assert!(a.tick_connect(Instant::now()));
        assert!(t.join().unwrap());
        assert_eq!(a.connected_nodes(), vec![node(2)]);
        assert!(wait_until(|| b.connected_nodes() == vec![node(1)]));
        let info = a.information();
        assert_eq!(info.created_connections, 1);
        assert_eq!(info.outbound, 1);
        assert_eq!(b.information().accepted_connections, 1);
    }

    #[test]
    fn unreachable_node_waits() {
        let net = MemoryNetwork::new();
        let a = listening(&net, 1, test_config());
        a.set_other_nodes([node(9)]);
        let now = Instant::now();
        assert!(!a.tick_connect(now));
        assert!(a.shared.lock().waiting.contains(&node(9)));
        assert!(!a.tick_connect(now));
        assert!(a.shared.lock().connecting.is_empty());
    }

    #[test]
    fn outbound_limit_stops_dialing() {
        let net = MemoryNetwork::new();
        let config = EngineConfig {
            connection_limit: 1,
            ..test_config()
        };
        let a = listening(&net, 1, config);
        let _b = listening(&net, 2, test_config());
        a.set_other_nodes([node(2)]);
        assert!(!a.tick_connect(Instant::now()));
        assert!(!a.shared.lock().waiting.contains(&node(2)));
    }

    #[test]
    fn accept_without_listener_is_noop() {
        let (a, _) = super::super::tests::engine_with(1, test_config());
        assert!(!a.tick_accept());
    }
}
