//! Kademlia routing table and XOR-distance search.

use std::cmp::Ordering;

use rand::seq::SliceRandom;

use crate::types::Node;

/// Bucket count: one per bit of a 32-byte id.
pub const BUCKET_COUNT: usize = 256;
/// Nodes kept per bucket.
pub const BUCKET_SIZE: usize = 20;

/// Byte-wise XOR of two ids, right-padded with zeros to the longer length.
pub fn xor_distance(a: &[u8], b: &[u8]) -> Vec<u8> {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| a.get(i).copied().unwrap_or(0) ^ b.get(i).copied().unwrap_or(0))
        .collect()
}

fn compare_distance(target: &[u8], a: &Node, b: &Node) -> Ordering {
    xor_distance(target, &a.id)
        .cmp(&xor_distance(target, &b.id))
        .then_with(|| a.id.cmp(&b.id))
}

/// The `count` candidates nearest to `target`, ascending by XOR distance, ties by id bytes.
pub fn search(target: &[u8], candidates: &[Node], count: usize) -> Vec<Node> {
    let mut sorted: Vec<&Node> = candidates.iter().collect();
    sorted.sort_by(|a, b| compare_distance(target, a, b));
    sorted.dedup_by(|a, b| a.id == b.id);
    sorted.into_iter().take(count).cloned().collect()
}

/// Like `search`, but only candidates strictly nearer to `target` than `base_id`.
pub fn search_closer_than(target: &[u8], base_id: &[u8], candidates: &[Node], count: usize) -> Vec<Node> {
    let own = xor_distance(target, base_id);
    let nearer: Vec<Node> = candidates
        .iter()
        .filter(|n| xor_distance(target, &n.id) < own)
        .cloned()
        .collect();
    search(target, &nearer, count)
}

/// Index of the highest differing bit between two ids (0 = most significant).
fn bucket_index(base: &[u8], id: &[u8]) -> Option<usize> {
    let d = xor_distance(base, id);
    for (i, byte) in d.iter().enumerate() {
        if *byte != 0 {
            let bit = i * 8 + byte.leading_zeros() as usize;
            return Some(bit.min(BUCKET_COUNT - 1));
        }
    }
    None
}

/// Known peers bucketed by distance from the base node.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    base_node: Node,
    /// Each bucket is ordered least- to most-recently seen.
    buckets: Vec<Vec<Node>>,
}

impl RoutingTable {
    pub fn new(base_node: Node) -> Self {
        Self {
            base_node,
            buckets: vec![Vec::new(); BUCKET_COUNT],
        }
    }

    pub fn base_node(&self) -> &Node {
        &self.base_node
    }

    /// Replace the base node and re-bucket everything known.
    pub fn set_base_node(&mut self, base_node: Node) {
        let nodes = self.to_vec();
        self.base_node = base_node;
        self.buckets = vec![Vec::new(); BUCKET_COUNT];
        for node in nodes {
            self.add(node);
        }
    }

    /// Insert if there is room. Existing entries get their addresses refreshed.
    pub fn add(&mut self, node: Node) -> bool {
        let Some(index) = bucket_index(&self.base_node.id, &node.id) else {
            return false;
        };
        let bucket = &mut self.buckets[index];
        if let Some(existing) = bucket.iter_mut().find(|n| n.id == node.id) {
            existing.addresses = node.addresses;
            return true;
        }
        if bucket.len() >= BUCKET_SIZE {
            return false;
        }
        bucket.push(node);
        true
    }

    /// Mark as recently seen, inserting (evicting the stalest) when needed.
    pub fn live(&mut self, node: Node) {
        let Some(index) = bucket_index(&self.base_node.id, &node.id) else {
            return;
        };
        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket.iter().position(|n| n.id == node.id) {
            bucket.remove(pos);
        } else if bucket.len() >= BUCKET_SIZE {
            bucket.remove(0);
        }
        bucket.push(node);
    }

    pub fn remove(&mut self, node: &Node) -> bool {
        let Some(index) = bucket_index(&self.base_node.id, &node.id) else {
            return false;
        };
        let bucket = &mut self.buckets[index];
        match bucket.iter().position(|n| n.id == node.id) {
            Some(pos) => {
                bucket.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, node: &Node) -> bool {
        bucket_index(&self.base_node.id, &node.id)
            .map(|i| self.buckets[i].iter().any(|n| n.id == node.id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<Node> {
        self.buckets.iter().flatten().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.buckets.iter().flatten()
    }

    /// Nearest known nodes to `target`.
    pub fn search(&self, target: &[u8], count: usize) -> Vec<Node> {
        search(target, &self.to_vec(), count)
    }

    /// A uniformly random known node not rejected by `skip`.
    pub fn random<R: rand::Rng>(&self, rng: &mut R, skip: impl Fn(&Node) -> bool) -> Option<Node> {
        let eligible: Vec<&Node> = self.iter().filter(|n| !skip(n)).collect();
        eligible.choose(rng).map(|n| (*n).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn node(id: &[u8]) -> Node {
        let mut full = vec![0u8; 32];
        full[..id.len()].copy_from_slice(id);
        Node::new(full, vec!["mem:x".into()])
    }

    #[test]
    fn search_orders_by_distance_with_id_tiebreak() {
        let target = [0u8; 32];
        let peers = vec![node(&[3]), node(&[1]), node(&[2]), node(&[0, 1])];
        let found = search(&target, &peers, 3);
        let ids: Vec<u8> = found.iter().map(|n| n.id[0]).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(found[0].id[1], 1);
    }

    #[test]
    fn search_returns_min_of_k_and_len() {
        let target = [7u8; 32];
        let peers = vec![node(&[1]), node(&[2])];
        assert_eq!(search(&target, &peers, 5).len(), 2);
        assert_eq!(search(&target, &peers, 1).len(), 1);
        assert!(search(&target, &[], 3).is_empty());
    }

    #[test]
    fn search_is_deterministic() {
        let target = [0x5au8; 32];
        let peers: Vec<Node> = (0..50u8).map(|i| node(&[i, i.wrapping_mul(7)])).collect();
        let mut shuffled = peers.clone();
        shuffled.reverse();
        assert_eq!(search(&target, &peers, 10), search(&target, &shuffled, 10));
        let a: Vec<Vec<u8>> = search(&target, &peers, 10).into_iter().map(|n| n.id).collect();
        let b: Vec<Vec<u8>> = search(&target, &peers, 10).into_iter().map(|n| n.id).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn closer_than_base_filters() {
        let target = [0u8; 32];
        let base = node(&[2]);
        let peers = vec![node(&[1]), node(&[3]), node(&[4])];
        let found = search_closer_than(&target, &base.id, &peers, 3);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id[0], 1);
    }

    #[test]
    fn table_add_live_remove() {
        let mut table = RoutingTable::new(node(&[0xff]));
        assert!(!table.add(node(&[0xff])));
        assert!(table.add(node(&[1])));
        assert!(table.add(node(&[2])));
        assert_eq!(table.len(), 2);
        table.live(node(&[3]));
        assert!(table.contains(&node(&[3])));
        assert!(table.remove(&node(&[1])));
        assert!(!table.remove(&node(&[1])));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn bucket_capacity_respected() {
        let mut table = RoutingTable::new(node(&[0]));
        // All of these share the top bit, landing in bucket 0.
        for i in 0..(BUCKET_SIZE as u8 + 5) {
            table.add(node(&[0x80, i]));
        }
        assert_eq!(table.len(), BUCKET_SIZE);
        table.live(node(&[0x80, 200]));
        assert_eq!(table.len(), BUCKET_SIZE);
        assert!(table.contains(&node(&[0x80, 200])));
        assert!(!table.contains(&node(&[0x80, 0])));
    }

    #[test]
    fn random_respects_skip() {
        let mut table = RoutingTable::new(node(&[0]));
        table.add(node(&[1]));
        table.add(node(&[2]));
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..10 {
            let n = table.random(&mut rng, |n| n.id[0] == 1).unwrap();
            assert_eq!(n.id[0], 2);
        }
        assert!(table.random(&mut rng, |_| true).is_none());
    }
}
