//! ExistenceIndex: incremental per-group presence tracking.
//!
//! Groups are registered with a reference count (several download items may
//! share one). Each registered group keeps a presence bit per key slot and a
//! running count, updated from block-store notifications, so the
//! "reconstructable?" question never rescans the store.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::store::StoreListener;
use crate::types::{Group, Key};

struct GroupEntry {
    group: Group,
    present: Vec<bool>,
    count: usize,
    refs: usize,
}

#[derive(Default)]
pub struct ExistenceIndex {
    ids: HashMap<Group, u64>,
    entries: HashMap<u64, GroupEntry>,
    /// key -> (group id, slot) for every registered slot holding that key.
    slots: HashMap<Key, Vec<(u64, usize)>>,
    next_id: u64,
}

impl ExistenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `group` (or add a reference), scanning presence with `is_present` on first registration.
    pub fn add(&mut self, group: &Group, is_present: impl Fn(&Key) -> bool) {
        if let Some(id) = self.ids.get(group) {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.refs += 1;
            }
            return;
        }
        let id = self.next_id;
        self.next_id += 1;
        let present: Vec<bool> = group.keys.iter().map(|k| is_present(k)).collect();
        let count = present.iter().filter(|p| **p).count();
        for (slot, key) in group.keys.iter().enumerate() {
            self.slots.entry(key.clone()).or_default().push((id, slot));
        }
        self.ids.insert(group.clone(), id);
        self.entries.insert(
            id,
            GroupEntry {
                group: group.clone(),
                present,
                count,
                refs: 1,
            },
        );
    }

    /// Drop one reference; the group is deregistered when none remain.
    pub fn remove(&mut self, group: &Group) {
        let Some(&id) = self.ids.get(group) else {
            return;
        };
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return;
        }
        if let Some(entry) = self.entries.remove(&id) {
            for key in &entry.group.keys {
                if let Some(list) = self.slots.get_mut(key) {
                    list.retain(|(gid, _)| *gid != id);
                    if list.is_empty() {
                        self.slots.remove(key);
                    }
                }
            }
        }
        self.ids.remove(group);
    }

    /// Record a block's arrival or departure.
    pub fn set(&mut self, key: &Key, present: bool) {
        let Some(list) = self.slots.get(key) else {
            return;
        };
        for &(id, slot) in list {
            if let Some(entry) = self.entries.get_mut(&id) {
                if entry.present[slot] != present {
                    entry.present[slot] = present;
                    if present {
                        entry.count += 1;
                    } else {
                        entry.count -= 1;
                    }
                }
            }
        }
    }

    /// Present-key count for a registered group.
    pub fn count(&self, group: &Group) -> Option<usize> {
        self.ids
            .get(group)
            .and_then(|id| self.entries.get(id))
            .map(|e| e.count)
    }

    pub fn is_reconstructable(&self, group: &Group) -> bool {
        self.count(group)
            .map(|c| c >= group.information_length)
            .unwrap_or(false)
    }

    /// Keys of a registered group whose presence equals `present`.
    pub fn keys(&self, group: &Group, present: bool) -> Vec<Key> {
        let Some(entry) = self.ids.get(group).and_then(|id| self.entries.get(id)) else {
            return Vec::new();
        };
        entry
            .group
            .keys
            .iter()
            .zip(&entry.present)
            .filter(|(_, p)| **p == present)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Re-scan one registered group against the store.
    pub fn refresh(&mut self, group: &Group, is_present: impl Fn(&Key) -> bool) {
        let Some(entry) = self.ids.get(group).and_then(|id| self.entries.get_mut(id)) else {
            return;
        };
        for (slot, key) in entry.group.keys.iter().enumerate() {
            entry.present[slot] = is_present(key);
        }
        entry.count = entry.present.iter().filter(|p| **p).count();
    }

    pub fn group_count(&self) -> usize {
        self.entries.len()
    }
}

/// Feeds store notifications into a shared index.
pub struct ExistenceListener(pub Arc<Mutex<ExistenceIndex>>);

impl StoreListener for ExistenceListener {
    fn on_block_added(&self, key: &Key) {
        self.0.lock().set(key, true);
    }

    fn on_block_removed(&self, key: &Key) {
        self.0.lock().set(key, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CorrectionAlgorithm, HashAlgorithm};
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn key(i: u8) -> Key {
        Key::from_data(HashAlgorithm::Sha256, &[i])
    }

    fn group(range: std::ops::Range<u8>, info: usize) -> Group {
        Group {
            keys: range.map(key).collect(),
            information_length: info,
            block_length: 1,
            length: info as u64,
            correction: CorrectionAlgorithm::ReedSolomon8,
        }
    }

    #[test]
    fn threshold_reached_incrementally() {
        let mut index = ExistenceIndex::new();
        let g = group(0..4, 3);
        index.add(&g, |_| false);
        assert!(!index.is_reconstructable(&g));
        index.set(&key(0), true);
        index.set(&key(3), true);
        assert_eq!(index.count(&g), Some(2));
        index.set(&key(3), true);
        assert_eq!(index.count(&g), Some(2));
        index.set(&key(1), true);
        assert!(index.is_reconstructable(&g));
        assert_eq!(index.keys(&g, false), vec![key(2)]);
    }

    #[test]
    fn shared_group_deregisters_on_last_reference() {
        let mut index = ExistenceIndex::new();
        let g = group(0..3, 2);
        index.add(&g, |_| false);
        index.add(&g, |_| false);
        index.remove(&g);
        assert_eq!(index.group_count(), 1);
        index.remove(&g);
        assert_eq!(index.group_count(), 0);
        assert_eq!(index.count(&g), None);
        index.set(&key(0), true);
    }

    #[test]
    fn overlapping_groups_both_update() {
        let mut index = ExistenceIndex::new();
        let a = group(0..4, 2);
        let b = group(2..6, 2);
        index.add(&a, |_| false);
        index.add(&b, |_| false);
        index.set(&key(2), true);
        assert_eq!(index.count(&a), Some(1));
        assert_eq!(index.count(&b), Some(1));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8),
        Remove(u8),
        Register(u8),
        Unregister(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..16).prop_map(Op::Add),
            (0u8..16).prop_map(Op::Remove),
            (0u8..3).prop_map(Op::Register),
            (0u8..3).prop_map(Op::Unregister),
        ]
    }

    proptest! {
        #[test]
        fn count_matches_true_scan(ops in proptest::collection::vec(op(), 1..200)) {
            let groups = [group(0..8, 5), group(4..12, 6), group(8..16, 3)];
            let mut refs = [0usize; 3];
            let mut present: HashSet<Key> = HashSet::new();
            let mut index = ExistenceIndex::new();
            for op in ops {
                match op {
                    Op::Add(i) => { present.insert(key(i)); index.set(&key(i), true); }
                    Op::Remove(i) => { present.remove(&key(i)); index.set(&key(i), false); }
                    Op::Register(g) => {
                        index.add(&groups[g as usize], |k| present.contains(k));
                        refs[g as usize] += 1;
                    }
                    Op::Unregister(g) => {
                        if refs[g as usize] > 0 {
                            index.remove(&groups[g as usize]);
                            refs[g as usize] -= 1;
                        }
                    }
                }
                for (g, group) in groups.iter().enumerate() {
                    let scan = group.keys.iter().filter(|k| present.contains(*k)).count();
                    if refs[g] > 0 {
                        prop_assert_eq!(index.count(group), Some(scan));
                        prop_assert_eq!(index.is_reconstructable(group), scan >= group.information_length);
                    } else {
                        prop_assert_eq!(index.count(group), None);
                    }
                }
            }
        }
    }
}
