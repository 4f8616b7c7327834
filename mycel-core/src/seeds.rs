//! Signed seed tables for the two gossip categories (link and store).
//!
//! A seed's category is carried in its name label. Each table keeps the
//! newest certified seed per publisher signature.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::identity::{verify_seed, CertificateError};
use crate::types::Seed;

pub const LINK_LABEL: &str = "_link_";
pub const STORE_LABEL: &str = "_store_";
/// Seeds dated further ahead than this are refused.
pub const MAX_FUTURE_SKEW: Duration = Duration::from_secs(30 * 60);
/// Signatures kept by pruning, besides trust-locked ones.
pub const MAX_TRACKED_SIGNATURES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeedCategory {
    Link,
    Store,
}

impl SeedCategory {
    pub fn label(self) -> &'static str {
        match self {
            SeedCategory::Link => LINK_LABEL,
            SeedCategory::Store => STORE_LABEL,
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            LINK_LABEL => Some(SeedCategory::Link),
            STORE_LABEL => Some(SeedCategory::Store),
            _ => None,
        }
    }
}

/// Publisher's trust list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPayload {
    pub trust_signatures: Vec<String>,
}

/// Publisher's shared content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorePayload {
    pub seeds: Vec<Seed>,
}

/// Content of a categorized seed, tagged explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipPayload {
    Link(LinkPayload),
    Store(StorePayload),
}

impl GossipPayload {
    pub fn category(&self) -> SeedCategory {
        match self {
            GossipPayload::Link(_) => SeedCategory::Link,
            GossipPayload::Store(_) => SeedCategory::Store,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Newest seed per signature for each category, plus access times for pruning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedTable {
    link: HashMap<String, Seed>,
    store: HashMap<String, Seed>,
    last_access: HashMap<String, SystemTime>,
}

impl SeedTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, category: SeedCategory) -> &HashMap<String, Seed> {
        match category {
            SeedCategory::Link => &self.link,
            SeedCategory::Store => &self.store,
        }
    }

    fn table_mut(&mut self, category: SeedCategory) -> &mut HashMap<String, Seed> {
        match category {
            SeedCategory::Link => &mut self.link,
            SeedCategory::Store => &mut self.store,
        }
    }

    /// Offer `seed` to the `category` table.
    ///
    /// Returns `Ok(false)` when the seed does not belong to the category, is
    /// dated too far ahead, or is older than the stored one. The certificate is
    /// checked only when the seed would actually be stored.
    pub fn admit(
        &mut self,
        category: SeedCategory,
        seed: &Seed,
        now: SystemTime,
    ) -> Result<bool, CertificateError> {
        if SeedCategory::from_label(&seed.name) != Some(category) {
            return Ok(false);
        }
        if let Ok(ahead) = seed.creation_time.duration_since(now) {
            if ahead > MAX_FUTURE_SKEW {
                return Ok(false);
            }
        }
        let signature = seed.signature().ok_or(CertificateError::Missing)?;
        if let Some(current) = self.table(category).get(&signature) {
            if current.creation_time > seed.creation_time {
                return Ok(false);
            }
            if current.creation_time == seed.creation_time {
                self.touch(&signature, now);
                return Ok(true);
            }
        }
        verify_seed(seed)?;
        self.table_mut(category).insert(signature.clone(), seed.clone());
        self.touch(&signature, now);
        Ok(true)
    }

    pub fn get(&self, category: SeedCategory, signature: &str) -> Option<&Seed> {
        self.table(category).get(signature)
    }

    pub fn touch(&mut self, signature: &str, now: SystemTime) {
        self.last_access.insert(signature.to_string(), now);
    }

    /// Every signature holding a seed in either table.
    pub fn signatures(&self) -> Vec<String> {
        let mut all: HashSet<&String> = self.link.keys().collect();
        all.extend(self.store.keys());
        all.into_iter().cloned().collect()
    }

    pub fn len(&self, category: SeedCategory) -> usize {
        self.table(category).len()
    }

    /// Keep the `keep` most recently accessed signatures plus `locked`; returns how many were dropped.
    pub fn prune(&mut self, keep: usize, locked: &HashSet<String>) -> usize {
        let mut candidates: Vec<(String, SystemTime)> = self
            .signatures()
            .into_iter()
            .filter(|s| !locked.contains(s))
            .map(|s| {
                let at = self.last_access.get(&s).copied().unwrap_or(SystemTime::UNIX_EPOCH);
                (s, at)
            })
            .collect();
        if candidates.len() <= keep {
            return 0;
        }
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let dropped: Vec<String> = candidates.split_off(keep).into_iter().map(|(s, _)| s).collect();
        for signature in &dropped {
            self.link.remove(signature);
            self.store.remove(signature);
            self.last_access.remove(signature);
        }
        dropped.len()
    }

    /// Drop any stored seed whose certificate no longer verifies. Returns the number dropped.
    pub fn verify_all(&mut self) -> usize {
        let mut dropped = 0;
        for table in [&mut self.link, &mut self.store] {
            table.retain(|signature, seed| {
                let ok = seed.signature().as_deref() == Some(signature.as_str()) && verify_seed(seed).is_ok();
                if !ok {
                    debug!(target: "engine", %signature, "dropping unverifiable seed");
                    dropped += 1;
                }
                ok
            });
        }
        let link = &self.link;
        let store = &self.store;
        self.last_access
            .retain(|s, _| link.contains_key(s) || store.contains_key(s));
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DigitalSignature;
    use crate::types::CodecParams;

    fn signed(signer: &DigitalSignature, label: &str, at: SystemTime) -> Seed {
        let mut seed = Seed::new(label, 0, 1, None, CodecParams::plain());
        seed.creation_time = at;
        signer.sign_seed(&mut seed).unwrap();
        seed
    }

    #[test]
    fn newer_wins_regardless_of_order() {
        let alice = DigitalSignature::generate("alice");
        let now = SystemTime::now();
        let t1 = signed(&alice, LINK_LABEL, now - Duration::from_secs(60));
        let t2 = signed(&alice, LINK_LABEL, now);

        let mut forward = SeedTable::new();
        assert!(forward.admit(SeedCategory::Link, &t1, now).unwrap());
        assert!(forward.admit(SeedCategory::Link, &t2, now).unwrap());
        assert_eq!(forward.get(SeedCategory::Link, &alice.signature()), Some(&t2));

        let mut backward = SeedTable::new();
        assert!(backward.admit(SeedCategory::Link, &t2, now).unwrap());
        assert!(!backward.admit(SeedCategory::Link, &t1, now).unwrap());
        assert_eq!(backward.get(SeedCategory::Link, &alice.signature()), Some(&t2));
    }

    #[test]
    fn label_must_match_category() {
        let alice = DigitalSignature::generate("alice");
        let now = SystemTime::now();
        let seed = signed(&alice, STORE_LABEL, now);
        let mut table = SeedTable::new();
        assert!(!table.admit(SeedCategory::Link, &seed, now).unwrap());
        assert!(table.admit(SeedCategory::Store, &seed, now).unwrap());
        assert!(table.get(SeedCategory::Link, &alice.signature()).is_none());
    }

    #[test]
    fn far_future_rejected() {
        let alice = DigitalSignature::generate("alice");
        let now = SystemTime::now();
        let seed = signed(&alice, LINK_LABEL, now + Duration::from_secs(3600));
        let mut table = SeedTable::new();
        assert!(!table.admit(SeedCategory::Link, &seed, now).unwrap());
    }

    #[test]
    fn tampered_seed_is_a_certificate_error() {
        let alice = DigitalSignature::generate("alice");
        let now = SystemTime::now();
        let mut seed = signed(&alice, LINK_LABEL, now);
        seed.length = 99;
        let mut table = SeedTable::new();
        assert_eq!(
            table.admit(SeedCategory::Link, &seed, now),
            Err(CertificateError::BadSignature)
        );
        let unsigned = Seed::new(LINK_LABEL, 0, 1, None, CodecParams::plain());
        assert_eq!(
            table.admit(SeedCategory::Link, &unsigned, now),
            Err(CertificateError::Missing)
        );
    }

    #[test]
    fn prune_keeps_recent_and_locked() {
        let now = SystemTime::now();
        let mut table = SeedTable::new();
        let signers: Vec<DigitalSignature> =
            (0..5).map(|i| DigitalSignature::generate(format!("n{}", i))).collect();
        for (i, s) in signers.iter().enumerate() {
            let at = now - Duration::from_secs(100 - i as u64);
            table.admit(SeedCategory::Link, &signed(s, LINK_LABEL, at), at).unwrap();
        }
        let locked: HashSet<String> = [signers[0].signature()].into_iter().collect();
        assert_eq!(table.prune(2, &locked), 2);
        let kept: HashSet<String> = table.signatures().into_iter().collect();
        assert!(kept.contains(&signers[0].signature()));
        assert!(kept.contains(&signers[4].signature()));
        assert!(kept.contains(&signers[3].signature()));
        assert_eq!(kept.len(), 3);
    }

    #[test]
    fn payload_carries_its_category() {
        let payload = GossipPayload::Link(LinkPayload {
            trust_signatures: vec!["bob@00".into()],
        });
        let bytes = payload.to_bytes().unwrap();
        let back = GossipPayload::from_bytes(&bytes).unwrap();
        assert_eq!(back.category(), SeedCategory::Link);
        assert_eq!(back, payload);
    }
}
