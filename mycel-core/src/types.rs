//! Content-addressing data model: keys, groups, indexes, seeds and node descriptors.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::identity::Certificate;

/// Maximum length of a node id in bytes.
pub const MAX_NODE_ID_LEN: usize = 32;
/// Maximum number of addresses carried by a node descriptor.
pub const MAX_NODE_ADDRESSES: usize = 32;
/// Maximum length of a single address string.
pub const MAX_ADDRESS_LEN: usize = 256;

/// Hash algorithm used to derive a block's content address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Sha256,
}

impl HashAlgorithm {
    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

/// Content address of one block: hash algorithm tag plus digest bytes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    algorithm: HashAlgorithm,
    digest: Vec<u8>,
}

impl Key {
    pub fn new(algorithm: HashAlgorithm, digest: Vec<u8>) -> Self {
        Self { algorithm, digest }
    }

    /// Address `data` with `algorithm`.
    pub fn from_data(algorithm: HashAlgorithm, data: &[u8]) -> Self {
        Self::new(algorithm, algorithm.digest(data))
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// Digest length matches the algorithm.
    pub fn is_well_formed(&self) -> bool {
        self.digest.len() == self.algorithm.digest_len()
    }

    /// True when `data` hashes to this key.
    pub fn matches(&self, data: &[u8]) -> bool {
        self.algorithm.digest(data) == self.digest
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.digest.len().min(8);
        write!(f, "{}", hex::encode(&self.digest[..n]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    None,
    Snappy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CryptoAlgorithm {
    None,
    ChaCha20Poly1305,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CorrectionAlgorithm {
    None,
    ReedSolomon8,
}

/// Parameters needed to turn a layer's concatenated block payload back into bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodecParams {
    pub compression: CompressionAlgorithm,
    pub crypto: CryptoAlgorithm,
    pub crypto_key: Vec<u8>,
}

impl CodecParams {
    pub fn plain() -> Self {
        Self {
            compression: CompressionAlgorithm::None,
            crypto: CryptoAlgorithm::None,
            crypto_key: Vec::new(),
        }
    }
}

/// One erasure-coded stripe: data shares followed by parity shares.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Group {
    pub keys: Vec<Key>,
    /// Number of data shares needed to reconstruct.
    pub information_length: usize,
    pub block_length: usize,
    /// Total original byte length of the data shares.
    pub length: u64,
    pub correction: CorrectionAlgorithm,
}

impl Group {
    pub fn is_valid(&self) -> bool {
        self.information_length > 0 && self.information_length <= self.keys.len()
    }

    /// Systematic (data) keys, in order.
    pub fn data_keys(&self) -> &[Key] {
        &self.keys[..self.information_length.min(self.keys.len())]
    }
}

/// One tree layer above raw blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub groups: Vec<Group>,
    pub params: CodecParams,
}

impl Index {
    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.groups.iter().flat_map(|g| g.keys.iter())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Published root descriptor for one piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed {
    /// Content name, or a category label for gossip payloads.
    pub name: String,
    pub length: u64,
    pub creation_time: SystemTime,
    /// Number of layers between the root key and the content bytes.
    pub rank: u32,
    /// None for empty content.
    pub key: Option<Key>,
    pub params: CodecParams,
    pub certificate: Option<Certificate>,
}

/// The certified part of a seed.
#[derive(Serialize)]
struct SeedBody<'a> {
    name: &'a str,
    length: u64,
    creation_time: SystemTime,
    rank: u32,
    key: &'a Option<Key>,
    params: &'a CodecParams,
}

impl Seed {
    pub fn new(name: impl Into<String>, length: u64, rank: u32, key: Option<Key>, params: CodecParams) -> Self {
        Self {
            name: name.into(),
            length,
            creation_time: SystemTime::now(),
            rank,
            key,
            params,
            certificate: None,
        }
    }

    /// Bytes covered by the certificate (everything except the certificate).
    pub fn signing_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(&SeedBody {
            name: &self.name,
            length: self.length,
            creation_time: self.creation_time,
            rank: self.rank,
            key: &self.key,
            params: &self.params,
        })
    }

    /// Publisher signature string, if certified.
    pub fn signature(&self) -> Option<String> {
        self.certificate.as_ref().map(|c| c.signature())
    }
}

/// Peer descriptor. Identity is the id bytes; addresses do not take part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Vec<u8>,
    pub addresses: Vec<String>,
}

impl Node {
    pub fn new(id: Vec<u8>, addresses: Vec<String>) -> Self {
        Self { id, addresses }
    }

    /// Random 32-byte id with the given addresses.
    pub fn random(addresses: Vec<String>) -> Self {
        use rand::RngCore;
        let mut id = vec![0u8; MAX_NODE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut id);
        Self { id, addresses }
    }

    /// Non-empty id within bounds and at least one usable address.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty()
            && self.id.len() <= MAX_NODE_ID_LEN
            && !self.addresses.is_empty()
            && self.addresses.len() <= MAX_NODE_ADDRESSES
            && self
                .addresses
                .iter()
                .all(|a| !a.is_empty() && a.len() <= MAX_ADDRESS_LEN)
    }

    pub fn short_id(&self) -> String {
        hex::encode(&self.id[..self.id.len().min(6)])
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_matches_its_data() {
        let key = Key::from_data(HashAlgorithm::Sha256, b"block");
        assert!(key.is_well_formed());
        assert!(key.matches(b"block"));
        assert!(!key.matches(b"other"));
    }

    #[test]
    fn malformed_key_detected() {
        let key = Key::new(HashAlgorithm::Sha256, vec![1, 2, 3]);
        assert!(!key.is_well_formed());
    }

    #[test]
    fn node_equality_ignores_addresses() {
        let a = Node::new(vec![1; 32], vec!["tcp:10.0.0.1:4000".into()]);
        let b = Node::new(vec![1; 32], vec!["tcp:10.0.0.2:4000".into()]);
        assert_eq!(a, b);
        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn node_validation() {
        assert!(Node::random(vec!["tcp:127.0.0.1:1".into()]).is_valid());
        assert!(!Node::random(Vec::new()).is_valid());
        assert!(!Node::new(Vec::new(), vec!["a".into()]).is_valid());
        assert!(!Node::new(vec![0; 33], vec!["a".into()]).is_valid());
    }

    #[test]
    fn group_validity() {
        let keys: Vec<Key> = (0..4u8)
            .map(|i| Key::from_data(HashAlgorithm::Sha256, &[i]))
            .collect();
        let mut group = Group {
            keys,
            information_length: 3,
            block_length: 16,
            length: 40,
            correction: CorrectionAlgorithm::ReedSolomon8,
        };
        assert!(group.is_valid());
        assert_eq!(group.data_keys().len(), 3);
        group.information_length = 5;
        assert!(!group.is_valid());
    }

    #[test]
    fn seed_signing_bytes_exclude_certificate() {
        let seed = Seed::new("a", 1, 1, None, CodecParams::plain());
        let before = seed.signing_bytes().unwrap();
        let mut signed = seed.clone();
        crate::identity::DigitalSignature::generate("alice")
            .sign_seed(&mut signed)
            .unwrap();
        assert!(signed.certificate.is_some());
        assert_eq!(before, signed.signing_bytes().unwrap());
    }
}
