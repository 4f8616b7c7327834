//! Content-addressed block storage with pin counts, layer codec and erasure coding.

mod codec;
mod erasure;
mod memory;

use std::io::{Read, Write};
use std::sync::Arc;

use crate::cancel::Cancellation;
use crate::types::{CodecParams, CorrectionAlgorithm, Group, HashAlgorithm, Key};

pub use memory::{BlockDump, MemoryBlockStore};

/// Largest data-share count per erasure group.
pub const MAX_GROUP_DATA_SHARES: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("block {0} not found")]
    NotFound(Key),
    #[error("block {0} does not match its key")]
    HashMismatch(Key),
    #[error("block {0} is not locked")]
    NotLocked(Key),
    #[error("block {0} is locked")]
    Locked(Key),
    #[error("operation cancelled")]
    Cancelled,
    #[error("not enough shares to reconstruct group ({present} of {needed})")]
    Insufficient { present: usize, needed: usize },
    #[error("invalid group: {0}")]
    InvalidGroup(&'static str),
    #[error("erasure coding: {0}")]
    Erasure(String),
    #[error("codec: {0}")]
    Codec(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters for stream-encoding one layer.
#[derive(Debug, Clone)]
pub struct EncodeParams {
    pub codec: CodecParams,
    pub block_length: usize,
    pub hash: HashAlgorithm,
}

/// Notified when blocks enter or leave the store. Called outside the store lock.
pub trait StoreListener: Send + Sync {
    fn on_block_added(&self, key: &Key);
    fn on_block_removed(&self, key: &Key);
}

pub trait BlockStore: Send + Sync {
    fn contains(&self, key: &Key) -> bool;
    fn get(&self, key: &Key) -> Result<Vec<u8>, StoreError>;
    /// Stores `value` under `key`; the value must hash to the key.
    fn put(&self, key: &Key, value: &[u8]) -> Result<(), StoreError>;
    /// Evict an unpinned block.
    fn remove(&self, key: &Key) -> Result<(), StoreError>;
    fn lock(&self, key: &Key);
    /// Fails with `NotLocked` rather than going below zero.
    fn unlock(&self, key: &Key) -> Result<(), StoreError>;
    fn lock_count(&self, key: &Key) -> usize;
    fn keys(&self) -> Vec<Key>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compress, encrypt and split `input` into stored blocks.
    fn encode(
        &self,
        input: &mut dyn Read,
        params: &EncodeParams,
        cancel: &dyn Cancellation,
    ) -> Result<Vec<Key>, StoreError>;

    /// Concatenate `keys`, decrypt and decompress into `output`.
    fn decode(
        &self,
        output: &mut dyn Write,
        params: &CodecParams,
        keys: &[Key],
        cancel: &dyn Cancellation,
    ) -> Result<(), StoreError>;

    /// Build one group over `keys` (at most `MAX_GROUP_DATA_SHARES`) with `parity` extra shares.
    fn erasure_encode(
        &self,
        keys: &[Key],
        hash: HashAlgorithm,
        block_length: usize,
        correction: CorrectionAlgorithm,
        parity: usize,
        cancel: &dyn Cancellation,
    ) -> Result<Group, StoreError>;

    /// Restore the group's data shares into the store and return their keys.
    fn erasure_decode(&self, group: &Group, cancel: &dyn Cancellation) -> Result<Vec<Key>, StoreError>;

    fn subscribe(&self, listener: Arc<dyn StoreListener>);
}
