use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::codec::{decode_payload, encode_payload};
use super::erasure::{encode_parity, reconstruct_data, share_length};
use super::{BlockStore, EncodeParams, StoreError, StoreListener, MAX_GROUP_DATA_SHARES};
use crate::cancel::Cancellation;
use crate::types::{CodecParams, CorrectionAlgorithm, Group, HashAlgorithm, Key};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Default)]
struct Blocks {
    values: HashMap<Key, Vec<u8>>,
    locks: HashMap<Key, usize>,
}

/// Serializable dump of a store's blocks (pins are not persisted; owners re-lock on load).
#[derive(Serialize, Deserialize, Default)]
pub struct BlockDump {
    pub blocks: Vec<(Key, Vec<u8>)>,
}

/// In-memory reference block store.
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: Mutex<Blocks>,
    listeners: RwLock<Vec<Arc<dyn StoreListener>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export(&self) -> BlockDump {
        let blocks = self.blocks.lock();
        BlockDump {
            blocks: blocks
                .values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Load blocks that still match their keys; mismatches are skipped.
    pub fn import(&self, dump: BlockDump) -> usize {
        let mut loaded = 0;
        for (key, value) in dump.blocks {
            if self.put(&key, &value).is_ok() {
                loaded += 1;
            }
        }
        loaded
    }

    fn notify_added(&self, key: &Key) {
        for l in self.listeners.read().iter() {
            l.on_block_added(key);
        }
    }

    fn notify_removed(&self, key: &Key) {
        for l in self.listeners.read().iter() {
            l.on_block_removed(key);
        }
    }

    fn store_block(&self, hash: HashAlgorithm, block: &[u8]) -> Result<Key, StoreError> {
        let key = Key::from_data(hash, block);
        self.put(&key, block)?;
        Ok(key)
    }
}

impl BlockStore for MemoryBlockStore {
    fn contains(&self, key: &Key) -> bool {
        self.blocks.lock().values.contains_key(key)
    }

    fn get(&self, key: &Key) -> Result<Vec<u8>, StoreError> {
        self.blocks
            .lock()
            .values
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    fn put(&self, key: &Key, value: &[u8]) -> Result<(), StoreError> {
        if !key.is_well_formed() || !key.matches(value) {
            return Err(StoreError::HashMismatch(key.clone()));
        }
        let added = {
            let mut blocks = self.blocks.lock();
            if blocks.values.contains_key(key) {
                false
            } else {
                blocks.values.insert(key.clone(), value.to_vec());
                true
            }
        };
        if added {
            self.notify_added(key);
        }
        Ok(())
    }

    fn remove(&self, key: &Key) -> Result<(), StoreError> {
        {
            let mut blocks = self.blocks.lock();
            if blocks.locks.get(key).copied().unwrap_or(0) > 0 {
                return Err(StoreError::Locked(key.clone()));
            }
            if blocks.values.remove(key).is_none() {
                return Err(StoreError::NotFound(key.clone()));
            }
        }
        self.notify_removed(key);
        Ok(())
    }

    fn lock(&self, key: &Key) {
        *self.blocks.lock().locks.entry(key.clone()).or_insert(0) += 1;
    }

    fn unlock(&self, key: &Key) -> Result<(), StoreError> {
        let mut blocks = self.blocks.lock();
        match blocks.locks.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(())
            }
            Some(_) => {
                blocks.locks.remove(key);
                Ok(())
            }
            None => {
                warn!(target: "store", %key, "unlock without matching lock");
                Err(StoreError::NotLocked(key.clone()))
            }
        }
    }

    fn lock_count(&self, key: &Key) -> usize {
        self.blocks.lock().locks.get(key).copied().unwrap_or(0)
    }

    fn keys(&self) -> Vec<Key> {
        self.blocks.lock().values.keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.blocks.lock().values.len()
    }

    fn encode(
        &self,
        input: &mut dyn Read,
        params: &EncodeParams,
        cancel: &dyn Cancellation,
    ) -> Result<Vec<Key>, StoreError> {
        if params.block_length == 0 {
            return Err(StoreError::Codec("block length must be positive".into()));
        }
        let mut data = Vec::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let n = input.read(&mut buf)?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }
        let payload = encode_payload(data, &params.codec)?;
        let mut keys = Vec::with_capacity(payload.len() / params.block_length + 1);
        for block in payload.chunks(params.block_length) {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            keys.push(self.store_block(params.hash, block)?);
        }
        debug!(target: "store", blocks = keys.len(), "encoded layer");
        Ok(keys)
    }

    fn decode(
        &self,
        output: &mut dyn Write,
        params: &CodecParams,
        keys: &[Key],
        cancel: &dyn Cancellation,
    ) -> Result<(), StoreError> {
        let mut payload = Vec::new();
        for key in keys {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            payload.extend_from_slice(&self.get(key)?);
        }
        let plain = decode_payload(payload, params)?;
        for chunk in plain.chunks(READ_CHUNK) {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            output.write_all(chunk)?;
        }
        output.flush()?;
        Ok(())
    }

    fn erasure_encode(
        &self,
        keys: &[Key],
        hash: HashAlgorithm,
        block_length: usize,
        correction: CorrectionAlgorithm,
        parity: usize,
        cancel: &dyn Cancellation,
    ) -> Result<Group, StoreError> {
        if keys.is_empty() || keys.len() > MAX_GROUP_DATA_SHARES {
            return Err(StoreError::InvalidGroup("data share count out of range"));
        }
        let mut data = Vec::with_capacity(keys.len());
        let mut length = 0u64;
        for key in keys {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let block = self.get(key)?;
            length += block.len() as u64;
            data.push(block);
        }
        let mut group_keys = keys.to_vec();
        if correction == CorrectionAlgorithm::ReedSolomon8 && parity > 0 {
            let shares = encode_parity(&data, parity, block_length)?;
            for share in shares {
                if cancel.is_cancelled() {
                    return Err(StoreError::Cancelled);
                }
                group_keys.push(self.store_block(hash, &share)?);
            }
        }
        Ok(Group {
            keys: group_keys,
            information_length: keys.len(),
            block_length,
            length,
            correction,
        })
    }

    fn erasure_decode(&self, group: &Group, cancel: &dyn Cancellation) -> Result<Vec<Key>, StoreError> {
        if !group.is_valid() {
            return Err(StoreError::InvalidGroup("information length exceeds key count"));
        }
        let data_keys = group.data_keys().to_vec();
        if data_keys.iter().all(|k| self.contains(k)) {
            return Ok(data_keys);
        }
        if group.correction == CorrectionAlgorithm::None {
            let present = data_keys.iter().filter(|k| self.contains(k)).count();
            return Err(StoreError::Insufficient {
                present,
                needed: group.information_length,
            });
        }
        let mut shares = Vec::with_capacity(group.keys.len());
        for key in &group.keys {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            shares.push(self.get(key).ok());
        }
        let restored = reconstruct_data(shares, group.information_length, group.block_length)?;
        for (i, (key, mut block)) in data_keys.iter().zip(restored).enumerate() {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            if self.contains(key) {
                continue;
            }
            block.truncate(share_length(i, group.block_length, group.length));
            self.put(key, &block)?;
        }
        Ok(data_keys)
    }

    fn subscribe(&self, listener: Arc<dyn StoreListener>) {
        self.listeners.write().push(listener);
    }
}
