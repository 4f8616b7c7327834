//! Upload side: encode content into a layer tree, certify its seed and hand
//! every block to the engine for diffusion.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use super::{layer_params, PipelineError, Slot, LAYER_HASH};
use crate::cancel::{Cancellation, StopFlag};
use crate::config::{secs, PipelineConfig};
use crate::engine::GossipEngine;
use crate::identity::DigitalSignature;
use crate::persist::{load_json, save_json};
use crate::seeds::{GossipPayload, LinkPayload, SeedCategory, StorePayload};
use crate::store::{BlockStore, EncodeParams, MAX_GROUP_DATA_SHARES};
use crate::types::{CodecParams, CorrectionAlgorithm, Group, Index, Key, Seed};
use crate::volatile::Stopwatch;

const STATE_FILE: &str = "uploads.json";
const IDLE: Duration = Duration::from_secs(1);
/// Data plus parity shares per Reed-Solomon group.
const MAX_GROUP_SHARES: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UploadSource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadState {
    Encoding,
    Uploading,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadItem {
    pub id: u64,
    pub name: String,
    /// Dropped once the content layer is encoded.
    pub source: Option<UploadSource>,
    pub category: Option<SeedCategory>,
    pub signer: Option<DigitalSignature>,
    pub length: u64,
    /// Layers encoded so far; 0 before the content layer.
    pub rank: u32,
    /// Keys of the newest layer not yet grouped.
    pub keys: Vec<Key>,
    /// Groups of the newest layer awaiting an index.
    pub groups: Vec<Group>,
    /// Codec of the newest layer.
    pub layer_params: Option<CodecParams>,
    /// Every block produced, handed to the engine once the seed exists.
    pub upload_keys: Vec<Key>,
    /// Store locks held by this item while encoding.
    pub locked_keys: Vec<Key>,
    pub state: UploadState,
    pub seed: Option<Seed>,
    pub created: SystemTime,
    pub completed: Option<SystemTime>,
    pub error: Option<String>,
}

#[derive(Default, Serialize, Deserialize)]
struct UploadFile {
    items: Vec<UploadItem>,
}

fn hash_file(path: &Path) -> Result<(Vec<u8>, u64), PipelineError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut length = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        length += n as u64;
    }
    Ok((hasher.finalize().to_vec(), length))
}

pub struct UploadManager {
    config: PipelineConfig,
    store: Arc<dyn BlockStore>,
    engine: Arc<GossipEngine>,
    state_dir: PathBuf,
    items: RwLock<BTreeMap<u64, Arc<Slot<UploadItem>>>>,
    next_id: AtomicU64,
    stop: StopFlag,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl UploadManager {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn BlockStore>,
        engine: Arc<GossipEngine>,
        state_dir: impl Into<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            engine,
            state_dir: state_dir.into(),
            items: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            stop: StopFlag::new(),
            threads: Mutex::new(Vec::new()),
        })
    }

    fn slots(&self) -> Vec<Arc<Slot<UploadItem>>> {
        self.items.read().values().cloned().collect()
    }

    fn insert(
        &self,
        name: String,
        source: UploadSource,
        category: Option<SeedCategory>,
        signer: Option<DigitalSignature>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        info!(target: "upload", id, %name, "upload queued");
        let item = UploadItem {
            id,
            name,
            source: Some(source),
            category,
            signer,
            length: 0,
            rank: 0,
            keys: Vec::new(),
            groups: Vec::new(),
            layer_params: None,
            upload_keys: Vec::new(),
            locked_keys: Vec::new(),
            state: UploadState::Encoding,
            seed: None,
            created: SystemTime::now(),
            completed: None,
            error: None,
        };
        self.items.write().insert(id, Arc::new(Slot::new(item)));
        id
    }

    pub fn upload_bytes(&self, name: impl Into<String>, bytes: Vec<u8>, signer: Option<DigitalSignature>) -> u64 {
        self.insert(name.into(), UploadSource::Bytes(bytes), None, signer)
    }

    pub fn upload_file(
        &self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        signer: Option<DigitalSignature>,
    ) -> u64 {
        self.insert(name.into(), UploadSource::File(path.into()), None, signer)
    }

    /// Publish a categorized payload, replacing the signer's unfinished one.
    pub fn publish(&self, payload: GossipPayload, signer: DigitalSignature) -> Result<u64, PipelineError> {
        let category = payload.category();
        let signature = signer.signature();
        let stale: Vec<u64> = self
            .slots()
            .iter()
            .filter_map(|slot| {
                let item = slot.item.lock();
                let same = item.category == Some(category)
                    && item.state != UploadState::Completed
                    && item.signer.as_ref().map(|s| s.signature()) == Some(signature.clone());
                same.then_some(item.id)
            })
            .collect();
        for id in stale {
            debug!(target: "upload", id, "replacing pending publication");
            self.remove(id);
        }
        let bytes = payload.to_bytes()?;
        Ok(self.insert(
            category.label().to_string(),
            UploadSource::Bytes(bytes),
            Some(category),
            Some(signer),
        ))
    }

    pub fn publish_link(&self, payload: LinkPayload, signer: DigitalSignature) -> Result<u64, PipelineError> {
        self.publish(GossipPayload::Link(payload), signer)
    }

    pub fn publish_store(&self, payload: StorePayload, signer: DigitalSignature) -> Result<u64, PipelineError> {
        self.publish(GossipPayload::Store(payload), signer)
    }

    /// Forget the item. Its encoding locks are released now, or by the
    /// encoder if it is mid-step.
    pub fn remove(&self, id: u64) -> bool {
        let Some(slot) = self.items.write().remove(&id) else {
            return false;
        };
        let mut item = slot.item.lock();
        slot.removed.store(true, Ordering::Release);
        if !slot.working.load(Ordering::Acquire) {
            self.unlock_all(&mut item.locked_keys);
        }
        debug!(target: "upload", id, "upload removed");
        true
    }

    pub fn item(&self, id: u64) -> Option<UploadItem> {
        self.items.read().get(&id).map(|s| s.item.lock().clone())
    }

    pub fn items(&self) -> Vec<UploadItem> {
        self.slots().iter().map(|s| s.item.lock().clone()).collect()
    }

    fn unlock_all(&self, keys: &mut Vec<Key>) {
        for key in keys.drain(..) {
            if let Err(e) = self.store.unlock(&key) {
                warn!(target: "upload", %key, %e, "releasing an unheld lock");
            }
        }
    }

    fn hold(&self, item: &mut UploadItem, keys: &[Key]) {
        for key in keys {
            self.store.lock(key);
        }
        item.locked_keys.extend_from_slice(keys);
        item.upload_keys.extend_from_slice(keys);
    }

    /// Advance one encoding item by one step. Returns false when none is waiting.
    pub fn encode_once(&self) -> bool {
        for slot in self.slots() {
            if slot
                .working
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let mut work = {
                let item = slot.item.lock();
                if item.state != UploadState::Encoding || slot.removed.load(Ordering::Acquire) {
                    slot.working.store(false, Ordering::Release);
                    continue;
                }
                item.clone()
            };
            let cancel = || self.stop.is_stopped() || slot.removed.load(Ordering::Acquire);
            let result = self.advance(&mut work, &cancel);

            let mut item = slot.item.lock();
            let removed = slot.removed.load(Ordering::Acquire);
            match result {
                Ok(()) if removed => self.unlock_all(&mut work.locked_keys),
                Ok(()) => *item = work,
                Err(e) if e.is_retryable() => {
                    debug!(target: "upload", id = item.id, %e, "encoding deferred");
                    if removed {
                        self.unlock_all(&mut item.locked_keys);
                    }
                }
                Err(e) => {
                    error!(target: "upload", id = item.id, name = %item.name, %e, "upload failed");
                    item.state = UploadState::Error;
                    item.error = Some(e.to_string());
                    self.unlock_all(&mut item.locked_keys);
                }
            }
            slot.working.store(false, Ordering::Release);
            return true;
        }
        false
    }

    fn advance(&self, item: &mut UploadItem, cancel: &dyn Cancellation) -> Result<(), PipelineError> {
        if item.rank == 0 {
            self.encode_content(item, cancel)
        } else if item.keys.len() == 1 && item.groups.is_empty() {
            let root = item.keys[0].clone();
            self.finish(item, Some(root))
        } else if !item.keys.is_empty() {
            self.encode_group(item, cancel)
        } else if !item.groups.is_empty() {
            self.encode_index(item, cancel)
        } else {
            Err(PipelineError::Invalid("layer has neither keys nor groups"))
        }
    }

    fn encode_params(&self, codec: CodecParams) -> EncodeParams {
        EncodeParams {
            codec,
            block_length: self.config.block_length,
            hash: LAYER_HASH,
        }
    }

    /// Content layer: hash for the crypto key, then compress, encrypt and split.
    fn encode_content(&self, item: &mut UploadItem, cancel: &dyn Cancellation) -> Result<(), PipelineError> {
        let source = item
            .source
            .clone()
            .ok_or(PipelineError::Invalid("no content source"))?;
        let (digest, length) = match &source {
            UploadSource::Bytes(bytes) => (Sha256::digest(bytes).to_vec(), bytes.len() as u64),
            UploadSource::File(path) => hash_file(path)?,
        };
        item.length = length;
        if length == 0 {
            item.source = None;
            return self.finish(item, None);
        }
        let params = layer_params(digest);
        let encode = self.encode_params(params.clone());
        let keys = match &source {
            UploadSource::Bytes(bytes) => self.store.encode(&mut bytes.as_slice(), &encode, cancel)?,
            UploadSource::File(path) => {
                let mut reader = BufReader::new(File::open(path)?);
                self.store.encode(&mut reader, &encode, cancel)?
            }
        };
        self.hold(item, &keys);
        debug!(target: "upload", id = item.id, blocks = keys.len(), "content encoded");
        item.keys = keys;
        item.rank = 1;
        item.layer_params = Some(params);
        item.source = None;
        Ok(())
    }

    /// Erasure-code the next run of ungrouped keys.
    fn encode_group(&self, item: &mut UploadItem, cancel: &dyn Cancellation) -> Result<(), PipelineError> {
        let n = item
            .keys
            .len()
            .min(self.config.group_data_shares.clamp(1, MAX_GROUP_DATA_SHARES));
        let parity = self.config.parity_for(n).min(MAX_GROUP_SHARES - n);
        let group = self.store.erasure_encode(
            &item.keys[..n],
            LAYER_HASH,
            self.config.block_length,
            CorrectionAlgorithm::ReedSolomon8,
            parity,
            cancel,
        )?;
        let parity_keys = group.keys[n..].to_vec();
        self.hold(item, &parity_keys);
        item.groups.push(group);
        item.keys.drain(..n);
        Ok(())
    }

    /// Serialize the layer's groups into an index and encode it as the next layer.
    fn encode_index(&self, item: &mut UploadItem, cancel: &dyn Cancellation) -> Result<(), PipelineError> {
        let params = item
            .layer_params
            .clone()
            .ok_or(PipelineError::Invalid("layer has no codec"))?;
        let index = Index {
            groups: std::mem::take(&mut item.groups),
            params,
        };
        let data: usize = index.groups.iter().map(|g| g.information_length).sum();
        let bytes = index.to_bytes()?;
        let next = layer_params(Sha256::digest(&bytes).to_vec());
        let keys = self
            .store
            .encode(&mut bytes.as_slice(), &self.encode_params(next.clone()), cancel)?;
        if keys.len() > 1 && keys.len() >= data {
            return Err(PipelineError::Invalid("index layer does not shrink; block length too small"));
        }
        self.hold(item, &keys);
        item.keys = keys;
        item.rank += 1;
        item.layer_params = Some(next);
        debug!(target: "upload", id = item.id, rank = item.rank, "index layer encoded");
        Ok(())
    }

    /// Build and certify the seed, then hand the blocks to the engine.
    fn finish(&self, item: &mut UploadItem, root: Option<Key>) -> Result<(), PipelineError> {
        let params = match &root {
            Some(_) => item
                .layer_params
                .clone()
                .ok_or(PipelineError::Invalid("layer has no codec"))?,
            None => CodecParams::plain(),
        };
        let mut seed = Seed::new(item.name.clone(), item.length, item.rank, root, params);
        if let Some(signer) = &item.signer {
            signer.sign_seed(&mut seed)?;
        }
        if item.category.is_some() {
            if item.signer.is_none() {
                return Err(PipelineError::Invalid("categorized seed needs a signer"));
            }
            if !self.engine.upload_seed(&seed)? {
                warn!(target: "upload", id = item.id, "engine kept a newer seed");
            }
        }
        for key in &item.upload_keys {
            self.engine.upload(key);
        }
        self.unlock_all(&mut item.locked_keys);
        item.keys.clear();
        item.seed = Some(seed);
        item.state = UploadState::Uploading;
        info!(target: "upload", id = item.id, name = %item.name, rank = item.rank, blocks = item.upload_keys.len(), "seed ready");
        Ok(())
    }

    /// Complete items the engine has finished with; reap expired and failed ones.
    pub fn watch_once(&self, now: SystemTime) -> usize {
        let retention = self.config.retention();
        let mut reaped = Vec::new();
        for slot in self.slots() {
            let mut item = slot.item.lock();
            match item.state {
                UploadState::Uploading => {
                    if item.upload_keys.iter().all(|k| !self.engine.is_upload_waiting(k)) {
                        item.state = UploadState::Completed;
                        item.completed = Some(now);
                        info!(target: "upload", id = item.id, name = %item.name, "upload completed");
                    }
                }
                UploadState::Completed => {
                    let expired = item
                        .completed
                        .and_then(|at| now.duration_since(at).ok())
                        .map(|age| age > retention)
                        .unwrap_or(false);
                    if expired {
                        reaped.push(item.id);
                    }
                }
                UploadState::Error => reaped.push(item.id),
                UploadState::Encoding => {}
            }
        }
        for id in &reaped {
            self.remove(*id);
        }
        reaped.len()
    }

    pub fn save(&self) -> Result<(), PipelineError> {
        save_json(&self.state_dir.join(STATE_FILE), &UploadFile { items: self.items() })?;
        Ok(())
    }

    /// Restore saved items, re-taking their encoding locks.
    pub fn load(&self) -> Result<usize, PipelineError> {
        let Some(file) = load_json::<UploadFile>(&self.state_dir.join(STATE_FILE))? else {
            return Ok(0);
        };
        let count = file.items.len();
        let mut items = self.items.write();
        for item in file.items {
            for key in &item.locked_keys {
                self.store.lock(key);
            }
            self.next_id.fetch_max(item.id + 1, Ordering::Relaxed);
            items.insert(item.id, Arc::new(Slot::new(item)));
        }
        info!(target: "upload", count, "uploads loaded");
        Ok(count)
    }

    fn spawn(&self, name: String, body: impl FnOnce() + Send + 'static) {
        match std::thread::Builder::new().name(name).spawn(body) {
            Ok(handle) => self.threads.lock().push(handle),
            Err(e) => warn!(target: "upload", %e, "failed to spawn upload thread"),
        }
    }

    /// Spawn the encoder and the watcher.
    pub fn start(self: &Arc<Self>) {
        if !self.threads.lock().is_empty() {
            return;
        }
        self.stop.reset();
        let manager = self.clone();
        self.spawn("mycel-upload".into(), move || loop {
            if manager.stop.is_stopped() {
                break;
            }
            if !manager.encode_once() && !manager.stop.sleep(IDLE) {
                break;
            }
        });
        let manager = self.clone();
        self.spawn("mycel-upload-watch".into(), move || {
            let mut watch = Stopwatch::started(Instant::now());
            while manager.stop.sleep(IDLE) {
                if watch.due(Instant::now(), secs(manager.config.watch_interval)) {
                    manager.watch_once(SystemTime::now());
                }
            }
        });
    }

    pub fn stop(&self) {
        self.stop.stop();
        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!(target: "upload", "upload thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{engine_with, test_config};
    use crate::identity::verify_seed;
    use crate::pipeline::{DownloadManager, DownloadState};
    use crate::store::MemoryBlockStore;
    use rand::RngCore;

    fn setup(config: PipelineConfig) -> (Arc<UploadManager>, Arc<MemoryBlockStore>, Arc<GossipEngine>, tempfile::TempDir) {
        let (engine, store) = engine_with(1, test_config());
        let dir = tempfile::tempdir().unwrap();
        let manager = UploadManager::new(config, store.clone(), engine.clone(), dir.path());
        (manager, store, engine, dir)
    }

    const BLOCK: usize = 512;

    fn small_blocks() -> PipelineConfig {
        PipelineConfig {
            block_length: BLOCK,
            group_data_shares: 16,
            parity_shares: Some(4),
            ..PipelineConfig::default()
        }
    }

    fn encode_all(manager: &UploadManager, id: u64) -> UploadItem {
        for _ in 0..10_000 {
            if manager.item(id).unwrap().state != UploadState::Encoding {
                break;
            }
            assert!(manager.encode_once());
        }
        manager.item(id).unwrap()
    }

    #[test]
    fn small_content_is_a_rank_one_seed() {
        let (manager, store, engine, _dir) = setup(PipelineConfig::default());
        let alice = DigitalSignature::generate("alice");
        let id = manager.upload_bytes("note.txt", b"short note".to_vec(), Some(alice.clone()));
        let item = encode_all(&manager, id);
        assert_eq!(item.state, UploadState::Uploading);
        let seed = item.seed.unwrap();
        assert_eq!(seed.rank, 1);
        assert_eq!(seed.length, 10);
        assert_eq!(seed.signature(), Some(alice.signature()));
        verify_seed(&seed).unwrap();
        let root = seed.key.unwrap();
        assert!(engine.is_upload_waiting(&root));
        assert_eq!(store.lock_count(&root), 1);
        assert!(item.locked_keys.is_empty());
    }

    #[test]
    fn empty_content_has_no_root() {
        let (manager, _store, _engine, _dir) = setup(PipelineConfig::default());
        let id = manager.upload_bytes("empty", Vec::new(), None);
        let item = encode_all(&manager, id);
        let seed = item.seed.unwrap();
        assert!(seed.key.is_none());
        assert_eq!(seed.length, 0);
        assert_eq!(manager.watch_once(SystemTime::now()), 0);
        assert_eq!(manager.item(id).unwrap().state, UploadState::Completed);
    }

    #[test]
    fn large_content_grows_layers_and_round_trips() {
        let (manager, store, engine, dir) = setup(small_blocks());
        let mut content = vec![0u8; BLOCK * 300];
        rand::thread_rng().fill_bytes(&mut content);
        let source = dir.path().join("source.bin");
        std::fs::write(&source, &content).unwrap();
        let id = manager.upload_file("source.bin", &source, None);
        let item = encode_all(&manager, id);
        assert_eq!(item.state, UploadState::Uploading);
        let seed = item.seed.clone().unwrap();
        assert!(seed.rank >= 3, "rank {}", seed.rank);
        for key in &item.upload_keys {
            assert_eq!(store.lock_count(key), 1);
        }

        let downloads = DownloadManager::new(small_blocks(), store.clone(), engine, dir.path().join("state"));
        let out = dir.path().join("out");
        let did = downloads.download(seed, &out, 1);
        for _ in 0..500 {
            downloads.schedule();
            downloads.decode_once();
            if downloads.item(did).unwrap().state == DownloadState::Completed {
                break;
            }
        }
        let done = downloads.item(did).unwrap();
        assert_eq!(done.state, DownloadState::Completed);
        assert_eq!(std::fs::read(done.result_path.unwrap()).unwrap(), content);
    }

    #[test]
    fn tiny_blocks_fail_instead_of_looping() {
        let config = PipelineConfig {
            block_length: 256,
            ..small_blocks()
        };
        let (manager, store, _engine, _dir) = setup(config);
        let mut content = vec![0u8; 256 * 40];
        rand::thread_rng().fill_bytes(&mut content);
        let id = manager.upload_bytes("blob", content, None);
        let item = encode_all(&manager, id);
        assert_eq!(item.state, UploadState::Error);
        assert!(item.locked_keys.is_empty());
        for key in &item.upload_keys {
            assert_eq!(store.lock_count(key), 0);
        }
    }

    #[test]
    fn publishing_replaces_pending_and_admits_seed() {
        let (manager, _store, engine, _dir) = setup(PipelineConfig::default());
        let bob = DigitalSignature::generate("bob");
        let first = manager
            .publish_link(LinkPayload { trust_signatures: vec!["a".into()] }, bob.clone())
            .unwrap();
        let second = manager
            .publish_link(LinkPayload { trust_signatures: vec!["b".into()] }, bob.clone())
            .unwrap();
        assert!(manager.item(first).is_none());
        let item = encode_all(&manager, second);
        assert_eq!(item.state, UploadState::Uploading);
        let seed = engine.link_seed(&bob.signature()).unwrap();
        assert_eq!(Some(seed), item.seed);
        assert!(engine.store_seed(&bob.signature()).is_none());
    }

    #[test]
    fn removing_mid_encoding_releases_locks() {
        let (manager, store, _engine, _dir) = setup(small_blocks());
        let id = manager.upload_bytes("blob", vec![7u8; BLOCK * 40], None);
        assert!(manager.encode_once());
        let item = manager.item(id).unwrap();
        assert_eq!(item.rank, 1);
        assert!(!item.locked_keys.is_empty());
        assert!(manager.remove(id));
        assert!(!manager.remove(id));
        for key in &item.locked_keys {
            assert_eq!(store.lock_count(key), 0);
        }
    }

    #[test]
    fn watcher_completes_and_reaps() {
        let (manager, _store, _engine, _dir) = setup(PipelineConfig::default());
        let done = manager.upload_bytes("a", b"a".to_vec(), None);
        let failed = manager.upload_bytes("b", b"b".to_vec(), None);
        {
            let items = manager.items.read();
            let mut item = items[&done].item.lock();
            item.state = UploadState::Uploading;
            item.upload_keys = vec![Key::from_data(LAYER_HASH, b"never uploaded")];
            items[&failed].item.lock().state = UploadState::Error;
        }
        let now = SystemTime::now();
        assert_eq!(manager.watch_once(now), 1);
        assert!(manager.item(failed).is_none());
        assert_eq!(manager.item(done).unwrap().state, UploadState::Completed);

        let later = now + Duration::from_secs(33 * 24 * 60 * 60);
        assert_eq!(manager.watch_once(later), 1);
        assert!(manager.item(done).is_none());
    }

    #[test]
    fn saved_items_relock_on_load() {
        let (manager, store, engine, dir) = setup(small_blocks());
        let id = manager.upload_bytes("blob", vec![3u8; BLOCK * 40], None);
        assert!(manager.encode_once());
        let locked = manager.item(id).unwrap().locked_keys;
        manager.save().unwrap();
        assert!(manager.remove(id));

        let restored = UploadManager::new(small_blocks(), store.clone(), engine, dir.path());
        assert_eq!(restored.load().unwrap(), 1);
        for key in &locked {
            assert_eq!(store.lock_count(key), 1);
        }
        let item = encode_all(&restored, id);
        assert_eq!(item.state, UploadState::Uploading);
        assert_ne!(restored.upload_bytes("next", b"x".to_vec(), None), id);
    }
}
