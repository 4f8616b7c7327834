//! Download side: walk a seed's layer tree down to the content file.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{LimitedWriter, PipelineError, Slot, MAX_INDEX_LAYER};
use crate::cancel::{Cancellation, StopFlag};
use crate::config::PipelineConfig;
use crate::engine::GossipEngine;
use crate::exist::{ExistenceIndex, ExistenceListener};
use crate::persist::{load_json, save_json};
use crate::store::BlockStore;
use crate::types::{CodecParams, Index, Key, Seed};

const STATE_FILE: &str = "downloads.json";
const IDLE: Duration = Duration::from_secs(1);
const BUSY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadState {
    Downloading,
    ParityDecoding,
    Decoding,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadItem {
    pub id: u64,
    pub seed: Seed,
    /// Zero pauses network requests for this item.
    pub priority: u32,
    pub dir: PathBuf,
    /// Layer currently being fetched; 1 is the root block.
    pub rank: u32,
    /// Index describing the current layer (rank > 1).
    pub index: Option<Index>,
    pub state: DownloadState,
    /// Every index whose keys this item has locked.
    pub locked_indexes: Vec<Index>,
    /// The root key is locked.
    pub holds_root: bool,
    pub result_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl DownloadItem {
    fn is_final_layer(&self) -> bool {
        self.rank >= self.seed.rank
    }

    fn referenced_keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.seed.key.iter().cloned().collect();
        if let Some(index) = &self.index {
            keys.extend(index.keys().cloned());
        }
        keys
    }
}

#[derive(Default, Serialize, Deserialize)]
struct DownloadFile {
    items: Vec<DownloadItem>,
    completed: Vec<Seed>,
}

/// Replace path separators and control characters; never empty.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_control() { '-' } else { c })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `dir/name`, or `dir/stem (n).ext` for the first free `n`.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let name = sanitize(name);
    let first = dir.join(&name);
    if !first.exists() {
        return first;
    }
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name.as_str(), ""),
    };
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{} ({}){}", stem, n, ext));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

pub struct DownloadManager {
    config: PipelineConfig,
    store: Arc<dyn BlockStore>,
    engine: Arc<GossipEngine>,
    exist: Arc<Mutex<ExistenceIndex>>,
    state_dir: PathBuf,
    items: RwLock<BTreeMap<u64, Arc<Slot<DownloadItem>>>>,
    completed: Mutex<Vec<Seed>>,
    next_id: AtomicU64,
    rng: Mutex<StdRng>,
    stop: StopFlag,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DownloadManager {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn BlockStore>,
        engine: Arc<GossipEngine>,
        state_dir: impl Into<PathBuf>,
    ) -> Arc<Self> {
        let exist = Arc::new(Mutex::new(ExistenceIndex::new()));
        store.subscribe(Arc::new(ExistenceListener(exist.clone())));
        Arc::new(Self {
            config,
            store,
            engine,
            exist,
            state_dir: state_dir.into(),
            items: RwLock::new(BTreeMap::new()),
            completed: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            rng: Mutex::new(StdRng::from_entropy()),
            stop: StopFlag::new(),
            threads: Mutex::new(Vec::new()),
        })
    }

    fn slots(&self) -> Vec<Arc<Slot<DownloadItem>>> {
        self.items.read().values().cloned().collect()
    }

    fn slot(&self, id: u64) -> Option<Arc<Slot<DownloadItem>>> {
        self.items.read().get(&id).cloned()
    }

    /// Queue `seed` for download into `dir`. A seed already pending returns its existing id.
    pub fn download(&self, seed: Seed, dir: impl Into<PathBuf>, priority: u32) -> u64 {
        let mut items = self.items.write();
        for slot in items.values() {
            let item = slot.item.lock();
            if item.seed == seed && item.state != DownloadState::Completed {
                return item.id;
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Some(root) = &seed.key {
            self.store.lock(root);
        }
        info!(target: "download", id, name = %seed.name, rank = seed.rank, "download queued");
        let item = DownloadItem {
            id,
            holds_root: seed.key.is_some(),
            seed,
            priority,
            dir: dir.into(),
            rank: 1,
            index: None,
            state: DownloadState::Downloading,
            locked_indexes: Vec::new(),
            result_path: None,
            error: None,
        };
        items.insert(id, Arc::new(Slot::new(item)));
        id
    }

    /// Forget the item and release its locks. False if it was already gone.
    pub fn remove(&self, id: u64) -> bool {
        let Some(slot) = self.items.write().remove(&id) else {
            return false;
        };
        let mut item = slot.item.lock();
        slot.removed.store(true, Ordering::Release);
        self.release(&mut item);
        debug!(target: "download", id, "download removed");
        true
    }

    /// Start over from the root block.
    pub fn reset(&self, id: u64) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let mut item = slot.item.lock();
        self.release(&mut item);
        if let Some(root) = &item.seed.key {
            self.store.lock(root);
            item.holds_root = true;
        }
        item.rank = 1;
        item.state = DownloadState::Downloading;
        item.result_path = None;
        item.error = None;
        true
    }

    pub fn set_priority(&self, id: u64, priority: u32) -> bool {
        match self.slot(id) {
            Some(slot) => {
                slot.item.lock().priority = priority;
                true
            }
            None => false,
        }
    }

    pub fn item(&self, id: u64) -> Option<DownloadItem> {
        self.slot(id).map(|s| s.item.lock().clone())
    }

    pub fn items(&self) -> Vec<DownloadItem> {
        self.slots().iter().map(|s| s.item.lock().clone()).collect()
    }

    pub fn downloaded_seeds(&self) -> Vec<Seed> {
        self.completed.lock().clone()
    }

    /// The current layer can be decoded without the network.
    fn is_ready(&self, item: &DownloadItem) -> bool {
        match (&item.seed.key, item.rank) {
            (None, _) => true,
            (Some(root), 1) => self.store.contains(root),
            (Some(_), _) => match &item.index {
                Some(index) => {
                    let exist = self.exist.lock();
                    index.groups.iter().all(|g| exist.is_reconstructable(g))
                }
                None => false,
            },
        }
    }

    /// One scheduling pass. An item whose layer is already complete moves to
    /// decoding; otherwise one active item, picked by priority weight, gets
    /// block requests. Returns true if anything was done.
    pub fn schedule(&self) -> bool {
        let slots = self.slots();
        let mut active: Vec<(DownloadItem, u32)> = Vec::new();
        for slot in &slots {
            let mut item = slot.item.lock();
            if item.state != DownloadState::Downloading {
                continue;
            }
            if self.is_ready(&item) {
                item.state = if item.rank > 1 {
                    DownloadState::ParityDecoding
                } else {
                    DownloadState::Decoding
                };
                debug!(target: "download", id = item.id, rank = item.rank, "layer ready");
                return true;
            }
            if item.priority > 0 {
                active.push((item.clone(), item.priority));
            }
        }
        let picked = {
            let mut rng = self.rng.lock();
            active
                .choose_weighted(&mut *rng, |(_, p)| *p)
                .ok()
                .map(|(item, _)| item.clone())
        };
        match picked {
            Some(item) => self.request(&item) > 0,
            None => false,
        }
    }

    /// Ask the engine for missing blocks of the item's layer. Returns the number requested.
    fn request(&self, item: &DownloadItem) -> usize {
        let Some(root) = &item.seed.key else {
            return 0;
        };
        if item.rank == 1 {
            if self.store.contains(root) || self.engine.is_download_waiting(root) {
                return 0;
            }
            self.engine.download(root);
            return 1;
        }
        let Some(index) = &item.index else {
            return 0;
        };
        // Every missing share of an incomplete group is asked for, not just
        // enough to reach its information length.
        let plan: Vec<Vec<Key>> = {
            let exist = self.exist.lock();
            index
                .groups
                .iter()
                .filter(|g| !exist.is_reconstructable(g))
                .map(|g| exist.keys(g, false))
                .collect()
        };

        let mut budget = self.config.request_budget(item.priority);
        let mut requested = 0;
        let mut rng = self.rng.lock();
        for mut missing in plan {
            if budget == 0 {
                break;
            }
            let in_flight = missing
                .iter()
                .filter(|k| self.engine.is_download_waiting(k))
                .count();
            budget = budget.saturating_sub(in_flight as u64);
            missing.retain(|k| !self.engine.is_download_waiting(k));
            missing.shuffle(&mut *rng);
            for key in missing {
                if budget == 0 {
                    break;
                }
                self.engine.download(&key);
                budget -= 1;
                requested += 1;
            }
        }
        if requested > 0 {
            debug!(target: "download", id = item.id, rank = item.rank, requested, "requested blocks");
        }
        requested
    }

    /// Decode one claimed item. Items at their final layer go first. Returns
    /// false when nothing was waiting.
    pub fn decode_once(&self) -> bool {
        let mut waiting: Vec<(bool, Arc<Slot<DownloadItem>>)> = self
            .slots()
            .into_iter()
            .filter_map(|slot| {
                let item = slot.item.lock();
                let later = match item.state {
                    DownloadState::Decoding => !item.is_final_layer(),
                    DownloadState::ParityDecoding => true,
                    _ => return None,
                };
                drop(item);
                Some((later, slot))
            })
            .collect();
        waiting.sort_by_key(|(later, _)| *later);

        for (_, slot) in waiting {
            if slot
                .working
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let result = self.decode_item(&slot);
            slot.working.store(false, Ordering::Release);
            match result {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    let mut item = slot.item.lock();
                    debug!(target: "download", id = item.id, %e, "decode deferred");
                    if matches!(item.state, DownloadState::Decoding | DownloadState::ParityDecoding) {
                        item.state = DownloadState::Downloading;
                    }
                }
                Err(e) => self.fail(&slot, e),
            }
            return true;
        }
        false
    }

    fn decode_item(&self, slot: &Slot<DownloadItem>) -> Result<(), PipelineError> {
        let item = slot.item.lock().clone();
        if !self.is_ready(&item) {
            let mut guard = slot.item.lock();
            if matches!(guard.state, DownloadState::Decoding | DownloadState::ParityDecoding) {
                guard.state = DownloadState::Downloading;
            }
            return Ok(());
        }
        let cancel = || self.stop.is_stopped() || slot.removed.load(Ordering::Acquire);
        let Some(root) = item.seed.key.clone() else {
            return self.complete(slot, None);
        };

        let (keys, params) = if item.rank <= 1 {
            (vec![root], item.seed.params.clone())
        } else {
            let index = item.index.as_ref().ok_or(PipelineError::Invalid("layer has no index"))?;
            let mut keys = Vec::new();
            for group in &index.groups {
                keys.extend(self.store.erasure_decode(group, &cancel)?);
            }
            let mut guard = slot.item.lock();
            if guard.state == DownloadState::ParityDecoding {
                guard.state = DownloadState::Decoding;
            }
            (keys, index.params.clone())
        };

        if item.is_final_layer() {
            fs::create_dir_all(&item.dir)?;
            let part = item.dir.join(format!(".{}.part", item.id));
            if let Err(e) = self.decode_to_file(&part, &params, &keys, item.seed.length, &cancel) {
                let _ = fs::remove_file(&part);
                return Err(e);
            }
            self.complete(slot, Some(part))
        } else {
            let limit = item.seed.length.max(MAX_INDEX_LAYER);
            let mut out = LimitedWriter::new(Vec::new(), limit);
            self.decode_layer(&mut out, &params, &keys, limit, &cancel)?;
            let index = Index::from_bytes(&out.into_inner())?;
            self.descend(slot, index)
        }
    }

    fn decode_layer<W: Write + 'static>(
        &self,
        out: &mut LimitedWriter<W>,
        params: &CodecParams,
        keys: &[Key],
        limit: u64,
        cancel: &dyn Cancellation,
    ) -> Result<(), PipelineError> {
        match self.store.decode(out, params, keys, cancel) {
            Ok(()) => Ok(()),
            Err(_) if out.exceeded() => Err(PipelineError::TooLarge { limit }),
            Err(e) => Err(e.into()),
        }
    }

    fn decode_to_file(
        &self,
        part: &Path,
        params: &CodecParams,
        keys: &[Key],
        limit: u64,
        cancel: &dyn Cancellation,
    ) -> Result<(), PipelineError> {
        let mut out = LimitedWriter::new(BufWriter::new(File::create(part)?), limit);
        self.decode_layer(&mut out, params, keys, limit, cancel)?;
        let file = out.into_inner().into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    }

    /// Swap in the next layer's index: lock its keys and track its groups.
    fn descend(&self, slot: &Slot<DownloadItem>, index: Index) -> Result<(), PipelineError> {
        let well_formed = !index.groups.is_empty()
            && index
                .groups
                .iter()
                .all(|g| g.is_valid() && g.keys.iter().all(Key::is_well_formed));
        if !well_formed {
            return Err(PipelineError::Invalid("malformed index layer"));
        }
        let mut item = slot.item.lock();
        if slot.removed.load(Ordering::Acquire) {
            return Ok(());
        }
        for key in index.keys() {
            self.store.lock(key);
        }
        {
            let mut exist = self.exist.lock();
            for group in &index.groups {
                exist.add(group, |k| self.store.contains(k));
            }
            if let Some(old) = &item.index {
                for group in &old.groups {
                    exist.remove(group);
                }
            }
        }
        item.locked_indexes.push(index.clone());
        item.index = Some(index);
        item.rank += 1;
        item.state = DownloadState::Downloading;
        debug!(target: "download", id = item.id, rank = item.rank, "descended a layer");
        Ok(())
    }

    fn complete(&self, slot: &Slot<DownloadItem>, part: Option<PathBuf>) -> Result<(), PipelineError> {
        let mut item = slot.item.lock();
        if slot.removed.load(Ordering::Acquire) {
            if let Some(part) = part {
                let _ = fs::remove_file(part);
            }
            return Ok(());
        }
        fs::create_dir_all(&item.dir)?;
        let path = unique_path(&item.dir, &item.seed.name);
        match part {
            Some(part) => fs::rename(&part, &path)?,
            None => {
                File::create(&path)?;
            }
        }
        self.release(&mut item);
        item.state = DownloadState::Completed;
        item.result_path = Some(path.clone());
        self.completed.lock().push(item.seed.clone());
        info!(target: "download", id = item.id, path = %path.display(), "download completed");
        Ok(())
    }

    /// Mark the item failed, surface any damaged blocks, then drop it.
    fn fail(&self, slot: &Slot<DownloadItem>, err: PipelineError) {
        let id = {
            let mut item = slot.item.lock();
            error!(target: "download", id = item.id, name = %item.seed.name, %err, "download failed");
            for key in item.referenced_keys() {
                if let Err(e) = self.store.get(&key) {
                    debug!(target: "download", %key, %e, "block unreadable");
                }
            }
            item.state = DownloadState::Error;
            item.error = Some(err.to_string());
            self.release(&mut item);
            slot.removed.store(true, Ordering::Release);
            item.id
        };
        self.items.write().remove(&id);
    }

    /// Unlock everything the item holds and stop tracking its groups.
    fn release(&self, item: &mut DownloadItem) {
        if item.holds_root {
            if let Some(root) = &item.seed.key {
                if let Err(e) = self.store.unlock(root) {
                    warn!(target: "download", id = item.id, %e, "root was not locked");
                }
            }
            item.holds_root = false;
        }
        for index in item.locked_indexes.drain(..) {
            for key in index.keys() {
                let _ = self.store.unlock(key);
            }
        }
        if let Some(index) = item.index.take() {
            let mut exist = self.exist.lock();
            for group in &index.groups {
                exist.remove(group);
            }
        }
    }

    pub fn save(&self) -> Result<(), PipelineError> {
        let file = DownloadFile {
            items: self.items(),
            completed: self.downloaded_seeds(),
        };
        save_json(&self.state_dir.join(STATE_FILE), &file)?;
        Ok(())
    }

    /// Restore saved items, re-taking their locks. Returns how many were loaded.
    pub fn load(&self) -> Result<usize, PipelineError> {
        let Some(file) = load_json::<DownloadFile>(&self.state_dir.join(STATE_FILE))? else {
            return Ok(0);
        };
        let count = file.items.len();
        let mut items = self.items.write();
        for mut item in file.items {
            if item.state != DownloadState::Completed {
                if item.holds_root {
                    if let Some(root) = &item.seed.key {
                        self.store.lock(root);
                    }
                }
                for index in &item.locked_indexes {
                    for key in index.keys() {
                        self.store.lock(key);
                    }
                }
                if let Some(index) = &item.index {
                    let mut exist = self.exist.lock();
                    for group in &index.groups {
                        exist.add(group, |k| self.store.contains(k));
                    }
                }
                if matches!(item.state, DownloadState::Decoding | DownloadState::ParityDecoding) {
                    item.state = DownloadState::Downloading;
                }
            }
            self.next_id.fetch_max(item.id + 1, Ordering::Relaxed);
            items.insert(item.id, Arc::new(Slot::new(item)));
        }
        self.completed.lock().extend(file.completed);
        info!(target: "download", count, "downloads loaded");
        Ok(count)
    }

    fn spawn(&self, name: String, body: impl FnOnce() + Send + 'static) {
        match std::thread::Builder::new().name(name).spawn(body) {
            Ok(handle) => self.threads.lock().push(handle),
            Err(e) => warn!(target: "download", %e, "failed to spawn download thread"),
        }
    }

    /// Spawn the scheduler and the decode workers.
    pub fn start(self: &Arc<Self>) {
        if !self.threads.lock().is_empty() {
            return;
        }
        self.stop.reset();
        let manager = self.clone();
        self.spawn("mycel-download".into(), move || loop {
            let pause = if manager.schedule() { BUSY } else { IDLE };
            if !manager.stop.sleep(pause) {
                break;
            }
        });
        for i in 0..self.config.decode_workers.max(1) {
            let manager = self.clone();
            self.spawn(format!("mycel-decode-{}", i), move || loop {
                if manager.stop.is_stopped() {
                    break;
                }
                if !manager.decode_once() && !manager.stop.sleep(IDLE) {
                    break;
                }
            });
        }
    }

    pub fn stop(&self) {
        self.stop.stop();
        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!(target: "download", "download thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{engine_with, test_config};
    use crate::store::{EncodeParams, MemoryBlockStore};
    use crate::types::{CorrectionAlgorithm, HashAlgorithm};
    use rand::RngCore;

    fn setup() -> (Arc<DownloadManager>, Arc<MemoryBlockStore>, Arc<GossipEngine>, tempfile::TempDir) {
        let (engine, store) = engine_with(1, test_config());
        let dir = tempfile::tempdir().unwrap();
        let manager = DownloadManager::new(
            PipelineConfig::default(),
            store.clone(),
            engine.clone(),
            dir.path().join("state"),
        );
        (manager, store, engine, dir)
    }

    fn plain(block_length: usize) -> EncodeParams {
        EncodeParams {
            codec: CodecParams::plain(),
            block_length,
            hash: HashAlgorithm::Sha256,
        }
    }

    fn random(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    /// 512 bytes in 8 blocks, one group with 2 parity shares, one root block.
    fn two_layer(store: &MemoryBlockStore, content: &[u8]) -> (Seed, Vec<Key>) {
        let never = || false;
        let keys = store.encode(&mut &content[..], &plain(64), &never).unwrap();
        assert_eq!(keys.len(), 8);
        let group = store
            .erasure_encode(&keys, HashAlgorithm::Sha256, 64, CorrectionAlgorithm::ReedSolomon8, 2, &never)
            .unwrap();
        let index = Index {
            groups: vec![group],
            params: CodecParams::plain(),
        };
        let bytes = index.to_bytes().unwrap();
        let root = store.encode(&mut &bytes[..], &plain(1 << 16), &never).unwrap();
        assert_eq!(root.len(), 1);
        let seed = Seed::new("data.bin", content.len() as u64, 2, Some(root[0].clone()), CodecParams::plain());
        (seed, keys)
    }

    #[test]
    fn single_block_seed_completes() {
        let (manager, store, _engine, dir) = setup();
        let content = b"hello mycel".to_vec();
        let never = || false;
        let keys = store.encode(&mut &content[..], &plain(4096), &never).unwrap();
        let seed = Seed::new("hello.txt", content.len() as u64, 1, Some(keys[0].clone()), CodecParams::plain());
        let id = manager.download(seed.clone(), dir.path(), 1);
        assert_eq!(store.lock_count(&keys[0]), 1);

        assert!(manager.schedule());
        assert_eq!(manager.item(id).unwrap().state, DownloadState::Decoding);
        assert!(manager.decode_once());
        let item = manager.item(id).unwrap();
        assert_eq!(item.state, DownloadState::Completed);
        let path = item.result_path.unwrap();
        assert_eq!(path, dir.path().join("hello.txt"));
        assert_eq!(fs::read(path).unwrap(), content);
        assert_eq!(store.lock_count(&keys[0]), 0);
        assert_eq!(manager.downloaded_seeds(), vec![seed]);
    }

    #[test]
    fn missing_root_is_requested_from_engine() {
        let (manager, _store, engine, dir) = setup();
        let root = Key::from_data(HashAlgorithm::Sha256, b"elsewhere");
        let seed = Seed::new("x", 9, 1, Some(root.clone()), CodecParams::plain());
        let id = manager.download(seed.clone(), dir.path(), 1);
        assert_eq!(manager.download(seed, dir.path(), 1), id);
        assert!(manager.schedule());
        assert!(engine.is_download_waiting(&root));
        assert!(!manager.schedule());
        assert_eq!(manager.item(id).unwrap().state, DownloadState::Downloading);
    }

    #[test]
    fn paused_item_is_not_requested() {
        let (manager, _store, engine, dir) = setup();
        let root = Key::from_data(HashAlgorithm::Sha256, b"elsewhere");
        let id = manager.download(Seed::new("x", 9, 1, Some(root.clone()), CodecParams::plain()), dir.path(), 0);
        assert!(!manager.schedule());
        assert!(!engine.is_download_waiting(&root));
        assert!(manager.set_priority(id, 2));
        assert!(manager.schedule());
        assert!(engine.is_download_waiting(&root));
    }

    #[test]
    fn two_layer_download_reconstructs_missing_shares() {
        let (manager, store, _engine, dir) = setup();
        let content = random(512);
        let (seed, keys) = two_layer(&store, &content);
        store.remove(&keys[1]).unwrap();
        store.remove(&keys[6]).unwrap();

        let id = manager.download(seed, dir.path(), 1);
        assert!(manager.schedule());
        assert!(manager.decode_once());
        let item = manager.item(id).unwrap();
        assert_eq!(item.rank, 2);
        assert_eq!(item.state, DownloadState::Downloading);
        assert_eq!(store.lock_count(&keys[0]), 1);

        assert!(manager.schedule());
        assert_eq!(manager.item(id).unwrap().state, DownloadState::ParityDecoding);
        assert!(manager.decode_once());
        let item = manager.item(id).unwrap();
        assert_eq!(item.state, DownloadState::Completed);
        assert_eq!(fs::read(item.result_path.unwrap()).unwrap(), content);
        assert_eq!(store.lock_count(&keys[0]), 0);
        assert!(store.contains(&keys[1]));
    }

    #[test]
    fn missing_shares_are_requested_once() {
        let (manager, store, engine, dir) = setup();
        let content = random(512);
        let (seed, keys) = two_layer(&store, &content);
        for key in &keys[..4] {
            store.remove(key).unwrap();
        }
        let id = manager.download(seed, dir.path(), 1);
        manager.schedule();
        manager.decode_once();
        assert_eq!(manager.item(id).unwrap().rank, 2);

        // 6 of 10 present: all four missing shares are asked for, once.
        assert!(manager.schedule());
        let waiting = keys[..4].iter().filter(|k| engine.is_download_waiting(k)).count();
        assert_eq!(waiting, 4);
        assert!(!manager.schedule());
        assert_eq!(engine.information().download_waiting, 4);
    }

    #[test]
    fn remove_twice_is_a_noop() {
        let (manager, store, _engine, dir) = setup();
        let content = random(512);
        let (seed, keys) = two_layer(&store, &content);
        let root = seed.key.clone().unwrap();
        let id = manager.download(seed, dir.path(), 1);
        manager.schedule();
        manager.decode_once();
        assert_eq!(store.lock_count(&keys[0]), 1);
        assert!(manager.remove(id));
        assert!(!manager.remove(id));
        assert_eq!(store.lock_count(&keys[0]), 0);
        assert_eq!(store.lock_count(&root), 0);
        assert!(manager.item(id).is_none());
    }

    #[test]
    fn undecodable_index_drops_the_item() {
        let (manager, store, _engine, dir) = setup();
        let never = || false;
        let garbage = vec![0xffu8; 40];
        let root = store.encode(&mut &garbage[..], &plain(4096), &never).unwrap();
        let seed = Seed::new("bad", 100, 3, Some(root[0].clone()), CodecParams::plain());
        let id = manager.download(seed, dir.path(), 1);
        manager.schedule();
        assert!(manager.decode_once());
        assert!(manager.item(id).is_none());
        assert_eq!(store.lock_count(&root[0]), 0);
    }

    #[test]
    fn oversized_layer_is_retried() {
        let (manager, store, _engine, dir) = setup();
        let never = || false;
        let content = b"longer than declared".to_vec();
        let keys = store.encode(&mut &content[..], &plain(4096), &never).unwrap();
        let seed = Seed::new("short", 4, 1, Some(keys[0].clone()), CodecParams::plain());
        let id = manager.download(seed, dir.path(), 1);
        manager.schedule();
        assert!(manager.decode_once());
        assert_eq!(manager.item(id).unwrap().state, DownloadState::Downloading);
        assert!(!dir.path().join(format!(".{}.part", id)).exists());
    }

    #[test]
    fn empty_seed_yields_empty_file() {
        let (manager, _store, _engine, dir) = setup();
        let id = manager.download(Seed::new("empty", 0, 0, None, CodecParams::plain()), dir.path(), 1);
        assert!(manager.schedule());
        assert!(manager.decode_once());
        let item = manager.item(id).unwrap();
        assert_eq!(item.state, DownloadState::Completed);
        assert!(fs::read(item.result_path.unwrap()).unwrap().is_empty());
    }

    #[test]
    fn saved_items_relock_on_load() {
        let (manager, store, engine, dir) = setup();
        let content = random(512);
        let (seed, keys) = two_layer(&store, &content);
        let id = manager.download(seed, dir.path(), 3);
        manager.schedule();
        manager.decode_once();
        manager.save().unwrap();
        assert!(manager.remove(id));
        assert_eq!(store.lock_count(&keys[0]), 0);

        let restored = DownloadManager::new(PipelineConfig::default(), store.clone(), engine, dir.path().join("state"));
        assert_eq!(restored.load().unwrap(), 1);
        let item = restored.item(id).unwrap();
        assert_eq!(item.rank, 2);
        assert_eq!(item.priority, 3);
        assert_eq!(store.lock_count(&keys[0]), 1);
        assert!(restored.schedule());
        assert!(restored.decode_once());
        assert_eq!(restored.item(id).unwrap().state, DownloadState::Completed);
        assert_ne!(restored.download(item.seed, dir.path(), 1), id);
    }

    #[test]
    fn names_are_sanitized_and_made_unique() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(sanitize("a/b\\c\n"), "a-b-c-");
        assert_eq!(sanitize(".."), "download");
        let first = unique_path(dir.path(), "report.pdf");
        fs::write(&first, b"1").unwrap();
        assert_eq!(unique_path(dir.path(), "report.pdf"), dir.path().join("report (1).pdf"));
        fs::write(dir.path().join("notes"), b"1").unwrap();
        assert_eq!(unique_path(dir.path(), "notes"), dir.path().join("notes (1)"));
    }
}
