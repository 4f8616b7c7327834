//! Upload then download through one store, across content sizes.

use std::sync::Arc;

use mycel_core::engine::Network;
use mycel_core::store::BlockStore;
use mycel_core::transport::{BandwidthLimit, MemoryNetwork};
use mycel_core::{
    DigitalSignature, DownloadManager, DownloadState, EngineConfig, GossipEngine, MemoryBlockStore, Node,
    PipelineConfig, Seed, UploadManager, UploadState,
};
use rand::RngCore;

const BLOCK: usize = 512;

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        block_length: BLOCK,
        group_data_shares: 16,
        parity_shares: Some(4),
        decode_workers: 1,
        ..PipelineConfig::default()
    }
}

fn engine(tag: u8, store: Arc<MemoryBlockStore>) -> Arc<GossipEngine> {
    let net = MemoryNetwork::new();
    let address = format!("mem:{}", tag);
    GossipEngine::new(
        Node::new(vec![tag; 32], vec![address.clone()]),
        EngineConfig {
            rng_seed: Some(11),
            ..EngineConfig::default()
        },
        store,
        Network {
            dialer: Arc::new(net.dialer(&address)),
            listener: None,
            bandwidth: Arc::new(BandwidthLimit::new(0)),
        },
    )
}

fn random(len: usize) -> Vec<u8> {
    let mut content = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut content);
    content
}

fn upload(uploads: &UploadManager, name: &str, content: Vec<u8>, signer: Option<DigitalSignature>) -> Seed {
    let id = uploads.upload_bytes(name, content, signer);
    for _ in 0..10_000 {
        if uploads.item(id).unwrap().state != UploadState::Encoding {
            break;
        }
        uploads.encode_once();
    }
    let item = uploads.item(id).unwrap();
    assert_eq!(item.state, UploadState::Uploading, "{:?}", item.error);
    item.seed.unwrap()
}

fn download(downloads: &DownloadManager, seed: Seed, dir: &std::path::Path) -> Vec<u8> {
    let id = downloads.download(seed, dir, 1);
    for _ in 0..1_000 {
        if downloads.item(id).unwrap().state == DownloadState::Completed {
            break;
        }
        downloads.schedule();
        downloads.decode_once();
    }
    let item = downloads.item(id).unwrap();
    assert_eq!(item.state, DownloadState::Completed, "{:?}", item.error);
    std::fs::read(item.result_path.unwrap()).unwrap()
}

#[test]
fn round_trip_across_sizes() {
    let store = Arc::new(MemoryBlockStore::new());
    let engine = engine(1, store.clone());
    let dir = tempfile::tempdir().unwrap();
    let uploads = UploadManager::new(pipeline_config(), store.clone(), engine.clone(), dir.path().join("state"));
    let downloads = DownloadManager::new(pipeline_config(), store.clone(), engine, dir.path().join("state"));

    for (i, len) in [0, 1, BLOCK - 1, BLOCK, BLOCK * 260].into_iter().enumerate() {
        let content = random(len);
        let seed = upload(&uploads, &format!("file-{}.bin", i), content.clone(), None);
        assert_eq!(seed.length, len as u64);
        assert_eq!(seed.key.is_none(), len == 0);
        if len > BLOCK * 16 {
            assert!(seed.rank > 1);
        }
        let out = dir.path().join(format!("out-{}", i));
        assert_eq!(download(&downloads, seed, &out), content, "size {}", len);
    }
    assert_eq!(downloads.downloaded_seeds().len(), 5);
}

#[test]
fn lost_shares_are_rebuilt_from_parity() {
    let source = Arc::new(MemoryBlockStore::new());
    let state = tempfile::tempdir().unwrap();
    let uploads = UploadManager::new(pipeline_config(), source.clone(), engine(1, source.clone()), state.path());
    let content = random(BLOCK * 100);
    let alice = DigitalSignature::generate("alice");
    let seed = upload(&uploads, "report.pdf", content.clone(), Some(alice));
    let root = seed.key.clone().unwrap();

    // A fresh store holding everything but three non-root blocks. Any group
    // survives three losses.
    let copy = Arc::new(MemoryBlockStore::new());
    copy.import(source.export());
    let lost: Vec<_> = copy.keys().into_iter().filter(|k| *k != root).take(3).collect();
    for key in &lost {
        copy.remove(key).unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    let downloads = DownloadManager::new(pipeline_config(), copy.clone(), engine(2, copy.clone()), dir.path());
    assert_eq!(download(&downloads, seed, dir.path()), content);
}

#[test]
fn interrupted_download_resumes_after_reload() {
    let store = Arc::new(MemoryBlockStore::new());
    let engine = engine(1, store.clone());
    let dir = tempfile::tempdir().unwrap();
    let uploads = UploadManager::new(pipeline_config(), store.clone(), engine.clone(), dir.path());
    let content = random(BLOCK * 60);
    let seed = upload(&uploads, "movie.mkv", content.clone(), None);

    let first = DownloadManager::new(pipeline_config(), store.clone(), engine.clone(), dir.path());
    let id = first.download(seed, dir.path().join("out"), 1);
    first.schedule();
    first.decode_once();
    first.save().unwrap();
    let rank = first.item(id).unwrap().rank;
    assert!(first.remove(id));

    let second = DownloadManager::new(pipeline_config(), store, engine, dir.path());
    assert_eq!(second.load().unwrap(), 1);
    assert!(second.item(id).unwrap().rank >= rank);
    for _ in 0..1_000 {
        if second.item(id).unwrap().state == DownloadState::Completed {
            break;
        }
        second.schedule();
        second.decode_once();
    }
    let item = second.item(id).unwrap();
    assert_eq!(item.state, DownloadState::Completed);
    assert_eq!(std::fs::read(item.result_path.unwrap()).unwrap(), content);
}
