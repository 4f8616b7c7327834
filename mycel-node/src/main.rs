// Mycel node: TCP listener, gossip engine and transfer pipelines.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mycel_core::engine::EngineSnapshot;
use mycel_core::persist::{load_json, save_json};
use mycel_core::store::BlockDump;
use mycel_core::transport::{BandwidthLimit, TcpAcceptor, TcpDialer};
use mycel_core::{DownloadManager, GossipEngine, Keypair, MemoryBlockStore, Network, Node, UploadManager};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const ENGINE_FILE: &str = "engine.json";
const BLOCKS_FILE: &str = "blocks.json";
const INFORMATION_INTERVAL: Duration = Duration::from_secs(60);

struct Daemon {
    store: Arc<MemoryBlockStore>,
    engine: Arc<GossipEngine>,
    downloads: Arc<DownloadManager>,
    uploads: Arc<UploadManager>,
    state_dir: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let mut config_path = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("mycel-node {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                config_path = Some(PathBuf::from(args.next().context("--config needs a path")?));
            }
            other => anyhow::bail!("unknown argument: {}", other),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load(config_path.as_deref())?;
    let node = open(&cfg)?;
    node.start();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let engine = node.engine.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(INFORMATION_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let i = engine.information();
                info!(
                    sessions = i.sessions,
                    routing = i.routing_nodes,
                    received = i.received_bytes,
                    sent = i.sent_bytes,
                    download_waiting = i.download_waiting,
                    upload_waiting = i.upload_waiting,
                    "information"
                );
            }
        });
        shutdown_signal().await
    })?;

    info!("shutting down");
    node.shutdown()
}

/// Build the store, engine and pipelines and load whatever state was saved.
fn open(cfg: &config::Config) -> anyhow::Result<Daemon> {
    std::fs::create_dir_all(&cfg.state_dir)
        .with_context(|| format!("creating {}", cfg.state_dir.display()))?;
    let state_dir = cfg.state_dir.clone();

    let store = Arc::new(MemoryBlockStore::new());
    if let Some(dump) = load_json::<BlockDump>(&state_dir.join(BLOCKS_FILE))? {
        let loaded = store.import(dump);
        info!(blocks = loaded, "blocks loaded");
    }

    let keypair = Arc::new(Keypair::generate());
    let bandwidth = Arc::new(BandwidthLimit::new(0));
    let acceptor = TcpAcceptor::bind(("0.0.0.0", cfg.listen_port), keypair.clone(), bandwidth.clone())
        .with_context(|| format!("binding port {}", cfg.listen_port))?;
    let network = Network {
        dialer: Arc::new(TcpDialer::new(keypair, bandwidth.clone())),
        listener: Some(Arc::new(acceptor)),
        bandwidth,
    };

    let snapshot = load_json::<EngineSnapshot>(&state_dir.join(ENGINE_FILE))?;
    let addresses = cfg.advertised_addresses();
    let base = match &snapshot {
        Some(s) => Node::new(s.base_node.id.clone(), addresses),
        None => Node::random(addresses),
    };
    let engine = GossipEngine::new(base.clone(), cfg.engine.clone(), store.clone(), network);
    if let Some(snapshot) = snapshot {
        engine.restore(snapshot);
        engine.set_base_node(base.clone());
    }
    info!(node = %base, "base node");

    let mut bootstrap = Vec::new();
    for peer in &cfg.peers {
        match peer.to_node() {
            Ok(node) => bootstrap.push(node),
            Err(e) => warn!(error = %format!("{:#}", e), "skipping bootstrap peer"),
        }
    }
    if !bootstrap.is_empty() {
        bootstrap.extend(engine.other_nodes());
        engine.set_other_nodes(bootstrap);
    }

    let downloads = DownloadManager::new(cfg.pipeline.clone(), store.clone(), engine.clone(), &state_dir);
    let uploads = UploadManager::new(cfg.pipeline.clone(), store.clone(), engine.clone(), &state_dir);
    downloads.load()?;
    uploads.load()?;
    std::fs::create_dir_all(&cfg.download_dir)
        .with_context(|| format!("creating {}", cfg.download_dir.display()))?;

    Ok(Daemon {
        store,
        engine,
        downloads,
        uploads,
        state_dir,
    })
}

impl Daemon {
    fn start(&self) {
        self.engine.start();
        self.downloads.start();
        self.uploads.start();
    }

    fn shutdown(&self) -> anyhow::Result<()> {
        self.uploads.stop();
        self.downloads.stop();
        self.engine.stop();
        self.save(&self.state_dir)
    }

    fn save(&self, dir: &Path) -> anyhow::Result<()> {
        self.uploads.save()?;
        self.downloads.save()?;
        save_json(&dir.join(ENGINE_FILE), &self.engine.snapshot())?;
        save_json(&dir.join(BLOCKS_FILE), &self.store.export())?;
        info!("state saved");
        Ok(())
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
