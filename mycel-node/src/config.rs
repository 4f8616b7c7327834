//! Load config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use mycel_core::{EngineConfig, Node, PipelineConfig};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/mycel/config.toml or /etc/mycel/config.toml.
/// Env overrides: MYCEL_LISTEN_PORT, MYCEL_STATE_DIR, MYCEL_DOWNLOAD_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listen port (default 45680).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Addresses peers should dial us on. Defaults to the loopback listener.
    #[serde(default)]
    pub advertise: Vec<String>,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Bootstrap peers.
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// A bootstrap peer: hex node id plus `tcp:host:port` addresses.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerEntry {
    pub id: String,
    pub addresses: Vec<String>,
}

impl PeerEntry {
    pub fn to_node(&self) -> anyhow::Result<Node> {
        let id = hex::decode(&self.id).with_context(|| format!("peer id {:?} is not hex", self.id))?;
        let node = Node::new(id, self.addresses.clone());
        anyhow::ensure!(node.is_valid(), "peer {} has no usable address", self.id);
        Ok(node)
    }
}

fn default_listen_port() -> u16 {
    45680
}

fn home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn default_state_dir() -> PathBuf {
    home()
        .map(|h| h.join(".local/share/mycel"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/mycel"))
}

fn default_download_dir() -> PathBuf {
    home()
        .map(|h| h.join("Downloads"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/mycel/downloads"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            advertise: Vec::new(),
            state_dir: default_state_dir(),
            download_dir: default_download_dir(),
            peers: Vec::new(),
            engine: EngineConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Config {
    pub fn advertised_addresses(&self) -> Vec<String> {
        if self.advertise.is_empty() {
            vec![format!("tcp:127.0.0.1:{}", self.listen_port)]
        } else {
            self.advertise.clone()
        }
    }
}

/// Load config: an explicit path must parse; otherwise the first existing
/// default path is used, falling back to defaults. Env vars apply last.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read(path)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |name| std::env::var(name).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("MYCEL_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    if let Some(s) = var("MYCEL_STATE_DIR") {
        c.state_dir = PathBuf::from(s);
    }
    if let Some(s) = var("MYCEL_DOWNLOAD_DIR") {
        c.download_dir = PathBuf::from(s);
    }
}

fn read(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(h) = home() {
        out.push(h.join(".config/mycel/config.toml"));
    }
    out.push(PathBuf::from("/etc/mycel/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match read(&p) {
                Ok(c) => return Some(c),
                Err(e) => tracing::warn!(error = %format!("{:#}", e), "ignoring config file"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_tables_override_defaults() {
        let c: Config = toml::from_str(
            r#"
            listen_port = 5000

            [[peers]]
            id = "0a0b"
            addresses = ["tcp:10.0.0.2:45680"]

            [engine]
            connection_limit = 8

            [pipeline]
            decode_workers = 1
            "#,
        )
        .unwrap();
        assert_eq!(c.listen_port, 5000);
        assert_eq!(c.engine.connection_limit, 8);
        assert_eq!(c.engine.request_fanout, EngineConfig::default().request_fanout);
        assert_eq!(c.pipeline.decode_workers, 1);
        let node = c.peers[0].to_node().unwrap();
        assert_eq!(node.id, vec![0x0a, 0x0b]);
        assert_eq!(c.advertised_addresses(), vec!["tcp:127.0.0.1:5000".to_string()]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 1").is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut c = Config::default();
        apply_env(&mut c, |name| match name {
            "MYCEL_LISTEN_PORT" => Some("7000".into()),
            "MYCEL_STATE_DIR" => Some("/tmp/mycel-state".into()),
            _ => None,
        });
        assert_eq!(c.listen_port, 7000);
        assert_eq!(c.state_dir, PathBuf::from("/tmp/mycel-state"));
        assert_eq!(c.download_dir, default_download_dir());
    }

    #[test]
    fn bad_peer_id_is_an_error() {
        let entry = PeerEntry {
            id: "zz".into(),
            addresses: vec!["tcp:h:1".into()],
        };
        assert!(entry.to_node().is_err());
    }
}
