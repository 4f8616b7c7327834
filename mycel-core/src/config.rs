//! Engine and pipeline tunables. Every field has a serde default so partial
//! TOML tables deserialize.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::peer_state::PriorityPolicy;

/// Gossip engine settings. Intervals are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum simultaneous sessions.
    pub connection_limit: usize,
    /// Bytes per second for all sessions; 0 means unlimited.
    pub bandwidth_limit: u64,
    pub download_lower_limit: usize,
    pub upload_lower_limit: usize,
    pub diffusion_lower_limit: usize,
    pub connect_loops: usize,
    pub accept_loops: usize,

    pub push_nodes_interval: u64,
    pub outbox_interval: u64,
    pub push_seeds_interval: u64,
    pub diffusion_round_interval: u64,
    pub upload_round_interval: u64,
    pub download_round_interval: u64,
    pub seeds_round_interval: u64,
    pub shed_interval: u64,
    pub prune_interval: u64,
    pub mediate_interval: u64,
    pub trim_interval: u64,
    /// A negative-priority peer is dropped after this long without a pull.
    pub starvation_timeout: u64,

    pub diffusion_fanout: usize,
    pub link_fanout: usize,
    pub request_fanout: usize,
    pub seed_fanout: usize,

    pub max_link_count: usize,
    pub max_request_count: usize,
    pub max_seed_request_count: usize,
    pub max_seed_count: usize,
    pub max_node_count: usize,
    pub diffusion_backlog: usize,
    pub upload_batch: usize,
    pub succeeded_sample: usize,
    pub node_sample: usize,
    pub addresses_per_node: usize,
    /// Routing entries are only dropped by `remove_node` above this size.
    pub routing_removal_threshold: usize,
    pub peer_state_capacity: usize,

    pub priority_bound: i32,
    pub priority_mediate_band: i32,
    pub priority_normalizer: i32,

    /// Fixed seed for the engine's RNG (tests).
    pub rng_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connection_limit: 32,
            bandwidth_limit: 0,
            download_lower_limit: 3,
            upload_lower_limit: 3,
            diffusion_lower_limit: 12,
            connect_loops: 3,
            accept_loops: 3,
            push_nodes_interval: 180,
            outbox_interval: 30,
            push_seeds_interval: 30,
            diffusion_round_interval: 30,
            upload_round_interval: 10,
            download_round_interval: 30,
            seeds_round_interval: 30,
            shed_interval: 300,
            prune_interval: 30,
            mediate_interval: 300,
            trim_interval: 60,
            starvation_timeout: 300,
            diffusion_fanout: 1,
            link_fanout: 2,
            request_fanout: 3,
            seed_fanout: 2,
            max_link_count: 8192,
            max_request_count: 2048,
            max_seed_request_count: 1024,
            max_seed_count: 1024,
            max_node_count: 128,
            diffusion_backlog: 10_000,
            upload_batch: 128,
            succeeded_sample: 64,
            node_sample: 128,
            addresses_per_node: 12,
            routing_removal_threshold: 100,
            peer_state_capacity: crate::peer_state::DEFAULT_TABLE_CAPACITY,
            priority_bound: 256,
            priority_mediate_band: 32,
            priority_normalizer: 256,
            rng_seed: None,
        }
    }
}

impl EngineConfig {
    pub fn priority_policy(&self) -> PriorityPolicy {
        PriorityPolicy {
            bound: self.priority_bound,
            mediate_band: self.priority_mediate_band,
            normalizer: self.priority_normalizer,
        }
    }

    pub fn outbound_limit(&self) -> usize {
        self.connection_limit / 2
    }

    pub fn inbound_limit(&self) -> usize {
        (self.connection_limit + 1) / 2
    }
}

pub(crate) fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn default_decode_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus.min(32) / 2).max(1)
}

/// Download/upload pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub decode_workers: usize,
    /// Request budget is `budget_base * priority^budget_exponent` blocks per cycle.
    pub download_budget_base: u64,
    pub download_budget_exponent: u32,
    /// Completed uploads are reaped after this many days.
    pub completed_retention_days: u64,
    pub block_length: usize,
    pub group_data_shares: usize,
    /// Parity shares per group; `None` means as many as data shares.
    pub parity_shares: Option<usize>,
    pub watch_interval: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            decode_workers: default_decode_workers(),
            download_budget_base: 256,
            download_budget_exponent: 3,
            completed_retention_days: 32,
            block_length: 1024 * 1024,
            group_data_shares: crate::store::MAX_GROUP_DATA_SHARES,
            parity_shares: None,
            watch_interval: 30,
        }
    }
}

impl PipelineConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_days * 24 * 60 * 60)
    }

    pub fn parity_for(&self, data: usize) -> usize {
        self.parity_shares.unwrap_or(data).max(1)
    }

    /// Blocks to request per scheduling cycle at `priority`.
    pub fn request_budget(&self, priority: u32) -> u64 {
        self.download_budget_base
            .saturating_mul((priority as u64).saturating_pow(self.download_budget_exponent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_table_keeps_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"connection_limit": 8}"#).unwrap();
        assert_eq!(cfg.connection_limit, 8);
        assert_eq!(cfg.request_fanout, 3);
        assert_eq!(cfg.outbound_limit(), 4);
        assert_eq!(cfg.inbound_limit(), 4);
    }

    #[test]
    fn budget_is_cubic() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.request_budget(1), 256);
        assert_eq!(cfg.request_budget(2), 2048);
        assert_eq!(cfg.request_budget(0), 0);
        assert!(cfg.decode_workers >= 1 && cfg.decode_workers <= 16);
    }
}
