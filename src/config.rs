use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Cluster configuration with sensible defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub consensus: ConsensusConfig,
    pub replication: ReplicationConfig,
    pub heartbeat: HeartbeatConfig,
    pub rebalance: RebalanceConfig,
    pub search: SearchConfig,
    pub ap: ApConfig,
    pub overlay: OverlayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Election timeout lower bound in milliseconds
    pub election_timeout_min_ms: u64,
    /// Election timeout upper bound in milliseconds
    pub election_timeout_max_ms: u64,
    /// Leader heartbeat (AppendEntries) interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// How long a submitted command may wait for commit + apply
    pub submit_timeout_ms: u64,
    /// Maximum entries per AppendEntries batch
    pub max_entries_per_append: usize,
    /// Log length that triggers snapshot compaction
    pub snapshot_threshold: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Number of replicas per document (k)
    pub replication_factor: usize,
    /// Write quorum (w); must satisfy w >= floor(k/2)+1 and w + r > k
    pub min_replicas_for_write: usize,
    /// Read quorum (r)
    pub read_quorum: usize,
    /// Per-target replication RPC timeout in milliseconds
    pub replication_timeout_ms: u64,
    /// Per-target rollback RPC timeout in milliseconds
    pub rollback_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats to every known peer in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Consecutive misses before declaring a peer unreachable
    pub max_heartbeat_failures: u32,
    /// Grace period before an unhealthy node is removed from membership
    pub remove_after_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceConfig {
    /// Interval between leader-side rebalance checks in milliseconds
    pub rebalance_interval_ms: u64,
    /// Maximum allowed |load_i - mean(load)| before triggering a rebalance
    pub rebalance_threshold: f64,
    /// Partition moves per batch
    pub rebalance_batch_size: usize,
    /// Delay between batches in milliseconds
    pub rebalance_delay_ms: u64,
    /// Number of logical document partitions
    pub partition_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Overall search deadline in milliseconds
    pub search_timeout_ms: u64,
    /// Per-node search RPC deadline in milliseconds
    pub node_timeout_ms: u64,
    /// Hard cap on results requested from a single node
    pub max_results_per_node: usize,
    /// Maximum aggregated results kept before pagination
    pub max_total_results: usize,
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// Minimum token length accepted by the query parser
    pub min_token_length: usize,
    /// Query token cap
    pub max_query_tokens: usize,
    pub enable_caching: bool,
    /// Query cache TTL in seconds
    pub cache_ttl_secs: u64,
    /// Query cache entry cap
    pub cache_max_entries: usize,
    /// Hybrid ranking weights; must sum to 1.0
    pub distance_weight: f64,
    pub recency_weight: f64,
    pub popularity_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApConfig {
    /// Partition status check interval in milliseconds
    pub partition_check_interval_ms: u64,
    /// Silence threshold before a peer counts as unreachable, in seconds
    pub partition_threshold_secs: u64,
    /// Anti-entropy loop interval in seconds
    pub anti_entropy_interval_secs: u64,
    pub enable_read_repair: bool,
    pub enable_anti_entropy: bool,
    /// Per-peer sync RPC timeout in milliseconds
    pub sync_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Hypercube dimensions (node ids are d-bit integers)
    pub dimensions: u32,
    /// Number of term shards on the consistent-hash ring
    pub num_shards: u32,
    /// Virtual nodes per shard on the ring
    pub virtual_nodes: u32,
}

impl ClusterConfig {
    /// Default configuration for production
    pub fn production() -> Self {
        ClusterConfig {
            consensus: ConsensusConfig {
                election_timeout_min_ms: 150,
                election_timeout_max_ms: 300,
                heartbeat_interval_ms: 50,
                submit_timeout_ms: 5000,
                max_entries_per_append: 100,
                snapshot_threshold: 10_000,
            },
            replication: ReplicationConfig {
                replication_factor: 3,
                min_replicas_for_write: 2,
                read_quorum: 2,
                replication_timeout_ms: 5000,
                rollback_timeout_ms: 3000,
            },
            heartbeat: HeartbeatConfig {
                heartbeat_interval_ms: 5000,
                max_heartbeat_failures: 3,
                remove_after_ms: 60_000,
            },
            rebalance: RebalanceConfig {
                rebalance_interval_ms: 300_000,
                rebalance_threshold: 0.2,
                rebalance_batch_size: 4,
                rebalance_delay_ms: 1000,
                partition_count: 64,
            },
            search: SearchConfig {
                search_timeout_ms: 10_000,
                node_timeout_ms: 5000,
                max_results_per_node: 200,
                max_total_results: 1000,
                default_page_size: 20,
                max_page_size: 100,
                min_token_length: 2,
                max_query_tokens: 100,
                enable_caching: true,
                cache_ttl_secs: 300,
                cache_max_entries: 1000,
                distance_weight: 0.6,
                recency_weight: 0.2,
                popularity_weight: 0.2,
            },
            ap: ApConfig {
                partition_check_interval_ms: 5000,
                partition_threshold_secs: 30,
                anti_entropy_interval_secs: 30,
                enable_read_repair: true,
                enable_anti_entropy: true,
                sync_timeout_ms: 2000,
            },
            overlay: OverlayConfig {
                dimensions: 20,
                num_shards: 16,
                virtual_nodes: 150,
            },
        }
    }

    /// Development configuration
    pub fn development() -> Self {
        let mut config = Self::production();
        config.rebalance.rebalance_interval_ms = 60_000;
        config.heartbeat.heartbeat_interval_ms = 2000;
        config
    }

    /// Testing configuration: small timers so clusters converge quickly
    pub fn testing() -> Self {
        let mut config = Self::production();
        config.consensus.submit_timeout_ms = 2000;
        config.replication.replication_timeout_ms = 500;
        config.replication.rollback_timeout_ms = 300;
        config.heartbeat.heartbeat_interval_ms = 100;
        config.heartbeat.max_heartbeat_failures = 2;
        config.heartbeat.remove_after_ms = 5000;
        config.rebalance.rebalance_interval_ms = 500;
        config.rebalance.rebalance_delay_ms = 10;
        config.rebalance.partition_count = 8;
        config.search.search_timeout_ms = 2000;
        config.search.node_timeout_ms = 500;
        config.ap.partition_check_interval_ms = 100;
        config.ap.partition_threshold_secs = 1;
        config.ap.anti_entropy_interval_secs = 1;
        config.ap.sync_timeout_ms = 300;
        config.overlay.dimensions = 8;
        config.overlay.num_shards = 4;
        config.overlay.virtual_nodes = 16;
        config
    }

    /// Load from JSON
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let c = &self.consensus;
        if c.election_timeout_min_ms == 0 || c.election_timeout_max_ms <= c.election_timeout_min_ms {
            errors.push("election timeout range must be non-empty".to_string());
        }
        if c.heartbeat_interval_ms >= c.election_timeout_min_ms {
            errors.push("raft heartbeat interval must be below election_timeout_min".to_string());
        }

        let r = &self.replication;
        let k = r.replication_factor;
        let majority = k / 2 + 1;
        if k == 0 {
            errors.push("replication_factor must be > 0".to_string());
        }
        if r.min_replicas_for_write < majority {
            errors.push(format!(
                "min_replicas_for_write ({}) must be >= majority ({})",
                r.min_replicas_for_write, majority
            ));
        }
        if r.read_quorum < 1 {
            errors.push("read_quorum must be >= 1".to_string());
        }
        if r.min_replicas_for_write + r.read_quorum <= k {
            errors.push(format!(
                "write quorum ({}) + read quorum ({}) must be > replication_factor ({})",
                r.min_replicas_for_write, r.read_quorum, k
            ));
        }

        if self.heartbeat.max_heartbeat_failures == 0 {
            errors.push("max_heartbeat_failures must be > 0".to_string());
        }

        let s = &self.search;
        if s.default_page_size == 0 || s.max_page_size == 0 {
            errors.push("page sizes must be > 0".to_string());
        }
        let weight_sum = s.distance_weight + s.recency_weight + s.popularity_weight;
        if (weight_sum - 1.0).abs() > 1e-6 {
            errors.push(format!("ranking weights must sum to 1.0 (got {})", weight_sum));
        }

        let o = &self.overlay;
        if o.dimensions == 0 || o.dimensions > 63 {
            errors.push("overlay dimensions must be in 1..=63".to_string());
        }
        if o.num_shards == 0 || o.virtual_nodes == 0 {
            errors.push("num_shards and virtual_nodes must be > 0".to_string());
        }

        if self.rebalance.partition_count == 0 {
            errors.push("partition_count must be > 0".to_string());
        }
        if self.rebalance.rebalance_threshold <= 0.0 {
            errors.push("rebalance_threshold must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig::production()
    }
}

impl ConsensusConfig {
    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }
}

/// Configuration builder for fluent API
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfigBuilder {
    pub fn new() -> Self {
        ClusterConfigBuilder { config: ClusterConfig::production() }
    }

    pub fn from_preset(preset: &str) -> Self {
        let config = match preset {
            "development" => ClusterConfig::development(),
            "testing" => ClusterConfig::testing(),
            _ => ClusterConfig::production(),
        };
        ClusterConfigBuilder { config }
    }

    pub fn replication_factor(mut self, k: usize) -> Self {
        self.config.replication.replication_factor = k;
        self.config.replication.min_replicas_for_write = k / 2 + 1;
        self.config.replication.read_quorum = k / 2 + 1;
        self
    }

    pub fn partition_count(mut self, count: u32) -> Self {
        self.config.rebalance.partition_count = count;
        self
    }

    pub fn dimensions(mut self, dims: u32) -> Self {
        self.config.overlay.dimensions = dims;
        self
    }

    pub fn search_timeout_ms(mut self, ms: u64) -> Self {
        self.config.search.search_timeout_ms = ms;
        self
    }

    pub fn ranking_weights(mut self, distance: f64, recency: f64, popularity: f64) -> Self {
        self.config.search.distance_weight = distance;
        self.config.search.recency_weight = recency;
        self.config.search.popularity_weight = popularity;
        self
    }

    pub fn build(self) -> anyhow::Result<ClusterConfig> {
        match self.config.validate() {
            Ok(()) => Ok(self.config),
            Err(errors) => Err(anyhow::anyhow!(
                "Configuration validation failed: {}",
                errors.join("; ")
            )),
        }
    }
}

impl Default for ClusterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_config_is_valid() {
        assert!(ClusterConfig::production().validate().is_ok());
        assert!(ClusterConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_quorum_validation() {
        let mut config = ClusterConfig::production();
        config.replication.min_replicas_for_write = 1; // below majority for k=3
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("majority")));
    }

    #[test]
    fn test_quorum_intersection_validation() {
        let mut config = ClusterConfig::production();
        config.replication.replication_factor = 5;
        config.replication.min_replicas_for_write = 3;
        config.replication.read_quorum = 2; // 3 + 2 <= 5
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("read quorum")));
    }

    #[test]
    fn test_ranking_weights_validation() {
        let mut config = ClusterConfig::production();
        config.search.distance_weight = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = ClusterConfigBuilder::from_preset("testing")
            .replication_factor(5)
            .ranking_weights(0.4, 0.4, 0.2)
            .build()
            .unwrap();
        assert_eq!(config.replication.replication_factor, 5);
        assert_eq!(config.replication.min_replicas_for_write, 3);
    }

    #[test]
    fn test_json_round_trip() {
        let config = ClusterConfig::production();
        let json = config.to_json();
        let parsed = ClusterConfig::from_json(&json).unwrap();
        assert_eq!(parsed.replication.replication_factor, 3);
        assert_eq!(parsed.overlay.virtual_nodes, 150);
    }
}
