use std::fmt::Write;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ap_store::PartitionStatus;
use crate::metrics::Metrics;
use crate::raft::RaftRole;
use crate::state_machine::NodeId;

/// Aggregate node health for the Health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub node_id: NodeId,
    pub role: RaftRole,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub partition_status: PartitionStatus,
    pub nodes_total: usize,
    pub nodes_healthy: usize,
    pub documents: usize,
    pub pending_sync: usize,
}

/// Prometheus-compatible metrics exporter
pub struct PrometheusExporter {
    metrics: Arc<Metrics>,
}

impl PrometheusExporter {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        PrometheusExporter { metrics }
    }

    /// Generate Prometheus metrics in text format
    pub fn export(&self) -> String {
        let snapshot = self.metrics.snapshot();
        let mut output = String::new();

        writeln!(output, "# HELP hypersearch_raft_elections_total Total elections started").unwrap();
        writeln!(output, "# TYPE hypersearch_raft_elections_total counter").unwrap();
        writeln!(output, "hypersearch_raft_elections_total {}", snapshot.raft_elections).unwrap();

        writeln!(output, "# HELP hypersearch_raft_commits_total Total log entries committed").unwrap();
        writeln!(output, "# TYPE hypersearch_raft_commits_total counter").unwrap();
        writeln!(output, "hypersearch_raft_commits_total {}", snapshot.raft_commits).unwrap();

        writeln!(output, "# HELP hypersearch_raft_leader_changes_total Leadership changes observed").unwrap();
        writeln!(output, "# TYPE hypersearch_raft_leader_changes_total counter").unwrap();
        writeln!(output, "hypersearch_raft_leader_changes_total {}", snapshot.raft_leader_changes).unwrap();

        writeln!(output, "# HELP hypersearch_searches_total Total searches executed").unwrap();
        writeln!(output, "# TYPE hypersearch_searches_total counter").unwrap();
        writeln!(output, "hypersearch_searches_total {}", snapshot.searches_total).unwrap();

        writeln!(output, "# HELP hypersearch_searches_failed_total Searches that failed outright").unwrap();
        writeln!(output, "# TYPE hypersearch_searches_failed_total counter").unwrap();
        writeln!(output, "hypersearch_searches_failed_total {}", snapshot.searches_failed).unwrap();

        writeln!(output, "# HELP hypersearch_search_cache_hits_total Query cache hits").unwrap();
        writeln!(output, "# TYPE hypersearch_search_cache_hits_total counter").unwrap();
        writeln!(output, "hypersearch_search_cache_hits_total {}", snapshot.search_cache_hits).unwrap();

        writeln!(output, "# HELP hypersearch_search_cache_misses_total Query cache misses").unwrap();
        writeln!(output, "# TYPE hypersearch_search_cache_misses_total counter").unwrap();
        writeln!(output, "hypersearch_search_cache_misses_total {}", snapshot.search_cache_misses).unwrap();

        writeln!(output, "# HELP hypersearch_node_queries_failed_total Per-node search failures").unwrap();
        writeln!(output, "# TYPE hypersearch_node_queries_failed_total counter").unwrap();
        writeln!(output, "hypersearch_node_queries_failed_total {}", snapshot.node_queries_failed).unwrap();

        writeln!(output, "# HELP hypersearch_fallback_queries_total Replica fallback probes").unwrap();
        writeln!(output, "# TYPE hypersearch_fallback_queries_total counter").unwrap();
        writeln!(output, "hypersearch_fallback_queries_total {}", snapshot.fallback_queries).unwrap();

        writeln!(output, "# HELP hypersearch_replications_attempted_total Quorum writes attempted").unwrap();
        writeln!(output, "# TYPE hypersearch_replications_attempted_total counter").unwrap();
        writeln!(output, "hypersearch_replications_attempted_total {}", snapshot.replications_attempted).unwrap();

        writeln!(output, "# HELP hypersearch_replications_failed_total Quorum writes that missed quorum").unwrap();
        writeln!(output, "# TYPE hypersearch_replications_failed_total counter").unwrap();
        writeln!(output, "hypersearch_replications_failed_total {}", snapshot.replications_failed).unwrap();

        writeln!(output, "# HELP hypersearch_rollbacks_total Replication rollbacks issued").unwrap();
        writeln!(output, "# TYPE hypersearch_rollbacks_total counter").unwrap();
        writeln!(output, "hypersearch_rollbacks_total {}", snapshot.rollbacks).unwrap();

        writeln!(output, "# HELP hypersearch_documents_indexed_total Documents indexed").unwrap();
        writeln!(output, "# TYPE hypersearch_documents_indexed_total counter").unwrap();
        writeln!(output, "hypersearch_documents_indexed_total {}", snapshot.documents_indexed).unwrap();

        writeln!(output, "# HELP hypersearch_documents_deleted_total Documents deleted").unwrap();
        writeln!(output, "# TYPE hypersearch_documents_deleted_total counter").unwrap();
        writeln!(output, "hypersearch_documents_deleted_total {}", snapshot.documents_deleted).unwrap();

        writeln!(output, "# HELP hypersearch_heartbeats_sent_total Heartbeats sent").unwrap();
        writeln!(output, "# TYPE hypersearch_heartbeats_sent_total counter").unwrap();
        writeln!(output, "hypersearch_heartbeats_sent_total {}", snapshot.heartbeats_sent).unwrap();

        writeln!(output, "# HELP hypersearch_heartbeats_received_total Heartbeats received").unwrap();
        writeln!(output, "# TYPE hypersearch_heartbeats_received_total counter").unwrap();
        writeln!(output, "hypersearch_heartbeats_received_total {}", snapshot.heartbeats_received).unwrap();

        writeln!(output, "# HELP hypersearch_nodes_unreachable_total Nodes declared unreachable").unwrap();
        writeln!(output, "# TYPE hypersearch_nodes_unreachable_total counter").unwrap();
        writeln!(output, "hypersearch_nodes_unreachable_total {}", snapshot.nodes_marked_unreachable).unwrap();

        writeln!(output, "# HELP hypersearch_ap_writes_total AP store writes accepted").unwrap();
        writeln!(output, "# TYPE hypersearch_ap_writes_total counter").unwrap();
        writeln!(output, "hypersearch_ap_writes_total {}", snapshot.ap_writes).unwrap();

        writeln!(output, "# HELP hypersearch_ap_conflicts_total Concurrent-write conflicts detected").unwrap();
        writeln!(output, "# TYPE hypersearch_ap_conflicts_total counter").unwrap();
        writeln!(output, "hypersearch_ap_conflicts_total {}", snapshot.ap_conflicts).unwrap();

        writeln!(output, "# HELP hypersearch_ap_pending_syncs Queued writes awaiting partition heal").unwrap();
        writeln!(output, "# TYPE hypersearch_ap_pending_syncs gauge").unwrap();
        writeln!(output, "hypersearch_ap_pending_syncs {}", snapshot.ap_pending_syncs).unwrap();

        writeln!(output, "# HELP hypersearch_rebalances_triggered_total Rebalance passes that moved data").unwrap();
        writeln!(output, "# TYPE hypersearch_rebalances_triggered_total counter").unwrap();
        writeln!(output, "hypersearch_rebalances_triggered_total {}", snapshot.rebalances_triggered).unwrap();

        writeln!(output, "# HELP hypersearch_partitions_moved_total Partitions moved by rebalancing").unwrap();
        writeln!(output, "# TYPE hypersearch_partitions_moved_total counter").unwrap();
        writeln!(output, "hypersearch_partitions_moved_total {}", snapshot.partitions_moved).unwrap();

        // Derived metrics
        writeln!(output, "# HELP hypersearch_cache_hit_rate Query cache hit rate percentage").unwrap();
        writeln!(output, "# TYPE hypersearch_cache_hit_rate gauge").unwrap();
        writeln!(output, "hypersearch_cache_hit_rate {:.2}", snapshot.cache_hit_rate()).unwrap();

        writeln!(output, "# HELP hypersearch_replication_success_rate Quorum write success percentage").unwrap();
        writeln!(output, "# TYPE hypersearch_replication_success_rate gauge").unwrap();
        writeln!(output, "hypersearch_replication_success_rate {:.2}", snapshot.replication_success_rate()).unwrap();

        output
    }
}
