use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cluster-wide metrics collection
#[derive(Debug, Clone)]
pub struct Metrics {
    // Consensus metrics
    pub raft_elections: Arc<AtomicU64>,
    pub raft_commits: Arc<AtomicU64>,
    pub raft_leader_changes: Arc<AtomicU64>,

    // Search metrics
    pub searches_total: Arc<AtomicU64>,
    pub searches_failed: Arc<AtomicU64>,
    pub search_cache_hits: Arc<AtomicU64>,
    pub search_cache_misses: Arc<AtomicU64>,
    pub node_queries_failed: Arc<AtomicU64>,
    pub fallback_queries: Arc<AtomicU64>,

    // Replication metrics
    pub replications_attempted: Arc<AtomicU64>,
    pub replications_successful: Arc<AtomicU64>,
    pub replications_failed: Arc<AtomicU64>,
    pub rollbacks: Arc<AtomicU64>,

    // Document metrics
    pub documents_indexed: Arc<AtomicU64>,
    pub documents_deleted: Arc<AtomicU64>,

    // Liveness metrics
    pub heartbeats_sent: Arc<AtomicU64>,
    pub heartbeats_received: Arc<AtomicU64>,
    pub nodes_marked_unreachable: Arc<AtomicU64>,

    // AP store metrics
    pub ap_writes: Arc<AtomicU64>,
    pub ap_conflicts: Arc<AtomicU64>,
    pub ap_pending_syncs: Arc<AtomicU64>,

    // Rebalance metrics
    pub rebalances_triggered: Arc<AtomicU64>,
    pub partitions_moved: Arc<AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            raft_elections: Arc::new(AtomicU64::new(0)),
            raft_commits: Arc::new(AtomicU64::new(0)),
            raft_leader_changes: Arc::new(AtomicU64::new(0)),

            searches_total: Arc::new(AtomicU64::new(0)),
            searches_failed: Arc::new(AtomicU64::new(0)),
            search_cache_hits: Arc::new(AtomicU64::new(0)),
            search_cache_misses: Arc::new(AtomicU64::new(0)),
            node_queries_failed: Arc::new(AtomicU64::new(0)),
            fallback_queries: Arc::new(AtomicU64::new(0)),

            replications_attempted: Arc::new(AtomicU64::new(0)),
            replications_successful: Arc::new(AtomicU64::new(0)),
            replications_failed: Arc::new(AtomicU64::new(0)),
            rollbacks: Arc::new(AtomicU64::new(0)),

            documents_indexed: Arc::new(AtomicU64::new(0)),
            documents_deleted: Arc::new(AtomicU64::new(0)),

            heartbeats_sent: Arc::new(AtomicU64::new(0)),
            heartbeats_received: Arc::new(AtomicU64::new(0)),
            nodes_marked_unreachable: Arc::new(AtomicU64::new(0)),

            ap_writes: Arc::new(AtomicU64::new(0)),
            ap_conflicts: Arc::new(AtomicU64::new(0)),
            ap_pending_syncs: Arc::new(AtomicU64::new(0)),

            rebalances_triggered: Arc::new(AtomicU64::new(0)),
            partitions_moved: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_search(&self) {
        self.searches_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_search_failure(&self) {
        self.searches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.search_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.search_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replication(&self, success: bool) {
        self.replications_attempted.fetch_add(1, Ordering::Relaxed);
        if success {
            self.replications_successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.replications_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_election(&self) {
        self.raft_elections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.raft_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            raft_elections: self.raft_elections.load(Ordering::Relaxed),
            raft_commits: self.raft_commits.load(Ordering::Relaxed),
            raft_leader_changes: self.raft_leader_changes.load(Ordering::Relaxed),
            searches_total: self.searches_total.load(Ordering::Relaxed),
            searches_failed: self.searches_failed.load(Ordering::Relaxed),
            search_cache_hits: self.search_cache_hits.load(Ordering::Relaxed),
            search_cache_misses: self.search_cache_misses.load(Ordering::Relaxed),
            node_queries_failed: self.node_queries_failed.load(Ordering::Relaxed),
            fallback_queries: self.fallback_queries.load(Ordering::Relaxed),
            replications_attempted: self.replications_attempted.load(Ordering::Relaxed),
            replications_successful: self.replications_successful.load(Ordering::Relaxed),
            replications_failed: self.replications_failed.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            documents_indexed: self.documents_indexed.load(Ordering::Relaxed),
            documents_deleted: self.documents_deleted.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeats_received: self.heartbeats_received.load(Ordering::Relaxed),
            nodes_marked_unreachable: self.nodes_marked_unreachable.load(Ordering::Relaxed),
            ap_writes: self.ap_writes.load(Ordering::Relaxed),
            ap_conflicts: self.ap_conflicts.load(Ordering::Relaxed),
            ap_pending_syncs: self.ap_pending_syncs.load(Ordering::Relaxed),
            rebalances_triggered: self.rebalances_triggered.load(Ordering::Relaxed),
            partitions_moved: self.partitions_moved.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub raft_elections: u64,
    pub raft_commits: u64,
    pub raft_leader_changes: u64,
    pub searches_total: u64,
    pub searches_failed: u64,
    pub search_cache_hits: u64,
    pub search_cache_misses: u64,
    pub node_queries_failed: u64,
    pub fallback_queries: u64,
    pub replications_attempted: u64,
    pub replications_successful: u64,
    pub replications_failed: u64,
    pub rollbacks: u64,
    pub documents_indexed: u64,
    pub documents_deleted: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
    pub nodes_marked_unreachable: u64,
    pub ap_writes: u64,
    pub ap_conflicts: u64,
    pub ap_pending_syncs: u64,
    pub rebalances_triggered: u64,
    pub partitions_moved: u64,
}

impl MetricsSnapshot {
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.search_cache_hits + self.search_cache_misses;
        if total == 0 {
            0.0
        } else {
            self.search_cache_hits as f64 / total as f64 * 100.0
        }
    }

    pub fn replication_success_rate(&self) -> f64 {
        if self.replications_attempted == 0 {
            0.0
        } else {
            self.replications_successful as f64 / self.replications_attempted as f64 * 100.0
        }
    }
}
