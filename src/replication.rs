use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::ReplicationConfig;
use crate::document::Document;
use crate::error::{ClusterError, ClusterResult};
use crate::hypercube;
use crate::message::RpcMessage;
use crate::metrics::Metrics;
use crate::scatter;
use crate::state_machine::NodeId;
use crate::transport::Transport;

/// Quorum parameters for k-replica writes.
#[derive(Debug, Clone, Copy)]
pub struct QuorumConfig {
    pub replication_factor: usize,
    pub write_quorum: usize,
    pub read_quorum: usize,
}

impl QuorumConfig {
    pub fn from_config(config: &ReplicationConfig) -> Self {
        QuorumConfig {
            replication_factor: config.replication_factor,
            write_quorum: config.min_replicas_for_write,
            read_quorum: config.read_quorum,
        }
    }

    pub fn majority(&self) -> usize {
        self.replication_factor / 2 + 1
    }

    /// `w >= majority(k)`, `r >= 1`, and `w + r > k` so any read quorum
    /// intersects any successful write quorum.
    pub fn validate(&self) -> Result<(), String> {
        if self.write_quorum < self.majority() {
            return Err(format!(
                "write_quorum ({}) must be >= majority ({})",
                self.write_quorum,
                self.majority()
            ));
        }
        if self.read_quorum < 1 {
            return Err("read_quorum must be >= 1".to_string());
        }
        if self.write_quorum + self.read_quorum <= self.replication_factor {
            return Err(format!(
                "write_quorum ({}) + read_quorum ({}) must be > replication_factor ({})",
                self.write_quorum, self.read_quorum, self.replication_factor
            ));
        }
        Ok(())
    }
}

/// Outcome of a quorum write.
#[derive(Debug, Clone)]
pub struct ReplicationOutcome {
    pub replicas: Vec<NodeId>,
    pub successful: Vec<NodeId>,
}

/// Places k replicas per document and performs quorum writes with rollback.
pub struct ReplicaManager {
    node_id: NodeId,
    quorum: QuorumConfig,
    replication_timeout: Duration,
    rollback_timeout: Duration,
    transport: Arc<dyn Transport>,
    metrics: Arc<Metrics>,
}

impl ReplicaManager {
    pub fn new(
        node_id: NodeId,
        config: &ReplicationConfig,
        transport: Arc<dyn Transport>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let quorum = QuorumConfig::from_config(config);
        log::info!(
            "replica manager {}: k={} w={} r={}",
            node_id,
            quorum.replication_factor,
            quorum.write_quorum,
            quorum.read_quorum
        );
        ReplicaManager {
            node_id,
            quorum,
            replication_timeout: Duration::from_millis(config.replication_timeout_ms),
            rollback_timeout: Duration::from_millis(config.rollback_timeout_ms),
            transport,
            metrics,
        }
    }

    pub fn quorum(&self) -> QuorumConfig {
        self.quorum
    }

    /// Replica set for a document: the primary plus the XOR-closest healthy
    /// hypercube neighbors. Deterministic given the node set.
    pub fn select_replicas(&self, primary: NodeId, healthy: &[NodeId]) -> Vec<NodeId> {
        let mut replicas = vec![primary];
        let others: Vec<NodeId> = healthy.iter().copied().filter(|n| *n != primary).collect();
        let sorted = hypercube::closest_by_hamming(primary, &others);
        replicas.extend(sorted.into_iter().take(self.quorum.replication_factor - 1));
        replicas.truncate(self.quorum.replication_factor);
        replicas
    }

    /// Quorum write. The caller writes the local copy first when this node
    /// is in the replica set, so it counts toward `w`. Remaining targets
    /// get the document in parallel. On a missed quorum every successful
    /// remote is rolled back (best effort) and the write fails with
    /// `NoQuorum`; the caller undoes its local copy.
    pub async fn replicate_document(
        &self,
        doc: &Document,
        replicas: &[NodeId],
    ) -> ClusterResult<ReplicationOutcome> {
        let local_copy = replicas.contains(&self.node_id);
        let targets: Vec<NodeId> = replicas.iter().copied().filter(|n| *n != self.node_id).collect();

        let transport = Arc::clone(&self.transport);
        let from = self.node_id;
        let timeout = self.replication_timeout;
        let doc_id = doc.doc_id;
        let doc = doc.clone();

        let outcome = scatter::scatter(
            targets,
            timeout,
            timeout,
            move |peer| {
                let transport = Arc::clone(&transport);
                let doc = doc.clone();
                async move {
                    match transport
                        .request(from, peer, RpcMessage::ReplicateDoc { doc: Box::new(doc) }, timeout)
                        .await?
                    {
                        RpcMessage::ReplicateDocReply { success: true } => Ok(()),
                        RpcMessage::ReplicateDocReply { success: false } => {
                            Err(ClusterError::Unavailable(format!("node {} rejected replica", peer)))
                        }
                        other => Err(ClusterError::Internal(format!(
                            "unexpected reply to replicate_doc: {}",
                            other.kind()
                        ))),
                    }
                }
            },
        )
        .await;

        let mut successful = Vec::new();
        if local_copy {
            successful.push(self.node_id);
        }
        successful.extend(outcome.succeeded_nodes());

        let required = self.effective_write_quorum(replicas.len());
        let reached = successful.len();
        if reached >= required {
            self.metrics.record_replication(true);
            log::info!(
                "document {} replicated to {}/{} nodes",
                doc_id,
                reached,
                self.quorum.replication_factor
            );
            Ok(ReplicationOutcome { replicas: replicas.to_vec(), successful })
        } else {
            self.metrics.record_replication(false);
            log::warn!(
                "quorum missed for {} ({}/{}); rolling back successful replicas",
                doc_id,
                reached,
                required
            );
            let remotes = outcome.succeeded_nodes();
            if !remotes.is_empty() {
                self.rollback_document(doc_id, &remotes).await;
            }
            Err(ClusterError::NoQuorum { reached, required })
        }
    }

    /// With fewer healthy nodes than k the replica set shrinks; the write
    /// quorum follows it but never drops below a majority of the actual
    /// set.
    pub fn effective_write_quorum(&self, replica_set_len: usize) -> usize {
        self.quorum
            .write_quorum
            .min(replica_set_len)
            .max(replica_set_len / 2 + 1)
    }

    /// Best-effort removal of a document from `targets`. Used both for
    /// quorum rollback and for delete fan-out.
    pub async fn rollback_document(&self, doc_id: Uuid, targets: &[NodeId]) -> Vec<NodeId> {
        let remote: Vec<NodeId> = targets.iter().copied().filter(|n| *n != self.node_id).collect();
        if remote.is_empty() {
            return Vec::new();
        }
        self.metrics.record_rollback();

        let transport = Arc::clone(&self.transport);
        let from = self.node_id;
        let timeout = self.rollback_timeout;

        let outcome = scatter::scatter(remote, timeout, timeout, move |peer| {
            let transport = Arc::clone(&transport);
            async move {
                match transport
                    .request(from, peer, RpcMessage::RollbackDoc { doc_id }, timeout)
                    .await?
                {
                    RpcMessage::RollbackDocReply { .. } => Ok(()),
                    other => Err(ClusterError::Internal(format!(
                        "unexpected reply to rollback_doc: {}",
                        other.kind()
                    ))),
                }
            }
        })
        .await;

        let rolled_back = outcome.succeeded_nodes();
        log::info!("rollback of {} reached {}/{} nodes", doc_id, rolled_back.len(), targets.len());
        rolled_back
    }
}
