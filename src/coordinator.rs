use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::ap_store::ApStore;
use crate::config::RebalanceConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::heartbeat::{HeartbeatService, LivenessObserver};
use crate::hypercube;
use crate::metrics::Metrics;
use crate::raft::RaftNode;
use crate::state_machine::{
    ClusterObserver, ClusterState, Command, NodeId, NodeRole, NodeStatus, StateMachine,
};

/// A planned partition move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMove {
    pub partition_id: u32,
    pub from: NodeId,
    pub to: NodeId,
}

/// Weighted load per node: 0.4 cpu + 0.3 memory + 0.3 document fraction.
pub fn compute_loads(
    state: &ClusterState,
    gauges_of: impl Fn(NodeId) -> (f64, f64),
) -> BTreeMap<NodeId, f64> {
    let total_docs: usize = state
        .nodes
        .keys()
        .map(|n| state.documents_with_replica_on(*n).len())
        .sum();

    state
        .nodes
        .values()
        .filter(|n| n.status == NodeStatus::Healthy)
        .map(|n| {
            let (cpu, memory) = gauges_of(n.node_id);
            let doc_fraction = if total_docs == 0 {
                0.0
            } else {
                state.documents_with_replica_on(n.node_id).len() as f64 / total_docs as f64
            };
            (n.node_id, 0.4 * cpu + 0.3 * memory + 0.3 * doc_fraction)
        })
        .collect()
}

pub fn max_load_deviation(loads: &BTreeMap<NodeId, f64>) -> f64 {
    if loads.is_empty() {
        return 0.0;
    }
    let mean: f64 = loads.values().sum::<f64>() / loads.len() as f64;
    loads
        .values()
        .map(|l| (l - mean).abs())
        .fold(0.0, f64::max)
}

/// Plan up to `batch_size` partition moves from the most loaded node toward
/// the least loaded, stopping once the deviation falls under `threshold`.
/// Pure so placement decisions are testable without a cluster.
pub fn plan_rebalance(
    loads: &BTreeMap<NodeId, f64>,
    partitions_by_node: &BTreeMap<NodeId, Vec<u32>>,
    threshold: f64,
    batch_size: usize,
) -> Vec<PartitionMove> {
    let mut loads = loads.clone();
    let mut owned: BTreeMap<NodeId, Vec<u32>> = partitions_by_node.clone();
    let mut moves = Vec::new();

    while moves.len() < batch_size {
        if max_load_deviation(&loads) <= threshold {
            break;
        }

        let Some((&from, _)) = loads
            .iter()
            .filter(|(n, _)| owned.get(n).map(|p| !p.is_empty()).unwrap_or(false))
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        else {
            break;
        };
        let Some((&to, _)) = loads
            .iter()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        else {
            break;
        };
        if from == to {
            break;
        }

        let partition_id = owned.get_mut(&from).unwrap().remove(0);
        let remaining = owned.get(&from).map(|p| p.len()).unwrap_or(0);
        owned.entry(to).or_default().push(partition_id);

        // Shift the estimated per-partition share of the donor's load
        let share = loads[&from] / (remaining + 1) as f64;
        *loads.get_mut(&from).unwrap() -= share;
        *loads.get_mut(&to).unwrap() += share;

        moves.push(PartitionMove { partition_id, from, to });
    }

    moves
}

/// Owns the live cluster view on each node and drives corrective action on
/// the leader: partition assignment, failure handling, node removal and
/// periodic rebalancing. Every state mutation goes through Raft submit.
pub struct ClusterCoordinator {
    node_id: NodeId,
    config: RebalanceConfig,
    /// How long a member may stay unhealthy before it is removed
    remove_grace: Duration,
    raft: Arc<RaftNode>,
    state_machine: Arc<StateMachine>,
    heartbeat: Arc<HeartbeatService>,
    metrics: Arc<Metrics>,
}

impl ClusterCoordinator {
    pub fn new(
        node_id: NodeId,
        config: RebalanceConfig,
        remove_grace: Duration,
        raft: Arc<RaftNode>,
        state_machine: Arc<StateMachine>,
        heartbeat: Arc<HeartbeatService>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(ClusterCoordinator {
            node_id,
            config,
            remove_grace,
            raft,
            state_machine,
            heartbeat,
            metrics,
        })
    }

    pub fn is_active_master(&self) -> bool {
        self.raft.is_leader()
    }

    // ------------------------------------------------------------------
    // Join / leave
    // ------------------------------------------------------------------

    /// Leader-side join: commit membership, then make sure the newcomer
    /// carries its share of partitions (the next rebalance pass evens the
    /// rest out).
    pub async fn handle_join(&self, node_id: NodeId, address: String) -> ClusterResult<()> {
        if !self.is_active_master() {
            return Err(ClusterError::NotLeader { leader: self.raft.leader_id() });
        }

        self.raft
            .submit(
                Command::AddNode { node_id, address, role: NodeRole::Slave },
                Some(Uuid::new_v4()),
            )
            .await?;

        self.assign_unowned_partitions().await?;
        Ok(())
    }

    /// Leader-side removal: fail over the node's data, then drop it from
    /// membership.
    pub async fn handle_remove(&self, node_id: NodeId) -> ClusterResult<()> {
        if !self.is_active_master() {
            return Err(ClusterError::NotLeader { leader: self.raft.leader_id() });
        }
        self.fail_over_node(node_id).await?;
        self.raft
            .submit(Command::RemoveNode { node_id }, Some(Uuid::new_v4()))
            .await?;
        Ok(())
    }

    /// Give every unassigned partition a home, round-robin over healthy
    /// nodes.
    async fn assign_unowned_partitions(&self) -> ClusterResult<()> {
        let state = self.state_machine.snapshot();
        let healthy = state.healthy_nodes();
        if healthy.is_empty() {
            return Ok(());
        }

        for partition_id in 0..self.config.partition_count {
            let assigned = state
                .partitions
                .get(&partition_id)
                .map(|p| !p.replicas.is_empty())
                .unwrap_or(false);
            if assigned {
                continue;
            }
            let owner = healthy[partition_id as usize % healthy.len()];
            self.raft
                .submit(Command::AssignPartition { partition_id, node_id: owner }, None)
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Failure handling
    // ------------------------------------------------------------------

    /// Promote the first surviving replica of everything the failed node
    /// held and schedule re-replication to restore the replica count.
    async fn fail_over_node(&self, failed: NodeId) -> ClusterResult<()> {
        let state = self.state_machine.snapshot();
        let healthy: Vec<NodeId> = state
            .healthy_nodes()
            .into_iter()
            .filter(|n| *n != failed)
            .collect();

        for doc_id in state.documents_with_replica_on(failed) {
            let Some(meta) = state.documents.get(&doc_id) else { continue };

            if meta.primary() == Some(failed) {
                if let Some(survivor) = meta.replicas.iter().find(|n| **n != failed) {
                    self.raft
                        .submit(Command::PromoteReplica { doc_id, node_id: *survivor }, None)
                        .await?;
                }
            }
            self.raft
                .submit(Command::RemoveReplica { doc_id, node_id: failed }, None)
                .await?;

            // Restore k where a healthy stand-in exists. The new replica's
            // primary pushes the data when it sees AddReplica apply.
            let survivors: Vec<NodeId> =
                meta.replicas.iter().copied().filter(|n| *n != failed).collect();
            if let Some(new_primary) = survivors.first() {
                let candidates: Vec<NodeId> = healthy
                    .iter()
                    .copied()
                    .filter(|n| !survivors.contains(n))
                    .collect();
                if let Some(target) = hypercube::closest_by_hamming(*new_primary, &candidates).first()
                {
                    self.raft
                        .submit(Command::AddReplica { doc_id, node_id: *target }, None)
                        .await?;
                }
            }
        }

        for partition in state.partitions.values() {
            if !partition.replicas.contains(&failed) {
                continue;
            }
            let replacement = healthy
                .iter()
                .copied()
                .find(|n| !partition.replicas.contains(n))
                .or_else(|| healthy.first().copied());
            if let Some(to) = replacement {
                self.raft
                    .submit(
                        Command::MovePartition { partition_id: partition.partition_id, from: failed, to },
                        None,
                    )
                    .await?;
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Rebalancing
    // ------------------------------------------------------------------

    fn current_loads(&self) -> BTreeMap<NodeId, f64> {
        let state = self.state_machine.snapshot();
        let own_gauges = self.heartbeat.local_gauges();
        let own_id = self.node_id;
        let heartbeat = &self.heartbeat;
        compute_loads(&state, |node_id| {
            if node_id == own_id {
                (own_gauges.cpu, own_gauges.memory)
            } else {
                heartbeat
                    .peer_view(node_id)
                    .map(|(_, _, g)| (g.cpu, g.memory))
                    .unwrap_or((0.0, 0.0))
            }
        })
    }

    /// One leader-side rebalance pass. Returns the number of partitions
    /// moved.
    pub async fn rebalance_now(&self) -> ClusterResult<usize> {
        if !self.is_active_master() {
            return Err(ClusterError::NotLeader { leader: self.raft.leader_id() });
        }

        self.assign_unowned_partitions().await?;

        let loads = self.current_loads();
        let deviation = max_load_deviation(&loads);
        if deviation <= self.config.rebalance_threshold {
            log::debug!("load deviation {:.3} within threshold, no rebalance", deviation);
            return Ok(0);
        }

        log::info!("load deviation {:.3} exceeds threshold, rebalancing", deviation);
        self.metrics
            .rebalances_triggered
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let state = self.state_machine.snapshot();
        let mut partitions_by_node: BTreeMap<NodeId, Vec<u32>> = BTreeMap::new();
        for node in loads.keys() {
            partitions_by_node.insert(*node, Vec::new());
        }
        for partition in state.partitions.values() {
            if let Some(primary) = partition.primary() {
                partitions_by_node
                    .entry(primary)
                    .or_default()
                    .push(partition.partition_id);
            }
        }

        let moves = plan_rebalance(
            &loads,
            &partitions_by_node,
            self.config.rebalance_threshold,
            self.config.rebalance_batch_size,
        );

        let moved = moves.len();
        for m in moves {
            self.raft
                .submit(
                    Command::MovePartition { partition_id: m.partition_id, from: m.from, to: m.to },
                    None,
                )
                .await?;
            self.metrics
                .partitions_moved
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            tokio::time::sleep(Duration::from_millis(self.config.rebalance_delay_ms)).await;
        }

        Ok(moved)
    }

    /// Converge the replicated health flags with the local liveness view.
    /// Transitions observed before this node became leader would otherwise
    /// never make it into the replicated state.
    async fn reconcile_liveness(&self) {
        let state = self.state_machine.snapshot();
        let unreachable = self.heartbeat.unreachable_peers();

        for node in state.nodes.values() {
            if node.node_id == self.node_id {
                continue;
            }
            let is_unreachable = unreachable.contains(&node.node_id);

            if is_unreachable && node.status == NodeStatus::Healthy {
                let marked = self
                    .raft
                    .submit(
                        Command::UpdateNode {
                            node_id: node.node_id,
                            status: Some(NodeStatus::Unhealthy),
                            gauges: None,
                            document_count: None,
                        },
                        None,
                    )
                    .await;
                if marked.is_ok() {
                    if let Err(e) = self.fail_over_node(node.node_id).await {
                        log::warn!("failover for node {} incomplete: {}", node.node_id, e);
                    }
                }
            } else if !is_unreachable && node.status == NodeStatus::Unhealthy {
                let _ = self
                    .raft
                    .submit(
                        Command::UpdateNode {
                            node_id: node.node_id,
                            status: Some(NodeStatus::Healthy),
                            gauges: None,
                            document_count: None,
                        },
                        None,
                    )
                    .await;
            }
        }
    }

    /// Drop members that have stayed unhealthy past the removal grace
    /// period.
    async fn prune_dead_nodes(&self) {
        let state = self.state_machine.snapshot();
        let grace = chrono::Duration::milliseconds(self.remove_grace.as_millis() as i64)
            .max(chrono::Duration::milliseconds(1));
        for node in state.nodes.values() {
            if node.node_id == self.node_id || node.status != NodeStatus::Unhealthy {
                continue;
            }
            let silent_for = Utc::now().signed_duration_since(node.last_heartbeat);
            if silent_for > grace {
                log::warn!("removing node {} after extended unavailability", node.node_id);
                if let Err(e) = self.handle_remove(node.node_id).await {
                    log::warn!("failed to remove node {}: {}", node.node_id, e);
                }
            }
        }
    }

    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_millis(coordinator.config.rebalance_interval_ms);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
                if !coordinator.is_active_master() {
                    continue;
                }
                coordinator.reconcile_liveness().await;
                if let Err(e) = coordinator.rebalance_now().await {
                    log::debug!("rebalance pass skipped: {}", e);
                }
                coordinator.prune_dead_nodes().await;
            }
        })
    }
}

/// Membership bookkeeping: keep the Raft peer set and the AP store's node
/// registry in step with the replicated node set.
pub struct MembershipSync {
    pub raft: Arc<RaftNode>,
    pub ap_store: Arc<ApStore>,
}

impl ClusterObserver for MembershipSync {
    fn on_node_joined(&self, node_id: NodeId, _address: &str) {
        self.raft.add_peer(node_id);
        self.ap_store.register_node(node_id);
    }

    fn on_node_left(&self, node_id: NodeId) {
        self.raft.remove_peer(node_id);
        self.ap_store.unregister_node(node_id);
    }
}

/// Liveness-to-coordination bridge: a leader reacts to unreachable nodes by
/// marking them unhealthy and failing over their data; recovery restores
/// health.
pub struct FailureHandler {
    pub coordinator: Arc<ClusterCoordinator>,
}

impl LivenessObserver for FailureHandler {
    fn on_node_unreachable(&self, node_id: NodeId) {
        let coordinator = Arc::clone(&self.coordinator);
        tokio::spawn(async move {
            if !coordinator.is_active_master() {
                return;
            }
            let mark = coordinator
                .raft
                .submit(
                    Command::UpdateNode {
                        node_id,
                        status: Some(NodeStatus::Unhealthy),
                        gauges: None,
                        document_count: None,
                    },
                    None,
                )
                .await;
            if let Err(e) = mark {
                log::warn!("could not mark node {} unhealthy: {}", node_id, e);
                return;
            }
            if let Err(e) = coordinator.fail_over_node(node_id).await {
                log::warn!("failover for node {} incomplete: {}", node_id, e);
            }
        });
    }

    fn on_node_recovered(&self, node_id: NodeId) {
        let coordinator = Arc::clone(&self.coordinator);
        tokio::spawn(async move {
            if !coordinator.is_active_master() {
                return;
            }
            let _ = coordinator
                .raft
                .submit(
                    Command::UpdateNode {
                        node_id,
                        status: Some(NodeStatus::Healthy),
                        gauges: None,
                        document_count: None,
                    },
                    None,
                )
                .await;
        });
    }
}
