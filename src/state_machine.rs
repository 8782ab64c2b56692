use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::raft_log::LogEntry;

/// Stable node identifier: a d-bit integer on the hypercube overlay.
pub type NodeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Slave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Resource gauges reported by heartbeats, all fractions in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadGauges {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

/// Replicated view of one cluster member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub node_id: NodeId,
    pub address: String,
    pub role: NodeRole,
    pub status: NodeStatus,
    pub gauges: LoadGauges,
    pub document_count: u64,
    pub partition_count: u64,
    pub last_heartbeat: DateTime<Utc>,
}

/// A partition's placement. `replicas[0]` is always the primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub partition_id: u32,
    pub replicas: Vec<NodeId>,
}

impl PartitionEntry {
    pub fn primary(&self) -> Option<NodeId> {
        self.replicas.first().copied()
    }
}

/// Replicated metadata for one document (content lives in node-local
/// stores). `replicas[0]` is the primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub doc_id: Uuid,
    pub partition_id: u32,
    pub replicas: Vec<NodeId>,
}

impl DocumentMeta {
    pub fn primary(&self) -> Option<NodeId> {
        self.replicas.first().copied()
    }
}

/// Commands replicated through the Raft log. One closed enum; dispatch is
/// an exhaustive match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    AddNode { node_id: NodeId, address: String, role: NodeRole },
    RemoveNode { node_id: NodeId },
    UpdateNode {
        node_id: NodeId,
        status: Option<NodeStatus>,
        gauges: Option<LoadGauges>,
        document_count: Option<u64>,
    },
    AssignPartition { partition_id: u32, node_id: NodeId },
    MovePartition { partition_id: u32, from: NodeId, to: NodeId },
    RegisterDocument { doc_id: Uuid, partition_id: u32, replicas: Vec<NodeId> },
    RemoveDocument { doc_id: Uuid },
    AddReplica { doc_id: Uuid, node_id: NodeId },
    RemoveReplica { doc_id: Uuid, node_id: NodeId },
    /// Make `node_id` the document's primary (first replica)
    PromoteReplica { doc_id: Uuid, node_id: NodeId },
    UpdateConfig { key: String, value: String },
    Noop,
}

/// The replicated state machine contents: node set, partition table,
/// document placement and configuration overrides.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ClusterState {
    pub nodes: BTreeMap<NodeId, NodeEntry>,
    pub partitions: BTreeMap<u32, PartitionEntry>,
    pub documents: BTreeMap<Uuid, DocumentMeta>,
    pub config: BTreeMap<String, String>,
}

impl ClusterState {
    pub fn healthy_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.status == NodeStatus::Healthy)
            .map(|n| n.node_id)
            .collect()
    }

    pub fn partitions_on(&self, node_id: NodeId) -> Vec<u32> {
        self.partitions
            .values()
            .filter(|p| p.replicas.contains(&node_id))
            .map(|p| p.partition_id)
            .collect()
    }

    pub fn documents_with_replica_on(&self, node_id: NodeId) -> Vec<Uuid> {
        self.documents
            .values()
            .filter(|d| d.replicas.contains(&node_id))
            .map(|d| d.doc_id)
            .collect()
    }
}

/// Observer callbacks fired after state changes are applied. All default
/// to no-ops so implementors pick what they need.
pub trait ClusterObserver: Send + Sync {
    fn on_node_joined(&self, _node_id: NodeId, _address: &str) {}
    fn on_node_left(&self, _node_id: NodeId) {}
    fn on_leader_change(&self, _leader: Option<NodeId>) {}
    /// A replica was added for a document; the holder of the data pushes a
    /// copy to the new target.
    fn on_replica_added(&self, _doc_id: Uuid, _target: NodeId) {}
    /// A partition changed hands; the donor streams its documents over.
    fn on_partition_moved(&self, _partition_id: u32, _from: NodeId, _to: NodeId) {}
}

/// Applies committed log entries, in order, identically on every node.
///
/// Duplicate submissions are filtered by request id: a retried command with
/// a request id already applied is skipped.
pub struct StateMachine {
    state: RwLock<ClusterState>,
    applied_requests: Mutex<AppliedRequests>,
    observers: Mutex<Vec<Box<dyn ClusterObserver>>>,
}

struct AppliedRequests {
    seen: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    max: usize,
}

impl StateMachine {
    pub fn new() -> Self {
        StateMachine {
            state: RwLock::new(ClusterState::default()),
            applied_requests: Mutex::new(AppliedRequests {
                seen: HashSet::new(),
                order: VecDeque::new(),
                max: 10_000,
            }),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn register_observer(&self, observer: Box<dyn ClusterObserver>) {
        self.observers.lock().unwrap().push(observer);
    }

    pub fn notify_leader_change(&self, leader: Option<NodeId>) {
        for obs in self.observers.lock().unwrap().iter() {
            obs.on_leader_change(leader);
        }
    }

    /// Apply a committed entry. Returns false when skipped as a duplicate.
    pub fn apply(&self, entry: &LogEntry) -> bool {
        if let Some(request_id) = entry.request_id {
            let mut applied = self.applied_requests.lock().unwrap();
            if applied.seen.contains(&request_id) {
                log::debug!("skipping duplicate request {}", request_id);
                return false;
            }
            applied.seen.insert(request_id);
            applied.order.push_back(request_id);
            while applied.order.len() > applied.max {
                if let Some(old) = applied.order.pop_front() {
                    applied.seen.remove(&old);
                }
            }
        }

        let mut joined: Option<(NodeId, String)> = None;
        let mut left: Option<NodeId> = None;
        let mut replica_added: Option<(Uuid, NodeId)> = None;
        let mut partition_moved: Option<(u32, NodeId, NodeId)> = None;

        {
            let mut state = self.state.write().unwrap();
            match &entry.command {
                Command::AddNode { node_id, address, role } => {
                    let fresh = !state.nodes.contains_key(node_id);
                    state.nodes.insert(*node_id, NodeEntry {
                        node_id: *node_id,
                        address: address.clone(),
                        role: *role,
                        status: NodeStatus::Healthy,
                        gauges: LoadGauges::default(),
                        document_count: 0,
                        partition_count: 0,
                        last_heartbeat: Utc::now(),
                    });
                    if fresh {
                        joined = Some((*node_id, address.clone()));
                    }
                    log::info!("applied add_node {}", node_id);
                }
                Command::RemoveNode { node_id } => {
                    if state.nodes.remove(node_id).is_some() {
                        left = Some(*node_id);
                        log::info!("applied remove_node {}", node_id);
                    }
                    for partition in state.partitions.values_mut() {
                        partition.replicas.retain(|n| n != node_id);
                    }
                    for doc in state.documents.values_mut() {
                        doc.replicas.retain(|n| n != node_id);
                    }
                }
                Command::UpdateNode { node_id, status, gauges, document_count } => {
                    if let Some(node) = state.nodes.get_mut(node_id) {
                        if let Some(status) = status {
                            node.status = *status;
                        }
                        if let Some(gauges) = gauges {
                            node.gauges = *gauges;
                        }
                        if let Some(count) = document_count {
                            node.document_count = *count;
                        }
                        node.last_heartbeat = Utc::now();
                    }
                }
                Command::AssignPartition { partition_id, node_id } => {
                    let entry = state
                        .partitions
                        .entry(*partition_id)
                        .or_insert_with(|| PartitionEntry {
                            partition_id: *partition_id,
                            replicas: Vec::new(),
                        });
                    if !entry.replicas.contains(node_id) {
                        entry.replicas.push(*node_id);
                    }
                    Self::refresh_partition_counts(&mut state);
                    log::info!("assigned partition {} to node {}", partition_id, node_id);
                }
                Command::MovePartition { partition_id, from, to } => {
                    if let Some(partition) = state.partitions.get_mut(partition_id) {
                        for replica in partition.replicas.iter_mut() {
                            if replica == from {
                                *replica = *to;
                            }
                        }
                        partition.replicas.dedup();
                        partition_moved = Some((*partition_id, *from, *to));
                        log::info!("moved partition {} from {} to {}", partition_id, from, to);
                    }
                    Self::refresh_partition_counts(&mut state);
                }
                Command::RegisterDocument { doc_id, partition_id, replicas } => {
                    state.documents.insert(*doc_id, DocumentMeta {
                        doc_id: *doc_id,
                        partition_id: *partition_id,
                        replicas: replicas.clone(),
                    });
                }
                Command::RemoveDocument { doc_id } => {
                    state.documents.remove(doc_id);
                }
                Command::AddReplica { doc_id, node_id } => {
                    if let Some(doc) = state.documents.get_mut(doc_id) {
                        if !doc.replicas.contains(node_id) {
                            doc.replicas.push(*node_id);
                            replica_added = Some((*doc_id, *node_id));
                        }
                    }
                }
                Command::RemoveReplica { doc_id, node_id } => {
                    if let Some(doc) = state.documents.get_mut(doc_id) {
                        doc.replicas.retain(|n| n != node_id);
                    }
                }
                Command::PromoteReplica { doc_id, node_id } => {
                    if let Some(doc) = state.documents.get_mut(doc_id) {
                        doc.replicas.retain(|n| n != node_id);
                        doc.replicas.insert(0, *node_id);
                        log::info!("promoted node {} to primary for {}", node_id, doc_id);
                    }
                }
                Command::UpdateConfig { key, value } => {
                    state.config.insert(key.clone(), value.clone());
                    log::info!("config override {} = {}", key, value);
                }
                Command::Noop => {}
            }
        }

        let observers = self.observers.lock().unwrap();
        if let Some((node_id, address)) = joined {
            for obs in observers.iter() {
                obs.on_node_joined(node_id, &address);
            }
        }
        if let Some(node_id) = left {
            for obs in observers.iter() {
                obs.on_node_left(node_id);
            }
        }
        if let Some((doc_id, target)) = replica_added {
            for obs in observers.iter() {
                obs.on_replica_added(doc_id, target);
            }
        }
        if let Some((partition_id, from, to)) = partition_moved {
            for obs in observers.iter() {
                obs.on_partition_moved(partition_id, from, to);
            }
        }

        true
    }

    fn refresh_partition_counts(state: &mut ClusterState) {
        let mut counts: BTreeMap<NodeId, u64> = BTreeMap::new();
        for partition in state.partitions.values() {
            for replica in &partition.replicas {
                *counts.entry(*replica).or_insert(0) += 1;
            }
        }
        for node in state.nodes.values_mut() {
            node.partition_count = counts.get(&node.node_id).copied().unwrap_or(0);
        }
    }

    pub fn snapshot(&self) -> ClusterState {
        self.state.read().unwrap().clone()
    }

    pub fn node(&self, node_id: NodeId) -> Option<NodeEntry> {
        self.state.read().unwrap().nodes.get(&node_id).cloned()
    }

    pub fn nodes(&self) -> Vec<NodeEntry> {
        self.state.read().unwrap().nodes.values().cloned().collect()
    }

    pub fn healthy_nodes(&self) -> Vec<NodeId> {
        self.state.read().unwrap().healthy_nodes()
    }

    pub fn peer_addresses(&self, exclude: NodeId) -> Vec<(NodeId, String)> {
        self.state
            .read()
            .unwrap()
            .nodes
            .values()
            .filter(|n| n.node_id != exclude)
            .map(|n| (n.node_id, n.address.clone()))
            .collect()
    }

    pub fn partition(&self, partition_id: u32) -> Option<PartitionEntry> {
        self.state.read().unwrap().partitions.get(&partition_id).cloned()
    }

    pub fn partitions(&self) -> Vec<PartitionEntry> {
        self.state.read().unwrap().partitions.values().cloned().collect()
    }

    pub fn document(&self, doc_id: &Uuid) -> Option<DocumentMeta> {
        self.state.read().unwrap().documents.get(doc_id).cloned()
    }

    pub fn document_count(&self) -> usize {
        self.state.read().unwrap().documents.len()
    }

    pub fn replicas_of(&self, doc_id: &Uuid) -> Vec<NodeId> {
        self.state
            .read()
            .unwrap()
            .documents
            .get(doc_id)
            .map(|d| d.replicas.clone())
            .unwrap_or_default()
    }

    pub fn config_value(&self, key: &str) -> Option<String> {
        self.state.read().unwrap().config.get(key).cloned()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
