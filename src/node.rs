use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::aggregate::{AggregatedResults, SearchHit};
use crate::ap_store::{ApStore, DataFreshness, PartitionStatus};
use crate::config::ClusterConfig;
use crate::coordinator::{ClusterCoordinator, FailureHandler, MembershipSync};
use crate::document::Document;
use crate::error::{ClusterError, ClusterResult};
use crate::heartbeat::HeartbeatService;
use crate::index::InvertedIndex;
use crate::message::RpcMessage;
use crate::metrics::Metrics;
use crate::monitoring::{HealthReport, PrometheusExporter};
use crate::raft::RaftNode;
use crate::replication::ReplicaManager;
use crate::search::{DistributedSearch, SearchRequest};
use crate::shard::{shard_owner, HashRing, ShardDirectory};
use crate::state_machine::{
    ClusterObserver, Command, NodeEntry, NodeId, NodeRole, PartitionEntry, StateMachine,
};
use crate::transport::{Delivery, Transport};
use crate::vectorize::VectorizerSet;

/// Success payload of a client operation: the data plus freshness and any
/// degradation warnings.
#[derive(Debug, Clone, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
    pub freshness: Option<DataFreshness>,
    pub warnings: Vec<String>,
}

impl<T> ApiOk<T> {
    pub fn plain(data: T) -> Self {
        ApiOk { data, freshness: None, warnings: Vec::new() }
    }
}

/// Failure payload: kind, message, retryability and an optional leader to
/// retry against.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
    pub leader_hint: Option<NodeId>,
}

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        ApiError {
            kind: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
            leader_hint: err.leader_hint(),
        }
    }
}

pub type ApiResult<T> = Result<ApiOk<T>, ApiError>;

/// Placement summary returned by document writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentReceipt {
    pub doc_id: Uuid,
    pub partition_id: u32,
    pub replicas: Vec<NodeId>,
}

/// Node listing entry: replicated view plus local liveness overlay.
#[derive(Debug, Clone, Serialize)]
pub struct NodeDetails {
    pub entry: NodeEntry,
    pub reachable: bool,
    pub last_contact: Option<DateTime<Utc>>,
}

/// One node of the cluster: the dependency container that wires consensus,
/// liveness, replication, the AP store, the local index and the query
/// plane together, and dispatches the RPC surface.
///
/// All components are built at startup and injected through constructors;
/// there is no process-wide state.
pub struct SearchNode {
    node_id: NodeId,
    address: String,
    config: ClusterConfig,
    transport: Arc<dyn Transport>,

    metrics: Arc<Metrics>,
    state_machine: Arc<StateMachine>,
    raft: Arc<RaftNode>,
    ap_store: Arc<ApStore>,
    heartbeat: Arc<HeartbeatService>,
    coordinator: Arc<ClusterCoordinator>,
    replication: Arc<ReplicaManager>,
    search: DistributedSearch,
    index: Arc<RwLock<InvertedIndex>>,
    shard_dir: Arc<Mutex<ShardDirectory>>,
    ring: HashRing,

    data_dir: Option<PathBuf>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SearchNode {
    pub fn new(
        node_id: NodeId,
        address: String,
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
        data_dir: Option<PathBuf>,
    ) -> anyhow::Result<Arc<Self>> {
        if let Err(errors) = config.validate() {
            anyhow::bail!("invalid configuration: {}", errors.join("; "));
        }

        let metrics = Arc::new(Metrics::new());
        let state_machine = Arc::new(StateMachine::new());
        let vectorizers = Arc::new(VectorizerSet::standard());

        let raft = RaftNode::new(
            node_id,
            config.consensus.clone(),
            Arc::clone(&transport),
            Arc::clone(&state_machine),
            data_dir.clone(),
            Arc::clone(&metrics),
        )?;

        let ap_store = Arc::new(ApStore::new(
            node_id,
            config.ap.clone(),
            Arc::clone(&transport),
            data_dir.clone(),
            Arc::clone(&metrics),
        ));

        let heartbeat = HeartbeatService::new(
            node_id,
            config.heartbeat.clone(),
            Arc::clone(&transport),
            Arc::clone(&state_machine),
            Arc::clone(&ap_store),
            Arc::clone(&metrics),
        );

        let coordinator = ClusterCoordinator::new(
            node_id,
            config.rebalance.clone(),
            Duration::from_millis(config.heartbeat.remove_after_ms),
            Arc::clone(&raft),
            Arc::clone(&state_machine),
            Arc::clone(&heartbeat),
            Arc::clone(&metrics),
        );

        let replication = Arc::new(ReplicaManager::new(
            node_id,
            &config.replication,
            Arc::clone(&transport),
            Arc::clone(&metrics),
        ));

        let ring = HashRing::new(config.overlay.num_shards, config.overlay.virtual_nodes);
        let shard_dir = Arc::new(Mutex::new(ShardDirectory::new()));

        let index = match &data_dir {
            Some(dir) => InvertedIndex::load(&dir.join("index"))?,
            None => InvertedIndex::new(),
        };
        let index = Arc::new(RwLock::new(index));

        let search = DistributedSearch::new(
            node_id,
            config.search.clone(),
            Arc::clone(&vectorizers),
            Arc::clone(&transport),
            Arc::clone(&state_machine),
            ring.clone(),
            Arc::clone(&shard_dir),
            Arc::clone(&metrics),
        );

        let (shutdown_tx, _) = watch::channel(false);

        let node = Arc::new(SearchNode {
            node_id,
            address,
            config,
            transport,
            metrics,
            state_machine,
            raft,
            ap_store,
            heartbeat,
            coordinator,
            replication,
            search,
            index,
            shard_dir,
            ring,
            data_dir,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        // Observer wiring: membership changes feed Raft and the AP store,
        // liveness transitions feed the coordinator, replica additions and
        // partition moves trigger data pushes from the holder.
        node.state_machine.register_observer(Box::new(MembershipSync {
            raft: Arc::clone(&node.raft),
            ap_store: Arc::clone(&node.ap_store),
        }));
        node.heartbeat
            .register_observer(Box::new(FailureHandler { coordinator: Arc::clone(&node.coordinator) }));
        node.state_machine
            .register_observer(Box::new(DataMover { node: Arc::downgrade(&node) }));

        Ok(node)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    pub fn ap_store(&self) -> &Arc<ApStore> {
        &self.ap_store
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.state_machine
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Report this node's resource gauges; carried on every heartbeat and
    /// consumed by the leader's rebalance planning.
    pub fn set_load_gauges(&self, gauges: crate::state_machine::LoadGauges) {
        self.heartbeat.set_local_gauges(gauges);
    }

    /// Seed the Raft peer set and AP registry before the first election,
    /// e.g. from a static bootstrap list.
    pub fn add_seed_peer(&self, node_id: NodeId) {
        self.raft.add_peer(node_id);
        self.ap_store.register_node(node_id);
    }

    /// Form (or re-join) the replicated membership: wait for a leader and,
    /// if that is us, commit our own membership and seed the partition
    /// table.
    pub async fn bootstrap(&self) -> ClusterResult<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while self.raft.leader_id().is_none() {
            if tokio::time::Instant::now() > deadline {
                return Err(ClusterError::Timeout(Duration::from_secs(10)));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        if self.raft.is_leader() {
            self.raft
                .submit(
                    Command::AddNode {
                        node_id: self.node_id,
                        address: self.address.clone(),
                        role: NodeRole::Master,
                    },
                    Some(Uuid::new_v4()),
                )
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn start(self: &Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Delivery>) {
        let shutdown_rx = self.shutdown_tx.subscribe();
        let mut tasks = self.tasks.lock().unwrap();

        // RPC serve loop
        {
            let node = Arc::clone(self);
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let delivery = tokio::select! {
                        delivery = inbox.recv() => delivery,
                        _ = shutdown.changed() => break,
                    };
                    let Some(delivery) = delivery else { break };
                    let node = Arc::clone(&node);
                    tokio::spawn(async move {
                        let response = node.dispatch(delivery.envelope.msg).await;
                        let _ = delivery.reply.send(response);
                    });
                }
            }));
        }

        tasks.extend(self.raft.start(shutdown_rx.clone()));
        tasks.push(self.heartbeat.start(shutdown_rx.clone()));
        tasks.push(self.coordinator.start(shutdown_rx.clone()));
        tasks.push(tokio::spawn(Arc::clone(&self.ap_store).run_monitor(shutdown_rx.clone())));
        tasks.push(tokio::spawn(Arc::clone(&self.ap_store).run_anti_entropy(shutdown_rx.clone())));

        // Periodic index flush
        if let Some(dir) = self.data_dir.clone() {
            let index = Arc::clone(&self.index);
            let mut shutdown = shutdown_rx;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                        _ = shutdown.changed() => break,
                    }
                    let result = { index.read().unwrap().save(&dir.join("index")) };
                    if let Err(e) = result {
                        log::warn!("index flush failed: {}", e);
                    }
                }
            }));
        }

        log::info!("node {} started at {}", self.node_id, self.address);
    }

    /// Graceful shutdown: stop background work in dependency order, then
    /// flush Raft state and the index.
    pub async fn shutdown(&self) {
        log::info!("node {} shutting down", self.node_id);
        let _ = self.shutdown_tx.send(true);

        // Let every loop observe the shutdown signal and drain in-flight
        // work within a bounded grace period, then hard-stop stragglers.
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for mut task in tasks {
            if tokio::time::timeout(Duration::from_millis(250), &mut task).await.is_err() {
                task.abort();
            }
        }

        // coordinator, replication and heartbeat loops are stopped above;
        // persist what must survive: consensus state, queued AP writes,
        // the local index.
        self.raft.flush();
        self.ap_store.flush_pending().await;
        if let Some(dir) = &self.data_dir {
            let result = { self.index.read().unwrap().save(&dir.join("index")) };
            if let Err(e) = result {
                log::error!("final index flush failed: {}", e);
            }
        }
        log::info!("node {} stopped", self.node_id);
    }

    // ------------------------------------------------------------------
    // RPC dispatch
    // ------------------------------------------------------------------

    pub async fn dispatch(&self, msg: RpcMessage) -> RpcMessage {
        match msg {
            RpcMessage::RequestVote { term, candidate_id, last_log_index, last_log_term } => {
                let (term, vote_granted) =
                    self.raft.handle_request_vote(term, candidate_id, last_log_index, last_log_term);
                RpcMessage::RequestVoteReply { term, vote_granted }
            }
            RpcMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                let (term, success, match_index) = self.raft.handle_append_entries(
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                );
                RpcMessage::AppendEntriesReply { term, success, match_index }
            }
            RpcMessage::Heartbeat { node_id, status, gauges, .. } => {
                self.heartbeat.handle_heartbeat(node_id, status, gauges)
            }
            RpcMessage::ReplicateDoc { doc } => {
                let success = self.store_local(*doc);
                RpcMessage::ReplicateDocReply { success }
            }
            RpcMessage::RollbackDoc { doc_id } => {
                self.remove_local(&doc_id);
                RpcMessage::RollbackDocReply { success: true }
            }
            RpcMessage::SearchLocal { query, limit, filters } => {
                let results = self.search_local(&query, limit, &filters);
                RpcMessage::SearchLocalReply { results }
            }
            RpcMessage::LocateTerm { term } => {
                let nodes = self.shard_dir.lock().unwrap().locate(&term);
                RpcMessage::LocateTermReply { nodes }
            }
            RpcMessage::UpdateShard { node_id, terms_added, terms_removed } => {
                self.shard_dir
                    .lock()
                    .unwrap()
                    .apply_update(node_id, &terms_added, &terms_removed);
                RpcMessage::UpdateShardAck
            }
            RpcMessage::ApSync { key, value } => {
                let updated = self.ap_store.merge_remote(&key, value);
                RpcMessage::ApSyncReply { updated }
            }
            RpcMessage::ApDigest { entries } => {
                let stale_or_missing = self.ap_store.diff_digest(&entries);
                RpcMessage::ApDigestReply { stale_or_missing }
            }
            other => RpcMessage::Error {
                message: format!("unexpected request: {}", other.kind()),
            },
        }
    }

    // ------------------------------------------------------------------
    // Local document store
    // ------------------------------------------------------------------

    /// Write a document into the local index, report term deltas to the
    /// shard coordinators and invalidate affected query caches.
    fn store_local(&self, doc: Document) -> bool {
        let delta = {
            let mut index = self.index.write().unwrap();
            index.add_document(doc)
        };
        let terms: HashSet<String> = delta.added.iter().cloned().collect();
        self.publish_shard_update(delta.added, delta.removed);
        self.search.invalidate_cache_for_terms(&terms);
        true
    }

    fn remove_local(&self, doc_id: &Uuid) -> bool {
        let (existed, delta, affected) = {
            let mut index = self.index.write().unwrap();
            let affected: HashSet<String> = index
                .get_document(doc_id)
                .map(|d| index.tokenizer().unique_terms(&d.content))
                .unwrap_or_default();
            let existed = index.contains(doc_id);
            let delta = index.remove_document(doc_id);
            (existed, delta, affected)
        };
        if existed {
            self.publish_shard_update(Vec::new(), delta.removed);
            self.search.invalidate_cache_for_terms(&affected);
        }
        existed
    }

    /// Fan term deltas out to the coordinators of the affected shards so
    /// the global locator stays consistent. Fire-and-forget.
    fn publish_shard_update(&self, added: Vec<String>, removed: Vec<String>) {
        if added.is_empty() && removed.is_empty() {
            return;
        }

        let healthy = {
            let mut nodes = self.state_machine.healthy_nodes();
            if nodes.is_empty() {
                nodes.push(self.node_id);
            }
            nodes
        };

        // Group deltas by coordinating node
        let mut per_owner: HashMap<NodeId, (Vec<String>, Vec<String>)> = HashMap::new();
        for term in added {
            let shard = self.ring.get_shard(&term);
            if let Some(owner) = shard_owner(shard, &healthy) {
                per_owner.entry(owner).or_default().0.push(term);
            }
        }
        for term in removed {
            let shard = self.ring.get_shard(&term);
            if let Some(owner) = shard_owner(shard, &healthy) {
                per_owner.entry(owner).or_default().1.push(term);
            }
        }

        let invalidate: HashSet<String> = per_owner
            .values()
            .flat_map(|(a, r)| a.iter().chain(r.iter()).cloned())
            .collect();
        self.search.invalidate_locate_cache(&invalidate);

        for (owner, (terms_added, terms_removed)) in per_owner {
            if owner == self.node_id {
                self.shard_dir
                    .lock()
                    .unwrap()
                    .apply_update(self.node_id, &terms_added, &terms_removed);
                continue;
            }
            let transport = Arc::clone(&self.transport);
            let from = self.node_id;
            let timeout = Duration::from_millis(self.config.search.node_timeout_ms);
            tokio::spawn(async move {
                let result = transport
                    .request(
                        from,
                        owner,
                        RpcMessage::UpdateShard { node_id: from, terms_added, terms_removed },
                        timeout,
                    )
                    .await;
                if let Err(e) = result {
                    log::debug!("shard update to {} failed: {}", owner, e);
                }
            });
        }
    }

    /// Per-node search primitive behind the SearchLocal RPC.
    fn search_local(&self, query: &str, limit: usize, filters: &HashMap<String, String>) -> Vec<SearchHit> {
        let index = self.index.read().unwrap();
        let mut hits = Vec::new();

        for (doc_id, score) in index.search(query, limit.max(1)) {
            let Some(doc) = index.get_document(&doc_id) else { continue };
            if !matches_filters(doc, filters) {
                continue;
            }

            let matched = index.matched_terms(query, &doc_id);
            let snippet = crate::aggregate::make_snippet(&doc.content, &matched, 300);
            hits.push(SearchHit {
                doc_id,
                node_id: self.node_id,
                // Accumulated term-frequency score maps to a distance in
                // (0, 1]; higher score, smaller distance
                distance: 1.0 / (1.0 + score as f64),
                relevance: 0.0,
                filename: doc.filename().to_string(),
                file_type: doc.file_type().to_string(),
                modified_at: Some(doc.modified_at),
                access_count: doc.access_count,
                matched_terms: matched,
                snippet,
            });
        }

        hits
    }

    fn partition_of(&self, doc_id: &Uuid) -> u32 {
        let hash = blake3::hash(doc_id.as_bytes());
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&hash.as_bytes()[..4]);
        u32::from_be_bytes(bytes) % self.config.rebalance.partition_count
    }

    fn require_leader(&self) -> ClusterResult<()> {
        if self.raft.is_leader() {
            Ok(())
        } else {
            Err(ClusterError::NotLeader { leader: self.raft.leader_id() })
        }
    }

    fn degradation(&self) -> (Option<DataFreshness>, Vec<String>) {
        let state = self.ap_store.partition_state();
        match state.status {
            PartitionStatus::Connected => (Some(DataFreshness::Confirmed), Vec::new()),
            PartitionStatus::Partial | PartitionStatus::Healing => (
                Some(DataFreshness::LikelyCurrent),
                vec![format!(
                    "{} nodes unreachable; results may be incomplete",
                    state.unreachable.len()
                )],
            ),
            PartitionStatus::Partitioned => (
                Some(DataFreshness::PotentiallyStale),
                vec!["network partition in progress; results may be stale".to_string()],
            ),
        }
    }

    // ------------------------------------------------------------------
    // Client operations: documents
    // ------------------------------------------------------------------

    /// Index a new document: quorum-replicate content, then commit
    /// placement metadata through consensus.
    pub async fn index_document(
        &self,
        content: String,
        metadata: HashMap<String, String>,
        request_id: Option<Uuid>,
    ) -> ApiResult<DocumentReceipt> {
        self.require_leader()?;

        let doc_id = Uuid::new_v4();
        let partition_id = self.partition_of(&doc_id);

        let mut healthy = self.state_machine.healthy_nodes();
        if healthy.is_empty() {
            healthy.push(self.node_id);
        }

        // Primary: the partition's owner when healthy, else this node
        let primary = self
            .state_machine
            .partition(partition_id)
            .and_then(|p| p.primary())
            .filter(|p| healthy.contains(p))
            .unwrap_or(self.node_id);

        let replicas = self.replication.select_replicas(primary, &healthy);
        let vectors = VectorizerSet::standard().bundle(&content);
        let doc = Document::new(doc_id, content, metadata, partition_id, primary, vectors);

        let wrote_local = replicas.contains(&self.node_id) && self.store_local(doc.clone());

        let outcome = match self.replication.replicate_document(&doc, &replicas).await {
            Ok(outcome) => outcome,
            Err(err) => {
                if wrote_local {
                    self.remove_local(&doc_id);
                }
                return Err(err.into());
            }
        };

        // Order the successful set with the primary first
        let mut placed = outcome.successful.clone();
        placed.sort_unstable();
        placed.retain(|n| *n != primary);
        let mut replicas_ordered = vec![primary];
        replicas_ordered.extend(placed);

        let register = self
            .raft
            .submit(
                Command::RegisterDocument {
                    doc_id,
                    partition_id,
                    replicas: replicas_ordered.clone(),
                },
                request_id,
            )
            .await;
        if let Err(err) = register {
            if wrote_local {
                self.remove_local(&doc_id);
            }
            self.replication.rollback_document(doc_id, &replicas_ordered).await;
            return Err(err.into());
        }

        self.metrics
            .documents_indexed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let (freshness, warnings) = self.degradation();
        Ok(ApiOk {
            data: DocumentReceipt { doc_id, partition_id, replicas: replicas_ordered },
            freshness,
            warnings,
        })
    }

    /// Fetch a document from the local replica. When another node holds
    /// it, the error names the replica set so the caller can retry there.
    pub fn get_document(&self, doc_id: &Uuid) -> ApiResult<Document> {
        let local = {
            let mut index = self.index.write().unwrap();
            index.get_document_mut(doc_id).map(|doc| {
                doc.record_access();
                doc.clone()
            })
        };

        if let Some(doc) = local {
            let (freshness, warnings) = self.degradation();
            return Ok(ApiOk { data: doc, freshness, warnings });
        }

        match self.state_machine.document(doc_id) {
            Some(meta) => Err(ClusterError::Unavailable(format!(
                "document {} not held locally; replicas: {:?}",
                doc_id, meta.replicas
            ))
            .into()),
            None => Err(ClusterError::NotFound(format!("document {}", doc_id)).into()),
        }
    }

    /// Re-vectorize and re-replicate updated content across the existing
    /// replica set.
    pub async fn update_document(
        &self,
        doc_id: Uuid,
        content: String,
        metadata: Option<HashMap<String, String>>,
        request_id: Option<Uuid>,
    ) -> ApiResult<DocumentReceipt> {
        self.require_leader()?;

        let meta = self
            .state_machine
            .document(&doc_id)
            .ok_or_else(|| ApiError::from(ClusterError::NotFound(format!("document {}", doc_id))))?;
        let replicas = meta.replicas.clone();
        if replicas.is_empty() {
            return Err(ClusterError::Unavailable(format!("document {} has no replicas", doc_id)).into());
        }
        let primary = replicas[0];

        let existing = {
            let index = self.index.read().unwrap();
            index.get_document(&doc_id).cloned()
        };
        let metadata = metadata
            .or_else(|| existing.as_ref().map(|d| d.metadata.clone()))
            .unwrap_or_default();

        let vectors = VectorizerSet::standard().bundle(&content);
        let mut doc = Document::new(
            doc_id,
            content,
            metadata,
            meta.partition_id,
            primary,
            vectors,
        );
        if let Some(previous) = &existing {
            doc.created_at = previous.created_at;
            doc.access_count = previous.access_count;
        }

        if replicas.contains(&self.node_id) {
            self.store_local(doc.clone());
        }
        self.replication.replicate_document(&doc, &replicas).await?;

        self.raft
            .submit(
                Command::RegisterDocument {
                    doc_id,
                    partition_id: meta.partition_id,
                    replicas: replicas.clone(),
                },
                request_id,
            )
            .await?;

        let (freshness, warnings) = self.degradation();
        Ok(ApiOk {
            data: DocumentReceipt { doc_id, partition_id: meta.partition_id, replicas },
            freshness,
            warnings,
        })
    }

    /// Remove a document from every known replica (best effort) and from
    /// the replicated metadata.
    pub async fn delete_document(&self, doc_id: Uuid, request_id: Option<Uuid>) -> ApiResult<Uuid> {
        self.require_leader()?;

        let mut targets = self.state_machine.replicas_of(&doc_id);
        let known = !targets.is_empty() || self.index.read().unwrap().contains(&doc_id);
        if !known {
            return Err(ClusterError::NotFound(format!("document {}", doc_id)).into());
        }
        if !targets.contains(&self.node_id) {
            targets.push(self.node_id);
        }

        self.remove_local(&doc_id);
        self.replication.rollback_document(doc_id, &targets).await;
        self.raft.submit(Command::RemoveDocument { doc_id }, request_id).await?;

        self.metrics
            .documents_deleted
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let (freshness, warnings) = self.degradation();
        Ok(ApiOk { data: doc_id, freshness, warnings })
    }

    /// Rank other documents by similarity to an existing one, using its
    /// highest-scoring terms as the probe query.
    pub async fn find_similar(&self, doc_id: &Uuid, limit: usize) -> ApiResult<AggregatedResults> {
        let doc = self.get_document(doc_id)?.data;

        let tokens = {
            let index = self.index.read().unwrap();
            index.tokenizer().tokenize(&doc.content)
        };
        let mut freq: HashMap<String, usize> = HashMap::new();
        for token in tokens {
            *freq.entry(token).or_insert(0) += 1;
        }
        let mut by_freq: Vec<(String, usize)> = freq.into_iter().collect();
        by_freq.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let probe: Vec<String> = by_freq.into_iter().take(10).map(|(t, _)| t).collect();

        if probe.is_empty() {
            return Err(ClusterError::NotFound(format!("document {} has no terms", doc_id)).into());
        }

        let mut results = self
            .search
            .search(SearchRequest {
                query: probe.join(" "),
                page_size: Some(limit + 1),
                ..Default::default()
            })
            .await
            .map_err(ApiError::from)?;

        results.hits.retain(|h| h.doc_id != *doc_id);
        results.hits.truncate(limit);

        let (freshness, warnings) = self.degradation();
        Ok(ApiOk { data: results, freshness, warnings })
    }

    // ------------------------------------------------------------------
    // Client operations: search
    // ------------------------------------------------------------------

    pub async fn search(&self, request: SearchRequest) -> ApiResult<AggregatedResults> {
        match self.search.search(request).await {
            Ok(results) => {
                let (freshness, mut warnings) = self.degradation();
                if results.failed_nodes > 0 {
                    warnings.push(format!(
                        "{} node(s) failed during the search; results may be incomplete",
                        results.failed_nodes
                    ));
                }
                Ok(ApiOk { data: results, freshness, warnings })
            }
            Err(err) => {
                self.metrics.record_search_failure();
                Err(err.into())
            }
        }
    }

    // ------------------------------------------------------------------
    // Client operations: cluster administration
    // ------------------------------------------------------------------

    pub fn list_nodes(&self) -> ApiResult<Vec<NodeDetails>> {
        let details = self
            .state_machine
            .nodes()
            .into_iter()
            .map(|entry| {
                let (reachable, last_contact) = if entry.node_id == self.node_id {
                    (true, Some(Utc::now()))
                } else {
                    self.heartbeat
                        .peer_view(entry.node_id)
                        .map(|(reachable, seen, _)| (reachable, seen))
                        .unwrap_or((true, None))
                };
                NodeDetails { entry, reachable, last_contact }
            })
            .collect();
        Ok(ApiOk::plain(details))
    }

    pub fn node_details(&self, node_id: NodeId) -> ApiResult<NodeDetails> {
        let entry = self
            .state_machine
            .node(node_id)
            .ok_or_else(|| ApiError::from(ClusterError::NotFound(format!("node {}", node_id))))?;
        let (reachable, last_contact) = if node_id == self.node_id {
            (true, Some(Utc::now()))
        } else {
            self.heartbeat
                .peer_view(node_id)
                .map(|(reachable, seen, _)| (reachable, seen))
                .unwrap_or((true, None))
        };
        Ok(ApiOk::plain(NodeDetails { entry, reachable, last_contact }))
    }

    pub async fn join_cluster(&self, node_id: NodeId, address: String) -> ApiResult<()> {
        self.coordinator
            .handle_join(node_id, address)
            .await
            .map(ApiOk::plain)
            .map_err(ApiError::from)
    }

    pub async fn remove_node(&self, node_id: NodeId) -> ApiResult<()> {
        self.coordinator
            .handle_remove(node_id)
            .await
            .map(ApiOk::plain)
            .map_err(ApiError::from)
    }

    pub fn partitions(&self) -> ApiResult<Vec<PartitionEntry>> {
        Ok(ApiOk::plain(self.state_machine.partitions()))
    }

    pub async fn trigger_rebalance(&self) -> ApiResult<usize> {
        self.coordinator
            .rebalance_now()
            .await
            .map(ApiOk::plain)
            .map_err(ApiError::from)
    }

    pub fn master(&self) -> ApiResult<Option<NodeId>> {
        Ok(ApiOk::plain(self.raft.leader_id()))
    }

    pub async fn trigger_election(&self) -> ApiResult<()> {
        self.raft.run_election().await;
        Ok(ApiOk::plain(()))
    }

    // ------------------------------------------------------------------
    // Health surface
    // ------------------------------------------------------------------

    pub fn health(&self) -> HealthReport {
        let raft = self.raft.status();
        let nodes = self.state_machine.nodes();
        let healthy = self
            .state_machine
            .healthy_nodes()
            .len();
        HealthReport {
            healthy: raft.leader_id.is_some() && !*self.shutdown_tx.borrow(),
            node_id: self.node_id,
            role: raft.role,
            term: raft.current_term,
            leader: raft.leader_id,
            partition_status: self.ap_store.partition_status(),
            nodes_total: nodes.len(),
            nodes_healthy: healthy,
            documents: self.index.read().unwrap().document_count(),
            pending_sync: self.ap_store.pending_sync_count(),
        }
    }

    /// Ready to serve: a leader is known and the apply pipeline has caught
    /// up.
    pub fn ready(&self) -> bool {
        let status = self.raft.status();
        status.leader_id.is_some() && status.last_applied == status.commit_index
    }

    /// Process liveness: not shut down.
    pub fn live(&self) -> bool {
        !*self.shutdown_tx.borrow()
    }

    pub fn metrics_text(&self) -> String {
        PrometheusExporter::new(Arc::clone(&self.metrics)).export()
    }

    /// Local index size, for tests and gauges.
    pub fn local_document_count(&self) -> usize {
        self.index.read().unwrap().document_count()
    }

    pub fn holds_document(&self, doc_id: &Uuid) -> bool {
        self.index.read().unwrap().contains(doc_id)
    }
}

fn matches_filters(doc: &Document, filters: &HashMap<String, String>) -> bool {
    for (key, expected) in filters {
        let actual = match key.as_str() {
            "ext" => doc
                .filename()
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_string()),
            _ => doc.metadata.get(key).cloned(),
        };
        match actual {
            Some(actual) if actual.eq_ignore_ascii_case(expected) => {}
            // A present-but-different value excludes the document; an
            // absent key is not a match either once the filter was asked
            Some(_) | None => return false,
        }
    }
    true
}

/// Pushes document data when the replicated placement changes: the primary
/// streams copies to new replicas, a partition donor streams its documents
/// to the receiving node.
struct DataMover {
    node: Weak<SearchNode>,
}

impl ClusterObserver for DataMover {
    fn on_replica_added(&self, doc_id: Uuid, target: NodeId) {
        let Some(node) = self.node.upgrade() else { return };
        if target == node.node_id {
            return;
        }
        let holds = node.holds_document(&doc_id);
        let is_primary = node
            .state_machine
            .document(&doc_id)
            .and_then(|m| m.primary())
            == Some(node.node_id);
        if !holds || !is_primary {
            return;
        }

        let doc = {
            let index = node.index.read().unwrap();
            index.get_document(&doc_id).cloned()
        };
        let Some(doc) = doc else { return };

        let transport = Arc::clone(&node.transport);
        let from = node.node_id;
        let timeout = Duration::from_millis(node.config.replication.replication_timeout_ms);
        tokio::spawn(async move {
            let result = transport
                .request(from, target, RpcMessage::ReplicateDoc { doc: Box::new(doc) }, timeout)
                .await;
            if let Err(e) = result {
                log::warn!("re-replication of {} to {} failed: {}", doc_id, target, e);
            }
        });
    }

    fn on_partition_moved(&self, partition_id: u32, from: NodeId, to: NodeId) {
        let Some(node) = self.node.upgrade() else { return };
        if from != node.node_id || to == node.node_id {
            return;
        }

        let docs: Vec<Document> = {
            let index = node.index.read().unwrap();
            index
                .documents_in_partition(partition_id)
                .into_iter()
                .filter_map(|id| index.get_document(&id).cloned())
                .collect()
        };
        if docs.is_empty() {
            return;
        }

        let transport = Arc::clone(&node.transport);
        let sender = node.node_id;
        let timeout = Duration::from_millis(node.config.replication.replication_timeout_ms);
        tokio::spawn(async move {
            for doc in docs {
                let doc_id = doc.doc_id;
                let result = transport
                    .request(sender, to, RpcMessage::ReplicateDoc { doc: Box::new(doc) }, timeout)
                    .await;
                if let Err(e) = result {
                    log::warn!(
                        "partition {} handoff of {} to {} failed: {}",
                        partition_id,
                        doc_id,
                        to,
                        e
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryNetwork;

    fn node_fixture() -> (Arc<SearchNode>, Arc<InMemoryNetwork>) {
        let network = InMemoryNetwork::new();
        let node = SearchNode::new(
            1,
            "node-1:7000".to_string(),
            ClusterConfig::testing(),
            Arc::new(Arc::clone(&network)),
            None,
        )
        .unwrap();
        (node, network)
    }

    #[tokio::test]
    async fn test_dispatch_locate_and_update_shard() {
        let (node, _network) = node_fixture();

        let ack = node
            .dispatch(RpcMessage::UpdateShard {
                node_id: 9,
                terms_added: vec!["rust".into()],
                terms_removed: vec![],
            })
            .await;
        assert!(matches!(ack, RpcMessage::UpdateShardAck));

        let reply = node.dispatch(RpcMessage::LocateTerm { term: "rust".into() }).await;
        match reply {
            RpcMessage::LocateTermReply { nodes } => assert_eq!(nodes, vec![9]),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replicate_and_rollback_rpc() {
        let (node, _network) = node_fixture();
        let doc = Document::new(
            Uuid::new_v4(),
            "replicated content body".to_string(),
            HashMap::new(),
            0,
            2,
            crate::vectorize::VectorBundle::default(),
        );
        let doc_id = doc.doc_id;

        let reply = node.dispatch(RpcMessage::ReplicateDoc { doc: Box::new(doc) }).await;
        assert!(matches!(reply, RpcMessage::ReplicateDocReply { success: true }));
        assert!(node.holds_document(&doc_id));

        let reply = node.dispatch(RpcMessage::RollbackDoc { doc_id }).await;
        assert!(matches!(reply, RpcMessage::RollbackDocReply { success: true }));
        assert!(!node.holds_document(&doc_id));
    }

    #[tokio::test]
    async fn test_search_local_applies_filters() {
        let (node, _network) = node_fixture();
        let mut metadata = HashMap::new();
        metadata.insert("type".to_string(), "pdf".to_string());
        metadata.insert("filename".to_string(), "guide.pdf".to_string());
        let doc = Document::new(
            Uuid::new_v4(),
            "filtering reference guide".to_string(),
            metadata,
            0,
            1,
            crate::vectorize::VectorBundle::default(),
        );
        node.store_local(doc);

        let hits = node.search_local("guide", 10, &HashMap::new());
        assert_eq!(hits.len(), 1);
        assert!(hits[0].snippet.contains("**guide**"));

        let mut filter = HashMap::new();
        filter.insert("type".to_string(), "pdf".to_string());
        assert_eq!(node.search_local("guide", 10, &filter).len(), 1);

        filter.insert("type".to_string(), "txt".to_string());
        assert_eq!(node.search_local("guide", 10, &filter).len(), 0);

        let mut ext_filter = HashMap::new();
        ext_filter.insert("ext".to_string(), "PDF".to_string());
        assert_eq!(node.search_local("guide", 10, &ext_filter).len(), 1);
    }

    #[tokio::test]
    async fn test_index_document_requires_leader() {
        let (node, _network) = node_fixture();
        let err = node
            .index_document("content".to_string(), HashMap::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, "not_leader");
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn test_get_document_not_found() {
        let (node, _network) = node_fixture();
        let err = node.get_document(&Uuid::new_v4()).unwrap_err();
        assert_eq!(err.kind, "not_found");
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_get_document_bumps_access_count() {
        let (node, _network) = node_fixture();
        let doc = Document::new(
            Uuid::new_v4(),
            "tracked access".to_string(),
            HashMap::new(),
            0,
            1,
            crate::vectorize::VectorBundle::default(),
        );
        let doc_id = doc.doc_id;
        node.store_local(doc);

        node.get_document(&doc_id).unwrap();
        let second = node.get_document(&doc_id).unwrap();
        assert_eq!(second.data.access_count, 2);
    }

    #[tokio::test]
    async fn test_partition_of_is_stable_and_bounded() {
        let (node, _network) = node_fixture();
        let doc_id = Uuid::new_v4();
        let a = node.partition_of(&doc_id);
        assert_eq!(a, node.partition_of(&doc_id));
        assert!(a < node.config.rebalance.partition_count);
    }

    #[tokio::test]
    async fn test_health_report_shape() {
        let (node, _network) = node_fixture();
        let health = node.health();
        assert_eq!(health.node_id, 1);
        assert!(!health.healthy); // no leader yet
        assert!(node.live());
    }
}
