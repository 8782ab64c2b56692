use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ApConfig;
use crate::message::RpcMessage;
use crate::metrics::Metrics;
use crate::persist;
use crate::scatter;
use crate::state_machine::NodeId;
use crate::transport::Transport;

/// Network partition status as observed from this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionStatus {
    /// Every known node reachable
    Connected,
    /// Some nodes unreachable, but we hold a majority
    Partial,
    /// Majority unreachable
    Partitioned,
    /// Majority regained, unreachable set not yet empty
    Healing,
}

/// How stale a returned value may be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFreshness {
    Confirmed,
    LikelyCurrent,
    PotentiallyStale,
    Stale,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    WillSyncLater,
}

/// How two versions relate under their vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrdering {
    Dominates,
    DominatedBy,
    Equal,
    Concurrent,
}

/// A value plus the version information needed for conflict detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: serde_json::Value,
    pub vector_clock: BTreeMap<NodeId, u64>,
    pub timestamp: DateTime<Utc>,
    pub origin: NodeId,
    pub checksum: u32,
}

impl VersionedValue {
    pub fn new(value: serde_json::Value, origin: NodeId, vector_clock: BTreeMap<NodeId, u64>) -> Self {
        let canonical = value.to_string();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(canonical.as_bytes());
        VersionedValue {
            value,
            vector_clock,
            timestamp: Utc::now(),
            origin,
            checksum: hasher.finalize(),
        }
    }

    /// Sum of all clock entries; a cheap monotone version number.
    pub fn version(&self) -> u64 {
        self.vector_clock.values().sum()
    }

    pub fn compare(&self, other: &VersionedValue) -> VersionOrdering {
        let mut dominates = false;
        let mut dominated = false;

        let nodes: BTreeSet<NodeId> = self
            .vector_clock
            .keys()
            .chain(other.vector_clock.keys())
            .copied()
            .collect();

        for node in nodes {
            let ours = self.vector_clock.get(&node).copied().unwrap_or(0);
            let theirs = other.vector_clock.get(&node).copied().unwrap_or(0);
            if ours > theirs {
                dominates = true;
            } else if ours < theirs {
                dominated = true;
            }
        }

        match (dominates, dominated) {
            (true, false) => VersionOrdering::Dominates,
            (false, true) => VersionOrdering::DominatedBy,
            (false, false) => VersionOrdering::Equal,
            (true, true) => VersionOrdering::Concurrent,
        }
    }

    /// Vector-clock dominance with wall-clock last-writer-wins for
    /// concurrent versions.
    pub fn is_newer_than(&self, other: &VersionedValue) -> bool {
        match self.compare(other) {
            VersionOrdering::Dominates => true,
            VersionOrdering::DominatedBy => false,
            VersionOrdering::Equal => false,
            VersionOrdering::Concurrent => self.timestamp > other.timestamp,
        }
    }
}

/// Result of an AP read. Reads always succeed; freshness and the warning
/// convey how much the value can be trusted.
#[derive(Debug, Clone)]
pub struct ApReadResult {
    pub value: Option<serde_json::Value>,
    pub freshness: DataFreshness,
    pub version: Option<VersionedValue>,
    pub source: NodeId,
    pub partition_status: PartitionStatus,
    pub warning: Option<String>,
    pub read_at: DateTime<Utc>,
}

/// Result of an AP write. Writes are always accepted locally.
#[derive(Debug, Clone)]
pub struct ApWriteResult {
    pub accepted: bool,
    pub sync_status: SyncStatus,
    pub conflict_possible: bool,
    pub partition_status: PartitionStatus,
    pub version: VersionedValue,
    pub warning: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PartitionState {
    pub status: PartitionStatus,
    pub reachable: BTreeSet<NodeId>,
    pub unreachable: BTreeSet<NodeId>,
    pub partition_started: Option<DateTime<Utc>>,
    pub last_full_connectivity: Option<DateTime<Utc>>,
    pub is_majority: bool,
}

pub type ConflictObserver = Box<dyn Fn(&str, &VersionedValue, &VersionedValue) + Send + Sync>;

struct ApInner {
    store: HashMap<String, VersionedValue>,
    vector_clock: BTreeMap<NodeId, u64>,
    pending_sync: Vec<(String, VersionedValue)>,
    known_nodes: BTreeSet<NodeId>,
    last_seen: HashMap<NodeId, DateTime<Utc>>,
    state: PartitionState,
}

/// Always-available key/value layer used alongside Raft.
///
/// Raft owns authoritative cluster metadata; this store serves data whose
/// availability must outlive partitions. Reads and writes never fail: a
/// write that cannot replicate is queued and synced when connectivity
/// returns, and reads carry a freshness tag instead of an error.
pub struct ApStore {
    node_id: NodeId,
    config: ApConfig,
    inner: Mutex<ApInner>,
    transport: Arc<dyn Transport>,
    conflict_observers: Mutex<Vec<ConflictObserver>>,
    pending_path: Option<PathBuf>,
    metrics: Arc<Metrics>,
}

impl ApStore {
    pub fn new(
        node_id: NodeId,
        config: ApConfig,
        transport: Arc<dyn Transport>,
        data_dir: Option<PathBuf>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let pending_path = data_dir.map(|d| d.join("ap_store").join("pending_sync.json"));

        let mut pending_sync = Vec::new();
        if let Some(path) = &pending_path {
            match persist::load_json::<Vec<(String, VersionedValue)>>(path) {
                Ok(Some(queued)) => {
                    log::info!("recovered {} pending AP writes", queued.len());
                    pending_sync = queued;
                }
                Ok(None) => {}
                Err(e) => log::warn!("could not load pending sync queue: {}", e),
            }
        }

        let mut known_nodes = BTreeSet::new();
        known_nodes.insert(node_id);
        let mut reachable = BTreeSet::new();
        reachable.insert(node_id);

        ApStore {
            node_id,
            config,
            inner: Mutex::new(ApInner {
                store: HashMap::new(),
                vector_clock: BTreeMap::from([(node_id, 0)]),
                pending_sync,
                known_nodes,
                last_seen: HashMap::from([(node_id, Utc::now())]),
                state: PartitionState {
                    status: PartitionStatus::Connected,
                    reachable,
                    unreachable: BTreeSet::new(),
                    partition_started: None,
                    last_full_connectivity: Some(Utc::now()),
                    is_majority: true,
                },
            }),
            transport,
            conflict_observers: Mutex::new(Vec::new()),
            pending_path,
            metrics,
        }
    }

    pub fn on_conflict(&self, observer: ConflictObserver) {
        self.conflict_observers.lock().unwrap().push(observer);
    }

    // ------------------------------------------------------------------
    // Node tracking (fed by the heartbeat service)
    // ------------------------------------------------------------------

    pub fn register_node(&self, node_id: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        inner.known_nodes.insert(node_id);
        inner.last_seen.insert(node_id, Utc::now());
        inner.state.reachable.insert(node_id);
        inner.vector_clock.entry(node_id).or_insert(0);
        Self::recompute_status(&mut inner);
    }

    pub fn unregister_node(&self, node_id: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        inner.known_nodes.remove(&node_id);
        inner.state.reachable.remove(&node_id);
        inner.state.unreachable.remove(&node_id);
        inner.last_seen.remove(&node_id);
        Self::recompute_status(&mut inner);
    }

    /// A single successful contact returns a peer to the reachable set.
    pub fn record_contact(&self, node_id: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.known_nodes.contains(&node_id) {
            return;
        }
        inner.last_seen.insert(node_id, Utc::now());
        let recovered = inner.state.unreachable.remove(&node_id);
        inner.state.reachable.insert(node_id);
        if recovered {
            Self::recompute_status(&mut inner);
        }
    }

    pub fn record_failure(&self, node_id: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.known_nodes.contains(&node_id) {
            return;
        }
        inner.state.reachable.remove(&node_id);
        inner.state.unreachable.insert(node_id);
        Self::recompute_status(&mut inner);
    }

    fn recompute_status(inner: &mut ApInner) {
        let total = inner.known_nodes.len();
        let reachable = inner.state.reachable.len();
        let unreachable = inner.state.unreachable.len();
        let old_status = inner.state.status;

        if total <= 1 {
            inner.state.status = PartitionStatus::Connected;
            inner.state.is_majority = true;
            inner.state.partition_started = None;
            return;
        }

        if unreachable == 0 {
            inner.state.status = PartitionStatus::Connected;
            inner.state.is_majority = true;
            inner.state.partition_started = None;
            inner.state.last_full_connectivity = Some(Utc::now());
        } else if reachable > total / 2 {
            // Majority side. Coming back from a full partition passes
            // through Healing until the unreachable set drains.
            if old_status == PartitionStatus::Partitioned || old_status == PartitionStatus::Healing {
                inner.state.status = PartitionStatus::Healing;
            } else {
                inner.state.status = PartitionStatus::Partial;
            }
            inner.state.is_majority = true;
        } else {
            inner.state.status = PartitionStatus::Partitioned;
            inner.state.is_majority = false;
            if inner.state.partition_started.is_none() {
                inner.state.partition_started = Some(Utc::now());
            }
        }

        if old_status != inner.state.status {
            log::warn!(
                "partition status: {:?} -> {:?} (reachable {}/{})",
                old_status,
                inner.state.status,
                reachable,
                total
            );
        }
    }

    // ------------------------------------------------------------------
    // Reads: always succeed
    // ------------------------------------------------------------------

    pub fn read(&self, key: &str) -> ApReadResult {
        let inner = self.inner.lock().unwrap();
        let read_at = Utc::now();

        match inner.store.get(key) {
            Some(local) => {
                let (freshness, warning) = Self::assess_freshness(&inner.state, local);
                if self.config.enable_read_repair && inner.state.status == PartitionStatus::Connected
                {
                    let peers: Vec<NodeId> = inner
                        .state
                        .reachable
                        .iter()
                        .copied()
                        .filter(|n| *n != self.node_id)
                        .collect();
                    self.spawn_read_repair(key.to_string(), local.clone(), peers);
                }
                ApReadResult {
                    value: Some(local.value.clone()),
                    freshness,
                    version: Some(local.clone()),
                    source: self.node_id,
                    partition_status: inner.state.status,
                    warning,
                    read_at,
                }
            }
            None => ApReadResult {
                value: None,
                freshness: DataFreshness::Unknown,
                version: None,
                source: self.node_id,
                partition_status: inner.state.status,
                warning: if inner.state.status != PartitionStatus::Connected {
                    Some("no local value; unreachable nodes may hold a newer one".to_string())
                } else {
                    None
                },
                read_at,
            },
        }
    }

    /// Opportunistic repair: push the version just read to peers so lagging
    /// replicas converge without waiting for the anti-entropy cycle.
    fn spawn_read_repair(&self, key: String, value: VersionedValue, peers: Vec<NodeId>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if peers.is_empty() {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let from = self.node_id;
        let timeout = Duration::from_millis(self.config.sync_timeout_ms);
        handle.spawn(async move {
            for peer in peers {
                let _ = transport
                    .request(
                        from,
                        peer,
                        RpcMessage::ApSync { key: key.clone(), value: value.clone() },
                        timeout,
                    )
                    .await;
            }
        });
    }

    /// Read that substitutes a default when no value exists. Never fails.
    pub fn read_with_default(&self, key: &str, default: serde_json::Value) -> ApReadResult {
        let mut result = self.read(key);
        if result.value.is_none() {
            result.value = Some(default);
            result.warning = Some("using default value; no data found".to_string());
        }
        result
    }

    fn assess_freshness(
        state: &PartitionState,
        value: &VersionedValue,
    ) -> (DataFreshness, Option<String>) {
        if state.status == PartitionStatus::Connected {
            return (DataFreshness::Confirmed, None);
        }

        let age_secs = Utc::now()
            .signed_duration_since(value.timestamp)
            .num_seconds()
            .max(0);

        if state.status == PartitionStatus::Partial || state.status == PartitionStatus::Healing {
            if age_secs < 30 {
                return (DataFreshness::LikelyCurrent, None);
            }
            return (
                DataFreshness::PotentiallyStale,
                Some(format!("value may be stale (age {}s, some nodes unreachable)", age_secs)),
            );
        }

        // Partitioned
        let partition_secs = state
            .partition_started
            .map(|t| Utc::now().signed_duration_since(t).num_seconds().max(0))
            .unwrap_or(0);
        if partition_secs < 60 {
            (
                DataFreshness::PotentiallyStale,
                Some(format!(
                    "network partition detected {}s ago; value may not reflect recent updates",
                    partition_secs
                )),
            )
        } else {
            (
                DataFreshness::Stale,
                Some(format!(
                    "extended network partition ({}s); value may be significantly outdated",
                    partition_secs
                )),
            )
        }
    }

    // ------------------------------------------------------------------
    // Writes: always accepted locally
    // ------------------------------------------------------------------

    pub async fn write(&self, key: &str, value: serde_json::Value) -> ApWriteResult {
        let (versioned, conflict_possible, status, peers) = {
            let mut inner = self.inner.lock().unwrap();

            let own = inner.vector_clock.entry(self.node_id).or_insert(0);
            *own += 1;
            let clock = inner.vector_clock.clone();
            let versioned = VersionedValue::new(value, self.node_id, clock);

            let conflict_possible = inner
                .store
                .get(key)
                .map(|existing| !versioned.is_newer_than(existing))
                .unwrap_or(false);
            if conflict_possible {
                log::info!("concurrent write detected for key {}, using last-writer-wins", key);
                self.metrics.ap_conflicts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }

            inner.store.insert(key.to_string(), versioned.clone());
            let status = inner.state.status;
            let peers: Vec<NodeId> = inner
                .state
                .reachable
                .iter()
                .copied()
                .filter(|n| *n != self.node_id)
                .collect();
            (versioned, conflict_possible, status, peers)
        };

        let (sync_status, warning) = match status {
            PartitionStatus::Connected => {
                let outcome = self.replicate(key, &versioned, &peers).await;
                if outcome.failed.is_empty() {
                    (SyncStatus::Synced, None)
                } else {
                    self.queue_pending(key, &versioned);
                    (
                        SyncStatus::Pending,
                        Some(format!("{} peers missed the write; queued for sync", outcome.failed.len())),
                    )
                }
            }
            PartitionStatus::Partial | PartitionStatus::Healing => {
                self.queue_pending(key, &versioned);
                (
                    SyncStatus::Pending,
                    Some("some nodes unreachable; replication continues in the background".to_string()),
                )
            }
            PartitionStatus::Partitioned => {
                self.queue_pending(key, &versioned);
                let started = self.inner.lock().unwrap().state.partition_started;
                (
                    SyncStatus::WillSyncLater,
                    Some(format!(
                        "write accepted locally; network partition since {:?}, will sync on heal",
                        started
                    )),
                )
            }
        };

        self.metrics.ap_writes.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        ApWriteResult {
            accepted: true,
            sync_status,
            conflict_possible,
            partition_status: status,
            version: versioned,
            warning,
        }
    }

    /// Conditional write. Still accepted (AP), but flags a possible
    /// conflict when the caller's expected version is out of date.
    pub async fn write_if_version(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_version: u64,
    ) -> ApWriteResult {
        let mismatch = {
            let inner = self.inner.lock().unwrap();
            inner
                .store
                .get(key)
                .map(|existing| existing.version() != expected_version)
                .unwrap_or(false)
        };

        let mut result = self.write(key, value).await;
        if mismatch {
            result.conflict_possible = true;
            result.warning = Some(format!(
                "version mismatch (expected {}); write accepted but conflicts may occur",
                expected_version
            ));
        }
        result
    }

    fn queue_pending(&self, key: &str, value: &VersionedValue) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending_sync.push((key.to_string(), value.clone()));
        self.metrics
            .ap_pending_syncs
            .store(inner.pending_sync.len() as u64, std::sync::atomic::Ordering::Relaxed);
        let snapshot = inner.pending_sync.clone();
        drop(inner);
        self.persist_pending(&snapshot);
    }

    fn persist_pending(&self, pending: &[(String, VersionedValue)]) {
        if let Some(path) = &self.pending_path {
            if let Err(e) = persist::save_json(path, &pending.to_vec()) {
                log::warn!("failed to persist pending sync queue: {}", e);
            }
        }
    }

    async fn replicate(
        &self,
        key: &str,
        value: &VersionedValue,
        peers: &[NodeId],
    ) -> scatter::ScatterOutcome<bool> {
        let timeout = Duration::from_millis(self.config.sync_timeout_ms);
        let key = key.to_string();
        let value = value.clone();
        let transport = Arc::clone(&self.transport);
        let from = self.node_id;

        scatter::scatter(peers.to_vec(), timeout, timeout * 2, move |peer| {
            let transport = Arc::clone(&transport);
            let key = key.clone();
            let value = value.clone();
            async move {
                match transport
                    .request(from, peer, RpcMessage::ApSync { key, value }, timeout)
                    .await?
                {
                    RpcMessage::ApSyncReply { updated } => Ok(updated),
                    other => Err(crate::error::ClusterError::Internal(format!(
                        "unexpected reply to ap_sync: {}",
                        other.kind()
                    ))),
                }
            }
        })
        .await
    }

    // ------------------------------------------------------------------
    // Merge (handler for ApSync)
    // ------------------------------------------------------------------

    /// Merge a version received from a peer. Returns true when the local
    /// value changed.
    pub fn merge_remote(&self, key: &str, remote: VersionedValue) -> bool {
        enum Decision {
            TakeRemote,
            KeepLocal,
            Conflict { take_remote: bool },
        }

        let (decision, local_copy) = {
            let inner = self.inner.lock().unwrap();
            match inner.store.get(key) {
                None => (Decision::TakeRemote, None),
                Some(local) => match remote.compare(local) {
                    VersionOrdering::Dominates => (Decision::TakeRemote, None),
                    VersionOrdering::DominatedBy | VersionOrdering::Equal => {
                        (Decision::KeepLocal, None)
                    }
                    VersionOrdering::Concurrent => (
                        Decision::Conflict { take_remote: remote.timestamp > local.timestamp },
                        Some(local.clone()),
                    ),
                },
            }
        };

        let updated = match decision {
            Decision::TakeRemote => {
                let mut inner = self.inner.lock().unwrap();
                for (node, counter) in &remote.vector_clock {
                    let entry = inner.vector_clock.entry(*node).or_insert(0);
                    *entry = (*entry).max(*counter);
                }
                inner.store.insert(key.to_string(), remote);
                true
            }
            Decision::KeepLocal => false,
            Decision::Conflict { take_remote } => {
                log::warn!("concurrent update conflict for key {}", key);
                self.metrics.ap_conflicts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                if let Some(local) = &local_copy {
                    for observer in self.conflict_observers.lock().unwrap().iter() {
                        observer(key, local, &remote);
                    }
                }
                if take_remote {
                    let mut inner = self.inner.lock().unwrap();
                    for (node, counter) in &remote.vector_clock {
                        let entry = inner.vector_clock.entry(*node).or_insert(0);
                        *entry = (*entry).max(*counter);
                    }
                    inner.store.insert(key.to_string(), remote);
                    true
                } else {
                    false
                }
            }
        };

        updated
    }

    /// Digest of local entries for anti-entropy comparison.
    pub fn digest(&self) -> Vec<(String, u64, i64)> {
        let inner = self.inner.lock().unwrap();
        inner
            .store
            .iter()
            .map(|(k, v)| (k.clone(), v.version(), v.timestamp.timestamp_millis()))
            .collect()
    }

    /// Which of the peer's entries we lack or hold older versions of.
    pub fn diff_digest(&self, remote: &[(String, u64, i64)]) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        remote
            .iter()
            .filter(|(key, version, ts)| match inner.store.get(key) {
                None => true,
                Some(local) => {
                    local.version() < *version
                        || (local.version() == *version && local.timestamp.timestamp_millis() < *ts)
                }
            })
            .map(|(key, _, _)| key.clone())
            .collect()
    }

    pub fn get_version(&self, key: &str) -> Option<VersionedValue> {
        self.inner.lock().unwrap().store.get(key).cloned()
    }

    // ------------------------------------------------------------------
    // Background loops
    // ------------------------------------------------------------------

    /// Monitor loop: ages out silent peers and finishes partition healing.
    pub async fn run_monitor(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.config.partition_check_interval_ms);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }

            let threshold = self.config.partition_threshold_secs as i64;
            let mut inner = self.inner.lock().unwrap();
            let now = Utc::now();
            let silent: Vec<NodeId> = inner
                .known_nodes
                .iter()
                .copied()
                .filter(|n| *n != self.node_id)
                .filter(|n| {
                    inner
                        .last_seen
                        .get(n)
                        .map(|seen| now.signed_duration_since(*seen).num_seconds() > threshold)
                        .unwrap_or(true)
                })
                .collect();

            for node in silent {
                if inner.state.reachable.remove(&node) {
                    inner.state.unreachable.insert(node);
                }
            }
            Self::recompute_status(&mut inner);

            if inner.state.status == PartitionStatus::Healing && inner.state.unreachable.is_empty() {
                inner.state.status = PartitionStatus::Connected;
                inner.state.partition_started = None;
                inner.state.last_full_connectivity = Some(Utc::now());
                log::info!("partition healed, full connectivity restored");
            }
        }
    }

    /// Anti-entropy loop: flush the pending queue and reconcile digests
    /// with peers while connected.
    pub async fn run_anti_entropy(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        if !self.config.enable_anti_entropy {
            return;
        }
        let interval = Duration::from_secs(self.config.anti_entropy_interval_secs);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }

            let status = self.inner.lock().unwrap().state.status;
            if status != PartitionStatus::Connected {
                continue;
            }

            self.flush_pending().await;
            self.exchange_digests().await;
        }
    }

    /// Push every queued write to the currently reachable peers, dropping
    /// entries that fully replicate.
    pub async fn flush_pending(&self) {
        let (pending, peers) = {
            let inner = self.inner.lock().unwrap();
            let peers: Vec<NodeId> = inner
                .state
                .reachable
                .iter()
                .copied()
                .filter(|n| *n != self.node_id)
                .collect();
            (inner.pending_sync.clone(), peers)
        };

        if pending.is_empty() {
            return;
        }
        log::info!("syncing {} pending writes", pending.len());

        let mut synced = Vec::new();
        for (key, value) in &pending {
            let outcome = self.replicate(key, value, &peers).await;
            if outcome.failed.is_empty() {
                synced.push(key.clone());
            }
        }

        if !synced.is_empty() {
            let mut inner = self.inner.lock().unwrap();
            inner.pending_sync.retain(|(k, _)| !synced.contains(k));
            self.metrics
                .ap_pending_syncs
                .store(inner.pending_sync.len() as u64, std::sync::atomic::Ordering::Relaxed);
            let snapshot = inner.pending_sync.clone();
            drop(inner);
            self.persist_pending(&snapshot);
        }
    }

    async fn exchange_digests(&self) {
        let peers: Vec<NodeId> = {
            let inner = self.inner.lock().unwrap();
            inner
                .state
                .reachable
                .iter()
                .copied()
                .filter(|n| *n != self.node_id)
                .collect()
        };
        if peers.is_empty() {
            return;
        }

        let digest = self.digest();
        let timeout = Duration::from_millis(self.config.sync_timeout_ms);

        for peer in peers {
            let reply = self
                .transport
                .request(self.node_id, peer, RpcMessage::ApDigest { entries: digest.clone() }, timeout)
                .await;
            let wanted = match reply {
                Ok(RpcMessage::ApDigestReply { stale_or_missing }) => stale_or_missing,
                Ok(_) | Err(_) => continue,
            };
            for key in wanted {
                if let Some(value) = self.get_version(&key) {
                    let _ = self
                        .transport
                        .request(self.node_id, peer, RpcMessage::ApSync { key, value }, timeout)
                        .await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn partition_status(&self) -> PartitionStatus {
        self.inner.lock().unwrap().state.status
    }

    pub fn partition_state(&self) -> PartitionState {
        self.inner.lock().unwrap().state.clone()
    }

    pub fn is_majority(&self) -> bool {
        self.inner.lock().unwrap().state.is_majority
    }

    pub fn pending_sync_count(&self) -> usize {
        self.inner.lock().unwrap().pending_sync.len()
    }

    pub fn local_entry_count(&self) -> usize {
        self.inner.lock().unwrap().store.len()
    }

    /// Effective quorum size given current reachability. In a minority
    /// partition the returned value exceeds the reachable count, which is
    /// the point: quorum cannot be reached there.
    pub fn current_quorum(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        let total = inner.known_nodes.len();
        let reachable = inner.state.reachable.len();
        if total <= 1 {
            return 1;
        }
        if inner.state.status == PartitionStatus::Connected {
            return total / 2 + 1;
        }
        if inner.state.is_majority {
            return reachable / 2 + 1;
        }
        reachable + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryNetwork;
    use serde_json::json;

    fn store_with_nodes(node_id: NodeId, peers: &[NodeId]) -> Arc<ApStore> {
        let network = InMemoryNetwork::new();
        let store = Arc::new(ApStore::new(
            node_id,
            crate::config::ClusterConfig::testing().ap,
            Arc::new(network),
            None,
            Arc::new(Metrics::new()),
        ));
        for peer in peers {
            store.register_node(*peer);
        }
        store
    }

    fn vv(value: serde_json::Value, origin: NodeId, clock: &[(NodeId, u64)]) -> VersionedValue {
        VersionedValue::new(value, origin, clock.iter().copied().collect())
    }

    #[test]
    fn test_vector_clock_dominance() {
        let a = vv(json!(1), 1, &[(1, 2), (2, 1)]);
        let b = vv(json!(2), 2, &[(1, 1), (2, 1)]);
        assert_eq!(a.compare(&b), VersionOrdering::Dominates);
        assert_eq!(b.compare(&a), VersionOrdering::DominatedBy);
        assert!(a.is_newer_than(&b));
        assert!(!b.is_newer_than(&a));
    }

    #[test]
    fn test_concurrent_versions_use_lww() {
        let mut older = vv(json!("old"), 1, &[(1, 2), (2, 0)]);
        let newer = vv(json!("new"), 2, &[(1, 0), (2, 2)]);
        older.timestamp = newer.timestamp - chrono::Duration::seconds(10);

        assert_eq!(older.compare(&newer), VersionOrdering::Concurrent);
        assert!(newer.is_newer_than(&older));
        assert!(!older.is_newer_than(&newer));
    }

    #[tokio::test]
    async fn test_write_always_accepted() {
        let store = store_with_nodes(1, &[2, 3]);
        // Both peers silent: record failures to force a minority partition
        store.record_failure(2);
        store.record_failure(3);
        assert_eq!(store.partition_status(), PartitionStatus::Partitioned);

        let result = store.write("k", json!("v")).await;
        assert!(result.accepted);
        assert_eq!(result.sync_status, SyncStatus::WillSyncLater);
        assert!(result.warning.is_some());
        assert_eq!(store.pending_sync_count(), 1);
    }

    #[tokio::test]
    async fn test_read_always_succeeds_with_freshness() {
        let store = store_with_nodes(1, &[2, 3]);

        let missing = store.read("absent");
        assert!(missing.value.is_none());
        assert_eq!(missing.freshness, DataFreshness::Unknown);

        store.record_failure(2);
        store.record_failure(3);
        let _ = store.write("k", json!("v")).await;
        let read = store.read("k");
        assert_eq!(read.value, Some(json!("v")));
        assert_eq!(read.freshness, DataFreshness::PotentiallyStale);
        assert!(read.warning.is_some());
    }

    #[tokio::test]
    async fn test_read_with_default() {
        let store = store_with_nodes(1, &[]);
        let result = store.read_with_default("absent", json!({"fallback": true}));
        assert_eq!(result.value, Some(json!({"fallback": true})));
        assert!(result.warning.is_some());
    }

    #[test]
    fn test_partition_status_transitions() {
        let store = store_with_nodes(1, &[2, 3, 4, 5]);
        assert_eq!(store.partition_status(), PartitionStatus::Connected);

        store.record_failure(2);
        assert_eq!(store.partition_status(), PartitionStatus::Partial);
        assert!(store.is_majority());

        store.record_failure(3);
        store.record_failure(4);
        assert_eq!(store.partition_status(), PartitionStatus::Partitioned);
        assert!(!store.is_majority());

        // Recovery restores majority: healing until everyone is back
        store.record_contact(3);
        store.record_contact(4);
        assert_eq!(store.partition_status(), PartitionStatus::Healing);

        store.record_contact(2);
        let state = store.partition_state();
        assert!(state.unreachable.is_empty());
    }

    #[test]
    fn test_merge_remote_dominating_version() {
        let store = store_with_nodes(1, &[2]);
        let remote = vv(json!("fresh"), 2, &[(2, 5)]);
        assert!(store.merge_remote("k", remote));
        assert_eq!(store.read("k").value, Some(json!("fresh")));
    }

    #[tokio::test]
    async fn test_merge_remote_ignores_dominated() {
        let store = store_with_nodes(1, &[2]);
        let _ = store.write("k", json!("local")).await;
        let local_version = store.get_version("k").unwrap();

        let mut stale_clock = BTreeMap::new();
        for (n, c) in &local_version.vector_clock {
            if *c > 0 {
                stale_clock.insert(*n, c - 1);
            }
        }
        let stale = VersionedValue::new(json!("stale"), 2, stale_clock);
        assert!(!store.merge_remote("k", stale));
        assert_eq!(store.read("k").value, Some(json!("local")));
    }

    #[tokio::test]
    async fn test_conflict_observer_fires_on_concurrent_merge() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let store = store_with_nodes(1, &[2]);
        let conflicts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&conflicts);
        store.on_conflict(Box::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let _ = store.write("k", json!("mine")).await;
        // Concurrent remote: knows nothing of our writes, has its own
        let mut remote = vv(json!("theirs"), 2, &[(2, 7)]);
        remote.timestamp = Utc::now() + chrono::Duration::seconds(5);

        assert!(store.merge_remote("k", remote));
        assert_eq!(conflicts.load(Ordering::SeqCst), 1);
        assert_eq!(store.read("k").value, Some(json!("theirs")));
    }

    #[tokio::test]
    async fn test_vector_clock_monotonicity() {
        let store = store_with_nodes(1, &[]);
        let mut last = 0;
        for i in 0..5 {
            let result = store.write("k", json!(i)).await;
            let own = result.version.vector_clock.get(&1).copied().unwrap_or(0);
            assert!(own > last, "own clock entry must strictly increase");
            last = own;
        }
    }

    #[test]
    fn test_digest_diff() {
        let store = store_with_nodes(1, &[2]);
        let remote_digest = vec![("k1".to_string(), 3u64, 1000i64)];
        let wanted = store.diff_digest(&remote_digest);
        assert_eq!(wanted, vec!["k1".to_string()]);
    }

    #[test]
    fn test_current_quorum_in_minority() {
        let store = store_with_nodes(1, &[2, 3, 4, 5]);
        store.record_failure(2);
        store.record_failure(3);
        store.record_failure(4);
        // reachable = {1, 5}: quorum unobtainable
        assert!(store.current_quorum() > 2);
    }
}
