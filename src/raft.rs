use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ConsensusConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::message::RpcMessage;
use crate::metrics::Metrics;
use crate::persist;
use crate::raft_log::{LogEntry, LogStore};
use crate::scatter;
use crate::state_machine::{Command, NodeId, StateMachine};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Persisted before answering any RPC that modified it.
#[derive(Debug, Default, Serialize, Deserialize)]
struct HardState {
    current_term: u64,
    voted_for: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub struct RaftStatus {
    pub node_id: NodeId,
    pub role: RaftRole,
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub log_length: usize,
    pub peer_count: usize,
}

struct RaftInner {
    current_term: u64,
    voted_for: Option<NodeId>,
    role: RaftRole,
    leader_id: Option<NodeId>,
    commit_index: u64,
    last_applied: u64,
    log: LogStore,
    peers: BTreeSet<NodeId>,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    /// Per-peer next_index decrement, doubled on consecutive rejections
    backoff: HashMap<NodeId, u64>,
    last_heartbeat: Instant,
    /// Commit waiters keyed by log index, tagged with the append term
    waiters: HashMap<u64, (u64, oneshot::Sender<ClusterResult<u64>>)>,
}

/// Raft-style consensus over cluster-state commands.
///
/// All persistent state lives behind one mutex and is flushed to disk
/// before any RPC response that modified it. Long operations (RPC fan-out,
/// timers) never run while the mutex is held.
pub struct RaftNode {
    node_id: NodeId,
    config: ConsensusConfig,
    transport: Arc<dyn Transport>,
    state_machine: Arc<StateMachine>,
    inner: Mutex<RaftInner>,
    apply_notify: Notify,
    replicate_notify: Notify,
    state_path: Option<PathBuf>,
    metrics: Arc<Metrics>,
}

impl RaftNode {
    pub fn new(
        node_id: NodeId,
        config: ConsensusConfig,
        transport: Arc<dyn Transport>,
        state_machine: Arc<StateMachine>,
        data_dir: Option<PathBuf>,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Arc<Self>> {
        let state_path = data_dir.as_ref().map(|d| d.join("raft").join("state.json"));
        let log_path = data_dir.as_ref().map(|d| d.join("raft").join("log.json"));

        let hard: HardState = match &state_path {
            Some(path) => persist::load_json(path)?.unwrap_or_default(),
            None => HardState::default(),
        };
        let log = match log_path {
            Some(path) => LogStore::load(path)?,
            None => LogStore::new(None),
        };

        log::info!(
            "raft node {} starting: term={} voted_for={:?} log_len={}",
            node_id,
            hard.current_term,
            hard.voted_for,
            log.len()
        );

        Ok(Arc::new(RaftNode {
            node_id,
            config,
            transport,
            state_machine,
            inner: Mutex::new(RaftInner {
                current_term: hard.current_term,
                voted_for: hard.voted_for,
                role: RaftRole::Follower,
                leader_id: None,
                commit_index: 0,
                last_applied: 0,
                log,
                peers: BTreeSet::new(),
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                backoff: HashMap::new(),
                last_heartbeat: Instant::now(),
                waiters: HashMap::new(),
            }),
            apply_notify: Notify::new(),
            replicate_notify: Notify::new(),
            state_path,
            metrics,
        }))
    }

    fn persist_hard_state(&self, inner: &RaftInner) {
        if let Some(path) = &self.state_path {
            let hard = HardState { current_term: inner.current_term, voted_for: inner.voted_for };
            if let Err(e) = persist::save_json(path, &hard) {
                log::error!("failed to persist raft state: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Membership (driven by the coordinator as AddNode/RemoveNode apply)
    // ------------------------------------------------------------------

    pub fn add_peer(&self, peer: NodeId) {
        if peer == self.node_id {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.peers.insert(peer) && inner.role == RaftRole::Leader {
            let next = inner.log.last_index() + 1;
            inner.next_index.insert(peer, next);
            inner.match_index.insert(peer, 0);
            inner.backoff.insert(peer, 1);
        }
    }

    pub fn remove_peer(&self, peer: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        inner.peers.remove(&peer);
        inner.next_index.remove(&peer);
        inner.match_index.remove(&peer);
        inner.backoff.remove(&peer);
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.inner.lock().unwrap().peers.iter().copied().collect()
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn is_leader(&self) -> bool {
        self.inner.lock().unwrap().role == RaftRole::Leader
    }

    pub fn role(&self) -> RaftRole {
        self.inner.lock().unwrap().role
    }

    pub fn current_term(&self) -> u64 {
        self.inner.lock().unwrap().current_term
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.inner.lock().unwrap().leader_id
    }

    pub fn commit_index(&self) -> u64 {
        self.inner.lock().unwrap().commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.inner.lock().unwrap().last_applied
    }

    pub fn status(&self) -> RaftStatus {
        let inner = self.inner.lock().unwrap();
        RaftStatus {
            node_id: self.node_id,
            role: inner.role,
            current_term: inner.current_term,
            voted_for: inner.voted_for,
            leader_id: inner.leader_id,
            commit_index: inner.commit_index,
            last_applied: inner.last_applied,
            log_length: inner.log.len(),
            peer_count: inner.peers.len(),
        }
    }

    // ------------------------------------------------------------------
    // Client command submission
    // ------------------------------------------------------------------

    /// Append a command on the leader and wait until it is committed and
    /// applied. Non-leaders reject with the current leader as a hint.
    pub async fn submit(&self, command: Command, request_id: Option<Uuid>) -> ClusterResult<u64> {
        let rx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.role != RaftRole::Leader {
                return Err(ClusterError::NotLeader { leader: inner.leader_id });
            }
            let term = inner.current_term;
            let entry = inner.log.append(term, command, request_id);
            let (tx, rx) = oneshot::channel();
            inner.waiters.insert(entry.index, (entry.term, tx));
            log::debug!("submitted command at index {} (term {})", entry.index, entry.term);
            rx
        };

        self.replicate_notify.notify_waiters();

        match tokio::time::timeout(self.config.submit_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClusterError::Internal("commit waiter dropped".to_string())),
            Err(_) => Err(ClusterError::Timeout(self.config.submit_timeout())),
        }
    }

    // ------------------------------------------------------------------
    // RPC handlers (synchronous; persistent state flushed before return)
    // ------------------------------------------------------------------

    pub fn handle_request_vote(
        &self,
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    ) -> (u64, bool) {
        let mut stepped_down = false;
        let (reply, notify_leader) = {
            let mut inner = self.inner.lock().unwrap();

            if term < inner.current_term {
                return (inner.current_term, false);
            }

            if term > inner.current_term {
                inner.current_term = term;
                inner.voted_for = None;
                stepped_down = inner.role != RaftRole::Follower;
                inner.role = RaftRole::Follower;
                inner.leader_id = None;
                self.persist_hard_state(&inner);
            }

            let our_last_index = inner.log.last_index();
            let our_last_term = inner.log.last_term();
            let up_to_date = last_log_term > our_last_term
                || (last_log_term == our_last_term && last_log_index >= our_last_index);

            let can_vote = inner.voted_for.is_none() || inner.voted_for == Some(candidate_id);

            if can_vote && up_to_date {
                inner.voted_for = Some(candidate_id);
                inner.last_heartbeat = Instant::now();
                self.persist_hard_state(&inner);
                log::info!(
                    "node {} voted for {} in term {}",
                    self.node_id,
                    candidate_id,
                    inner.current_term
                );
                ((inner.current_term, true), stepped_down)
            } else {
                ((inner.current_term, false), stepped_down)
            }
        };

        if notify_leader {
            self.fail_waiters(None);
        }
        reply
    }

    #[allow(clippy::too_many_arguments)]
    pub fn handle_append_entries(
        &self,
        term: u64,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> (u64, bool, u64) {
        let mut leader_changed = None;
        let mut was_leader = false;

        let reply = {
            let mut inner = self.inner.lock().unwrap();

            if term < inner.current_term {
                return (inner.current_term, false, 0);
            }

            if term > inner.current_term {
                inner.current_term = term;
                inner.voted_for = None;
                self.persist_hard_state(&inner);
            }

            was_leader = inner.role == RaftRole::Leader;
            inner.role = RaftRole::Follower;
            if inner.leader_id != Some(leader_id) {
                inner.leader_id = Some(leader_id);
                leader_changed = Some(leader_id);
            }
            inner.last_heartbeat = Instant::now();

            if !inner.log.try_append(prev_log_index, prev_log_term, &entries) {
                (inner.current_term, false, inner.log.last_index())
            } else {
                let match_index = prev_log_index + entries.len() as u64;
                let last = inner.log.last_index();
                let new_commit = leader_commit.min(last);
                if new_commit > inner.commit_index {
                    inner.commit_index = new_commit;
                    self.apply_notify.notify_one();
                }
                (inner.current_term, true, match_index)
            }
        };

        if was_leader {
            self.fail_waiters(Some(leader_id));
        }
        if let Some(leader) = leader_changed {
            self.state_machine.notify_leader_change(Some(leader));
        }
        reply
    }

    /// Fail every pending commit waiter, e.g. after losing leadership.
    fn fail_waiters(&self, leader_hint: Option<NodeId>) {
        let waiters: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            inner.waiters.drain().collect()
        };
        for (_, (_, tx)) in waiters {
            let _ = tx.send(Err(ClusterError::NotLeader { leader: leader_hint }));
        }
    }

    // ------------------------------------------------------------------
    // Election
    // ------------------------------------------------------------------

    fn jittered_election_timeout(&self) -> Duration {
        let min = self.config.election_timeout_min_ms;
        let max = self.config.election_timeout_max_ms;
        let span = max.saturating_sub(min).max(1);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0);
        let mixed = nanos ^ self.node_id.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        Duration::from_millis(min + mixed % span)
    }

    /// Run one election round. Public so an operator can force an election.
    pub async fn run_election(&self) {
        let (term, last_log_index, last_log_term, peers) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.role == RaftRole::Leader {
                return;
            }
            inner.role = RaftRole::Candidate;
            inner.current_term += 1;
            inner.voted_for = Some(self.node_id);
            inner.leader_id = None;
            self.persist_hard_state(&inner);
            log::info!("node {} starting election for term {}", self.node_id, inner.current_term);
            (
                inner.current_term,
                inner.log.last_index(),
                inner.log.last_term(),
                inner.peers.iter().copied().collect::<Vec<_>>(),
            )
        };
        self.metrics.record_election();

        let cluster_size = peers.len() + 1;
        let needed = cluster_size / 2 + 1;

        if peers.is_empty() {
            self.become_leader(term);
            return;
        }

        let rpc_timeout = self.config.election_timeout_min();
        let transport = Arc::clone(&self.transport);
        let from = self.node_id;
        let outcome = scatter::scatter(peers, rpc_timeout, rpc_timeout * 2, move |peer| {
            let transport = Arc::clone(&transport);
            async move {
                transport
                    .request(
                        from,
                        peer,
                        RpcMessage::RequestVote { term, candidate_id: from, last_log_index, last_log_term },
                        rpc_timeout,
                    )
                    .await
            }
        })
        .await;

        let mut votes = 1usize;
        for (_, reply) in outcome.ok {
            match reply {
                RpcMessage::RequestVoteReply { term: reply_term, vote_granted } => {
                    if reply_term > term {
                        self.step_down(reply_term);
                        return;
                    }
                    if vote_granted {
                        votes += 1;
                    }
                }
                other => log::warn!("unexpected reply to request_vote: {}", other.kind()),
            }
        }

        if votes >= needed {
            self.become_leader(term);
        } else {
            log::info!(
                "node {} lost election for term {} ({}/{} votes)",
                self.node_id,
                term,
                votes,
                needed
            );
        }
    }

    fn become_leader(&self, term: u64) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.current_term != term || inner.role != RaftRole::Candidate {
                return;
            }
            inner.role = RaftRole::Leader;
            inner.leader_id = Some(self.node_id);

            let next = inner.log.last_index() + 1;
            let peers: Vec<NodeId> = inner.peers.iter().copied().collect();
            for peer in peers {
                inner.next_index.insert(peer, next);
                inner.match_index.insert(peer, 0);
                inner.backoff.insert(peer, 1);
            }

            // Committing a current-term entry is the only way earlier-term
            // entries become committed.
            inner.log.append(term, Command::Noop, None);
            log::info!("node {} became LEADER for term {}", self.node_id, term);
        }

        self.metrics.raft_leader_changes.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.state_machine.notify_leader_change(Some(self.node_id));
        self.replicate_notify.notify_waiters();
        self.advance_commit();
    }

    fn step_down(&self, new_term: u64) {
        let was_leader = {
            let mut inner = self.inner.lock().unwrap();
            if new_term <= inner.current_term && inner.role == RaftRole::Follower {
                return;
            }
            let was_leader = inner.role == RaftRole::Leader;
            if new_term > inner.current_term {
                inner.current_term = new_term;
                inner.voted_for = None;
            }
            inner.role = RaftRole::Follower;
            inner.leader_id = None;
            self.persist_hard_state(&inner);
            log::info!("node {} stepped down (term {})", self.node_id, new_term);
            was_leader
        };
        if was_leader {
            self.fail_waiters(None);
        }
    }

    // ------------------------------------------------------------------
    // Log replication (leader)
    // ------------------------------------------------------------------

    async fn replicate_once(&self) {
        struct PeerBatch {
            peer: NodeId,
            prev_log_index: u64,
            prev_log_term: u64,
            entries: Vec<LogEntry>,
        }

        let (term, leader_commit, batches) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.role != RaftRole::Leader {
                return;
            }
            let term = inner.current_term;
            let leader_commit = inner.commit_index;
            let snapshot_index = inner.log.snapshot_index();
            let peers: Vec<NodeId> = inner.peers.iter().copied().collect();

            let mut batches = Vec::with_capacity(peers.len());
            for peer in peers {
                let mut next = *inner.next_index.get(&peer).unwrap_or(&1);
                if next <= snapshot_index {
                    // Compaction outran this follower; restart from the
                    // snapshot boundary.
                    next = snapshot_index + 1;
                    inner.next_index.insert(peer, next);
                }
                let prev_log_index = next - 1;
                let prev_log_term = inner.log.term_at(prev_log_index).unwrap_or(0);
                let entries = inner.log.entries_from(next, self.config.max_entries_per_append);
                batches.push(PeerBatch { peer, prev_log_index, prev_log_term, entries });
            }
            (term, leader_commit, batches)
        };

        if batches.is_empty() {
            self.advance_commit();
            return;
        }

        let rpc_timeout = self.config.election_timeout_min();
        let mut replies = Vec::with_capacity(batches.len());
        {
            let transport = Arc::clone(&self.transport);
            let from = self.node_id;
            let targets: Vec<NodeId> = batches.iter().map(|b| b.peer).collect();
            let mut requests: HashMap<NodeId, RpcMessage> = batches
                .into_iter()
                .map(|b| {
                    (
                        b.peer,
                        RpcMessage::AppendEntries {
                            term,
                            leader_id: from,
                            prev_log_index: b.prev_log_index,
                            prev_log_term: b.prev_log_term,
                            entries: b.entries,
                            leader_commit,
                        },
                    )
                })
                .collect();

            let outcome = scatter::scatter(targets, rpc_timeout, rpc_timeout * 2, move |peer| {
                let transport = Arc::clone(&transport);
                let msg = requests.remove(&peer).unwrap_or(RpcMessage::Error {
                    message: "missing batch".to_string(),
                });
                async move { transport.request(from, peer, msg, rpc_timeout).await }
            })
            .await;
            replies.extend(outcome.ok);
        }

        let mut higher_term = None;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.role != RaftRole::Leader || inner.current_term != term {
                return;
            }
            for (peer, reply) in replies {
                let RpcMessage::AppendEntriesReply { term: reply_term, success, match_index } = reply
                else {
                    continue;
                };
                if reply_term > inner.current_term {
                    higher_term = Some(reply_term);
                    break;
                }
                if success {
                    inner.match_index.insert(peer, match_index);
                    inner.next_index.insert(peer, match_index + 1);
                    inner.backoff.insert(peer, 1);
                } else {
                    // Exponentially widen the rewind on repeated rejections
                    let step = *inner.backoff.get(&peer).unwrap_or(&1);
                    let next = inner.next_index.get(&peer).copied().unwrap_or(1);
                    inner.next_index.insert(peer, next.saturating_sub(step).max(1));
                    inner.backoff.insert(peer, (step * 2).min(1 << 16));
                }
            }
        }

        if let Some(new_term) = higher_term {
            self.step_down(new_term);
            return;
        }
        self.advance_commit();
    }

    /// Leader commit rule: the smallest N > commit_index replicated on a
    /// majority with log[N].term == current_term.
    fn advance_commit(&self) {
        let advanced = {
            let mut inner = self.inner.lock().unwrap();
            if inner.role != RaftRole::Leader {
                return;
            }
            let majority = (inner.peers.len() + 1) / 2 + 1;
            let last = inner.log.last_index();
            let mut advanced = false;

            let mut n = inner.commit_index + 1;
            while n <= last {
                if inner.log.term_at(n) == Some(inner.current_term) {
                    let count = 1 + inner
                        .peers
                        .iter()
                        .filter(|p| inner.match_index.get(*p).copied().unwrap_or(0) >= n)
                        .count();
                    if count >= majority {
                        inner.commit_index = n;
                        advanced = true;
                        self.metrics.record_commit();
                    }
                }
                n += 1;
            }
            advanced
        };

        if advanced {
            self.apply_notify.notify_one();
        }
    }

    // ------------------------------------------------------------------
    // Apply loop
    // ------------------------------------------------------------------

    fn apply_ready(&self) {
        loop {
            let (entry, waiter) = {
                let mut inner = self.inner.lock().unwrap();
                if inner.last_applied >= inner.commit_index {
                    break;
                }
                let next = inner.last_applied + 1;
                let Some(entry) = inner.log.entry(next).cloned() else {
                    log::error!("missing log entry at index {}; refusing further applies", next);
                    break;
                };
                inner.last_applied = next;
                let waiter = inner.waiters.remove(&next);
                (entry, waiter)
            };

            self.state_machine.apply(&entry);
            log::debug!("applied entry {} ({:?})", entry.index, entry.command);

            if let Some((expected_term, tx)) = waiter {
                if entry.term == expected_term {
                    let _ = tx.send(Ok(entry.index));
                } else {
                    // The submitted entry was overwritten by another leader
                    let _ = tx.send(Err(ClusterError::NoQuorum {
                        reached: 0,
                        required: (self.peers().len() + 1) / 2 + 1,
                    }));
                }
            }
        }

        self.maybe_compact();
    }

    fn maybe_compact(&self) {
        let mut inner = self.inner.lock().unwrap();
        if (inner.log.len() as u64) <= self.config.snapshot_threshold {
            return;
        }
        // Keep everything a live follower might still need
        let mut floor = inner.last_applied;
        if inner.role == RaftRole::Leader {
            for peer in inner.peers.iter() {
                floor = floor.min(inner.match_index.get(peer).copied().unwrap_or(0));
            }
        }
        if floor <= inner.log.snapshot_index() {
            return;
        }
        if let Some(term) = inner.log.term_at(floor) {
            inner.log.compact(floor, term);
        }
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Election timer
        {
            let raft = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let timeout = raft.jittered_election_timeout();
                    tokio::select! {
                        _ = tokio::time::sleep(timeout) => {}
                        _ = shutdown.changed() => break,
                    }
                    let should_run = {
                        let inner = raft.inner.lock().unwrap();
                        inner.role != RaftRole::Leader && inner.last_heartbeat.elapsed() >= timeout
                    };
                    if should_run {
                        raft.run_election().await;
                    }
                }
            }));
        }

        // Leader heartbeat / replication
        {
            let raft = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(raft.config.heartbeat_interval()) => {}
                        _ = raft.replicate_notify.notified() => {}
                        _ = shutdown.changed() => break,
                    }
                    raft.replicate_once().await;
                }
            }));
        }

        // Apply loop
        {
            let raft = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = raft.apply_notify.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                        _ = shutdown.changed() => break,
                    }
                    raft.apply_ready();
                }
            }));
        }

        handles
    }

    /// Flush persistent state; called during shutdown.
    pub fn flush(&self) {
        let inner = self.inner.lock().unwrap();
        self.persist_hard_state(&inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryNetwork;

    fn raft_fixture(node_id: NodeId) -> Arc<RaftNode> {
        let network = InMemoryNetwork::new();
        RaftNode::new(
            node_id,
            crate::config::ClusterConfig::testing().consensus,
            Arc::new(network),
            Arc::new(StateMachine::new()),
            None,
            Arc::new(Metrics::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_single_node_becomes_leader_and_commits() {
        let raft = raft_fixture(1);
        raft.run_election().await;
        assert!(raft.is_leader());
        assert_eq!(raft.current_term(), 1);

        let (_tx, rx) = watch::channel(false);
        let handles = raft.start(rx);

        let index = raft
            .submit(Command::UpdateConfig { key: "k".into(), value: "v".into() }, None)
            .await
            .unwrap();
        assert!(index > 0);
        assert!(raft.commit_index() >= index);

        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn test_submit_on_follower_rejected_with_hint() {
        let raft = raft_fixture(1);
        raft.add_peer(2);
        // Learn about a leader via an AppendEntries heartbeat
        raft.handle_append_entries(1, 2, 0, 0, Vec::new(), 0);

        let err = raft.submit(Command::Noop, None).await.unwrap_err();
        match err {
            ClusterError::NotLeader { leader } => assert_eq!(leader, Some(2)),
            other => panic!("expected NotLeader, got {:?}", other),
        }
    }

    #[test]
    fn test_vote_granted_once_per_term() {
        let raft = raft_fixture(1);
        let (_, granted) = raft.handle_request_vote(1, 2, 0, 0);
        assert!(granted);
        // Different candidate, same term
        let (_, granted) = raft.handle_request_vote(1, 3, 0, 0);
        assert!(!granted);
        // Same candidate again: repeat grant is allowed
        let (_, granted) = raft.handle_request_vote(1, 2, 0, 0);
        assert!(granted);
    }

    #[test]
    fn test_vote_rejected_for_stale_log() {
        let raft = raft_fixture(1);
        {
            let mut inner = raft.inner.lock().unwrap();
            inner.current_term = 2;
            inner.log.append(2, Command::Noop, None);
        }
        // Candidate with an older log term
        let (_, granted) = raft.handle_request_vote(3, 2, 5, 1);
        assert!(!granted);
        // Candidate with same last term but shorter log
        let (_, granted) = raft.handle_request_vote(4, 3, 0, 2);
        assert!(!granted);
    }

    #[test]
    fn test_vote_rejected_for_lower_term() {
        let raft = raft_fixture(1);
        {
            let mut inner = raft.inner.lock().unwrap();
            inner.current_term = 5;
        }
        let (term, granted) = raft.handle_request_vote(3, 2, 0, 0);
        assert_eq!(term, 5);
        assert!(!granted);
    }

    #[test]
    fn test_append_entries_rejects_lower_term() {
        let raft = raft_fixture(1);
        {
            let mut inner = raft.inner.lock().unwrap();
            inner.current_term = 5;
        }
        let (term, success, _) = raft.handle_append_entries(3, 2, 0, 0, Vec::new(), 0);
        assert_eq!(term, 5);
        assert!(!success);
    }

    #[test]
    fn test_append_entries_tracks_leader_and_commit() {
        let raft = raft_fixture(1);
        let entries = vec![LogEntry {
            index: 1,
            term: 1,
            command: Command::Noop,
            request_id: None,
            timestamp: chrono::Utc::now(),
        }];
        let (term, success, match_index) = raft.handle_append_entries(1, 2, 0, 0, entries, 1);
        assert_eq!(term, 1);
        assert!(success);
        assert_eq!(match_index, 1);
        assert_eq!(raft.leader_id(), Some(2));
        assert_eq!(raft.commit_index(), 1);
    }

    #[test]
    fn test_append_entries_consistency_rejection() {
        let raft = raft_fixture(1);
        let entry = |index, term| LogEntry {
            index,
            term,
            command: Command::Noop,
            request_id: None,
            timestamp: chrono::Utc::now(),
        };
        // Claims prev entry (5, term 1) which we do not have
        let (_, success, _) = raft.handle_append_entries(1, 2, 5, 1, vec![entry(6, 1)], 0);
        assert!(!success);
    }

    #[tokio::test]
    async fn test_higher_term_in_vote_steps_candidate_down() {
        let raft = raft_fixture(1);
        {
            let mut inner = raft.inner.lock().unwrap();
            inner.role = RaftRole::Candidate;
            inner.current_term = 2;
        }
        let (term, granted) = raft.handle_request_vote(5, 2, 10, 5);
        assert_eq!(term, 5);
        assert!(granted);
        assert_eq!(raft.role(), RaftRole::Follower);
    }
}
