use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::ap_store::ApStore;
use crate::config::HeartbeatConfig;
use crate::message::RpcMessage;
use crate::metrics::Metrics;
use crate::scatter;
use crate::state_machine::{LoadGauges, NodeId, NodeStatus, StateMachine};
use crate::transport::Transport;

/// Callbacks fired on liveness transitions. A node is reported unreachable
/// once after `max_heartbeat_failures` consecutive misses, and recovered
/// once on the next successful contact.
pub trait LivenessObserver: Send + Sync {
    fn on_node_unreachable(&self, _node_id: NodeId) {}
    fn on_node_recovered(&self, _node_id: NodeId) {}
}

#[derive(Debug, Clone)]
struct PeerLiveness {
    consecutive_failures: u32,
    unreachable: bool,
    last_seen: Option<DateTime<Utc>>,
    last_gauges: LoadGauges,
}

impl Default for PeerLiveness {
    fn default() -> Self {
        PeerLiveness {
            consecutive_failures: 0,
            unreachable: false,
            last_seen: None,
            last_gauges: LoadGauges::default(),
        }
    }
}

/// Periodic bidirectional liveness: broadcasts heartbeats with load gauges
/// to every known peer and tracks who answers. Feeds the AP store's
/// partition tracker and the coordinator's failure handling.
pub struct HeartbeatService {
    node_id: NodeId,
    config: HeartbeatConfig,
    transport: Arc<dyn Transport>,
    state_machine: Arc<StateMachine>,
    ap_store: Arc<ApStore>,
    peers: Mutex<HashMap<NodeId, PeerLiveness>>,
    local_gauges: Mutex<LoadGauges>,
    observers: Mutex<Vec<Box<dyn LivenessObserver>>>,
    metrics: Arc<Metrics>,
}

impl HeartbeatService {
    pub fn new(
        node_id: NodeId,
        config: HeartbeatConfig,
        transport: Arc<dyn Transport>,
        state_machine: Arc<StateMachine>,
        ap_store: Arc<ApStore>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(HeartbeatService {
            node_id,
            config,
            transport,
            state_machine,
            ap_store,
            peers: Mutex::new(HashMap::new()),
            local_gauges: Mutex::new(LoadGauges::default()),
            observers: Mutex::new(Vec::new()),
            metrics,
        })
    }

    pub fn register_observer(&self, observer: Box<dyn LivenessObserver>) {
        self.observers.lock().unwrap().push(observer);
    }

    /// Report this node's own resource gauges; carried on every heartbeat.
    pub fn set_local_gauges(&self, gauges: LoadGauges) {
        *self.local_gauges.lock().unwrap() = gauges;
    }

    pub fn local_gauges(&self) -> LoadGauges {
        *self.local_gauges.lock().unwrap()
    }

    /// Handle an inbound heartbeat; any contact counts as liveness.
    pub fn handle_heartbeat(
        &self,
        from: NodeId,
        _status: NodeStatus,
        gauges: LoadGauges,
    ) -> RpcMessage {
        self.metrics
            .heartbeats_received
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let recovered = {
            let mut peers = self.peers.lock().unwrap();
            let entry = peers.entry(from).or_default();
            let recovered = entry.unreachable;
            entry.consecutive_failures = 0;
            entry.unreachable = false;
            entry.last_seen = Some(Utc::now());
            entry.last_gauges = gauges;
            recovered
        };

        self.ap_store.record_contact(from);
        if recovered {
            self.notify_recovered(from);
        }

        RpcMessage::HeartbeatAck { node_id: self.node_id }
    }

    /// Liveness view for node details and health reporting.
    pub fn peer_view(&self, node_id: NodeId) -> Option<(bool, Option<DateTime<Utc>>, LoadGauges)> {
        self.peers
            .lock()
            .unwrap()
            .get(&node_id)
            .map(|p| (!p.unreachable, p.last_seen, p.last_gauges))
    }

    pub fn unreachable_peers(&self) -> Vec<NodeId> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.unreachable)
            .map(|(n, _)| *n)
            .collect()
    }

    fn notify_unreachable(&self, node_id: NodeId) {
        self.metrics
            .nodes_marked_unreachable
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        log::warn!("node {} declared unreachable", node_id);
        for obs in self.observers.lock().unwrap().iter() {
            obs.on_node_unreachable(node_id);
        }
    }

    fn notify_recovered(&self, node_id: NodeId) {
        log::info!("node {} reachable again", node_id);
        for obs in self.observers.lock().unwrap().iter() {
            obs.on_node_recovered(node_id);
        }
    }

    async fn broadcast_once(self: &Arc<Self>) {
        let targets: Vec<NodeId> = self
            .state_machine
            .nodes()
            .into_iter()
            .map(|n| n.node_id)
            .filter(|n| *n != self.node_id)
            .collect();
        if targets.is_empty() {
            return;
        }

        let gauges = self.local_gauges();
        let document_count = self.state_machine.document_count() as u64;
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        let transport = Arc::clone(&self.transport);
        let from = self.node_id;

        self.metrics
            .heartbeats_sent
            .fetch_add(targets.len() as u64, std::sync::atomic::Ordering::Relaxed);

        let outcome = scatter::scatter(targets.clone(), interval, interval, move |peer| {
            let transport = Arc::clone(&transport);
            async move {
                transport
                    .request(
                        from,
                        peer,
                        RpcMessage::Heartbeat {
                            node_id: from,
                            status: NodeStatus::Healthy,
                            gauges,
                            document_count,
                            partition_count: 0,
                        },
                        interval,
                    )
                    .await
            }
        })
        .await;

        let mut newly_unreachable = Vec::new();
        let mut newly_recovered = Vec::new();
        {
            let mut peers = self.peers.lock().unwrap();
            for (peer, reply) in &outcome.ok {
                if let RpcMessage::HeartbeatAck { .. } = reply {
                    let entry = peers.entry(*peer).or_default();
                    if entry.unreachable {
                        newly_recovered.push(*peer);
                    }
                    entry.consecutive_failures = 0;
                    entry.unreachable = false;
                    entry.last_seen = Some(Utc::now());
                }
            }
            for peer in &outcome.failed {
                let entry = peers.entry(*peer).or_default();
                entry.consecutive_failures += 1;
                if !entry.unreachable && entry.consecutive_failures >= self.config.max_heartbeat_failures {
                    entry.unreachable = true;
                    newly_unreachable.push(*peer);
                }
            }
        }

        for (peer, _) in &outcome.ok {
            self.ap_store.record_contact(*peer);
        }
        for peer in &newly_unreachable {
            self.ap_store.record_failure(*peer);
            self.notify_unreachable(*peer);
        }
        for peer in newly_recovered {
            self.notify_recovered(peer);
        }
    }

    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let interval = Duration::from_millis(service.config.heartbeat_interval_ms);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
                service.broadcast_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryNetwork;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        down: Arc<AtomicUsize>,
        up: Arc<AtomicUsize>,
    }
    impl LivenessObserver for Recorder {
        fn on_node_unreachable(&self, _node_id: NodeId) {
            self.down.fetch_add(1, Ordering::SeqCst);
        }
        fn on_node_recovered(&self, _node_id: NodeId) {
            self.up.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn service() -> (Arc<HeartbeatService>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let network: Arc<dyn Transport> = Arc::new(InMemoryNetwork::new());
        let metrics = Arc::new(Metrics::new());
        let state_machine = Arc::new(StateMachine::new());
        let ap = Arc::new(ApStore::new(
            1,
            crate::config::ClusterConfig::testing().ap,
            Arc::clone(&network),
            None,
            Arc::clone(&metrics),
        ));
        ap.register_node(2);
        let svc = HeartbeatService::new(
            1,
            crate::config::ClusterConfig::testing().heartbeat,
            network,
            state_machine,
            ap,
            metrics,
        );
        let down = Arc::new(AtomicUsize::new(0));
        let up = Arc::new(AtomicUsize::new(0));
        svc.register_observer(Box::new(Recorder { down: Arc::clone(&down), up: Arc::clone(&up) }));
        (svc, down, up)
    }

    #[test]
    fn test_inbound_heartbeat_acks_and_records() {
        let (svc, _, _) = service();
        let reply = svc.handle_heartbeat(2, NodeStatus::Healthy, LoadGauges::default());
        assert!(matches!(reply, RpcMessage::HeartbeatAck { node_id: 1 }));
        let (reachable, last_seen, _) = svc.peer_view(2).unwrap();
        assert!(reachable);
        assert!(last_seen.is_some());
    }

    #[test]
    fn test_recovery_fires_once() {
        let (svc, down, up) = service();
        {
            let mut peers = svc.peers.lock().unwrap();
            let entry = peers.entry(2).or_default();
            entry.unreachable = true;
            entry.consecutive_failures = 5;
        }
        svc.handle_heartbeat(2, NodeStatus::Healthy, LoadGauges::default());
        svc.handle_heartbeat(2, NodeStatus::Healthy, LoadGauges::default());
        assert_eq!(up.load(Ordering::SeqCst), 1);
        assert_eq!(down.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_gauges_carried() {
        let (svc, _, _) = service();
        let gauges = LoadGauges { cpu: 0.5, memory: 0.25, disk: 0.1 };
        svc.set_local_gauges(gauges);
        assert_eq!(svc.local_gauges(), gauges);
    }
}
