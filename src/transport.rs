use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::{ClusterError, ClusterResult};
use crate::message::{Envelope, RpcMessage};
use crate::state_machine::NodeId;

pub type ResponseFuture = Pin<Box<dyn Future<Output = ClusterResult<RpcMessage>> + Send>>;

/// Request/response transport between nodes. The wire framing (HTTP, raw
/// TCP, ...) is a collaborator concern; the core only needs deadline-bounded
/// request semantics.
pub trait Transport: Send + Sync {
    fn request(&self, from: NodeId, to: NodeId, msg: RpcMessage, timeout: Duration) -> ResponseFuture;
}

/// An inbound request awaiting a reply from the serving node.
pub struct Delivery {
    pub envelope: Envelope,
    pub reply: oneshot::Sender<RpcMessage>,
}

struct NetworkInner {
    inboxes: HashMap<NodeId, mpsc::UnboundedSender<Delivery>>,
    /// Directed link cuts: (from, to) pairs that drop traffic
    blocked: HashSet<(NodeId, NodeId)>,
    /// Nodes that are down entirely
    dead: HashSet<NodeId>,
}

/// In-process cluster bus used by tests and single-process simulations.
///
/// Supports link-level partitions and node kills so partition and failover
/// behavior can be exercised deterministically.
pub struct InMemoryNetwork {
    inner: Mutex<NetworkInner>,
    next_msg_id: AtomicU64,
    /// Simulated one-way latency applied to every delivery
    latency: Duration,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(InMemoryNetwork {
            inner: Mutex::new(NetworkInner {
                inboxes: HashMap::new(),
                blocked: HashSet::new(),
                dead: HashSet::new(),
            }),
            next_msg_id: AtomicU64::new(1),
            latency: Duration::from_millis(1),
        })
    }

    /// Register a node, returning the receiver its serve loop drains.
    pub fn register(&self, node_id: NodeId) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner.inboxes.insert(node_id, tx);
        inner.dead.remove(&node_id);
        rx
    }

    /// Cut both directions between two nodes.
    pub fn block(&self, a: NodeId, b: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        inner.blocked.insert((a, b));
        inner.blocked.insert((b, a));
    }

    /// Partition the cluster into disjoint groups; traffic crosses a group
    /// boundary in neither direction.
    pub fn partition(&self, groups: &[&[NodeId]]) {
        let mut inner = self.inner.lock().unwrap();
        inner.blocked.clear();
        for (i, group_a) in groups.iter().enumerate() {
            for group_b in groups.iter().skip(i + 1) {
                for &a in group_a.iter() {
                    for &b in group_b.iter() {
                        inner.blocked.insert((a, b));
                        inner.blocked.insert((b, a));
                    }
                }
            }
        }
    }

    /// Remove every link cut.
    pub fn heal(&self) {
        self.inner.lock().unwrap().blocked.clear();
    }

    /// Stop delivering to a node; its inbox is dropped.
    pub fn kill(&self, node_id: NodeId) {
        let mut inner = self.inner.lock().unwrap();
        inner.inboxes.remove(&node_id);
        inner.dead.insert(node_id);
    }

    pub fn is_dead(&self, node_id: NodeId) -> bool {
        self.inner.lock().unwrap().dead.contains(&node_id)
    }

    /// Whether traffic may flow from `from` to `to` at all.
    fn link_ok(&self, from: NodeId, to: NodeId) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.blocked.contains(&(from, to))
            && !inner.dead.contains(&to)
            && !inner.dead.contains(&from)
    }

    fn route(&self, from: NodeId, to: NodeId) -> Option<mpsc::UnboundedSender<Delivery>> {
        let inner = self.inner.lock().unwrap();
        if inner.blocked.contains(&(from, to))
            || inner.dead.contains(&to)
            || inner.dead.contains(&from)
        {
            return None;
        }
        inner.inboxes.get(&to).cloned()
    }
}

impl Transport for Arc<InMemoryNetwork> {
    fn request(&self, from: NodeId, to: NodeId, msg: RpcMessage, timeout: Duration) -> ResponseFuture {
        let network = Arc::clone(self);
        Box::pin(async move {
            let msg_id = network.next_msg_id.fetch_add(1, Ordering::SeqCst);
            let kind = msg.kind();
            log::trace!("rpc {} #{}: {} -> {}", kind, msg_id, from, to);

            let Some(sender) = network.route(from, to) else {
                // Unreachable target: the caller sees a timeout, never a hang
                tokio::time::sleep(timeout).await;
                return Err(ClusterError::Timeout(timeout));
            };

            tokio::time::sleep(network.latency).await;

            let (reply_tx, reply_rx) = oneshot::channel();
            let delivery = Delivery {
                envelope: Envelope { msg_id, from, to, msg },
                reply: reply_tx,
            };
            if sender.send(delivery).is_err() {
                tokio::time::sleep(timeout).await;
                return Err(ClusterError::Timeout(timeout));
            }

            match tokio::time::timeout(timeout, reply_rx).await {
                Ok(Ok(response)) => {
                    // The return path honors partitions formed mid-flight
                    if !network.link_ok(to, from) {
                        tokio::time::sleep(timeout).await;
                        return Err(ClusterError::Timeout(timeout));
                    }
                    Ok(response)
                }
                Ok(Err(_)) => Err(ClusterError::Unavailable(format!("node {} dropped request", to))),
                Err(_) => Err(ClusterError::Timeout(timeout)),
            }
        })
    }
}
