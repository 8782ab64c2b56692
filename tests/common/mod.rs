#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hypersearch::config::ClusterConfig;
use hypersearch::node::SearchNode;
use hypersearch::state_machine::NodeId;
use hypersearch::transport::InMemoryNetwork;

pub struct TestCluster {
    pub network: Arc<InMemoryNetwork>,
    pub nodes: Vec<Arc<SearchNode>>,
}

impl TestCluster {
    pub fn node(&self, id: NodeId) -> &Arc<SearchNode> {
        self.nodes
            .iter()
            .find(|n| n.node_id() == id)
            .unwrap_or_else(|| panic!("no node {}", id))
    }

    pub fn leader(&self) -> Option<Arc<SearchNode>> {
        self.nodes.iter().find(|n| n.raft().is_leader()).cloned()
    }

    pub fn leader_among(&self, ids: &[NodeId]) -> Option<Arc<SearchNode>> {
        self.nodes
            .iter()
            .filter(|n| ids.contains(&n.node_id()))
            .find(|n| n.raft().is_leader())
            .cloned()
    }

    pub async fn await_leader(&self) -> Arc<SearchNode> {
        for _ in 0..500 {
            if let Some(leader) = self.leader() {
                return leader;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no leader elected within 10s");
    }

    pub async fn await_leader_among(&self, ids: &[NodeId]) -> Arc<SearchNode> {
        for _ in 0..500 {
            if let Some(leader) = self.leader_among(ids) {
                return leader;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no leader among {:?} within 10s", ids);
    }

    pub async fn await_membership(&self, expected: usize) {
        let ok = wait_until(Duration::from_secs(10), || {
            self.nodes
                .iter()
                .all(|n| n.state_machine().nodes().len() == expected)
        })
        .await;
        assert!(ok, "membership did not converge to {} nodes", expected);
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn build_cluster(n: usize) -> TestCluster {
    build_cluster_with(n, ClusterConfig::testing()).await
}

pub async fn build_cluster_with(n: usize, config: ClusterConfig) -> TestCluster {
    let network = InMemoryNetwork::new();
    let mut nodes = Vec::new();

    for id in 1..=n as u64 {
        let inbox = network.register(id);
        let node = SearchNode::new(
            id,
            format!("node-{}:{}", id, 7000 + id),
            config.clone(),
            Arc::new(Arc::clone(&network)),
            None,
        )
        .expect("node construction");
        for peer in 1..=n as u64 {
            if peer != id {
                node.add_seed_peer(peer);
            }
        }
        node.start(inbox);
        nodes.push(node);
    }

    let cluster = TestCluster { network, nodes };

    // Form the replicated membership: the leader registers itself, then
    // admits every other node.
    let leader = cluster.await_leader().await;
    leader.bootstrap().await.expect("bootstrap");

    for node in &cluster.nodes {
        let id = node.node_id();
        let address = node.address().to_string();
        if id == leader.node_id() {
            continue;
        }
        join_with_retry(&cluster, id, address).await;
    }

    cluster.await_membership(n).await;
    cluster
}

async fn join_with_retry(cluster: &TestCluster, id: NodeId, address: String) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let leader = cluster.await_leader().await;
        match leader.join_cluster(id, address.clone()).await {
            Ok(_) => return,
            Err(err) if tokio::time::Instant::now() > deadline => {
                panic!("join of node {} failed: {} ({})", id, err.message, err.kind)
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
}
