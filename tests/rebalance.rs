mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{build_cluster, wait_until, TestCluster};
use hypersearch::node::SearchNode;
use hypersearch::state_machine::LoadGauges;

async fn join_fresh_node(cluster: &TestCluster, id: u64) -> Arc<SearchNode> {
    let inbox = cluster.network.register(id);
    let node = SearchNode::new(
        id,
        format!("node-{}:{}", id, 7000 + id),
        hypersearch::config::ClusterConfig::testing(),
        Arc::new(Arc::clone(&cluster.network)),
        None,
    )
    .unwrap();
    for peer in cluster.nodes.iter().map(|n| n.node_id()) {
        node.add_seed_peer(peer);
    }
    node.start(inbox);

    // The newcomer may briefly disrupt elections until the leader starts
    // replicating to it; retry the admission against the current leader.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let leader = cluster.await_leader().await;
        match leader.join_cluster(id, node.address().to_string()).await {
            Ok(_) => break,
            Err(err) if tokio::time::Instant::now() > deadline => {
                panic!("join of node {} failed: {}", id, err.message)
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    node
}

/// Scenario: an imbalanced 2-node cluster gains a third node; within a few
/// rebalance intervals the coordinator hands partitions to the newcomer.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn node_join_triggers_rebalance() {
    let cluster = build_cluster(2).await;
    let leader = cluster.await_leader().await;

    // Skew the load gauges: node 1 hot, node 2 idle
    cluster
        .node(1)
        .set_load_gauges(LoadGauges { cpu: 0.9, memory: 0.9, disk: 0.5 });
    cluster
        .node(2)
        .set_load_gauges(LoadGauges { cpu: 0.1, memory: 0.1, disk: 0.1 });

    // Let gauges propagate over a few heartbeats
    tokio::time::sleep(Duration::from_millis(500)).await;

    let newcomer = join_fresh_node(&cluster, 3).await;

    // The newcomer ends up owning partitions
    let rebalanced = wait_until(Duration::from_secs(10), || {
        leader
            .partitions()
            .map(|p| {
                p.data
                    .iter()
                    .filter(|partition| partition.primary() == Some(3))
                    .count()
                    > 0
            })
            .unwrap_or(false)
    })
    .await;
    assert!(rebalanced, "no partitions moved to the new node");

    let moved = leader
        .metrics()
        .partitions_moved
        .load(std::sync::atomic::Ordering::Relaxed);
    assert!(moved > 0, "rebalance never moved a partition");

    newcomer.shutdown().await;
    cluster.shutdown().await;
}

/// A manual rebalance on a balanced cluster is a no-op.
#[tokio::test]
async fn balanced_cluster_rebalance_is_noop() {
    let cluster = build_cluster(3).await;
    let leader = cluster.await_leader().await;

    // Even gauges, no documents: deviation under the threshold
    for node in &cluster.nodes {
        node.set_load_gauges(LoadGauges { cpu: 0.3, memory: 0.3, disk: 0.3 });
    }
    tokio::time::sleep(Duration::from_millis(400)).await;

    let moved = leader.trigger_rebalance().await.expect("manual rebalance");
    assert_eq!(moved.data, 0, "balanced cluster should not move partitions");

    cluster.shutdown().await;
}

/// Leader-only guard: followers refuse admin rebalance.
#[tokio::test]
async fn rebalance_is_leader_only() {
    let cluster = build_cluster(3).await;
    let _ = cluster.await_leader().await;

    let follower = cluster
        .nodes
        .iter()
        .find(|n| !n.raft().is_leader())
        .expect("a follower");
    let err = follower.trigger_rebalance().await.unwrap_err();
    assert_eq!(err.kind, "not_leader");

    cluster.shutdown().await;
}
