mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::{build_cluster, wait_until};

/// Scenario: k=3 w=2, but both replication targets are unreachable. The
/// write fails with NoQuorum and the primary's locally accepted copy is
/// rolled back, so a subsequent get reports NotFound.
#[tokio::test]
async fn quorum_miss_rolls_back_local_write() {
    let cluster = build_cluster(3).await;
    let leader = cluster.await_leader().await;
    let leader_id = leader.node_id();

    // Cut the leader off from both peers (the peers can still talk to
    // each other, so this is a link failure, not a clean partition)
    for node in &cluster.nodes {
        let id = node.node_id();
        if id != leader_id {
            cluster.network.block(leader_id, id);
        }
    }

    let before = leader.local_document_count();
    let err = leader
        .index_document("doomed write".to_string(), HashMap::new(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, "no_quorum");
    assert!(err.retryable);

    // Rollback observed on the primary that had accepted locally
    assert_eq!(leader.local_document_count(), before);

    cluster.shutdown().await;
}

/// With the cluster healthy again, the same write succeeds and lands on a
/// full replica set.
#[tokio::test]
async fn write_succeeds_after_heal() {
    let cluster = build_cluster(3).await;
    let leader = cluster.await_leader().await;
    let leader_id = leader.node_id();

    for node in &cluster.nodes {
        if node.node_id() != leader_id {
            cluster.network.block(leader_id, node.node_id());
        }
    }
    let _ = leader
        .index_document("first attempt".to_string(), HashMap::new(), None)
        .await
        .unwrap_err();

    cluster.network.heal();

    // The isolated leader lost its term; re-resolve leadership and wait
    // for liveness to settle so placement sees healthy peers again
    let leader = cluster.await_leader().await;
    wait_until(Duration::from_secs(10), || {
        cluster
            .leader()
            .map(|l| l.state_machine().healthy_nodes().len() == 3)
            .unwrap_or(false)
    })
    .await;
    let leader = cluster.leader().unwrap_or(leader);

    let receipt = leader
        .index_document("second attempt".to_string(), HashMap::new(), None)
        .await
        .expect("write after heal");
    assert_eq!(receipt.data.replicas.len(), 3);

    let doc_id = receipt.data.doc_id;
    let ok = wait_until(Duration::from_secs(5), || {
        cluster.nodes.iter().filter(|n| n.holds_document(&doc_id)).count() >= 2
    })
    .await;
    assert!(ok, "replicas never materialized after heal");

    cluster.shutdown().await;
}

/// Deleting a document removes it from every replica.
#[tokio::test]
async fn delete_fans_out_to_all_replicas() {
    let cluster = build_cluster(3).await;
    let leader = cluster.await_leader().await;

    let receipt = leader
        .index_document("short lived document".to_string(), HashMap::new(), None)
        .await
        .expect("index");
    let doc_id = receipt.data.doc_id;

    let present = wait_until(Duration::from_secs(5), || {
        cluster.nodes.iter().filter(|n| n.holds_document(&doc_id)).count() >= 2
    })
    .await;
    assert!(present);

    leader.delete_document(doc_id, None).await.expect("delete");

    let gone = wait_until(Duration::from_secs(5), || {
        cluster.nodes.iter().all(|n| !n.holds_document(&doc_id))
    })
    .await;
    assert!(gone, "some replica still holds the deleted document");

    // The replicated metadata forgot it too
    assert!(leader.state_machine().document(&doc_id).is_none());

    cluster.shutdown().await;
}
