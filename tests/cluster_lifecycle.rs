mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::{build_cluster, wait_until};
use hypersearch::search::SearchRequest;
use hypersearch::state_machine::Command;
use uuid::Uuid;

/// A single node becomes leader without voting peers and accepts writes.
#[tokio::test]
async fn single_node_forms_cluster_and_accepts_writes() {
    let cluster = build_cluster(1).await;
    let node = cluster.node(1);

    assert!(node.raft().is_leader());
    assert_eq!(node.master().unwrap().data, Some(1));

    let receipt = node
        .index_document("solo node document".to_string(), HashMap::new(), None)
        .await
        .expect("index on single node");
    assert_eq!(receipt.data.replicas, vec![1]);
    assert!(node.holds_document(&receipt.data.doc_id));

    cluster.shutdown().await;
}

/// Scenario: 3-node cluster, k=3 w=2. Index, search, delete, search.
#[tokio::test]
async fn document_lifecycle_across_three_nodes() {
    let cluster = build_cluster(3).await;
    let leader = cluster.await_leader().await;

    // Index
    let receipt = leader
        .index_document("hello world".to_string(), HashMap::new(), None)
        .await
        .expect("indexing should reach quorum");
    let doc_id = receipt.data.doc_id;
    assert!(receipt.data.replicas.len() >= 2, "expected at least w replicas");

    // Every replica eventually holds a copy
    let replicas = receipt.data.replicas.clone();
    let ok = wait_until(Duration::from_secs(5), || {
        replicas.iter().all(|id| cluster.node(*id).holds_document(&doc_id))
    })
    .await;
    assert!(ok, "replicas never converged");

    // Search finds it
    let results = leader
        .search(SearchRequest { query: "hello".to_string(), ..Default::default() })
        .await
        .expect("search");
    assert_eq!(results.data.total_results, 1);
    assert_eq!(results.data.hits[0].doc_id, doc_id);

    // Get returns it with an access count bump
    let fetched = leader.get_document(&doc_id);
    if let Ok(ok) = fetched {
        assert_eq!(ok.data.content, "hello world");
    }

    // Delete everywhere
    leader.delete_document(doc_id, None).await.expect("delete");
    let gone = wait_until(Duration::from_secs(5), || {
        cluster.nodes.iter().all(|n| !n.holds_document(&doc_id))
    })
    .await;
    assert!(gone, "delete did not reach every replica");

    // Search is empty again
    let results = leader
        .search(SearchRequest { query: "hello".to_string(), ..Default::default() })
        .await
        .expect("search after delete");
    assert_eq!(results.data.total_results, 0);

    // Get reports the document unknown
    let err = leader.get_document(&doc_id).unwrap_err();
    assert_eq!(err.kind, "not_found");

    cluster.shutdown().await;
}

/// A retried command with the same request id applies at most once.
#[tokio::test]
async fn duplicate_request_id_applies_once() {
    let cluster = build_cluster(3).await;
    let leader = cluster.await_leader().await;

    let request_id = Uuid::new_v4();
    leader
        .raft()
        .submit(
            Command::UpdateConfig { key: "winner".into(), value: "first".into() },
            Some(request_id),
        )
        .await
        .expect("first submit");
    leader
        .raft()
        .submit(
            Command::UpdateConfig { key: "winner".into(), value: "second".into() },
            Some(request_id),
        )
        .await
        .expect("retried submit");

    // The retry occupies a log slot but is skipped at apply time
    assert_eq!(
        leader.state_machine().config_value("winner"),
        Some("first".to_string())
    );

    cluster.shutdown().await;
}

/// With an even node count, elections still require a strict majority and
/// the cluster converges on one leader.
#[tokio::test]
async fn even_sized_cluster_elects_single_leader() {
    let cluster = build_cluster(4).await;
    let _ = cluster.await_leader().await;

    let leaders: Vec<_> = cluster.nodes.iter().filter(|n| n.raft().is_leader()).collect();
    assert_eq!(leaders.len(), 1, "exactly one leader expected");

    // Partition table fully assigned over members
    let leader = cluster.await_leader().await;
    let partitions = leader.partitions().unwrap().data;
    assert!(!partitions.is_empty());
    for partition in &partitions {
        assert!(partition.primary().is_some());
    }

    cluster.shutdown().await;
}

/// Non-leaders reject cluster mutations with a leader hint.
#[tokio::test]
async fn followers_reject_writes_with_hint() {
    let cluster = build_cluster(3).await;
    let leader = cluster.await_leader().await;

    let follower = cluster
        .nodes
        .iter()
        .find(|n| !n.raft().is_leader())
        .expect("a follower exists");

    let err = follower
        .index_document("content".to_string(), HashMap::new(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, "not_leader");
    assert!(err.retryable);
    assert_eq!(err.leader_hint, Some(leader.node_id()));

    cluster.shutdown().await;
}
