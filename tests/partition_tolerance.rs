mod common;

use std::time::Duration;

use common::{build_cluster, wait_until};
use hypersearch::ap_store::{DataFreshness, PartitionStatus, SyncStatus};
use hypersearch::error::ClusterError;
use hypersearch::state_machine::Command;
use serde_json::json;

/// Scenario: a 5-node cluster splits 3/2. The majority side keeps
/// committing through Raft; the minority side still serves AP reads with
/// staleness tags and queues AP writes; healing delivers the queued writes
/// and reconciles conflicts by last-writer-wins.
#[tokio::test]
async fn split_brain_majority_commits_minority_stays_available() {
    let cluster = build_cluster(5).await;
    let _ = cluster.await_leader().await;

    let majority: Vec<u64> = vec![1, 2, 3];
    let minority: Vec<u64> = vec![4, 5];
    cluster.network.partition(&[&majority, &minority]);

    // Minority notices the partition
    let partitioned = wait_until(Duration::from_secs(10), || {
        cluster.node(4).ap_store().partition_status() == PartitionStatus::Partitioned
    })
    .await;
    assert!(partitioned, "minority never detected the partition");

    // Majority side: Raft keeps working
    let majority_leader = cluster.await_leader_among(&majority).await;
    majority_leader
        .raft()
        .submit(Command::UpdateConfig { key: "side".into(), value: "majority".into() }, None)
        .await
        .expect("majority commit");

    // Minority side: Raft cannot commit
    let minority_node = cluster.node(4);
    let submit = minority_node
        .raft()
        .submit(Command::UpdateConfig { key: "side".into(), value: "minority".into() }, None)
        .await;
    match submit {
        Err(ClusterError::NotLeader { .. }) | Err(ClusterError::Timeout(_)) | Err(ClusterError::NoQuorum { .. }) => {}
        other => panic!("minority raft submit should fail, got {:?}", other),
    }

    // Minority AP write: always accepted, queued for later sync
    let write = minority_node.ap_store().write("doc-locations", json!("minority-view")).await;
    assert!(write.accepted);
    assert_eq!(write.sync_status, SyncStatus::WillSyncLater);
    assert!(write.warning.is_some());

    // Minority AP read: succeeds with a staleness tag
    let read = minority_node.ap_store().read("doc-locations");
    assert_eq!(read.value, Some(json!("minority-view")));
    assert_eq!(read.freshness, DataFreshness::PotentiallyStale);
    assert_eq!(read.partition_status, PartitionStatus::Partitioned);

    // Majority writes the same key a bit later: last writer wins on heal
    tokio::time::sleep(Duration::from_millis(100)).await;
    let majority_write = cluster.node(1).ap_store().write("doc-locations", json!("majority-view")).await;
    assert!(majority_write.accepted);

    cluster.network.heal();

    // Heal: minority pending writes are delivered, conflicts resolved LWW,
    // so every node converges on the later (majority) value
    let converged = wait_until(Duration::from_secs(15), || {
        cluster.nodes.iter().all(|n| {
            n.ap_store().read("doc-locations").value == Some(json!("majority-view"))
        })
    })
    .await;
    assert!(converged, "cluster never converged after heal");

    // Connectivity fully restored
    let connected = wait_until(Duration::from_secs(10), || {
        cluster
            .nodes
            .iter()
            .all(|n| n.ap_store().partition_status() == PartitionStatus::Connected)
    })
    .await;
    assert!(connected, "partition status never returned to connected");

    cluster.shutdown().await;
}

/// AP availability invariant: reads and writes return within their
/// deadline with success regardless of partition status.
#[tokio::test]
async fn ap_operations_always_succeed() {
    let cluster = build_cluster(3).await;
    let node = cluster.node(1);

    // Connected
    let write = node.ap_store().write("k", json!(1)).await;
    assert!(write.accepted);
    assert!(node.ap_store().read("k").value.is_some());

    // Fully isolated
    cluster.network.partition(&[&[1], &[2, 3]]);
    let partitioned = wait_until(Duration::from_secs(10), || {
        node.ap_store().partition_status() == PartitionStatus::Partitioned
    })
    .await;
    assert!(partitioned);

    let write = tokio::time::timeout(
        Duration::from_secs(2),
        node.ap_store().write("k", json!(2)),
    )
    .await
    .expect("write must not hang");
    assert!(write.accepted);
    assert_eq!(write.partition_status, PartitionStatus::Partitioned);

    let read = node.ap_store().read("k");
    assert_eq!(read.value, Some(json!(2)));
    assert_ne!(read.freshness, DataFreshness::Confirmed);

    cluster.shutdown().await;
}

/// Freshness degrades from potentially-stale to stale as a partition ages.
#[tokio::test]
async fn freshness_tags_follow_partition_age() {
    let cluster = build_cluster(3).await;
    let node = cluster.node(1);

    let _ = node.ap_store().write("aging", json!("value")).await;
    cluster.network.partition(&[&[1], &[2, 3]]);

    let partitioned = wait_until(Duration::from_secs(10), || {
        node.ap_store().partition_status() == PartitionStatus::Partitioned
    })
    .await;
    assert!(partitioned);

    let read = node.ap_store().read("aging");
    assert_eq!(read.freshness, DataFreshness::PotentiallyStale);
    assert!(read.warning.is_some());

    cluster.shutdown().await;
}
