use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::aggregate::SearchHit;
use crate::ap_store::VersionedValue;
use crate::raft_log::LogEntry;
use crate::state_machine::{LoadGauges, NodeId, NodeStatus};

/// All node-to-node RPC payloads. One closed enum so dispatch is an
/// exhaustive match and the wire surface cannot grow accidentally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcMessage {
    // Raft
    RequestVote {
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteReply {
        term: u64,
        vote_granted: bool,
    },
    AppendEntries {
        term: u64,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    AppendEntriesReply {
        term: u64,
        success: bool,
        match_index: u64,
    },

    // Liveness
    Heartbeat {
        node_id: NodeId,
        status: NodeStatus,
        gauges: LoadGauges,
        document_count: u64,
        partition_count: u64,
    },
    HeartbeatAck {
        node_id: NodeId,
    },

    // Document replication
    ReplicateDoc {
        doc: Box<crate::document::Document>,
    },
    ReplicateDocReply {
        success: bool,
    },
    /// Remove a local copy: quorum rollback and delete fan-out
    RollbackDoc {
        doc_id: uuid::Uuid,
    },
    RollbackDocReply {
        success: bool,
    },

    // Query plane
    SearchLocal {
        query: String,
        limit: usize,
        filters: HashMap<String, String>,
    },
    SearchLocalReply {
        results: Vec<SearchHit>,
    },
    LocateTerm {
        term: String,
    },
    LocateTermReply {
        nodes: Vec<NodeId>,
    },
    UpdateShard {
        node_id: NodeId,
        terms_added: Vec<String>,
        terms_removed: Vec<String>,
    },
    UpdateShardAck,

    // AP store synchronization
    ApSync {
        key: String,
        value: VersionedValue,
    },
    ApSyncReply {
        updated: bool,
    },
    ApDigest {
        /// (key, vector-clock sum, wall-clock millis) per local entry
        entries: Vec<(String, u64, i64)>,
    },
    ApDigestReply {
        /// Keys the sender should push via ApSync
        stale_or_missing: Vec<String>,
    },

    /// Generic failure reply
    Error {
        message: String,
    },
}

impl RpcMessage {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RpcMessage::RequestVote { .. } => "request_vote",
            RpcMessage::RequestVoteReply { .. } => "request_vote_reply",
            RpcMessage::AppendEntries { .. } => "append_entries",
            RpcMessage::AppendEntriesReply { .. } => "append_entries_reply",
            RpcMessage::Heartbeat { .. } => "heartbeat",
            RpcMessage::HeartbeatAck { .. } => "heartbeat_ack",
            RpcMessage::ReplicateDoc { .. } => "replicate_doc",
            RpcMessage::ReplicateDocReply { .. } => "replicate_doc_reply",
            RpcMessage::RollbackDoc { .. } => "rollback_doc",
            RpcMessage::RollbackDocReply { .. } => "rollback_doc_reply",
            RpcMessage::SearchLocal { .. } => "search_local",
            RpcMessage::SearchLocalReply { .. } => "search_local_reply",
            RpcMessage::LocateTerm { .. } => "locate_term",
            RpcMessage::LocateTermReply { .. } => "locate_term_reply",
            RpcMessage::UpdateShard { .. } => "update_shard",
            RpcMessage::UpdateShardAck => "update_shard_ack",
            RpcMessage::ApSync { .. } => "ap_sync",
            RpcMessage::ApSyncReply { .. } => "ap_sync_reply",
            RpcMessage::ApDigest { .. } => "ap_digest",
            RpcMessage::ApDigestReply { .. } => "ap_digest_reply",
            RpcMessage::Error { .. } => "error",
        }
    }
}

/// A message in flight. Every envelope carries a monotonically assigned id
/// for logging and correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_id: u64,
    pub from: NodeId,
    pub to: NodeId,
    pub msg: RpcMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_round_trip() {
        let msg = RpcMessage::RequestVote {
            term: 3,
            candidate_id: 7,
            last_log_index: 12,
            last_log_term: 2,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: RpcMessage = serde_json::from_str(&json).unwrap();
        match back {
            RpcMessage::RequestVote { term, candidate_id, .. } => {
                assert_eq!(term, 3);
                assert_eq!(candidate_id, 7);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = Envelope {
            msg_id: 42,
            from: 1,
            to: 2,
            msg: RpcMessage::LocateTerm { term: "rust".into() },
        };
        let bytes = bincode::serialize(&envelope).unwrap();
        let back: Envelope = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.msg_id, 42);
        assert_eq!(back.msg.kind(), "locate_term");
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(RpcMessage::UpdateShardAck.kind(), "update_shard_ack");
        assert_eq!(RpcMessage::Error { message: "boom".into() }.kind(), "error");
    }
}
