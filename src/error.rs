use std::time::Duration;

use thiserror::Error;

use crate::state_machine::NodeId;

/// Error taxonomy for cluster operations.
///
/// Every public operation of the core surfaces one of these kinds. Callers
/// use `is_retryable()` and `leader_hint()` to decide whether to retry and
/// where.
#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    /// The command requires the current leader. Carries the leader id when
    /// this node knows it, so the caller can retry there.
    #[error("not the leader (current leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// A Raft commit or replication write could not reach a majority.
    #[error("quorum not reached: {reached}/{required}")]
    NoQuorum { reached: usize, required: usize },

    /// A bounded deadline expired on an RPC.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Duplicate registration or a concurrent write detected by vector
    /// clocks. Carried alongside the accepted value, never instead of it.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// No healthy node can serve the request right now.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Invariant violation. Logged, and for data-integrity violations the
    /// node refuses further writes.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ClusterError::NotLeader { .. } => true,
            ClusterError::NoQuorum { .. } => true,
            ClusterError::Timeout(_) => true,
            ClusterError::Unavailable(_) => true,
            ClusterError::Conflict(_) => false,
            ClusterError::NotFound(_) => false,
            ClusterError::Internal(_) => false,
        }
    }

    /// Leader id to retry against, when known.
    pub fn leader_hint(&self) -> Option<NodeId> {
        match self {
            ClusterError::NotLeader { leader } => *leader,
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClusterError::NotLeader { .. } => "not_leader",
            ClusterError::NoQuorum { .. } => "no_quorum",
            ClusterError::Timeout(_) => "timeout",
            ClusterError::Conflict(_) => "conflict",
            ClusterError::NotFound(_) => "not_found",
            ClusterError::Unavailable(_) => "unavailable",
            ClusterError::Internal(_) => "internal",
        }
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        assert!(ClusterError::NotLeader { leader: Some(3) }.is_retryable());
        assert!(ClusterError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(!ClusterError::NotFound("doc".into()).is_retryable());
        assert!(!ClusterError::Internal("bad".into()).is_retryable());
    }

    #[test]
    fn test_leader_hint() {
        let err = ClusterError::NotLeader { leader: Some(7) };
        assert_eq!(err.leader_hint(), Some(7));
        assert_eq!(ClusterError::NoQuorum { reached: 1, required: 2 }.leader_hint(), None);
    }
}
