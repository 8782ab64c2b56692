pub use crate::config::{ClusterConfig, ClusterConfigBuilder};
pub use crate::error::{ClusterError, ClusterResult};
pub use crate::node::{ApiError, ApiOk, ApiResult, DocumentReceipt, SearchNode};
pub use crate::search::SearchRequest;
pub use crate::state_machine::NodeId;

pub mod aggregate;
pub mod ap_store;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod heartbeat;
pub mod hypercube;
pub mod index;
pub mod message;
pub mod metrics;
pub mod monitoring;
pub mod node;
pub mod persist;
pub mod query;
pub mod raft;
pub mod raft_log;
pub mod replication;
pub mod scatter;
pub mod search;
pub mod shard;
pub mod state_machine;
pub mod tokenizer;
pub mod transport;
pub mod vectorize;
