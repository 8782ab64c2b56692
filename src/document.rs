use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::NodeId;
use crate::vectorize::VectorBundle;

/// A stored document: content, metadata, placement and vector bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: Uuid,
    pub content: String,
    pub metadata: HashMap<String, String>,
    pub partition_id: u32,
    pub primary_node: NodeId,
    pub vectors: VectorBundle,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub access_count: u64,
    /// CRC32 of the content, for replica divergence checks
    pub checksum: u32,
}

impl Document {
    pub fn new(
        doc_id: Uuid,
        content: String,
        metadata: HashMap<String, String>,
        partition_id: u32,
        primary_node: NodeId,
        vectors: VectorBundle,
    ) -> Self {
        let now = Utc::now();
        let checksum = content_checksum(&content);
        Document {
            doc_id,
            content,
            metadata,
            partition_id,
            primary_node,
            vectors,
            created_at: now,
            modified_at: now,
            access_count: 0,
            checksum,
        }
    }

    /// Replace content and re-stamp checksum and modification time. The
    /// caller re-vectorizes and re-indexes.
    pub fn update_content(&mut self, content: String, vectors: VectorBundle) {
        self.checksum = content_checksum(&content);
        self.content = content;
        self.vectors = vectors;
        self.modified_at = Utc::now();
    }

    pub fn record_access(&mut self) {
        self.access_count += 1;
    }

    pub fn filename(&self) -> &str {
        self.metadata.get("filename").map(|s| s.as_str()).unwrap_or("")
    }

    pub fn file_type(&self) -> &str {
        self.metadata.get("type").map(|s| s.as_str()).unwrap_or("")
    }

    pub fn age_days(&self) -> f64 {
        let age = Utc::now().signed_duration_since(self.modified_at);
        age.num_seconds().max(0) as f64 / 86_400.0
    }
}

pub fn content_checksum(content: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(content.as_bytes());
    hasher.finalize()
}
