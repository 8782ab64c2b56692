use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::state_machine::NodeId;

pub type ShardId = u32;

fn ring_hash(key: &str) -> u64 {
    let hash = blake3::hash(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_be_bytes(bytes)
}

/// Consistent-hash ring mapping keys (terms, document ids) to shards.
///
/// Each shard contributes `virtual_nodes` points on the ring so adding or
/// removing a shard only redistributes a proportional slice of keys.
#[derive(Debug, Clone)]
pub struct HashRing {
    ring: Vec<(u64, ShardId)>,
    num_shards: u32,
    virtual_nodes: u32,
}

impl HashRing {
    pub fn new(num_shards: u32, virtual_nodes: u32) -> Self {
        let mut ring = HashRing { ring: Vec::new(), num_shards: 0, virtual_nodes };
        for shard_id in 0..num_shards {
            ring.add_shard(shard_id);
        }
        ring
    }

    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    /// Shard for a key: first vnode with hash >= hash(key), wrapping around.
    pub fn get_shard(&self, key: &str) -> ShardId {
        if self.ring.is_empty() {
            return 0;
        }

        let key_hash = ring_hash(key);
        match self.ring.binary_search_by(|(h, _)| h.cmp(&key_hash)) {
            Ok(idx) => self.ring[idx].1,
            Err(idx) if idx < self.ring.len() => self.ring[idx].1,
            Err(_) => self.ring[0].1,
        }
    }

    pub fn add_shard(&mut self, shard_id: ShardId) {
        for vnode in 0..self.virtual_nodes {
            let key = format!("shard_{}_vnode_{}", shard_id, vnode);
            self.ring.push((ring_hash(&key), shard_id));
        }
        self.ring.sort_by_key(|(h, _)| *h);
        self.num_shards += 1;
    }

    pub fn remove_shard(&mut self, shard_id: ShardId) {
        self.ring.retain(|(_, s)| *s != shard_id);
        self.num_shards = self.num_shards.saturating_sub(1);
    }

    /// vnode count per shard, for balance diagnostics.
    pub fn distribution(&self) -> HashMap<ShardId, usize> {
        let mut distribution = HashMap::new();
        for (_, shard_id) in &self.ring {
            *distribution.entry(*shard_id).or_insert(0) += 1;
        }
        distribution
    }
}

/// Which node coordinates a shard, given the current healthy node set.
///
/// Deterministic for a given node set: shards are dealt round-robin over
/// the sorted node ids.
pub fn shard_owner(shard_id: ShardId, nodes: &[NodeId]) -> Option<NodeId> {
    if nodes.is_empty() {
        return None;
    }
    let mut sorted: Vec<NodeId> = nodes.to_vec();
    sorted.sort_unstable();
    Some(sorted[shard_id as usize % sorted.len()])
}

/// Global term locator state held by a shard's coordinating node.
///
/// Tracks which nodes hold postings for each term of the shards this node
/// coordinates. Fed by `UpdateShard` reports from indexing nodes.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ShardDirectory {
    holders: BTreeMap<String, BTreeSet<NodeId>>,
}

impl ShardDirectory {
    pub fn new() -> Self {
        ShardDirectory::default()
    }

    /// Apply a term-delta report from an indexing node.
    pub fn apply_update(&mut self, node_id: NodeId, added: &[String], removed: &[String]) {
        for term in added {
            self.holders.entry(term.clone()).or_default().insert(node_id);
        }
        for term in removed {
            if let Some(nodes) = self.holders.get_mut(term) {
                nodes.remove(&node_id);
                if nodes.is_empty() {
                    self.holders.remove(term);
                }
            }
        }
    }

    /// Nodes currently holding postings for a term.
    pub fn locate(&self, term: &str) -> Vec<NodeId> {
        self.holders
            .get(term)
            .map(|nodes| nodes.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop every entry referencing a departed node.
    pub fn forget_node(&mut self, node_id: NodeId) {
        self.holders.retain(|_, nodes| {
            nodes.remove(&node_id);
            !nodes.is_empty()
        });
    }

    pub fn term_count(&self) -> usize {
        self.holders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_shard_deterministic() {
        let ring = HashRing::new(16, 150);
        let a = ring.get_shard("database");
        let b = ring.get_shard("database");
        assert_eq!(a, b);
        assert!(a < 16);
    }

    #[test]
    fn test_all_shards_receive_keys() {
        let ring = HashRing::new(4, 150);
        let mut seen = BTreeSet::new();
        for i in 0..1000 {
            seen.insert(ring.get_shard(&format!("term-{}", i)));
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_remove_shard_redistributes() {
        let mut ring = HashRing::new(4, 50);
        ring.remove_shard(2);
        assert_eq!(ring.num_shards(), 3);
        for i in 0..500 {
            assert_ne!(ring.get_shard(&format!("key-{}", i)), 2);
        }
    }

    #[test]
    fn test_distribution_has_virtual_nodes() {
        let ring = HashRing::new(3, 150);
        let distribution = ring.distribution();
        assert_eq!(distribution.len(), 3);
        for (_, count) in distribution {
            assert_eq!(count, 150);
        }
    }

    #[test]
    fn test_shard_owner_round_robin() {
        let nodes = vec![30, 10, 20];
        assert_eq!(shard_owner(0, &nodes), Some(10));
        assert_eq!(shard_owner(1, &nodes), Some(20));
        assert_eq!(shard_owner(2, &nodes), Some(30));
        assert_eq!(shard_owner(3, &nodes), Some(10));
        assert_eq!(shard_owner(0, &[]), None);
    }

    #[test]
    fn test_directory_update_and_locate() {
        let mut dir = ShardDirectory::new();
        dir.apply_update(1, &["rust".into(), "search".into()], &[]);
        dir.apply_update(2, &["rust".into()], &[]);

        assert_eq!(dir.locate("rust"), vec![1, 2]);
        assert_eq!(dir.locate("search"), vec![1]);
        assert!(dir.locate("missing").is_empty());

        dir.apply_update(1, &[], &["rust".into()]);
        assert_eq!(dir.locate("rust"), vec![2]);
    }

    #[test]
    fn test_directory_forget_node() {
        let mut dir = ShardDirectory::new();
        dir.apply_update(1, &["alpha".into()], &[]);
        dir.apply_update(2, &["alpha".into(), "beta".into()], &[]);

        dir.forget_node(2);
        assert_eq!(dir.locate("alpha"), vec![1]);
        assert!(dir.locate("beta").is_empty());
        assert_eq!(dir.term_count(), 1);
    }
}
