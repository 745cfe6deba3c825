//! Post-commit replication: partition the storage nodes among the committee
//! so each validator notifies a balanced, geographically close sub-tree.

use std::collections::HashSet;

use crate::crypto::PublicKey;
use crate::types::node::Node;
use crate::types::BitVector;

/// Numeric distance between two geo patches (3-hex-digit zones). Unknown
/// patches sort last.
pub fn patch_distance(a: &str, b: &str) -> u32 {
    match (u32::from_str_radix(a, 16), u32::from_str_radix(b, 16)) {
        (Ok(a), Ok(b)) => a.abs_diff(b),
        _ => u32::MAX,
    }
}

/// Builds the N x M assignment matrix, one row per validator, one bit per
/// storage node. Each column gets exactly one bit: the least-loaded
/// validator wins, patch distance then row index break ties, which keeps row
/// cardinalities within one of each other.
pub fn replication_tree(validators: &[Node], storage_nodes: &[Node]) -> Vec<BitVector> {
    let mut tree: Vec<BitVector> = validators
        .iter()
        .map(|_| BitVector::new(storage_nodes.len()))
        .collect();
    if validators.is_empty() {
        return tree;
    }
    let mut loads = vec![0usize; validators.len()];
    for (column, storage_node) in storage_nodes.iter().enumerate() {
        let row = (0..validators.len())
            .min_by_key(|&row| {
                (
                    loads[row],
                    patch_distance(&validators[row].geo_patch, &storage_node.geo_patch),
                    row,
                )
            })
            .unwrap_or(0);
        tree[row].set(column, true);
        loads[row] += 1;
    }
    tree
}

/// Slice of the storage set assigned to one validator's sub-tree row.
pub fn assigned_nodes(storage_nodes: &[Node], row: &BitVector) -> Vec<Node> {
    row.ones()
        .filter_map(|index| storage_nodes.get(index).cloned())
        .collect()
}

/// Write quorum over the chain storage set: two thirds, rounded up.
pub fn ack_quorum(chain_storage_count: usize) -> usize {
    (2 * chain_storage_count + 2) / 3
}

/// Tracks storage acknowledgments until the quorum threshold is met.
pub struct AckTracker {
    required: usize,
    seen: HashSet<Vec<u8>>,
}

impl AckTracker {
    pub fn new(required: usize) -> Self {
        Self {
            required,
            seen: HashSet::new(),
        }
    }

    /// Records one acknowledgment; returns true once quorum is reached.
    pub fn record(&mut self, node_public_key: &PublicKey) -> bool {
        self.seen.insert(node_public_key.to_bytes());
        self.reached()
    }

    pub fn reached(&self) -> bool {
        self.seen.len() >= self.required
    }

    pub fn received(&self) -> usize {
        self.seen.len()
    }

    pub fn required(&self) -> usize {
        self.required
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::node::test_node;

    #[test]
    fn every_column_has_exactly_one_bit() {
        let validators: Vec<Node> = (1..=3).map(|tag| test_node(tag, 0)).collect();
        let storage: Vec<Node> = (10..=17).map(|tag| test_node(tag, 0)).collect();
        let tree = replication_tree(&validators, &storage);
        for column in 0..storage.len() {
            let owners = tree.iter().filter(|row| row.get(column)).count();
            assert_eq!(owners, 1, "column {column} must have a single owner");
        }
    }

    #[test]
    fn row_cardinalities_differ_by_at_most_one() {
        let validators: Vec<Node> = (1..=3).map(|tag| test_node(tag, 0)).collect();
        let storage: Vec<Node> = (10..=20).map(|tag| test_node(tag, 0)).collect();
        let tree = replication_tree(&validators, &storage);
        let counts: Vec<usize> = tree.iter().map(|row| row.count_ones()).collect();
        let min = counts.iter().min().unwrap();
        let max = counts.iter().max().unwrap();
        assert!(max - min <= 1, "unbalanced rows: {counts:?}");
    }

    #[test]
    fn tree_is_deterministic() {
        let validators: Vec<Node> = (1..=4).map(|tag| test_node(tag, 0)).collect();
        let storage: Vec<Node> = (10..=19).map(|tag| test_node(tag, 0)).collect();
        assert_eq!(
            replication_tree(&validators, &storage),
            replication_tree(&validators, &storage)
        );
    }

    #[test]
    fn assigned_nodes_follow_the_row() {
        let validators: Vec<Node> = (1..=2).map(|tag| test_node(tag, 0)).collect();
        let storage: Vec<Node> = (10..=13).map(|tag| test_node(tag, 0)).collect();
        let tree = replication_tree(&validators, &storage);
        let total: usize = tree
            .iter()
            .map(|row| assigned_nodes(&storage, row).len())
            .sum();
        assert_eq!(total, storage.len());
    }

    #[test]
    fn quorum_is_two_thirds_rounded_up() {
        assert_eq!(ack_quorum(3), 2);
        assert_eq!(ack_quorum(4), 3);
        assert_eq!(ack_quorum(5), 4);
        assert_eq!(ack_quorum(6), 4);
        assert_eq!(ack_quorum(1), 1);
        assert_eq!(ack_quorum(0), 0);
    }

    #[test]
    fn tracker_counts_distinct_nodes_only() {
        let node = test_node(1, 0);
        let other = test_node(2, 0);
        let mut tracker = AckTracker::new(2);
        assert!(!tracker.record(&node.first_public_key));
        assert!(!tracker.record(&node.first_public_key));
        assert!(tracker.record(&other.first_public_key));
        assert_eq!(tracker.received(), 2);
    }
}
