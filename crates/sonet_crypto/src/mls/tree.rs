//! Left-balanced binary ratchet tree.
//!
//! Leaves sit at the positions of a complete binary tree filled left to
//! right; removal blanks a leaf rather than shrinking the array, so leaf
//! indices are stable for the lifetime of the group. The tree hash is a
//! recursive SHA-256 over the canonical node serialization and changes on
//! every mutation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One member of the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafNode {
    pub user_id: String,
    /// X25519 init key (base64url) Welcome secrets are sealed to.
    pub init_pub: String,
    /// Ed25519 signing key (base64url).
    pub signing_pub: String,
    /// Epoch at which this leaf was added.
    pub joined_at_epoch: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatchetTree {
    leaves: Vec<Option<LeafNode>>,
}

impl RatchetTree {
    pub fn new() -> Self {
        Self { leaves: Vec::new() }
    }

    pub fn member_count(&self) -> usize {
        self.leaves.iter().filter(|l| l.is_some()).count()
    }

    pub fn leaf(&self, index: usize) -> Option<&LeafNode> {
        self.leaves.get(index).and_then(|l| l.as_ref())
    }

    pub fn leaf_index_of(&self, user_id: &str) -> Option<usize> {
        self.leaves
            .iter()
            .position(|l| l.as_ref().is_some_and(|n| n.user_id == user_id))
    }

    pub fn members(&self) -> impl Iterator<Item = (usize, &LeafNode)> {
        self.leaves
            .iter()
            .enumerate()
            .filter_map(|(i, l)| l.as_ref().map(|n| (i, n)))
    }

    /// Insert at the leftmost free slot, extending the tree if none is
    /// blank. Returns the leaf index.
    pub fn insert(&mut self, node: LeafNode) -> usize {
        if let Some(idx) = self.leaves.iter().position(|l| l.is_none()) {
            self.leaves[idx] = Some(node);
            return idx;
        }
        self.leaves.push(Some(node));
        self.leaves.len() - 1
    }

    /// Blank the leaf at `index`. Returns the removed node.
    pub fn blank(&mut self, index: usize) -> Option<LeafNode> {
        self.leaves.get_mut(index).and_then(|l| l.take())
    }

    /// Recursive hash over the complete binary tree the leaves implicitly
    /// form (padded with blanks to the next power of two).
    pub fn tree_hash(&self) -> [u8; 32] {
        let width = self.leaves.len().next_power_of_two().max(1);
        self.hash_range(0, width)
    }

    fn hash_range(&self, start: usize, width: usize) -> [u8; 32] {
        if width == 1 {
            let mut h = Sha256::new();
            h.update([0x00]);
            h.update((start as u64).to_be_bytes());
            match self.leaves.get(start).and_then(|l| l.as_ref()) {
                Some(leaf) => {
                    h.update([0x01]);
                    h.update(leaf.user_id.as_bytes());
                    h.update([0x00]);
                    h.update(leaf.init_pub.as_bytes());
                    h.update([0x00]);
                    h.update(leaf.signing_pub.as_bytes());
                    h.update([0x00]);
                    h.update(leaf.joined_at_epoch.to_be_bytes());
                }
                None => h.update([0x00]),
            }
            return h.finalize().into();
        }
        let half = width / 2;
        let left = self.hash_range(start, half);
        let right = self.hash_range(start + half, half);
        let mut h = Sha256::new();
        h.update([0x01]);
        h.update(left);
        h.update(right);
        h.finalize().into()
    }
}
