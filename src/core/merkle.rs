// Merkle tree over transaction digests

use crate::core::{Hash256, hash256};

/// Node of a Merkle tree. Leaves carry the caller's digest unchanged.
#[derive(Debug, Clone)]
pub struct MerkleNode {
    pub hash: Hash256,
    pub left: Option<Box<MerkleNode>>,
    pub right: Option<Box<MerkleNode>>,
}

impl MerkleNode {
    pub fn leaf(hash: Hash256) -> Self {
        Self { hash, left: None, right: None }
    }

    /// Parent of two nodes: double-SHA256 of left ‖ right
    pub fn internal(left: MerkleNode, right: MerkleNode) -> Self {
        let mut combined = Vec::with_capacity(64);
        combined.extend_from_slice(left.hash.as_bytes());
        combined.extend_from_slice(right.hash.as_bytes());
        Self {
            hash: hash256(&combined),
            left: Some(Box::new(left)),
            right: Some(Box::new(right)),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

/// Binary hash tree built bottom-up
#[derive(Debug, Clone)]
pub struct MerkleTree {
    pub root: MerkleNode,
}

impl MerkleTree {
    /// Build a tree over `leaves` in the given order.
    /// An odd level pairs its last node with itself. Returns `None` for no leaves.
    pub fn new(leaves: &[Hash256]) -> Option<Self> {
        let mut level: Vec<MerkleNode> = leaves.iter().copied().map(MerkleNode::leaf).collect();
        if level.is_empty() {
            return None;
        }

        while level.len() > 1 {
            let mut next_level = Vec::with_capacity(level.len().div_ceil(2));
            let mut nodes = level.into_iter();

            while let Some(left) = nodes.next() {
                let right = match nodes.next() {
                    Some(right) => right,
                    None => left.clone(),
                };
                next_level.push(MerkleNode::internal(left, right));
            }

            level = next_level;
        }

        level.pop().map(|root| Self { root })
    }

    pub fn root_hash(&self) -> Hash256 {
        self.root.hash
    }
}

/// Root digest over `leaves`, or `None` when there are none
pub fn merkle_root(leaves: &[Hash256]) -> Option<Hash256> {
    MerkleTree::new(leaves).map(|tree| tree.root_hash())
}
