//! This module implements [`SiblingPath`].

use crate::traits::TreeHasher;
use crate::types::{LeafIndex, NodeHash};
use derive_more::Deref;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered sequence of sibling hashes from a leaf up to the root.
///
/// The first entry is the sibling of the leaf itself and the last entry sits
/// directly below the root, so the length always equals the tree depth. A
/// sibling path proves membership of a leaf hash at an index; paired with an
/// [`IndexedLeaf`](crate::IndexedLeaf) preimage it proves non-membership of
/// every value strictly between the leaf's value and its successor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deref, Serialize, Deserialize)]
pub struct SiblingPath {
    #[deref]
    nodes: Vec<NodeHash>,
}

impl SiblingPath {
    /// Wraps a leaf-to-root ordered list of sibling hashes.
    pub fn new(nodes: Vec<NodeHash>) -> Self {
        Self { nodes }
    }

    /// The all-zero placeholder path of the given depth, used in empty
    /// batch-insertion witnesses.
    pub fn zero(depth: u8) -> Self {
        Self {
            nodes: vec![[0u8; 32]; depth as usize],
        }
    }

    /// Recomputes the root obtained by placing `leaf_hash` at `index` and
    /// folding in each sibling on the correct side.
    pub fn root_from_leaf<H: TreeHasher>(
        &self,
        hasher: &H,
        leaf_hash: NodeHash,
        index: LeafIndex,
    ) -> NodeHash {
        let mut hash = leaf_hash;
        let mut index = index;
        for sibling in &self.nodes {
            hash = if index & 1 == 0 {
                hasher.compress(&hash, sibling)
            } else {
                hasher.compress(sibling, &hash)
            };
            index >>= 1;
        }
        hash
    }
}

impl fmt::Display for SiblingPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SiblingPath({} levels) [", self.nodes.len())?;
        for node in &self.nodes {
            writeln!(f, "  {}", hex::encode(node))?;
        }
        write!(f, "]")
    }
}
