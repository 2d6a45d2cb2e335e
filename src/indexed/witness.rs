//! This module implements [`LowLeafWitness`].

use crate::tree::SiblingPath;
use crate::types::{IndexedLeaf, LeafIndex};
use serde::{Deserialize, Serialize};

/// Non-membership witness anchored at a low leaf.
///
/// Proves that `preimage` is present at `index` and, by the sortedness of
/// the leaf list, that no value strictly between `preimage.value` and
/// `preimage.next_value` exists in the tree. The batch-insertion circuit
/// consumes one of these per inserted value as its non-membership hint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowLeafWitness {
    /// Preimage of the low leaf.
    pub preimage: IndexedLeaf,
    /// Index of the low leaf.
    pub index: LeafIndex,
    /// Membership proof of the low leaf against the tree state it was
    /// captured from.
    pub sibling_path: SiblingPath,
}

impl LowLeafWitness {
    /// The placeholder witness emitted for batch entries whose predecessor
    /// was already updated earlier in the same batch: a zero leaf at index 0
    /// with an all-zero sibling path.
    pub fn zero(depth: u8) -> Self {
        Self {
            preimage: IndexedLeaf::sentinel(),
            index: 0,
            sibling_path: SiblingPath::zero(depth),
        }
    }
}
