//! This module defines constants that determine the shape of the indexed tree.

/// Number of 32-byte words in the fixed-width leaf encoding
/// (`value ‖ next_index ‖ next_value`).
pub const LEAF_ENCODED_WORDS: usize = 3;

/// Size in bytes of an encoded leaf preimage.
pub const LEAF_ENCODED_SIZE: usize = LEAF_ENCODED_WORDS * 32;

/// Maximum supported tree depth. Leaf counts are tracked as `u64`, so the
/// number of leaves at the deepest level must stay representable.
pub const MAX_TREE_DEPTH: u8 = 63;

/// Maximum number of values accepted by a single batch insertion.
///
/// One batch corresponds to one block's worth of nullifiers. The two-pass
/// insertion algorithm resolves intra-batch predecessor collisions with a
/// quadratic repair scan, so the batch size is capped at the protocol's
/// block capacity rather than left open-ended.
pub const MAX_BATCH_INSERT: usize = 128;
