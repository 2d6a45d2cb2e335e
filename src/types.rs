//! Core data types for the indexed Merkle tree.
//!
//! This module defines the fundamental types used throughout the crate:
//! - [`IndexedLeaf`]: one node of the sorted linked list layered over the tree
//! - [`NodeKey`]: addressing for internal tree nodes
//! - [`TreeMeta`]: the persisted per-tree metadata record
//! - [`TreeError`] / [`CodecError`]: the crate's error taxonomy
//! - Key-building helpers for the persisted key space

use crate::constant::LEAF_ENCODED_SIZE;
use crate::traits::TreeHasher;
use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use thiserror::Error;

/// 32-byte hash of a tree node or leaf preimage.
pub type NodeHash = [u8; 32];

/// Index of a leaf within the append-only tree.
pub type LeafIndex = u64;

/// Block number used to key snapshots.
pub type BlockNumber = u64;

/// Error raised when decoding a persisted leaf preimage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The byte slice does not have the fixed leaf width.
    #[error("encoded leaf must be exactly {LEAF_ENCODED_SIZE} bytes, got {got}")]
    InvalidLength {
        /// Actual length of the rejected slice.
        got: usize,
    },

    /// The `next_index` word does not fit in 64 bits.
    #[error("leaf next_index does not fit in 64 bits")]
    IndexOverflow,
}

/// Unified error type for tree operations.
///
/// Generic over the storage backend's error type so that backend failures
/// propagate unmodified to the caller. The tree itself never retries.
#[derive(Error, Debug)]
pub enum TreeError<E: Debug> {
    /// A leaf expected to exist could not be found. Inside a batch operation
    /// this is fatal: the caller must discard the transaction via `rollback`.
    #[error("no leaf at index {index}")]
    LeafNotFound {
        /// Index of the missing leaf.
        index: LeafIndex,
    },

    /// A leaf index is outside the addressable range.
    #[error("leaf index {index} out of bounds (limit {limit})")]
    IndexOutOfBounds {
        /// The rejected index.
        index: LeafIndex,
        /// First index past the valid range.
        limit: u64,
    },

    /// The tree cannot accept further appends.
    #[error("tree is full (capacity {capacity})")]
    TreeFull {
        /// Total leaf capacity of the tree.
        capacity: u64,
    },

    /// Requested tree depth is outside the supported range.
    #[error("invalid tree depth {depth}, supported range is 1..={max}")]
    InvalidDepth {
        /// The rejected depth.
        depth: u8,
        /// Largest supported depth.
        max: u8,
    },

    /// A node lookup addressed a level below the leaf level.
    #[error("node level {level} exceeds tree depth {depth}")]
    InvalidLevel {
        /// The rejected level.
        level: u8,
        /// Depth of the tree.
        depth: u8,
    },

    /// `from_name` found no persisted metadata for the tree.
    #[error("tree `{name}` has no persisted metadata")]
    MissingMetadata {
        /// Name of the tree that was looked up.
        name: String,
    },

    /// No snapshot is recorded for the requested block, either because none
    /// was ever taken or because a later restore pruned it. State before this
    /// block is unavailable; this does not indicate corruption.
    #[error("no snapshot recorded for block {block}")]
    SnapshotNotFound {
        /// The requested block number.
        block: BlockNumber,
    },

    /// Snapshots must be taken with strictly increasing block numbers.
    #[error("snapshot block {block} is not above the latest snapshot block {latest}")]
    NonMonotonicSnapshot {
        /// The rejected block number.
        block: BlockNumber,
        /// Latest recorded snapshot block.
        latest: BlockNumber,
    },

    /// A batch exceeded the supported size.
    #[error("batch of {got} values exceeds the supported size {max}")]
    BatchTooLarge {
        /// Number of values in the rejected batch.
        got: usize,
        /// Largest accepted batch size.
        max: usize,
    },

    /// The same non-zero value appeared twice in one batch.
    #[error("duplicate value {value} in batch")]
    DuplicateBatchValue {
        /// The duplicated value.
        value: U256,
    },

    /// A batch value shares its predecessor with an earlier batch member
    /// but does not extend the staged chain upward, so linking it would
    /// require touching a leaf whose witness was already captured.
    #[error("batch value {value} cannot be linked without invalidating an earlier witness")]
    UnlinkedBatchValue {
        /// The value that could not be threaded into the batch.
        value: U256,
    },

    /// A batch value is already present in the tree, so a non-membership
    /// witness for it cannot exist.
    #[error("value {value} is already present in the tree")]
    AlreadyPresent {
        /// The offending value.
        value: U256,
    },

    /// Snapshot and restore require a committed tree.
    #[error("operation requires a committed tree but uncommitted writes are pending")]
    UncommittedWrites,

    /// A persisted leaf preimage failed to decode.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A persisted record failed to serialize.
    #[error("failed to serialize {what} for persistence")]
    Serialize {
        /// Human-readable name of the record kind.
        what: &'static str,
    },

    /// A persisted record failed to decode.
    #[error("failed to decode persisted {what}")]
    Deserialize {
        /// Human-readable name of the record kind.
        what: &'static str,
    },

    /// A storage backend failure, propagated unmodified.
    #[error("storage backend error: {0:?}")]
    Store(E),
}

/// Addresses one node of the append-only tree. The root sits at level 0 and
/// leaves at level `depth`; within a level, nodes are numbered left to right.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeKey {
    /// Distance from the root.
    pub level: u8,
    /// Position within the level.
    pub index: u64,
}

impl NodeKey {
    /// Creates a node key from a level and an in-level position.
    #[inline]
    pub const fn new(level: u8, index: u64) -> Self {
        Self { level, index }
    }

    /// Key of the sibling node at the same level.
    #[inline]
    pub const fn sibling(&self) -> Self {
        Self {
            level: self.level,
            index: self.index ^ 1,
        }
    }

    /// Key of the parent node one level up.
    #[inline]
    pub const fn parent(&self) -> Self {
        Self {
            level: self.level - 1,
            index: self.index >> 1,
        }
    }
}

/// Persisted per-tree metadata, written on every commit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMeta {
    /// Depth of the tree. Immutable after creation.
    pub depth: u8,
    /// Number of appended leaves.
    pub size: u64,
    /// Root hash over all leaves.
    pub root: NodeHash,
}

/// One node of the sorted singly-linked list layered over the append-only
/// tree, ordered by ascending `value`.
///
/// `next_index == 0 && next_value == 0` marks the current tail of the list.
/// Leaf 0 is a reserved sentinel `{0, 0, 0}` created at tree initialization
/// and never removed; it anchors the list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedLeaf {
    /// The value held by this leaf.
    pub value: U256,
    /// Index of the leaf holding the next larger value.
    pub next_index: LeafIndex,
    /// The next larger value in the tree.
    pub next_value: U256,
}

impl IndexedLeaf {
    /// The sentinel leaf seeded at index 0.
    #[inline]
    pub const fn sentinel() -> Self {
        Self {
            value: U256::ZERO,
            next_index: 0,
            next_value: U256::ZERO,
        }
    }

    /// Returns true if this leaf currently terminates the list.
    #[inline]
    pub fn is_tail(&self) -> bool {
        self.next_index == 0 && self.next_value.is_zero()
    }

    /// Encodes the leaf as three fixed-width big-endian integers
    /// concatenated (`value ‖ next_index ‖ next_value`).
    pub fn encode(&self) -> [u8; LEAF_ENCODED_SIZE] {
        let mut out = [0u8; LEAF_ENCODED_SIZE];
        out[0..32].copy_from_slice(&self.value.to_be_bytes::<32>());
        out[56..64].copy_from_slice(&self.next_index.to_be_bytes());
        out[64..96].copy_from_slice(&self.next_value.to_be_bytes::<32>());
        out
    }

    /// Decodes a leaf from its fixed-width encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != LEAF_ENCODED_SIZE {
            return Err(CodecError::InvalidLength { got: bytes.len() });
        }
        if bytes[32..56].iter().any(|&b| b != 0) {
            return Err(CodecError::IndexOverflow);
        }
        let mut index_bytes = [0u8; 8];
        index_bytes.copy_from_slice(&bytes[56..64]);
        Ok(Self {
            value: U256::from_be_slice(&bytes[0..32]),
            next_index: u64::from_be_bytes(index_bytes),
            next_value: U256::from_be_slice(&bytes[64..96]),
        })
    }

    /// Hash of the encoded leaf, as stored in the append-only tree.
    #[inline]
    pub fn hash<H: TreeHasher>(&self, hasher: &H) -> NodeHash {
        hasher.hash_to_field(&self.encode())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Persisted key space
//
// All records of one tree share the `<name>:` prefix so that several trees
// (and unrelated data) can coexist in the same storage backend. Numeric key
// components are big-endian so that lexicographic key order matches numeric
// order for range scans.
// ═══════════════════════════════════════════════════════════════════════

/// Storage key of the leaf preimage at `index`.
pub fn leaf_key(name: &str, index: LeafIndex) -> Vec<u8> {
    let mut key = format!("{name}:leaf:").into_bytes();
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// Storage key of a tree node hash.
pub fn node_key(name: &str, node: NodeKey) -> Vec<u8> {
    let mut key = format!("{name}:node:").into_bytes();
    key.push(node.level);
    key.extend_from_slice(&node.index.to_be_bytes());
    key
}

/// Storage key of the tree metadata record.
pub fn meta_key(name: &str) -> Vec<u8> {
    format!("{name}:meta").into_bytes()
}

/// Storage key of the snapshot record for `block`.
pub fn snapshot_key(name: &str, block: BlockNumber) -> Vec<u8> {
    let mut key = format!("{name}:snapshot:").into_bytes();
    key.extend_from_slice(&block.to_be_bytes());
    key
}

/// Storage key of the accumulated diff since the latest snapshot.
pub fn delta_key(name: &str) -> Vec<u8> {
    format!("{name}:delta").into_bytes()
}

/// Half-open key range covering every key starting with `prefix`.
pub fn prefix_range(prefix: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut end = prefix.to_vec();
    // The prefixes used here are ASCII, so the last byte never wraps.
    *end.last_mut().expect("prefix must not be empty") += 1;
    (prefix.to_vec(), end)
}

/// Extracts the trailing big-endian `u64` from a storage key.
pub(crate) fn trailing_index(key: &[u8]) -> Option<u64> {
    if key.len() < 8 {
        return None;
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&key[key.len() - 8..]);
    Some(u64::from_be_bytes(bytes))
}

/// Serializes a record for persistence into the key-value store.
pub(crate) fn encode_record<T: Serialize, E: Debug>(
    value: &T,
    what: &'static str,
) -> Result<Vec<u8>, TreeError<E>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|_| TreeError::Serialize { what })
}

/// Decodes a record persisted by [`encode_record`].
pub(crate) fn decode_record<T: serde::de::DeserializeOwned, E: Debug>(
    bytes: &[u8],
    what: &'static str,
) -> Result<T, TreeError<E>> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|_| TreeError::Deserialize { what })
}
