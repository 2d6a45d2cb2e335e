#![doc = include_str!("../README.md")]

pub mod constant;
pub mod indexed;
pub mod mem_store;
pub mod snapshot;
pub mod traits;
pub mod tree;
pub mod types;

pub use indexed::{IndexedTree, LowLeafWitness, PredecessorInfo};
pub use mem_store::MemStore;
pub use snapshot::{TreeSnapshot, TreeUpdates};
pub use traits::{Blake3Hasher, KeyValueStore, TreeHasher};
pub use tree::{AppendOnlyTree, SiblingPath};
pub use types::{CodecError, IndexedLeaf, NodeHash, NodeKey, TreeError, TreeMeta};

// Re-exported so consumers can name leaf values without depending on
// alloy-primitives directly.
pub use alloy_primitives::U256;
