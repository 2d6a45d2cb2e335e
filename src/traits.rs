//! Traits for the tree's external collaborators: the key-value store that
//! persists committed state and the hash function that compresses nodes.

use crate::types::NodeHash;
use std::fmt::Debug;

/// One entry of an atomic write batch. `Some(bytes)` upserts the key,
/// `None` deletes it.
pub type WriteEntry = (Vec<u8>, Option<Vec<u8>>);

/// Ordered key-value storage backing one or more trees.
///
/// The tree persists leaf preimages, node hashes, metadata and snapshot
/// records through this trait and rehydrates them at load time with range
/// scans. Implementations must apply a write batch atomically: either every
/// entry becomes durable or none does. Entries are applied in order, so when
/// a batch touches the same key twice the later entry wins.
pub trait KeyValueStore: Send + Sync {
    /// Custom trait's error type.
    type Error: Debug + Send;

    /// Retrieves the value stored under `key`, or `None` if the key is absent.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Atomically applies a batch of upserts and deletions.
    fn batch_write(&self, entries: Vec<WriteEntry>) -> Result<(), Self::Error>;

    /// Retrieves all entries with `start <= key < end`, ordered by key.
    fn read_range(&self, start: &[u8], end: &[u8])
        -> Result<Vec<(Vec<u8>, Vec<u8>)>, Self::Error>;
}

/// Deterministic, side-effect-free hash function consumed by the tree.
///
/// The concrete construction is external to this crate. Inside a rollup node
/// this is a circuit-friendly hash; [`Blake3Hasher`] is a fast stand-in for
/// tests and tooling.
pub trait TreeHasher: Send + Sync {
    /// Hashes an arbitrary byte string into a field-sized digest. Used for
    /// leaf preimages.
    fn hash_to_field(&self, data: &[u8]) -> NodeHash;

    /// Compresses two child hashes into their parent hash.
    fn compress(&self, left: &NodeHash, right: &NodeHash) -> NodeHash;
}

/// [`TreeHasher`] implementation backed by BLAKE3.
#[derive(Clone, Copy, Debug, Default)]
pub struct Blake3Hasher;

impl TreeHasher for Blake3Hasher {
    fn hash_to_field(&self, data: &[u8]) -> NodeHash {
        *blake3::hash(data).as_bytes()
    }

    fn compress(&self, left: &NodeHash, right: &NodeHash) -> NodeHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(left);
        hasher.update(right);
        *hasher.finalize().as_bytes()
    }
}
