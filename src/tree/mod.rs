//! Append-only binary Merkle tree over a key-value store.
//!
//! [`AppendOnlyTree`] keeps committed node hashes in memory, writes them
//! through to the storage backend on commit, and buffers every mutation in an
//! explicit pending transaction until then. Reads can target either the
//! committed state or the uncommitted view; the committed view is never
//! affected by buffered mutations.
//!
//! The tree is a fixed-depth primitive: it knows nothing about the sorted
//! linked list layered on top of it by [`IndexedTree`](crate::IndexedTree).

pub mod path;

pub use path::SiblingPath;

use crate::constant::MAX_TREE_DEPTH;
use crate::snapshot::TreeUpdates;
use crate::traits::{KeyValueStore, TreeHasher, WriteEntry};
use crate::types::{
    encode_record, meta_key, node_key, LeafIndex, NodeHash, NodeKey, TreeError, TreeMeta,
};
use std::collections::{BTreeMap, HashMap};

/// Buffered mutations that have not been committed yet.
#[derive(Debug)]
struct TreeTransaction {
    /// Node hashes recomputed by buffered appends and updates.
    nodes: HashMap<NodeKey, NodeHash>,
    /// Leaf count including buffered appends.
    size: u64,
    /// Root over the buffered state.
    root: NodeHash,
}

/// Fixed-depth append-only binary Merkle tree.
///
/// The root sits at level 0 and leaves at level `depth`. Empty positions take
/// per-level zero hashes derived from the empty-leaf hash supplied at
/// construction, so the root of a sparsely filled tree is well defined
/// without materializing empty subtrees.
#[derive(Debug)]
pub struct AppendOnlyTree<'a, S, H> {
    /// Storage backend committed state is written through to.
    store: &'a S,
    /// Hash function used for node compression.
    hasher: &'a H,
    /// Name prefixing every persisted key of this tree.
    name: String,
    /// Distance between the root and the leaf level.
    depth: u8,
    /// `zeroes[i]` is the hash of an empty subtree whose leaves sit `i`
    /// levels below its top, so `zeroes[0]` is the empty-leaf hash and
    /// `zeroes[depth]` the root of a fully empty tree.
    zeroes: Vec<NodeHash>,
    /// Committed node hashes. Sparse: positions not present are empty.
    nodes: BTreeMap<NodeKey, NodeHash>,
    /// Committed leaf count.
    size: u64,
    /// Committed root.
    root: NodeHash,
    /// Open transaction, if any mutation has been buffered.
    tx: Option<TreeTransaction>,
}

impl<'a, S, H> AppendOnlyTree<'a, S, H>
where
    S: KeyValueStore,
    H: TreeHasher,
{
    /// Creates an empty tree of the given depth.
    ///
    /// Nothing is persisted until the first [`commit`](Self::commit).
    pub fn new(
        store: &'a S,
        hasher: &'a H,
        name: &str,
        depth: u8,
        empty_leaf_hash: NodeHash,
    ) -> Result<Self, TreeError<S::Error>> {
        if depth == 0 || depth > MAX_TREE_DEPTH {
            return Err(TreeError::InvalidDepth {
                depth,
                max: MAX_TREE_DEPTH,
            });
        }
        let zeroes = Self::compute_zeroes(hasher, depth, empty_leaf_hash);
        let root = zeroes[depth as usize];
        Ok(Self {
            store,
            hasher,
            name: name.to_string(),
            depth,
            zeroes,
            nodes: BTreeMap::new(),
            size: 0,
            root,
            tx: None,
        })
    }

    /// Reassembles a tree from persisted metadata and node hashes.
    pub(crate) fn load(
        store: &'a S,
        hasher: &'a H,
        name: &str,
        meta: TreeMeta,
        nodes: BTreeMap<NodeKey, NodeHash>,
        empty_leaf_hash: NodeHash,
    ) -> Result<Self, TreeError<S::Error>> {
        if meta.depth == 0 || meta.depth > MAX_TREE_DEPTH {
            return Err(TreeError::InvalidDepth {
                depth: meta.depth,
                max: MAX_TREE_DEPTH,
            });
        }
        let zeroes = Self::compute_zeroes(hasher, meta.depth, empty_leaf_hash);
        Ok(Self {
            store,
            hasher,
            name: name.to_string(),
            depth: meta.depth,
            zeroes,
            nodes,
            size: meta.size,
            root: meta.root,
            tx: None,
        })
    }

    fn compute_zeroes(hasher: &H, depth: u8, empty_leaf_hash: NodeHash) -> Vec<NodeHash> {
        let mut zeroes = Vec::with_capacity(depth as usize + 1);
        zeroes.push(empty_leaf_hash);
        for i in 1..=depth as usize {
            let below = zeroes[i - 1];
            zeroes.push(hasher.compress(&below, &below));
        }
        zeroes
    }

    /// Depth of the tree.
    #[inline]
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Total number of leaf positions.
    #[inline]
    pub fn capacity(&self) -> u64 {
        1u64 << self.depth
    }

    /// Returns true if mutations are buffered and not yet committed.
    #[inline]
    pub fn has_pending(&self) -> bool {
        self.tx.is_some()
    }

    /// Current root. With `include_uncommitted` the buffered state is
    /// reflected; without it the last committed root is returned regardless
    /// of pending mutations.
    pub fn get_root(&self, include_uncommitted: bool) -> NodeHash {
        match (include_uncommitted, &self.tx) {
            (true, Some(tx)) => tx.root,
            _ => self.root,
        }
    }

    /// Number of appended leaves in the selected view.
    pub fn get_num_leaves(&self, include_uncommitted: bool) -> u64 {
        match (include_uncommitted, &self.tx) {
            (true, Some(tx)) => tx.size,
            _ => self.size,
        }
    }

    /// Hash of the node at `level` (0 is the root) and `index` within the
    /// level. Empty positions resolve to the per-level zero hash.
    pub fn get_node(
        &self,
        level: u8,
        index: u64,
        include_uncommitted: bool,
    ) -> Result<NodeHash, TreeError<S::Error>> {
        if level > self.depth {
            return Err(TreeError::InvalidLevel {
                level,
                depth: self.depth,
            });
        }
        let limit = 1u64 << level;
        if index >= limit {
            return Err(TreeError::IndexOutOfBounds { index, limit });
        }
        let tx = if include_uncommitted {
            self.tx.as_ref()
        } else {
            None
        };
        Ok(self.node_hash(tx, NodeKey::new(level, index)))
    }

    /// Sibling hashes of the leaf at `index`, ordered leaf to root. The
    /// index may point past the current size; the path then describes the
    /// empty position, which is how a pending insertion proves where it will
    /// land.
    pub fn get_sibling_path(
        &self,
        index: LeafIndex,
        include_uncommitted: bool,
    ) -> Result<SiblingPath, TreeError<S::Error>> {
        if index >= self.capacity() {
            return Err(TreeError::IndexOutOfBounds {
                index,
                limit: self.capacity(),
            });
        }
        let tx = if include_uncommitted {
            self.tx.as_ref()
        } else {
            None
        };
        let mut nodes = Vec::with_capacity(self.depth as usize);
        let mut key = NodeKey::new(self.depth, index);
        while key.level > 0 {
            nodes.push(self.node_hash(tx, key.sibling()));
            key = key.parent();
        }
        Ok(SiblingPath::new(nodes))
    }

    /// Appends leaf hashes at the next free indices, buffering the node
    /// updates until commit.
    pub fn append_leaves(&mut self, hashes: &[NodeHash]) -> Result<(), TreeError<S::Error>> {
        let size = self.get_num_leaves(true);
        if size + hashes.len() as u64 > self.capacity() {
            return Err(TreeError::TreeFull {
                capacity: self.capacity(),
            });
        }
        for (i, hash) in hashes.iter().enumerate() {
            self.write_leaf(*hash, size + i as u64);
        }
        if let Some(tx) = &mut self.tx {
            tx.size = size + hashes.len() as u64;
        }
        Ok(())
    }

    /// Overwrites the leaf hash at an existing index, buffering the node
    /// updates until commit.
    pub fn update_leaf(
        &mut self,
        hash: NodeHash,
        index: LeafIndex,
    ) -> Result<(), TreeError<S::Error>> {
        let size = self.get_num_leaves(true);
        if index >= size {
            return Err(TreeError::IndexOutOfBounds { index, limit: size });
        }
        self.write_leaf(hash, index);
        Ok(())
    }

    /// Persists the buffered mutations and merges them into the committed
    /// state, returning the applied diff.
    pub fn commit(&mut self) -> Result<TreeUpdates, TreeError<S::Error>> {
        let mut delta = TreeUpdates::default();
        let mut entries = Vec::new();
        self.stage_commit(&mut delta, &mut entries)?;
        self.store
            .batch_write(entries)
            .map_err(TreeError::Store)?;
        self.apply_commit();
        Ok(delta)
    }

    /// Discards the buffered mutations.
    pub fn rollback(&mut self) {
        self.tx = None;
    }

    /// Collects the store writes and the `(old, new)` diff the open
    /// transaction would apply, without mutating anything. Used by the
    /// indexed layer to bundle node, leaf and metadata writes into one
    /// atomic batch.
    pub(crate) fn stage_commit(
        &self,
        delta: &mut TreeUpdates,
        entries: &mut Vec<WriteEntry>,
    ) -> Result<(), TreeError<S::Error>> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        let mut staged: Vec<(&NodeKey, &NodeHash)> = tx.nodes.iter().collect();
        staged.sort_unstable_by_key(|(key, _)| **key);
        for (key, hash) in staged {
            let old = self.nodes.get(key).copied();
            if old == Some(*hash) {
                continue;
            }
            entries.push((node_key(&self.name, *key), Some(hash.to_vec())));
            delta.nodes.add(*key, old, Some(*hash));
        }
        let old_meta = TreeMeta {
            depth: self.depth,
            size: self.size,
            root: self.root,
        };
        let new_meta = TreeMeta {
            depth: self.depth,
            size: tx.size,
            root: tx.root,
        };
        if old_meta != new_meta {
            entries.push((
                meta_key(&self.name),
                Some(encode_record(&new_meta, "tree metadata")?),
            ));
            delta.set_meta(old_meta, new_meta);
        }
        Ok(())
    }

    /// Merges the open transaction into the committed state. Must only be
    /// called after the corresponding staged writes were durably applied.
    pub(crate) fn apply_commit(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.nodes.extend(tx.nodes);
            self.size = tx.size;
            self.root = tx.root;
        }
    }

    /// Rewrites committed nodes and metadata from the `new` side of an
    /// (already inverted) diff. The caller is responsible for persisting the
    /// matching store writes; this only adjusts the in-memory state.
    pub(crate) fn apply_restore(&mut self, updates: &TreeUpdates) {
        debug_assert!(self.tx.is_none(), "restore requires a committed tree");
        for (key, (_, new)) in &updates.nodes.data {
            match new {
                Some(hash) => {
                    self.nodes.insert(*key, *hash);
                }
                None => {
                    self.nodes.remove(key);
                }
            }
        }
        if let Some((_, meta)) = &updates.meta {
            self.size = meta.size;
            self.root = meta.root;
        }
    }

    /// Places `hash` at leaf `index` and recomputes the path to the root
    /// inside the open transaction.
    fn write_leaf(&mut self, hash: NodeHash, index: LeafIndex) {
        let mut tx = self.tx.take().unwrap_or_else(|| TreeTransaction {
            nodes: HashMap::new(),
            size: self.size,
            root: self.root,
        });
        let mut key = NodeKey::new(self.depth, index);
        let mut hash = hash;
        tx.nodes.insert(key, hash);
        while key.level > 0 {
            let sibling = self.node_hash(Some(&tx), key.sibling());
            hash = if key.index & 1 == 0 {
                self.hasher.compress(&hash, &sibling)
            } else {
                self.hasher.compress(&sibling, &hash)
            };
            key = key.parent();
            tx.nodes.insert(key, hash);
        }
        tx.root = hash;
        self.tx = Some(tx);
    }

    /// Resolves a node hash from the transaction overlay, the committed
    /// state, or the per-level zero hash.
    fn node_hash(&self, tx: Option<&TreeTransaction>, key: NodeKey) -> NodeHash {
        if let Some(tx) = tx {
            if let Some(hash) = tx.nodes.get(&key) {
                return *hash;
            }
        }
        self.nodes
            .get(&key)
            .copied()
            .unwrap_or_else(|| self.zeroes[(self.depth - key.level) as usize])
    }
}
