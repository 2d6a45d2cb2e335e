//! Indexed Merkle tree: a sorted singly-linked list of leaves layered over
//! an append-only Merkle tree.
//!
//! Each leaf carries, besides its value, a pointer to the leaf holding the
//! next larger value. Membership of a value is proven with an ordinary
//! Merkle path; non-membership of a value `v` is proven with the path of the
//! "low leaf", the leaf whose value is the largest not exceeding `v`: its
//! preimage shows that the next value in the tree already jumps past `v`.
//! Rollup nodes use this to enforce nullifier uniqueness.
//!
//! # Transactions
//!
//! Every mutation lands in an explicit open transaction (an uncommitted leaf
//! overlay plus the underlying tree's buffered nodes). `commit` flushes the
//! whole transaction to the storage backend as one atomic batch and merges
//! it into the committed state; `rollback` discards it. Only one transaction
//! is ever open, and reads can target either view.
//!
//! # Versioning
//!
//! Committed changes accumulate into a diff that `snapshot` seals per block
//! number. `restore` walks the sealed diffs backwards to roll the live tree
//! to an earlier block, pruning every snapshot above it. See
//! [`crate::snapshot`].

pub mod witness;

pub use witness::LowLeafWitness;

use crate::constant::MAX_BATCH_INSERT;
use crate::snapshot::{Snapshots, TreeSnapshot, TreeUpdates};
use crate::traits::{KeyValueStore, TreeHasher, WriteEntry};
use crate::tree::{AppendOnlyTree, SiblingPath};
use crate::types::{
    decode_record, delta_key, encode_record, leaf_key, meta_key, node_key, prefix_range,
    snapshot_key, trailing_index, BlockNumber, IndexedLeaf, LeafIndex, NodeHash, NodeKey,
    TreeError, TreeMeta,
};
use alloy_primitives::U256;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, trace};

/// Result of a predecessor search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PredecessorInfo {
    /// Index of the leaf with the largest value not exceeding the target,
    /// or of the exact match when `already_present` is set.
    pub index: LeafIndex,
    /// True if a leaf holds exactly the searched value.
    pub already_present: bool,
}

/// Uncommitted leaf mutations of the open transaction.
#[derive(Debug, Default)]
struct LeafTransaction {
    /// Staged leaf preimages by index: updated low leaves and appended
    /// leaves alike.
    cache: HashMap<LeafIndex, IndexedLeaf>,
    /// Ordered index over staged values, overlaying the committed one.
    sorted: BTreeMap<U256, LeafIndex>,
}

impl LeafTransaction {
    fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn clear(&mut self) {
        self.cache.clear();
        self.sorted.clear();
    }
}

/// Indexed Merkle tree over a key-value store.
///
/// Single-writer, cooperative: mutating calls take `&mut self` and must not
/// interleave; callers serialize access. Read-only calls may run concurrently
/// with each other but not with a mutation.
#[derive(Debug)]
pub struct IndexedTree<'a, S, H> {
    /// Storage backend shared with the underlying tree.
    store: &'a S,
    /// Hash function collaborator.
    hasher: &'a H,
    /// Name prefixing every persisted key of this tree.
    name: String,
    /// The append-only tree holding leaf hashes.
    tree: AppendOnlyTree<'a, S, H>,
    /// Committed leaf preimages, dense by index.
    leaves: Vec<IndexedLeaf>,
    /// Ordered index over committed values. Zero-valued padding leaves are
    /// not list members and stay out of it; only the sentinel maps value 0.
    sorted: BTreeMap<U256, LeafIndex>,
    /// The open transaction.
    tx: LeafTransaction,
    /// Snapshot index and the unsealed committed diff.
    snapshots: Snapshots,
}

impl<'a, S, H> IndexedTree<'a, S, H>
where
    S: KeyValueStore,
    H: TreeHasher,
{
    /// Creates a fresh tree seeded with the sentinel leaf at index 0 and
    /// commits immediately.
    pub fn new(
        store: &'a S,
        hasher: &'a H,
        name: &str,
        depth: u8,
    ) -> Result<Self, TreeError<S::Error>> {
        let sentinel = IndexedLeaf::sentinel();
        let sentinel_hash = sentinel.hash(hasher);
        let tree = AppendOnlyTree::new(store, hasher, name, depth, sentinel_hash)?;
        let mut this = Self {
            store,
            hasher,
            name: name.to_string(),
            tree,
            leaves: Vec::new(),
            sorted: BTreeMap::new(),
            tx: LeafTransaction::default(),
            snapshots: Snapshots::default(),
        };
        this.tx.cache.insert(0, sentinel);
        this.tx.sorted.insert(U256::ZERO, 0);
        this.tree.append_leaves(&[sentinel_hash])?;
        this.commit()?;
        Ok(this)
    }

    /// Reloads an existing tree's committed state from the store: metadata,
    /// leaf preimages, node hashes, sealed snapshots and the unsealed diff.
    pub fn from_name(
        store: &'a S,
        hasher: &'a H,
        name: &str,
    ) -> Result<Self, TreeError<S::Error>> {
        let meta_bytes = store
            .get(&meta_key(name))
            .map_err(TreeError::Store)?
            .ok_or_else(|| TreeError::MissingMetadata {
                name: name.to_string(),
            })?;
        let meta: TreeMeta = decode_record(&meta_bytes, "tree metadata")?;

        let (start, end) = prefix_range(format!("{name}:node:").as_bytes());
        let mut nodes = BTreeMap::new();
        for (key, value) in store.read_range(&start, &end).map_err(TreeError::Store)? {
            let index = trailing_index(&key).ok_or(TreeError::Deserialize { what: "node key" })?;
            let level = key[key.len() - 9];
            let hash: NodeHash = value
                .try_into()
                .map_err(|_| TreeError::Deserialize { what: "node hash" })?;
            nodes.insert(NodeKey::new(level, index), hash);
        }

        let (start, end) = prefix_range(format!("{name}:leaf:").as_bytes());
        let mut leaves = Vec::with_capacity(meta.size as usize);
        for (key, value) in store.read_range(&start, &end).map_err(TreeError::Store)? {
            let index =
                trailing_index(&key).ok_or(TreeError::Deserialize { what: "leaf key" })?;
            if index != leaves.len() as u64 {
                return Err(TreeError::Deserialize {
                    what: "leaf preimage collection",
                });
            }
            leaves.push(IndexedLeaf::decode(&value)?);
        }
        if leaves.len() as u64 != meta.size {
            return Err(TreeError::Deserialize {
                what: "leaf preimage collection",
            });
        }

        let (start, end) = prefix_range(format!("{name}:snapshot:").as_bytes());
        let mut sealed = BTreeMap::new();
        for (_, value) in store.read_range(&start, &end).map_err(TreeError::Store)? {
            let snapshot: TreeSnapshot = decode_record(&value, "snapshot record")?;
            sealed.insert(snapshot.block, snapshot);
        }
        let pending = match store.get(&delta_key(name)).map_err(TreeError::Store)? {
            Some(bytes) => decode_record(&bytes, "tree delta")?,
            None => TreeUpdates::default(),
        };

        let sentinel_hash = IndexedLeaf::sentinel().hash(hasher);
        let tree = AppendOnlyTree::load(store, hasher, name, meta, nodes, sentinel_hash)?;
        let mut this = Self {
            store,
            hasher,
            name: name.to_string(),
            tree,
            leaves,
            sorted: BTreeMap::new(),
            tx: LeafTransaction::default(),
            snapshots: Snapshots::load(sealed, pending),
        };
        this.rebuild_sorted();
        Ok(this)
    }

    /// Name of this tree in the storage key space.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying append-only tree, for node-level inspection.
    pub fn tree(&self) -> &AppendOnlyTree<'a, S, H> {
        &self.tree
    }

    /// Current root of the selected view.
    pub fn get_root(&self, include_uncommitted: bool) -> NodeHash {
        self.tree.get_root(include_uncommitted)
    }

    /// Number of leaves in the selected view, zero-valued padding included.
    pub fn get_num_leaves(&self, include_uncommitted: bool) -> u64 {
        self.tree.get_num_leaves(include_uncommitted)
    }

    /// Sibling path of the leaf at `index` in the selected view.
    pub fn get_sibling_path(
        &self,
        index: LeafIndex,
        include_uncommitted: bool,
    ) -> Result<SiblingPath, TreeError<S::Error>> {
        self.tree.get_sibling_path(index, include_uncommitted)
    }

    /// Copy of the leaf preimage at `index`, or `None` if no leaf exists
    /// there in the selected view.
    pub fn get_leaf(&self, index: LeafIndex, include_uncommitted: bool) -> Option<IndexedLeaf> {
        if include_uncommitted {
            if let Some(leaf) = self.tx.cache.get(&index) {
                return Some(*leaf);
            }
        }
        self.leaves.get(index as usize).copied()
    }

    /// Index of the leaf holding exactly `value`, if present.
    pub fn find_leaf_index(&self, value: U256, include_uncommitted: bool) -> Option<LeafIndex> {
        if include_uncommitted {
            if let Some(index) = self.tx.sorted.get(&value) {
                return Some(*index);
            }
        }
        self.sorted.get(&value).copied()
    }

    /// Finds the leaf with the largest value not exceeding `value`.
    ///
    /// An exact match wins immediately and is reported through
    /// `already_present`. The search runs over the ordered value index, so
    /// it is logarithmic in the number of leaves.
    pub fn find_predecessor(&self, value: U256, include_uncommitted: bool) -> PredecessorInfo {
        if let Some(index) = self.find_leaf_index(value, include_uncommitted) {
            return PredecessorInfo {
                index,
                already_present: true,
            };
        }
        let committed = self.sorted.range(..=value).next_back();
        let staged = if include_uncommitted {
            self.tx.sorted.range(..=value).next_back()
        } else {
            None
        };
        let best = match (committed, staged) {
            (Some(a), Some(b)) => Some(if a.0 >= b.0 { a } else { b }),
            (a, b) => a.or(b),
        };
        PredecessorInfo {
            index: best.map(|(_, index)| *index).unwrap_or(0),
            already_present: false,
        }
    }

    /// Builds a non-membership witness for `value` against the selected
    /// view. Fails if the value is already present, since then only a
    /// membership proof exists.
    pub fn non_membership_witness(
        &self,
        value: U256,
        include_uncommitted: bool,
    ) -> Result<LowLeafWitness, TreeError<S::Error>> {
        let pred = self.find_predecessor(value, include_uncommitted);
        if pred.already_present {
            return Err(TreeError::AlreadyPresent { value });
        }
        let preimage = self
            .get_leaf(pred.index, include_uncommitted)
            .ok_or(TreeError::LeafNotFound { index: pred.index })?;
        Ok(LowLeafWitness {
            preimage,
            index: pred.index,
            sibling_path: self.tree.get_sibling_path(pred.index, include_uncommitted)?,
        })
    }

    /// Appends values one at a time, splicing each into the sorted list.
    /// Values already present are skipped silently.
    pub fn append_leaves(&mut self, values: &[U256]) -> Result<(), TreeError<S::Error>> {
        for value in values {
            self.append_leaf(*value)?;
        }
        Ok(())
    }

    /// Splices one value into the list right after its predecessor.
    fn append_leaf(&mut self, value: U256) -> Result<(), TreeError<S::Error>> {
        let pred = self.find_predecessor(value, true);
        if pred.already_present {
            debug!(tree = %self.name, %value, "skipping append of duplicate value");
            return Ok(());
        }
        let low = self
            .get_leaf(pred.index, true)
            .ok_or(TreeError::LeafNotFound { index: pred.index })?;
        let new_index = self.tree.get_num_leaves(true);
        let new_leaf = IndexedLeaf {
            value,
            next_index: low.next_index,
            next_value: low.next_value,
        };
        let updated_low = IndexedLeaf {
            value: low.value,
            next_index: new_index,
            next_value: value,
        };
        trace!(tree = %self.name, %value, new_index, low_index = pred.index, "appending leaf");

        self.tx.cache.insert(pred.index, updated_low);
        self.tx.cache.insert(new_index, new_leaf);
        self.tx.sorted.insert(value, new_index);
        self.tree
            .update_leaf(updated_low.hash(self.hasher), pred.index)?;
        self.tree.append_leaves(&[new_leaf.hash(self.hasher)])?;
        Ok(())
    }

    /// Inserts one block's worth of values while producing a low-leaf
    /// non-membership witness for each of them, in input order.
    ///
    /// Witnesses are captured against the intermediate tree states of the
    /// batch itself: the witness for value `i` already reflects the low-leaf
    /// updates of values `0..i`, which is how the verifying circuit replays
    /// the insertion.
    ///
    /// Preconditions checked up front, before any mutation:
    /// - the batch is no larger than [`MAX_BATCH_INSERT`];
    /// - non-zero values are pairwise distinct and not yet in the tree.
    ///
    /// Zero values are sparse-layout padding: they take a zero placeholder
    /// witness and a zero leaf outside the linked list.
    ///
    /// When a later batch member shares its predecessor with an earlier one,
    /// its witness is the zero placeholder and it is spliced among the
    /// leaves staged by the batch itself in a second pass. A value that
    /// would have to splice in front of the whole staged chain is rejected
    /// with [`TreeError::UnlinkedBatchValue`], since linking it would
    /// require a second update of an already-witnessed leaf.
    ///
    /// On error the transaction may hold partial writes; callers abort the
    /// whole batch with [`rollback`](Self::rollback), as nothing is durable
    /// before [`commit`](Self::commit).
    pub fn batch_insert(
        &mut self,
        values: &[U256],
    ) -> Result<Vec<LowLeafWitness>, TreeError<S::Error>> {
        if values.len() > MAX_BATCH_INSERT {
            return Err(TreeError::BatchTooLarge {
                got: values.len(),
                max: MAX_BATCH_INSERT,
            });
        }
        let mut seen = HashSet::with_capacity(values.len());
        for value in values {
            if value.is_zero() {
                continue;
            }
            if !seen.insert(*value) {
                return Err(TreeError::DuplicateBatchValue { value: *value });
            }
            if self.find_leaf_index(*value, true).is_some() {
                return Err(TreeError::AlreadyPresent { value: *value });
            }
        }

        let depth = self.tree.depth();
        let start_index = self.tree.get_num_leaves(true);
        let mut witnesses = Vec::with_capacity(values.len());
        let mut staged: Vec<IndexedLeaf> = Vec::with_capacity(values.len());
        let mut resolved = vec![false; values.len()];
        let mut touched: HashSet<LeafIndex> = HashSet::new();

        // Pass 1: capture a witness per value and update each low leaf once.
        // A low leaf already updated by an earlier batch member must not be
        // touched again, otherwise the witness captured for that member
        // would no longer verify.
        for (i, &value) in values.iter().enumerate() {
            if value.is_zero() {
                witnesses.push(LowLeafWitness::zero(depth));
                staged.push(IndexedLeaf::default());
                continue;
            }
            let pred = self.find_predecessor(value, true);
            if touched.contains(&pred.index) {
                witnesses.push(LowLeafWitness::zero(depth));
                staged.push(IndexedLeaf {
                    value,
                    next_index: 0,
                    next_value: U256::ZERO,
                });
                continue;
            }
            touched.insert(pred.index);
            let low = self
                .get_leaf(pred.index, true)
                .ok_or(TreeError::LeafNotFound { index: pred.index })?;
            witnesses.push(LowLeafWitness {
                preimage: low,
                index: pred.index,
                sibling_path: self.tree.get_sibling_path(pred.index, true)?,
            });
            resolved[i] = true;
            // The new leaf inherits the low leaf's pre-splice successor.
            staged.push(IndexedLeaf {
                value,
                next_index: low.next_index,
                next_value: low.next_value,
            });
            let updated_low = IndexedLeaf {
                value: low.value,
                next_index: start_index + i as u64,
                next_value: value,
            };
            self.tx.cache.insert(pred.index, updated_low);
            self.tree
                .update_leaf(updated_low.hash(self.hasher), pred.index)?;
        }

        // Pass 2: thread each unresolved value into the staged chain. Its
        // predecessor is the staged leaf whose interval contains the value,
        // or the staged tail below it; the value inherits that leaf's
        // forward pointer and the leaf is repointed, a plain list splice
        // confined to leaves that carry no witness of their own. A value
        // with no such staged predecessor would force a second update of an
        // already-witnessed leaf, so the batch is rejected instead.
        for i in 0..values.len() {
            if resolved[i] || values[i].is_zero() {
                continue;
            }
            let value = values[i];
            let mut spliced = false;
            for j in 0..i {
                if staged[j].value.is_zero() {
                    continue;
                }
                let within = staged[j].next_value > value && staged[j].value < value;
                let at_tail = staged[j].is_tail() && staged[j].value < value;
                if within || at_tail {
                    staged[i].next_index = staged[j].next_index;
                    staged[i].next_value = staged[j].next_value;
                    staged[j].next_index = start_index + i as u64;
                    staged[j].next_value = value;
                    spliced = true;
                    break;
                }
            }
            if !spliced {
                return Err(TreeError::UnlinkedBatchValue { value });
            }
        }

        // Append all staged leaves in input order.
        let hasher = self.hasher;
        let hashes: Vec<NodeHash> = staged.par_iter().map(|leaf| leaf.hash(hasher)).collect();
        for (i, leaf) in staged.iter().enumerate() {
            let index = start_index + i as u64;
            self.tx.cache.insert(index, *leaf);
            if !leaf.value.is_zero() {
                self.tx.sorted.insert(leaf.value, index);
            }
        }
        self.tree.append_leaves(&hashes)?;

        debug!(
            tree = %self.name,
            batch = values.len(),
            start_index,
            "batch insertion staged"
        );
        Ok(witnesses)
    }

    /// Flushes the open transaction to the store as one atomic batch and
    /// merges it into the committed state.
    pub fn commit(&mut self) -> Result<(), TreeError<S::Error>> {
        if self.tx.is_empty() && !self.tree.has_pending() {
            return Ok(());
        }
        let mut delta = TreeUpdates::default();
        let mut entries: Vec<WriteEntry> = Vec::new();

        let mut staged: Vec<(LeafIndex, IndexedLeaf)> =
            self.tx.cache.iter().map(|(&index, &leaf)| (index, leaf)).collect();
        staged.sort_unstable_by_key(|(index, _)| *index);
        for (index, leaf) in &staged {
            entries.push((leaf_key(&self.name, *index), Some(leaf.encode().to_vec())));
            let old = self.leaves.get(*index as usize).copied();
            delta.leaves.add(*index, old, Some(*leaf));
        }
        self.tree.stage_commit(&mut delta, &mut entries)?;

        // The unsealed diff is persisted alongside the data it describes so
        // a reloaded tree can still restore past unsnapshotted commits.
        let mut pending = self.snapshots.pending.clone();
        pending.merge(delta);
        entries.push((
            delta_key(&self.name),
            Some(encode_record(&pending, "tree delta")?),
        ));

        self.store.batch_write(entries).map_err(TreeError::Store)?;

        self.tree.apply_commit();
        let count = staged.len();
        for (index, leaf) in staged {
            let index = index as usize;
            if index < self.leaves.len() {
                self.leaves[index] = leaf;
            } else {
                debug_assert_eq!(index, self.leaves.len(), "leaf indices must stay dense");
                self.leaves.push(leaf);
            }
        }
        self.sorted.append(&mut self.tx.sorted);
        self.tx.clear();
        self.snapshots.pending = pending;

        debug!(tree = %self.name, leaves = count, size = self.leaves.len(), "committed");
        Ok(())
    }

    /// Discards the open transaction and the tree's buffered mutations.
    pub fn rollback(&mut self) {
        self.tx.clear();
        self.tree.rollback();
    }

    /// Seals the diff accumulated since the previous snapshot under `block`.
    ///
    /// Requires a committed tree and a block number strictly above every
    /// earlier snapshot.
    pub fn snapshot(&mut self, block: BlockNumber) -> Result<(), TreeError<S::Error>> {
        self.ensure_clean()?;
        if let Some(latest) = self.snapshots.latest_block() {
            if block <= latest {
                return Err(TreeError::NonMonotonicSnapshot { block, latest });
            }
        }
        let record = TreeSnapshot {
            block,
            root: self.tree.get_root(false),
            size: self.tree.get_num_leaves(false),
            updates: self.snapshots.pending.clone(),
        };
        let entries = vec![
            (
                snapshot_key(&self.name, block),
                Some(encode_record(&record, "snapshot record")?),
            ),
            (delta_key(&self.name), None),
        ];
        self.store.batch_write(entries).map_err(TreeError::Store)?;
        self.snapshots.pending = TreeUpdates::default();
        self.snapshots.sealed.insert(block, record);
        debug!(tree = %self.name, block, "snapshot sealed");
        Ok(())
    }

    /// Rolls the live tree back to exactly the state sealed at `block` and
    /// deletes every snapshot above it; they describe a future that no
    /// longer exists.
    ///
    /// A failed restore leaves the tree in an unspecified state and must be
    /// treated as fatal by the caller.
    pub fn restore(&mut self, block: BlockNumber) -> Result<(), TreeError<S::Error>> {
        self.ensure_clean()?;
        if !self.snapshots.sealed.contains_key(&block) {
            return Err(TreeError::SnapshotNotFound { block });
        }

        // Undo newest first: the unsealed diff, then each sealed block above
        // the target in descending order.
        let mut inverses = Vec::new();
        if !self.snapshots.pending.is_empty() {
            inverses.push(self.snapshots.pending.clone().inverse());
        }
        let pruned = self.snapshots.blocks_above(block);
        for b in pruned.iter().rev() {
            inverses.push(self.snapshots.sealed[b].updates.clone().inverse());
        }

        let mut entries: Vec<WriteEntry> = Vec::new();
        for inverse in &inverses {
            self.restore_entries(inverse, &mut entries)?;
        }
        for b in &pruned {
            entries.push((snapshot_key(&self.name, *b), None));
        }
        entries.push((delta_key(&self.name), None));
        self.store.batch_write(entries).map_err(TreeError::Store)?;

        for inverse in &inverses {
            self.tree.apply_restore(inverse);
            for (&index, (_, new)) in &inverse.leaves.data {
                if let Some(leaf) = new {
                    if (index as usize) < self.leaves.len() {
                        self.leaves[index as usize] = *leaf;
                    }
                }
                // Deleted entries fall off when the vector is truncated to
                // the restored size below.
            }
        }
        self.leaves.truncate(self.tree.get_num_leaves(false) as usize);
        self.rebuild_sorted();
        self.snapshots.pending = TreeUpdates::default();
        for b in &pruned {
            self.snapshots.sealed.remove(b);
        }

        debug!(tree = %self.name, block, pruned = pruned.len(), "restored");
        Ok(())
    }

    /// The snapshot sealed at exactly `block`. Fails if none exists, e.g.
    /// because a later restore pruned it.
    pub fn get_snapshot(&self, block: BlockNumber) -> Result<&TreeSnapshot, TreeError<S::Error>> {
        self.snapshots
            .sealed
            .get(&block)
            .ok_or(TreeError::SnapshotNotFound { block })
    }

    /// Translates an inverted diff into store writes, in application order.
    fn restore_entries(
        &self,
        inverse: &TreeUpdates,
        entries: &mut Vec<WriteEntry>,
    ) -> Result<(), TreeError<S::Error>> {
        for (key, (_, new)) in &inverse.nodes.data {
            entries.push((
                node_key(&self.name, *key),
                new.as_ref().map(|hash| hash.to_vec()),
            ));
        }
        for (index, (_, new)) in &inverse.leaves.data {
            entries.push((
                leaf_key(&self.name, *index),
                new.as_ref().map(|leaf| leaf.encode().to_vec()),
            ));
        }
        if let Some((_, meta)) = &inverse.meta {
            entries.push((meta_key(&self.name), Some(encode_record(meta, "tree metadata")?)));
        }
        Ok(())
    }

    /// Rebuilds the committed value index from the leaf collection.
    fn rebuild_sorted(&mut self) {
        self.sorted.clear();
        for (index, leaf) in self.leaves.iter().enumerate() {
            if index == 0 || !leaf.value.is_zero() {
                self.sorted.insert(leaf.value, index as u64);
            }
        }
    }

    /// Snapshot and restore only operate on a committed tree.
    fn ensure_clean(&self) -> Result<(), TreeError<S::Error>> {
        if self.tx.is_empty() && !self.tree.has_pending() {
            Ok(())
        } else {
            Err(TreeError::UncommittedWrites)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_store::MemStore;
    use crate::traits::Blake3Hasher;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    type TestTree<'a> = IndexedTree<'a, MemStore, Blake3Hasher>;

    fn new_tree<'a>(store: &'a MemStore, hasher: &'a Blake3Hasher) -> TestTree<'a> {
        IndexedTree::new(store, hasher, "nullifier", 8).unwrap()
    }

    fn u(value: u64) -> U256 {
        U256::from(value)
    }

    /// Follows the linked list from the sentinel, returning the visited
    /// values in order.
    fn walk(tree: &TestTree<'_>) -> Vec<u64> {
        let mut out = Vec::new();
        let mut leaf = tree.get_leaf(0, false).unwrap();
        loop {
            out.push(leaf.value.to::<u64>());
            if leaf.is_tail() {
                break;
            }
            leaf = tree.get_leaf(leaf.next_index, false).unwrap();
        }
        out
    }

    /// Linear reference implementation of the predecessor search, scanning
    /// every leaf and minimizing the difference to the target.
    fn reference_predecessor(
        tree: &TestTree<'_>,
        value: U256,
        include_uncommitted: bool,
    ) -> PredecessorInfo {
        let num_leaves = tree.get_num_leaves(include_uncommitted);
        let mut min_diff: Option<U256> = None;
        let mut min_index = 0u64;
        for i in 0..num_leaves {
            let leaf = tree.get_leaf(i, include_uncommitted).unwrap();
            let diff = if leaf.value > value {
                value
            } else if leaf.value == value {
                return PredecessorInfo {
                    index: i,
                    already_present: true,
                };
            } else {
                value - leaf.value
            };
            if min_diff.map_or(true, |m| diff < m) {
                min_diff = Some(diff);
                min_index = i;
            }
        }
        PredecessorInfo {
            index: min_index,
            already_present: false,
        }
    }

    /// Tests that a fresh tree holds exactly the committed sentinel leaf.
    #[test]
    fn new_tree_seeds_sentinel() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let tree = new_tree(&store, &hasher);

        assert_eq!(tree.get_num_leaves(false), 1);
        assert_eq!(tree.get_leaf(0, false), Some(IndexedLeaf::sentinel()));
        assert_eq!(tree.find_leaf_index(U256::ZERO, false), Some(0));
        assert!(!tree.tree().has_pending());
    }

    /// Inserting 10, 30, 20 one at a time must produce the list
    /// 0 -> 10 -> 20 -> 30, and a non-membership witness for 15 must
    /// resolve to the leaf holding 10 whose successor is 20.
    #[test]
    fn scenario_sequential_inserts() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);
        tree.append_leaves(&[u(10), u(30), u(20)]).unwrap();
        tree.commit().unwrap();

        assert_eq!(walk(&tree), vec![0, 10, 20, 30]);

        let witness = tree.non_membership_witness(u(15), false).unwrap();
        assert_eq!(witness.preimage.value, u(10));
        assert_eq!(witness.preimage.next_value, u(20));
        let leaf_hash = witness.preimage.hash(&hasher);
        assert_eq!(
            witness
                .sibling_path
                .root_from_leaf(&hasher, leaf_hash, witness.index),
            tree.get_root(false)
        );

        // A value below everything resolves to the sentinel.
        let witness = tree.non_membership_witness(u(5), false).unwrap();
        assert_eq!(witness.index, 0);
        assert_eq!(witness.preimage.next_value, u(10));

        // A present value has no non-membership witness.
        assert!(matches!(
            tree.non_membership_witness(u(20), false),
            Err(TreeError::AlreadyPresent { .. })
        ));
    }

    /// Tests that appending an already-present value is a silent no-op.
    #[test]
    fn duplicate_append_is_noop() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);
        tree.append_leaves(&[u(10)]).unwrap();
        tree.commit().unwrap();
        let root = tree.get_root(false);

        tree.append_leaves(&[u(10)]).unwrap();
        tree.commit().unwrap();
        assert_eq!(tree.get_root(false), root);
        assert_eq!(tree.get_num_leaves(false), 2);
    }

    /// Cross-checks the ordered-index predecessor search against the linear
    /// reference scan over random values, in both views.
    #[test]
    fn predecessor_matches_linear_reference() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);
        let mut rng = StdRng::seed_from_u64(7);

        let mut values = std::collections::HashSet::new();
        while values.len() < 30 {
            values.insert(rng.gen_range(1u64..10_000));
        }
        let values: Vec<u64> = values.into_iter().collect();
        let (committed, uncommitted) = values.split_at(20);

        tree.append_leaves(&committed.iter().map(|&v| u(v)).collect::<Vec<_>>())
            .unwrap();
        tree.commit().unwrap();
        tree.append_leaves(&uncommitted.iter().map(|&v| u(v)).collect::<Vec<_>>())
            .unwrap();

        for _ in 0..200 {
            let query = u(rng.gen_range(1u64..11_000));
            for include_uncommitted in [false, true] {
                assert_eq!(
                    tree.find_predecessor(query, include_uncommitted),
                    reference_predecessor(&tree, query, include_uncommitted),
                    "query {query} include_uncommitted {include_uncommitted}"
                );
            }
        }
    }

    /// Walking the list after random insertions must visit strictly
    /// ascending values and terminate at the tail.
    #[test]
    fn sortedness_over_random_insertions() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);
        let mut rng = StdRng::seed_from_u64(13);

        let mut values = std::collections::HashSet::new();
        while values.len() < 50 {
            values.insert(rng.gen_range(1u64..1_000_000));
        }
        tree.append_leaves(&values.iter().map(|&v| u(v)).collect::<Vec<_>>())
            .unwrap();
        tree.commit().unwrap();

        let visited = walk(&tree);
        assert_eq!(visited.len(), values.len() + 1);
        assert!(visited.windows(2).all(|w| w[0] < w[1]));
    }

    /// A batch with collision-free predecessors must produce the same
    /// committed root as the same values appended sequentially.
    #[test]
    fn batch_matches_sequential_inserts() {
        let store_a = MemStore::new();
        let store_b = MemStore::new();
        let hasher = Blake3Hasher;
        let seed = [u(5), u(20), u(40), u(60), u(90)];
        let batch = [u(50), u(10), u(80), u(30)];

        let mut batched = new_tree(&store_a, &hasher);
        batched.append_leaves(&seed).unwrap();
        batched.commit().unwrap();
        let witnesses = batched.batch_insert(&batch).unwrap();
        batched.commit().unwrap();

        let mut sequential = new_tree(&store_b, &hasher);
        sequential.append_leaves(&seed).unwrap();
        sequential.commit().unwrap();
        sequential.append_leaves(&batch).unwrap();
        sequential.commit().unwrap();

        assert_eq!(batched.get_root(false), sequential.get_root(false));
        assert_eq!(witnesses.len(), batch.len());
        assert_eq!(walk(&batched), walk(&sequential));
    }

    /// Replays the witness chain the way the verifying circuit does: each
    /// witness must verify against the root produced by applying the
    /// previous low-leaf update through its own sibling path.
    #[test]
    fn batch_witnesses_verify_against_intermediate_roots() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);
        tree.append_leaves(&[u(20), u(40)]).unwrap();
        tree.commit().unwrap();

        let start_index = tree.get_num_leaves(true);
        let values = [u(10), u(30), u(50)];
        let mut root = tree.get_root(true);
        let witnesses = tree.batch_insert(&values).unwrap();

        for (i, witness) in witnesses.iter().enumerate() {
            let leaf_hash = witness.preimage.hash(&hasher);
            assert_eq!(
                witness
                    .sibling_path
                    .root_from_leaf(&hasher, leaf_hash, witness.index),
                root,
                "witness {i} must verify against the intermediate root"
            );
            let updated_low = IndexedLeaf {
                value: witness.preimage.value,
                next_index: start_index + i as u64,
                next_value: values[i],
            };
            root = witness.sibling_path.root_from_leaf(
                &hasher,
                updated_low.hash(&hasher),
                witness.index,
            );
        }
    }

    /// A batch containing the same non-zero value twice must be rejected
    /// before any mutation is staged.
    #[test]
    fn batch_rejects_duplicate_values() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);

        let err = tree.batch_insert(&[u(5), u(5)]).unwrap_err();
        assert!(matches!(err, TreeError::DuplicateBatchValue { value } if value == u(5)));
        assert_eq!(tree.get_num_leaves(true), 1);
        assert!(!tree.tree().has_pending());
    }

    /// A batch value that is already in the tree has no non-membership
    /// witness and must be rejected.
    #[test]
    fn batch_rejects_present_value() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);
        tree.append_leaves(&[u(5)]).unwrap();
        tree.commit().unwrap();

        let err = tree.batch_insert(&[u(5)]).unwrap_err();
        assert!(matches!(err, TreeError::AlreadyPresent { value } if value == u(5)));
    }

    /// Oversized batches are rejected up front.
    #[test]
    fn batch_rejects_oversized_input() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);
        let values: Vec<U256> = (1..=MAX_BATCH_INSERT as u64 + 1).map(u).collect();

        let err = tree.batch_insert(&values).unwrap_err();
        assert!(matches!(err, TreeError::BatchTooLarge { .. }));
    }

    /// Zero values are sparse-layout padding: they take placeholder
    /// witnesses and zero leaves outside the linked list.
    #[test]
    fn batch_zero_values_are_padding() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);
        let start_index = tree.get_num_leaves(true);

        let witnesses = tree.batch_insert(&[u(7), U256::ZERO, u(9)]).unwrap();
        tree.commit().unwrap();

        assert_eq!(witnesses[1], LowLeafWitness::zero(tree.tree().depth()));
        assert_eq!(tree.get_num_leaves(false), start_index + 3);
        assert_eq!(
            tree.get_leaf(start_index + 1, false),
            Some(IndexedLeaf::default())
        );
        assert_eq!(walk(&tree), vec![0, 7, 9]);
    }

    /// Batch members whose predecessor was taken by an earlier member get
    /// placeholder witnesses and are threaded by the repair pass; an
    /// ascending run sharing one predecessor must come out fully linked.
    #[test]
    fn batch_repairs_intra_batch_chains() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);
        let depth = tree.tree().depth();

        let witnesses = tree.batch_insert(&[u(3), u(4), u(5)]).unwrap();
        tree.commit().unwrap();

        assert_eq!(witnesses[0].preimage, IndexedLeaf::sentinel());
        assert_eq!(witnesses[1], LowLeafWitness::zero(depth));
        assert_eq!(witnesses[2], LowLeafWitness::zero(depth));
        assert_eq!(walk(&tree), vec![0, 3, 4, 5]);

        // The staged chain points through consecutive batch slots.
        let three = tree.get_leaf(1, false).unwrap();
        assert_eq!((three.next_index, three.next_value), (2, u(4)));
        let four = tree.get_leaf(2, false).unwrap();
        assert_eq!((four.next_index, four.next_value), (3, u(5)));
    }

    /// The repair pass must also handle chains that arrive out of order:
    /// a later member landing between two earlier members inherits the
    /// spliced leaf's forward pointer.
    #[test]
    fn batch_repairs_unordered_chains() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);

        tree.batch_insert(&[u(11), u(42), u(27)]).unwrap();
        tree.commit().unwrap();
        assert_eq!(walk(&tree), vec![0, 11, 27, 42]);

        // A longer scramble over a shared predecessor.
        let store = MemStore::new();
        let mut tree = new_tree(&store, &hasher);
        tree.batch_insert(&[u(10), u(40), u(20), u(30)]).unwrap();
        tree.commit().unwrap();
        assert_eq!(walk(&tree), vec![0, 10, 20, 30, 40]);
    }

    /// A batch member that would have to splice in front of the whole
    /// staged chain cannot be linked without invalidating an earlier
    /// witness and must be rejected.
    #[test]
    fn batch_rejects_unlinkable_value() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);

        // 10 shares the sentinel predecessor with 50 but precedes it.
        let err = tree.batch_insert(&[u(50), u(10)]).unwrap_err();
        assert!(matches!(err, TreeError::UnlinkedBatchValue { value } if value == u(10)));
        tree.rollback();

        // Same shape against a committed predecessor: 22 and 25 both sit
        // behind the committed 20, and 22 arrives second.
        tree.append_leaves(&[u(20)]).unwrap();
        tree.commit().unwrap();
        let err = tree.batch_insert(&[u(25), u(22)]).unwrap_err();
        assert!(matches!(err, TreeError::UnlinkedBatchValue { value } if value == u(22)));
        tree.rollback();

        // The ascending orderings of both batches succeed.
        tree.batch_insert(&[u(10), u(50)]).unwrap();
        tree.batch_insert(&[u(22), u(25)]).unwrap();
        tree.commit().unwrap();
        assert_eq!(walk(&tree), vec![0, 10, 20, 22, 25, 50]);
    }

    /// Rollback must discard every staged mutation, both leaf-side and
    /// node-side.
    #[test]
    fn rollback_discards_staged_state() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);
        tree.append_leaves(&[u(10)]).unwrap();
        tree.commit().unwrap();
        let root = tree.get_root(false);

        tree.append_leaves(&[u(20)]).unwrap();
        tree.batch_insert(&[u(30), u(40)]).unwrap();
        assert_ne!(tree.get_root(true), root);

        tree.rollback();
        assert_eq!(tree.get_root(true), root);
        assert_eq!(tree.get_num_leaves(true), 2);
        assert_eq!(tree.find_leaf_index(u(20), true), None);

        // The discarded values can be inserted again afterwards.
        tree.append_leaves(&[u(20)]).unwrap();
        tree.commit().unwrap();
        assert_eq!(walk(&tree), vec![0, 10, 20]);
    }

    /// Reloading by name must reproduce the committed state exactly and
    /// ignore whatever was never committed.
    #[test]
    fn from_name_reproduces_committed_state() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);
        tree.append_leaves(&[u(10), u(20)]).unwrap();
        tree.commit().unwrap();
        tree.append_leaves(&[u(30)]).unwrap();
        let committed_root = tree.get_root(false);
        drop(tree);

        let reloaded = IndexedTree::from_name(&store, &hasher, "nullifier").unwrap();
        assert_eq!(reloaded.get_root(false), committed_root);
        assert_eq!(reloaded.get_num_leaves(false), 3);
        assert_eq!(walk(&reloaded), vec![0, 10, 20]);
        assert_eq!(reloaded.find_leaf_index(u(20), true), Some(2));
        assert_eq!(reloaded.find_leaf_index(u(30), true), None);

        assert!(matches!(
            IndexedTree::from_name(&store, &hasher, "unknown"),
            Err(TreeError::MissingMetadata { .. })
        ));
    }

    /// Restoring a snapshot must reproduce the captured root and every leaf
    /// preimage exactly.
    #[test]
    fn snapshot_restore_roundtrip() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);
        tree.append_leaves(&[u(10), u(20)]).unwrap();
        tree.commit().unwrap();
        tree.snapshot(1).unwrap();

        let root_at_1 = tree.get_root(false);
        let leaves_at_1: Vec<_> = (0..3).map(|i| tree.get_leaf(i, false).unwrap()).collect();

        tree.append_leaves(&[u(30), u(15)]).unwrap();
        tree.commit().unwrap();
        assert_ne!(tree.get_root(false), root_at_1);

        tree.restore(1).unwrap();
        assert_eq!(tree.get_root(false), root_at_1);
        assert_eq!(tree.get_num_leaves(false), 3);
        for (i, expected) in leaves_at_1.iter().enumerate() {
            assert_eq!(tree.get_leaf(i as u64, false).unwrap(), *expected);
        }
        assert_eq!(tree.find_leaf_index(u(15), true), None);
        assert_eq!(walk(&tree), vec![0, 10, 20]);
    }

    /// Restore must also undo commits that were never sealed into a
    /// snapshot.
    #[test]
    fn restore_undoes_unsnapshotted_commits() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);
        tree.append_leaves(&[u(10)]).unwrap();
        tree.commit().unwrap();
        tree.snapshot(1).unwrap();
        let root_at_1 = tree.get_root(false);

        tree.append_leaves(&[u(30)]).unwrap();
        tree.commit().unwrap();
        tree.append_leaves(&[u(40)]).unwrap();
        tree.commit().unwrap();

        tree.restore(1).unwrap();
        assert_eq!(tree.get_root(false), root_at_1);
        assert_eq!(walk(&tree), vec![0, 10]);
    }

    /// Restoring to a block must delete every snapshot above it.
    #[test]
    fn restore_prunes_future_snapshots() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);
        tree.append_leaves(&[u(10)]).unwrap();
        tree.commit().unwrap();
        tree.snapshot(1).unwrap();
        tree.append_leaves(&[u(20)]).unwrap();
        tree.commit().unwrap();
        tree.snapshot(2).unwrap();

        tree.restore(1).unwrap();
        assert!(matches!(
            tree.get_snapshot(2),
            Err(TreeError::SnapshotNotFound { block: 2 })
        ));
        assert!(tree.get_snapshot(1).is_ok());

        // The pruned block number is free again for the new history.
        tree.append_leaves(&[u(25)]).unwrap();
        tree.commit().unwrap();
        tree.snapshot(2).unwrap();
        assert_eq!(tree.get_snapshot(2).unwrap().size, 3);
    }

    /// Snapshot block numbers must be strictly increasing.
    #[test]
    fn snapshot_rejects_non_monotonic_blocks() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);
        tree.snapshot(5).unwrap();

        assert!(matches!(
            tree.snapshot(5),
            Err(TreeError::NonMonotonicSnapshot { block: 5, latest: 5 })
        ));
        assert!(matches!(
            tree.snapshot(3),
            Err(TreeError::NonMonotonicSnapshot { block: 3, latest: 5 })
        ));
        tree.append_leaves(&[u(10)]).unwrap();
        tree.commit().unwrap();
        tree.snapshot(6).unwrap();
    }

    /// Snapshot and restore require a committed tree.
    #[test]
    fn versioning_requires_committed_tree() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);
        tree.snapshot(1).unwrap();
        tree.append_leaves(&[u(10)]).unwrap();

        assert!(matches!(tree.snapshot(2), Err(TreeError::UncommittedWrites)));
        assert!(matches!(tree.restore(1), Err(TreeError::UncommittedWrites)));

        tree.rollback();
        tree.snapshot(2).unwrap();
    }

    /// Re-applying identical data after a restore must reproduce leaf
    /// indices and roots bit-for-bit, since downstream proofs were already
    /// generated against them.
    #[test]
    fn divergent_histories_reproduce_identical_state() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);
        tree.append_leaves(&[u(10)]).unwrap();
        tree.commit().unwrap();
        tree.snapshot(1).unwrap();

        tree.append_leaves(&[u(100)]).unwrap();
        tree.commit().unwrap();
        let root_with_100 = tree.get_root(false);
        let index_of_100 = tree.find_leaf_index(u(100), false).unwrap();
        tree.snapshot(2).unwrap();
        tree.append_leaves(&[u(200)]).unwrap();
        tree.commit().unwrap();

        // Reorg: back to block 1, then a different history that happens to
        // re-insert the same value.
        tree.restore(1).unwrap();
        assert_eq!(tree.find_leaf_index(u(100), false), None);
        tree.append_leaves(&[u(100)]).unwrap();
        tree.commit().unwrap();

        assert_eq!(tree.find_leaf_index(u(100), false), Some(index_of_100));
        assert_eq!(tree.get_root(false), root_with_100);
        tree.snapshot(2).unwrap();
        assert_eq!(tree.get_snapshot(2).unwrap().root, root_with_100);
    }

    /// The sealed record reports the committed root and size at capture
    /// time, regardless of later mutations.
    #[test]
    fn get_snapshot_reports_capture_state() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);
        tree.append_leaves(&[u(10), u(20)]).unwrap();
        tree.commit().unwrap();
        let root = tree.get_root(false);
        tree.snapshot(7).unwrap();

        tree.append_leaves(&[u(30)]).unwrap();
        tree.commit().unwrap();

        let snapshot = tree.get_snapshot(7).unwrap();
        assert_eq!(snapshot.block, 7);
        assert_eq!(snapshot.root, root);
        assert_eq!(snapshot.size, 3);
        assert!(matches!(
            tree.get_snapshot(8),
            Err(TreeError::SnapshotNotFound { block: 8 })
        ));
    }

    /// Snapshots and the unsealed diff are persisted, so a reloaded tree
    /// can still restore across them.
    #[test]
    fn restore_survives_reload() {
        let store = MemStore::new();
        let hasher = Blake3Hasher;
        let mut tree = new_tree(&store, &hasher);
        tree.append_leaves(&[u(10), u(20)]).unwrap();
        tree.commit().unwrap();
        tree.snapshot(1).unwrap();
        let root_at_1 = tree.get_root(false);
        tree.append_leaves(&[u(30)]).unwrap();
        tree.commit().unwrap();
        drop(tree);

        let mut reloaded = IndexedTree::from_name(&store, &hasher, "nullifier").unwrap();
        assert_eq!(reloaded.get_num_leaves(false), 4);
        reloaded.restore(1).unwrap();
        assert_eq!(reloaded.get_root(false), root_at_1);
        assert_eq!(walk(&reloaded), vec![0, 10, 20]);

        // The restored state is what a second reload sees as well.
        drop(reloaded);
        let again = IndexedTree::from_name(&store, &hasher, "nullifier").unwrap();
        assert_eq!(again.get_root(false), root_at_1);
        assert_eq!(again.get_num_leaves(false), 3);
    }
}
