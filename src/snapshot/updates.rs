//! Tracks tree changes as (old, new) value pairs for atomic commits and
//! snapshot rollbacks.

use crate::types::{IndexedLeaf, LeafIndex, NodeHash, NodeKey, TreeMeta};
use serde::{Deserialize, Serialize};
use std::{collections::btree_map::Entry, collections::BTreeMap, fmt};

/// Generic map of `(old, new)` transitions keyed by `K`.
///
/// `None` indicates absence, so `(None, Some(v))` is a creation and
/// `(Some(v), None)` a deletion. No-op transitions where old equals new are
/// dropped automatically, and chained transitions for the same key collapse
/// to a single `(first_old, last_new)` pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Updates<K: Ord, V> {
    /// Maps keys to (old_value, new_value) pairs.
    pub data: BTreeMap<K, (Option<V>, Option<V>)>,
}

impl<K: Ord, V> Default for Updates<K, V> {
    fn default() -> Self {
        Self {
            data: BTreeMap::new(),
        }
    }
}

impl<K: Ord, V: Clone + PartialEq + fmt::Debug> Updates<K, V> {
    /// Records a transition for a key, chaining onto any transition already
    /// recorded for it.
    ///
    /// # Panics
    /// Panics if the transition does not chain, i.e. `old` differs from the
    /// `new` side already recorded for the key.
    pub fn add(&mut self, key: K, old: Option<V>, new: Option<V>) {
        match self.data.entry(key) {
            Entry::Occupied(mut change) => {
                assert_eq!(old, change.get().1, "invalid state transition");
                if change.get().0 == new {
                    change.remove();
                } else {
                    change.get_mut().1 = new;
                }
            }
            Entry::Vacant(change) => {
                if old != new {
                    change.insert((old, new));
                }
            }
        }
    }

    /// Merges another set of transitions into this one, chaining per key.
    ///
    /// Logically equivalent to applying [`add`](Self::add) for each entry of
    /// `other`.
    pub fn merge(&mut self, other: Self) {
        for (key, (old, new)) in other.data {
            self.add(key, old, new);
        }
    }

    /// Swaps the old and new side of every transition, producing the diff
    /// that undoes this one.
    pub fn inverse(mut self) -> Self {
        self.data
            .values_mut()
            .for_each(|(old, new)| std::mem::swap(old, new));
        self
    }

    /// Returns true if no transitions are recorded.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Transitions of internal node hashes.
pub type NodeUpdates = Updates<NodeKey, NodeHash>;

/// Transitions of leaf preimages.
pub type LeafUpdates = Updates<LeafIndex, IndexedLeaf>;

/// The complete diff one commit (or a run of commits) applies to a tree:
/// node hashes, leaf preimages and the size/root metadata.
///
/// Snapshots seal one `TreeUpdates` per block; [`inverse`](Self::inverse) of
/// a sealed diff is exactly the mutation that rolls the tree back across
/// that block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeUpdates {
    /// Node hash transitions.
    pub nodes: NodeUpdates,
    /// Leaf preimage transitions.
    pub leaves: LeafUpdates,
    /// Metadata transition, if size or root moved.
    pub meta: Option<(TreeMeta, TreeMeta)>,
}

impl TreeUpdates {
    /// Records a metadata transition, chaining onto any already recorded.
    ///
    /// # Panics
    /// Panics if `old` does not match the currently recorded new metadata.
    pub fn set_meta(&mut self, old: TreeMeta, new: TreeMeta) {
        match &mut self.meta {
            Some((first_old, last_new)) => {
                assert_eq!(*last_new, old, "invalid metadata transition");
                if *first_old == new {
                    self.meta = None;
                } else {
                    *last_new = new;
                }
            }
            None => {
                if old != new {
                    self.meta = Some((old, new));
                }
            }
        }
    }

    /// Merges another diff into this one, chaining transitions per key.
    pub fn merge(&mut self, other: Self) {
        self.nodes.merge(other.nodes);
        self.leaves.merge(other.leaves);
        if let Some((old, new)) = other.meta {
            self.set_meta(old, new);
        }
    }

    /// The diff that undoes this one.
    pub fn inverse(mut self) -> Self {
        self.nodes = self.nodes.inverse();
        self.leaves = self.leaves.inverse();
        self.meta = self.meta.map(|(old, new)| (new, old));
        self
    }

    /// Returns true if the diff changes nothing.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.leaves.is_empty() && self.meta.is_none()
    }
}

/// Formats the diff for debugging, showing node coordinates and hash or
/// preimage hex.
impl fmt::Display for TreeUpdates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmt_hash = |hash: &Option<NodeHash>| match hash {
            Some(hash) => hex::encode(hash),
            None => "empty".to_string(),
        };
        writeln!(f, "TreeUpdates {{")?;
        for (key, (old, new)) in &self.nodes.data {
            writeln!(
                f,
                "  node({}, {}): {} -> {}",
                key.level,
                key.index,
                fmt_hash(old),
                fmt_hash(new)
            )?;
        }
        for (index, (old, new)) in &self.leaves.data {
            let fmt_leaf = |leaf: &Option<IndexedLeaf>| match leaf {
                Some(leaf) => hex::encode(leaf.encode()),
                None => "empty".to_string(),
            };
            writeln!(f, "  leaf {}: {} -> {}", index, fmt_leaf(old), fmt_leaf(new))?;
        }
        if let Some((old, new)) = &self.meta {
            writeln!(
                f,
                "  meta: size {} root {} -> size {} root {}",
                old.size,
                hex::encode(old.root),
                new.size,
                hex::encode(new.root)
            )?;
        }
        write!(f, "}}")
    }
}
