//! Block-level snapshot records for rolling tree state back across reorgs.
//!
//! A [`TreeSnapshot`] seals, per block number, the diff the tree accumulated
//! since the previous snapshot together with the committed root and size at
//! capture time. Storing diffs instead of full copies keeps the records
//! proportional to what each block changed; the restore path applies the
//! inverses of the sealed diffs in descending block order, which reproduces
//! the captured state exactly.
//!
//! [`Snapshots`] owns the per-tree snapshot index and the still-unsealed
//! diff. The orchestration of snapshot and restore lives on
//! [`IndexedTree`](crate::IndexedTree), which also owns the live state the
//! diffs are applied to.

pub mod updates;

pub use updates::{LeafUpdates, NodeUpdates, TreeUpdates, Updates};

use crate::types::{BlockNumber, NodeHash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Immutable record of one block's worth of committed tree changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    /// Block this snapshot belongs to.
    pub block: BlockNumber,
    /// Committed root at capture time.
    pub root: NodeHash,
    /// Committed leaf count at capture time.
    pub size: u64,
    /// Changes since the previous snapshot (or since tree creation for the
    /// first snapshot).
    pub updates: TreeUpdates,
}

/// Per-tree snapshot index plus the diff accumulated since the latest
/// snapshot.
#[derive(Debug, Default)]
pub struct Snapshots {
    /// Sealed snapshots keyed by block number, strictly increasing.
    pub(crate) sealed: BTreeMap<BlockNumber, TreeSnapshot>,
    /// Committed changes not yet sealed into a snapshot.
    pub(crate) pending: TreeUpdates,
}

impl Snapshots {
    /// Rebuilds the index from persisted records.
    pub(crate) fn load(sealed: BTreeMap<BlockNumber, TreeSnapshot>, pending: TreeUpdates) -> Self {
        Self { sealed, pending }
    }

    /// Highest sealed block number, if any snapshot exists.
    pub(crate) fn latest_block(&self) -> Option<BlockNumber> {
        self.sealed.keys().next_back().copied()
    }

    /// Sealed block numbers strictly above `block`, ascending.
    pub(crate) fn blocks_above(&self, block: BlockNumber) -> Vec<BlockNumber> {
        self.sealed.range(block + 1..).map(|(b, _)| *b).collect()
    }
}
