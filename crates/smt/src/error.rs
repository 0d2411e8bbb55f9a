//! Error types for the tree engine

use alloy_primitives::U256;
use thiserror::Error;

use crate::field::Fp;

/// Failure reported by a [`NodeStore`](crate::NodeStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not serve the request.
    #[error("node store unavailable: {0}")]
    Unavailable(String),
}

/// Errors from tree operations.
#[derive(Debug, Error)]
pub enum SmtError {
    /// The append would run past the last leaf position of the tree.
    #[error("capacity exceeded: requested {requested} leaves, {remaining} remaining")]
    CapacityExceeded {
        /// Number of leaf positions the append needed.
        requested: U256,
        /// Number of positions still free.
        remaining: U256,
    },
    /// The nullifier leaf already holds the spent marker.
    #[error("nullifier {0} is already spent")]
    AlreadySpent(Fp),
    /// Stored nodes do not fold to the expected values.
    #[error("node consistency error: {0}")]
    NodeConsistency(String),
    /// The node store failed.
    #[error(transparent)]
    StorageUnavailable(#[from] StoreError),
    /// Sub-tree append arguments do not line up with the tree.
    #[error("invalid sub-tree append: {0}")]
    InvalidSubTree(String),
    /// A leaf index does not fit in the tree.
    #[error("leaf index {index} out of range for depth {depth}")]
    LeafIndexOutOfRange {
        /// Offending index.
        index: U256,
        /// Depth of the tree.
        depth: usize,
    },
    /// Tree depth outside `1..=MAX_DEPTH`.
    #[error("invalid tree depth {0}")]
    InvalidDepth(usize),
    /// The hash function rejected its inputs.
    #[error("hash error: {0}")]
    Hash(String),
}

impl SmtError {
    /// Whether the error means storage and in-memory state have diverged.
    ///
    /// Fatal errors must not be retried transparently.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::NodeConsistency(_) | Self::Hash(_))
    }
}
