//! Node addressing shared with the on-chain verifier

use std::fmt;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::field::Fp;
use crate::hasher::TreeHasher;

/// Identifier of one tree generation in the node store.
pub type TreeId = u64;

/// Path of a node: a leading sentinel bit followed by the path bits.
///
/// The root is `1`, its children `2` and `3`, and a leaf at position `p` in a
/// tree of depth `d` is `2^d | p`. Sibling lookup is `index ^ 1` and the
/// parent is `index >> 1`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "U256", into = "U256")]
pub struct NodeIndex(U256);

/// An encoded path without its sentinel bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("node index 0 has no sentinel bit")]
pub struct InvalidNodeIndex;

impl TryFrom<U256> for NodeIndex {
    type Error = InvalidNodeIndex;

    fn try_from(raw: U256) -> Result<Self, Self::Error> {
        if raw.is_zero() {
            return Err(InvalidNodeIndex);
        }
        Ok(Self(raw))
    }
}

impl From<NodeIndex> for U256 {
    fn from(index: NodeIndex) -> Self {
        index.0
    }
}

impl NodeIndex {
    /// The root of every tree.
    pub const ROOT: Self = Self(U256::from_limbs([1, 0, 0, 0]));

    /// Node at `level` (0 = leaves) and horizontal `position` in a tree of `depth`.
    pub fn new(depth: usize, level: usize, position: U256) -> Self {
        Self((U256::from(1u8) << (depth - level)) | position)
    }

    /// Leaf at `position`.
    pub fn leaf(depth: usize, position: U256) -> Self {
        Self::new(depth, 0, position)
    }

    /// Raw encoded path.
    pub const fn as_u256(&self) -> U256 {
        self.0
    }

    /// The other child of this node's parent.
    pub fn sibling(self) -> Self {
        Self(self.0 ^ U256::from(1u8))
    }

    /// Parent node.
    pub fn parent(self) -> Self {
        Self(self.0 >> 1)
    }

    /// True when this node is a right child.
    pub fn is_right(self) -> bool {
        self.0.bit(0)
    }

    /// Height above the leaves in a tree of `depth`, or `None` when the
    /// path is too long for that depth.
    pub fn level(self, depth: usize) -> Option<usize> {
        (depth + 1).checked_sub(self.0.bit_len())
    }

    /// Horizontal position within its level.
    pub fn position(self) -> Option<U256> {
        let sentinel = U256::from(1u8) << self.0.bit_len().checked_sub(1)?;
        Some(self.0 ^ sentinel)
    }

    /// Sibling path of the leaf at `position`, leaf first.
    pub fn sibling_path(depth: usize, position: U256) -> Vec<Self> {
        let mut node = Self::leaf(depth, position);
        let mut path = Vec::with_capacity(depth);
        for _ in 0..depth {
            path.push(node.sibling());
            node = node.parent();
        }
        path
    }
}

impl fmt::Debug for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeIndex({:#x})", self.0)
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A stored node value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Generation the node belongs to.
    pub tree_id: TreeId,
    /// Encoded path of the node.
    pub node_index: NodeIndex,
    /// Hash (or leaf) value.
    pub value: Fp,
}

/// Outcome of resolving a sibling through cache and storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SiblingNode {
    /// A value was found in the cache or the store.
    Stored(Fp),
    /// Nothing was ever written below this node; it is the empty root of its level.
    ImplicitEmpty(usize),
}

impl SiblingNode {
    /// Concrete value, substituting the precomputed empty root when needed.
    pub fn value(&self, hasher: &TreeHasher) -> Fp {
        match self {
            Self::Stored(value) => *value,
            Self::ImplicitEmpty(level) => hasher.empty_root_at_level(*level),
        }
    }

    /// True when the subtree under this node was never written.
    pub const fn is_implicit_empty(&self) -> bool {
        matches!(self, Self::ImplicitEmpty(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_encoding() {
        let leaf = NodeIndex::leaf(3, U256::from(5u8));
        assert_eq!(leaf.as_u256(), U256::from(0b1101u8));
        assert_eq!(leaf.level(3), Some(0));
        assert_eq!(leaf.position(), Some(U256::from(5u8)));
        assert!(leaf.is_right());
    }

    #[test]
    fn test_sibling_and_parent() {
        let leaf = NodeIndex::leaf(3, U256::from(2u8));
        assert_eq!(leaf.sibling(), NodeIndex::leaf(3, U256::from(3u8)));
        assert_eq!(leaf.parent(), NodeIndex::new(3, 1, U256::from(1u8)));
        assert_eq!(leaf.parent().parent().parent(), NodeIndex::ROOT);
        assert_eq!(NodeIndex::ROOT.level(3), Some(3));
    }

    #[test]
    fn test_sibling_path_leaf_first() {
        let path = NodeIndex::sibling_path(3, U256::from(3u8));
        assert_eq!(
            path,
            vec![
                NodeIndex::leaf(3, U256::from(2u8)),
                NodeIndex::new(3, 1, U256::ZERO),
                NodeIndex::new(3, 2, U256::from(1u8)),
            ]
        );
    }

    #[test]
    fn test_deep_tree_fits() {
        let last = (U256::from(1u8) << 255) - U256::from(1u8);
        let leaf = NodeIndex::leaf(255, last);
        assert_eq!(leaf.as_u256(), U256::MAX);
        assert_eq!(leaf.level(255), Some(0));
        assert_eq!(leaf.position(), Some(last));
    }

    #[test]
    fn test_malformed_indices() {
        let leaf = NodeIndex::leaf(8, U256::from(3u8));
        assert_eq!(leaf.level(4), None);

        assert!(serde_json::from_str::<NodeIndex>("\"0x0\"").is_err());
        assert_eq!(NodeIndex::try_from(U256::ZERO), Err(InvalidNodeIndex));

        let json = serde_json::to_string(&leaf).unwrap();
        let decoded: NodeIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, leaf);
        assert_eq!(decoded.position(), Some(U256::from(3u8)));
    }
}
