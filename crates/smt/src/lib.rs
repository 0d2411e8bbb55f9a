//! Append-only sparse Merkle trees for rollup state commitments
//!
//! Trees are fixed-depth and storage-backed. Only nodes that differ from the
//! precomputed empty subtree of their level are ever written, so a depth-254
//! tree costs no more to keep than the leaves actually appended.
//! Key features:
//! - Speculative appends: compute the next root without writing
//! - Batched sub-tree appends with zero padding
//! - Provisional node cache for reads inside one uncommitted round
//! - Proof siblings as canonical BN254 field elements

mod cache;
mod error;
mod field;
mod hasher;
mod node;
mod nullifier;
mod proof;
mod store;
mod tree;

#[cfg(test)]
pub(crate) mod test_utils;

pub use alloy_primitives::U256;
pub use cache::TreeCache;
pub use error::{SmtError, StoreError};
pub use field::{FieldError, Fp, MODULUS};
pub use hasher::{EmptyRoots, Hasher, KeccakHasher, PoseidonHasher, TreeHasher};
pub use node::{InvalidNodeIndex, NodeIndex, SiblingNode, TreeId, TreeNode};
pub use nullifier::{NullifierTree, PendingSpend, SPENT};
pub use proof::{fold_path, MerkleProof};
pub use store::{DeferredNodeStore, MemoryNodeStore, NodeStore};
pub use tree::{AppendResult, MerkleTree, PendingAppend, RootSnapshot};

/// Deepest supported tree.
pub const MAX_DEPTH: usize = 255;

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_utils::{fold_full, fps, toy_hasher};

    #[tokio::test]
    async fn test_toy_tree_end_to_end() {
        let hasher = toy_hasher(3);
        let store = Arc::new(MemoryNodeStore::new());
        let cache = Arc::new(TreeCache::new());
        let mut tree = MerkleTree::new(1, hasher.clone(), store.clone(), cache);

        let result = tree.append(&fps(&[5, 7])).await.unwrap();
        assert_eq!(result.root, fold_full(&hasher, &fps(&[5, 7, 0, 0, 0, 0, 0, 0])));

        let proof = tree.get_proof(U256::from(1u8)).await.unwrap();
        assert_eq!(proof.siblings, fps(&[5, 0, 0]));
        assert!(proof.verify(&hasher).unwrap());

        // the stored root sits at node index 1
        assert_eq!(store.get(1, NodeIndex::ROOT).await, Some(result.root));
    }

    #[test]
    fn test_snapshot_serializes_as_hex() {
        let hasher = toy_hasher(2);
        let snapshot = RootSnapshot::empty(&hasher);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["root"].as_str().unwrap().starts_with("0x"));
        assert_eq!(json["siblings"].as_array().unwrap().len(), 2);
        let back: RootSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot);
    }
}
