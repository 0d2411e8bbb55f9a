//! Merkle path proofs

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::error::SmtError;
use crate::field::Fp;
use crate::hasher::TreeHasher;

/// Inclusion (or, for an empty leaf, non-inclusion) proof.
///
/// `siblings` are canonical field elements ordered leaf to root, ready to be
/// used as circuit witnesses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Root the proof was taken against.
    pub root: Fp,
    /// Leaf position.
    pub index: U256,
    /// Leaf value.
    pub leaf: Fp,
    /// Sibling hashes from leaf to root.
    pub siblings: Vec<Fp>,
}

impl MerkleProof {
    /// Fold the leaf up through the siblings.
    pub fn compute_root(&self, hasher: &TreeHasher) -> Result<Fp, SmtError> {
        fold_path(hasher, self.leaf, self.index, &self.siblings)
    }

    /// True when the proof has the tree's depth and folds to `root`.
    pub fn verify(&self, hasher: &TreeHasher) -> Result<bool, SmtError> {
        if self.siblings.len() != hasher.depth() {
            return Ok(false);
        }
        Ok(self.compute_root(hasher)? == self.root)
    }
}

/// Fold `leaf` at `index` up through `siblings` (leaf first).
pub fn fold_path(
    hasher: &TreeHasher,
    leaf: Fp,
    index: U256,
    siblings: &[Fp],
) -> Result<Fp, SmtError> {
    let mut current = leaf;
    for (level, sibling) in siblings.iter().enumerate() {
        current = if index.bit(level) {
            hasher.parent(sibling, &current)?
        } else {
            hasher.parent(&current, sibling)?
        };
    }
    Ok(current)
}
