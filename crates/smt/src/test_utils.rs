//! Shared helpers for unit tests

use std::sync::Arc;

use alloy_primitives::U256;
use async_trait::async_trait;

use crate::error::{SmtError, StoreError};
use crate::field::Fp;
use crate::hasher::{Hasher, KeccakHasher, TreeHasher};
use crate::node::{NodeIndex, TreeId, TreeNode};
use crate::store::NodeStore;

/// `parent(a, b) = (a + b) mod 97`, small enough to check by hand.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ToyHasher;

impl Hasher for ToyHasher {
    fn name(&self) -> &'static str {
        "toy-add-mod-97"
    }

    fn parent(&self, left: &Fp, right: &Fp) -> Result<Fp, SmtError> {
        let sum = left.as_u256() + right.as_u256();
        Ok(Fp::reduce(sum % U256::from(97u8)))
    }
}

pub(crate) fn toy_hasher(depth: usize) -> TreeHasher {
    TreeHasher::new(Arc::new(ToyHasher), depth).unwrap()
}

pub(crate) fn keccak_hasher(depth: usize) -> TreeHasher {
    TreeHasher::new(Arc::new(KeccakHasher), depth).unwrap()
}

/// Bottom-up fold of a fully materialized leaf row.
pub(crate) fn fold_full(hasher: &TreeHasher, leaves: &[Fp]) -> Fp {
    let mut row = leaves.to_vec();
    while row.len() > 1 {
        row = row.chunks_exact(2).map(|pair| hasher.parent(&pair[0], &pair[1]).unwrap()).collect();
    }
    row[0]
}

pub(crate) fn fps(values: &[u64]) -> Vec<Fp> {
    values.iter().map(|v| Fp::from(*v)).collect()
}

/// Store whose writes always fail; reads see an empty tree.
#[derive(Debug, Default)]
pub(crate) struct FailingNodeStore;

#[async_trait]
impl NodeStore for FailingNodeStore {
    async fn find_many(
        &self,
        _tree_id: TreeId,
        _indices: &[NodeIndex],
    ) -> Result<Vec<TreeNode>, StoreError> {
        Ok(Vec::new())
    }

    async fn upsert(&self, _nodes: Vec<TreeNode>) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".to_string()))
    }
}
