//! Spent-set tree: the nullifier value is the leaf position it marks spent

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::U256;

use crate::cache::TreeCache;
use crate::error::SmtError;
use crate::field::Fp;
use crate::hasher::TreeHasher;
use crate::node::{NodeIndex, TreeId, TreeNode};
use crate::proof::{fold_path, MerkleProof};
use crate::store::NodeStore;

/// Leaf value of a spent nullifier.
pub const SPENT: Fp = Fp::ONE;

/// A batch of spends computed but not yet written.
#[derive(Clone, Debug)]
pub struct PendingSpend {
    base_root: Fp,
    root: Fp,
    count: usize,
    nodes: Vec<TreeNode>,
}

impl PendingSpend {
    /// Root after the batch.
    pub const fn root(&self) -> Fp {
        self.root
    }

    /// Number of nullifiers in the batch.
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Node writes the batch will issue.
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }
}

/// Sparse indicator set over `2^depth` positions.
#[derive(Debug)]
pub struct NullifierTree {
    id: TreeId,
    hasher: TreeHasher,
    store: Arc<dyn NodeStore>,
    cache: Arc<TreeCache>,
    root: Fp,
    spent: U256,
}

impl NullifierTree {
    /// Empty set.
    pub fn new(
        id: TreeId,
        hasher: TreeHasher,
        store: Arc<dyn NodeStore>,
        cache: Arc<TreeCache>,
    ) -> Self {
        let root = hasher.empty_root();
        Self {
            id,
            hasher,
            store,
            cache,
            root,
            spent: U256::ZERO,
        }
    }

    /// Restore a set holding `spent` nullifiers from stored nodes.
    pub async fn load(
        id: TreeId,
        hasher: TreeHasher,
        store: Arc<dyn NodeStore>,
        cache: Arc<TreeCache>,
        spent: U256,
    ) -> Result<Self, SmtError> {
        let resolved = cache.resolve_nodes(store.as_ref(), id, &[NodeIndex::ROOT]).await?;
        let root = match resolved.get(&NodeIndex::ROOT) {
            Some(root) => *root,
            None if spent.is_zero() => hasher.empty_root(),
            None => {
                return Err(SmtError::NodeConsistency(format!(
                    "nullifier tree {id} has {spent} spends but no stored root"
                )));
            }
        };
        Ok(Self {
            id,
            hasher,
            store,
            cache,
            root,
            spent,
        })
    }

    /// Identifier in the node store.
    pub const fn id(&self) -> TreeId {
        self.id
    }

    /// Current root.
    pub const fn root(&self) -> Fp {
        self.root
    }

    /// Tree depth.
    pub fn depth(&self) -> usize {
        self.hasher.depth()
    }

    /// Hasher and empty table.
    pub const fn hasher(&self) -> &TreeHasher {
        &self.hasher
    }

    /// Number of spent nullifiers.
    pub const fn spent_count(&self) -> U256 {
        self.spent
    }

    /// Positions never spent.
    pub fn remaining_capacity(&self) -> U256 {
        (U256::from(1u8) << self.depth()) - self.spent
    }

    /// Leaf position of `nullifier`.
    pub fn index_of(&self, nullifier: &Fp) -> Result<U256, SmtError> {
        let index = nullifier.as_u256();
        let depth = self.depth();
        if index >= U256::from(1u8) << depth {
            return Err(SmtError::LeafIndexOutOfRange { index, depth });
        }
        Ok(index)
    }

    /// Whether `nullifier` has been marked spent.
    pub async fn is_spent(&self, nullifier: &Fp) -> Result<bool, SmtError> {
        let leaf = NodeIndex::leaf(self.depth(), self.index_of(nullifier)?);
        let resolved = self.cache.resolve_nodes(self.store.as_ref(), self.id, &[leaf]).await?;
        Ok(resolved.get(&leaf) == Some(&SPENT))
    }

    /// Membership (spent) or non-membership proof for `nullifier`.
    pub async fn get_proof(&self, nullifier: &Fp) -> Result<MerkleProof, SmtError> {
        let depth = self.depth();
        let index = self.index_of(nullifier)?;
        let leaf_node = NodeIndex::leaf(depth, index);
        let siblings = self
            .cache
            .get_cached_siblings(self.store.as_ref(), self.id, depth, index)
            .await?;
        let leaf = self
            .cache
            .resolve_nodes(self.store.as_ref(), self.id, &[leaf_node])
            .await?
            .get(&leaf_node)
            .copied()
            .unwrap_or_else(|| self.hasher.empty_root_at_level(0));

        let proof = MerkleProof {
            root: self.root,
            index,
            leaf,
            siblings: siblings.iter().map(|sibling| sibling.value(&self.hasher)).collect(),
        };
        if proof.compute_root(&self.hasher)? != self.root {
            return Err(SmtError::NodeConsistency(format!(
                "nullifier tree {}: proof for {nullifier} does not reproduce the root",
                self.id
            )));
        }
        Ok(proof)
    }

    /// Root after spending `nullifiers`. Writes nothing.
    pub async fn dry_mark_spent(&self, nullifiers: &[Fp]) -> Result<Fp, SmtError> {
        Ok(self.prepare_mark_spent(nullifiers).await?.root)
    }

    /// Mark one nullifier spent and return the new root.
    pub async fn mark_spent(&mut self, nullifier: Fp) -> Result<Fp, SmtError> {
        self.mark_spent_batch(&[nullifier]).await
    }

    /// Mark every nullifier spent, all or nothing.
    pub async fn mark_spent_batch(&mut self, nullifiers: &[Fp]) -> Result<Fp, SmtError> {
        let pending = self.prepare_mark_spent(nullifiers).await?;
        self.persist(&pending).await?;
        let root = self.apply(pending)?;
        tracing::debug!(
            target: "grove::nullifier",
            tree_id = self.id,
            count = nullifiers.len(),
            spent = %self.spent,
            %root,
            "nullifiers spent"
        );
        Ok(root)
    }

    /// Compute the writes of spending `nullifiers`.
    ///
    /// Each nullifier needs a valid non-membership proof against the running
    /// root, so a duplicate inside the batch fails like an earlier spend.
    pub async fn prepare_mark_spent(&self, nullifiers: &[Fp]) -> Result<PendingSpend, SmtError> {
        let depth = self.depth();
        let empty_leaf = self.hasher.empty_root_at_level(0);
        let mut overlay: HashMap<NodeIndex, Fp> = HashMap::new();
        let mut root = self.root;

        for nullifier in nullifiers {
            let index = self.index_of(nullifier)?;
            let leaf_node = NodeIndex::leaf(depth, index);
            let path = NodeIndex::sibling_path(depth, index);

            let wanted: Vec<NodeIndex> = path
                .iter()
                .chain(std::iter::once(&leaf_node))
                .filter(|node| !overlay.contains_key(*node))
                .copied()
                .collect();
            let resolved = self.cache.resolve_nodes(self.store.as_ref(), self.id, &wanted).await?;
            let value_of = |level: usize, node: &NodeIndex| {
                overlay
                    .get(node)
                    .or_else(|| resolved.get(node))
                    .copied()
                    .unwrap_or_else(|| self.hasher.empty_root_at_level(level))
            };

            let leaf = value_of(0, &leaf_node);
            if leaf == SPENT {
                return Err(SmtError::AlreadySpent(*nullifier));
            }
            if leaf != empty_leaf {
                return Err(SmtError::NodeConsistency(format!(
                    "nullifier tree {}: leaf {index} holds {leaf}",
                    self.id
                )));
            }
            let siblings: Vec<Fp> =
                path.iter().enumerate().map(|(level, node)| value_of(level, node)).collect();
            if fold_path(&self.hasher, leaf, index, &siblings)? != root {
                return Err(SmtError::NodeConsistency(format!(
                    "nullifier tree {}: non-membership proof for {nullifier} misses the root",
                    self.id
                )));
            }

            let mut node = leaf_node;
            let mut value = SPENT;
            overlay.insert(node, value);
            for sibling in &siblings {
                value = if node.is_right() {
                    self.hasher.parent(sibling, &value)?
                } else {
                    self.hasher.parent(&value, sibling)?
                };
                node = node.parent();
                overlay.insert(node, value);
            }
            root = value;
        }

        let nodes = overlay
            .into_iter()
            .map(|(node_index, value)| TreeNode {
                tree_id: self.id,
                node_index,
                value,
            })
            .collect();
        Ok(PendingSpend {
            base_root: self.root,
            root,
            count: nullifiers.len(),
            nodes,
        })
    }

    /// Write a prepared batch through the store, then into the cache.
    pub async fn persist(&self, pending: &PendingSpend) -> Result<(), SmtError> {
        if pending.nodes.is_empty() {
            return Ok(());
        }
        self.store.upsert(pending.nodes.clone()).await?;
        self.cache.cache_nodes(&pending.nodes).await;
        Ok(())
    }

    /// Advance to a persisted batch.
    pub fn apply(&mut self, pending: PendingSpend) -> Result<Fp, SmtError> {
        if pending.base_root != self.root {
            return Err(SmtError::NodeConsistency(format!(
                "nullifier tree {}: spend batch was prepared against a different root",
                self.id
            )));
        }
        self.root = pending.root;
        self.spent += U256::from(pending.count);
        Ok(self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryNodeStore;
    use crate::test_utils::{fold_full, fps, keccak_hasher, toy_hasher, FailingNodeStore};

    fn new_tree(hasher: TreeHasher) -> (NullifierTree, Arc<MemoryNodeStore>) {
        let store = Arc::new(MemoryNodeStore::new());
        let tree = NullifierTree::new(3, hasher, store.clone(), Arc::new(TreeCache::new()));
        (tree, store)
    }

    #[tokio::test]
    async fn test_mark_spent_sets_leaf() {
        let hasher = toy_hasher(3);
        let (mut tree, _) = new_tree(hasher.clone());
        let root = tree.mark_spent(Fp::from(5)).await.unwrap();
        assert_eq!(root, fold_full(&hasher, &fps(&[0, 0, 0, 0, 0, 1, 0, 0])));
        assert!(tree.is_spent(&Fp::from(5)).await.unwrap());
        assert!(!tree.is_spent(&Fp::from(4)).await.unwrap());
        assert_eq!(tree.spent_count(), U256::from(1u8));
        assert_eq!(tree.remaining_capacity(), U256::from(7u8));
    }

    #[tokio::test]
    async fn test_double_spend_rejected() {
        let (mut tree, store) = new_tree(keccak_hasher(16));
        tree.mark_spent(Fp::from(42)).await.unwrap();
        tree.mark_spent(Fp::from(43)).await.unwrap();
        let root = tree.root();
        let stored = store.len().await;

        let err = tree.mark_spent(Fp::from(42)).await.unwrap_err();
        assert!(matches!(err, SmtError::AlreadySpent(n) if n == Fp::from(42)));
        assert_eq!(tree.root(), root);
        assert_eq!(store.len().await, stored);
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let (mut tree, store) = new_tree(keccak_hasher(16));
        let err = tree.mark_spent_batch(&fps(&[1, 2, 1])).await.unwrap_err();
        assert!(matches!(err, SmtError::AlreadySpent(_)));
        assert!(store.is_empty().await);
        assert_eq!(tree.spent_count(), U256::ZERO);

        let batched = tree.mark_spent_batch(&fps(&[1, 2, 9])).await.unwrap();
        let (mut single, _) = new_tree(keccak_hasher(16));
        for n in [1, 2, 9] {
            single.mark_spent(Fp::from(n)).await.unwrap();
        }
        assert_eq!(batched, single.root());
    }

    #[tokio::test]
    async fn test_dry_mark_spent_writes_nothing() {
        let (tree, store) = new_tree(keccak_hasher(16));
        let root = tree.dry_mark_spent(&fps(&[7, 8])).await.unwrap();
        assert_ne!(root, tree.root());
        assert!(store.is_empty().await);
        assert_eq!(tree.root(), tree.hasher().empty_root());
    }

    #[tokio::test]
    async fn test_proofs_for_spent_and_unspent() {
        let hasher = keccak_hasher(20);
        let (mut tree, _) = new_tree(hasher.clone());
        tree.mark_spent_batch(&fps(&[100, 101, 5000])).await.unwrap();

        let spent = tree.get_proof(&Fp::from(101)).await.unwrap();
        assert_eq!(spent.leaf, SPENT);
        assert!(spent.verify(&hasher).unwrap());

        let unspent = tree.get_proof(&Fp::from(102)).await.unwrap();
        assert_eq!(unspent.leaf, Fp::ZERO);
        assert!(unspent.verify(&hasher).unwrap());
    }

    #[tokio::test]
    async fn test_index_out_of_range() {
        let (mut tree, _) = new_tree(keccak_hasher(8));
        let err = tree.mark_spent(Fp::from(256)).await.unwrap_err();
        assert!(matches!(err, SmtError::LeafIndexOutOfRange { depth: 8, .. }));
    }

    #[tokio::test]
    async fn test_full_width_tree_accepts_large_nullifiers() {
        let hasher = keccak_hasher(254);
        let (mut tree, _) = new_tree(hasher.clone());
        let nullifier = Fp::reduce(U256::MAX);
        tree.mark_spent(nullifier).await.unwrap();
        assert!(tree.is_spent(&nullifier).await.unwrap());
        assert!(tree.get_proof(&nullifier).await.unwrap().verify(&hasher).unwrap());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_root() {
        let mut tree = NullifierTree::new(
            3,
            keccak_hasher(16),
            Arc::new(FailingNodeStore),
            Arc::new(TreeCache::new()),
        );
        let err = tree.mark_spent(Fp::from(1)).await.unwrap_err();
        assert!(matches!(err, SmtError::StorageUnavailable(_)));
        assert_eq!(tree.root(), tree.hasher().empty_root());
        assert_eq!(tree.spent_count(), U256::ZERO);
    }

    #[tokio::test]
    async fn test_load_restores_root() {
        let hasher = keccak_hasher(16);
        let (mut tree, store) = new_tree(hasher.clone());
        tree.mark_spent_batch(&fps(&[3, 4])).await.unwrap();

        let cache = Arc::new(TreeCache::new());
        let loaded = NullifierTree::load(3, hasher, store, cache, tree.spent_count())
            .await
            .unwrap();
        assert_eq!(loaded.root(), tree.root());
        assert!(loaded.is_spent(&Fp::from(4)).await.unwrap());
    }
}
