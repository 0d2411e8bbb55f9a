//! Key-addressed node storage
//!
//! The tree engine only needs two primitives from its persistence layer:
//! fetch a set of nodes of one tree, and upsert a set of nodes. Both run
//! inside whatever transaction scope the caller has opened; the engine never
//! opens or commits transactions itself.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::error::StoreError;
use crate::field::Fp;
use crate::node::{NodeIndex, TreeId, TreeNode};

/// Persistence contract of the tree engine.
///
/// A node missing from the store stands for an empty subtree; empty
/// constants are never written.
#[async_trait]
pub trait NodeStore: fmt::Debug + Send + Sync {
    /// Fetch the nodes of `tree_id` that exist among `indices`.
    async fn find_many(
        &self,
        tree_id: TreeId,
        indices: &[NodeIndex],
    ) -> Result<Vec<TreeNode>, StoreError>;

    /// Insert or overwrite `nodes` atomically.
    async fn upsert(&self, nodes: Vec<TreeNode>) -> Result<(), StoreError>;
}

/// Durable-on-write in-memory store.
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: RwLock<HashMap<(TreeId, NodeIndex), Fp>>,
}

impl MemoryNodeStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored nodes across all trees.
    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// True when nothing has been stored.
    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// Direct lookup of a single node.
    pub async fn get(&self, tree_id: TreeId, index: NodeIndex) -> Option<Fp> {
        self.nodes.read().await.get(&(tree_id, index)).copied()
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn find_many(
        &self,
        tree_id: TreeId,
        indices: &[NodeIndex],
    ) -> Result<Vec<TreeNode>, StoreError> {
        let nodes = self.nodes.read().await;
        Ok(indices
            .iter()
            .filter_map(|index| {
                nodes.get(&(tree_id, *index)).map(|value| TreeNode {
                    tree_id,
                    node_index: *index,
                    value: *value,
                })
            })
            .collect())
    }

    async fn upsert(&self, nodes: Vec<TreeNode>) -> Result<(), StoreError> {
        let mut stored = self.nodes.write().await;
        for node in nodes {
            stored.insert((node.tree_id, node.node_index), node.value);
        }
        Ok(())
    }
}

/// Write buffer standing in for a caller-managed storage transaction.
///
/// Upserts are held back until [`commit`](Self::commit); reads only see what
/// the inner store has committed. Within one processing round this is exactly
/// the stale-read situation [`TreeCache`](crate::TreeCache) exists for.
#[derive(Debug)]
pub struct DeferredNodeStore<S> {
    inner: S,
    pending: Mutex<Vec<TreeNode>>,
}

impl<S: NodeStore> DeferredNodeStore<S> {
    /// Wrap `inner`
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// The committed store.
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    /// Number of buffered node writes.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Flush every buffered write to the inner store in one upsert.
    ///
    /// The buffer is only cleared once the inner store accepted it, so a
    /// failed commit can be retried.
    pub async fn commit(&self) -> Result<usize, StoreError> {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        if count > 0 {
            self.inner.upsert(pending.clone()).await?;
            pending.clear();
        }
        tracing::debug!(target: "grove::store", count, "node writes committed");
        Ok(count)
    }

    /// Drop every buffered write.
    pub async fn rollback(&self) {
        let mut pending = self.pending.lock().await;
        tracing::debug!(target: "grove::store", count = pending.len(), "node writes rolled back");
        pending.clear();
    }
}

#[async_trait]
impl<S: NodeStore> NodeStore for DeferredNodeStore<S> {
    async fn find_many(
        &self,
        tree_id: TreeId,
        indices: &[NodeIndex],
    ) -> Result<Vec<TreeNode>, StoreError> {
        self.inner.find_many(tree_id, indices).await
    }

    async fn upsert(&self, nodes: Vec<TreeNode>) -> Result<(), StoreError> {
        self.pending.lock().await.extend(nodes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FailingNodeStore;
    use alloy_primitives::U256;

    fn node(tree_id: TreeId, position: u64, value: u64) -> TreeNode {
        TreeNode {
            tree_id,
            node_index: NodeIndex::leaf(4, U256::from(position)),
            value: Fp::from(value),
        }
    }

    #[tokio::test]
    async fn test_memory_store_scopes_by_tree() {
        let store = MemoryNodeStore::new();
        store.upsert(vec![node(1, 0, 10), node(2, 0, 20)]).await.unwrap();

        let wanted = [node(1, 0, 0).node_index, node(1, 1, 0).node_index];
        let found = store.find_many(1, &wanted).await.unwrap();
        assert_eq!(found, vec![node(1, 0, 10)]);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let store = MemoryNodeStore::new();
        store.upsert(vec![node(1, 3, 1)]).await.unwrap();
        store.upsert(vec![node(1, 3, 2)]).await.unwrap();
        assert_eq!(store.get(1, node(1, 3, 0).node_index).await, Some(Fp::from(2)));
    }

    #[tokio::test]
    async fn test_deferred_store_hides_uncommitted_writes() {
        let store = DeferredNodeStore::new(MemoryNodeStore::new());
        store.upsert(vec![node(1, 0, 5)]).await.unwrap();

        assert!(store.find_many(1, &[node(1, 0, 0).node_index]).await.unwrap().is_empty());
        assert_eq!(store.pending_len().await, 1);

        assert_eq!(store.commit().await.unwrap(), 1);
        assert_eq!(
            store.find_many(1, &[node(1, 0, 0).node_index]).await.unwrap(),
            vec![node(1, 0, 5)]
        );
    }

    #[tokio::test]
    async fn test_deferred_store_keeps_writes_after_failed_commit() {
        let store = DeferredNodeStore::new(FailingNodeStore);
        store.upsert(vec![node(1, 0, 5), node(1, 1, 6)]).await.unwrap();

        assert!(matches!(store.commit().await, Err(StoreError::Unavailable(_))));
        assert_eq!(store.pending_len().await, 2);
        assert!(store.commit().await.is_err());
        assert_eq!(store.pending_len().await, 2);

        store.rollback().await;
        assert_eq!(store.commit().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deferred_store_rollback() {
        let store = DeferredNodeStore::new(MemoryNodeStore::new());
        store.upsert(vec![node(1, 0, 5)]).await.unwrap();
        store.rollback().await;
        assert_eq!(store.commit().await.unwrap(), 0);
        assert!(store.inner().is_empty().await);
    }
}
