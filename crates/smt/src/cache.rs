//! Overlay of provisional node values
//!
//! One round of block processing issues many dependent reads and writes
//! before the storage transaction commits. The cache makes those writes
//! visible to later reads in the same round. It is never a substitute for
//! durable storage: clear it when a round aborts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use alloy_primitives::U256;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::field::Fp;
use crate::node::{NodeIndex, SiblingNode, TreeId, TreeNode};
use crate::store::NodeStore;

/// Node overlay keyed by `(tree_id, node_index)`. Disabled by default.
#[derive(Debug, Default)]
pub struct TreeCache {
    enabled: AtomicBool,
    nodes: RwLock<HashMap<(TreeId, NodeIndex), Fp>>,
}

impl TreeCache {
    /// Create a disabled, empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether writes are currently recorded.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Start recording provisional writes.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
        tracing::debug!(target: "grove::cache", "tree cache enabled");
    }

    /// Stop recording and drop everything; reads fall through to storage.
    pub async fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        self.clear().await;
        tracing::debug!(target: "grove::cache", "tree cache disabled");
    }

    /// Drop every cached node.
    pub async fn clear(&self) {
        self.nodes.write().await.clear();
    }

    /// Number of cached nodes.
    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// True when nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// Record a provisional value. Ignored while disabled.
    pub async fn cache_node(&self, tree_id: TreeId, node_index: NodeIndex, value: Fp) {
        if self.is_enabled() {
            self.nodes.write().await.insert((tree_id, node_index), value);
        }
    }

    /// Record a batch of provisional values. Ignored while disabled.
    pub async fn cache_nodes(&self, nodes: &[TreeNode]) {
        if !self.is_enabled() {
            return;
        }
        let mut cached = self.nodes.write().await;
        for node in nodes {
            cached.insert((node.tree_id, node.node_index), node.value);
        }
    }

    /// Cached value of one node.
    pub async fn get_node(&self, tree_id: TreeId, node_index: NodeIndex) -> Option<Fp> {
        if !self.is_enabled() {
            return None;
        }
        self.nodes.read().await.get(&(tree_id, node_index)).copied()
    }

    /// Values of `indices`, cache first, then a single store lookup for the misses.
    ///
    /// Indices found in neither are absent from the result.
    pub async fn resolve_nodes(
        &self,
        store: &dyn NodeStore,
        tree_id: TreeId,
        indices: &[NodeIndex],
    ) -> Result<HashMap<NodeIndex, Fp>, StoreError> {
        let mut resolved = HashMap::with_capacity(indices.len());
        let mut misses = Vec::new();
        {
            let enabled = self.is_enabled();
            let cached = self.nodes.read().await;
            for index in indices {
                match cached.get(&(tree_id, *index)) {
                    Some(value) if enabled => {
                        resolved.insert(*index, *value);
                    }
                    _ => misses.push(*index),
                }
            }
        }
        if !misses.is_empty() {
            for node in store.find_many(tree_id, &misses).await? {
                resolved.insert(node.node_index, node.value);
            }
        }
        Ok(resolved)
    }

    /// Sibling path of `leaf_index`, leaf first, resolved through the cache
    /// and then storage. Nodes found in neither are implicit empty subtrees.
    pub async fn get_cached_siblings(
        &self,
        store: &dyn NodeStore,
        tree_id: TreeId,
        depth: usize,
        leaf_index: U256,
    ) -> Result<Vec<SiblingNode>, StoreError> {
        let path = NodeIndex::sibling_path(depth, leaf_index);
        let resolved = self.resolve_nodes(store, tree_id, &path).await?;
        Ok(path
            .iter()
            .enumerate()
            .map(|(level, index)| match resolved.get(index) {
                Some(value) => SiblingNode::Stored(*value),
                None => SiblingNode::ImplicitEmpty(level),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DeferredNodeStore, MemoryNodeStore};

    fn leaf(depth: usize, position: u64) -> NodeIndex {
        NodeIndex::leaf(depth, U256::from(position))
    }

    #[tokio::test]
    async fn test_disabled_by_default() {
        let cache = TreeCache::new();
        cache.cache_node(1, leaf(3, 0), Fp::from(9)).await;
        assert!(!cache.is_enabled());
        assert!(cache.is_empty().await);
        assert_eq!(cache.get_node(1, leaf(3, 0)).await, None);
    }

    #[tokio::test]
    async fn test_cache_preferred_over_store() {
        let store = MemoryNodeStore::new();
        store
            .upsert(vec![
                TreeNode {
                    tree_id: 1,
                    node_index: leaf(3, 0),
                    value: Fp::from(1),
                },
                TreeNode {
                    tree_id: 1,
                    node_index: leaf(3, 1),
                    value: Fp::from(2),
                },
            ])
            .await
            .unwrap();
        let cache = TreeCache::new();
        cache.enable();
        cache.cache_node(1, leaf(3, 0), Fp::from(100)).await;

        let resolved = cache
            .resolve_nodes(&store, 1, &[leaf(3, 0), leaf(3, 1), leaf(3, 2)])
            .await
            .unwrap();
        assert_eq!(resolved.get(&leaf(3, 0)), Some(&Fp::from(100)));
        assert_eq!(resolved.get(&leaf(3, 1)), Some(&Fp::from(2)));
        assert_eq!(resolved.get(&leaf(3, 2)), None);
    }

    #[tokio::test]
    async fn test_siblings_see_uncommitted_write() {
        let store = DeferredNodeStore::new(MemoryNodeStore::new());
        let written = TreeNode {
            tree_id: 7,
            node_index: leaf(3, 2),
            value: Fp::from(42),
        };
        store.upsert(vec![written]).await.unwrap();

        let cache = TreeCache::new();
        let siblings = cache.get_cached_siblings(&store, 7, 3, U256::from(3u8)).await.unwrap();
        assert_eq!(siblings[0], SiblingNode::ImplicitEmpty(0));

        cache.enable();
        cache.cache_nodes(&[written]).await;
        let siblings = cache.get_cached_siblings(&store, 7, 3, U256::from(3u8)).await.unwrap();
        assert_eq!(siblings[0], SiblingNode::Stored(Fp::from(42)));
        assert_eq!(siblings[1], SiblingNode::ImplicitEmpty(1));
        assert_eq!(siblings[2], SiblingNode::ImplicitEmpty(2));
    }

    #[tokio::test]
    async fn test_disable_falls_through_to_storage() {
        let store = MemoryNodeStore::new();
        let cache = TreeCache::new();
        cache.enable();
        cache.cache_node(1, leaf(3, 0), Fp::from(5)).await;
        cache.disable().await;

        assert!(cache.is_empty().await);
        let resolved = cache.resolve_nodes(&store, 1, &[leaf(3, 0)]).await.unwrap();
        assert!(resolved.is_empty());
    }

    #[tokio::test]
    async fn test_clear_keeps_enabled() {
        let cache = TreeCache::new();
        cache.enable();
        cache.cache_node(1, leaf(3, 0), Fp::from(5)).await;
        cache.clear().await;
        assert!(cache.is_enabled());
        assert_eq!(cache.get_node(1, leaf(3, 0)).await, None);
    }
}
