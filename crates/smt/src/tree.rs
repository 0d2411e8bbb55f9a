//! Storage-backed append-only sparse Merkle tree

use std::sync::Arc;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::cache::TreeCache;
use crate::error::SmtError;
use crate::field::Fp;
use crate::hasher::TreeHasher;
use crate::node::{NodeIndex, SiblingNode, TreeId, TreeNode};
use crate::proof::{fold_path, MerkleProof};
use crate::store::NodeStore;

/// Minimal state needed to keep appending without re-reading the tree.
///
/// `siblings` is the frontier: the sibling path, leaf first, of the next
/// free position `index`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootSnapshot {
    /// Current root.
    pub root: Fp,
    /// Next free leaf position (number of assigned positions).
    pub index: U256,
    /// Frontier siblings, leaf to root.
    pub siblings: Vec<Fp>,
}

impl RootSnapshot {
    /// Snapshot of a tree with no leaves.
    pub fn empty(hasher: &TreeHasher) -> Self {
        Self {
            root: hasher.empty_root(),
            index: U256::ZERO,
            siblings: (0..hasher.depth()).map(|level| hasher.empty_root_at_level(level)).collect(),
        }
    }

    /// Position of the last assigned leaf, if any.
    pub fn latest_leaf_index(&self) -> Option<U256> {
        self.index.checked_sub(U256::from(1u8))
    }
}

/// Result of an append: the snapshot the tree moves to.
pub type AppendResult = RootSnapshot;

/// An append that has been computed but not yet written or applied.
#[derive(Clone, Debug)]
pub struct PendingAppend {
    base_root: Fp,
    base_index: U256,
    snapshot: RootSnapshot,
    nodes: Vec<TreeNode>,
}

impl PendingAppend {
    /// State after the append.
    pub const fn snapshot(&self) -> &RootSnapshot {
        &self.snapshot
    }

    /// Node writes the append will issue.
    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    /// Leaf positions consumed by the append.
    pub fn appended(&self) -> U256 {
        self.snapshot.index - self.base_index
    }

    /// Drop the writes and keep the resulting snapshot.
    pub fn into_snapshot(self) -> RootSnapshot {
        self.snapshot
    }
}

/// Contiguous run of freshly computed nodes on one level.
#[derive(Debug)]
struct Row {
    first: U256,
    values: Vec<Fp>,
}

impl Row {
    fn get(&self, position: U256) -> Option<Fp> {
        let offset = position.checked_sub(self.first)?;
        usize::try_from(offset).ok().and_then(|i| self.values.get(i).copied())
    }
}

/// Siblings just outside an append range, one optional value per level.
#[derive(Debug)]
struct Boundary {
    left: Vec<Option<Fp>>,
    right: Vec<Option<Fp>>,
}

/// Fixed-depth append-only sparse Merkle tree.
#[derive(Debug)]
pub struct MerkleTree {
    id: TreeId,
    hasher: TreeHasher,
    store: Arc<dyn NodeStore>,
    cache: Arc<TreeCache>,
    state: RootSnapshot,
}

impl MerkleTree {
    /// Empty tree. Nothing is written until the first append.
    pub fn new(
        id: TreeId,
        hasher: TreeHasher,
        store: Arc<dyn NodeStore>,
        cache: Arc<TreeCache>,
    ) -> Self {
        let state = RootSnapshot::empty(&hasher);
        Self {
            id,
            hasher,
            store,
            cache,
            state,
        }
    }

    /// Restore a tree with `index` assigned positions from stored nodes.
    pub async fn load(
        id: TreeId,
        hasher: TreeHasher,
        store: Arc<dyn NodeStore>,
        cache: Arc<TreeCache>,
        index: U256,
    ) -> Result<Self, SmtError> {
        let depth = hasher.depth();
        if index > U256::from(1u8) << depth {
            return Err(SmtError::LeafIndexOutOfRange { index, depth });
        }

        let mut wanted = vec![NodeIndex::ROOT];
        for level in 0..depth {
            let position = index >> level;
            if position.bit(0) {
                wanted.push(NodeIndex::new(depth, level, position - U256::from(1u8)));
            }
        }
        let resolved = cache.resolve_nodes(store.as_ref(), id, &wanted).await?;

        let siblings: Vec<Fp> = (0..depth)
            .map(|level| {
                let position = index >> level;
                if position.bit(0) {
                    let left = NodeIndex::new(depth, level, position - U256::from(1u8));
                    resolved
                        .get(&left)
                        .copied()
                        .unwrap_or_else(|| hasher.empty_root_at_level(level))
                } else {
                    hasher.empty_root_at_level(level)
                }
            })
            .collect();

        // below capacity the frontier alone determines the root
        let derived = if index < U256::from(1u8) << depth {
            Some(fold_path(&hasher, hasher.empty_root_at_level(0), index, &siblings)?)
        } else {
            None
        };
        let root = match (resolved.get(&NodeIndex::ROOT).copied(), derived) {
            (Some(stored), Some(derived)) if stored != derived => {
                return Err(SmtError::NodeConsistency(format!(
                    "tree {id}: stored root {stored} disagrees with the frontier of index {index}"
                )));
            }
            (None, Some(derived)) if derived != hasher.empty_root() => {
                return Err(SmtError::NodeConsistency(format!(
                    "tree {id} has {index} leaves but no stored root"
                )));
            }
            (Some(stored), _) => stored,
            (None, _) => hasher.empty_root(),
        };

        tracing::debug!(target: "grove::tree", tree_id = id, %index, %root, "tree restored");
        Ok(Self {
            id,
            hasher,
            store,
            cache,
            state: RootSnapshot {
                root,
                index,
                siblings,
            },
        })
    }

    /// Identifier in the node store.
    pub const fn id(&self) -> TreeId {
        self.id
    }

    /// Tree depth.
    pub fn depth(&self) -> usize {
        self.hasher.depth()
    }

    /// Hasher and empty table.
    pub const fn hasher(&self) -> &TreeHasher {
        &self.hasher
    }

    /// Current root.
    pub const fn root(&self) -> Fp {
        self.state.root
    }

    /// Next free leaf position.
    pub const fn index(&self) -> U256 {
        self.state.index
    }

    /// Current root-state snapshot.
    pub const fn snapshot(&self) -> &RootSnapshot {
        &self.state
    }

    /// Number of leaf positions, `2^depth`.
    pub fn capacity(&self) -> U256 {
        U256::from(1u8) << self.depth()
    }

    /// Positions still free.
    pub fn remaining_capacity(&self) -> U256 {
        self.capacity() - self.state.index
    }

    /// True once the last position has been assigned.
    pub fn is_full(&self) -> bool {
        self.state.index == self.capacity()
    }

    fn check_capacity(&self, requested: U256) -> Result<(), SmtError> {
        let remaining = self.remaining_capacity();
        if requested > remaining {
            return Err(SmtError::CapacityExceeded {
                requested,
                remaining,
            });
        }
        Ok(())
    }

    /// State the tree would reach after appending `items`. Writes nothing.
    pub async fn dry_append(&self, items: &[Fp]) -> Result<AppendResult, SmtError> {
        Ok(self.prepare_append(items).await?.into_snapshot())
    }

    /// Append `items`, persist the new nodes and advance the tree.
    ///
    /// If persisting fails the tree keeps its previous state.
    pub async fn append(&mut self, items: &[Fp]) -> Result<AppendResult, SmtError> {
        let pending = self.prepare_append(items).await?;
        self.persist(&pending).await?;
        let snapshot = self.apply(pending)?.clone();
        tracing::debug!(
            target: "grove::tree",
            tree_id = self.id,
            count = items.len(),
            index = %snapshot.index,
            root = %snapshot.root,
            "leaves appended"
        );
        Ok(snapshot)
    }

    /// Compute the nodes and resulting snapshot of appending `items`.
    pub async fn prepare_append(&self, items: &[Fp]) -> Result<PendingAppend, SmtError> {
        let count = U256::from(items.len());
        self.check_capacity(count)?;
        if items.is_empty() {
            return Ok(self.unchanged());
        }

        let depth = self.depth();
        let start = self.state.index;
        let end = start + count;
        let boundary = self.resolve_boundary(start, end - U256::from(1u8)).await?;

        let mut rows = Vec::with_capacity(depth + 1);
        let mut row = Row {
            first: start,
            values: items.to_vec(),
        };
        for level in 0..depth {
            let next = self.fold_row(&row, boundary.left[level], boundary.right[level])?;
            rows.push(row);
            row = next;
        }
        rows.push(row);
        self.finish(end, rows)
    }

    /// Root after appending `leaves` as one `2^sub_tree_depth` sub-tree.
    ///
    /// `sub_tree_siblings` are the siblings above the sub-tree boundary, leaf
    /// to root. A partial sub-tree is padded with empty leaves and the whole
    /// slot is consumed.
    pub async fn append_sub_tree(
        &mut self,
        sub_tree_depth: usize,
        leaves: &[Fp],
        sub_tree_siblings: &[Fp],
    ) -> Result<Fp, SmtError> {
        let pending = self
            .prepare_sub_tree_append(sub_tree_depth, leaves, sub_tree_siblings)
            .await?;
        self.persist(&pending).await?;
        let root = self.apply(pending)?.root;
        tracing::debug!(
            target: "grove::tree",
            tree_id = self.id,
            sub_tree_depth,
            count = leaves.len(),
            index = %self.state.index,
            %root,
            "sub-tree appended"
        );
        Ok(root)
    }

    /// Speculative form of [`append_sub_tree`](Self::append_sub_tree).
    pub async fn dry_append_sub_tree(
        &self,
        sub_tree_depth: usize,
        leaves: &[Fp],
        sub_tree_siblings: &[Fp],
    ) -> Result<AppendResult, SmtError> {
        Ok(self
            .prepare_sub_tree_append(sub_tree_depth, leaves, sub_tree_siblings)
            .await?
            .into_snapshot())
    }

    /// Compute a sub-tree append without writing it.
    pub async fn prepare_sub_tree_append(
        &self,
        sub_tree_depth: usize,
        leaves: &[Fp],
        sub_tree_siblings: &[Fp],
    ) -> Result<PendingAppend, SmtError> {
        let depth = self.depth();
        if sub_tree_depth > depth {
            return Err(SmtError::InvalidSubTree(format!(
                "sub-tree depth {sub_tree_depth} exceeds tree depth {depth}"
            )));
        }
        let slot = U256::from(1u8) << sub_tree_depth;
        if leaves.is_empty() || U256::from(leaves.len()) > slot {
            return Err(SmtError::InvalidSubTree(format!(
                "{} leaves do not fit a sub-tree of depth {sub_tree_depth}",
                leaves.len()
            )));
        }
        let start = self.state.index;
        if !(start & (slot - U256::from(1u8))).is_zero() {
            return Err(SmtError::InvalidSubTree(format!(
                "next index {start} is not aligned to {slot}"
            )));
        }
        self.check_capacity(slot)?;
        if sub_tree_siblings.len() != depth - sub_tree_depth {
            return Err(SmtError::InvalidSubTree(format!(
                "expected {} sub-tree siblings, got {}",
                depth - sub_tree_depth,
                sub_tree_siblings.len()
            )));
        }
        for (offset, sibling) in sub_tree_siblings.iter().enumerate() {
            let level = sub_tree_depth + offset;
            if *sibling != self.state.siblings[level] {
                return Err(SmtError::NodeConsistency(format!(
                    "tree {}: supplied sibling at level {level} disagrees with the frontier",
                    self.id
                )));
            }
        }

        let end = start + slot;
        self.resolve_boundary(start, end - U256::from(1u8)).await?;

        let mut rows = Vec::with_capacity(depth + 1);
        let mut row = Row {
            first: start,
            values: leaves.to_vec(),
        };
        for level in 0..depth {
            let next = if level < sub_tree_depth {
                let padding = self.hasher.empty_root_at_level(level);
                self.fold_row(&row, None, Some(padding))?
            } else {
                let sibling = sub_tree_siblings[level - sub_tree_depth];
                self.fold_row(&row, Some(sibling), Some(sibling))?
            };
            rows.push(row);
            row = next;
        }
        rows.push(row);
        self.finish(end, rows)
    }

    /// Write a prepared append through the store, then into the cache.
    pub async fn persist(&self, pending: &PendingAppend) -> Result<(), SmtError> {
        if pending.nodes.is_empty() {
            return Ok(());
        }
        self.store.upsert(pending.nodes.clone()).await?;
        self.cache.cache_nodes(&pending.nodes).await;
        Ok(())
    }

    /// Advance the in-memory state to a persisted append.
    pub fn apply(&mut self, pending: PendingAppend) -> Result<&RootSnapshot, SmtError> {
        if pending.base_index != self.state.index || pending.base_root != self.state.root {
            return Err(SmtError::NodeConsistency(format!(
                "tree {}: append was prepared at index {}, tree is at {}",
                self.id, pending.base_index, self.state.index
            )));
        }
        self.state = pending.snapshot;
        Ok(&self.state)
    }

    /// Proof for the leaf at `leaf_index` against the current root.
    pub async fn get_proof(&self, leaf_index: U256) -> Result<MerkleProof, SmtError> {
        let depth = self.depth();
        if leaf_index >= self.capacity() {
            return Err(SmtError::LeafIndexOutOfRange {
                index: leaf_index,
                depth,
            });
        }
        let leaf_node = NodeIndex::leaf(depth, leaf_index);
        let siblings = self
            .cache
            .get_cached_siblings(self.store.as_ref(), self.id, depth, leaf_index)
            .await?;
        let leaf = self
            .cache
            .resolve_nodes(self.store.as_ref(), self.id, &[leaf_node])
            .await?
            .get(&leaf_node)
            .copied()
            .unwrap_or_else(|| self.hasher.empty_root_at_level(0));

        let proof = MerkleProof {
            root: self.state.root,
            index: leaf_index,
            leaf,
            siblings: siblings.iter().map(|sibling| sibling.value(&self.hasher)).collect(),
        };
        let derived = proof.compute_root(&self.hasher)?;
        if derived != self.state.root {
            return Err(SmtError::NodeConsistency(format!(
                "tree {}: proof for leaf {leaf_index} folds to {derived}, expected {}",
                self.id, self.state.root
            )));
        }
        Ok(proof)
    }

    fn unchanged(&self) -> PendingAppend {
        PendingAppend {
            base_root: self.state.root,
            base_index: self.state.index,
            snapshot: self.state.clone(),
            nodes: Vec::new(),
        }
    }

    /// Resolve the siblings bordering `start..=last` through cache and storage.
    ///
    /// Left neighbours must match the frontier and everything right of the
    /// range must still be empty.
    async fn resolve_boundary(&self, start: U256, last: U256) -> Result<Boundary, SmtError> {
        let depth = self.depth();
        let mut left = Vec::new();
        let mut right = Vec::new();
        for level in 0..depth {
            let first = start >> level;
            if first.bit(0) {
                left.push((level, NodeIndex::new(depth, level, first - U256::from(1u8))));
            }
            let tail = last >> level;
            if !tail.bit(0) {
                right.push((level, NodeIndex::new(depth, level, tail + U256::from(1u8))));
            }
        }
        let wanted: Vec<NodeIndex> =
            left.iter().chain(right.iter()).map(|(_, index)| *index).collect();
        let resolved = self.cache.resolve_nodes(self.store.as_ref(), self.id, &wanted).await?;
        let lookup = |level: usize, index: &NodeIndex| match resolved.get(index) {
            Some(value) => SiblingNode::Stored(*value),
            None => SiblingNode::ImplicitEmpty(level),
        };

        let mut boundary = Boundary {
            left: vec![None; depth],
            right: vec![None; depth],
        };
        for (level, index) in &left {
            let value = lookup(*level, index).value(&self.hasher);
            if value != self.state.siblings[*level] {
                return Err(SmtError::NodeConsistency(format!(
                    "tree {}: sibling {index} at level {level} disagrees with the frontier",
                    self.id
                )));
            }
            boundary.left[*level] = Some(value);
        }
        for (level, index) in &right {
            let sibling = lookup(*level, index);
            if let SiblingNode::Stored(value) = sibling {
                return Err(SmtError::NodeConsistency(format!(
                    "tree {}: node {index} beyond the frontier holds {value}",
                    self.id
                )));
            }
            boundary.right[*level] = Some(sibling.value(&self.hasher));
        }
        Ok(boundary)
    }

    /// Hash one level of fresh nodes into the level above.
    fn fold_row(&self, row: &Row, left: Option<Fp>, right: Option<Fp>) -> Result<Row, SmtError> {
        let mut first = row.first;
        let mut padded = Vec::with_capacity(row.values.len() + 2);
        if first.bit(0) {
            let left = left.ok_or_else(|| {
                SmtError::NodeConsistency(format!("tree {}: missing left sibling", self.id))
            })?;
            padded.push(left);
            first -= U256::from(1u8);
        }
        padded.extend_from_slice(&row.values);
        if padded.len() % 2 == 1 {
            let right = right.ok_or_else(|| {
                SmtError::NodeConsistency(format!("tree {}: missing right sibling", self.id))
            })?;
            padded.push(right);
        }
        let values = padded
            .chunks_exact(2)
            .map(|pair| self.hasher.parent(&pair[0], &pair[1]))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Row {
            first: first >> 1,
            values,
        })
    }

    /// Turn computed rows into node writes and the next snapshot.
    fn finish(&self, end: U256, rows: Vec<Row>) -> Result<PendingAppend, SmtError> {
        let depth = self.depth();
        let root = rows
            .get(depth)
            .and_then(|row| row.values.first().copied())
            .ok_or_else(|| {
                SmtError::NodeConsistency(format!("tree {}: fold did not reach the root", self.id))
            })?;

        let siblings = (0..depth)
            .map(|level| {
                let position = end >> level;
                if position.bit(0) {
                    // the left neighbour is either fresh or already on the old frontier
                    rows[level]
                        .get(position - U256::from(1u8))
                        .unwrap_or(self.state.siblings[level])
                } else {
                    self.hasher.empty_root_at_level(level)
                }
            })
            .collect();

        // a node equal to its level's empty root stays implicit
        let nodes = rows
            .iter()
            .enumerate()
            .flat_map(|(level, row)| {
                let empty = self.hasher.empty_root_at_level(level);
                row.values
                    .iter()
                    .enumerate()
                    .filter(move |(_, value)| **value != empty)
                    .map(move |(offset, value)| TreeNode {
                        tree_id: self.id,
                        node_index: NodeIndex::new(depth, level, row.first + U256::from(offset)),
                        value: *value,
                    })
            })
            .collect();

        Ok(PendingAppend {
            base_root: self.state.root,
            base_index: self.state.index,
            snapshot: RootSnapshot {
                root,
                index: end,
                siblings,
            },
            nodes,
        })
    }
}
