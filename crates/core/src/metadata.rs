//! Per-generation tree metadata

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use grove_smt::{TreeId, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::species::TreeSpecies;

/// Bookkeeping record of one tree generation.
///
/// Leaf indices are global across the generations of a species:
/// `start_leaf_index` is where local leaf 0 sits and `end_leaf_index` is the
/// next global position to assign. For the nullifier tree `end_leaf_index`
/// counts spent nullifiers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMetadata {
    /// Node-store id of the generation
    pub id: TreeId,
    /// Species
    pub species: TreeSpecies,
    /// Generation number, starting at 0
    pub generation: u64,
    /// Tree depth
    pub depth: usize,
    /// First global leaf index
    pub start_leaf_index: U256,
    /// Next global leaf index (exclusive)
    pub end_leaf_index: U256,
}

impl TreeMetadata {
    /// Metadata of a freshly opened, empty generation.
    pub const fn open(
        species: TreeSpecies,
        generation: u64,
        depth: usize,
        start_leaf_index: U256,
    ) -> Self {
        Self {
            id: species.tree_id(generation),
            species,
            generation,
            depth,
            start_leaf_index,
            end_leaf_index: start_leaf_index,
        }
    }

    /// Leaf positions in the generation.
    pub fn capacity(&self) -> U256 {
        U256::from(1u8) << self.depth
    }

    /// Positions assigned so far.
    pub fn leaf_count(&self) -> U256 {
        self.end_leaf_index - self.start_leaf_index
    }

    /// A commitment generation is sealed once its last local leaf is assigned.
    pub fn is_sealed(&self) -> bool {
        self.species.is_multi_generation() && self.leaf_count() == self.capacity()
    }

    /// Whether `global_index` falls in the generation's slot range.
    pub fn covers(&self, global_index: U256) -> bool {
        global_index >= self.start_leaf_index
            && global_index - self.start_leaf_index < self.capacity()
    }
}

/// Failure reported by a [`MetadataStore`].
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The backing store could not serve the request.
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
    /// The write contradicts a stored record.
    #[error("metadata conflict: {0}")]
    Conflict(String),
}

/// Persistence contract for [`TreeMetadata`].
#[async_trait]
pub trait MetadataStore: fmt::Debug + Send + Sync {
    /// Insert a new record; fails if the id exists.
    async fn create(&self, metadata: TreeMetadata) -> Result<(), MetadataError>;

    /// Record by id.
    async fn get(&self, id: TreeId) -> Result<Option<TreeMetadata>, MetadataError>;

    /// Highest generation of `species`.
    async fn latest(&self, species: TreeSpecies) -> Result<Option<TreeMetadata>, MetadataError>;

    /// All generations of `species`, oldest first.
    async fn list(&self, species: TreeSpecies) -> Result<Vec<TreeMetadata>, MetadataError>;

    /// Overwrite an existing record.
    async fn update(&self, metadata: TreeMetadata) -> Result<(), MetadataError>;
}

/// In-memory metadata table.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    records: RwLock<BTreeMap<TreeId, TreeMetadata>>,
}

impl MemoryMetadataStore {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create(&self, metadata: TreeMetadata) -> Result<(), MetadataError> {
        let mut records = self.records.write().await;
        if records.contains_key(&metadata.id) {
            return Err(MetadataError::Conflict(format!("tree {} already exists", metadata.id)));
        }
        records.insert(metadata.id, metadata);
        Ok(())
    }

    async fn get(&self, id: TreeId) -> Result<Option<TreeMetadata>, MetadataError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn latest(&self, species: TreeSpecies) -> Result<Option<TreeMetadata>, MetadataError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|record| record.species == species)
            .max_by_key(|record| record.generation)
            .cloned())
    }

    async fn list(&self, species: TreeSpecies) -> Result<Vec<TreeMetadata>, MetadataError> {
        let mut list: Vec<TreeMetadata> = self
            .records
            .read()
            .await
            .values()
            .filter(|record| record.species == species)
            .cloned()
            .collect();
        list.sort_by_key(|record| record.generation);
        Ok(list)
    }

    async fn update(&self, metadata: TreeMetadata) -> Result<(), MetadataError> {
        let mut records = self.records.write().await;
        let Some(existing) = records.get_mut(&metadata.id) else {
            return Err(MetadataError::Conflict(format!("tree {} does not exist", metadata.id)));
        };
        if metadata.end_leaf_index < existing.end_leaf_index {
            return Err(MetadataError::Conflict(format!(
                "tree {}: end leaf index would move back from {} to {}",
                metadata.id, existing.end_leaf_index, metadata.end_leaf_index
            )));
        }
        *existing = metadata;
        Ok(())
    }
}
