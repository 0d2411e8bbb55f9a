//! The grove: live trees per species, generation rollover and routing

use std::sync::Arc;

use grove_smt::{
    AppendResult, Fp, Hasher, KeccakHasher, MerkleProof, MerkleTree, NodeStore, NullifierTree,
    PendingAppend, PendingSpend, PoseidonHasher, SmtError, TreeCache, TreeHasher, U256,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::GroveConfig;
use crate::error::GroveError;
use crate::metadata::{MetadataStore, TreeMetadata};
use crate::species::TreeSpecies;

/// Hash function of each species.
#[derive(Clone, Debug)]
pub struct GroveHashers {
    /// UTXO trees
    pub utxo: Arc<dyn Hasher>,
    /// Withdrawal trees
    pub withdrawal: Arc<dyn Hasher>,
    /// Nullifier tree
    pub nullifier: Arc<dyn Hasher>,
}

impl Default for GroveHashers {
    fn default() -> Self {
        Self {
            utxo: Arc::new(PoseidonHasher::new()),
            withdrawal: Arc::new(KeccakHasher),
            nullifier: Arc::new(KeccakHasher),
        }
    }
}

impl GroveHashers {
    /// Hasher of `species`.
    pub fn get(&self, species: TreeSpecies) -> Arc<dyn Hasher> {
        match species {
            TreeSpecies::Utxo => Arc::clone(&self.utxo),
            TreeSpecies::Withdrawal => Arc::clone(&self.withdrawal),
            TreeSpecies::Nullifier => Arc::clone(&self.nullifier),
        }
    }
}

/// Leaves one block adds to each tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrovePatch {
    /// New output commitments
    pub utxos: Vec<Fp>,
    /// New withdrawal commitments
    pub withdrawals: Vec<Fp>,
    /// Nullifiers to mark spent
    pub nullifiers: Vec<Fp>,
}

/// Roots of the trees a patch wrote into, with the next global leaf indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroveRoots {
    /// UTXO root
    pub utxo_root: Fp,
    /// Next global UTXO index
    pub utxo_index: U256,
    /// Withdrawal root
    pub withdrawal_root: Fp,
    /// Next global withdrawal index
    pub withdrawal_index: U256,
    /// Nullifier root
    pub nullifier_root: Fp,
}

#[derive(Debug)]
struct Generation {
    metadata: TreeMetadata,
    tree: MerkleTree,
}

impl Generation {
    fn ensure_room(&self, requested: U256) -> Result<(), GroveError> {
        let remaining = self.tree.remaining_capacity();
        if requested > remaining {
            return Err(GroveError::GenerationFull {
                species: self.metadata.species,
                generation: self.metadata.generation,
                requested,
                remaining,
            });
        }
        Ok(())
    }

    fn global_index(&self, result: &AppendResult) -> U256 {
        self.metadata.start_leaf_index + result.index
    }

    fn advanced(&self, pending: &PendingAppend) -> TreeMetadata {
        let mut record = self.metadata.clone();
        record.end_leaf_index = self.global_index(pending.snapshot());
        record
    }
}

#[derive(Debug)]
struct NullifierSet {
    metadata: TreeMetadata,
    tree: NullifierTree,
}

#[derive(Clone, Debug)]
struct Storage {
    nodes: Arc<dyn NodeStore>,
    metadata: Arc<dyn MetadataStore>,
    cache: Arc<TreeCache>,
}

/// Writes of one grove update, at most one per tree.
#[derive(Debug, Default)]
struct PendingBatch {
    utxo: Option<PendingAppend>,
    withdrawal: Option<PendingAppend>,
    nullifier: Option<PendingSpend>,
}

impl PendingBatch {
    fn with_append(mut self, species: TreeSpecies, pending: PendingAppend) -> Self {
        if pending.appended().is_zero() {
            return self;
        }
        match species {
            TreeSpecies::Utxo => self.utxo = Some(pending),
            TreeSpecies::Withdrawal => self.withdrawal = Some(pending),
            TreeSpecies::Nullifier => {}
        }
        self
    }

    fn with_spend(mut self, pending: PendingSpend) -> Self {
        if pending.count() > 0 {
            self.nullifier = Some(pending);
        }
        self
    }
}

/// Live UTXO and withdrawal generations plus the nullifier set.
///
/// Writers go through `&mut self`; dry runs and proofs take `&self` and
/// see the last applied state.
#[derive(Debug)]
pub struct Grove {
    config: GroveConfig,
    utxo_hasher: TreeHasher,
    withdrawal_hasher: TreeHasher,
    storage: Storage,
    utxo: Generation,
    withdrawal: Generation,
    nullifier: NullifierSet,
}

impl Grove {
    /// Restore the latest generation of every species, opening generation 0
    /// (or the successor of a sealed one) where needed.
    pub async fn init(
        config: GroveConfig,
        hashers: GroveHashers,
        nodes: Arc<dyn NodeStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Result<Self, GroveError> {
        config.validate()?;
        let cache = Arc::new(TreeCache::new());
        if config.cache_enabled {
            cache.enable();
        }
        let storage = Storage {
            nodes,
            metadata,
            cache,
        };

        let tree_hasher = |species| TreeHasher::new(hashers.get(species), config.depth(species));
        let utxo_hasher = tree_hasher(TreeSpecies::Utxo)?;
        let withdrawal_hasher = tree_hasher(TreeSpecies::Withdrawal)?;
        let nullifier_hasher = tree_hasher(TreeSpecies::Nullifier)?;

        let utxo = restore_generation(&storage, TreeSpecies::Utxo, &utxo_hasher).await?;
        let withdrawal =
            restore_generation(&storage, TreeSpecies::Withdrawal, &withdrawal_hasher).await?;
        let nullifier = restore_nullifiers(&storage, nullifier_hasher).await?;

        info!(
            target: "grove",
            utxo_generation = utxo.metadata.generation,
            withdrawal_generation = withdrawal.metadata.generation,
            spent = %nullifier.metadata.end_leaf_index,
            "grove initialized"
        );
        Ok(Self {
            config,
            utxo_hasher,
            withdrawal_hasher,
            storage,
            utxo,
            withdrawal,
            nullifier,
        })
    }

    /// Active configuration.
    pub const fn config(&self) -> &GroveConfig {
        &self.config
    }

    /// Provisional node cache shared by every tree of the grove.
    pub const fn cache(&self) -> &Arc<TreeCache> {
        &self.storage.cache
    }

    /// Metadata of the open generation of `species`.
    pub const fn metadata(&self, species: TreeSpecies) -> &TreeMetadata {
        match species {
            TreeSpecies::Utxo => &self.utxo.metadata,
            TreeSpecies::Withdrawal => &self.withdrawal.metadata,
            TreeSpecies::Nullifier => &self.nullifier.metadata,
        }
    }

    /// Snapshot of the live tree of a commitment species.
    pub fn snapshot(&self, species: TreeSpecies) -> Result<&AppendResult, GroveError> {
        Ok(self.commitment(species, "snapshot")?.tree.snapshot())
    }

    /// Positions left in the open generation, or never-spent nullifiers.
    pub fn remaining_capacity(&self, species: TreeSpecies) -> U256 {
        match species {
            TreeSpecies::Utxo => self.utxo.tree.remaining_capacity(),
            TreeSpecies::Withdrawal => self.withdrawal.tree.remaining_capacity(),
            TreeSpecies::Nullifier => self.nullifier.tree.remaining_capacity(),
        }
    }

    /// Roots of the live trees.
    pub fn roots(&self) -> GroveRoots {
        GroveRoots {
            utxo_root: self.utxo.tree.root(),
            utxo_index: self.utxo.metadata.end_leaf_index,
            withdrawal_root: self.withdrawal.tree.root(),
            withdrawal_index: self.withdrawal.metadata.end_leaf_index,
            nullifier_root: self.nullifier.tree.root(),
        }
    }

    /// Every generation of `species`, oldest first.
    pub async fn generations(&self, species: TreeSpecies) -> Result<Vec<TreeMetadata>, GroveError> {
        Ok(self.storage.metadata.list(species).await?)
    }

    /// State the live tree would reach after appending `items`.
    pub async fn dry_append(
        &self,
        species: TreeSpecies,
        items: &[Fp],
    ) -> Result<AppendResult, GroveError> {
        let generation = self.commitment(species, "append")?;
        generation.ensure_room(U256::from(items.len()))?;
        Ok(generation.tree.dry_append(items).await?)
    }

    /// Append `items` to the open generation of `species`.
    ///
    /// The whole batch must fit; it is never split across generations. A
    /// generation filled by the batch is sealed and its successor opened.
    pub async fn append(
        &mut self,
        species: TreeSpecies,
        items: &[Fp],
    ) -> Result<AppendResult, GroveError> {
        let generation = self.commitment(species, "append")?;
        generation.ensure_room(U256::from(items.len()))?;
        let pending = generation.tree.prepare_append(items).await?;
        let result = pending.snapshot().clone();
        self.commit(PendingBatch::default().with_append(species, pending)).await?;
        Ok(result)
    }

    /// Speculative form of [`append_sub_tree`](Self::append_sub_tree).
    pub async fn dry_append_sub_tree(
        &self,
        species: TreeSpecies,
        leaves: &[Fp],
    ) -> Result<AppendResult, GroveError> {
        Ok(self.prepare_sub_tree(species, leaves).await?.into_snapshot())
    }

    /// Append `leaves` as one sub-tree of the configured depth, siblings
    /// taken from the live frontier. Returns the new root.
    pub async fn append_sub_tree(
        &mut self,
        species: TreeSpecies,
        leaves: &[Fp],
    ) -> Result<Fp, GroveError> {
        let pending = self.prepare_sub_tree(species, leaves).await?;
        let root = pending.snapshot().root;
        self.commit(PendingBatch::default().with_append(species, pending)).await?;
        Ok(root)
    }

    /// Nullifier root after spending `nullifiers`. Writes nothing.
    pub async fn dry_mark_spent(&self, nullifiers: &[Fp]) -> Result<Fp, GroveError> {
        Ok(self.nullifier.tree.dry_mark_spent(nullifiers).await?)
    }

    /// Mark `nullifiers` spent, all or nothing. Returns the new root.
    pub async fn mark_spent(&mut self, nullifiers: &[Fp]) -> Result<Fp, GroveError> {
        let pending = self.nullifier.tree.prepare_mark_spent(nullifiers).await?;
        let root = pending.root();
        self.commit(PendingBatch::default().with_spend(pending)).await?;
        Ok(root)
    }

    /// Whether `nullifier` has been spent.
    pub async fn is_spent(&self, nullifier: &Fp) -> Result<bool, GroveError> {
        Ok(self.nullifier.tree.is_spent(nullifier).await?)
    }

    /// Roots after applying `patch`, without writing.
    pub async fn dry_patch(&self, patch: &GrovePatch) -> Result<GroveRoots, GroveError> {
        self.utxo.ensure_room(U256::from(patch.utxos.len()))?;
        self.withdrawal.ensure_room(U256::from(patch.withdrawals.len()))?;
        let utxo = self.utxo.tree.dry_append(&patch.utxos).await?;
        let withdrawal = self.withdrawal.tree.dry_append(&patch.withdrawals).await?;
        let nullifier_root = self.nullifier.tree.dry_mark_spent(&patch.nullifiers).await?;
        Ok(GroveRoots {
            utxo_root: utxo.root,
            utxo_index: self.utxo.global_index(&utxo),
            withdrawal_root: withdrawal.root,
            withdrawal_index: self.withdrawal.global_index(&withdrawal),
            nullifier_root,
        })
    }

    /// Apply a whole block. Capacity and double spends are checked for all
    /// three trees before anything is written.
    pub async fn apply_patch(&mut self, patch: &GrovePatch) -> Result<GroveRoots, GroveError> {
        self.utxo.ensure_room(U256::from(patch.utxos.len()))?;
        self.withdrawal.ensure_room(U256::from(patch.withdrawals.len()))?;
        let utxos = self.utxo.tree.prepare_append(&patch.utxos).await?;
        let withdrawals = self.withdrawal.tree.prepare_append(&patch.withdrawals).await?;
        let spends = self.nullifier.tree.prepare_mark_spent(&patch.nullifiers).await?;

        let roots = GroveRoots {
            utxo_root: utxos.snapshot().root,
            utxo_index: self.utxo.global_index(utxos.snapshot()),
            withdrawal_root: withdrawals.snapshot().root,
            withdrawal_index: self.withdrawal.global_index(withdrawals.snapshot()),
            nullifier_root: spends.root(),
        };
        let batch = PendingBatch::default()
            .with_append(TreeSpecies::Utxo, utxos)
            .with_append(TreeSpecies::Withdrawal, withdrawals)
            .with_spend(spends);
        self.commit(batch).await?;

        info!(
            target: "grove",
            utxos = patch.utxos.len(),
            withdrawals = patch.withdrawals.len(),
            nullifiers = patch.nullifiers.len(),
            "patch applied"
        );
        Ok(roots)
    }

    /// Proof for a leaf by global index. Leaves of sealed generations are
    /// proven against the generation's final root.
    ///
    /// For the nullifier species the index is the nullifier itself.
    pub async fn get_proof(
        &self,
        species: TreeSpecies,
        global_leaf_index: U256,
    ) -> Result<MerkleProof, GroveError> {
        if species == TreeSpecies::Nullifier {
            let nullifier = Fp::new(global_leaf_index).map_err(|_| SmtError::LeafIndexOutOfRange {
                index: global_leaf_index,
                depth: self.nullifier.tree.depth(),
            })?;
            return self.nullifier_proof(&nullifier).await;
        }

        let live = self.commitment(species, "proof")?;
        if live.metadata.covers(global_leaf_index) {
            let local = global_leaf_index - live.metadata.start_leaf_index;
            return Ok(live.tree.get_proof(local).await?);
        }

        let sealed = self
            .storage
            .metadata
            .list(species)
            .await?
            .into_iter()
            .find(|record| record.is_sealed() && record.covers(global_leaf_index))
            .ok_or(GroveError::UnknownGeneration {
                species,
                index: global_leaf_index,
            })?;
        let tree = MerkleTree::load(
            sealed.id,
            self.tree_hasher(species)?.clone(),
            Arc::clone(&self.storage.nodes),
            Arc::clone(&self.storage.cache),
            sealed.leaf_count(),
        )
        .await?;
        Ok(tree.get_proof(global_leaf_index - sealed.start_leaf_index).await?)
    }

    /// Membership or non-membership proof of `nullifier`.
    pub async fn nullifier_proof(&self, nullifier: &Fp) -> Result<MerkleProof, GroveError> {
        Ok(self.nullifier.tree.get_proof(nullifier).await?)
    }

    fn commitment(
        &self,
        species: TreeSpecies,
        operation: &'static str,
    ) -> Result<&Generation, GroveError> {
        match species {
            TreeSpecies::Utxo => Ok(&self.utxo),
            TreeSpecies::Withdrawal => Ok(&self.withdrawal),
            TreeSpecies::Nullifier => Err(GroveError::WrongSpecies { species, operation }),
        }
    }

    fn tree_hasher(&self, species: TreeSpecies) -> Result<&TreeHasher, GroveError> {
        match species {
            TreeSpecies::Utxo => Ok(&self.utxo_hasher),
            TreeSpecies::Withdrawal => Ok(&self.withdrawal_hasher),
            TreeSpecies::Nullifier => Err(GroveError::WrongSpecies {
                species,
                operation: "rollover",
            }),
        }
    }

    async fn prepare_sub_tree(
        &self,
        species: TreeSpecies,
        leaves: &[Fp],
    ) -> Result<PendingAppend, GroveError> {
        let generation = self.commitment(species, "sub-tree append")?;
        let sub_tree_depth = self
            .config
            .sub_tree_depth(species)
            .ok_or(GroveError::WrongSpecies {
                species,
                operation: "sub-tree append",
            })?;
        generation.ensure_room(U256::from(1u8) << sub_tree_depth)?;
        let siblings = generation.tree.snapshot().siblings[sub_tree_depth..].to_vec();
        Ok(generation.tree.prepare_sub_tree_append(sub_tree_depth, leaves, &siblings).await?)
    }

    /// Write a batch: node writes for every tree, then metadata, then the
    /// successor of any generation the batch fills, then the in-memory
    /// advance. A failure before the last step leaves every tree at its
    /// previous state.
    async fn commit(&mut self, batch: PendingBatch) -> Result<(), GroveError> {
        let PendingBatch { utxo, withdrawal, nullifier } = batch;

        if let Some(pending) = &utxo {
            self.utxo.tree.persist(pending).await?;
        }
        if let Some(pending) = &withdrawal {
            self.withdrawal.tree.persist(pending).await?;
        }
        if let Some(pending) = &nullifier {
            self.nullifier.tree.persist(pending).await?;
        }

        let utxo_record = utxo.as_ref().map(|pending| self.utxo.advanced(pending));
        let withdrawal_record =
            withdrawal.as_ref().map(|pending| self.withdrawal.advanced(pending));
        let nullifier_record = nullifier.as_ref().map(|pending| {
            let mut record = self.nullifier.metadata.clone();
            record.end_leaf_index += U256::from(pending.count());
            record
        });
        for record in [&utxo_record, &withdrawal_record, &nullifier_record].into_iter().flatten() {
            self.storage.metadata.update(record.clone()).await?;
        }

        let utxo_next = self.successor(TreeSpecies::Utxo, utxo_record.as_ref()).await?;
        let withdrawal_next =
            self.successor(TreeSpecies::Withdrawal, withdrawal_record.as_ref()).await?;

        if let (Some(pending), Some(record)) = (utxo, utxo_record) {
            self.utxo.tree.apply(pending)?;
            self.utxo.metadata = record;
            debug!(
                target: "grove",
                species = %TreeSpecies::Utxo,
                end_leaf_index = %self.utxo.metadata.end_leaf_index,
                root = %self.utxo.tree.root(),
                "appended"
            );
        }
        if let (Some(pending), Some(record)) = (withdrawal, withdrawal_record) {
            self.withdrawal.tree.apply(pending)?;
            self.withdrawal.metadata = record;
            debug!(
                target: "grove",
                species = %TreeSpecies::Withdrawal,
                end_leaf_index = %self.withdrawal.metadata.end_leaf_index,
                root = %self.withdrawal.tree.root(),
                "appended"
            );
        }
        if let (Some(pending), Some(record)) = (nullifier, nullifier_record) {
            self.nullifier.tree.apply(pending)?;
            self.nullifier.metadata = record;
            debug!(
                target: "grove",
                spent = %self.nullifier.metadata.end_leaf_index,
                root = %self.nullifier.tree.root(),
                "nullifiers spent"
            );
        }

        if let Some(next) = utxo_next {
            self.utxo = next;
        }
        if let Some(next) = withdrawal_next {
            self.withdrawal = next;
        }
        Ok(())
    }

    /// Open the generation following `record` once `record` is sealed.
    async fn successor(
        &self,
        species: TreeSpecies,
        record: Option<&TreeMetadata>,
    ) -> Result<Option<Generation>, GroveError> {
        let Some(sealed) = record.filter(|record| record.is_sealed()) else {
            return Ok(None);
        };
        let hasher = self.tree_hasher(species)?;
        let next = open_generation(
            &self.storage,
            species,
            sealed.generation + 1,
            sealed.end_leaf_index,
            hasher,
        )
        .await?;
        info!(
            target: "grove",
            %species,
            generation = sealed.generation,
            end_leaf_index = %sealed.end_leaf_index,
            "generation sealed"
        );
        Ok(Some(next))
    }
}

fn check_depth(record: &TreeMetadata, depth: usize) -> Result<(), GroveError> {
    if record.depth != depth {
        return Err(GroveError::InvalidConfig(format!(
            "{} generation {} was created with depth {}, configured depth is {depth}",
            record.species, record.generation, record.depth
        )));
    }
    Ok(())
}

async fn open_generation(
    storage: &Storage,
    species: TreeSpecies,
    generation: u64,
    start_leaf_index: U256,
    hasher: &TreeHasher,
) -> Result<Generation, GroveError> {
    let metadata = TreeMetadata::open(species, generation, hasher.depth(), start_leaf_index);
    storage.metadata.create(metadata.clone()).await?;
    let tree = MerkleTree::new(
        metadata.id,
        hasher.clone(),
        Arc::clone(&storage.nodes),
        Arc::clone(&storage.cache),
    );
    info!(target: "grove", %species, generation, %start_leaf_index, "generation opened");
    Ok(Generation { metadata, tree })
}

async fn restore_generation(
    storage: &Storage,
    species: TreeSpecies,
    hasher: &TreeHasher,
) -> Result<Generation, GroveError> {
    let Some(latest) = storage.metadata.latest(species).await? else {
        return open_generation(storage, species, 0, U256::ZERO, hasher).await;
    };
    check_depth(&latest, hasher.depth())?;
    if latest.is_sealed() {
        let (generation, start) = (latest.generation + 1, latest.end_leaf_index);
        return open_generation(storage, species, generation, start, hasher).await;
    }
    let tree = MerkleTree::load(
        latest.id,
        hasher.clone(),
        Arc::clone(&storage.nodes),
        Arc::clone(&storage.cache),
        latest.leaf_count(),
    )
    .await?;
    Ok(Generation {
        metadata: latest,
        tree,
    })
}

async fn restore_nullifiers(
    storage: &Storage,
    hasher: TreeHasher,
) -> Result<NullifierSet, GroveError> {
    let metadata = match storage.metadata.latest(TreeSpecies::Nullifier).await? {
        Some(latest) => latest,
        None => {
            let record = TreeMetadata::open(TreeSpecies::Nullifier, 0, hasher.depth(), U256::ZERO);
            storage.metadata.create(record.clone()).await?;
            info!(target: "grove", species = %TreeSpecies::Nullifier, "nullifier tree opened");
            record
        }
    };
    check_depth(&metadata, hasher.depth())?;
    let tree = NullifierTree::load(
        metadata.id,
        hasher,
        Arc::clone(&storage.nodes),
        Arc::clone(&storage.cache),
        metadata.end_leaf_index,
    )
    .await?;
    Ok(NullifierSet { metadata, tree })
}
