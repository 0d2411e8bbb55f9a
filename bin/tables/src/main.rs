//! Empty subtree tables
//!
//! Prints, for every tree species, the hasher name, the configured depth and
//! the empty root of each level. The on-chain verifier hardcodes the same
//! tables; diff the output against its constants after any depth or hasher
//! change.

use anyhow::{Context, Result};
use grove_core::{GroveConfig, GroveHashers, TreeSpecies};
use grove_smt::{EmptyRoots, TreeHasher};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Table of one species
#[derive(Debug, Serialize)]
struct SpeciesTable {
    species: TreeSpecies,
    hasher: &'static str,
    depth: usize,
    empty_roots: EmptyRoots,
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = GroveConfig::from_env();
    config.validate()?;
    let hashers = GroveHashers::default();
    info!("Computing empty subtree tables");
    info!("  UTXO depth: {}", config.utxo_depth);
    info!("  Withdrawal depth: {}", config.withdrawal_depth);
    info!("  Nullifier depth: {}", config.nullifier_depth);

    let tables = TreeSpecies::ALL
        .into_iter()
        .map(|species| {
            let depth = config.depth(species);
            let tree_hasher = TreeHasher::new(hashers.get(species), depth)
                .with_context(|| format!("failed to build the {species} table"))?;
            Ok(SpeciesTable {
                species,
                hasher: tree_hasher.name(),
                depth,
                empty_roots: tree_hasher.empty_roots().clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    println!("{}", serde_json::to_string_pretty(&tables)?);
    info!("Printed {} tables", tables.len());
    Ok(())
}
