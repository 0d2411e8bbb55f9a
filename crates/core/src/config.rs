//! Configuration

use std::env;

use grove_smt::MAX_DEPTH;
use serde::{Deserialize, Serialize};

use crate::error::GroveError;
use crate::species::TreeSpecies;

/// Grove configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroveConfig {
    /// Depth of every UTXO generation
    pub utxo_depth: usize,
    /// Depth of every withdrawal generation
    pub withdrawal_depth: usize,
    /// Depth of the nullifier tree
    pub nullifier_depth: usize,
    /// Depth of batched UTXO sub-tree appends
    pub utxo_sub_tree_depth: usize,
    /// Depth of batched withdrawal sub-tree appends
    pub withdrawal_sub_tree_depth: usize,
    /// Start with the provisional node cache enabled
    pub cache_enabled: bool,
}

impl Default for GroveConfig {
    fn default() -> Self {
        Self {
            utxo_depth: 48,
            withdrawal_depth: 48,
            nullifier_depth: 254,
            utxo_sub_tree_depth: 5,
            withdrawal_sub_tree_depth: 5,
            cache_enabled: false,
        }
    }
}

impl GroveConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from any key lookup, falling back to defaults for missing or
    /// unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let depth = |key: &str, default: usize| {
            lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
        };
        Self {
            utxo_depth: depth("UTXO_TREE_DEPTH", defaults.utxo_depth),
            withdrawal_depth: depth("WITHDRAWAL_TREE_DEPTH", defaults.withdrawal_depth),
            nullifier_depth: depth("NULLIFIER_TREE_DEPTH", defaults.nullifier_depth),
            utxo_sub_tree_depth: depth("UTXO_SUB_TREE_DEPTH", defaults.utxo_sub_tree_depth),
            withdrawal_sub_tree_depth: depth(
                "WITHDRAWAL_SUB_TREE_DEPTH",
                defaults.withdrawal_sub_tree_depth,
            ),
            cache_enabled: lookup("TREE_CACHE")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(defaults.cache_enabled),
        }
    }

    /// Tree depth of `species`.
    pub const fn depth(&self, species: TreeSpecies) -> usize {
        match species {
            TreeSpecies::Utxo => self.utxo_depth,
            TreeSpecies::Withdrawal => self.withdrawal_depth,
            TreeSpecies::Nullifier => self.nullifier_depth,
        }
    }

    /// Sub-tree depth of batched appends; the nullifier tree has none.
    pub const fn sub_tree_depth(&self, species: TreeSpecies) -> Option<usize> {
        match species {
            TreeSpecies::Utxo => Some(self.utxo_sub_tree_depth),
            TreeSpecies::Withdrawal => Some(self.withdrawal_sub_tree_depth),
            TreeSpecies::Nullifier => None,
        }
    }

    /// Reject depths outside `1..=255` and sub-trees deeper than their tree.
    pub fn validate(&self) -> Result<(), GroveError> {
        for species in TreeSpecies::ALL {
            let depth = self.depth(species);
            if !(1..=MAX_DEPTH).contains(&depth) {
                return Err(GroveError::InvalidConfig(format!(
                    "{species} tree depth {depth} is outside 1..={MAX_DEPTH}"
                )));
            }
            if let Some(sub_tree_depth) = self.sub_tree_depth(species)
                && sub_tree_depth > depth
            {
                return Err(GroveError::InvalidConfig(format!(
                    "{species} sub-tree depth {sub_tree_depth} exceeds tree depth {depth}"
                )));
            }
        }
        Ok(())
    }
}
