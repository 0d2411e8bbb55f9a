//! Tree species

use std::fmt;

use grove_smt::TreeId;
use serde::{Deserialize, Serialize};

/// Asset class a tree commits to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeSpecies {
    /// Unspent output commitments
    Utxo,
    /// Withdrawal commitments
    Withdrawal,
    /// Global spent set
    Nullifier,
}

impl TreeSpecies {
    /// Every species, in table order.
    pub const ALL: [Self; 3] = [Self::Utxo, Self::Withdrawal, Self::Nullifier];

    /// Utxo and Withdrawal trees roll over into new generations when full.
    pub const fn is_multi_generation(self) -> bool {
        !matches!(self, Self::Nullifier)
    }

    /// Lowercase name
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Utxo => "utxo",
            Self::Withdrawal => "withdrawal",
            Self::Nullifier => "nullifier",
        }
    }

    const fn code(self) -> u64 {
        match self {
            Self::Utxo => 0,
            Self::Withdrawal => 1,
            Self::Nullifier => 2,
        }
    }

    /// Node-store id of a generation: generation number above a 2-bit species tag.
    pub const fn tree_id(self, generation: u64) -> TreeId {
        (generation << 2) | self.code()
    }
}

impl fmt::Display for TreeSpecies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
