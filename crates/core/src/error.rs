//! Grove error types

use grove_smt::{SmtError, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metadata::MetadataError;
use crate::species::TreeSpecies;
use crate::verifier::VerifierError;

/// Errors from grove operations.
#[derive(Debug, Error)]
pub enum GroveError {
    /// The open generation cannot take the whole batch. Batches are never split.
    #[error("{species} generation {generation} is full: requested {requested}, remaining {remaining}")]
    GenerationFull {
        /// Species of the tree
        species: TreeSpecies,
        /// Open generation
        generation: u64,
        /// Positions the batch needs
        requested: U256,
        /// Positions still free
        remaining: U256,
    },
    /// A tree operation failed.
    #[error(transparent)]
    Tree(#[from] SmtError),
    /// The metadata store failed.
    #[error(transparent)]
    StorageUnavailable(#[from] MetadataError),
    /// No generation holds the requested leaf.
    #[error("no {species} generation holds leaf {index}")]
    UnknownGeneration {
        /// Species searched
        species: TreeSpecies,
        /// Global leaf index
        index: U256,
    },
    /// The operation does not apply to this species.
    #[error("{operation} is not supported on the {species} tree")]
    WrongSpecies {
        /// Species addressed
        species: TreeSpecies,
        /// Rejected operation
        operation: &'static str,
    },
    /// The proof verification service failed.
    #[error(transparent)]
    Verifier(#[from] VerifierError),
    /// Configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Reason a block or transaction is turned away.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    /// A nullifier was already spent.
    DoubleSpend,
    /// A tree generation has no room left.
    TreeFull,
    /// Stored state diverged from memory.
    Inconsistent,
    /// A backing service did not answer; retrying may succeed.
    StorageUnavailable,
    /// The input itself is malformed.
    Invalid,
}

impl GroveError {
    /// Classify for block and transaction rejection.
    pub const fn rejection(&self) -> Rejection {
        match self {
            Self::GenerationFull { .. } | Self::Tree(SmtError::CapacityExceeded { .. }) => {
                Rejection::TreeFull
            }
            Self::Tree(SmtError::AlreadySpent(_)) => Rejection::DoubleSpend,
            Self::Tree(SmtError::NodeConsistency(_) | SmtError::Hash(_))
            | Self::StorageUnavailable(MetadataError::Conflict(_)) => Rejection::Inconsistent,
            Self::Tree(SmtError::StorageUnavailable(_))
            | Self::StorageUnavailable(MetadataError::Unavailable(_))
            | Self::Verifier(_) => Rejection::StorageUnavailable,
            Self::Tree(
                SmtError::InvalidSubTree(_)
                | SmtError::LeafIndexOutOfRange { .. }
                | SmtError::InvalidDepth(_),
            )
            | Self::UnknownGeneration { .. }
            | Self::WrongSpecies { .. }
            | Self::InvalidConfig(_) => Rejection::Invalid,
        }
    }

    /// Storage and memory have diverged; the node must stop, not retry.
    pub const fn is_fatal(&self) -> bool {
        matches!(self.rejection(), Rejection::Inconsistent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_smt::{Fp, StoreError};

    #[test]
    fn test_rejection_classes() {
        assert_eq!(
            GroveError::from(SmtError::AlreadySpent(Fp::ONE)).rejection(),
            Rejection::DoubleSpend
        );
        assert_eq!(
            GroveError::from(SmtError::StorageUnavailable(StoreError::Unavailable("down".into())))
                .rejection(),
            Rejection::StorageUnavailable
        );
        let full = GroveError::GenerationFull {
            species: TreeSpecies::Utxo,
            generation: 0,
            requested: U256::from(3u8),
            remaining: U256::from(1u8),
        };
        assert_eq!(full.rejection(), Rejection::TreeFull);
        assert!(!full.is_fatal());
        assert!(GroveError::from(SmtError::NodeConsistency("x".into())).is_fatal());
    }
}
