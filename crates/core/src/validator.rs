//! Block validation: replay the block's tree updates speculatively and check
//! its proofs

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{GroveError, Rejection};
use crate::grove::{Grove, GrovePatch, GroveRoots};
use crate::verifier::{VerificationRequest, VerificationService};

/// A block as proposed on the base chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedBlock {
    /// Block number
    pub number: u64,
    /// Tree updates carried by the block
    pub patch: GrovePatch,
    /// Roots the proposer claims after the block
    pub roots: GroveRoots,
    /// Transaction proofs
    pub proofs: Vec<VerificationRequest>,
}

/// Outcome of validating a block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Block is valid and leads to these roots.
    Accepted(GroveRoots),
    /// Block must be challenged.
    Rejected {
        /// Classified reason
        reason: Rejection,
        /// Human readable detail
        detail: String,
    },
}

impl Verdict {
    /// True for [`Verdict::Accepted`].
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// Checks proposed blocks against the local grove.
#[derive(Clone, Debug)]
pub struct BlockValidator {
    verifier: Arc<dyn VerificationService>,
}

impl BlockValidator {
    /// Create a validator using `verifier` for transaction proofs
    pub fn new(verifier: Arc<dyn VerificationService>) -> Self {
        Self { verifier }
    }

    /// Validate `block` without touching the grove.
    ///
    /// Errors are returned only when the local node cannot reach a verdict
    /// (storage or verifier unavailable, diverged state); everything the
    /// block itself got wrong becomes [`Verdict::Rejected`].
    pub async fn validate(
        &self,
        grove: &Grove,
        block: &ProposedBlock,
    ) -> Result<Verdict, GroveError> {
        let computed = match grove.dry_patch(&block.patch).await {
            Ok(roots) => roots,
            Err(err) => match err.rejection() {
                Rejection::Inconsistent | Rejection::StorageUnavailable => return Err(err),
                reason => return Ok(self.reject(block, reason, err.to_string())),
            },
        };
        if computed != block.roots {
            return Ok(self.reject(
                block,
                Rejection::Invalid,
                format!("claimed roots {:?} differ from computed {:?}", block.roots, computed),
            ));
        }

        for (position, request) in block.proofs.iter().enumerate() {
            let outcome = self.verifier.verify(request).await?;
            if !outcome.valid {
                let reason = outcome.reason.unwrap_or_else(|| "no reason given".to_string());
                return Ok(self.reject(
                    block,
                    Rejection::Invalid,
                    format!("proof {position} rejected: {reason}"),
                ));
            }
        }

        info!(
            target: "grove::validator",
            block = block.number,
            proofs = block.proofs.len(),
            "block accepted"
        );
        Ok(Verdict::Accepted(computed))
    }

    fn reject(&self, block: &ProposedBlock, reason: Rejection, detail: String) -> Verdict {
        warn!(target: "grove::validator", block = block.number, ?reason, %detail, "block rejected");
        Verdict::Rejected { reason, detail }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroveConfig;
    use crate::grove::GroveHashers;
    use crate::metadata::MemoryMetadataStore;
    use crate::verifier::MockVerifier;
    use grove_smt::{Fp, MemoryNodeStore};

    async fn grove() -> Grove {
        let config = GroveConfig {
            utxo_depth: 4,
            withdrawal_depth: 4,
            nullifier_depth: 8,
            utxo_sub_tree_depth: 1,
            withdrawal_sub_tree_depth: 1,
            cache_enabled: false,
        };
        Grove::init(
            config,
            GroveHashers::default(),
            Arc::new(MemoryNodeStore::new()),
            Arc::new(MemoryMetadataStore::new()),
        )
        .await
        .unwrap()
    }

    fn patch(nullifiers: &[u64]) -> GrovePatch {
        GrovePatch {
            utxos: vec![Fp::from(100), Fp::from(101)],
            withdrawals: vec![Fp::from(200)],
            nullifiers: nullifiers.iter().map(|n| Fp::from(*n)).collect(),
        }
    }

    fn proof() -> VerificationRequest {
        VerificationRequest {
            proof: vec![1, 2, 3],
            public_inputs: vec![Fp::from(9)],
        }
    }

    #[tokio::test]
    async fn test_accepts_honest_block() {
        let grove = grove().await;
        let patch = patch(&[1, 2]);
        let roots = grove.dry_patch(&patch).await.unwrap();
        let block = ProposedBlock {
            number: 1,
            patch,
            roots,
            proofs: vec![proof()],
        };

        let validator = BlockValidator::new(Arc::new(MockVerifier::accepting()));
        assert_eq!(validator.validate(&grove, &block).await.unwrap(), Verdict::Accepted(roots));
    }

    #[tokio::test]
    async fn test_rejects_wrong_roots() {
        let grove = grove().await;
        let patch = patch(&[1]);
        let mut roots = grove.dry_patch(&patch).await.unwrap();
        roots.utxo_root = Fp::from(1);
        let block = ProposedBlock {
            number: 2,
            patch,
            roots,
            proofs: vec![],
        };

        let validator = BlockValidator::new(Arc::new(MockVerifier::accepting()));
        let verdict = validator.validate(&grove, &block).await.unwrap();
        assert!(matches!(verdict, Verdict::Rejected { reason: Rejection::Invalid, .. }));
    }

    #[tokio::test]
    async fn test_rejects_double_spend() {
        let mut grove = grove().await;
        grove.mark_spent(&[Fp::from(5)]).await.unwrap();
        let block = ProposedBlock {
            number: 3,
            patch: patch(&[5]),
            roots: grove.roots(),
            proofs: vec![],
        };

        let validator = BlockValidator::new(Arc::new(MockVerifier::accepting()));
        let verdict = validator.validate(&grove, &block).await.unwrap();
        assert!(matches!(verdict, Verdict::Rejected { reason: Rejection::DoubleSpend, .. }));
    }

    #[tokio::test]
    async fn test_rejects_invalid_proof() {
        let grove = grove().await;
        let patch = patch(&[]);
        let roots = grove.dry_patch(&patch).await.unwrap();
        let block = ProposedBlock {
            number: 4,
            patch,
            roots,
            proofs: vec![proof(), proof()],
        };

        let validator = BlockValidator::new(Arc::new(MockVerifier::rejecting("bad witness")));
        let verdict = validator.validate(&grove, &block).await.unwrap();
        assert!(!verdict.is_accepted());
        match verdict {
            Verdict::Rejected { detail, .. } => assert!(detail.contains("bad witness")),
            Verdict::Accepted(_) => unreachable!(),
        }
    }
}
