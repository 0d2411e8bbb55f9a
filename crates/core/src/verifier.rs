//! SNARK verification service contract and a mock for local runs

use std::fmt;

use async_trait::async_trait;
use grove_smt::Fp;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Proof plus the public inputs it commits to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRequest {
    /// Serialized proof
    pub proof: Vec<u8>,
    /// Public inputs (roots, nullifiers, commitments)
    pub public_inputs: Vec<Fp>,
}

/// Verdict of the verifier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    /// Whether the proof verified
    pub valid: bool,
    /// Why it did not
    pub reason: Option<String>,
}

impl VerificationOutcome {
    /// Proof accepted
    pub const fn valid() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    /// Proof rejected for `reason`
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// The verification backend could not produce a verdict.
#[derive(Debug, Error)]
pub enum VerifierError {
    /// Backend unreachable or failing.
    #[error("verifier unavailable: {0}")]
    Unavailable(String),
}

/// Injected proof verification backend.
#[async_trait]
pub trait VerificationService: fmt::Debug + Send + Sync {
    /// Verify one proof against its public inputs.
    async fn verify(
        &self,
        request: &VerificationRequest,
    ) -> Result<VerificationOutcome, VerifierError>;
}

/// Mock verifier (no actual verification)
#[derive(Clone, Debug, Default)]
pub struct MockVerifier {
    rejection: Option<String>,
}

impl MockVerifier {
    /// Accept every proof
    pub fn accepting() -> Self {
        info!("Using mock verifier (no actual verification)");
        Self { rejection: None }
    }

    /// Reject every proof with `reason`
    pub fn rejecting(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        info!("Using mock verifier rejecting with: {}", reason);
        Self {
            rejection: Some(reason),
        }
    }
}

#[async_trait]
impl VerificationService for MockVerifier {
    async fn verify(
        &self,
        request: &VerificationRequest,
    ) -> Result<VerificationOutcome, VerifierError> {
        tracing::debug!(
            target: "grove::verifier",
            proof_len = request.proof.len(),
            inputs = request.public_inputs.len(),
            "mock verification"
        );
        Ok(match &self.rejection {
            None => VerificationOutcome::valid(),
            Some(reason) => VerificationOutcome::invalid(reason.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> VerificationRequest {
        VerificationRequest {
            proof: vec![0u8; 256],
            public_inputs: vec![Fp::from(1), Fp::from(2)],
        }
    }

    #[tokio::test]
    async fn test_mock_accepts() {
        let outcome = MockVerifier::accepting().verify(&request()).await.unwrap();
        assert_eq!(outcome, VerificationOutcome::valid());
    }

    #[tokio::test]
    async fn test_mock_rejects_with_reason() {
        let outcome = MockVerifier::rejecting("bad proof").verify(&request()).await.unwrap();
        assert!(!outcome.valid);
        assert_eq!(outcome.reason.as_deref(), Some("bad proof"));
    }
}
