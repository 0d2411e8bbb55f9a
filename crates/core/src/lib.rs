//! Rollup state-commitment grove
//!
//! This crate ties the tree engine to the rest of a rollup node:
//! - The grove: one live tree per species, generation rollover
//! - Tree metadata and its repository contract
//! - Proof verification service contract and block validation

pub mod config;
pub mod error;
pub mod grove;
pub mod metadata;
pub mod species;
pub mod validator;
pub mod verifier;

pub use config::GroveConfig;
pub use error::{GroveError, Rejection};
pub use grove::{Grove, GroveHashers, GrovePatch, GroveRoots};
pub use metadata::{MemoryMetadataStore, MetadataError, MetadataStore, TreeMetadata};
pub use species::TreeSpecies;
pub use validator::{BlockValidator, ProposedBlock, Verdict};
pub use verifier::{
    MockVerifier, VerificationOutcome, VerificationRequest, VerificationService, VerifierError,
};
