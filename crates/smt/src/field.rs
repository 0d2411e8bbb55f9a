//! BN254 scalar field element
//!
//! Every value held by [`Fp`] is canonical: strictly below [`MODULUS`].
//! Constructors either reduce or reject, and arithmetic reduces on every
//! operation, so two equal field elements always have equal bytes.

use std::fmt;
use std::ops::{Add, Mul};

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// BN254 scalar field modulus
/// `0x30644e72e131a029b85045b68181585d2833e84879b9709143e1f593f0000001`.
pub const MODULUS: U256 = U256::from_limbs([
    0x43e1_f593_f000_0001,
    0x2833_e848_79b9_7091,
    0xb850_45b6_8181_585d,
    0x3064_4e72_e131_a029,
]);

/// Rejected field element input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    /// The integer is not below the modulus.
    #[error("value {0:#x} is not a canonical field element")]
    NonCanonical(U256),
}

/// Element of the BN254 scalar field.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "U256", try_from = "U256")]
pub struct Fp(U256);

impl Fp {
    /// Additive identity; also the empty leaf of every tree.
    pub const ZERO: Self = Self(U256::ZERO);
    /// Multiplicative identity; the spent marker of the nullifier tree.
    pub const ONE: Self = Self(U256::from_limbs([1, 0, 0, 0]));

    /// Wrap a canonical integer, rejecting values at or above the modulus.
    pub fn new(value: U256) -> Result<Self, FieldError> {
        if value >= MODULUS {
            return Err(FieldError::NonCanonical(value));
        }
        Ok(Self(value))
    }

    /// Reduce an arbitrary 256-bit integer into the field.
    pub fn reduce(value: U256) -> Self {
        Self(value.reduce_mod(MODULUS))
    }

    /// Reduce big-endian bytes (e.g. a keccak digest) into the field.
    pub fn from_be_bytes_reduced(bytes: [u8; 32]) -> Self {
        Self::reduce(U256::from_be_bytes(bytes))
    }

    /// Big-endian encoding, as used by circuits and the on-chain verifier.
    pub fn to_be_bytes(&self) -> [u8; 32] {
        self.0.to_be_bytes::<32>()
    }

    /// Underlying integer.
    pub const fn as_u256(&self) -> U256 {
        self.0
    }

    /// True for the additive identity.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<u64> for Fp {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl From<Fp> for U256 {
    fn from(value: Fp) -> Self {
        value.0
    }
}

impl TryFrom<U256> for Fp {
    type Error = FieldError;

    fn try_from(value: U256) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl Add for Fp {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.add_mod(rhs.0, MODULUS))
    }
}

impl Mul for Fp {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        Self(self.0.mul_mod(rhs.0, MODULUS))
    }
}

impl fmt::Display for Fp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.to_be_bytes()))
    }
}

impl fmt::Debug for Fp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fp({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_wraps_modulus() {
        assert_eq!(Fp::reduce(MODULUS), Fp::ZERO);
        assert_eq!(Fp::reduce(MODULUS + U256::from(5u64)), Fp::from(5));
    }

    #[test]
    fn test_new_rejects_non_canonical() {
        assert_eq!(Fp::new(MODULUS), Err(FieldError::NonCanonical(MODULUS)));
        assert!(Fp::new(MODULUS - U256::from(1u64)).is_ok());
    }

    #[test]
    fn test_arithmetic_stays_canonical() {
        let max = Fp::new(MODULUS - U256::from(1u64)).unwrap();
        assert_eq!(max + Fp::ONE, Fp::ZERO);
        assert_eq!(max + Fp::from(3), Fp::from(2));
        // (-1) * (-1) == 1
        assert_eq!(max * max, Fp::ONE);
    }

    #[test]
    fn test_bytes_and_display() {
        let value = Fp::from(0xabcd);
        let bytes = value.to_be_bytes();
        assert_eq!(&bytes[30..], &[0xab, 0xcd]);
        assert_eq!(Fp::from_be_bytes_reduced(bytes), value);
        assert!(value.to_string().ends_with("abcd"));
        assert_eq!(value.to_string().len(), 66);
    }

    #[test]
    fn test_serde_rejects_non_canonical() {
        let json = serde_json::to_string(&Fp::from(7)).unwrap();
        let back: Fp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Fp::from(7));

        let too_big = serde_json::to_string(&MODULUS).unwrap();
        assert!(serde_json::from_str::<Fp>(&too_big).is_err());
    }
}
