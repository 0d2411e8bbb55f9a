//! Two-to-one hashers and their empty subtree tables

use std::fmt;
use std::sync::{Arc, Mutex};

use ark_bn254::Fr;
use light_poseidon::{Poseidon, PoseidonBytesHasher};
use serde::Serialize;
use tiny_keccak::{Hasher as _, Keccak};

use crate::error::SmtError;
use crate::field::Fp;
use crate::MAX_DEPTH;

/// Two-to-one compression used to fold tree levels.
///
/// Implementations must match, bit for bit, the hash the on-chain verifier
/// uses for the same species.
pub trait Hasher: fmt::Debug + Send + Sync {
    /// Short name, used in logs and the exported tables.
    fn name(&self) -> &'static str;

    /// Hash of a parent node from its two children.
    fn parent(&self, left: &Fp, right: &Fp) -> Result<Fp, SmtError>;

    /// Value of a leaf that was never written.
    fn empty_leaf(&self) -> Fp {
        Fp::ZERO
    }
}

/// `keccak256(left || right)` reduced into the field.
///
/// Used by the withdrawal and nullifier trees, which the base chain
/// recomputes with its native keccak.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeccakHasher;

impl Hasher for KeccakHasher {
    fn name(&self) -> &'static str {
        "keccak256"
    }

    fn parent(&self, left: &Fp, right: &Fp) -> Result<Fp, SmtError> {
        let mut hasher = Keccak::v256();
        hasher.update(&left.to_be_bytes());
        hasher.update(&right.to_be_bytes());
        let mut output = [0u8; 32];
        hasher.finalize(&mut output);
        Ok(Fp::from_be_bytes_reduced(output))
    }
}

/// Circom-compatible Poseidon over BN254 with two inputs.
///
/// Used by the UTXO tree so membership can be proven cheaply in-circuit.
/// The round constants and MDS matrix are built on first use and reused.
#[derive(Default)]
pub struct PoseidonHasher {
    state: Mutex<Option<Poseidon<Fr>>>,
}

impl PoseidonHasher {
    /// Create a hasher; parameters are built lazily
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for PoseidonHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoseidonHasher").finish_non_exhaustive()
    }
}

impl Hasher for PoseidonHasher {
    fn name(&self) -> &'static str {
        "poseidon"
    }

    fn parent(&self, left: &Fp, right: &Fp) -> Result<Fp, SmtError> {
        let mut state =
            self.state.lock().map_err(|_| SmtError::Hash("poseidon state poisoned".to_string()))?;
        let mut poseidon = match state.take() {
            Some(poseidon) => poseidon,
            None => Poseidon::<Fr>::new_circom(2).map_err(|e| SmtError::Hash(e.to_string()))?,
        };
        let left = left.to_be_bytes();
        let right = right.to_be_bytes();
        let output = poseidon
            .hash_bytes_be(&[&left[..], &right[..]])
            .map_err(|e| SmtError::Hash(e.to_string()))?;
        // only a sponge that finished a hash goes back in the slot
        *state = Some(poseidon);
        Ok(Fp::from_be_bytes_reduced(output))
    }
}

/// Roots of empty subtrees, indexed by level (0 = empty leaf).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EmptyRoots(Vec<Fp>);

impl EmptyRoots {
    /// Compute `empty[0..=depth]` where `empty[k] = parent(empty[k-1], empty[k-1])`.
    pub fn compute(hasher: &dyn Hasher, depth: usize) -> Result<Self, SmtError> {
        let mut levels = Vec::with_capacity(depth + 1);
        let mut current = hasher.empty_leaf();
        levels.push(current);
        for _ in 0..depth {
            current = hasher.parent(&current, &current)?;
            levels.push(current);
        }
        Ok(Self(levels))
    }

    /// Highest level in the table.
    pub fn depth(&self) -> usize {
        self.0.len() - 1
    }

    /// Empty root at `level`, if the table reaches that high.
    pub fn get(&self, level: usize) -> Option<Fp> {
        self.0.get(level).copied()
    }

    /// All levels, leaf first.
    pub fn as_slice(&self) -> &[Fp] {
        &self.0
    }
}

/// A hasher paired with its precomputed empty table for one tree depth.
///
/// The table is computed once and shared by every generation of a species.
#[derive(Clone, Debug)]
pub struct TreeHasher {
    hasher: Arc<dyn Hasher>,
    empty: Arc<EmptyRoots>,
}

impl TreeHasher {
    /// Precompute the empty table for `depth`.
    pub fn new(hasher: Arc<dyn Hasher>, depth: usize) -> Result<Self, SmtError> {
        if depth == 0 || depth > MAX_DEPTH {
            return Err(SmtError::InvalidDepth(depth));
        }
        let empty = EmptyRoots::compute(hasher.as_ref(), depth)?;
        tracing::debug!(
            target: "grove::hasher",
            hasher = hasher.name(),
            depth,
            "empty subtree table computed"
        );
        Ok(Self {
            hasher,
            empty: Arc::new(empty),
        })
    }

    /// Tree depth the table was computed for.
    pub fn depth(&self) -> usize {
        self.empty.depth()
    }

    /// Name of the underlying hash.
    pub fn name(&self) -> &'static str {
        self.hasher.name()
    }

    /// Hash two children into their parent.
    pub fn parent(&self, left: &Fp, right: &Fp) -> Result<Fp, SmtError> {
        self.hasher.parent(left, right)
    }

    /// Root of an empty subtree of height `level`.
    ///
    /// # Panics
    ///
    /// If `level` is above the tree depth.
    pub fn empty_root_at_level(&self, level: usize) -> Fp {
        self.empty.as_slice()[level]
    }

    /// Root of the fully empty tree.
    pub fn empty_root(&self) -> Fp {
        self.empty_root_at_level(self.depth())
    }

    /// The full precomputed table.
    pub fn empty_roots(&self) -> &EmptyRoots {
        &self.empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ToyHasher;

    fn fp_hex(s: &str) -> Fp {
        let bytes: [u8; 32] = hex::decode(s).unwrap().try_into().unwrap();
        Fp::from_be_bytes_reduced(bytes)
    }

    fn assert_recurrence(hasher: Arc<dyn Hasher>, depth: usize) {
        let table = TreeHasher::new(hasher.clone(), depth).unwrap();
        assert_eq!(table.empty_root_at_level(0), hasher.empty_leaf());
        for k in 1..=depth {
            let below = table.empty_root_at_level(k - 1);
            assert_eq!(table.empty_root_at_level(k), hasher.parent(&below, &below).unwrap());
        }
        assert_eq!(table.empty_root(), table.empty_root_at_level(depth));
    }

    #[test]
    fn test_empty_table_recurrence_keccak() {
        assert_recurrence(Arc::new(KeccakHasher), 48);
    }

    #[test]
    fn test_empty_table_recurrence_poseidon() {
        assert_recurrence(Arc::new(PoseidonHasher::new()), 16);
    }

    #[test]
    fn test_empty_table_recurrence_toy() {
        assert_recurrence(Arc::new(ToyHasher), 3);
    }

    #[test]
    fn test_keccak_zero_pair() {
        let hash = KeccakHasher.parent(&Fp::ZERO, &Fp::ZERO).unwrap();
        assert_eq!(
            hash,
            fp_hex("ad3228b676f7d3cd4284a5443f17f1962b36e491b30a40b2405849e597ba5fb5")
        );
    }

    #[test]
    fn test_poseidon_zero_pair_matches_circomlib() {
        let hash = PoseidonHasher::new().parent(&Fp::ZERO, &Fp::ZERO).unwrap();
        assert_eq!(
            hash,
            fp_hex("2098f5fb9e239eab3ceac3f27b81e481dc3124d55ffed523a839ee8446b64864")
        );
    }

    #[test]
    fn test_hashers_are_order_sensitive() {
        let (a, b) = (Fp::from(1), Fp::from(2));
        assert_ne!(KeccakHasher.parent(&a, &b).unwrap(), KeccakHasher.parent(&b, &a).unwrap());
        let poseidon = PoseidonHasher::new();
        assert_ne!(poseidon.parent(&a, &b).unwrap(), poseidon.parent(&b, &a).unwrap());
    }

    #[test]
    fn test_poseidon_instance_is_reused() {
        let poseidon = PoseidonHasher::new();
        let first = poseidon.parent(&Fp::from(3), &Fp::from(4)).unwrap();
        assert!(poseidon.state.lock().unwrap().is_some());
        // the retained sponge starts clean on every call
        for _ in 0..3 {
            assert_eq!(poseidon.parent(&Fp::from(3), &Fp::from(4)).unwrap(), first);
        }
        let fresh = PoseidonHasher::new();
        assert_eq!(fresh.parent(&Fp::from(3), &Fp::from(4)).unwrap(), first);
    }

    #[test]
    fn test_invalid_depth() {
        assert!(matches!(
            TreeHasher::new(Arc::new(KeccakHasher), 0),
            Err(SmtError::InvalidDepth(0))
        ));
        assert!(matches!(
            TreeHasher::new(Arc::new(KeccakHasher), MAX_DEPTH + 1),
            Err(SmtError::InvalidDepth(_))
        ));
    }
}
