//! Merkle root over snapshot item hashes
//!
//! Thin wrapper around `rs_merkle`. A snapshot records the root of its item
//! hashes at capture time; recomputing it later detects any in-memory
//! tampering with the item list.

use crate::hash::ContentHash;
use rs_merkle::{Hasher, MerkleTree};

/// Blake3 hasher adapter for rs_merkle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blake3Hasher;

impl Hasher for Blake3Hasher {
    type Hash = [u8; 32];

    #[inline]
    fn hash(data: &[u8]) -> Self::Hash {
        *blake3::hash(data).as_bytes()
    }
}

/// Compute the Merkle root of an ordered list of leaf hashes
///
/// Returns the zero hash for an empty list.
#[must_use]
pub fn merkle_root(leaves: &[ContentHash]) -> ContentHash {
    let leaves: Vec<[u8; 32]> = leaves.iter().map(|h| *h.as_bytes()).collect();
    MerkleTree::<Blake3Hasher>::from_leaves(&leaves)
        .root()
        .map(ContentHash::new)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_hashes(n: usize) -> Vec<ContentHash> {
        (0..n)
            .map(|i| ContentHash::compute(i.to_string().as_bytes()))
            .collect()
    }

    #[test]
    fn empty_root_is_zero() {
        assert!(merkle_root(&[]).is_zero());
    }

    #[test]
    fn root_is_deterministic() {
        let leaves = make_hashes(7);
        assert_eq!(merkle_root(&leaves), merkle_root(&leaves));
    }

    #[test]
    fn root_depends_on_order() {
        let leaves = make_hashes(4);
        let mut swapped = leaves.clone();
        swapped.swap(0, 3);
        assert_ne!(merkle_root(&leaves), merkle_root(&swapped));
    }
}
