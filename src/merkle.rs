//! Merkle tree over snapshot leaves.
//!
//! The tree binds an ordered list of leaf hashes to a single root, with
//! O(log n) inclusion proofs: a consumer holding only the root can check
//! that a specific leaf participated in it without re-hashing the rest
//! of the snapshot.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::hash_bytes;

/// Which side of the running hash a proof sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofSide {
    Left,
    Right,
}

/// One step of an inclusion proof: the sibling hash and its side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub hash: String,
    pub side: ProofSide,
}

/// An inclusion proof for a single leaf, ordered leaf-to-root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MerkleProof {
    pub steps: Vec<ProofStep>,
}

/// A balanced Merkle tree built from leaf hashes.
///
/// Adjacent hashes are paired left-to-right; an odd node at the end of a
/// level is paired with itself. Interior nodes hash the concatenation of
/// the two child hex strings.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<String>>,
}

impl MerkleTree {
    /// Build a tree from leaf hashes. Fails on an empty leaf list.
    pub fn new(leaves: Vec<String>) -> Result<Self> {
        if leaves.is_empty() {
            return Err(Error::EmptyMerkle);
        }

        let mut levels = vec![leaves];
        while levels.last().map(Vec::len).unwrap_or(0) > 1 {
            let current = levels.last().expect("levels is non-empty");
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                next.push(hash_bytes(format!("{}{}", left, right).as_bytes()));
            }
            levels.push(next);
        }

        Ok(Self { levels })
    }

    /// The root hash of the tree.
    pub fn root(&self) -> &str {
        &self.levels.last().expect("tree has a root")[0]
    }

    /// Number of leaves the tree was built from.
    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    /// The leaf hashes, in order.
    pub fn leaves(&self) -> &[String] {
        &self.levels[0]
    }

    /// Inclusion proof for the leaf at `index`.
    pub fn proof(&self, index: usize) -> Result<MerkleProof> {
        if index >= self.leaf_count() {
            return Err(Error::ProofIndexOutOfRange {
                index,
                leaves: self.leaf_count(),
            });
        }

        let mut steps = Vec::new();
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = idx ^ 1;
            // An odd tail node is its own sibling and needs no step: the
            // verifier re-pairs it with the running hash implicitly.
            let (hash, side) = if sibling < level.len() {
                let side = if sibling < idx {
                    ProofSide::Left
                } else {
                    ProofSide::Right
                };
                (level[sibling].clone(), side)
            } else {
                (level[idx].clone(), ProofSide::Right)
            };
            steps.push(ProofStep { hash, side });
            idx /= 2;
        }

        Ok(MerkleProof { steps })
    }

    /// Verify that `leaf_hash` folds up to `root` through `proof`.
    pub fn verify_proof(leaf_hash: &str, proof: &MerkleProof, root: &str) -> bool {
        let mut current = leaf_hash.to_string();
        for step in &proof.steps {
            let combined = match step.side {
                ProofSide::Left => format!("{}{}", step.hash, current),
                ProofSide::Right => format!("{}{}", current, step.hash),
            };
            current = hash_bytes(combined.as_bytes());
        }
        current == root
    }
}
