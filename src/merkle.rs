//! BLAKE3 Merkle tree over receipt `payload_hash` strings.
//!
//! Leaves are `blake3(leaf string bytes)`; internal nodes are
//! `blake3(left || right)`. A level with an odd node count duplicates its
//! last node. The root of an empty set is `blake3(b"empty")`.

use serde::{Deserialize, Serialize};

use crate::hash::blake3;

pub type Node = [u8; 32];

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn leaf_node(leaf: &str) -> Node {
    blake3(leaf.as_bytes())
}

pub fn hash_pair(left: &Node, right: &Node) -> Node {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    blake3(&buf)
}

pub fn empty_root() -> Node {
    blake3(b"empty")
}

// ---------------------------------------------------------------------------
// MerkleTree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    levels: Vec<Vec<Node>>,
}

impl MerkleTree {
    pub fn build<S: AsRef<str>>(leaves: &[S]) -> Self {
        let mut levels: Vec<Vec<Node>> = Vec::new();
        if leaves.is_empty() {
            return Self { levels };
        }
        let mut current: Vec<Node> = leaves.iter().map(|l| leaf_node(l.as_ref())).collect();
        while current.len() > 1 {
            let next: Vec<Node> = current
                .chunks(2)
                .map(|pair| {
                    let left = &pair[0];
                    hash_pair(left, pair.get(1).unwrap_or(left))
                })
                .collect();
            levels.push(current);
            current = next;
        }
        levels.push(current);
        Self { levels }
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    pub fn root(&self) -> Node {
        self.levels
            .last()
            .and_then(|top| top.first().copied())
            .unwrap_or_else(empty_root)
    }

    pub fn root_hex(&self) -> String {
        hex::encode(self.root())
    }

    /// Sibling path from leaf `index` up to (not including) the root.
    pub fn prove(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut siblings = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sib = idx ^ 1;
            let node = level.get(sib).unwrap_or(&level[idx]);
            siblings.push(hex::encode(node));
            idx /= 2;
        }
        Some(MerkleProof { leaf_index: index, siblings })
    }
}

// ---------------------------------------------------------------------------
// Proofs
// ---------------------------------------------------------------------------

/// Inclusion proof. Left/right placement at each level follows from the
/// corresponding bit of `leaf_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub siblings: Vec<String>,
}

impl MerkleProof {
    /// Recompute the root from `leaf` and this path. `None` if a sibling is
    /// not 32 bytes of hex.
    pub fn compute_root(&self, leaf: &str) -> Option<Node> {
        let mut current = leaf_node(leaf);
        let mut idx = self.leaf_index;
        for sib_hex in &self.siblings {
            let sib: Node = hex::decode(sib_hex).ok()?.try_into().ok()?;
            current = if idx % 2 == 0 {
                hash_pair(&current, &sib)
            } else {
                hash_pair(&sib, &current)
            };
            idx /= 2;
        }
        Some(current)
    }
}

pub fn verify_proof(leaf: &str, proof: &MerkleProof, root_hex: &str) -> bool {
    proof
        .compute_root(leaf)
        .is_some_and(|root| hex::encode(root) == root_hex)
}

/// Root over `leaves`, hex encoded.
pub fn merkle_root<S: AsRef<str>>(leaves: &[S]) -> String {
    MerkleTree::build(leaves).root_hex()
}
