use serde::{Deserialize, Serialize};

use crate::{
    crypto::{HashBytes, hash, hash_parts},
    error::{Error, Result},
};

/// Binary Merkle tree over 32-byte leaves. An odd node at any level is
/// carried up unchanged; the root of an empty tree is `H("")`.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<HashBytes>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: String,
    pub sibling_is_left: bool,
}

/// Inclusion proof of one leaf, hex encoded for the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub path: Vec<ProofStep>,
}

fn combine(left: &HashBytes, right: &HashBytes) -> HashBytes {
    hash_parts([left.as_slice(), right.as_slice()])
}

impl MerkleTree {
    pub fn new(leaves: Vec<HashBytes>) -> Self {
        let mut levels = vec![leaves];
        while levels.last().is_some_and(|level| level.len() > 1) {
            let current = &levels[levels.len() - 1];
            let next = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => combine(left, right),
                    [single] => *single,
                    _ => unreachable!(),
                })
                .collect();
            levels.push(next);
        }
        Self { levels }
    }

    pub fn from_hex_leaves<S: AsRef<str>>(leaves: &[S]) -> Option<Self> {
        let leaves = leaves
            .iter()
            .map(|l| decode_hash(l.as_ref()))
            .collect::<Option<Vec<_>>>()?;
        Some(Self::new(leaves))
    }

    pub fn len(&self) -> usize {
        self.levels[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels[0].is_empty()
    }

    pub fn root(&self) -> HashBytes {
        match self.levels.last().and_then(|level| level.first()) {
            Some(root) if !self.is_empty() => *root,
            _ => hash(b""),
        }
    }

    pub fn root_hex(&self) -> String {
        hex::encode(self.root())
    }

    pub fn proof(&self, leaf_index: usize) -> Option<MerkleProof> {
        if leaf_index >= self.len() {
            return None;
        }
        let mut path = vec![];
        let mut index = leaf_index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_index = index ^ 1;
            if let Some(sibling) = level.get(sibling_index) {
                path.push(ProofStep {
                    sibling: hex::encode(sibling),
                    sibling_is_left: sibling_index < index,
                });
            }
            index /= 2;
        }
        Some(MerkleProof { leaf_index, path })
    }
}

pub fn merkle_root(leaves: Vec<HashBytes>) -> HashBytes {
    MerkleTree::new(leaves).root()
}

pub fn merkle_root_hex<S: AsRef<str>>(leaves: &[S]) -> Option<String> {
    MerkleTree::from_hex_leaves(leaves).map(|t| t.root_hex())
}

pub fn decode_hash(hex_hash: &str) -> Option<HashBytes> {
    hex::decode(hex_hash).ok()?.try_into().ok()
}

impl MerkleProof {
    pub fn verify(&self, leaf: &HashBytes, root_hex: &str) -> bool {
        let Some(root) = decode_hash(root_hex) else {
            return false;
        };
        let mut acc = *leaf;
        for step in &self.path {
            let Some(sibling) = decode_hash(&step.sibling) else {
                return false;
            };
            acc = if step.sibling_is_left {
                combine(&sibling, &acc)
            } else {
                combine(&acc, &sibling)
            };
        }
        acc == root
    }
}

/// Streaming builder of a blobber column: shard hashes arrive in chunk
/// order. Only the roots of the complete subtrees seen so far are kept, so
/// the state is logarithmic in the number of leaves and cheap to persist.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnHasher {
    #[serde(default)]
    pub len: u64,
    /// `frontier[h]` is the root of a complete subtree of `2^h` leaves.
    #[serde(default)]
    pub frontier: Vec<Option<String>>,
}

fn frontier_node(node: &str) -> Result<HashBytes> {
    decode_hash(node).ok_or_else(|| Error::internal(format!("malformed column hash {}", node)))
}

impl ColumnHasher {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, shard_hash: &str) -> Result<()> {
        let mut carry = frontier_node(shard_hash)?;
        for slot in self.frontier.iter_mut() {
            let Some(left) = slot.as_deref() else {
                *slot = Some(hex::encode(carry));
                self.len += 1;
                return Ok(());
            };
            carry = combine(&frontier_node(left)?, &carry);
            *slot = None;
        }
        self.frontier.push(Some(hex::encode(carry)));
        self.len += 1;
        Ok(())
    }

    /// Occupied slots spell `len` in binary.
    pub fn is_consistent(&self) -> bool {
        self.frontier.len() <= 64
            && self.len.checked_shr(self.frontier.len() as u32).unwrap_or(0) == 0
            && self
                .frontier
                .iter()
                .enumerate()
                .all(|(h, slot)| slot.is_some() == ((self.len >> h) & 1 == 1))
    }

    /// Same root as [`MerkleTree`] over the pushed leaves: partial subtrees
    /// fold from the right.
    pub fn root_hex(&self) -> Option<String> {
        let mut acc: Option<HashBytes> = None;
        for node in self.frontier.iter().flatten() {
            let node = decode_hash(node)?;
            acc = Some(match acc {
                Some(right) => combine(&node, &right),
                None => node,
            });
        }
        Some(hex::encode(acc.unwrap_or_else(|| hash(b""))))
    }
}
