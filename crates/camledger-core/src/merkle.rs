//! Binary Merkle tree over a block's transaction hashes.
//!
//! Nodes live in one owned arena (`Vec<Node>`) and refer to each other by
//! index; [`NIL`] marks a missing link. Leaves occupy `nodes[..leaf_count]`
//! in input order, every level follows, and the root is the last node pushed.
//! Children therefore always precede their parent in the arena.
//!
//! Construction pairs nodes left to right. When a level has an odd number of
//! nodes, the last one is combined with itself (`combine(h, h)`) and becomes
//! both children of its parent. Proof generation and verification follow the
//! same rule, so a duplicated node shows up in a proof as a right-hand
//! sibling equal to the running hash.
//!
//! `add_leaf` and `update_leaf` rebuild the whole tree, O(N) per call. Blocks
//! hold at most a hundred transactions so this is the intended cost.

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::hash::Hash;
use crate::hashing::HashingService;

/// Sentinel index meaning "no link".
pub const NIL: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub hash: Hash,
    pub is_leaf: bool,
    pub left: u32,
    pub right: u32,
    pub parent: u32,
}

impl Node {
    fn leaf(hash: Hash) -> Self {
        Self {
            hash,
            is_leaf: true,
            left: NIL,
            right: NIL,
            parent: NIL,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofStep {
    pub sibling_hash: Hash,
    /// The sibling sits to the left of the running hash.
    pub sibling_is_left: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProof {
    pub target_hash: Hash,
    pub steps: Vec<ProofStep>,
    pub expected_root: Hash,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleTree {
    nodes: Vec<Node>,
    leaf_count: u32,
    root: u32,
}

impl MerkleTree {
    /// Build a tree bottom-up from at least one leaf hash.
    pub fn build(leaves: &[Hash], hasher: &HashingService) -> Result<Self> {
        if leaves.is_empty() {
            return Err(LedgerError::Validation(
                "merkle tree needs at least one leaf".into(),
            ));
        }
        let leaf_count = u32::try_from(leaves.len())
            .ok()
            .filter(|n| *n < NIL / 2)
            .ok_or_else(|| LedgerError::Capacity("too many merkle leaves".into()))?;

        let mut nodes: Vec<Node> = Vec::with_capacity(leaves.len() * 2);
        nodes.extend(leaves.iter().copied().map(Node::leaf));

        let mut level: Vec<u32> = (0..leaf_count).collect();
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            for pair in level.chunks(2) {
                let left = pair[0];
                let right = pair.get(1).copied().unwrap_or(left);
                let hash = hasher.combine(
                    &nodes[left as usize].hash,
                    &nodes[right as usize].hash,
                );
                let idx = nodes.len() as u32;
                nodes.push(Node {
                    hash,
                    is_leaf: false,
                    left,
                    right,
                    parent: NIL,
                });
                nodes[left as usize].parent = idx;
                nodes[right as usize].parent = idx;
                next.push(idx);
            }
            level = next;
        }

        Ok(Self {
            root: level[0],
            nodes,
            leaf_count,
        })
    }

    pub fn root_hash(&self) -> Hash {
        self.nodes[self.root as usize].hash
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count as usize
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn leaves(&self) -> Vec<Hash> {
        self.nodes[..self.leaf_count as usize]
            .iter()
            .map(|n| n.hash)
            .collect()
    }

    /// Number of levels above the leaves.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut idx = 0u32;
        while self.nodes[idx as usize].parent != NIL {
            idx = self.nodes[idx as usize].parent;
            depth += 1;
        }
        depth
    }

    /// Collect the sibling path from the first leaf equal to `target` up to
    /// the root.
    pub fn generate_proof(&self, target: &Hash) -> Result<MerkleProof> {
        let mut idx = self.nodes[..self.leaf_count as usize]
            .iter()
            .position(|n| n.hash == *target)
            .ok_or_else(|| {
                LedgerError::Validation(format!("{} is not a leaf of this tree", target.short()))
            })? as u32;

        let mut steps = Vec::new();
        loop {
            let parent = self.nodes[idx as usize].parent;
            if parent == NIL {
                break;
            }
            let p = &self.nodes[parent as usize];
            let step = if p.left == idx {
                ProofStep {
                    sibling_hash: self.nodes[p.right as usize].hash,
                    sibling_is_left: false,
                }
            } else {
                ProofStep {
                    sibling_hash: self.nodes[p.left as usize].hash,
                    sibling_is_left: true,
                }
            };
            steps.push(step);
            idx = parent;
        }

        Ok(MerkleProof {
            target_hash: *target,
            steps,
            expected_root: self.root_hash(),
        })
    }

    /// Replay the proof from its target and compare with its expected root.
    pub fn verify_proof(proof: &MerkleProof, hasher: &HashingService) -> bool {
        let mut acc = proof.target_hash;
        for step in &proof.steps {
            acc = if step.sibling_is_left {
                hasher.combine(&step.sibling_hash, &acc)
            } else {
                hasher.combine(&acc, &step.sibling_hash)
            };
        }
        acc == proof.expected_root
    }

    /// Like [`verify_proof`](Self::verify_proof) but also pins the root the
    /// caller trusts, e.g. a block header's merkle root.
    pub fn verify_proof_against(proof: &MerkleProof, root: &Hash, hasher: &HashingService) -> bool {
        proof.expected_root == *root && Self::verify_proof(proof, hasher)
    }

    pub fn add_leaf(&mut self, leaf: Hash, hasher: &HashingService) -> Result<()> {
        let mut leaves = self.leaves();
        leaves.push(leaf);
        *self = Self::build(&leaves, hasher)?;
        Ok(())
    }

    pub fn update_leaf(&mut self, index: usize, leaf: Hash, hasher: &HashingService) -> Result<()> {
        if index >= self.leaf_count() {
            return Err(LedgerError::Validation(format!(
                "leaf index {index} out of range (have {})",
                self.leaf_count
            )));
        }
        let mut leaves = self.leaves();
        leaves[index] = leaf;
        *self = Self::build(&leaves, hasher)?;
        Ok(())
    }

    /// Structural check of the arena: every link is in range, parent and
    /// child references agree, leaves have no children, internal nodes have
    /// both, children precede parents and there is exactly one root.
    pub fn validate(&self) -> bool {
        let len = self.nodes.len();
        let leaf_count = self.leaf_count as usize;
        if len == 0 || leaf_count == 0 || leaf_count > len || self.root as usize >= len {
            return false;
        }
        if self.nodes[self.root as usize].parent != NIL {
            return false;
        }

        let mut roots = 0;
        for (i, node) in self.nodes.iter().enumerate() {
            let idx = i as u32;
            if node.is_leaf != (i < leaf_count) {
                return false;
            }
            if node.is_leaf {
                if node.left != NIL || node.right != NIL {
                    return false;
                }
            } else {
                if node.left == NIL || node.right == NIL {
                    return false;
                }
                if node.left >= idx || node.right >= idx {
                    return false;
                }
                if self.nodes[node.left as usize].parent != idx
                    || self.nodes[node.right as usize].parent != idx
                {
                    return false;
                }
            }
            if node.parent == NIL {
                roots += 1;
                if idx != self.root {
                    return false;
                }
            } else {
                let Some(parent) = self.nodes.get(node.parent as usize) else {
                    return false;
                };
                if parent.left != idx && parent.right != idx {
                    return false;
                }
            }
        }
        roots == 1
    }

    /// Recompute every internal hash from its children.
    pub fn verify_hashes(&self, hasher: &HashingService) -> bool {
        self.nodes.iter().filter(|n| !n.is_leaf).all(|n| {
            n.hash
                == hasher.combine(
                    &self.nodes[n.left as usize].hash,
                    &self.nodes[n.right as usize].hash,
                )
        })
    }

    /// Compact binary snapshot of the arena.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| LedgerError::Parse(format!("encode merkle tree: {e}")))
    }

    /// Restore a snapshot written by [`to_bytes`](Self::to_bytes). The arena
    /// is structurally validated before it is handed out.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let tree: MerkleTree = bincode::deserialize(bytes)
            .map_err(|e| LedgerError::Parse(format!("decode merkle tree: {e}")))?;
        if !tree.validate() {
            return Err(LedgerError::Parse("merkle tree snapshot is inconsistent".into()));
        }
        Ok(tree)
    }
}
