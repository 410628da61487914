//! Blocks: a header plus an ordered list of transactions.
//!
//! A block starts out open and accepts transactions. `finalize` seals it:
//! the merkle root is computed over each transaction's content hash and the
//! block hash over the canonical encoding of the header. A finalized block
//! never accepts another transaction, and `validate` recomputes both hashes
//! to detect any out-of-band edit.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::CanonicalEncoder;
use crate::constants::{GENESIS_EVENT, GENESIS_METADATA};
use crate::error::{LedgerError, Result};
use crate::hash::{self, Hash};
use crate::hashing::HashingService;
use crate::merkle::{MerkleProof, MerkleTree};
use crate::transaction::{Transaction, TransactionType};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub block_number: u32,
    /// Absent only for genesis.
    #[serde(with = "hash::optional")]
    pub previous_hash: Option<Hash>,
    /// Absent until the block is finalized.
    #[serde(with = "hash::optional")]
    pub merkle_root: Option<Hash>,
    pub timestamp: u64,
    /// Reserved, always 0.
    pub nonce: u32,
    pub transaction_count: u16,
    pub node_id: String,
}

impl BlockHeader {
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut enc = CanonicalEncoder::new("camledger/header/v1");
        enc.put_u32(self.block_number)
            .put_opt_hash(self.previous_hash.as_ref())
            .put_opt_hash(self.merkle_root.as_ref())
            .put_u64(self.timestamp)
            .put_u32(self.nonce)
            .put_u16(self.transaction_count)
            .put_str(&self.node_id);
        enc.finish()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    #[serde(with = "hash::optional")]
    pub block_hash: Option<Hash>,
    pub finalized: bool,
}

impl Block {
    /// Open an empty block.
    pub fn new(
        block_number: u32,
        previous_hash: Option<Hash>,
        node_id: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            header: BlockHeader {
                block_number,
                previous_hash,
                merkle_root: None,
                timestamp,
                nonce: 0,
                transaction_count: 0,
                node_id: node_id.into(),
            },
            transactions: Vec::new(),
            block_hash: None,
            finalized: false,
        }
    }

    /// Block 0: no predecessor and a single fixed SystemEvent transaction.
    pub fn genesis(node_id: &str, timestamp: u64, hasher: &HashingService) -> Result<Self> {
        let mut block = Self::new(0, None, node_id, timestamp);
        block.add_transaction(Transaction::new(
            TransactionType::SystemEvent,
            hasher.hash(GENESIS_EVENT.as_bytes()),
            GENESIS_METADATA,
            timestamp,
            GENESIS_EVENT.len() as u64,
        ))?;
        block.finalize(hasher)?;
        Ok(block)
    }

    pub fn number(&self) -> u32 {
        self.header.block_number
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn hash_hex(&self) -> String {
        self.block_hash.map(|h| h.to_hex()).unwrap_or_default()
    }

    /// Block 0 with no previous hash and exactly one SystemEvent transaction.
    pub fn is_genesis_shaped(&self) -> bool {
        self.header.block_number == 0
            && self.header.previous_hash.is_none()
            && self.transactions.len() == 1
            && self.transactions[0].kind == TransactionType::SystemEvent
    }

    pub fn add_transaction(&mut self, tx: Transaction) -> Result<()> {
        if self.finalized {
            return Err(LedgerError::Capacity(format!(
                "block {} is finalized",
                self.header.block_number
            )));
        }
        if self.transactions.len() >= usize::from(u16::MAX) {
            return Err(LedgerError::Capacity(format!(
                "block {} is full",
                self.header.block_number
            )));
        }
        tx.validate()?;
        self.transactions.push(tx);
        self.header.transaction_count = self.transactions.len() as u16;
        Ok(())
    }

    /// Seal the block. Returns the block hash.
    pub fn finalize(&mut self, hasher: &HashingService) -> Result<Hash> {
        if self.finalized {
            return Err(LedgerError::Capacity(format!(
                "block {} is already finalized",
                self.header.block_number
            )));
        }
        if self.transactions.is_empty() {
            return Err(LedgerError::Validation(format!(
                "block {} has no transactions",
                self.header.block_number
            )));
        }
        self.header.transaction_count = self.transactions.len() as u16;
        self.header.merkle_root = Some(self.compute_merkle_root(hasher)?);
        let block_hash = self.compute_hash(hasher);
        self.block_hash = Some(block_hash);
        self.finalized = true;
        debug!(
            block = self.header.block_number,
            txs = self.transactions.len(),
            hash = %block_hash.short(),
            "finalized block"
        );
        Ok(block_hash)
    }

    pub fn merkle_tree(&self, hasher: &HashingService) -> Result<MerkleTree> {
        let leaves: Vec<Hash> = self
            .transactions
            .iter()
            .map(|tx| tx.content_hash(hasher))
            .collect();
        MerkleTree::build(&leaves, hasher)
    }

    pub fn compute_merkle_root(&self, hasher: &HashingService) -> Result<Hash> {
        Ok(self.merkle_tree(hasher)?.root_hash())
    }

    /// Hash of the canonical header encoding.
    pub fn compute_hash(&self, hasher: &HashingService) -> Hash {
        hasher.hash(&self.header.canonical_bytes())
    }

    /// Inclusion proof for the transaction at `index`.
    pub fn transaction_proof(&self, index: usize, hasher: &HashingService) -> Result<MerkleProof> {
        let tx = self.transactions.get(index).ok_or_else(|| {
            LedgerError::Validation(format!(
                "block {} has no transaction {index}",
                self.header.block_number
            ))
        })?;
        let tree = self.merkle_tree(hasher)?;
        tree.generate_proof(&tx.content_hash(hasher))
    }

    /// Recompute everything a finalized block commits to. The error names
    /// the first check that failed.
    pub fn validate(&self, hasher: &HashingService) -> Result<()> {
        let n = self.header.block_number;
        if !self.finalized {
            return Err(LedgerError::Integrity(format!("block {n} is not finalized")));
        }
        if usize::from(self.header.transaction_count) != self.transactions.len() {
            return Err(LedgerError::Integrity(format!(
                "block {n} header counts {} transactions, body has {}",
                self.header.transaction_count,
                self.transactions.len()
            )));
        }
        if self.transactions.is_empty() {
            return Err(LedgerError::Integrity(format!("block {n} is empty")));
        }
        for (i, tx) in self.transactions.iter().enumerate() {
            tx.validate()
                .map_err(|e| LedgerError::Integrity(format!("block {n} transaction {i}: {e}")))?;
        }
        let root = self.compute_merkle_root(hasher)?;
        if self.header.merkle_root != Some(root) {
            return Err(LedgerError::Integrity(format!(
                "block {n} merkle root mismatch: stored={}, computed={root}",
                opt_hex(self.header.merkle_root)
            )));
        }
        let hash = self.compute_hash(hasher);
        if self.block_hash != Some(hash) {
            return Err(LedgerError::Integrity(format!(
                "block {n} hash mismatch: stored={}, computed={hash}",
                opt_hex(self.block_hash)
            )));
        }
        Ok(())
    }

    pub fn is_valid(&self, hasher: &HashingService) -> bool {
        self.validate(hasher).is_ok()
    }

    /// Structured document for this block.
    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn deserialize(doc: &str) -> Result<Self> {
        Ok(serde_json::from_str(doc)?)
    }
}

fn opt_hex(h: Option<Hash>) -> String {
    h.map(|h| h.to_hex()).unwrap_or_else(|| "<none>".into())
}
