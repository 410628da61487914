//! Observable state of the ledger: health, status snapshots, verification
//! reports and ingestion outcomes. Everything here is derived and can be
//! recomputed from the chain at any time.

use serde::Serialize;

use crate::hash::Hash;
use crate::hashing::HashStats;
use crate::merkle::MerkleProof;
use crate::transaction::{Transaction, TransactionType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
pub enum HealthState {
    #[default]
    Uninitialized,
    Healthy,
    /// An integrity mismatch was observed. Ingestion continues; only an
    /// operator action (clear or reinitialize) leaves this state.
    Degraded,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockchainStatus {
    pub state: HealthState,
    pub initialized: bool,
    pub healthy: bool,
    pub node_id: String,
    /// Number of finalized blocks ever appended, including evicted ones.
    pub total_blocks: u32,
    pub blocks_in_memory: usize,
    pub transactions_in_memory: u64,
    pub pending_transactions: usize,
    pub unpersisted_blocks: usize,
    pub last_block_number: Option<u32>,
    pub last_block_hash: Option<Hash>,
    pub last_block_time: u64,
    pub last_verification_time: Option<u64>,
    pub integrity_verified: bool,
    pub last_error: Option<String>,
    pub hash_stats: HashStats,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityIssue {
    pub block_number: u32,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub blocks_checked: usize,
    pub transactions_checked: usize,
    pub first_block: Option<u32>,
    pub last_block: Option<u32>,
    /// Blocks whose own content does not reproduce their stored hashes.
    pub invalid_blocks: Vec<IntegrityIssue>,
    /// Blocks whose previous hash does not match their predecessor.
    pub broken_links: Vec<IntegrityIssue>,
    pub checked_at: u64,
}

impl IntegrityReport {
    pub fn mismatches(&self) -> usize {
        self.invalid_blocks.len() + self.broken_links.len()
    }

    pub fn is_clean(&self) -> bool {
        self.mismatches() == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IgnoreReason {
    /// The transaction type is switched off in the config.
    Disabled(TransactionType),
    /// AI detection below the configured confidence threshold.
    LowConfidence,
}

/// Outcome of a successful `add_*` call.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(
    tag = "outcome",
    content = "detail",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Ingested {
    Appended {
        block_number: u32,
        index: usize,
        /// The append triggered the creation policy and sealed this block.
        sealed: Option<Hash>,
    },
    Ignored(IgnoreReason),
}

impl Ingested {
    pub fn is_appended(&self) -> bool {
        matches!(self, Ingested::Appended { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionProof {
    pub block_number: u32,
    pub block_hash: Option<Hash>,
    pub transaction: Transaction,
    pub proof: MerkleProof,
}
