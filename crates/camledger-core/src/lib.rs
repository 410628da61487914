//! Core of the camledger integrity ledger: hashing, Merkle trees, blocks,
//! transactions and the chain manager that ties them to storage.

pub mod block;
pub mod chain;
pub mod clock;
pub mod codec;
pub mod config;
pub mod constants;
pub mod error;
pub mod hash;
pub mod hashing;
pub mod merkle;
pub mod status;
pub mod storage;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use chain::BlockchainManager;
pub use clock::{Clock, ManualClock, SystemClock, Ticks};
pub use config::BlockchainConfig;
pub use error::{LedgerError, Result};
pub use hash::Hash;
pub use hashing::{HashStats, HashingService};
pub use merkle::{MerkleProof, MerkleTree, ProofStep};
pub use status::{
    BlockchainStatus, HealthState, IgnoreReason, Ingested, IntegrityIssue, IntegrityReport,
    TransactionProof,
};
pub use storage::{MemoryStorage, Storage};
pub use transaction::{Payload, Transaction, TransactionType};
