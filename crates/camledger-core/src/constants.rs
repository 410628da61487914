pub const HASH_SIZE: usize = 32;
pub const HASH_HEX_SIZE: usize = HASH_SIZE * 2;

/// Chunk size used when streaming files through the hasher.
pub const FILE_CHUNK_SIZE: usize = 4096;

pub const MIN_TRANSACTIONS_PER_BLOCK: u16 = 1;
pub const MAX_TRANSACTIONS_PER_BLOCK: u16 = 100;
pub const MIN_BLOCK_INTERVAL_SECS: u64 = 10;
pub const MAX_BLOCK_INTERVAL_SECS: u64 = 24 * 60 * 60;
pub const MIN_INTEGRITY_INTERVAL_SECS: u64 = 10;
pub const MAX_INTEGRITY_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;
pub const MAX_NODE_ID_LEN: usize = 32;

pub const CHAIN_FILE: &str = "chain.json";
pub const BLOCK_FILE_PREFIX: &str = "block_";
pub const BLOCK_FILE_SUFFIX: &str = ".json";

pub const GENESIS_EVENT: &str = "genesis";
pub const GENESIS_METADATA: &str = r#"{"event":"genesis","message":"camledger integrity chain"}"#;

/// File name of the standalone backup written for a finalized block.
pub fn block_file_name(block_number: u32) -> String {
    format!("{BLOCK_FILE_PREFIX}{block_number}{BLOCK_FILE_SUFFIX}")
}

/// Upper bound on a transaction's opaque metadata text.
pub const MAX_METADATA_LEN: usize = 2048;
