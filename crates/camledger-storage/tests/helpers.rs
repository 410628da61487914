#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use camledger_core::{BlockchainConfig, BlockchainManager, ManualClock, Storage};
use camledger_storage::SledStore;
use tempfile::{tempdir, TempDir};

pub const NOW: u64 = 1_700_000_000;

pub fn create_temp_dir() -> (TempDir, PathBuf) {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let path = temp_dir.path().to_path_buf();
    (temp_dir, path)
}

pub fn create_temp_store() -> (TempDir, SledStore) {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let store = SledStore::open(temp_dir.path().join("db")).expect("Failed to open SledStore");
    (temp_dir, store)
}

/// Open the sled db at `path` again. The previous handle's flusher thread
/// can hold the file lock briefly after drop, so a lock failure is retried.
pub fn reopen_store(path: &Path) -> anyhow::Result<SledStore> {
    let mut attempts = 0;
    loop {
        match SledStore::open(path) {
            Ok(store) => return Ok(store),
            Err(e) if attempts < 50 => {
                attempts += 1;
                tracing::debug!(attempts, "sled reopen failed, retrying: {e:#}");
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(e),
        }
    }
}

pub fn teardown_store(temp_dir: TempDir, store: SledStore) {
    let path = temp_dir.path().to_path_buf();
    store.clear().expect("Failed to clear the store");
    drop(store);
    temp_dir.close().expect("Failed to delete temp dir");
    let _ = fs::remove_dir_all(&path);
    assert!(!path.exists(), "Temp directory should be removed");
}

pub fn test_config(max_tx: u16, max_blocks_in_memory: usize) -> BlockchainConfig {
    BlockchainConfig {
        node_id: "trail-cam-07".into(),
        max_transactions_per_block: max_tx,
        block_creation_interval: 60,
        integrity_check_interval: 600,
        max_blocks_in_memory,
        ..Default::default()
    }
}

pub fn open_manager(
    storage: Box<dyn Storage>,
    clock: &ManualClock,
    config: BlockchainConfig,
) -> anyhow::Result<BlockchainManager> {
    let mut manager = BlockchainManager::new(storage, Box::new(clock.clone()));
    manager.initialize(config)?;
    Ok(manager)
}
