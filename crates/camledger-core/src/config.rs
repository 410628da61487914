//! Ledger configuration and its bounds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{LedgerError, Result};
use crate::transaction::TransactionType;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockchainConfig {
    pub node_id: String,
    pub max_transactions_per_block: u16,
    /// Seconds after the last block at which a non-empty block is rolled.
    pub block_creation_interval: u64,
    /// Seconds between full-chain re-verifications in `update()`.
    pub integrity_check_interval: u64,
    pub max_blocks_in_memory: usize,
    /// AI detections below this confidence are accepted but not recorded.
    pub min_ai_confidence: f32,
    /// Rewrite the aggregate chain document after every finalized block.
    pub save_chain_on_block: bool,
    pub enable_image_capture: bool,
    pub enable_ai_detection: bool,
    pub enable_sensor_data: bool,
    pub enable_system_events: bool,
    pub enable_power_events: bool,
    pub enable_network_events: bool,
}

impl Default for BlockchainConfig {
    fn default() -> Self {
        Self {
            node_id: "camledger-node".into(),
            max_transactions_per_block: 50,
            block_creation_interval: 300,
            integrity_check_interval: 3600,
            max_blocks_in_memory: 10,
            min_ai_confidence: 0.5,
            save_chain_on_block: true,
            enable_image_capture: true,
            enable_ai_detection: true,
            enable_sensor_data: true,
            enable_system_events: true,
            enable_power_events: true,
            enable_network_events: true,
        }
    }
}

impl BlockchainConfig {
    pub fn from_json(doc: &str) -> Result<Self> {
        serde_json::from_str(doc).map_err(|e| LedgerError::Config(format!("invalid config: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let doc = std::fs::read_to_string(path)
            .map_err(|e| LedgerError::io(format!("read {}", path.display()), e))?;
        Self::from_json(&doc)
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_TRANSACTIONS_PER_BLOCK..=MAX_TRANSACTIONS_PER_BLOCK)
            .contains(&self.max_transactions_per_block)
        {
            return Err(LedgerError::Config(format!(
                "max_transactions_per_block must be in [{MIN_TRANSACTIONS_PER_BLOCK}, {MAX_TRANSACTIONS_PER_BLOCK}], got {}",
                self.max_transactions_per_block
            )));
        }
        if !(MIN_BLOCK_INTERVAL_SECS..=MAX_BLOCK_INTERVAL_SECS).contains(&self.block_creation_interval) {
            return Err(LedgerError::Config(format!(
                "block_creation_interval must be in [{MIN_BLOCK_INTERVAL_SECS}, {MAX_BLOCK_INTERVAL_SECS}] seconds, got {}",
                self.block_creation_interval
            )));
        }
        if !(MIN_INTEGRITY_INTERVAL_SECS..=MAX_INTEGRITY_INTERVAL_SECS)
            .contains(&self.integrity_check_interval)
        {
            return Err(LedgerError::Config(format!(
                "integrity_check_interval must be in [{MIN_INTEGRITY_INTERVAL_SECS}, {MAX_INTEGRITY_INTERVAL_SECS}] seconds, got {}",
                self.integrity_check_interval
            )));
        }
        let id_len = self.node_id.chars().count();
        if id_len == 0 || id_len > MAX_NODE_ID_LEN {
            return Err(LedgerError::Config(format!(
                "node_id must be 1..={MAX_NODE_ID_LEN} characters, got {id_len}"
            )));
        }
        if self.max_blocks_in_memory == 0 {
            return Err(LedgerError::Config("max_blocks_in_memory must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.min_ai_confidence) {
            return Err(LedgerError::Config(format!(
                "min_ai_confidence must be in [0, 1], got {}",
                self.min_ai_confidence
            )));
        }
        Ok(())
    }

    pub fn is_enabled(&self, kind: TransactionType) -> bool {
        match kind {
            TransactionType::ImageCapture => self.enable_image_capture,
            TransactionType::AiDetection => self.enable_ai_detection,
            TransactionType::SensorData => self.enable_sensor_data,
            TransactionType::SystemEvent => self.enable_system_events,
            TransactionType::PowerEvent => self.enable_power_events,
            TransactionType::NetworkEvent => self.enable_network_events,
        }
    }

    pub fn block_interval(&self) -> Duration {
        Duration::from_secs(self.block_creation_interval)
    }

    pub fn integrity_interval(&self) -> Duration {
        Duration::from_secs(self.integrity_check_interval)
    }
}
