//! The chain manager: owns the open block, the in-memory tail of the chain
//! and the persisted copy.
//!
//! Lifecycle: `Uninitialized → Healthy → Degraded`. `initialize` validates the
//! config, loads whatever the storage holds (the aggregate `chain.json` plus
//! any newer `block_<n>.json` files), creates genesis for an empty store and
//! opens the current block. Producers then call the `add_*` methods and the
//! host calls `update()` once per loop iteration.
//!
//! Everything runs synchronously on the caller's thread. There are no
//! internal tasks, so timeliness of block creation, re-verification and
//! eviction depends on `update()` being called regularly; a late call only
//! delays that work.

use std::collections::{BTreeSet, VecDeque};
use std::ops::RangeInclusive;

use tracing::{debug, info, warn};

use crate::block::Block;
use crate::clock::{Clock, SystemClock, Ticks};
use crate::config::BlockchainConfig;
use crate::constants::{block_file_name, CHAIN_FILE};
use crate::error::{LedgerError, Result};
use crate::hash::Hash;
use crate::hashing::{HashStats, HashingService};
use crate::status::{
    BlockchainStatus, HealthState, IgnoreReason, Ingested, IntegrityIssue, IntegrityReport,
    TransactionProof,
};
use crate::storage::Storage;
use crate::transaction::{Payload, Transaction, TransactionType};

pub struct BlockchainManager {
    storage: Box<dyn Storage>,
    clock: Box<dyn Clock>,
    hasher: HashingService,
    config: Option<BlockchainConfig>,
    /// Finalized blocks still held in memory, oldest first, contiguous.
    chain: VecDeque<Block>,
    current: Option<Block>,
    /// Block numbers whose own file has not been written successfully yet.
    /// Such blocks are never evicted.
    unpersisted: BTreeSet<u32>,
    health: HealthState,
    last_block_ticks: Ticks,
    last_verify_ticks: Ticks,
    last_report: Option<IntegrityReport>,
    last_error: Option<String>,
}

/// Serialize a block into its standalone file.
fn write_block_file(storage: &dyn Storage, block: &Block) -> Result<()> {
    let doc = block.serialize()?;
    storage.write(&block_file_name(block.number()), doc.as_bytes())
}

fn read_block_file(storage: &dyn Storage, number: u32) -> Result<Option<Block>> {
    let name = block_file_name(number);
    let Some(bytes) = storage.read(&name)? else {
        return Ok(None);
    };
    let doc = std::str::from_utf8(&bytes)
        .map_err(|e| LedgerError::Parse(format!("{name}: {e}")))?;
    let block = Block::deserialize(doc).map_err(|e| LedgerError::Parse(format!("{name}: {e}")))?;
    if block.number() != number {
        return Err(LedgerError::Parse(format!(
            "{name} holds block {}",
            block.number()
        )));
    }
    Ok(Some(block))
}

impl BlockchainManager {
    pub fn new(storage: Box<dyn Storage>, clock: Box<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            hasher: HashingService::new(),
            config: None,
            chain: VecDeque::new(),
            current: None,
            unpersisted: BTreeSet::new(),
            health: HealthState::Uninitialized,
            last_block_ticks: Ticks::default(),
            last_verify_ticks: Ticks::default(),
            last_report: None,
            last_error: None,
        }
    }

    pub fn with_system_clock(storage: Box<dyn Storage>) -> Self {
        Self::new(storage, Box::new(SystemClock::new()))
    }

    // -- lifecycle ----------------------------------------------------------

    /// Validate `config`, load the persisted chain and open the current
    /// block. On failure the manager keeps whatever state it had before.
    pub fn initialize(&mut self, config: BlockchainConfig) -> Result<()> {
        if let Err(e) = config.validate() {
            return Err(self.record_error(e));
        }
        match self.load(config) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.record_error(e)),
        }
    }

    fn load(&mut self, config: BlockchainConfig) -> Result<()> {
        let hasher = HashingService::new();
        self.storage.ensure_root()?;

        let mut chain = self.read_chain_document()?;
        let recovered = self.recover_block_files(&mut chain)?;
        if recovered > 0 {
            info!(recovered, "recovered blocks newer than {CHAIN_FILE}");
        }

        let mut unpersisted = BTreeSet::new();
        for block in chain.iter() {
            if !self.storage.exists(&block_file_name(block.number()))? {
                unpersisted.insert(block.number());
            }
        }

        let created_genesis = chain.is_empty();
        if created_genesis {
            let genesis = Block::genesis(&config.node_id, self.clock.unix_time(), &hasher)?;
            info!(node = %config.node_id, hash = %genesis.hash_hex(), "created genesis block");
            chain.push_back(genesis);
            unpersisted.insert(0);
        }

        let pending = self.take_pending();
        self.hasher = hasher;
        self.chain = chain;
        self.unpersisted = unpersisted;
        self.config = Some(config);
        self.last_report = None;
        self.last_error = None;

        self.retry_unpersisted();
        if created_genesis {
            if let Err(e) = self.write_chain_document() {
                self.record_error(e);
            }
        }
        self.reopen_current(pending)?;
        self.health = HealthState::Healthy;
        self.last_block_ticks = self.clock.ticks();
        self.run_verification();

        info!(
            storage = %self.storage.describe(),
            blocks = self.chain.len(),
            tip = ?self.chain.back().map(Block::number),
            health = ?self.health,
            "ledger initialized"
        );
        Ok(())
    }

    /// Reload and re-verify from storage with the current config. This is
    /// one of the operator actions that can leave the Degraded state.
    pub fn reinitialize(&mut self) -> Result<()> {
        let config = self.require_config()?.clone();
        self.initialize(config)
    }

    /// Delete every persisted document and start over from a fresh genesis.
    pub fn clear_chain(&mut self) -> Result<()> {
        let config = self.require_config()?.clone();
        if let Some(tip) = self.tip_number() {
            for n in 0..=tip {
                if let Err(e) = self.storage.remove(&block_file_name(n)) {
                    return Err(self.record_error(e));
                }
            }
        }
        if let Err(e) = self.storage.remove(CHAIN_FILE) {
            return Err(self.record_error(e));
        }
        self.chain.clear();
        self.unpersisted.clear();
        self.current = None;
        warn!(node = %config.node_id, "chain cleared by operator");
        self.initialize(config)
    }

    fn read_chain_document(&self) -> Result<VecDeque<Block>> {
        let Some(bytes) = self.storage.read(CHAIN_FILE)? else {
            debug!("no {CHAIN_FILE}, starting from an empty chain");
            return Ok(VecDeque::new());
        };
        let doc = std::str::from_utf8(&bytes)
            .map_err(|e| LedgerError::Parse(format!("{CHAIN_FILE}: {e}")))?;
        let blocks: Vec<Block> = serde_json::from_str(doc)
            .map_err(|e| LedgerError::Parse(format!("{CHAIN_FILE}: {e}")))?;
        Ok(blocks.into())
    }

    /// Append block files that are newer than the loaded tail, e.g. after a
    /// crash between writing a block file and rewriting the aggregate.
    fn recover_block_files(&self, chain: &mut VecDeque<Block>) -> Result<usize> {
        let mut next = match chain.back() {
            Some(tip) => match tip.number().checked_add(1) {
                Some(n) => n,
                None => return Ok(0),
            },
            None => 0,
        };
        let mut recovered = 0;
        while let Some(block) = read_block_file(self.storage.as_ref(), next)? {
            chain.push_back(block);
            recovered += 1;
            match next.checked_add(1) {
                Some(n) => next = n,
                None => break,
            }
        }
        Ok(recovered)
    }

    fn take_pending(&mut self) -> Vec<Transaction> {
        self.current
            .take()
            .map(|b| b.transactions)
            .unwrap_or_default()
    }

    /// Open a new current block on top of the tip and carry over
    /// transactions that were accepted but not yet sealed.
    fn reopen_current(&mut self, pending: Vec<Transaction>) -> Result<()> {
        let node_id = self.require_config()?.node_id.clone();
        let (number, previous) = match self.chain.back() {
            Some(tip) => (
                tip.number().checked_add(1).ok_or_else(|| {
                    LedgerError::Capacity("block numbers exhausted".into())
                })?,
                tip.block_hash,
            ),
            None => (0, None),
        };
        let mut block = Block::new(number, previous, node_id, self.clock.unix_time());
        let carried = pending.len();
        for tx in pending {
            block.add_transaction(tx)?;
        }
        if carried > 0 {
            debug!(block = number, carried, "carried pending transactions into new block");
        }
        self.current = Some(block);
        Ok(())
    }

    // -- ingestion ----------------------------------------------------------

    pub fn add_image_transaction(&mut self, image: Payload<'_>, metadata: &str) -> Result<Ingested> {
        self.ingest(TransactionType::ImageCapture, |hasher, clock| {
            Transaction::image_capture(hasher, clock, image, metadata)
        })
    }

    /// Detections below `min_ai_confidence` are accepted and dropped, so
    /// callers never need to special-case low confidence.
    pub fn add_ai_detection_transaction(
        &mut self,
        detection: Payload<'_>,
        confidence: f32,
        metadata: &str,
    ) -> Result<Ingested> {
        let min = self.require_config()?.min_ai_confidence;
        if !(0.0..=1.0).contains(&confidence) {
            let err = LedgerError::Validation(format!("confidence {confidence} outside [0, 1]"));
            return Err(self.record_error(err));
        }
        if confidence < min && self.require_config()?.is_enabled(TransactionType::AiDetection) {
            debug!(confidence, min, "detection below threshold ignored");
            return Ok(Ingested::Ignored(IgnoreReason::LowConfidence));
        }
        self.ingest(TransactionType::AiDetection, |hasher, clock| {
            Transaction::ai_detection(hasher, clock, detection, confidence, metadata)
        })
    }

    pub fn add_sensor_transaction(&mut self, reading: Payload<'_>, metadata: &str) -> Result<Ingested> {
        self.ingest(TransactionType::SensorData, |hasher, clock| {
            Transaction::sensor_data(hasher, clock, reading, metadata)
        })
    }

    pub fn add_system_event(&mut self, event: &str, metadata: &str) -> Result<Ingested> {
        self.ingest(TransactionType::SystemEvent, |hasher, clock| {
            Transaction::system_event(hasher, clock, event, metadata)
        })
    }

    pub fn add_power_event(&mut self, event: &str, metadata: &str) -> Result<Ingested> {
        self.ingest(TransactionType::PowerEvent, |hasher, clock| {
            Transaction::power_event(hasher, clock, event, metadata)
        })
    }

    pub fn add_network_event(&mut self, event: &str, metadata: &str) -> Result<Ingested> {
        self.ingest(TransactionType::NetworkEvent, |hasher, clock| {
            Transaction::network_event(hasher, clock, event, metadata)
        })
    }

    fn ingest<F>(&mut self, kind: TransactionType, build: F) -> Result<Ingested>
    where
        F: FnOnce(&HashingService, &dyn Clock) -> Result<Transaction>,
    {
        if !self.require_config()?.is_enabled(kind) {
            debug!(%kind, "transaction type disabled, ignored");
            return Ok(Ingested::Ignored(IgnoreReason::Disabled(kind)));
        }
        let tx = match build(&self.hasher, self.clock.as_ref()) {
            Ok(tx) => tx,
            Err(e) => return Err(self.record_error(e)),
        };
        self.append(tx)
    }

    fn append(&mut self, tx: Transaction) -> Result<Ingested> {
        let current = self.current.as_mut().ok_or(LedgerError::NotInitialized)?;
        let added = current
            .add_transaction(tx)
            .map(|()| (current.number(), current.transaction_count() - 1));
        let (block_number, index) = match added {
            Ok(position) => position,
            Err(e) => return Err(self.record_error(e)),
        };
        let sealed = self.apply_block_policy()?;
        Ok(Ingested::Appended {
            block_number,
            index,
            sealed,
        })
    }

    // -- block creation -----------------------------------------------------

    /// Roll the current block when it is non-empty and either full or past
    /// the block interval. Time alone never creates an empty block.
    pub fn should_create_block(&self) -> bool {
        let (Some(config), Some(current)) = (self.config.as_ref(), self.current.as_ref()) else {
            return false;
        };
        if current.is_empty() {
            return false;
        }
        current.transaction_count() >= usize::from(config.max_transactions_per_block)
            || self.clock.ticks().elapsed_since(self.last_block_ticks) > config.block_interval()
    }

    fn apply_block_policy(&mut self) -> Result<Option<Hash>> {
        if self.should_create_block() {
            self.create_block().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Finalize the current block, append it, persist it and open the next
    /// one. Fails with a validation error if the current block is empty.
    pub fn create_block(&mut self) -> Result<Hash> {
        let save_chain = self.require_config()?.save_chain_on_block;
        let mut block = self.current.take().ok_or(LedgerError::NotInitialized)?;
        if block.number() == u32::MAX {
            self.current = Some(block);
            let err = LedgerError::Capacity("block numbers exhausted".into());
            return Err(self.record_error(err));
        }
        let hash = match block.finalize(&self.hasher) {
            Ok(hash) => hash,
            Err(e) => {
                self.current = Some(block);
                return Err(self.record_error(e));
            }
        };
        let number = block.number();
        let tx_count = block.transaction_count();

        self.chain.push_back(block);
        self.unpersisted.insert(number);
        self.retry_unpersisted();
        self.reopen_current(Vec::new())?;
        self.last_block_ticks = self.clock.ticks();

        if save_chain {
            if let Err(e) = self.write_chain_document() {
                self.record_error(e);
            }
        }
        info!(block = number, txs = tx_count, hash = %hash.short(), "block appended to chain");
        Ok(hash)
    }

    // -- periodic work ------------------------------------------------------

    /// One iteration of housekeeping: block policy, rate-limited
    /// re-verification, persistence retries and eviction. Does nothing when
    /// no threshold is met.
    pub fn update(&mut self) -> Result<()> {
        let integrity_interval = self.require_config()?.integrity_interval();

        // creation failures are recorded in last_error; housekeeping goes on
        let _ = self.apply_block_policy();

        if self.clock.ticks().elapsed_since(self.last_verify_ticks) >= integrity_interval {
            self.run_verification();
        }
        self.retry_unpersisted();
        self.evict();
        Ok(())
    }

    /// Walk the in-memory chain and report every mismatch. A mismatch moves
    /// the ledger to Degraded; ingestion carries on.
    pub fn verify_integrity(&mut self) -> Result<IntegrityReport> {
        self.require_config()?;
        Ok(self.run_verification())
    }

    fn run_verification(&mut self) -> IntegrityReport {
        let report = self.check_chain();
        self.last_verify_ticks = self.clock.ticks();
        if !report.is_clean() {
            for issue in report.invalid_blocks.iter().chain(report.broken_links.iter()) {
                warn!(block = issue.block_number, "{}", issue.message);
            }
            self.health = HealthState::Degraded;
            self.last_error = Some(format!(
                "integrity check found {} mismatch(es)",
                report.mismatches()
            ));
        } else {
            debug!(blocks = report.blocks_checked, "integrity check clean");
        }
        self.last_report = Some(report.clone());
        report
    }

    /// Read-only chain walk.
    fn check_chain(&self) -> IntegrityReport {
        let mut report = IntegrityReport {
            first_block: self.chain.front().map(Block::number),
            last_block: self.chain.back().map(Block::number),
            checked_at: self.clock.unix_time(),
            ..Default::default()
        };

        // The first retained block links to a predecessor that may only
        // exist on storage.
        let mut prev: Option<(u32, Option<Hash>)> = match self.chain.front() {
            Some(first) if first.number() > 0 => {
                match read_block_file(self.storage.as_ref(), first.number() - 1) {
                    Ok(Some(b)) => Some((b.number(), b.block_hash)),
                    Ok(None) => None,
                    Err(e) => {
                        debug!("predecessor of block {} unreadable: {e}", first.number());
                        None
                    }
                }
            }
            _ => None,
        };

        for block in &self.chain {
            let n = block.number();
            report.blocks_checked += 1;
            report.transactions_checked += block.transaction_count();

            if let Err(e) = block.validate(&self.hasher) {
                report.invalid_blocks.push(IntegrityIssue {
                    block_number: n,
                    message: e.to_string(),
                });
            } else if n == 0 && !block.is_genesis_shaped() {
                report.invalid_blocks.push(IntegrityIssue {
                    block_number: n,
                    message: "genesis block must hold exactly one system event and no previous hash"
                        .into(),
                });
            }

            if let Some((prev_number, prev_hash)) = prev {
                if prev_number.checked_add(1) != Some(n) {
                    report.broken_links.push(IntegrityIssue {
                        block_number: n,
                        message: format!("block {n} follows block {prev_number}"),
                    });
                } else if prev_hash.is_none() || block.header.previous_hash != prev_hash {
                    report.broken_links.push(IntegrityIssue {
                        block_number: n,
                        message: format!("block {n} previous hash does not match block {prev_number}"),
                    });
                }
            }
            prev = Some((n, block.block_hash));
        }
        report
    }

    fn retry_unpersisted(&mut self) {
        if self.unpersisted.is_empty() {
            return;
        }
        let Some(first) = self.chain.front().map(Block::number) else {
            return;
        };
        let pending: Vec<u32> = self.unpersisted.iter().copied().collect();
        for number in pending {
            let Some(block) = number
                .checked_sub(first)
                .and_then(|offset| self.chain.get(offset as usize))
            else {
                continue;
            };
            match write_block_file(self.storage.as_ref(), block) {
                Ok(()) => {
                    self.unpersisted.remove(&number);
                }
                Err(e) => {
                    self.record_error(e);
                }
            }
        }
    }

    fn evict(&mut self) {
        let Some(config) = self.config.as_ref() else {
            return;
        };
        let cap = config.max_blocks_in_memory;
        let save_chain = config.save_chain_on_block;

        let mut evicted = 0;
        while self.chain.len() > cap {
            let Some(oldest) = self.chain.front().map(Block::number) else {
                break;
            };
            if self.unpersisted.contains(&oldest) {
                warn!(block = oldest, "block file not written yet, eviction deferred");
                break;
            }
            self.chain.pop_front();
            evicted += 1;
        }
        if evicted > 0 {
            info!(
                evicted,
                first_in_memory = ?self.chain.front().map(Block::number),
                "evicted blocks from memory"
            );
            if save_chain {
                if let Err(e) = self.write_chain_document() {
                    self.record_error(e);
                }
            }
        }
    }

    // -- persistence ----------------------------------------------------------

    fn write_chain_document(&self) -> Result<()> {
        let doc = serde_json::to_vec_pretty(&self.chain)?;
        self.storage.write(CHAIN_FILE, &doc)
    }

    /// Write the aggregate chain document now.
    pub fn save_chain(&mut self) -> Result<()> {
        self.require_config()?;
        match self.write_chain_document() {
            Ok(()) => Ok(()),
            Err(e) => Err(self.record_error(e)),
        }
    }

    /// Export finalized blocks as a JSON array. Without a range the whole
    /// chain is exported; blocks no longer in memory are read from their
    /// files.
    pub fn export_chain(&self, range: Option<RangeInclusive<u32>>) -> Result<String> {
        self.require_config()?;
        let Some(tip) = self.tip_number() else {
            return Ok("[]".into());
        };
        let range = range.unwrap_or(0..=tip);
        if range.is_empty() || *range.end() > tip {
            return Err(LedgerError::Validation(format!(
                "export range {}..={} outside chain 0..={tip}",
                range.start(),
                range.end()
            )));
        }
        let mut blocks = Vec::with_capacity((range.end() - range.start()) as usize + 1);
        for n in range {
            let block = self.get_block(n)?.ok_or_else(|| {
                LedgerError::io(
                    format!("read {}", block_file_name(n)),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "block file missing"),
                )
            })?;
            blocks.push(block);
        }
        Ok(serde_json::to_string_pretty(&blocks)?)
    }

    /// Replace the chain with the blocks of an exported document. The
    /// document must hold a non-empty, contiguously numbered run of blocks.
    /// Block files of the old chain outside that run are removed. Blocks are
    /// loaded as they are; tampered content shows up in the returned
    /// report and moves the ledger to Degraded.
    pub fn import_chain(&mut self, doc: &str) -> Result<IntegrityReport> {
        self.require_config()?;
        let blocks: Vec<Block> = match serde_json::from_str(doc) {
            Ok(blocks) => blocks,
            Err(e) => return Err(self.record_error(LedgerError::Parse(format!("import: {e}")))),
        };
        if let Err(e) = check_import_numbering(&blocks) {
            return Err(self.record_error(e));
        }

        let old_tip = self.tip_number();
        let pending = self.take_pending();
        self.chain = blocks.into();
        self.unpersisted = self.chain.iter().map(Block::number).collect();
        self.retry_unpersisted();

        let new_first = self.chain.front().map(Block::number).unwrap_or(0);
        let new_tip = self.tip_number().unwrap_or(0);
        if let Some(old_tip) = old_tip {
            let stale = (0..new_first.min(old_tip.saturating_add(1)))
                .chain(new_tip.saturating_add(1)..=old_tip);
            for n in stale {
                if let Err(e) = self.storage.remove(&block_file_name(n)) {
                    self.record_error(e);
                }
            }
        }
        if let Err(e) = self.write_chain_document() {
            self.record_error(e);
        }
        self.reopen_current(pending)?;
        self.last_block_ticks = self.clock.ticks();

        let report = self.run_verification();
        info!(
            blocks = report.blocks_checked,
            mismatches = report.mismatches(),
            "imported chain"
        );
        Ok(report)
    }

    // -- lookups ------------------------------------------------------------

    /// Finalized block by number, from memory or from its file.
    pub fn get_block(&self, number: u32) -> Result<Option<Block>> {
        self.require_config()?;
        if let Some(block) = self.memory_block(number) {
            return Ok(Some(block.clone()));
        }
        match self.tip_number() {
            Some(tip) if number <= tip => read_block_file(self.storage.as_ref(), number),
            _ => Ok(None),
        }
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> Result<Option<Block>> {
        self.require_config()?;
        if let Some(block) = self.chain.iter().find(|b| b.block_hash.as_ref() == Some(hash)) {
            return Ok(Some(block.clone()));
        }
        let first = self.chain.front().map(Block::number).unwrap_or(0);
        for n in (0..first).rev() {
            if let Some(block) = read_block_file(self.storage.as_ref(), n)? {
                if block.block_hash.as_ref() == Some(hash) {
                    return Ok(Some(block));
                }
            }
        }
        Ok(None)
    }

    /// Inclusion proof for the newest in-memory transaction carrying
    /// `data_hash`.
    pub fn prove_transaction(&self, data_hash: &Hash) -> Result<Option<TransactionProof>> {
        self.require_config()?;
        for block in self.chain.iter().rev() {
            let Some(index) = block.transactions.iter().position(|tx| tx.data_hash == *data_hash)
            else {
                continue;
            };
            let proof = block.transaction_proof(index, &self.hasher)?;
            return Ok(Some(TransactionProof {
                block_number: block.number(),
                block_hash: block.block_hash,
                transaction: block.transactions[index].clone(),
                proof,
            }));
        }
        Ok(None)
    }

    fn memory_block(&self, number: u32) -> Option<&Block> {
        let first = self.chain.front()?.number();
        let offset = number.checked_sub(first)?;
        self.chain.get(offset as usize)
    }

    fn tip_number(&self) -> Option<u32> {
        self.chain.back().map(Block::number)
    }

    pub fn latest_block(&self) -> Option<&Block> {
        self.chain.back()
    }

    /// Read-only view of the open block.
    pub fn current_block(&self) -> Option<&Block> {
        self.current.as_ref()
    }

    pub fn blocks_in_memory(&self) -> impl Iterator<Item = &Block> {
        self.chain.iter()
    }

    pub fn hasher(&self) -> &HashingService {
        &self.hasher
    }

    pub fn config(&self) -> Option<&BlockchainConfig> {
        self.config.as_ref()
    }

    pub fn health(&self) -> HealthState {
        self.health
    }

    pub fn hash_stats(&self) -> HashStats {
        self.hasher.stats()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn status(&self) -> BlockchainStatus {
        let tip = self.chain.back();
        let report = self.last_report.as_ref();
        BlockchainStatus {
            state: self.health,
            initialized: self.config.is_some(),
            healthy: self.health == HealthState::Healthy,
            node_id: self
                .config
                .as_ref()
                .map(|c| c.node_id.clone())
                .unwrap_or_default(),
            total_blocks: tip.map(|b| b.number().saturating_add(1)).unwrap_or(0),
            blocks_in_memory: self.chain.len(),
            transactions_in_memory: self
                .chain
                .iter()
                .map(|b| b.transaction_count() as u64)
                .sum(),
            pending_transactions: self.current.as_ref().map(Block::transaction_count).unwrap_or(0),
            unpersisted_blocks: self.unpersisted.len(),
            last_block_number: tip.map(Block::number),
            last_block_hash: tip.and_then(|b| b.block_hash),
            last_block_time: tip.map(|b| b.header.timestamp).unwrap_or(0),
            last_verification_time: report.map(|r| r.checked_at),
            integrity_verified: report.is_some_and(IntegrityReport::is_clean)
                && self.health == HealthState::Healthy,
            last_error: self.last_error.clone(),
            hash_stats: self.hasher.stats(),
        }
    }

    // -- helpers ------------------------------------------------------------

    fn require_config(&self) -> Result<&BlockchainConfig> {
        self.config.as_ref().ok_or(LedgerError::NotInitialized)
    }

    fn record_error(&mut self, err: LedgerError) -> LedgerError {
        warn!(kind = err.kind(), "{err}");
        self.last_error = Some(err.to_string());
        err
    }
}

fn check_import_numbering(blocks: &[Block]) -> Result<()> {
    if blocks.is_empty() {
        return Err(LedgerError::Parse("import document holds no blocks".into()));
    }
    for pair in blocks.windows(2) {
        if pair[0].number().checked_add(1) != Some(pair[1].number()) {
            return Err(LedgerError::Parse(format!(
                "import is not contiguous: block {} follows block {}",
                pair[1].number(),
                pair[0].number()
            )));
        }
    }
    // the next current block would need number u32::MAX + 1
    if blocks.last().map(Block::number) == Some(u32::MAX) {
        return Err(LedgerError::Capacity(format!(
            "import ends at block {}, no number left for the next block",
            u32::MAX
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::merkle::MerkleTree;
    use crate::storage::MemoryStorage;

    const NOW: u64 = 1_700_000_000;

    fn config(max_tx: u16) -> BlockchainConfig {
        BlockchainConfig {
            node_id: "cam-01".into(),
            max_transactions_per_block: max_tx,
            block_creation_interval: 60,
            integrity_check_interval: 600,
            ..Default::default()
        }
    }

    fn open(storage: &MemoryStorage, clock: &ManualClock, config: BlockchainConfig) -> BlockchainManager {
        let mut manager = BlockchainManager::new(Box::new(storage.clone()), Box::new(clock.clone()));
        manager.initialize(config).unwrap();
        manager
    }

    fn setup(max_tx: u16) -> (MemoryStorage, ManualClock, BlockchainManager) {
        let storage = MemoryStorage::new();
        let clock = ManualClock::new(NOW);
        let manager = open(&storage, &clock, config(max_tx));
        (storage, clock, manager)
    }

    fn seal_events(manager: &mut BlockchainManager, n: usize) {
        for i in 0..n {
            let outcome = manager
                .add_system_event(&format!("boot-{i}"), r#"{"source":"test"}"#)
                .unwrap();
            assert!(matches!(outcome, Ingested::Appended { sealed: Some(_), .. }));
        }
    }

    #[test]
    fn everything_requires_initialize() {
        let mut manager = BlockchainManager::new(
            Box::new(MemoryStorage::new()),
            Box::new(ManualClock::new(NOW)),
        );
        assert!(matches!(
            manager.add_system_event("boot", "{}"),
            Err(LedgerError::NotInitialized)
        ));
        assert!(matches!(manager.update(), Err(LedgerError::NotInitialized)));
        assert!(matches!(manager.create_block(), Err(LedgerError::NotInitialized)));
        assert!(matches!(manager.get_block(0), Err(LedgerError::NotInitialized)));
        let status = manager.status();
        assert!(!status.initialized);
        assert_eq!(status.state, HealthState::Uninitialized);
    }

    #[test]
    fn bad_config_keeps_manager_uninitialized() {
        let mut manager = BlockchainManager::new(
            Box::new(MemoryStorage::new()),
            Box::new(ManualClock::new(NOW)),
        );
        let err = manager.initialize(config(0)).unwrap_err();
        assert!(matches!(err, LedgerError::Config(_)));
        assert_eq!(manager.health(), HealthState::Uninitialized);
        assert!(manager.status().last_error.unwrap().contains("config"));
    }

    #[test]
    fn initialize_creates_and_persists_genesis() {
        let (storage, _clock, manager) = setup(5);
        let genesis = manager.latest_block().unwrap();
        assert!(genesis.is_genesis_shaped());
        assert!(genesis.is_valid(manager.hasher()));
        assert_eq!(
            storage.names(),
            vec!["block_0.json".to_string(), "chain.json".to_string()]
        );

        let current = manager.current_block().unwrap();
        assert_eq!(current.number(), 1);
        assert_eq!(current.header.previous_hash, genesis.block_hash);
        assert!(current.is_empty());

        let status = manager.status();
        assert_eq!(status.state, HealthState::Healthy);
        assert_eq!(status.total_blocks, 1);
        assert!(status.integrity_verified);
        assert_eq!(status.node_id, "cam-01");
    }

    #[test]
    fn count_policy_seals_full_block() {
        let (_storage, _clock, mut manager) = setup(2);
        let first = manager
            .add_image_transaction(Payload::Bytes(b"frame-1"), r#"{"camera":"north"}"#)
            .unwrap();
        assert_eq!(
            first,
            Ingested::Appended {
                block_number: 1,
                index: 0,
                sealed: None
            }
        );
        let second = manager
            .add_image_transaction(Payload::Bytes(b"frame-2"), r#"{"camera":"north"}"#)
            .unwrap();
        let Ingested::Appended {
            block_number,
            index,
            sealed: Some(hash),
        } = second
        else {
            panic!("second image should seal block 1");
        };
        assert_eq!((block_number, index), (1, 1));

        let sealed = manager.latest_block().unwrap();
        assert_eq!(sealed.number(), 1);
        assert_eq!(sealed.transaction_count(), 2);
        assert_eq!(sealed.block_hash, Some(hash));
        assert!(sealed.is_valid(manager.hasher()));

        let current = manager.current_block().unwrap();
        assert_eq!(current.number(), 2);
        assert!(current.is_empty());
        assert_eq!(current.header.previous_hash, Some(hash));
    }

    #[test]
    fn short_digest_is_rejected_without_side_effects() {
        let (_storage, _clock, mut manager) = setup(2);
        let digest = "a".repeat(63);
        let err = manager
            .add_image_transaction(
                Payload::Digest {
                    hex: &digest,
                    size: 10,
                },
                "{}",
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert!(manager.current_block().unwrap().is_empty());
        let status = manager.status();
        assert_eq!(status.state, HealthState::Healthy);
        assert!(status.last_error.unwrap().contains("validation"));
    }

    #[test]
    fn empty_block_cannot_be_created() {
        let (_storage, _clock, mut manager) = setup(5);
        assert!(matches!(manager.create_block(), Err(LedgerError::Validation(_))));
        assert_eq!(manager.current_block().unwrap().number(), 1);
        assert_eq!(manager.latest_block().unwrap().number(), 0);
    }

    #[test]
    fn time_policy_never_creates_empty_blocks() {
        let (_storage, clock, mut manager) = setup(10);
        manager.add_sensor_transaction(Payload::Bytes(b"21.5C"), "{}").unwrap();
        clock.advance(Duration::from_secs(59));
        manager.update().unwrap();
        assert_eq!(manager.latest_block().unwrap().number(), 0);

        // exactly the interval is not past it
        clock.advance(Duration::from_secs(1));
        manager.update().unwrap();
        assert_eq!(manager.latest_block().unwrap().number(), 0);

        clock.advance(Duration::from_millis(1));
        manager.update().unwrap();
        assert_eq!(manager.latest_block().unwrap().number(), 1);

        clock.advance(Duration::from_secs(300));
        manager.update().unwrap();
        assert_eq!(manager.latest_block().unwrap().number(), 1);
        assert!(manager.current_block().unwrap().is_empty());
    }

    #[test]
    fn update_without_due_work_is_idempotent() {
        let (_storage, _clock, mut manager) = setup(10);
        manager.add_system_event("boot", "{}").unwrap();
        manager.update().unwrap();
        let before = manager.status();
        manager.update().unwrap();
        manager.update().unwrap();
        assert_eq!(manager.status(), before);
    }

    #[test]
    fn low_confidence_and_disabled_are_no_ops() {
        let storage = MemoryStorage::new();
        let clock = ManualClock::new(NOW);
        let mut manager = open(
            &storage,
            &clock,
            BlockchainConfig {
                enable_power_events: false,
                ..config(10)
            },
        );

        assert_eq!(
            manager
                .add_ai_detection_transaction(Payload::Bytes(b"person"), 0.3, "{}")
                .unwrap(),
            Ingested::Ignored(IgnoreReason::LowConfidence)
        );
        assert_eq!(
            manager.add_power_event("battery_low", "{}").unwrap(),
            Ingested::Ignored(IgnoreReason::Disabled(TransactionType::PowerEvent))
        );
        assert!(manager.current_block().unwrap().is_empty());

        assert!(manager
            .add_ai_detection_transaction(Payload::Bytes(b"person"), 0.9, "{}")
            .unwrap()
            .is_appended());
        assert!(matches!(
            manager.add_ai_detection_transaction(Payload::Bytes(b"person"), 1.5, "{}"),
            Err(LedgerError::Validation(_))
        ));
        let current = manager.current_block().unwrap();
        assert_eq!(current.transaction_count(), 1);
        assert_eq!(current.transactions[0].confidence, 0.9);
    }

    #[test]
    fn retention_keeps_evicted_blocks_readable() {
        let storage = MemoryStorage::new();
        let clock = ManualClock::new(NOW);
        let mut manager = open(
            &storage,
            &clock,
            BlockchainConfig {
                max_blocks_in_memory: 2,
                ..config(1)
            },
        );
        seal_events(&mut manager, 5);
        manager.update().unwrap();

        let numbers: Vec<u32> = manager.blocks_in_memory().map(Block::number).collect();
        assert_eq!(numbers, vec![4, 5]);
        let status = manager.status();
        assert_eq!(status.total_blocks, 6);
        assert_eq!(status.blocks_in_memory, 2);

        let evicted = manager.get_block(1).unwrap().unwrap();
        assert_eq!(evicted.number(), 1);
        assert!(evicted.is_valid(manager.hasher()));
        let by_hash = manager
            .get_block_by_hash(&evicted.block_hash.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(by_hash, evicted);
        assert!(manager.get_block(6).unwrap().is_none());

        let report = manager.verify_integrity().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.first_block, Some(4));

        let exported: Vec<Block> =
            serde_json::from_str(&manager.export_chain(None).unwrap()).unwrap();
        assert_eq!(exported.len(), 6);
        let partial: Vec<Block> =
            serde_json::from_str(&manager.export_chain(Some(2..=3)).unwrap()).unwrap();
        assert_eq!(partial.iter().map(Block::number).collect::<Vec<_>>(), vec![2, 3]);
        assert!(matches!(
            manager.export_chain(Some(3..=9)),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn eviction_waits_for_block_files() {
        let storage = MemoryStorage::new();
        let clock = ManualClock::new(NOW);
        let mut manager = open(
            &storage,
            &clock,
            BlockchainConfig {
                max_blocks_in_memory: 1,
                ..config(1)
            },
        );
        storage.set_fail_writes(true);
        seal_events(&mut manager, 2);
        manager.update().unwrap();

        let numbers: Vec<u32> = manager.blocks_in_memory().map(Block::number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(manager.status().unpersisted_blocks, 2);
        assert!(manager.last_error().unwrap().contains("io error"));

        storage.set_fail_writes(false);
        manager.update().unwrap();
        let numbers: Vec<u32> = manager.blocks_in_memory().map(Block::number).collect();
        assert_eq!(numbers, vec![2]);
        assert_eq!(manager.status().unpersisted_blocks, 0);
        assert!(storage.exists("block_1.json").unwrap());
        assert!(storage.exists("block_2.json").unwrap());
    }

    #[test]
    fn tampered_block_degrades_until_operator_action() {
        let (storage, clock, mut manager) = setup(1);
        seal_events(&mut manager, 3);

        let mut blocks: Vec<Block> =
            serde_json::from_slice(&storage.read(CHAIN_FILE).unwrap().unwrap()).unwrap();
        blocks[2].transactions[0].metadata = r#"{"source":"forged"}"#.into();
        storage.put_raw(CHAIN_FILE, &serde_json::to_vec(&blocks).unwrap());

        let mut reloaded = open(&storage, &clock, config(1));
        assert_eq!(reloaded.health(), HealthState::Degraded);
        let report = reloaded.verify_integrity().unwrap();
        assert_eq!(report.invalid_blocks.len(), 1);
        assert_eq!(report.invalid_blocks[0].block_number, 2);
        assert!(report.broken_links.is_empty());

        // ingestion continues and time alone does not recover
        assert!(reloaded.add_network_event("wifi_up", "{}").unwrap().is_appended());
        clock.advance(Duration::from_secs(3600));
        reloaded.update().unwrap();
        assert_eq!(reloaded.health(), HealthState::Degraded);
        assert!(!reloaded.status().integrity_verified);

        reloaded.clear_chain().unwrap();
        assert_eq!(reloaded.health(), HealthState::Healthy);
        assert_eq!(reloaded.status().total_blocks, 1);
        assert!(!storage.exists("block_3.json").unwrap());
    }

    #[test]
    fn corrupt_chain_document_fails_initialize() {
        let storage = MemoryStorage::new();
        storage.put_raw(CHAIN_FILE, b"{not json");
        let mut manager =
            BlockchainManager::new(Box::new(storage.clone()), Box::new(ManualClock::new(NOW)));
        assert!(matches!(
            manager.initialize(config(5)),
            Err(LedgerError::Parse(_))
        ));
        assert_eq!(manager.health(), HealthState::Uninitialized);
        assert_eq!(storage.names(), vec![CHAIN_FILE.to_string()]);
    }

    #[test]
    fn restart_recovers_blocks_missing_from_aggregate() {
        let storage = MemoryStorage::new();
        let clock = ManualClock::new(NOW);
        let mut manager = open(
            &storage,
            &clock,
            BlockchainConfig {
                save_chain_on_block: false,
                ..config(1)
            },
        );
        seal_events(&mut manager, 2);
        let tip = manager.latest_block().unwrap().block_hash;
        drop(manager);

        let reloaded = open(&storage, &clock, config(1));
        assert_eq!(reloaded.latest_block().unwrap().number(), 2);
        assert_eq!(reloaded.latest_block().unwrap().block_hash, tip);
        assert_eq!(reloaded.current_block().unwrap().header.previous_hash, tip);
        assert_eq!(reloaded.health(), HealthState::Healthy);
    }

    #[test]
    fn reinitialize_carries_pending_transactions() {
        let (_storage, _clock, mut manager) = setup(10);
        manager.add_system_event("boot", "{}").unwrap();
        manager.reinitialize().unwrap();
        let current = manager.current_block().unwrap();
        assert_eq!(current.number(), 1);
        assert_eq!(current.transaction_count(), 1);
    }

    #[test]
    fn proofs_verify_against_block_root() {
        let (_storage, _clock, mut manager) = setup(3);
        for frame in [b"frame-a", b"frame-b", b"frame-c"] {
            manager.add_image_transaction(Payload::Bytes(frame), "{}").unwrap();
        }
        let target = manager.hasher().hash(b"frame-b");
        let proof = manager.prove_transaction(&target).unwrap().unwrap();
        assert_eq!(proof.block_number, 1);
        assert_eq!(proof.transaction.data_hash, target);

        let block = manager.get_block(1).unwrap().unwrap();
        let root = block.header.merkle_root.unwrap();
        assert!(MerkleTree::verify_proof_against(&proof.proof, &root, manager.hasher()));

        let unknown = manager.hasher().hash(b"never recorded");
        assert!(manager.prove_transaction(&unknown).unwrap().is_none());
    }

    #[test]
    fn import_replaces_chain() {
        let (_storage, _clock, mut source) = setup(1);
        seal_events(&mut source, 3);
        let doc = source.export_chain(None).unwrap();

        let (target_storage, _clock, mut target) = setup(1);
        seal_events(&mut target, 5);
        let report = target.import_chain(&doc).unwrap();
        assert!(report.is_clean());
        assert_eq!(target.latest_block(), source.latest_block());
        assert_eq!(target.health(), HealthState::Healthy);
        assert!(!target_storage.exists("block_4.json").unwrap());
        assert_eq!(
            target.current_block().unwrap().header.previous_hash,
            source.latest_block().unwrap().block_hash
        );
    }

    #[test]
    fn import_rejects_gaps_and_flags_tampering() {
        let (_storage, _clock, mut source) = setup(1);
        seal_events(&mut source, 3);
        let mut blocks: Vec<Block> =
            serde_json::from_str(&source.export_chain(None).unwrap()).unwrap();

        let (_storage, _clock, mut target) = setup(1);
        let gapped: Vec<&Block> = blocks.iter().filter(|b| b.number() != 2).collect();
        assert!(matches!(
            target.import_chain(&serde_json::to_string(&gapped).unwrap()),
            Err(LedgerError::Parse(_))
        ));
        assert!(matches!(target.import_chain("[]"), Err(LedgerError::Parse(_))));
        assert!(matches!(target.import_chain("{"), Err(LedgerError::Parse(_))));
        assert_eq!(target.latest_block().unwrap().number(), 0);

        // flip one hex digit of block 1's merkle root
        let root = blocks[1].header.merkle_root.unwrap().to_hex();
        let flipped = if root.starts_with('0') { "1" } else { "0" };
        blocks[1].header.merkle_root = Some(Hash::from_hex(&format!("{flipped}{}", &root[1..])).unwrap());
        let report = target
            .import_chain(&serde_json::to_string(&blocks).unwrap())
            .unwrap();
        assert_eq!(report.invalid_blocks.len(), 1);
        assert_eq!(report.invalid_blocks[0].block_number, 1);
        assert_eq!(target.health(), HealthState::Degraded);
    }

    #[test]
    fn partial_import_drops_files_outside_range() {
        let (_storage, _clock, mut source) = setup(1);
        seal_events(&mut source, 3);
        let doc = source.export_chain(Some(2..=3)).unwrap();

        let (storage, _clock, mut target) = setup(1);
        seal_events(&mut target, 5);
        let report = target.import_chain(&doc).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.first_block, Some(2));
        assert_eq!(target.status().total_blocks, 4);
        for gone in [0, 1, 4, 5] {
            assert!(!storage.exists(&block_file_name(gone)).unwrap(), "block {gone}");
        }
        assert!(storage.exists("block_2.json").unwrap());
    }

    #[test]
    fn relinked_block_is_a_broken_link() {
        let (_storage, _clock, mut source) = setup(1);
        seal_events(&mut source, 3);
        let mut blocks: Vec<Block> =
            serde_json::from_str(&source.export_chain(None).unwrap()).unwrap();

        // rebuild block 2 on a foreign predecessor; it stays valid on its own
        let original = &blocks[2];
        let mut relinked = Block::new(
            2,
            Some(Hash::from_bytes([9; 32])),
            original.header.node_id.clone(),
            original.header.timestamp,
        );
        for tx in &original.transactions {
            relinked.add_transaction(tx.clone()).unwrap();
        }
        relinked.finalize(source.hasher()).unwrap();
        assert!(relinked.is_valid(source.hasher()));
        blocks[2] = relinked;

        let (_storage, _clock, mut target) = setup(1);
        let report = target
            .import_chain(&serde_json::to_string(&blocks).unwrap())
            .unwrap();
        assert!(report.invalid_blocks.is_empty());
        let broken: Vec<u32> = report.broken_links.iter().map(|i| i.block_number).collect();
        assert_eq!(broken, vec![2, 3]);
        assert!(report.broken_links[0].message.contains("previous hash"));
        assert!(!report.is_clean());
        assert_eq!(target.health(), HealthState::Degraded);
    }

    #[test]
    fn malformed_genesis_is_invalid() {
        let (_storage, clock, mut manager) = setup(5);
        let hasher = HashingService::new();
        let boot = |event: &str| Transaction::system_event(&hasher, &clock, event, "{}").unwrap();

        let mut two_events = Block::new(0, None, "cam-01", NOW);
        two_events.add_transaction(boot("boot")).unwrap();
        two_events.add_transaction(boot("extra")).unwrap();
        two_events.finalize(&hasher).unwrap();

        let mut with_parent = Block::new(0, Some(hasher.hash(b"elsewhere")), "cam-01", NOW);
        with_parent.add_transaction(boot("boot")).unwrap();
        with_parent.finalize(&hasher).unwrap();

        for block in [two_events, with_parent] {
            assert!(block.is_valid(&hasher));
            assert!(!block.is_genesis_shaped());
            let report = manager
                .import_chain(&serde_json::to_string(&[block]).unwrap())
                .unwrap();
            assert!(report.broken_links.is_empty());
            assert_eq!(report.invalid_blocks.len(), 1);
            assert_eq!(report.invalid_blocks[0].block_number, 0);
            assert!(report.invalid_blocks[0].message.contains("genesis"));
        }
        assert_eq!(manager.health(), HealthState::Degraded);
    }

    #[test]
    fn import_ending_at_last_block_number_is_refused() {
        let (storage, clock, mut manager) = setup(5);
        let hasher = HashingService::new();
        let mut last = Block::new(u32::MAX, Some(hasher.hash(b"before")), "cam-01", NOW);
        last.add_transaction(Transaction::system_event(&hasher, &clock, "boot", "{}").unwrap())
            .unwrap();
        last.finalize(&hasher).unwrap();

        let before = storage.names();
        assert!(matches!(
            manager.import_chain(&serde_json::to_string(&[last]).unwrap()),
            Err(LedgerError::Capacity(_))
        ));
        assert_eq!(storage.names(), before);
        assert_eq!(manager.latest_block().unwrap().number(), 0);
        assert_eq!(manager.current_block().unwrap().number(), 1);
        assert!(manager.add_system_event("boot", "{}").unwrap().is_appended());
    }
}
