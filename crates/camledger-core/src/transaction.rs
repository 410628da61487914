//! Ledger transactions and the per-type factory helpers producers call.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::codec::CanonicalEncoder;
use crate::constants::MAX_METADATA_LEN;
use crate::error::{LedgerError, Result};
use crate::hash::Hash;
use crate::hashing::HashingService;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    ImageCapture,
    #[serde(rename = "AIDetection")]
    AiDetection,
    SensorData,
    SystemEvent,
    PowerEvent,
    NetworkEvent,
}

impl TransactionType {
    pub const ALL: [TransactionType; 6] = [
        Self::ImageCapture,
        Self::AiDetection,
        Self::SensorData,
        Self::SystemEvent,
        Self::PowerEvent,
        Self::NetworkEvent,
    ];

    fn tag(self) -> u8 {
        match self {
            Self::ImageCapture => 0,
            Self::AiDetection => 1,
            Self::SensorData => 2,
            Self::SystemEvent => 3,
            Self::PowerEvent => 4,
            Self::NetworkEvent => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ImageCapture => "ImageCapture",
            Self::AiDetection => "AIDetection",
            Self::SensorData => "SensorData",
            Self::SystemEvent => "SystemEvent",
            Self::PowerEvent => "PowerEvent",
            Self::NetworkEvent => "NetworkEvent",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a transaction's `data_hash` comes from.
#[derive(Clone, Copy, Debug)]
pub enum Payload<'a> {
    /// Raw bytes, hashed here.
    Bytes(&'a [u8]),
    /// A file on disk, streamed through the hasher.
    File(&'a Path),
    /// A digest the producer already computed, as 64 hex characters.
    Digest { hex: &'a str, size: u64 },
}

impl Payload<'_> {
    /// Produce the data hash and size in bytes of the payload.
    pub fn resolve(&self, hasher: &HashingService) -> Result<(Hash, u64)> {
        match *self {
            Payload::Bytes(bytes) => Ok((hasher.hash(bytes), bytes.len() as u64)),
            Payload::File(path) => {
                let size = std::fs::metadata(path)
                    .map_err(|e| LedgerError::io(format!("stat {}", path.display()), e))?
                    .len();
                Ok((hasher.hash_file(path)?, size))
            }
            Payload::Digest { hex, size } => Ok((Hash::from_hex(hex)?, size)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub data_hash: Hash,
    pub metadata: String,
    pub timestamp: u64,
    pub confidence: f32,
    /// Reserved. Always empty.
    #[serde(default)]
    pub signature: String,
    pub data_size: u64,
}

impl Transaction {
    /// A transaction with full confidence and no signature.
    pub fn new(
        kind: TransactionType,
        data_hash: Hash,
        metadata: impl Into<String>,
        timestamp: u64,
        data_size: u64,
    ) -> Self {
        Self {
            kind,
            data_hash,
            metadata: metadata.into(),
            timestamp,
            confidence: 1.0,
            signature: String::new(),
            data_size,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    /// Hash over every field of the transaction. This is the Merkle leaf, so
    /// tampering with metadata or timestamp changes the block's root.
    pub fn content_hash(&self, hasher: &HashingService) -> Hash {
        hasher.hash(&self.canonical_bytes())
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut enc = CanonicalEncoder::new("camledger/tx/v1");
        enc.put_u8(self.kind.tag())
            .put_hash(&self.data_hash)
            .put_str(&self.metadata)
            .put_u64(self.timestamp)
            .put_f32(self.confidence)
            .put_str(&self.signature)
            .put_u64(self.data_size);
        enc.finish()
    }

    pub fn validate(&self) -> Result<()> {
        if self.timestamp == 0 {
            return Err(LedgerError::Validation("transaction timestamp is zero".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(LedgerError::Validation(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if self.kind != TransactionType::AiDetection && self.confidence != 1.0 {
            return Err(LedgerError::Validation(format!(
                "{} transactions must have confidence 1.0",
                self.kind
            )));
        }
        if !self.signature.is_empty() {
            return Err(LedgerError::Validation("signature field is reserved".into()));
        }
        if self.metadata.len() > MAX_METADATA_LEN {
            return Err(LedgerError::Validation(format!(
                "metadata is {} bytes, limit is {MAX_METADATA_LEN}",
                self.metadata.len()
            )));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    // -- factories ---------------------------------------------------------

    pub fn image_capture(
        hasher: &HashingService,
        clock: &dyn Clock,
        image: Payload<'_>,
        metadata: &str,
    ) -> Result<Self> {
        Self::from_payload(TransactionType::ImageCapture, hasher, clock, image, metadata)
    }

    pub fn ai_detection(
        hasher: &HashingService,
        clock: &dyn Clock,
        detection: Payload<'_>,
        confidence: f32,
        metadata: &str,
    ) -> Result<Self> {
        let (data_hash, size) = detection.resolve(hasher)?;
        let tx = Self::new(
            TransactionType::AiDetection,
            data_hash,
            metadata,
            clock.unix_time(),
            size,
        )
        .with_confidence(confidence);
        tx.validate()?;
        Ok(tx)
    }

    pub fn sensor_data(
        hasher: &HashingService,
        clock: &dyn Clock,
        reading: Payload<'_>,
        metadata: &str,
    ) -> Result<Self> {
        Self::from_payload(TransactionType::SensorData, hasher, clock, reading, metadata)
    }

    pub fn system_event(
        hasher: &HashingService,
        clock: &dyn Clock,
        event: &str,
        metadata: &str,
    ) -> Result<Self> {
        Self::from_event(TransactionType::SystemEvent, hasher, clock, event, metadata)
    }

    pub fn power_event(
        hasher: &HashingService,
        clock: &dyn Clock,
        event: &str,
        metadata: &str,
    ) -> Result<Self> {
        Self::from_event(TransactionType::PowerEvent, hasher, clock, event, metadata)
    }

    pub fn network_event(
        hasher: &HashingService,
        clock: &dyn Clock,
        event: &str,
        metadata: &str,
    ) -> Result<Self> {
        Self::from_event(TransactionType::NetworkEvent, hasher, clock, event, metadata)
    }

    fn from_payload(
        kind: TransactionType,
        hasher: &HashingService,
        clock: &dyn Clock,
        payload: Payload<'_>,
        metadata: &str,
    ) -> Result<Self> {
        let (data_hash, size) = payload.resolve(hasher)?;
        let tx = Self::new(kind, data_hash, metadata, clock.unix_time(), size);
        tx.validate()?;
        Ok(tx)
    }

    fn from_event(
        kind: TransactionType,
        hasher: &HashingService,
        clock: &dyn Clock,
        event: &str,
        metadata: &str,
    ) -> Result<Self> {
        if event.is_empty() {
            return Err(LedgerError::Validation("event name is empty".into()));
        }
        Self::from_payload(kind, hasher, clock, Payload::Bytes(event.as_bytes()), metadata)
    }
}
