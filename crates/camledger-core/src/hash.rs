//! Fixed-size SHA-256 digest.
//!
//! Hashes are always carried as raw 32-byte arrays. Hex is only produced at
//! the serialization boundary: human-readable formats (JSON documents) see a
//! 64-character lowercase string, binary formats (bincode snapshots) see the
//! raw bytes.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::{HASH_HEX_SIZE, HASH_SIZE};
use crate::error::{LedgerError, Result};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASH_SIZE]);

    pub const fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex digest. Any other length is rejected before
    /// decoding so that truncated digests produce a clear message.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != HASH_HEX_SIZE {
            return Err(LedgerError::Validation(format!(
                "hash must be {HASH_HEX_SIZE} hex characters, got {}",
                s.len()
            )));
        }
        let mut out = [0u8; HASH_SIZE];
        hex::decode_to_slice(s, &mut out)
            .map_err(|e| LedgerError::Validation(format!("invalid hash hex: {e}")))?;
        Ok(Self(out))
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl From<[u8; HASH_SIZE]> for Hash {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for Hash {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Hash::from_hex(&s).map_err(de::Error::custom)
        } else {
            <[u8; HASH_SIZE]>::deserialize(deserializer).map(Hash)
        }
    }
}

/// Serde adapter for hashes that may be absent: genesis has no previous hash
/// and an open block has neither merkle root nor block hash. Absent hashes
/// are written as `""` in human-readable documents.
pub mod optional {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<Hash>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            match value {
                Some(hash) => serializer.serialize_str(&hash.to_hex()),
                None => serializer.serialize_str(""),
            }
        } else {
            value.serialize(serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Hash>, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            if s.is_empty() {
                Ok(None)
            } else {
                Hash::from_hex(&s).map(Some).map_err(de::Error::custom)
            }
        } else {
            Option::<Hash>::deserialize(deserializer)
        }
    }
}
