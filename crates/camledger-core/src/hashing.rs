//! SHA-256 hashing service.
//!
//! The service is an explicit dependency: blocks and Merkle trees borrow it
//! rather than reaching for a process-wide instance, so independent chains
//! (and tests) never share state. One-shot hashing only needs `&self`; the
//! counters are atomics and never influence a digest. The incremental stream
//! needs `&mut self` because it carries hasher state between calls.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::constants::FILE_CHUNK_SIZE;
use crate::error::{LedgerError, Result};
use crate::hash::Hash;

/// Throughput counters. Read-only view, recomputed on every call.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HashStats {
    pub operations: u64,
    pub total_micros: u64,
    pub average_micros: f64,
    pub hashes_per_second: f64,
}

#[derive(Default)]
pub struct HashingService {
    operations: AtomicU64,
    total_nanos: AtomicU64,
    stream: Option<Stream>,
}

struct Stream {
    hasher: Sha256,
    started: Instant,
    bytes: u64,
}

fn digest_to_hash(digest: impl AsRef<[u8]>) -> Hash {
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    Hash::from_bytes(out)
}

impl HashingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// SHA-256 of `data`. Empty input yields the digest of the empty string.
    pub fn hash(&self, data: &[u8]) -> Hash {
        let started = Instant::now();
        let hash = digest_to_hash(Sha256::digest(data));
        self.record(started.elapsed());
        hash
    }

    /// Hash of the concatenation of the raw bytes of `left` and `right`.
    pub fn combine(&self, left: &Hash, right: &Hash) -> Hash {
        let started = Instant::now();
        let mut hasher = Sha256::new();
        hasher.update(left.as_bytes());
        hasher.update(right.as_bytes());
        let hash = digest_to_hash(hasher.finalize());
        self.record(started.elapsed());
        hash
    }

    pub fn verify(&self, data: &[u8], expected: &Hash) -> bool {
        self.hash(data) == *expected
    }

    /// Stream a file through SHA-256 in fixed-size chunks.
    pub fn hash_file(&self, path: &Path) -> Result<Hash> {
        let started = Instant::now();
        let mut file = File::open(path)
            .map_err(|e| LedgerError::io(format!("open {}", path.display()), e))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; FILE_CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(LedgerError::io(format!("read {}", path.display()), e));
                }
            };
            hasher.update(&buf[..n]);
            total += n as u64;
        }
        let hash = digest_to_hash(hasher.finalize());
        self.record(started.elapsed());
        debug!(path = %path.display(), bytes = total, hash = %hash.short(), "hashed file");
        Ok(hash)
    }

    /// Begin an incremental hash. Fails if a stream is already active so
    /// that in-flight state is never silently dropped.
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Err(LedgerError::State(
                "an incremental hash is already in progress".into(),
            ));
        }
        self.stream = Some(Stream {
            hasher: Sha256::new(),
            started: Instant::now(),
            bytes: 0,
        });
        Ok(())
    }

    pub fn update(&mut self, chunk: &[u8]) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| LedgerError::State("no incremental hash in progress".into()))?;
        stream.hasher.update(chunk);
        stream.bytes += chunk.len() as u64;
        Ok(())
    }

    pub fn finish(&mut self) -> Result<Hash> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| LedgerError::State("no incremental hash in progress".into()))?;
        let hash = digest_to_hash(stream.hasher.finalize());
        self.record(stream.started.elapsed());
        debug!(bytes = stream.bytes, hash = %hash.short(), "finished incremental hash");
        Ok(hash)
    }

    /// Drop an active stream, if any. Returns whether one was active.
    pub fn abort(&mut self) -> bool {
        self.stream.take().is_some()
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stats(&self) -> HashStats {
        let operations = self.operations.load(Ordering::Relaxed);
        let total_nanos = self.total_nanos.load(Ordering::Relaxed);
        let (average_micros, hashes_per_second) = if operations == 0 {
            (0.0, 0.0)
        } else {
            let avg_nanos = total_nanos as f64 / operations as f64;
            let per_sec = if total_nanos == 0 {
                0.0
            } else {
                operations as f64 * 1e9 / total_nanos as f64
            };
            (avg_nanos / 1_000.0, per_sec)
        };
        HashStats {
            operations,
            total_micros: total_nanos / 1_000,
            average_micros,
            hashes_per_second,
        }
    }

    pub fn reset_stats(&self) {
        self.operations.store(0, Ordering::Relaxed);
        self.total_nanos.store(0, Ordering::Relaxed);
    }

    fn record(&self, elapsed: Duration) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
    }
}
