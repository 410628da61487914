//! Byte-stream storage the ledger persists to.
//!
//! The trait lives in the core crate so the manager can depend on it; the
//! durable backends live in `camledger-storage`. Names are flat file names
//! such as `chain.json` or `block_12.json`. `write` must replace the whole
//! document atomically: after it returns `Ok`, a reader sees the complete new
//! content, and after an error it sees the complete old content.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{LedgerError, Result};

pub trait Storage: Send {
    /// Create the storage root if it does not exist yet.
    fn ensure_root(&self) -> Result<()>;
    fn exists(&self, name: &str) -> Result<bool>;
    /// `Ok(None)` when the document does not exist.
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;
    fn write(&self, name: &str, bytes: &[u8]) -> Result<()>;
    /// Removing a missing document is not an error.
    fn remove(&self, name: &str) -> Result<()>;
    /// Human-readable location, for log lines.
    fn describe(&self) -> String;
}

/// In-memory backend. Clones share the same documents, which lets a test
/// keep a handle while the manager owns the storage. Writes can be made to
/// fail on demand to exercise the ledger's I/O error paths.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    docs: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().map(|d| d.keys().cloned().collect()).unwrap_or_default()
    }

    /// Overwrite a document directly, bypassing failure injection.
    pub fn put_raw(&self, name: &str, bytes: &[u8]) {
        if let Ok(mut docs) = self.lock() {
            docs.insert(name.to_string(), bytes.to_vec());
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.docs
            .lock()
            .map_err(|_| LedgerError::State("memory storage lock poisoned".into()))
    }
}

impl Storage for MemoryStorage {
    fn ensure_root(&self) -> Result<()> {
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.lock()?.contains_key(name))
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(name).cloned())
    }

    fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LedgerError::io(
                format!("write {name}"),
                std::io::Error::other("injected write failure"),
            ));
        }
        self.lock()?.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.lock()?.remove(name);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}
