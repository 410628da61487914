use std::path::{Path, PathBuf};

use anyhow::Context;
use camledger_core::{LedgerError, Result, Storage};
use sled::{Db, Tree};
use tracing::info;

const TREE_DOCUMENTS: &str = "documents";

/// Documents as keys of one sled tree. Every mutation is flushed before it
/// returns, so a completed `write` survives a crash.
#[derive(Clone)]
pub struct SledStore {
  db: Db,
  docs: Tree,
  path: PathBuf,
}

fn sled_err(context: impl Into<String>, e: sled::Error) -> LedgerError {
  LedgerError::io(context, std::io::Error::other(e))
}

impl SledStore {
  pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
    let path = path.as_ref().to_path_buf();
    let db = sled::open(&path).with_context(|| format!("open sled db at {}", path.display()))?;
    let docs = db
      .open_tree(TREE_DOCUMENTS)
      .context("open documents tree")?;
    info!(path = %path.display(), docs = docs.len(), "sled store opened");
    Ok(Self { db, docs, path })
  }

  pub fn names(&self) -> Result<Vec<String>> {
    self
      .docs
      .iter()
      .keys()
      .map(|k| {
        let k = k.map_err(|e| sled_err("list documents", e))?;
        Ok(String::from_utf8_lossy(&k).into_owned())
      })
      .collect()
  }

  /// Drop every document.
  pub fn clear(&self) -> Result<()> {
    self.docs.clear().map_err(|e| sled_err("clear documents", e))?;
    self.close()
  }

  /// Flush everything to disk.
  pub fn close(&self) -> Result<()> {
    self
      .db
      .flush()
      .map(|_| ())
      .map_err(|e| sled_err(format!("flush {}", self.path.display()), e))
  }
}

impl Storage for SledStore {
  fn ensure_root(&self) -> Result<()> {
    // the db directory is created by open
    Ok(())
  }

  fn exists(&self, name: &str) -> Result<bool> {
    self
      .docs
      .contains_key(name.as_bytes())
      .map_err(|e| sled_err(format!("lookup {name}"), e))
  }

  fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
    let value = self
      .docs
      .get(name.as_bytes())
      .map_err(|e| sled_err(format!("read {name}"), e))?;
    Ok(value.map(|v| v.to_vec()))
  }

  fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
    self
      .docs
      .insert(name.as_bytes(), bytes)
      .map_err(|e| sled_err(format!("write {name}"), e))?;
    self
      .docs
      .flush()
      .map_err(|e| sled_err(format!("flush {name}"), e))?;
    Ok(())
  }

  fn remove(&self, name: &str) -> Result<()> {
    self
      .docs
      .remove(name.as_bytes())
      .map_err(|e| sled_err(format!("remove {name}"), e))?;
    self
      .docs
      .flush()
      .map_err(|e| sled_err(format!("flush {name}"), e))?;
    Ok(())
  }

  fn describe(&self) -> String {
    format!("sled:{}", self.path.display())
  }
}
