use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use camledger_core::{LedgerError, Result, Storage};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Documents as files in one directory. Writes go to a temp file in the same
/// directory, are fsynced and then renamed over the target.
#[derive(Clone, Debug)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Document names are flat; anything that could escape the root is
    /// rejected.
    fn path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(LedgerError::Validation(format!(
                "invalid document name '{name}'"
            )));
        }
        Ok(self.root.join(name))
    }
}

impl Storage for FsStore {
    fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .map_err(|e| LedgerError::io(format!("create {}", self.root.display()), e))
    }

    fn exists(&self, name: &str) -> Result<bool> {
        let path = self.path(name)?;
        path.try_exists()
            .map_err(|e| LedgerError::io(format!("stat {}", path.display()), e))
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LedgerError::io(format!("read {}", path.display()), e)),
        }
    }

    fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(name)?;
        let ctx = || format!("write {}", path.display());

        let mut tmp = NamedTempFile::new_in(&self.root).map_err(|e| LedgerError::io(ctx(), e))?;
        tmp.write_all(bytes).map_err(|e| LedgerError::io(ctx(), e))?;
        tmp.as_file().sync_all().map_err(|e| LedgerError::io(ctx(), e))?;
        tmp.persist(&path).map_err(|e| LedgerError::io(ctx(), e.error))?;

        if let Err(e) = sync_dir(&self.root) {
            warn!(root = %self.root.display(), "directory sync failed: {e}");
        }
        debug!(name, bytes = bytes.len(), "document written");
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        let path = self.path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LedgerError::io(format!("remove {}", path.display()), e)),
        }
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

// The rename itself is only durable once the directory entry is flushed.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
