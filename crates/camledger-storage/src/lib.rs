//! Durable backends for the ledger's `Storage` trait.
//!
//! `FsStore` is the reference layout: one JSON file per document in a data
//! directory. `SledStore` keeps the same documents in an embedded sled tree.

pub mod fs_store;
pub mod sled_store;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Result};
use camledger_core::Storage;

pub use fs_store::FsStore;
pub use sled_store::SledStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Fs,
    Sled,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fs" | "files" => Ok(Backend::Fs),
            "sled" => Ok(Backend::Sled),
            other => bail!("unknown storage backend '{other}' (expected fs or sled)"),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::Fs => "fs",
            Backend::Sled => "sled",
        })
    }
}

/// Open the chosen backend rooted at `root`.
pub fn open_backend(backend: Backend, root: &Path) -> Result<Box<dyn Storage>> {
    Ok(match backend {
        Backend::Fs => Box::new(FsStore::new(root)),
        Backend::Sled => Box::new(SledStore::open(root)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_parse() {
        assert_eq!("fs".parse::<Backend>().unwrap(), Backend::Fs);
        assert_eq!("SLED".parse::<Backend>().unwrap(), Backend::Sled);
        assert!("rocks".parse::<Backend>().is_err());
        assert_eq!(Backend::Sled.to_string(), "sled");
    }
}
