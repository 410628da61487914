use thiserror::Error;

/// Every failure the ledger reports to its callers.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A configuration value is outside its allowed bounds.
    #[error("config error: {0}")]
    Config(String),

    /// Opening, reading or writing persisted data failed.
    #[error("io error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A persisted or imported document could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// A stored hash does not match its recomputed value, or chain linkage is broken.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Malformed input, e.g. a data hash that is not 64 hex characters.
    #[error("validation error: {0}")]
    Validation(String),

    /// Append attempted on a block that no longer accepts transactions.
    #[error("capacity error: {0}")]
    Capacity(String),

    /// The call is not allowed in the current state of the component.
    #[error("state error: {0}")]
    State(String),

    #[error("ledger is not initialized")]
    NotInitialized,
}

impl LedgerError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Short machine-friendly name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Io { .. } => "io",
            Self::Parse(_) => "parse",
            Self::Integrity(_) => "integrity",
            Self::Validation(_) => "validation",
            Self::Capacity(_) => "capacity",
            Self::State(_) => "state",
            Self::NotInitialized => "not_initialized",
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
