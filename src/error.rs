use crate::types::Fingerprint;
use thiserror::Error;

/// Error type for bloom generation, block building and block reading.
#[derive(Error, Debug)]
pub enum BloomError {
    /// The chunk loader failed (or returned data for the wrong series). Fatal for the run.
    #[error("Chunk load failed for series {fingerprint:016x}: {reason}")]
    ChunkLoad {
        fingerprint: Fingerprint,
        reason: String,
    },

    /// A block writer failed while appending or finishing. Fatal for the run.
    #[error("Block write failed: {0}")]
    Write(String),

    /// A fingerprint-ordered stream went backwards or repeated a fingerprint.
    #[error("Ordering violation in {stream}: {current:016x} does not follow {previous:016x}")]
    OrderingViolation {
        /// Which stream misbehaved (e.g. "series stream", "block builder input").
        stream: &'static str,
        previous: Fingerprint,
        current: Fingerprint,
    },

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Corruption detected: {details}")]
    Corruption { details: String },

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Generation cancelled")]
    Cancelled,

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for BloomError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        BloomError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}

impl From<bincode::Error> for BloomError {
    fn from(err: bincode::Error) -> Self {
        BloomError::Serialization(err.to_string())
    }
}

impl BloomError {
    pub(crate) fn corruption(details: impl Into<String>) -> Self {
        BloomError::Corruption {
            details: details.into(),
        }
    }
}

pub type Result<T, E = BloomError> = std::result::Result<T, E>;
