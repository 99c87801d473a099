//! Error types for blockgc_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using blockgc_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during repository and GC operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// A string or byte sequence could not be parsed as a CID.
    #[error("Invalid CID: {reason}")]
    InvalidCid { reason: String },

    /// Block not found in the blockstore.
    #[error("Block not found: {cid}")]
    BlockNotFound { cid: String },

    /// Datastore key has no value.
    #[error("Key not found: {key}")]
    NotFound { key: String },

    /// Datastore key is malformed.
    #[error("Invalid datastore key: {reason}")]
    InvalidKey { reason: String },

    /// Repository is invalid or not initialized.
    #[error("Invalid repository at {path}: {reason}")]
    InvalidRepo { path: PathBuf, reason: String },

    /// Block payload does not decode under its codec.
    #[error("Invalid node {cid}: {reason}")]
    InvalidNode { cid: String, reason: String },

    /// Codec has no link decoder.
    #[error("Unsupported codec: {codec}")]
    UnsupportedCodec { codec: String },

    /// Unsupported hash algorithm.
    #[error("Unsupported algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },

    /// CID is not pinned.
    #[error("Not pinned: {cid}")]
    NotPinned { cid: String },

    /// Block is pinned and cannot be removed.
    #[error("Block is pinned: {cid}")]
    Pinned { cid: String },

    /// Invalid configuration value.
    #[error("Invalid config: {reason}")]
    InvalidConfig { reason: String },

    /// JSON encoding or decoding error.
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// A liveness source failed while building the mark set.
    #[error("Mark phase failed reading {phase}: {source}")]
    MarkPhase {
        phase: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// Background task failed to complete.
    #[error("Task failed: {reason}")]
    Task { reason: String },
}

impl Error {
    /// Create an InvalidCid error.
    pub fn invalid_cid(reason: impl Into<String>) -> Self {
        Error::InvalidCid {
            reason: reason.into(),
        }
    }

    /// Create a BlockNotFound error.
    pub fn block_not_found(cid: impl Into<String>) -> Self {
        Error::BlockNotFound { cid: cid.into() }
    }

    /// Create a NotFound error.
    pub fn not_found(key: impl Into<String>) -> Self {
        Error::NotFound { key: key.into() }
    }

    /// Create an InvalidKey error.
    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Error::InvalidKey {
            reason: reason.into(),
        }
    }

    /// Create an InvalidRepo error.
    pub fn invalid_repo(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidRepo {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidNode error.
    pub fn invalid_node(cid: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidNode {
            cid: cid.into(),
            reason: reason.into(),
        }
    }

    /// Create an UnsupportedCodec error.
    pub fn unsupported_codec(codec: impl Into<String>) -> Self {
        Error::UnsupportedCodec {
            codec: codec.into(),
        }
    }

    /// Create an UnsupportedAlgorithm error.
    pub fn unsupported_algorithm(algorithm: impl Into<String>) -> Self {
        Error::UnsupportedAlgorithm {
            algorithm: algorithm.into(),
        }
    }

    /// Create a NotPinned error.
    pub fn not_pinned(cid: impl Into<String>) -> Self {
        Error::NotPinned { cid: cid.into() }
    }

    /// Create a Pinned error.
    pub fn pinned(cid: impl Into<String>) -> Self {
        Error::Pinned { cid: cid.into() }
    }

    /// Create an InvalidConfig error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Wrap a liveness source failure as a fatal mark-phase error.
    pub fn mark_phase(phase: &'static str, source: Error) -> Self {
        Error::MarkPhase {
            phase,
            source: Box::new(source),
        }
    }

    /// Create a Task error.
    pub fn task(reason: impl Into<String>) -> Self {
        Error::Task {
            reason: reason.into(),
        }
    }

    /// Returns true if this is the datastore's "no such key" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

// Additional From implementations for external error types

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<cid::Error> for Error {
    fn from(err: cid::Error) -> Self {
        Error::InvalidCid {
            reason: err.to_string(),
        }
    }
}

impl From<multihash::Error> for Error {
    fn from(err: multihash::Error) -> Self {
        Error::InvalidCid {
            reason: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Task {
            reason: err.to_string(),
        }
    }
}
