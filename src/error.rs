//! Error types for custocrypt

use crate::accel::BackendKind;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for custocrypt
#[derive(Error, Debug)]
pub enum Error {
    // Key custody errors
    #[error("Failed to fetch public key for user '{user_id}': {reason}")]
    FetchPublicKeyFailed { user_id: String, reason: String },

    #[error("Failed to wrap symmetric key: {0}")]
    WrapKeyFailed(String),

    #[error("Failed to unwrap symmetric key: {0}")]
    UnwrapKeyFailed(String),

    #[error("Custodian unreachable at {endpoint}: {reason}")]
    CustodianUnreachable { endpoint: String, reason: String },

    #[error("Custodian rejected {endpoint} with status {status}")]
    CustodianRejected { endpoint: String, status: u16 },

    #[error("Invalid custodian response from {endpoint}: {reason}")]
    CustodianResponse { endpoint: String, reason: String },

    // Approval errors
    #[error("No approval for session {session_id} within {waited_secs}s")]
    ApprovalTimeout { session_id: String, waited_secs: u64 },

    #[error("Approval rejected for session {session_id}: {reason}")]
    ApprovalRejected { session_id: String, reason: String },

    #[error("An approval is already pending for session {0}")]
    ApprovalPending(String),

    #[error("Session unavailable: {0}")]
    SessionUnavailable(String),

    // Container errors
    #[error("Malformed container {path}: {reason}")]
    MalformedContainer { path: String, reason: String },

    // Crypto errors
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    // Backend errors
    #[error("Backend {0} is not available")]
    BackendUnavailable(BackendKind),

    #[error("Backend {backend} failed: {reason}")]
    BackendFailure { backend: BackendKind, reason: String },

    // Chunk / executor errors
    #[error("Invalid chunk size: {0} (must be a positive multiple of 16)")]
    InvalidChunkSize(usize),

    #[error("File needs {0} chunks, more than a container can index")]
    TooManyChunks(u64),

    #[error("Chunk {index} timed out after {timeout_ms} ms")]
    TaskTimeout { index: u32, timeout_ms: u64 },

    #[error("Chunk {index} failed: {source}")]
    ChunkFailed {
        index: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    // Input errors
    #[error("Input file not found: {0}")]
    InputNotFound(PathBuf),

    #[error("Not a regular file: {0}")]
    NotAFile(PathBuf),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad failure classes, used for diagnostics and exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Custodian unreachable, timed out or answered with a bad status
    Transport,
    /// Wrap/unwrap, padding or size mismatch
    Crypto,
    /// Missing or garbled container trailer, inconsistent lengths
    Format,
    /// Every backend including software AES failed
    Backend,
    /// Task timeout or cancellation
    Concurrency,
    /// Human approval did not happen
    Approval,
    /// Missing or unreadable input
    Input,
    Config,
    Internal,
}

impl Error {
    /// Classify the error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::FetchPublicKeyFailed { .. }
            | Error::CustodianUnreachable { .. }
            | Error::CustodianRejected { .. }
            | Error::CustodianResponse { .. }
            | Error::SessionUnavailable(_) => ErrorCategory::Transport,

            Error::WrapKeyFailed(_)
            | Error::UnwrapKeyFailed(_)
            | Error::Encryption(_)
            | Error::Decryption(_)
            | Error::KeyDerivation(_)
            | Error::InvalidKeyLength { .. } => ErrorCategory::Crypto,

            Error::MalformedContainer { .. } => ErrorCategory::Format,

            Error::BackendUnavailable(_) | Error::BackendFailure { .. } => ErrorCategory::Backend,

            Error::TaskTimeout { .. } | Error::Cancelled => ErrorCategory::Concurrency,
            Error::ChunkFailed { source, .. } => source.category(),

            Error::ApprovalTimeout { .. }
            | Error::ApprovalRejected { .. }
            | Error::ApprovalPending(_) => ErrorCategory::Approval,

            Error::InputNotFound(_) | Error::NotAFile(_) | Error::Io(_) => ErrorCategory::Input,

            Error::InvalidChunkSize(_)
            | Error::TooManyChunks(_)
            | Error::Config(_)
            | Error::InvalidConfig(_) => ErrorCategory::Config,

            Error::Serialization(_) | Error::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Transport => 10,
            ErrorCategory::Crypto => 11,
            ErrorCategory::Format => 12,
            ErrorCategory::Backend => 13,
            ErrorCategory::Concurrency => 14,
            ErrorCategory::Approval => 15,
            ErrorCategory::Input => 2,
            ErrorCategory::Config => 3,
            ErrorCategory::Internal => 1,
        }
    }

    /// Chunk index carried by the error, if any
    pub fn chunk_index(&self) -> Option<u32> {
        match self {
            Error::TaskTimeout { index, .. } | Error::ChunkFailed { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub(crate) fn malformed(path: impl AsRef<std::path::Path>, reason: impl Into<String>) -> Self {
        Error::MalformedContainer {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_failure_keeps_index_and_category() {
        let err = Error::ChunkFailed {
            index: 7,
            source: Box::new(Error::BackendFailure {
                backend: BackendKind::Software,
                reason: "boom".to_string(),
            }),
        };
        assert_eq!(err.chunk_index(), Some(7));
        assert_eq!(err.category(), ErrorCategory::Backend);
        assert!(err.to_string().contains("Chunk 7"));
    }

    #[test]
    fn test_exit_codes_are_distinct_per_category() {
        let timeout = Error::TaskTimeout { index: 1, timeout_ms: 10 };
        let malformed = Error::malformed("x.enc", "no marker");
        let rejected = Error::CustodianRejected {
            endpoint: "/api/key/decrypt".to_string(),
            status: 500,
        };
        assert_ne!(timeout.exit_code(), malformed.exit_code());
        assert_ne!(malformed.exit_code(), rejected.exit_code());
        assert_eq!(timeout.chunk_index(), Some(1));
    }
}
