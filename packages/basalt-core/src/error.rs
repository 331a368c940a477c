//! # Error Handling
//!
//! This module provides the error types for Basalt Core.
//!
//! All errors are categorized by layer so that callers can react to the
//! *kind* of failure rather than matching on message text:
//!
//! - Lookup errors (`NotFound`, `DependencyMissing`)
//! - Verification errors (`InvalidSignature`, `UnknownSigner`)
//! - Key errors (`MissingKey`)
//! - Auth errors (`InvalidToken`, `ChallengeExpired`, `UserRevoked`, `UserNotFound`)
//! - Transfer errors (`Cancelled`, `Timeout`, `Transport`)
//! - Integrity errors (`Corruption`) — fatal, never retried
//! - Programmer errors (`InvalidArgument`)
//!
//! `MissingKey` deserves a note: an entry whose symmetric key is absent from
//! the KeyBag is *not* a failure for storage or replication. The store keeps
//! the ciphertext and the assembler skips the entry. The error only surfaces
//! to a caller that asked for that specific plaintext (an explicit
//! `get_attachment` or a `change_document` on a key-less doc).

use thiserror::Error;

/// Result type alias for Basalt Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Basalt Core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Lookup
    // ========================================================================

    /// A document, attachment, entry, database, or tenant is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// An entry references a dependency id that is neither present locally
    /// nor resolvable from the peer
    #[error("Missing dependency entry: {0}")]
    DependencyMissing(String),

    // ========================================================================
    // Verification
    // ========================================================================

    /// An entry's signature does not verify under its creator key
    #[error("Entry signature verification failed")]
    InvalidSignature,

    /// The signer's public key is not trusted by the directory at check time
    #[error("Signer is not trusted by the directory: {0}")]
    UnknownSigner(String),

    // ========================================================================
    // Keys
    // ========================================================================

    /// No KeyBag entry exists for a required symmetric key.
    /// Non-fatal for storage and sync; fatal only for explicit plaintext access.
    #[error("No key in the key bag for id: {0}")]
    MissingKey(String),

    // ========================================================================
    // Auth
    // ========================================================================

    /// The bearer session token is missing, malformed, or expired
    #[error("Invalid or expired session token")]
    InvalidToken,

    /// The auth challenge has expired or was already consumed
    #[error("Challenge expired or unknown")]
    ChallengeExpired,

    /// The user's signing key has been revoked by the directory
    #[error("User access has been revoked: {0}")]
    UserRevoked(String),

    /// The directory has no trusted keys for this username
    #[error("Unknown user: {0}")]
    UserNotFound(String),

    // ========================================================================
    // Transfer
    // ========================================================================

    /// Cooperative cancellation was requested
    #[error("Operation cancelled")]
    Cancelled,

    /// A transport operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A transport-level failure (connection refused, protocol error, ...)
    #[error("Transport error: {0}")]
    Transport(String),

    // ========================================================================
    // Integrity
    // ========================================================================

    /// Store integrity failure: AES tag mismatch, content-hash mismatch,
    /// or malformed serialization. Fatal, never retried.
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// Backing-store I/O failure (SQLite error, disk error)
    #[error("Storage error: {0}")]
    Storage(String),

    // ========================================================================
    // Programmer errors
    // ========================================================================

    /// Invalid API usage, e.g. mutating a document outside `change_document`
    /// or an out-of-bounds attachment range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Check if this error is retryable at the sync layer.
    ///
    /// Only transport-level failures are retried; verification and
    /// integrity failures never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Transport(_))
    }

    /// Check if this error must abort a whole sync run rather than a
    /// single batch (`Cancelled`, `Corruption`, or a potential attack).
    pub fn aborts_sync(&self) -> bool {
        matches!(
            self,
            Error::Cancelled | Error::Corruption(_) | Error::UnknownSigner(_)
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Corruption(format!("JSON serialization: {}", err))
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Corruption(format!("binary serialization: {}", err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================
