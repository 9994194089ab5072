// SPDX-License-Identifier: Apache-2.0
//
// Unified error types for Cinder.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for all Cinder operations.
#[derive(Debug, Error)]
pub enum CinderError {
    // -- Storage errors --
    #[error("no stored item for key: {0}")]
    NotFound(String),

    #[error("encryption failed: {0}")]
    Crypto(String),

    #[error("integrity check failed for {key}: ciphertext tampered or corrupted")]
    Integrity { key: String },

    #[error("stored item too short to contain nonce and tag: {0} bytes")]
    MalformedCiphertext(usize),

    // -- Lifecycle errors --
    #[error("environment already destroyed; no further operations permitted")]
    AlreadyDestroyed,

    #[error("environment is being destroyed; operation rejected")]
    Destroying,

    // -- Isolation errors --
    #[error("path not in the environment allow-list: {0}")]
    PathNotAllowed(PathBuf),

    #[error("outbound network access is blocked in this environment: {0}")]
    NetworkBlocked(String),

    #[error("another secure environment already holds process isolation")]
    ConcurrentIsolationConflict,

    #[error("isolation guard is {0}; operation not valid in this state")]
    InvalidGuardState(&'static str),

    // -- Destruction errors --
    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),

    #[error("secure erase unsupported on this platform and manual overwrite failed: {0}")]
    PlatformUnsupported(String),

    // -- Ambient --
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CinderError>;
