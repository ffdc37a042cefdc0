//! Error types for the upload gateway

use std::io;

use thiserror::Error;

/// Result type alias for the upload gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Process-level upload gateway errors.
///
/// Request-path failures have their own types ([`crate::auth::VerifyError`],
/// [`crate::upload::InvalidFilename`], [`crate::upload::SigningError`]) and
/// never surface as this enum; this one covers startup and runtime plumbing.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
