//! Storage signing collaborator.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// A time-bounded authorization to write one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUploadGrant {
    /// Presigned `PUT` URL.
    pub url: String,
    /// Storage key the URL writes to.
    pub key: String,
    /// Lifetime of the URL.
    #[serde(serialize_with = "as_seconds")]
    pub expires_in: Duration,
    /// Content type the upload must be sent with.
    pub content_type: String,
}

fn as_seconds<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

/// Failure to produce a grant.
#[derive(Debug, Error)]
pub enum SigningError {
    /// No usable credentials were configured.
    #[error("storage credentials are not configured")]
    MissingCredentials,
    /// Requested lifetime is outside what the store accepts.
    #[error("invalid URL expiry: {0}")]
    InvalidExpiry(String),
    /// The signing computation itself failed.
    #[error("signing failed: {0}")]
    Crypto(String),
    /// A remote signing service rejected or failed the request.
    #[error("signing service error: {0}")]
    Upstream(String),
}

/// Issues write grants for storage keys.
#[async_trait]
pub trait UploadSigner: Send + Sync {
    /// Presign a `PUT` of `key`.
    async fn presign_put(&self, key: &str) -> Result<SignedUploadGrant, SigningError>;
}
