//! Upload authorization: authorize, build the storage key, issue a write URL.

pub mod audit;
pub mod object_key;
pub mod signer;
pub mod sigv4;

use std::sync::Arc;

use axum::http::HeaderMap;
use tracing::{error, warn};

pub use object_key::{InvalidFilename, ObjectKeyBuilder};
pub use signer::{SignedUploadGrant, SigningError, UploadSigner};
pub use sigv4::{Credentials, S3Presigner, StorageTarget};

use crate::auth::{AuthorizationResult, Authorizer, DenyReason};
use crate::clock::Clock;
use audit::AuditEvent;

/// One upload request as seen by the service.
#[derive(Debug, Clone, Default)]
pub struct UploadRequestInput {
    /// Request headers; only `Authorization` is read.
    pub headers: HeaderMap,
    /// Client-supplied filename, untrusted.
    pub filename: Option<String>,
    /// Why the query string could not be read, if it could not.
    pub query_error: Option<String>,
}

/// Terminal state of one request.
#[derive(Debug)]
pub enum UploadOutcome {
    /// Authorization denied.
    Unauthorized(AuthorizationResult),
    /// The issuer's key set could not be fetched.
    KeyFetchFailed,
    /// Authorized, but the query string was unreadable.
    MalformedQuery(String),
    /// Authorized, but no filename was given.
    MissingFilename,
    /// Authorized, but the filename cannot be used as a key segment.
    InvalidFilename(InvalidFilename),
    /// Write URL issued.
    Issued(SignedUploadGrant),
    /// Authorized, but the signer failed.
    IssueFailed(SigningError),
}

/// Composes the authorizer, the key builder and the signer.
pub struct UploadAuthorizationService {
    authorizer: Arc<Authorizer>,
    keys: ObjectKeyBuilder,
    signer: Arc<dyn UploadSigner>,
    clock: Arc<dyn Clock>,
}

impl UploadAuthorizationService {
    /// Assemble a service.
    #[must_use]
    pub fn new(
        authorizer: Arc<Authorizer>,
        keys: ObjectKeyBuilder,
        signer: Arc<dyn UploadSigner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            authorizer,
            keys,
            signer,
            clock,
        }
    }

    /// Run one request to a terminal outcome. No retries.
    pub async fn handle(&self, input: UploadRequestInput) -> UploadOutcome {
        let decision = self.authorizer.authorize(&input.headers).await;
        if !decision.allowed {
            if decision.deny_reason().is_some_and(DenyReason::is_infrastructure) {
                audit::emit(&AuditEvent::failed(&decision.principal, None, &decision.reason));
                return UploadOutcome::KeyFetchFailed;
            }
            audit::emit(&AuditEvent::denied(&decision.principal, &decision.reason));
            return UploadOutcome::Unauthorized(decision);
        }

        if let Some(details) = input.query_error {
            audit::emit(&AuditEvent::rejected(&decision.principal, "malformed query"));
            return UploadOutcome::MalformedQuery(details);
        }

        let Some(filename) = input.filename else {
            audit::emit(&AuditEvent::rejected(&decision.principal, "missing filename"));
            return UploadOutcome::MissingFilename;
        };

        let key = match self.keys.build_key(&filename, self.clock.now()) {
            Ok(key) => key,
            Err(e) => {
                warn!(principal = %decision.principal, error = %e, "Rejecting upload filename");
                audit::emit(&AuditEvent::rejected(&decision.principal, e.to_string()));
                return UploadOutcome::InvalidFilename(e);
            }
        };

        match self.signer.presign_put(&key).await {
            Ok(grant) => {
                audit::emit(&AuditEvent::issued(
                    &decision.principal,
                    &decision.role,
                    &grant.key,
                    grant.expires_in.as_secs(),
                ));
                UploadOutcome::Issued(grant)
            }
            Err(e) => {
                error!(principal = %decision.principal, key = %key, error = %e, "Failed to issue upload URL");
                audit::emit(&AuditEvent::failed(&decision.principal, Some(&key), e.to_string()));
                UploadOutcome::IssueFailed(e)
            }
        }
    }
}
