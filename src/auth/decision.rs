//! Authorization decision: verified identity → role → allow/deny.
//!
//! Two separate stages:
//!
//! 1. [`Authorizer::authenticate`]: cryptographic validity only (credential
//!    present, token decodes, key resolves, signature and claims verify).
//! 2. [`Authorizer::decide`]: policy only (role lookup, expected principal).
//!
//! A multi-user mode would replace stage 2 and leave stage 1 alone.
//!
//! Every outcome is an [`AuthorizationResult`]; nothing in here returns an
//! error to the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, header::AUTHORIZATION};
use serde::Serialize;
use tracing::{debug, error, warn};

use super::keys::KeyCache;
use super::token::{TokenVerifier, UnverifiedToken, VerifiedIdentity, VerifyError, bearer_credential};
use crate::config::AuthConfig;

/// Principal and role reported when no identity was established.
pub const ANONYMOUS: &str = "anonymous";

/// Why a request was not allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DenyReason {
    /// No `Authorization: Bearer` credential.
    CredentialMissing,
    /// Credential is not a decodable JWT.
    MalformedToken,
    /// `kid` not in the issuer's key set.
    UnknownSigningKey,
    /// Wrong algorithm or bad signature.
    SignatureInvalid,
    /// `exp` has passed.
    TokenExpired,
    /// Issuer, audience or principal claim rejected.
    InvalidClaims,
    /// Verified, but not the expected principal.
    PrincipalMismatch,
    /// The issuer's key set could not be fetched.
    KeyFetchFailure,
}

impl DenyReason {
    /// Human-readable reason reported to the client.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CredentialMissing => "missing credential",
            Self::MalformedToken => "malformed token",
            Self::UnknownSigningKey => "unknown signing key",
            Self::SignatureInvalid => "signature invalid",
            Self::TokenExpired => "token expired",
            Self::InvalidClaims => "invalid claims",
            Self::PrincipalMismatch => "principal mismatch",
            Self::KeyFetchFailure => "key fetch failure",
        }
    }

    /// Whether the failure lies with our infrastructure rather than the caller.
    #[must_use]
    pub fn is_infrastructure(self) -> bool {
        matches!(self, Self::KeyFetchFailure)
    }
}

impl From<&VerifyError> for DenyReason {
    fn from(err: &VerifyError) -> Self {
        match err {
            VerifyError::Malformed(_) => Self::MalformedToken,
            VerifyError::UnknownKey(_) => Self::UnknownSigningKey,
            VerifyError::Signature(_) => Self::SignatureInvalid,
            VerifyError::Expired => Self::TokenExpired,
            VerifyError::InvalidClaims(_) => Self::InvalidClaims,
        }
    }
}

/// Outcome of [`Authorizer::authorize`]. Always produced; callers branch on `allowed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationResult {
    /// Whether the upload may proceed.
    pub allowed: bool,
    /// Verified principal, or `"anonymous"`.
    pub principal: String,
    /// Derived role, or `"anonymous"`.
    pub role: String,
    /// Human-readable reason.
    pub reason: String,
    #[serde(skip)]
    deny: Option<DenyReason>,
}

impl AuthorizationResult {
    /// An allowed result.
    #[must_use]
    pub fn allow(principal: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            allowed: true,
            principal: principal.into(),
            role: role.into(),
            reason: "authorized".to_string(),
            deny: None,
        }
    }

    /// A denied result for an identity that was never established.
    #[must_use]
    pub fn anonymous(reason: DenyReason) -> Self {
        Self::deny(ANONYMOUS, ANONYMOUS, reason)
    }

    /// A denied result.
    #[must_use]
    pub fn deny(principal: impl Into<String>, role: impl Into<String>, reason: DenyReason) -> Self {
        Self {
            allowed: false,
            principal: principal.into(),
            role: role.into(),
            reason: reason.as_str().to_string(),
            deny: Some(reason),
        }
    }

    /// The deny reason, when not allowed.
    #[must_use]
    pub fn deny_reason(&self) -> Option<DenyReason> {
        self.deny
    }
}

/// Maps a verified principal to a role.
#[async_trait]
pub trait RoleLookup: Send + Sync {
    /// The role assigned to `principal`, if any.
    async fn role_for(&self, principal: &str) -> Option<String>;
}

/// Exact-match role table from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticRoles {
    roles: HashMap<String, String>,
}

impl StaticRoles {
    /// Build from a principal → role map.
    #[must_use]
    pub fn new(roles: HashMap<String, String>) -> Self {
        Self { roles }
    }
}

#[async_trait]
impl RoleLookup for StaticRoles {
    async fn role_for(&self, principal: &str) -> Option<String> {
        self.roles.get(principal).cloned()
    }
}

/// Single-tenant authorizer.
pub struct Authorizer {
    keys: Arc<KeyCache>,
    verifier: TokenVerifier,
    roles: Arc<dyn RoleLookup>,
    expected_principal: String,
    default_role: String,
    unknown_kid_cooldown: Duration,
}

impl Authorizer {
    /// Assemble an authorizer.
    #[must_use]
    pub fn new(
        config: &AuthConfig,
        keys: Arc<KeyCache>,
        verifier: TokenVerifier,
        roles: Arc<dyn RoleLookup>,
    ) -> Self {
        Self {
            keys,
            verifier,
            roles,
            expected_principal: config.expected_principal.clone(),
            default_role: config.default_role.clone(),
            unknown_kid_cooldown: config.unknown_kid_cooldown,
        }
    }

    /// Authorize a request from its headers.
    pub async fn authorize(&self, headers: &HeaderMap) -> AuthorizationResult {
        match self.authenticate(headers).await {
            Ok(identity) => self.decide(&identity).await,
            Err(reason) => AuthorizationResult::anonymous(reason),
        }
    }

    /// Stage 1: establish a verified identity from the `Authorization` header.
    ///
    /// Never touches the key cache when no bearer credential is present.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<VerifiedIdentity, DenyReason> {
        let credential = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_credential)
            .ok_or(DenyReason::CredentialMissing)?;

        let token = UnverifiedToken::parse(credential).map_err(|e| {
            debug!(error = %e, "Rejecting undecodable bearer token");
            DenyReason::from(&e)
        })?;

        let mut keys = self.keys.get_key_set().await.map_err(|e| {
            error!(error = %e, "Cannot verify token: key set unavailable");
            DenyReason::KeyFetchFailure
        })?;

        if let Some(kid) = token.key_id() {
            if !keys.contains(kid) {
                debug!(kid = %kid, "Unknown kid, checking for rotated issuer keys");
                keys = self
                    .keys
                    .refresh_if_older_than(self.unknown_kid_cooldown)
                    .await
                    .map_err(|e| {
                        error!(error = %e, "Cannot verify token: key set refresh failed");
                        DenyReason::KeyFetchFailure
                    })?;
            }
        }

        self.verifier.verify(&token, &keys).map_err(|e| {
            warn!(
                error = %e,
                claimed_sub = ?token.unverified_claim("sub"),
                "Bearer token verification failed"
            );
            DenyReason::from(&e)
        })
    }

    /// Stage 2: apply the role table and the expected-principal policy.
    pub async fn decide(&self, identity: &VerifiedIdentity) -> AuthorizationResult {
        let principal = identity.principal();
        let role = self
            .roles
            .role_for(principal)
            .await
            .unwrap_or_else(|| self.default_role.clone());

        if principal == self.expected_principal {
            AuthorizationResult::allow(principal, role)
        } else {
            debug!(principal = %principal, "Verified principal is not the expected principal");
            AuthorizationResult::deny(principal, role, DenyReason::PrincipalMismatch)
        }
    }
}
