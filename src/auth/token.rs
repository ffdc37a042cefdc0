//! Bearer token decoding and verification.
//!
//! # Verification flow
//!
//! 1. [`UnverifiedToken::parse`] decodes the header and payload without
//!    trusting either. Nothing in an unverified token yields a principal.
//! 2. The header `kid` selects the key from the current [`KeySet`]. A `kid`
//!    outside the set is an unknown key whatever else the token claims.
//! 3. The header `alg` must be exactly [`EXPECTED_ALGORITHM`]. The token never
//!    chooses how it is verified.
//! 4. Signature, `iss` and `aud` are checked by `jsonwebtoken`; `exp` is
//!    checked against the injected clock with the configured leeway.
//! 5. Only then is a [`VerifiedIdentity`] built.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use jsonwebtoken::{Algorithm, Header, Validation, errors::ErrorKind};
use serde::Serialize;
use serde_json::{Map, Value};

use super::keys::KeySet;
use crate::clock::Clock;
use crate::config::{AuthConfig, PrincipalClaim};

/// The only signature algorithm accepted.
pub const EXPECTED_ALGORITHM: Algorithm = Algorithm::RS256;

/// Why a bearer token was rejected.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// Not a structurally valid JWT.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// The `kid` is not in the current key set.
    #[error("unknown signing key: {0}")]
    UnknownKey(String),

    /// Wrong algorithm, or the signature does not verify under the resolved key.
    #[error("signature invalid: {0}")]
    Signature(String),

    /// `exp` has passed.
    #[error("token expired")]
    Expired,

    /// Issuer, audience, or principal claim rejected.
    #[error("invalid claims: {0}")]
    InvalidClaims(String),
}

/// Extract the credential from an `Authorization` header value.
///
/// The scheme is matched case-insensitively. Returns `None` for any other
/// scheme or an empty credential.
#[must_use]
pub fn bearer_credential(header_value: &str) -> Option<&str> {
    let (scheme, credential) = header_value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let credential = credential.trim();
    (!credential.is_empty()).then_some(credential)
}

/// A decoded but not yet trusted token.
#[derive(Debug)]
pub struct UnverifiedToken {
    raw: String,
    header: Header,
    claims: Map<String, Value>,
}

impl UnverifiedToken {
    /// Decode a compact JWT without verifying it.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::Malformed`] if the token does not have three
    /// segments or its header or payload cannot be decoded.
    pub fn parse(raw: &str) -> Result<Self, VerifyError> {
        let segments: Vec<&str> = raw.split('.').collect();
        if segments.len() != 3 {
            return Err(VerifyError::Malformed(format!(
                "expected 3 segments, found {}",
                segments.len()
            )));
        }

        let header = jsonwebtoken::decode_header(raw)
            .map_err(|e| VerifyError::Malformed(format!("header: {e}")))?;

        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(segments[1])
            .map_err(|e| VerifyError::Malformed(format!("payload encoding: {e}")))?;
        let claims: Map<String, Value> = serde_json::from_slice(&payload)
            .map_err(|e| VerifyError::Malformed(format!("payload: {e}")))?;

        Ok(Self {
            raw: raw.to_string(),
            header,
            claims,
        })
    }

    /// The `kid` named in the header, if any.
    #[must_use]
    pub fn key_id(&self) -> Option<&str> {
        self.header.kid.as_deref()
    }

    /// The `alg` named in the header.
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.header.alg
    }

    /// A payload claim as the client sent it. Diagnostics only.
    #[must_use]
    pub fn unverified_claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }
}

/// Identity established by a successfully verified token.
///
/// Only [`TokenVerifier::verify`] can build one.
#[derive(Debug, Clone, Serialize)]
pub struct VerifiedIdentity {
    principal: String,
    subject: Option<String>,
    email: Option<String>,
    issuer: Option<String>,
    expires_at: i64,
    #[serde(skip)]
    claims: Map<String, Value>,
}

impl VerifiedIdentity {
    /// The principal (per the configured principal claim).
    #[must_use]
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// The `sub` claim.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// The `email` claim.
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// The `iss` claim.
    #[must_use]
    pub fn issuer(&self) -> Option<&str> {
        self.issuer.as_deref()
    }

    /// The `exp` claim, in Unix seconds.
    #[must_use]
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// Every claim of the verified payload.
    #[must_use]
    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }
}

/// Verifies tokens against a [`KeySet`].
pub struct TokenVerifier {
    validation: Validation,
    leeway: Duration,
    principal_claim: PrincipalClaim,
    clock: Arc<dyn Clock>,
}

impl TokenVerifier {
    /// Build a verifier from the auth configuration.
    #[must_use]
    pub fn new(config: &AuthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            validation: build_validation(config.issuer.as_deref(), &config.audiences),
            leeway: config.leeway,
            principal_claim: config.principal_claim,
            clock,
        }
    }

    /// Verify `token` using only keys from `keys`.
    ///
    /// # Errors
    ///
    /// Returns a [`VerifyError`] describing the first check that failed.
    pub fn verify(
        &self,
        token: &UnverifiedToken,
        keys: &KeySet,
    ) -> Result<VerifiedIdentity, VerifyError> {
        let kid = token
            .key_id()
            .ok_or_else(|| VerifyError::Malformed("header has no kid".to_string()))?;
        let key = keys
            .get(kid)
            .ok_or_else(|| VerifyError::UnknownKey(kid.to_string()))?;

        if token.algorithm() != EXPECTED_ALGORITHM {
            return Err(VerifyError::Signature(format!(
                "algorithm {:?} is not accepted",
                token.algorithm()
            )));
        }

        let data = jsonwebtoken::decode::<Map<String, Value>>(&token.raw, key, &self.validation)
            .map_err(classify)?;
        let claims = data.claims;

        let expires_at = self.check_expiry(&claims)?;

        let claim_name = self.principal_claim.claim_name();
        let principal = string_claim(&claims, claim_name)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| VerifyError::InvalidClaims(format!("missing {claim_name} claim")))?;

        Ok(VerifiedIdentity {
            principal,
            subject: string_claim(&claims, "sub"),
            email: string_claim(&claims, "email"),
            issuer: string_claim(&claims, "iss"),
            expires_at,
            claims,
        })
    }

    fn check_expiry(&self, claims: &Map<String, Value>) -> Result<i64, VerifyError> {
        let exp = claims
            .get("exp")
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .ok_or_else(|| VerifyError::InvalidClaims("exp is missing or not a number".to_string()))?;

        let leeway = i64::try_from(self.leeway.as_secs()).unwrap_or(i64::MAX);
        if exp.saturating_add(leeway) < self.clock.now().timestamp() {
            return Err(VerifyError::Expired);
        }
        Ok(exp)
    }
}

fn build_validation(issuer: Option<&str>, audiences: &[String]) -> Validation {
    let mut v = Validation::new(EXPECTED_ALGORITHM);
    // exp is checked against the injected clock instead
    v.validate_exp = false;
    v.leeway = 0;
    v.required_spec_claims = HashSet::from(["exp".to_string()]);
    if let Some(iss) = issuer {
        v.set_issuer(&[iss]);
    }
    if audiences.is_empty() {
        v.validate_aud = false;
    } else {
        v.set_audience(audiences);
    }
    v
}

fn string_claim(claims: &Map<String, Value>, name: &str) -> Option<String> {
    claims.get(name).and_then(Value::as_str).map(str::to_string)
}

fn classify(err: jsonwebtoken::errors::Error) -> VerifyError {
    match err.kind() {
        ErrorKind::ExpiredSignature => VerifyError::Expired,
        ErrorKind::InvalidIssuer
        | ErrorKind::InvalidAudience
        | ErrorKind::InvalidSubject
        | ErrorKind::ImmatureSignature
        | ErrorKind::MissingRequiredClaim(_) => VerifyError::InvalidClaims(err.to_string()),
        ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
            VerifyError::Malformed(err.to_string())
        }
        _ => VerifyError::Signature(err.to_string()),
    }
}
