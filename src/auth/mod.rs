//! Bearer token authentication against a remote, rotating JWKS.
//!
//! - [`keys`]: fetches and caches the issuer's key set
//! - [`token`]: decodes and verifies bearer tokens
//! - [`decision`]: turns a verified identity into an allow/deny result

pub mod decision;
pub mod keys;
pub mod token;

pub use decision::{AuthorizationResult, Authorizer, DenyReason, RoleLookup, StaticRoles};
pub use keys::{HttpKeyFetcher, KeyCache, KeyFetchError, KeyFetcher, KeySet};
pub use token::{TokenVerifier, UnverifiedToken, VerifiedIdentity, VerifyError};
