//! Upload Gateway Library
//!
//! Issues short-lived presigned object-storage upload URLs to callers holding
//! a bearer token from a single trusted issuer.
//!
//! # Pipeline
//!
//! - **Authentication**: RS256 JWT verified against the issuer's JWKS, cached
//!   with a freshness window and refreshed on unknown `kid`
//! - **Authorization**: role lookup plus an expected-principal check
//! - **Key layout**: date-partitioned `YYYY/MMDD/<filename>` keys in a fixed
//!   UTC offset
//! - **Signing**: S3 SigV4 query presigning, computed locally

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod upload;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
