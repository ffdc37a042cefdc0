//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Placeholder printed in place of secret values by [`Config::redacted`].
const REDACTED: &str = "<redacted>";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Environment files to load before resolving `env:` references.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Token verification and authorization policy
    pub auth: AuthConfig,
    /// Object storage the upload URLs point at
    pub storage: StorageConfig,
    /// Storage key layout
    pub object_key: ObjectKeyConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Which token claim names the principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalClaim {
    /// The `email` claim (default)
    #[default]
    Email,
    /// The `sub` claim
    Sub,
}

impl PrincipalClaim {
    /// Claim name in the JWT payload.
    #[must_use]
    pub fn claim_name(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sub => "sub",
        }
    }
}

/// Token verification and authorization policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HTTPS URL of the issuer's JWKS document
    pub jwks_uri: String,
    /// Required `iss` claim (unchecked when unset)
    pub issuer: Option<String>,
    /// Accepted `aud` values (unchecked when empty)
    pub audiences: Vec<String>,
    /// The single principal allowed to obtain upload URLs
    pub expected_principal: String,
    /// Claim used as the principal
    pub principal_claim: PrincipalClaim,
    /// Maximum age of the cached key set
    #[serde(with = "humantime_serde")]
    pub key_freshness: Duration,
    /// Minimum age of the cached key set before an unknown `kid` forces a refetch
    #[serde(with = "humantime_serde")]
    pub unknown_kid_cooldown: Duration,
    /// Clock skew tolerated on `exp`
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
    /// Timeout for a single JWKS fetch
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// Exact principal → role assignments
    pub roles: HashMap<String, String>,
    /// Role for verified principals without an explicit assignment
    pub default_role: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwks_uri: String::new(),
            issuer: None,
            audiences: Vec::new(),
            expected_principal: String::new(),
            principal_claim: PrincipalClaim::Email,
            key_freshness: Duration::from_secs(3600),
            unknown_kid_cooldown: Duration::from_secs(60),
            leeway: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(10),
            roles: HashMap::new(),
            default_role: "authenticatedUser".to_string(),
        }
    }
}

/// Object storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Bucket name
    pub bucket: String,
    /// Signing region
    pub region: String,
    /// Custom endpoint for S3-compatible stores (path-style addressing).
    /// When unset, AWS virtual-hosted addressing is used.
    pub endpoint: Option<String>,
    /// Access key id (supports `env:VAR_NAME`)
    pub access_key_id: String,
    /// Secret access key (supports `env:VAR_NAME`)
    pub secret_access_key: String,
    /// Session token for temporary credentials (supports `env:VAR_NAME`)
    pub session_token: Option<String>,
    /// Lifetime of an issued upload URL
    #[serde(with = "humantime_serde")]
    pub url_expiry: Duration,
    /// Content type the upload must be sent with
    pub content_type: String,
    /// Canned ACL applied to the uploaded object (e.g. `public-read`)
    pub acl: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key_id: "env:AWS_ACCESS_KEY_ID".to_string(),
            secret_access_key: "env:AWS_SECRET_ACCESS_KEY".to_string(),
            session_token: None,
            url_expiry: Duration::from_secs(300),
            content_type: "application/octet-stream".to_string(),
            acl: None,
        }
    }
}

impl StorageConfig {
    /// Resolve the access key id (expand env vars)
    #[must_use]
    pub fn resolve_access_key_id(&self) -> String {
        resolve_env_reference(&self.access_key_id)
    }

    /// Resolve the secret access key (expand env vars)
    #[must_use]
    pub fn resolve_secret_access_key(&self) -> String {
        resolve_env_reference(&self.secret_access_key)
    }

    /// Resolve the session token, treating an empty result as absent
    #[must_use]
    pub fn resolve_session_token(&self) -> Option<String> {
        self.session_token
            .as_deref()
            .map(resolve_env_reference)
            .filter(|t| !t.is_empty())
    }
}

/// Storage key layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectKeyConfig {
    /// Offset from UTC, in hours, of the calendar used for date partitions
    pub utc_offset_hours: i32,
}

impl Default for ObjectKeyConfig {
    fn default() -> Self {
        Self {
            utc_offset_hours: 9,
        }
    }
}

/// Expand an `env:VAR_NAME` reference; other values are returned verbatim.
fn resolve_env_reference(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_default()
    } else {
        value.to_string()
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (UPLOAD_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("UPLOAD_GATEWAY_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env: references are resolved)
        config.load_env_files();

        Ok(config)
    }

    /// Check the settings the request path cannot run without.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first missing or out-of-range setting.
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwks_uri.trim().is_empty() {
            return Err(Error::Config("auth.jwks_uri is required".to_string()));
        }
        url::Url::parse(&self.auth.jwks_uri)
            .map_err(|e| Error::Config(format!("auth.jwks_uri is not a valid URL: {e}")))?;
        if self.auth.expected_principal.trim().is_empty() {
            return Err(Error::Config(
                "auth.expected_principal is required".to_string(),
            ));
        }
        if self.storage.bucket.trim().is_empty() {
            return Err(Error::Config("storage.bucket is required".to_string()));
        }
        if let Some(endpoint) = &self.storage.endpoint {
            url::Url::parse(endpoint).map_err(|e| {
                Error::Config(format!("storage.endpoint is not a valid URL: {e}"))
            })?;
        }
        if !(-23..=23).contains(&self.object_key.utc_offset_hours) {
            return Err(Error::Config(format!(
                "object_key.utc_offset_hours must be within -23..=23, got {}",
                self.object_key.utc_offset_hours
            )));
        }
        Ok(())
    }

    /// Copy of the configuration with credential values replaced, for display.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for value in [
            &mut copy.storage.access_key_id,
            &mut copy.storage.secret_access_key,
        ] {
            if !value.starts_with("env:") {
                *value = REDACTED.to_string();
            }
        }
        if let Some(token) = copy.storage.session_token.as_mut() {
            if !token.starts_with("env:") {
                *token = REDACTED.to_string();
            }
        }
        copy
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "1h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
