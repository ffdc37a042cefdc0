//! Issuer key set fetching and caching.
//!
//! # Refresh policy
//!
//! - No cached set, or the cached set is older than the freshness window
//!   (default 1 hour): fetch and replace the whole set.
//! - Otherwise return the cached set without touching the network.
//! - A failed fetch leaves whatever was cached before in place; nothing about
//!   the failure is remembered, so the next request simply tries again.
//!
//! Concurrent requests on a cold cache may each fetch. Every writer stores a
//! complete [`KeySet`] behind an `Arc`, so readers observe either the old set
//! or a new one, never a mix. The lock is never held across an `.await`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{
    DecodingKey,
    jwk::{AlgorithmParameters, JwkSet, KeyAlgorithm, PublicKeyUse},
};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::clock::Clock;

/// Failure to obtain a usable key set from the issuer.
#[derive(Debug, thiserror::Error)]
pub enum KeyFetchError {
    /// Network, timeout or TLS error while fetching.
    #[error("JWKS request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The issuer answered with a non-success status.
    #[error("JWKS endpoint returned HTTP {0}")]
    Status(u16),

    /// The body was not a JWKS document.
    #[error("JWKS body is malformed: {0}")]
    Malformed(String),

    /// The document parsed but contained no key this service can verify with.
    #[error("JWKS contains no usable RS256 keys")]
    NoUsableKeys,
}

/// Source of the issuer's current JWKS document.
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    /// Fetch the current key set.
    async fn fetch(&self) -> Result<JwkSet, KeyFetchError>;
}

/// Fetches the JWKS document over HTTP(S).
pub struct HttpKeyFetcher {
    http: reqwest::Client,
    jwks_uri: String,
}

impl HttpKeyFetcher {
    /// Create a fetcher for `jwks_uri` with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyFetchError::Request`] if the HTTP client cannot be built.
    pub fn new(jwks_uri: impl Into<String>, timeout: Duration) -> Result<Self, KeyFetchError> {
        let jwks_uri = jwks_uri.into();
        if !jwks_uri.starts_with("https://") {
            warn!(jwks_uri = %jwks_uri, "JWKS URI is not HTTPS");
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, jwks_uri })
    }
}

#[async_trait]
impl KeyFetcher for HttpKeyFetcher {
    async fn fetch(&self) -> Result<JwkSet, KeyFetchError> {
        debug!(jwks_uri = %self.jwks_uri, "Fetching JWKS");
        let response = self.http.get(&self.jwks_uri).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(KeyFetchError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| KeyFetchError::Malformed(e.to_string()))
    }
}

/// Immutable snapshot of the issuer's verification keys.
pub struct KeySet {
    keys: HashMap<String, DecodingKey>,
    fetched_at: DateTime<Utc>,
}

impl KeySet {
    /// Build a key set from a JWKS document.
    ///
    /// Keys without a `kid`, keys that are not RSA, keys marked for
    /// encryption (`"use": "enc"`) and keys pinned to an algorithm other than
    /// RS256 are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`KeyFetchError::NoUsableKeys`] if nothing survives filtering.
    pub fn from_jwks(jwks: &JwkSet, fetched_at: DateTime<Utc>) -> Result<Self, KeyFetchError> {
        let mut keys = HashMap::new();
        for jwk in &jwks.keys {
            let Some(kid) = jwk.common.key_id.as_deref() else {
                debug!("Skipping JWK without kid");
                continue;
            };
            if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
                debug!(kid = %kid, "Skipping encryption JWK");
                continue;
            }
            if let Some(alg) = &jwk.common.key_algorithm {
                if *alg != KeyAlgorithm::RS256 {
                    debug!(kid = %kid, alg = ?alg, "Skipping JWK pinned to another algorithm");
                    continue;
                }
            }
            let AlgorithmParameters::RSA(rsa) = &jwk.algorithm else {
                debug!(kid = %kid, "Skipping non-RSA JWK");
                continue;
            };
            match DecodingKey::from_rsa_components(&rsa.n, &rsa.e) {
                Ok(key) => {
                    keys.insert(kid.to_string(), key);
                }
                Err(e) => debug!(kid = %kid, error = %e, "Skipping JWK with invalid RSA components"),
            }
        }

        if keys.is_empty() {
            return Err(KeyFetchError::NoUsableKeys);
        }
        Ok(Self { keys, fetched_at })
    }

    /// Look up a verification key by `kid`.
    #[must_use]
    pub fn get(&self, kid: &str) -> Option<&DecodingKey> {
        self.keys.get(kid)
    }

    /// Whether `kid` is present.
    #[must_use]
    pub fn contains(&self, kid: &str) -> bool {
        self.keys.contains_key(kid)
    }

    /// Number of usable keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set holds no keys. Never true for a set built by [`KeySet::from_jwks`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// When this snapshot was fetched.
    #[must_use]
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Age of the snapshot at `now`. A clock that moved backwards reads as zero.
    fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
    }
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kids: Vec<&String> = self.keys.keys().collect();
        kids.sort();
        f.debug_struct("KeySet")
            .field("kids", &kids)
            .field("fetched_at", &self.fetched_at)
            .finish()
    }
}

/// Process-wide cache of the issuer's [`KeySet`].
pub struct KeyCache {
    fetcher: Arc<dyn KeyFetcher>,
    clock: Arc<dyn Clock>,
    freshness: Duration,
    current: RwLock<Option<Arc<KeySet>>>,
}

impl KeyCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(fetcher: Arc<dyn KeyFetcher>, clock: Arc<dyn Clock>, freshness: Duration) -> Self {
        Self {
            fetcher,
            clock,
            freshness,
            current: RwLock::new(None),
        }
    }

    /// Return the cached key set, fetching first if it is missing or stale.
    pub async fn get_key_set(&self) -> Result<Arc<KeySet>, KeyFetchError> {
        if let Some(set) = self.cached_younger_than(self.freshness) {
            return Ok(set);
        }
        self.fetch_and_store().await
    }

    /// Force a refetch unless the cached set is at most `min_age` old.
    ///
    /// Used when a token names a `kid` the cached set does not know: the
    /// issuer may have rotated keys within our freshness window.
    pub async fn refresh_if_older_than(&self, min_age: Duration) -> Result<Arc<KeySet>, KeyFetchError> {
        if let Some(set) = self.cached_younger_than(min_age) {
            debug!(age_limit_secs = min_age.as_secs(), "Key set refreshed recently, not refetching");
            return Ok(set);
        }
        self.fetch_and_store().await
    }

    /// The cached set, if any, without fetching.
    #[must_use]
    pub fn cached(&self) -> Option<Arc<KeySet>> {
        self.current.read().clone()
    }

    fn cached_younger_than(&self, limit: Duration) -> Option<Arc<KeySet>> {
        let now = self.clock.now();
        self.current
            .read()
            .as_ref()
            .filter(|set| set.age(now) <= limit)
            .map(Arc::clone)
    }

    async fn fetch_and_store(&self) -> Result<Arc<KeySet>, KeyFetchError> {
        let jwks = self.fetcher.fetch().await.inspect_err(|e| {
            warn!(error = %e, "JWKS fetch failed, keeping previous key set");
        })?;
        let set = Arc::new(KeySet::from_jwks(&jwks, self.clock.now())?);
        info!(keys = set.len(), "Key set refreshed");
        *self.current.write() = Some(Arc::clone(&set));
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Modulus/exponent of a throwaway 2048-bit RSA key.
    const TEST_N: &str = "vWzXtSXgXzJ2skcmErmky7dAFpEjz4cb4OdOgxm0dq1prGw-t0YQzdltyzZVEwhxr989vkg6u0RkzMZAHtIHh6ZteD66SsiWWjI78Hlvl9_rVMvd10mq8DvKKbl-okRvPCUdKzj4TLtBucpXOIuO6ptJet6G3IyVpuEGo0Hgiz8j_QzZ0IVkgWlm3vjCR3Wx4QNhXqoR-oXI3PsoJaCQ2Lk6Plgdi4FZ0CWW9eYpgw3GbQX8wHakcBEeheR9YkLp3OcF4ul-1r6hzkSUjT1gLF_ACnDEkFkR4G9TbjfKlvXBiTGVPoraUHYXzn4B6qkuJPMF6yxfl65dtHV3eCXKow";
    const TEST_E: &str = "AQAB";

    fn jwks(kids: &[&str]) -> JwkSet {
        let keys: Vec<serde_json::Value> = kids
            .iter()
            .map(|kid| {
                serde_json::json!({
                    "kty": "RSA", "kid": kid, "alg": "RS256", "use": "sig",
                    "n": TEST_N, "e": TEST_E
                })
            })
            .collect();
        serde_json::from_value(serde_json::json!({ "keys": keys })).unwrap()
    }

    /// Serves a scripted sequence of results and counts calls.
    struct ScriptedFetcher {
        calls: AtomicUsize,
        responses: parking_lot::Mutex<Vec<Result<JwkSet, KeyFetchError>>>,
    }

    impl ScriptedFetcher {
        fn new(mut responses: Vec<Result<JwkSet, KeyFetchError>>) -> Self {
            responses.reverse();
            Self {
                calls: AtomicUsize::new(0),
                responses: parking_lot::Mutex::new(responses),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KeyFetcher for ScriptedFetcher {
        async fn fetch(&self) -> Result<JwkSet, KeyFetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .pop()
                .unwrap_or_else(|| Err(KeyFetchError::Status(503)))
        }
    }

    fn setup(
        responses: Vec<Result<JwkSet, KeyFetchError>>,
    ) -> (KeyCache, Arc<ScriptedFetcher>, Arc<ManualClock>) {
        let fetcher = Arc::new(ScriptedFetcher::new(responses));
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ));
        let cache = KeyCache::new(
            Arc::clone(&fetcher) as Arc<dyn KeyFetcher>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            Duration::from_secs(3600),
        );
        (cache, fetcher, clock)
    }

    #[tokio::test]
    async fn sequential_calls_within_window_fetch_once() {
        // GIVEN: an empty cache
        let (cache, fetcher, clock) = setup(vec![Ok(jwks(&["k1"]))]);

        // WHEN: called repeatedly inside the freshness window
        cache.get_key_set().await.unwrap();
        clock.advance(Duration::from_secs(1800));
        cache.get_key_set().await.unwrap();
        cache.get_key_set().await.unwrap();

        // THEN: one fetch
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn one_millisecond_before_expiry_uses_cache() {
        let (cache, fetcher, clock) = setup(vec![Ok(jwks(&["k1"])), Ok(jwks(&["k2"]))]);
        cache.get_key_set().await.unwrap();

        clock.advance(Duration::from_secs(3600) - Duration::from_millis(1));
        let set = cache.get_key_set().await.unwrap();

        assert_eq!(fetcher.calls(), 1);
        assert!(set.contains("k1"));
    }

    #[tokio::test]
    async fn one_millisecond_after_expiry_refetches() {
        let (cache, fetcher, clock) = setup(vec![Ok(jwks(&["k1"])), Ok(jwks(&["k2"]))]);
        cache.get_key_set().await.unwrap();

        clock.advance(Duration::from_secs(3600) + Duration::from_millis(1));
        let set = cache.get_key_set().await.unwrap();

        // THEN: refetched and replaced wholesale
        assert_eq!(fetcher.calls(), 2);
        assert!(set.contains("k2"));
        assert!(!set.contains("k1"));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_set() {
        let (cache, fetcher, clock) =
            setup(vec![Ok(jwks(&["k1"])), Err(KeyFetchError::Status(500))]);
        cache.get_key_set().await.unwrap();

        clock.advance(Duration::from_secs(7200));
        let err = cache.get_key_set().await.unwrap_err();

        assert!(matches!(err, KeyFetchError::Status(500)));
        assert_eq!(fetcher.calls(), 2);
        let kept = cache.cached().expect("previous set retained");
        assert!(kept.contains("k1"));
    }

    #[tokio::test]
    async fn failure_is_not_cached() {
        // GIVEN: first fetch fails, second succeeds
        let (cache, fetcher, _clock) =
            setup(vec![Err(KeyFetchError::Status(502)), Ok(jwks(&["k1"]))]);

        assert!(cache.get_key_set().await.is_err());
        assert!(cache.cached().is_none());

        // WHEN: the next request comes in
        let set = cache.get_key_set().await.unwrap();

        // THEN: it retries immediately
        assert_eq!(fetcher.calls(), 2);
        assert!(set.contains("k1"));
    }

    #[tokio::test]
    async fn refresh_if_older_than_respects_cooldown() {
        let (cache, fetcher, clock) = setup(vec![Ok(jwks(&["k1"])), Ok(jwks(&["k1", "k2"]))]);
        cache.get_key_set().await.unwrap();

        // Within cooldown: no refetch
        clock.advance(Duration::from_secs(30));
        let set = cache.refresh_if_older_than(Duration::from_secs(60)).await.unwrap();
        assert_eq!(fetcher.calls(), 1);
        assert!(!set.contains("k2"));

        // Past cooldown: refetch picks up the rotated key
        clock.advance(Duration::from_secs(31));
        let set = cache.refresh_if_older_than(Duration::from_secs(60)).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
        assert!(set.contains("k2"));
    }

    #[test]
    fn from_jwks_skips_unusable_keys() {
        let doc: JwkSet = serde_json::from_value(serde_json::json!({
            "keys": [
                { "kty": "RSA", "alg": "RS256", "n": TEST_N, "e": TEST_E },
                { "kty": "RSA", "kid": "rs512", "alg": "RS512", "n": TEST_N, "e": TEST_E },
                { "kty": "oct", "kid": "hmac", "k": "c2VjcmV0" },
                { "kty": "RSA", "kid": "enc", "use": "enc", "n": TEST_N, "e": TEST_E },
                { "kty": "RSA", "kid": "signing", "use": "sig", "n": TEST_N, "e": TEST_E },
                { "kty": "RSA", "kid": "good", "n": TEST_N, "e": TEST_E }
            ]
        }))
        .unwrap();

        let set = KeySet::from_jwks(&doc, Utc::now()).unwrap();

        assert_eq!(set.len(), 2);
        assert!(set.contains("good"));
        assert!(set.contains("signing"));
        assert!(set.get("hmac").is_none());
        assert!(!set.contains("enc"));
    }

    #[test]
    fn from_jwks_rejects_document_without_usable_keys() {
        let doc: JwkSet = serde_json::from_value(serde_json::json!({ "keys": [] })).unwrap();
        assert!(matches!(
            KeySet::from_jwks(&doc, Utc::now()),
            Err(KeyFetchError::NoUsableKeys)
        ));
    }

    #[test]
    fn debug_lists_kids_without_key_material() {
        let set = KeySet::from_jwks(&jwks(&["b", "a"]), Utc::now()).unwrap();
        let shown = format!("{set:?}");
        assert!(shown.contains("[\"a\", \"b\"]"));
        assert!(!shown.contains(TEST_N));
    }
}
