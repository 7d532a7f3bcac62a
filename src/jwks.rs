//! OIDC key set retrieval and caching.
//!
//! `KeySetRetriever` is a per-issuer state machine: unfetched until the
//! first `get`, then serving the cached key set until invalidated. A
//! verification failure due to an unresolvable `kid` triggers exactly one
//! forced refresh; concurrent callers share a single in-flight refresh, and
//! a key that is still absent afterwards fails that token without another
//! retry. Hit/miss counters only move on cache reuse and actual fetches.
//!
//! The HTTP source performs OIDC discovery (re-discovered per the response
//! `Cache-Control` max-age) and supports TLS client certificates and HTTP
//! proxying for its own outbound calls.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::ConfigError;

/// Default HTTP timeout for discovery and JWKS calls.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Discovery documents without cache directives are re-fetched after this.
const DEFAULT_DISCOVERY_TTL: Duration = Duration::from_secs(60);

/// A single JSON Web Key from a JWKS document.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type (e.g., "RSA", "oct")
    pub kty: String,
    /// Key ID, used to match the JWT header kid
    pub kid: Option<String>,
    /// Algorithm (e.g., "RS256")
    pub alg: Option<String>,
    /// Key use ("sig" or "enc")
    #[serde(rename = "use")]
    pub key_use: Option<String>,
    /// RSA modulus (base64url encoded)
    pub n: Option<String>,
    /// RSA exponent (base64url encoded)
    pub e: Option<String>,
    /// Symmetric key material (base64url encoded)
    pub k: Option<String>,
    /// X.509 certificate chain
    pub x5c: Option<Vec<String>>,
}

impl Jwk {
    /// Convert to a verification key, or fail with a parse error for key
    /// types this retriever does not handle.
    fn to_verification_key(&self) -> Result<VerificationKey, KeySetError> {
        let key = match self.kty.as_str() {
            "RSA" => self.rsa_decoding_key()?,
            "oct" => {
                let k = self
                    .k
                    .as_ref()
                    .ok_or_else(|| KeySetError::ParseError("Missing 'k' in oct key".to_string()))?;
                let secret = base64::engine::general_purpose::URL_SAFE_NO_PAD
                    .decode(k)
                    .map_err(|e| KeySetError::ParseError(format!("Invalid 'k': {}", e)))?;
                DecodingKey::from_secret(&secret)
            }
            other => {
                return Err(KeySetError::ParseError(format!("Unsupported key type: {}", other)));
            }
        };

        Ok(VerificationKey {
            key,
            algorithm: self.alg.as_deref().and_then(|a| a.parse().ok()),
        })
    }

    fn rsa_decoding_key(&self) -> Result<DecodingKey, KeySetError> {
        // x5c contains base64-encoded (not URL-safe) DER certificates.
        if let Some(x5c) = &self.x5c
            && let Some(cert) = x5c.first()
        {
            let cert_der = base64::engine::general_purpose::STANDARD
                .decode(cert)
                .map_err(|e| KeySetError::ParseError(format!("Invalid x5c: {}", e)))?;
            return Ok(DecodingKey::from_rsa_der(&cert_der));
        }

        let n = self
            .n
            .as_ref()
            .ok_or_else(|| KeySetError::ParseError("Missing 'n' in RSA key".to_string()))?;
        let e = self
            .e
            .as_ref()
            .ok_or_else(|| KeySetError::ParseError("Missing 'e' in RSA key".to_string()))?;

        DecodingKey::from_rsa_components(n, e)
            .map_err(|e| KeySetError::ParseError(format!("Invalid RSA components: {}", e)))
    }
}

/// A JWKS document containing multiple keys.
#[derive(Debug, Clone, Deserialize)]
pub struct JwksDocument {
    pub keys: Vec<Jwk>,
}

/// A cached, usable verification key.
#[derive(Clone)]
pub struct VerificationKey {
    pub key: DecodingKey,
    pub algorithm: Option<Algorithm>,
}

/// One processed key set; `generation` increments on every actual fetch and
/// is used to single-flight rotation refreshes.
#[derive(Clone)]
pub struct KeySet {
    keys: Arc<HashMap<String, VerificationKey>>,
    generation: u64,
}

impl KeySet {
    /// Key by id; with no `kid`, the first available key.
    pub fn get(&self, kid: Option<&str>) -> Option<VerificationKey> {
        match kid {
            Some(kid) => self.keys.get(kid).cloned(),
            None => self.keys.values().next().cloned(),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Where a retriever gets its raw JWKS documents from.
#[async_trait]
pub trait KeySetSource: Send + Sync {
    async fn fetch_key_set(&self) -> Result<JwksDocument, KeySetError>;
}

/// Fixed key set, for statically configured signing keys.
pub struct StaticKeySetSource {
    document: JwksDocument,
}

impl StaticKeySetSource {
    pub fn new(document: JwksDocument) -> Self {
        Self { document }
    }
}

#[async_trait]
impl KeySetSource for StaticKeySetSource {
    async fn fetch_key_set(&self) -> Result<JwksDocument, KeySetError> {
        Ok(self.document.clone())
    }
}

/// Rotation-aware key set cache for one issuer configuration.
pub struct KeySetRetriever {
    source: Arc<dyn KeySetSource>,
    state: RwLock<Option<KeySet>>,
    refresh: Mutex<()>,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
}

impl KeySetRetriever {
    pub fn new(source: Arc<dyn KeySetSource>) -> Self {
        Self {
            source,
            state: RwLock::new(None),
            refresh: Mutex::new(()),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
        }
    }

    /// Cached key set reuses since the last fetch.
    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    /// Actual network fetches performed.
    pub fn miss_count(&self) -> u64 {
        self.miss_count.load(Ordering::Relaxed)
    }

    /// The current key set, fetching it on first use.
    pub async fn get(&self) -> Result<KeySet, KeySetError> {
        if let Some(key_set) = self.state.read().await.as_ref() {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            return Ok(key_set.clone());
        }

        let _guard = self.refresh.lock().await;

        // Another caller may have completed the initial fetch meanwhile.
        if let Some(key_set) = self.state.read().await.as_ref() {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            return Ok(key_set.clone());
        }

        self.fetch_locked(1).await
    }

    /// Resolve a verification key by `kid`.
    ///
    /// An unresolvable `kid` triggers exactly one forced refresh (shared by
    /// concurrent callers); `Ok(None)` afterwards means the key does not
    /// exist and the token must be rejected without further retries.
    pub async fn get_key(&self, kid: Option<&str>) -> Result<Option<VerificationKey>, KeySetError> {
        let key_set = self.get().await?;

        if let Some(key) = key_set.get(kid) {
            return Ok(Some(key));
        }

        debug!("Key {:?} not in cached key set, forcing one refresh", kid);
        let stale_generation = key_set.generation;

        let _guard = self.refresh.lock().await;

        let current = self.state.read().await.clone();
        let refreshed = match current {
            // A concurrent caller already refreshed; reuse its result.
            Some(current) if current.generation != stale_generation => current,
            _ => self.fetch_locked(stale_generation + 1).await?,
        };

        Ok(refreshed.get(kid))
    }

    /// Fetch and install a new key set. Callers must hold `refresh`.
    async fn fetch_locked(&self, generation: u64) -> Result<KeySet, KeySetError> {
        let document = self.source.fetch_key_set().await?;
        self.miss_count.fetch_add(1, Ordering::Relaxed);

        let mut keys = HashMap::new();
        for jwk in &document.keys {
            if jwk.key_use.as_deref() == Some("enc") {
                debug!("Skipping encryption key");
                continue;
            }

            match jwk.to_verification_key() {
                Ok(key) => {
                    let kid = jwk.kid.clone().unwrap_or_else(|| "default".to_string());
                    debug!("Cached key with kid: {}", kid);
                    keys.insert(kid, key);
                }
                Err(e) => {
                    warn!("Failed to parse JWK: {}", e);
                }
            }
        }

        if keys.is_empty() {
            return Err(KeySetError::NoValidKeys);
        }

        let key_set = KeySet {
            keys: Arc::new(keys),
            generation,
        };

        *self.state.write().await = Some(key_set.clone());
        Ok(key_set)
    }
}

/// TLS settings for the retriever's own outbound calls.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// PEM-encoded client certificate plus private key.
    pub client_identity_pem: Option<Vec<u8>>,
    /// PEM-encoded additional trusted CA certificate.
    pub trusted_ca_pem: Option<Vec<u8>>,
}

/// HTTP proxy for the retriever's own outbound calls.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenIdProviderMetadata {
    jwks_uri: String,
}

#[derive(Clone)]
struct CachedDiscovery {
    jwks_uri: String,
    expires_at: Instant,
}

/// HTTP key set source: OIDC discovery document plus JWKS endpoint.
pub struct OpenIdProviderClient {
    openid_configuration_url: String,
    client: reqwest::Client,
    discovery: RwLock<Option<CachedDiscovery>>,
}

impl OpenIdProviderClient {
    pub fn new(
        openid_configuration_url: impl Into<String>,
        tls: Option<&TlsConfig>,
        proxy: Option<&ProxyConfig>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let mut builder = reqwest::Client::builder().timeout(timeout);

        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(&proxy.url)
                .map_err(|e| ConfigError::invalid_value("proxy", format!("'{}': {}", proxy.url, e)))?;
            builder = builder.proxy(proxy);
        }

        if let Some(tls) = tls {
            if let Some(pem) = &tls.trusted_ca_pem {
                let certificate = reqwest::Certificate::from_pem(pem)
                    .map_err(|e| ConfigError::invalid_value("tls.trusted_ca", e.to_string()))?;
                builder = builder.add_root_certificate(certificate);
            }

            if let Some(pem) = &tls.client_identity_pem {
                let identity = reqwest::Identity::from_pem(pem)
                    .map_err(|e| ConfigError::invalid_value("tls.client_identity", e.to_string()))?;
                builder = builder.identity(identity);
            }
        }

        let client = builder
            .build()
            .map_err(|e| ConfigError::new(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            openid_configuration_url: openid_configuration_url.into(),
            client,
            discovery: RwLock::new(None),
        })
    }

    /// The JWKS endpoint URL, re-discovered per the discovery response's
    /// cache directives.
    async fn jwks_uri(&self) -> Result<String, KeySetError> {
        let now = Instant::now();

        if let Some(discovery) = self.discovery.read().await.as_ref()
            && now < discovery.expires_at
        {
            return Ok(discovery.jwks_uri.clone());
        }

        debug!("Fetching OIDC discovery document from {}", self.openid_configuration_url);

        let response = self
            .client
            .get(&self.openid_configuration_url)
            .send()
            .await
            .map_err(|e| KeySetError::FetchError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(KeySetError::FetchError(format!(
                "HTTP {} from OIDC discovery endpoint",
                response.status()
            )));
        }

        let ttl = parse_max_age(response.headers()).unwrap_or(DEFAULT_DISCOVERY_TTL);

        let metadata: OpenIdProviderMetadata = response
            .json()
            .await
            .map_err(|e| KeySetError::ParseError(e.to_string()))?;

        let discovery = CachedDiscovery {
            jwks_uri: metadata.jwks_uri.clone(),
            expires_at: now + ttl,
        };
        *self.discovery.write().await = Some(discovery);

        Ok(metadata.jwks_uri)
    }
}

#[async_trait]
impl KeySetSource for OpenIdProviderClient {
    async fn fetch_key_set(&self) -> Result<JwksDocument, KeySetError> {
        let jwks_uri = self.jwks_uri().await?;

        debug!("Fetching JWKS from {}", jwks_uri);

        let response = self
            .client
            .get(&jwks_uri)
            .send()
            .await
            .map_err(|e| KeySetError::FetchError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(KeySetError::FetchError(format!(
                "HTTP {} from JWKS endpoint",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| KeySetError::ParseError(e.to_string()))
    }
}

/// Parse `max-age` out of a `Cache-Control` header, if present.
fn parse_max_age(headers: &http::HeaderMap) -> Option<Duration> {
    let cache_control = headers.get(http::header::CACHE_CONTROL)?.to_str().ok()?;

    for directive in cache_control.split(',') {
        if let Some(seconds) = directive.trim().strip_prefix("max-age=")
            && let Ok(seconds) = seconds.parse::<u64>()
        {
            return Some(Duration::from_secs(seconds));
        }
    }

    None
}

/// Errors that can occur when retrieving or processing key sets.
#[derive(Debug, Clone)]
pub enum KeySetError {
    /// Failed to fetch the discovery document or JWKS from the endpoint.
    FetchError(String),
    /// Failed to parse a response or key.
    ParseError(String),
    /// The JWKS contained no usable signature keys.
    NoValidKeys,
}

impl KeySetError {
    /// Whether this failure means the issuer infrastructure is unavailable
    /// (as opposed to the presented token simply not matching any key).
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::FetchError(_) | Self::NoValidKeys)
    }
}

impl fmt::Display for KeySetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FetchError(msg) => write!(f, "Failed to fetch key set: {}", msg),
            Self::ParseError(msg) => write!(f, "Failed to parse key set: {}", msg),
            Self::NoValidKeys => write!(f, "No valid keys found in key set"),
        }
    }
}

impl std::error::Error for KeySetError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSource {
        fetches: AtomicUsize,
        delay: Duration,
        document: std::sync::Mutex<JwksDocument>,
    }

    impl CountingSource {
        fn new(document: JwksDocument) -> Arc<Self> {
            Self::with_delay(document, Duration::ZERO)
        }

        fn with_delay(document: JwksDocument, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                fetches: AtomicUsize::new(0),
                delay,
                document: std::sync::Mutex::new(document),
            })
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }

        fn set_document(&self, document: JwksDocument) {
            *self.document.lock().unwrap() = document;
        }
    }

    #[async_trait]
    impl KeySetSource for CountingSource {
        async fn fetch_key_set(&self) -> Result<JwksDocument, KeySetError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.document.lock().unwrap().clone())
        }
    }

    fn oct_jwk(kid: &str) -> Jwk {
        serde_json::from_value(serde_json::json!({
            "kty": "oct",
            "kid": kid,
            "alg": "HS256",
            "k": base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(b"test-secret")
        }))
        .unwrap()
    }

    fn document(kids: &[&str]) -> JwksDocument {
        JwksDocument {
            keys: kids.iter().map(|kid| oct_jwk(kid)).collect(),
        }
    }

    #[tokio::test]
    async fn test_first_get_fetches_second_get_hits_cache() {
        let source = CountingSource::new(document(&["key1"]));
        let retriever = KeySetRetriever::new(source.clone());

        retriever.get().await.unwrap();
        assert_eq!(retriever.miss_count(), 1);
        assert_eq!(retriever.hit_count(), 0);

        retriever.get().await.unwrap();
        assert_eq!(retriever.miss_count(), 1);
        assert_eq!(retriever.hit_count(), 1);
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test]
    async fn test_unknown_kid_triggers_exactly_one_refresh() {
        let source = CountingSource::new(document(&["key1"]));
        let retriever = KeySetRetriever::new(source.clone());

        let resolved = retriever.get_key(Some("rotated")).await.unwrap();
        assert!(resolved.is_none());
        // Initial fetch plus exactly one forced refresh.
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_unknown_kid_callers_share_one_refresh() {
        let source = CountingSource::with_delay(document(&["key1"]), Duration::from_millis(50));
        let retriever = Arc::new(KeySetRetriever::new(source.clone()));

        retriever.get().await.unwrap();
        assert_eq!(source.fetches(), 1);
        source.set_document(document(&["key1", "key2"]));

        let callers: Vec<_> = (0..4)
            .map(|_| {
                let retriever = retriever.clone();
                tokio::spawn(async move { retriever.get_key(Some("key2")).await })
            })
            .collect();

        for caller in callers {
            assert!(caller.await.unwrap().unwrap().is_some());
        }

        // One initial fetch plus a single refresh shared by every caller.
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_rotated_key_is_found_after_refresh() {
        let source = CountingSource::new(document(&["key1"]));
        let retriever = KeySetRetriever::new(source.clone());

        retriever.get().await.unwrap();
        source.set_document(document(&["key1", "key2"]));

        let resolved = retriever.get_key(Some("key2")).await.unwrap();
        assert!(resolved.is_some());
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_known_kid_does_not_refresh() {
        let source = CountingSource::new(document(&["key1"]));
        let retriever = KeySetRetriever::new(source.clone());

        let resolved = retriever.get_key(Some("key1")).await.unwrap();
        assert!(resolved.is_some());
        assert_eq!(source.fetches(), 1);
    }

    #[tokio::test]
    async fn test_missing_kid_selects_first_key() {
        let source = CountingSource::new(document(&["only"]));
        let retriever = KeySetRetriever::new(source);

        assert!(retriever.get_key(None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_empty_key_set_is_an_error() {
        let source = CountingSource::new(JwksDocument { keys: vec![] });
        let retriever = KeySetRetriever::new(source);

        let result = retriever.get().await;
        assert!(matches!(result, Err(KeySetError::NoValidKeys)));
    }

    #[tokio::test]
    async fn test_encryption_keys_are_skipped() {
        let mut enc = oct_jwk("enc-key");
        enc.key_use = Some("enc".to_string());
        let source = CountingSource::new(JwksDocument {
            keys: vec![enc, oct_jwk("sig-key")],
        });
        let retriever = KeySetRetriever::new(source);

        let key_set = retriever.get().await.unwrap();
        assert_eq!(key_set.len(), 1);
        assert!(key_set.get(Some("sig-key")).is_some());
        assert!(key_set.get(Some("enc-key")).is_none());
    }

    #[test]
    fn test_parse_max_age() {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::CACHE_CONTROL,
            "public, max-age=3600, must-revalidate".parse().unwrap(),
        );
        assert_eq!(parse_max_age(&headers), Some(Duration::from_secs(3600)));

        headers.insert(http::header::CACHE_CONTROL, "no-store".parse().unwrap());
        assert_eq!(parse_max_age(&headers), None);
    }

    #[test]
    fn test_jwk_rsa_deserialization() {
        let jwk: Jwk = serde_json::from_str(
            r#"{"kty": "RSA", "kid": "k1", "alg": "RS256", "use": "sig", "n": "abc", "e": "AQAB"}"#,
        )
        .unwrap();
        assert_eq!(jwk.kty, "RSA");
        assert_eq!(jwk.kid.as_deref(), Some("k1"));
        assert_eq!(jwk.key_use.as_deref(), Some("sig"));
    }

    #[test]
    fn test_unsupported_key_type_is_a_parse_error() {
        let jwk: Jwk = serde_json::from_str(r#"{"kty": "EC", "kid": "k1"}"#).unwrap();
        assert!(matches!(
            jwk.to_verification_key(),
            Err(KeySetError::ParseError(_))
        ));
    }
}
