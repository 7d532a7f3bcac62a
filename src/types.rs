//! Core identity types shared across the authentication pipeline.
//!
//! `RequestMetaData` is the immutable per-request view the pipeline works
//! on, `AuthCredentials` is what frontends extract and backends validate,
//! and `User` is the terminal authenticated identity. Passwords are held in
//! zeroizing buffers, masked in `Debug` output and cleared after use.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::IpAddr;

use http::HeaderMap;
use ipnet::IpNet;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::Zeroizing;

/// Immutable request metadata handed to the pipeline by the host engine.
///
/// The TLS layer is an external collaborator: `client_cert_subject` is the
/// subject DN of an already-verified peer certificate, never a certificate
/// to be validated here.
#[derive(Debug, Clone)]
pub struct RequestMetaData {
    headers: HeaderMap,
    url_params: HashMap<String, String>,
    direct_ip_address: IpAddr,
    originating_ip_address: IpAddr,
    trusted_proxy: bool,
    client_cert_subject: Option<String>,
}

impl RequestMetaData {
    /// Start building request metadata for a connection from `direct_ip`.
    pub fn builder(direct_ip: IpAddr) -> RequestMetaDataBuilder {
        RequestMetaDataBuilder {
            headers: HeaderMap::new(),
            url_params: HashMap::new(),
            direct_ip_address: direct_ip,
            client_cert_subject: None,
        }
    }

    /// HTTP headers of the request.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A single header value, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Query/URL parameters of the request.
    pub fn url_param(&self, name: &str) -> Option<&str> {
        self.url_params.get(name).map(|s| s.as_str())
    }

    /// IP address of the direct peer of the connection.
    pub fn direct_ip_address(&self) -> IpAddr {
        self.direct_ip_address
    }

    /// Client IP address after trusted-proxy resolution.
    ///
    /// Equal to `direct_ip_address` unless the direct peer is a configured
    /// trusted proxy and a forwarded-header chain named an upstream client.
    pub fn originating_ip_address(&self) -> IpAddr {
        self.originating_ip_address
    }

    /// Whether the direct peer is a configured trusted proxy.
    pub fn trusted_proxy(&self) -> bool {
        self.trusted_proxy
    }

    /// Subject DN of the verified TLS peer certificate, if any.
    pub fn client_cert_subject(&self) -> Option<&str> {
        self.client_cert_subject.as_deref()
    }
}

/// Builder for `RequestMetaData`; `build` performs trusted-proxy resolution.
pub struct RequestMetaDataBuilder {
    headers: HeaderMap,
    url_params: HashMap<String, String>,
    direct_ip_address: IpAddr,
    client_cert_subject: Option<String>,
}

impl RequestMetaDataBuilder {
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn url_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.url_params.insert(name.into(), value.into());
        self
    }

    pub fn client_cert_subject(mut self, subject: impl Into<String>) -> Self {
        self.client_cert_subject = Some(subject.into());
        self
    }

    /// Finish the build, deriving `originating_ip_address` and
    /// `trusted_proxy` from the direct peer and the `X-Forwarded-For` chain.
    pub fn build(self, trusted_proxies: &[IpNet]) -> RequestMetaData {
        let trusted_proxy = trusted_proxies.iter().any(|net| net.contains(&self.direct_ip_address));

        let originating_ip_address = if trusted_proxy {
            ascertain_originating_ip(&self.headers, self.direct_ip_address, trusted_proxies)
        } else {
            self.direct_ip_address
        };

        RequestMetaData {
            headers: self.headers,
            url_params: self.url_params,
            direct_ip_address: self.direct_ip_address,
            originating_ip_address,
            trusted_proxy,
            client_cert_subject: self.client_cert_subject,
        }
    }
}

/// Resolve the originating client IP from the `X-Forwarded-For` chain.
///
/// Walks the chain from the rightmost entry, skipping addresses that belong
/// to trusted proxies; the first address that is not a trusted proxy is the
/// client. Falls back to the direct address when the chain is missing or
/// unparsable.
fn ascertain_originating_ip(headers: &HeaderMap, direct_ip: IpAddr, trusted_proxies: &[IpNet]) -> IpAddr {
    let Some(chain) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) else {
        return direct_ip;
    };

    for entry in chain.rsplit(',') {
        match entry.trim().parse::<IpAddr>() {
            Ok(addr) => {
                if !trusted_proxies.iter().any(|net| net.contains(&addr)) {
                    return addr;
                }
            }
            Err(_) => {
                debug!("Unparsable X-Forwarded-For entry: {:?}", entry.trim());
                return direct_ip;
            }
        }
    }

    direct_ip
}

/// Raw credentials extracted by an authentication frontend.
///
/// Credentials are *unvalidated* until a backend accepts them. The password
/// buffer is zeroed on drop and by `clear_secrets`, and never appears in
/// `Debug` output.
#[derive(Clone)]
pub struct AuthCredentials {
    name: String,
    password: Option<Zeroizing<Vec<u8>>>,
    backend_roles: BTreeSet<String>,
    attributes: serde_json::Map<String, serde_json::Value>,
    authenticator_type: String,
    complete: bool,
}

impl AuthCredentials {
    pub fn new(name: impl Into<String>, authenticator_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: None,
            backend_roles: BTreeSet::new(),
            attributes: serde_json::Map::new(),
            authenticator_type: authenticator_type.into(),
            complete: false,
        }
    }

    pub fn with_password(mut self, password: Vec<u8>) -> Self {
        self.password = Some(Zeroizing::new(password));
        self
    }

    pub fn with_backend_role(mut self, role: impl Into<String>) -> Self {
        self.backend_roles.insert(role.into());
        self
    }

    pub fn with_backend_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backend_roles.extend(roles.into_iter().map(Into::into));
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn with_attributes(mut self, attributes: serde_json::Map<String, serde_json::Value>) -> Self {
        self.attributes.extend(attributes);
        self
    }

    /// Mark the credentials as complete: nothing further is needed from the
    /// caller before a backend can validate them.
    pub fn mark_complete(mut self) -> Self {
        self.complete = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the user name, e.g. after user-name mapping or when the
    /// backend resolved a canonical name.
    pub fn rename(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn password(&self) -> Option<&[u8]> {
        self.password.as_deref().map(|p| p.as_slice())
    }

    pub fn backend_roles(&self) -> &BTreeSet<String> {
        &self.backend_roles
    }

    /// Structured attribute tree used for user mapping (claims for JWT,
    /// directory attributes for LDAP, the parsed DN for client certs).
    pub fn attributes(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.attributes
    }

    pub fn authenticator_type(&self) -> &str {
        &self.authenticator_type
    }

    pub fn complete(&self) -> bool {
        self.complete
    }

    /// Zero and drop the password buffer. Called on every exit path of a
    /// domain attempt, success included.
    pub fn clear_secrets(&mut self) {
        self.password = None;
    }

    /// Stable hash of the credentials, used as part of the user cache key.
    ///
    /// Covers the authenticator type, the user name and the password, so a
    /// changed password never produces a cache hit.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.authenticator_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.name.as_bytes());
        hasher.update([0u8]);
        if let Some(password) = &self.password {
            hasher.update(password.as_slice());
        }
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Debug for AuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCredentials")
            .field("name", &self.name)
            .field("password", &self.password.as_ref().map(|_| "<masked>"))
            .field("backend_roles", &self.backend_roles)
            .field("attributes", &self.attributes)
            .field("authenticator_type", &self.authenticator_type)
            .field("complete", &self.complete)
            .finish()
    }
}

/// Terminal authenticated identity; created only by successful pipeline
/// completion from credentials marked complete.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    name: String,
    roles: BTreeSet<String>,
    attributes: serde_json::Map<String, serde_json::Value>,
    auth_domain_id: String,
}

impl User {
    pub(crate) fn new(
        name: impl Into<String>,
        roles: BTreeSet<String>,
        attributes: serde_json::Map<String, serde_json::Value>,
        auth_domain_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            roles,
            attributes,
            auth_domain_id: auth_domain_id.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }

    pub fn attributes(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.attributes
    }

    /// Id of the authentication domain that produced this identity.
    pub fn auth_domain_id(&self) -> &str {
        &self.auth_domain_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nets(specs: &[&str]) -> Vec<IpNet> {
        specs.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                http::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_untrusted_direct_ip_leaves_originating_equal_to_direct() {
        let request = RequestMetaData::builder("203.0.113.5".parse().unwrap())
            .headers(headers(&[("x-forwarded-for", "10.0.0.7")]))
            .build(&nets(&["192.0.2.0/24"]));

        assert!(!request.trusted_proxy());
        assert_eq!(
            request.originating_ip_address(),
            "203.0.113.5".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_trusted_proxy_derives_originating_from_forwarded_chain() {
        let request = RequestMetaData::builder("192.0.2.10".parse().unwrap())
            .headers(headers(&[("x-forwarded-for", "10.0.0.7, 192.0.2.20")]))
            .build(&nets(&["192.0.2.0/24"]));

        assert!(request.trusted_proxy());
        assert_eq!(
            request.originating_ip_address(),
            "10.0.0.7".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_trusted_proxy_without_forwarded_header_keeps_direct() {
        let request = RequestMetaData::builder("192.0.2.10".parse().unwrap())
            .build(&nets(&["192.0.2.0/24"]));

        assert!(request.trusted_proxy());
        assert_eq!(
            request.originating_ip_address(),
            "192.0.2.10".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_unparsable_forwarded_chain_falls_back_to_direct() {
        let request = RequestMetaData::builder("192.0.2.10".parse().unwrap())
            .headers(headers(&[("x-forwarded-for", "not-an-ip")]))
            .build(&nets(&["192.0.2.0/24"]));

        assert_eq!(
            request.originating_ip_address(),
            "192.0.2.10".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_credentials_debug_masks_password() {
        let credentials = AuthCredentials::new("alice", "basic").with_password(b"secret".to_vec());
        let rendered = format!("{:?}", credentials);

        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<masked>"));
    }

    #[test]
    fn test_clear_secrets_drops_password() {
        let mut credentials =
            AuthCredentials::new("alice", "basic").with_password(b"secret".to_vec());
        assert!(credentials.password().is_some());

        credentials.clear_secrets();
        assert!(credentials.password().is_none());
    }

    #[test]
    fn test_fingerprint_is_stable_and_password_sensitive() {
        let a = AuthCredentials::new("alice", "basic").with_password(b"secret".to_vec());
        let b = AuthCredentials::new("alice", "basic").with_password(b"secret".to_vec());
        let c = AuthCredentials::new("alice", "basic").with_password(b"other".to_vec());
        let d = AuthCredentials::new("alice", "jwt").with_password(b"secret".to_vec());

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_ne!(a.fingerprint(), d.fingerprint());
    }

    #[test]
    fn test_fingerprint_separator_prevents_field_bleed() {
        let a = AuthCredentials::new("ab", "c");
        let b = AuthCredentials::new("a", "bc");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
