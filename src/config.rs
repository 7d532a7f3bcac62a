//! Pipeline configuration documents.
//!
//! Everything here is validated when a pipeline is built: unknown type
//! tags, bad CIDRs, bad globs, bad JSON paths and bad patterns are
//! configuration errors, never request-time failures.

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::backend::LdapBackendConfig;
use crate::cache::UserCacheConfig;
use crate::error::ConfigError;
use crate::frontend::{
    AnonymousFrontendConfig, BasicFrontendConfig, ClientCertFrontendConfig, JwtFrontendConfig,
    TrustedOriginFrontendConfig,
};
use crate::jwks::JwksDocument;
use crate::mapping::{AttributeMapping, MappingSource, UserMapping};

/// Frontend type tags known to the pipeline, in the order they are
/// reported when an unknown tag is rejected.
pub const AVAILABLE_FRONTENDS: &[&str] = &["basic", "jwt", "clientcert", "trusted_origin", "anonymous"];

/// Backend type tags known to the pipeline.
pub const AVAILABLE_BACKENDS: &[&str] = &["noop", "ldap"];

/// Top-level authentication configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthcConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub auth_domains: Vec<AuthDomainConfig>,
    #[serde(default)]
    pub user_cache: UserCacheConfig,
    /// Enables the per-request debug trail.
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkConfig {
    /// CIDRs of proxies whose forwarded headers are trusted.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
}

/// Configuration of one authentication domain.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthDomainConfig {
    /// Stable domain id; derived from the type tag and position when unset.
    #[serde(default)]
    pub id: Option<String>,
    /// Type tag, either a frontend (`"jwt"`) or a frontend/backend pair
    /// (`"basic/ldap"`).
    #[serde(rename = "type")]
    pub domain_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub accept_ips: Vec<String>,
    #[serde(default)]
    pub skip_ips: Vec<String>,
    #[serde(default)]
    pub accept_users: Vec<String>,
    #[serde(default)]
    pub skip_users: Vec<String>,
    #[serde(default)]
    pub user_mapping: Option<UserMappingConfig>,
    #[serde(default = "default_true")]
    pub cache_user: bool,
    /// Declares that role/attribute resolution is decoupled from the
    /// authentication check, unlocking caching for backends with the
    /// only-if-authz-separate policy. Never inferred.
    #[serde(default)]
    pub authz_separate: bool,
    #[serde(default)]
    pub basic: Option<BasicFrontendConfig>,
    #[serde(default)]
    pub jwt: Option<JwtDomainConfig>,
    #[serde(default)]
    pub clientcert: Option<ClientCertFrontendConfig>,
    #[serde(default)]
    pub trusted_origin: Option<TrustedOriginFrontendConfig>,
    #[serde(default)]
    pub anonymous: Option<AnonymousFrontendConfig>,
    #[serde(default)]
    pub ldap: Option<LdapBackendConfig>,
}

fn default_true() -> bool {
    true
}

impl AuthDomainConfig {
    /// The configured id, or a stable hash-derived default.
    pub fn effective_id(&self, position: usize) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => {
                let mut hasher = Sha256::new();
                hasher.update(self.domain_type.as_bytes());
                hasher.update([0u8]);
                hasher.update(position.to_string().as_bytes());
                let digest = format!("{:x}", hasher.finalize());
                digest[..8].to_string()
            }
        }
    }

    /// Split the type tag into validated frontend and backend tags. A tag
    /// without a `/` pairs the frontend with the noop backend.
    pub fn type_tags(&self) -> Result<(&str, &str), ConfigError> {
        let (frontend, backend) = match self.domain_type.split_once('/') {
            Some((frontend, backend)) => (frontend, backend),
            None => (self.domain_type.as_str(), "noop"),
        };

        if !AVAILABLE_FRONTENDS.contains(&frontend) {
            return Err(ConfigError::invalid_value(
                "type",
                format!(
                    "Unknown authentication frontend '{}'; available: {}",
                    frontend,
                    AVAILABLE_FRONTENDS.join(", ")
                ),
            ));
        }

        if !AVAILABLE_BACKENDS.contains(&backend) {
            return Err(ConfigError::invalid_value(
                "type",
                format!(
                    "Unknown authentication backend '{}'; available: {}",
                    backend,
                    AVAILABLE_BACKENDS.join(", ")
                ),
            ));
        }

        Ok((frontend, backend))
    }
}

/// Key material and HTTP settings of a JWT domain, beyond the extraction
/// rules themselves.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtDomainConfig {
    #[serde(flatten)]
    pub frontend: JwtFrontendConfig,
    /// Statically configured signing keys.
    #[serde(default)]
    pub signing_keys: Option<JwksDocument>,
    /// OIDC discovery endpoint; mutually exclusive with `signing_keys`.
    #[serde(default)]
    pub openid_configuration_url: Option<String>,
    /// HTTP proxy URL for outbound discovery and JWKS calls.
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub tls: Option<JwtTlsConfig>,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JwtTlsConfig {
    /// PEM bundle with the client certificate and private key.
    #[serde(default)]
    pub client_identity_pem: Option<String>,
    /// PEM of an additional trusted CA certificate.
    #[serde(default)]
    pub trusted_ca_pem: Option<String>,
}

fn default_http_timeout_seconds() -> u64 {
    10
}

/// Declarative user mapping rules of one domain.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserMappingConfig {
    #[serde(default)]
    pub user_name: Vec<MappingSourceConfig>,
    #[serde(default)]
    pub roles_from: Vec<MappingSourceConfig>,
    #[serde(default)]
    pub attrs_from: Vec<AttributeMappingConfig>,
}

impl UserMappingConfig {
    /// Compile into executable mapping rules, validating paths and patterns.
    pub fn compile(&self) -> Result<UserMapping, ConfigError> {
        let user_name = self
            .user_name
            .iter()
            .map(|source| source.compile())
            .collect::<Result<Vec<_>, _>>()?;
        let roles = self
            .roles_from
            .iter()
            .map(|source| source.compile())
            .collect::<Result<Vec<_>, _>>()?;
        let attrs = self
            .attrs_from
            .iter()
            .map(|mapping| mapping.compile())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(UserMapping::new(user_name, roles, attrs))
    }
}

/// One user-name or role source: either a static value or a JSON path with
/// optional pattern and split post-processing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MappingSourceConfig {
    #[serde(default, rename = "static")]
    pub static_value: Option<String>,
    #[serde(default)]
    pub json_path: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub split: Option<String>,
}

impl MappingSourceConfig {
    fn compile(&self) -> Result<MappingSource, ConfigError> {
        match (&self.static_value, &self.json_path) {
            (Some(_), Some(_)) => Err(ConfigError::invalid_value(
                "user_mapping",
                "A mapping source cannot be both static and json_path",
            )),
            (Some(value), None) => Ok(MappingSource::static_value(value)),
            (None, Some(json_path)) => MappingSource::from_attribute(
                json_path,
                self.pattern.as_deref(),
                self.split.as_deref(),
            ),
            (None, None) => Err(ConfigError::invalid_value(
                "user_mapping",
                "A mapping source needs either a static value or a json_path",
            )),
        }
    }
}

/// One target attribute key with its source.
#[derive(Debug, Clone, Deserialize)]
pub struct AttributeMappingConfig {
    pub key: String,
    #[serde(default, rename = "static")]
    pub static_value: Option<serde_json::Value>,
    #[serde(default)]
    pub json_path: Option<String>,
}

impl AttributeMappingConfig {
    fn compile(&self) -> Result<AttributeMapping, ConfigError> {
        match (&self.static_value, &self.json_path) {
            (Some(value), None) => Ok(AttributeMapping::static_value(&self.key, value.clone())),
            (None, Some(json_path)) => AttributeMapping::from_attribute(&self.key, json_path),
            _ => Err(ConfigError::invalid_value(
                "attrs_from",
                format!("Attribute '{}' needs exactly one of static or json_path", self.key),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(json: serde_json::Value) -> AuthDomainConfig {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_minimal_domain_config_defaults() {
        let config = domain(serde_json::json!({"type": "basic"}));

        assert!(config.enabled);
        assert!(config.cache_user);
        assert!(!config.authz_separate);
        assert!(config.id.is_none());
        assert_eq!(config.type_tags().unwrap(), ("basic", "noop"));
    }

    #[test]
    fn test_type_tag_with_backend() {
        let config = domain(serde_json::json!({"type": "basic/ldap"}));
        assert_eq!(config.type_tags().unwrap(), ("basic", "ldap"));
    }

    #[test]
    fn test_unknown_frontend_lists_available_types() {
        let config = domain(serde_json::json!({"type": "kerberos"}));
        let err = config.type_tags().unwrap_err();

        assert!(err.message().contains("kerberos"));
        assert!(err.message().contains("trusted_origin"));
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let config = domain(serde_json::json!({"type": "basic/sql"}));
        assert!(config.type_tags().is_err());
    }

    #[test]
    fn test_effective_id_prefers_configured_id() {
        let config = domain(serde_json::json!({"type": "basic", "id": "corporate"}));
        assert_eq!(config.effective_id(0), "corporate");
    }

    #[test]
    fn test_derived_id_is_stable_and_position_sensitive() {
        let config = domain(serde_json::json!({"type": "basic"}));

        assert_eq!(config.effective_id(0), config.effective_id(0));
        assert_ne!(config.effective_id(0), config.effective_id(1));
        assert_eq!(config.effective_id(0).len(), 8);
    }

    #[test]
    fn test_full_config_document_parses() {
        let config: AuthcConfig = serde_json::from_value(serde_json::json!({
            "network": {"trusted_proxies": ["127.0.0.0/8"]},
            "debug": true,
            "user_cache": {"expire_after_write_seconds": 60, "max_size": 1000},
            "auth_domains": [
                {
                    "type": "basic/ldap",
                    "skip_users": ["skip_*"],
                    "ldap": {
                        "hosts": ["ldap://localhost:3890"],
                        "user_search": {"base_dns": ["ou=people,dc=example,dc=com"]}
                    }
                },
                {
                    "type": "jwt",
                    "jwt": {
                        "required_issuer": "https://idp.example.com",
                        "openid_configuration_url":
                            "https://idp.example.com/.well-known/openid-configuration"
                    }
                }
            ]
        }))
        .unwrap();

        assert!(config.debug);
        assert_eq!(config.auth_domains.len(), 2);
        assert_eq!(config.auth_domains[0].skip_users, vec!["skip_*"]);

        let jwt = config.auth_domains[1].jwt.as_ref().unwrap();
        assert_eq!(
            jwt.frontend.required_issuer.as_deref(),
            Some("https://idp.example.com")
        );
        assert_eq!(jwt.http_timeout_seconds, 10);
    }

    #[test]
    fn test_user_mapping_compiles() {
        let mapping: UserMappingConfig = serde_json::from_value(serde_json::json!({
            "user_name": [{"json_path": "$.preferred_username"}],
            "roles_from": [
                {"json_path": "$.groups[*]"},
                {"static": "everyone"}
            ],
            "attrs_from": [{"key": "department", "json_path": "$.dept"}]
        }))
        .unwrap();

        assert!(mapping.compile().is_ok());
    }

    #[test]
    fn test_mapping_source_without_a_source_is_rejected() {
        let mapping: UserMappingConfig = serde_json::from_value(serde_json::json!({
            "user_name": [{"pattern": "(.*)"}]
        }))
        .unwrap();

        assert!(mapping.compile().is_err());
    }

    #[test]
    fn test_mapping_source_with_both_sources_is_rejected() {
        let mapping: UserMappingConfig = serde_json::from_value(serde_json::json!({
            "user_name": [{"static": "alice", "json_path": "$.sub"}]
        }))
        .unwrap();

        assert!(mapping.compile().is_err());
    }

    #[test]
    fn test_invalid_mapping_path_is_rejected_at_compile_time() {
        let mapping: UserMappingConfig = serde_json::from_value(serde_json::json!({
            "user_name": [{"json_path": "$.[unclosed"}]
        }))
        .unwrap();

        assert!(mapping.compile().is_err());
    }
}
