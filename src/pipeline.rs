//! The authentication pipeline: ordered domain evaluation with
//! short-circuit on first success.
//!
//! Domains are tried strictly in configured order; each attempt is awaited
//! before the next begins. A domain that cannot reach its infrastructure is
//! skipped; a domain that definitively rejects the credentials lets the
//! chain continue but taints the final failure as 401 rather than 503. A
//! panic inside a backend is caught at the pipeline boundary and treated as
//! the domain being unavailable.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use ipnet::IpNet;
use tracing::{debug, info, warn};

use crate::backend::{AuthenticationBackend, LdapBackend, NoopBackend, UserCachingPolicy};
use crate::cache::{CacheKey, UserCache};
use crate::config::{AuthDomainConfig, AuthcConfig, JwtDomainConfig};
use crate::debug::{AuthDebugLogger, DebugInfo};
use crate::error::{AuthError, AuthcError, ConfigError};
use crate::filter::{AcceptanceRules, parse_networks};
use crate::frontend::{
    AnonymousFrontend, AuthenticationFrontend, BasicFrontend, ClientCertFrontend, JwtFrontend,
    TrustedOriginFrontend,
};
use crate::jwks::{
    DEFAULT_HTTP_TIMEOUT, KeySetRetriever, OpenIdProviderClient, ProxyConfig, StaticKeySetSource,
    TlsConfig,
};
use crate::mapping::UserMapping;
use crate::types::{AuthCredentials, RequestMetaData, User};

/// Successful outcome of a pipeline run.
#[derive(Debug)]
pub enum AuthcResult {
    Authenticated {
        user: User,
        /// Per-domain trace; empty unless debug mode is enabled.
        debug_trail: Vec<DebugInfo>,
    },
    /// A frontend recognized the request but needs another round trip
    /// before the credentials are complete.
    Incomplete {
        credentials: AuthCredentials,
        challenge: Option<String>,
    },
}

/// One configured (frontend, backend, rules) triple.
pub struct AuthenticationDomain {
    id: String,
    domain_type: String,
    acceptance_rules: AcceptanceRules,
    frontend: Arc<dyn AuthenticationFrontend>,
    backend: Arc<dyn AuthenticationBackend>,
    user_mapping: UserMapping,
    cache_user: bool,
    authz_separate: bool,
}

impl AuthenticationDomain {
    pub fn new(
        id: impl Into<String>,
        domain_type: impl Into<String>,
        acceptance_rules: AcceptanceRules,
        frontend: Arc<dyn AuthenticationFrontend>,
        backend: Arc<dyn AuthenticationBackend>,
        user_mapping: UserMapping,
        cache_user: bool,
        authz_separate: bool,
    ) -> Self {
        Self {
            id: id.into(),
            domain_type: domain_type.into(),
            acceptance_rules,
            frontend,
            backend,
            user_mapping,
            cache_user,
            authz_separate,
        }
    }

    /// Build a domain from its configuration document.
    pub fn from_config(config: &AuthDomainConfig, position: usize) -> Result<Self, ConfigError> {
        let (frontend_tag, backend_tag) = config.type_tags()?;

        let frontend: Arc<dyn AuthenticationFrontend> = match frontend_tag {
            "basic" => Arc::new(BasicFrontend::new(
                &config.basic.clone().unwrap_or_default(),
            )),
            "jwt" => {
                let jwt = config.jwt.as_ref().ok_or_else(|| ConfigError::missing("jwt"))?;
                Arc::new(JwtFrontend::new(build_key_set_retriever(jwt)?, &jwt.frontend)?)
            }
            "clientcert" => Arc::new(ClientCertFrontend::new(
                &config.clientcert.clone().unwrap_or_default(),
            )),
            "trusted_origin" => Arc::new(TrustedOriginFrontend::new(
                &config.trusted_origin.clone().unwrap_or_default(),
            )),
            "anonymous" => Arc::new(AnonymousFrontend::new(
                &config.anonymous.clone().unwrap_or_default(),
            )),
            other => {
                return Err(ConfigError::invalid_value(
                    "type",
                    format!("Unknown authentication frontend '{}'", other),
                ));
            }
        };

        let backend: Arc<dyn AuthenticationBackend> = match backend_tag {
            "noop" => Arc::new(NoopBackend),
            "ldap" => {
                let ldap = config.ldap.as_ref().ok_or_else(|| ConfigError::missing("ldap"))?;
                Arc::new(LdapBackend::new(ldap)?)
            }
            other => {
                return Err(ConfigError::invalid_value(
                    "type",
                    format!("Unknown authentication backend '{}'", other),
                ));
            }
        };

        let acceptance_rules = AcceptanceRules::new(
            &config.accept_ips,
            &config.skip_ips,
            &config.accept_users,
            &config.skip_users,
        )?;

        let user_mapping = match &config.user_mapping {
            Some(mapping) => mapping.compile()?,
            None => UserMapping::direct(),
        };

        Ok(Self::new(
            config.effective_id(position),
            config.domain_type.clone(),
            acceptance_rules,
            frontend,
            backend,
            user_mapping,
            config.cache_user,
            config.authz_separate,
        ))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn domain_type(&self) -> &str {
        &self.domain_type
    }

    /// Whether successes of this domain may be served from the user cache.
    fn caches_users(&self) -> bool {
        if !self.cache_user {
            return false;
        }
        match self.backend.user_caching_policy() {
            UserCachingPolicy::Always => true,
            UserCachingPolicy::OnlyIfAuthzSeparate => self.authz_separate,
            UserCachingPolicy::Never => false,
        }
    }
}

fn build_key_set_retriever(config: &JwtDomainConfig) -> Result<Arc<KeySetRetriever>, ConfigError> {
    match (&config.signing_keys, &config.openid_configuration_url) {
        (Some(_), Some(_)) => Err(ConfigError::invalid_value(
            "jwt",
            "signing_keys and openid_configuration_url are mutually exclusive",
        )),
        (Some(document), None) => Ok(Arc::new(KeySetRetriever::new(Arc::new(
            StaticKeySetSource::new(document.clone()),
        )))),
        (None, Some(url)) => {
            url::Url::parse(url).map_err(|e| {
                ConfigError::invalid_value(
                    "jwt.openid_configuration_url",
                    format!("'{}': {}", url, e),
                )
            })?;

            let tls = config.tls.as_ref().map(|tls| TlsConfig {
                client_identity_pem: tls.client_identity_pem.as_ref().map(|p| p.clone().into_bytes()),
                trusted_ca_pem: tls.trusted_ca_pem.as_ref().map(|p| p.clone().into_bytes()),
            });
            let proxy = config.proxy.as_ref().map(|url| ProxyConfig { url: url.clone() });
            let timeout = if config.http_timeout_seconds > 0 {
                std::time::Duration::from_secs(config.http_timeout_seconds)
            } else {
                DEFAULT_HTTP_TIMEOUT
            };

            let client = OpenIdProviderClient::new(url, tls.as_ref(), proxy.as_ref(), timeout)?;
            Ok(Arc::new(KeySetRetriever::new(Arc::new(client))))
        }
        (None, None) => Err(ConfigError::missing("jwt.signing_keys")),
    }
}

/// Outcome of one domain attempt, internal to the pipeline loop.
enum DomainOutcome {
    Authenticated(User),
    Incomplete(AuthCredentials, Option<String>),
    /// The domain had nothing to say about this request.
    NotApplicable,
    /// The domain definitively rejected the credentials.
    Rejected,
    Unavailable,
}

/// The configured pipeline. Shared across requests; every run is
/// independent.
pub struct AuthPipeline {
    domains: Vec<AuthenticationDomain>,
    trusted_proxies: Vec<IpNet>,
    user_cache: Arc<UserCache>,
    debug_enabled: bool,
}

impl AuthPipeline {
    pub fn new(
        domains: Vec<AuthenticationDomain>,
        trusted_proxies: Vec<IpNet>,
        user_cache: Arc<UserCache>,
        debug_enabled: bool,
    ) -> Self {
        Self {
            domains,
            trusted_proxies,
            user_cache,
            debug_enabled,
        }
    }

    /// Build the whole pipeline from a configuration document. Disabled
    /// domains are dropped here; misconfiguration fails fast.
    pub fn from_config(config: &AuthcConfig) -> Result<Self, ConfigError> {
        let trusted_proxies = parse_networks("network.trusted_proxies", &config.network.trusted_proxies)?;

        let mut domains = Vec::new();
        for (position, domain_config) in config.auth_domains.iter().enumerate() {
            if !domain_config.enabled {
                debug!("Skipping disabled auth domain {}", domain_config.effective_id(position));
                continue;
            }
            domains.push(AuthenticationDomain::from_config(domain_config, position)?);
        }

        info!("Built authentication pipeline with {} domains", domains.len());

        Ok(Self::new(
            domains,
            trusted_proxies,
            Arc::new(UserCache::new(&config.user_cache)),
            config.debug,
        ))
    }

    /// CIDRs whose forwarded headers the host should trust when building
    /// `RequestMetaData`.
    pub fn trusted_proxies(&self) -> &[IpNet] {
        &self.trusted_proxies
    }

    pub fn domains(&self) -> &[AuthenticationDomain] {
        &self.domains
    }

    /// Run the pipeline for one request.
    pub async fn authenticate(&self, request: &RequestMetaData) -> Result<AuthcResult, AuthcError> {
        let logger = AuthDebugLogger::new(self.debug_enabled);
        let mut saw_rejection = false;
        let mut saw_unavailable = false;

        for domain in &self.domains {
            match self.try_domain(domain, request, &logger).await {
                DomainOutcome::Authenticated(user) => {
                    debug!("Request authenticated as {} by domain {}", user.name(), domain.id);
                    return Ok(AuthcResult::Authenticated {
                        user,
                        debug_trail: logger.into_trail(),
                    });
                }
                DomainOutcome::Incomplete(credentials, challenge) => {
                    return Ok(AuthcResult::Incomplete {
                        credentials,
                        challenge,
                    });
                }
                DomainOutcome::NotApplicable => {}
                DomainOutcome::Rejected => saw_rejection = true,
                DomainOutcome::Unavailable => saw_unavailable = true,
            }
        }

        let mut challenges: Vec<String> = Vec::new();
        for domain in &self.domains {
            if let Some(challenge) = domain.frontend.challenge(None)
                && !challenges.contains(&challenge)
            {
                challenges.push(challenge);
            }
        }

        let (status, message) = if saw_unavailable && !saw_rejection {
            (
                http::StatusCode::SERVICE_UNAVAILABLE,
                "Authentication is temporarily unavailable",
            )
        } else {
            (http::StatusCode::UNAUTHORIZED, "Authentication failed")
        };

        Err(AuthcError::new(status, message, challenges, logger.into_trail()))
    }

    async fn try_domain(
        &self,
        domain: &AuthenticationDomain,
        request: &RequestMetaData,
        logger: &AuthDebugLogger,
    ) -> DomainOutcome {
        if !domain.acceptance_rules.accept_request(request) {
            logger.failure(&domain.id, "Skipped by request acceptance rules");
            return DomainOutcome::NotApplicable;
        }

        let credentials = match domain.frontend.extract_credentials(request).await {
            Ok(Some(credentials)) => credentials,
            Ok(None) => {
                logger.failure(&domain.id, "No suitable credentials in the request");
                return DomainOutcome::NotApplicable;
            }
            Err(e) => return self.record_failure(domain, logger, e),
        };

        // Name mapping runs before the user globs so that skip/accept rules
        // see the mapped name.
        let credentials = match domain.user_mapping.map_credentials(credentials) {
            Ok(credentials) => credentials,
            Err(e) => return self.record_failure(domain, logger, e),
        };

        if !domain.acceptance_rules.accept_credentials(&credentials) {
            logger.add(
                DebugInfo::new(&domain.id, false, "Skipped by user acceptance rules")
                    .with_detail("user_name", serde_json::json!(credentials.name())),
            );
            return DomainOutcome::NotApplicable;
        }

        logger.add(
            DebugInfo::new(&domain.id, true, "Extracted credentials")
                .with_detail("user_name", serde_json::json!(credentials.name())),
        );

        if !credentials.complete() {
            let challenge = domain.frontend.challenge(Some(&credentials));
            let mut credentials = credentials;
            credentials.clear_secrets();
            return DomainOutcome::Incomplete(credentials, challenge);
        }

        let cache_key = CacheKey {
            domain_id: domain.id.clone(),
            fingerprint: credentials.fingerprint(),
        };

        if domain.caches_users()
            && let Some(user) = self.user_cache.get(&cache_key)
        {
            logger.add(
                DebugInfo::new(&domain.id, true, "User is logged in (cached)")
                    .with_detail("user_name", serde_json::json!(user.name())),
            );
            return DomainOutcome::Authenticated(user);
        }

        // A panicking backend must not take the request down with it.
        let outcome = AssertUnwindSafe(domain.backend.authenticate(credentials))
            .catch_unwind()
            .await;

        let validated = match outcome {
            Ok(Ok(validated)) => validated,
            Ok(Err(e)) => return self.record_failure(domain, logger, e),
            Err(_) => {
                warn!("Authentication backend of domain {} panicked", domain.id);
                return self.record_failure(
                    domain,
                    logger,
                    AuthError::unavailable("Authentication backend failed unexpectedly"),
                );
            }
        };

        let user = match domain.user_mapping.map(&validated, &domain.id) {
            Ok(user) => user,
            Err(e) => return self.record_failure(domain, logger, e),
        };
        drop(validated);

        if domain.caches_users() {
            self.user_cache.put(cache_key, user.clone());
        }

        logger.add(
            DebugInfo::new(&domain.id, true, "User is logged in")
                .with_detail("user_name", serde_json::json!(user.name())),
        );

        DomainOutcome::Authenticated(user)
    }

    fn record_failure(
        &self,
        domain: &AuthenticationDomain,
        logger: &AuthDebugLogger,
        error: AuthError,
    ) -> DomainOutcome {
        match &error {
            AuthError::Unavailable { message, details } => {
                warn!("Auth domain {} is unavailable: {}", domain.id, message);
                let mut info = DebugInfo::new(&domain.id, false, message.clone());
                if let Some(details) = details {
                    info = info.with_detail("details", details.clone());
                }
                logger.add(info);
                DomainOutcome::Unavailable
            }
            AuthError::CredentialsInvalid { message } => {
                debug!("Auth domain {} rejected the credentials: {}", domain.id, message);
                logger.failure(&domain.id, message.clone());
                DomainOutcome::Rejected
            }
        }
    }
}
