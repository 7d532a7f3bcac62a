//! JWT/OIDC frontend.
//!
//! Signature verification happens here; there is no separate backend call
//! for JWT domains. That merge is deliberate: a verified token already is
//! the authentication decision.
//!
//! An unparsable token, a failed signature or a missing subject claim all
//! yield `None`, meaning "not this domain's credentials". Only a failed key
//! fetch is surfaced as an unavailable-domain error.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{Validation, decode, decode_header};
use serde::Deserialize;
use tracing::debug;

use crate::error::{AuthError, ConfigError};
use crate::frontend::AuthenticationFrontend;
use crate::frontend::basic::strip_scheme;
use crate::jwks::KeySetRetriever;
use crate::mapping::MappingSource;
use crate::types::{AuthCredentials, RequestMetaData};

#[derive(Debug, Clone, Deserialize)]
pub struct JwtFrontendConfig {
    /// URL parameter that may carry the token when no bearer header does.
    #[serde(default)]
    pub url_parameter: Option<String>,
    /// Required `iss` claim value.
    #[serde(default)]
    pub required_issuer: Option<String>,
    /// Required `aud` claim value. Unset disables audience validation.
    #[serde(default)]
    pub required_audience: Option<String>,
    /// Claim holding the subject. Ignored when `subject_path` is set.
    #[serde(default)]
    pub subject_key: Option<String>,
    /// JSON path selecting the subject from the claims.
    #[serde(default)]
    pub subject_path: Option<String>,
    /// Pattern post-processing the subject; capture groups are concatenated.
    #[serde(default)]
    pub subject_pattern: Option<String>,
    /// Claim holding the roles. Ignored when `roles_path` is set.
    #[serde(default)]
    pub roles_key: Option<String>,
    /// JSON path selecting roles from the claims.
    #[serde(default)]
    pub roles_path: Option<String>,
    #[serde(default = "default_realm")]
    pub realm: String,
    #[serde(default = "default_challenge")]
    pub challenge: bool,
}

fn default_realm() -> String {
    "authc".to_string()
}

fn default_challenge() -> bool {
    true
}

impl Default for JwtFrontendConfig {
    fn default() -> Self {
        Self {
            url_parameter: None,
            required_issuer: None,
            required_audience: None,
            subject_key: None,
            subject_path: None,
            subject_pattern: None,
            roles_key: None,
            roles_path: None,
            realm: default_realm(),
            challenge: default_challenge(),
        }
    }
}

pub struct JwtFrontend {
    retriever: Arc<KeySetRetriever>,
    url_parameter: Option<String>,
    required_issuer: Option<String>,
    required_audience: Option<String>,
    subject: MappingSource,
    roles: Option<MappingSource>,
    realm: String,
    challenging: bool,
}

impl JwtFrontend {
    pub fn new(retriever: Arc<KeySetRetriever>, config: &JwtFrontendConfig) -> Result<Self, ConfigError> {
        let subject_path = match (&config.subject_path, &config.subject_key) {
            (Some(path), _) => path.clone(),
            (None, Some(key)) => claim_path(key),
            (None, None) => "$.sub".to_string(),
        };
        let subject = MappingSource::from_attribute(
            &subject_path,
            config.subject_pattern.as_deref(),
            None,
        )?;

        let roles_path = match (&config.roles_path, &config.roles_key) {
            (Some(path), _) => Some(path.clone()),
            (None, Some(key)) => Some(claim_path(key)),
            (None, None) => None,
        };
        let roles = roles_path
            .map(|path| MappingSource::from_attribute(&path, None, Some(",")))
            .transpose()?;

        Ok(Self {
            retriever,
            url_parameter: config.url_parameter.clone(),
            required_issuer: config.required_issuer.clone(),
            required_audience: config.required_audience.clone(),
            subject,
            roles,
            realm: config.realm.clone(),
            challenging: config.challenge,
        })
    }

    /// The bearer token, preferring the header over the URL parameter.
    fn token<'a>(&self, request: &'a RequestMetaData) -> Option<&'a str> {
        if let Some(authorization) = request.header("authorization")
            && let Some(token) = strip_scheme(authorization, "bearer")
        {
            return Some(token.trim());
        }

        self.url_parameter
            .as_deref()
            .and_then(|name| request.url_param(name))
    }
}

/// JSON path selecting a single top-level claim.
fn claim_path(claim: &str) -> String {
    format!("$['{}']", claim.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[async_trait]
impl AuthenticationFrontend for JwtFrontend {
    fn frontend_type(&self) -> &'static str {
        "jwt"
    }

    async fn extract_credentials(
        &self,
        request: &RequestMetaData,
    ) -> Result<Option<AuthCredentials>, AuthError> {
        let Some(token) = self.token(request) else {
            return Ok(None);
        };

        let header = match decode_header(token) {
            Ok(header) => header,
            Err(e) => {
                debug!("Unparsable JWT header: {}", e);
                return Ok(None);
            }
        };

        // A key-fetch failure is the one case that makes this domain
        // unavailable instead of merely inapplicable.
        let key = self
            .retriever
            .get_key(header.kid.as_deref())
            .await
            .map_err(|e| AuthError::unavailable(e.to_string()))?;

        let Some(key) = key else {
            debug!("No verification key for kid {:?}", header.kid);
            return Ok(None);
        };

        let mut validation = Validation::new(key.algorithm.unwrap_or(header.alg));
        if let Some(issuer) = &self.required_issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.required_audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        let claims = match decode::<serde_json::Value>(token, &key.key, &validation) {
            Ok(token_data) => token_data.claims,
            Err(e) => {
                debug!("JWT verification failed: {}", e);
                return Ok(None);
            }
        };

        let mut subjects = BTreeSet::new();
        self.subject.apply(&claims, &mut subjects);
        if subjects.len() != 1 {
            debug!("JWT subject extraction produced {} candidates", subjects.len());
            return Ok(None);
        }
        let subject = subjects.into_iter().next().unwrap_or_default();

        let mut roles = BTreeSet::new();
        if let Some(rule) = &self.roles {
            rule.apply(&claims, &mut roles);
        }

        let attributes = match claims {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };

        Ok(Some(
            AuthCredentials::new(subject, "jwt")
                .with_backend_roles(roles)
                .with_attributes(attributes)
                .mark_complete(),
        ))
    }

    fn challenge(&self, _credentials: Option<&AuthCredentials>) -> Option<String> {
        self.challenging
            .then(|| format!("Bearer realm=\"{}\"", self.realm))
    }
}
