//! HTTP Basic authentication frontend.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use tracing::warn;

use crate::error::AuthError;
use crate::frontend::AuthenticationFrontend;
use crate::types::{AuthCredentials, RequestMetaData};

#[derive(Debug, Clone, Deserialize)]
pub struct BasicFrontendConfig {
    /// Realm announced in the `WWW-Authenticate` challenge.
    #[serde(default = "default_realm")]
    pub realm: String,
    /// Whether to send a challenge at all on authentication failure.
    #[serde(default = "default_challenge")]
    pub challenge: bool,
}

fn default_realm() -> String {
    "authc".to_string()
}

fn default_challenge() -> bool {
    true
}

impl Default for BasicFrontendConfig {
    fn default() -> Self {
        Self {
            realm: default_realm(),
            challenge: default_challenge(),
        }
    }
}

/// Reads `Authorization: Basic <base64(user:pass)>`. The extracted
/// credentials are always complete; validation is the backend's job.
pub struct BasicFrontend {
    realm: String,
    challenging: bool,
}

impl BasicFrontend {
    pub fn new(config: &BasicFrontendConfig) -> Self {
        Self {
            realm: config.realm.clone(),
            challenging: config.challenge,
        }
    }
}

#[async_trait]
impl AuthenticationFrontend for BasicFrontend {
    fn frontend_type(&self) -> &'static str {
        "basic"
    }

    async fn extract_credentials(
        &self,
        request: &RequestMetaData,
    ) -> Result<Option<AuthCredentials>, AuthError> {
        let Some(authorization) = request.header("authorization") else {
            return Ok(None);
        };

        let Some(encoded) = strip_scheme(authorization, "basic") else {
            return Ok(None);
        };

        let decoded = match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Invalid base64 in basic authorization header: {}", e);
                return Ok(None);
            }
        };

        let decoded = match String::from_utf8(decoded) {
            Ok(decoded) => decoded,
            Err(_) => {
                warn!("Basic authorization header is not valid UTF-8");
                return Ok(None);
            }
        };

        // A body with no colon is not an error, just not basic credentials.
        let Some((name, password)) = decoded.split_once(':') else {
            return Ok(None);
        };

        Ok(Some(
            AuthCredentials::new(name, "basic")
                .with_password(password.as_bytes().to_vec())
                .mark_complete(),
        ))
    }

    fn challenge(&self, _credentials: Option<&AuthCredentials>) -> Option<String> {
        self.challenging
            .then(|| format!("Basic realm=\"{}\"", self.realm))
    }
}

/// Case-insensitively strip an authorization scheme prefix.
pub(crate) fn strip_scheme<'a>(header: &'a str, scheme: &str) -> Option<&'a str> {
    let (candidate, rest) = header.split_once(' ')?;
    candidate.eq_ignore_ascii_case(scheme).then_some(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_authorization(value: &str) -> RequestMetaData {
        let mut headers = http::HeaderMap::new();
        headers.insert("authorization", value.parse().unwrap());
        RequestMetaData::builder("127.0.0.1".parse().unwrap())
            .headers(headers)
            .build(&[])
    }

    fn frontend() -> BasicFrontend {
        BasicFrontend::new(&BasicFrontendConfig::default())
    }

    #[tokio::test]
    async fn test_extracts_user_and_password() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("user:pass");
        let request = request_with_authorization(&format!("Basic {}", encoded));

        let credentials = frontend()
            .extract_credentials(&request)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(credentials.name(), "user");
        assert_eq!(credentials.password(), Some(b"pass".as_slice()));
        assert!(credentials.complete());
        assert_eq!(credentials.authenticator_type(), "basic");
    }

    #[tokio::test]
    async fn test_password_may_contain_colons() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("user:pa:ss");
        let request = request_with_authorization(&format!("Basic {}", encoded));

        let credentials = frontend()
            .extract_credentials(&request)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(credentials.password(), Some(b"pa:ss".as_slice()));
    }

    #[tokio::test]
    async fn test_body_without_colon_yields_none_not_error() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("no-colon-here");
        let request = request_with_authorization(&format!("Basic {}", encoded));

        assert!(frontend().extract_credentials(&request).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_other_scheme_yields_none() {
        let request = request_with_authorization("Bearer some.token.here");
        assert!(frontend().extract_credentials(&request).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scheme_is_case_insensitive() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("user:pass");
        let request = request_with_authorization(&format!("bAsIc {}", encoded));

        assert!(frontend().extract_credentials(&request).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_base64_yields_none() {
        let request = request_with_authorization("Basic !!!not-base64!!!");
        assert!(frontend().extract_credentials(&request).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_header_yields_none() {
        let request = RequestMetaData::builder("127.0.0.1".parse().unwrap()).build(&[]);
        assert!(frontend().extract_credentials(&request).await.unwrap().is_none());
    }

    #[test]
    fn test_challenge_reflects_realm() {
        let frontend = BasicFrontend::new(&BasicFrontendConfig {
            realm: "engine".to_string(),
            challenge: true,
        });
        assert_eq!(frontend.challenge(None).as_deref(), Some("Basic realm=\"engine\""));
    }

    #[test]
    fn test_non_challenging_frontend_has_no_challenge() {
        let frontend = BasicFrontend::new(&BasicFrontendConfig {
            realm: "engine".to_string(),
            challenge: false,
        });
        assert!(frontend.challenge(None).is_none());
    }
}
