//! Trusted-origin frontend: identity injected by a trusted proxy.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::AuthError;
use crate::frontend::AuthenticationFrontend;
use crate::types::{AuthCredentials, RequestMetaData};

#[derive(Debug, Clone, Deserialize)]
pub struct TrustedOriginFrontendConfig {
    /// Header carrying the user name set by the proxy.
    #[serde(default = "default_user_header")]
    pub user_header: String,
    /// Header carrying a comma-separated role list set by the proxy.
    #[serde(default = "default_roles_header")]
    pub roles_header: String,
}

fn default_user_header() -> String {
    "x-proxy-user".to_string()
}

fn default_roles_header() -> String {
    "x-proxy-roles".to_string()
}

impl Default for TrustedOriginFrontendConfig {
    fn default() -> Self {
        Self {
            user_header: default_user_header(),
            roles_header: default_roles_header(),
        }
    }
}

/// Accepts a synthetic identity from proxy-set headers, but only when the
/// direct peer is a configured trusted proxy. An untrusted peer is a
/// credentials failure carrying the observed address, not a silent `None`:
/// the absence of trust is itself diagnostic.
pub struct TrustedOriginFrontend {
    user_header: String,
    roles_header: String,
}

impl TrustedOriginFrontend {
    pub fn new(config: &TrustedOriginFrontendConfig) -> Self {
        Self {
            user_header: config.user_header.clone(),
            roles_header: config.roles_header.clone(),
        }
    }
}

#[async_trait]
impl AuthenticationFrontend for TrustedOriginFrontend {
    fn frontend_type(&self) -> &'static str {
        "trusted_origin"
    }

    async fn extract_credentials(
        &self,
        request: &RequestMetaData,
    ) -> Result<Option<AuthCredentials>, AuthError> {
        if !request.trusted_proxy() {
            return Err(AuthError::credentials_invalid(format!(
                "Request does not come from a trusted proxy; direct address is {}",
                request.direct_ip_address()
            )));
        }

        let Some(user_name) = request.header(&self.user_header) else {
            return Ok(None);
        };

        let roles: Vec<String> = request
            .header(&self.roles_header)
            .map(|value| {
                value
                    .split(',')
                    .map(|role| role.trim().to_string())
                    .filter(|role| !role.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(
            AuthCredentials::new(user_name, "trusted_origin")
                .with_backend_roles(roles)
                .mark_complete(),
        ))
    }
}
