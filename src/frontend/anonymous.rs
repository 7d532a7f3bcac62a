//! Anonymous frontend, used only at the tail of a domain chain.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::AuthError;
use crate::frontend::AuthenticationFrontend;
use crate::types::{AuthCredentials, RequestMetaData};

#[derive(Debug, Clone, Deserialize)]
pub struct AnonymousFrontendConfig {
    #[serde(default = "default_user_name")]
    pub user_name: String,
}

fn default_user_name() -> String {
    "anonymous".to_string()
}

impl Default for AnonymousFrontendConfig {
    fn default() -> Self {
        Self {
            user_name: default_user_name(),
        }
    }
}

/// Always produces a fixed, complete identity.
pub struct AnonymousFrontend {
    user_name: String,
}

impl AnonymousFrontend {
    pub fn new(config: &AnonymousFrontendConfig) -> Self {
        Self {
            user_name: config.user_name.clone(),
        }
    }
}

#[async_trait]
impl AuthenticationFrontend for AnonymousFrontend {
    fn frontend_type(&self) -> &'static str {
        "anonymous"
    }

    async fn extract_credentials(
        &self,
        _request: &RequestMetaData,
    ) -> Result<Option<AuthCredentials>, AuthError> {
        Ok(Some(
            AuthCredentials::new(&self.user_name, "anonymous").mark_complete(),
        ))
    }
}
