//! Credential-validation backends.

mod ldap;

pub use ldap::{
    ExhaustionPolicy, FakeLoginConfig, LdapBackend, LdapBackendConfig, LdapPoolConfig,
    LdapUserSearchConfig,
};

use async_trait::async_trait;

use crate::error::AuthError;
use crate::types::AuthCredentials;

/// Whether identities produced by a backend may be served from the user
/// cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCachingPolicy {
    /// Cache every successful authentication.
    Always,
    /// Cache only when role/attribute resolution is declared to be decoupled
    /// from the authentication check itself. This is a configuration-level
    /// declaration, never inferred.
    OnlyIfAuthzSeparate,
    /// Never cache; the identity is cheap to recompute and should reflect
    /// live request state.
    Never,
}

/// Validates extracted credentials and enriches them with backend-resolved
/// roles and attributes.
#[async_trait]
pub trait AuthenticationBackend: Send + Sync {
    /// The type tag this backend is registered under.
    fn backend_type(&self) -> &'static str;

    /// Validate the credentials, returning them possibly renamed and
    /// enriched. Failures are classified as unavailable or
    /// credentials-invalid.
    async fn authenticate(&self, credentials: AuthCredentials) -> Result<AuthCredentials, AuthError>;

    fn user_caching_policy(&self) -> UserCachingPolicy;
}

/// Backend for frontends whose extraction already is the authentication
/// decision (JWT signature verification, trusted-origin headers, anonymous).
pub struct NoopBackend;

#[async_trait]
impl AuthenticationBackend for NoopBackend {
    fn backend_type(&self) -> &'static str {
        "noop"
    }

    async fn authenticate(&self, credentials: AuthCredentials) -> Result<AuthCredentials, AuthError> {
        Ok(credentials)
    }

    fn user_caching_policy(&self) -> UserCachingPolicy {
        UserCachingPolicy::Never
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_backend_passes_credentials_through() {
        let credentials = AuthCredentials::new("alice", "jwt").mark_complete();
        let result = NoopBackend.authenticate(credentials).await.unwrap();
        assert_eq!(result.name(), "alice");
        assert!(result.complete());
    }

    #[test]
    fn test_noop_backend_never_caches() {
        assert_eq!(NoopBackend.user_caching_policy(), UserCachingPolicy::Never);
    }
}
