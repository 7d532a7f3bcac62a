//! Credential-extraction frontends.
//!
//! A frontend reads raw credentials out of a request without validating
//! them. Returning `Ok(None)` means "these are not this domain's
//! credentials" and moves the pipeline on to the next domain; an error
//! classifies the failure as unavailable or definitively invalid.

mod anonymous;
mod basic;
mod client_cert;
mod jwt;
mod trusted_origin;

pub use anonymous::{AnonymousFrontend, AnonymousFrontendConfig};
pub use basic::{BasicFrontend, BasicFrontendConfig};
pub use client_cert::{ClientCertFrontend, ClientCertFrontendConfig, parse_dn};
pub use jwt::{JwtFrontend, JwtFrontendConfig};
pub use trusted_origin::{TrustedOriginFrontend, TrustedOriginFrontendConfig};

use async_trait::async_trait;

use crate::error::AuthError;
use crate::types::{AuthCredentials, RequestMetaData};

/// Stateless credential extractor; no server-side session is kept.
#[async_trait]
pub trait AuthenticationFrontend: Send + Sync {
    /// The type tag this frontend is registered under.
    fn frontend_type(&self) -> &'static str;

    /// Extract credentials from the request.
    ///
    /// `Ok(None)` means the request carries nothing this frontend
    /// recognizes; the domain is simply not applicable.
    async fn extract_credentials(
        &self,
        request: &RequestMetaData,
    ) -> Result<Option<AuthCredentials>, AuthError>;

    /// `WWW-Authenticate` challenge to send on final authentication
    /// failure, if this frontend issues one.
    fn challenge(&self, credentials: Option<&AuthCredentials>) -> Option<String> {
        let _ = credentials;
        None
    }
}
