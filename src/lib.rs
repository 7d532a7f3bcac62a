//! Multi-domain authentication pipeline.
//!
//! Given an inbound request, the pipeline decides whether and as whom the
//! caller is authenticated by trying a configured, ordered list of
//! authentication domains. Each domain pairs a credential-extraction
//! *frontend* (Basic, client certificate, trusted origin, anonymous,
//! JWT/OIDC) with a credential-validation *backend* (LDAP bind-and-search,
//! or no-op for self-contained frontends such as JWT).
//!
//! The first domain that passes its acceptance rules and authenticates the
//! caller wins; later domains are never invoked. Transient infrastructure
//! failures (LDAP down, JWKS unreachable) skip the affected domain instead
//! of failing the request outright.
//!
//! ## Usage
//!
//! ```ignore
//! let config: AuthcConfig = serde_json::from_str(config_json)?;
//! let pipeline = AuthPipeline::from_config(&config)?;
//!
//! let request = RequestMetaData::builder(direct_ip)
//!     .headers(headers)
//!     .build(&trusted_proxies);
//!
//! match pipeline.authenticate(&request).await {
//!     Ok(AuthcResult::Authenticated { user, .. }) => { /* proceed */ }
//!     Ok(AuthcResult::Incomplete { .. }) => { /* protocol round-trip */ }
//!     Err(e) => { /* 401/503 with WWW-Authenticate challenges */ }
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod debug;
pub mod error;
pub mod filter;
pub mod frontend;
pub mod jwks;
pub mod mapping;
pub mod pipeline;
pub mod types;

// Re-export key types and functions
pub use backend::{AuthenticationBackend, NoopBackend, UserCachingPolicy};
pub use cache::{Clock, SystemClock, UserCache, UserCacheConfig};
pub use config::{AuthDomainConfig, AuthcConfig};
pub use debug::{AuthDebugLogger, DebugInfo};
pub use error::{AuthError, AuthcError, ConfigError};
pub use filter::AcceptanceRules;
pub use frontend::AuthenticationFrontend;
pub use jwks::{KeySetRetriever, KeySetSource, ProxyConfig, TlsConfig};
pub use mapping::UserMapping;
pub use pipeline::{AuthPipeline, AuthcResult, AuthenticationDomain};
pub use types::{AuthCredentials, RequestMetaData, User};
