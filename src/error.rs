//! Error types of the authentication pipeline.
//!
//! Two kinds propagate through a pipeline run: `Unavailable` (transient
//! infrastructure failure, the domain is skipped) and `CredentialsInvalid`
//! (the domain definitively rejected the credentials). Configuration
//! problems are a distinct `ConfigError`, raised when a pipeline is built
//! and never at request time.

use std::fmt;

use crate::debug::DebugInfo;

/// Outcome kind of a single failed domain attempt.
#[derive(Debug, Clone)]
pub enum AuthError {
    /// Transient infrastructure failure: network, LDAP or JWKS endpoint
    /// down. The pipeline skips the domain and continues with the next one.
    Unavailable {
        message: String,
        details: Option<serde_json::Value>,
    },
    /// The presented credentials are definitively wrong for this domain.
    CredentialsInvalid { message: String },
}

impl AuthError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            details: None,
        }
    }

    pub fn unavailable_with_details(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::Unavailable {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn credentials_invalid(message: impl Into<String>) -> Self {
        Self::CredentialsInvalid {
            message: message.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Unavailable { message, .. } => message,
            Self::CredentialsInvalid { message } => message,
        }
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { message, .. } => write!(f, "Authenticator unavailable: {}", message),
            Self::CredentialsInvalid { message } => write!(f, "Invalid credentials: {}", message),
        }
    }
}

impl std::error::Error for AuthError {}

/// Invalid pipeline configuration, detected while building a pipeline.
#[derive(Debug, Clone)]
pub struct ConfigError {
    attribute: Option<String>,
    message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            attribute: None,
            message: message.into(),
        }
    }

    pub fn invalid_value(attribute: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            attribute: Some(attribute.into()),
            message: message.into(),
        }
    }

    pub fn missing(attribute: impl Into<String>) -> Self {
        Self {
            attribute: Some(attribute.into()),
            message: "Required attribute is missing".to_string(),
        }
    }

    pub fn attribute(&self) -> Option<&str> {
        self.attribute.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.attribute {
            Some(attribute) => write!(f, "Invalid configuration at '{}': {}", attribute, self.message),
            None => write!(f, "Invalid configuration: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Terminal failure of a whole pipeline run: no domain authenticated the
/// caller.
///
/// `status` is 401 when at least one domain definitively rejected the
/// credentials (or none were presented), and 503 when the only viable
/// domains were unavailable. `challenges` carries the aggregated
/// `WWW-Authenticate` values the host should return on 401.
#[derive(Debug, Clone)]
pub struct AuthcError {
    status: http::StatusCode,
    message: String,
    challenges: Vec<String>,
    debug_trail: Vec<DebugInfo>,
}

impl AuthcError {
    pub(crate) fn new(
        status: http::StatusCode,
        message: impl Into<String>,
        challenges: Vec<String>,
        debug_trail: Vec<DebugInfo>,
    ) -> Self {
        Self {
            status,
            message: message.into(),
            challenges,
            debug_trail,
        }
    }

    pub fn status(&self) -> http::StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// `WWW-Authenticate` challenge values, in domain order, deduplicated.
    pub fn challenges(&self) -> &[String] {
        &self.challenges
    }

    /// Per-domain diagnostic trail; empty unless debug mode was enabled.
    pub fn debug_trail(&self) -> &[DebugInfo] {
        &self.debug_trail
    }
}

impl fmt::Display for AuthcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

impl std::error::Error for AuthcError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_display() {
        let err = AuthError::unavailable("LDAP connect timeout");
        assert_eq!(err.to_string(), "Authenticator unavailable: LDAP connect timeout");
        assert!(err.is_unavailable());

        let err = AuthError::credentials_invalid("bad password");
        assert_eq!(err.to_string(), "Invalid credentials: bad password");
        assert!(!err.is_unavailable());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid_value("type", "Unknown authentication frontend");
        assert_eq!(
            err.to_string(),
            "Invalid configuration at 'type': Unknown authentication frontend"
        );

        let err = ConfigError::missing("jwt.jwks");
        assert_eq!(err.attribute(), Some("jwt.jwks"));
    }
}
