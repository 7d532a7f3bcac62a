//! Optional per-request authentication trace.
//!
//! The logger is a no-op unless debug mode is enabled; every call on the
//! disabled variant returns immediately without locking or allocating. When
//! enabled, it accumulates an ordered list of `DebugInfo` entries across the
//! whole pipeline run, attached to the final success or failure.

use std::sync::Mutex;

use serde::Serialize;

/// One recorded step of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugInfo {
    pub domain_id: String,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl DebugInfo {
    pub fn new(domain_id: impl Into<String>, success: bool, message: impl Into<String>) -> Self {
        Self {
            domain_id: domain_id.into(),
            success,
            message: message.into(),
            details: serde_json::Map::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// Trace accumulator for one pipeline run.
///
/// Callers must never place password material into `details`; the pipeline
/// only records user names, attribute trees and failure messages.
pub struct AuthDebugLogger {
    entries: Option<Mutex<Vec<DebugInfo>>>,
}

impl AuthDebugLogger {
    pub fn new(enabled: bool) -> Self {
        Self {
            entries: enabled.then(|| Mutex::new(Vec::new())),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    pub fn success(&self, domain_id: &str, message: impl Into<String>) {
        self.add(DebugInfo::new(domain_id, true, message));
    }

    pub fn failure(&self, domain_id: &str, message: impl Into<String>) {
        self.add(DebugInfo::new(domain_id, false, message));
    }

    pub fn add(&self, info: DebugInfo) {
        if let Some(entries) = &self.entries
            && let Ok(mut entries) = entries.lock()
        {
            entries.push(info);
        }
    }

    /// Consume the logger and return the accumulated trail. Empty when the
    /// logger was disabled.
    pub fn into_trail(self) -> Vec<DebugInfo> {
        match self.entries {
            Some(entries) => entries.into_inner().unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_logger_accumulates_nothing() {
        let logger = AuthDebugLogger::disabled();
        assert!(!logger.is_enabled());

        logger.success("ldap", "User is logged in");
        logger.failure("basic", "No credentials");

        assert!(logger.into_trail().is_empty());
    }

    #[test]
    fn test_enabled_logger_preserves_order() {
        let logger = AuthDebugLogger::new(true);
        assert!(logger.is_enabled());

        logger.failure("basic", "No credentials");
        logger.success("ldap", "Extracted credentials");
        logger.add(
            DebugInfo::new("ldap", true, "User is logged in")
                .with_detail("user_name", serde_json::json!("alice")),
        );

        let trail = logger.into_trail();
        assert_eq!(trail.len(), 3);
        assert_eq!(trail[0].domain_id, "basic");
        assert!(!trail[0].success);
        assert_eq!(trail[2].details["user_name"], serde_json::json!("alice"));
    }

    #[test]
    fn test_debug_info_serialization_skips_empty_details() {
        let info = DebugInfo::new("basic", false, "No credentials");
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("details").is_none());
    }
}
