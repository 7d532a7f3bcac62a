//! Declarative extraction of subject, roles and attributes from raw
//! credentials.
//!
//! Mapping rules are compiled at domain-construction time (invalid JSON
//! paths and patterns fail configuration validation); applying them is a
//! pure function over the structured attribute tree of the credentials.
//! JSON-path matches keep list semantics even for scalar hits so downstream
//! handling stays uniform.

use std::collections::BTreeSet;

use regex::Regex;
use serde_json::Value;
use serde_json_path::JsonPath;
use tracing::debug;

use crate::error::{AuthError, ConfigError};
use crate::types::{AuthCredentials, User};

/// One source of candidate values for a user name or role mapping.
#[derive(Debug)]
pub enum MappingSource {
    /// A fixed value, independent of the credentials.
    Static(String),
    /// Values selected from the credential attribute tree.
    Attribute {
        path: JsonPath,
        /// Optional post-processing pattern. Must match the whole value;
        /// capture groups 1..N are concatenated into the result.
        pattern: Option<Regex>,
        /// Optional separator splitting scalar matches into multiple values.
        split: Option<String>,
    },
}

impl MappingSource {
    pub fn static_value(value: impl Into<String>) -> Self {
        Self::Static(value.into())
    }

    pub fn from_attribute(
        json_path: &str,
        pattern: Option<&str>,
        split: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let path = JsonPath::parse(json_path)
            .map_err(|e| ConfigError::invalid_value("json_path", format!("'{}': {}", json_path, e)))?;

        let pattern = pattern
            .map(|p| {
                // Anchored, as the whole value has to match.
                Regex::new(&format!("^(?:{})$", p))
                    .map_err(|e| ConfigError::invalid_value("pattern", format!("'{}': {}", p, e)))
            })
            .transpose()?;

        Ok(Self::Attribute {
            path,
            pattern,
            split: split.map(|s| s.to_string()),
        })
    }

    pub(crate) fn apply(&self, attributes: &Value, result: &mut BTreeSet<String>) {
        match self {
            Self::Static(value) => {
                result.insert(value.clone());
            }
            Self::Attribute { path, pattern, split } => {
                let mut values = Vec::new();
                for node in path.query(attributes).all() {
                    flatten_value(node, &mut values);
                }

                if let Some(separator) = split {
                    values = values
                        .iter()
                        .flat_map(|v| v.split(separator.as_str()))
                        .map(|v| v.trim().to_string())
                        .filter(|v| !v.is_empty())
                        .collect();
                }

                for value in values {
                    match pattern {
                        Some(pattern) => {
                            if let Some(mapped) = apply_pattern(pattern, &value) {
                                result.insert(mapped);
                            }
                        }
                        None => {
                            result.insert(value);
                        }
                    }
                }
            }
        }
    }
}

/// Apply an anchored pattern; capture groups 1..N are concatenated.
/// A non-matching value or an empty concatenation yields no result.
fn apply_pattern(pattern: &Regex, value: &str) -> Option<String> {
    let captures = pattern.captures(value)?;

    if captures.len() < 2 {
        return None;
    }

    let mut result = String::new();
    for group in captures.iter().skip(1).flatten() {
        result.push_str(group.as_str());
    }

    if result.is_empty() { None } else { Some(result) }
}

/// Flatten a JSON value into strings, recursing into arrays. Scalar matches
/// thus behave like single-element lists.
fn flatten_value(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Number(n) => out.push(n.to_string()),
        Value::Bool(b) => out.push(b.to_string()),
        Value::Array(items) => {
            for item in items {
                flatten_value(item, out);
            }
        }
        Value::Null => {}
        Value::Object(_) => {
            debug!("Ignoring non-scalar value in user mapping: {}", value);
        }
    }
}

/// Mapping of one target attribute key to values from the credential tree.
#[derive(Debug)]
pub enum AttributeMapping {
    Static {
        key: String,
        value: Value,
    },
    FromAttribute {
        key: String,
        path: JsonPath,
    },
}

impl AttributeMapping {
    pub fn static_value(key: impl Into<String>, value: Value) -> Self {
        Self::Static {
            key: key.into(),
            value,
        }
    }

    pub fn from_attribute(key: impl Into<String>, json_path: &str) -> Result<Self, ConfigError> {
        let path = JsonPath::parse(json_path)
            .map_err(|e| ConfigError::invalid_value("attrs_from", format!("'{}': {}", json_path, e)))?;
        Ok(Self::FromAttribute {
            key: key.into(),
            path,
        })
    }

    fn apply(&self, attributes: &Value, result: &mut serde_json::Map<String, Value>) {
        match self {
            Self::Static { key, value } => {
                result.insert(key.clone(), value.clone());
            }
            Self::FromAttribute { key, path } => {
                // List semantics, also for scalar matches.
                let matches: Vec<Value> = path.query(attributes).all().into_iter().cloned().collect();
                if !matches.is_empty() {
                    result.insert(key.clone(), Value::Array(matches));
                }
            }
        }
    }
}

/// Compiled user mapping of one authentication domain.
///
/// An empty mapping is the direct mapping: credential name, backend roles
/// and attributes become the user verbatim.
#[derive(Debug, Default)]
pub struct UserMapping {
    user_name: Vec<MappingSource>,
    roles: Vec<MappingSource>,
    attrs: Vec<AttributeMapping>,
}

impl UserMapping {
    pub fn new(
        user_name: Vec<MappingSource>,
        roles: Vec<MappingSource>,
        attrs: Vec<AttributeMapping>,
    ) -> Self {
        Self {
            user_name,
            roles,
            attrs,
        }
    }

    /// The direct mapping, used when a domain configures no `user_mapping`.
    pub fn direct() -> Self {
        Self::default()
    }

    /// Apply the user-name rules to freshly extracted credentials.
    ///
    /// Runs before username-based acceptance rules, so skip/accept globs see
    /// the mapped name. Exactly one candidate name must result.
    pub fn map_credentials(&self, credentials: AuthCredentials) -> Result<AuthCredentials, AuthError> {
        if self.user_name.is_empty() {
            return Ok(credentials);
        }

        let tree = Value::Object(credentials.attributes().clone());
        let mut candidates = BTreeSet::new();
        for rule in &self.user_name {
            rule.apply(&tree, &mut candidates);
        }

        match candidates.len() {
            0 => Err(AuthError::credentials_invalid("No user name found by user mapping")),
            1 => {
                let name = candidates.into_iter().next().unwrap_or_default();
                debug!("Mapped user name: {}", name);
                Ok(credentials.rename(name))
            }
            _ => Err(AuthError::credentials_invalid(
                "More than one candidate for the user name was found by user mapping",
            )),
        }
    }

    /// Produce the terminal identity from backend-validated credentials.
    pub fn map(&self, credentials: &AuthCredentials, auth_domain_id: &str) -> Result<User, AuthError> {
        if !credentials.complete() {
            return Err(AuthError::credentials_invalid(
                "Credentials are incomplete and cannot produce a user",
            ));
        }

        let tree = Value::Object(credentials.attributes().clone());

        let roles = if self.roles.is_empty() {
            credentials.backend_roles().clone()
        } else {
            let mut roles = BTreeSet::new();
            for rule in &self.roles {
                rule.apply(&tree, &mut roles);
            }
            roles
        };

        let attributes = if self.attrs.is_empty() {
            credentials.attributes().clone()
        } else {
            let mut attributes = serde_json::Map::new();
            for rule in &self.attrs {
                rule.apply(&tree, &mut attributes);
            }
            attributes
        };

        Ok(User::new(credentials.name(), roles, attributes, auth_domain_id))
    }
}
