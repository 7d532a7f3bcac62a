//! Client certificate frontend.
//!
//! Works on the subject DN of a peer certificate the TLS layer has already
//! verified; no certificate validation happens here. The DN is parsed per
//! RFC 2253 into an attribute-name to value-list map and exposed as a
//! structured credential attribute.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::error::AuthError;
use crate::frontend::AuthenticationFrontend;
use crate::types::{AuthCredentials, RequestMetaData};

#[derive(Debug, Clone, Deserialize)]
pub struct ClientCertFrontendConfig {
    /// DN attribute providing the user name.
    #[serde(default = "default_username_attribute")]
    pub username_attribute: String,
    /// Optional DN attribute providing backend roles.
    #[serde(default)]
    pub roles_attribute: Option<String>,
}

fn default_username_attribute() -> String {
    "cn".to_string()
}

impl Default for ClientCertFrontendConfig {
    fn default() -> Self {
        Self {
            username_attribute: default_username_attribute(),
            roles_attribute: None,
        }
    }
}

pub struct ClientCertFrontend {
    username_attribute: String,
    roles_attribute: Option<String>,
}

impl ClientCertFrontend {
    pub fn new(config: &ClientCertFrontendConfig) -> Self {
        Self {
            username_attribute: config.username_attribute.to_ascii_lowercase(),
            roles_attribute: config
                .roles_attribute
                .as_ref()
                .map(|a| a.to_ascii_lowercase()),
        }
    }
}

#[async_trait]
impl AuthenticationFrontend for ClientCertFrontend {
    fn frontend_type(&self) -> &'static str {
        "clientcert"
    }

    async fn extract_credentials(
        &self,
        request: &RequestMetaData,
    ) -> Result<Option<AuthCredentials>, AuthError> {
        let Some(subject) = request.client_cert_subject() else {
            return Ok(None);
        };

        let parsed = match parse_dn(subject) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Malformed client certificate subject DN {:?}: {}", subject, e);
                return Ok(None);
            }
        };

        let mut by_attribute: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in &parsed {
            by_attribute
                .entry(name.to_ascii_lowercase())
                .or_default()
                .push(value.clone());
        }

        let Some(user_name) = by_attribute
            .get(&self.username_attribute)
            .and_then(|values| values.first())
            .cloned()
        else {
            warn!(
                "Client certificate subject {:?} has no '{}' attribute",
                subject, self.username_attribute
            );
            return Ok(None);
        };

        let roles = self
            .roles_attribute
            .as_ref()
            .and_then(|attribute| by_attribute.get(attribute))
            .cloned()
            .unwrap_or_default();

        let subject_tree: serde_json::Map<String, serde_json::Value> = by_attribute
            .into_iter()
            .map(|(name, values)| (name, serde_json::json!(values)))
            .collect();

        Ok(Some(
            AuthCredentials::new(user_name, "clientcert")
                .with_backend_roles(roles)
                .with_attribute("dn", serde_json::json!(subject))
                .with_attribute("subject", serde_json::Value::Object(subject_tree))
                .mark_complete(),
        ))
    }
}

/// Error produced by `parse_dn` for input that is not a valid RFC 2253 DN.
#[derive(Debug, Clone, PartialEq)]
pub struct DnParseError {
    message: String,
}

impl DnParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for DnParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DnParseError {}

/// Parse an RFC 2253 distinguished name into ordered (attribute, value)
/// pairs. Multi-valued RDNs (joined by `+`) contribute one pair per value.
pub fn parse_dn(dn: &str) -> Result<Vec<(String, String)>, DnParseError> {
    let mut result = Vec::new();
    let mut chars = dn.chars().peekable();

    loop {
        // Attribute name, up to '='.
        let mut name = String::new();
        let mut saw_equals = false;
        for c in chars.by_ref() {
            match c {
                '=' => {
                    saw_equals = true;
                    break;
                }
                ',' | '+' => {
                    return Err(DnParseError::new(format!(
                        "Attribute '{}' has no value",
                        name.trim()
                    )));
                }
                c => name.push(c),
            }
        }

        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(DnParseError::new("Empty attribute name"));
        }
        if !saw_equals {
            return Err(DnParseError::new(format!(
                "No '=' in relative distinguished name '{}'",
                name
            )));
        }

        // Attribute value, up to an unescaped ',' or '+'. Hex escapes encode
        // raw bytes of the UTF-8 value, so the value is assembled as bytes
        // and decoded once complete.
        let mut value: Vec<u8> = Vec::new();
        let mut terminator = None;
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(escaped) if escaped.is_ascii_hexdigit() => {
                        // Hex escape: backslash followed by two hex digits.
                        let second = chars
                            .next()
                            .filter(|c| c.is_ascii_hexdigit())
                            .ok_or_else(|| DnParseError::new("Invalid hex escape"))?;
                        let byte = u8::from_str_radix(&format!("{}{}", escaped, second), 16)
                            .map_err(|_| DnParseError::new("Invalid hex escape"))?;
                        value.push(byte);
                    }
                    Some(escaped) => {
                        let mut buf = [0u8; 4];
                        value.extend_from_slice(escaped.encode_utf8(&mut buf).as_bytes());
                    }
                    None => return Err(DnParseError::new("Trailing escape character")),
                },
                ',' | '+' => {
                    terminator = Some(c);
                    break;
                }
                c => {
                    let mut buf = [0u8; 4];
                    value.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }

        let value = String::from_utf8(value)
            .map_err(|_| DnParseError::new("Hex escapes do not form valid UTF-8"))?;
        result.push((name, value.trim().to_string()));

        match terminator {
            Some(_) => {
                if chars.peek().is_none() {
                    return Err(DnParseError::new("Trailing RDN separator"));
                }
            }
            None => return Ok(result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frontend() -> ClientCertFrontend {
        ClientCertFrontend::new(&ClientCertFrontendConfig::default())
    }

    fn request_with_subject(subject: &str) -> RequestMetaData {
        RequestMetaData::builder("127.0.0.1".parse().unwrap())
            .client_cert_subject(subject)
            .build(&[])
    }

    #[test]
    fn test_parse_simple_dn() {
        let parsed = parse_dn("CN=John Doe,OU=People,DC=example,DC=com").unwrap();
        assert_eq!(
            parsed,
            vec![
                ("CN".to_string(), "John Doe".to_string()),
                ("OU".to_string(), "People".to_string()),
                ("DC".to_string(), "example".to_string()),
                ("DC".to_string(), "com".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_dn_with_escaped_comma() {
        let parsed = parse_dn("CN=Doe\\, John,OU=People").unwrap();
        assert_eq!(parsed[0], ("CN".to_string(), "Doe, John".to_string()));
    }

    #[test]
    fn test_parse_dn_with_hex_escape() {
        let parsed = parse_dn("CN=Space\\20Name").unwrap();
        assert_eq!(parsed[0].1, "Space Name");
    }

    #[test]
    fn test_parse_dn_multi_valued_rdn() {
        let parsed = parse_dn("OU=a+O=b,DC=example").unwrap();
        assert_eq!(
            parsed,
            vec![
                ("OU".to_string(), "a".to_string()),
                ("O".to_string(), "b".to_string()),
                ("DC".to_string(), "example".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_dn_hex_escaped_utf8_value() {
        // C3 A9 is the UTF-8 encoding of 'é'.
        let parsed = parse_dn("CN=Ren\\C3\\A9,DC=example").unwrap();
        assert_eq!(parsed[0], ("CN".to_string(), "René".to_string()));
    }

    #[test]
    fn test_parse_dn_rejects_malformed_input() {
        assert!(parse_dn("no-equals-sign").is_err());
        assert!(parse_dn("CN=x,junk,DC=y").is_err());
        assert!(parse_dn("CN=trailing\\").is_err());
        assert!(parse_dn("CN=x,").is_err());
    }

    #[test]
    fn test_parse_dn_rejects_trailing_rdn_without_equals() {
        assert!(parse_dn("CN=x,junk").is_err());
        assert!(parse_dn("CN=x,OU=y,junk").is_err());
    }

    #[test]
    fn test_parse_dn_rejects_invalid_utf8_hex_escapes() {
        assert!(parse_dn("CN=\\FF").is_err());
    }

    #[tokio::test]
    async fn test_extracts_user_from_cn() {
        let request = request_with_subject("CN=alice,OU=People,DC=example,DC=com");
        let credentials = frontend()
            .extract_credentials(&request)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(credentials.name(), "alice");
        assert!(credentials.complete());
        assert_eq!(
            credentials.attributes()["subject"]["dc"],
            serde_json::json!(["example", "com"])
        );
        assert_eq!(
            credentials.attributes()["dn"],
            serde_json::json!("CN=alice,OU=People,DC=example,DC=com")
        );
    }

    #[tokio::test]
    async fn test_roles_from_configured_attribute() {
        let frontend = ClientCertFrontend::new(&ClientCertFrontendConfig {
            username_attribute: "cn".to_string(),
            roles_attribute: Some("ou".to_string()),
        });
        let request = request_with_subject("CN=alice,OU=ops,OU=eng");

        let credentials = frontend
            .extract_credentials(&request)
            .await
            .unwrap()
            .unwrap();
        assert!(credentials.backend_roles().contains("ops"));
        assert!(credentials.backend_roles().contains("eng"));
    }

    #[tokio::test]
    async fn test_malformed_dn_yields_none() {
        let request = request_with_subject("###");
        assert!(frontend().extract_credentials(&request).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_certificate_yields_none() {
        let request = RequestMetaData::builder("127.0.0.1".parse().unwrap()).build(&[]);
        assert!(frontend().extract_credentials(&request).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_username_attribute_yields_none() {
        let request = request_with_subject("OU=People,DC=example");
        assert!(frontend().extract_credentials(&request).await.unwrap().is_none());
    }
}
