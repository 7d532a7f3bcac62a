//! LDAP bind-and-search backend with a pooled connection manager.
//!
//! Authentication searches for the user entry across one or more ordered
//! base DNs with an escaped, parametrized filter, then binds with the
//! supplied password. Connection and timeout failures are unavailable;
//! failed binds are credentials-invalid. With fake login enabled, a missing
//! user still triggers a bind against a synthesized DN so that user
//! enumeration by response timing stays infeasible.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, Scope, SearchEntry, ldap_escape};
use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::backend::{AuthenticationBackend, UserCachingPolicy};
use crate::error::{AuthError, ConfigError};
use crate::types::AuthCredentials;

const USER_NAME_PLACEHOLDER: &str = "{user.name}";

#[derive(Debug, Clone, Deserialize)]
pub struct LdapBackendConfig {
    /// LDAP URLs tried in order on connect failure, rotated round-robin.
    pub hosts: Vec<String>,
    /// Manager identity used for searching. Unset means anonymous.
    #[serde(default)]
    pub bind_dn: Option<String>,
    #[serde(default)]
    pub bind_password: Option<String>,
    pub user_search: LdapUserSearchConfig,
    /// Entry attribute providing the final user name. Unset or `"dn"`
    /// selects the entry DN.
    #[serde(default)]
    pub user_name_attribute: Option<String>,
    /// Entry attributes copied into the identity. Empty copies none.
    #[serde(default)]
    pub attributes: Vec<String>,
    /// Attribute values longer than this are dropped.
    #[serde(default = "default_max_attribute_value_length")]
    pub max_attribute_value_length: usize,
    #[serde(default)]
    pub fake_login: FakeLoginConfig,
    #[serde(default)]
    pub pool: LdapPoolConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LdapUserSearchConfig {
    /// Base DNs searched in order.
    pub base_dns: Vec<String>,
    /// Search filter; `{user.name}` is substituted with the escaped name.
    #[serde(default = "default_search_filter")]
    pub filter: String,
    /// Search every base and require a single hit overall, instead of
    /// stopping at the first base that yields one.
    #[serde(default)]
    pub search_all_bases: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FakeLoginConfig {
    #[serde(default)]
    pub enabled: bool,
    /// DN for the fake bind. Unset synthesizes a non-existent one.
    #[serde(default)]
    pub dn: Option<String>,
    #[serde(default = "default_fake_login_password")]
    pub password: String,
}

impl Default for FakeLoginConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dn: None,
            password: default_fake_login_password(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LdapPoolConfig {
    /// Idle connections retained across requests.
    #[serde(default = "default_min_idle_connections")]
    pub min_idle_connections: usize,
    /// Upper bound on concurrently leased connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub exhaustion_policy: ExhaustionPolicy,
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_response_timeout_seconds")]
    pub response_timeout_seconds: u64,
}

impl Default for LdapPoolConfig {
    fn default() -> Self {
        Self {
            min_idle_connections: default_min_idle_connections(),
            max_connections: default_max_connections(),
            exhaustion_policy: ExhaustionPolicy::default(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
            response_timeout_seconds: default_response_timeout_seconds(),
        }
    }
}

/// What happens when all pooled connections are leased.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Wait for a leased connection to be returned.
    #[default]
    Block,
    /// Open an extra, unpooled connection that is closed after use.
    CreateOnDemand,
}

fn default_search_filter() -> String {
    "(uid={user.name})".to_string()
}

fn default_fake_login_password() -> String {
    "fakeLoginPwd123".to_string()
}

fn default_max_attribute_value_length() -> usize {
    4096
}

fn default_min_idle_connections() -> usize {
    3
}

fn default_max_connections() -> usize {
    10
}

fn default_connect_timeout_seconds() -> u64 {
    5
}

fn default_response_timeout_seconds() -> u64 {
    10
}

/// One leased connection. Dropping it closes the connection and frees the
/// pool slot; only an explicit release through the manager returns it to
/// the idle set.
struct PooledLdapConnection {
    ldap: Ldap,
    // None for unpooled create-on-demand connections.
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledLdapConnection {
    fn handle(&mut self) -> &mut Ldap {
        &mut self.ldap
    }
}

/// Bounded, failover-capable connection pool for one backend configuration.
struct LdapConnectionManager {
    hosts: Vec<String>,
    next_host: AtomicUsize,
    bind_dn: Option<String>,
    bind_password: Option<String>,
    connect_timeout: Duration,
    response_timeout: Duration,
    min_idle_connections: usize,
    exhaustion_policy: ExhaustionPolicy,
    idle: StdMutex<Vec<Ldap>>,
    permits: Arc<Semaphore>,
}

impl LdapConnectionManager {
    fn new(config: &LdapBackendConfig) -> Self {
        Self {
            hosts: config.hosts.clone(),
            next_host: AtomicUsize::new(0),
            bind_dn: config.bind_dn.clone(),
            bind_password: config.bind_password.clone(),
            connect_timeout: Duration::from_secs(config.pool.connect_timeout_seconds),
            response_timeout: Duration::from_secs(config.pool.response_timeout_seconds),
            min_idle_connections: config.pool.min_idle_connections,
            exhaustion_policy: config.pool.exhaustion_policy,
            idle: StdMutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(config.pool.max_connections)),
        }
    }

    /// Lease a connection bound to the manager identity.
    async fn acquire(&self) -> Result<PooledLdapConnection, AuthError> {
        let permit = match self.exhaustion_policy {
            ExhaustionPolicy::Block => Some(
                self.permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| AuthError::unavailable("LDAP connection pool is closed"))?,
            ),
            ExhaustionPolicy::CreateOnDemand => self.permits.clone().try_acquire_owned().ok(),
        };

        if permit.is_some()
            && let Some(ldap) = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop()
        {
            return Ok(PooledLdapConnection { ldap, permit });
        }

        let ldap = self.connect().await?;
        Ok(PooledLdapConnection { ldap, permit })
    }

    /// Connect to the first reachable host, starting at the round-robin
    /// cursor, and bind the manager identity.
    async fn connect(&self) -> Result<Ldap, AuthError> {
        let start = self.next_host.fetch_add(1, Ordering::Relaxed);
        let mut last_error = None;

        for offset in 0..self.hosts.len() {
            let host = &self.hosts[(start + offset) % self.hosts.len()];
            let settings = LdapConnSettings::new().set_conn_timeout(self.connect_timeout);

            match LdapConnAsync::with_settings(settings, host).await {
                Ok((conn, mut ldap)) => {
                    ldap3::drive!(conn);
                    self.bind_manager(&mut ldap).await?;
                    debug!("Connected to LDAP host {}", host);
                    return Ok(ldap);
                }
                Err(e) => {
                    warn!("Failed to connect to LDAP host {}: {}", host, e);
                    last_error = Some(e);
                }
            }
        }

        Err(AuthError::unavailable(format!(
            "No LDAP host reachable: {}",
            last_error.map(|e| e.to_string()).unwrap_or_else(|| "no hosts configured".to_string())
        )))
    }

    /// Bind the configured manager identity, or reset to anonymous.
    async fn bind_manager(&self, ldap: &mut Ldap) -> Result<(), AuthError> {
        let (dn, password) = match (&self.bind_dn, &self.bind_password) {
            (Some(dn), Some(password)) => (dn.as_str(), password.as_str()),
            _ => ("", ""),
        };

        let result = ldap
            .with_timeout(self.response_timeout)
            .simple_bind(dn, password)
            .await
            .map_err(|e| AuthError::unavailable(format!("LDAP manager bind failed: {}", e)))?;

        if result.rc != 0 {
            return Err(AuthError::unavailable(format!(
                "LDAP manager bind rejected (rc {})",
                result.rc
            )));
        }

        Ok(())
    }

    /// Return a connection to the idle set, restoring the manager identity
    /// first. A connection that cannot be rebound is closed instead.
    async fn release(&self, mut conn: PooledLdapConnection) {
        if conn.permit.is_none() {
            return;
        }

        if self.bind_manager(&mut conn.ldap).await.is_err() {
            debug!("Discarding LDAP connection that failed rebind");
            return;
        }

        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.min_idle_connections {
            idle.push(conn.ldap);
        }
        // The permit drops here, freeing the pool slot.
    }
}

pub struct LdapBackend {
    manager: LdapConnectionManager,
    user_search: LdapUserSearchConfig,
    user_name_attribute: Option<String>,
    attributes: Vec<String>,
    max_attribute_value_length: usize,
    fake_login: FakeLoginConfig,
    response_timeout: Duration,
}

impl LdapBackend {
    pub fn new(config: &LdapBackendConfig) -> Result<Self, ConfigError> {
        if config.hosts.is_empty() {
            return Err(ConfigError::missing("ldap.hosts"));
        }
        if config.user_search.base_dns.is_empty() {
            return Err(ConfigError::missing("ldap.user_search.base_dns"));
        }
        if !config.user_search.filter.contains(USER_NAME_PLACEHOLDER) {
            return Err(ConfigError::invalid_value(
                "ldap.user_search.filter",
                format!("Filter must contain the {} placeholder", USER_NAME_PLACEHOLDER),
            ));
        }

        Ok(Self {
            manager: LdapConnectionManager::new(config),
            user_search: config.user_search.clone(),
            user_name_attribute: config.user_name_attribute.clone(),
            attributes: config.attributes.clone(),
            max_attribute_value_length: config.max_attribute_value_length,
            fake_login: config.fake_login.clone(),
            response_timeout: Duration::from_secs(config.pool.response_timeout_seconds),
        })
    }

    /// Attributes requested from the directory.
    fn requested_attributes(&self) -> Vec<&str> {
        let mut requested: Vec<&str> = self.attributes.iter().map(|a| a.as_str()).collect();
        if let Some(attribute) = &self.user_name_attribute
            && attribute != "dn"
        {
            requested.push(attribute);
        }
        if requested.is_empty() {
            // Request no attributes at all, the DN suffices.
            requested.push("1.1");
        }
        requested
    }

    /// Search for the user entry across the configured bases.
    async fn find_user(
        &self,
        conn: &mut PooledLdapConnection,
        user_name: &str,
    ) -> Result<Option<SearchEntry>, AuthError> {
        let filter = substitute_filter(&self.user_search.filter, user_name);
        let requested = self.requested_attributes();
        let mut found: Vec<SearchEntry> = Vec::new();

        for base_dn in &self.user_search.base_dns {
            let search = conn
                .handle()
                .with_timeout(self.response_timeout)
                .search(base_dn, Scope::Subtree, &filter, &requested)
                .await
                .map_err(|e| AuthError::unavailable(format!("LDAP search failed: {}", e)))?;
            let (entries, _) = search
                .success()
                .map_err(|e| AuthError::unavailable(format!("LDAP search rejected: {}", e)))?;

            for entry in entries {
                let entry = SearchEntry::construct(entry);
                if !found.iter().any(|e| e.dn == entry.dn) {
                    found.push(entry);
                }
            }

            if !found.is_empty() && !self.user_search.search_all_bases {
                break;
            }
        }

        match found.len() {
            0 => Ok(None),
            1 => Ok(found.pop()),
            n => {
                debug!("LDAP search for user matched {} distinct entries", n);
                Err(AuthError::credentials_invalid(
                    "Ambiguous user entry: the search matched more than one directory entry",
                ))
            }
        }
    }

    /// Bind against a DN that cannot exist, so that "no such user" takes as
    /// long as "wrong password".
    async fn fake_bind(&self, conn: &mut PooledLdapConnection, user_name: &str) {
        let dn = self.fake_login.dn.clone().unwrap_or_else(|| {
            format!("uid={},dc=fake-login,dc=invalid", ldap_escape(user_name))
        });

        let outcome = conn
            .handle()
            .with_timeout(self.response_timeout)
            .simple_bind(&dn, &self.fake_login.password)
            .await;
        if let Err(e) = outcome {
            debug!("Fake login bind errored: {}", e);
        }
    }

    /// Bind the user entry with the supplied password.
    async fn bind_user(
        &self,
        conn: &mut PooledLdapConnection,
        dn: &str,
        password: &str,
    ) -> Result<(), AuthError> {
        let result = conn
            .handle()
            .with_timeout(self.response_timeout)
            .simple_bind(dn, password)
            .await
            .map_err(|e| AuthError::unavailable(format!("LDAP bind failed: {}", e)))?;

        match result.rc {
            0 => Ok(()),
            // 49: invalidCredentials
            49 => Err(AuthError::credentials_invalid("Invalid password")),
            rc => Err(AuthError::unavailable(format!("LDAP bind rejected (rc {})", rc))),
        }
    }

    /// Copy whitelisted, length-capped entry attributes into the identity.
    fn entry_attributes(&self, entry: &SearchEntry) -> serde_json::Map<String, serde_json::Value> {
        let mut attributes = serde_json::Map::new();
        attributes.insert("ldap.dn".to_string(), serde_json::json!(entry.dn));

        let whitelist: BTreeMap<String, &String> = self
            .attributes
            .iter()
            .map(|a| (a.to_ascii_lowercase(), a))
            .collect();

        for (name, values) in &entry.attrs {
            let Some(key) = whitelist.get(&name.to_ascii_lowercase()) else {
                continue;
            };

            let values: Vec<&String> = values
                .iter()
                .filter(|v| {
                    if v.len() > self.max_attribute_value_length {
                        debug!("Dropping oversized value of LDAP attribute {}", name);
                        return false;
                    }
                    true
                })
                .collect();

            attributes.insert((*key).clone(), serde_json::json!(values));
        }

        attributes
    }
}

#[async_trait]
impl AuthenticationBackend for LdapBackend {
    fn backend_type(&self) -> &'static str {
        "ldap"
    }

    async fn authenticate(&self, credentials: AuthCredentials) -> Result<AuthCredentials, AuthError> {
        // Borrowed from the credentials' zeroizing buffer; never copied out.
        let password = extract_password(&credentials)?;
        let user_name = credentials.name().to_string();

        let mut conn = self.manager.acquire().await?;

        let entry = match self.find_user(&mut conn, &user_name).await {
            Ok(entry) => entry,
            Err(e) => {
                self.manager.release(conn).await;
                return Err(e);
            }
        };

        let Some(entry) = entry else {
            if self.fake_login.enabled {
                self.fake_bind(&mut conn, &user_name).await;
                self.manager.release(conn).await;
                return Err(AuthError::credentials_invalid("Invalid password"));
            }
            self.manager.release(conn).await;
            return Err(AuthError::credentials_invalid(format!(
                "No such user: {}",
                user_name
            )));
        };

        if let Err(e) = self.bind_user(&mut conn, &entry.dn, password).await {
            self.manager.release(conn).await;
            return Err(e);
        }

        self.manager.release(conn).await;

        let name = match &self.user_name_attribute {
            Some(attribute) if attribute != "dn" => entry
                .attrs
                .get(attribute)
                .and_then(|values| values.first())
                .cloned()
                .unwrap_or_else(|| entry.dn.clone()),
            _ => entry.dn.clone(),
        };

        debug!("LDAP authentication succeeded for {}", name);

        Ok(credentials
            .rename(name)
            .with_attributes(self.entry_attributes(&entry)))
    }

    fn user_caching_policy(&self) -> UserCachingPolicy {
        UserCachingPolicy::OnlyIfAuthzSeparate
    }
}

/// The UTF-8 password of the credentials. Empty or missing passwords are
/// rejected here; an empty LDAP bind would succeed as an anonymous bind.
fn extract_password(credentials: &AuthCredentials) -> Result<&str, AuthError> {
    let password = credentials
        .password()
        .ok_or_else(|| AuthError::credentials_invalid("No password given"))?;

    if password.is_empty() {
        return Err(AuthError::credentials_invalid("Empty password"));
    }

    std::str::from_utf8(password)
        .map_err(|_| AuthError::credentials_invalid("Password is not valid UTF-8"))
}

/// Substitute the user-name placeholder with the escaped value.
fn substitute_filter(filter: &str, user_name: &str) -> String {
    filter.replace(USER_NAME_PLACEHOLDER, &ldap_escape(user_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config() -> LdapBackendConfig {
        serde_json::from_value(serde_json::json!({
            "hosts": ["ldap://localhost:3890"],
            "user_search": {"base_dns": ["ou=people,dc=example,dc=com"]}
        }))
        .unwrap()
    }

    fn entry(dn: &str, attrs: &[(&str, &[&str])]) -> SearchEntry {
        SearchEntry {
            dn: dn.to_string(),
            attrs: attrs
                .iter()
                .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
                .collect(),
            bin_attrs: HashMap::new(),
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = config();
        assert_eq!(config.user_search.filter, "(uid={user.name})");
        assert!(!config.user_search.search_all_bases);
        assert_eq!(config.pool.min_idle_connections, 3);
        assert_eq!(config.pool.max_connections, 10);
        assert_eq!(config.pool.exhaustion_policy, ExhaustionPolicy::Block);
        assert!(!config.fake_login.enabled);
        assert_eq!(config.fake_login.password, "fakeLoginPwd123");
    }

    #[test]
    fn test_exhaustion_policy_deserialization() {
        let pool: LdapPoolConfig =
            serde_json::from_value(serde_json::json!({"exhaustion_policy": "create_on_demand"}))
                .unwrap();
        assert_eq!(pool.exhaustion_policy, ExhaustionPolicy::CreateOnDemand);
    }

    #[test]
    fn test_filter_substitution_escapes_injection() {
        let filter = substitute_filter("(uid={user.name})", "alice)(objectClass=*");
        assert_eq!(filter, "(uid=alice\\29\\28objectClass=\\2a)");
    }

    #[test]
    fn test_filter_substitution_plain_name() {
        assert_eq!(
            substitute_filter("(&(uid={user.name})(objectClass=person))", "alice"),
            "(&(uid=alice)(objectClass=person))"
        );
    }

    #[test]
    fn test_missing_placeholder_is_a_config_error() {
        let mut config = config();
        config.user_search.filter = "(uid=alice)".to_string();
        assert!(LdapBackend::new(&config).is_err());
    }

    #[test]
    fn test_empty_host_list_is_a_config_error() {
        let mut config = config();
        config.hosts.clear();
        assert!(LdapBackend::new(&config).is_err());
    }

    #[test]
    fn test_empty_password_is_rejected_before_any_bind() {
        let credentials = AuthCredentials::new("alice", "basic").with_password(Vec::new());
        let err = extract_password(&credentials).unwrap_err();
        assert!(!err.is_unavailable());
    }

    #[test]
    fn test_missing_password_is_rejected() {
        let credentials = AuthCredentials::new("alice", "basic");
        assert!(extract_password(&credentials).is_err());
    }

    #[test]
    fn test_extracted_password_borrows_the_zeroizing_buffer() {
        let credentials = AuthCredentials::new("alice", "basic").with_password(b"s3cret".to_vec());

        let password = extract_password(&credentials).unwrap();
        assert_eq!(password, "s3cret");
        // Same allocation as the credentials' own buffer: no plain-text copy
        // survives the zeroing in clear_secrets.
        assert_eq!(
            password.as_ptr(),
            credentials.password().unwrap().as_ptr()
        );
    }

    #[test]
    fn test_entry_attributes_respect_whitelist() {
        let mut config = config();
        config.attributes = vec!["mail".to_string(), "departmentNumber".to_string()];
        let backend = LdapBackend::new(&config).unwrap();

        let entry = entry(
            "uid=alice,ou=people,dc=example,dc=com",
            &[
                ("mail", &["alice@example.com"]),
                ("userPassword", &["{SSHA}never"]),
                ("departmentnumber", &["42"]),
            ],
        );

        let attributes = backend.entry_attributes(&entry);
        assert_eq!(attributes["mail"], serde_json::json!(["alice@example.com"]));
        assert_eq!(attributes["departmentNumber"], serde_json::json!(["42"]));
        assert_eq!(
            attributes["ldap.dn"],
            serde_json::json!("uid=alice,ou=people,dc=example,dc=com")
        );
        assert!(attributes.get("userPassword").is_none());
    }

    #[test]
    fn test_entry_attributes_drop_oversized_values() {
        let mut config = config();
        config.attributes = vec!["description".to_string()];
        config.max_attribute_value_length = 8;
        let backend = LdapBackend::new(&config).unwrap();

        let entry = entry(
            "uid=alice,ou=people,dc=example,dc=com",
            &[("description", &["short", "far-too-long-to-keep"])],
        );

        let attributes = backend.entry_attributes(&entry);
        assert_eq!(attributes["description"], serde_json::json!(["short"]));
    }

    #[test]
    fn test_requested_attributes_include_user_name_attribute() {
        let mut config = config();
        config.user_name_attribute = Some("sAMAccountName".to_string());
        config.attributes = vec!["mail".to_string()];
        let backend = LdapBackend::new(&config).unwrap();

        let requested = backend.requested_attributes();
        assert!(requested.contains(&"mail"));
        assert!(requested.contains(&"sAMAccountName"));
    }

    #[test]
    fn test_requested_attributes_empty_whitelist_requests_none() {
        let backend = LdapBackend::new(&config()).unwrap();
        assert_eq!(backend.requested_attributes(), vec!["1.1"]);
    }

    #[test]
    fn test_caching_policy_requires_separate_authz_declaration() {
        let backend = LdapBackend::new(&config()).unwrap();
        assert_eq!(
            backend.user_caching_policy(),
            UserCachingPolicy::OnlyIfAuthzSeparate
        );
    }
}
