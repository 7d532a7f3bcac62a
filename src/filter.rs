//! Per-domain acceptance rules: IP/CIDR and username glob filters.
//!
//! Skip rules always take precedence over accept rules. IP rules are
//! resolved against the originating address when the direct peer is a
//! trusted proxy, otherwise against the direct address. Username rules can
//! only be evaluated after credential extraction; a late reject there is
//! "domain not applicable", not a credential failure.

use std::net::IpAddr;

use globset::{Glob, GlobSet, GlobSetBuilder};
use ipnet::IpNet;

use crate::error::ConfigError;
use crate::types::{AuthCredentials, RequestMetaData};

#[derive(Debug)]
pub struct AcceptanceRules {
    accept_ips: Vec<IpNet>,
    skip_ips: Vec<IpNet>,
    accept_users: Option<GlobSet>,
    skip_users: Option<GlobSet>,
}

impl AcceptanceRules {
    pub fn new(
        accept_ips: &[String],
        skip_ips: &[String],
        accept_users: &[String],
        skip_users: &[String],
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            accept_ips: parse_networks("accept_ips", accept_ips)?,
            skip_ips: parse_networks("skip_ips", skip_ips)?,
            accept_users: compile_globs("accept_users", accept_users)?,
            skip_users: compile_globs("skip_users", skip_users)?,
        })
    }

    /// Rules that accept everything.
    pub fn pass_all() -> Self {
        Self {
            accept_ips: Vec::new(),
            skip_ips: Vec::new(),
            accept_users: None,
            skip_users: None,
        }
    }

    /// Evaluate the IP-based rules against the request.
    pub fn accept_request(&self, request: &RequestMetaData) -> bool {
        let ip = self.effective_ip(request);

        if self.skip_ips.iter().any(|net| net.contains(&ip)) {
            return false;
        }

        if !self.accept_ips.is_empty() && !self.accept_ips.iter().any(|net| net.contains(&ip)) {
            return false;
        }

        true
    }

    /// Evaluate the username-based rules against extracted credentials.
    pub fn accept_credentials(&self, credentials: &AuthCredentials) -> bool {
        if let Some(skip) = &self.skip_users
            && skip.is_match(credentials.name())
        {
            return false;
        }

        if let Some(accept) = &self.accept_users
            && !accept.is_match(credentials.name())
        {
            return false;
        }

        true
    }

    fn effective_ip(&self, request: &RequestMetaData) -> IpAddr {
        if request.trusted_proxy() {
            request.originating_ip_address()
        } else {
            request.direct_ip_address()
        }
    }
}

/// Parse CIDR specs; a bare address is treated as a host network.
pub(crate) fn parse_networks(attribute: &str, specs: &[String]) -> Result<Vec<IpNet>, ConfigError> {
    let mut result = Vec::with_capacity(specs.len());

    for spec in specs {
        let net = if spec.contains('/') {
            spec.parse::<IpNet>()
                .map_err(|e| ConfigError::invalid_value(attribute, format!("'{}': {}", spec, e)))?
        } else {
            let addr = spec
                .parse::<IpAddr>()
                .map_err(|e| ConfigError::invalid_value(attribute, format!("'{}': {}", spec, e)))?;
            IpNet::from(addr)
        };
        result.push(net);
    }

    Ok(result)
}

fn compile_globs(attribute: &str, patterns: &[String]) -> Result<Option<GlobSet>, ConfigError> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| ConfigError::invalid_value(attribute, format!("'{}': {}", pattern, e)))?;
        builder.add(glob);
    }

    builder
        .build()
        .map(Some)
        .map_err(|e| ConfigError::invalid_value(attribute, e.to_string()))
}
