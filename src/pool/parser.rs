//! Proxy identity and raw-line parsing
//!
//! Turns `host:port:username:password` into a proxy record whose id is a
//! pure function of host and port.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{PoolError, Result};
use crate::models::{Endpoint, Proxy, ProxyLimits, ProxyMetadata};

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Canonical id of the proxy listening on `host:port`
pub fn proxy_id(host: &str, port: u16) -> String {
    let key = format!("{}:{}", host.to_ascii_lowercase(), port);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

/// Reject limits outside the ranges the usage tracker and selector assume
pub fn validate_limits(limits: &ProxyLimits) -> Result<()> {
    if limits.max_concurrent_usage < 1 {
        return Err(PoolError::validation(
            "max_concurrent_usage",
            "must be at least 1",
        ));
    }
    if limits.requests_per_minute_limit < 1 {
        return Err(PoolError::validation(
            "requests_per_minute_limit",
            "must be at least 1",
        ));
    }
    if !(0..=10).contains(&limits.rotation_weight) {
        return Err(PoolError::validation(
            "rotation_weight",
            "must be between 0 and 10",
        ));
    }
    Ok(())
}

/// Parser for raw `host:port:username:password` lines
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyParser {
    allow_hostnames: bool,
}

impl ProxyParser {
    pub fn new(allow_hostnames: bool) -> Self {
        Self { allow_hostnames }
    }

    /// Parse and validate a single `host:port:username:password` line
    pub fn parse_endpoint(&self, raw: &str) -> Result<Endpoint> {
        let line = raw.trim();
        if line.is_empty() {
            return Err(PoolError::validation("format", "empty proxy line"));
        }

        let parts: Vec<&str> = line.split(':').collect();
        let [host, port, username, password] = parts.as_slice() else {
            return Err(PoolError::validation(
                "format",
                format!(
                    "expected host:port:username:password, got {} field(s)",
                    parts.len()
                ),
            ));
        };

        self.validate_host(host)?;
        let port = parse_port(port)?;

        if username.is_empty() {
            return Err(PoolError::validation("username", "must not be empty"));
        }
        if password.is_empty() {
            return Err(PoolError::validation("password", "must not be empty"));
        }

        Ok(Endpoint {
            host: host.to_ascii_lowercase(),
            port,
            username: username.to_string(),
            password: password.to_string(),
            raw: line.to_string(),
        })
    }

    /// Parse a line into a fresh proxy record
    pub fn parse(
        &self,
        raw: &str,
        metadata: ProxyMetadata,
        limits: ProxyLimits,
        now: DateTime<Utc>,
    ) -> Result<Proxy> {
        let endpoint = self.parse_endpoint(raw)?;
        validate_limits(&limits)?;

        let id = proxy_id(&endpoint.host, endpoint.port);
        let mut proxy = Proxy::new(id, endpoint, limits, now);
        proxy.metadata = metadata;
        Ok(proxy)
    }

    fn validate_host(&self, host: &str) -> Result<()> {
        if host.is_empty() {
            return Err(PoolError::validation("host", "must not be empty"));
        }
        if host.parse::<Ipv4Addr>().is_ok() {
            return Ok(());
        }
        if !self.allow_hostnames {
            return Err(PoolError::validation(
                "host",
                format!("{} is not a valid IPv4 address", host),
            ));
        }
        if is_valid_hostname(host) {
            Ok(())
        } else {
            Err(PoolError::validation(
                "host",
                format!("{} is not a valid IPv4 address or hostname", host),
            ))
        }
    }
}

fn parse_port(port: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(PoolError::validation(
            "port",
            format!("{} is not in 1-65535", port),
        )),
        Ok(p) => Ok(p),
    }
}

fn is_valid_hostname(host: &str) -> bool {
    if host.len() > MAX_HOSTNAME_LEN {
        return false;
    }

    let labels: Vec<&str> = host.split('.').collect();

    // Dotted digits that failed IPv4 parsing are a malformed address, not a name.
    if labels
        .iter()
        .all(|l| !l.is_empty() && l.chars().all(|c| c.is_ascii_digit()))
    {
        return false;
    }

    labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}
