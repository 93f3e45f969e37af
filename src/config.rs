//! Configuration for the resolver.
//!
//! This module defines the configuration structure and methods to load
//! configuration from environment variables.

use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use crate::errors::DnsError;
use crate::hints;

/// Maximum delegation hops followed during one resolution.
pub const DEFAULT_HOP_LIMIT: u32 = 16;

/// Query attempts against the same server before advancing to the next.
pub const DEFAULT_RETRY_BUDGET: u32 = 2;

/// Per-hop upstream query timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Maximum size of DNS packets in bytes.
pub const MAX_PACKET_SIZE: usize = 4096;

/// Standard DNS port used for upstream servers.
pub const DNS_PORT: u16 = 53;

/// Resolver configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Address to bind the UDP listener to.
    pub bind_addr: SocketAddr,

    /// Maximum number of delegation hops per resolution.
    pub hop_limit: u32,

    /// Attempts against one upstream server before advancing to the next.
    pub retry_budget: u32,

    /// Timeout for a single upstream query.
    pub query_timeout: Duration,

    /// Port upstream servers are queried on (referral targets carry only an IP).
    pub upstream_port: u16,

    /// Maximum size of DNS packets.
    pub max_packet_size: usize,

    /// Path of the durable per-query log.
    pub query_log_path: String,

    /// Root servers used to start every iterative resolution.
    pub root_hints: Vec<SocketAddr>,
}

impl ResolverConfig {
    /// Load resolver configuration from environment variables.
    ///
    /// Invalid values are reported as `Config` errors rather than silently
    /// replaced, since the service cannot run on a half-read configuration.
    pub fn from_env() -> Result<Self, DnsError> {
        let bind_addr = env::var("RESOLVER_BIND")
            .unwrap_or_else(|_| format!("0.0.0.0:{}", DNS_PORT))
            .parse()
            .map_err(|_| DnsError::Config("Invalid RESOLVER_BIND address".into()))?;

        let root_hints = match env::var("RESOLVER_ROOT_HINTS") {
            Ok(list) => hints::parse_hints(&list)?,
            Err(_) => hints::builtin_roots(),
        };

        let timeout_ms: u64 = env_parse("RESOLVER_TIMEOUT_MS", DEFAULT_TIMEOUT_MS)?;

        Ok(Self {
            bind_addr,
            hop_limit: env_parse("RESOLVER_HOP_LIMIT", DEFAULT_HOP_LIMIT)?,
            retry_budget: env_parse("RESOLVER_RETRY_BUDGET", DEFAULT_RETRY_BUDGET)?,
            query_timeout: Duration::from_millis(timeout_ms),
            upstream_port: env_parse("RESOLVER_UPSTREAM_PORT", DNS_PORT)?,
            max_packet_size: env_parse("RESOLVER_MAX_PACKET_SIZE", MAX_PACKET_SIZE)?,
            query_log_path: env::var("RESOLVER_QUERY_LOG").unwrap_or_else(|_| "resolver.log".into()),
            root_hints,
        })
    }

    /// Override the bind port from a positional startup argument.
    pub fn apply_port_arg(&mut self, arg: &str) -> Result<(), DnsError> {
        let port: u16 = arg
            .parse()
            .map_err(|_| DnsError::Config(format!("Invalid port argument: {}", arg)))?;
        self.bind_addr.set_port(port);
        Ok(())
    }
}

/// Read an environment variable and parse it, falling back to a default
/// when the variable is unset.
fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, DnsError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| DnsError::Config(format!("Invalid {}: {}", key, value))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ResolverConfig {
        ResolverConfig {
            bind_addr: "0.0.0.0:53".parse().unwrap(),
            hop_limit: DEFAULT_HOP_LIMIT,
            retry_budget: DEFAULT_RETRY_BUDGET,
            query_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            upstream_port: DNS_PORT,
            max_packet_size: MAX_PACKET_SIZE,
            query_log_path: "resolver.log".into(),
            root_hints: hints::builtin_roots(),
        }
    }

    #[test]
    fn port_arg_overrides_bind_port() {
        let mut config = base_config();
        config.apply_port_arg("5353").unwrap();
        assert_eq!(config.bind_addr.port(), 5353);
    }

    #[test]
    fn bad_port_arg_is_config_error() {
        let mut config = base_config();
        assert!(matches!(
            config.apply_port_arg("not-a-port"),
            Err(DnsError::Config(_))
        ));
    }
}
