//! Configuration management for the MySQL MCP gateway.
//!
//! Two kinds of configuration live here:
//! - the connection topology (named profiles plus a default), discovered by
//!   [`ConfigResolver`] from several ranked sources;
//! - registry tuning (network timeouts), loaded from environment variables
//!   following the 12-factor app pattern.

mod profile;
mod resolver;

pub use profile::{ConnectionProfile, ProfileSummary, Topology, TopologyError};
pub use resolver::{ConfigResolver, ConfigSource, Resolution, SourceKind};

use crate::constants::{
    DEFAULT_CLOSE_TIMEOUT, DEFAULT_CLOSE_TIMEOUT_SECS, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_PROBE_TIMEOUT, DEFAULT_PROBE_TIMEOUT_SECS,
    DEFAULT_QUERY_TIMEOUT, DEFAULT_QUERY_TIMEOUT_SECS,
};
use std::time::Duration;

/// Connection registry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Upper bound on establishing a new session.
    pub connect_timeout: Duration,

    /// Upper bound on liveness probes and status queries.
    pub probe_timeout: Duration,

    /// Upper bound on closing a session.
    pub close_timeout: Duration,

    /// Upper bound on a statement run through a handle, including the wait
    /// for the handle's session.
    pub query_timeout: Duration,
}

impl RegistryConfig {
    /// Load registry configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MYSQL_CONNECT_TIMEOUT`: Connection timeout in seconds (default: 10)
    /// - `MYSQL_PROBE_TIMEOUT`: Liveness probe timeout in seconds (default: 5)
    /// - `MYSQL_CLOSE_TIMEOUT`: Close timeout in seconds (default: 5)
    /// - `MYSQL_QUERY_TIMEOUT`: Statement timeout in seconds (default: 30)
    pub fn from_env() -> Self {
        let connect_timeout_secs = std::env::var("MYSQL_CONNECT_TIMEOUT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);

        let probe_timeout_secs = std::env::var("MYSQL_PROBE_TIMEOUT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PROBE_TIMEOUT_SECS);

        let close_timeout_secs = std::env::var("MYSQL_CLOSE_TIMEOUT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_CLOSE_TIMEOUT_SECS);

        let query_timeout_secs = std::env::var("MYSQL_QUERY_TIMEOUT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_QUERY_TIMEOUT_SECS);

        Self {
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            probe_timeout: Duration::from_secs(probe_timeout_secs),
            close_timeout: Duration::from_secs(close_timeout_secs),
            query_timeout: Duration::from_secs(query_timeout_secs),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_registry_config_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.probe_timeout, Duration::from_secs(5));
        assert_eq!(config.close_timeout, Duration::from_secs(5));
        assert_eq!(config.query_timeout, Duration::from_secs(30));
    }

    #[test]
    #[serial]
    fn test_registry_config_from_env() {
        std::env::set_var("MYSQL_CONNECT_TIMEOUT", "3");
        std::env::set_var("MYSQL_PROBE_TIMEOUT", "not-a-number");
        std::env::set_var("MYSQL_QUERY_TIMEOUT", "120");
        let config = RegistryConfig::from_env();
        std::env::remove_var("MYSQL_CONNECT_TIMEOUT");
        std::env::remove_var("MYSQL_PROBE_TIMEOUT");
        std::env::remove_var("MYSQL_QUERY_TIMEOUT");

        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.probe_timeout, Duration::from_secs(5));
        assert_eq!(config.query_timeout, Duration::from_secs(120));
    }
}
