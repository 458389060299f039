//! Connection profiles and the topology that groups them.
//!
//! Documents are parsed into loosely-shaped intermediate structs first and then
//! validated into a [`Topology`]. A `Topology` that exists is always complete:
//! it has at least one profile and its default name resolves.

use crate::constants::{DEFAULT_ENVIRONMENT_TAG, DEFAULT_MYSQL_PORT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// One named database target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionProfile {
    /// Unique key within a topology.
    pub name: String,

    /// MySQL hostname or IP address
    pub host: String,

    /// MySQL port (default: 3306)
    pub port: u16,

    /// Login user
    pub user: String,

    /// Login password. Never serialized.
    #[serde(skip_serializing)]
    pub password: String,

    /// Initial schema, if any
    pub database: Option<String>,

    /// Free-form description shown in listings
    pub description: Option<String>,

    /// Environment tag (dev, staging, prod, ...)
    pub environment: Option<String>,
}

impl ConnectionProfile {
    /// Environment tag, falling back to `default` when the profile declares none.
    pub fn environment_tag(&self) -> &str {
        self.environment.as_deref().unwrap_or(DEFAULT_ENVIRONMENT_TAG)
    }

    /// `host:port` address of the target.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Descriptive metadata for listings; no connection attempt.
    pub fn summary(&self) -> ProfileSummary {
        ProfileSummary {
            name: self.name.clone(),
            description: self.description.clone(),
            environment: self.environment_tag().to_string(),
        }
    }

    fn validate(&self) -> Result<(), TopologyError> {
        if self.host.trim().is_empty() {
            return Err(TopologyError::invalid_profile(&self.name, "host is empty"));
        }
        if self.user.trim().is_empty() {
            return Err(TopologyError::invalid_profile(&self.name, "user is empty"));
        }
        if self.port == 0 {
            return Err(TopologyError::invalid_profile(&self.name, "port must be 1-65535"));
        }
        Ok(())
    }
}

/// Profile metadata returned by `list_profiles`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileSummary {
    pub name: String,
    pub description: Option<String>,
    pub environment: String,
}

/// Why a document could not become a [`Topology`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("malformed document: {0}")]
    Malformed(String),

    #[error("missing 'connections'")]
    MissingConnections,

    #[error("'connections' is empty")]
    EmptyConnections,

    #[error("missing 'defaultConnection'")]
    MissingDefault,

    #[error("default connection '{0}' is not defined in 'connections'")]
    UnresolvableDefault(String),

    #[error("profile '{name}': {reason}")]
    InvalidProfile { name: String, reason: String },
}

impl TopologyError {
    fn invalid_profile(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidProfile {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// The full set of profiles plus the default profile name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    profiles: BTreeMap<String, ConnectionProfile>,
    default_profile: String,
}

impl Topology {
    /// Build a topology from already-constructed profiles.
    pub fn new(
        profiles: impl IntoIterator<Item = ConnectionProfile>,
        default_profile: impl Into<String>,
    ) -> Result<Self, TopologyError> {
        let profiles: BTreeMap<String, ConnectionProfile> = profiles
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        let default_profile = default_profile.into();

        if profiles.is_empty() {
            return Err(TopologyError::EmptyConnections);
        }
        if default_profile.is_empty() {
            return Err(TopologyError::MissingDefault);
        }
        if !profiles.contains_key(&default_profile) {
            return Err(TopologyError::UnresolvableDefault(default_profile));
        }
        for profile in profiles.values() {
            profile.validate()?;
        }

        Ok(Self {
            profiles,
            default_profile,
        })
    }

    /// A topology holding exactly one profile, which is also the default.
    pub fn single(profile: ConnectionProfile) -> Result<Self, TopologyError> {
        let name = profile.name.clone();
        Self::new([profile], name)
    }

    /// Parse and validate a serialized topology document.
    ///
    /// Shape: `{"connections": {"<name>": {host, port, user, ...}}, "defaultConnection": "<name>"}`.
    pub fn from_json_str(json: &str) -> Result<Self, TopologyError> {
        let document: TopologyDocument = serde_json::from_str(json)
            .map_err(|e| TopologyError::Malformed(e.to_string()))?;
        document.into_topology()
    }

    /// Look up a profile by name.
    pub fn profile(&self, name: &str) -> Option<&ConnectionProfile> {
        self.profiles.get(name)
    }

    /// Check whether a profile with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    /// Name of the default profile; always resolvable.
    pub fn default_profile_name(&self) -> &str {
        &self.default_profile
    }

    /// The default profile.
    pub fn default_profile(&self) -> &ConnectionProfile {
        &self.profiles[&self.default_profile]
    }

    /// Profile names in sorted order.
    pub fn profile_names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    /// Profiles in name order.
    pub fn profiles(&self) -> impl Iterator<Item = &ConnectionProfile> {
        self.profiles.values()
    }

    /// Number of profiles.
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Always false for a constructed topology.
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct TopologyDocument {
    connections: Option<BTreeMap<String, ProfileDocument>>,
    #[serde(rename = "defaultConnection")]
    default_connection: Option<String>,
}

impl TopologyDocument {
    fn into_topology(self) -> Result<Topology, TopologyError> {
        let connections = self.connections.ok_or(TopologyError::MissingConnections)?;
        let default = self.default_connection.ok_or(TopologyError::MissingDefault)?;

        let profiles = connections
            .into_iter()
            .map(|(name, doc)| doc.into_profile(name))
            .collect::<Result<Vec<_>, _>>()?;

        Topology::new(profiles, default)
    }
}

#[derive(Debug, Deserialize)]
struct ProfileDocument {
    host: Option<String>,
    port: Option<PortValue>,
    user: Option<String>,
    password: Option<String>,
    database: Option<String>,
    description: Option<String>,
    environment: Option<String>,
}

/// Ports show up both as numbers and as strings in hand-written documents.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u64),
    Text(String),
}

impl PortValue {
    fn to_port(&self) -> Option<u16> {
        match self {
            PortValue::Number(n) => u16::try_from(*n).ok(),
            PortValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl ProfileDocument {
    fn into_profile(self, name: String) -> Result<ConnectionProfile, TopologyError> {
        let host = self
            .host
            .ok_or_else(|| TopologyError::invalid_profile(&name, "missing 'host'"))?;
        let user = self
            .user
            .ok_or_else(|| TopologyError::invalid_profile(&name, "missing 'user'"))?;
        let port = match self.port {
            Some(value) => value
                .to_port()
                .ok_or_else(|| TopologyError::invalid_profile(&name, "port must be 1-65535"))?,
            None => DEFAULT_MYSQL_PORT,
        };

        Ok(ConnectionProfile {
            name,
            host,
            port,
            user,
            password: self.password.unwrap_or_default(),
            database: self.database.filter(|d| !d.is_empty()),
            description: self.description,
            environment: self.environment,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV_TOPOLOGY: &str = r#"{
        "connections": {
            "dev": {"host": "localhost", "port": 3306, "user": "root", "password": "x", "database": "testdb"},
            "prod": {"host": "db.internal", "port": "3307", "user": "app", "environment": "production", "description": "Primary"}
        },
        "defaultConnection": "dev"
    }"#;

    #[test]
    fn test_parse_valid_topology() {
        let topology = Topology::from_json_str(DEV_TOPOLOGY).unwrap();
        assert_eq!(topology.len(), 2);
        assert_eq!(topology.default_profile_name(), "dev");

        let dev = topology.default_profile();
        assert_eq!(dev.host, "localhost");
        assert_eq!(dev.port, 3306);
        assert_eq!(dev.password, "x");
        assert_eq!(dev.database.as_deref(), Some("testdb"));
        assert_eq!(dev.environment_tag(), "default");

        let prod = topology.profile("prod").unwrap();
        assert_eq!(prod.port, 3307);
        assert_eq!(prod.password, "");
        assert_eq!(prod.environment_tag(), "production");
        assert_eq!(prod.address(), "db.internal:3307");
    }

    #[test]
    fn test_missing_port_defaults() {
        let json = r#"{"connections":{"a":{"host":"h","user":"u"}},"defaultConnection":"a"}"#;
        let topology = Topology::from_json_str(json).unwrap();
        assert_eq!(topology.default_profile().port, 3306);
    }

    #[test]
    fn test_structural_failures() {
        assert!(matches!(
            Topology::from_json_str("not json"),
            Err(TopologyError::Malformed(_))
        ));
        assert_eq!(
            Topology::from_json_str(r#"{"defaultConnection":"a"}"#),
            Err(TopologyError::MissingConnections)
        );
        assert_eq!(
            Topology::from_json_str(r#"{"connections":{},"defaultConnection":"a"}"#),
            Err(TopologyError::EmptyConnections)
        );
        assert_eq!(
            Topology::from_json_str(r#"{"connections":{"a":{"host":"h","user":"u"}}}"#),
            Err(TopologyError::MissingDefault)
        );
        assert_eq!(
            Topology::from_json_str(
                r#"{"connections":{"a":{"host":"h","user":"u"}},"defaultConnection":"b"}"#
            ),
            Err(TopologyError::UnresolvableDefault("b".to_string()))
        );
    }

    #[test]
    fn test_invalid_profile_fields() {
        let no_host = r#"{"connections":{"a":{"user":"u"}},"defaultConnection":"a"}"#;
        assert!(matches!(
            Topology::from_json_str(no_host),
            Err(TopologyError::InvalidProfile { .. })
        ));

        let bad_port = r#"{"connections":{"a":{"host":"h","user":"u","port":70000}},"defaultConnection":"a"}"#;
        assert!(matches!(
            Topology::from_json_str(bad_port),
            Err(TopologyError::InvalidProfile { .. })
        ));

        let blank_host = r#"{"connections":{"a":{"host":" ","user":"u"}},"defaultConnection":"a"}"#;
        assert!(matches!(
            Topology::from_json_str(blank_host),
            Err(TopologyError::InvalidProfile { .. })
        ));
    }

    #[test]
    fn test_password_not_serialized() {
        let topology = Topology::from_json_str(DEV_TOPOLOGY).unwrap();
        let json = serde_json::to_value(topology.default_profile()).unwrap();
        assert!(json.get("password").is_none());
        assert_eq!(json["host"], "localhost");
    }

    #[test]
    fn test_summary() {
        let topology = Topology::from_json_str(DEV_TOPOLOGY).unwrap();
        let summary = topology.profile("prod").unwrap().summary();
        assert_eq!(summary.name, "prod");
        assert_eq!(summary.description.as_deref(), Some("Primary"));
        assert_eq!(summary.environment, "production");
    }
}
