//! Ranked discovery of the connection topology.
//!
//! Sources, highest priority first:
//! 1. host-IDE settings (`~/.cursor/mcp.json`, MySQL server entries only)
//! 2. project file (`config/mysql-connections.json`)
//! 3. `MYSQL_CONNECTIONS` environment variable
//! 4. discrete `MYSQL_HOST`/`MYSQL_PORT`/... variables (one `default` profile)
//! 5. hard-coded local fallback
//!
//! Every source is examined and recorded for diagnostics; the available source
//! with the lowest priority number wins outright. Nothing is merged.

use super::profile::{ConnectionProfile, Topology, TopologyError};
use crate::constants::{
    DEFAULT_MYSQL_DATABASE, DEFAULT_MYSQL_HOST, DEFAULT_MYSQL_PORT, DEFAULT_MYSQL_USER,
    ENV_CONNECTIONS, ENV_DATABASE, ENV_HOST, ENV_PASSWORD, ENV_PORT, ENV_PROFILE_NAME,
    ENV_PROJECT_DIR, ENV_USER, FALLBACK_MYSQL_USER, FALLBACK_PROFILE_NAME, HOST_SERVER_MARKER,
    HOST_SETTINGS_DIR, HOST_SETTINGS_FILE, PROJECT_CONFIG_DIR, PROJECT_CONFIG_FILE,
    PROJECT_DOTENV_FILE,
};
use crate::error::ServerError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Kind of configuration origin, ordered by precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    HostSettings,
    ProjectFile,
    EnvTopology,
    EnvDiscrete,
    Defaults,
}

impl SourceKind {
    /// All kinds, highest precedence first.
    pub const ALL: [SourceKind; 5] = [
        SourceKind::HostSettings,
        SourceKind::ProjectFile,
        SourceKind::EnvTopology,
        SourceKind::EnvDiscrete,
        SourceKind::Defaults,
    ];

    /// Precedence rank; lower wins.
    pub fn priority(self) -> u8 {
        match self {
            SourceKind::HostSettings => 1,
            SourceKind::ProjectFile => 2,
            SourceKind::EnvTopology => 3,
            SourceKind::EnvDiscrete => 4,
            SourceKind::Defaults => 5,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::HostSettings => write!(f, "mcp.json"),
            SourceKind::ProjectFile => write!(f, "mysql-connections.json"),
            SourceKind::EnvTopology => write!(f, "MYSQL_CONNECTIONS"),
            SourceKind::EnvDiscrete => write!(f, "environment"),
            SourceKind::Defaults => write!(f, "defaults"),
        }
    }
}

/// One examined candidate origin.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub kind: SourceKind,

    /// Where it was read from (path, variable name, or server entry).
    pub origin: String,

    pub priority: u8,

    /// Parsed topology; `None` when the origin is absent or invalid.
    pub topology: Option<Topology>,

    /// Why the source is unavailable, if it is.
    pub reason: Option<String>,
}

impl ConfigSource {
    fn available(kind: SourceKind, origin: impl Into<String>, topology: Topology) -> Self {
        Self {
            kind,
            origin: origin.into(),
            priority: kind.priority(),
            topology: Some(topology),
            reason: None,
        }
    }

    fn unavailable(kind: SourceKind, origin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind,
            origin: origin.into(),
            priority: kind.priority(),
            topology: None,
            reason: Some(reason.into()),
        }
    }

    /// Whether this source yielded a valid topology.
    pub fn is_available(&self) -> bool {
        self.topology.is_some()
    }
}

/// Outcome of [`ConfigResolver::resolve`].
#[derive(Debug, Clone)]
pub struct Resolution {
    topology: Topology,
    selected: SourceKind,
    sources: Vec<ConfigSource>,
}

impl Resolution {
    /// Pick the available source with the lowest priority number.
    ///
    /// Examination order does not matter; sources are ranked here.
    pub fn select(mut sources: Vec<ConfigSource>) -> Result<Self, ServerError> {
        sources.sort_by_key(|s| s.priority);

        let winner = sources
            .iter()
            .find_map(|s| s.topology.clone().map(|t| (s.kind, t)));

        match winner {
            Some((selected, topology)) => Ok(Self {
                topology,
                selected,
                sources,
            }),
            None => Err(ServerError::config(
                "no configuration source produced a valid connection topology",
            )),
        }
    }

    /// The winning topology.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Kind of the winning source.
    pub fn selected(&self) -> SourceKind {
        self.selected
    }

    /// Every examined source, ranked by priority.
    pub fn sources(&self) -> &[ConfigSource] {
        &self.sources
    }

    /// Consume the resolution, keeping only the topology.
    pub fn into_topology(self) -> Topology {
        self.topology
    }

    /// Human-readable diagnostic summary of every examined source.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Configuration sources:");

        for source in &self.sources {
            let status = if source.kind == self.selected {
                "ACTIVE"
            } else if source.is_available() {
                "available"
            } else {
                "unavailable"
            };
            let _ = writeln!(
                out,
                "  [{}] {} (priority {}) - {}",
                status, source.kind, source.priority, source.origin
            );
            match (&source.topology, &source.reason) {
                (Some(topology), _) => {
                    let names: Vec<&str> = topology.profile_names().collect();
                    let _ = writeln!(out, "      connections: {}", names.join(", "));
                    let _ = writeln!(out, "      default: {}", topology.default_profile_name());
                }
                (None, Some(reason)) => {
                    let _ = writeln!(out, "      {}", reason);
                }
                (None, None) => {}
            }
        }

        let _ = writeln!(out, "Selected: {}", self.selected);
        let _ = write!(out, "Total connections: {}", self.topology.len());
        out
    }
}

#[derive(Debug, Deserialize)]
struct HostSettings {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: BTreeMap<String, HostServerEntry>,
}

#[derive(Debug, Deserialize)]
struct HostServerEntry {
    #[serde(default)]
    env: BTreeMap<String, serde_json::Value>,
}

/// Discovers the connection topology from the external environment.
///
/// Construct with [`ConfigResolver::new`] for the real process, or override the
/// home directory, project directory and environment for isolated use.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    home_dir: Option<PathBuf>,
    project_dir: PathBuf,
    env: HashMap<String, String>,
}

impl ConfigResolver {
    /// Resolver over the real process environment and filesystem.
    pub fn new() -> Self {
        let env: HashMap<String, String> = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        let project_dir = env
            .get(ENV_PROJECT_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

        Self {
            home_dir: dirs::home_dir(),
            project_dir,
            env,
        }
    }

    /// Set the home directory holding the host-IDE settings.
    pub fn with_home_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.home_dir = Some(dir.into());
        self
    }

    /// Disable the host-IDE settings source.
    pub fn without_home_dir(mut self) -> Self {
        self.home_dir = None;
        self
    }

    /// Set the project directory holding `config/` and `.env`.
    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = dir.into();
        self
    }

    /// Replace the process environment snapshot.
    pub fn with_env<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env = vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    /// Path of the host-IDE settings file, if a home directory is known.
    pub fn host_settings_path(&self) -> Option<PathBuf> {
        self.home_dir
            .as_ref()
            .map(|home| home.join(HOST_SETTINGS_DIR).join(HOST_SETTINGS_FILE))
    }

    /// Path of the project-local topology file.
    pub fn project_file_path(&self) -> PathBuf {
        self.project_dir
            .join(PROJECT_CONFIG_DIR)
            .join(PROJECT_CONFIG_FILE)
    }

    /// Examine every source and select the winning topology.
    ///
    /// Read-only; never writes configuration and never caches.
    pub fn resolve(&self) -> Result<Resolution, ServerError> {
        let env = self.effective_env();

        let sources: Vec<ConfigSource> = SourceKind::ALL
            .iter()
            .map(|kind| {
                let source = self.examine(*kind, &env);
                match &source.reason {
                    Some(reason) => debug!(source = %kind, origin = %source.origin, "skipped: {}", reason),
                    None => debug!(source = %kind, origin = %source.origin, "topology found"),
                }
                source
            })
            .collect();

        let resolution = Resolution::select(sources)?;
        info!(
            source = %resolution.selected(),
            connections = resolution.topology().len(),
            default_profile = resolution.topology().default_profile_name(),
            "Connection topology resolved"
        );
        Ok(resolution)
    }

    fn examine(&self, kind: SourceKind, env: &HashMap<String, String>) -> ConfigSource {
        match kind {
            SourceKind::HostSettings => self.host_settings_source(),
            SourceKind::ProjectFile => self.project_file_source(),
            SourceKind::EnvTopology => env_topology_source(env),
            SourceKind::EnvDiscrete => env_discrete_source(env),
            SourceKind::Defaults => defaults_source(),
        }
    }

    /// Process environment overlaid on the project `.env` file.
    fn effective_env(&self) -> HashMap<String, String> {
        let dotenv_path = self.project_dir.join(PROJECT_DOTENV_FILE);
        let mut env = HashMap::new();

        if dotenv_path.is_file() {
            match dotenv::from_path_iter(&dotenv_path) {
                Ok(iter) => {
                    for item in iter {
                        match item {
                            Ok((key, value)) => {
                                env.insert(key, value);
                            }
                            Err(e) => {
                                warn!("Skipping unparsable line in {}: {}", dotenv_path.display(), e)
                            }
                        }
                    }
                }
                Err(e) => warn!("Failed to read {}: {}", dotenv_path.display(), e),
            }
        }

        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    fn host_settings_source(&self) -> ConfigSource {
        let kind = SourceKind::HostSettings;
        let Some(path) = self.host_settings_path() else {
            return ConfigSource::unavailable(kind, "<no home directory>", "home directory unknown");
        };
        let origin = path.display().to_string();

        let settings: HostSettings = match read_json(&path) {
            Ok(Some(settings)) => settings,
            Ok(None) => return ConfigSource::unavailable(kind, origin, "file not found"),
            Err(reason) => return ConfigSource::unavailable(kind, origin, reason),
        };

        let mut last_failure = None;
        for (server, entry) in &settings.mcp_servers {
            if !server.to_lowercase().contains(HOST_SERVER_MARKER) {
                continue;
            }
            let Some(embedded) = entry.env.get(ENV_CONNECTIONS).and_then(|v| v.as_str()) else {
                continue;
            };
            match Topology::from_json_str(embedded) {
                Ok(topology) => {
                    return ConfigSource::available(kind, format!("{} ({})", origin, server), topology)
                }
                Err(e) => {
                    warn!(server = %server, "Ignoring invalid {} in {}: {}", ENV_CONNECTIONS, origin, e);
                    last_failure = Some(format!("server '{}': {}", server, e));
                }
            }
        }

        let reason = last_failure.unwrap_or_else(|| {
            format!("no MySQL server entry with {} found", ENV_CONNECTIONS)
        });
        ConfigSource::unavailable(kind, origin, reason)
    }

    fn project_file_source(&self) -> ConfigSource {
        let kind = SourceKind::ProjectFile;
        let path = self.project_file_path();
        let origin = path.display().to_string();

        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ConfigSource::unavailable(kind, origin, "file not found")
            }
            Err(e) => return ConfigSource::unavailable(kind, origin, format!("unreadable: {}", e)),
        };

        match Topology::from_json_str(&contents) {
            Ok(topology) => ConfigSource::available(kind, origin, topology),
            Err(e) => {
                warn!("Ignoring invalid topology file {}: {}", origin, e);
                ConfigSource::unavailable(kind, origin, e.to_string())
            }
        }
    }
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Read and deserialize a JSON file; `Ok(None)` when the file does not exist.
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, String> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(format!("unreadable: {}", e)),
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| TopologyError::Malformed(e.to_string()).to_string())
}

fn env_topology_source(env: &HashMap<String, String>) -> ConfigSource {
    let kind = SourceKind::EnvTopology;
    match env.get(ENV_CONNECTIONS) {
        None => ConfigSource::unavailable(kind, ENV_CONNECTIONS, "variable not set"),
        Some(value) => match Topology::from_json_str(value) {
            Ok(topology) => ConfigSource::available(kind, ENV_CONNECTIONS, topology),
            Err(e) => {
                warn!("Ignoring invalid {}: {}", ENV_CONNECTIONS, e);
                ConfigSource::unavailable(kind, ENV_CONNECTIONS, e.to_string())
            }
        },
    }
}

fn env_discrete_source(env: &HashMap<String, String>) -> ConfigSource {
    let kind = SourceKind::EnvDiscrete;
    let origin = "MYSQL_HOST/MYSQL_PORT/MYSQL_USER/MYSQL_PASSWORD/MYSQL_DATABASE";

    let keys = [ENV_HOST, ENV_PORT, ENV_USER, ENV_PASSWORD, ENV_DATABASE];
    if !keys.iter().any(|k| env.contains_key(*k)) {
        return ConfigSource::unavailable(kind, origin, "no MYSQL_* connection variables set");
    }

    let non_empty = |key: &str| env.get(key).filter(|v| !v.trim().is_empty()).cloned();

    let profile = ConnectionProfile {
        name: ENV_PROFILE_NAME.to_string(),
        host: non_empty(ENV_HOST).unwrap_or_else(|| DEFAULT_MYSQL_HOST.to_string()),
        port: env
            .get(ENV_PORT)
            .and_then(|p| p.trim().parse().ok())
            .filter(|p| *p != 0)
            .unwrap_or(DEFAULT_MYSQL_PORT),
        user: non_empty(ENV_USER).unwrap_or_else(|| DEFAULT_MYSQL_USER.to_string()),
        password: env.get(ENV_PASSWORD).cloned().unwrap_or_default(),
        database: Some(non_empty(ENV_DATABASE).unwrap_or_else(|| DEFAULT_MYSQL_DATABASE.to_string())),
        description: Some("Built from MYSQL_* environment variables".to_string()),
        environment: None,
    };

    match Topology::single(profile) {
        Ok(topology) => ConfigSource::available(kind, origin, topology),
        Err(e) => ConfigSource::unavailable(kind, origin, e.to_string()),
    }
}

fn defaults_source() -> ConfigSource {
    let kind = SourceKind::Defaults;
    let profile = ConnectionProfile {
        name: FALLBACK_PROFILE_NAME.to_string(),
        host: DEFAULT_MYSQL_HOST.to_string(),
        port: DEFAULT_MYSQL_PORT,
        user: FALLBACK_MYSQL_USER.to_string(),
        password: String::new(),
        database: None,
        description: Some("Local fallback".to_string()),
        environment: None,
    };

    match Topology::single(profile) {
        Ok(topology) => ConfigSource::available(kind, "built-in", topology),
        Err(e) => ConfigSource::unavailable(kind, "built-in", e.to_string()),
    }
}
