//! Centralized constants for the MySQL MCP gateway.
//!
//! This module contains all magic numbers, default values and well-known
//! names used throughout the codebase.

use std::time::Duration;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Default connection creation timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default liveness probe / status query timeout in seconds.
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;

/// Default close timeout in seconds.
pub const DEFAULT_CLOSE_TIMEOUT_SECS: u64 = 5;

/// Default statement timeout in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// Default connection creation timeout as Duration.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS);

/// Default probe timeout as Duration.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS);

/// Default close timeout as Duration.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(DEFAULT_CLOSE_TIMEOUT_SECS);

/// Default statement timeout as Duration.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS);

// =============================================================================
// Connection Profile Defaults
// =============================================================================

/// Default MySQL port.
pub const DEFAULT_MYSQL_PORT: u16 = 3306;

/// Host for implicit and fallback profiles.
pub const DEFAULT_MYSQL_HOST: &str = "localhost";

/// Default user for the profile built from discrete environment variables.
pub const DEFAULT_MYSQL_USER: &str = "root";

/// Default database for the profile built from discrete environment variables.
pub const DEFAULT_MYSQL_DATABASE: &str = "mysql";

/// User of the hard-coded fallback profile. Never an administrative account.
pub const FALLBACK_MYSQL_USER: &str = "mcp_guest";

/// Profile name synthesized from discrete environment variables.
pub const ENV_PROFILE_NAME: &str = "default";

/// Profile name of the hard-coded fallback topology.
pub const FALLBACK_PROFILE_NAME: &str = "localhost";

/// Environment tag reported for profiles that do not declare one.
pub const DEFAULT_ENVIRONMENT_TAG: &str = "default";

// =============================================================================
// Configuration Source Names
// =============================================================================

/// Environment variable carrying a serialized topology.
pub const ENV_CONNECTIONS: &str = "MYSQL_CONNECTIONS";

/// Discrete environment variables for the implicit profile.
pub const ENV_HOST: &str = "MYSQL_HOST";
pub const ENV_PORT: &str = "MYSQL_PORT";
pub const ENV_USER: &str = "MYSQL_USER";
pub const ENV_PASSWORD: &str = "MYSQL_PASSWORD";
pub const ENV_DATABASE: &str = "MYSQL_DATABASE";

/// Overrides the project directory used to locate local config files.
pub const ENV_PROJECT_DIR: &str = "MYSQL_GATEWAY_PROJECT_DIR";

/// Host-IDE settings directory, relative to the home directory.
pub const HOST_SETTINGS_DIR: &str = ".cursor";

/// Host-IDE settings file name.
pub const HOST_SETTINGS_FILE: &str = "mcp.json";

/// Substring a host-IDE server entry name must contain to be considered.
pub const HOST_SERVER_MARKER: &str = "mysql";

/// Project-local topology file, relative to the project directory.
pub const PROJECT_CONFIG_DIR: &str = "config";
pub const PROJECT_CONFIG_FILE: &str = "mysql-connections.json";

/// Project-local dotenv file.
pub const PROJECT_DOTENV_FILE: &str = ".env";

// =============================================================================
// Probe Queries
// =============================================================================

/// Minimal round-trip used to confirm a handle still works.
pub const LIVENESS_PROBE_SQL: &str = "SELECT 1";

/// Lightweight session identity query used by status snapshots.
pub const SESSION_IDENTITY_SQL: &str =
    "SELECT DATABASE() AS current_database, USER() AS current_user, @@hostname AS server_host";

// =============================================================================
// Shutdown Constants
// =============================================================================

/// Default shutdown force timeout in seconds.
pub const DEFAULT_FORCE_TIMEOUT_SECS: u64 = 10;

/// Default shutdown force timeout as Duration.
pub const DEFAULT_FORCE_TIMEOUT: Duration = Duration::from_secs(DEFAULT_FORCE_TIMEOUT_SECS);
