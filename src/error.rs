//! Error types for the MySQL MCP gateway.
//!
//! This module defines semantic error types with MySQL error code mapping
//! for user-friendly error messages.

use thiserror::Error;

/// Domain-specific errors for the gateway core.
#[derive(Debug, Error)]
pub enum ServerError {
    /// No usable topology could be resolved.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A profile name that is absent from the resolved topology.
    #[error("Unknown connection profile: '{0}'")]
    UnknownProfile(String),

    /// Connection error
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Database not found
    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    /// Network operation timeout
    #[error("Timeout: {operation} exceeded {timeout_seconds} seconds")]
    Timeout {
        operation: String,
        timeout_seconds: u64,
    },

    /// Failure while closing a handle. Logged by the registry, never returned from it.
    #[error("Failed to close connection '{profile}': {message}")]
    Close { profile: String, message: String },

    /// Query execution error
    #[error("Query execution error: {message}")]
    QueryExecution {
        message: String,
        sql_error_code: Option<u16>,
        sql_state: Option<String>,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an unknown profile error.
    pub fn unknown_profile(name: impl Into<String>) -> Self {
        Self::UnknownProfile(name.into())
    }

    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a connection error with a source.
    pub fn connection_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an authentication error.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_seconds: seconds,
        }
    }

    /// Create a close error.
    pub fn close(profile: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Close {
            profile: profile.into(),
            message: msg.into(),
        }
    }

    /// Create a query execution error.
    pub fn query_error(msg: impl Into<String>) -> Self {
        Self::QueryExecution {
            message: msg.into(),
            sql_error_code: None,
            sql_state: None,
        }
    }

    /// Create a query execution error with MySQL error details.
    pub fn query_error_with_code(msg: impl Into<String>, code: u16, state: Option<String>) -> Self {
        Self::QueryExecution {
            message: msg.into(),
            sql_error_code: Some(code),
            sql_state: state,
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is transient and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::QueryExecution {
                sql_error_code: Some(code),
                ..
            } => is_transient_sql_error(*code),
            _ => false,
        }
    }

    /// Check if this error came from reaching (or failing to reach) a real target.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Authentication(_)
                | Self::DatabaseNotFound(_)
                | Self::Timeout { .. }
        )
    }

    /// Get a user-friendly suggestion for how to fix this error.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Config(_) => {
                Some("Check mcp.json, config/mysql-connections.json and the MYSQL_* variables")
            }
            Self::UnknownProfile(_) => Some("Use one of the profile names listed by `list`"),
            Self::Connection { .. } => {
                Some("Check server hostname, port, and network connectivity")
            }
            Self::Authentication(_) => Some("Verify your username and password are correct"),
            Self::DatabaseNotFound(_) => Some("Check the database name and ensure it exists"),
            Self::Timeout { .. } => Some("Check that the server is reachable or raise the timeout"),
            _ => None,
        }
    }
}

/// Map MySQL server error codes to semantic ServerError types.
pub fn from_sql_error(code: u16, message: &str, state: Option<String>) -> ServerError {
    match code {
        // Access denied
        1044 | 1045 => ServerError::auth(message),

        // Unknown database
        1049 => ServerError::DatabaseNotFound(message.to_string()),

        // Client-side connection failures
        2002 | 2003 | 2005 => ServerError::connection(format!("Server not reachable: {}", message)),
        2006 | 2013 => ServerError::connection(format!("Server connection lost: {}", message)),

        // Too many connections
        1040 => ServerError::connection(format!("Server refused connection: {}", message)),

        _ => ServerError::query_error_with_code(message, code, state),
    }
}

/// Check if a MySQL error code indicates a transient error.
fn is_transient_sql_error(code: u16) -> bool {
    matches!(
        code,
        1040    // Too many connections
        | 1205  // Lock wait timeout
        | 1213  // Deadlock
        | 2006  // Server has gone away
        | 2013 // Lost connection during query
    )
}

impl From<mysql_async::Error> for ServerError {
    fn from(e: mysql_async::Error) -> Self {
        use mysql_async::Error;

        match e {
            Error::Server(server) => {
                from_sql_error(server.code, &server.message, Some(server.state))
            }
            Error::Io(mysql_async::IoError::Io(io)) => {
                ServerError::connection_with_source(format!("IO error: {}", io), io)
            }
            Error::Io(other) => ServerError::connection(format!("IO error: {}", other)),
            Error::Driver(driver) => {
                ServerError::connection(format!("Driver error: {}", driver))
            }
            Error::Url(url) => ServerError::config(format!("Invalid connection URL: {}", url)),
            other => ServerError::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_error_mapping() {
        let err = from_sql_error(1045, "Access denied for user 'root'@'localhost'", None);
        assert!(matches!(err, ServerError::Authentication(_)));

        let err = from_sql_error(1049, "Unknown database 'nope'", None);
        assert!(matches!(err, ServerError::DatabaseNotFound(_)));

        let err = from_sql_error(2003, "Can't connect to MySQL server", None);
        assert!(matches!(err, ServerError::Connection { .. }));

        let err = from_sql_error(1064, "You have an error in your SQL syntax", None);
        assert!(matches!(
            err,
            ServerError::QueryExecution {
                sql_error_code: Some(1064),
                ..
            }
        ));
    }

    #[test]
    fn test_transient_errors() {
        assert!(ServerError::timeout("connect", 10).is_transient());
        assert!(ServerError::connection("test").is_transient());
        assert!(ServerError::query_error_with_code("deadlock", 1213, None).is_transient());
        assert!(!ServerError::auth("test").is_transient());
        assert!(!ServerError::unknown_profile("x").is_transient());
    }

    #[test]
    fn test_connection_failure_classification() {
        assert!(ServerError::auth("denied").is_connection_failure());
        assert!(ServerError::timeout("connect", 1).is_connection_failure());
        assert!(!ServerError::config("none").is_connection_failure());
        assert!(!ServerError::unknown_profile("x").is_connection_failure());
    }

    #[test]
    fn test_error_display() {
        let err = ServerError::unknown_profile("staging");
        assert_eq!(err.to_string(), "Unknown connection profile: 'staging'");

        let err = ServerError::close("dev", "broken pipe");
        assert_eq!(err.to_string(), "Failed to close connection 'dev': broken pipe");
    }

    #[test]
    fn test_error_suggestions() {
        assert!(ServerError::auth("Login failed").suggestion().is_some());
        assert!(ServerError::Internal("unknown".to_string())
            .suggestion()
            .is_none());
    }

    #[test]
    fn test_io_error_keeps_source() {
        use std::error::Error as _;

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = ServerError::connection_with_source("connect failed", io);
        assert!(err.is_connection_failure());
        assert_eq!(err.source().unwrap().to_string(), "refused");
    }
}
