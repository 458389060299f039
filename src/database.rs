//! Database connectivity and the per-profile connection registry.

mod connection;
mod registry;

pub use connection::{
    ConnectionHandle, Connector, MySqlConnector, MySqlSession, Session, SessionIdentity,
};
pub use registry::{ConnectionRegistry, ProfileStatus, ProfileTestResult};
