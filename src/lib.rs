//! # MySQL MCP Gateway
//!
//! Connection and configuration lifecycle core for a MySQL administration
//! gateway.
//!
//! This crate provides:
//! - **Configuration resolution**: pick one connection topology from ranked
//!   sources (host IDE settings, project file, environment, built-in fallback)
//! - **Connection registry**: one validated, reusable handle per profile name,
//!   recreated transparently when its liveness probe fails
//! - **Diagnostics**: profile listing, connection tests and status snapshots
//!
//! ## Architecture
//!
//! Every operation asks the [`ConnectionRegistry`] for a handle by profile
//! name. The registry resolves the topology through [`ConfigResolver`] on first
//! use and keeps it until an explicit reload.

pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod resilience;
pub mod shutdown;
pub mod telemetry;

pub use config::{ConfigResolver, ConnectionProfile, RegistryConfig, Resolution, Topology};
pub use database::{ConnectionHandle, ConnectionRegistry, ProfileStatus, ProfileTestResult};
pub use error::ServerError;
