//! SSH fleet subsystem: diagnostics, remote execution and scheduled metrics.
//!
//! This module is organized into the following submodules:
//!
//! - `config`: Configuration resolution with `FLEET_*` environment variables
//! - `error`: Error type and transport error classification
//! - `types`: Serializable records and results
//! - `validator` / `sanitize`: Command filter and output redaction
//! - `connection` / `credentials`: Connection settings resolved from target records
//! - `transport` / `client` / `session` / `auth`: SSH transport seams and the russh implementation
//! - `pool`: Bounded per-target session pools
//! - `executor`: Validated, time-bounded command execution
//! - `tester`: Staged connection diagnostics
//! - `collector` / `cache`: Metrics collection and caching
//! - `queue` / `worker` / `failure`: Scheduling, retries and the failure circuit breaker
//! - `repository`: Persistence collaborator and the in-memory implementation
//! - `service`: Wiring and administrative operations
//! - `commands`: MCP tool implementations

pub mod auth;
pub mod cache;
pub mod client;
pub mod collector;
pub mod commands;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod failure;
pub mod pool;
pub mod queue;
pub mod repository;
pub mod sanitize;
pub(crate) mod schema;
pub mod session;
pub mod service;
pub mod tester;
pub mod transport;
pub mod types;
pub mod validator;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use commands::McpFleetCommands;
pub use error::FleetError;
pub use service::FleetService;
