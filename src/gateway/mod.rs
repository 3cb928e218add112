//! Tool gateway: supervises stdio tool servers and routes calls across them.
//!
//! Architecture:
//! - `config`: backend descriptors and gateway settings (JSON/YAML, `${VAR}` env)
//! - `supervisor`: spawn, stderr drain, terminate/kill and reap
//! - `transport`: line-delimited JSON-RPC over a child's stdin/stdout
//! - `protocol`: handshake, paginated tool listing, invocation, ping
//! - `connection`: one backend with its tagged state
//! - `registry`: merged tool catalog with ordered candidates
//! - `router`: dispatch with ordered fallback
//! - `manager`: gateway lifecycle
//! - `server`: the gateway's own stdio JSON-RPC surface

pub mod config;
pub mod connection;
pub mod errors;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod supervisor;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{load_config, BackendDescriptor, GatewayConfig};
pub use connection::{BackendConnection, ConnectionState};
pub use errors::GatewayError;
pub use manager::{BackendStatus, Gateway, GatewayState, StartupReport};
pub use registry::CapabilityRegistry;
pub use router::Router;
pub use server::serve;
pub use types::{InvocationResult, ToolDescriptor};
