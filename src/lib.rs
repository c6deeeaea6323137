//! toolgate - resilient client gateway for out-of-process tool servers
//!
//! toolgate spawns tool servers as child processes, speaks JSON-RPC 2.0 to
//! them over stdio, and routes tool calls by name with per-server connection
//! pools, retries, circuit breakers and health monitoring.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `mcp`: JSON-RPC types, frame codecs, the request correlator and transports
//! - `pool`: bounded per-server connection pools
//! - `resilience`: retry policies and circuit breakers
//! - `health`: periodic health probing with hysteresis
//! - `registry`: server definitions, the tool index and agent bindings, adapters
//! - `client_manager`: resilient calls through pool, retry and breaker
//! - `gateway`: the facade composing all of the above
//! - `config`: configuration loading and validation
//! - `events`: the lifecycle event bus
//! - `error`: error types and result aliases
//! - `cli` and `commands`: the command-line front end
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use toolgate::{CallOptions, Gateway, GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GatewayConfig::load("toolgate.yaml")?;
//!     let gateway = Gateway::new(config)?;
//!     gateway.initialize().await?;
//!
//!     let response = gateway
//!         .call_tool("echo", json!({ "text": "hello" }), CallOptions::default())
//!         .await;
//!     println!("{}", serde_json::to_string_pretty(&response)?);
//!
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod client_manager;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod health;
pub mod logging;
pub mod mcp;
pub mod pool;
pub mod registry;
pub mod resilience;
pub mod tool_call;

// Re-export commonly used types
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use events::{EventBus, GatewayEvent};
pub use gateway::{Gateway, GatewayStats};
pub use health::{HealthCheckResult, HealthStatus};
pub use registry::{BindingRequirements, ServerDefinition, ToolAdapter};
pub use tool_call::{CallOptions, ToolCallError, ToolCallRequest, ToolCallResponse};

#[cfg(test)]
pub mod test_utils;
