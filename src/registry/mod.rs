//! Catalogs owned by the gateway
//!
//! - [`server`]: server definitions, enablement and the per-server tool cache
//! - [`service`]: the tool name index and per-agent bindings
//! - [`adapter`]: in-process tool providers built on first use

pub mod adapter;
pub mod server;
pub mod service;

pub use adapter::{
    AdapterConfig, AdapterFactory, AdapterFuture, AdapterInfo, AdapterMetadata, AdapterRegistry,
    AdapterStatus, ToolAdapter,
};
pub use server::{ServerDefinition, ServerFilter, ServerRegistry, ServerSummary, DEFAULT_TOOL_CACHE_TTL};
pub use service::{BindingRequirements, ServiceBinding, ServiceRegistry, ToolCapability};
