//! Server transport abstraction
//!
//! A [`ServerTransport`] is one live channel to one server: it owns the
//! physical connection, frames messages, correlates requests and exposes the
//! handful of operations the gateway needs. Implementations:
//!
//! - [`stdio::StdioTransport`] spawns the server as a child process and
//!   speaks JSON-RPC over its stdin/stdout.
//! - `fake::ScriptedTransport` (tests only) replays scripted outcomes.
//!
//! Transports are built by a [`TransportFactory`] from a
//! [`ServerDefinition`]. The default factory understands `stdio` only; the
//! network kinds are accepted by the registry but fail here with
//! [`GatewayError::UnsupportedTransport`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::events::EventBus;
use crate::mcp::types::{Implementation, ToolDefinition};
use crate::registry::ServerDefinition;
use crate::tool_call::{ToolCallRequest, ToolCallResponse};

pub mod stdio;

#[cfg(test)]
pub mod fake;

/// Transport kinds a server definition may declare
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Sse,
    #[serde(alias = "ws")]
    WebSocket,
    Http,
}

impl TransportKind {
    /// Whether the kind needs an endpoint URL instead of a command
    pub fn is_network(&self) -> bool {
        !matches!(self, TransportKind::Stdio)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::WebSocket => "websocket",
            TransportKind::Http => "http",
        };
        f.write_str(s)
    }
}

/// Connection state of a transport
///
/// `Disconnected -> Connecting -> Connected`; `Degraded` and `Error` can be
/// entered from anywhere. A connected transport returns to `Disconnected`
/// when its process exits or it is disconnected explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Connected, but a recent request timed out
    Degraded,
    Error,
}

impl TransportStatus {
    /// Whether requests can be issued in this state
    pub fn is_usable(&self) -> bool {
        matches!(self, TransportStatus::Connected | TransportStatus::Degraded)
    }
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportStatus::Disconnected => "disconnected",
            TransportStatus::Connecting => "connecting",
            TransportStatus::Connected => "connected",
            TransportStatus::Degraded => "degraded",
            TransportStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// One live channel to one server.
///
/// `call_tool` never fails: every outcome, including a missing connection,
/// is folded into the returned [`ToolCallResponse`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServerTransport: Send + Sync {
    /// Id of the server definition this transport is bound to
    fn server_id(&self) -> String;

    fn status(&self) -> TransportStatus;

    /// Establish the channel and complete the handshake. A no-op when
    /// already connected.
    async fn connect(&self) -> Result<()>;

    /// Reject all pending requests and tear the channel down.
    async fn disconnect(&self) -> Result<()>;

    /// Fetch the server's current tool list.
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>>;

    async fn call_tool(&self, request: ToolCallRequest) -> ToolCallResponse;

    /// Liveness probe; returns the round-trip time.
    async fn ping(&self) -> Result<Duration>;

    /// Requests sent but not yet answered
    async fn pending_requests(&self) -> usize;
}

/// Knobs shared by every stdio transport a factory builds
#[derive(Debug, Clone)]
pub struct StdioOptions {
    /// Identity sent in the `initialize` request
    pub client_info: Implementation,
    /// Bound on spawn plus handshake
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Used when neither the call, the tool nor the server set one
    pub request_timeout: Duration,
    /// Time a server gets to exit after SIGTERM before it is killed
    pub shutdown_grace: Duration,
}

impl Default for StdioOptions {
    fn default() -> Self {
        Self {
            client_info: Implementation::toolgate(),
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Builds transports for server definitions
pub trait TransportFactory: Send + Sync {
    fn create(&self, definition: &ServerDefinition) -> Result<Arc<dyn ServerTransport>>;
}

/// Factory for the transports this crate implements
#[derive(Debug, Clone, Default)]
pub struct DefaultTransportFactory {
    options: StdioOptions,
    events: EventBus,
}

impl DefaultTransportFactory {
    pub fn new(options: StdioOptions, events: EventBus) -> Self {
        Self { options, events }
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, definition: &ServerDefinition) -> Result<Arc<dyn ServerTransport>> {
        match definition.transport {
            TransportKind::Stdio => Ok(Arc::new(stdio::StdioTransport::new(
                definition.clone(),
                self.options.clone(),
                self.events.clone(),
            )?)),
            other => Err(GatewayError::UnsupportedTransport(format!(
                "{other} (server `{}`)",
                definition.id
            ))
            .into()),
        }
    }
}
