//! Gateway lifecycle events
//!
//! Every component publishes onto one [`EventBus`]; subscribers receive a
//! [`GatewayEvent`] per state change. Delivery is best effort: a bus with
//! no subscribers drops events, and lagging subscribers skip ahead.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::health::HealthStatus;
use crate::resilience::CircuitState;

/// Default channel capacity for the event bus
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// A state change observed somewhere in the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GatewayEvent {
    /// A server definition was added to the registry
    #[serde(rename_all = "camelCase")]
    ServerRegistered { server_id: String },
    /// A server definition was replaced
    #[serde(rename_all = "camelCase")]
    ServerUpdated { server_id: String },
    /// A server definition was removed
    #[serde(rename_all = "camelCase")]
    ServerUnregistered { server_id: String },
    #[serde(rename_all = "camelCase")]
    ServerEnabled { server_id: String },
    #[serde(rename_all = "camelCase")]
    ServerDisabled { server_id: String },
    /// A transport completed its handshake
    #[serde(rename_all = "camelCase")]
    ServerConnected { server_id: String },
    /// A transport lost its channel or was shut down
    #[serde(rename_all = "camelCase")]
    ServerDisconnected { server_id: String, reason: String },
    /// A transport hit an error it could not recover from
    #[serde(rename_all = "camelCase")]
    ServerError { server_id: String, message: String },
    /// One probe completed
    #[serde(rename_all = "camelCase")]
    HealthCheck {
        server_id: String,
        status: HealthStatus,
        latency_ms: u64,
        success: bool,
    },
    #[serde(rename_all = "camelCase")]
    ServerHealthy {
        server_id: String,
        previous: HealthStatus,
    },
    #[serde(rename_all = "camelCase")]
    ServerUnhealthy {
        server_id: String,
        previous: HealthStatus,
    },
    #[serde(rename_all = "camelCase")]
    ServerDegraded {
        server_id: String,
        previous: HealthStatus,
    },
    /// The cached tool list of a server was replaced
    #[serde(rename_all = "camelCase")]
    ToolsRefreshed { server_id: String, count: usize },
    #[serde(rename_all = "camelCase")]
    CircuitStateChanged {
        server_id: String,
        from: CircuitState,
        to: CircuitState,
    },
    #[serde(rename_all = "camelCase")]
    AdapterRegistered { adapter_id: String },
    #[serde(rename_all = "camelCase")]
    AdapterInitialized { adapter_id: String },
    #[serde(rename_all = "camelCase")]
    AdapterError { adapter_id: String, message: String },
    #[serde(rename_all = "camelCase")]
    AdapterDisposed { adapter_id: String },
}

impl GatewayEvent {
    /// Short, stable event name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            GatewayEvent::ServerRegistered { .. } => "server_registered",
            GatewayEvent::ServerUpdated { .. } => "server_updated",
            GatewayEvent::ServerUnregistered { .. } => "server_unregistered",
            GatewayEvent::ServerEnabled { .. } => "server_enabled",
            GatewayEvent::ServerDisabled { .. } => "server_disabled",
            GatewayEvent::ServerConnected { .. } => "server_connected",
            GatewayEvent::ServerDisconnected { .. } => "server_disconnected",
            GatewayEvent::ServerError { .. } => "server_error",
            GatewayEvent::HealthCheck { .. } => "health_check",
            GatewayEvent::ServerHealthy { .. } => "server_healthy",
            GatewayEvent::ServerUnhealthy { .. } => "server_unhealthy",
            GatewayEvent::ServerDegraded { .. } => "server_degraded",
            GatewayEvent::ToolsRefreshed { .. } => "tools_refreshed",
            GatewayEvent::CircuitStateChanged { .. } => "circuit_state_changed",
            GatewayEvent::AdapterRegistered { .. } => "adapter_registered",
            GatewayEvent::AdapterInitialized { .. } => "adapter_initialized",
            GatewayEvent::AdapterError { .. } => "adapter_error",
            GatewayEvent::AdapterDisposed { .. } => "adapter_disposed",
        }
    }

    /// Server the event concerns, if any
    pub fn server_id(&self) -> Option<&str> {
        match self {
            GatewayEvent::ServerRegistered { server_id }
            | GatewayEvent::ServerUpdated { server_id }
            | GatewayEvent::ServerUnregistered { server_id }
            | GatewayEvent::ServerEnabled { server_id }
            | GatewayEvent::ServerDisabled { server_id }
            | GatewayEvent::ServerConnected { server_id }
            | GatewayEvent::ServerDisconnected { server_id, .. }
            | GatewayEvent::ServerError { server_id, .. }
            | GatewayEvent::HealthCheck { server_id, .. }
            | GatewayEvent::ServerHealthy { server_id, .. }
            | GatewayEvent::ServerUnhealthy { server_id, .. }
            | GatewayEvent::ServerDegraded { server_id, .. }
            | GatewayEvent::ToolsRefreshed { server_id, .. }
            | GatewayEvent::CircuitStateChanged { server_id, .. } => Some(server_id),
            _ => None,
        }
    }
}

/// Broadcast fan-out for [`GatewayEvent`]s
///
/// Cloning the bus is cheap; all clones publish to the same subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; returns silently when nobody is listening
    pub fn emit(&self, event: GatewayEvent) {
        tracing::trace!(event = event.name(), server = ?event.server_id(), "gateway event");
        let _ = self.sender.send(event);
    }

    /// Receive every event published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    /// Stream adapter over [`EventBus::subscribe`]
    pub fn stream(&self) -> BroadcastStream<GatewayEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
