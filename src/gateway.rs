//! Gateway facade
//!
//! [`Gateway`] owns every registry, the client manager and the health
//! monitor, and is the one entry point a host application uses: register
//! servers, call tools by name, inspect health, subscribe to events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::client_manager::{ClientManager, ServerCallStats};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::events::{EventBus, GatewayEvent};
use crate::health::{AggregatedHealth, HealthCheckResult, HealthMonitor, HealthProbe, HealthStatus};
use crate::mcp::transport::{DefaultTransportFactory, TransportFactory};
use crate::mcp::types::ToolDefinition;
use crate::pool::ConnectionPool;
use crate::registry::{
    AdapterConfig, AdapterFactory, AdapterMetadata, AdapterRegistry, BindingRequirements,
    ServerDefinition, ServerRegistry, ServerSummary, ServiceBinding, ServiceRegistry,
    ToolCapability,
};
use crate::resilience::RetryPolicies;
use crate::tool_call::{CallOptions, ToolCallRequest, ToolCallResponse};

/// Point-in-time gateway statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub servers_total: usize,
    pub servers_enabled: usize,
    /// Distinct tool names offered by enabled servers
    pub tools: usize,
    pub adapters: usize,
    pub bindings: usize,
    pub health: AggregatedHealth,
    pub servers: Vec<ServerCallStats>,
}

/// Single entry point composing the registries, the client manager and the
/// health monitor
///
/// # Examples
///
/// ```no_run
/// use serde_json::json;
/// use toolgate::config::GatewayConfig;
/// use toolgate::gateway::Gateway;
/// use toolgate::tool_call::CallOptions;
///
/// # async fn run() -> anyhow::Result<()> {
/// let config = GatewayConfig::load("toolgate.yaml")?;
/// let gateway = Gateway::new(config)?;
/// gateway.initialize().await?;
///
/// let response = gateway
///     .call_tool("echo", json!({ "text": "hi" }), CallOptions::default())
///     .await;
/// println!("{:?}", response.data);
///
/// gateway.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Gateway {
    config: GatewayConfig,
    events: EventBus,
    servers: ServerRegistry,
    services: ServiceRegistry,
    adapters: AdapterRegistry,
    manager: Arc<ClientManager>,
    health: Arc<HealthMonitor>,
    initialized: AtomicBool,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("servers", &self.servers.ids())
            .field("adapters", &self.adapters.ids())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl Gateway {
    /// Build a gateway that spawns stdio servers.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the configuration is invalid.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let events = EventBus::default();
        let factory = DefaultTransportFactory::new(config.stdio_options(), events.clone());
        Self::build(config, events, Arc::new(factory))
    }

    /// Build a gateway whose transports come from `factory`
    pub fn with_factory(config: GatewayConfig, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        Self::build(config, EventBus::default(), factory)
    }

    fn build(config: GatewayConfig, events: EventBus, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(ConnectionPool::new(config.pool.clone(), factory));
        let manager = Arc::new(ClientManager::new(
            pool,
            config.circuit_breaker.clone(),
            RetryPolicies::with_default(config.retry.clone()),
            events.clone(),
        ));
        let probe: Arc<dyn HealthProbe> = manager.clone();
        let health = Arc::new(HealthMonitor::new(config.health.clone(), probe, events.clone()));
        let adapters = match config.adapter_error_ttl() {
            Some(ttl) => AdapterRegistry::new(events.clone()).with_error_ttl(ttl),
            None => AdapterRegistry::new(events.clone()),
        };
        Ok(Self {
            servers: ServerRegistry::new(events.clone()).with_tool_ttl(config.tool_cache_ttl()),
            services: ServiceRegistry::new(),
            adapters,
            config,
            events,
            manager,
            health,
            initialized: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn servers(&self) -> &ServerRegistry {
        &self.servers
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn client_manager(&self) -> &Arc<ClientManager> {
        &self.manager
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Register the configured servers, connect the enabled ones, index their
    /// tools and start background health checks.
    ///
    /// A server that fails to connect is marked unhealthy and logged; it
    /// never aborts initialisation. Calling this twice does nothing. After
    /// [`Gateway::shutdown`] it reconnects every registered server.
    ///
    /// # Errors
    ///
    /// Returns an error only if a configured definition cannot be
    /// registered.
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(servers = self.config.servers.len(), "initializing gateway");

        for definition in self.config.servers.clone() {
            // Registrations survive a shutdown
            if self.servers.contains(&definition.id) {
                continue;
            }
            if let Err(e) = self.add_definition(definition).await {
                self.initialized.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        let enabled: Vec<String> = self
            .servers
            .list()
            .into_iter()
            .filter(|d| d.enabled)
            .map(|d| d.id)
            .collect();
        futures::future::join_all(enabled.iter().map(|id| self.connect_and_index(id))).await;

        self.services.rebuild(&self.servers);
        self.manager.pool().start_sweeper();
        self.health.start();

        let summary = self.health.snapshot();
        tracing::info!(
            servers = summary.total,
            unhealthy = summary.unhealthy.len(),
            tools = self.services.tool_names().len(),
            "gateway initialized"
        );
        Ok(())
    }

    async fn add_definition(&self, definition: ServerDefinition) -> Result<()> {
        self.servers.register(definition.clone())?;
        self.manager.add_server(&definition).await;
        if definition.enabled {
            self.health.register(&definition.id, definition.health_check.as_ref());
        }
        Ok(())
    }

    /// Connect and fetch tools; failures are recorded, never returned
    async fn connect_and_index(&self, server_id: &str) -> bool {
        match self.connect_server(server_id).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(server = %server_id, "failed to connect: {e:#}");
                self.health.mark_unhealthy(server_id, &format!("{e:#}"));
                false
            }
        }
    }

    /// Add a server at runtime. After [`Gateway::initialize`] an enabled
    /// server is connected straight away; a failed connect only marks it
    /// unhealthy.
    pub async fn register_server(&self, definition: ServerDefinition) -> Result<()> {
        let id = definition.id.clone();
        let enabled = definition.enabled;
        self.add_definition(definition).await?;
        if enabled && self.is_initialized() {
            self.connect_and_index(&id).await;
        }
        self.services.rebuild(&self.servers);
        Ok(())
    }

    /// Replace a server's definition. Existing connections are closed so the
    /// next call uses the new command, environment and limits.
    pub async fn update_server(&self, definition: ServerDefinition) -> Result<()> {
        let id = definition.id.clone();
        self.servers.update(definition.clone())?;
        self.manager.remove_server(&id).await;
        self.manager.add_server(&definition).await;
        if definition.enabled {
            self.health.register(&id, definition.health_check.as_ref());
            if self.is_initialized() {
                self.connect_and_index(&id).await;
            }
        } else {
            self.health.unregister(&id);
        }
        self.services.rebuild(&self.servers);
        Ok(())
    }

    /// Remove a server everywhere: registry, index, bindings, health and
    /// its connections.
    pub async fn unregister_server(&self, server_id: &str) -> Result<()> {
        self.servers.unregister(server_id)?;
        self.services.remove_server(server_id);
        self.health.unregister(server_id);
        self.manager.remove_server(server_id).await;
        Ok(())
    }

    pub async fn enable_server(&self, server_id: &str) -> Result<()> {
        if !self.servers.enable(server_id)? {
            return Ok(());
        }
        let definition = self.servers.require(server_id)?;
        self.health.register(server_id, definition.health_check.as_ref());
        if self.is_initialized() {
            self.connect_and_index(server_id).await;
        }
        self.services.rebuild(&self.servers);
        Ok(())
    }

    /// Disable a server: its connections close and its tools leave the
    /// index. Agent bindings keep referring to it and fail with
    /// `SERVER_DISABLED` until it is enabled again.
    pub async fn disable_server(&self, server_id: &str) -> Result<()> {
        if !self.servers.disable(server_id)? {
            return Ok(());
        }
        if let Err(e) = self.manager.disconnect(server_id).await {
            tracing::debug!(server = %server_id, "disconnect on disable failed: {e:#}");
        }
        self.health.unregister(server_id);
        self.services.rebuild(&self.servers);
        Ok(())
    }

    /// Open the server's pooled connections and refresh its tools.
    ///
    /// # Errors
    ///
    /// [`GatewayError::ServerNotFound`], [`GatewayError::ServerDisabled`], or
    /// the connection failure.
    pub async fn connect_server(&self, server_id: &str) -> Result<()> {
        let definition = self.servers.require(server_id)?;
        if !definition.enabled {
            return Err(GatewayError::ServerDisabled(server_id.to_string()).into());
        }
        self.manager.connect(server_id).await?;
        if let Err(e) = self.refresh_tools(server_id).await {
            tracing::warn!(server = %server_id, "tool refresh failed, using declared tools: {e:#}");
        }
        Ok(())
    }

    /// Fetch the server's live tool list into the cache and the index
    pub async fn refresh_tools(&self, server_id: &str) -> Result<Vec<ToolDefinition>> {
        let tools = self.manager.list_tools(server_id).await?;
        self.servers.set_tools(server_id, tools.clone())?;
        self.services.rebuild(&self.servers);
        Ok(tools)
    }

    /// Refresh every enabled server whose cache has expired. Returns the
    /// number refreshed.
    pub async fn refresh_stale_tools(&self) -> usize {
        let stale: Vec<String> = self
            .servers
            .list()
            .into_iter()
            .filter(|d| d.enabled && self.servers.tools_stale(&d.id))
            .map(|d| d.id)
            .collect();
        let mut refreshed = 0;
        for id in stale {
            match self.refresh_tools(&id).await {
                Ok(_) => refreshed += 1,
                Err(e) => tracing::debug!(server = %id, "tool refresh skipped: {e:#}"),
            }
        }
        self.services.rebuild(&self.servers);
        refreshed
    }

    /// Whether name routing should pick this server first
    fn is_routable(&self, server_id: &str) -> bool {
        self.manager.is_available(server_id)
            && self.health.status(server_id) != Some(HealthStatus::Unhealthy)
    }

    /// Call a tool by name. Never fails; every outcome comes back in the
    /// response.
    ///
    /// Resolution order: the server in `options.server_id`, then the binding
    /// of `options.agent_id`, then any enabled server offering the tool
    /// (healthy ones first), then the adapters.
    pub async fn call_tool(&self, name: &str, arguments: Value, options: CallOptions) -> ToolCallResponse {
        let mut request = ToolCallRequest::new(name, arguments);
        request.timeout_ms = options.timeout.map(|t| t.as_millis() as u64);
        request.correlation_id = options.correlation_id.clone();
        request.server_id = options.server_id.clone();
        let agent_id = options.agent_id.as_deref();

        if request.server_id.is_none() && self.routes_to_adapter(agent_id, name) {
            tracing::debug!(tool = %name, "routing to adapter");
            let correlation_id = request.ensure_correlation_id();
            return self
                .adapters
                .invoke_tool(name, request.arguments)
                .await
                .with_correlation_id(Some(correlation_id));
        }

        self.services
            .call_tool_for_agent(&self.manager, &self.servers, agent_id, request, |id| {
                self.is_routable(id)
            })
            .await
    }

    /// Tools no server offers go to an adapter, unless the agent is bound
    fn routes_to_adapter(&self, agent_id: Option<&str>, name: &str) -> bool {
        let bound = agent_id.is_some_and(|a| self.services.get_binding(a).is_some());
        !bound && !self.services.has_tool(name) && self.adapters.has_tool(name)
    }

    /// Every tool offered by enabled servers
    pub fn get_tools(&self) -> Vec<ToolCapability> {
        self.services.all_tools()
    }

    /// Tools whose name matches `pattern` (glob or substring)
    pub fn find_tools(&self, pattern: &str) -> Vec<ToolCapability> {
        self.services.find_tools(pattern)
    }

    /// Tools offered by adapters, with the adapter id
    pub fn adapter_tools(&self) -> Vec<(String, ToolDefinition)> {
        self.adapters.tools()
    }

    pub fn list_servers(&self) -> Vec<ServerSummary> {
        self.servers.summaries()
    }

    /// Last known health of every monitored server
    pub fn get_health(&self) -> Vec<HealthCheckResult> {
        self.health.results()
    }

    pub fn health_summary(&self) -> AggregatedHealth {
        self.health.snapshot()
    }

    /// Probe every monitored server now
    pub async fn check_health(&self) -> Vec<HealthCheckResult> {
        self.health.check_all().await
    }

    pub fn get_stats(&self) -> GatewayStats {
        let definitions = self.servers.list();
        GatewayStats {
            servers_total: definitions.len(),
            servers_enabled: definitions.iter().filter(|d| d.enabled).count(),
            tools: self.services.tool_names().len(),
            adapters: self.adapters.ids().len(),
            bindings: self.services.bindings().len(),
            health: self.health.snapshot(),
            servers: self.manager.stats(),
        }
    }

    /// Receive every event published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn create_binding(&self, agent_id: &str, requirements: &BindingRequirements) -> Result<ServiceBinding> {
        self.services.create_binding(agent_id, requirements)
    }

    pub fn get_binding(&self, agent_id: &str) -> Option<ServiceBinding> {
        self.services.get_binding(agent_id)
    }

    pub fn remove_binding(&self, agent_id: &str) -> bool {
        self.services.remove_binding(agent_id)
    }

    pub fn register_adapter(
        &self,
        metadata: AdapterMetadata,
        factory: AdapterFactory,
        config: AdapterConfig,
    ) -> Result<()> {
        self.adapters.register(metadata, factory, config)
    }

    /// Stop health checks, drain the tool index and bindings, close every
    /// connection and dispose adapters. Server and adapter registrations
    /// are kept.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down gateway");
        self.health.stop().await;
        self.services.reset();
        self.manager.shutdown().await;
        self.adapters.dispose_all().await;
        self.initialized.store(false, Ordering::SeqCst);
    }

    /// Shut down and clear every registry
    pub async fn reset(&self) {
        self.shutdown().await;
        for id in self.servers.ids() {
            self.manager.remove_server(&id).await;
        }
        self.servers.reset();
        self.health.reset().await;
        self.adapters.reset().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::fake::{CallScript, ScriptedFactory, ScriptedTransport};
    use crate::registry::{AdapterFuture, ToolAdapter};
    use crate::test_utils::stdio_definition;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use serde_json::json;

    fn config(servers: Vec<ServerDefinition>) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.retry.max_attempts = 1;
        config.pool.acquire_timeout_ms = 500;
        config.servers = servers;
        config
    }

    async fn gateway(transports: Vec<ScriptedTransport>, servers: Vec<ServerDefinition>) -> (Gateway, Arc<ScriptedFactory>) {
        let factory = Arc::new(ScriptedFactory::new());
        for t in transports {
            factory.add(t);
        }
        let gateway = Gateway::with_factory(config(servers), factory.clone()).unwrap();
        gateway.initialize().await.unwrap();
        (gateway, factory)
    }

    async fn two_servers() -> (Gateway, Arc<ScriptedFactory>) {
        gateway(
            vec![
                ScriptedTransport::new("alpha").with_tools(&["echo", "get_pricing"]),
                ScriptedTransport::new("beta").with_tools(&["echo", "search"]),
            ],
            vec![
                stdio_definition("alpha").with_category("cloud"),
                stdio_definition("beta").with_category("docs"),
            ],
        )
        .await
    }

    struct Upper;

    #[async_trait]
    impl ToolAdapter for Upper {
        async fn call_tool(&self, _tool: &str, arguments: Value) -> Result<Value> {
            let text = arguments["text"].as_str().unwrap_or_default().to_uppercase();
            Ok(json!({ "text": text }))
        }

        async fn dispose(&self) -> Result<()> {
            Ok(())
        }
    }

    fn upper_factory() -> AdapterFactory {
        Arc::new(|_config| -> AdapterFuture {
            Box::pin(async {
                let adapter: Arc<dyn ToolAdapter> = Arc::new(Upper);
                Ok(adapter)
            })
        })
    }

    #[tokio::test]
    async fn test_initialize_connects_and_indexes_tools() {
        let (gateway, factory) = two_servers().await;
        assert!(gateway.is_initialized());
        assert_eq!(factory.get("alpha").unwrap().connect_count(), 1);

        let names: Vec<_> = gateway.get_tools().into_iter().map(|c| c.tool.name).collect();
        assert_eq!(names, vec!["echo", "echo", "get_pricing", "search"]);
        assert_eq!(gateway.find_tools("pric").len(), 1);

        // Idempotent
        gateway.initialize().await.unwrap();
        assert_eq!(factory.get("alpha").unwrap().connect_count(), 1);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_connect_marks_unhealthy_without_aborting() {
        let (gateway, _) = gateway(
            vec![
                ScriptedTransport::new("good").with_tools(&["echo"]),
                ScriptedTransport::new("bad").failing_connect(),
            ],
            vec![stdio_definition("good"), stdio_definition("bad")],
        )
        .await;
        assert_eq!(gateway.health().status("bad"), Some(HealthStatus::Unhealthy));
        assert_eq!(gateway.health().status("good"), Some(HealthStatus::Unknown));
        assert!(gateway.health_summary().unhealthy.contains(&"bad".to_string()));
        let response = gateway.call_tool("echo", json!({}), CallOptions::default()).await;
        assert!(response.success);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_routes_by_name_to_first_registered() {
        let (gateway, factory) = two_servers().await;
        let response = gateway
            .call_tool("echo", json!({"v": 1}), CallOptions::default())
            .await;
        assert!(response.success);
        assert_eq!(response.server_id.as_deref(), Some("alpha"));
        assert_eq!(response.data, Some(json!({"v": 1})));

        let response = gateway.call_tool("search", json!({}), CallOptions::default()).await;
        assert_eq!(response.server_id.as_deref(), Some("beta"));
        assert_eq!(factory.get("beta").unwrap().call_count(), 1);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_routing_skips_open_circuits() {
        let (gateway, factory) = two_servers().await;
        factory
            .get("alpha")
            .unwrap()
            .set_default_call(CallScript::connection_lost());
        for _ in 0..5 {
            gateway
                .call_tool("echo", json!({}), CallOptions {
                    server_id: Some("alpha".into()),
                    ..Default::default()
                })
                .await;
        }
        assert!(!gateway.client_manager().is_available("alpha"));

        let response = gateway.call_tool("echo", json!({}), CallOptions::default()).await;
        assert!(response.success);
        assert_eq!(response.server_id.as_deref(), Some("beta"));
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_explicit_server_errors() {
        let (gateway, _) = two_servers().await;
        let unknown = gateway
            .call_tool("echo", json!({}), CallOptions {
                server_id: Some("ghost".into()),
                correlation_id: Some("c-1".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(unknown.error_code(), Some("SERVER_NOT_FOUND"));
        assert_eq!(unknown.correlation_id.as_deref(), Some("c-1"));

        gateway.disable_server("beta").await.unwrap();
        let disabled = gateway
            .call_tool("search", json!({}), CallOptions {
                server_id: Some("beta".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(disabled.error_code(), Some("SERVER_DISABLED"));

        let missing = gateway.call_tool("nope", json!({}), CallOptions::default()).await;
        assert_eq!(missing.error_code(), Some("TOOL_NOT_FOUND"));
        assert!(missing.correlation_id.is_some());
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_disable_and_enable_update_the_index() {
        let (gateway, factory) = two_servers().await;
        let mut rx = gateway.subscribe();

        gateway.disable_server("beta").await.unwrap();
        assert!(gateway.find_tools("search").is_empty());
        assert!(factory.get("beta").unwrap().disconnects.load(Ordering::SeqCst) >= 1);
        assert!(gateway.health().get("beta").is_none());

        gateway.enable_server("beta").await.unwrap();
        assert_eq!(gateway.find_tools("search").len(), 1);
        assert!(gateway.health().get("beta").is_some());

        let names: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.name())
            .filter(|n| *n == "server_enabled" || *n == "server_disabled")
            .collect();
        assert_eq!(names, vec!["server_disabled", "server_enabled"]);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregister_prunes_index_and_bindings() {
        let (gateway, factory) = two_servers().await;
        gateway
            .create_binding(
                "agent",
                &BindingRequirements {
                    categories: vec!["cloud".into(), "docs".into()],
                    ..Default::default()
                },
            )
            .unwrap();

        gateway.unregister_server("alpha").await.unwrap();
        assert!(gateway.find_tools("get_pricing").is_empty());
        let binding = gateway.get_binding("agent").unwrap();
        assert_eq!(binding.server_ids, vec!["beta"]);
        assert!(factory.get("alpha").unwrap().disconnects.load(Ordering::SeqCst) >= 1);
        assert!(gateway.unregister_server("alpha").await.is_err());
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_agent_binding_scopes_calls() {
        let (gateway, _) = two_servers().await;
        gateway
            .create_binding(
                "agent",
                &BindingRequirements {
                    tools: vec!["search".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        let scoped = |tool: &'static str| {
            let options = CallOptions {
                agent_id: Some("agent".into()),
                ..Default::default()
            };
            gateway.call_tool(tool, json!({}), options)
        };
        assert!(scoped("search").await.success);
        let rejected = scoped("get_pricing").await;
        assert_eq!(rejected.error_code(), Some("TOOL_NOT_FOUND"));
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_tools_fall_through_to_adapters() {
        let (gateway, _) = two_servers().await;
        gateway
            .register_adapter(
                AdapterMetadata::new("text", "Text").with_tool(ToolDefinition::new("shout", "")),
                upper_factory(),
                AdapterConfig::new(),
            )
            .unwrap();
        let response = gateway
            .call_tool("shout", json!({"text": "hi"}), CallOptions::default())
            .await;
        assert!(response.success);
        assert_eq!(response.adapter_id.as_deref(), Some("text"));
        assert_eq!(response.data, Some(json!({"text": "HI"})));
        assert!(response.correlation_id.is_some());
        assert_eq!(gateway.adapter_tools().len(), 1);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_adapter_init_failure_retried_after_configured_ttl() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let flaky: AdapterFactory = {
            let attempts = Arc::clone(&attempts);
            Arc::new(move |_config| -> AdapterFuture {
                let first = attempts.fetch_add(1, Ordering::SeqCst) == 0;
                Box::pin(async move {
                    if first {
                        anyhow::bail!("backend not ready");
                    }
                    let adapter: Arc<dyn ToolAdapter> = Arc::new(Upper);
                    Ok(adapter)
                })
            })
        };
        let mut config = config(vec![]);
        config.adapter_error_ttl_ms = Some(30);
        let gateway = Gateway::with_factory(config, Arc::new(ScriptedFactory::new())).unwrap();
        gateway
            .register_adapter(
                AdapterMetadata::new("text", "Text").with_tool(ToolDefinition::new("shout", "")),
                flaky,
                AdapterConfig::new(),
            )
            .unwrap();

        let first = gateway.call_tool("shout", json!({"text": "a"}), CallOptions::default()).await;
        assert_eq!(first.error_code(), Some("ADAPTER_INIT_ERROR"));
        let cached = gateway.call_tool("shout", json!({"text": "a"}), CallOptions::default()).await;
        assert_eq!(cached.error_code(), Some("ADAPTER_INIT_ERROR"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let retried = gateway.call_tool("shout", json!({"text": "a"}), CallOptions::default()).await;
        assert!(retried.success, "{:?}", retried.error);
        assert_eq!(retried.data, Some(json!({"text": "A"})));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_register_server_after_initialize() {
        let (gateway, factory) = two_servers().await;
        factory.add(ScriptedTransport::new("gamma").with_tools(&["translate"]));
        gateway
            .register_server(stdio_definition("gamma"))
            .await
            .unwrap();
        assert_eq!(factory.get("gamma").unwrap().connect_count(), 1);
        assert_eq!(gateway.find_tools("translate").len(), 1);
        assert!(gateway.register_server(stdio_definition("gamma")).await.is_err());
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_server_reconnects_and_reindexes() {
        let (gateway, factory) = two_servers().await;
        gateway
            .update_server(stdio_definition("alpha").with_category("billing"))
            .await
            .unwrap();
        assert_eq!(gateway.find_tools("get_pricing")[0].category, "billing");
        assert_eq!(factory.get("alpha").unwrap().connect_count(), 2);
        assert!(gateway.update_server(stdio_definition("ghost")).await.is_err());
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats_and_shutdown() {
        let (gateway, factory) = two_servers().await;
        gateway.disable_server("beta").await.unwrap();
        let stats = gateway.get_stats();
        assert_eq!(stats.servers_total, 2);
        assert_eq!(stats.servers_enabled, 1);
        assert_eq!(stats.tools, 2);
        assert_eq!(stats.health.total, 1);

        gateway.shutdown().await;
        assert!(!gateway.is_initialized());
        assert!(gateway.get_tools().is_empty());
        assert!(!gateway.health().is_running());
        assert!(factory.get("alpha").unwrap().disconnects.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_initialize_after_shutdown_reconnects() {
        let (gateway, factory) = two_servers().await;
        gateway.shutdown().await;

        gateway.initialize().await.unwrap();
        assert!(gateway.is_initialized());
        assert_eq!(factory.get("alpha").unwrap().connect_count(), 2);
        assert_eq!(gateway.get_tools().len(), 4);

        let response = gateway
            .call_tool("echo", json!({"again": true}), CallOptions::server("alpha"))
            .await;
        assert!(response.success, "{:?}", response.error);
        assert_eq!(response.server_id.as_deref(), Some("alpha"));
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = config(vec![]);
        config.request_timeout_ms = 0;
        assert!(Gateway::with_factory(config, Arc::new(ScriptedFactory::new())).is_err());
    }
}
