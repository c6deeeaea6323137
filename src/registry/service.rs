//! Tool index and agent bindings
//!
//! The [`ServiceRegistry`] maps tool names to the servers offering them and
//! scopes agents to a subset of tools through a [`ServiceBinding`].

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::client_manager::ClientManager;
use crate::error::{GatewayError, Result};
use crate::mcp::types::ToolDefinition;
use crate::registry::ServerRegistry;
use crate::tool_call::{ToolCallError, ToolCallRequest, ToolCallResponse};

/// One tool as offered by one server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCapability {
    pub tool: ToolDefinition,
    pub server_id: String,
    pub category: String,
}

impl ToolCapability {
    pub fn name(&self) -> &str {
        &self.tool.name
    }
}

/// What an agent needs; every field adds to the binding
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingRequirements {
    /// Tools that must exist
    pub tools: Vec<String>,
    /// Bind every tool in these categories
    pub categories: Vec<String>,
    /// Bind every tool of these servers, and prefer them when a tool is
    /// offered more than once
    pub preferred_servers: Vec<String>,
}

/// Servers and tools resolved for one agent
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBinding {
    pub agent_id: String,
    pub server_ids: Vec<String>,
    pub tools: Vec<ToolCapability>,
    pub created_at: DateTime<Utc>,
}

impl ServiceBinding {
    pub fn tool(&self, name: &str) -> Option<&ToolCapability> {
        self.tools.iter().find(|c| c.tool.name == name)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tool(name).is_some()
    }
}

#[derive(Debug, Default)]
struct ServiceState {
    /// Tool name to capabilities, in server registration order
    index: HashMap<String, Vec<ToolCapability>>,
    /// Tool names in first-seen order
    order: Vec<String>,
    bindings: HashMap<String, ServiceBinding>,
}

impl ServiceState {
    fn capabilities(&self) -> impl Iterator<Item = &ToolCapability> {
        self.order
            .iter()
            .filter_map(|name| self.index.get(name))
            .flatten()
    }

    fn insert(&mut self, capability: ToolCapability) {
        let name = capability.tool.name.clone();
        let caps = self.index.entry(name.clone()).or_default();
        if caps.is_empty() {
            self.order.push(name);
        }
        if !caps.iter().any(|c| c.server_id == capability.server_id) {
            caps.push(capability);
        }
    }
}

/// Tool name index over the enabled servers
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    state: RwLock<ServiceState>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, ServiceState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ServiceState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rebuild the index from the enabled servers' known tools. Bindings are
    /// kept.
    pub fn rebuild(&self, servers: &ServerRegistry) {
        let mut state = self.write();
        state.index.clear();
        state.order.clear();
        for def in servers.list().into_iter().filter(|d| d.enabled) {
            for tool in servers.known_tools(&def.id) {
                state.insert(ToolCapability {
                    tool,
                    server_id: def.id.clone(),
                    category: def.category.clone(),
                });
            }
        }
        tracing::debug!(
            tools = state.order.len(),
            "service index rebuilt"
        );
    }

    /// Drop a server from the index and from every binding
    pub fn remove_server(&self, server_id: &str) {
        let mut state = self.write();
        let state = &mut *state;
        for caps in state.index.values_mut() {
            caps.retain(|c| c.server_id != server_id);
        }
        state.index.retain(|_, caps| !caps.is_empty());
        let index = &state.index;
        state.order.retain(|name| index.contains_key(name));
        for binding in state.bindings.values_mut() {
            binding.server_ids.retain(|id| id != server_id);
            binding.tools.retain(|c| c.server_id != server_id);
        }
        tracing::debug!(server = %server_id, "server pruned from service index");
    }

    /// Every server offering `name`, in registration order
    pub fn find_by_name(&self, name: &str) -> Vec<ToolCapability> {
        self.read().index.get(name).cloned().unwrap_or_default()
    }

    /// Match tool names against `pattern`.
    ///
    /// Patterns containing `*` or `?` are globs; anything else is a
    /// case-insensitive substring. Only names are matched, never
    /// descriptions.
    ///
    /// # Examples
    ///
    /// ```
    /// use toolgate::registry::{ServerDefinition, ServerRegistry, ServiceRegistry};
    /// use toolgate::mcp::types::ToolDefinition;
    ///
    /// let servers = ServerRegistry::default();
    /// servers
    ///     .register(
    ///         ServerDefinition::stdio("cloud", "cloud-server")
    ///             .with_tool(ToolDefinition::new("get_pricing", "Look up pricing"))
    ///             .with_tool(ToolDefinition::new("list_regions", "pricing regions")),
    ///     )
    ///     .unwrap();
    /// let services = ServiceRegistry::new();
    /// services.rebuild(&servers);
    ///
    /// assert_eq!(services.find_tools("pricing").len(), 1);
    /// assert_eq!(services.find_tools("*_regions").len(), 1);
    /// ```
    pub fn find_tools(&self, pattern: &str) -> Vec<ToolCapability> {
        let is_glob = pattern.contains('*') || pattern.contains('?');
        let needle = pattern.to_lowercase();
        self.read()
            .capabilities()
            .filter(|c| {
                if is_glob {
                    glob_match::glob_match(pattern, &c.tool.name)
                } else {
                    c.tool.name.to_lowercase().contains(&needle)
                }
            })
            .cloned()
            .collect()
    }

    pub fn find_by_category(&self, category: &str) -> Vec<ToolCapability> {
        self.read()
            .capabilities()
            .filter(|c| c.category.eq_ignore_ascii_case(category))
            .cloned()
            .collect()
    }

    /// Every capability, grouped by tool name
    pub fn all_tools(&self) -> Vec<ToolCapability> {
        self.read().capabilities().cloned().collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.read().order.clone()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.read().index.get(name).is_some_and(|caps| !caps.is_empty())
    }

    /// Resolve `requirements` into a binding for `agent_id`, replacing any
    /// previous one.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ToolNotFound`] if an explicitly required tool
    /// is not offered by any enabled server.
    pub fn create_binding(
        &self,
        agent_id: &str,
        requirements: &BindingRequirements,
    ) -> Result<ServiceBinding> {
        let mut state = self.write();
        let preferred = &requirements.preferred_servers;

        let pick = |caps: &[ToolCapability]| -> Option<ToolCapability> {
            preferred
                .iter()
                .find_map(|p| caps.iter().find(|c| &c.server_id == p))
                .or_else(|| caps.first())
                .cloned()
        };

        let mut chosen: Vec<ToolCapability> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut push = |cap: ToolCapability, chosen: &mut Vec<ToolCapability>| {
            if seen.insert(cap.tool.name.clone()) {
                chosen.push(cap);
            }
        };

        for name in &requirements.tools {
            let cap = state
                .index
                .get(name)
                .and_then(|caps| pick(caps.as_slice()))
                .ok_or_else(|| GatewayError::ToolNotFound(name.clone()))?;
            push(cap, &mut chosen);
        }
        for server_id in preferred {
            let offered: Vec<_> = state
                .capabilities()
                .filter(|c| &c.server_id == server_id)
                .cloned()
                .collect();
            if offered.is_empty() {
                tracing::warn!(agent = %agent_id, server = %server_id, "preferred server offers no tools");
            }
            for cap in offered {
                push(cap, &mut chosen);
            }
        }
        for category in &requirements.categories {
            let names: Vec<String> = state
                .capabilities()
                .filter(|c| c.category.eq_ignore_ascii_case(category))
                .map(|c| c.tool.name.clone())
                .collect();
            for name in names {
                if let Some(cap) = state.index.get(&name).and_then(|caps| pick(caps.as_slice())) {
                    push(cap, &mut chosen);
                }
            }
        }

        let mut server_ids: Vec<String> = Vec::new();
        for cap in &chosen {
            if !server_ids.contains(&cap.server_id) {
                server_ids.push(cap.server_id.clone());
            }
        }
        server_ids.sort_by_key(|id| {
            preferred
                .iter()
                .position(|p| p == id)
                .unwrap_or(usize::MAX)
        });

        let binding = ServiceBinding {
            agent_id: agent_id.to_string(),
            server_ids,
            tools: chosen,
            created_at: Utc::now(),
        };
        tracing::info!(
            agent = %agent_id,
            servers = binding.server_ids.len(),
            tools = binding.tools.len(),
            "service binding created"
        );
        state.bindings.insert(agent_id.to_string(), binding.clone());
        Ok(binding)
    }

    pub fn get_binding(&self, agent_id: &str) -> Option<ServiceBinding> {
        self.read().bindings.get(agent_id).cloned()
    }

    pub fn remove_binding(&self, agent_id: &str) -> bool {
        self.write().bindings.remove(agent_id).is_some()
    }

    pub fn bindings(&self) -> Vec<ServiceBinding> {
        let mut out: Vec<_> = self.read().bindings.values().cloned().collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }

    /// Pick the server that should serve `tool`.
    ///
    /// With a binding for `agent_id` the bound server is used and tools
    /// outside the binding are rejected. Otherwise the first registered
    /// server for which `is_available` holds wins, falling back to the first
    /// registered server.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ToolNotFound`] when no server offers the tool
    /// or the binding excludes it.
    pub fn resolve_server<F>(&self, agent_id: Option<&str>, tool: &str, is_available: F) -> Result<String>
    where
        F: Fn(&str) -> bool,
    {
        let state = self.read();
        if let Some(binding) = agent_id.and_then(|id| state.bindings.get(id)) {
            return binding
                .tool(tool)
                .map(|c| c.server_id.clone())
                .ok_or_else(|| {
                    GatewayError::ToolNotFound(format!(
                        "{tool} (not bound for agent `{}`)",
                        binding.agent_id
                    ))
                    .into()
                });
        }
        let caps = state
            .index
            .get(tool)
            .filter(|caps| !caps.is_empty())
            .ok_or_else(|| GatewayError::ToolNotFound(tool.to_string()))?;
        let chosen = caps
            .iter()
            .find(|c| is_available(&c.server_id))
            .unwrap_or(&caps[0]);
        Ok(chosen.server_id.clone())
    }

    /// Route a call through the agent's binding, or globally when the agent
    /// has none. A `server_id` already on the request pins the call to that
    /// server. The target must be registered in `servers` and enabled.
    ///
    /// Never fails; routing errors come back in the response with zero
    /// attempts.
    pub async fn call_tool_for_agent<F>(
        &self,
        manager: &ClientManager,
        servers: &ServerRegistry,
        agent_id: Option<&str>,
        mut request: ToolCallRequest,
        is_available: F,
    ) -> ToolCallResponse
    where
        F: Fn(&str) -> bool,
    {
        let correlation_id = request.ensure_correlation_id();
        let rejected = |error: ToolCallError, server_id: Option<&str>| {
            let response = ToolCallResponse::failure(error, Default::default())
                .with_attempts(0)
                .with_correlation_id(Some(correlation_id.clone()));
            match server_id {
                Some(id) => response.with_server(id),
                None => response,
            }
        };

        let server_id = match request.server_id.clone() {
            Some(id) => id,
            None => match self.resolve_server(agent_id, &request.tool_name, is_available) {
                Ok(id) => id,
                Err(e) => return rejected(ToolCallError::from_anyhow(&e), None),
            },
        };
        if !servers.contains(&server_id) {
            return rejected(GatewayError::ServerNotFound(server_id.clone()).into(), Some(&server_id));
        }
        if !servers.is_enabled(&server_id) {
            return rejected(GatewayError::ServerDisabled(server_id.clone()).into(), Some(&server_id));
        }
        manager.call_tool(&server_id, request).await
    }

    pub fn reset(&self) {
        *self.write() = ServiceState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers() -> ServerRegistry {
        let registry = ServerRegistry::default();
        registry
            .register(
                crate::registry::ServerDefinition::stdio("cloud", "c")
                    .with_category("cloud")
                    .with_tool(ToolDefinition::new("get_pricing", "price lookup"))
                    .with_tool(ToolDefinition::new("list_regions", "regions with pricing")),
            )
            .unwrap();
        registry
            .register(
                crate::registry::ServerDefinition::stdio("docs", "d")
                    .with_category("docs")
                    .with_tool(ToolDefinition::new("search_docs", ""))
                    .with_tool(ToolDefinition::new("get_pricing", "mirror")),
            )
            .unwrap();
        registry
    }

    fn index() -> (ServerRegistry, ServiceRegistry) {
        let servers = servers();
        let services = ServiceRegistry::new();
        services.rebuild(&servers);
        (servers, services)
    }

    #[test]
    fn test_index_keeps_registration_order() {
        let (_, services) = index();
        let caps = services.find_by_name("get_pricing");
        let ids: Vec<_> = caps.iter().map(|c| c.server_id.as_str()).collect();
        assert_eq!(ids, vec!["cloud", "docs"]);
        assert_eq!(
            services.tool_names(),
            vec!["get_pricing", "list_regions", "search_docs"]
        );
        assert_eq!(services.all_tools().len(), 4);
    }

    #[test]
    fn test_find_tools_matches_names_only() {
        let (_, services) = index();
        let hits = services.find_tools("pricing");
        assert!(hits.iter().all(|c| c.tool.name == "get_pricing"));
        assert_eq!(hits.len(), 2);
        assert_eq!(services.find_tools("PRICING").len(), 2);
        assert_eq!(services.find_tools("get_*").len(), 2);
        assert_eq!(services.find_tools("search_doc?").len(), 1);
        assert!(services.find_tools("nothing").is_empty());
    }

    #[test]
    fn test_disabled_servers_are_not_indexed() {
        let servers = servers();
        servers.disable("docs").unwrap();
        let services = ServiceRegistry::new();
        services.rebuild(&servers);
        assert!(!services.has_tool("search_docs"));
        assert_eq!(services.find_by_name("get_pricing").len(), 1);
    }

    #[test]
    fn test_find_by_category() {
        let (_, services) = index();
        let names: Vec<_> = services
            .find_by_category("Docs")
            .into_iter()
            .map(|c| c.tool.name)
            .collect();
        assert_eq!(names, vec!["get_pricing", "search_docs"]);
    }

    #[test]
    fn test_binding_resolves_requirements() {
        let (_, services) = index();
        let binding = services
            .create_binding(
                "agent-1",
                &BindingRequirements {
                    tools: vec!["get_pricing".into()],
                    categories: vec!["docs".into()],
                    preferred_servers: vec!["docs".into()],
                },
            )
            .unwrap();
        assert_eq!(binding.server_ids, vec!["docs"]);
        let names: Vec<_> = binding.tools.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["get_pricing", "search_docs"]);
        assert_eq!(binding.tool("get_pricing").unwrap().server_id, "docs");
        assert_eq!(services.get_binding("agent-1"), Some(binding));
    }

    #[test]
    fn test_binding_requires_explicit_tools() {
        let (_, services) = index();
        let err = services
            .create_binding(
                "a",
                &BindingRequirements {
                    tools: vec!["missing".into()],
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GatewayError>(),
            Some(GatewayError::ToolNotFound(name)) if name == "missing"
        ));
        assert!(services.get_binding("a").is_none());
    }

    #[test]
    fn test_resolve_prefers_available_then_first_registered() {
        let (_, services) = index();
        assert_eq!(
            services.resolve_server(None, "get_pricing", |_| true).unwrap(),
            "cloud"
        );
        assert_eq!(
            services
                .resolve_server(None, "get_pricing", |id| id != "cloud")
                .unwrap(),
            "docs"
        );
        assert_eq!(
            services.resolve_server(None, "get_pricing", |_| false).unwrap(),
            "cloud"
        );
        assert!(services.resolve_server(None, "missing", |_| true).is_err());
    }

    #[test]
    fn test_binding_rejects_unbound_tools() {
        let (_, services) = index();
        services
            .create_binding(
                "agent",
                &BindingRequirements {
                    tools: vec!["list_regions".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(
            services
                .resolve_server(Some("agent"), "list_regions", |_| true)
                .unwrap(),
            "cloud"
        );
        let err = services
            .resolve_server(Some("agent"), "search_docs", |_| true)
            .unwrap_err();
        assert_eq!(crate::error::error_code(&err), "TOOL_NOT_FOUND");

        // Unknown agents route globally
        assert_eq!(
            services
                .resolve_server(Some("other"), "search_docs", |_| true)
                .unwrap(),
            "docs"
        );
    }

    #[test]
    fn test_remove_server_prunes_index_and_bindings() {
        let (_, services) = index();
        services
            .create_binding(
                "agent",
                &BindingRequirements {
                    categories: vec!["cloud".into(), "docs".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        services.remove_server("cloud");

        assert!(!services.has_tool("list_regions"));
        assert_eq!(services.find_by_name("get_pricing").len(), 1);
        let binding = services.get_binding("agent").unwrap();
        assert_eq!(binding.server_ids, vec!["docs"]);
        assert!(binding.tools.iter().all(|c| c.server_id == "docs"));
        assert!(!binding.has_tool("list_regions"));
    }

    async fn manager_for(servers: &ServerRegistry) -> ClientManager {
        use crate::events::EventBus;
        use crate::mcp::transport::fake::ScriptedFactory;
        use crate::pool::{ConnectionPool, PoolConfig};
        use crate::resilience::{CircuitBreakerConfig, RetryPolicies};
        use std::sync::Arc;

        let pool = Arc::new(ConnectionPool::new(
            PoolConfig::default(),
            Arc::new(ScriptedFactory::new()),
        ));
        let manager = ClientManager::new(
            pool,
            CircuitBreakerConfig::default(),
            RetryPolicies::default(),
            EventBus::default(),
        );
        for definition in servers.list() {
            manager.add_server(&definition).await;
        }
        manager
    }

    #[tokio::test]
    async fn test_call_tool_for_agent_routes_and_rejects() {
        let (servers, services) = index();
        let manager = manager_for(&servers).await;
        let call = |tool: &str| ToolCallRequest::new(tool, serde_json::json!({}));

        let global = services
            .call_tool_for_agent(&manager, &servers, None, call("get_pricing"), |_| true)
            .await;
        assert!(global.success, "{:?}", global.error);
        assert_eq!(global.server_id.as_deref(), Some("cloud"));
        assert_eq!(global.attempts, 1);

        services
            .create_binding(
                "agent",
                &BindingRequirements {
                    tools: vec!["get_pricing".into()],
                    preferred_servers: vec!["docs".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        let bound = services
            .call_tool_for_agent(&manager, &servers, Some("agent"), call("get_pricing"), |_| true)
            .await;
        assert_eq!(bound.server_id.as_deref(), Some("docs"));

        let outside = services
            .call_tool_for_agent(&manager, &servers, Some("agent"), call("list_regions"), |_| true)
            .await;
        assert_eq!(outside.error_code(), Some("TOOL_NOT_FOUND"));
        assert_eq!(outside.attempts, 0);
        assert!(outside.correlation_id.is_some());

        let mut pinned = call("get_pricing");
        pinned.server_id = Some("ghost".into());
        let ghost = services
            .call_tool_for_agent(&manager, &servers, None, pinned, |_| true)
            .await;
        assert_eq!(ghost.error_code(), Some("SERVER_NOT_FOUND"));
        assert_eq!(ghost.server_id.as_deref(), Some("ghost"));
        assert_eq!(ghost.attempts, 0);

        servers.disable("docs").unwrap();
        let disabled = services
            .call_tool_for_agent(&manager, &servers, Some("agent"), call("get_pricing"), |_| true)
            .await;
        assert_eq!(disabled.error_code(), Some("SERVER_DISABLED"));
        assert_eq!(disabled.server_id.as_deref(), Some("docs"));
    }

    #[test]
    fn test_rebuild_keeps_bindings_and_reset_clears() {
        let (servers, services) = index();
        services
            .create_binding("agent", &BindingRequirements::default())
            .unwrap();
        services.rebuild(&servers);
        assert_eq!(services.bindings().len(), 1);
        assert!(services.remove_binding("agent"));
        assert!(!services.remove_binding("agent"));
        services.reset();
        assert!(services.all_tools().is_empty());
    }
}
