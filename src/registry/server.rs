//! Server definitions and the server registry
//!
//! A [`ServerDefinition`] describes how to reach one tool server. The
//! [`ServerRegistry`] validates and stores definitions, tracks enablement,
//! and caches each server's tool list with a time-to-live.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{GatewayError, Result};
use crate::events::{EventBus, GatewayEvent};
use crate::health::HealthCheckOverride;
use crate::mcp::framing::Framing;
use crate::mcp::transport::TransportKind;
use crate::mcp::types::ToolDefinition;
use crate::resilience::RetryConfig;

/// Default lifetime of a cached tool list
pub const DEFAULT_TOOL_CACHE_TTL: Duration = Duration::from_secs(300);

fn default_true() -> bool {
    true
}

fn default_category() -> String {
    "general".to_string()
}

/// Declaration of one tool server
///
/// # Examples
///
/// ```
/// use toolgate::registry::ServerDefinition;
///
/// let def = ServerDefinition::stdio("files", "npx")
///     .with_name("Filesystem")
///     .with_args(["-y", "@modelcontextprotocol/server-filesystem", "/tmp"])
///     .with_env("LOG_LEVEL", "${FS_LOG_LEVEL}")
///     .with_category("storage");
/// assert!(def.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDefinition {
    pub id: String,

    /// Human readable name
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default = "default_category")]
    pub category: String,

    #[serde(default)]
    pub transport: TransportKind,

    /// Executable for stdio servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Extra environment; values may contain `${VAR}` placeholders
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// URL for network transports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default)]
    pub framing: Framing,

    /// Default timeout for calls to this server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckOverride>,

    /// Tools the server is known to offer before it is first contacted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

impl ServerDefinition {
    fn bare(id: &str, transport: TransportKind) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            description: None,
            category: default_category(),
            transport,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            endpoint: None,
            enabled: true,
            tags: Vec::new(),
            framing: Framing::default(),
            request_timeout_ms: None,
            retry: None,
            health_check: None,
            tools: Vec::new(),
        }
    }

    /// A stdio server; the name defaults to the id
    pub fn stdio(id: impl AsRef<str>, command: impl Into<String>) -> Self {
        let mut def = Self::bare(id.as_ref(), TransportKind::Stdio);
        def.command = Some(command.into());
        def
    }

    /// A server reached over a network transport
    pub fn network(id: impl AsRef<str>, transport: TransportKind, endpoint: impl Into<String>) -> Self {
        let mut def = Self::bare(id.as_ref(), transport);
        def.endpoint = Some(endpoint.into());
        def
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_health_check(mut self, health_check: HealthCheckOverride) -> Self {
        self.health_check = Some(health_check);
        self
    }

    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Check the definition is complete for its transport kind.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Validation`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> anyhow::Error { GatewayError::Validation(msg).into() };

        if self.id.trim().is_empty() {
            return Err(invalid("server id must not be empty".into()));
        }
        if self.id.chars().any(char::is_whitespace) {
            return Err(invalid(format!("server id `{}` must not contain whitespace", self.id)));
        }
        if self.name.trim().is_empty() {
            return Err(invalid(format!("server `{}` has no name", self.id)));
        }
        if self.request_timeout_ms == Some(0) {
            return Err(invalid(format!(
                "server `{}` request_timeout_ms must be greater than 0",
                self.id
            )));
        }
        if let Some(retry) = &self.retry {
            retry
                .validate()
                .map_err(|e| invalid(format!("server `{}` retry: {e}", self.id)))?;
        }

        match self.transport {
            TransportKind::Stdio => {
                if self.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    return Err(invalid(format!(
                        "stdio server `{}` requires a command",
                        self.id
                    )));
                }
            }
            kind => {
                let endpoint = self.endpoint.as_deref().unwrap_or_default();
                if endpoint.trim().is_empty() {
                    return Err(invalid(format!(
                        "{kind} server `{}` requires an endpoint URL",
                        self.id
                    )));
                }
                let url = Url::parse(endpoint).map_err(|e| {
                    invalid(format!("server `{}` endpoint `{endpoint}` is not a URL: {e}", self.id))
                })?;
                let allowed: &[&str] = match kind {
                    TransportKind::WebSocket => &["ws", "wss"],
                    _ => &["http", "https"],
                };
                if !allowed.contains(&url.scheme()) {
                    return Err(invalid(format!(
                        "server `{}` endpoint scheme `{}` does not match transport {kind} (expected {})",
                        self.id,
                        url.scheme(),
                        allowed.join(" or ")
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Criteria for [`ServerRegistry::filter`]; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerFilter {
    pub category: Option<String>,
    pub transport: Option<TransportKind>,
    pub tag: Option<String>,
    pub enabled: Option<bool>,
}

impl ServerFilter {
    pub fn enabled() -> Self {
        Self {
            enabled: Some(true),
            ..Self::default()
        }
    }

    fn matches(&self, def: &ServerDefinition) -> bool {
        self.category
            .as_ref()
            .map_or(true, |c| def.category.eq_ignore_ascii_case(c))
            && self.transport.map_or(true, |t| def.transport == t)
            && self.tag.as_ref().map_or(true, |t| def.tags.iter().any(|x| x == t))
            && self.enabled.map_or(true, |e| def.enabled == e)
    }
}

#[derive(Debug, Clone)]
struct CachedTools {
    tools: Vec<ToolDefinition>,
    fetched_at: Instant,
}

#[derive(Debug, Clone)]
struct ServerEntry {
    definition: ServerDefinition,
    seq: u64,
    registered_at: DateTime<Utc>,
    tools: Option<CachedTools>,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<String, ServerEntry>,
    next_seq: u64,
}

/// Summary row for listings
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub id: String,
    pub name: String,
    pub category: String,
    pub transport: TransportKind,
    pub enabled: bool,
    pub tool_count: usize,
    pub registered_at: DateTime<Utc>,
}

/// Catalog of server definitions
#[derive(Debug)]
pub struct ServerRegistry {
    state: RwLock<RegistryState>,
    tool_ttl: Duration,
    events: EventBus,
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new(EventBus::default())
    }
}

impl ServerRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            tool_ttl: DEFAULT_TOOL_CACHE_TTL,
            events,
        }
    }

    pub fn with_tool_ttl(mut self, ttl: Duration) -> Self {
        self.tool_ttl = ttl;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a definition.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Validation`] if the definition is invalid or
    /// the id is taken.
    pub fn register(&self, definition: ServerDefinition) -> Result<()> {
        definition.validate()?;
        let id = definition.id.clone();
        {
            let mut state = self.write();
            if state.entries.contains_key(&id) {
                return Err(GatewayError::Validation(format!("server `{id}` is already registered")).into());
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.insert(
                id.clone(),
                ServerEntry {
                    definition,
                    seq,
                    registered_at: Utc::now(),
                    tools: None,
                },
            );
        }
        tracing::info!(server = %id, "server registered");
        self.events.emit(GatewayEvent::ServerRegistered { server_id: id });
        Ok(())
    }

    /// Replace an existing definition. The tool cache is dropped.
    pub fn update(&self, definition: ServerDefinition) -> Result<()> {
        definition.validate()?;
        let id = definition.id.clone();
        {
            let mut state = self.write();
            let entry = state
                .entries
                .get_mut(&id)
                .ok_or_else(|| GatewayError::ServerNotFound(id.clone()))?;
            entry.definition = definition;
            entry.tools = None;
        }
        tracing::info!(server = %id, "server updated");
        self.events.emit(GatewayEvent::ServerUpdated { server_id: id });
        Ok(())
    }

    pub fn unregister(&self, server_id: &str) -> Result<ServerDefinition> {
        let entry = self
            .write()
            .entries
            .remove(server_id)
            .ok_or_else(|| GatewayError::ServerNotFound(server_id.to_string()))?;
        tracing::info!(server = %server_id, "server unregistered");
        self.events.emit(GatewayEvent::ServerUnregistered {
            server_id: server_id.to_string(),
        });
        Ok(entry.definition)
    }

    pub fn get(&self, server_id: &str) -> Option<ServerDefinition> {
        self.read().entries.get(server_id).map(|e| e.definition.clone())
    }

    /// Like [`ServerRegistry::get`] but an error when missing
    pub fn require(&self, server_id: &str) -> Result<ServerDefinition> {
        self.get(server_id)
            .ok_or_else(|| GatewayError::ServerNotFound(server_id.to_string()).into())
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.read().entries.contains_key(server_id)
    }

    /// All definitions in registration order
    pub fn list(&self) -> Vec<ServerDefinition> {
        let state = self.read();
        let mut entries: Vec<_> = state.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.definition.clone()).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.list().into_iter().map(|d| d.id).collect()
    }

    pub fn filter(&self, filter: &ServerFilter) -> Vec<ServerDefinition> {
        self.list().into_iter().filter(|d| filter.matches(d)).collect()
    }

    pub fn summaries(&self) -> Vec<ServerSummary> {
        let state = self.read();
        let mut entries: Vec<_> = state.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries
            .into_iter()
            .map(|e| ServerSummary {
                id: e.definition.id.clone(),
                name: e.definition.name.clone(),
                category: e.definition.category.clone(),
                transport: e.definition.transport,
                enabled: e.definition.enabled,
                tool_count: e
                    .tools
                    .as_ref()
                    .map_or(e.definition.tools.len(), |c| c.tools.len()),
                registered_at: e.registered_at,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    fn set_enabled(&self, server_id: &str, enabled: bool) -> Result<bool> {
        let changed = {
            let mut state = self.write();
            let entry = state
                .entries
                .get_mut(server_id)
                .ok_or_else(|| GatewayError::ServerNotFound(server_id.to_string()))?;
            let changed = entry.definition.enabled != enabled;
            entry.definition.enabled = enabled;
            changed
        };
        if changed {
            let server_id = server_id.to_string();
            tracing::info!(server = %server_id, enabled, "server enablement changed");
            self.events.emit(if enabled {
                GatewayEvent::ServerEnabled { server_id }
            } else {
                GatewayEvent::ServerDisabled { server_id }
            });
        }
        Ok(changed)
    }

    /// Returns whether the flag changed
    pub fn enable(&self, server_id: &str) -> Result<bool> {
        self.set_enabled(server_id, true)
    }

    pub fn disable(&self, server_id: &str) -> Result<bool> {
        self.set_enabled(server_id, false)
    }

    pub fn is_enabled(&self, server_id: &str) -> bool {
        self.read()
            .entries
            .get(server_id)
            .is_some_and(|e| e.definition.enabled)
    }

    /// Replace the cached tool list of a server
    pub fn set_tools(&self, server_id: &str, tools: Vec<ToolDefinition>) -> Result<()> {
        let count = tools.len();
        {
            let mut state = self.write();
            let entry = state
                .entries
                .get_mut(server_id)
                .ok_or_else(|| GatewayError::ServerNotFound(server_id.to_string()))?;
            entry.tools = Some(CachedTools {
                tools,
                fetched_at: Instant::now(),
            });
        }
        tracing::debug!(server = %server_id, count, "tool cache refreshed");
        self.events.emit(GatewayEvent::ToolsRefreshed {
            server_id: server_id.to_string(),
            count,
        });
        Ok(())
    }

    /// Cached tools, or `None` when never fetched or expired. An expired
    /// cache is dropped on read.
    pub fn cached_tools(&self, server_id: &str) -> Option<Vec<ToolDefinition>> {
        {
            let state = self.read();
            let cache = state.entries.get(server_id)?.tools.as_ref()?;
            if cache.fetched_at.elapsed() < self.tool_ttl {
                return Some(cache.tools.clone());
            }
        }
        self.invalidate_tools(server_id);
        tracing::debug!(server = %server_id, "tool cache expired");
        None
    }

    pub fn invalidate_tools(&self, server_id: &str) {
        if let Some(entry) = self.write().entries.get_mut(server_id) {
            entry.tools = None;
        }
    }

    /// Cached tools when fresh, otherwise the tools declared on the
    /// definition
    pub fn known_tools(&self, server_id: &str) -> Vec<ToolDefinition> {
        match self.cached_tools(server_id) {
            Some(tools) => tools,
            None => self
                .get(server_id)
                .map(|d| d.tools)
                .unwrap_or_default(),
        }
    }

    /// Whether the server's tool cache needs a refresh
    pub fn tools_stale(&self, server_id: &str) -> bool {
        self.cached_tools(server_id).is_none()
    }

    pub fn reset(&self) {
        *self.write() = RegistryState::default();
    }
}
