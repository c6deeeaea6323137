//! Resilient call path to servers
//!
//! [`ClientManager`] is the only component that talks to transports. Each
//! call runs as: circuit breaker check, then the retry policy around
//! "acquire a pooled connection and call", then one breaker update from the
//! final outcome. Pings and tool listings share a live connection instead of
//! waiting for a free one.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{histogram, increment_counter};

use crate::error::{self, GatewayError, Result};
use crate::events::EventBus;
use crate::health::HealthProbe;
use crate::mcp::transport::ServerTransport;
use crate::mcp::types::ToolDefinition;
use crate::pool::{ConnectionPool, PoolStats};
use crate::registry::ServerDefinition;
use crate::resilience::{
    CircuitBreakerConfig, CircuitBreakerManager, CircuitSnapshot, CircuitState, RetryPolicies,
    RetryPolicy,
};
use crate::tool_call::{ToolCallError, ToolCallRequest, ToolCallResponse};

/// Call statistics for one server
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCallStats {
    pub server_id: String,
    pub circuit: CircuitState,
    pub pool: Option<PoolStats>,
}

/// Facade over the pool, breakers and retry policies
pub struct ClientManager {
    pool: Arc<ConnectionPool>,
    breakers: CircuitBreakerManager,
    retry: RetryPolicies,
    server_retry: RwLock<HashMap<String, RetryPolicy>>,
}

impl std::fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientManager")
            .field("pool", &self.pool)
            .field("retry_policies", &self.retry.names())
            .finish()
    }
}

impl ClientManager {
    pub fn new(
        pool: Arc<ConnectionPool>,
        breaker_config: CircuitBreakerConfig,
        retry: RetryPolicies,
        events: EventBus,
    ) -> Self {
        Self {
            pool,
            breakers: CircuitBreakerManager::new(breaker_config, events),
            retry,
            server_retry: RwLock::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn breakers(&self) -> &CircuitBreakerManager {
        &self.breakers
    }

    /// Make a server callable. A retry override on the definition replaces
    /// the default policy for that server.
    pub async fn add_server(&self, definition: &ServerDefinition) {
        let mut overrides = self.server_retry.write().unwrap_or_else(PoisonError::into_inner);
        match &definition.retry {
            Some(config) => {
                overrides.insert(
                    definition.id.clone(),
                    RetryPolicy::new(format!("server:{}", definition.id), config.clone()),
                );
            }
            None => {
                overrides.remove(&definition.id);
            }
        }
        drop(overrides);
        self.pool.add_server(definition.clone()).await;
    }

    /// Close the server's connections and forget its breaker
    pub async fn remove_server(&self, server_id: &str) -> bool {
        self.server_retry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server_id);
        self.breakers.remove(server_id);
        self.pool.remove_server(server_id).await
    }

    pub fn has_server(&self, server_id: &str) -> bool {
        self.pool.contains(server_id)
    }

    /// Retry policy in effect for `server_id`
    pub fn policy_for(&self, server_id: &str) -> RetryPolicy {
        self.server_retry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_id)
            .cloned()
            .unwrap_or_else(|| self.retry.default_policy().clone())
    }

    /// Open the server's minimum connections (at least one), completing the
    /// handshake on each.
    pub async fn connect(&self, server_id: &str) -> Result<usize> {
        if !self.pool.contains(server_id) {
            return Err(GatewayError::ServerNotFound(server_id.to_string()).into());
        }
        self.pool.warm_up(server_id).await
    }

    /// Close the server's connections; it stays callable.
    pub async fn disconnect(&self, server_id: &str) -> Result<()> {
        self.pool.close_server(server_id).await
    }

    /// Whether calls to the server would currently be attempted
    pub fn is_available(&self, server_id: &str) -> bool {
        self.pool.contains(server_id) && !self.breakers.is_open(server_id)
    }

    /// Call a tool on `server_id`. Never fails; every outcome is folded into
    /// the response.
    pub async fn call_tool(&self, server_id: &str, mut request: ToolCallRequest) -> ToolCallResponse {
        let started = Instant::now();
        let correlation_id = request.ensure_correlation_id();
        request.server_id = Some(server_id.to_string());
        let tool = request.tool_name.clone();

        let response = self.call_resilient(server_id, request).await;
        let response = response
            .with_duration(started.elapsed())
            .with_correlation_id(Some(correlation_id))
            .with_server(server_id);

        record_call_metrics(server_id, &tool, &response, started.elapsed());
        response
    }

    async fn call_resilient(&self, server_id: &str, request: ToolCallRequest) -> ToolCallResponse {
        if !self.pool.contains(server_id) {
            let err = GatewayError::ServerNotFound(server_id.to_string());
            return ToolCallResponse::failure(err.into(), Duration::ZERO).with_attempts(0);
        }

        let breaker = self.breakers.get(server_id);
        let permit = match breaker.permit() {
            Ok(permit) => permit,
            Err(e) => {
                tracing::debug!(server = %server_id, tool = %request.tool_name, "call rejected by open circuit");
                return ToolCallResponse::failure(ToolCallError::from_anyhow(&e), Duration::ZERO)
                    .with_attempts(0);
            }
        };

        let policy = self.policy_for(server_id);
        let outcome = policy
            .execute_with_outcome(|attempt| {
                let request = request.clone();
                async move {
                    if attempt > 0 {
                        tracing::debug!(server = %server_id, tool = %request.tool_name, attempt, "retrying tool call");
                    }
                    let connection = self.pool.acquire(server_id).await?;
                    let response = connection.call_tool(request).await;
                    drop(connection);
                    match response.error.clone() {
                        Some(err) if !response.success => Err(anyhow::Error::new(err)),
                        _ => Ok(response),
                    }
                }
            })
            .await;

        match &outcome.result {
            Ok(_) => permit.success(),
            // Tool-level failures show the server is answering
            Err(e) if error::is_retryable(e) => permit.failure(),
            Err(_) => permit.success(),
        }

        match outcome.result {
            Ok(response) => response.with_attempts(outcome.attempts),
            Err(e) => {
                let error = ToolCallError::from_anyhow(&e);
                tracing::warn!(
                    server = %server_id,
                    tool = %request.tool_name,
                    code = %error.code,
                    attempts = outcome.attempts,
                    "tool call failed"
                );
                ToolCallResponse::failure(error, Duration::ZERO).with_attempts(outcome.attempts)
            }
        }
    }

    /// Fetch the server's live tool list over any live connection
    pub async fn list_tools(&self, server_id: &str) -> Result<Vec<ToolDefinition>> {
        let connection = self.pool.shared(server_id).await?;
        connection.list_tools().await
    }

    /// Ping the server over any live connection, busy or not
    pub async fn ping(&self, server_id: &str) -> Result<Duration> {
        let connection = self.pool.shared(server_id).await?;
        connection.ping().await
    }

    pub fn circuit_snapshots(&self) -> Vec<CircuitSnapshot> {
        self.breakers.snapshots()
    }

    pub fn stats(&self) -> Vec<ServerCallStats> {
        self.pool
            .server_ids()
            .into_iter()
            .map(|id| ServerCallStats {
                circuit: self.breakers.get(&id).state(),
                pool: self.pool.server_stats(&id),
                server_id: id,
            })
            .collect()
    }

    /// Close every connection
    pub async fn shutdown(&self) {
        self.pool.stop_sweeper().await;
        self.pool.close_all().await;
        tracing::info!("client manager shut down");
    }
}

#[async_trait]
impl HealthProbe for ClientManager {
    async fn probe(&self, server_id: &str) -> Result<Duration> {
        self.ping(server_id).await
    }
}

fn record_call_metrics(server_id: &str, tool: &str, response: &ToolCallResponse, elapsed: Duration) {
    increment_counter!(
        "toolgate_tool_calls_total",
        "server" => server_id.to_string(),
        "tool" => tool.to_string()
    );
    if let Some(code) = response.error_code() {
        increment_counter!(
            "toolgate_tool_call_errors_total",
            "server" => server_id.to_string(),
            "tool" => tool.to_string(),
            "code" => code.to_string()
        );
    }
    histogram!(
        "toolgate_tool_call_duration_seconds",
        elapsed.as_secs_f64(),
        "server" => server_id.to_string(),
        "tool" => tool.to_string()
    );
}
