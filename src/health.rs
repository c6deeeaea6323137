//! Periodic server health probing
//!
//! The [`HealthMonitor`] keeps one [`HealthCheckResult`] per registered
//! server. On every tick it pings all of them concurrently through a
//! [`HealthProbe`] and classifies each one:
//!
//! - `Unhealthy` once `unhealthy_threshold` consecutive probes failed;
//! - `Degraded` on a failed probe below that threshold, or a probe slower
//!   than `latency_threshold_ms`;
//! - `Healthy` on the first fast success of a fresh server, or after
//!   `healthy_threshold` consecutive fast successes when recovering.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, Result};
use crate::events::{EventBus, GatewayEvent};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Not probed yet
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        })
    }
}

/// Monitor-wide probing parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Bound on a single probe; exceeding it counts as a failure
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,

    /// Successful probes slower than this mark the server degraded
    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: u64,
}

fn default_interval_ms() -> u64 {
    30_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_latency_threshold_ms() -> u64 {
    2_000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            unhealthy_threshold: default_unhealthy_threshold(),
            healthy_threshold: default_healthy_threshold(),
            latency_threshold_ms: default_latency_threshold_ms(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(GatewayError::Config("health.interval_ms must be greater than 0".into()).into());
        }
        if self.unhealthy_threshold == 0 || self.healthy_threshold == 0 {
            return Err(GatewayError::Config("health thresholds must be at least 1".into()).into());
        }
        Ok(())
    }
}

/// Per-server overrides, set on a server definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckOverride {
    /// `false` excludes the server from periodic probing
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub unhealthy_threshold: Option<u32>,
    #[serde(default)]
    pub healthy_threshold: Option<u32>,
    #[serde(default)]
    pub latency_threshold_ms: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

impl Default for HealthCheckOverride {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            unhealthy_threshold: None,
            healthy_threshold: None,
            latency_threshold_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    enabled: bool,
    unhealthy: u32,
    healthy: u32,
    latency: Duration,
}

impl Thresholds {
    fn resolve(config: &HealthConfig, over: Option<&HealthCheckOverride>) -> Self {
        Self {
            enabled: over.map_or(true, |o| o.enabled),
            unhealthy: over
                .and_then(|o| o.unhealthy_threshold)
                .unwrap_or(config.unhealthy_threshold)
                .max(1),
            healthy: over
                .and_then(|o| o.healthy_threshold)
                .unwrap_or(config.healthy_threshold)
                .max(1),
            latency: Duration::from_millis(
                over.and_then(|o| o.latency_threshold_ms)
                    .unwrap_or(config.latency_threshold_ms),
            ),
        }
    }
}

/// Latest known health of one server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub server_id: String,
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_error: Option<String>,
    pub total_checks: u64,
    pub total_failures: u64,
}

impl HealthCheckResult {
    fn new(server_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            status: HealthStatus::Unknown,
            last_check: None,
            latency_ms: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_error: None,
            total_checks: 0,
            total_failures: 0,
        }
    }
}

/// Health of every monitored server at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedHealth {
    pub healthy: Vec<String>,
    pub degraded: Vec<String>,
    pub unhealthy: Vec<String>,
    pub unknown: Vec<String>,
    pub total: usize,
}

impl AggregatedHealth {
    /// No server is unhealthy
    pub fn all_ok(&self) -> bool {
        self.unhealthy.is_empty()
    }
}

/// Something that can ping a server by id
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Round-trip time of a liveness check
    async fn probe(&self, server_id: &str) -> Result<Duration>;
}

struct MonitoredServer {
    thresholds: Thresholds,
    result: HealthCheckResult,
}

/// Periodic prober and health classifier
pub struct HealthMonitor {
    config: HealthConfig,
    probe: Arc<dyn HealthProbe>,
    events: EventBus,
    servers: RwLock<HashMap<String, MonitoredServer>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("servers", &self.server_ids())
            .field("running", &self.is_running())
            .finish()
    }
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, probe: Arc<dyn HealthProbe>, events: EventBus) -> Self {
        Self {
            config,
            probe,
            events,
            servers: RwLock::new(HashMap::new()),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Start tracking a server. Re-registering keeps the existing record and
    /// only refreshes the thresholds.
    pub fn register(&self, server_id: &str, overrides: Option<&HealthCheckOverride>) {
        let thresholds = Thresholds::resolve(&self.config, overrides);
        let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        servers
            .entry(server_id.to_string())
            .and_modify(|s| s.thresholds = thresholds)
            .or_insert_with(|| MonitoredServer {
                thresholds,
                result: HealthCheckResult::new(server_id),
            });
    }

    pub fn unregister(&self, server_id: &str) -> bool {
        self.servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server_id)
            .is_some()
    }

    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn get(&self, server_id: &str) -> Option<HealthCheckResult> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server_id)
            .map(|s| s.result.clone())
    }

    pub fn status(&self, server_id: &str) -> Option<HealthStatus> {
        self.get(server_id).map(|r| r.status)
    }

    pub fn is_server_healthy(&self, server_id: &str) -> bool {
        self.status(server_id) == Some(HealthStatus::Healthy)
    }

    pub fn results(&self) -> Vec<HealthCheckResult> {
        let mut out: Vec<_> = self
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|s| s.result.clone())
            .collect();
        out.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        out
    }

    pub fn snapshot(&self) -> AggregatedHealth {
        let mut agg = AggregatedHealth::default();
        for r in self.results() {
            agg.total += 1;
            match r.status {
                HealthStatus::Healthy => agg.healthy.push(r.server_id),
                HealthStatus::Degraded => agg.degraded.push(r.server_id),
                HealthStatus::Unhealthy => agg.unhealthy.push(r.server_id),
                HealthStatus::Unknown => agg.unknown.push(r.server_id),
            }
        }
        agg
    }

    /// Mark a server unhealthy without probing it, e.g. after a failed
    /// initial connect.
    pub fn mark_unhealthy(&self, server_id: &str, reason: &str) {
        let previous = {
            let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
            let Some(server) = servers.get_mut(server_id) else {
                return;
            };
            let r = &mut server.result;
            let previous = r.status;
            r.status = HealthStatus::Unhealthy;
            r.last_error = Some(reason.to_string());
            r.consecutive_successes = 0;
            previous
        };
        if previous != HealthStatus::Unhealthy {
            tracing::warn!(server = %server_id, "marked unhealthy: {reason}");
            self.events.emit(GatewayEvent::ServerUnhealthy {
                server_id: server_id.to_string(),
                previous,
            });
        }
    }

    /// Probe one server now, outside the periodic schedule.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ServerNotFound`] if the server is not monitored.
    pub async fn check_now(&self, server_id: &str) -> Result<HealthCheckResult> {
        if self.get(server_id).is_none() {
            return Err(GatewayError::ServerNotFound(server_id.to_string()).into());
        }
        Ok(self.probe_one(server_id.to_string()).await)
    }

    /// Probe every enabled server concurrently
    pub async fn check_all(&self) -> Vec<HealthCheckResult> {
        let ids: Vec<String> = self
            .servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, s)| s.thresholds.enabled)
            .map(|(id, _)| id.clone())
            .collect();
        futures::future::join_all(ids.into_iter().map(|id| self.probe_one(id))).await
    }

    async fn probe_one(&self, server_id: String) -> HealthCheckResult {
        let outcome = tokio::time::timeout(self.config.probe_timeout(), self.probe.probe(&server_id))
            .await
            .unwrap_or_else(|_| {
                Err(GatewayError::Timeout {
                    operation: format!("health probe {server_id}"),
                    timeout_ms: self.config.probe_timeout_ms,
                }
                .into())
            });
        self.record(&server_id, outcome)
    }

    fn record(&self, server_id: &str, outcome: Result<Duration>) -> HealthCheckResult {
        let (previous, result) = {
            let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
            let Some(server) = servers.get_mut(server_id) else {
                // Unregistered while the probe was in flight
                let mut r = HealthCheckResult::new(server_id);
                r.last_error = Some("server is no longer monitored".into());
                return r;
            };
            let t = server.thresholds;
            let r = &mut server.result;
            let previous = r.status;
            r.last_check = Some(Utc::now());
            r.total_checks += 1;

            match &outcome {
                Ok(latency) => {
                    r.latency_ms = Some(latency.as_millis() as u64);
                    r.consecutive_failures = 0;
                    r.last_error = None;
                    if *latency > t.latency {
                        r.consecutive_successes = 0;
                        r.status = HealthStatus::Degraded;
                    } else {
                        r.consecutive_successes += 1;
                        r.status = match previous {
                            HealthStatus::Unknown | HealthStatus::Healthy => HealthStatus::Healthy,
                            _ if r.consecutive_successes >= t.healthy => HealthStatus::Healthy,
                            other => other,
                        };
                    }
                }
                Err(e) => {
                    r.latency_ms = None;
                    r.total_failures += 1;
                    r.consecutive_successes = 0;
                    r.consecutive_failures += 1;
                    r.last_error = Some(format!("{e:#}"));
                    r.status = if r.consecutive_failures >= t.unhealthy {
                        HealthStatus::Unhealthy
                    } else if previous == HealthStatus::Unhealthy {
                        HealthStatus::Unhealthy
                    } else {
                        HealthStatus::Degraded
                    };
                }
            }
            (previous, r.clone())
        };

        tracing::debug!(
            server = %server_id,
            status = %result.status,
            latency_ms = ?result.latency_ms,
            "health probe"
        );
        self.events.emit(GatewayEvent::HealthCheck {
            server_id: server_id.to_string(),
            status: result.status,
            latency_ms: result.latency_ms.unwrap_or(0),
            success: outcome.is_ok(),
        });

        if previous != result.status {
            let server_id = server_id.to_string();
            let event = match result.status {
                HealthStatus::Healthy => {
                    tracing::info!(server = %server_id, "server is healthy ({previous} -> healthy)");
                    Some(GatewayEvent::ServerHealthy { server_id, previous })
                }
                HealthStatus::Degraded => {
                    tracing::warn!(
                        server = %server_id,
                        error = ?result.last_error,
                        "server is degraded"
                    );
                    Some(GatewayEvent::ServerDegraded { server_id, previous })
                }
                HealthStatus::Unhealthy => {
                    tracing::warn!(
                        server = %server_id,
                        failures = result.consecutive_failures,
                        error = ?result.last_error,
                        "server is unhealthy"
                    );
                    Some(GatewayEvent::ServerUnhealthy { server_id, previous })
                }
                HealthStatus::Unknown => None,
            };
            if let Some(event) = event {
                self.events.emit(event);
            }
        }
        result
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Start probing every `interval_ms`. The first probe runs one interval
    /// after start. Calling `start` on a running monitor does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|(_, h)| !h.is_finished()) {
            return;
        }
        let cancel = CancellationToken::new();
        let period = self.config.interval();
        let monitor = Arc::downgrade(self);
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(monitor) = monitor.upgrade() else { break };
                        monitor.check_all().await;
                    }
                }
            }
            tracing::debug!("health monitor stopped");
        });
        tracing::info!(interval_ms = self.config.interval_ms, "health monitor started");
        *task = Some((cancel, handle));
    }

    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            let _ = handle.await;
        }
    }

    /// Forget every server and stop probing
    pub async fn reset(&self) {
        self.stop().await;
        self.servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            cancel.cancel();
        }
    }
}
