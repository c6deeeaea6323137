//! In-process tool adapters
//!
//! Adapters expose tools without a transport. Each is registered up front
//! with its [`AdapterMetadata`] and an [`AdapterFactory`]; the instance is
//! built on first use and shared afterwards.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{GatewayError, Result};
use crate::events::{EventBus, GatewayEvent};
use crate::mcp::types::ToolDefinition;
use crate::tool_call::{ToolCallError, ToolCallResponse};

/// A provider of tools living in this process
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
/// use toolgate::error::Result;
/// use toolgate::registry::ToolAdapter;
///
/// struct Clock;
///
/// #[async_trait]
/// impl ToolAdapter for Clock {
///     async fn call_tool(&self, _tool: &str, _arguments: Value) -> Result<Value> {
///         Ok(json!({ "now": "2026-01-01T00:00:00Z" }))
///     }
///
///     async fn dispose(&self) -> Result<()> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value>;

    /// Release anything the adapter holds. Called once per instance.
    async fn dispose(&self) -> Result<()>;
}

/// Configuration handed to an adapter factory
pub type AdapterConfig = HashMap<String, Value>;

/// Future returned by an [`AdapterFactory`]
pub type AdapterFuture = Pin<Box<dyn Future<Output = Result<Arc<dyn ToolAdapter>>> + Send>>;

/// Builds an adapter instance from its configuration
pub type AdapterFactory = Arc<dyn Fn(AdapterConfig) -> AdapterFuture + Send + Sync>;

/// Describes an adapter before it is instantiated
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterMetadata {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    /// Keys the configuration must contain
    #[serde(default)]
    pub required_config: Vec<String>,
    #[serde(default)]
    pub optional_config: Vec<String>,
}

impl AdapterMetadata {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_required_config<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_config = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn offers(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t.name == tool)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterStatus {
    #[default]
    Registered,
    Initializing,
    Ready,
    Error,
}

impl fmt::Display for AdapterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AdapterStatus::Registered => "registered",
            AdapterStatus::Initializing => "initializing",
            AdapterStatus::Ready => "ready",
            AdapterStatus::Error => "error",
        })
    }
}

/// Listing row for one registration
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterInfo {
    pub metadata: AdapterMetadata,
    pub status: AdapterStatus,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedFailure {
    message: String,
    validation: bool,
    at: Instant,
}

impl CachedFailure {
    fn to_error(&self, adapter_id: &str) -> anyhow::Error {
        if self.validation {
            GatewayError::Validation(self.message.clone()).into()
        } else {
            GatewayError::AdapterInit {
                adapter: adapter_id.to_string(),
                message: self.message.clone(),
            }
            .into()
        }
    }
}

#[derive(Default)]
struct Slot {
    instance: Option<Arc<dyn ToolAdapter>>,
    failure: Option<CachedFailure>,
}

struct AdapterEntry {
    metadata: AdapterMetadata,
    factory: AdapterFactory,
    config: AdapterConfig,
    seq: u64,
    /// Held across initialisation so concurrent first calls build once
    slot: Mutex<Slot>,
    status: StdMutex<(AdapterStatus, Option<String>)>,
}

impl AdapterEntry {
    fn set_status(&self, status: AdapterStatus, error: Option<String>) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = (status, error);
    }

    fn info(&self) -> AdapterInfo {
        let (status, last_error) = self
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        AdapterInfo {
            metadata: self.metadata.clone(),
            status,
            last_error,
        }
    }
}

/// Directory of lazily built adapters
pub struct AdapterRegistry {
    entries: RwLock<HashMap<String, Arc<AdapterEntry>>>,
    next_seq: StdMutex<u64>,
    error_ttl: Option<Duration>,
    events: EventBus,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.ids())
            .field("error_ttl", &self.error_ttl)
            .finish()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new(EventBus::default())
    }
}

impl AdapterRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_seq: StdMutex::new(0),
            error_ttl: None,
            events,
        }
    }

    /// Retry a failed initialisation once `ttl` has passed. Without a TTL
    /// failures stick until the adapter is disposed.
    pub fn with_error_ttl(mut self, ttl: Duration) -> Self {
        self.error_ttl = Some(ttl);
        self
    }

    fn entry(&self, adapter_id: &str) -> Result<Arc<AdapterEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(adapter_id)
            .cloned()
            .ok_or_else(|| GatewayError::AdapterNotFound(adapter_id.to_string()).into())
    }

    fn ordered(&self) -> Vec<Arc<AdapterEntry>> {
        let mut entries: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    /// Add an adapter. Nothing is constructed until the first call.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Validation`] for an empty or duplicate id.
    pub fn register(
        &self,
        metadata: AdapterMetadata,
        factory: AdapterFactory,
        config: AdapterConfig,
    ) -> Result<()> {
        let id = metadata.id.clone();
        if id.trim().is_empty() {
            return Err(GatewayError::Validation("adapter id must not be empty".into()).into());
        }
        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            if entries.contains_key(&id) {
                return Err(GatewayError::Validation(format!("adapter `{id}` is already registered")).into());
            }
            let seq = {
                let mut next = self.next_seq.lock().unwrap_or_else(PoisonError::into_inner);
                *next += 1;
                *next
            };
            entries.insert(
                id.clone(),
                Arc::new(AdapterEntry {
                    metadata,
                    factory,
                    config,
                    seq,
                    slot: Mutex::new(Slot::default()),
                    status: StdMutex::new((AdapterStatus::Registered, None)),
                }),
            );
        }
        tracing::info!(adapter = %id, "adapter registered");
        self.events.emit(GatewayEvent::AdapterRegistered { adapter_id: id });
        Ok(())
    }

    /// The adapter's instance, building it on first use.
    ///
    /// # Errors
    ///
    /// [`GatewayError::AdapterNotFound`] for unknown ids,
    /// [`GatewayError::Validation`] when required configuration is missing,
    /// and [`GatewayError::AdapterInit`] when the factory fails. Failures are
    /// cached until the error TTL passes.
    pub async fn instance(&self, adapter_id: &str) -> Result<Arc<dyn ToolAdapter>> {
        let entry = self.entry(adapter_id)?;
        let mut slot = entry.slot.lock().await;
        if let Some(instance) = &slot.instance {
            return Ok(Arc::clone(instance));
        }
        if let Some(failure) = &slot.failure {
            let expired = self
                .error_ttl
                .is_some_and(|ttl| failure.at.elapsed() >= ttl);
            if !expired {
                return Err(failure.to_error(adapter_id));
            }
            tracing::debug!(adapter = %adapter_id, "retrying adapter initialization");
        }

        entry.set_status(AdapterStatus::Initializing, None);
        let missing: Vec<&str> = entry
            .metadata
            .required_config
            .iter()
            .filter(|k| !entry.config.contains_key(k.as_str()))
            .map(String::as_str)
            .collect();
        let built = if missing.is_empty() {
            (entry.factory)(entry.config.clone()).await.map_err(|e| CachedFailure {
                message: format!("{e:#}"),
                validation: false,
                at: Instant::now(),
            })
        } else {
            Err(CachedFailure {
                message: format!(
                    "adapter `{adapter_id}` is missing required config: {}",
                    missing.join(", ")
                ),
                validation: true,
                at: Instant::now(),
            })
        };

        match built {
            Ok(instance) => {
                slot.instance = Some(Arc::clone(&instance));
                slot.failure = None;
                entry.set_status(AdapterStatus::Ready, None);
                tracing::info!(adapter = %adapter_id, "adapter initialized");
                self.events.emit(GatewayEvent::AdapterInitialized {
                    adapter_id: adapter_id.to_string(),
                });
                Ok(instance)
            }
            Err(failure) => {
                tracing::error!(adapter = %adapter_id, error = %failure.message, "adapter initialization failed");
                entry.set_status(AdapterStatus::Error, Some(failure.message.clone()));
                self.events.emit(GatewayEvent::AdapterError {
                    adapter_id: adapter_id.to_string(),
                    message: failure.message.clone(),
                });
                let err = failure.to_error(adapter_id);
                slot.failure = Some(failure);
                Err(err)
            }
        }
    }

    /// First adapter, in registration order, that offers `tool`
    pub fn find_adapter_for(&self, tool: &str) -> Option<String> {
        self.ordered()
            .into_iter()
            .find(|e| e.metadata.offers(tool))
            .map(|e| e.metadata.id.clone())
    }

    pub fn has_tool(&self, tool: &str) -> bool {
        self.find_adapter_for(tool).is_some()
    }

    /// Every declared tool with the adapter that offers it
    pub fn tools(&self) -> Vec<(String, ToolDefinition)> {
        self.ordered()
            .into_iter()
            .flat_map(|e| {
                let id = e.metadata.id.clone();
                e.metadata
                    .tools
                    .clone()
                    .into_iter()
                    .map(move |t| (id.clone(), t))
            })
            .collect()
    }

    /// Run `tool` on whichever adapter offers it. Never fails; errors come
    /// back in the response.
    pub async fn invoke_tool(&self, tool: &str, arguments: Value) -> ToolCallResponse {
        match self.find_adapter_for(tool) {
            Some(adapter_id) => self.invoke(&adapter_id, tool, arguments).await,
            None => ToolCallResponse::failure(
                GatewayError::ToolNotFound(tool.to_string()).into(),
                Duration::ZERO,
            ),
        }
    }

    /// Run `tool` on a specific adapter
    pub async fn invoke(&self, adapter_id: &str, tool: &str, arguments: Value) -> ToolCallResponse {
        let started = Instant::now();
        let result = match self.instance(adapter_id).await {
            Ok(adapter) => adapter
                .call_tool(tool, arguments)
                .await
                .map_err(|e| adapter_call_error(&e)),
            Err(e) => Err(ToolCallError::from_anyhow(&e)),
        };
        let response = match result {
            Ok(data) => ToolCallResponse::success(data, started.elapsed()),
            Err(error) => {
                tracing::warn!(adapter = %adapter_id, tool = %tool, code = %error.code, "adapter call failed");
                ToolCallResponse::failure(error, started.elapsed())
            }
        };
        response.with_adapter(adapter_id)
    }

    pub fn status(&self, adapter_id: &str) -> Option<AdapterStatus> {
        self.entry(adapter_id).ok().map(|e| e.info().status)
    }

    pub fn get(&self, adapter_id: &str) -> Option<AdapterInfo> {
        self.entry(adapter_id).ok().map(|e| e.info())
    }

    pub fn list(&self) -> Vec<AdapterInfo> {
        self.ordered().iter().map(|e| e.info()).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.ordered().iter().map(|e| e.metadata.id.clone()).collect()
    }

    /// Drop the instance and any cached failure. The next call rebuilds.
    pub async fn dispose(&self, adapter_id: &str) -> Result<()> {
        let entry = self.entry(adapter_id)?;
        let instance = {
            let mut slot = entry.slot.lock().await;
            slot.failure = None;
            slot.instance.take()
        };
        entry.set_status(AdapterStatus::Registered, None);
        if let Some(instance) = instance {
            if let Err(e) = instance.dispose().await {
                tracing::warn!(adapter = %adapter_id, error = %e, "adapter dispose hook failed");
            }
            tracing::info!(adapter = %adapter_id, "adapter disposed");
            self.events.emit(GatewayEvent::AdapterDisposed {
                adapter_id: adapter_id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn dispose_all(&self) {
        for id in self.ids() {
            // Only fails for ids removed concurrently
            let _ = self.dispose(&id).await;
        }
    }

    pub async fn unregister(&self, adapter_id: &str) -> Result<()> {
        self.dispose(adapter_id).await?;
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(adapter_id);
        tracing::info!(adapter = %adapter_id, "adapter unregistered");
        Ok(())
    }

    pub async fn reset(&self) {
        self.dispose_all().await;
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Errors raised by adapter code are tool failures unless they already
/// carry a gateway classification.
fn adapter_call_error(err: &anyhow::Error) -> ToolCallError {
    if err.downcast_ref::<GatewayError>().is_some() || err.downcast_ref::<ToolCallError>().is_some() {
        ToolCallError::from_anyhow(err)
    } else {
        ToolCallError::new("TOOL_EXECUTION_ERROR", format!("{err:#}"), false)
    }
}
