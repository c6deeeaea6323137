//! Tool call request and response envelopes
//!
//! These are the values that cross the gateway boundary. Failures are
//! never raised as Rust errors from the call APIs; they come back as a
//! [`ToolCallResponse`] with `success == false` and a [`ToolCallError`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::{self, GatewayError};

/// A request to run one tool
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use toolgate::tool_call::ToolCallRequest;
///
/// let req = ToolCallRequest::new("echo", json!({"text": "hi"}))
///     .with_server("local")
///     .with_timeout_ms(500);
/// assert_eq!(req.server_id.as_deref(), Some("local"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    /// Pin the call to a server; otherwise the gateway routes by tool name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Tool name as advertised by the server
    pub tool_name: String,
    /// Tool arguments (an object; `null` is sent as `{}`)
    #[serde(default)]
    pub arguments: Value,
    /// Per-call timeout; falls back to the server or gateway default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Opaque id echoed on the response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ToolCallRequest {
    pub fn new(tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            server_id: None,
            tool_name: tool_name.into(),
            arguments,
            timeout_ms: None,
            correlation_id: None,
        }
    }

    pub fn with_server(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Assign a fresh v4 correlation id if none was given, and return it
    pub fn ensure_correlation_id(&mut self) -> String {
        self.correlation_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }

    /// Effective timeout given a fallback
    pub fn timeout_or(&self, fallback: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(fallback)
    }

    /// Arguments as sent on the wire (`null` becomes `{}`)
    pub fn wire_arguments(&self) -> Value {
        if self.arguments.is_null() {
            Value::Object(Default::default())
        } else {
            self.arguments.clone()
        }
    }
}

/// Failure detail carried by a [`ToolCallResponse`]
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ToolCallError {
    /// Stable code such as `TIMEOUT` or `TOOL_NOT_FOUND`
    pub code: String,
    pub message: String,
    /// Whether a retry could succeed
    pub retryable: bool,
}

impl ToolCallError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable,
        }
    }

    /// Fold any crate error into a response error
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        if let Some(e) = err.downcast_ref::<ToolCallError>() {
            return e.clone();
        }
        Self {
            code: error::error_code(err),
            message: format!("{err:#}"),
            retryable: error::is_retryable(err),
        }
    }
}

impl From<&GatewayError> for ToolCallError {
    fn from(err: &GatewayError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl From<GatewayError> for ToolCallError {
    fn from(err: GatewayError) -> Self {
        (&err).into()
    }
}

/// Result of one tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResponse {
    pub success: bool,
    /// Decoded tool payload on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolCallError>,
    /// Wall-clock time spent, including retries
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Server that served (or last attempted) the call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Adapter that served the call, when no server was involved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_id: Option<String>,
    /// Attempts made, counting the first
    #[serde(default)]
    pub attempts: u32,
}

impl ToolCallResponse {
    pub fn success(data: Value, duration: Duration) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            duration_ms: duration.as_millis() as u64,
            correlation_id: None,
            server_id: None,
            adapter_id: None,
            attempts: 1,
        }
    }

    pub fn failure(error: ToolCallError, duration: Duration) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            duration_ms: duration.as_millis() as u64,
            correlation_id: None,
            server_id: None,
            adapter_id: None,
            attempts: 1,
        }
    }

    pub fn with_correlation_id(mut self, id: Option<String>) -> Self {
        self.correlation_id = id;
        self
    }

    pub fn with_server(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn with_adapter(mut self, adapter_id: impl Into<String>) -> Self {
        self.adapter_id = Some(adapter_id.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    /// Error code, if the call failed
    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }

    /// Convert into a plain `Result`, for callers that prefer `?`
    pub fn into_result(self) -> std::result::Result<Value, ToolCallError> {
        match (self.success, self.error) {
            (true, _) => Ok(self.data.unwrap_or(Value::Null)),
            (false, Some(e)) => Err(e),
            (false, None) => Err(ToolCallError::new(
                "INTERNAL_ERROR",
                "call failed without error detail",
                false,
            )),
        }
    }
}

/// Caller-side options for the gateway call API
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Route to this server, skipping tool resolution
    pub server_id: Option<String>,
    /// Resolve through this agent's binding first
    pub agent_id: Option<String>,
    pub timeout: Option<Duration>,
    pub correlation_id: Option<String>,
}

impl CallOptions {
    pub fn server(server_id: impl Into<String>) -> Self {
        Self {
            server_id: Some(server_id.into()),
            ..Default::default()
        }
    }

    pub fn agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
