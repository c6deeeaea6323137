//! Error types for Toolgate
//!
//! This module defines the error taxonomy used throughout the gateway,
//! using `thiserror` for ergonomic error handling. Fallible library
//! functions return [`Result`], an `anyhow` alias whose error can be
//! downcast back to [`GatewayError`] (see [`error_code`] and
//! [`is_retryable`]).
//!
//! Tool-call APIs never return these errors directly; they fold them into
//! a [`crate::tool_call::ToolCallError`] carrying the stable `code` string
//! and the `retryable` flag.

use thiserror::Error;

use crate::tool_call::ToolCallError;

/// Main error type for gateway operations
///
/// Covers channel failures, timeouts, peer-reported protocol errors,
/// tool-reported failures, malformed definitions, routing misses, and
/// the ambient I/O and (de)serialization failures.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// A channel to a server could not be established or was lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// A specific operation exceeded its time bound
    #[error("Timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout {
        /// The operation that timed out (e.g. `tools/call echo`)
        operation: String,
        /// The bound that was exceeded, in milliseconds
        timeout_ms: u64,
    },

    /// The peer answered with a JSON-RPC error envelope
    #[error("Protocol error {code}: {message}")]
    Protocol {
        /// JSON-RPC error code
        code: i64,
        /// Error message reported by the peer
        message: String,
    },

    /// The server selected a protocol version this client does not speak
    #[error("Unsupported protocol version `{got}` (supported: {})", expected.join(", "))]
    ProtocolVersion {
        /// Versions this client accepts
        expected: Vec<String>,
        /// Version returned by the server
        got: String,
    },

    /// The tool itself reported a failure
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// A server definition or configuration value is malformed
    #[error("Validation error: {0}")]
    Validation(String),

    /// No server with the given id is registered
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// The server exists but is disabled
    #[error("Server is disabled: {0}")]
    ServerDisabled(String),

    /// No server or adapter offers the requested tool
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// The circuit breaker for the server is open
    #[error("Circuit open for server {0}")]
    CircuitOpen(String),

    /// The transport kind is declared but has no implementation
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// No adapter with the given id is registered
    #[error("Adapter not found: {0}")]
    AdapterNotFound(String),

    /// Adapter construction failed (possibly a cached failure)
    #[error("Adapter initialization failed for {adapter}: {message}")]
    AdapterInit {
        /// Adapter id
        adapter: String,
        /// Failure description
        message: String,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl GatewayError {
    /// Stable, machine-readable code for this error
    ///
    /// # Examples
    ///
    /// ```
    /// use toolgate::error::GatewayError;
    ///
    /// let err = GatewayError::Connection("refused".to_string());
    /// assert_eq!(err.code(), "CONNECTION_ERROR");
    /// ```
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Connection(_) => "CONNECTION_ERROR",
            GatewayError::Timeout { .. } => "TIMEOUT",
            GatewayError::Protocol { .. } | GatewayError::ProtocolVersion { .. } => {
                "PROTOCOL_ERROR"
            }
            GatewayError::ToolExecution(_) => "TOOL_EXECUTION_ERROR",
            GatewayError::Validation(_) => "VALIDATION_ERROR",
            GatewayError::ServerNotFound(_) => "SERVER_NOT_FOUND",
            GatewayError::ServerDisabled(_) => "SERVER_DISABLED",
            GatewayError::ToolNotFound(_) => "TOOL_NOT_FOUND",
            GatewayError::CircuitOpen(_) => "CIRCUIT_OPEN",
            GatewayError::UnsupportedTransport(_) => "UNSUPPORTED_TRANSPORT",
            GatewayError::AdapterNotFound(_) => "ADAPTER_NOT_FOUND",
            GatewayError::AdapterInit { .. } => "ADAPTER_INIT_ERROR",
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::Io(_) => "IO_ERROR",
            GatewayError::Serialization(_) | GatewayError::Yaml(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Whether a retry of the same call could plausibly succeed
    ///
    /// Connection losses, timeouts, I/O failures and the server-side subset
    /// of JSON-RPC codes are retryable. Tool failures, validation and
    /// routing errors never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Connection(_) | GatewayError::Timeout { .. } | GatewayError::Io(_) => {
                true
            }
            GatewayError::Protocol { code, .. } => is_retryable_rpc_code(*code),
            _ => false,
        }
    }
}

/// JSON-RPC codes worth retrying: internal error and the implementation
/// defined server-error range (which includes `-32001` request timeout).
pub fn is_retryable_rpc_code(code: i64) -> bool {
    code == -32603 || (-32099..=-32000).contains(&code)
}

/// Stable code for any error flowing through the crate's `Result` alias.
pub fn error_code(err: &anyhow::Error) -> String {
    if let Some(e) = err.downcast_ref::<GatewayError>() {
        return e.code().to_string();
    }
    if let Some(e) = err.downcast_ref::<ToolCallError>() {
        return e.code.clone();
    }
    if err.downcast_ref::<std::io::Error>().is_some() {
        return "IO_ERROR".to_string();
    }
    "INTERNAL_ERROR".to_string()
}

/// Retryability for any error flowing through the crate's `Result` alias.
///
/// Unknown error types are treated as not retryable.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    if let Some(e) = err.downcast_ref::<GatewayError>() {
        return e.is_retryable();
    }
    if let Some(e) = err.downcast_ref::<ToolCallError>() {
        return e.retryable;
    }
    err.downcast_ref::<std::io::Error>().is_some()
}

/// Result type alias for Toolgate operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
