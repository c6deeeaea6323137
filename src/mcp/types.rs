//! JSON-RPC 2.0 primitives and the tool-server wire types
//!
//! Only the subset of the protocol the gateway speaks is modelled here:
//! the `initialize` handshake, `tools/list`, `tools/call`, `ping` and the
//! `notifications/cancelled` notice. Struct fields are `camelCase` on the
//! wire and optional fields are omitted when `None`.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Protocol version constants
// ---------------------------------------------------------------------------

/// Version offered in the `initialize` request.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-11-25";

/// Every version the client accepts back from a server.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &[LATEST_PROTOCOL_VERSION, "2025-06-18", "2025-03-26", "2024-11-05"];

/// Returns `true` when `version` is one the client can speak.
///
/// # Examples
///
/// ```
/// use toolgate::mcp::types::is_supported_version;
///
/// assert!(is_supported_version("2025-03-26"));
/// assert!(!is_supported_version("1.0"));
/// ```
pub fn is_supported_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

// ---------------------------------------------------------------------------
// Method and notification names
// ---------------------------------------------------------------------------

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_PING: &str = "ping";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";

pub const NOTIF_CANCELLED: &str = "notifications/cancelled";
/// Servers disagree on the spelling; both are honoured.
pub const NOTIF_TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
pub const NOTIF_TOOLS_LIST_CHANGED_CAMEL: &str = "notifications/tools/listChanged";

// ---------------------------------------------------------------------------
// JSON-RPC error codes
// ---------------------------------------------------------------------------

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// ---------------------------------------------------------------------------
// JSON-RPC 2.0 envelopes
// ---------------------------------------------------------------------------

/// A JSON-RPC request; `id` is `None` only for notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(serde_json::json!(id)),
            method: method.into(),
            params: Some(params),
        }
    }

    pub fn notification(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params: Some(params),
        }
    }
}

/// A JSON-RPC response. Exactly one of `result` or `error` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// A JSON-RPC error object.
///
/// # Examples
///
/// ```
/// use toolgate::mcp::types::JsonRpcError;
///
/// let e = JsonRpcError::new(-32601, "Method not found");
/// assert_eq!(e.to_string(), "JSON-RPC error -32601: Method not found");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Identifies a client or server implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Implementation {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl Implementation {
    /// Identity of this crate, used when no client name is configured.
    pub fn toolgate() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Capabilities the client advertises. The gateway does not serve sampling
/// or roots, so this is normally empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<serde_json::Value>,
}

/// Capabilities a server advertises.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<serde_json::Value>,
    /// `{"listChanged": bool}` when the server publishes tool changes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
}

impl ServerCapabilities {
    /// Whether the server promises `tools/list_changed` notifications
    pub fn tools_list_changed(&self) -> bool {
        self.tools
            .as_ref()
            .and_then(|t| t.get("listChanged"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
}

/// The server's answer to `initialize`.
///
/// Older servers omit `protocolVersion`; it then deserializes as `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// Behavioural hints a server may attach to a tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotations {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_only_hint: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destructive_hint: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotent_hint: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_world_hint: Option<bool>,
}

/// A tool as advertised by a server (or declared in configuration).
///
/// `timeout_ms` is not part of the wire format servers send; it is a
/// per-tool override that configuration files may set.
///
/// # Examples
///
/// ```
/// use toolgate::mcp::types::ToolDefinition;
///
/// let tool: ToolDefinition = serde_json::from_value(serde_json::json!({
///     "name": "get_prices",
///     "inputSchema": {"type": "object"}
/// })).unwrap();
/// assert_eq!(tool.name, "get_prices");
/// assert!(tool.description.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_input_schema", alias = "input_schema")]
    pub input_schema: serde_json::Value,
    #[serde(default, alias = "output_schema", skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<ToolAnnotations>,
    #[serde(default, alias = "timeout_ms", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_input_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object" })
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            description: description.into(),
            input_schema: default_input_schema(),
            output_schema: None,
            annotations: None,
            timeout_ms: None,
        }
    }

    pub fn with_input_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// One page of a `tools/list` answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResponse {
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

/// The result of a `tools/call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResponse {
    #[serde(default)]
    pub content: Vec<ToolResponseContent>,
    /// `true` when the tool itself reported failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<serde_json::Value>,
}

impl CallToolResponse {
    /// Concatenated text of every text item
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ToolResponseContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// First text item, if any
    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(|c| match c {
            ToolResponseContent::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }
}

/// A single content item in a tool result, discriminated by `"type"`.
///
/// # Examples
///
/// ```
/// use toolgate::mcp::types::ToolResponseContent;
///
/// let c = ToolResponseContent::Text { text: "hello".to_string() };
/// let json = serde_json::to_value(&c).unwrap();
/// assert_eq!(json["type"], "text");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolResponseContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Embedded resource, kept opaque
    Resource {
        resource: serde_json::Value,
    },
    /// Any content type this client does not know
    #[serde(other)]
    Unknown,
}

/// Parameters for `notifications/cancelled`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_supported_versions_include_latest() {
        assert!(is_supported_version(LATEST_PROTOCOL_VERSION));
        assert!(is_supported_version("2024-11-05"));
        assert!(!is_supported_version("2023-01-01"));
    }

    #[test]
    fn test_request_serialization_omits_missing_id() {
        let n = JsonRpcRequest::notification(METHOD_INITIALIZED, json!({}));
        let s = serde_json::to_string(&n).unwrap();
        assert!(!s.contains("\"id\""));

        let r = JsonRpcRequest::new(7, METHOD_PING, json!({}));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["id"], 7);
        assert_eq!(v["jsonrpc"], "2.0");
    }

    #[test]
    fn test_initialize_response_without_version() {
        let resp: InitializeResponse = serde_json::from_value(json!({
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "legacy", "version": "1.0.0"}
        }))
        .unwrap();
        assert!(resp.protocol_version.is_none());
        assert_eq!(resp.server_info.name, "legacy");
        assert!(!resp.capabilities.tools_list_changed());
    }

    #[test]
    fn test_tools_list_changed_capability() {
        let caps: ServerCapabilities =
            serde_json::from_value(json!({"tools": {"listChanged": true}})).unwrap();
        assert!(caps.tools_list_changed());
    }

    #[test]
    fn test_tool_definition_defaults() {
        let tool: ToolDefinition = serde_json::from_value(json!({"name": "x"})).unwrap();
        assert_eq!(tool.input_schema, json!({"type": "object"}));
        assert!(tool.output_schema.is_none());
        assert!(tool.timeout_ms.is_none());
    }

    #[test]
    fn test_tool_definition_accepts_snake_case_config_keys() {
        let tool: ToolDefinition = serde_json::from_value(json!({
            "name": "slow",
            "timeout_ms": 1500,
            "input_schema": {"type": "object", "properties": {}}
        }))
        .unwrap();
        assert_eq!(tool.timeout_ms, Some(1500));
        assert!(tool.input_schema["properties"].is_object());
    }

    #[test]
    fn test_call_tool_response_text_helpers() {
        let resp: CallToolResponse = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "a"},
                {"type": "image", "data": "AA==", "mimeType": "image/png"},
                {"type": "text", "text": "b"}
            ]
        }))
        .unwrap();
        assert_eq!(resp.first_text(), Some("a"));
        assert_eq!(resp.text(), "a\nb");
        assert!(resp.is_error.is_none());
    }

    #[test]
    fn test_unknown_content_type_is_tolerated() {
        let resp: CallToolResponse = serde_json::from_value(json!({
            "content": [{"type": "resource_link", "uri": "file:///x"}]
        }))
        .unwrap();
        assert_eq!(resp.content, vec![ToolResponseContent::Unknown]);
    }

    #[test]
    fn test_list_tools_response_pagination_cursor() {
        let page: ListToolsResponse = serde_json::from_value(json!({
            "tools": [{"name": "a"}],
            "nextCursor": "p2"
        }))
        .unwrap();
        assert_eq!(page.tools.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("p2"));
    }

    #[test]
    fn test_cancelled_params_wire_shape() {
        let p = CancelledParams {
            request_id: json!(3),
            reason: Some("transport disconnected".into()),
        };
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["requestId"], 3);
        assert_eq!(v["reason"], "transport disconnected");
    }
}
