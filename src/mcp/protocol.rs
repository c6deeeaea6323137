//! Typed session lifecycle over [`JsonRpcClient`]
//!
//! - [`McpProtocol`] is an uninitialized session. [`McpProtocol::initialize`]
//!   performs the `initialize` / `notifications/initialized` handshake.
//! - [`InitializedMcpProtocol`] is a negotiated session offering the typed
//!   calls the gateway needs: `tools/list` (following `nextCursor`),
//!   `tools/call`, `ping` and cancellation notices.
//!
//! Both share the client through an `Arc`, the same one the read loop
//! services, so no state has to be aliased by hand.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::mcp::client::JsonRpcClient;
use crate::mcp::types::{
    is_supported_version, CallToolParams, CancelledParams, ClientCapabilities, Implementation,
    InitializeParams, InitializeResponse, ListToolsResponse, PaginatedParams, ToolDefinition,
    LATEST_PROTOCOL_VERSION, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_PING,
    METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, NOTIF_CANCELLED, SUPPORTED_PROTOCOL_VERSIONS,
};

/// Hard stop for servers that keep returning a `nextCursor`.
pub const MAX_TOOL_PAGES: usize = 64;

/// An uninitialized session.
#[derive(Debug, Clone)]
pub struct McpProtocol {
    client: Arc<JsonRpcClient>,
}

impl McpProtocol {
    /// Wrap a client whose read loop is already running.
    pub fn new(client: Arc<JsonRpcClient>) -> Self {
        Self { client }
    }

    /// Perform the handshake.
    ///
    /// A server that omits `protocolVersion` is accepted with a debug log;
    /// an explicit version outside [`SUPPORTED_PROTOCOL_VERSIONS`] fails.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::ProtocolVersion`] on an unsupported version.
    /// - Any error of [`JsonRpcClient::request`] (timeout, closed channel,
    ///   JSON-RPC error).
    pub async fn initialize(
        self,
        client_info: Implementation,
        capabilities: ClientCapabilities,
        timeout: Duration,
    ) -> Result<InitializedMcpProtocol> {
        let response: InitializeResponse = self
            .client
            .request(
                METHOD_INITIALIZE,
                InitializeParams {
                    protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
                    capabilities,
                    client_info,
                },
                Some(timeout),
            )
            .await?;

        match response.protocol_version.as_deref() {
            Some(v) if !is_supported_version(v) => {
                return Err(GatewayError::ProtocolVersion {
                    expected: SUPPORTED_PROTOCOL_VERSIONS
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                    got: v.to_string(),
                }
                .into());
            }
            Some(_) => {}
            None => tracing::debug!(
                server = %response.server_info.name,
                "server did not report a protocol version; assuming {LATEST_PROTOCOL_VERSION}"
            ),
        }

        // Errors are not fatal: the server either got it or the channel is
        // already gone and the next request will say so.
        let _ = self.client.notify(METHOD_INITIALIZED, serde_json::json!({}));

        Ok(InitializedMcpProtocol {
            client: self.client,
            initialize_response: response,
        })
    }
}

/// A negotiated session.
#[derive(Debug, Clone)]
pub struct InitializedMcpProtocol {
    pub client: Arc<JsonRpcClient>,
    pub initialize_response: InitializeResponse,
}

impl InitializedMcpProtocol {
    /// Protocol version in effect for this session
    pub fn protocol_version(&self) -> &str {
        self.initialize_response
            .protocol_version
            .as_deref()
            .unwrap_or(LATEST_PROTOCOL_VERSION)
    }

    pub fn server_info(&self) -> &Implementation {
        &self.initialize_response.server_info
    }

    /// Fetch every tool, following `nextCursor` up to [`MAX_TOOL_PAGES`].
    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolDefinition>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let resp: ListToolsResponse = self
                .client
                .request(METHOD_TOOLS_LIST, PaginatedParams { cursor }, Some(timeout))
                .await?;
            tools.extend(resp.tools);

            match resp.next_cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => return Ok(tools),
            }
        }

        tracing::warn!(
            server = %self.server_info().name,
            pages = MAX_TOOL_PAGES,
            "tools/list pagination did not terminate; truncating"
        );
        Ok(tools)
    }

    /// Invoke a tool and return the raw `result` value.
    ///
    /// Decoding is left to the caller so that a result which does not match
    /// the expected shape can still be surfaced as raw JSON.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments: Some(arguments),
        })?;
        self.client
            .request_value(METHOD_TOOLS_CALL, params, Some(timeout))
            .await
    }

    /// Liveness check. Returns the round-trip time.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration> {
        let started = std::time::Instant::now();
        self.client
            .request_value(METHOD_PING, serde_json::json!({}), Some(timeout))
            .await?;
        Ok(started.elapsed())
    }

    /// Tell the server a request will not be waited on any more.
    pub fn cancel(&self, request_id: u64, reason: &str) -> Result<()> {
        self.client.notify(
            NOTIF_CANCELLED,
            CancelledParams {
                request_id: serde_json::json!(request_id),
                reason: Some(reason.to_string()),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::client::start_read_loop;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn wired() -> (
        Arc<JsonRpcClient>,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<String>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let client = Arc::new(JsonRpcClient::new(out_tx));
        start_read_loop(in_rx, CancellationToken::new(), Arc::clone(&client));
        (client, out_rx, in_tx)
    }

    /// Answer the next request on `out_rx` with `result` (or `error`).
    async fn answer(
        out_rx: &mut mpsc::UnboundedReceiver<String>,
        in_tx: &mpsc::UnboundedSender<String>,
        body: serde_json::Value,
    ) -> serde_json::Value {
        let sent: serde_json::Value = serde_json::from_str(&out_rx.recv().await.unwrap()).unwrap();
        let mut msg = serde_json::json!({"jsonrpc": "2.0", "id": sent["id"]});
        for (k, v) in body.as_object().unwrap() {
            msg[k] = v.clone();
        }
        in_tx.send(msg.to_string()).unwrap();
        sent
    }

    fn client_info() -> Implementation {
        Implementation {
            name: "toolgate-test".into(),
            version: "0.0.0".into(),
        }
    }

    #[tokio::test]
    async fn test_initialize_sends_initialized_notification() {
        let (client, mut out_rx, in_tx) = wired();
        let proto = McpProtocol::new(client);

        let server = tokio::spawn(async move {
            let sent = answer(
                &mut out_rx,
                &in_tx,
                serde_json::json!({"result": {
                    "protocolVersion": "2025-03-26",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "srv", "version": "1"}
                }}),
            )
            .await;
            assert_eq!(sent["method"], "initialize");
            assert_eq!(sent["params"]["protocolVersion"], LATEST_PROTOCOL_VERSION);
            let next: serde_json::Value =
                serde_json::from_str(&out_rx.recv().await.unwrap()).unwrap();
            assert_eq!(next["method"], METHOD_INITIALIZED);
            assert!(next.get("id").is_none());
        });

        let session = proto
            .initialize(client_info(), ClientCapabilities::default(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(session.protocol_version(), "2025-03-26");
        assert_eq!(session.server_info().name, "srv");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_accepts_missing_version() {
        let (client, mut out_rx, in_tx) = wired();
        tokio::spawn(async move {
            answer(
                &mut out_rx,
                &in_tx,
                serde_json::json!({"result": {
                    "capabilities": {},
                    "serverInfo": {"name": "legacy", "version": "1"}
                }}),
            )
            .await;
        });
        let session = McpProtocol::new(client)
            .initialize(client_info(), ClientCapabilities::default(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(session.protocol_version(), LATEST_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_initialize_rejects_unsupported_version() {
        let (client, mut out_rx, in_tx) = wired();
        tokio::spawn(async move {
            answer(
                &mut out_rx,
                &in_tx,
                serde_json::json!({"result": {
                    "protocolVersion": "1999-01-01",
                    "capabilities": {},
                    "serverInfo": {"name": "old", "version": "1"}
                }}),
            )
            .await;
        });
        let err = McpProtocol::new(client)
            .initialize(client_info(), ClientCapabilities::default(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GatewayError>(),
            Some(GatewayError::ProtocolVersion { .. })
        ));
    }

    #[tokio::test]
    async fn test_initialize_times_out() {
        let (client, _out_rx, _in_tx) = wired();
        let err = McpProtocol::new(client)
            .initialize(client_info(), ClientCapabilities::default(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GatewayError>(),
            Some(GatewayError::Timeout { .. })
        ));
    }

    fn session(client: Arc<JsonRpcClient>) -> InitializedMcpProtocol {
        InitializedMcpProtocol {
            client,
            initialize_response: serde_json::from_value(serde_json::json!({
                "protocolVersion": LATEST_PROTOCOL_VERSION,
                "capabilities": {},
                "serverInfo": {"name": "srv", "version": "1"}
            }))
            .unwrap(),
        }
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor() {
        let (client, mut out_rx, in_tx) = wired();
        let s = session(client);

        let server = tokio::spawn(async move {
            let first = answer(
                &mut out_rx,
                &in_tx,
                serde_json::json!({"result": {"tools": [{"name": "a"}], "nextCursor": "p2"}}),
            )
            .await;
            assert!(first["params"].get("cursor").is_none());
            let second = answer(
                &mut out_rx,
                &in_tx,
                serde_json::json!({"result": {"tools": [{"name": "b"}]}}),
            )
            .await;
            assert_eq!(second["params"]["cursor"], "p2");
        });

        let tools = s.list_tools(Duration::from_secs(5)).await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_tool_returns_raw_result() {
        let (client, mut out_rx, in_tx) = wired();
        let s = session(client);
        let server = tokio::spawn(async move {
            let sent = answer(
                &mut out_rx,
                &in_tx,
                serde_json::json!({"result": {"content": [{"type": "text", "text": "hi"}]}}),
            )
            .await;
            assert_eq!(sent["method"], "tools/call");
            assert_eq!(sent["params"]["name"], "echo");
            assert_eq!(sent["params"]["arguments"]["text"], "hi");
        });

        let raw = s
            .call_tool("echo", serde_json::json!({"text": "hi"}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(raw["content"][0]["text"], "hi");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_method_not_found_is_protocol_error() {
        let (client, mut out_rx, in_tx) = wired();
        let s = session(client);
        tokio::spawn(async move {
            answer(
                &mut out_rx,
                &in_tx,
                serde_json::json!({"error": {"code": -32601, "message": "Method not found"}}),
            )
            .await;
        });
        let err = s.ping(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GatewayError>(),
            Some(GatewayError::Protocol { code: -32601, .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_sends_notification() {
        let (client, mut out_rx, _in_tx) = wired();
        let s = session(client);
        s.cancel(7, "transport disconnected").unwrap();
        let sent: serde_json::Value = serde_json::from_str(&out_rx.recv().await.unwrap()).unwrap();
        assert_eq!(sent["method"], NOTIF_CANCELLED);
        assert_eq!(sent["params"]["requestId"], 7);
    }
}
