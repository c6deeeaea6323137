//! Transport-agnostic async JSON-RPC 2.0 client
//!
//! [`JsonRpcClient`] knows nothing about processes or pipes. The transport
//! hands it an outbound channel of serialized messages and feeds inbound
//! messages into [`start_read_loop`].
//!
//! - Every request gets the next id from a monotonically increasing counter
//!   and a [`PendingEntry`] in the pending table before it is sent, so a fast
//!   response can never race its registration.
//! - A request that times out removes its own entry; the channel stays up.
//! - [`JsonRpcClient::close`] rejects every pending request at once and makes
//!   later requests fail fast. The transport calls it on disconnect and when
//!   the server process exits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, Result};
use crate::mcp::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, METHOD_NOT_FOUND};

/// Default timeout applied to every request when the caller does not specify one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a pending request was resolved without a response.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestFailure {
    /// The server answered with a JSON-RPC error object
    Rpc(JsonRpcError),
    /// The client was closed before a response arrived
    Closed(String),
}

type Resolution = std::result::Result<serde_json::Value, RequestFailure>;

type NotificationHandler = Box<dyn Fn(serde_json::Value) + Send + Sync + 'static>;

/// Bookkeeping for one outstanding request.
#[derive(Debug)]
pub struct PendingEntry {
    tx: oneshot::Sender<Resolution>,
    pub method: String,
    pub issued_at: Instant,
}

#[derive(Debug, Default)]
struct PendingTable {
    entries: HashMap<u64, PendingEntry>,
    /// Set once the client is closed; carries the close reason.
    closed: Option<String>,
}

/// Channel-backed JSON-RPC 2.0 client.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
/// use toolgate::mcp::client::{start_read_loop, JsonRpcClient};
///
/// #[tokio::main]
/// async fn main() {
///     let (out_tx, _out_rx) = mpsc::unbounded_channel::<String>();
///     let (_in_tx, in_rx) = mpsc::unbounded_channel::<String>();
///     let client = Arc::new(JsonRpcClient::new(out_tx));
///     let _handle = start_read_loop(in_rx, CancellationToken::new(), Arc::clone(&client));
/// }
/// ```
pub struct JsonRpcClient {
    next_id: AtomicU64,
    pending: Mutex<PendingTable>,
    outbound_tx: mpsc::UnboundedSender<String>,
    notification_handlers: RwLock<HashMap<String, NotificationHandler>>,
}

impl std::fmt::Debug for JsonRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcClient")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl JsonRpcClient {
    pub fn new(outbound_tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(PendingTable::default()),
            outbound_tx,
            notification_handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Send a request and await its raw `result` value.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::Connection`] if the client is closed, the outbound
    ///   channel is gone, or the client closes while waiting.
    /// - [`GatewayError::Timeout`] if no response arrives in time. The
    ///   pending entry is removed; the connection is left alone.
    /// - [`GatewayError::Protocol`] if the server answers with an error.
    pub async fn request_value(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value> {
        let (id, rx) = self.register(method).await?;

        let message = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        tracing::debug!(id, method, "-> request");
        if self.outbound_tx.send(message).is_err() {
            self.pending.lock().await.entries.remove(&id);
            return Err(GatewayError::Connection("outbound channel closed".to_string()).into());
        }

        let deadline = timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let resolution = match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => {
                return Err(GatewayError::Connection(
                    "request dropped before a response arrived".to_string(),
                )
                .into())
            }
            Err(_) => {
                self.pending.lock().await.entries.remove(&id);
                return Err(GatewayError::Timeout {
                    operation: method.to_string(),
                    timeout_ms: deadline.as_millis() as u64,
                }
                .into());
            }
        };

        match resolution {
            Ok(value) => Ok(value),
            Err(RequestFailure::Rpc(e)) => Err(GatewayError::Protocol {
                code: e.code,
                message: e.message,
            }
            .into()),
            Err(RequestFailure::Closed(reason)) => Err(GatewayError::Connection(reason).into()),
        }
    }

    /// Send a request and deserialize the result into `R`.
    pub async fn request<P, R>(&self, method: &str, params: P, timeout: Option<Duration>) -> Result<R>
    where
        P: serde::Serialize + Send,
        R: serde::de::DeserializeOwned,
    {
        let value = self
            .request_value(method, serde_json::to_value(params)?, timeout)
            .await?;
        serde_json::from_value(value).map_err(|e| GatewayError::Serialization(e).into())
    }

    async fn register(&self, method: &str) -> Result<(u64, oneshot::Receiver<Resolution>)> {
        let mut table = self.pending.lock().await;
        if let Some(reason) = &table.closed {
            return Err(GatewayError::Connection(reason.clone()).into());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        table.entries.insert(
            id,
            PendingEntry {
                tx,
                method: method.to_string(),
                issued_at: Instant::now(),
            },
        );
        Ok((id, rx))
    }

    /// Send a notification (no `id`, no reply expected).
    pub fn notify<P: serde::Serialize + Send>(&self, method: &str, params: P) -> Result<()> {
        let message = serde_json::to_string(&JsonRpcRequest::notification(
            method,
            serde_json::to_value(params)?,
        ))?;
        tracing::debug!(method, "-> notification");
        self.outbound_tx
            .send(message)
            .map_err(|_| GatewayError::Connection("outbound channel closed".to_string()))?;
        Ok(())
    }

    /// Register a handler for a server notification, replacing any earlier one.
    pub fn on_notification(
        &self,
        method: impl Into<String>,
        f: impl Fn(serde_json::Value) + Send + Sync + 'static,
    ) {
        if let Ok(mut handlers) = self.notification_handlers.write() {
            handlers.insert(method.into(), Box::new(f));
        }
    }

    /// Reject every pending request with `reason` and refuse new ones.
    ///
    /// Returns the ids that were pending. Calling it again is harmless and
    /// returns an empty list.
    pub async fn close(&self, reason: &str) -> Vec<u64> {
        let mut table = self.pending.lock().await;
        if table.closed.is_none() {
            table.closed = Some(reason.to_string());
        }
        let drained: Vec<(u64, PendingEntry)> = table.entries.drain().collect();
        drop(table);

        let mut ids = Vec::with_capacity(drained.len());
        for (id, entry) in drained {
            tracing::debug!(id, method = %entry.method, reason, "rejecting pending request");
            let _ = entry.tx.send(Err(RequestFailure::Closed(reason.to_string())));
            ids.push(id);
        }
        ids.sort_unstable();
        ids
    }

    pub async fn is_closed(&self) -> bool {
        self.pending.lock().await.closed.is_some()
    }

    /// Number of requests still waiting for a response
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.entries.len()
    }

    /// Ids and methods of the requests still waiting, oldest first
    pub async fn pending_requests(&self) -> Vec<(u64, String, Duration)> {
        let table = self.pending.lock().await;
        let mut out: Vec<_> = table
            .entries
            .iter()
            .map(|(id, e)| (*id, e.method.clone(), e.issued_at.elapsed()))
            .collect();
        out.sort_by_key(|(id, _, _)| *id);
        out
    }
}

/// Start the read loop as a background task.
///
/// Each inbound message is classified and dispatched:
///
/// - **Response**: resolves the matching pending entry; unknown ids are
///   logged and dropped.
/// - **Server-initiated request**: answered with `-32601 Method not found`.
/// - **Notification**: passed to the registered handler, if any.
///
/// When the inbound channel ends or `cancellation` fires, the client is
/// closed so that no caller waits forever.
pub fn start_read_loop(
    mut inbound_rx: mpsc::UnboundedReceiver<String>,
    cancellation: CancellationToken,
    client: Arc<JsonRpcClient>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = cancellation.cancelled() => {
                    client.close("read loop cancelled").await;
                    break;
                }

                maybe_msg = inbound_rx.recv() => {
                    let Some(raw) = maybe_msg else {
                        client.close("server closed its output").await;
                        break;
                    };
                    dispatch_message(&raw, &client).await;
                }
            }
        }
    })
}

async fn dispatch_message(raw: &str, client: &JsonRpcClient) {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("dropping unparseable frame: {e}");
            return;
        }
    };

    let has_id = value.get("id").is_some_and(|id| !id.is_null());
    let has_method = value.get("method").is_some();
    let has_result = value.get("result").is_some();
    let has_error = value.get("error").is_some();

    if has_id && (has_result || has_error) && !has_method {
        handle_response(value, client).await;
    } else if has_id && has_method {
        handle_server_request(value, client);
    } else if has_method {
        handle_notification(value, client);
    } else {
        tracing::debug!(
            has_id,
            has_method,
            has_result,
            has_error,
            "ignoring unclassifiable message"
        );
    }
}

async fn handle_response(value: serde_json::Value, client: &JsonRpcClient) {
    let id_val = &value["id"];
    let id = match id_val
        .as_u64()
        .or_else(|| id_val.as_str().and_then(|s| s.parse().ok()))
    {
        Some(id) => id,
        None => {
            tracing::warn!("response with non-integer id {id_val}; ignoring");
            return;
        }
    };

    let entry = client.pending.lock().await.entries.remove(&id);
    let Some(entry) = entry else {
        tracing::debug!(id, "response for unknown id; ignoring");
        return;
    };
    tracing::debug!(
        id,
        method = %entry.method,
        elapsed_ms = entry.issued_at.elapsed().as_millis() as u64,
        "<- response"
    );

    let resolution = match value.get("error") {
        Some(error_val) => Err(RequestFailure::Rpc(
            serde_json::from_value::<JsonRpcError>(error_val.clone()).unwrap_or_else(|_| {
                JsonRpcError::new(-32603, format!("malformed error object: {error_val}"))
            }),
        )),
        None => Ok(value.get("result").cloned().unwrap_or(serde_json::Value::Null)),
    };

    // The caller may already have timed out.
    let _ = entry.tx.send(resolution);
}

fn handle_server_request(value: serde_json::Value, client: &JsonRpcClient) {
    let method = value
        .get("method")
        .and_then(|m| m.as_str())
        .unwrap_or_default();
    tracing::debug!(method, "server request not supported; replying -32601");

    let response = JsonRpcResponse {
        jsonrpc: "2.0".to_string(),
        id: value.get("id").cloned(),
        result: None,
        error: Some(JsonRpcError::new(
            METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )),
    };
    if let Ok(serialized) = serde_json::to_string(&response) {
        let _ = client.outbound_tx.send(serialized);
    }
}

fn handle_notification(value: serde_json::Value, client: &JsonRpcClient) {
    let Some(method) = value.get("method").and_then(|m| m.as_str()) else {
        return;
    };
    let params = value.get("params").cloned().unwrap_or(serde_json::Value::Null);

    let Ok(handlers) = client.notification_handlers.read() else {
        return;
    };
    match handlers.get(method) {
        Some(handler) => handler(params),
        None => tracing::debug!(method, "no handler for notification; ignoring"),
    }
}
