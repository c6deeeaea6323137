//! Stdio transport for child-process servers
//!
//! [`StdioTransport`] spawns the server declared by a [`ServerDefinition`]
//! and speaks JSON-RPC over its pipes:
//!
//! - a writer task owns stdin and writes one frame per message, so writes
//!   never interleave;
//! - a reader task owns stdout, splits frames with [`FrameCodec`] and feeds
//!   them to the [`JsonRpcClient`] read loop;
//! - stderr is drained and logged at debug level; it is never an error;
//! - a watcher task owns the [`Child`]. If the process exits, every pending
//!   request is rejected with the exit reason and the transport becomes
//!   `Disconnected`. On shutdown it sends SIGTERM, waits out the grace
//!   period and then kills.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, Result};
use crate::events::{EventBus, GatewayEvent};
use crate::mcp::client::{start_read_loop, JsonRpcClient};
use crate::mcp::framing::{FrameCodec, Framing};
use crate::mcp::protocol::{InitializedMcpProtocol, McpProtocol};
use crate::mcp::transport::{ServerTransport, StdioOptions, TransportStatus};
use crate::mcp::types::{
    CallToolResponse, ClientCapabilities, ToolDefinition, METHOD_NOT_FOUND,
    NOTIF_TOOLS_LIST_CHANGED, NOTIF_TOOLS_LIST_CHANGED_CAMEL,
};
use crate::registry::ServerDefinition;
use crate::tool_call::{ToolCallError, ToolCallRequest, ToolCallResponse};

const DISCONNECT_REASON: &str = "transport disconnected";

type ToolCache = Arc<RwLock<Option<Vec<ToolDefinition>>>>;

/// One running server process and its session.
struct Session {
    protocol: InitializedMcpProtocol,
    cancel: CancellationToken,
    shutdown_tx: StdMutex<Option<oneshot::Sender<Duration>>>,
    watcher: StdMutex<Option<JoinHandle<()>>>,
    pid: Option<u32>,
}

impl Session {
    fn client(&self) -> &Arc<JsonRpcClient> {
        &self.protocol.client
    }

    /// Stop the I/O tasks and ask the watcher to terminate the process.
    /// Returns the watcher handle so the caller can wait for it.
    fn shutdown(&self, grace: Duration) -> Option<JoinHandle<()>> {
        self.cancel.cancel();
        if let Some(tx) = lock(&self.shutdown_tx).take() {
            let _ = tx.send(grace);
        }
        lock(&self.watcher).take()
    }
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pieces of a spawned process before the handshake.
struct Spawned {
    client: Arc<JsonRpcClient>,
    cancel: CancellationToken,
    shutdown_tx: oneshot::Sender<Duration>,
    watcher: JoinHandle<()>,
    pid: Option<u32>,
}

/// Stdio-based transport bound to one server definition.
///
/// # Examples
///
/// ```no_run
/// use toolgate::events::EventBus;
/// use toolgate::mcp::transport::stdio::StdioTransport;
/// use toolgate::mcp::transport::{ServerTransport, StdioOptions};
/// use toolgate::registry::ServerDefinition;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let def = ServerDefinition::stdio("files", "npx")
///     .with_args(["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]);
/// let transport = StdioTransport::new(def, StdioOptions::default(), EventBus::default())?;
/// transport.connect().await?;
/// let tools = transport.list_tools().await?;
/// # Ok(())
/// # }
/// ```
pub struct StdioTransport {
    definition: ServerDefinition,
    options: StdioOptions,
    events: EventBus,
    status: Arc<RwLock<TransportStatus>>,
    session: RwLock<Option<Arc<Session>>>,
    tools: ToolCache,
    /// Serializes connect and disconnect
    lifecycle: Mutex<()>,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("server", &self.definition.id)
            .field("status", &self.current_status())
            .finish_non_exhaustive()
    }
}

impl StdioTransport {
    /// Build a transport. Nothing is spawned until [`ServerTransport::connect`].
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Validation`] if the definition has no command.
    pub fn new(definition: ServerDefinition, options: StdioOptions, events: EventBus) -> Result<Self> {
        if definition.command.as_deref().map_or(true, str::is_empty) {
            return Err(GatewayError::Validation(format!(
                "server `{}` has no command",
                definition.id
            ))
            .into());
        }
        Ok(Self {
            definition,
            options,
            events,
            status: Arc::new(RwLock::new(TransportStatus::Disconnected)),
            session: RwLock::new(None),
            tools: Arc::new(RwLock::new(None)),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn definition(&self) -> &ServerDefinition {
        &self.definition
    }

    fn current_status(&self) -> TransportStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: TransportStatus) {
        set_status(&self.status, status);
    }

    fn active_session(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_session(&self) -> Option<Arc<Session>> {
        self.session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn require_session(&self) -> Result<Arc<Session>> {
        match self.active_session() {
            Some(s) if self.current_status().is_usable() => Ok(s),
            _ => Err(GatewayError::Connection(format!(
                "server `{}` is not connected ({})",
                self.definition.id,
                self.current_status()
            ))
            .into()),
        }
    }

    /// Timeout for a call: request, then tool, then server, then default.
    fn call_timeout(&self, request: &ToolCallRequest) -> Duration {
        if let Some(ms) = request.timeout_ms {
            return Duration::from_millis(ms);
        }
        let tool_timeout = {
            let cache = self.tools.read().unwrap_or_else(PoisonError::into_inner);
            cache
                .as_ref()
                .and_then(|tools| tools.iter().find(|t| t.name == request.tool_name))
                .and_then(|t| t.timeout_ms)
        }
        .or_else(|| {
            self.definition
                .tools
                .iter()
                .find(|t| t.name == request.tool_name)
                .and_then(|t| t.timeout_ms)
        });
        tool_timeout
            .or(self.definition.request_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.options.request_timeout)
    }

    fn spawn_process(&self) -> Result<Spawned> {
        let command = self.definition.command.clone().unwrap_or_default();
        let mut cmd = Command::new(&command);
        cmd.args(&self.definition.args)
            .envs(resolve_env(&self.definition.env))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.definition.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            GatewayError::Connection(format!("failed to spawn `{command}`: {e}"))
        })?;

        if let Ok(Some(status)) = child.try_wait() {
            return Err(GatewayError::Connection(format!(
                "server process exited immediately ({status})"
            ))
            .into());
        }

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::Connection("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Connection("child stdout unavailable".into()))?;
        let stderr = child.stderr.take();

        let server_id = self.definition.id.clone();
        let framing = self.definition.framing;
        let cancel = CancellationToken::new();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        spawn_writer(server_id.clone(), stdin, framing, out_rx, cancel.clone());
        spawn_reader(server_id.clone(), stdout, framing, in_tx, cancel.clone());
        if let Some(stderr) = stderr {
            spawn_stderr_logger(server_id.clone(), stderr);
        }

        let client = Arc::new(JsonRpcClient::new(out_tx));
        for method in [NOTIF_TOOLS_LIST_CHANGED, NOTIF_TOOLS_LIST_CHANGED_CAMEL] {
            let tools = Arc::clone(&self.tools);
            let server = server_id.clone();
            client.on_notification(method, move |_| {
                tracing::debug!(server = %server, "tool list changed; invalidating cache");
                *tools.write().unwrap_or_else(PoisonError::into_inner) = None;
            });
        }
        start_read_loop(in_rx, cancel.clone(), Arc::clone(&client));

        let pid = child.id();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let watcher = spawn_watcher(ProcessWatch {
            server_id,
            child,
            client: Arc::clone(&client),
            cancel: cancel.clone(),
            status: Arc::clone(&self.status),
            events: self.events.clone(),
            shutdown_rx,
        });

        Ok(Spawned {
            client,
            cancel,
            shutdown_tx,
            watcher,
            pid,
        })
    }

    async fn establish(&self) -> Result<Arc<Session>> {
        let spawned = self.spawn_process()?;
        tracing::debug!(server = %self.definition.id, pid = ?spawned.pid, "server process spawned");

        let handshake = McpProtocol::new(Arc::clone(&spawned.client))
            .initialize(
                self.options.client_info.clone(),
                ClientCapabilities::default(),
                self.options.handshake_timeout,
            )
            .await;

        let session = Arc::new(Session {
            protocol: match handshake {
                Ok(p) => p,
                Err(e) => {
                    spawned.client.close("handshake failed").await;
                    spawned.cancel.cancel();
                    let _ = spawned.shutdown_tx.send(Duration::ZERO);
                    let _ = spawned.watcher.await;
                    return Err(e.context("handshake failed"));
                }
            },
            cancel: spawned.cancel,
            shutdown_tx: StdMutex::new(Some(spawned.shutdown_tx)),
            watcher: StdMutex::new(Some(spawned.watcher)),
            pid: spawned.pid,
        });

        match session.protocol.list_tools(self.options.request_timeout).await {
            Ok(tools) => {
                tracing::debug!(server = %self.definition.id, count = tools.len(), "tools fetched");
                *self.tools.write().unwrap_or_else(PoisonError::into_inner) = Some(tools);
            }
            Err(e) => {
                tracing::warn!(server = %self.definition.id, "initial tools/list failed: {e:#}");
            }
        }

        Ok(session)
    }

    async fn teardown(&self, session: &Session, grace: Duration) {
        if let Some(watcher) = session.shutdown(grace) {
            let bound = grace + Duration::from_secs(1);
            if tokio::time::timeout(bound, watcher).await.is_err() {
                tracing::warn!(server = %self.definition.id, "process watcher did not finish in time");
            }
        }
    }

    fn decode_call_result(raw: Value) -> Result<Value> {
        let response = match serde_json::from_value::<CallToolResponse>(raw.clone()) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("tool result is not a CallToolResult ({e}); returning it raw");
                return Ok(raw);
            }
        };

        if response.is_error == Some(true) {
            let text = response.text();
            let message = if text.is_empty() {
                "tool reported an error".to_string()
            } else {
                text
            };
            return Err(GatewayError::ToolExecution(message).into());
        }

        if let Some(structured) = response.structured_content {
            return Ok(structured);
        }
        match response.first_text() {
            Some(text) => Ok(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))),
            None => Ok(raw),
        }
    }

    async fn call_inner(&self, request: &ToolCallRequest) -> Result<Value> {
        let session = self.require_session()?;
        let timeout = self.call_timeout(request);
        let outcome = session
            .protocol
            .call_tool(&request.tool_name, request.wire_arguments(), timeout)
            .await;

        match &outcome {
            Err(e) if matches!(e.downcast_ref::<GatewayError>(), Some(GatewayError::Timeout { .. })) => {
                if self.current_status() == TransportStatus::Connected {
                    self.set_status(TransportStatus::Degraded);
                }
            }
            Ok(_) if self.current_status() == TransportStatus::Degraded => {
                self.set_status(TransportStatus::Connected);
            }
            _ => {}
        }

        Self::decode_call_result(outcome?)
    }
}

#[async_trait]
impl ServerTransport for StdioTransport {
    fn server_id(&self) -> String {
        self.definition.id.clone()
    }

    fn status(&self) -> TransportStatus {
        self.current_status()
    }

    async fn connect(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.active_session().is_some() && self.current_status().is_usable() {
            return Ok(());
        }
        // A session whose process died is still parked here
        if let Some(stale) = self.take_session() {
            self.teardown(&stale, Duration::ZERO).await;
        }

        self.set_status(TransportStatus::Connecting);
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.options.connect_timeout, self.establish()).await;

        let session = match outcome {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.set_status(TransportStatus::Error);
                let message = format!("{e:#}");
                self.events.emit(GatewayEvent::ServerError {
                    server_id: self.definition.id.clone(),
                    message: message.clone(),
                });
                return Err(GatewayError::Connection(format!(
                    "failed to connect to `{}`: {message}",
                    self.definition.id
                ))
                .into());
            }
            Err(_) => {
                self.set_status(TransportStatus::Error);
                let message = format!(
                    "connect timed out after {}ms",
                    self.options.connect_timeout.as_millis()
                );
                self.events.emit(GatewayEvent::ServerError {
                    server_id: self.definition.id.clone(),
                    message: message.clone(),
                });
                return Err(GatewayError::Connection(format!(
                    "failed to connect to `{}`: {message}",
                    self.definition.id
                ))
                .into());
            }
        };

        // The process may have died between the handshake and here.
        if session.client().is_closed().await {
            self.teardown(&session, Duration::ZERO).await;
            self.set_status(TransportStatus::Error);
            return Err(GatewayError::Connection(format!(
                "server `{}` exited right after the handshake",
                self.definition.id
            ))
            .into());
        }

        tracing::info!(
            server = %self.definition.id,
            version = %session.protocol.protocol_version(),
            peer = %session.protocol.server_info().name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "connected"
        );
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
        self.set_status(TransportStatus::Connected);
        self.events.emit(GatewayEvent::ServerConnected {
            server_id: self.definition.id.clone(),
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let Some(session) = self.take_session() else {
            self.set_status(TransportStatus::Disconnected);
            return Ok(());
        };

        let rejected = session.client().close(DISCONNECT_REASON).await;
        for id in &rejected {
            let _ = session.protocol.cancel(*id, DISCONNECT_REASON);
        }
        self.teardown(&session, self.options.shutdown_grace).await;

        *self.tools.write().unwrap_or_else(PoisonError::into_inner) = None;
        let was_live = self.current_status().is_usable();
        self.set_status(TransportStatus::Disconnected);
        tracing::info!(
            server = %self.definition.id,
            rejected = rejected.len(),
            "disconnected"
        );
        if was_live {
            self.events.emit(GatewayEvent::ServerDisconnected {
                server_id: self.definition.id.clone(),
                reason: DISCONNECT_REASON.to_string(),
            });
        }
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        let session = self.require_session()?;
        let tools = session.protocol.list_tools(self.options.request_timeout).await?;
        *self.tools.write().unwrap_or_else(PoisonError::into_inner) = Some(tools.clone());
        Ok(tools)
    }

    async fn call_tool(&self, request: ToolCallRequest) -> ToolCallResponse {
        let started = Instant::now();
        let response = match self.call_inner(&request).await {
            Ok(data) => ToolCallResponse::success(data, started.elapsed()),
            Err(e) => {
                tracing::debug!(
                    server = %self.definition.id,
                    tool = %request.tool_name,
                    "tool call failed: {e:#}"
                );
                ToolCallResponse::failure(ToolCallError::from_anyhow(&e), started.elapsed())
            }
        };
        response
            .with_correlation_id(request.correlation_id)
            .with_server(self.definition.id.clone())
    }

    async fn ping(&self) -> Result<Duration> {
        let session = self.require_session()?;
        let timeout = self.options.request_timeout;
        let not_responding = |e: anyhow::Error| -> anyhow::Error {
            GatewayError::Connection(format!("server not responding: {e:#}")).into()
        };

        match session.protocol.ping(timeout).await {
            Ok(rtt) => Ok(rtt),
            Err(e)
                if matches!(
                    e.downcast_ref::<GatewayError>(),
                    Some(GatewayError::Protocol { code, .. }) if *code == METHOD_NOT_FOUND
                ) =>
            {
                tracing::debug!(server = %self.definition.id, "ping unsupported; probing with tools/list");
                let started = Instant::now();
                session
                    .protocol
                    .list_tools(timeout)
                    .await
                    .map(|_| started.elapsed())
                    .map_err(not_responding)
            }
            Err(e) => Err(not_responding(e)),
        }
    }

    async fn pending_requests(&self) -> usize {
        match self.active_session() {
            Some(s) => s.client().pending_count().await,
            None => 0,
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(session) = self.take_session() {
            tracing::debug!(server = %self.definition.id, pid = ?session.pid, "transport dropped; stopping server");
            let _ = session.shutdown(self.options.shutdown_grace);
        }
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

fn set_status(status: &RwLock<TransportStatus>, value: TransportStatus) {
    *status.write().unwrap_or_else(PoisonError::into_inner) = value;
}

fn spawn_writer(
    server_id: String,
    stdin: ChildStdin,
    framing: Framing,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut sink = FramedWrite::new(stdin, FrameCodec::new(framing));
        loop {
            tokio::select! {
                biased;

                msg = out_rx.recv() => {
                    let Some(msg) = msg else { break };
                    if let Err(e) = sink.send(msg).await {
                        tracing::debug!(server = %server_id, "stdin write failed: {e}");
                        return;
                    }
                }
                _ = cancel.cancelled() => {
                    // Flush what was queued before the cancel (e.g. cancellation notices)
                    while let Ok(msg) = out_rx.try_recv() {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });
}

fn spawn_reader(
    server_id: String,
    stdout: ChildStdout,
    framing: Framing,
    in_tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut frames = FramedRead::new(stdout, FrameCodec::new(framing));
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = frames.next() => next,
            };
            match next {
                Some(Ok(frame)) => {
                    if in_tx.send(frame).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(server = %server_id, "stdout read failed: {e}");
                    break;
                }
                None => {
                    tracing::debug!(server = %server_id, "stdout closed");
                    break;
                }
            }
        }
    });
}

fn spawn_stderr_logger(server_id: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %server_id, "stderr: {line}");
        }
    });
}

struct ProcessWatch {
    server_id: String,
    child: Child,
    client: Arc<JsonRpcClient>,
    cancel: CancellationToken,
    status: Arc<RwLock<TransportStatus>>,
    events: EventBus,
    shutdown_rx: oneshot::Receiver<Duration>,
}

fn spawn_watcher(watch: ProcessWatch) -> JoinHandle<()> {
    let ProcessWatch {
        server_id,
        mut child,
        client,
        cancel,
        status,
        events,
        shutdown_rx,
    } = watch;

    tokio::spawn(async move {
        tokio::select! {
            exit = child.wait() => {
                let reason = match exit {
                    Ok(s) => format!("server process exited ({s})"),
                    Err(e) => format!("failed to wait on server process: {e}"),
                };
                client.close(&reason).await;
                cancel.cancel();

                let was_live = {
                    let mut guard = status.write().unwrap_or_else(PoisonError::into_inner);
                    let live = guard.is_usable();
                    if live {
                        *guard = TransportStatus::Disconnected;
                    }
                    live
                };
                if was_live {
                    tracing::warn!(server = %server_id, "{reason}");
                    events.emit(GatewayEvent::ServerDisconnected { server_id, reason });
                } else {
                    tracing::debug!(server = %server_id, "{reason}");
                }
            }
            grace = shutdown_rx => {
                let grace = grace.unwrap_or(Duration::ZERO);
                terminate(&server_id, &mut child, grace).await;
            }
        }
    })
}

/// SIGTERM, wait up to `grace`, then kill.
async fn terminate(server_id: &str, child: &mut Child, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    #[cfg(unix)]
    if !grace.is_zero() {
        if let Some(pid) = child.id() {
            // SAFETY: pid belongs to a child we spawned and have not yet reaped.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    if !grace.is_zero() {
        if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
            tracing::debug!(server = %server_id, "server exited after SIGTERM ({status})");
            return;
        }
        tracing::warn!(
            server = %server_id,
            grace_ms = grace.as_millis() as u64,
            "server ignored SIGTERM; killing"
        );
    }
    if let Err(e) = child.kill().await {
        tracing::debug!(server = %server_id, "kill failed: {e}");
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap_or_else(|_| unreachable!())
    })
}

/// Fill `${VAR}` placeholders from the process environment.
///
/// Unset variables become empty strings.
pub fn resolve_placeholders(value: &str) -> String {
    placeholder_regex()
        .replace_all(value, |caps: &regex::Captures<'_>| match std::env::var(&caps[1]) {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(var = &caps[1], "environment placeholder is not set");
                String::new()
            }
        })
        .into_owned()
}

/// Resolve every value of a definition's environment map.
pub fn resolve_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| (k.clone(), resolve_placeholders(v)))
        .collect()
}

/// Whether `command` can be found on `PATH` (or exists, if it is a path).
pub fn command_available(command: &str) -> bool {
    let path = Path::new(command);
    if path.components().count() > 1 {
        return path.exists();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(command).is_file()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_resolve_placeholders_from_environment() {
        std::env::set_var("TOOLGATE_TEST_TOKEN", "s3cret");
        std::env::remove_var("TOOLGATE_TEST_MISSING");
        assert_eq!(
            resolve_placeholders("Bearer ${TOOLGATE_TEST_TOKEN}"),
            "Bearer s3cret"
        );
        assert_eq!(resolve_placeholders("x${TOOLGATE_TEST_MISSING}y"), "xy");
        assert_eq!(resolve_placeholders("$HOME stays"), "$HOME stays");
        std::env::remove_var("TOOLGATE_TEST_TOKEN");
    }

    #[test]
    #[serial]
    fn test_resolve_env_map() {
        std::env::set_var("TOOLGATE_TEST_REGION", "westeurope");
        let mut env = HashMap::new();
        env.insert("REGION".to_string(), "${TOOLGATE_TEST_REGION}".to_string());
        env.insert("PLAIN".to_string(), "value".to_string());
        let resolved = resolve_env(&env);
        assert_eq!(resolved["REGION"], "westeurope");
        assert_eq!(resolved["PLAIN"], "value");
        std::env::remove_var("TOOLGATE_TEST_REGION");
    }

    #[test]
    fn test_decode_structured_content_wins() {
        let raw = json!({
            "content": [{"type": "text", "text": "ignored"}],
            "structuredContent": {"price": 1.5}
        });
        assert_eq!(
            StdioTransport::decode_call_result(raw).unwrap(),
            json!({"price": 1.5})
        );
    }

    #[test]
    fn test_decode_json_text() {
        let raw = json!({"content": [{"type": "text", "text": "{\"sum\": 3}"}]});
        assert_eq!(StdioTransport::decode_call_result(raw).unwrap(), json!({"sum": 3}));
    }

    #[test]
    fn test_decode_plain_text_falls_back_to_string() {
        let raw = json!({"content": [{"type": "text", "text": "hello"}]});
        assert_eq!(StdioTransport::decode_call_result(raw).unwrap(), json!("hello"));
    }

    #[test]
    fn test_decode_non_conforming_result_is_returned_raw() {
        let raw = json!({"status": "ok", "content": "not a list"});
        assert_eq!(StdioTransport::decode_call_result(raw.clone()).unwrap(), raw);
    }

    #[test]
    fn test_decode_is_error_maps_to_tool_execution() {
        let raw = json!({"content": [{"type": "text", "text": "quota exceeded"}], "isError": true});
        let err = StdioTransport::decode_call_result(raw).unwrap_err();
        match err.downcast_ref::<GatewayError>() {
            Some(GatewayError::ToolExecution(msg)) => assert_eq!(msg, "quota exceeded"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_new_requires_command() {
        let def = ServerDefinition::stdio("nocmd", "");
        assert!(StdioTransport::new(def, StdioOptions::default(), EventBus::default()).is_err());
    }

    #[test]
    fn test_call_timeout_precedence() {
        let def = ServerDefinition::stdio("t", "cat")
            .with_request_timeout_ms(2_000)
            .with_tool(ToolDefinition::new("slow", "").with_timeout_ms(9_000));
        let transport = StdioTransport::new(def, StdioOptions::default(), EventBus::default()).unwrap();

        let req = ToolCallRequest::new("slow", json!({}));
        assert_eq!(transport.call_timeout(&req), Duration::from_millis(9_000));
        let req = ToolCallRequest::new("fast", json!({}));
        assert_eq!(transport.call_timeout(&req), Duration::from_millis(2_000));
        let req = ToolCallRequest::new("slow", json!({})).with_timeout_ms(5);
        assert_eq!(transport.call_timeout(&req), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_call_without_connection_is_connection_error() {
        let def = ServerDefinition::stdio("idle", "cat");
        let transport = StdioTransport::new(def, StdioOptions::default(), EventBus::default()).unwrap();
        let resp = transport
            .call_tool(ToolCallRequest::new("echo", json!({})).with_correlation_id("c-1"))
            .await;
        assert!(!resp.success);
        assert_eq!(resp.error_code(), Some("CONNECTION_ERROR"));
        assert_eq!(resp.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(resp.server_id.as_deref(), Some("idle"));
    }

    #[tokio::test]
    async fn test_connect_missing_binary_sets_error_state() {
        let def = ServerDefinition::stdio("ghost", "/nonexistent/toolgate/server");
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let transport = StdioTransport::new(def, StdioOptions::default(), events).unwrap();

        let err = transport.connect().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GatewayError>(),
            Some(GatewayError::Connection(_))
        ));
        assert_eq!(transport.status(), TransportStatus::Error);
        assert!(matches!(rx.try_recv(), Ok(GatewayEvent::ServerError { .. })));
    }

    #[test]
    fn test_command_available() {
        assert!(!command_available("/nonexistent/toolgate/server"));
        assert!(!command_available("definitely-not-a-real-binary-toolgate"));
    }
}
