//! Scripted in-process transport for unit tests
//!
//! [`ScriptedTransport`] answers from queues that the test fills up front,
//! falling back to a default outcome once a queue is empty. Counters record
//! how often each operation ran so tests can assert that, for example, an
//! open circuit never reached the transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{GatewayError, Result};
use crate::mcp::transport::{ServerTransport, TransportFactory, TransportStatus};
use crate::mcp::types::ToolDefinition;
use crate::registry::ServerDefinition;
use crate::tool_call::{ToolCallError, ToolCallRequest, ToolCallResponse};

/// What a scripted `call_tool` does
#[derive(Debug, Clone)]
pub enum CallScript {
    /// Succeed with the value
    Ok(Value),
    /// Fail with the error
    Err(ToolCallError),
    /// Echo the request arguments back
    Echo,
}

impl CallScript {
    pub fn timeout() -> Self {
        CallScript::Err(ToolCallError::new("TIMEOUT", "request timed out", true))
    }

    pub fn connection_lost() -> Self {
        CallScript::Err(ToolCallError::new("CONNECTION_ERROR", "connection lost", true))
    }

    pub fn tool_failure(message: &str) -> Self {
        CallScript::Err(ToolCallError::new("TOOL_EXECUTION_ERROR", message, false))
    }
}

/// What a scripted `ping` does
#[derive(Debug, Clone)]
pub enum PingScript {
    Ok(Duration),
    Fail,
}

#[derive(Debug)]
pub struct ScriptedTransport {
    id: String,
    status: Mutex<TransportStatus>,
    tools: Mutex<Vec<ToolDefinition>>,
    calls_script: Mutex<VecDeque<CallScript>>,
    default_call: Mutex<CallScript>,
    ping_script: Mutex<VecDeque<PingScript>>,
    default_ping: Mutex<PingScript>,
    call_delay: Mutex<Duration>,
    connect_delay: Mutex<Duration>,
    fail_connect: AtomicBool,
    pub calls: AtomicUsize,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub pings: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: Mutex::new(TransportStatus::Disconnected),
            tools: Mutex::new(Vec::new()),
            calls_script: Mutex::new(VecDeque::new()),
            default_call: Mutex::new(CallScript::Echo),
            ping_script: Mutex::new(VecDeque::new()),
            default_ping: Mutex::new(PingScript::Ok(Duration::from_millis(1))),
            call_delay: Mutex::new(Duration::ZERO),
            connect_delay: Mutex::new(Duration::ZERO),
            fail_connect: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
        }
    }

    pub fn with_tools(self, names: &[&str]) -> Self {
        *self.tools.lock().unwrap() = names
            .iter()
            .map(|n| ToolDefinition::new(*n, format!("{n} tool")))
            .collect();
        self
    }

    pub fn failing_connect(self) -> Self {
        self.fail_connect.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_call_delay(self, delay: Duration) -> Self {
        *self.call_delay.lock().unwrap() = delay;
        self
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *self.connect_delay.lock().unwrap() = delay;
        self
    }

    pub fn push_call(&self, outcome: CallScript) {
        self.calls_script.lock().unwrap().push_back(outcome);
    }

    pub fn set_default_call(&self, outcome: CallScript) {
        *self.default_call.lock().unwrap() = outcome;
    }

    pub fn push_ping(&self, outcome: PingScript) {
        self.ping_script.lock().unwrap().push_back(outcome);
    }

    pub fn set_default_ping(&self, outcome: PingScript) {
        *self.default_ping.lock().unwrap() = outcome;
    }

    pub fn set_connect_fails(&self, fails: bool) {
        self.fail_connect.store(fails, Ordering::SeqCst);
    }

    /// Simulate the server process dying
    pub fn kill(&self) {
        *self.status.lock().unwrap() = TransportStatus::Disconnected;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn next_call(&self) -> CallScript {
        self.calls_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_call.lock().unwrap().clone())
    }

    fn next_ping(&self) -> PingScript {
        self.ping_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_ping.lock().unwrap().clone())
    }
}

#[async_trait]
impl ServerTransport for ScriptedTransport {
    fn server_id(&self) -> String {
        self.id.clone()
    }

    fn status(&self) -> TransportStatus {
        *self.status.lock().unwrap()
    }

    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            *self.status.lock().unwrap() = TransportStatus::Error;
            return Err(GatewayError::Connection(format!("`{}` refused to start", self.id)).into());
        }
        *self.status.lock().unwrap() = TransportStatus::Connected;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        *self.status.lock().unwrap() = TransportStatus::Disconnected;
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        if !self.status().is_usable() {
            return Err(GatewayError::Connection("not connected".into()).into());
        }
        Ok(self.tools.lock().unwrap().clone())
    }

    async fn call_tool(&self, request: ToolCallRequest) -> ToolCallResponse {
        let started = Instant::now();
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.call_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let response = if !self.status().is_usable() {
            ToolCallResponse::failure(
                ToolCallError::new("CONNECTION_ERROR", "not connected", true),
                started.elapsed(),
            )
        } else {
            match self.next_call() {
                CallScript::Ok(v) => ToolCallResponse::success(v, started.elapsed()),
                CallScript::Echo => ToolCallResponse::success(request.arguments.clone(), started.elapsed()),
                CallScript::Err(e) => ToolCallResponse::failure(e, started.elapsed()),
            }
        };
        response
            .with_correlation_id(request.correlation_id)
            .with_server(self.id.clone())
    }

    async fn ping(&self) -> Result<Duration> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if !self.status().is_usable() {
            return Err(GatewayError::Connection("server not responding: not connected".into()).into());
        }
        match self.next_ping() {
            PingScript::Ok(rtt) => Ok(rtt),
            PingScript::Fail => {
                Err(GatewayError::Connection("server not responding: scripted failure".into()).into())
            }
        }
    }

    async fn pending_requests(&self) -> usize {
        0
    }
}

/// Factory handing out pre-built scripted transports
///
/// Every `create` for a server returns the same shared transport, so tests
/// keep a handle on what the pool or gateway is talking to.
#[derive(Debug, Default)]
pub struct ScriptedFactory {
    transports: Mutex<Vec<Arc<ScriptedTransport>>>,
    pub created: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, transport: ScriptedTransport) -> Arc<ScriptedTransport> {
        let transport = Arc::new(transport);
        self.transports.lock().unwrap().push(Arc::clone(&transport));
        transport
    }

    pub fn get(&self, id: &str) -> Option<Arc<ScriptedTransport>> {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl TransportFactory for ScriptedFactory {
    fn create(&self, definition: &ServerDefinition) -> Result<Arc<dyn ServerTransport>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let transport = match self.get(&definition.id) {
            Some(t) => t,
            None => self.add(ScriptedTransport::new(definition.id.clone())),
        };
        Ok(transport)
    }
}

/// Factory creating a fresh scripted transport per call, for pool sizing tests
#[derive(Debug, Default)]
pub struct FreshFactory {
    pub created: Mutex<Vec<Arc<ScriptedTransport>>>,
    pub delay: Duration,
}

impl FreshFactory {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            delay,
        }
    }

    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

impl TransportFactory for FreshFactory {
    fn create(&self, definition: &ServerDefinition) -> Result<Arc<dyn ServerTransport>> {
        let t = Arc::new(ScriptedTransport::new(definition.id.clone()).with_call_delay(self.delay));
        self.created.lock().unwrap().push(Arc::clone(&t));
        Ok(t)
    }
}
