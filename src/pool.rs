//! Per-server connection pool
//!
//! Each server gets a bounded set of transports. [`ConnectionPool::acquire`]
//! hands out an idle live connection when there is one, opens a new one while
//! below `max_connections`, and otherwise queues the caller in FIFO order
//! until a connection is released or `acquire_timeout_ms` elapses.
//!
//! A checked-out connection is held by a [`PooledConnection`] guard and goes
//! back to the pool when the guard drops. Connections that died while checked
//! out are discarded and their slot is handed to the next waiter. A sweeper
//! task closes connections idle for longer than `idle_timeout_ms`, never
//! going below `min_connections`.
//!
//! Transports multiplex requests by correlation id, so short control traffic
//! (pings, tool listings) can ride on any live connection through
//! [`ConnectionPool::shared`] without a checkout. Cancelling an `acquire`
//! at any await point gives back the slot or connection it was holding.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, Result};
use crate::mcp::transport::{ServerTransport, TransportFactory};
use crate::registry::ServerDefinition;

/// Pool sizing and timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections kept open even when idle
    #[serde(default)]
    pub min_connections: usize,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_max_connections() -> usize {
    4
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_acquire_timeout_ms() -> u64 {
    10_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: default_max_connections(),
            idle_timeout_ms: default_idle_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(GatewayError::Config("pool.max_connections must be at least 1".into()).into());
        }
        if self.min_connections > self.max_connections {
            return Err(GatewayError::Config(format!(
                "pool.min_connections ({}) exceeds pool.max_connections ({})",
                self.min_connections, self.max_connections
            ))
            .into());
        }
        Ok(())
    }
}

/// Per-server pool counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub server_id: String,
    /// Open connections, including ones being opened
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Callers queued for a connection
    pub waiting: usize,
}

struct IdleConnection {
    id: u64,
    transport: Arc<dyn ServerTransport>,
    since: Instant,
}

/// What a released slot gives the next waiter
enum Handoff {
    /// A live connection, ready to use
    Connection(u64, Arc<dyn ServerTransport>),
    /// Permission to open a new connection (the slot is already counted)
    Slot,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleConnection>,
    /// Checked-out connections by id
    busy: HashMap<u64, Arc<dyn ServerTransport>>,
    /// Idle, checked out and being opened
    total: usize,
    waiters: VecDeque<oneshot::Sender<Handoff>>,
    closed: bool,
}

impl PoolState {
    /// Give `handoff` to the first waiter still listening. Returns it back if
    /// nobody took it.
    fn hand_to_waiter(&mut self, mut handoff: Handoff) -> Option<Handoff> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(handoff) {
                Ok(()) => return None,
                Err(returned) => handoff = returned,
            }
        }
        Some(handoff)
    }
}

struct ServerPool {
    definition: ServerDefinition,
    state: Mutex<PoolState>,
}

impl ServerPool {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand out a connection, tracking it as busy
    fn checkout(self: &Arc<Self>, id: u64, transport: Arc<dyn ServerTransport>) -> PooledConnection {
        self.lock().busy.insert(id, Arc::clone(&transport));
        PooledConnection {
            id,
            transport: Some(transport),
            pool: Arc::clone(self),
        }
    }

    /// Any live connection, idle or checked out
    fn any_live(&self) -> Option<Arc<dyn ServerTransport>> {
        let state = self.lock();
        let live = state
            .idle
            .iter()
            .map(|c| &c.transport)
            .chain(state.busy.values())
            .find(|t| t.status().is_usable())
            .cloned();
        live
    }

    /// Return a connection after use
    fn release(&self, id: u64, transport: Arc<dyn ServerTransport>) {
        let mut state = self.lock();
        state.busy.remove(&id);
        if state.closed {
            state.total = state.total.saturating_sub(1);
            drop(state);
            spawn_disconnect(transport);
            return;
        }
        if !transport.status().is_usable() {
            tracing::debug!(server = %self.definition.id, conn = id, "discarding dead connection");
            match state.hand_to_waiter(Handoff::Slot) {
                None => {}
                Some(_) => state.total = state.total.saturating_sub(1),
            }
            drop(state);
            spawn_disconnect(transport);
            return;
        }
        if let Some(Handoff::Connection(id, transport)) =
            state.hand_to_waiter(Handoff::Connection(id, transport))
        {
            state.idle.push_back(IdleConnection {
                id,
                transport,
                since: Instant::now(),
            });
        }
    }

    /// Give back a slot whose connection could not be opened
    fn release_slot(&self) {
        let mut state = self.lock();
        if state.closed || state.hand_to_waiter(Handoff::Slot).is_some() {
            state.total = state.total.saturating_sub(1);
        }
    }

    /// Take back what a cancelled waiter was handed
    fn give_back(&self, handoff: Handoff) {
        match handoff {
            Handoff::Connection(id, transport) => self.release(id, transport),
            Handoff::Slot => self.release_slot(),
        }
    }

    fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            server_id: self.definition.id.clone(),
            total: state.total,
            idle: state.idle.len(),
            in_use: state.total.saturating_sub(state.idle.len()),
            waiting: state.waiters.iter().filter(|w| !w.is_closed()).count(),
        }
    }
}

fn spawn_disconnect(transport: Arc<dyn ServerTransport>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            if let Err(e) = transport.disconnect().await {
                tracing::debug!(server = %transport.server_id(), "disconnect failed: {e:#}");
            }
        });
    }
}

/// A checked-out connection. Returned to the pool on drop.
pub struct PooledConnection {
    id: u64,
    transport: Option<Arc<dyn ServerTransport>>,
    pool: Arc<ServerPool>,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transport(&self) -> Arc<dyn ServerTransport> {
        match &self.transport {
            Some(t) => Arc::clone(t),
            None => unreachable!("transport is only taken on drop"),
        }
    }
}

impl Deref for PooledConnection {
    type Target = dyn ServerTransport;

    fn deref(&self) -> &Self::Target {
        match &self.transport {
            Some(t) => t.as_ref(),
            None => unreachable!("transport is only taken on drop"),
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("server", &self.pool.definition.id)
            .finish()
    }
}

/// A connection from [`ConnectionPool::shared`]
pub enum SharedConnection {
    /// Borrowed alongside whoever holds it
    Shared(Arc<dyn ServerTransport>),
    /// Checked out because no connection was open
    Pooled(PooledConnection),
}

impl Deref for SharedConnection {
    type Target = dyn ServerTransport;

    fn deref(&self) -> &Self::Target {
        match self {
            SharedConnection::Shared(t) => t.as_ref(),
            SharedConnection::Pooled(c) => &**c,
        }
    }
}

impl fmt::Debug for SharedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SharedConnection::Shared(t) => f.debug_tuple("Shared").field(&t.server_id()).finish(),
            SharedConnection::Pooled(c) => f.debug_tuple("Pooled").field(c).finish(),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.take() {
            self.pool.release(self.id, transport);
        }
    }
}

/// A counted slot with no connection yet. Dropped without
/// [`SlotReservation::fill`], it frees the slot.
struct SlotReservation {
    pool: Arc<ServerPool>,
    filled: bool,
}

impl SlotReservation {
    fn new(pool: &Arc<ServerPool>) -> Self {
        Self {
            pool: Arc::clone(pool),
            filled: false,
        }
    }

    fn fill(mut self, id: u64, transport: Arc<dyn ServerTransport>) -> PooledConnection {
        self.filled = true;
        self.pool.checkout(id, transport)
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if !self.filled {
            self.pool.release_slot();
        }
    }
}

/// A queued acquirer. Dropped before it took its handoff, it returns
/// whatever was already sent to it.
struct Waiting {
    rx: oneshot::Receiver<Handoff>,
    pool: Arc<ServerPool>,
    received: bool,
}

impl Drop for Waiting {
    fn drop(&mut self) {
        if self.received {
            return;
        }
        self.rx.close();
        if let Ok(handoff) = self.rx.try_recv() {
            self.pool.give_back(handoff);
        }
    }
}

enum Step {
    Ready(u64, Arc<dyn ServerTransport>),
    Open,
    Wait(oneshot::Receiver<Handoff>),
}

/// Bounded transports per server
pub struct ConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn TransportFactory>,
    servers: Mutex<HashMap<String, Arc<ServerPool>>>,
    next_id: AtomicU64,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("servers", &self.server_ids())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            config,
            factory,
            servers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn servers(&self) -> MutexGuard<'_, HashMap<String, Arc<ServerPool>>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn server(&self, server_id: &str) -> Result<Arc<ServerPool>> {
        self.servers()
            .get(server_id)
            .cloned()
            .ok_or_else(|| GatewayError::ServerNotFound(server_id.to_string()).into())
    }

    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.servers().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.servers().contains_key(server_id)
    }

    /// Make a server poolable. Replacing an existing server closes its
    /// connections first.
    pub async fn add_server(&self, definition: ServerDefinition) {
        let previous = self.servers().insert(
            definition.id.clone(),
            Arc::new(ServerPool {
                definition,
                state: Mutex::new(PoolState::default()),
            }),
        );
        if let Some(previous) = previous {
            Self::close_pool(&previous).await;
        }
    }

    /// Stop pooling a server and disconnect its connections
    pub async fn remove_server(&self, server_id: &str) -> bool {
        let removed = self.servers().remove(server_id);
        match removed {
            Some(pool) => {
                Self::close_pool(&pool).await;
                true
            }
            None => false,
        }
    }

    async fn open(&self, pool: &ServerPool) -> Result<(u64, Arc<dyn ServerTransport>)> {
        let transport = self.factory.create(&pool.definition)?;
        transport.connect().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(server = %pool.definition.id, conn = id, "opened pooled connection");
        Ok((id, transport))
    }

    /// Open a connection into an already counted slot
    async fn open_in_slot(&self, pool: &Arc<ServerPool>) -> Result<PooledConnection> {
        let reservation = SlotReservation::new(pool);
        let (id, transport) = self.open(pool).await?;
        Ok(reservation.fill(id, transport))
    }

    /// Check out a connection to `server_id`.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::ServerNotFound`] if the server was never added;
    /// - [`GatewayError::Timeout`] if no connection freed up in time;
    /// - [`GatewayError::Connection`] if the pool was closed or a new
    ///   connection could not be opened.
    pub async fn acquire(&self, server_id: &str) -> Result<PooledConnection> {
        let pool = self.server(server_id)?;
        let deadline = tokio::time::Instant::now() + self.config.acquire_timeout();

        let step = {
            let mut state = pool.lock();
            if state.closed {
                return Err(GatewayError::Connection(format!("pool for `{server_id}` is closed")).into());
            }
            let mut dead = Vec::new();
            let mut ready = None;
            while let Some(conn) = state.idle.pop_back() {
                if conn.transport.status().is_usable() {
                    ready = Some((conn.id, conn.transport));
                    break;
                }
                state.total = state.total.saturating_sub(1);
                dead.push(conn.transport);
            }
            let step = match ready {
                Some((id, transport)) => Step::Ready(id, transport),
                None if state.total < self.config.max_connections => {
                    state.total += 1;
                    Step::Open
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Step::Wait(rx)
                }
            };
            drop(state);
            for transport in dead {
                spawn_disconnect(transport);
            }
            step
        };

        match step {
            Step::Ready(id, transport) => Ok(pool.checkout(id, transport)),
            Step::Open => self.open_in_slot(&pool).await,
            Step::Wait(rx) => {
                tracing::debug!(server = %server_id, "pool exhausted; waiting");
                let mut waiting = Waiting {
                    rx,
                    pool: Arc::clone(&pool),
                    received: false,
                };
                let handoff = tokio::select! {
                    handoff = &mut waiting.rx => handoff.ok(),
                    _ = tokio::time::sleep_until(deadline) => {
                        waiting.rx.close();
                        // A release may have raced the deadline
                        match waiting.rx.try_recv() {
                            Ok(handoff) => Some(handoff),
                            Err(_) => {
                                return Err(GatewayError::Timeout {
                                    operation: format!("pool acquire {server_id}"),
                                    timeout_ms: self.config.acquire_timeout_ms,
                                }
                                .into())
                            }
                        }
                    }
                };
                waiting.received = true;
                match handoff {
                    Some(Handoff::Connection(id, transport)) => Ok(pool.checkout(id, transport)),
                    Some(Handoff::Slot) => self.open_in_slot(&pool).await,
                    None => Err(GatewayError::Connection(format!("pool for `{server_id}` is closed")).into()),
                }
            }
        }
    }

    /// A live connection to `server_id` for traffic that does not need one to
    /// itself. Reuses an idle or checked-out connection when one exists and
    /// only checks one out (waiting like [`ConnectionPool::acquire`]) when
    /// none is open.
    ///
    /// # Errors
    ///
    /// Same as [`ConnectionPool::acquire`].
    pub async fn shared(&self, server_id: &str) -> Result<SharedConnection> {
        let pool = self.server(server_id)?;
        match pool.any_live() {
            Some(transport) => Ok(SharedConnection::Shared(transport)),
            None => Ok(SharedConnection::Pooled(self.acquire(server_id).await?)),
        }
    }

    /// Open connections until `min_connections` (at least one) are available.
    /// Returns the number opened.
    pub async fn warm_up(&self, server_id: &str) -> Result<usize> {
        let pool = self.server(server_id)?;
        let target = self.config.min_connections.max(1);
        let mut opened = 0;
        loop {
            {
                let mut state = pool.lock();
                if state.closed || state.total >= target {
                    break;
                }
                state.total += 1;
            }
            let conn = self.open_in_slot(&pool).await?;
            drop(conn);
            opened += 1;
        }
        Ok(opened)
    }

    async fn close_pool(pool: &ServerPool) {
        let idle: Vec<_> = {
            let mut state = pool.lock();
            state.closed = true;
            // Dropping the senders fails every waiter
            state.waiters.clear();
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(idle.len());
            idle
        };
        let count = idle.len();
        futures::future::join_all(idle.into_iter().map(|c| async move {
            if let Err(e) = c.transport.disconnect().await {
                tracing::debug!(conn = c.id, "disconnect failed: {e:#}");
            }
        }))
        .await;
        tracing::debug!(server = %pool.definition.id, closed = count, "pool closed");
    }

    /// Disconnect every connection of a server and fail its waiters. The
    /// server stays registered; the next acquire opens fresh connections.
    pub async fn close_server(&self, server_id: &str) -> Result<()> {
        let pool = self.server(server_id)?;
        let fresh = Arc::new(ServerPool {
            definition: pool.definition.clone(),
            state: Mutex::new(PoolState::default()),
        });
        self.servers().insert(server_id.to_string(), fresh);
        Self::close_pool(&pool).await;
        Ok(())
    }

    /// Disconnect every server's connections, fail their waiters and stop
    /// the sweeper. Servers stay registered and reopen on the next acquire.
    pub async fn close_all(&self) {
        self.stop_sweeper().await;
        let closed: Vec<_> = {
            let mut servers = self.servers();
            servers
                .values_mut()
                .map(|pool| {
                    let fresh = Arc::new(ServerPool {
                        definition: pool.definition.clone(),
                        state: Mutex::new(PoolState::default()),
                    });
                    std::mem::replace(pool, fresh)
                })
                .collect()
        };
        futures::future::join_all(closed.iter().map(|p| Self::close_pool(p))).await;
    }

    /// Close idle connections past the idle timeout, keeping `min_connections`.
    /// Returns the number closed.
    pub async fn evict_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let min = self.config.min_connections;
        let pools: Vec<_> = self.servers().values().cloned().collect();
        let mut evicted = Vec::new();
        for pool in pools {
            let mut state = pool.lock();
            let mut keep = VecDeque::with_capacity(state.idle.len());
            while let Some(conn) = state.idle.pop_front() {
                let dead = !conn.transport.status().is_usable();
                let expired = conn.since.elapsed() >= idle_timeout && state.total > min;
                if dead || expired {
                    state.total = state.total.saturating_sub(1);
                    evicted.push((pool.definition.id.clone(), conn));
                } else {
                    keep.push_back(conn);
                }
            }
            state.idle = keep;
        }
        let count = evicted.len();
        for (server_id, conn) in evicted {
            tracing::debug!(server = %server_id, conn = conn.id, "closing idle connection");
            if let Err(e) = conn.transport.disconnect().await {
                tracing::debug!(server = %server_id, "disconnect failed: {e:#}");
            }
        }
        count
    }

    /// Run [`ConnectionPool::evict_idle`] periodically
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            return;
        }
        let period = (self.config.idle_timeout() / 4).clamp(Duration::from_millis(10), Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let pool = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        let n = pool.evict_idle().await;
                        if n > 0 {
                            tracing::debug!(evicted = n, "idle sweep");
                        }
                    }
                }
            }
        });
        *sweeper = Some((cancel, handle));
    }

    pub async fn stop_sweeper(&self) {
        let sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some((cancel, handle)) = sweeper {
            cancel.cancel();
            let _ = handle.await;
        }
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<_> = self.servers().values().map(|p| p.stats()).collect();
        stats.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        stats
    }

    pub fn server_stats(&self, server_id: &str) -> Option<PoolStats> {
        self.servers().get(server_id).map(|p| p.stats())
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            cancel.cancel();
        }
    }
}
