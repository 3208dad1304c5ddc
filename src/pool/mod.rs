//! A fixed-size pool of long-lived broker connections, the channel cache
//! declared on top of them, and the background monitor that keeps the pool
//! healthy.
//!
//! The pool is safe for concurrent producers: connection selection is a
//! single atomic round-robin step, and channel acquisition serialises through
//! the channel lock while the publish itself happens outside it.

mod balance;
mod channels;

pub use balance::BalanceStrategy;
pub(crate) use channels::CachedChannel;

use crate::amqp::configuration::{AmqpConfig, PoolRole};
use crate::amqp::factory::{Connection, ConnectionFactory, HealthStatus};
use crate::amqp::topology::{channel_key, Topology};
use crate::consumers::Subscription;
use crate::errors::{ErrorCode, RabbitMqError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

/// Default number of broker connections kept per pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 15;
/// Default number of worker channels spawned per subscription.
pub const DEFAULT_MAX_CONSUME_CHANNELS: u32 = 25;
/// Default number of publish attempts before a payload is spooled.
pub const DEFAULT_PUSH_MAX_RETRIES: u32 = 5;
/// Default number of rebuild probes before the supervisor escalates logging.
pub const DEFAULT_CONSUME_MAX_RETRIES: u32 = 5;
/// Default number of redial attempts while repairing a producer connection.
pub const DEFAULT_PRODUCT_MAX_RETRIES: u32 = 5;
/// Default lower bound of the randomised retry TTL, in milliseconds.
pub const DEFAULT_RETRY_EXPIRATION_MIN_MS: u64 = 5000;
/// Default upper bound of the randomised retry TTL, in milliseconds.
pub const DEFAULT_RETRY_EXPIRATION_MAX_MS: u64 = 15_000;

const MONITOR_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
pub(crate) const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// One slot of the connection pool.
///
/// The slot outlives the connections that pass through it: reconnection
/// replaces the inner handle while the `index` stays stable, so channel-cache
/// keys derived from it survive a reconnect.
pub(crate) struct ConnectionSlot {
    pub(crate) index: u32,
    pub(crate) conn: RwLock<Option<Connection>>,
}

struct Endpoint {
    factory: ConnectionFactory,
    host: String,
    port: u16,
}

/// A process-wide pool of RabbitMq connections for one [`PoolRole`].
///
/// Build one with [`init_pool`], or with [`RabbitPool::producer`] /
/// [`RabbitPool::consumer`] followed by [`RabbitPool::connect`] when the
/// tunables need adjusting first.
pub struct RabbitPool {
    role: PoolRole,
    balance: StdMutex<BalanceStrategy>,

    max_connections: AtomicU32,
    max_consume_channels: AtomicU32,
    push_max_retries: AtomicU32,
    consume_max_retries: AtomicU32,
    product_max_retries: AtomicU32,
    retry_expiration_min: AtomicU64,
    retry_expiration_max: AtomicU64,

    rr_index: AtomicU32,
    pub(crate) product_current_retry: AtomicU32,
    pub(crate) consume_current_retry: AtomicU32,
    pub(crate) push_current_retry: AtomicU32,

    endpoint: StdRwLock<Option<Endpoint>>,
    /// Connection slots per role, guarded by the connection lock.
    connections: RwLock<HashMap<PoolRole, Vec<Arc<ConnectionSlot>>>>,
    /// Channel cache keyed by topology hash, guarded by the channel lock.
    pub(crate) channels: RwLock<HashMap<u64, CachedChannel>>,

    subscriptions: StdMutex<Vec<Arc<Subscription>>>,

    error_tx: mpsc::Sender<RabbitMqError>,
    error_rx: StdMutex<Option<mpsc::Receiver<RabbitMqError>>>,
    /// True while a pool rebuild is in flight; further error signals are
    /// dropped until the rebuild completes.
    rebuilding: StdMutex<bool>,
}

impl RabbitPool {
    /// A pool for publishing.
    pub fn producer() -> Self {
        Self::new(PoolRole::Producer)
    }

    /// A pool for the consumer runtime.
    pub fn consumer() -> Self {
        Self::new(PoolRole::Consumer)
    }

    fn new(role: PoolRole) -> Self {
        let (error_tx, error_rx) = mpsc::channel(1);
        Self {
            role,
            balance: StdMutex::new(BalanceStrategy::RoundRobin),
            max_connections: AtomicU32::new(DEFAULT_MAX_CONNECTIONS),
            max_consume_channels: AtomicU32::new(DEFAULT_MAX_CONSUME_CHANNELS),
            push_max_retries: AtomicU32::new(DEFAULT_PUSH_MAX_RETRIES),
            consume_max_retries: AtomicU32::new(DEFAULT_CONSUME_MAX_RETRIES),
            product_max_retries: AtomicU32::new(DEFAULT_PRODUCT_MAX_RETRIES),
            retry_expiration_min: AtomicU64::new(DEFAULT_RETRY_EXPIRATION_MIN_MS),
            retry_expiration_max: AtomicU64::new(DEFAULT_RETRY_EXPIRATION_MAX_MS),
            rr_index: AtomicU32::new(0),
            product_current_retry: AtomicU32::new(0),
            consume_current_retry: AtomicU32::new(0),
            push_current_retry: AtomicU32::new(0),
            endpoint: StdRwLock::new(None),
            connections: RwLock::new(HashMap::with_capacity(2)),
            channels: RwLock::new(HashMap::new()),
            subscriptions: StdMutex::new(Vec::new()),
            error_tx,
            error_rx: StdMutex::new(Some(error_rx)),
            rebuilding: StdMutex::new(false),
        }
    }

    pub fn role(&self) -> PoolRole {
        self.role
    }

    /// The broker host captured at [`connect`](Self::connect) time.
    pub fn host(&self) -> Option<String> {
        self.endpoint
            .read()
            .unwrap()
            .as_ref()
            .map(|e| e.host.clone())
    }

    /// The broker port captured at [`connect`](Self::connect) time.
    pub fn port(&self) -> Option<u16> {
        self.endpoint.read().unwrap().as_ref().map(|e| e.port)
    }

    /// Cap the number of broker connections. Takes effect on the next
    /// (re-)connect.
    pub fn set_max_connections(&self, max: u32) {
        self.max_connections.store(max, Ordering::Relaxed);
    }

    /// Cap the number of worker channels per subscription.
    pub fn set_max_consume_channels(&self, max: u32) {
        self.max_consume_channels.store(max, Ordering::Relaxed);
    }

    /// Bound the randomised per-message TTL used by the retry pipeline, in
    /// milliseconds. Spreading the TTL disperses retry storms after an
    /// outage.
    pub fn set_random_retry_time(&self, min_ms: u64, max_ms: u64) {
        self.retry_expiration_min.store(min_ms, Ordering::Relaxed);
        self.retry_expiration_max.store(max_ms, Ordering::Relaxed);
    }

    /// Change the connection-selection strategy. Defaults to round-robin.
    pub fn set_connection_balance(&self, strategy: BalanceStrategy) {
        *self.balance.lock().unwrap() = strategy;
    }

    /// Cap the number of publish attempts before a payload is spooled.
    pub fn set_push_max_retries(&self, max: u32) {
        self.push_max_retries.store(max, Ordering::Relaxed);
    }

    pub(crate) fn max_consume_channels(&self) -> u32 {
        self.max_consume_channels.load(Ordering::Relaxed)
    }

    pub(crate) fn push_max_retries(&self) -> u32 {
        self.push_max_retries.load(Ordering::Relaxed)
    }

    pub(crate) fn product_max_retries(&self) -> u32 {
        self.product_max_retries.load(Ordering::Relaxed)
    }

    pub(crate) fn consume_max_retries(&self) -> u32 {
        self.consume_max_retries.load(Ordering::Relaxed)
    }

    /// The `[min, max]` TTL window for retry republishes, in milliseconds.
    pub(crate) fn retry_window(&self) -> (u64, u64) {
        (
            self.retry_expiration_min.load(Ordering::Relaxed),
            self.retry_expiration_max.load(Ordering::Relaxed),
        )
    }

    /// Record the endpoint and build the configured number of connections.
    ///
    /// On a dial failure the error is returned and the connections built so
    /// far are retained; the monitor loop will finish the job later.
    pub async fn connect(&self, config: &AmqpConfig) -> Result<(), RabbitMqError> {
        *self.endpoint.write().unwrap() = Some(Endpoint {
            factory: ConnectionFactory::new_from_config(config),
            host: config.host.clone(),
            port: config.port,
        });
        self.init_connections().await
    }

    pub(crate) fn factory(&self) -> Result<ConnectionFactory, RabbitMqError> {
        self.endpoint
            .read()
            .unwrap()
            .as_ref()
            .map(|e| e.factory.clone())
            .ok_or_else(|| {
                RabbitMqError::new(
                    ErrorCode::Connection,
                    "pool is not connected",
                    "call connect() before using the pool",
                )
            })
    }

    /// (Re-)dial the full set of connections for this pool's role.
    ///
    /// Surviving connections from the previous generation are closed first so
    /// that workers still attached to them drain out.
    pub(crate) async fn init_connections(&self) -> Result<(), RabbitMqError> {
        let factory = self.factory()?;
        let max = self.max_connections.load(Ordering::Relaxed);
        let mut connections = self.connections.write().await;
        let slots = connections.entry(self.role).or_default();
        for slot in slots.drain(..) {
            if let Some(old) = slot.conn.write().await.take() {
                if let Err(e) = old.close().await {
                    warn!(error = %e, "error closing stale connection");
                }
            }
        }
        for index in 0..max {
            match factory.new_connection().await {
                Ok(connection) => slots.push(Arc::new(ConnectionSlot {
                    index,
                    conn: RwLock::new(Some(connection)),
                })),
                Err(e) => {
                    return Err(RabbitMqError::new(
                        ErrorCode::Connection,
                        format!("failed to dial broker for connection {index}"),
                        e.to_string(),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Pick the next connection slot via the configured balance strategy.
    ///
    /// Returns `None` when the pool has no connections for its role or the
    /// computed index is out of range (e.g. after `set_max_connections` grew
    /// the cap past the built set).
    pub(crate) async fn get_connection(&self) -> Option<Arc<ConnectionSlot>> {
        let max = self.max_connections.load(Ordering::Relaxed);
        let connections = self.connections.read().await;
        let slots = connections.get(&self.role)?;
        if slots.is_empty() || max == 0 {
            return None;
        }
        let strategy = *self.balance.lock().unwrap();
        let current = self.rr_index.load(Ordering::Acquire) % max;
        let next = strategy.next_index(current, max);
        // Advance by the (possibly wrapping) delta so concurrent callers each
        // observe their own step.
        self.rr_index
            .fetch_add(next.wrapping_sub(current), Ordering::AcqRel);
        slots.get(next as usize).cloned()
    }

    /// True iff the next round-robin connection exists and is connected.
    pub async fn is_healthy(&self) -> bool {
        match self.get_connection().await {
            Some(slot) => slot
                .conn
                .read()
                .await
                .as_ref()
                .is_some_and(|c| c.status() == HealthStatus::Healthy),
            None => false,
        }
    }

    /// Close every connection owned by the pool. Close failures are logged,
    /// not surfaced: the pool is being torn down either way.
    pub async fn close(&self) {
        let connections = self.connections.read().await;
        for slots in connections.values() {
            for slot in slots {
                if let Some(connection) = slot.conn.write().await.take() {
                    if let Err(e) = connection.close().await {
                        warn!(error = %e, index = slot.index, "error closing connection");
                    }
                }
            }
        }
    }

    /// Register a subscription to be served by [`run_consume`](Self::run_consume).
    pub fn register_subscription(&self, subscription: Subscription) {
        self.subscriptions
            .lock()
            .unwrap()
            .push(Arc::new(subscription));
    }

    pub(crate) fn subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub(crate) fn take_error_receiver(&self) -> Option<mpsc::Receiver<RabbitMqError>> {
        self.error_rx.lock().unwrap().take()
    }

    /// Signal a transport failure to the consumer supervisor.
    ///
    /// Signals are edge-triggered: the first one per rebuild cycle is
    /// admitted, everything else is dropped until the supervisor resets the
    /// flag after a successful rebuild.
    pub(crate) fn set_connect_error(&self, error: RabbitMqError) {
        let mut rebuilding = self.rebuilding.lock().unwrap();
        if !*rebuilding {
            let _ = self.error_tx.try_send(error);
        }
        *rebuilding = true;
    }

    pub(crate) fn finish_rebuild(&self) {
        *self.rebuilding.lock().unwrap() = false;
    }

    #[cfg(test)]
    pub(crate) fn is_rebuilding(&self) -> bool {
        *self.rebuilding.lock().unwrap()
    }

    /// Evict and close the cached channel for `topology` on the given
    /// connection slot, if one exists.
    pub(crate) async fn evict_channel(
        &self,
        channels: &mut HashMap<u64, CachedChannel>,
        conn_index: u32,
        topology: &Topology,
    ) {
        let key = channel_key(self.role, conn_index, topology);
        if let Some(cached) = channels.remove(&key) {
            if let Err(e) = cached.channel.close(200, "evicted from channel cache").await {
                warn!(error = %e, key, "error closing evicted channel");
            }
        }
    }
}

/// Build a pool for the configured role, connect it, and start the health
/// monitor.
pub async fn init_pool(config: &AmqpConfig) -> Result<Arc<RabbitPool>, RabbitMqError> {
    let pool = Arc::new(match config.role {
        PoolRole::Producer => RabbitPool::producer(),
        PoolRole::Consumer => RabbitPool::consumer(),
    });
    pool.connect(config).await?;
    spawn_monitor(Arc::clone(&pool));
    Ok(pool)
}

/// Run the health monitor, respawning it if it ever panics.
fn spawn_monitor(pool: Arc<RabbitPool>) {
    tokio::spawn(async move {
        loop {
            let handle = tokio::spawn(monitor_loop(Arc::clone(&pool)));
            match handle.await {
                Ok(()) => break,
                Err(e) => warn!(error = %e, "pool monitor crashed; respawning"),
            }
        }
    });
}

async fn monitor_loop(pool: Arc<RabbitPool>) {
    loop {
        tokio::time::sleep(MONITOR_INTERVAL).await;
        if pool.is_healthy().await {
            continue;
        }
        info!("connection pool unhealthy; reconnecting");
        match pool.init_connections().await {
            Ok(()) => info!("connection pool rebuilt"),
            Err(e) => warn!(error = %e, "failed to rebuild connection pool"),
        }
    }
}
